//! SPI NOR flash driver for W25Q128-class parts.
//!
//! Speaks the standard command set (page program, sector erase, write
//! enable, status poll, read, JEDEC ID) over an embedded-hal SpiDevice, and
//! exposes the chip through the embedded-storage NorFlash traits so the
//! filesystem above it can be tested against a RAM device.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::{Duration, Instant};
use embedded_hal::spi::{Operation, SpiDevice};
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

use crate::constants::{
    FLASH_ERASE_TIMEOUT, FLASH_PAGE_SIZE, FLASH_PROGRAM_TIMEOUT, FLASH_SECTOR_SIZE,
};
use crate::util::time::block_us;

// Command opcodes, per the Winbond datasheet (and everyone else's - this set
// is the de facto standard).
const CMD_PAGE_PROGRAM: u8 = 0x02;
const CMD_READ_DATA: u8 = 0x03;
const CMD_READ_STATUS1: u8 = 0x05;
const CMD_WRITE_ENABLE: u8 = 0x06;
const CMD_SECTOR_ERASE: u8 = 0x20;
const CMD_JEDEC_ID: u8 = 0x9F;

/// Status register 1, write-in-progress bit.
const STATUS_WIP: u8 = 0x01;

/// W25Q128 capacity: 16 MiB.
const W25Q128_CAPACITY: usize = 16 * 1024 * 1024;

/// Errors from the NOR flash driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NorError {
    /// SPI bus transaction failed.
    Spi,

    /// The chip did not clear write-in-progress within the timeout.
    Timeout,

    /// Address range outside the device.
    OutOfBounds,

    /// Erase range not sector aligned.
    NotAligned,
}

impl NorFlashError for NorError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            NorError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            NorError::NotAligned => NorFlashErrorKind::NotAligned,
            NorError::Spi | NorError::Timeout => NorFlashErrorKind::Other,
        }
    }
}

/// Device identification, on top of the embedded-storage traits.  The
/// filesystem probes this before trusting a chip.
pub trait JedecId: ErrorType {
    /// Read the 3-byte JEDEC ID (manufacturer, type, capacity) as a u24 in
    /// the low bits.  An absent or dead chip reads as 0x000000 or 0xFFFFFF.
    fn jedec_id(&mut self) -> Result<u32, Self::Error>;
}

/// Blocking SPI NOR driver.  All operations run from the main loop context;
/// nothing here is called from the capture path.
pub struct SpiNorFlash<SPI> {
    spi: SPI,
    capacity: usize,
}

impl<SPI: SpiDevice> SpiNorFlash<SPI> {
    /// Create a driver for a 16 MiB (W25Q128-class) part.
    pub fn new(spi: SPI) -> Self {
        Self {
            spi,
            capacity: W25Q128_CAPACITY,
        }
    }

    fn addr_bytes(address: u32) -> [u8; 3] {
        [
            ((address >> 16) & 0xFF) as u8,
            ((address >> 8) & 0xFF) as u8,
            (address & 0xFF) as u8,
        ]
    }

    fn write_enable(&mut self) -> Result<(), NorError> {
        self.spi
            .transaction(&mut [Operation::Write(&[CMD_WRITE_ENABLE])])
            .map_err(|_| NorError::Spi)
    }

    fn read_status(&mut self) -> Result<u8, NorError> {
        let mut status = [0u8; 1];
        self.spi
            .transaction(&mut [
                Operation::Write(&[CMD_READ_STATUS1]),
                Operation::Read(&mut status),
            ])
            .map_err(|_| NorError::Spi)?;
        Ok(status[0])
    }

    /// Poll write-in-progress until clear.  Sector erases on these parts
    /// can take seconds, page programs a few ms.
    fn wait_for_write_complete(&mut self, timeout: Duration) -> Result<(), NorError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.read_status()? & STATUS_WIP == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(NorError::Timeout);
            }
            block_us!(100);
        }
    }

    /// Program up to one page.  Callers must not cross a page boundary.
    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), NorError> {
        self.write_enable()?;
        let addr = Self::addr_bytes(address);
        self.spi
            .transaction(&mut [
                Operation::Write(&[CMD_PAGE_PROGRAM]),
                Operation::Write(&addr),
                Operation::Write(data),
            ])
            .map_err(|_| NorError::Spi)?;
        self.wait_for_write_complete(FLASH_PROGRAM_TIMEOUT)
    }

    fn erase_sector(&mut self, address: u32) -> Result<(), NorError> {
        self.write_enable()?;
        let addr = Self::addr_bytes(address);
        self.spi
            .transaction(&mut [
                Operation::Write(&[CMD_SECTOR_ERASE]),
                Operation::Write(&addr),
            ])
            .map_err(|_| NorError::Spi)?;
        self.wait_for_write_complete(FLASH_ERASE_TIMEOUT)
    }
}

impl<SPI: SpiDevice> ErrorType for SpiNorFlash<SPI> {
    type Error = NorError;
}

impl<SPI: SpiDevice> JedecId for SpiNorFlash<SPI> {
    fn jedec_id(&mut self) -> Result<u32, NorError> {
        let mut id = [0u8; 3];
        self.spi
            .transaction(&mut [Operation::Write(&[CMD_JEDEC_ID]), Operation::Read(&mut id)])
            .map_err(|_| NorError::Spi)?;
        Ok(((id[0] as u32) << 16) | ((id[1] as u32) << 8) | (id[2] as u32))
    }
}

impl<SPI: SpiDevice> ReadNorFlash for SpiNorFlash<SPI> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), NorError> {
        if offset as usize + bytes.len() > self.capacity {
            return Err(NorError::OutOfBounds);
        }
        let addr = Self::addr_bytes(offset);
        self.spi
            .transaction(&mut [
                Operation::Write(&[CMD_READ_DATA]),
                Operation::Write(&addr),
                Operation::Read(bytes),
            ])
            .map_err(|_| NorError::Spi)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<SPI: SpiDevice> NorFlash for SpiNorFlash<SPI> {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), NorError> {
        if to as usize > self.capacity || from > to {
            return Err(NorError::OutOfBounds);
        }
        if from as usize % FLASH_SECTOR_SIZE != 0 || to as usize % FLASH_SECTOR_SIZE != 0 {
            return Err(NorError::NotAligned);
        }
        let mut address = from;
        while address < to {
            self.erase_sector(address)?;
            address += FLASH_SECTOR_SIZE as u32;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), NorError> {
        if offset as usize + bytes.len() > self.capacity {
            return Err(NorError::OutOfBounds);
        }

        // Split at page boundaries - the chip wraps within a page if a
        // program crosses one.
        let mut address = offset as usize;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let page_space = FLASH_PAGE_SIZE - (address % FLASH_PAGE_SIZE);
            let chunk = page_space.min(remaining.len());
            self.program_page(address as u32, &remaining[..chunk])?;
            address += chunk;
            remaining = &remaining[chunk..];
        }
        Ok(())
    }
}
