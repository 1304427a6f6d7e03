//! Flat filesystem over a sector-erase NOR flash device.
//!
//! Layout: sector 0 holds the entire directory (a fixed array of
//! [`FileEntry`] records); data sectors start at sector 1.  A watermark
//! allocator hands out sequential sector runs.  Deleting a file only flips
//! its directory status - the sectors stay dead until a compaction pass
//! reclaims them, which the allocator runs automatically when the watermark
//! hits the end of the device.
//!
//! Crash safety comes from two rules: the directory is always rewritten as
//! a whole (so a torn write is confined to one sector), and every entry
//! carries the bit-complement of its size - an entry whose complement does
//! not match, or whose sector run falls outside the device, is discarded at
//! load time rather than trusted.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use core::fmt::Write as _;
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
use static_assertions::const_assert;

use super::nor::JedecId;
use super::{StoragePlugin, names_equal};
use crate::constants::{FLASH_JEDEC_W25Q128, FLASH_SECTOR_SIZE, MAX_FILENAME_LEN, MAX_FILES};
use crate::types::{FileName, StatusCode, StatusLine, StorageKind};

/// First sector of file data; sector 0 is the directory.
pub const DATA_START_SECTOR: u32 = 1;

/// On-flash size of one directory entry.
pub const ENTRY_SIZE: usize = 28;

const DIRECTORY_BYTES: usize = ENTRY_SIZE * MAX_FILES;

// The whole directory must fit in the directory sector, or a rewrite would
// spill into file data.
const_assert!(DIRECTORY_BYTES <= FLASH_SECTOR_SIZE);

/// Directory entry status tags.  The values are chosen so fully-erased
/// flash (0xFF everywhere) reads as an empty directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EntryStatus {
    Empty,
    Active,
    Deleted,
}

impl EntryStatus {
    const RAW_EMPTY: u8 = 0xFF;
    const RAW_ACTIVE: u8 = 0xAA;
    const RAW_DELETED: u8 = 0x55;

    fn from_raw(raw: u8) -> Self {
        match raw {
            Self::RAW_EMPTY => EntryStatus::Empty,
            Self::RAW_ACTIVE => EntryStatus::Active,
            // Anything unrecognized is treated as deleted: the slot is
            // reusable but nothing in it is trusted.
            _ => EntryStatus::Deleted,
        }
    }

    fn to_raw(self) -> u8 {
        match self {
            EntryStatus::Empty => Self::RAW_EMPTY,
            EntryStatus::Active => Self::RAW_ACTIVE,
            EntryStatus::Deleted => Self::RAW_DELETED,
        }
    }
}

/// One directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileEntry {
    name: [u8; MAX_FILENAME_LEN],
    start_sector: u32,
    size: u32,
    size_complement: u32,
    status: EntryStatus,
}

impl FileEntry {
    pub const fn empty() -> Self {
        Self {
            name: [0xFF; MAX_FILENAME_LEN],
            start_sector: 0,
            size: 0,
            size_complement: 0,
            status: EntryStatus::Empty,
        }
    }

    fn active(name: &str, start_sector: u32, size: u32) -> Self {
        let mut bytes = [0u8; MAX_FILENAME_LEN];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            name: bytes,
            start_sector,
            size,
            size_complement: !size,
            status: EntryStatus::Active,
        }
    }

    /// The stored name, up to the first NUL.  Corrupt (non-UTF8) names read
    /// as empty, which fails validation.
    pub fn name_str(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0 || b == 0xFF)
            .unwrap_or(MAX_FILENAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn status(&self) -> EntryStatus {
        self.status
    }

    /// Whether the size/complement pair is intact.  This is the torn-write
    /// detector: a partially-programmed entry cannot satisfy it.
    pub fn size_complement_ok(&self) -> bool {
        self.size_complement == !self.size
    }

    /// Full structural validity for an ACTIVE entry on a device with
    /// `total_sectors` sectors.
    pub fn is_valid(&self, total_sectors: u32) -> bool {
        if !self.size_complement_ok() {
            return false;
        }
        if self.start_sector < DATA_START_SECTOR || self.start_sector >= total_sectors {
            return false;
        }
        if self.start_sector + sector_count(self.size) > total_sectors {
            return false;
        }
        !self.name_str().is_empty()
    }

    fn encode(&self, out: &mut [u8]) {
        out[..MAX_FILENAME_LEN].copy_from_slice(&self.name);
        out[12..16].copy_from_slice(&self.start_sector.to_le_bytes());
        out[16..20].copy_from_slice(&self.size.to_le_bytes());
        out[20..24].copy_from_slice(&self.size_complement.to_le_bytes());
        out[24] = self.status.to_raw();
        out[25..28].copy_from_slice(&[0xFF; 3]);
    }

    fn decode(raw: &[u8]) -> Self {
        let mut name = [0u8; MAX_FILENAME_LEN];
        name.copy_from_slice(&raw[..MAX_FILENAME_LEN]);
        Self {
            name,
            start_sector: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
            size: u32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]),
            size_complement: u32::from_le_bytes([raw[20], raw[21], raw[22], raw[23]]),
            status: EntryStatus::from_raw(raw[24]),
        }
    }
}

/// Whole sectors needed to hold `size` bytes.
fn sector_count(size: u32) -> u32 {
    size.div_ceil(FLASH_SECTOR_SIZE as u32)
}

/// The flash storage backend.  Generic over the device so tests run against
/// a RAM NOR mock.
pub struct FlashStorage<D> {
    device: D,
    initialized: bool,
    directory: [FileEntry; MAX_FILES],
    total_sectors: u32,
    next_free_sector: u32,
    total_files: u32,
    deleted_files: u32,
    sector_buf: [u8; FLASH_SECTOR_SIZE],
}

impl<D> FlashStorage<D>
where
    D: ReadNorFlash + NorFlash + JedecId,
{
    pub fn new(device: D) -> Self {
        debug_assert_eq!(D::ERASE_SIZE, FLASH_SECTOR_SIZE);
        let total_sectors = (device.capacity() / FLASH_SECTOR_SIZE) as u32;
        Self {
            device,
            initialized: false,
            directory: [FileEntry::empty(); MAX_FILES],
            total_sectors,
            next_free_sector: DATA_START_SECTOR,
            total_files: 0,
            deleted_files: 0,
            sector_buf: [0; FLASH_SECTOR_SIZE],
        }
    }

    fn sector_addr(sector: u32) -> u32 {
        sector * FLASH_SECTOR_SIZE as u32
    }

    /// Find the ACTIVE entry for `name` (case-insensitive).
    fn find_entry(&self, name: &str) -> Option<usize> {
        self.directory.iter().position(|e| {
            e.status == EntryStatus::Active && names_equal(e.name_str(), name)
        })
    }

    /// Find a reusable directory slot.
    fn find_free_slot(&self) -> Option<usize> {
        self.directory
            .iter()
            .position(|e| matches!(e.status, EntryStatus::Empty | EntryStatus::Deleted))
    }

    /// Load and validate the on-flash directory.  Invalid ACTIVE entries
    /// are demoted to DELETED in memory (persisted on the next directory
    /// write, or explicitly by fsck).
    fn load_directory(&mut self) -> bool {
        let mut raw = [0u8; DIRECTORY_BYTES];
        if self.device.read(0, &mut raw).is_err() {
            return false;
        }

        self.total_files = 0;
        self.deleted_files = 0;
        self.next_free_sector = DATA_START_SECTOR;

        for (i, chunk) in raw.chunks_exact(ENTRY_SIZE).enumerate() {
            let mut entry = FileEntry::decode(chunk);
            if entry.status == EntryStatus::Active {
                if entry.is_valid(self.total_sectors) {
                    self.total_files += 1;
                    let end = entry.start_sector + sector_count(entry.size);
                    if end > self.next_free_sector {
                        self.next_free_sector = end;
                    }
                } else {
                    warn!("Discarding corrupt directory entry {}", i);
                    entry.status = EntryStatus::Deleted;
                    self.deleted_files += 1;
                }
            } else if entry.status == EntryStatus::Deleted {
                self.deleted_files += 1;
            }
            self.directory[i] = entry;
        }

        true
    }

    /// Rewrite the whole directory sector: erase then program.  Every
    /// directory-mutating operation pays this cost - that is the deliberate
    /// simplicity/safety trade of the design.
    fn save_directory(&mut self) -> bool {
        let mut raw = [0xFFu8; DIRECTORY_BYTES];
        for (entry, chunk) in self.directory.iter().zip(raw.chunks_exact_mut(ENTRY_SIZE)) {
            entry.encode(chunk);
        }

        if self
            .device
            .erase(0, FLASH_SECTOR_SIZE as u32)
            .is_err()
        {
            error!("Directory sector erase failed");
            return false;
        }
        if self.device.write(0, &raw).is_err() {
            error!("Directory write failed");
            return false;
        }
        true
    }

    /// Re-read the on-flash directory after a failed commit, so the
    /// in-memory view never drifts from what is persisted.
    fn reload_after_error(&mut self) {
        if !self.load_directory() {
            error!("Directory reload failed; flash backend going not-ready");
            self.initialized = false;
        }
    }

    /// Hand out a run of `sectors` sectors, compacting first if the
    /// watermark run is exhausted.
    fn allocate_sectors(&mut self, sectors: u32) -> Option<u32> {
        if self.next_free_sector + sectors > self.total_sectors {
            info!("Flash allocator exhausted; compacting");
            if !self.defragment() {
                return None;
            }
            if self.next_free_sector + sectors > self.total_sectors {
                return None;
            }
        }
        let start = self.next_free_sector;
        self.next_free_sector += sectors;
        Some(start)
    }

    /// Best-effort release of a just-allocated run after a failed write.
    fn release_sectors(&mut self, start: u32, sectors: u32) {
        let from = Self::sector_addr(start);
        let to = Self::sector_addr(start + sectors);
        let _ = self.device.erase(from, to);
        if self.next_free_sector == start + sectors {
            self.next_free_sector = start;
        }
    }

    /// Copy `sectors` sectors from `src` to `dst` through the bounce
    /// buffer.  Only ever called with dst < src, so an overlapping slide
    /// toward the data base is safe sector by sector.
    fn move_sectors(&mut self, src: u32, dst: u32, sectors: u32) -> bool {
        for i in 0..sectors {
            let src_addr = Self::sector_addr(src + i);
            let dst_addr = Self::sector_addr(dst + i);
            if self.device.read(src_addr, &mut self.sector_buf).is_err() {
                return false;
            }
            if self
                .device
                .erase(dst_addr, dst_addr + FLASH_SECTOR_SIZE as u32)
                .is_err()
            {
                return false;
            }
            if self.device.write(dst_addr, &self.sector_buf).is_err() {
                return false;
            }
        }
        true
    }

    /// Compact all ACTIVE files toward the data base, reclaiming the
    /// sectors of deleted files, and reset the watermark.  Advisory: a
    /// failure leaves the persisted directory untouched.
    pub fn defragment(&mut self) -> bool {
        if !self.initialized {
            return false;
        }

        // Active entry indices in ascending start-sector order.  Insertion
        // sort; the directory is small.
        let mut order: heapless::Vec<usize, MAX_FILES> = heapless::Vec::new();
        for (i, entry) in self.directory.iter().enumerate() {
            if entry.status == EntryStatus::Active {
                let pos = order
                    .iter()
                    .position(|&j| self.directory[j].start_sector > entry.start_sector)
                    .unwrap_or(order.len());
                if order.insert(pos, i).is_err() {
                    return false;
                }
            }
        }

        let mut watermark = DATA_START_SECTOR;
        for &idx in &order {
            let (start, sectors) = {
                let entry = &self.directory[idx];
                (entry.start_sector, sector_count(entry.size))
            };
            if start != watermark {
                if !self.move_sectors(start, watermark, sectors) {
                    error!("Compaction data move failed");
                    self.reload_after_error();
                    return false;
                }
                self.directory[idx].start_sector = watermark;
            }
            watermark += sectors;
        }

        // Deleted slots no longer shadow any data; make them plain empty.
        for entry in self.directory.iter_mut() {
            if entry.status == EntryStatus::Deleted {
                *entry = FileEntry::empty();
            }
        }
        self.next_free_sector = watermark;
        self.deleted_files = 0;

        if !self.save_directory() {
            self.reload_after_error();
            return false;
        }

        info!("Compaction complete; watermark now sector {}", watermark);
        true
    }

    /// Scan the directory for corrupt entries, discard them, and persist
    /// the repaired directory.  Returns true if nothing was wrong.
    pub fn fsck(&mut self) -> bool {
        if !self.initialized {
            return false;
        }

        let mut had_errors = false;
        for i in 0..MAX_FILES {
            if self.directory[i].status == EntryStatus::Active
                && !self.directory[i].is_valid(self.total_sectors)
            {
                warn!("fsck: discarding invalid entry {}", i);
                self.directory[i].status = EntryStatus::Deleted;
                had_errors = true;
            }
        }

        if had_errors {
            self.save_directory();
            self.load_directory();
        }

        !had_errors
    }

    /// (active files, deleted slots, fragmentation as % of used slots).
    pub fn filesystem_stats(&self) -> (u32, u32, u8) {
        let used = self.total_files + self.deleted_files;
        let fragmentation = if used > 0 {
            (self.deleted_files * 100 / used) as u8
        } else {
            0
        };
        (self.total_files, self.deleted_files, fragmentation)
    }

    /// The device's JEDEC ID, for the debug shell.
    pub fn jedec_id(&mut self) -> u32 {
        self.device.jedec_id().unwrap_or(0)
    }
}

impl<D> StoragePlugin for FlashStorage<D>
where
    D: ReadNorFlash + NorFlash + JedecId,
{
    fn initialize(&mut self) -> StatusCode {
        if self.initialized {
            return StatusCode::Ok;
        }

        // Probe the chip before trusting it.  All-zeros / all-ones means
        // nothing answered.
        let jedec = match self.device.jedec_id() {
            Ok(id) => id,
            Err(_) => {
                warn!("Flash: JEDEC probe failed");
                return StatusCode::Error;
            }
        };
        if jedec == 0x000000 || jedec == 0xFFFFFF {
            warn!("Flash: no chip detected (JEDEC 0x{:06x})", jedec);
            return StatusCode::Error;
        }
        if jedec != FLASH_JEDEC_W25Q128 {
            // Different chip - warn but try to continue; the command set is
            // near-universal.
            warn!("Flash: non-standard chip (JEDEC 0x{:06x})", jedec);
        }

        // An unreadable or never-formatted directory gets formatted.
        self.initialized = true;
        if !self.load_directory() {
            info!("Flash: directory load failed, formatting");
            if !self.format() {
                self.initialized = false;
                return StatusCode::Error;
            }
        }

        info!(
            "Flash: initialized, {} files, {} deleted",
            self.total_files, self.deleted_files
        );
        StatusCode::Ok
    }

    fn is_ready(&mut self) -> bool {
        self.initialized
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Flash
    }

    fn name(&self) -> &'static str {
        "Flash"
    }

    fn available_space(&mut self) -> u32 {
        if !self.initialized {
            return 0;
        }
        (self.total_sectors - self.next_free_sector) * FLASH_SECTOR_SIZE as u32
    }

    fn total_space(&mut self) -> u32 {
        // Total minus the directory sector.
        (self.total_sectors - 1) * FLASH_SECTOR_SIZE as u32
    }

    fn write_file(&mut self, name: &str, data: &[u8]) -> usize {
        if !self.initialized || name.is_empty() || name.len() > MAX_FILENAME_LEN || data.is_empty()
        {
            return 0;
        }

        // The old entry, if any, stays ACTIVE until the replacement's data
        // is fully on flash - a failed write must not lose the old file.
        let old_idx = self.find_entry(name);

        let Some(slot) = self.find_free_slot() else {
            warn!("Flash: directory full");
            return 0;
        };

        let sectors = sector_count(data.len() as u32);
        let Some(start) = self.allocate_sectors(sectors) else {
            warn!("Flash: no space for {} bytes", data.len());
            return 0;
        };

        let from = Self::sector_addr(start);
        let to = Self::sector_addr(start + sectors);
        if self.device.erase(from, to).is_err() || self.device.write(from, data).is_err() {
            warn!("Flash: data write failed");
            self.release_sectors(start, sectors);
            return 0;
        }

        // Single directory commit: retire the old entry and activate the
        // new one together.
        let saved_slot = self.directory[slot];
        let saved_old = old_idx.map(|i| self.directory[i]);
        let slot_was_deleted = self.directory[slot].status == EntryStatus::Deleted;

        self.directory[slot] = FileEntry::active(name, start, data.len() as u32);
        if let Some(i) = old_idx {
            self.directory[i].status = EntryStatus::Deleted;
        }

        if !self.save_directory() {
            self.directory[slot] = saved_slot;
            if let (Some(i), Some(old)) = (old_idx, saved_old) {
                self.directory[i] = old;
            }
            self.release_sectors(start, sectors);
            return 0;
        }

        if slot_was_deleted {
            self.deleted_files -= 1;
        }
        if old_idx.is_some() {
            self.total_files -= 1;
            self.deleted_files += 1;
        }
        self.total_files += 1;

        debug!("Flash: wrote {} ({} bytes)", name, data.len());
        data.len()
    }

    fn read_file(&mut self, name: &str, buf: &mut [u8]) -> usize {
        if !self.initialized || buf.is_empty() {
            return 0;
        }
        let Some(idx) = self.find_entry(name) else {
            return 0;
        };
        let entry = self.directory[idx];
        let len = (entry.size as usize).min(buf.len());
        let addr = Self::sector_addr(entry.start_sector);
        if self.device.read(addr, &mut buf[..len]).is_err() {
            return 0;
        }
        len
    }

    fn delete_file(&mut self, name: &str) -> bool {
        if !self.initialized {
            return false;
        }
        let Some(idx) = self.find_entry(name) else {
            return false;
        };

        let saved = self.directory[idx];
        self.directory[idx].status = EntryStatus::Deleted;
        if !self.save_directory() {
            self.directory[idx] = saved;
            return false;
        }

        self.total_files -= 1;
        self.deleted_files += 1;
        debug!("Flash: deleted {}", name);
        true
    }

    fn file_exists(&mut self, name: &str) -> bool {
        self.initialized && self.find_entry(name).is_some()
    }

    fn file_size(&mut self, name: &str) -> u32 {
        if !self.initialized {
            return 0;
        }
        self.find_entry(name)
            .map(|i| self.directory[i].size)
            .unwrap_or(0)
    }

    fn list_files(&mut self, out: &mut [FileName]) -> usize {
        if !self.initialized {
            return 0;
        }
        let mut count = 0;
        for entry in self.directory.iter() {
            if count >= out.len() {
                break;
            }
            if entry.status == EntryStatus::Active {
                out[count].clear();
                let _ = out[count].push_str(entry.name_str());
                count += 1;
            }
        }
        count
    }

    fn format(&mut self) -> bool {
        if !self.initialized {
            return false;
        }
        info!("Flash: formatting");

        self.directory = [FileEntry::empty(); MAX_FILES];
        self.total_files = 0;
        self.deleted_files = 0;
        self.next_free_sector = DATA_START_SECTOR;

        self.save_directory()
    }

    fn status_line(&mut self, out: &mut StatusLine) -> bool {
        out.clear();
        let result = if self.initialized {
            write!(out, "Flash: Ready ({} files)", self.total_files)
        } else {
            write!(out, "Flash: Not initialized")
        };
        result.is_ok()
    }

    fn validate(&mut self) -> bool {
        if !self.initialized {
            return false;
        }
        // Structural check only - every ACTIVE entry must still be sane.
        self.directory
            .iter()
            .filter(|e| e.status == EntryStatus::Active)
            .all(|e| e.is_valid(self.total_sectors))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use embedded_storage::nor_flash::{ErrorType, NorFlashError, NorFlashErrorKind};

    /// RAM-backed NOR flash with proper erase/program semantics: erase sets
    /// 0xFF, programming can only clear bits.
    pub struct MockFlash {
        pub mem: Vec<u8>,
        pub jedec: u32,
        /// When Some(n), the next n write/erase operations succeed and
        /// everything after fails.
        pub writes_before_failure: Option<usize>,
    }

    #[derive(Debug)]
    pub struct MockError;

    impl NorFlashError for MockError {
        fn kind(&self) -> NorFlashErrorKind {
            NorFlashErrorKind::Other
        }
    }

    impl MockFlash {
        pub fn new(sectors: usize) -> Self {
            Self {
                mem: vec![0xFF; sectors * FLASH_SECTOR_SIZE],
                jedec: FLASH_JEDEC_W25Q128,
                writes_before_failure: None,
            }
        }

        fn consume_write_budget(&mut self) -> Result<(), MockError> {
            match &mut self.writes_before_failure {
                None => Ok(()),
                Some(0) => Err(MockError),
                Some(n) => {
                    *n -= 1;
                    Ok(())
                }
            }
        }
    }

    impl ErrorType for MockFlash {
        type Error = MockError;
    }

    impl JedecId for MockFlash {
        fn jedec_id(&mut self) -> Result<u32, MockError> {
            Ok(self.jedec)
        }
    }

    impl ReadNorFlash for MockFlash {
        const READ_SIZE: usize = 1;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), MockError> {
            let offset = offset as usize;
            if offset + bytes.len() > self.mem.len() {
                return Err(MockError);
            }
            bytes.copy_from_slice(&self.mem[offset..offset + bytes.len()]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.mem.len()
        }
    }

    impl NorFlash for MockFlash {
        const WRITE_SIZE: usize = 1;
        const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), MockError> {
            self.consume_write_budget()?;
            let (from, to) = (from as usize, to as usize);
            if to > self.mem.len() || from % FLASH_SECTOR_SIZE != 0 || to % FLASH_SECTOR_SIZE != 0
            {
                return Err(MockError);
            }
            self.mem[from..to].fill(0xFF);
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), MockError> {
            self.consume_write_budget()?;
            let offset = offset as usize;
            if offset + bytes.len() > self.mem.len() {
                return Err(MockError);
            }
            for (slot, &byte) in self.mem[offset..offset + bytes.len()].iter_mut().zip(bytes) {
                // NOR programming clears bits, never sets them.
                *slot &= byte;
            }
            Ok(())
        }
    }
}
