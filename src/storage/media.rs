//! Removable-media storage backend: a thin adapter over a FAT volume.
//!
//! All real file I/O is delegated to embedded-sdmmc through the narrow
//! [`MediaVolume`] seam; this module owns only the things the library does
//! not - card presence and write-protect gating (two GPIO inputs, re-probed
//! before every write), the plugin error policy, and a conservative
//! free-space estimate.  The namespace is flat (volume root only): the
//! coordinator rejects path separators before any backend sees them.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use core::fmt::Write as _;
use embedded_hal::digital::InputPin;
use embedded_sdmmc::{BlockDevice, Mode, TimeSource, Timestamp, VolumeIdx, VolumeManager};

use super::StoragePlugin;
use crate::types::{FileName, StatusCode, StatusLine, StorageKind};

/// Largest FAT cluster size; the free-space estimate rounds every file up
/// to this so it can never over-report.
const MAX_CLUSTER_BYTES: u32 = 64 * 1024;

/// The slice of filesystem behavior this backend actually delegates.
/// Narrow on purpose: the adapter logic is testable against a RAM
/// implementation without synthesizing a FAT image.
pub trait MediaVolume {
    type Error: core::fmt::Debug;

    /// Create or truncate `name` in the volume root and write `data`.
    fn write_file(&mut self, name: &str, data: &[u8]) -> Result<usize, Self::Error>;

    /// Read up to `buf.len()` bytes of `name`.  Returns bytes read.
    fn read_file(&mut self, name: &str, buf: &mut [u8]) -> Result<usize, Self::Error>;

    fn delete_file(&mut self, name: &str) -> Result<(), Self::Error>;

    fn file_exists(&mut self, name: &str) -> Result<bool, Self::Error>;

    fn file_size(&mut self, name: &str) -> Result<u32, Self::Error>;

    /// Fill `out` with root-directory filenames; returns the count stored.
    fn list_files(&mut self, out: &mut [FileName]) -> Result<usize, Self::Error>;

    /// Sum of all root-directory file sizes.
    fn used_bytes(&mut self) -> Result<u32, Self::Error>;

    /// Volume capacity in bytes.
    fn volume_size(&mut self) -> Result<u32, Self::Error>;
}

/// Media presence detection.  Card-detect and write-protect switches on the
/// card socket, wired to two inputs.
pub trait MediaDetect {
    fn card_present(&mut self) -> bool;

    fn write_protected(&mut self) -> bool;
}

/// MediaDetect over two embedded-hal input pins: card-detect active low,
/// write-protect active high (the usual SD socket switch polarity).
pub struct SocketPins<CD, WP> {
    card_detect: CD,
    write_protect: WP,
}

impl<CD: InputPin, WP: InputPin> SocketPins<CD, WP> {
    pub fn new(card_detect: CD, write_protect: WP) -> Self {
        Self {
            card_detect,
            write_protect,
        }
    }
}

impl<CD: InputPin, WP: InputPin> MediaDetect for SocketPins<CD, WP> {
    fn card_present(&mut self) -> bool {
        self.card_detect.is_low().unwrap_or(false)
    }

    fn write_protected(&mut self) -> bool {
        self.write_protect.is_high().unwrap_or(true)
    }
}

/// Fixed timestamp source for FAT metadata - this device has no RTC, and
/// file times are not part of the capture contract.
pub struct FixedTimeSource;

impl TimeSource for FixedTimeSource {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 55,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

/// [`MediaVolume`] over an embedded-sdmmc volume.  Directories and files
/// are opened per operation; nothing borrows the volume manager across
/// calls.
pub struct SdmmcVolume<D: BlockDevice, T: TimeSource> {
    manager: VolumeManager<D, T>,
    capacity: u32,
}

impl<D: BlockDevice, T: TimeSource> SdmmcVolume<D, T> {
    /// `capacity` comes from the card driver (e.g. SdCard::num_bytes) - the
    /// FAT library does not expose it cheaply.
    pub fn new(device: D, time_source: T, capacity: u32) -> Self {
        Self {
            manager: VolumeManager::new(device, time_source),
            capacity,
        }
    }
}

impl<D: BlockDevice, T: TimeSource> MediaVolume for SdmmcVolume<D, T> {
    type Error = embedded_sdmmc::Error<D::Error>;

    fn write_file(&mut self, name: &str, data: &[u8]) -> Result<usize, Self::Error> {
        let mut volume = self.manager.open_volume(VolumeIdx(0))?;
        let mut root = volume.open_root_dir()?;
        let mut file = root.open_file_in_dir(name, Mode::ReadWriteCreateOrTruncate)?;
        file.write(data)?;
        Ok(data.len())
    }

    fn read_file(&mut self, name: &str, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut volume = self.manager.open_volume(VolumeIdx(0))?;
        let mut root = volume.open_root_dir()?;
        let mut file = root.open_file_in_dir(name, Mode::ReadOnly)?;
        let mut total = 0;
        while total < buf.len() && !file.is_eof() {
            let read = file.read(&mut buf[total..])?;
            if read == 0 {
                break;
            }
            total += read;
        }
        Ok(total)
    }

    fn delete_file(&mut self, name: &str) -> Result<(), Self::Error> {
        let mut volume = self.manager.open_volume(VolumeIdx(0))?;
        let mut root = volume.open_root_dir()?;
        root.delete_file_in_dir(name)
    }

    fn file_exists(&mut self, name: &str) -> Result<bool, Self::Error> {
        let mut volume = self.manager.open_volume(VolumeIdx(0))?;
        let mut root = volume.open_root_dir()?;
        match root.open_file_in_dir(name, Mode::ReadOnly) {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    fn file_size(&mut self, name: &str) -> Result<u32, Self::Error> {
        let mut volume = self.manager.open_volume(VolumeIdx(0))?;
        let mut root = volume.open_root_dir()?;
        let file = root.open_file_in_dir(name, Mode::ReadOnly)?;
        Ok(file.length())
    }

    fn list_files(&mut self, out: &mut [FileName]) -> Result<usize, Self::Error> {
        let mut volume = self.manager.open_volume(VolumeIdx(0))?;
        let mut root = volume.open_root_dir()?;
        let mut count = 0;
        root.iterate_dir(|entry| {
            if count >= out.len() || entry.attributes.is_directory() {
                return;
            }
            let name = &mut out[count];
            name.clear();
            for &b in entry.name.base_name() {
                let _ = name.push(b as char);
            }
            if !entry.name.extension().is_empty() {
                let _ = name.push('.');
                for &b in entry.name.extension() {
                    let _ = name.push(b as char);
                }
            }
            count += 1;
        })?;
        Ok(count)
    }

    fn used_bytes(&mut self) -> Result<u32, Self::Error> {
        let mut volume = self.manager.open_volume(VolumeIdx(0))?;
        let mut root = volume.open_root_dir()?;
        let mut used: u32 = 0;
        root.iterate_dir(|entry| {
            if !entry.attributes.is_directory() {
                let clusters = entry.size.div_ceil(MAX_CLUSTER_BYTES);
                used = used.saturating_add(clusters.saturating_mul(MAX_CLUSTER_BYTES));
            }
        })?;
        Ok(used)
    }

    fn volume_size(&mut self) -> Result<u32, Self::Error> {
        Ok(self.capacity)
    }
}

/// The removable-media storage backend.
pub struct MediaStorage<V: MediaVolume, P: MediaDetect> {
    volume: V,
    detect: P,
    initialized: bool,
    card_present: bool,
    write_protected: bool,
}

impl<V: MediaVolume, P: MediaDetect> MediaStorage<V, P> {
    pub fn new(volume: V, detect: P) -> Self {
        Self {
            volume,
            detect,
            initialized: false,
            card_present: false,
            write_protected: false,
        }
    }

    /// Re-probe the socket switches.  Cheap; called from is_ready() and
    /// before every write.
    fn check_card_status(&mut self) {
        self.card_present = self.detect.card_present();
        self.write_protected = self.detect.write_protected();
    }

    pub fn is_write_protected(&mut self) -> bool {
        self.check_card_status();
        self.write_protected
    }

    /// Access to the detect pins, for the hardware self-test.
    pub fn detect_mut(&mut self) -> &mut P {
        &mut self.detect
    }
}

impl<V: MediaVolume, P: MediaDetect> StoragePlugin for MediaStorage<V, P> {
    fn initialize(&mut self) -> StatusCode {
        if self.initialized {
            return StatusCode::Ok;
        }

        self.check_card_status();
        if !self.card_present {
            // Not an error - the card may be inserted later; is_ready()
            // re-probes.
            info!("Media: no card detected");
        }

        self.initialized = true;
        StatusCode::Ok
    }

    fn is_ready(&mut self) -> bool {
        if !self.initialized {
            return false;
        }
        self.check_card_status();
        self.card_present && !self.write_protected
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Media
    }

    fn name(&self) -> &'static str {
        "SD Card"
    }

    fn available_space(&mut self) -> u32 {
        if !self.is_ready() {
            return 0;
        }
        // Conservative: every file rounded up to the largest cluster size,
        // so this never reports more free space than truly exists.
        let total = self.volume.volume_size().unwrap_or(0);
        let used = self.volume.used_bytes().unwrap_or(total);
        total.saturating_sub(used)
    }

    fn total_space(&mut self) -> u32 {
        if !self.initialized {
            return 0;
        }
        self.volume.volume_size().unwrap_or(0)
    }

    fn write_file(&mut self, name: &str, data: &[u8]) -> usize {
        if !self.initialized || name.is_empty() || data.is_empty() {
            return 0;
        }

        // Presence and write protection re-checked at the moment of use -
        // cards come and go.
        self.check_card_status();
        if !self.card_present || self.write_protected {
            warn!("Media: not writable (no card or write protected)");
            return 0;
        }

        match self.volume.write_file(name, data) {
            Ok(written) => {
                debug!("Media: wrote {} ({} bytes)", name, written);
                written
            }
            Err(_) => {
                warn!("Media: write of {} failed", name);
                0
            }
        }
    }

    fn read_file(&mut self, name: &str, buf: &mut [u8]) -> usize {
        if !self.is_ready() || buf.is_empty() {
            return 0;
        }
        self.volume.read_file(name, buf).unwrap_or(0)
    }

    fn delete_file(&mut self, name: &str) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.check_card_status();
        if self.write_protected {
            return false;
        }
        self.volume.delete_file(name).is_ok()
    }

    fn file_exists(&mut self, name: &str) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.volume.file_exists(name).unwrap_or(false)
    }

    fn file_size(&mut self, name: &str) -> u32 {
        if !self.is_ready() {
            return 0;
        }
        self.volume.file_size(name).unwrap_or(0)
    }

    fn list_files(&mut self, out: &mut [FileName]) -> usize {
        if !self.is_ready() {
            return 0;
        }
        self.volume.list_files(out).unwrap_or(0)
    }

    fn format(&mut self) -> bool {
        // Formatting removable media is out of scope - cards arrive
        // formatted and leave formatted.
        warn!("Media: format not supported");
        false
    }

    fn status_line(&mut self, out: &mut StatusLine) -> bool {
        out.clear();
        let result = if !self.initialized {
            write!(out, "SD: Not initialized")
        } else {
            self.check_card_status();
            if !self.card_present {
                write!(out, "SD: No card")
            } else if self.write_protected {
                write!(out, "SD: Write protected")
            } else {
                write!(out, "SD: Ready")
            }
        };
        result.is_ok()
    }

    fn validate(&mut self) -> bool {
        self.initialized
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::BTreeMap;

    /// RAM MediaVolume: a name -> bytes map.
    #[derive(Default)]
    pub struct RamVolume {
        pub files: BTreeMap<String, Vec<u8>>,
        pub capacity: u32,
        pub fail_io: bool,
    }

    impl RamVolume {
        pub fn new(capacity: u32) -> Self {
            Self {
                files: BTreeMap::new(),
                capacity,
                fail_io: false,
            }
        }

        fn check(&self) -> Result<(), &'static str> {
            if self.fail_io { Err("io") } else { Ok(()) }
        }

        fn key(name: &str) -> String {
            name.to_ascii_uppercase()
        }
    }

    impl MediaVolume for RamVolume {
        type Error = &'static str;

        fn write_file(&mut self, name: &str, data: &[u8]) -> Result<usize, Self::Error> {
            self.check()?;
            self.files.insert(Self::key(name), data.to_vec());
            Ok(data.len())
        }

        fn read_file(&mut self, name: &str, buf: &mut [u8]) -> Result<usize, Self::Error> {
            self.check()?;
            let data = self.files.get(&Self::key(name)).ok_or("not found")?;
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
            Ok(len)
        }

        fn delete_file(&mut self, name: &str) -> Result<(), Self::Error> {
            self.check()?;
            self.files
                .remove(&Self::key(name))
                .map(|_| ())
                .ok_or("not found")
        }

        fn file_exists(&mut self, name: &str) -> Result<bool, Self::Error> {
            self.check()?;
            Ok(self.files.contains_key(&Self::key(name)))
        }

        fn file_size(&mut self, name: &str) -> Result<u32, Self::Error> {
            self.check()?;
            self.files
                .get(&Self::key(name))
                .map(|d| d.len() as u32)
                .ok_or("not found")
        }

        fn list_files(&mut self, out: &mut [FileName]) -> Result<usize, Self::Error> {
            self.check()?;
            let mut count = 0;
            for name in self.files.keys() {
                if count >= out.len() {
                    break;
                }
                out[count].clear();
                let _ = out[count].push_str(name);
                count += 1;
            }
            Ok(count)
        }

        fn used_bytes(&mut self) -> Result<u32, Self::Error> {
            self.check()?;
            Ok(self
                .files
                .values()
                .map(|d| (d.len() as u32).div_ceil(MAX_CLUSTER_BYTES) * MAX_CLUSTER_BYTES)
                .sum())
        }

        fn volume_size(&mut self) -> Result<u32, Self::Error> {
            Ok(self.capacity)
        }
    }

    /// Settable socket switches.
    pub struct MockDetect {
        pub present: bool,
        pub protected: bool,
    }

    impl MediaDetect for MockDetect {
        fn card_present(&mut self) -> bool {
            self.present
        }

        fn write_protected(&mut self) -> bool {
            self.protected
        }
    }

    pub fn ready_media() -> MediaStorage<RamVolume, MockDetect> {
        let mut media = MediaStorage::new(
            RamVolume::new(4 * 1024 * 1024),
            MockDetect {
                present: true,
                protected: false,
            },
        );
        assert_eq!(media.initialize(), StatusCode::Ok);
        media
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockDetect, RamVolume, ready_media};
    use super::*;

    #[test]
    fn write_read_delete_round_trip() {
        let mut media = ready_media();
        let data: Vec<u8> = (0..=255u8).collect();

        assert_eq!(media.write_file("cap.bin", &data), 256);
        assert!(media.file_exists("cap.bin"));
        assert_eq!(media.file_size("cap.bin"), 256);

        let mut buf = [0u8; 512];
        assert_eq!(media.read_file("cap.bin", &mut buf), 256);
        assert_eq!(&buf[..256], &data[..]);

        assert!(media.delete_file("cap.bin"));
        assert!(!media.file_exists("cap.bin"));
        assert_eq!(media.read_file("cap.bin", &mut buf), 0);
    }

    #[test]
    fn names_are_case_insensitive() {
        let mut media = ready_media();
        assert_eq!(media.write_file("Cap.Bin", &[1, 2]), 2);
        assert!(media.file_exists("CAP.BIN"));
        assert!(media.file_exists("cap.bin"));
    }

    #[test]
    fn absent_card_gates_everything() {
        let mut media = MediaStorage::new(
            RamVolume::new(1024),
            MockDetect {
                present: false,
                protected: false,
            },
        );
        assert_eq!(media.initialize(), StatusCode::Ok);
        assert!(!media.is_ready());
        assert_eq!(media.write_file("a.bin", &[1]), 0);
        let mut buf = [0u8; 4];
        assert_eq!(media.read_file("a.bin", &mut buf), 0);
        assert_eq!(media.available_space(), 0);

        let mut line = StatusLine::new();
        assert!(media.status_line(&mut line));
        assert_eq!(line.as_str(), "SD: No card");
    }

    #[test]
    fn card_insertion_detected_on_reprobe() {
        let mut media = MediaStorage::new(
            RamVolume::new(1024),
            MockDetect {
                present: false,
                protected: false,
            },
        );
        assert_eq!(media.initialize(), StatusCode::Ok);
        assert!(!media.is_ready());

        media.detect.present = true;
        assert!(media.is_ready());
        assert_eq!(media.write_file("a.bin", &[1]), 1);
    }

    #[test]
    fn write_protect_blocks_writes_not_reads() {
        let mut media = ready_media();
        assert_eq!(media.write_file("a.bin", &[1, 2, 3]), 3);

        media.detect.protected = true;
        assert_eq!(media.write_file("b.bin", &[4]), 0);
        assert!(!media.delete_file("a.bin"));
        assert!(media.is_write_protected());
        // is_ready treats a protected card as not usable for capture.
        assert!(!media.is_ready());
    }

    #[test]
    fn format_unsupported() {
        let mut media = ready_media();
        assert!(!media.format());
    }

    #[test]
    fn free_space_is_conservative() {
        let mut media = ready_media();
        let total = media.total_space();
        assert_eq!(media.available_space(), total);

        // A 1-byte file still costs a whole cluster in the estimate.
        assert_eq!(media.write_file("a.bin", &[1]), 1);
        let available = media.available_space();
        assert!(available <= total - 1);
        assert_eq!(available, total - 64 * 1024);
    }

    #[test]
    fn io_failure_returns_zero() {
        let mut media = ready_media();
        assert_eq!(media.write_file("a.bin", &[1, 2]), 2);
        media.volume.fail_io = true;
        assert_eq!(media.write_file("b.bin", &[3]), 0);
        let mut buf = [0u8; 4];
        assert_eq!(media.read_file("a.bin", &mut buf), 0);
        assert!(!media.file_exists("a.bin"));
    }

    #[test]
    fn list_files_bounded() {
        let mut media = ready_media();
        for name in ["a.bin", "b.bin", "c.bin"] {
            assert_eq!(media.write_file(name, &[0]), 1);
        }
        let mut names: [FileName; 2] = core::array::from_fn(|_| FileName::new());
        assert_eq!(media.list_files(&mut names), 2);
    }
}
