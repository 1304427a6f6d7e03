//! The storage layer: one uniform plugin contract, three interchangeable
//! backends, and the coordinator that routes between them.
//!
//! The coordinator is the single point of contact for file operations.  It
//! owns no file data - only routing state, aggregate statistics and a
//! scratch buffer for cross-backend copies.  Filenames are validated once
//! here, so every backend only ever sees names the weakest backend's naming
//! rules allow.
//!
//! Backend selection is a priority order - removable media if present,
//! else flash, else the serial stream (which has no physical media to go
//! missing and is therefore the guaranteed fallback).  The periodic
//! update() call is the only automatic-failover point; mid-operation
//! failures are reported, not retried elsewhere.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

pub mod flash;
pub mod media;
pub mod nor;
pub mod stream;

use core::fmt::Write as _;

use crate::constants::{MAX_FILENAME_LEN, TRANSFER_BUFFER_SIZE};
use crate::types::{Component, FileName, StatusCode, StatusLine, StorageKind};

/// Name of the probe file test_write() uses.
const TEST_FILENAME: &str = "test.dat";

/// The contract every storage backend implements.
///
/// Error policy: return 0 / false / empty on any failure (missing media,
/// invalid name, not ready, out of space).  No partial success without a
/// short count, no panics, no internal retries - retry and failover belong
/// to the coordinator.
pub trait StoragePlugin {
    /// Bring the backend up, probing its hardware.  Idempotent.  A backend
    /// that fails here is simply not-ready; the system runs on without it.
    fn initialize(&mut self) -> StatusCode;

    /// Cheap liveness check.  May re-probe hardware presence (e.g. the
    /// card-detect switch).
    fn is_ready(&mut self) -> bool;

    fn kind(&self) -> StorageKind;

    fn name(&self) -> &'static str;

    fn available_space(&mut self) -> u32;

    fn total_space(&mut self) -> u32;

    /// Write a whole file.  Returns bytes written: `data.len()` on success,
    /// 0 on any failure.
    fn write_file(&mut self, name: &str, data: &[u8]) -> usize;

    /// Read up to `buf.len()` bytes.  Returns bytes read, 0 on failure or
    /// absence.
    fn read_file(&mut self, name: &str, buf: &mut [u8]) -> usize;

    fn delete_file(&mut self, name: &str) -> bool;

    fn file_exists(&mut self, name: &str) -> bool;

    fn file_size(&mut self, name: &str) -> u32;

    /// Fill `out` with filenames; returns how many were stored.
    fn list_files(&mut self, out: &mut [FileName]) -> usize;

    fn format(&mut self) -> bool;

    /// Write a one-line human-readable summary into `out`.
    fn status_line(&mut self, out: &mut StatusLine) -> bool;

    /// Structural self-check, non-destructive.
    fn validate(&mut self) -> bool;
}

/// Case-insensitive filename comparison - every backend stores names
/// case-preserving but matches them case-blind, like the FAT media does.
pub fn names_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Filename policy, enforced once at the coordinator boundary: short,
/// printable ASCII, no characters the weakest backend cannot store, no path
/// separators (the namespace is flat).
pub fn is_valid_filename(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_FILENAME_LEN {
        return false;
    }
    name.bytes().all(|ch| {
        (0x20..0x7F).contains(&ch)
            && !matches!(
                ch,
                b'/' | b'\\' | b':' | b'*' | b'?' | b'"' | b'<' | b'>' | b'|'
            )
    })
}

/// Aggregate file operation statistics, success-only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StorageStats {
    pub files_written: u32,
    pub bytes_written: u32,
    pub files_read: u32,
    pub bytes_read: u32,
}

/// Routes file operations to the active backend.  Owns all three plugin
/// instances (dependency-injected at construction - there is no global
/// registry to ask).
pub struct StorageCoordinator<F, M, S>
where
    F: StoragePlugin,
    M: StoragePlugin,
    S: StoragePlugin,
{
    flash: F,
    media: M,
    stream: S,
    current: StorageKind,
    initialized: bool,
    stats: StorageStats,
    transfer_buf: [u8; TRANSFER_BUFFER_SIZE],
    auto_counter: u16,
}

impl<F, M, S> StorageCoordinator<F, M, S>
where
    F: StoragePlugin,
    M: StoragePlugin,
    S: StoragePlugin,
{
    pub fn new(flash: F, media: M, stream: S) -> Self {
        Self {
            flash,
            media,
            stream,
            current: StorageKind::Stream,
            initialized: false,
            stats: StorageStats::default(),
            transfer_buf: [0; TRANSFER_BUFFER_SIZE],
            auto_counter: 0,
        }
    }

    fn plugin_mut(&mut self, kind: StorageKind) -> &mut dyn StoragePlugin {
        match kind {
            StorageKind::Media => &mut self.media,
            StorageKind::Flash => &mut self.flash,
            StorageKind::Stream => &mut self.stream,
        }
    }

    /// Direct access to the backends, for backend-specific operations the
    /// common contract does not cover (compaction, transfer abort) and for
    /// the debug shell.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn media_mut(&mut self) -> &mut M {
        &mut self.media
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Pick the best available backend: media, then flash, then stream.
    /// Always returns something - stream has no media to go missing.
    pub fn auto_detect_storage(&mut self) -> StorageKind {
        if self.media.is_ready() {
            StorageKind::Media
        } else if self.flash.is_ready() {
            StorageKind::Flash
        } else {
            StorageKind::Stream
        }
    }

    /// Switch the active backend.  Fails (and leaves the selection alone)
    /// if the requested backend is not ready.
    pub fn set_storage_type(&mut self, kind: StorageKind) -> bool {
        if !self.initialized {
            return false;
        }
        if !self.plugin_mut(kind).is_ready() {
            warn!("Storage: {} not available", self.plugin_mut(kind).name());
            return false;
        }
        self.current = kind;
        info!("Storage: active backend now {}", self.plugin_mut(kind).name());
        true
    }

    pub fn current_storage(&self) -> StorageKind {
        self.current
    }

    pub fn current_storage_name(&mut self) -> &'static str {
        self.plugin_mut(self.current).name()
    }

    pub fn is_storage_ready(&mut self) -> bool {
        let current = self.current;
        self.plugin_mut(current).is_ready()
    }

    pub fn statistics(&self) -> StorageStats {
        self.stats
    }

    /// Write `data` as `name` on the active backend.
    pub fn write_file(&mut self, name: &str, data: &[u8]) -> usize {
        if !self.initialized || data.is_empty() {
            return 0;
        }
        if !is_valid_filename(name) {
            warn!("Storage: invalid filename {}", name);
            return 0;
        }

        let current = self.current;
        let plugin = self.plugin_mut(current);
        if !plugin.is_ready() {
            warn!("Storage: backend not ready");
            return 0;
        }

        let written = plugin.write_file(name, data);
        if written > 0 {
            self.stats.files_written += 1;
            self.stats.bytes_written += written as u32;
            debug!("Storage: wrote {} bytes to {}", written, name);
        } else {
            warn!("Storage: failed to write {}", name);
        }
        written
    }

    /// Write with a generated unique name (`<prefix>_NNNN<extension>`).
    /// The generated name is returned through `generated`, when wanted.
    pub fn write_file_auto(
        &mut self,
        prefix: &str,
        extension: &str,
        data: &[u8],
        generated: Option<&mut FileName>,
    ) -> usize {
        self.auto_counter = self.auto_counter % 9999 + 1;
        let mut name = FileName::new();
        if write!(name, "{}_{:04}{}", prefix, self.auto_counter, extension).is_err() {
            // Prefix and extension left no room inside the name budget.
            return 0;
        }

        let written = self.write_file(&name, data);
        if written > 0 {
            if let Some(out) = generated {
                out.clear();
                let _ = out.push_str(&name);
            }
        }
        written
    }

    /// Read `name` from the active backend.
    pub fn read_file(&mut self, name: &str, buf: &mut [u8]) -> usize {
        if !self.initialized || buf.is_empty() || !is_valid_filename(name) {
            return 0;
        }

        let current = self.current;
        let plugin = self.plugin_mut(current);
        if !plugin.is_ready() {
            return 0;
        }

        let read = plugin.read_file(name, buf);
        if read > 0 {
            self.stats.files_read += 1;
            self.stats.bytes_read += read as u32;
        }
        read
    }

    pub fn delete_file(&mut self, name: &str) -> bool {
        if !self.initialized || !is_valid_filename(name) {
            return false;
        }
        let current = self.current;
        self.plugin_mut(current).delete_file(name)
    }

    pub fn file_exists(&mut self, name: &str) -> bool {
        if !self.initialized || !is_valid_filename(name) {
            return false;
        }
        let current = self.current;
        self.plugin_mut(current).file_exists(name)
    }

    pub fn file_size(&mut self, name: &str) -> u32 {
        if !self.initialized || !is_valid_filename(name) {
            return 0;
        }
        let current = self.current;
        self.plugin_mut(current).file_size(name)
    }

    pub fn list_files(&mut self, out: &mut [FileName]) -> usize {
        if !self.initialized {
            return 0;
        }
        let current = self.current;
        self.plugin_mut(current).list_files(out)
    }

    pub fn format_storage(&mut self) -> bool {
        if !self.initialized {
            return false;
        }
        let current = self.current;
        self.plugin_mut(current).format()
    }

    /// (available, total) bytes on the active backend.
    pub fn storage_space(&mut self) -> (u32, u32) {
        if !self.initialized {
            return (0, 0);
        }
        let current = self.current;
        let plugin = self.plugin_mut(current);
        (plugin.available_space(), plugin.total_space())
    }

    pub fn storage_status(&mut self, out: &mut StatusLine) -> bool {
        if !self.initialized {
            return false;
        }
        let current = self.current;
        self.plugin_mut(current).status_line(out)
    }

    /// Copy a file between two backends through the shared scratch buffer.
    /// All-or-nothing: too-large files, absent sources, not-ready backends
    /// and same-backend copies are all rejected up front.
    pub fn copy_file(&mut self, name: &str, source: StorageKind, dest: StorageKind) -> bool {
        if !self.initialized || source == dest || !is_valid_filename(name) {
            return false;
        }

        if !self.plugin_mut(source).is_ready() || !self.plugin_mut(dest).is_ready() {
            return false;
        }

        if !self.plugin_mut(source).file_exists(name) {
            warn!("Storage: copy source {} not found", name);
            return false;
        }

        let size = self.plugin_mut(source).file_size(name) as usize;
        if size == 0 || size > TRANSFER_BUFFER_SIZE {
            warn!("Storage: {} too large for copy buffer", name);
            return false;
        }

        let read = {
            let Self {
                flash,
                media,
                stream,
                transfer_buf,
                ..
            } = self;
            let plugin: &mut dyn StoragePlugin = match source {
                StorageKind::Media => media,
                StorageKind::Flash => flash,
                StorageKind::Stream => stream,
            };
            plugin.read_file(name, &mut transfer_buf[..size])
        };
        if read != size {
            warn!("Storage: copy read failed");
            return false;
        }

        let written = {
            let Self {
                flash,
                media,
                stream,
                transfer_buf,
                ..
            } = self;
            let plugin: &mut dyn StoragePlugin = match dest {
                StorageKind::Media => media,
                StorageKind::Flash => flash,
                StorageKind::Stream => stream,
            };
            plugin.write_file(name, &transfer_buf[..size])
        };
        if written != size {
            warn!("Storage: copy write failed");
            return false;
        }

        debug!("Storage: copied {} ({} bytes)", name, size);
        true
    }

    /// Write a fixed-pattern probe file to the active backend, read it
    /// back, verify byte-for-byte, delete it.  Used by the self-test.
    pub fn test_write(&mut self) -> bool {
        if !self.initialized {
            return false;
        }

        let mut test_data = [0u8; 32];
        for (i, byte) in test_data.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_add(0xA5);
        }

        if self.write_file(TEST_FILENAME, &test_data) != test_data.len() {
            return false;
        }

        let mut read_back = [0u8; 32];
        if self.read_file(TEST_FILENAME, &mut read_back) != test_data.len()
            || read_back != test_data
        {
            self.delete_file(TEST_FILENAME);
            return false;
        }

        self.delete_file(TEST_FILENAME);
        true
    }

    /// Validate every backend, not just the active one.
    pub fn validate_all(&mut self) -> bool {
        let flash_ok = !self.flash.is_ready() || self.flash.validate();
        let media_ok = !self.media.is_ready() || self.media.validate();
        let stream_ok = !self.stream.is_ready() || self.stream.validate();
        flash_ok && media_ok && stream_ok
    }
}

impl<F, M, S> Component for StorageCoordinator<F, M, S>
where
    F: StoragePlugin,
    M: StoragePlugin,
    S: StoragePlugin,
{
    fn initialize(&mut self) -> StatusCode {
        if self.initialized {
            return StatusCode::Ok;
        }

        // Bring up every backend; a failure just leaves that backend
        // not-ready.
        for kind in [StorageKind::Media, StorageKind::Flash, StorageKind::Stream] {
            let plugin = self.plugin_mut(kind);
            let name = plugin.name();
            match plugin.initialize() {
                StatusCode::Ok => info!("Storage: {} OK", name),
                code => warn!("Storage: {} init failed ({})", name, code as u8),
            }
        }

        self.initialized = true;
        self.current = self.auto_detect_storage();
        info!("Storage: active backend {}", self.current_storage_name());
        StatusCode::Ok
    }

    /// The single automatic-failover point: if the active backend has gone
    /// not-ready, re-detect and switch.
    fn update(&mut self) -> StatusCode {
        if !self.initialized {
            return StatusCode::NotInitialized;
        }

        let current = self.current;
        if !self.plugin_mut(current).is_ready() {
            let detected = self.auto_detect_storage();
            if detected != self.current {
                warn!("Storage: backend lost, failing over");
                self.current = detected;
                info!("Storage: active backend now {}", self.current_storage_name());
            }
        }

        StatusCode::Ok
    }

    fn status(&self) -> StatusCode {
        if !self.initialized {
            return StatusCode::NotInitialized;
        }
        StatusCode::Ok
    }

    fn name(&self) -> &'static str {
        "Storage"
    }

    fn validate(&self) -> bool {
        self.initialized
    }

    fn reset(&mut self) -> StatusCode {
        if self.initialized {
            self.stats = StorageStats::default();
            self.transfer_buf.fill(0);
            self.initialized = false;
        }
        Component::initialize(self)
    }

    fn memory_usage(&self) -> usize {
        core::mem::size_of::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use super::flash::FlashStorage;
    use super::flash::mock::MockFlash;
    use super::media::MediaStorage;
    use super::media::mock::{MockDetect, RamVolume};
    use super::stream::StreamStorage;
    use super::stream::mock::VecSink;
    use super::*;

    type TestCoordinator = StorageCoordinator<
        FlashStorage<MockFlash>,
        MediaStorage<RamVolume, MockDetect>,
        StreamStorage<VecSink>,
    >;

    fn build(card_present: bool, flash_present: bool) -> TestCoordinator {
        let mut device = MockFlash::new(16);
        if !flash_present {
            device.jedec = 0x000000;
        }
        let flash = FlashStorage::new(device);
        let media = MediaStorage::new(
            RamVolume::new(4 * 1024 * 1024),
            MockDetect {
                present: card_present,
                protected: false,
            },
        );
        let stream = StreamStorage::new(VecSink::default());

        let mut coordinator = StorageCoordinator::new(flash, media, stream);
        assert_eq!(Component::initialize(&mut coordinator), StatusCode::Ok);
        coordinator
    }

    #[test]
    fn filename_policy() {
        assert!(is_valid_filename("cap_0001.bin"));
        assert!(is_valid_filename("A.B"));
        assert!(is_valid_filename("x"));

        assert!(!is_valid_filename(""));
        assert!(!is_valid_filename("toolongname12.bin"));
        assert!(!is_valid_filename("a/b.bin"));
        assert!(!is_valid_filename("a\\b.bin"));
        assert!(!is_valid_filename("a:b"));
        assert!(!is_valid_filename("a*b"));
        assert!(!is_valid_filename("a?b"));
        assert!(!is_valid_filename("a\"b"));
        assert!(!is_valid_filename("a<b"));
        assert!(!is_valid_filename("a>b"));
        assert!(!is_valid_filename("a|b"));
        assert!(!is_valid_filename("a\tb"));
        assert!(!is_valid_filename("caf\u{e9}.bin"));
    }

    #[test]
    fn auto_detect_priority_order() {
        let all = build(true, true);
        assert_eq!(all.current_storage(), StorageKind::Media);

        let no_card = build(false, true);
        assert_eq!(no_card.current_storage(), StorageKind::Flash);

        let mut nothing = build(false, false);
        assert_eq!(nothing.current_storage(), StorageKind::Stream);
        // The stream backend is the guaranteed fallback.
        assert!(nothing.is_storage_ready());
    }

    #[test]
    fn failover_is_single_step_and_idempotent() {
        let mut coordinator = build(true, true);
        assert_eq!(coordinator.current_storage(), StorageKind::Media);

        // Eject the card: exactly one update() switches to flash.
        coordinator.media_mut().detect_mut().present = false;
        assert_eq!(coordinator.update(), StatusCode::Ok);
        assert_eq!(coordinator.current_storage(), StorageKind::Flash);

        // A second update with no state change leaves the selection alone.
        assert_eq!(coordinator.update(), StatusCode::Ok);
        assert_eq!(coordinator.current_storage(), StorageKind::Flash);

        // Re-inserting the card does not trigger a switch - the active
        // backend is still healthy, and update() only reacts to loss.
        coordinator.media_mut().detect_mut().present = true;
        assert_eq!(coordinator.update(), StatusCode::Ok);
        assert_eq!(coordinator.current_storage(), StorageKind::Flash);
    }

    #[test]
    fn set_storage_type_requires_ready() {
        let mut coordinator = build(false, true);
        assert_eq!(coordinator.current_storage(), StorageKind::Flash);

        // Media has no card - switching to it must fail and not change the
        // selection.
        assert!(!coordinator.set_storage_type(StorageKind::Media));
        assert_eq!(coordinator.current_storage(), StorageKind::Flash);

        assert!(coordinator.set_storage_type(StorageKind::Stream));
        assert_eq!(coordinator.current_storage(), StorageKind::Stream);
    }

    #[test]
    fn write_validates_name_once_for_all_backends() {
        let mut coordinator = build(true, true);
        assert_eq!(coordinator.write_file("bad/name", &[1, 2]), 0);
        assert_eq!(coordinator.write_file("waytoolong.name", &[1, 2]), 0);
        assert_eq!(coordinator.write_file("", &[1, 2]), 0);
        assert_eq!(coordinator.write_file("ok.bin", &[]), 0);
        assert_eq!(coordinator.statistics(), StorageStats::default());
    }

    #[test]
    fn round_trip_and_statistics() {
        let mut coordinator = build(true, true);
        let data: Vec<u8> = (0..100u8).collect();

        assert_eq!(coordinator.write_file("cap.bin", &data), 100);
        let mut buf = [0u8; 128];
        assert_eq!(coordinator.read_file("cap.bin", &mut buf), 100);
        assert_eq!(&buf[..100], &data[..]);

        let stats = coordinator.statistics();
        assert_eq!(stats.files_written, 1);
        assert_eq!(stats.bytes_written, 100);
        assert_eq!(stats.files_read, 1);
        assert_eq!(stats.bytes_read, 100);

        // Failures must not move the counters.
        assert_eq!(coordinator.read_file("absent.bin", &mut buf), 0);
        assert_eq!(coordinator.statistics().files_read, 1);

        assert!(coordinator.delete_file("cap.bin"));
        assert!(!coordinator.file_exists("cap.bin"));
    }

    #[test]
    fn auto_names_are_sequential_and_bounded() {
        let mut coordinator = build(true, true);
        let mut name = FileName::new();

        assert_eq!(
            coordinator.write_file_auto("cap", ".bin", &[1, 2, 3], Some(&mut name)),
            3
        );
        assert_eq!(name.as_str(), "cap_0001.bin");

        assert_eq!(
            coordinator.write_file_auto("cap", ".bin", &[4], Some(&mut name)),
            1
        );
        assert_eq!(name.as_str(), "cap_0002.bin");

        // A prefix that cannot fit the name budget is rejected outright.
        assert_eq!(
            coordinator.write_file_auto("toolongprefix", ".bin", &[1], None),
            0
        );
    }

    #[test]
    fn copy_between_backends() {
        let mut coordinator = build(true, true);
        let data: Vec<u8> = (0..200u8).collect();

        // Write to flash, copy to media, verify on media.
        assert!(coordinator.set_storage_type(StorageKind::Flash));
        assert_eq!(coordinator.write_file("cap.bin", &data), 200);
        assert!(coordinator.copy_file("cap.bin", StorageKind::Flash, StorageKind::Media));

        assert!(coordinator.set_storage_type(StorageKind::Media));
        let mut buf = [0u8; 256];
        assert_eq!(coordinator.read_file("cap.bin", &mut buf), 200);
        assert_eq!(&buf[..200], &data[..]);
    }

    #[test]
    fn copy_rejections() {
        let mut coordinator = build(true, true);
        assert!(coordinator.set_storage_type(StorageKind::Flash));
        assert_eq!(coordinator.write_file("cap.bin", &[1, 2, 3]), 3);

        // Same source and destination.
        assert!(!coordinator.copy_file("cap.bin", StorageKind::Flash, StorageKind::Flash));
        // Absent source file.
        assert!(!coordinator.copy_file("no.bin", StorageKind::Flash, StorageKind::Media));
        // Source backend not ready.
        coordinator.media_mut().detect_mut().present = false;
        assert!(!coordinator.copy_file("cap.bin", StorageKind::Flash, StorageKind::Media));
        coordinator.media_mut().detect_mut().present = true;

        // Larger than the shared scratch buffer.
        let big = vec![0x55u8; TRANSFER_BUFFER_SIZE + 1];
        assert_eq!(coordinator.write_file("big.bin", &big), big.len());
        assert!(!coordinator.copy_file("big.bin", StorageKind::Flash, StorageKind::Media));

        // Exactly the buffer size is allowed.
        let fits = vec![0x66u8; TRANSFER_BUFFER_SIZE];
        assert_eq!(coordinator.write_file("fits.bin", &fits), fits.len());
        assert!(coordinator.copy_file("fits.bin", StorageKind::Flash, StorageKind::Media));
    }

    #[test]
    fn test_write_passes_on_file_backends() {
        let mut coordinator = build(true, true);

        assert!(coordinator.set_storage_type(StorageKind::Media));
        assert!(coordinator.test_write());
        assert!(!coordinator.file_exists("test.dat"));

        assert!(coordinator.set_storage_type(StorageKind::Flash));
        assert!(coordinator.test_write());
        assert!(!coordinator.file_exists("test.dat"));
    }

    #[test]
    fn test_write_fails_on_write_only_backend() {
        let mut coordinator = build(false, false);
        assert_eq!(coordinator.current_storage(), StorageKind::Stream);
        // The stream backend cannot read back, so the probe must fail -
        // honestly reporting that round trips are impossible there.
        assert!(!coordinator.test_write());
    }

    #[test]
    fn storage_space_and_status_route_to_active() {
        let mut coordinator = build(false, true);
        assert_eq!(coordinator.current_storage(), StorageKind::Flash);

        let (available, total) = coordinator.storage_space();
        assert!(total > 0);
        assert!(available <= total);

        let mut line = StatusLine::new();
        assert!(coordinator.storage_status(&mut line));
        assert!(line.as_str().starts_with("Flash:"));
    }

    #[test]
    fn validate_all_ignores_absent_backends() {
        let mut coordinator = build(false, true);
        assert!(coordinator.validate_all());
    }

    #[test]
    fn reset_clears_statistics() {
        let mut coordinator = build(true, true);
        assert_eq!(coordinator.write_file("a.bin", &[1, 2]), 2);
        assert_ne!(coordinator.statistics(), StorageStats::default());

        assert_eq!(coordinator.reset(), StatusCode::Ok);
        assert_eq!(coordinator.statistics(), StorageStats::default());
        assert!(Component::validate(&coordinator));
    }
}
