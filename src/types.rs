//! This module contains general types shared across the pico1284 firmware.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use bitflags::bitflags;

use crate::constants::MAX_FILENAME_LEN;

/// A filename, bounded at the 8.3 length every backend can store.
pub type FileName = heapless::String<MAX_FILENAME_LEN>;

/// A one-line human readable status summary, as produced by each storage
/// backend for the debug shell and display.
pub type StatusLine = heapless::String<64>;

/// Component status, as reported by the lifecycle interface.  These are the
/// only values the external supervisor acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StatusCode {
    /// Component is operating normally.
    Ok,

    /// Component hit an error it could not clear itself.
    Error,

    /// Component has not been initialized yet.
    NotInitialized,

    /// Component is busy with a long-running operation.
    Busy,

    /// Component timed out talking to its hardware.
    Timeout,
}

/// The three storage backend kinds.  This is a closed set - backends are not
/// loaded dynamically - so routing is a match, not a registry lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageKind {
    /// Removable FAT media (SD card).  Preferred when present.
    Media,

    /// On-board SPI NOR flash with the flat filesystem.
    Flash,

    /// Hex-over-serial streaming.  Always available; the fallback.
    Stream,
}

bitflags! {
    /// Snapshot of the parallel port control line states, as seen by the
    /// debug shell.  BUSY is the logical flow-control state; ACK and ERROR
    /// are read back from the pins (both active-low on the wire).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortStatus: u8 {
        const BUSY = 0x01;
        const ACK = 0x02;
        const ERROR = 0x04;
    }
}

/// The lifecycle interface every major component exposes.  The supervisor
/// that sequences startup and runs periodic health checks lives outside this
/// crate; it is handed a context of components wired up in task.rs and
/// drives them through this trait.
pub trait Component {
    /// Bring the component up.  Idempotent; failures are reported, never
    /// panicked.
    fn initialize(&mut self) -> StatusCode;

    /// Periodic housekeeping from the main loop.
    fn update(&mut self) -> StatusCode;

    /// Cheap health check.
    fn status(&self) -> StatusCode;

    /// Component name for logs and the debug shell.
    fn name(&self) -> &'static str;

    /// Structural self-check - deeper than status(), still non-destructive.
    fn validate(&self) -> bool;

    /// Tear down and re-initialize.
    fn reset(&mut self) -> StatusCode;

    /// Approximate RAM footprint, for the memory monitor.
    fn memory_usage(&self) -> usize;
}

/// Sink for operator-facing messages.  The character display and its
/// rendering live outside this crate; the core only needs somewhere to
/// surface overflow and write-failure conditions.
pub trait DisplaySink {
    /// Show a two-line transient message.
    fn display_message(&mut self, line1: &str, line2: &str);

    /// Show an error with a numeric code.
    fn display_error(&mut self, message: &str, code: u8);
}

/// A sink that drops everything, for headless operation.
pub struct NullDisplay;

impl DisplaySink for NullDisplay {
    fn display_message(&mut self, _line1: &str, _line2: &str) {}

    fn display_error(&mut self, _message: &str, _code: u8) {}
}
