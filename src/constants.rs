//! This module contains constants for the pico1284 capture bridge.
//!
//! Timing constants on the capture path are part of the IEEE-1284
//! compatibility-mode contract with the source device and must not be
//! changed casually - the const_assert at the bottom of this file polices
//! the overall service budget.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::Duration;
use static_assertions::const_assert;

//
// Capture path
//

/// Ring buffer capacity in bytes.  The scope bursts a full hardcopy at bus
/// speed; the drain loop empties the buffer every few milliseconds, so this
/// needs to cover one drain interval at the peak byte rate.
pub const RING_BUFFER_SIZE: usize = 2048;

/// Settle time between asserting BUSY and sampling the data lines.  The data
/// lines are guaranteed stable this long after the strobe edge.
pub const HARDWARE_SETTLE_US: u64 = 5;

/// Width of the ACK low pulse.  The TDS-series scopes need a pulse of at
/// least 10us to register the acknowledge; 20us matches the original
/// hardware this replaces.
pub const ACK_PULSE_WIDTH_US: u64 = 20;

/// Fixed overhead allowance for the non-delay steps of the strobe service
/// routine (pin writes, one ring buffer store, statistics update).
pub const SERVICE_OVERHEAD_MARGIN_US: u64 = 10;

/// Total service budget per captured byte.  The source device times out and
/// declares a protocol violation if BUSY stays asserted longer than this.
pub const SERVICE_BUDGET_US: u64 = 50;

// The service routine is a fixed number of fixed-cost steps; if the delay
// constants grow past the budget the build fails rather than the protocol.
const_assert!(HARDWARE_SETTLE_US + ACK_PULSE_WIDTH_US + SERVICE_OVERHEAD_MARGIN_US <= SERVICE_BUDGET_US);

//
// Storage
//

/// Maximum filename length, 8.3 style.  Validated once at the coordinator so
/// every backend only ever sees names the weakest backend can store.
pub const MAX_FILENAME_LEN: usize = 12;

/// Maximum number of directory entries in the flash filesystem.
pub const MAX_FILES: usize = 64;

/// Size of the coordinator's scratch buffer for cross-backend copies.  Copy
/// is all-in-memory; files larger than this are rejected.
pub const TRANSFER_BUFFER_SIZE: usize = 512;

/// How many bytes the main loop drains from the ring buffer per file write.
pub const DRAIN_CHUNK_SIZE: usize = 256;

/// SPI NOR flash geometry (W25Q128-class parts).
pub const FLASH_PAGE_SIZE: usize = 256;
pub const FLASH_SECTOR_SIZE: usize = 4096;

/// JEDEC ID the flash driver expects.  A different-but-responsive chip gets
/// a warning and a best-effort attempt to continue.
pub const FLASH_JEDEC_W25Q128: u32 = 0xEF4018;

/// How long to poll the flash status register for a program/erase to
/// complete.  Sector erase on these parts can take seconds.
pub const FLASH_PROGRAM_TIMEOUT: Duration = Duration::from_millis(1000);
pub const FLASH_ERASE_TIMEOUT: Duration = Duration::from_millis(5000);

//
// Streaming protocol
//

/// Data bytes per hex line on the streaming backend (64 hex characters).
pub const HEX_BYTES_PER_LINE: usize = 32;

/// A readability space is inserted after every this many bytes in a line.
pub const HEX_GROUP_SIZE: usize = 8;

/// A PROGRESS line is emitted every this many streamed bytes, when progress
/// reporting is enabled.
pub const STREAM_PROGRESS_INTERVAL: usize = 1024;

//
// Timers
//

/// How long the main loop pauses between drain passes.
pub const MAIN_LOOP_TIMER: Duration = Duration::from_millis(10);

/// How often the main loop re-checks backend readiness (the failover point).
pub const STORAGE_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// How often we aim to log from our primary loops to prove they are still
/// alive.
pub const LOOP_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Watchdog hardware timeout, and how often the runner checks tasks in.
pub const WATCHDOG_HW_TIMEOUT: Duration = Duration::from_secs(2);
pub const WATCHDOG_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// How often each policed task must feed the watchdog to prevent a reset.
pub const MAIN_LOOP_WATCHDOG_TIMER: Duration = Duration::from_secs(1);
pub const CAPTURE_WATCHDOG_TIMER: Duration = Duration::from_secs(1);

/// The capture task wakes at least this often to feed the watchdog when no
/// strobes are arriving.
pub const CAPTURE_FEED_TIMER: Duration = Duration::from_millis(100);

/// The size (in bytes) of the stack for core 1.
pub const CORE1_STACK_SIZE: usize = 4096;
