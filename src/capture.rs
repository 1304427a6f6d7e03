//! This file implements the IEEE-1284 compatibility-mode capture driver.
//!
//! The source device (the oscilloscope) drives the port exactly as it would
//! a printer: it places a byte on the eight data lines and pulses /STROBE
//! low.  On that edge we must assert BUSY, sample the data lines once they
//! have settled, queue the byte, pulse /ACK, and release BUSY - all inside
//! the source's turnaround window.  There is no software recovery for
//! missing that window; the budget is enforced structurally by the
//! const_assert in constants.rs.
//!
//! The driver splits in two:
//! - [`CaptureShared`] - the ring buffer, statistics and control flags, all
//!   atomics, shared between the strobe service context and the main loop.
//! - [`CaptureDriver`] - owns the bus pins and runs the per-byte state
//!   machine from the strobe service context.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::Instant;
use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::buffer::RingBuffer;
use crate::constants::{ACK_PULSE_WIDTH_US, HARDWARE_SETTLE_US, RING_BUFFER_SIZE};
use crate::types::{Component, PortStatus, StatusCode};
use crate::util::time::block_us;

/// The physical parallel port, as the capture driver sees it.
///
/// Implementations speak logical levels; any active-low inversion (ACK and
/// ERROR are active-low on the wire) is the implementation's concern.  The
/// hardware implementation lives in infra::gpio; tests use a mock.
pub trait LptBus {
    /// Sample all eight data lines into one byte, D0 in bit 0.  Must be a
    /// single read of stable lines - it is only called after the settle
    /// delay.
    fn read_data(&mut self) -> u8;

    /// Drive BUSY active ("not ready - hold your data").
    fn set_busy(&mut self);

    /// Release BUSY ("ready for the next byte").
    fn release_busy(&mut self);

    /// Drive /ACK active (low on the wire).
    fn assert_ack(&mut self);

    /// Return /ACK to its inactive (high) state.
    fn release_ack(&mut self);

    /// Drive /ERROR active (low on the wire).
    fn set_error(&mut self);

    /// Return /ERROR to its inactive (high) state.
    fn clear_error(&mut self);

    /// Drive the fixed "ready printer" states: SELECT asserted, PAPER-OUT
    /// deasserted.  Called once at initialization.
    fn set_ready_states(&mut self);

    /// Current logical state of the strobe line (true = active/low).
    fn strobe(&mut self) -> bool;

    /// Read back the BUSY line.
    fn busy(&mut self) -> bool;

    /// Read back the /ACK line (true = active/low).
    fn ack(&mut self) -> bool;

    /// Read back the /ERROR line (true = active/low).
    fn error(&mut self) -> bool;
}

/// Capture statistics.  Counters are mutated only from the strobe service
/// context; the reset operations are only called from the main loop with
/// capture disabled, so plain atomic stores suffice.
#[derive(Debug)]
pub struct CaptureStats {
    bytes_received: AtomicU32,
    overflow_count: AtomicU32,
    total_interrupts: AtomicU32,
    max_service_us: AtomicU32,
    avg_service_us: AtomicU32,
    last_service_us: AtomicU64,
}

impl CaptureStats {
    const fn new() -> Self {
        Self {
            bytes_received: AtomicU32::new(0),
            overflow_count: AtomicU32::new(0),
            total_interrupts: AtomicU32::new(0),
            max_service_us: AtomicU32::new(0),
            avg_service_us: AtomicU32::new(0),
            last_service_us: AtomicU64::new(0),
        }
    }

    fn reset(&self) {
        self.bytes_received.store(0, Ordering::Relaxed);
        self.overflow_count.store(0, Ordering::Relaxed);
        self.total_interrupts.store(0, Ordering::Relaxed);
        self.max_service_us.store(0, Ordering::Relaxed);
        self.avg_service_us.store(0, Ordering::Relaxed);
        self.last_service_us.store(0, Ordering::Relaxed);
    }

    /// Record one service routine execution time.  Max is a running
    /// maximum; avg is the simple exponential blend the debug shell
    /// expects.
    fn record_service_time(&self, micros: u32) {
        let max = self.max_service_us.load(Ordering::Relaxed);
        if micros > max {
            self.max_service_us.store(micros, Ordering::Relaxed);
        }
        let avg = self.avg_service_us.load(Ordering::Relaxed);
        self.avg_service_us
            .store((avg + micros) / 2, Ordering::Relaxed);
    }
}

/// State shared between the strobe service context (producer) and the main
/// loop (consumer): the ring buffer, the statistics block and the capture
/// enable flag.  Const-constructible so it can live in a `static`.
pub struct CaptureShared {
    ring: RingBuffer<RING_BUFFER_SIZE>,
    stats: CaptureStats,
    capture_enabled: AtomicBool,
}

impl CaptureShared {
    pub const fn new() -> Self {
        Self {
            ring: RingBuffer::new(),
            stats: CaptureStats::new(),
            capture_enabled: AtomicBool::new(false),
        }
    }

    /// Enable or disable capture.  When disabled the strobe service routine
    /// returns immediately without touching BUSY or ACK, so the source sees
    /// a port that is simply not ready.
    pub fn set_capture_enabled(&self, enabled: bool) {
        self.capture_enabled.store(enabled, Ordering::Release);
        info!("Capture {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_capture_enabled(&self) -> bool {
        self.capture_enabled.load(Ordering::Acquire)
    }

    /// Number of captured bytes waiting in the ring buffer.
    pub fn available_bytes(&self) -> usize {
        self.ring.available()
    }

    /// Drain captured bytes into `dest`, in strict arrival order.  Main
    /// loop only.  Returns the number of bytes copied.
    pub fn read_data(&self, dest: &mut [u8]) -> usize {
        self.ring.read_bytes(dest)
    }

    /// Look at the next captured byte without consuming it.
    pub fn peek_data(&self, data: &mut u8) -> bool {
        self.ring.peek(data)
    }

    /// Discard all buffered data.  Main loop only.
    pub fn clear_buffer(&self) {
        self.ring.clear();
        debug!("Capture buffer cleared");
    }

    pub fn buffer_utilization(&self) -> u8 {
        self.ring.utilization()
    }

    pub fn has_buffer_overflow(&self) -> bool {
        self.ring.has_overflow()
    }

    pub fn clear_buffer_overflow(&self) {
        self.ring.clear_overflow();
    }

    pub fn total_bytes_received(&self) -> u32 {
        self.stats.bytes_received.load(Ordering::Relaxed)
    }

    pub fn overflow_count(&self) -> u32 {
        self.stats.overflow_count.load(Ordering::Relaxed)
    }

    /// (total services, max service time us, average service time us).
    pub fn interrupt_stats(&self) -> (u32, u32, u32) {
        (
            self.stats.total_interrupts.load(Ordering::Relaxed),
            self.stats.max_service_us.load(Ordering::Relaxed),
            self.stats.avg_service_us.load(Ordering::Relaxed),
        )
    }

    /// Timestamp (us since boot) of the most recent strobe service.
    pub fn last_service_timestamp(&self) -> u64 {
        self.stats.last_service_us.load(Ordering::Relaxed)
    }

    /// Reset all statistics.  Only call with capture disabled.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }
}

impl Default for CaptureShared {
    fn default() -> Self {
        Self::new()
    }
}

/// The strobe-driven capture state machine.  Owns the bus pins; runs from
/// the strobe service context on the capture core.
pub struct CaptureDriver<B: LptBus> {
    bus: B,
    shared: &'static CaptureShared,
    initialized: bool,
    error_state: bool,
    busy_asserted: AtomicBool,
}

impl<B: LptBus> CaptureDriver<B> {
    pub fn new(bus: B, shared: &'static CaptureShared) -> Self {
        Self {
            bus,
            shared,
            initialized: false,
            error_state: false,
            busy_asserted: AtomicBool::new(false),
        }
    }

    /// The shared half, for handing to the main loop.
    pub fn shared(&self) -> &'static CaptureShared {
        self.shared
    }

    /// Direct access to the bus, for the strobe-edge wait on hardware.
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Drive all output lines to their idle "ready printer" states.
    fn init_lines(&mut self) {
        self.bus.release_busy();
        self.bus.release_ack();
        self.bus.clear_error();
        self.bus.set_ready_states();
        self.busy_asserted.store(false, Ordering::Relaxed);
    }

    /// Service one strobe edge.
    ///
    /// This is the hard real-time path.  The step order matters: BUSY must
    /// go active before anything else so the source holds its data, and the
    /// data lines are only sampled after the settle delay.  A full ring
    /// buffer drops the byte and counts it - the capture path never blocks
    /// and never retries.
    pub fn service_strobe(&mut self) {
        let start = Instant::now();

        if !self.shared.is_capture_enabled() || !self.initialized {
            return;
        }

        // Tell the source to hold - before anything else.
        self.bus.set_busy();
        self.busy_asserted.store(true, Ordering::Relaxed);

        // Let the data lines settle, then sample all eight at once.
        block_us!(HARDWARE_SETTLE_US);
        let data = self.bus.read_data();

        // Queue the byte.  On overflow the byte is gone; the main loop
        // notices the rising counter and warns the operator.
        if self.shared.ring.write(data) {
            self.shared
                .stats
                .bytes_received
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.shared
                .stats
                .overflow_count
                .fetch_add(1, Ordering::Relaxed);
        }

        // Acknowledge receipt: /ACK low pulse of the width the scope needs.
        self.bus.assert_ack();
        block_us!(ACK_PULSE_WIDTH_US);
        self.bus.release_ack();

        // Ready for the next byte.
        self.bus.release_busy();
        self.busy_asserted.store(false, Ordering::Relaxed);

        self.shared
            .stats
            .total_interrupts
            .fetch_add(1, Ordering::Relaxed);
        let end = Instant::now();
        self.shared
            .stats
            .record_service_time((end - start).as_micros() as u32);
        self.shared
            .stats
            .last_service_us
            .store(end.as_micros(), Ordering::Relaxed);
    }

    /// Drive or clear the /ERROR line.  Reflected in component status.
    pub fn set_error_state(&mut self, error: bool) {
        self.error_state = error;
        if error {
            self.bus.set_error();
        } else {
            self.bus.clear_error();
        }
    }

    pub fn error_state(&self) -> bool {
        self.error_state
    }

    /// Snapshot of the port control lines for the debug shell.
    pub fn port_status(&mut self) -> PortStatus {
        let mut status = PortStatus::empty();
        if self.busy_asserted.load(Ordering::Relaxed) {
            status |= PortStatus::BUSY;
        }
        if self.bus.ack() {
            status |= PortStatus::ACK;
        }
        if self.bus.error() {
            status |= PortStatus::ERROR;
        }
        status
    }

    /// Toggle each output control line and read it back.  Part of the
    /// hardware self-test; only run with capture disabled.
    pub fn test_protocol_signals(&mut self) -> bool {
        if !self.initialized {
            return false;
        }

        debug!("Testing port control signals");

        self.bus.set_busy();
        block_us!(HARDWARE_SETTLE_US);
        let busy_high = self.bus.busy();
        self.bus.release_busy();
        block_us!(HARDWARE_SETTLE_US);
        let busy_low = !self.bus.busy();

        self.bus.assert_ack();
        block_us!(ACK_PULSE_WIDTH_US);
        let ack_low = self.bus.ack();
        self.bus.release_ack();
        block_us!(HARDWARE_SETTLE_US);
        let ack_high = !self.bus.ack();

        self.bus.set_error();
        block_us!(HARDWARE_SETTLE_US);
        let error_low = self.bus.error();
        self.bus.clear_error();
        block_us!(HARDWARE_SETTLE_US);
        let error_high = !self.bus.error();

        let passed = busy_high && busy_low && ack_low && ack_high && error_low && error_high;
        info!("Signal test {}", if passed { "PASSED" } else { "FAILED" });
        passed
    }

    /// Timed diagnostic: count strobe services over `duration`.  Useful for
    /// checking the scope is actually driving the port.
    pub async fn count_services(&self, duration: embassy_time::Duration) -> u32 {
        let start = self.shared.stats.total_interrupts.load(Ordering::Relaxed);
        embassy_time::Timer::after(duration).await;
        let end = self.shared.stats.total_interrupts.load(Ordering::Relaxed);
        end - start
    }
}

impl<B: LptBus> Component for CaptureDriver<B> {
    fn initialize(&mut self) -> StatusCode {
        if self.initialized {
            return StatusCode::Ok;
        }

        self.init_lines();
        self.shared.ring.clear();
        self.shared.stats.reset();
        self.initialized = true;
        self.shared.set_capture_enabled(true);

        info!("Capture driver initialized");
        StatusCode::Ok
    }

    fn update(&mut self) -> StatusCode {
        if !self.initialized {
            return StatusCode::NotInitialized;
        }
        StatusCode::Ok
    }

    fn status(&self) -> StatusCode {
        if !self.initialized {
            return StatusCode::NotInitialized;
        }
        if self.error_state || self.shared.ring.has_overflow() {
            return StatusCode::Error;
        }
        StatusCode::Ok
    }

    fn name(&self) -> &'static str {
        "Capture"
    }

    fn validate(&self) -> bool {
        self.initialized && !self.error_state
    }

    fn reset(&mut self) -> StatusCode {
        if self.initialized {
            self.shared.set_capture_enabled(false);
            self.shared.ring.clear();
            self.shared.stats.reset();
            self.error_state = false;
            self.initialized = false;
        }
        self.initialize()
    }

    fn memory_usage(&self) -> usize {
        core::mem::size_of::<Self>() + core::mem::size_of::<CaptureShared>()
    }
}
