//! This file implements custom timing functions and macros used by pico1284.
//!
//! We have two choices for a delay:
//! * block_*() - blocks the current core for the duration indicated.  This
//!   is used where precise timing is critical - the settle and ACK pulse
//!   delays inside the strobe service routine.
//! * yield_*() - yields to the executor for the duration indicated.  Because
//!   the executor will schedule something else during the yield, the pause
//!   may be longer than requested.  Used everywhere timing is not critical.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::{Duration, Instant};

/// Function to block until a specific instant.
///
/// We always inline it to reduce function call/return overhead, as this is
/// typically used in timing critical functions
#[inline(always)]
pub fn block_until(expires: Instant) {
    while Instant::now() < expires {}
}

/// Function to block for a specific Duration.
///
/// We always inline it to reduce function call/return overhead, as this is
/// typically used in timing critical functions
#[inline(always)]
pub fn block_for(duration: Duration) {
    block_until(Instant::now() + duration);
}

/// Block for a specific number of microseconds.
macro_rules! block_us {
    ($us:expr) => {
        $crate::util::time::block_for(embassy_time::Duration::from_micros($us))
    };
}
pub(crate) use block_us;

/// Block for a specific number of milliseconds.
#[allow(unused_macros)]
macro_rules! block_ms {
    ($ms:expr) => {
        $crate::util::time::block_for(embassy_time::Duration::from_millis($ms))
    };
}
#[allow(unused_imports)]
pub(crate) use block_ms;

/// Macro which yields to the scheduler for at least the specified time.  As
/// embassy will only come back to us after whatever has been scheduled has
/// paused, it could be longer than specified.  If you need a more accurate
/// pause, considering using block_us! instead.
#[allow(unused_macros)]
macro_rules! yield_us {
    ($us:expr) => {
        embassy_time::Timer::after_micros($us).await
    };
}
#[allow(unused_imports)]
pub(crate) use yield_us;

/// Macro which yields to the scheduler for at least the specified time.  As
/// embassy will only come back to us after whatever has been scheduled has
/// paused, it could be longer than specified.  If you need a more accurate
/// pause, considering using block_ms! instead.
#[allow(unused_macros)]
macro_rules! yield_ms {
    ($ms:expr) => {
        embassy_time::Timer::after_millis($ms).await
    };
}
#[allow(unused_imports)]
pub(crate) use yield_ms;
