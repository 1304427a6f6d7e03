//! Hardware infrastructure: pin assignment and the watchdog.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

pub mod gpio;
pub mod watchdog;
