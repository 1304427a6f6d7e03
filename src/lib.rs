//! pico1284
//!
//! This implements an IEEE-1284 parallel port capture bridge.  A benchtop
//! oscilloscope streams hardcopy data at the device as if it were a printer;
//! the firmware captures each strobed byte, buffers it, and persists it to
//! one of three interchangeable storage backends - a flat filesystem on SPI
//! NOR flash, a FAT volume on removable media, or a hex stream over the
//! serial console.
//!
//! The capture path is hard real-time: the strobe handler must assert BUSY,
//! sample the bus, enqueue the byte and pulse ACK inside the source device's
//! turnaround window.  Everything downstream of the ring buffer is ordinary
//! cooperative code.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#![cfg_attr(not(test), no_std)]

// Provide some feature guidance when compiling the firmware.
#[cfg(all(feature = "pico", feature = "pico2"))]
compile_error!("Features 'pico' and 'pico2' cannot be enabled simultaneously");
#[cfg(all(feature = "hardware", not(any(feature = "pico", feature = "pico2"))))]
compile_error!("Either 'pico' or 'pico2' feature must be enabled to build firmware");

// Declare all of this library's modules.
#[macro_use]
mod fmt;

pub mod buffer;
pub mod capture;
pub mod constants;
pub mod storage;
pub mod types;
pub mod util;

#[cfg(feature = "hardware")]
mod infra;
#[cfg(feature = "hardware")]
pub mod task;

// Extra binary information that picotool can read.
#[cfg(feature = "hardware")]
#[unsafe(link_section = ".bi_entries")]
#[used]
pub static PICOTOOL_ENTRIES: [embassy_rp::binary_info::EntryAddr; 4] = [
    embassy_rp::binary_info::rp_program_name!(c"pico1284 by piers.rocks"),
    embassy_rp::binary_info::rp_program_description!(
        c"An IEEE-1284 parallel port capture bridge: pretends to be a printer, captures oscilloscope hardcopy data, and stores it to SPI NOR flash, SD card or a serial hex stream."
    ),
    embassy_rp::binary_info::rp_cargo_version!(),
    embassy_rp::binary_info::rp_program_build_attribute!(),
];

// A note about Statics
//
// The hardware build keeps its long-lived objects in statics, primarily so
// they can be shared between the capture context (core 1) and the main loop
// (core 0), and so tasks can be spawned against them.
//
// - The ring buffer and capture statistics live in a const-initialized
//   CaptureShared static.  Every field is an atomic, so no Mutex is needed -
//   the SPSC discipline (producer writes head, consumer writes tail) is the
//   synchronization.
//
// - Objects that cannot be initialized at compile time (the storage
//   coordinator, the capture driver) go through StaticCell, and ownership is
//   passed into the task that runs them.  Each task owns its objects
//   outright, so no cross-task mutex is needed anywhere.
//
// The statics are stored in the module that creates them - see task.rs.
