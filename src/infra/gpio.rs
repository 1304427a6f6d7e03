//! This file handles GPIO pin allocation.
//!
//! The source code serves as the master list of pin assignments for the
//! hardware.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_rp::gpio::{AnyPin, Input, Level, Output, Pull};

use crate::capture::LptBus;

/// GPIO configurations for the pico1284 hardware.
pub mod config {
    //! Pin assignments.  One SPI bus is shared between the NOR flash and
    //! the SD card socket, with separate chip selects, exactly like the
    //! board this firmware replaces.
    //!
    //! ```text
    //! GP0-GP7    LPT D0-D7 (inputs, pulled up)
    //! GP8        LPT /STROBE (input, falling-edge trigger)
    //! GP9        LPT /ACK (output, idle high)
    //! GP10       LPT BUSY (output, idle low)
    //! GP11       LPT PAPER-OUT (output, held low)
    //! GP12       LPT SELECT (output, held high)
    //! GP13       LPT /ERROR (output, idle high)
    //! GP14       LPT /AUTO-FEED (input, pulled up)
    //! GP15       LPT /INITIALIZE (input, pulled up)
    //! GP28       LPT /SELECT-IN (input, pulled up)
    //! GP16       SPI0 MISO
    //! GP17       NOR flash chip select
    //! GP18       SPI0 SCK
    //! GP19       SPI0 MOSI
    //! GP20       UART1 TX (hex stream / debug shell)
    //! GP21       UART1 RX
    //! GP22       SD card chip select
    //! GP26       SD card detect (input, active low)
    //! GP27       SD write protect (input, active high)
    //! GP25       activity LED (on-board)
    //! ```
}

/// The physical IEEE-1284 port: eight data inputs plus the control lines.
///
/// /ACK and /ERROR are active-low on the wire; this object exposes the
/// logical assert/release operations the capture driver speaks, and does
/// the inversion here.
pub struct LptPort {
    data: [Input<'static>; 8],
    strobe: Input<'static>,
    ack: Output<'static>,
    busy: Output<'static>,
    paper_out: Output<'static>,
    select: Output<'static>,
    error: Output<'static>,
    #[allow(dead_code)]
    auto_feed: Input<'static>,
    #[allow(dead_code)]
    initialize: Input<'static>,
    #[allow(dead_code)]
    select_in: Input<'static>,
}

impl LptPort {
    /// Build the port from degraded pins.  Outputs start in their idle
    /// states: /ACK high, BUSY low, /ERROR high, SELECT high, PAPER-OUT
    /// low.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data: [AnyPin; 8],
        strobe: AnyPin,
        ack: AnyPin,
        busy: AnyPin,
        paper_out: AnyPin,
        select: AnyPin,
        error: AnyPin,
        auto_feed: AnyPin,
        initialize: AnyPin,
        select_in: AnyPin,
    ) -> Self {
        Self {
            data: data.map(|pin| Input::new(pin, Pull::Up)),
            strobe: Input::new(strobe, Pull::Up),
            ack: Output::new(ack, Level::High),
            busy: Output::new(busy, Level::Low),
            paper_out: Output::new(paper_out, Level::Low),
            select: Output::new(select, Level::High),
            error: Output::new(error, Level::High),
            auto_feed: Input::new(auto_feed, Pull::Up),
            initialize: Input::new(initialize, Pull::Up),
            select_in: Input::new(select_in, Pull::Up),
        }
    }

    /// Wait for the next strobe falling edge.  The capture task parks here
    /// between bytes.
    pub async fn wait_strobe(&mut self) {
        self.strobe.wait_for_falling_edge().await;
    }
}

impl LptBus for LptPort {
    #[inline(always)]
    fn read_data(&mut self) -> u8 {
        let mut value = 0u8;
        for (bit, pin) in self.data.iter_mut().enumerate() {
            if pin.is_high() {
                value |= 1 << bit;
            }
        }
        value
    }

    #[inline(always)]
    fn set_busy(&mut self) {
        self.busy.set_high();
    }

    #[inline(always)]
    fn release_busy(&mut self) {
        self.busy.set_low();
    }

    #[inline(always)]
    fn assert_ack(&mut self) {
        self.ack.set_low();
    }

    #[inline(always)]
    fn release_ack(&mut self) {
        self.ack.set_high();
    }

    fn set_error(&mut self) {
        self.error.set_low();
    }

    fn clear_error(&mut self) {
        self.error.set_high();
    }

    fn set_ready_states(&mut self) {
        self.select.set_high();
        self.paper_out.set_low();
    }

    fn strobe(&mut self) -> bool {
        self.strobe.is_low()
    }

    fn busy(&mut self) -> bool {
        self.busy.is_set_high()
    }

    fn ack(&mut self) -> bool {
        self.ack.is_set_low()
    }

    fn error(&mut self) -> bool {
        self.error.is_set_low()
    }
}
