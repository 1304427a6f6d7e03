//! Implements task handling and the main scheduling loop, including dual
//! core support.
//!
//! Threading and tasks model
//!
//! On the Pico we have 2 cores available - 0 and 1.
//!
//! Core 0 is the main core, and is where the main() function runs.  We use
//! it for everything that is not timing critical:
//! - the watchdog task
//! - the main loop, which drains the capture buffer into storage, runs the
//!   storage failover check, and surfaces overflow warnings
//!
//! Core 1 runs exactly one task: the capture task, parked on the strobe
//! line.  Giving the capture path a whole core means the strobe service
//! routine is never delayed by storage writes, and the settle/ACK busy
//! waits burn core 1 cycles nobody else wants.
//!
//! Tasks can be spawned only on core 0 using the Spawner object passed into
//! main().  Core 1 tasks must be spawned via an Executor, which lives in a
//! static for lifetime reasons.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use core::cell::RefCell;

use embassy_executor::{Executor, Spawner};
use embassy_rp::gpio::{AnyPin, Input, Level, Output, Pull};
use embassy_rp::multicore::{Stack, spawn_core1 as rp_spawn_core1};
use embassy_rp::peripherals::{CORE1, SPI0};
use embassy_rp::spi::{Blocking, Spi};
use embassy_rp::uart::{Blocking as UartBlocking, Uart};
use embassy_time::{Delay, Instant, Timer, with_timeout};
use embedded_hal_bus::spi::RefCellDevice;
use embedded_sdmmc::SdCard;
use static_cell::{ConstStaticCell, StaticCell};

use crate::capture::{CaptureDriver, CaptureShared};
use crate::constants::{
    CAPTURE_FEED_TIMER, CAPTURE_WATCHDOG_TIMER, CORE1_STACK_SIZE, DRAIN_CHUNK_SIZE,
    LOOP_LOG_INTERVAL, MAIN_LOOP_TIMER, MAIN_LOOP_WATCHDOG_TIMER, STORAGE_UPDATE_INTERVAL,
};
use crate::infra::gpio::LptPort;
use crate::infra::watchdog::{TaskId, WatchdogType, create_watchdog, watchdog_task};
use crate::storage::StorageCoordinator;
use crate::storage::flash::FlashStorage;
use crate::storage::media::{FixedTimeSource, MediaStorage, SdmmcVolume, SocketPins};
use crate::storage::nor::SpiNorFlash;
use crate::storage::stream::StreamStorage;
use crate::types::{Component, DisplaySink, FileName, NullDisplay, StatusCode};

//
// Statics
//

/// The ring buffer and capture statistics, shared between the capture task
/// (core 1, producer) and the main loop (core 0, consumer).  Everything
/// inside is atomic; no mutex.
pub static CAPTURE_SHARED: CaptureShared = CaptureShared::new();

// The capture driver cannot be built at compile time (it owns pins), so it
// goes through a StaticCell and ownership passes to core 1.
static CAPTURE_DRIVER: StaticCell<CaptureDriver<LptPort>> = StaticCell::new();

// The shared SPI bus: NOR flash and the SD card socket hang off it with
// separate chip selects.
static SPI_BUS: StaticCell<RefCell<Spi<'static, SPI0, Blocking>>> = StaticCell::new();

// The storage coordinator, owned by the main loop task.
static COORDINATOR: StaticCell<Coordinator> = StaticCell::new();

// A stack for core 1.  We will take it and use it mutably in core1_spawn.
static CORE1_STACK: ConstStaticCell<Stack<CORE1_STACK_SIZE>> = ConstStaticCell::new(Stack::new());

// The operator display.  The real character display lives behind its own
// driver outside this crate; headless builds sink messages into nothing.
static DISPLAY: StaticCell<NullDisplay> = StaticCell::new();

// An executor for core 1.
static EXECUTOR1: StaticCell<Executor> = StaticCell::new();

/// The serial console as a byte sink for the streaming backend.
pub struct SerialSink {
    uart: Uart<'static, UartBlocking>,
}

impl embedded_io::ErrorType for SerialSink {
    type Error = embedded_io::ErrorKind;
}

impl embedded_io::Write for SerialSink {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.uart
            .blocking_write(buf)
            .map_err(|_| embedded_io::ErrorKind::Other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.uart
            .blocking_flush()
            .map_err(|_| embedded_io::ErrorKind::Other)
    }
}

type SpiDev = RefCellDevice<'static, Spi<'static, SPI0, Blocking>, Output<'static>, Delay>;

/// The concrete storage stack on this hardware.
pub type Coordinator = StorageCoordinator<
    FlashStorage<SpiNorFlash<SpiDev>>,
    MediaStorage<SdmmcVolume<SdCard<SpiDev, Delay>, FixedTimeSource>, SocketPins<Input<'static>, Input<'static>>>,
    StreamStorage<SerialSink>,
>;

/// Method to spawn tasks.  Can be called on either core.
///
/// Using the Spawner object to spawn can fail, because too many instances
/// of that task are already running.  We handle that by panicking into the
/// watchdog reset - it shouldn't happen if tasks are only spawned at start
/// of day.
pub fn spawn_or_reboot<T, E: core::fmt::Debug>(spawn_result: Result<T, E>, task_name: &str) {
    if spawn_result.is_err() {
        defmt::panic!("Failed to spawn task: {}", task_name);
    }
    debug!("Spawned task {}", task_name);
}

// We're going to spawn a task on core 1.  This requires an executor, which
// needs to live for infinity, hence the statics above.
fn core1_spawn(
    p_core1: CORE1,
    driver: &'static mut CaptureDriver<LptPort>,
    watchdog: &'static WatchdogType,
) {
    rp_spawn_core1(p_core1, CORE1_STACK.take(), move || {
        let executor1 = EXECUTOR1.init(Executor::new());
        executor1.run(|spawner| {
            spawn_or_reboot(spawner.spawn(capture_task(driver, watchdog)), "Capture");
        })
    });
}

/// The capture task: parks on the strobe line, services each edge, and
/// feeds the watchdog in the gaps.
#[embassy_executor::task]
async fn capture_task(
    driver: &'static mut CaptureDriver<LptPort>,
    watchdog: &'static WatchdogType,
) -> ! {
    let core: u32 = embassy_rp::pac::SIO.cpuid().read();
    info!("Core{}: capture task started", core);

    watchdog.register_task(&TaskId::Capture, CAPTURE_WATCHDOG_TIMER).await;

    loop {
        // Wake at least every CAPTURE_FEED_TIMER so an idle bus does not
        // starve the watchdog.
        if with_timeout(CAPTURE_FEED_TIMER, driver.bus_mut().wait_strobe())
            .await
            .is_ok()
        {
            driver.service_strobe();
        }
        watchdog.feed(&TaskId::Capture).await;
    }
}

/// The main scheduling loop: drain captured data into storage, run the
/// storage failover check, surface overflow, blink the activity LED.
#[embassy_executor::task]
async fn main_loop_task(
    coordinator: &'static mut Coordinator,
    watchdog: &'static WatchdogType,
    display: &'static mut (dyn DisplaySink + Send),
    mut activity_led: Output<'static>,
) -> ! {
    let core: u32 = embassy_rp::pac::SIO.cpuid().read();
    info!("Core{}: main loop started", core);

    watchdog.register_task(&TaskId::MainLoop, MAIN_LOOP_WATCHDOG_TIMER).await;

    let mut drain_buf = [0u8; DRAIN_CHUNK_SIZE];
    let mut last_storage_update = Instant::now();
    let mut last_log = Instant::now();

    loop {
        watchdog.feed(&TaskId::MainLoop).await;

        // Drain captured bytes into a numbered capture file.
        let available = CAPTURE_SHARED.available_bytes();
        if available > 0 {
            activity_led.set_high();
            let count = CAPTURE_SHARED.read_data(&mut drain_buf);
            if count > 0 {
                let mut name = FileName::new();
                let written =
                    coordinator.write_file_auto("cap", ".bin", &drain_buf[..count], Some(&mut name));
                if written == count {
                    info!("Captured {} bytes to {}", count, name.as_str());
                    display.display_message("Data captured", name.as_str());
                } else {
                    warn!("Capture write failed ({} of {} bytes)", written, count);
                    display.display_error("Write failed", 0);
                }
            }
        } else {
            activity_led.set_low();
        }

        // Overflow is statistical, not fatal - but the operator should
        // know about it.
        if CAPTURE_SHARED.has_buffer_overflow() {
            warn!(
                "Capture buffer overflow ({} bytes dropped so far)",
                CAPTURE_SHARED.overflow_count()
            );
            display.display_error("Buffer overflow", 0);
            CAPTURE_SHARED.clear_buffer_overflow();
        }

        // The one automatic failover point: re-check the active backend.
        if last_storage_update.elapsed() >= STORAGE_UPDATE_INTERVAL {
            if coordinator.update() != StatusCode::Ok {
                warn!("Storage update failed");
            }
            last_storage_update = Instant::now();
        }

        // Prove we are alive.
        if last_log.elapsed() >= LOOP_LOG_INTERVAL {
            let (total, max, avg) = CAPTURE_SHARED.interrupt_stats();
            debug!(
                "Alive: {} strobes, {}us max, {}us avg, buffer {}%",
                total,
                max,
                avg,
                CAPTURE_SHARED.buffer_utilization()
            );
            last_log = Instant::now();
        }

        Timer::after(MAIN_LOOP_TIMER).await;
    }
}

/// Common main, called from the firmware binary.  Brings up the hardware,
/// wires the components together, and spawns everything.
pub async fn common_main(spawner: Spawner, bin_name: &str) -> ! {
    info!("{} starting", bin_name);

    let p = embassy_rp::init(Default::default());

    // Watchdog first, so a hang anywhere past this point resets us.
    let watchdog = create_watchdog(p.WATCHDOG);
    spawn_or_reboot(spawner.spawn(watchdog_task(watchdog)), "Watchdog");

    // The parallel port.  Pin assignments are documented in infra::gpio.
    let port = LptPort::new(
        [
            AnyPin::from(p.PIN_0),
            AnyPin::from(p.PIN_1),
            AnyPin::from(p.PIN_2),
            AnyPin::from(p.PIN_3),
            AnyPin::from(p.PIN_4),
            AnyPin::from(p.PIN_5),
            AnyPin::from(p.PIN_6),
            AnyPin::from(p.PIN_7),
        ],
        AnyPin::from(p.PIN_8),
        AnyPin::from(p.PIN_9),
        AnyPin::from(p.PIN_10),
        AnyPin::from(p.PIN_11),
        AnyPin::from(p.PIN_12),
        AnyPin::from(p.PIN_13),
        AnyPin::from(p.PIN_14),
        AnyPin::from(p.PIN_15),
        AnyPin::from(p.PIN_28),
    );
    let driver = CAPTURE_DRIVER.init(CaptureDriver::new(port, &CAPTURE_SHARED));
    if driver.initialize() != StatusCode::Ok {
        defmt::panic!("Capture driver failed to initialize");
    }

    // One SPI bus, two chip selects.
    let spi_config = embassy_rp::spi::Config::default();
    let spi = Spi::new_blocking(p.SPI0, p.PIN_18, p.PIN_19, p.PIN_16, spi_config);
    let spi_bus = SPI_BUS.init(RefCell::new(spi));

    let flash_cs = Output::new(AnyPin::from(p.PIN_17), Level::High);
    let flash_dev =
        RefCellDevice::new(spi_bus, flash_cs, Delay).expect("flash chip select failed");
    let flash = FlashStorage::new(SpiNorFlash::new(flash_dev));

    let sd_cs = Output::new(AnyPin::from(p.PIN_22), Level::High);
    let sd_dev = RefCellDevice::new(spi_bus, sd_cs, Delay).expect("sd chip select failed");
    let sd_card = SdCard::new(sd_dev, Delay);
    // No card at boot reads as 0 capacity; the free-space estimate treats
    // that conservatively and presence is re-probed on every is_ready().
    let capacity = sd_card
        .num_bytes()
        .map(|bytes| bytes.min(u32::MAX as u64) as u32)
        .unwrap_or(0);
    let volume = SdmmcVolume::new(sd_card, FixedTimeSource, capacity);
    let detect = SocketPins::new(
        Input::new(AnyPin::from(p.PIN_26), Pull::Up),
        Input::new(AnyPin::from(p.PIN_27), Pull::Up),
    );
    let media = MediaStorage::new(volume, detect);

    // The serial console carries the hex stream.
    let uart_config = embassy_rp::uart::Config::default();
    let uart = Uart::new_blocking(p.UART1, p.PIN_20, p.PIN_21, uart_config);
    let stream = StreamStorage::new(SerialSink { uart });

    let coordinator = COORDINATOR.init(StorageCoordinator::new(flash, media, stream));
    if coordinator.initialize() != StatusCode::Ok {
        defmt::panic!("Storage coordinator failed to initialize");
    }

    // Capture gets core 1 to itself; the main loop runs here on core 0.
    core1_spawn(p.CORE1, driver, watchdog);

    let display = DISPLAY.init(NullDisplay);
    let activity_led = Output::new(AnyPin::from(p.PIN_25), Level::Low);
    spawn_or_reboot(
        spawner.spawn(main_loop_task(coordinator, watchdog, display, activity_led)),
        "MainLoop",
    );

    // Everything runs in tasks from here on.
    loop {
        Timer::after(LOOP_LOG_INTERVAL).await;
    }
}
