//! STM32F103 Blue Pill alarm blinky with SPI flash filesystem
//! =============================================================================================
//!
//! This firmware demonstrates:
//! - TIM3 compare interrupt toggling the onboard LED (0.5 s on, 1 s off)
//! - Interrupt -> task hand-off of the LED state through a bounded channel
//! - FAT16 volume on a W25Qxx SPI NOR flash, mounted at startup to read one line
//!
//! Hardware Connections:
//!   Onboard LED: PC13 (active low, no external connection needed)
//!
//!   W25Q32 Flash -> Blue Pill
//!      VCC  -> 3.3V
//!      GND  -> GND
//!      CS   -> PA4
//!      CLK  -> PA5 (SPI1_SCK)
//!      DO   -> PA6 (SPI1_MISO)
//!      DI   -> PA7 (SPI1_MOSI)
//!
//! Expected Behavior:
//!   - Partition size and the first line of /storage/myfile.txt are printed once
//!   - LED blinks with an asymmetric duty cycle
//!   - Every LED transition is logged by the main loop via defmt RTT

#![no_std]
#![no_main]

use core::cell::RefCell;

use alarm_blinky::blink::Blinker;
use alarm_blinky::config::{
    ALARM_TIMER, FLASH_SPI_HZ, POLL_PERIOD_MS, RECEIVE_TIMEOUT_MS, STARTUP_FILE, STORAGE_MOUNT, TAG,
};
use alarm_blinky::handler::AlarmHandler;
use alarm_blinky::hardware::alarm_timer::{AlarmTimer, CompareChannel};
use alarm_blinky::hardware::gpio_led::GpioLed;
use alarm_blinky::hardware::spi_flash::SpiNorFlash;
use alarm_blinky::queue::{self, StateQueue};
use alarm_blinky::storage::{self, FlashBlockDevice};
use defmt::{error, info};
use embassy_executor::Spawner;
use embassy_stm32::{
    gpio::{Level, Output, Speed},
    interrupt,
    mode::Blocking,
    peripherals,
    spi::{self, Spi},
    time::Hertz,
};
use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
use embassy_time::{Delay, Duration, Timer};
use embedded_hal_bus::spi::ExclusiveDevice;
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _}; // Logging and panic handlers

type FlashBus = ExclusiveDevice<Spi<'static, Blocking>, Output<'static>, Delay>;
type BoardHandler = AlarmHandler<'static, GpioLed<'static>, CompareChannel>;

// LED state mailbox, filled by the TIM3 interrupt and drained by the main loop
static LED_QUEUE: StateQueue = StateQueue::new();

// Installed once before TIM3 is unmasked; only the interrupt touches it afterwards
static ALARM_HANDLER: Mutex<CriticalSectionRawMutex, RefCell<Option<BoardHandler>>> =
    Mutex::new(RefCell::new(None));

static ALARM: StaticCell<AlarmTimer<'static>> = StaticCell::new();
static FLASH_DEVICE: StaticCell<FlashBlockDevice<SpiNorFlash<FlashBus>>> = StaticCell::new();

/// Main application entry point
#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    // External 8MHz crystal through the PLL to 72MHz, APB1 at 36MHz (TIM3 clock 72MHz)
    let mut config = embassy_stm32::Config::default();
    {
        use embassy_stm32::rcc::*;
        config.rcc.hse = Some(Hse {
            freq: Hertz(8_000_000),
            mode: HseMode::Oscillator,
        });
        config.rcc.pll = Some(Pll {
            src: PllSource::HSE,
            prediv: PllPreDiv::DIV1,
            mul: PllMul::MUL9,
        });
        config.rcc.sys = Sysclk::PLL1_P;
        config.rcc.ahb_pre = AHBPrescaler::DIV1;
        config.rcc.apb1_pre = APBPrescaler::DIV2;
        config.rcc.apb2_pre = APBPrescaler::DIV1;
    }
    let p = embassy_stm32::init(config);
    info!("{}: system start", TAG);

    // Onboard LED, initially off
    let led = GpioLed::new(p.PC13);

    // SPI1 in blocking mode for the NOR flash
    let mut spi_config = spi::Config::default();
    spi_config.frequency = Hertz(FLASH_SPI_HZ);
    let spi = Spi::new_blocking(p.SPI1, p.PA5, p.PA7, p.PA6, spi_config);
    let cs = Output::new(p.PA4, Level::High, Speed::Medium);
    let flash_bus = ExclusiveDevice::new(spi, cs, Delay).unwrap();

    storage_setup(flash_bus);
    alarm_setup(p.TIM3, led);

    let receiver = LED_QUEUE.receiver();
    loop {
        if let Some(message) =
            queue::receive_state(&receiver, Duration::from_millis(RECEIVE_TIMEOUT_MS)).await
        {
            info!("{}: LED State={}", TAG, message.state.level());
        }
        // Shorter than the 0.5 s ON interval so the queue keeps draining
        Timer::after_millis(POLL_PERIOD_MS).await;
    }
}

/// Mounts the flash filesystem and prints the first line of the startup file.
///
/// Every failure is logged and ends the setup; the blinker runs regardless.
fn storage_setup(bus: FlashBus) {
    let flash = match SpiNorFlash::new(bus) {
        Ok(flash) => flash,
        Err(e) => {
            error!("{}: Failed to detect SPI flash ({})", TAG, e);
            return;
        }
    };
    info!("{}: SPI flash {}", TAG, flash.jedec_id());

    let device = match FlashBlockDevice::new(flash) {
        Ok(device) => FLASH_DEVICE.init(device),
        Err(e) => {
            error!("{}: Unsupported flash geometry ({})", TAG, e);
            return;
        }
    };

    let fs = match storage::mount(device, &STORAGE_MOUNT) {
        Ok(fs) => fs,
        Err(e) => {
            error!("{}: Failed to initialize filesystem ({})", TAG, e);
            return;
        }
    };

    match fs.info() {
        Ok(info) => info!(
            "{}: Partition size total: {}, used: {}",
            TAG, info.total_bytes, info.used_bytes
        ),
        Err(e) => error!("{}: Failed to get partition info ({})", TAG, e),
    }

    match fs.read_line(STARTUP_FILE) {
        Ok(line) => defmt::println!("{}", line.as_str()),
        Err(e) => error!("{}: Failed to open file for reading ({})", TAG, e),
    }
}

/// Configures TIM3, hands the LED and the queue sender to the interrupt handler
/// and arms the first alarm.
fn alarm_setup(tim: peripherals::TIM3, led: GpioLed<'static>) {
    info!("{}: Create timer handle", TAG);
    let timer = match AlarmTimer::new(tim, &ALARM_TIMER) {
        Ok(timer) => ALARM.init(timer),
        Err(e) => {
            error!("{}: Failed to initiate alarm timer ({})", TAG, e);
            return;
        }
    };

    let blinker = Blinker::from_config(&ALARM_TIMER);
    let initial_alarm = blinker.pending_alarm();
    let handler = AlarmHandler::new(blinker, led, timer.channel(), LED_QUEUE.sender());
    ALARM_HANDLER.lock(|cell| {
        cell.replace(Some(handler));
    });

    timer.start(initial_alarm);
}

#[interrupt]
fn TIM3() {
    if !AlarmTimer::take_compare_event() {
        return;
    }
    ALARM_HANDLER.lock(|cell| {
        if let Some(handler) = cell.borrow_mut().as_mut() {
            handler.on_alarm();
        }
    });
}
