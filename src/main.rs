//! Firmware entry point for an STM32F407 board.
//!
//! Brings up the clock tree and the peripherals, wires the GPS receiver on
//! USART2 and the SD card on SPI1 into their controllers, and hands control
//! to the active-object scheduler. SysTick drives the 1 kHz timebase.

#![no_std]
#![no_main]

mod apps;

use apps::heartbeat::{Beat, Heartbeat};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::NVIC;
use cortex_m_rt::{entry, exception};
use static_cell::StaticCell;
use stm32f4_aof::aof::{ActiveObject, Event, Mailbox, Post, Scheduler, Timebase};
use stm32f4_aof::controllers::{GpsCallbacks, GpsController, GpsSignal, SdCallbacks, SdController, SdSignal};
use stm32f4_aof::drivers::gps::ubx::class;
use stm32f4_aof::drivers::gps::{Fix, Gps, GpsConfig, UbxMessage};
use stm32f4_aof::drivers::sd::{CardType, SdCard, SdConfig};
use stm32f4_aof::drivers::ws2812::{Ws2812Strip, Ws2812Timing};
use stm32f4_aof::peripherals::dma::Dma;
use stm32f4_aof::peripherals::gpio::{Pin, PinConfig, Port};
use stm32f4_aof::peripherals::spi::{Spi, SpiConfig};
use stm32f4_aof::peripherals::system::ClockConfig;
use stm32f4_aof::peripherals::tim::Timer;
use stm32f4_aof::peripherals::uart::{Uart, UartConfig, UartShared};
use stm32f4_aof::peripherals::Peripherals;
use stm32f4_aof::registers::device::{interrupt, Interrupt};
use stm32f4_aof::{log_error, log_info, Error, Result};

#[cfg(not(feature = "debug"))]
use panic_halt as _;
#[cfg(feature = "debug")]
use {defmt_rtt as _, panic_probe as _};

const TICK_HZ: u32 = 1000;
const OBJECTS: usize = 4;

type Clock = &'static Timebase<'static, OBJECTS>;
type GpsAo = ActiveObject<'static, GpsController<Uart, Clock>, 8>;
type SdAo = ActiveObject<'static, SdController<Spi, Pin, Clock>, 8>;
type HeartbeatAo = ActiveObject<'static, Heartbeat<Pin>, 4>;

static TIMEBASE: Timebase<'static, OBJECTS> = Timebase::new();

static GPS_MB: Mailbox<Event<GpsSignal>, 8> = Mailbox::new();
static SD_MB: Mailbox<Event<SdSignal>, 8> = Mailbox::new();
static HEARTBEAT_MB: Mailbox<Event<Beat>, 4> = Mailbox::new();

static GPS_AO: StaticCell<GpsAo> = StaticCell::new();
static SD_AO: StaticCell<SdAo> = StaticCell::new();
static HEARTBEAT_AO: StaticCell<HeartbeatAo> = StaticCell::new();
static GPS_RX: StaticCell<[u8; 512]> = StaticCell::new();
static GPS_UART: UartShared = UartShared::new();
/// One status pixel plus the latch gap at an 84 MHz timer clock
static PIXEL_BUF: StaticCell<[u16; 64]> = StaticCell::new();

/// 5 Hz navigation, GGA and RMC only
static GPS_SETUP: [UbxMessage; 6] = [
    UbxMessage::cfg_rate(200, 1, 0),
    UbxMessage::cfg_msg(class::NMEA, 0x00, 1),
    UbxMessage::cfg_msg(class::NMEA, 0x04, 1),
    UbxMessage::cfg_msg(class::NMEA, 0x01, 0),
    UbxMessage::cfg_msg(class::NMEA, 0x02, 0),
    UbxMessage::cfg_msg(class::NMEA, 0x03, 0),
];

#[exception]
fn SysTick() {
    TIMEBASE.tick();
}

#[interrupt]
fn USART2() {
    GPS_UART.on_interrupt();
}

#[interrupt]
fn DMA1_STREAM5() {
    GPS_UART.on_rx_dma_interrupt();
}

/// Idle line on the GPS port: a burst of sentences has landed
fn gps_data_ready() {
    let _ = GPS_MB.post_signal(GpsSignal::DataReady);
}

fn on_fix(fix: &Fix) {
    log_info!("fix: {} sats, quality {:?}", fix.satellites, fix.quality);
    let _ = HEARTBEAT_MB.post_signal(Beat::Fix);
}

fn on_stale() {
    let _ = HEARTBEAT_MB.post_signal(Beat::Lost);
}

fn on_card(card: CardType) {
    log_info!("SD card ready: {:?}", card);
}

fn on_sd_error(error: Error) {
    log_error!("SD card fault: {:?}", error);
    let _ = HEARTBEAT_MB.post_signal(Beat::Fault);
}

fn run() -> Result<core::convert::Infallible> {
    let mut p = Peripherals::take().ok_or(Error::Busy)?;
    let clocks = p.rcc.configure(ClockConfig::default())?;
    log_info!("core clock {} Hz", clocks.sysclk);

    let mut porta = Port::new(p.gpioa, &p.rcc);
    let mut portb = Port::new(p.gpiob, &p.rcc);
    let mut portd = Port::new(p.gpiod, &p.rcc);
    let streams = Dma::new(p.dma1, &p.rcc).split();
    let [_, _, _, _, _, gps_rx_stream, pixel_stream, _] = streams;

    // USART2 on PA2/PA3, RX through DMA1 stream 5 channel 4
    porta.pin(2, PinConfig::alternate(7))?;
    porta.pin(3, PinConfig::alternate(7))?;
    let uart_config = UartConfig {
        baud: 9600,
        ..Default::default()
    };
    let mut uart = Uart::new(p.usart2, uart_config, &clocks, &p.rcc, &GPS_UART)?;
    uart.enable_rx_dma(gps_rx_stream, 4, GPS_RX.init([0; 512]))?;
    uart.on_idle(gps_data_ready);
    let gps = Gps::new(uart, &TIMEBASE, GpsConfig::default());

    // SPI1 on PA5/PA6/PA7, chip select on PA4
    for pin in 5..=7 {
        porta.pin(pin, PinConfig::alternate(5))?;
    }
    let cs = porta.pin(4, PinConfig::output())?;
    let spi = Spi::new(p.spi1, SpiConfig::default(), &clocks, &p.rcc);
    let card = SdCard::new(spi, cs, &TIMEBASE, SdConfig::default());

    let led = portd.pin(12, PinConfig::output())?;

    // Status pixel on PB6 (TIM4 CH1), duty updates through DMA1 stream 6 channel 2
    portb.pin(6, PinConfig::alternate(2))?;
    let pixel_buf = PIXEL_BUF.init([0; 64]);
    let pixel = Ws2812Strip::new(
        Timer::new(p.tim4, &clocks, &p.rcc),
        pixel_stream,
        0,
        2,
        Ws2812Timing::default(),
        pixel_buf,
    )?;

    let gps_ao: &'static GpsAo = GPS_AO.init(ActiveObject::new(
        1,
        &GPS_MB,
        GpsController::new(
            gps,
            &GPS_SETUP,
            GpsCallbacks {
                on_fix: Some(on_fix),
                on_stale: Some(on_stale),
                ..Default::default()
            },
        ),
        10,
    ));
    let sd_ao: &'static SdAo = SD_AO.init(ActiveObject::new(
        2,
        &SD_MB,
        SdController::new(
            card,
            SdCallbacks {
                on_ready: Some(on_card),
                on_error: Some(on_sd_error),
                ..Default::default()
            },
        ),
        1,
    ));
    let heartbeat_ao: &'static HeartbeatAo =
        HEARTBEAT_AO.init(ActiveObject::new(
            3,
            &HEARTBEAT_MB,
            Heartbeat::new(led).with_pixel(pixel),
            50,
        ));

    let mut scheduler = Scheduler::new(&TIMEBASE);
    scheduler.register(gps_ao)?;
    scheduler.register(sd_ao)?;
    scheduler.register(heartbeat_ao)?;

    gps_ao.post(GpsSignal::Start)?;
    sd_ao.post(SdSignal::Start)?;

    // Handlers above only touch statics, so they may run from here on
    unsafe {
        NVIC::unmask(Interrupt::USART2);
        NVIC::unmask(Interrupt::DMA1_STREAM5);
    }

    let mut core = cortex_m::Peripherals::take().ok_or(Error::Busy)?;
    core.SYST.set_clock_source(SystClkSource::Core);
    core.SYST.set_reload(clocks.hclk / TICK_HZ - 1);
    core.SYST.clear_current();
    core.SYST.enable_counter();
    core.SYST.enable_interrupt();
    log_info!("scheduler running at tick {}", TIMEBASE.now());

    scheduler.run_forever()
}

#[entry]
fn main() -> ! {
    log_info!("starting stm32f4-aof firmware v{}", env!("CARGO_PKG_VERSION"));
    match run() {
        Ok(never) => match never {},
        Err(e) => {
            log_error!("startup failed: {:?}", e);
            loop {
                cortex_m::asm::wfi();
            }
        }
    }
}
