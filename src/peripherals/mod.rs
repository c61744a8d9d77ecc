//! On-chip peripheral drivers (HAL).
//!
//! Every peripheral instance is reachable only through the [`Periph`] token
//! handed out once by [`Peripherals::take`]. Drivers consume the token, so
//! the first component that initialises a peripheral holds sole write
//! authority over its registers.

use crate::registers::{self, device};
use core::sync::atomic::{AtomicBool, Ordering};

pub mod adc;
pub mod dma;
pub mod exti;
pub mod gpio;
pub mod i2c;
pub mod spi;
pub mod system;
pub mod tim;
pub mod traits;
pub mod uart;

pub use system::{Clocks, Rcc};
pub use traits::{Deadline, InputPin, OutputPin, SerialPort, SpiBus, TickSource};

/// Bus a peripheral clock gate lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bus {
    Ahb1,
    Apb1,
    Apb2,
}

/// Clock-enable/reset bit of one peripheral instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Gate {
    pub bus: Bus,
    pub bit: u8,
}

impl Gate {
    pub const fn ahb1(bit: u8) -> Self {
        Self { bus: Bus::Ahb1, bit }
    }

    pub const fn apb1(bit: u8) -> Self {
        Self { bus: Bus::Apb1, bit }
    }

    pub const fn apb2(bit: u8) -> Self {
        Self { bus: Bus::Apb2, bit }
    }
}

/// Ownership token for one peripheral instance
///
/// Not `Clone`: moving it into a driver is what grants write access.
pub struct Periph<R: 'static> {
    regs: &'static R,
    gate: Gate,
    index: u8,
}

impl<R> Periph<R> {
    /// # Safety
    ///
    /// `addr` must be the base address of a register block laid out as `R`,
    /// and no other token for it may exist.
    unsafe fn at(addr: usize, gate: Gate, index: u8) -> Self {
        Self {
            regs: &*(addr as *const R),
            gate,
            index,
        }
    }

    /// Token over a register block leaked on the host heap
    #[cfg(test)]
    pub(crate) fn fake(index: u8) -> Self {
        Self {
            regs: registers::fake(),
            gate: Gate::apb1(0),
            index,
        }
    }

    /// Clock gate of this instance
    pub fn gate(&self) -> Gate {
        self.gate
    }

    /// Instance number (port index for GPIO, stream controller for DMA...)
    pub fn index(&self) -> u8 {
        self.index
    }

    pub(crate) fn regs(&self) -> &'static R {
        self.regs
    }
}

static TAKEN: AtomicBool = AtomicBool::new(false);

/// All peripheral instances the HAL drives
#[allow(missing_docs)]
pub struct Peripherals {
    pub rcc: Rcc,
    pub gpioa: Periph<registers::gpio::RegisterBlock>,
    pub gpiob: Periph<registers::gpio::RegisterBlock>,
    pub gpioc: Periph<registers::gpio::RegisterBlock>,
    pub gpiod: Periph<registers::gpio::RegisterBlock>,
    pub gpioe: Periph<registers::gpio::RegisterBlock>,
    pub exti: Periph<registers::exti::RegisterBlock>,
    pub syscfg: Periph<registers::syscfg::RegisterBlock>,
    pub i2c1: Periph<registers::i2c::RegisterBlock>,
    pub i2c2: Periph<registers::i2c::RegisterBlock>,
    pub i2c3: Periph<registers::i2c::RegisterBlock>,
    pub spi1: Periph<registers::spi::RegisterBlock>,
    pub spi2: Periph<registers::spi::RegisterBlock>,
    pub spi3: Periph<registers::spi::RegisterBlock>,
    pub usart1: Periph<registers::usart::RegisterBlock>,
    pub usart2: Periph<registers::usart::RegisterBlock>,
    pub usart3: Periph<registers::usart::RegisterBlock>,
    pub usart6: Periph<registers::usart::RegisterBlock>,
    pub adc1: Periph<registers::adc::RegisterBlock>,
    pub adc_common: Periph<registers::adc::CommonRegisterBlock>,
    pub dma1: Periph<registers::dma::RegisterBlock>,
    pub dma2: Periph<registers::dma::RegisterBlock>,
    pub tim1: Periph<registers::tim::RegisterBlock>,
    pub tim2: Periph<registers::tim::RegisterBlock>,
    pub tim3: Periph<registers::tim::RegisterBlock>,
    pub tim4: Periph<registers::tim::RegisterBlock>,
    pub tim5: Periph<registers::tim::RegisterBlock>,
}

impl Peripherals {
    /// Claim every peripheral. Returns `Some` exactly once per boot.
    pub fn take() -> Option<Self> {
        if TAKEN
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        Some(unsafe { Self::steal() })
    }

    /// # Safety
    ///
    /// Creates a second set of tokens if called after [`Peripherals::take`].
    unsafe fn steal() -> Self {
        Self {
            rcc: Rcc::new(&*device::RCC::ptr(), &*device::FLASH::ptr()),
            gpioa: Periph::at(device::GPIOA::ptr() as usize, Gate::ahb1(0), 0),
            gpiob: Periph::at(device::GPIOB::ptr() as usize, Gate::ahb1(1), 1),
            gpioc: Periph::at(device::GPIOC::ptr() as usize, Gate::ahb1(2), 2),
            gpiod: Periph::at(device::GPIOD::ptr() as usize, Gate::ahb1(3), 3),
            gpioe: Periph::at(device::GPIOE::ptr() as usize, Gate::ahb1(4), 4),
            exti: Periph::at(device::EXTI::ptr() as usize, Gate::apb2(14), 0),
            syscfg: Periph::at(device::SYSCFG::ptr() as usize, Gate::apb2(14), 0),
            i2c1: Periph::at(device::I2C1::ptr() as usize, Gate::apb1(21), 1),
            i2c2: Periph::at(device::I2C2::ptr() as usize, Gate::apb1(22), 2),
            i2c3: Periph::at(device::I2C3::ptr() as usize, Gate::apb1(23), 3),
            spi1: Periph::at(device::SPI1::ptr() as usize, Gate::apb2(12), 1),
            spi2: Periph::at(device::SPI2::ptr() as usize, Gate::apb1(14), 2),
            spi3: Periph::at(device::SPI3::ptr() as usize, Gate::apb1(15), 3),
            usart1: Periph::at(device::USART1::ptr() as usize, Gate::apb2(4), 1),
            usart2: Periph::at(device::USART2::ptr() as usize, Gate::apb1(17), 2),
            usart3: Periph::at(device::USART3::ptr() as usize, Gate::apb1(18), 3),
            usart6: Periph::at(device::USART6::ptr() as usize, Gate::apb2(5), 6),
            adc1: Periph::at(device::ADC1::ptr() as usize, Gate::apb2(8), 1),
            adc_common: Periph::at(device::ADC_COMMON::ptr() as usize, Gate::apb2(8), 0),
            dma1: Periph::at(device::DMA1::ptr() as usize, Gate::ahb1(21), 1),
            dma2: Periph::at(device::DMA2::ptr() as usize, Gate::ahb1(22), 2),
            tim1: Periph::at(device::TIM1::ptr() as usize, Gate::apb2(0), 1),
            tim2: Periph::at(device::TIM2::ptr() as usize, Gate::apb1(0), 2),
            tim3: Periph::at(device::TIM3::ptr() as usize, Gate::apb1(1), 3),
            tim4: Periph::at(device::TIM4::ptr() as usize, Gate::apb1(2), 4),
            tim5: Periph::at(device::TIM5::ptr() as usize, Gate::apb1(3), 5),
        }
    }
}

/// Busy-wait for roughly `cycles` core clock cycles
#[inline]
pub(crate) fn spin(cycles: u32) {
    #[cfg(target_arch = "arm")]
    cortex_m::asm::delay(cycles);

    #[cfg(not(target_arch = "arm"))]
    for _ in 0..cycles {
        core::hint::spin_loop();
    }
}

/// Upper bound on status-flag polls inside a single register handshake
pub(crate) const FLAG_SPINS: u32 = 100_000;

/// Poll `ready` until it returns `true`, giving up after [`FLAG_SPINS`] polls
#[inline]
pub(crate) fn wait_flag<F: FnMut() -> bool>(mut ready: F) -> crate::Result<()> {
    for _ in 0..FLAG_SPINS {
        if ready() {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(crate::Error::Timeout)
}
