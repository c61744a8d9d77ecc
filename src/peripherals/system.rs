//! Reset and clock control for STM32F405/407.
//!
//! Brings the core up from the 16 MHz HSI reset clock to 168 MHz from an
//! external crystal through the main PLL, sets the flash wait states to match,
//! and gates peripheral clocks on and off.

use super::{wait_flag, Bus, Periph};
use crate::registers::{
    any_bits, clear_bits, flash, modify_bits, rcc, read_bits, read_field, set_bits, write_bits,
    write_field,
};
use crate::{Error, Result};

const MHZ: u32 = 1_000_000;
const HSI_HZ: u32 = 16 * MHZ;
const SYSCLK_MAX: u32 = 168 * MHZ;
const PCLK1_MAX: u32 = 42 * MHZ;
const PCLK2_MAX: u32 = 84 * MHZ;
const VCO_MIN: u32 = 100 * MHZ;
const VCO_MAX: u32 = 432 * MHZ;
const USB_HZ: u32 = 48 * MHZ;
/// Flash access time budget per wait state at 2.7-3.6 V
const HZ_PER_WAIT_STATE: u32 = 30 * MHZ;

/// Requested clock tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClockConfig {
    /// External oscillator frequency
    pub hse_hz: u32,
    /// HSE is an external clock signal rather than a crystal
    pub hse_bypass: bool,
    /// Target core clock
    pub sysclk_hz: u32,
}

impl Default for ClockConfig {
    /// 8 MHz crystal, 168 MHz core
    fn default() -> Self {
        Self {
            hse_hz: 8 * MHZ,
            hse_bypass: false,
            sysclk_hz: SYSCLK_MAX,
        }
    }
}

/// Frozen clock frequencies, used by drivers for baud and timing math
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Clocks {
    pub sysclk: u32,
    pub hclk: u32,
    pub pclk1: u32,
    pub pclk2: u32,
    ppre1: u8,
    ppre2: u8,
}

impl Clocks {
    /// Reset state: everything on the 16 MHz HSI
    pub const RESET: Clocks = Clocks {
        sysclk: HSI_HZ,
        hclk: HSI_HZ,
        pclk1: HSI_HZ,
        pclk2: HSI_HZ,
        ppre1: 1,
        ppre2: 1,
    };

    /// Timer kernel clock on APB1 (doubled when the bus is divided)
    pub fn timclk1(&self) -> u32 {
        if self.ppre1 == 1 {
            self.pclk1
        } else {
            self.pclk1 * 2
        }
    }

    /// Timer kernel clock on APB2
    pub fn timclk2(&self) -> u32 {
        if self.ppre2 == 1 {
            self.pclk2
        } else {
            self.pclk2 * 2
        }
    }

    /// Kernel clock of a peripheral on `bus`
    pub fn bus_clock(&self, bus: Bus) -> u32 {
        match bus {
            Bus::Ahb1 => self.hclk,
            Bus::Apb1 => self.pclk1,
            Bus::Apb2 => self.pclk2,
        }
    }
}

impl Default for Clocks {
    fn default() -> Self {
        Self::RESET
    }
}

/// Divider settings derived from a [`ClockConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Plan {
    m: u32,
    n: u32,
    p: u32,
    q: u32,
    ppre1_bits: u32,
    ppre2_bits: u32,
    latency: u32,
    clocks: Clocks,
}

/// Smallest APB divider keeping the bus at or below `max`, with its PPRE encoding
fn apb_divider(hclk: u32, max: u32) -> (u8, u32) {
    [(1u8, 0b000), (2, 0b100), (4, 0b101), (8, 0b110), (16, 0b111)]
        .into_iter()
        .find(|&(div, _)| hclk / div as u32 <= max)
        .unwrap_or((16, 0b111))
}

fn plan(cfg: &ClockConfig) -> Result<Plan> {
    // 1 MHz VCO input, P = 2
    if cfg.hse_hz % MHZ != 0 || cfg.sysclk_hz % MHZ != 0 || cfg.sysclk_hz > SYSCLK_MAX {
        return Err(Error::InvalidArgument);
    }
    let m = cfg.hse_hz / MHZ;
    if !(2..=63).contains(&m) {
        return Err(Error::InvalidArgument);
    }
    let p = 2;
    let vco = cfg.sysclk_hz * p;
    if !(VCO_MIN..=VCO_MAX).contains(&vco) {
        return Err(Error::InvalidArgument);
    }
    let n = vco / MHZ;
    let q = vco.div_ceil(USB_HZ).clamp(2, 15);

    let hclk = cfg.sysclk_hz;
    let (ppre1, ppre1_bits) = apb_divider(hclk, PCLK1_MAX);
    let (ppre2, ppre2_bits) = apb_divider(hclk, PCLK2_MAX);

    Ok(Plan {
        m,
        n,
        p,
        q,
        ppre1_bits,
        ppre2_bits,
        latency: (hclk - 1) / HZ_PER_WAIT_STATE,
        clocks: Clocks {
            sysclk: cfg.sysclk_hz,
            hclk,
            pclk1: hclk / ppre1 as u32,
            pclk2: hclk / ppre2 as u32,
            ppre1,
            ppre2,
        },
    })
}

/// Owner of the RCC and FLASH blocks
pub struct Rcc {
    regs: &'static rcc::RegisterBlock,
    flash: &'static flash::RegisterBlock,
    clocks: Clocks,
}

impl Rcc {
    pub(crate) fn new(
        regs: &'static rcc::RegisterBlock,
        flash: &'static flash::RegisterBlock,
    ) -> Self {
        Self {
            regs,
            flash,
            clocks: Clocks::RESET,
        }
    }

    /// Switch the core to the PLL driven from HSE
    ///
    /// # Arguments
    /// * `cfg` - Oscillator and target core frequency
    ///
    /// # Returns
    /// * The resulting bus frequencies
    /// * `InvalidArgument` when the PLL cannot reach the target
    /// * `Timeout` when the oscillator or PLL never reports ready
    pub fn configure(&mut self, cfg: ClockConfig) -> Result<Clocks> {
        let plan = plan(&cfg)?;
        let r = self.regs;

        let mut hse = rcc::cr::HSEON;
        if cfg.hse_bypass {
            hse |= rcc::cr::HSEBYP;
        }
        set_bits!(r.cr, hse);
        wait_flag(|| any_bits!(r.cr, rcc::cr::HSERDY)).inspect_err(|_| {
            log_error!("HSE did not start");
        })?;

        // Wait states must be raised before the clock is
        write_bits!(
            self.flash.acr,
            (plan.latency << flash::acr::LATENCY_SHIFT)
                | flash::acr::PRFTEN
                | flash::acr::ICEN
                | flash::acr::DCEN,
        );

        write_field!(r.cfgr, rcc::cfgr::HPRE_SHIFT, 4, 0);
        write_field!(r.cfgr, rcc::cfgr::PPRE1_SHIFT, 3, plan.ppre1_bits);
        write_field!(r.cfgr, rcc::cfgr::PPRE2_SHIFT, 3, plan.ppre2_bits);

        clear_bits!(r.cr, rcc::cr::PLLON);
        write_bits!(
            r.pllcfgr,
            (plan.m << rcc::pllcfgr::PLLM_SHIFT)
                | (plan.n << rcc::pllcfgr::PLLN_SHIFT)
                | ((plan.p / 2 - 1) << rcc::pllcfgr::PLLP_SHIFT)
                | rcc::pllcfgr::PLLSRC_HSE
                | (plan.q << rcc::pllcfgr::PLLQ_SHIFT),
        );
        set_bits!(r.cr, rcc::cr::PLLON);
        wait_flag(|| any_bits!(r.cr, rcc::cr::PLLRDY)).inspect_err(|_| {
            log_error!("PLL did not lock");
        })?;

        write_field!(r.cfgr, rcc::cfgr::SW_SHIFT, 2, rcc::cfgr::SW_PLL);
        wait_flag(|| read_field!(r.cfgr, rcc::cfgr::SWS_SHIFT, 2) == rcc::cfgr::SW_PLL)?;

        self.clocks = plan.clocks;
        log_info!(
            "Clocks: sysclk {} Hz, pclk1 {} Hz, pclk2 {} Hz",
            plan.clocks.sysclk,
            plan.clocks.pclk1,
            plan.clocks.pclk2
        );
        Ok(plan.clocks)
    }

    /// Current bus frequencies
    pub fn clocks(&self) -> Clocks {
        self.clocks
    }

    /// Read-modify-write the clock-enable register of `bus`
    fn update_enr(&self, bus: Bus, f: impl FnOnce(u32) -> u32) -> u32 {
        let r = self.regs;
        critical_section::with(|_| match bus {
            Bus::Ahb1 => modify_bits!(r.ahb1enr, |v| f(v)),
            Bus::Apb1 => modify_bits!(r.apb1enr, |v| f(v)),
            Bus::Apb2 => modify_bits!(r.apb2enr, |v| f(v)),
        });
        match bus {
            Bus::Ahb1 => read_bits!(r.ahb1enr),
            Bus::Apb1 => read_bits!(r.apb1enr),
            Bus::Apb2 => read_bits!(r.apb2enr),
        }
    }

    fn update_rstr(&self, bus: Bus, f: impl Fn(u32) -> u32) {
        let r = self.regs;
        match bus {
            Bus::Ahb1 => modify_bits!(r.ahb1rstr, |v| f(v)),
            Bus::Apb1 => modify_bits!(r.apb1rstr, |v| f(v)),
            Bus::Apb2 => modify_bits!(r.apb2rstr, |v| f(v)),
        }
    }

    /// Ungate the clock of a peripheral
    pub fn enable<R>(&self, periph: &Periph<R>) {
        let gate = periph.gate();
        // The read back covers the two bus cycles before the registers respond
        let _ = self.update_enr(gate.bus, |v| v | (1 << gate.bit));
    }

    /// Gate the clock of a peripheral off
    pub fn disable<R>(&self, periph: &Periph<R>) {
        let gate = periph.gate();
        let _ = self.update_enr(gate.bus, |v| v & !(1 << gate.bit));
    }

    /// Pulse the reset line of a peripheral
    pub fn reset<R>(&self, periph: &Periph<R>) {
        let gate = periph.gate();
        critical_section::with(|_| {
            self.update_rstr(gate.bus, |v| v | (1 << gate.bit));
            self.update_rstr(gate.bus, |v| v & !(1 << gate.bit));
        });
    }
}
