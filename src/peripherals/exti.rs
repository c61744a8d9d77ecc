//! External interrupt lines 0-15.
//!
//! Each line carries at most one handler. Handlers run in interrupt context,
//! must be bounded, and should do no more than post one event.

use super::gpio::Pin;
use super::{Periph, Rcc};
use crate::registers::{
    clear_bits, exti, read_bits, set_bits, syscfg, write_bits, write_field,
};
use crate::{Error, Result};
use core::cell::Cell;
use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};

/// GPIO-capable lines
pub const LINES: usize = 16;

/// Called with the line number that fired
pub type Handler = fn(line: u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

/// EXTI controller, shared between foreground and its interrupt handlers
pub struct Exti {
    regs: &'static exti::RegisterBlock,
    syscfg: &'static syscfg::RegisterBlock,
    handlers: Mutex<CriticalSectionRawMutex, Cell<[Option<Handler>; LINES]>>,
}

impl Exti {
    pub fn new(
        exti: Periph<exti::RegisterBlock>,
        syscfg: Periph<syscfg::RegisterBlock>,
        rcc: &Rcc,
    ) -> Self {
        rcc.enable(&syscfg);
        Self::from_regs(exti.regs(), syscfg.regs())
    }

    fn from_regs(
        regs: &'static exti::RegisterBlock,
        syscfg: &'static syscfg::RegisterBlock,
    ) -> Self {
        Self {
            regs,
            syscfg,
            handlers: Mutex::new(Cell::new([None; LINES])),
        }
    }

    /// Route `pin` to its EXTI line and install `handler`
    ///
    /// # Arguments
    /// * `pin` - Input pin; the line number is the pin index
    /// * `edge` - Edges that trigger the interrupt
    /// * `handler` - Function run in interrupt context
    ///
    /// # Returns
    /// * `Busy` if the line already has a handler
    pub fn attach(&self, pin: &Pin, edge: Edge, handler: Handler) -> Result<()> {
        let line = pin.index() as usize;
        let bit = 1u32 << line;
        self.handlers.lock(|cell| {
            let mut table = cell.get();
            if table[line].is_some() {
                return Err(Error::Busy);
            }
            table[line] = Some(handler);
            cell.set(table);

            let r = self.regs;
            let (shift, port) = ((line as u32 % 4) * 4, pin.port() as u32);
            let sys = self.syscfg;
            match line / 4 {
                0 => write_field!(sys.exticr1, shift, 4, port),
                1 => write_field!(sys.exticr2, shift, 4, port),
                2 => write_field!(sys.exticr3, shift, 4, port),
                _ => write_field!(sys.exticr4, shift, 4, port),
            }
            match edge {
                Edge::Rising => {
                    set_bits!(r.rtsr, bit);
                    clear_bits!(r.ftsr, bit);
                }
                Edge::Falling => {
                    clear_bits!(r.rtsr, bit);
                    set_bits!(r.ftsr, bit);
                }
                Edge::Both => {
                    set_bits!(r.rtsr, bit);
                    set_bits!(r.ftsr, bit);
                }
            }
            // Stale pending edge from before the attach
            write_bits!(r.pr, bit);
            set_bits!(r.imr, bit);
            Ok(())
        })
    }

    /// Mask the line and drop its handler
    pub fn detach(&self, line: u8) -> Result<()> {
        let line = Self::check(line)?;
        let bit = 1u32 << line;
        self.handlers.lock(|cell| {
            let r = self.regs;
            clear_bits!(r.imr, bit);
            clear_bits!(r.rtsr, bit);
            clear_bits!(r.ftsr, bit);
            let mut table = cell.get();
            table[line] = None;
            cell.set(table);
        });
        Ok(())
    }

    pub fn mask(&self, line: u8) -> Result<()> {
        let line = Self::check(line)?;
        critical_section::with(|_| clear_bits!(self.regs.imr, 1 << line));
        Ok(())
    }

    pub fn unmask(&self, line: u8) -> Result<()> {
        let line = Self::check(line)?;
        critical_section::with(|_| set_bits!(self.regs.imr, 1 << line));
        Ok(())
    }

    fn check(line: u8) -> Result<usize> {
        if (line as usize) < LINES {
            Ok(line as usize)
        } else {
            Err(Error::InvalidArgument)
        }
    }

    /// Run the handlers of every pending unmasked line. Call from the EXTI ISRs.
    ///
    /// Returns the number of handlers run.
    pub fn on_interrupt(&self) -> u32 {
        let r = self.regs;
        let pending = read_bits!(r.pr) & read_bits!(r.imr) & 0xFFFF;
        if pending == 0 {
            return 0;
        }
        write_bits!(r.pr, pending);

        let table = self.handlers.lock(|cell| cell.get());
        let mut ran = 0;
        for line in 0..LINES {
            if pending & (1 << line) == 0 {
                continue;
            }
            if let Some(handler) = table[line] {
                handler(line as u8);
                ran += 1;
            }
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripherals::gpio::{PinConfig, Port, Pull};
    use crate::peripherals::Periph;
    use crate::registers::{any_bits, fake, poke, read_field};
    use core::sync::atomic::{AtomicU32, Ordering};

    static FIRED: AtomicU32 = AtomicU32::new(0);

    fn record(line: u8) {
        FIRED.fetch_or(1 << line, Ordering::SeqCst);
    }

    fn nothing(_: u8) {}

    fn input_pin(port_index: u8, index: u8) -> Pin {
        let mut port = Port::new(Periph::fake(port_index), &Rcc::new(fake(), fake()));
        port.pin(index, PinConfig::input(Pull::Up)).unwrap()
    }

    #[test]
    fn attach_routes_port_and_edges() {
        let exti = Exti::from_regs(fake(), fake());
        let pin = input_pin(2, 13);
        exti.attach(&pin, Edge::Falling, nothing).unwrap();
        assert_eq!(read_field!(exti.syscfg.exticr4, 4, 4), 2);
        assert!(any_bits!(exti.regs.ftsr, 1 << 13));
        assert!(!any_bits!(exti.regs.rtsr, 1 << 13));
        assert!(any_bits!(exti.regs.imr, 1 << 13));
    }

    #[test]
    fn one_handler_per_line() {
        let exti = Exti::from_regs(fake(), fake());
        let pin = input_pin(0, 4);
        exti.attach(&pin, Edge::Both, nothing).unwrap();
        assert_eq!(exti.attach(&pin, Edge::Rising, nothing), Err(Error::Busy));
        exti.detach(4).unwrap();
        assert!(!any_bits!(exti.regs.imr, 1 << 4));
        assert!(exti.attach(&pin, Edge::Rising, nothing).is_ok());
        assert_eq!(exti.detach(16), Err(Error::InvalidArgument));
    }

    #[test]
    fn interrupt_runs_only_unmasked_handlers() {
        let exti = Exti::from_regs(fake(), fake());
        exti.attach(&input_pin(0, 1), Edge::Rising, record).unwrap();
        exti.attach(&input_pin(1, 6), Edge::Rising, record).unwrap();
        exti.mask(6).unwrap();

        poke(&exti.regs.pr, (1 << 1) | (1 << 6));
        assert_eq!(exti.on_interrupt(), 1);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1 << 1);

        exti.unmask(6).unwrap();
        poke(&exti.regs.pr, 1 << 6);
        assert_eq!(exti.on_interrupt(), 1);
        assert_eq!(FIRED.load(Ordering::SeqCst), (1 << 1) | (1 << 6));
    }
}
