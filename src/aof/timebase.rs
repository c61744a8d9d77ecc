//! Tick counter and periodic tick distribution.

use super::TickSink;
use crate::peripherals::TickSource;
use crate::{Error, Result};
use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

struct Subscription<'a> {
    sink: &'a (dyn TickSink + Sync),
    divisor: u32,
}

/// Global tick counter, advanced by the periodic interrupt
///
/// Holds up to `N` tick subscriptions. Lives in a `static` so the tick
/// interrupt can reach it:
///
/// ```ignore
/// static TIMEBASE: Timebase<'static, 4> = Timebase::new();
///
/// #[exception]
/// fn SysTick() {
///     TIMEBASE.tick();
/// }
/// ```
pub struct Timebase<'a, const N: usize> {
    ticks: AtomicU32,
    subscriptions: Mutex<CriticalSectionRawMutex, RefCell<[Option<Subscription<'a>>; N]>>,
}

impl<'a, const N: usize> Timebase<'a, N> {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU32::new(0),
            subscriptions: Mutex::new(RefCell::new([const { None }; N])),
        }
    }

    /// Post a tick to `sink` every `divisor` ticks
    ///
    /// # Returns
    /// * `InvalidArgument` for a zero divisor, `Full` when all slots are taken
    pub fn subscribe(&self, sink: &'a (dyn TickSink + Sync), divisor: u32) -> Result<()> {
        if divisor == 0 {
            return Err(Error::InvalidArgument);
        }
        self.subscriptions.lock(|subs| {
            let mut subs = subs.borrow_mut();
            let slot = subs.iter_mut().find(|s| s.is_none()).ok_or(Error::Full)?;
            *slot = Some(Subscription { sink, divisor });
            Ok(())
        })
    }

    /// Advance the counter and post due ticks; called from the tick interrupt
    ///
    /// Returns the new tick count.
    pub fn tick(&self) -> u32 {
        let now = self.ticks.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        self.subscriptions.lock(|subs| {
            for sub in subs.borrow().iter().flatten() {
                if now % sub.divisor == 0 {
                    // Overflow is counted by the mailbox
                    let _ = sub.sink.post_tick();
                }
            }
        });
        now
    }

    pub fn now(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl<const N: usize> Default for Timebase<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> TickSource for Timebase<'_, N> {
    fn now(&self) -> u32 {
        Timebase::now(self)
    }
}
