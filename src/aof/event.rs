/// Event delivered to a state machine
///
/// `S` is the object's own signal enumeration; [`Event::Tick`] is the
/// synthetic periodic event every object understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event<S> {
    Tick,
    Signal(S),
}

impl<S> Event<S> {
    pub fn is_tick(&self) -> bool {
        matches!(self, Event::Tick)
    }
}

impl<S> From<S> for Event<S> {
    fn from(signal: S) -> Self {
        Event::Signal(signal)
    }
}
