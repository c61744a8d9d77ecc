//! Switch debouncer.
//!
//! A raw input sample is taken at whatever cadence the caller chooses (for
//! example every scheduler tick). The debounced state only changes after
//! `samples` consecutive readings agree, and each change is reported once.

/// Debouncer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Consecutive equal samples required to accept a new state
    pub samples: u8,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self { samples: 5 }
    }
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    required: u8,
    stable: bool,
    count: u8,
}

impl Debouncer {
    /// # Arguments
    /// * `config` - Sample count; zero is treated as one
    /// * `initial` - State assumed before the first sample
    pub fn new(config: DebounceConfig, initial: bool) -> Self {
        Self {
            required: config.samples.max(1),
            stable: initial,
            count: 0,
        }
    }

    /// Feed one raw sample
    ///
    /// # Returns
    /// * `Some(state)` on the sample that completes a transition, `None` otherwise
    pub fn update(&mut self, sample: bool) -> Option<bool> {
        if sample == self.stable {
            self.count = 0;
            return None;
        }
        self.count += 1;
        if self.count < self.required {
            return None;
        }
        self.stable = sample;
        self.count = 0;
        Some(sample)
    }

    /// Current debounced state
    pub fn state(&self) -> bool {
        self.stable
    }
}
