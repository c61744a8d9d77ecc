//! Event-driven state machines wrapping the device drivers.
//!
//! A controller owns its driver and implements [`crate::aof::StateMachine`],
//! so it runs as an active object. The current state is a plain value and
//! each event maps it to the next one. Long operations are split into steps
//! advanced by ticks.
//!
//! Controllers report back through function pointers registered at
//! construction; drivers never learn about their controller.

pub mod gps;
pub mod sd;

pub use gps::{GpsCallbacks, GpsController, GpsSignal, GpsState, HomeOffset};
pub use sd::{SdCallbacks, SdController, SdSignal, SdState};

use crate::Error;

/// Errors after which the device cannot be trusted until reset
pub fn is_fatal(error: Error) -> bool {
    matches!(
        error,
        Error::NoDevice | Error::Timeout | Error::Hardware(_) | Error::NotReady
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Fault, Protocol};

    #[test]
    fn media_errors_are_not_fatal() {
        assert!(is_fatal(Error::NoDevice));
        assert!(is_fatal(Error::Hardware(Fault::ModeFault)));
        assert!(!is_fatal(Error::Protocol(Protocol::Checksum)));
        assert!(!is_fatal(Error::WriteProtected));
    }
}
