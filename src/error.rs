//! Error taxonomy shared by every layer.
//!
//! HAL primitives report what the hardware flagged, drivers map those into the
//! same kinds, and controllers turn them into events for their state machines.

use core::fmt;

/// Result type used across the crate
pub type Result<T> = core::result::Result<T, Error>;

/// Error kinds surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A deadline expired before the operation completed
    Timeout,
    /// The resource already owns an outstanding operation
    Busy,
    /// An argument was out of range for the operation
    InvalidArgument,
    /// The peripheral flagged an electrical or transfer fault
    Hardware(Fault),
    /// The remote side answered with something unexpected
    Protocol(Protocol),
    /// The device has not been initialised
    NotReady,
    /// No device is attached
    NoDevice,
    /// The medium is write protected
    WriteProtected,
    /// A fixed-capacity registry is full
    Full,
    /// An event queue is saturated
    QueueFull,
}

/// Hardware faults reported by a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fault {
    /// Misplaced START/STOP or a stuck line on I2C
    Bus,
    /// Another master won the bus
    ArbitrationLost,
    /// Stop bit not found
    Framing,
    /// Parity check failed
    Parity,
    /// Noise detected on a received bit
    Noise,
    /// Data arrived before the previous byte was read
    Overrun,
    /// Data was requested before it was written
    Underrun,
    /// SPI master mode fault (NSS pulled low)
    ModeFault,
    /// DMA transfer error
    Transfer,
}

/// Protocol level errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Protocol {
    /// I2C slave did not acknowledge its address
    AddressNack,
    /// I2C slave did not acknowledge a data byte
    DataNack,
    /// A CRC or checksum did not match
    Checksum,
    /// A response byte did not match what the exchange expects
    UnexpectedResponse(u8),
    /// The device explicitly refused the data (SD data-response token)
    Rejected(u8),
    /// The receiver answered a configuration message with a NAK
    Nak,
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Error::Hardware(fault)
    }
}

impl From<Protocol> for Error {
    fn from(protocol: Protocol) -> Self {
        Error::Protocol(protocol)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Timeout => write!(f, "operation timed out"),
            Error::Busy => write!(f, "resource busy"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::Hardware(fault) => write!(f, "hardware fault: {:?}", fault),
            Error::Protocol(p) => write!(f, "protocol error: {:?}", p),
            Error::NotReady => write!(f, "device not ready"),
            Error::NoDevice => write!(f, "no device"),
            Error::WriteProtected => write!(f, "write protected"),
            Error::Full => write!(f, "registry full"),
            Error::QueueFull => write!(f, "queue full"),
        }
    }
}
