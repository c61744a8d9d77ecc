//! Off-chip device drivers.
//!
//! Drivers own the peripheral handles they talk through and are generic over
//! the seams in [`crate::peripherals::traits`], so they never know which
//! controller (if any) drives them.

/// u-blox GNSS receiver, NMEA and UBX
pub mod gps;
/// FlySky IBUS RC receiver
pub mod ibus;
/// SD and MMC cards in SPI mode
pub mod sd;
/// WS2812 LED strips
pub mod ws2812;
