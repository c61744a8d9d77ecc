//! Layered driver stack and cooperative active-object scheduler for STM32F4.
//!
//! Layers, leaves first:
//!
//! - [`registers`]: `stm32f4` PAC register blocks, bit layouts and access macros
//! - [`peripherals`]: HAL for GPIO, EXTI, I2C, SPI, UART, ADC, DMA and timers
//! - [`util`]: ring buffer, intrusive list, debouncer, PID and navigation math
//! - [`drivers`]: SD card over SPI, GPS (NMEA + UBX), IBUS, WS2812
//! - [`controllers`]: event-driven state machines wrapping the drivers
//! - [`aof`] and [`diskio`]: the scheduler and the FAT disk-I/O binding

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod log;

pub mod aof;
pub mod controllers;
pub mod diskio;
pub mod drivers;
pub mod error;
pub mod peripherals;
pub mod registers;
pub mod util;

pub use error::{Error, Fault, Protocol, Result};
