//! Board-level applications built on the controller layer.
//!
//! Each application is a [`stm32f4_aof::aof::StateMachine`] registered with
//! the scheduler next to the controllers it talks to.

/// Status LED blinking at a rate that reflects GPS and SD health
pub mod heartbeat;
