//! Board-independent helpers shared by drivers and applications.

pub mod debounce;
pub mod list;
pub mod madgwick;
pub mod nav;
pub mod pid;
pub mod ring_buffer;

pub use debounce::{DebounceConfig, Debouncer};
pub use list::{List, Node};
pub use pid::{Pid, PidConfig};
pub use ring_buffer::RingBuffer;
