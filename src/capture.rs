//! In-band capture of every TX/RX frame with latency accounting.

pub mod describe;
pub mod ring;

pub use describe::FrameFlavor;
pub use ring::{CaptureStats, Direction, MessageCapture, MessageRecord};
