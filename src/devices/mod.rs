//! Memory-mapped peripherals

pub mod clint;
pub mod net;
pub mod rtc;
pub mod uart;

pub use clint::Clint;
pub use net::{NetDma, NetTransport};
pub use rtc::Rtc;
pub use uart::Uart;
