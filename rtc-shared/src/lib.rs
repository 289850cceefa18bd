#![warn(rust_2018_idioms)]
#![allow(dead_code)]

#[cfg(feature = "marshal")]
pub mod marshal;

pub mod error;
pub mod field_trial;
pub mod time;
pub(crate) mod transport;
pub mod units;
pub mod util;

pub use transport::{EcnCodepoint, TransportContext, TransportMessage, TransportProtocol};
