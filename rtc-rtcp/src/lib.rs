//! RTCP packet model with the RFC 8888 congestion control feedback report.
//!
//! Packets implement [`packet::Packet`] so they can travel through an
//! interceptor chain as `Vec<Box<dyn Packet>>`; compound datagrams are split
//! with [`packet::unmarshal`]. Packet types this crate does not model are
//! kept as [`raw_packet::RawPacket`].

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod header;
pub mod packet;
pub mod raw_packet;
pub mod transport_feedbacks;
mod util;

pub use header::{Header, PacketType};
pub use packet::Packet;
