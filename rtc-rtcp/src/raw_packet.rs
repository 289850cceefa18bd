use std::any::Any;
use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use shared::{
    error::{Error, Result},
    marshal::{Marshal, MarshalSize, Unmarshal},
};

use crate::header::{HEADER_LENGTH, Header};
use crate::packet::Packet;

/// RawPacket represents an unparsed RTCP packet. It's returned by Unmarshal when
/// a packet with an unknown type is encountered.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct RawPacket(pub Bytes);

impl fmt::Display for RawPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawPacket: {self:?}")
    }
}

impl Packet for RawPacket {
    /// Header returns the Header associated with this packet.
    fn header(&self) -> Header {
        match Header::unmarshal(&mut self.0.clone()) {
            Ok(h) => h,
            Err(_) => Header::default(),
        }
    }

    /// destination_ssrc returns an array of SSRC values that this packet refers to.
    fn destination_ssrc(&self) -> Vec<u32> {
        vec![]
    }

    fn raw_size(&self) -> usize {
        self.0.len()
    }

    fn as_any(&self) -> &(dyn Any) {
        self
    }

    fn equal(&self, other: &(dyn Packet)) -> bool {
        other.as_any().downcast_ref::<RawPacket>() == Some(self)
    }

    fn cloned(&self) -> Box<dyn Packet> {
        Box::new(self.clone())
    }
}

impl MarshalSize for RawPacket {
    fn marshal_size(&self) -> usize {
        self.raw_size()
    }
}

impl Marshal for RawPacket {
    /// Marshal encodes the packet in binary.
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.0.len() {
            return Err(Error::BufferTooShort);
        }
        buf.put(self.0.clone());
        Ok(self.0.len())
    }
}

impl Unmarshal for RawPacket {
    /// Unmarshal decodes the packet from binary.
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let raw_packet_len = raw_packet.remaining();
        if raw_packet_len < HEADER_LENGTH {
            return Err(Error::PacketTooShort);
        }

        let raw = raw_packet.copy_to_bytes(raw_packet_len);
        Header::unmarshal(&mut raw.clone())?;

        Ok(RawPacket(raw))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::header::PacketType;

    #[test]
    fn test_raw_packet_roundtrip() -> Result<()> {
        let data = Bytes::from_static(&[
            // v=2, p=0, count=1, BYE, len=12
            0x81, 0xcb, 0x00, 0x0c, // ssrc=0x902f9e2e
            0x90, 0x2f, 0x9e, 0x2e,
        ]);
        let buf = &mut data.clone();
        let p = RawPacket::unmarshal(buf)?;
        assert_eq!(p.header().packet_type, PacketType::Goodbye);
        assert_eq!(p.marshal()?, data);

        let short = Bytes::from_static(&[0x81, 0xcb]);
        assert_eq!(
            RawPacket::unmarshal(&mut short.clone()).unwrap_err(),
            Error::PacketTooShort
        );
        Ok(())
    }
}
