use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use shared::{
    error::{Error, Result},
    marshal::{Marshal, MarshalSize, Unmarshal},
};

use crate::header::Header;

/// A parsed RTP packet. Padding is stripped on unmarshal; `padding_size`
/// records how much was present so size accounting stays exact.
#[derive(Debug, Eq, PartialEq, Default, Clone)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
    pub padding_size: u8,
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = "RTP PACKET:\n".to_string();

        out += format!("\tVersion: {}\n", self.header.version).as_str();
        out += format!("\tMarker: {}\n", self.header.marker).as_str();
        out += format!("\tPayload Type: {}\n", self.header.payload_type).as_str();
        out += format!("\tSequence Number: {}\n", self.header.sequence_number).as_str();
        out += format!("\tTimestamp: {}\n", self.header.timestamp).as_str();
        out += format!("\tSSRC: {} ({:x})\n", self.header.ssrc, self.header.ssrc).as_str();
        out += format!("\tPayload Length: {}\n", self.payload.len()).as_str();

        write!(f, "{out}")
    }
}

impl Unmarshal for Packet {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        let payload_len = raw_packet.remaining();
        let mut payload = raw_packet.copy_to_bytes(payload_len);
        let padding_size = if header.padding {
            if payload_len == 0 {
                return Err(Error::ErrShortPacket);
            }
            let padding_len = payload[payload_len - 1] as usize;
            if padding_len == 0 || padding_len > payload_len {
                return Err(Error::ErrShortPacket);
            }
            payload.truncate(payload_len - padding_len);
            padding_len as u8
        } else {
            0
        };

        Ok(Packet {
            header,
            payload,
            padding_size,
        })
    }
}

impl MarshalSize for Packet {
    fn marshal_size(&self) -> usize {
        self.header.marshal_size() + self.payload.len() + self.padding_size as usize
    }
}

impl Marshal for Packet {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::ErrBufferTooSmall);
        }

        let n = self.header.marshal_to(buf)?;
        buf = &mut buf[n..];
        buf.put(&self.payload[..]);
        if self.header.padding && self.padding_size > 0 {
            for _ in 0..self.padding_size - 1 {
                buf.put_u8(0);
            }
            buf.put_u8(self.padding_size);
        }

        Ok(self.marshal_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_with_padding() -> Result<()> {
        let raw = Bytes::from_static(&[
            0xa0, 0x60, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x2a, 0xde, 0xad,
            0x00, 0x02,
        ]);
        let buf = &mut raw.clone();
        let packet = Packet::unmarshal(buf)?;

        assert_eq!(packet.header.sequence_number, 1);
        assert_eq!(packet.header.ssrc, 42);
        assert_eq!(packet.payload, Bytes::from_static(&[0xde, 0xad]));
        assert_eq!(packet.padding_size, 2);
        assert_eq!(packet.marshal_size(), raw.len());
        assert_eq!(packet.marshal()?, raw);
        Ok(())
    }

    #[test]
    fn test_packet_invalid_padding() {
        let raw = Bytes::from_static(&[
            0xa0, 0x60, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x2a, 0xde, 0x05,
        ]);
        let buf = &mut raw.clone();
        assert_eq!(Packet::unmarshal(buf).unwrap_err(), Error::ErrShortPacket);
    }
}
