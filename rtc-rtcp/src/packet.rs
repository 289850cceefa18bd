use std::any::Any;
use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use shared::{
    error::{Error, Result},
    marshal::{Marshal, Unmarshal},
};

use crate::header::{FORMAT_CCFB, HEADER_LENGTH, Header, PacketType};
use crate::raw_packet::RawPacket;
use crate::transport_feedbacks::congestion_control_feedback::CongestionControlFeedback;

/// Packet represents an RTCP packet, a protocol used for out-of-band statistics and control information for an RTP session
pub trait Packet: Marshal + fmt::Display + fmt::Debug {
    fn header(&self) -> Header;
    fn destination_ssrc(&self) -> Vec<u32>;
    fn raw_size(&self) -> usize;
    fn as_any(&self) -> &(dyn Any);
    fn equal(&self, other: &(dyn Packet)) -> bool;
    fn cloned(&self) -> Box<dyn Packet>;
}

impl PartialEq for dyn Packet {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl Clone for Box<dyn Packet> {
    fn clone(&self) -> Box<dyn Packet> {
        self.cloned()
    }
}

/// marshal takes an array of Packets and serializes them to a single buffer
pub fn marshal(packets: &[Box<dyn Packet>]) -> Result<Bytes> {
    let mut out = BytesMut::new();
    for p in packets {
        let data = p.marshal()?;
        out.extend_from_slice(&data);
    }
    Ok(out.freeze())
}

/// Unmarshal takes an entire udp datagram (which may consist of multiple RTCP packets) and
/// returns the unmarshaled packets it contains.
///
/// If this is a reduced-size RTCP packet a feedback packet (Goodbye, SliceLossIndication, etc)
/// will be returned. Otherwise, the underlying type of the returned packet will be
/// CompoundPacket.
pub fn unmarshal<B>(raw_data: &mut B) -> Result<Vec<Box<dyn Packet>>>
where
    B: Buf,
{
    let mut packets = vec![];

    while raw_data.has_remaining() {
        let p = unmarshaller(raw_data)?;
        packets.push(p);
    }

    match packets.len() {
        // Empty Packet
        0 => Err(Error::InvalidHeader),
        _ => Ok(packets),
    }
}

/// unmarshaller is a factory which pulls the first RTCP packet from a bytestream,
/// and returns it's parsed representation, and the amount of data that was processed.
pub(crate) fn unmarshaller<B>(raw_data: &mut B) -> Result<Box<dyn Packet>>
where
    B: Buf,
{
    let h = Header::unmarshal(&mut raw_data.chunk())?;

    let length = (h.length as usize) * 4;
    if length > raw_data.remaining() - HEADER_LENGTH {
        return Err(Error::PacketTooShort);
    }

    let mut in_packet = raw_data.copy_to_bytes(HEADER_LENGTH + length);

    let p: Box<dyn Packet> = match h.packet_type {
        PacketType::TransportSpecificFeedback if h.count == FORMAT_CCFB => {
            Box::new(CongestionControlFeedback::unmarshal(&mut in_packet)?)
        }
        _ => Box::new(RawPacket::unmarshal(&mut in_packet)?),
    };

    Ok(p)
}
