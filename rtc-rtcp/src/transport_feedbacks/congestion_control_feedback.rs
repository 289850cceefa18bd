use std::any::Any;
use std::fmt;

use bytes::{Buf, BufMut};
use shared::{
    EcnCodepoint,
    error::{Error, Result},
    marshal::{Marshal, MarshalSize, Unmarshal},
    units::TimeDelta,
};

use crate::header::{FORMAT_CCFB, HEADER_LENGTH, Header, PacketType, SSRC_LENGTH};
use crate::packet::Packet;
use crate::util::get_padding_size;

/// Report blocks may describe at most this many packets.
pub const MAX_REPORTS_PER_BLOCK: usize = 16384;
/// Largest report the 16-bit RTCP length field can describe.
pub const MAX_FEEDBACK_SIZE: usize = (u16::MAX as usize + 1) * 4;

const REPORT_BLOCK_HEADER_LENGTH: usize = 8;
const METRIC_BLOCK_LENGTH: usize = 2;
const REPORT_TIMESTAMP_LENGTH: usize = 4;

const RECEIVED_BIT: u16 = 0x8000;
const ECN_SHIFT: u16 = 13;
const ECN_MASK: u16 = 0x3;
const ATO_MASK: u16 = 0x1FFF;
/// Arrival time offset too large to be represented.
const ATO_OVERRANGE: u16 = 0x1FFE;
/// Arrival time offset unavailable.
const ATO_UNAVAILABLE: u16 = 0x1FFF;

/// ECN codepoint a packet arrived with, using the IP header bit layout.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EcnMarking {
    #[default]
    NotEct = 0b00,
    Ect1 = 0b01,
    Ect0 = 0b10,
    Ce = 0b11,
}

impl EcnMarking {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => EcnMarking::Ect1,
            0b10 => EcnMarking::Ect0,
            0b11 => EcnMarking::Ce,
            _ => EcnMarking::NotEct,
        }
    }
}

impl From<Option<EcnCodepoint>> for EcnMarking {
    fn from(ecn: Option<EcnCodepoint>) -> Self {
        match ecn {
            None => EcnMarking::NotEct,
            Some(EcnCodepoint::Ect0) => EcnMarking::Ect0,
            Some(EcnCodepoint::Ect1) => EcnMarking::Ect1,
            Some(EcnCodepoint::Ce) => EcnMarking::Ce,
        }
    }
}

/// Time between a packet's arrival and the report timestamp.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArrivalTimeOffset {
    /// Received this long before the report was generated. Offsets that do
    /// not fit the 13 bit field decode as plus infinity, unavailable ones as
    /// minus infinity.
    Received(TimeDelta),
    NotReceived,
}

impl ArrivalTimeOffset {
    pub fn is_received(&self) -> bool {
        matches!(self, ArrivalTimeOffset::Received(_))
    }

    fn to_ato(delta: TimeDelta) -> u16 {
        if delta < TimeDelta::zero() {
            return ATO_UNAVAILABLE;
        }
        if delta.is_infinite() {
            return ATO_OVERRANGE;
        }
        // 1/1024 second units
        let ato = i128::from(delta.us()) * 1024 / 1_000_000;
        ato.min(i128::from(ATO_OVERRANGE)) as u16
    }

    fn from_ato(ato: u16) -> TimeDelta {
        match ato & ATO_MASK {
            ATO_OVERRANGE => TimeDelta::plus_infinity(),
            ATO_UNAVAILABLE => TimeDelta::minus_infinity(),
            ato => TimeDelta::from_micros((i64::from(ato) * 1_000_000 + 512) / 1024),
        }
    }
}

/// Status of one RTP packet in a report.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FeedbackPacketInfo {
    pub ssrc: u32,
    pub sequence_number: u16,
    pub arrival_time_offset: ArrivalTimeOffset,
    pub ecn: EcnMarking,
}

impl FeedbackPacketInfo {
    fn metric_block(&self) -> u16 {
        match self.arrival_time_offset {
            ArrivalTimeOffset::NotReceived => 0,
            ArrivalTimeOffset::Received(delta) => {
                RECEIVED_BIT
                    | ((self.ecn as u16) & ECN_MASK) << ECN_SHIFT
                    | ArrivalTimeOffset::to_ato(delta)
            }
        }
    }

    fn from_metric_block(ssrc: u32, sequence_number: u16, block: u16) -> Self {
        if block & RECEIVED_BIT == 0 {
            return FeedbackPacketInfo {
                ssrc,
                sequence_number,
                arrival_time_offset: ArrivalTimeOffset::NotReceived,
                ecn: EcnMarking::NotEct,
            };
        }
        FeedbackPacketInfo {
            ssrc,
            sequence_number,
            arrival_time_offset: ArrivalTimeOffset::Received(ArrivalTimeOffset::from_ato(block)),
            ecn: EcnMarking::from_bits((block >> ECN_SHIFT) as u8),
        }
    }
}

/// RFC 8888 congestion control feedback.
///
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P| FMT=11  |   PT = 205    |          length               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 SSRC of RTCP packet sender                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                   SSRC of 1st RTP Stream                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |          begin_seq            |          num_reports          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |R|ECN|  Arrival time offset    | ...                           .
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// .                                                               .
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 Report Timestamp (32 bits)                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// `packets` is the flat list of reported packets. Consecutive entries of
/// the same SSRC with consecutive sequence numbers share a report block.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct CongestionControlFeedback {
    pub sender_ssrc: u32,
    pub packets: Vec<FeedbackPacketInfo>,
    /// Middle 32 bits of the NTP time the report was generated at.
    pub report_timestamp_compact_ntp: u32,
}

impl fmt::Display for CongestionControlFeedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = format!(
            "CongestionControlFeedback from {:x} at {:x}\n",
            self.sender_ssrc, self.report_timestamp_compact_ntp
        );
        for p in &self.packets {
            out += format!(
                "\t{:x} {} {:?} {:?}\n",
                p.ssrc, p.sequence_number, p.arrival_time_offset, p.ecn
            )
            .as_str();
        }
        write!(f, "{out}")
    }
}

impl CongestionControlFeedback {
    /// Splits `packets` into report blocks.
    fn report_blocks(&self) -> Vec<&[FeedbackPacketInfo]> {
        let mut blocks = vec![];
        let mut start = 0;
        for i in 1..=self.packets.len() {
            let ends_block = i == self.packets.len() || {
                let prev = &self.packets[i - 1];
                let cur = &self.packets[i];
                cur.ssrc != prev.ssrc
                    || cur.sequence_number != prev.sequence_number.wrapping_add(1)
                    || i - start >= MAX_REPORTS_PER_BLOCK
            };
            if ends_block {
                blocks.push(&self.packets[start..i]);
                start = i;
            }
        }
        blocks
    }

    fn block_size(num_reports: usize) -> usize {
        let metrics = num_reports * METRIC_BLOCK_LENGTH;
        REPORT_BLOCK_HEADER_LENGTH + metrics + get_padding_size(metrics)
    }

    /// Splits the report into consecutive reports of at most `max_size`
    /// bytes each. Every part keeps the sender SSRC and report timestamp.
    ///
    /// A part always carries at least one packet, even if that alone
    /// exceeds `max_size`.
    pub fn split(self, max_size: usize) -> Vec<CongestionControlFeedback> {
        const FIXED_SIZE: usize = HEADER_LENGTH + SSRC_LENGTH + REPORT_TIMESTAMP_LENGTH;

        let Self {
            sender_ssrc,
            packets,
            report_timestamp_compact_ntp,
        } = self;
        let part = |packets: Vec<FeedbackPacketInfo>| CongestionControlFeedback {
            sender_ssrc,
            packets,
            report_timestamp_compact_ntp,
        };

        let mut parts = vec![];
        let mut current: Vec<FeedbackPacketInfo> = vec![];
        let mut size = FIXED_SIZE;
        let mut block_len = 0;
        for info in packets {
            let extends_block = current.last().is_some_and(|prev| {
                prev.ssrc == info.ssrc
                    && info.sequence_number == prev.sequence_number.wrapping_add(1)
                    && block_len < MAX_REPORTS_PER_BLOCK
            });
            let grown = if extends_block {
                size - Self::block_size(block_len) + Self::block_size(block_len + 1)
            } else {
                size + Self::block_size(1)
            };

            if grown > max_size && !current.is_empty() {
                parts.push(part(std::mem::take(&mut current)));
                size = FIXED_SIZE + Self::block_size(1);
                block_len = 1;
            } else {
                size = grown;
                block_len = if extends_block { block_len + 1 } else { 1 };
            }
            current.push(info);
        }
        if !current.is_empty() || parts.is_empty() {
            parts.push(part(current));
        }
        parts
    }
}

impl Packet for CongestionControlFeedback {
    fn header(&self) -> Header {
        Header {
            padding: false,
            count: FORMAT_CCFB,
            packet_type: PacketType::TransportSpecificFeedback,
            length: ((self.marshal_size() / 4) - 1) as u16,
        }
    }

    /// destination_ssrc returns the media SSRCs this report covers.
    fn destination_ssrc(&self) -> Vec<u32> {
        let mut ssrcs: Vec<u32> = self.packets.iter().map(|p| p.ssrc).collect();
        ssrcs.sort_unstable();
        ssrcs.dedup();
        ssrcs
    }

    fn raw_size(&self) -> usize {
        HEADER_LENGTH
            + SSRC_LENGTH
            + self
                .report_blocks()
                .iter()
                .map(|b| Self::block_size(b.len()))
                .sum::<usize>()
            + REPORT_TIMESTAMP_LENGTH
    }

    fn as_any(&self) -> &(dyn Any) {
        self
    }

    fn equal(&self, other: &(dyn Packet)) -> bool {
        other.as_any().downcast_ref::<CongestionControlFeedback>() == Some(self)
    }

    fn cloned(&self) -> Box<dyn Packet> {
        Box::new(self.clone())
    }
}

impl MarshalSize for CongestionControlFeedback {
    fn marshal_size(&self) -> usize {
        self.raw_size()
    }
}

impl Marshal for CongestionControlFeedback {
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.remaining_mut() < size {
            return Err(Error::BufferTooShort);
        }
        if size / 4 - 1 > u16::MAX as usize {
            return Err(Error::ErrPacketTooBig);
        }

        let h = self.header();
        let n = h.marshal_to(buf)?;
        buf = &mut buf[n..];

        buf.put_u32(self.sender_ssrc);
        for block in self.report_blocks() {
            let first = &block[0];
            buf.put_u32(first.ssrc);
            buf.put_u16(first.sequence_number);
            buf.put_u16(block.len() as u16);
            for p in block {
                buf.put_u16(p.metric_block());
            }
            if block.len() % 2 == 1 {
                buf.put_u16(0);
            }
        }
        buf.put_u32(self.report_timestamp_compact_ntp);

        Ok(size)
    }
}

impl Unmarshal for CongestionControlFeedback {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let raw_packet_len = raw_packet.remaining();
        if raw_packet_len < HEADER_LENGTH + SSRC_LENGTH + REPORT_TIMESTAMP_LENGTH {
            return Err(Error::PacketTooShort);
        }

        let h = Header::unmarshal(raw_packet)?;
        if h.packet_type != PacketType::TransportSpecificFeedback {
            return Err(Error::WrongType);
        }
        if h.count != FORMAT_CCFB {
            return Err(Error::WrongFeedbackType);
        }

        let body_len = (h.length as usize) * 4;
        if raw_packet.remaining() < body_len {
            return Err(Error::PacketTooShort);
        }
        let mut body = raw_packet.copy_to_bytes(body_len);
        if h.padding {
            let padding_len = body.last().copied().unwrap_or(0) as usize;
            if padding_len == 0 || padding_len > body.len() {
                return Err(Error::WrongPadding);
            }
            body.truncate(body.len() - padding_len);
        }
        if body.len() < SSRC_LENGTH + REPORT_TIMESTAMP_LENGTH {
            return Err(Error::PacketTooShort);
        }

        let sender_ssrc = body.get_u32();
        let mut packets = vec![];
        while body.remaining() > REPORT_TIMESTAMP_LENGTH {
            if body.remaining() < REPORT_BLOCK_HEADER_LENGTH + REPORT_TIMESTAMP_LENGTH {
                return Err(Error::PacketTooShort);
            }
            let ssrc = body.get_u32();
            let begin_seq = body.get_u16();
            let num_reports = body.get_u16() as usize;
            if num_reports > MAX_REPORTS_PER_BLOCK {
                return Err(Error::TooManyReportedPackets);
            }

            let block_len = Self::block_size(num_reports) - REPORT_BLOCK_HEADER_LENGTH;
            if body.remaining() < block_len + REPORT_TIMESTAMP_LENGTH {
                return Err(Error::InvalidBlockSize);
            }
            for i in 0..num_reports {
                let block = body.get_u16();
                packets.push(FeedbackPacketInfo::from_metric_block(
                    ssrc,
                    begin_seq.wrapping_add(i as u16),
                    block,
                ));
            }
            if num_reports % 2 == 1 {
                body.advance(METRIC_BLOCK_LENGTH);
            }
        }
        if body.remaining() != REPORT_TIMESTAMP_LENGTH {
            return Err(Error::InvalidBlockSize);
        }
        let report_timestamp_compact_ntp = body.get_u32();

        Ok(CongestionControlFeedback {
            sender_ssrc,
            packets,
            report_timestamp_compact_ntp,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn received(ssrc: u32, seq: u16, offset: TimeDelta, ecn: EcnMarking) -> FeedbackPacketInfo {
        FeedbackPacketInfo {
            ssrc,
            sequence_number: seq,
            arrival_time_offset: ArrivalTimeOffset::Received(offset),
            ecn,
        }
    }

    fn lost(ssrc: u32, seq: u16) -> FeedbackPacketInfo {
        FeedbackPacketInfo {
            ssrc,
            sequence_number: seq,
            arrival_time_offset: ArrivalTimeOffset::NotReceived,
            ecn: EcnMarking::NotEct,
        }
    }

    #[test]
    fn test_ccfb_marshal_wire_format() -> Result<()> {
        let ccfb = CongestionControlFeedback {
            sender_ssrc: 0x01020304,
            packets: vec![
                received(0x0a0b0c0d, 100, TimeDelta::zero(), EcnMarking::Ect1),
                lost(0x0a0b0c0d, 101),
                received(0x0a0b0c0d, 102, TimeDelta::from_seconds(1), EcnMarking::Ce),
            ],
            report_timestamp_compact_ntp: 0x11223344,
        };

        let data = ccfb.marshal()?;
        assert_eq!(
            data,
            Bytes::from_static(&[
                // v=2, p=0, fmt=11, TSFB, len=6
                0x8b, 0xcd, 0x00, 0x06, //
                0x01, 0x02, 0x03, 0x04, //
                0x0a, 0x0b, 0x0c, 0x0d, //
                0x00, 0x64, 0x00, 0x03, //
                // R=1 ECT1 ato=0, not received
                0xa0, 0x00, 0x00, 0x00, //
                // R=1 CE ato=1024, padding
                0xe4, 0x00, 0x00, 0x00, //
                0x11, 0x22, 0x33, 0x44,
            ])
        );

        let parsed = CongestionControlFeedback::unmarshal(&mut data.clone())?;
        assert_eq!(parsed, ccfb);
        Ok(())
    }

    #[test]
    fn test_ccfb_blocks_split_on_ssrc_and_gap() -> Result<()> {
        let ccfb = CongestionControlFeedback {
            sender_ssrc: 1,
            packets: vec![
                received(1, 65535, TimeDelta::zero(), EcnMarking::NotEct),
                received(1, 0, TimeDelta::zero(), EcnMarking::NotEct),
                received(1, 5, TimeDelta::zero(), EcnMarking::NotEct),
                received(2, 6, TimeDelta::zero(), EcnMarking::Ect0),
            ],
            report_timestamp_compact_ntp: 0,
        };
        assert_eq!(ccfb.report_blocks().len(), 3);
        // 4 + 4 + (8 + 4) + (8 + 4) + (8 + 4) + 4
        assert_eq!(ccfb.marshal_size(), 48);
        assert_eq!(ccfb.destination_ssrc(), vec![1, 2]);

        let data = ccfb.marshal()?;
        let parsed = CongestionControlFeedback::unmarshal(&mut data.clone())?;
        assert_eq!(parsed, ccfb);
        Ok(())
    }

    #[test]
    fn test_ccfb_arrival_time_offset_resolution() -> Result<()> {
        let ccfb = CongestionControlFeedback {
            sender_ssrc: 1,
            packets: vec![
                received(1, 1, TimeDelta::from_millis(10), EcnMarking::NotEct),
                received(1, 2, TimeDelta::from_seconds(30), EcnMarking::NotEct),
                received(1, 3, TimeDelta::from_millis(-1), EcnMarking::NotEct),
            ],
            report_timestamp_compact_ntp: 0,
        };
        let data = ccfb.marshal()?;
        let parsed = CongestionControlFeedback::unmarshal(&mut data.clone())?;

        // 10 ms is 10.24 units, truncated to 10.
        assert_eq!(
            parsed.packets[0].arrival_time_offset,
            ArrivalTimeOffset::Received(TimeDelta::from_micros(9766))
        );
        assert_eq!(
            parsed.packets[1].arrival_time_offset,
            ArrivalTimeOffset::Received(TimeDelta::plus_infinity())
        );
        assert_eq!(
            parsed.packets[2].arrival_time_offset,
            ArrivalTimeOffset::Received(TimeDelta::minus_infinity())
        );
        Ok(())
    }

    #[test]
    fn test_ccfb_empty_report() -> Result<()> {
        let ccfb = CongestionControlFeedback {
            sender_ssrc: 7,
            packets: vec![],
            report_timestamp_compact_ntp: 9,
        };
        assert_eq!(ccfb.marshal_size(), 12);
        let data = ccfb.marshal()?;
        assert_eq!(CongestionControlFeedback::unmarshal(&mut data.clone())?, ccfb);
        Ok(())
    }

    #[test]
    fn test_ccfb_unmarshal_errors() {
        let tests = vec![
            (
                "wrong type",
                Bytes::from_static(&[
                    0x8b, 0xce, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02,
                ]),
                Error::WrongType,
            ),
            (
                "wrong fmt",
                Bytes::from_static(&[
                    0x81, 0xcd, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02,
                ]),
                Error::WrongFeedbackType,
            ),
            (
                "length past end",
                Bytes::from_static(&[
                    0x8b, 0xcd, 0x00, 0x09, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02,
                ]),
                Error::PacketTooShort,
            ),
            (
                "block overruns report",
                Bytes::from_static(&[
                    0x8b, 0xcd, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01, // sender
                    0x00, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00, 0x08, // 8 reports
                    0x00, 0x00, 0x00, 0x03,
                ]),
                Error::InvalidBlockSize,
            ),
        ];

        for (name, data, want) in tests {
            let got = CongestionControlFeedback::unmarshal(&mut data.clone());
            assert_eq!(got.unwrap_err(), want, "Unmarshal {name}");
        }
    }

    #[test]
    fn test_ccfb_split_at_size_limit() -> Result<()> {
        let ccfb = CongestionControlFeedback {
            sender_ssrc: 7,
            packets: vec![
                received(1, 1, TimeDelta::zero(), EcnMarking::Ect1),
                received(1, 2, TimeDelta::zero(), EcnMarking::Ect1),
                lost(1, 3),
                received(1, 4, TimeDelta::zero(), EcnMarking::Ce),
                received(1, 5, TimeDelta::zero(), EcnMarking::Ect1),
                received(2, 9, TimeDelta::zero(), EcnMarking::NotEct),
            ],
            report_timestamp_compact_ntp: 0xabcd,
        };
        // Header, sender SSRC, timestamp and one block of two reports.
        let max_size = 4 + 4 + 4 + 12;

        let parts = ccfb.clone().split(max_size);
        let seqs: Vec<Vec<(u32, u16)>> = parts
            .iter()
            .map(|p| p.packets.iter().map(|i| (i.ssrc, i.sequence_number)).collect())
            .collect();
        assert_eq!(
            seqs,
            vec![
                vec![(1, 1), (1, 2)],
                vec![(1, 3), (1, 4)],
                vec![(1, 5)],
                vec![(2, 9)],
            ]
        );

        for part in &parts {
            assert!(part.marshal_size() <= max_size);
            assert_eq!(part.sender_ssrc, 7);
            assert_eq!(part.report_timestamp_compact_ntp, 0xabcd);
            let mut data = part.marshal()?;
            assert_eq!(&CongestionControlFeedback::unmarshal(&mut data)?, part);
        }
        let rejoined: Vec<FeedbackPacketInfo> =
            parts.into_iter().flat_map(|p| p.packets).collect();
        assert_eq!(rejoined, ccfb.packets);

        Ok(())
    }

    #[test]
    fn test_ccfb_split_keeps_small_report_whole() {
        let ccfb = CongestionControlFeedback {
            sender_ssrc: 7,
            packets: vec![lost(1, 1), lost(1, 2)],
            report_timestamp_compact_ntp: 1,
        };
        assert_eq!(ccfb.clone().split(MAX_FEEDBACK_SIZE), vec![ccfb]);

        let empty = CongestionControlFeedback {
            sender_ssrc: 7,
            ..Default::default()
        };
        assert_eq!(empty.clone().split(MAX_FEEDBACK_SIZE), vec![empty]);
    }
}
