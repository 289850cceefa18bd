//! CCFB Sender Interceptor - matches RFC 8888 feedback with sent RTP packets.

use super::consumer::{PacketSendRecord, TransportFeedbackConsumer, TransportPacketsFeedback};
use super::stats::ReceivedCongestionControlFeedbackStats;
use super::stream_supports_ccfb;
use crate::stream_info::StreamInfo;
use crate::{Interceptor, Packet, TaggedPacket};
use log::trace;
use rtcp::transport_feedbacks::congestion_control_feedback::CongestionControlFeedback;
use shared::EcnCodepoint;
use shared::error::Error;
use shared::marshal::MarshalSize;
use shared::time::SystemInstant;
use shared::units::{DataSize, Timestamp};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::time::Instant;

/// Reports kept for [`CcfbSenderInterceptor::poll_feedback`] before the
/// oldest is dropped.
const DEFAULT_MAX_QUEUED_FEEDBACK: usize = 128;

/// Builder for the CcfbSenderInterceptor.
///
/// # Example
///
/// ```ignore
/// use rtc_interceptor::{Registry, CcfbSenderBuilder};
///
/// let chain = Registry::new()
///     .with(CcfbSenderBuilder::new().with_ect1_marking(true).build())
///     .build();
/// ```
pub struct CcfbSenderBuilder<P> {
    ect1_marking: bool,
    max_queued_feedback: usize,
    _phantom: PhantomData<P>,
}

impl<P> Default for CcfbSenderBuilder<P> {
    fn default() -> Self {
        Self {
            ect1_marking: false,
            max_queued_feedback: DEFAULT_MAX_QUEUED_FEEDBACK,
            _phantom: PhantomData,
        }
    }
}

impl<P> CcfbSenderBuilder<P> {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark outgoing RTP of CCFB streams as ECT(1).
    pub fn with_ect1_marking(mut self, ect1_marking: bool) -> Self {
        self.ect1_marking = ect1_marking;
        self
    }

    /// Set how many unpolled feedback results are kept.
    pub fn with_max_queued_feedback(mut self, max_queued_feedback: usize) -> Self {
        self.max_queued_feedback = max_queued_feedback;
        self
    }

    /// Build the interceptor factory function.
    pub fn build(self) -> impl FnOnce(P) -> CcfbSenderInterceptor<P> {
        move |inner| CcfbSenderInterceptor::new(inner, self.ect1_marking, self.max_queued_feedback)
    }
}

/// Interceptor that remembers outgoing RTP packets of streams negotiated
/// with `ack ccfb` and reconciles incoming RFC 8888 reports against them.
///
/// Reports are passed on unchanged; the matched results are available from
/// [`poll_feedback`](Self::poll_feedback) and the counters from
/// [`stats_per_ssrc`](Self::stats_per_ssrc).
pub struct CcfbSenderInterceptor<P> {
    inner: P,

    ect1_marking: bool,
    max_queued_feedback: usize,

    consumer: TransportFeedbackConsumer,

    /// Maps `Instant` to wall clock time, anchored at the first packet seen.
    clock: Option<SystemInstant>,

    /// Local SSRCs that negotiated CCFB.
    streams: HashSet<u32>,

    feedback_queue: VecDeque<TransportPacketsFeedback>,

    num_feedback_received: u64,
}

impl<P> CcfbSenderInterceptor<P> {
    fn new(inner: P, ect1_marking: bool, max_queued_feedback: usize) -> Self {
        Self {
            inner,
            ect1_marking,
            max_queued_feedback,
            consumer: TransportFeedbackConsumer::new(),
            clock: None,
            streams: HashSet::new(),
            feedback_queue: VecDeque::new(),
            num_feedback_received: 0,
        }
    }

    /// Next matched report, oldest first.
    pub fn poll_feedback(&mut self) -> Option<TransportPacketsFeedback> {
        self.feedback_queue.pop_front()
    }

    /// ECN and loss counters per local SSRC, in ascending SSRC order.
    pub fn stats_per_ssrc(&self) -> BTreeMap<u32, ReceivedCongestionControlFeedbackStats> {
        self.consumer.stats_per_ssrc()
    }

    /// Clears the counters.
    pub fn reset_stats(&mut self) {
        self.consumer.reset();
    }

    /// Number of CCFB reports received, matched or not.
    pub fn num_feedback_received(&self) -> u64 {
        self.num_feedback_received
    }

    fn timestamp(&mut self, now: Instant) -> Timestamp {
        let clock = *self.clock.get_or_insert_with(|| {
            SystemInstant::new(now, SystemInstant::now().duration_since_unix_epoch())
        });
        clock.timestamp(now)
    }

    fn on_feedback(&mut self, now: Instant, feedback: &CongestionControlFeedback) {
        self.num_feedback_received += 1;
        let receive_time = self.timestamp(now);
        let Some(result) = self
            .consumer
            .on_congestion_control_feedback(receive_time, feedback)
        else {
            return;
        };

        if self.feedback_queue.len() >= self.max_queued_feedback {
            trace!("ccfb: feedback queue full, dropping oldest");
            self.feedback_queue.pop_front();
        }
        self.feedback_queue.push_back(result);
    }
}

impl<P: Interceptor> sansio::Protocol<TaggedPacket, TaggedPacket, ()> for CcfbSenderInterceptor<P> {
    type Rout = TaggedPacket;
    type Wout = TaggedPacket;
    type Eout = ();
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedPacket) -> Result<(), Self::Error> {
        if let Packet::Rtcp(ref rtcp_packets) = msg.message {
            for pkt in rtcp_packets {
                if let Some(feedback) = pkt.as_any().downcast_ref::<CongestionControlFeedback>() {
                    self.on_feedback(msg.now, feedback);
                }
            }
        }

        self.inner.handle_read(msg)
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.inner.poll_read()
    }

    fn handle_write(&mut self, mut msg: TaggedPacket) -> Result<(), Self::Error> {
        if let Packet::Rtp(ref rtp_packet) = msg.message
            && self.streams.contains(&rtp_packet.header.ssrc)
        {
            if self.ect1_marking {
                msg.transport.ecn = Some(EcnCodepoint::Ect1);
            }
            let record = PacketSendRecord {
                ssrc: rtp_packet.header.ssrc,
                sequence_number: rtp_packet.header.sequence_number,
                sent_as_ect1: msg.transport.ecn == Some(EcnCodepoint::Ect1),
                send_time: self.timestamp(msg.now),
                size: DataSize::from_bytes(rtp_packet.marshal_size() as i64),
            };
            self.consumer.on_sent_packet(record);
        }

        self.inner.handle_write(msg)
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.inner.poll_write()
    }

    fn handle_event(&mut self, evt: ()) -> Result<(), Self::Error> {
        self.inner.handle_event(evt)
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.inner.poll_event()
    }

    fn handle_timeout(&mut self, now: Self::Time) -> Result<(), Self::Error> {
        self.inner.handle_timeout(now)
    }

    fn poll_timeout(&mut self) -> Option<Self::Time> {
        self.inner.poll_timeout()
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.feedback_queue.clear();
        self.inner.close()
    }
}

impl<P: Interceptor> Interceptor for CcfbSenderInterceptor<P> {
    fn bind_local_stream(&mut self, info: &StreamInfo) {
        if stream_supports_ccfb(info) {
            self.streams.insert(info.ssrc);
        }
        self.inner.bind_local_stream(info);
    }

    fn unbind_local_stream(&mut self, info: &StreamInfo) {
        self.streams.remove(&info.ssrc);
        self.inner.unbind_local_stream(info);
    }

    fn bind_remote_stream(&mut self, info: &StreamInfo) {
        self.inner.bind_remote_stream(info);
    }

    fn unbind_remote_stream(&mut self, info: &StreamInfo) {
        self.inner.unbind_remote_stream(info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Registry;
    use crate::stream_info::RTCPFeedback;
    use rtcp::raw_packet::RawPacket;
    use rtcp::transport_feedbacks::congestion_control_feedback::{
        ArrivalTimeOffset, EcnMarking, FeedbackPacketInfo,
    };
    use sansio::Protocol;
    use shared::TransportContext;
    use shared::units::TimeDelta;

    const SSRC: u32 = 4321;

    fn ccfb_stream(ssrc: u32) -> StreamInfo {
        StreamInfo {
            ssrc,
            rtcp_feedback: vec![RTCPFeedback {
                typ: "ack".to_string(),
                parameter: "ccfb".to_string(),
            }],
        }
    }

    fn rtp(ssrc: u32, seq: u16, now: Instant) -> TaggedPacket {
        TaggedPacket {
            now,
            transport: TransportContext::default(),
            message: Packet::Rtp(rtp::Packet {
                header: rtp::Header {
                    ssrc,
                    sequence_number: seq,
                    ..Default::default()
                },
                payload: vec![0u8; 100].into(),
                ..Default::default()
            }),
        }
    }

    fn rtcp(now: Instant, packets: Vec<Box<dyn rtcp::Packet>>) -> TaggedPacket {
        TaggedPacket {
            now,
            transport: TransportContext::default(),
            message: Packet::Rtcp(packets),
        }
    }

    fn report(entries: &[(u32, u16, Option<EcnMarking>)]) -> CongestionControlFeedback {
        CongestionControlFeedback {
            sender_ssrc: 1,
            packets: entries
                .iter()
                .map(|&(ssrc, sequence_number, ecn)| FeedbackPacketInfo {
                    ssrc,
                    sequence_number,
                    arrival_time_offset: match ecn {
                        Some(_) => ArrivalTimeOffset::Received(TimeDelta::from_millis(2)),
                        None => ArrivalTimeOffset::NotReceived,
                    },
                    ecn: ecn.unwrap_or_default(),
                })
                .collect(),
            report_timestamp_compact_ntp: 0x1234_5678,
        }
    }

    #[test]
    fn test_ccfb_sender_marks_and_records_bound_streams() {
        let mut chain = Registry::new()
            .with(CcfbSenderBuilder::new().with_ect1_marking(true).build())
            .build();
        chain.bind_local_stream(&ccfb_stream(SSRC));

        let now = Instant::now();
        chain.handle_write(rtp(SSRC, 1, now)).unwrap();
        chain.handle_write(rtp(999, 1, now)).unwrap();

        let out = chain.poll_write().unwrap();
        assert_eq!(out.transport.ecn, Some(EcnCodepoint::Ect1));
        // Streams without CCFB are left alone.
        let out = chain.poll_write().unwrap();
        assert_eq!(out.transport.ecn, None);

        chain
            .handle_read(rtcp(
                now,
                vec![Box::new(report(&[
                    (SSRC, 1, Some(EcnMarking::Ect1)),
                    (999, 1, Some(EcnMarking::Ect1)),
                ]))],
            ))
            .unwrap();

        // RTCP is passed on unchanged.
        assert!(chain.poll_read().is_some());

        let stats = chain.stats_per_ssrc();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[&SSRC].num_packets_received_with_ect1, 1);

        let feedback = chain.poll_feedback().unwrap();
        assert_eq!(feedback.packet_feedbacks.len(), 1);
        assert_eq!(feedback.packet_feedbacks[0].sent_packet.size, DataSize::from_bytes(112));
        assert!(feedback.packet_feedbacks[0].sent_packet.sent_as_ect1);
        assert!(chain.poll_feedback().is_none());
    }

    #[test]
    fn test_ccfb_sender_counts_bleaching_and_loss() {
        let mut chain = Registry::new()
            .with(CcfbSenderBuilder::new().with_ect1_marking(true).build())
            .build();
        chain.bind_local_stream(&ccfb_stream(SSRC));

        let now = Instant::now();
        for seq in 1..=4 {
            chain.handle_write(rtp(SSRC, seq, now)).unwrap();
        }
        chain
            .handle_read(rtcp(
                now,
                vec![Box::new(report(&[
                    (SSRC, 1, Some(EcnMarking::NotEct)),
                    (SSRC, 2, Some(EcnMarking::Ce)),
                    (SSRC, 3, None),
                    (SSRC, 4, Some(EcnMarking::Ect1)),
                ]))],
            ))
            .unwrap();

        let stats = chain.stats_per_ssrc()[&SSRC];
        assert_eq!(stats.num_packets_with_bleached_ect1_marking, 1);
        assert_eq!(stats.num_packets_received_with_ce, 1);
        assert_eq!(stats.num_packets_reported_as_lost, 1);
        assert_eq!(stats.num_packets_received_with_ect1, 1);

        chain.reset_stats();
        assert!(chain.stats_per_ssrc().is_empty());
    }

    #[test]
    fn test_ccfb_sender_ignores_other_rtcp_and_unknown_reports() {
        let mut chain = Registry::new()
            .with(CcfbSenderBuilder::new().build())
            .build();
        chain.bind_local_stream(&ccfb_stream(SSRC));

        let now = Instant::now();
        let raw = RawPacket(bytes::Bytes::from_static(&[
            0x80, 0xcc, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04,
        ]));
        chain
            .handle_read(rtcp(
                now,
                vec![
                    Box::new(raw),
                    Box::new(report(&[(SSRC, 7, Some(EcnMarking::Ce))])),
                ],
            ))
            .unwrap();

        assert_eq!(chain.num_feedback_received(), 1);
        assert!(chain.poll_feedback().is_none());
        assert!(chain.stats_per_ssrc().is_empty());
    }

    #[test]
    fn test_ccfb_sender_feedback_queue_is_bounded() {
        let mut chain = Registry::new()
            .with(CcfbSenderBuilder::new().with_max_queued_feedback(2).build())
            .build();
        chain.bind_local_stream(&ccfb_stream(SSRC));

        let now = Instant::now();
        for seq in 1..=3 {
            chain.handle_write(rtp(SSRC, seq, now)).unwrap();
        }
        for seq in 1..=3 {
            chain
                .handle_read(rtcp(now, vec![Box::new(report(&[(SSRC, seq, None)]))]))
                .unwrap();
        }

        let seqs: Vec<u16> = std::iter::from_fn(|| chain.poll_feedback())
            .map(|f| f.packet_feedbacks[0].sent_packet.sequence_number)
            .collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn test_ccfb_sender_unbind_stops_recording() {
        let mut chain = Registry::new()
            .with(CcfbSenderBuilder::new().build())
            .build();
        let info = ccfb_stream(SSRC);
        chain.bind_local_stream(&info);
        assert!(chain.streams.contains(&SSRC));

        chain.unbind_local_stream(&info);
        assert!(!chain.streams.contains(&SSRC));

        let now = Instant::now();
        chain.handle_write(rtp(SSRC, 1, now)).unwrap();
        chain
            .handle_read(rtcp(now, vec![Box::new(report(&[(SSRC, 1, None)]))]))
            .unwrap();
        assert!(chain.poll_feedback().is_none());
    }
}
