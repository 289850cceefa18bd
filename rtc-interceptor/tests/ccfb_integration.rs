//! Integration tests for CCFB (RFC 8888 Congestion Control Feedback) interceptors.
//!
//! A sender chain and a receiver chain are wired back to back through a
//! simulated network that can drop, delay and re-mark packets. Feedback
//! travels the wire as marshalled RTCP. These tests verify that:
//! - Reports reach the sender and are matched with sent packets
//! - ECN counters (ECT(1), CE, bleaching) follow what the network did
//! - Losses and late arrivals are counted once on both ends
//! - Forged reports do not move any counter

use rtc_interceptor::{
    CcfbReceiverBuilder, CcfbReceiverInterceptor, CcfbSenderBuilder, CcfbSenderInterceptor,
    Interceptor, NoopInterceptor, Packet, RTCPFeedback, ReceivedCongestionControlFeedbackStats,
    Registry, SentCongestionControllerFeedbackStats, StreamInfo, TaggedPacket,
};
use rtcp::transport_feedbacks::congestion_control_feedback::{
    ArrivalTimeOffset, CongestionControlFeedback, EcnMarking, FeedbackPacketInfo,
};
use sansio::Protocol;
use shared::units::TimeDelta;
use shared::{EcnCodepoint, TransportContext};
use std::time::{Duration, Instant};

const MEDIA_SSRC: u32 = 0x1000;
const FEEDBACK_SSRC: u32 = 0x2000;

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ccfb_stream(ssrc: u32) -> StreamInfo {
    StreamInfo {
        ssrc,
        rtcp_feedback: vec![RTCPFeedback {
            typ: "ack".to_string(),
            parameter: "ccfb".to_string(),
        }],
    }
}

fn create_rtp_packet(now: Instant, ssrc: u32, seq: u16, marker: bool) -> TaggedPacket {
    TaggedPacket {
        now,
        transport: TransportContext::default(),
        message: Packet::Rtp(rtp::Packet {
            header: rtp::Header {
                version: 2,
                ssrc,
                sequence_number: seq,
                marker,
                payload_type: 96,
                ..Default::default()
            },
            payload: vec![0u8; 200].into(),
            ..Default::default()
        }),
    }
}

fn sequence_number(pkt: &TaggedPacket) -> u16 {
    match &pkt.message {
        Packet::Rtp(rtp) => rtp.header.sequence_number,
        Packet::Rtcp(_) => panic!("Expected RTP packet"),
    }
}

/// A media sender and a media receiver connected back to back.
struct FeedbackLoop {
    sender: CcfbSenderInterceptor<NoopInterceptor>,
    receiver: CcfbReceiverInterceptor<NoopInterceptor>,
    start: Instant,
}

impl FeedbackLoop {
    fn new() -> Self {
        init_logger();

        let mut sender = Registry::new()
            .with(CcfbSenderBuilder::new().with_ect1_marking(true).build())
            .build();
        let mut receiver = Registry::new()
            .with(
                CcfbReceiverBuilder::new()
                    .with_sender_ssrc(FEEDBACK_SSRC)
                    .build(),
            )
            .build();

        let info = ccfb_stream(MEDIA_SSRC);
        sender.bind_local_stream(&info);
        receiver.bind_remote_stream(&info);

        Self {
            sender,
            receiver,
            start: Instant::now(),
        }
    }

    fn at(&self, ms: u64) -> Instant {
        self.start + Duration::from_millis(ms)
    }

    /// Hands a packet to the sender chain and returns what goes on the wire.
    fn send(&mut self, ms: u64, seq: u16, marker: bool) -> TaggedPacket {
        let now = self.at(ms);
        self.sender
            .handle_write(create_rtp_packet(now, MEDIA_SSRC, seq, marker))
            .unwrap();
        self.sender.poll_write().expect("packet on the wire")
    }

    /// Delivers a wire packet to the receiver chain at `ms`.
    fn deliver(&mut self, ms: u64, mut pkt: TaggedPacket) {
        let now = self.at(ms);
        pkt.now = now;
        self.receiver.handle_read(pkt).unwrap();
        while self.receiver.poll_read().is_some() {}
        self.pump(ms);
    }

    /// Fires the receiver's timer if due and carries feedback back.
    fn pump(&mut self, ms: u64) {
        let now = self.at(ms);
        if let Some(timeout) = self.receiver.poll_timeout()
            && timeout <= now
        {
            self.receiver.handle_timeout(now).unwrap();
        }

        while let Some(feedback) = self.receiver.poll_write() {
            let Packet::Rtcp(packets) = feedback.message else {
                panic!("Expected RTCP feedback");
            };
            let raw = rtcp::packet::marshal(&packets).unwrap();
            let parsed = rtcp::packet::unmarshal(&mut raw.clone()).unwrap();
            self.sender
                .handle_read(TaggedPacket {
                    now,
                    transport: TransportContext::default(),
                    message: Packet::Rtcp(parsed),
                })
                .unwrap();
            while self.sender.poll_read().is_some() {}
        }
    }

    fn sender_stats(&self) -> ReceivedCongestionControlFeedbackStats {
        self.sender
            .stats_per_ssrc()
            .get(&MEDIA_SSRC)
            .copied()
            .unwrap_or_default()
    }

    fn receiver_stats(&self) -> SentCongestionControllerFeedbackStats {
        self.receiver
            .stats_per_ssrc()
            .get(&MEDIA_SSRC)
            .copied()
            .unwrap_or_default()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn test_ccfb_ect1_round_trip() {
    let mut link = FeedbackLoop::new();

    for seq in 0..20u16 {
        let ms = u64::from(seq);
        let pkt = link.send(ms, seq, true);
        assert_eq!(pkt.transport.ecn, Some(EcnCodepoint::Ect1));
        link.deliver(ms, pkt);
    }
    link.pump(100);

    assert!(link.sender.num_feedback_received() >= 2);
    assert_eq!(
        link.sender_stats(),
        ReceivedCongestionControlFeedbackStats {
            num_packets_received_with_ect1: 20,
            ..Default::default()
        }
    );
    assert_eq!(link.receiver_stats(), SentCongestionControllerFeedbackStats::default());

    let mut acked = vec![];
    while let Some(feedback) = link.sender.poll_feedback() {
        for result in feedback.packet_feedbacks {
            assert!(result.is_received());
            acked.push(result.sent_packet.sequence_number);
        }
    }
    assert_eq!(acked, (0..20).collect::<Vec<u16>>());
}

#[test]
fn test_ccfb_bleaching_and_congestion_marks() {
    let mut link = FeedbackLoop::new();

    for seq in 0..20u16 {
        let ms = u64::from(seq);
        let mut pkt = link.send(ms, seq, true);
        // A middlebox strips ECN from every fourth packet and marks CE on
        // every fifth.
        if seq % 4 == 0 {
            pkt.transport.ecn = None;
        } else if seq % 5 == 0 {
            pkt.transport.ecn = Some(EcnCodepoint::Ce);
        }
        link.deliver(ms, pkt);
    }
    link.pump(100);

    // Bleached: 0 4 8 12 16. CE: 5 10 15.
    assert_eq!(
        link.sender_stats(),
        ReceivedCongestionControlFeedbackStats {
            num_packets_received_with_ect1: 12,
            num_packets_received_with_ce: 3,
            num_packets_with_bleached_ect1_marking: 5,
            ..Default::default()
        }
    );
}

#[test]
fn test_ccfb_loss_and_late_recovery() {
    let mut link = FeedbackLoop::new();

    let mut held_back = vec![];
    for seq in 1..=30u16 {
        let ms = u64::from(seq);
        let pkt = link.send(ms, seq, true);
        if (3..=5).contains(&seq) {
            held_back.push(pkt);
            continue;
        }
        link.deliver(ms, pkt);
    }
    link.pump(100);

    assert_eq!(link.sender_stats().num_packets_reported_as_lost, 3);
    assert_eq!(link.sender_stats().num_packets_reported_as_lost_but_recovered, 0);
    assert_eq!(link.receiver_stats().num_packets_reported_lost, 3);

    let lost: Vec<u16> = std::iter::from_fn(|| link.sender.poll_feedback())
        .flat_map(|f| f.lost_with_send_info())
        .map(|r| r.sent_packet.sequence_number)
        .collect();
    assert_eq!(lost, vec![3, 4, 5]);

    // Sequence number 3 shows up very late; 4 and 5 stay lost.
    let late = held_back.remove(0);
    assert_eq!(sequence_number(&late), 3);
    link.deliver(150, late);
    link.pump(300);

    let sender = link.sender_stats();
    assert_eq!(sender.num_packets_reported_as_lost, 3);
    assert_eq!(sender.num_packets_reported_as_lost_but_recovered, 1);
    assert_eq!(
        link.receiver_stats(),
        SentCongestionControllerFeedbackStats {
            num_packets_reported_lost: 3,
            num_packets_reported_recovered: 1,
        }
    );
}

#[test]
fn test_ccfb_feedback_without_marker_within_wait_bound() {
    let mut link = FeedbackLoop::new();

    for (ms, seq) in [(0, 0u16), (5, 1), (10, 2)] {
        let pkt = link.send(ms, seq, false);
        link.deliver(ms, pkt);
    }
    link.pump(24);
    assert_eq!(link.sender.num_feedback_received(), 0);

    link.pump(25);
    assert_eq!(link.sender.num_feedback_received(), 1);
    let feedback = link.sender.poll_feedback().expect("feedback");
    assert_eq!(feedback.packet_feedbacks.len(), 3);
    // Arrival offsets travel in 1/1024 s units.
    let waited = feedback.feedback_time - feedback.packet_feedbacks[0].receive_time.unwrap();
    assert!((waited - TimeDelta::from_millis(25)).abs() < TimeDelta::from_millis(1));
}

#[test]
fn test_ccfb_forged_feedback_is_ignored() {
    let mut link = FeedbackLoop::new();
    for seq in 0..5u16 {
        let _ = link.send(u64::from(seq), seq, true);
    }

    let forged = CongestionControlFeedback {
        sender_ssrc: 0xBAD,
        packets: vec![
            FeedbackPacketInfo {
                ssrc: 0xDEAD,
                sequence_number: 1,
                arrival_time_offset: ArrivalTimeOffset::NotReceived,
                ecn: EcnMarking::NotEct,
            },
            FeedbackPacketInfo {
                ssrc: MEDIA_SSRC,
                sequence_number: 3000,
                arrival_time_offset: ArrivalTimeOffset::Received(TimeDelta::zero()),
                ecn: EcnMarking::Ce,
            },
        ],
        report_timestamp_compact_ntp: 0,
    };
    link.sender
        .handle_read(TaggedPacket {
            now: link.at(10),
            transport: TransportContext::default(),
            message: Packet::Rtcp(vec![Box::new(forged)]),
        })
        .unwrap();

    assert_eq!(link.sender.num_feedback_received(), 1);
    assert!(link.sender.stats_per_ssrc().is_empty());
    assert!(link.sender.poll_feedback().is_none());
}

#[test]
fn test_ccfb_unbound_streams_are_not_tracked() {
    init_logger();
    let mut receiver = Registry::new()
        .with(CcfbReceiverBuilder::new().build())
        .build();
    receiver.bind_remote_stream(&StreamInfo {
        ssrc: MEDIA_SSRC,
        rtcp_feedback: vec![RTCPFeedback {
            typ: "transport-cc".to_string(),
            parameter: String::new(),
        }],
    });

    let now = Instant::now();
    for seq in 0..10u16 {
        receiver
            .handle_read(create_rtp_packet(now, MEDIA_SSRC, seq, true))
            .unwrap();
    }
    receiver.handle_timeout(now + Duration::from_secs(1)).unwrap();

    // Only the RTP packets come back out, on the read side.
    assert!(receiver.poll_write().is_none());
    assert_eq!(std::iter::from_fn(|| receiver.poll_read()).count(), 10);
}
