//! CCFB (RFC 8888 Congestion Control Feedback) Interceptors
//!
//! This module implements the feedback loop described in
//! <https://datatracker.ietf.org/doc/html/rfc8888>:
//!
//! - [`CcfbReceiverInterceptor`]: observes incoming RTP packets and their ECN
//!   marks and sends rate limited `CongestionControlFeedback` reports.
//! - [`CcfbSenderInterceptor`]: remembers outgoing RTP packets, matches
//!   incoming reports against them and keeps per-SSRC ECN and loss counters.
//!
//! The underlying sans-IO pieces, [`CongestionControlFeedbackGenerator`] and
//! [`TransportFeedbackConsumer`], are usable without an interceptor chain.
//!
//! # Example
//!
//! ```ignore
//! use rtc_interceptor::{Registry, CcfbReceiverBuilder, CcfbSenderBuilder};
//!
//! let chain = Registry::new()
//!     .with(CcfbSenderBuilder::new().with_ect1_marking(true).build())
//!     .with(CcfbReceiverBuilder::new()
//!         .with_field_trial("min_send_delta:25ms,max_send_delta:500ms")
//!         .build())
//!     .build();
//! ```
//!
//! [`CcfbReceiverInterceptor`]: receiver::CcfbReceiverInterceptor
//! [`CcfbSenderInterceptor`]: sender::CcfbSenderInterceptor
//! [`CongestionControlFeedbackGenerator`]: generator::CongestionControlFeedbackGenerator
//! [`TransportFeedbackConsumer`]: consumer::TransportFeedbackConsumer

pub mod consumer;
pub mod generator;
pub mod receiver;
pub mod sender;
pub mod stats;
pub mod tracker;

use rtcp::transport_feedbacks::congestion_control_feedback::EcnMarking;
use shared::EcnCodepoint;
use shared::units::Timestamp;

use crate::stream_info::StreamInfo;

/// Field trial carrying generator overrides, see
/// [`FeedbackGeneratorConfig::parse`](generator::FeedbackGeneratorConfig::parse).
pub const CCFB_FIELD_TRIAL: &str = "WebRTC-RFC8888CongestionControlFeedback";

const CCFB_FEEDBACK_TYPE: &str = "ack";
const CCFB_FEEDBACK_PARAMETER: &str = "ccfb";

/// What the receiver side needs to know about one arrived RTP packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub ssrc: u32,
    pub sequence_number: u16,
    pub marker: bool,
    pub ecn: EcnMarking,
    pub arrival_time: Timestamp,
}

impl ReceivedPacket {
    pub fn new(packet: &rtp::Packet, ecn: Option<EcnCodepoint>, arrival_time: Timestamp) -> Self {
        Self {
            ssrc: packet.header.ssrc,
            sequence_number: packet.header.sequence_number,
            marker: packet.header.marker,
            ecn: ecn.into(),
            arrival_time,
        }
    }
}

/// Check if a stream negotiated `a=rtcp-fb:* ack ccfb`.
pub(crate) fn stream_supports_ccfb(info: &StreamInfo) -> bool {
    info.rtcp_feedback
        .iter()
        .any(|fb| fb.typ == CCFB_FEEDBACK_TYPE && fb.parameter == CCFB_FEEDBACK_PARAMETER)
}
