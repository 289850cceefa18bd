//! RTC Interceptor - Sans-IO interceptor framework for RTP/RTCP processing.
//!
//! This crate provides a composable interceptor framework built on top of the
//! [`sansio::Protocol`] trait. Interceptors can process, modify, or generate
//! RTP/RTCP packets as they flow through the pipeline.
//!
//! # Available Interceptors
//!
//! ## CCFB (RFC 8888 Congestion Control Feedback)
//!
//! | Interceptor | Description |
//! |-------------|-------------|
//! | [`CcfbReceiverInterceptor`] | Observes incoming RTP and their ECN marks, sends rate limited CongestionControlFeedback reports |
//! | [`CcfbSenderInterceptor`] | Remembers outgoing RTP, reconciles incoming reports and keeps per-SSRC ECN and loss counters |
//!
//! ## Utility
//!
//! | Interceptor | Description |
//! |-------------|-------------|
//! | [`NoopInterceptor`] | Pass-through terminal for interceptor chains |
//!
//! # Design
//!
//! Each interceptor wraps an inner `Interceptor`. The CCFB receiver watches
//! incoming RTP and queues feedback RTCP on the write side; the CCFB sender
//! watches outgoing RTP and consumes that feedback on the read side. Both
//! pass every packet through to the inner layer untouched, apart from the
//! ECN codepoint the sender may set on outgoing media.
//!
//! All calls (`handle_*`, `poll_*`) walk the chain from the outermost layer
//! inward, for reads and writes alike. Whether a packet is inbound or
//! outbound is decided by its content, not by call order. The innermost
//! layer is normally [`NoopInterceptor`], which queues whatever reaches it.
//!
//! # Quick Start
//!
//! ```ignore
//! use rtc_interceptor::{Registry, CcfbReceiverBuilder, CcfbSenderBuilder};
//!
//! // Both directions of an RFC 8888 feedback loop
//! let chain = Registry::new()
//!     .with(CcfbSenderBuilder::new()
//!         .with_ect1_marking(true)
//!         .build())
//!     .with(CcfbReceiverBuilder::new()
//!         .with_field_trial("min_send_delta:25ms,max_wait_for_marker:25ms")
//!         .build())
//!     .build();
//! ```
//!
//! # Stream Binding
//!
//! Before interceptors can process packets for a stream, the stream must be bound:
//!
//! ```ignore
//! use rtc_interceptor::{StreamInfo, RTCPFeedback};
//!
//! // Create stream info that negotiated `a=rtcp-fb:96 ack ccfb`
//! let stream_info = StreamInfo {
//!     ssrc: 0x12345678,
//!     rtcp_feedback: vec![RTCPFeedback {
//!         typ: "ack".to_string(),
//!         parameter: "ccfb".to_string(),
//!     }],
//! };
//!
//! // Bind for outgoing streams (sender side)
//! chain.bind_local_stream(&stream_info);
//!
//! // Bind for incoming streams (receiver side)
//! chain.bind_remote_stream(&stream_info);
//! ```

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

use shared::TransportMessage;
use std::time::Instant;

mod noop;
mod registry;

pub mod ccfb;
pub(crate) mod stream_info;

pub use ccfb::{
    CCFB_FIELD_TRIAL, ReceivedPacket,
    consumer::{PacketResult, PacketSendRecord, TransportFeedbackConsumer, TransportPacketsFeedback},
    generator::{CongestionControlFeedbackGenerator, FeedbackGeneratorConfig, MAX_FEEDBACK_RATE},
    receiver::{CcfbReceiverBuilder, CcfbReceiverInterceptor},
    sender::{CcfbSenderBuilder, CcfbSenderInterceptor},
    stats::{ReceivedCongestionControlFeedbackStats, SentCongestionControllerFeedbackStats},
    tracker::PerStreamFeedbackTracker,
};
pub use noop::NoopInterceptor;
pub use registry::Registry;
pub use stream_info::{RTCPFeedback, StreamInfo};

/// RTP/RTCP Packet
///
/// An enum representing either an RTP or RTCP packet that can be processed
/// by interceptors in the chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// RTP (Real-time Transport Protocol) packet containing media data
    Rtp(rtp::Packet),
    /// RTCP (RTP Control Protocol) packets for feedback and statistics
    Rtcp(Vec<Box<dyn rtcp::Packet>>),
}

/// Tagged packet with transport metadata.
///
/// A [`TransportMessage`] wrapping a [`Packet`], which includes transport-level
/// context such as source/destination addresses and protocol information.
/// This is the primary message type passed through interceptor chains.
pub type TaggedPacket = TransportMessage<Packet>;

/// Trait for RTP/RTCP interceptors with fixed Protocol type parameters.
///
/// `Interceptor` is a marker trait that requires implementors to also implement
/// [`sansio::Protocol`] with specific fixed type parameters for RTP/RTCP processing:
/// - `Rin`, `Win`, `Rout`, `Wout` = [`TaggedPacket`]
/// - `Ein`, `Eout` = `()`
/// - `Time` = [`Instant`]
/// - `Error` = [`shared::error::Error`]
///
/// This trait adds stream binding methods and provides a [`with()`](Interceptor::with)
/// method for composable chaining of interceptors.
///
/// Each interceptor must explicitly implement both `Protocol` and `Interceptor` traits.
///
/// # Example
///
/// ```ignore
/// // Define a custom interceptor
/// pub struct MyInterceptor<P> {
///     inner: P,
/// }
///
/// impl<P: Interceptor> Protocol<TaggedPacket, TaggedPacket, ()> for MyInterceptor<P> {
///     type Rout = TaggedPacket;
///     type Wout = TaggedPacket;
///     type Eout = ();
///     type Time = Instant;
///     type Error = shared::error::Error;
///     // ... implement Protocol methods
/// }
///
/// impl<P: Interceptor> Interceptor for MyInterceptor<P> {
///     fn bind_local_stream(&mut self, _info: &StreamInfo) {}
///     fn unbind_local_stream(&mut self, _info: &StreamInfo) {}
///     fn bind_remote_stream(&mut self, _info: &StreamInfo) {}
///     fn unbind_remote_stream(&mut self, _info: &StreamInfo) {}
/// }
///
/// // Use with the builder
/// let chain = Registry::new()
///     .with(MyInterceptor::new);
/// ```
pub trait Interceptor:
    sansio::Protocol<
        TaggedPacket,
        TaggedPacket,
        (),
        Rout = TaggedPacket,
        Wout = TaggedPacket,
        Eout = (),
        Time = Instant,
        Error = shared::error::Error,
    > + Sized
{
    /// Wrap this interceptor with another layer.
    ///
    /// The wrapper function receives `self` and returns a new interceptor
    /// that wraps it.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use rtc_interceptor::{NoopInterceptor, CcfbReceiverBuilder};
    ///
    /// // Using the builder pattern (recommended)
    /// let chain = NoopInterceptor::new()
    ///     .with(CcfbReceiverBuilder::new().with_sender_ssrc(1).build());
    /// ```
    fn with<O, F>(self, f: F) -> O
    where
        F: FnOnce(Self) -> O,
        O: Interceptor,
    {
        f(self)
    }

    /// bind_local_stream lets you modify any outgoing RTP packets. It is called once for per LocalStream. The returned method
    /// will be called once per rtp packet.
    fn bind_local_stream(&mut self, info: &StreamInfo);

    /// unbind_local_stream is called when the Stream is removed. It can be used to clean up any data related to that track.
    fn unbind_local_stream(&mut self, info: &StreamInfo);

    /// bind_remote_stream lets you modify any incoming RTP packets. It is called once for per RemoteStream. The returned method
    /// will be called once per rtp packet.
    fn bind_remote_stream(&mut self, info: &StreamInfo);

    /// unbind_remote_stream is called when the Stream is removed. It can be used to clean up any data related to that track.
    fn unbind_remote_stream(&mut self, info: &StreamInfo);
}
