//! CCFB Receiver Interceptor - observes incoming RTP and sends RFC 8888 feedback.

use super::generator::{CongestionControlFeedbackGenerator, FeedbackGeneratorConfig};
use super::stats::SentCongestionControllerFeedbackStats;
use super::{ReceivedPacket, stream_supports_ccfb};
use crate::stream_info::StreamInfo;
use crate::{Interceptor, Packet, TaggedPacket};
use shared::TransportContext;
use shared::error::Error;
use shared::time::SystemInstant;
use shared::units::{TimeDelta, Timestamp};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::time::{Duration, Instant};

/// Builder for the CcfbReceiverInterceptor.
///
/// # Example
///
/// ```ignore
/// use rtc_interceptor::{Registry, CcfbReceiverBuilder};
///
/// let chain = Registry::new()
///     .with(CcfbReceiverBuilder::new()
///         .with_field_trial("max_wait_for_marker:10ms")
///         .build())
///     .build();
/// ```
pub struct CcfbReceiverBuilder<P> {
    config: FeedbackGeneratorConfig,
    /// SSRC reports are sent from; random when unset.
    sender_ssrc: Option<u32>,
    _phantom: PhantomData<P>,
}

impl<P> Default for CcfbReceiverBuilder<P> {
    fn default() -> Self {
        Self {
            config: FeedbackGeneratorConfig::default(),
            sender_ssrc: None,
            _phantom: PhantomData,
        }
    }
}

impl<P> CcfbReceiverBuilder<P> {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the report timing.
    pub fn with_config(mut self, config: FeedbackGeneratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the report timing from a field trial string. Malformed strings
    /// are logged and leave the defaults in place.
    pub fn with_field_trial(mut self, trial: &str) -> Self {
        self.config = FeedbackGeneratorConfig::from_field_trial(trial);
        self
    }

    /// Set the SSRC reports are sent from.
    pub fn with_sender_ssrc(mut self, ssrc: u32) -> Self {
        self.sender_ssrc = Some(ssrc);
        self
    }

    /// Build the interceptor factory function.
    pub fn build(self) -> impl FnOnce(P) -> CcfbReceiverInterceptor<P> {
        move |inner| {
            CcfbReceiverInterceptor::new(
                inner,
                self.config,
                self.sender_ssrc.unwrap_or_else(rand::random),
            )
        }
    }
}

/// Interceptor that turns incoming RTP packets of streams negotiated with
/// `ack ccfb` into RFC 8888 `CongestionControlFeedback` reports.
///
/// Reports are queued ahead of anything the inner interceptor writes.
pub struct CcfbReceiverInterceptor<P> {
    inner: P,

    generator: CongestionControlFeedbackGenerator,

    /// Maps `Instant` to wall clock time, anchored at the first packet or
    /// timeout seen.
    clock: Option<SystemInstant>,

    /// Remote SSRCs that negotiated CCFB.
    streams: HashSet<u32>,

    /// Queue for feedback packets.
    write_queue: VecDeque<TaggedPacket>,

    /// When the generator wants to be processed next.
    next_timeout: Option<Instant>,
}

impl<P> CcfbReceiverInterceptor<P> {
    fn new(inner: P, config: FeedbackGeneratorConfig, sender_ssrc: u32) -> Self {
        Self {
            inner,
            generator: CongestionControlFeedbackGenerator::new(config, sender_ssrc),
            clock: None,
            streams: HashSet::new(),
            write_queue: VecDeque::new(),
            next_timeout: None,
        }
    }

    /// Loss and recovery counters per remote SSRC, in ascending SSRC order.
    pub fn stats_per_ssrc(&self) -> BTreeMap<u32, SentCongestionControllerFeedbackStats> {
        self.generator.stats_per_ssrc()
    }

    fn timestamp(&mut self, now: Instant) -> Timestamp {
        let clock = *self.clock.get_or_insert_with(|| {
            SystemInstant::new(now, SystemInstant::now().duration_since_unix_epoch())
        });
        clock.timestamp(now)
    }

    fn queue_feedback(&mut self, now: Instant) {
        while let Some(feedback) = self.generator.poll_feedback() {
            self.write_queue.push_back(TaggedPacket {
                now,
                transport: TransportContext::default(),
                message: Packet::Rtcp(vec![Box::new(feedback)]),
            });
        }
    }
}

fn deadline(now: Instant, delay: TimeDelta) -> Option<Instant> {
    if delay.is_plus_infinity() {
        return None;
    }
    now.checked_add(Duration::from_micros(delay.us().max(0) as u64))
}

impl<P: Interceptor> sansio::Protocol<TaggedPacket, TaggedPacket, ()>
    for CcfbReceiverInterceptor<P>
{
    type Rout = TaggedPacket;
    type Wout = TaggedPacket;
    type Eout = ();
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedPacket) -> Result<(), Self::Error> {
        if let Packet::Rtp(ref rtp_packet) = msg.message
            && self.streams.contains(&rtp_packet.header.ssrc)
        {
            let arrival_time = self.timestamp(msg.now);
            let packet = ReceivedPacket::new(rtp_packet, msg.transport.ecn, arrival_time);
            self.generator.on_received_packet(&packet);
            self.queue_feedback(msg.now);

            let next = self.generator.next_feedback_time(arrival_time);
            self.next_timeout = deadline(msg.now, next - arrival_time);
        }

        self.inner.handle_read(msg)
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.inner.poll_read()
    }

    fn handle_write(&mut self, msg: TaggedPacket) -> Result<(), Self::Error> {
        self.inner.handle_write(msg)
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        // First drain feedback packets
        if let Some(pkt) = self.write_queue.pop_front() {
            return Some(pkt);
        }
        self.inner.poll_write()
    }

    fn handle_event(&mut self, evt: ()) -> Result<(), Self::Error> {
        self.inner.handle_event(evt)
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.inner.poll_event()
    }

    fn handle_timeout(&mut self, now: Self::Time) -> Result<(), Self::Error> {
        if let Some(timeout) = self.next_timeout
            && now >= timeout
        {
            let ts = self.timestamp(now);
            let delay = self.generator.process(ts);
            self.queue_feedback(now);
            self.next_timeout = deadline(now, delay);
        }
        self.inner.handle_timeout(now)
    }

    fn poll_timeout(&mut self) -> Option<Self::Time> {
        let inner_timeout = self.inner.poll_timeout();

        match (self.next_timeout, inner_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.write_queue.clear();
        self.next_timeout = None;
        self.inner.close()
    }
}

impl<P: Interceptor> Interceptor for CcfbReceiverInterceptor<P> {
    fn bind_local_stream(&mut self, info: &StreamInfo) {
        self.inner.bind_local_stream(info);
    }

    fn unbind_local_stream(&mut self, info: &StreamInfo) {
        self.inner.unbind_local_stream(info);
    }

    fn bind_remote_stream(&mut self, info: &StreamInfo) {
        if stream_supports_ccfb(info) {
            self.streams.insert(info.ssrc);
        }
        self.inner.bind_remote_stream(info);
    }

    fn unbind_remote_stream(&mut self, info: &StreamInfo) {
        self.streams.remove(&info.ssrc);
        self.inner.unbind_remote_stream(info);
    }
}
