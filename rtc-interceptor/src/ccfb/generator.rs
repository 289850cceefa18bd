//! Receiver side report scheduling with a feedback rate ceiling.

use std::collections::{BTreeMap, VecDeque};

use log::{trace, warn};
use rtcp::transport_feedbacks::congestion_control_feedback::{
    CongestionControlFeedback, MAX_FEEDBACK_SIZE,
};
use shared::error::Result;
use shared::field_trial::FieldTrialParams;
use shared::marshal::MarshalSize;
use shared::time::{compact_ntp, timestamp_to_ntp};
use shared::units::{DataRate, DataSize, TimeDelta, Timestamp};

use super::ReceivedPacket;
use super::stats::SentCongestionControllerFeedbackStats;
use super::tracker::PerStreamFeedbackTracker;

/// Feedback may use at most this much bandwidth over time.
pub const MAX_FEEDBACK_RATE: DataRate = DataRate::from_kbps(500);

const DEFAULT_MIN_SEND_DELTA: TimeDelta = TimeDelta::from_millis(25);
const DEFAULT_MAX_WAIT_FOR_MARKER: TimeDelta = TimeDelta::from_millis(25);
const DEFAULT_MAX_SEND_DELTA: TimeDelta = TimeDelta::from_millis(500);

/// Report timing knobs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FeedbackGeneratorConfig {
    /// Shortest allowed gap between two reports.
    pub min_send_delta: TimeDelta,
    /// How long to hold a report back waiting for a frame's last packet.
    pub max_wait_for_marker: TimeDelta,
    /// Longest gap the rate limiter may impose.
    pub max_send_delta: TimeDelta,
}

impl Default for FeedbackGeneratorConfig {
    fn default() -> Self {
        Self {
            min_send_delta: DEFAULT_MIN_SEND_DELTA,
            max_wait_for_marker: DEFAULT_MAX_WAIT_FOR_MARKER,
            max_send_delta: DEFAULT_MAX_SEND_DELTA,
        }
    }
}

impl FeedbackGeneratorConfig {
    const KEYS: [&'static str; 3] = ["min_send_delta", "max_wait_for_marker", "max_send_delta"];

    /// Parses `min_send_delta`, `max_wait_for_marker` and `max_send_delta`
    /// overrides, e.g. `"min_send_delta:10ms,max_send_delta:250ms"`.
    pub fn parse(trial: &str) -> Result<Self> {
        let params = FieldTrialParams::parse(trial)?;
        for key in params.unknown_keys(&Self::KEYS) {
            warn!("ccfb: ignoring unknown field trial key {key}");
        }

        let mut config = Self::default();
        if let Some(v) = params.time_delta("min_send_delta")? {
            config.min_send_delta = v;
        }
        if let Some(v) = params.time_delta("max_wait_for_marker")? {
            config.max_wait_for_marker = v;
        }
        if let Some(v) = params.time_delta("max_send_delta")? {
            config.max_send_delta = v;
        }
        Ok(config)
    }

    /// Like [`parse`](Self::parse), falling back to defaults on error.
    pub fn from_field_trial(trial: &str) -> Self {
        match Self::parse(trial) {
            Ok(config) => config.validated(),
            Err(err) => {
                warn!("ccfb: invalid field trial {trial:?}: {err}, using defaults");
                Self::default()
            }
        }
    }

    /// Returns `self` if consistent, defaults otherwise.
    pub fn validated(self) -> Self {
        if self.min_send_delta < TimeDelta::zero()
            || self.max_wait_for_marker < TimeDelta::zero()
            || self.min_send_delta > self.max_send_delta
        {
            warn!(
                "ccfb: inconsistent config min_send_delta={} max_wait_for_marker={} max_send_delta={}, using defaults",
                self.min_send_delta, self.max_wait_for_marker, self.max_send_delta
            );
            return Self::default();
        }
        self
    }
}

/// Builds RFC 8888 reports for every SSRC seen and decides when to send them.
///
/// A report is due `min_send_delta` after the previous one, or once a packet
/// with the marker bit arrived, but never later than `max_wait_for_marker`
/// after the first packet since the last report. On top of that the total
/// report bandwidth is kept under [`MAX_FEEDBACK_RATE`] by tracking a byte
/// debt.
pub struct CongestionControlFeedbackGenerator {
    config: FeedbackGeneratorConfig,
    sender_ssrc: u32,
    trackers: BTreeMap<u32, PerStreamFeedbackTracker>,

    marker_bit_seen: bool,
    first_arrival_time_since_feedback: Option<Timestamp>,

    next_possible_feedback_send_time: Timestamp,
    last_feedback_sent_time: Option<Timestamp>,
    send_rate_debt: DataSize,

    feedback_queue: VecDeque<CongestionControlFeedback>,
}

impl CongestionControlFeedbackGenerator {
    pub fn new(config: FeedbackGeneratorConfig, sender_ssrc: u32) -> Self {
        Self {
            config: config.validated(),
            sender_ssrc,
            trackers: BTreeMap::new(),
            marker_bit_seen: false,
            first_arrival_time_since_feedback: None,
            next_possible_feedback_send_time: Timestamp::minus_infinity(),
            last_feedback_sent_time: None,
            send_rate_debt: DataSize::zero(),
            feedback_queue: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &FeedbackGeneratorConfig {
        &self.config
    }

    /// Records `packet`; the arrival time doubles as the current time.
    pub fn on_received_packet(&mut self, packet: &ReceivedPacket) {
        let now = packet.arrival_time;

        self.marker_bit_seen |= packet.marker;
        if self.first_arrival_time_since_feedback.is_none() {
            self.first_arrival_time_since_feedback = Some(now);
        }
        self.trackers
            .entry(packet.ssrc)
            .or_insert_with(|| PerStreamFeedbackTracker::new(packet.ssrc))
            .received_packet(packet);

        if self.next_feedback_time(now) < now {
            self.send_feedback(now);
        }
    }

    /// Sends a report if one is due and returns how long until the next
    /// call is needed.
    pub fn process(&mut self, now: Timestamp) -> TimeDelta {
        if self.next_feedback_time(now) <= now {
            self.send_feedback(now);
        }
        self.next_feedback_time(now) - now
    }

    pub(crate) fn next_feedback_time(&self, now: Timestamp) -> Timestamp {
        let Some(first_arrival) = self.first_arrival_time_since_feedback else {
            return (now + self.config.min_send_delta).max(self.next_possible_feedback_send_time);
        };

        if !self.marker_bit_seen {
            return self
                .next_possible_feedback_send_time
                .max(first_arrival + self.config.max_wait_for_marker);
        }
        self.next_possible_feedback_send_time
    }

    fn send_feedback(&mut self, now: Timestamp) {
        let report_timestamp_compact_ntp = compact_ntp(timestamp_to_ntp(now));

        let mut packets = vec![];
        for tracker in self.trackers.values_mut() {
            tracker.add_packets_to_feedback(now, &mut packets);
        }
        self.marker_bit_seen = false;
        self.first_arrival_time_since_feedback = None;

        let num_packets = packets.len();
        let feedback = CongestionControlFeedback {
            sender_ssrc: self.sender_ssrc,
            packets,
            report_timestamp_compact_ntp,
        };
        // Too many packets for the RTCP length field go out as several reports.
        let parts = feedback.split(MAX_FEEDBACK_SIZE);
        let size = DataSize::from_bytes(parts.iter().map(|p| p.marshal_size() as i64).sum());
        self.calculate_next_possible_send_time(size, now);

        trace!(
            "ccfb: feedback with {} packets in {} reports ({}) at {}, next possible at {}",
            num_packets,
            parts.len(),
            size,
            now,
            self.next_possible_feedback_send_time
        );
        self.feedback_queue.extend(parts);
    }

    fn calculate_next_possible_send_time(&mut self, feedback_size: DataSize, now: Timestamp) {
        let time_since_last_sent = match self.last_feedback_sent_time {
            Some(last) => now - last,
            None => TimeDelta::zero(),
        };
        let debt_payed = time_since_last_sent * MAX_FEEDBACK_RATE;
        self.send_rate_debt = if debt_payed > self.send_rate_debt {
            DataSize::zero()
        } else {
            self.send_rate_debt - debt_payed
        };
        self.send_rate_debt += feedback_size;
        self.last_feedback_sent_time = Some(now);
        self.next_possible_feedback_send_time = now
            + (self.send_rate_debt / MAX_FEEDBACK_RATE)
                .clamp(self.config.min_send_delta, self.config.max_send_delta);
    }

    /// Next queued report, oldest first.
    pub fn poll_feedback(&mut self) -> Option<CongestionControlFeedback> {
        self.feedback_queue.pop_front()
    }

    /// Loss and recovery counters per SSRC, in ascending SSRC order.
    pub fn stats_per_ssrc(&self) -> BTreeMap<u32, SentCongestionControllerFeedbackStats> {
        self.trackers
            .iter()
            .map(|(ssrc, tracker)| (*ssrc, tracker.stats()))
            .collect()
    }
}
