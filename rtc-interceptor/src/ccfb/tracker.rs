//! Per-SSRC bookkeeping of received RTP packets between feedback reports.

use std::collections::VecDeque;

use log::{trace, warn};
use rtcp::transport_feedbacks::congestion_control_feedback::{
    ArrivalTimeOffset, EcnMarking, FeedbackPacketInfo,
};
use shared::units::Timestamp;
use shared::util::SequenceUnwrapper;

use super::ReceivedPacket;
use super::stats::SentCongestionControllerFeedbackStats;

/// Upper bound of packets a single report may describe for one SSRC.
pub(crate) const MAX_PACKETS_PER_SSRC: i64 = 16384;
/// Packets kept after a report so late arrivals can still be reported.
pub(crate) const MAX_PACKETS_TO_KEEP_FOR_REORDER: i64 = 64;

#[derive(Default, Debug, Copy, Clone)]
struct TrackedPacket {
    arrival_time: Option<Timestamp>,
    ecn: EcnMarking,
    /// Whether the last report carrying this packet said "not received".
    last_reported_as_lost: bool,
}

impl TrackedPacket {
    fn received(&self) -> bool {
        self.arrival_time.is_some()
    }
}

/// Tracks which sequence numbers of one SSRC arrived, and how, since the
/// last feedback.
///
/// `packets[i]` describes unwrapped sequence number `first_sequence_number + i`.
/// Once the first packet arrived the window holds at least
/// [`MAX_PACKETS_TO_KEEP_FOR_REORDER`] entries, so a late packet is told
/// apart from a sequence number reset by position alone.
pub struct PerStreamFeedbackTracker {
    ssrc: u32,
    unwrapper: SequenceUnwrapper,
    packets: VecDeque<TrackedPacket>,
    first_sequence_number: i64,
    next_sequence_number_in_feedback: i64,
    num_ignored_packets_since_last_feedback: usize,
    stats: SentCongestionControllerFeedbackStats,
}

impl PerStreamFeedbackTracker {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            unwrapper: SequenceUnwrapper::new(),
            packets: VecDeque::new(),
            first_sequence_number: 0,
            next_sequence_number_in_feedback: 0,
            num_ignored_packets_since_last_feedback: 0,
            stats: SentCongestionControllerFeedbackStats::default(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn end_sequence_number(&self) -> i64 {
        self.first_sequence_number + self.packets.len() as i64
    }

    /// Returns the slot for `sequence_number`, growing the window if needed,
    /// or `None` when the packet falls outside what may be tracked.
    fn find_or_create(&mut self, sequence_number: i64) -> Option<&mut TrackedPacket> {
        if self.packets.is_empty() {
            // First packet, or first after a sequence number reset.
            self.packets.resize(
                MAX_PACKETS_TO_KEEP_FOR_REORDER as usize,
                TrackedPacket::default(),
            );
            self.first_sequence_number = sequence_number - MAX_PACKETS_TO_KEEP_FOR_REORDER + 1;
            self.next_sequence_number_in_feedback = sequence_number;
            return self.packets.back_mut();
        }

        if sequence_number < self.first_sequence_number {
            trace!(
                "ccfb: too old packet ssrc={} seq={}, expected seq >= {}, ignoring",
                self.ssrc, sequence_number, self.first_sequence_number
            );
            return None;
        }

        if sequence_number >= self.end_sequence_number() {
            let new_size = sequence_number - self.first_sequence_number + 1;
            if new_size > MAX_PACKETS_PER_SSRC {
                trace!(
                    "ccfb: too new packet ssrc={} seq={} would grow window to {} from {}, ignoring",
                    self.ssrc,
                    sequence_number,
                    new_size,
                    self.packets.len()
                );
                return None;
            }
            self.packets
                .resize(new_size as usize, TrackedPacket::default());
            return self.packets.back_mut();
        }

        let index = (sequence_number - self.first_sequence_number) as usize;
        self.packets.get_mut(index)
    }

    /// Records the arrival of `packet`.
    ///
    /// The first copy of a duplicate defines the arrival time. A later copy
    /// only matters when it upgrades the mark to CE, which re-reports it.
    pub fn received_packet(&mut self, packet: &ReceivedPacket) {
        debug_assert_eq!(packet.ssrc, self.ssrc);

        let sequence_number = self.unwrapper.unwrap(packet.sequence_number);
        let Some(info) = self.find_or_create(sequence_number) else {
            self.num_ignored_packets_since_last_feedback += 1;
            return;
        };

        if info.received() {
            if packet.ecn == EcnMarking::Ce && info.ecn != EcnMarking::Ce {
                info.ecn = EcnMarking::Ce;
            } else {
                return;
            }
        } else {
            info.arrival_time = Some(packet.arrival_time);
            info.ecn = packet.ecn;
        }

        if sequence_number < self.next_sequence_number_in_feedback {
            warn!(
                "ccfb: packet reordered between feedback, ssrc={} seq={} next in feedback={}",
                self.ssrc, packet.sequence_number, self.next_sequence_number_in_feedback
            );
            self.next_sequence_number_in_feedback = sequence_number;
        }
    }

    /// Appends every sequence number from the start of the next report to
    /// the newest known one, then trims the window.
    pub fn add_packets_to_feedback(
        &mut self,
        feedback_time: Timestamp,
        packet_feedback: &mut Vec<FeedbackPacketInfo>,
    ) {
        if self.packets.is_empty() {
            return;
        }

        debug_assert!(self.next_sequence_number_in_feedback >= self.first_sequence_number);
        debug_assert!(self.next_sequence_number_in_feedback <= self.end_sequence_number());

        if self.next_sequence_number_in_feedback == self.end_sequence_number() {
            if self.num_ignored_packets_since_last_feedback > 0 {
                // Only discarded packets since the last report: assume the
                // sender reset its sequence numbers and re-seed on the next one.
                warn!(
                    "ccfb: {} packets discarded and none accepted for ssrc={}, assuming sequence number reset",
                    self.num_ignored_packets_since_last_feedback, self.ssrc
                );
                self.packets.clear();
                self.num_ignored_packets_since_last_feedback = 0;
            }
            return;
        }
        self.num_ignored_packets_since_last_feedback = 0;

        let start = (self.next_sequence_number_in_feedback - self.first_sequence_number) as usize;
        let mut rtp_sequence_number = self.next_sequence_number_in_feedback as u16;
        for info in self.packets.iter_mut().skip(start) {
            if !info.received() && !info.last_reported_as_lost {
                self.stats.num_packets_reported_lost += 1;
                info.last_reported_as_lost = true;
            }
            if info.received() && info.last_reported_as_lost {
                self.stats.num_packets_reported_recovered += 1;
                info.last_reported_as_lost = false;
            }

            packet_feedback.push(FeedbackPacketInfo {
                ssrc: self.ssrc,
                sequence_number: rtp_sequence_number,
                arrival_time_offset: match info.arrival_time {
                    Some(arrival_time) => ArrivalTimeOffset::Received(feedback_time - arrival_time),
                    None => ArrivalTimeOffset::NotReceived,
                },
                ecn: info.ecn,
            });
            rtp_sequence_number = rtp_sequence_number.wrapping_add(1);
        }

        self.next_sequence_number_in_feedback = self.end_sequence_number();

        let num_to_erase = self.packets.len() as i64 - MAX_PACKETS_TO_KEEP_FOR_REORDER;
        if num_to_erase > 0 {
            self.packets.drain(..num_to_erase as usize);
            self.first_sequence_number += num_to_erase;
        }
    }

    pub fn stats(&self) -> SentCongestionControllerFeedbackStats {
        self.stats
    }
}
