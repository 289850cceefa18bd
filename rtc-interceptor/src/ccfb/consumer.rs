//! Sender side reconciliation of RFC 8888 reports against sent packets.

use std::collections::BTreeMap;

use log::{debug, trace};
use rtcp::transport_feedbacks::congestion_control_feedback::{
    ArrivalTimeOffset, CongestionControlFeedback, EcnMarking,
};
use shared::time::compact_ntp_diff;
use shared::units::{DataSize, Timestamp};
use shared::util::SequenceUnwrapper;

use super::stats::ReceivedCongestionControlFeedbackStats;

/// Sent packets remembered per SSRC, counted in unwrapped sequence numbers.
pub(crate) const MAX_SENT_PACKETS_PER_SSRC: i64 = 16384;

/// One RTP packet as it was handed to the transport.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketSendRecord {
    pub ssrc: u32,
    pub sequence_number: u16,
    pub sent_as_ect1: bool,
    pub send_time: Timestamp,
    pub size: DataSize,
}

#[derive(Debug, Copy, Clone)]
struct SentPacket {
    record: PacketSendRecord,
    reported_lost: bool,
}

#[derive(Default)]
struct SentStream {
    unwrapper: SequenceUnwrapper,
    packets: BTreeMap<i64, SentPacket>,
}

impl SentStream {
    fn insert(&mut self, record: PacketSendRecord) {
        let sequence_number = self.unwrapper.unwrap(record.sequence_number);
        self.packets.insert(
            sequence_number,
            SentPacket {
                record,
                reported_lost: false,
            },
        );

        let newest = self
            .unwrapper
            .last_unwrapped()
            .unwrap_or(sequence_number);
        while let Some((&oldest, _)) = self.packets.first_key_value() {
            if newest - oldest < MAX_SENT_PACKETS_PER_SSRC {
                break;
            }
            self.packets.pop_first();
        }
    }

    fn get_mut(&mut self, sequence_number: u16) -> Option<&mut SentPacket> {
        let sequence_number = self.unwrapper.peek_unwrap(sequence_number);
        self.packets.get_mut(&sequence_number)
    }
}

/// A sent packet together with what the remote end reported about it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketResult {
    pub sent_packet: PacketSendRecord,
    pub ecn: EcnMarking,
    /// Remote arrival time in the local clock, `None` if reported lost.
    /// Arrival offsets the report could not represent yield an infinite
    /// timestamp.
    pub receive_time: Option<Timestamp>,
}

impl PacketResult {
    pub fn is_received(&self) -> bool {
        self.receive_time.is_some()
    }
}

/// Outcome of one report, handed to the bandwidth estimator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransportPacketsFeedback {
    /// Local time the report arrived.
    pub feedback_time: Timestamp,
    /// Matched packets in report order.
    pub packet_feedbacks: Vec<PacketResult>,
}

impl TransportPacketsFeedback {
    pub fn received_with_send_info(&self) -> Vec<PacketResult> {
        self.packet_feedbacks
            .iter()
            .filter(|p| p.is_received())
            .copied()
            .collect()
    }

    pub fn lost_with_send_info(&self) -> Vec<PacketResult> {
        self.packet_feedbacks
            .iter()
            .filter(|p| !p.is_received())
            .copied()
            .collect()
    }

    pub fn packets_with_feedback(&self) -> &[PacketResult] {
        &self.packet_feedbacks
    }
}

/// Matches RFC 8888 reports with the packets this endpoint sent.
///
/// Report entries that do not refer to a remembered `(ssrc, sequence number)`
/// are dropped without touching any counter, so spoofed or stale reports
/// cannot skew the statistics. Sequence numbers a report leaves out are never
/// treated as lost; only explicit "not received" entries are.
#[derive(Default)]
pub struct TransportFeedbackConsumer {
    streams: BTreeMap<u32, SentStream>,
    stats: BTreeMap<u32, ReceivedCongestionControlFeedbackStats>,
    /// Compact NTP timestamp of the last report and the local time it maps to.
    last_report: Option<(u32, Timestamp)>,
}

impl TransportFeedbackConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_sent_packet(&mut self, record: PacketSendRecord) {
        self.streams.entry(record.ssrc).or_default().insert(record);
    }

    /// Applies `feedback` received at `receive_time`. Returns the matched
    /// packets, or `None` if the report did not refer to any known packet.
    pub fn on_congestion_control_feedback(
        &mut self,
        receive_time: Timestamp,
        feedback: &CongestionControlFeedback,
    ) -> Option<TransportPacketsFeedback> {
        // Report timestamps are in the remote clock; only their differences
        // are meaningful here.
        let report_time = match self.last_report {
            Some((last_ntp, last_time)) => {
                last_time + compact_ntp_diff(last_ntp, feedback.report_timestamp_compact_ntp)
            }
            None => receive_time,
        };
        self.last_report = Some((feedback.report_timestamp_compact_ntp, report_time));

        let mut packet_feedbacks = vec![];
        let mut ignored = 0usize;
        for info in &feedback.packets {
            let Some(sent) = self
                .streams
                .get_mut(&info.ssrc)
                .and_then(|stream| stream.get_mut(info.sequence_number))
            else {
                ignored += 1;
                continue;
            };

            let stats = self.stats.entry(info.ssrc).or_default();
            let receive_time = match info.arrival_time_offset {
                ArrivalTimeOffset::NotReceived => {
                    if !sent.reported_lost {
                        stats.num_packets_reported_as_lost += 1;
                        sent.reported_lost = true;
                    }
                    None
                }
                ArrivalTimeOffset::Received(offset) => {
                    match info.ecn {
                        EcnMarking::Ect1 if sent.record.sent_as_ect1 => {
                            stats.num_packets_received_with_ect1 += 1;
                        }
                        EcnMarking::Ce => stats.num_packets_received_with_ce += 1,
                        EcnMarking::NotEct if sent.record.sent_as_ect1 => {
                            stats.num_packets_with_bleached_ect1_marking += 1;
                        }
                        _ => {}
                    }
                    if sent.reported_lost {
                        stats.num_packets_reported_as_lost_but_recovered += 1;
                        sent.reported_lost = false;
                    }
                    Some(report_time - offset)
                }
            };

            packet_feedbacks.push(PacketResult {
                sent_packet: sent.record,
                ecn: info.ecn,
                receive_time,
            });
        }

        if ignored > 0 {
            debug!(
                "ccfb: ignored {} of {} report entries for unknown packets",
                ignored,
                feedback.packets.len()
            );
        }
        if packet_feedbacks.is_empty() {
            return None;
        }
        trace!(
            "ccfb: feedback from ssrc={} matched {} packets",
            feedback.sender_ssrc,
            packet_feedbacks.len()
        );

        Some(TransportPacketsFeedback {
            feedback_time: receive_time,
            packet_feedbacks,
        })
    }

    /// Counters per SSRC, in ascending SSRC order. SSRCs without any matched
    /// report entry are absent.
    pub fn stats_per_ssrc(&self) -> BTreeMap<u32, ReceivedCongestionControlFeedbackStats> {
        self.stats.clone()
    }

    /// Clears all counters. Sent packets stay known.
    pub fn reset(&mut self) {
        self.stats.clear();
        for stream in self.streams.values_mut() {
            for sent in stream.packets.values_mut() {
                sent.reported_lost = false;
            }
        }
    }
}
