use serde::{Deserialize, Serialize};

/// Receiver side counters for one SSRC, accumulated over all reports sent.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentCongestionControllerFeedbackStats {
    /// Packets reported as not received. A packet is counted once no matter
    /// how many reports carry it.
    pub num_packets_reported_lost: u64,
    /// Packets first reported lost and later reported received.
    pub num_packets_reported_recovered: u64,
}

/// Sender side counters for one SSRC, derived from received reports.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedCongestionControlFeedbackStats {
    pub num_packets_received_with_ect1: u64,
    pub num_packets_received_with_ce: u64,
    /// Packets sent as ECT(1) that arrived without an ECN mark.
    pub num_packets_with_bleached_ect1_marking: u64,
    pub num_packets_reported_as_lost: u64,
    pub num_packets_reported_as_lost_but_recovered: u64,
}
