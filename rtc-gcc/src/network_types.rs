//! Messages exchanged between the probe controller, the bandwidth
//! estimator and the pacer.

use std::fmt;

use shared::units::{DataRate, TimeDelta, Timestamp};

/// Instruction to the pacer: send a burst of probe packets at
/// `target_data_rate`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProbeClusterConfig {
    pub at_time: Timestamp,
    /// Unique per controller, strictly increasing.
    pub id: i32,
    pub target_data_rate: DataRate,
    /// Minimum time the cluster should span.
    pub target_duration: TimeDelta,
    /// Minimum gap between bursts inside the cluster.
    pub min_probe_delta: TimeDelta,
    /// Minimum number of packets in the cluster.
    pub target_probe_count: i32,
}

impl Default for ProbeClusterConfig {
    fn default() -> Self {
        Self {
            at_time: Timestamp::plus_infinity(),
            id: 0,
            target_data_rate: DataRate::zero(),
            target_duration: TimeDelta::zero(),
            min_probe_delta: TimeDelta::from_millis(2),
            target_probe_count: 0,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NetworkAvailability {
    pub at_time: Timestamp,
    pub network_available: bool,
}

impl Default for NetworkAvailability {
    fn default() -> Self {
        Self {
            at_time: Timestamp::plus_infinity(),
            network_available: false,
        }
    }
}

/// Link capacity hint from an external estimator.
///
/// Only `link_capacity_upper` drives probing; unknown values are minus
/// infinity.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct NetworkStateEstimate {
    pub update_time: Timestamp,
    pub link_capacity: DataRate,
    pub link_capacity_lower: DataRate,
    pub link_capacity_upper: DataRate,
    pub propagation_delay: TimeDelta,
    pub confidence: f64,
}

impl Default for NetworkStateEstimate {
    fn default() -> Self {
        Self {
            update_time: Timestamp::minus_infinity(),
            link_capacity: DataRate::minus_infinity(),
            link_capacity_lower: DataRate::minus_infinity(),
            link_capacity_upper: DataRate::minus_infinity(),
            propagation_delay: TimeDelta::minus_infinity(),
            confidence: f64::NAN,
        }
    }
}

/// Why the current bandwidth estimate is where it is.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum BandwidthLimitedCause {
    LossLimitedBweIncreasing,
    LossLimitedBwe,
    #[default]
    DelayBasedLimited,
    DelayBasedLimitedDelayIncreased,
    RttBasedBackOffHighRtt,
}

impl BandwidthLimitedCause {
    /// Probing is pointless while the estimator is backing off.
    pub fn blocks_probing(&self) -> bool {
        matches!(
            self,
            BandwidthLimitedCause::LossLimitedBwe
                | BandwidthLimitedCause::DelayBasedLimitedDelayIncreased
                | BandwidthLimitedCause::RttBasedBackOffHighRtt
        )
    }
}

impl fmt::Display for BandwidthLimitedCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            BandwidthLimitedCause::LossLimitedBweIncreasing => "LossLimitedBweIncreasing",
            BandwidthLimitedCause::LossLimitedBwe => "LossLimitedBwe",
            BandwidthLimitedCause::DelayBasedLimited => "DelayBasedLimited",
            BandwidthLimitedCause::DelayBasedLimitedDelayIncreased => {
                "DelayBasedLimitedDelayIncreased"
            }
            BandwidthLimitedCause::RttBasedBackOffHighRtt => "RttBasedBackOffHighRtt",
        };
        write!(f, "{s}")
    }
}

/// Session-wide bitrate bounds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BitrateConstraints {
    pub min_bitrate: DataRate,
    /// Only set when the estimator should restart from this value.
    pub start_bitrate: Option<DataRate>,
    pub max_bitrate: DataRate,
}

impl Default for BitrateConstraints {
    fn default() -> Self {
        Self {
            min_bitrate: DataRate::zero(),
            start_bitrate: None,
            max_bitrate: DataRate::plus_infinity(),
        }
    }
}
