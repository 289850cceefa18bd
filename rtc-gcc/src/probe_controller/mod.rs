//! Bandwidth probe scheduling.
//!
//! [`ProbeController`] decides when the pacer should send bursts of padding
//! or media faster than the current estimate to find out whether more
//! capacity is available. It is driven by calls from the bandwidth
//! estimator and a periodic [`process`](ProbeController::process) tick, and
//! answers every call with the probe clusters to send now.


mod config;

pub use config::{PROBING_CONFIGURATION_FIELD_TRIAL, ProbeControllerConfig};

use log::{debug, info, warn};
use shared::units::{DataRate, TimeDelta, Timestamp};

use crate::network_types::{
    BandwidthLimitedCause, NetworkAvailability, NetworkStateEstimate, ProbeClusterConfig,
};

/// Probes are considered lost if no estimate arrives within this time.
const MAX_WAITING_TIME_FOR_PROBING_RESULT: TimeDelta = TimeDelta::from_seconds(1);

/// Probe ceiling when the application did not set a max bitrate.
const DEFAULT_MAX_PROBING_BITRATE: DataRate = DataRate::from_kbps(5000);

// A drop to this fraction of the estimate or lower, recovered from within
// BITRATE_DROP_TIMEOUT, is answered with a probe at PROBE_FRACTION_AFTER_DROP
// of the rate before the drop.
const BITRATE_DROP_THRESHOLD: f64 = 0.66;
const BITRATE_DROP_TIMEOUT: TimeDelta = TimeDelta::from_seconds(5);
const PROBE_FRACTION_AFTER_DROP: f64 = 0.85;

/// Drop recovery probes are still allowed this long after leaving ALR.
const ALR_ENDED_TIMEOUT: TimeDelta = TimeDelta::from_seconds(3);

const MIN_TIME_BETWEEN_ALR_PROBES: TimeDelta = TimeDelta::from_seconds(5);

/// Expected probe result uncertainty as a fraction of the target rate.
const PROBE_UNCERTAINTY: f64 = 0.05;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProbingState {
    /// No probing has been triggered yet.
    Init,
    /// Waiting for an estimate to decide whether to probe further.
    WaitingForProbingResult,
    /// Startup probing is over. Periodic probes may still fire.
    ProbingComplete,
}

/// Controls initial capacity probing and probing during a session, e.g.
/// when the application raises its max bitrate.
pub struct ProbeController {
    config: ProbeControllerConfig,
    state: ProbingState,

    network_available: bool,
    enable_periodic_alr_probing: bool,
    repeated_initial_probing_enabled: bool,
    in_rapid_recovery: bool,
    last_allowed_repeated_initial_probe: Timestamp,

    bandwidth_limited_cause: BandwidthLimitedCause,
    min_bitrate_to_probe_further: DataRate,
    time_last_probing_initiated: Timestamp,
    estimated_bitrate: DataRate,
    network_estimate: Option<NetworkStateEstimate>,
    start_bitrate: DataRate,
    max_bitrate: DataRate,
    max_total_allocated_bitrate: DataRate,

    alr_start_time: Option<Timestamp>,
    alr_end_time: Option<Timestamp>,
    last_bwe_drop_probing_time: Timestamp,
    time_of_last_large_drop: Timestamp,
    bitrate_before_last_large_drop: DataRate,

    next_probe_cluster_id: i32,
}

impl Default for ProbeController {
    fn default() -> Self {
        Self::new(ProbeControllerConfig::default())
    }
}

impl ProbeController {
    pub fn new(config: ProbeControllerConfig) -> Self {
        let mut controller = Self {
            config,
            state: ProbingState::Init,
            network_available: false,
            enable_periodic_alr_probing: false,
            repeated_initial_probing_enabled: false,
            in_rapid_recovery: false,
            last_allowed_repeated_initial_probe: Timestamp::minus_infinity(),
            bandwidth_limited_cause: BandwidthLimitedCause::DelayBasedLimited,
            min_bitrate_to_probe_further: DataRate::plus_infinity(),
            time_last_probing_initiated: Timestamp::minus_infinity(),
            estimated_bitrate: DataRate::zero(),
            network_estimate: None,
            start_bitrate: DataRate::zero(),
            max_bitrate: DataRate::plus_infinity(),
            max_total_allocated_bitrate: DataRate::zero(),
            alr_start_time: None,
            alr_end_time: None,
            last_bwe_drop_probing_time: Timestamp::zero(),
            time_of_last_large_drop: Timestamp::minus_infinity(),
            bitrate_before_last_large_drop: DataRate::zero(),
            next_probe_cluster_id: 1,
        };
        controller.reset(Timestamp::zero());
        controller
    }

    pub fn config(&self) -> &ProbeControllerConfig {
        &self.config
    }

    pub fn state(&self) -> ProbingState {
        self.state
    }

    /// Sets the session bounds. Starts exponential probing the first time
    /// both the bounds and the network are known, and probes the new max if
    /// it was raised above the estimate after probing completed.
    ///
    /// `max < min` raises `max` to `min` and `start` is clamped into
    /// `[min, max]`. An infinite `max` falls back to 5 Mbps for probing.
    #[must_use]
    pub fn set_bitrates(
        &mut self,
        min_bitrate: DataRate,
        start_bitrate: DataRate,
        max_bitrate: DataRate,
        at_time: Timestamp,
    ) -> Vec<ProbeClusterConfig> {
        let min_bitrate = if min_bitrate.is_finite() {
            min_bitrate.max(DataRate::zero())
        } else {
            DataRate::zero()
        };
        let mut max_bitrate = if max_bitrate.is_finite() {
            max_bitrate
        } else {
            DEFAULT_MAX_PROBING_BITRATE
        };
        if max_bitrate < min_bitrate {
            warn!("probe controller: max bitrate {max_bitrate} below min {min_bitrate}, raising");
            max_bitrate = min_bitrate;
        }

        if start_bitrate > DataRate::zero() {
            let start_bitrate = start_bitrate.clamp(min_bitrate, max_bitrate);
            self.start_bitrate = start_bitrate;
            self.estimated_bitrate = start_bitrate;
        } else if self.start_bitrate.is_zero() {
            self.start_bitrate = min_bitrate;
        }

        // max_bitrate must be updated before probing starts.
        let old_max_bitrate = self.max_bitrate;
        self.max_bitrate = max_bitrate;

        match self.state {
            ProbingState::Init => {
                if self.network_available {
                    return self.initiate_exponential_probing(at_time);
                }
            }
            ProbingState::WaitingForProbingResult => {}
            ProbingState::ProbingComplete => {
                if !self.estimated_bitrate.is_zero()
                    && old_max_bitrate < self.max_bitrate
                    && self.estimated_bitrate < self.max_bitrate
                {
                    return self.initiate_probing(at_time, &[self.max_bitrate], false);
                }
            }
        }
        vec![]
    }

    /// `max_total_allocated_bitrate` is the sum of the configured bitrates
    /// of all active streams. An increase while in ALR probes towards it.
    /// Zero means nothing is being sent and never triggers a probe.
    #[must_use]
    pub fn on_max_total_allocated_bitrate(
        &mut self,
        max_total_allocated_bitrate: DataRate,
        at_time: Timestamp,
    ) -> Vec<ProbeClusterConfig> {
        let in_alr = self.alr_start_time.is_some();
        if self.config.probe_on_max_allocated_bitrate_change
            && self.state == ProbingState::ProbingComplete
            && !max_total_allocated_bitrate.is_zero()
            && max_total_allocated_bitrate != self.max_total_allocated_bitrate
            && self.estimated_bitrate < self.max_bitrate
            && self.estimated_bitrate < max_total_allocated_bitrate
            && in_alr
        {
            self.max_total_allocated_bitrate = max_total_allocated_bitrate;

            let Some(first_scale) = self
                .config
                .first_allocation_probe_scale
                .filter(|scale| *scale > 0.0)
            else {
                return vec![];
            };

            let current_bwe_limit =
                self.config.allocation_probe_limit_by_current_scale * self.estimated_bitrate;
            let mut first_probe_rate = max_total_allocated_bitrate * first_scale;
            let mut limited_by_current_bwe = current_bwe_limit < first_probe_rate;
            if limited_by_current_bwe {
                first_probe_rate = current_bwe_limit;
            }

            let mut probes = vec![first_probe_rate];
            if let Some(second_scale) = self
                .config
                .second_allocation_probe_scale
                .filter(|scale| *scale > 0.0)
                && !limited_by_current_bwe
            {
                let mut second_probe_rate = max_total_allocated_bitrate * second_scale;
                limited_by_current_bwe = current_bwe_limit < second_probe_rate;
                if limited_by_current_bwe {
                    second_probe_rate = current_bwe_limit;
                }
                if second_probe_rate > first_probe_rate {
                    probes.push(second_probe_rate);
                }
            }

            return self.initiate_probing(at_time, &probes, limited_by_current_bwe);
        }

        if !max_total_allocated_bitrate.is_zero() {
            self.last_allowed_repeated_initial_probe = at_time;
        }
        self.max_total_allocated_bitrate = max_total_allocated_bitrate;
        vec![]
    }

    #[must_use]
    pub fn on_network_availability(&mut self, msg: NetworkAvailability) -> Vec<ProbeClusterConfig> {
        self.network_available = msg.network_available;

        if !self.network_available && self.state == ProbingState::WaitingForProbingResult {
            self.update_state(ProbingState::ProbingComplete);
        }

        if self.network_available
            && self.state == ProbingState::Init
            && !self.start_bitrate.is_zero()
        {
            return self.initiate_exponential_probing(msg.at_time);
        }
        vec![]
    }

    /// Feeds the latest estimate. While waiting for a probe result, an
    /// estimate above `further_probe_threshold` of the last probe triggers
    /// the next, larger probe.
    #[must_use]
    pub fn set_estimated_bitrate(
        &mut self,
        bitrate: DataRate,
        bandwidth_limited_cause: BandwidthLimitedCause,
        at_time: Timestamp,
    ) -> Vec<ProbeClusterConfig> {
        self.bandwidth_limited_cause = bandwidth_limited_cause;
        if bitrate < BITRATE_DROP_THRESHOLD * self.estimated_bitrate {
            self.time_of_last_large_drop = at_time;
            self.bitrate_before_last_large_drop = self.estimated_bitrate;
        }
        self.estimated_bitrate = bitrate;

        if self.state != ProbingState::WaitingForProbingResult {
            return vec![];
        }

        if self.config.abort_further_probe_if_max_lower_than_current
            && (bitrate > self.max_bitrate
                || (!self.max_total_allocated_bitrate.is_zero()
                    && bitrate > self.max_total_allocated_bitrate * 2))
        {
            self.min_bitrate_to_probe_further = DataRate::plus_infinity();
        }

        let network_state_estimate_probe_further_limit = match self.network_estimate {
            Some(estimate)
                if self.config.network_state_estimate_probing_interval.is_finite()
                    && estimate.link_capacity_upper.is_finite() =>
            {
                estimate.link_capacity_upper * self.config.further_probe_threshold
            }
            _ => DataRate::plus_infinity(),
        };
        debug!(
            "probe controller: measured {bitrate}, min to probe further {}, upper limit {network_state_estimate_probe_further_limit}",
            self.min_bitrate_to_probe_further
        );

        if bitrate > self.min_bitrate_to_probe_further
            && bitrate <= network_state_estimate_probe_further_limit
        {
            let next = self.config.further_exponential_probe_scale * bitrate;
            return self.initiate_probing(at_time, &[next], true);
        }
        vec![]
    }

    pub fn enable_periodic_alr_probing(&mut self, enable: bool) {
        self.enable_periodic_alr_probing = enable;
    }

    /// Probe once a second for `repeated_initial_probing_time_period` after
    /// exponential probing starts, until a non-zero allocation is reported.
    pub fn enable_repeated_initial_probing(&mut self, enable: bool) {
        self.repeated_initial_probing_enabled = enable;
    }

    /// Lets [`request_probe`](Self::request_probe) recover from drops
    /// outside ALR.
    pub fn enable_rapid_recovery(&mut self, enable: bool) {
        self.in_rapid_recovery = enable;
    }

    pub fn set_alr_start_time(&mut self, alr_start_time: Option<Timestamp>) {
        self.alr_start_time = alr_start_time;
    }

    pub fn set_alr_ended_time(&mut self, alr_end_time: Timestamp) {
        self.alr_end_time = Some(alr_end_time);
    }

    /// Called once the estimate recovered after a large drop. Probes once at
    /// a fraction of the pre-drop rate, at most every 5 s, if the drop was
    /// recent and happened in or shortly after ALR.
    #[must_use]
    pub fn request_probe(&mut self, at_time: Timestamp) -> Vec<ProbeClusterConfig> {
        let in_alr = self.alr_start_time.is_some();
        let alr_ended_recently = self
            .alr_end_time
            .is_some_and(|end| at_time - end < ALR_ENDED_TIMEOUT);

        if (in_alr || alr_ended_recently || self.in_rapid_recovery)
            && self.state == ProbingState::ProbingComplete
        {
            let suggested_probe = PROBE_FRACTION_AFTER_DROP * self.bitrate_before_last_large_drop;
            let min_expected_probe_result = (1.0 - PROBE_UNCERTAINTY) * suggested_probe;
            let time_since_drop = at_time - self.time_of_last_large_drop;
            let time_since_probe = at_time - self.last_bwe_drop_probing_time;
            if min_expected_probe_result > self.estimated_bitrate
                && time_since_drop < BITRATE_DROP_TIMEOUT
                && time_since_probe > MIN_TIME_BETWEEN_ALR_PROBES
            {
                info!("probe controller: detected big bandwidth drop, start probing");
                self.last_bwe_drop_probing_time = at_time;
                return self.initiate_probing(at_time, &[suggested_probe], false);
            }
        }
        vec![]
    }

    pub fn set_network_state_estimate(&mut self, estimate: NetworkStateEstimate) {
        self.network_estimate = Some(estimate);
    }

    /// Returns to the just-constructed state, keeping whether the network is
    /// available, whether periodic ALR probing is enabled and the last max
    /// total allocated bitrate.
    pub fn reset(&mut self, at_time: Timestamp) {
        self.bandwidth_limited_cause = BandwidthLimitedCause::DelayBasedLimited;
        self.state = ProbingState::Init;
        self.min_bitrate_to_probe_further = DataRate::plus_infinity();
        self.time_last_probing_initiated = Timestamp::zero();
        self.estimated_bitrate = DataRate::zero();
        self.network_estimate = None;
        self.start_bitrate = DataRate::zero();
        self.max_bitrate = DEFAULT_MAX_PROBING_BITRATE;
        self.last_bwe_drop_probing_time = at_time;
        self.alr_end_time = None;
        self.time_of_last_large_drop = at_time;
        self.bitrate_before_last_large_drop = DataRate::zero();
    }

    /// Periodic tick. Times out a pending probe result and returns the
    /// repeated initial, ALR or network state probes that are due.
    #[must_use]
    pub fn process(&mut self, at_time: Timestamp) -> Vec<ProbeClusterConfig> {
        if self.state == ProbingState::WaitingForProbingResult
            && at_time - self.time_last_probing_initiated > MAX_WAITING_TIME_FOR_PROBING_RESULT
        {
            debug!("probe controller: timed out waiting for probing result");
            self.update_state(ProbingState::ProbingComplete);
        }
        if self.estimated_bitrate.is_zero() || self.state != ProbingState::ProbingComplete {
            return vec![];
        }
        if self.time_for_next_repeated_initial_probe(at_time) {
            let rate = self.estimated_bitrate * self.config.first_exponential_probe_scale;
            return self.initiate_probing(at_time, &[rate], true);
        }
        if self.time_for_alr_probe(at_time) || self.time_for_network_state_probe(at_time) {
            let rate = self.estimated_bitrate * self.config.alr_probe_scale;
            return self.initiate_probing(at_time, &[rate], true);
        }
        vec![]
    }

    fn update_state(&mut self, new_state: ProbingState) {
        self.state = new_state;
        if new_state == ProbingState::ProbingComplete {
            self.min_bitrate_to_probe_further = DataRate::plus_infinity();
        }
    }

    fn initiate_exponential_probing(&mut self, at_time: Timestamp) -> Vec<ProbeClusterConfig> {
        if !self.network_available
            || self.state != ProbingState::Init
            || self.start_bitrate <= DataRate::zero()
        {
            return vec![];
        }

        let mut probes = vec![self.config.first_exponential_probe_scale * self.start_bitrate];
        if let Some(second_scale) = self
            .config
            .second_exponential_probe_scale
            .filter(|scale| *scale > 0.0)
        {
            probes.push(second_scale * self.start_bitrate);
        }

        if self.repeated_initial_probing_enabled && self.max_total_allocated_bitrate.is_zero() {
            self.last_allowed_repeated_initial_probe =
                at_time + self.config.repeated_initial_probing_time_period;
            info!(
                "probe controller: repeated initial probing until {}",
                self.last_allowed_repeated_initial_probe
            );
        }

        self.initiate_probing(at_time, &probes, true)
    }

    fn initiate_probing(
        &mut self,
        now: Timestamp,
        bitrates_to_probe: &[DataRate],
        mut probe_further: bool,
    ) -> Vec<ProbeClusterConfig> {
        if self.config.skip_if_estimate_larger_than_fraction_of_max > 0.0 {
            let network_estimate = self
                .network_estimate
                .map_or(DataRate::plus_infinity(), |e| e.link_capacity_upper);
            let max_probe_rate = if self.max_total_allocated_bitrate.is_zero() {
                self.max_bitrate
            } else {
                self.max_bitrate.min(
                    self.config.skip_probe_max_allocated_scale * self.max_total_allocated_bitrate,
                )
            };
            if network_estimate.min(self.estimated_bitrate)
                > self.config.skip_if_estimate_larger_than_fraction_of_max * max_probe_rate
            {
                self.update_state(ProbingState::ProbingComplete);
                return vec![];
            }
        }

        let mut max_probe_bitrate = self.max_bitrate;
        if self.max_total_allocated_bitrate > DataRate::zero() {
            // Leave room for bursty streams above their allocation.
            max_probe_bitrate = max_probe_bitrate.min(self.max_total_allocated_bitrate * 2);
        }

        if self.bandwidth_limited_cause.blocks_probing() {
            debug!(
                "probe controller: not probing while {}",
                self.bandwidth_limited_cause
            );
            return vec![];
        }
        if self.bandwidth_limited_cause == BandwidthLimitedCause::LossLimitedBweIncreasing {
            max_probe_bitrate = max_probe_bitrate
                .min(self.estimated_bitrate * self.config.loss_limited_probe_scale);
        }

        if let Some(estimate) = self.network_estimate
            && estimate.link_capacity_upper.is_finite()
            && self.config.network_state_estimate_probing_interval.is_finite()
        {
            if estimate.link_capacity_upper.is_zero() {
                debug!("probe controller: not probing, network state estimate is zero");
                return vec![];
            }
            max_probe_bitrate = max_probe_bitrate.min(
                self.estimated_bitrate
                    .max(estimate.link_capacity_upper * self.config.network_state_probe_scale),
            );
        }

        let mut pending_probes = Vec::with_capacity(bitrates_to_probe.len());
        for &bitrate in bitrates_to_probe {
            if bitrate <= DataRate::zero() {
                continue;
            }
            let bitrate = if bitrate >= max_probe_bitrate {
                probe_further = false;
                max_probe_bitrate
            } else {
                bitrate
            };
            pending_probes.push(self.create_probe_cluster_config(now, bitrate));
        }
        self.time_last_probing_initiated = now;

        match pending_probes.last() {
            Some(last) if probe_further => {
                let min_further = last.target_data_rate * self.config.further_probe_threshold;
                self.update_state(ProbingState::WaitingForProbingResult);
                // Probe results rarely exceed a fraction of the probe rate.
                self.min_bitrate_to_probe_further = min_further;
            }
            _ => self.update_state(ProbingState::ProbingComplete),
        }
        pending_probes
    }

    fn time_for_alr_probe(&self, at_time: Timestamp) -> bool {
        match self.alr_start_time {
            Some(alr_start_time) if self.enable_periodic_alr_probing => {
                let next_probe_time = alr_start_time.max(self.time_last_probing_initiated)
                    + self.config.alr_probing_interval;
                at_time >= next_probe_time
            }
            _ => false,
        }
    }

    fn time_for_network_state_probe(&self, at_time: Timestamp) -> bool {
        let Some(estimate) = self.network_estimate else {
            return false;
        };
        if !estimate.link_capacity_upper.is_finite() {
            return false;
        }

        let probe_due_to_low_estimate = self.bandwidth_limited_cause
            == BandwidthLimitedCause::DelayBasedLimited
            && self.estimated_bitrate
                < self.config.probe_if_estimate_lower_than_network_state_estimate_ratio
                    * estimate.link_capacity_upper;
        let low_estimate_interval = self
            .config
            .estimate_lower_than_network_state_estimate_probing_interval;
        if probe_due_to_low_estimate && low_estimate_interval.is_finite() {
            return at_time >= self.time_last_probing_initiated + low_estimate_interval;
        }

        let periodic_probe = self.estimated_bitrate < estimate.link_capacity_upper;
        let interval = self.config.network_state_estimate_probing_interval;
        if periodic_probe && interval.is_finite() {
            return at_time >= self.time_last_probing_initiated + interval;
        }
        false
    }

    fn time_for_next_repeated_initial_probe(&self, at_time: Timestamp) -> bool {
        self.state != ProbingState::WaitingForProbingResult
            && self.last_allowed_repeated_initial_probe > at_time
            && at_time >= self.time_last_probing_initiated + MAX_WAITING_TIME_FOR_PROBING_RESULT
    }

    fn create_probe_cluster_config(
        &mut self,
        at_time: Timestamp,
        bitrate: DataRate,
    ) -> ProbeClusterConfig {
        let (target_duration, min_probe_delta) = match self.network_estimate {
            Some(estimate)
                if estimate.link_capacity_upper.is_finite()
                    && estimate.link_capacity_upper >= bitrate =>
            {
                (
                    self.config.network_state_probe_duration,
                    self.config.network_state_min_probe_delta,
                )
            }
            _ if at_time < self.last_allowed_repeated_initial_probe => (
                self.config.initial_probe_duration,
                self.config.initial_min_probe_delta,
            ),
            _ => (self.config.min_probe_duration, self.config.min_probe_delta),
        };

        let id = self.next_probe_cluster_id;
        self.next_probe_cluster_id = self.next_probe_cluster_id.wrapping_add(1).max(1);
        ProbeClusterConfig {
            at_time,
            id,
            target_data_rate: bitrate,
            target_duration,
            min_probe_delta,
            target_probe_count: self.config.min_probe_packets_sent,
        }
    }
}
