use log::warn;
use shared::error::{Error, Result};
use shared::field_trial::FieldTrialParams;
use shared::units::TimeDelta;

/// Field trial carrying [`ProbeControllerConfig`] overrides.
pub const PROBING_CONFIGURATION_FIELD_TRIAL: &str = "WebRTC-Bwe-ProbingConfiguration";

/// Probing policy.
///
/// Startup sends one or two probes at `first_exponential_probe_scale` and
/// `second_exponential_probe_scale` times the start bitrate. Whenever an
/// estimate of at least `further_probe_threshold` times the last probe
/// arrives, another probe at `further_exponential_probe_scale` times that
/// estimate follows.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ProbeControllerConfig {
    pub first_exponential_probe_scale: f64,
    pub second_exponential_probe_scale: Option<f64>,
    pub further_exponential_probe_scale: f64,
    pub further_probe_threshold: f64,
    pub abort_further_probe_if_max_lower_than_current: bool,

    /// Window after the first initial probe in which repeated initial probes
    /// are sent, when enabled.
    pub repeated_initial_probing_time_period: TimeDelta,
    pub initial_probe_duration: TimeDelta,
    pub initial_min_probe_delta: TimeDelta,

    pub alr_probing_interval: TimeDelta,
    pub alr_probe_scale: f64,

    /// Probe period while a network state estimate is known. Infinite
    /// disables network state probing.
    pub network_state_estimate_probing_interval: TimeDelta,
    /// Probe faster while the estimate is below this fraction of the network
    /// state estimate.
    pub probe_if_estimate_lower_than_network_state_estimate_ratio: f64,
    pub estimate_lower_than_network_state_estimate_probing_interval: TimeDelta,
    pub network_state_probe_scale: f64,
    /// Used instead of `min_probe_duration` when the network state estimate
    /// is at least the probe target.
    pub network_state_probe_duration: TimeDelta,
    pub network_state_min_probe_delta: TimeDelta,

    pub probe_on_max_allocated_bitrate_change: bool,
    pub first_allocation_probe_scale: Option<f64>,
    pub second_allocation_probe_scale: Option<f64>,
    pub allocation_probe_limit_by_current_scale: f64,

    pub min_probe_packets_sent: i32,
    pub min_probe_duration: TimeDelta,
    pub min_probe_delta: TimeDelta,
    pub loss_limited_probe_scale: f64,
    /// Skip probing once min(estimate, network state estimate) exceeds this
    /// fraction of the max probe rate. Zero disables.
    pub skip_if_estimate_larger_than_fraction_of_max: f64,
    pub skip_probe_max_allocated_scale: f64,
}

impl Default for ProbeControllerConfig {
    fn default() -> Self {
        Self {
            first_exponential_probe_scale: 3.0,
            second_exponential_probe_scale: Some(6.0),
            further_exponential_probe_scale: 2.0,
            further_probe_threshold: 0.7,
            abort_further_probe_if_max_lower_than_current: false,
            repeated_initial_probing_time_period: TimeDelta::from_seconds(5),
            initial_probe_duration: TimeDelta::from_millis(100),
            initial_min_probe_delta: TimeDelta::from_millis(20),
            alr_probing_interval: TimeDelta::from_seconds(5),
            alr_probe_scale: 2.0,
            network_state_estimate_probing_interval: TimeDelta::plus_infinity(),
            probe_if_estimate_lower_than_network_state_estimate_ratio: 0.0,
            estimate_lower_than_network_state_estimate_probing_interval: TimeDelta::from_seconds(
                3,
            ),
            network_state_probe_scale: 1.0,
            network_state_probe_duration: TimeDelta::from_millis(15),
            network_state_min_probe_delta: TimeDelta::from_millis(20),
            probe_on_max_allocated_bitrate_change: true,
            first_allocation_probe_scale: Some(1.0),
            second_allocation_probe_scale: Some(2.0),
            allocation_probe_limit_by_current_scale: 2.0,
            min_probe_packets_sent: 5,
            min_probe_duration: TimeDelta::from_millis(15),
            min_probe_delta: TimeDelta::from_millis(2),
            loss_limited_probe_scale: 1.5,
            skip_if_estimate_larger_than_fraction_of_max: 0.0,
            skip_probe_max_allocated_scale: 1.0,
        }
    }
}

impl ProbeControllerConfig {
    const KEYS: [&'static str; 26] = [
        "p1",
        "p2",
        "step_size",
        "further_probe_threshold",
        "abort_further",
        "initial_probing",
        "initial_probe_duration",
        "initial_min_probe_delta",
        "alr_interval",
        "alr_scale",
        "network_state_interval",
        "est_lower_than_network_ratio",
        "est_lower_than_network_interval",
        "network_state_scale",
        "network_state_probe_duration",
        "network_state_min_probe_delta",
        "probe_max_allocation",
        "alloc_p1",
        "alloc_p2",
        "alloc_current_bwe_limit",
        "min_probe_packets_sent",
        "min_probe_duration",
        "min_probe_delta",
        "loss_limited_scale",
        "skip_if_est_larger_than_fraction_of_max",
        "skip_max_allocated_scale",
    ];

    /// Parses overrides such as `"p1:2,p2:5,step_size:3,alr_interval:2s"`.
    ///
    /// Keys follow [`PROBING_CONFIGURATION_FIELD_TRIAL`]; unknown keys are
    /// logged and ignored.
    pub fn parse(trial: &str) -> Result<Self> {
        let params = FieldTrialParams::parse(trial)?;
        for key in params.unknown_keys(&Self::KEYS) {
            warn!("probe controller: ignoring unknown field trial key {key}");
        }

        let mut c = Self::default();
        let f64_keys: [(&str, &mut f64); 10] = [
            ("p1", &mut c.first_exponential_probe_scale),
            ("step_size", &mut c.further_exponential_probe_scale),
            ("further_probe_threshold", &mut c.further_probe_threshold),
            ("alr_scale", &mut c.alr_probe_scale),
            (
                "est_lower_than_network_ratio",
                &mut c.probe_if_estimate_lower_than_network_state_estimate_ratio,
            ),
            ("network_state_scale", &mut c.network_state_probe_scale),
            (
                "alloc_current_bwe_limit",
                &mut c.allocation_probe_limit_by_current_scale,
            ),
            ("loss_limited_scale", &mut c.loss_limited_probe_scale),
            (
                "skip_if_est_larger_than_fraction_of_max",
                &mut c.skip_if_estimate_larger_than_fraction_of_max,
            ),
            (
                "skip_max_allocated_scale",
                &mut c.skip_probe_max_allocated_scale,
            ),
        ];
        for (key, field) in f64_keys {
            if let Some(v) = params.f64(key)? {
                *field = v;
            }
        }

        let optional_keys: [(&str, &mut Option<f64>); 3] = [
            ("p2", &mut c.second_exponential_probe_scale),
            ("alloc_p1", &mut c.first_allocation_probe_scale),
            ("alloc_p2", &mut c.second_allocation_probe_scale),
        ];
        // A bare key disables the probe.
        for (key, field) in optional_keys {
            if params.contains(key) {
                *field = params.f64(key)?;
            }
        }

        let time_keys: [(&str, &mut TimeDelta); 10] = [
            (
                "initial_probing",
                &mut c.repeated_initial_probing_time_period,
            ),
            ("initial_probe_duration", &mut c.initial_probe_duration),
            ("initial_min_probe_delta", &mut c.initial_min_probe_delta),
            ("alr_interval", &mut c.alr_probing_interval),
            (
                "network_state_interval",
                &mut c.network_state_estimate_probing_interval,
            ),
            (
                "est_lower_than_network_interval",
                &mut c.estimate_lower_than_network_state_estimate_probing_interval,
            ),
            (
                "network_state_probe_duration",
                &mut c.network_state_probe_duration,
            ),
            (
                "network_state_min_probe_delta",
                &mut c.network_state_min_probe_delta,
            ),
            ("min_probe_duration", &mut c.min_probe_duration),
            ("min_probe_delta", &mut c.min_probe_delta),
        ];
        for (key, field) in time_keys {
            if let Some(v) = params.time_delta(key)? {
                *field = v;
            }
        }

        if let Some(v) = params.bool("abort_further")? {
            c.abort_further_probe_if_max_lower_than_current = v;
        }
        if let Some(v) = params.bool("probe_max_allocation")? {
            c.probe_on_max_allocated_bitrate_change = v;
        }
        if let Some(v) = params.i64("min_probe_packets_sent")? {
            c.min_probe_packets_sent =
                i32::try_from(v).map_err(|_| Error::ErrFieldTrialValue {
                    key: "min_probe_packets_sent".to_owned(),
                    value: v.to_string(),
                })?;
        }
        Ok(c)
    }

    /// Like [`parse`](Self::parse), falling back to defaults on error.
    pub fn from_field_trial(trial: &str) -> Self {
        match Self::parse(trial) {
            Ok(config) => config,
            Err(err) => {
                warn!("probe controller: invalid field trial {trial:?}: {err}, using defaults");
                Self::default()
            }
        }
    }
}
