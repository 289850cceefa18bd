//! Route change handling and the relay bitrate cap.
//!
//! [`RouteController`] remembers the active route per transport. When a route
//! starts or stops going through a TURN relay, or changes enough that the
//! old estimate is meaningless, it hands back fresh [`BitrateConstraints`]
//! for the estimator and the [`ProbeController`](crate::ProbeController).

use std::collections::BTreeMap;
use std::fmt;

use log::{info, warn};
use shared::error::Result;
use shared::field_trial::FieldTrialParams;
use shared::units::DataRate;

use crate::network_types::BitrateConstraints;

/// Field trial carrying [`RouteControllerConfig`] overrides.
pub const NETWORK_ROUTE_CONSTRAINTS_FIELD_TRIAL: &str = "WebRTC-Bwe-NetworkRouteConstraints";

/// One side of a network route.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct RouteEndpoint {
    pub network_id: u16,
    pub adapter_id: u16,
    /// The endpoint is a TURN relay candidate.
    pub relay: bool,
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct NetworkRoute {
    pub connected: bool,
    pub local: RouteEndpoint,
    pub remote: RouteEndpoint,
    /// Per packet transport overhead in bytes.
    pub packet_overhead: usize,
}

impl NetworkRoute {
    pub fn is_relayed(&self) -> bool {
        self.local.relay || self.remote.relay
    }
}

impl fmt::Display for NetworkRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[connected: {}, local: {}/{}{}, remote: {}/{}{}, overhead: {}]",
            self.connected,
            self.local.network_id,
            self.local.adapter_id,
            if self.local.relay { " relay" } else { "" },
            self.remote.network_id,
            self.remote.adapter_id,
            if self.remote.relay { " relay" } else { "" },
            self.packet_overhead,
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RouteControllerConfig {
    /// Max bitrate while the route is relayed. Infinite disables the cap.
    pub relay_cap: DataRate,
    /// Also treat a changed adapter id as a new route.
    pub reset_on_adapter_id_change: bool,
}

impl Default for RouteControllerConfig {
    fn default() -> Self {
        Self {
            relay_cap: DataRate::plus_infinity(),
            reset_on_adapter_id_change: true,
        }
    }
}

impl RouteControllerConfig {
    const KEYS: [&'static str; 2] = ["relay_cap", "reset_on_adapter_id_change"];

    /// Parses overrides such as `"relay_cap:500kbps"`.
    pub fn parse(trial: &str) -> Result<Self> {
        let params = FieldTrialParams::parse(trial)?;
        for key in params.unknown_keys(&Self::KEYS) {
            warn!("route controller: ignoring unknown field trial key {key}");
        }

        let mut c = Self::default();
        if let Some(v) = params.data_rate("relay_cap")? {
            c.relay_cap = v;
        }
        if let Some(v) = params.bool("reset_on_adapter_id_change")? {
            c.reset_on_adapter_id_change = v;
        }
        Ok(c)
    }

    /// Like [`parse`](Self::parse), falling back to defaults on error.
    pub fn from_field_trial(trial: &str) -> Self {
        match Self::parse(trial) {
            Ok(config) => config,
            Err(err) => {
                warn!("route controller: invalid field trial {trial:?}: {err}, using defaults");
                Self::default()
            }
        }
    }
}

/// Whether a route switch invalidates the bandwidth estimate.
pub fn is_relevant_route_change(
    old_route: &NetworkRoute,
    new_route: &NetworkRoute,
    reset_on_adapter_id_change: bool,
) -> bool {
    let connected_changed = old_route.connected != new_route.connected;
    let mut route_ids_changed = old_route.local.network_id != new_route.local.network_id
        || old_route.remote.network_id != new_route.remote.network_id;
    if reset_on_adapter_id_change {
        route_ids_changed |= old_route.local.adapter_id != new_route.local.adapter_id
            || old_route.remote.adapter_id != new_route.remote.adapter_id;
    }
    let relaying_changed = old_route.is_relayed() != new_route.is_relayed();
    connected_changed || route_ids_changed || relaying_changed
}

/// Tracks routes per transport and the constraints currently in effect.
pub struct RouteController {
    config: RouteControllerConfig,
    routes: BTreeMap<String, NetworkRoute>,
    base_constraints: BitrateConstraints,
    /// Cap currently applied, +inf when not relayed.
    active_cap: DataRate,
    effective: BitrateConstraints,
}

impl RouteController {
    pub fn new(config: RouteControllerConfig, base_constraints: BitrateConstraints) -> Self {
        let effective = Self::capped(base_constraints, DataRate::plus_infinity());
        Self {
            config,
            routes: BTreeMap::new(),
            base_constraints,
            active_cap: DataRate::plus_infinity(),
            effective,
        }
    }

    pub fn config(&self) -> &RouteControllerConfig {
        &self.config
    }

    /// Constraints with the relay cap applied when the route is relayed.
    pub fn constraints(&self) -> BitrateConstraints {
        self.effective
    }

    pub fn route(&self, transport_name: &str) -> Option<&NetworkRoute> {
        self.routes.get(transport_name)
    }

    /// Replaces the application's bounds. Returns the new effective
    /// constraints unless nothing changed.
    pub fn set_base_constraints(
        &mut self,
        base_constraints: BitrateConstraints,
    ) -> Option<BitrateConstraints> {
        self.base_constraints = base_constraints;
        self.update_effective(base_constraints.start_bitrate.is_some())
    }

    /// Handles a route update for `transport_name`.
    ///
    /// Returns `Some` when the caller should push new constraints: on the
    /// first connected route if the relay cap changed them, and on every
    /// relevant change afterwards, in which case the estimator and the probe
    /// controller should be reset. Disconnected routes are ignored.
    pub fn on_network_route_changed(
        &mut self,
        transport_name: &str,
        route: &NetworkRoute,
    ) -> Option<BitrateConstraints> {
        if !route.connected {
            return None;
        }

        self.active_cap = if route.is_relayed() {
            self.config.relay_cap
        } else {
            DataRate::plus_infinity()
        };
        let cap_update = self.update_effective(false);

        let Some(old_route) = self.routes.insert(transport_name.to_owned(), *route) else {
            info!("route controller: new route on {transport_name}: {route}");
            // No need to reset the estimate the first time the network connects.
            return cap_update;
        };
        if old_route == *route {
            return cap_update;
        }
        info!("route controller: route on {transport_name} changed from {old_route} to {route}");

        if !is_relevant_route_change(&old_route, route, self.config.reset_on_adapter_id_change) {
            return cap_update;
        }

        let constraints = BitrateConstraints {
            start_bitrate: self
                .base_constraints
                .start_bitrate
                .map(|start| start.clamp(self.effective.min_bitrate, self.effective.max_bitrate)),
            ..self.effective
        };
        info!(
            "route controller: reset bitrates to min {}, start {:?}, max {}",
            constraints.min_bitrate, constraints.start_bitrate, constraints.max_bitrate
        );
        Some(constraints)
    }

    fn update_effective(&mut self, force: bool) -> Option<BitrateConstraints> {
        let updated = Self::capped(self.base_constraints, self.active_cap);
        if !force
            && updated.min_bitrate == self.effective.min_bitrate
            && updated.max_bitrate == self.effective.max_bitrate
        {
            return None;
        }
        self.effective = updated;
        Some(updated)
    }

    fn capped(base: BitrateConstraints, cap: DataRate) -> BitrateConstraints {
        let min_bitrate = base.min_bitrate.max(DataRate::zero());
        let max_bitrate = base.max_bitrate.min(cap).max(min_bitrate);
        BitrateConstraints {
            min_bitrate,
            start_bitrate: base
                .start_bitrate
                .map(|start| start.clamp(min_bitrate, max_bitrate)),
            max_bitrate,
        }
    }
}
