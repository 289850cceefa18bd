//! RTC Bandwidth Probing - goog-cc style probe scheduling and route constraints.
//!
//! [`ProbeController`] tells the pacer when to send probe clusters faster
//! than the current estimate, and [`RouteController`] produces the bitrate
//! constraints to restart from when the network route changes, capping the
//! max bitrate while traffic goes through a TURN relay.
//!
//! Both are sans-IO: every input carries its own [`Timestamp`](shared::units::Timestamp)
//! and every output is returned to the caller.
//!
//! ```ignore
//! use rtc_gcc::{NetworkAvailability, ProbeController};
//! use shared::units::{DataRate, Timestamp};
//!
//! let mut probes = ProbeController::default();
//! let now = Timestamp::zero();
//! let _ = probes.on_network_availability(NetworkAvailability {
//!     at_time: now,
//!     network_available: true,
//! });
//! for cluster in probes.set_bitrates(
//!     DataRate::from_kbps(30),
//!     DataRate::from_kbps(300),
//!     DataRate::from_kbps(2500),
//!     now,
//! ) {
//!     pacer.create_probe_cluster(cluster);
//! }
//! ```

#![warn(rust_2018_idioms)]

pub mod network_types;
pub mod probe_controller;
pub mod relay;

pub use network_types::{
    BandwidthLimitedCause, BitrateConstraints, NetworkAvailability, NetworkStateEstimate,
    ProbeClusterConfig,
};
pub use probe_controller::{
    PROBING_CONFIGURATION_FIELD_TRIAL, ProbeController, ProbeControllerConfig, ProbingState,
};
pub use relay::{
    NETWORK_ROUTE_CONSTRAINTS_FIELD_TRIAL, NetworkRoute, RouteController, RouteControllerConfig,
    RouteEndpoint, is_relevant_route_change,
};
