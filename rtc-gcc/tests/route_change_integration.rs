//! Route changes driving the probe controller.
//!
//! A relevant route change resets the probe controller and restarts
//! exponential probing from the constraints the route controller hands
//! back, so probes never exceed the relay cap while relayed.

use rtc_gcc::{
    BandwidthLimitedCause, BitrateConstraints, NetworkAvailability, NetworkRoute,
    ProbeClusterConfig, ProbeController, ProbeControllerConfig, ProbingState, RouteController,
    RouteControllerConfig, RouteEndpoint,
};
use shared::units::{DataRate, TimeDelta, Timestamp};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn route(network_id: u16, relay: bool) -> NetworkRoute {
    NetworkRoute {
        connected: true,
        local: RouteEndpoint {
            network_id,
            adapter_id: 1,
            relay,
        },
        remote: RouteEndpoint {
            network_id: 100,
            adapter_id: 1,
            relay: false,
        },
        packet_overhead: 48,
    }
}

/// Glue between the two controllers, as a send-side transport would have.
struct SendSide {
    routes: RouteController,
    probes: ProbeController,
    sent: Vec<ProbeClusterConfig>,
}

impl SendSide {
    fn new(relay_cap: DataRate) -> Self {
        init_logger();

        let base = BitrateConstraints {
            min_bitrate: DataRate::from_kbps(30),
            start_bitrate: Some(DataRate::from_kbps(300)),
            max_bitrate: DataRate::from_kbps(2500),
        };
        let routes = RouteController::new(
            RouteControllerConfig {
                relay_cap,
                ..Default::default()
            },
            base,
        );
        let mut probes = ProbeController::new(ProbeControllerConfig::default());
        let _ = probes.on_network_availability(NetworkAvailability {
            at_time: Timestamp::zero(),
            network_available: true,
        });
        Self {
            routes,
            probes,
            sent: vec![],
        }
    }

    fn apply(&mut self, constraints: BitrateConstraints, now: Timestamp, reset: bool) {
        if reset {
            self.probes.reset(now);
        }
        let probes = self.probes.set_bitrates(
            constraints.min_bitrate,
            constraints.start_bitrate.unwrap_or_default(),
            constraints.max_bitrate,
            now,
        );
        self.sent.extend(probes);
    }

    fn start(&mut self, now: Timestamp) {
        let constraints = self.routes.constraints();
        self.apply(constraints, now, false);
    }

    fn route_changed(&mut self, name: &str, route: &NetworkRoute, now: Timestamp) -> bool {
        match self.routes.on_network_route_changed(name, route) {
            Some(constraints) => {
                self.apply(constraints, now, true);
                true
            }
            None => false,
        }
    }

    fn take_sent(&mut self) -> Vec<ProbeClusterConfig> {
        std::mem::take(&mut self.sent)
    }
}

#[test]
fn test_relayed_route_caps_probes() {
    let relay_cap = DataRate::from_kbps(500);
    let mut side = SendSide::new(relay_cap);
    let mut now = Timestamp::zero();

    assert!(!side.route_changed("video", &route(1, false), now));
    side.start(now);
    let initial = side.take_sent();
    assert_eq!(initial.len(), 2);
    assert_eq!(initial[0].target_data_rate, DataRate::from_kbps(900));
    assert_eq!(initial[1].target_data_rate, DataRate::from_kbps(1800));

    // Switch to a TURN relay on another network.
    now += TimeDelta::from_seconds(2);
    assert!(side.route_changed("video", &route(2, true), now));
    let relayed = side.take_sent();
    assert!(!relayed.is_empty());
    for probe in &relayed {
        assert!(probe.target_data_rate <= relay_cap);
        assert!(probe.id > initial[1].id);
    }
    assert_eq!(side.probes.state(), ProbingState::ProbingComplete);

    // Back to a direct path lifts the cap.
    now += TimeDelta::from_seconds(2);
    assert!(side.route_changed("video", &route(3, false), now));
    let direct = side.take_sent();
    assert_eq!(direct.len(), 2);
    assert_eq!(direct[1].target_data_rate, DataRate::from_kbps(1800));
    assert_eq!(side.routes.constraints().max_bitrate, DataRate::from_kbps(2500));
}

#[test]
fn test_irrelevant_route_change_keeps_probing_state() {
    let mut side = SendSide::new(DataRate::from_kbps(500));
    let mut now = Timestamp::zero();

    assert!(!side.route_changed("audio", &route(1, false), now));
    side.start(now);
    assert_eq!(side.take_sent().len(), 2);
    assert_eq!(side.probes.state(), ProbingState::WaitingForProbingResult);

    // Not yet enough to probe further.
    let probes = side.probes.set_estimated_bitrate(
        DataRate::from_kbps(1000),
        BandwidthLimitedCause::DelayBasedLimited,
        now,
    );
    assert!(probes.is_empty());

    let mut new_overhead = route(1, false);
    new_overhead.packet_overhead = 60;
    now += TimeDelta::from_millis(500);
    assert!(!side.route_changed("audio", &new_overhead, now));
    assert_eq!(side.probes.state(), ProbingState::WaitingForProbingResult);
    assert!(side.take_sent().is_empty());
}

#[test]
fn test_uncapped_relay_still_resets_probing() {
    let mut side = SendSide::new(DataRate::plus_infinity());
    let mut now = Timestamp::zero();

    assert!(!side.route_changed("video", &route(1, false), now));
    side.start(now);
    let _ = side.take_sent();

    now += TimeDelta::from_seconds(1);
    assert!(side.route_changed("video", &route(1, true), now));
    let probes = side.take_sent();
    assert_eq!(probes.len(), 2);
    assert_eq!(probes[0].target_data_rate, DataRate::from_kbps(900));
}
