use regis::{GovernorState, Instance, InstanceKey, ManualClock, RegistryConfig};
use regis_node::{test_utils::LoopbackNetwork, NodeConfig, RegistryNode};
use std::sync::Arc;
use std::time::Duration;

const LEASE: Duration = Duration::from_secs(30);

fn solo_node() -> (Arc<RegistryNode>, ManualClock) {
    let clock = ManualClock::new(1_000_000);
    let node = RegistryNode::with_clock(
        NodeConfig::new().with_registry(RegistryConfig::default()),
        LoopbackNetwork::new().transport("http://solo"),
        Arc::new(clock.clone()),
    )
    .unwrap();
    (node, clock)
}

fn keys() -> Vec<InstanceKey> {
    (0..10).map(|i| InstanceKey::new("billing", format!("b-{i}"))).collect()
}

fn renew_all(node: &RegistryNode) {
    for key in keys() {
        node.renew(&key).unwrap();
    }
}

#[tokio::test]
async fn test_mass_renewal_loss_suspends_evictions_until_recovery() {
    let (node, clock) = solo_node();
    for key in keys() {
        node.register(Instance::new(&key.service, &key.instance_id, "10.0.0.1", 8080).with_lease_duration(LEASE))
            .unwrap();
    }

    // healthy clients renewing every 30s
    for _ in 0..4 {
        clock.advance(LEASE);
        renew_all(&node);
        let report = node.evict_expired();
        assert_eq!(report.governor_state, GovernorState::Normal);
        assert!(report.evicted.is_empty());
    }

    // renewals stop: the ratio collapses before the leases run out
    clock.advance(LEASE);
    let report = node.evict_expired();
    assert_eq!(report.governor_state, GovernorState::ThresholdBreached);
    assert_eq!(report.suppressed, 0);

    clock.advance(LEASE);
    let report = node.evict_expired();
    assert_eq!(report.governor_state, GovernorState::ThresholdBreached);
    assert_eq!(report.suppressed, 10);
    assert!(report.evicted.is_empty());
    assert_eq!(node.registry().len(), 10, "stale entries are still served");

    // clients come back; one instance really is dead
    renew_all(&node);
    node.register(Instance::new("billing", "zombie", "10.0.0.2", 8080).with_lease_duration(LEASE))
        .unwrap();

    clock.advance(LEASE);
    renew_all(&node);
    let report = node.evict_expired();
    assert_eq!(report.governor_state, GovernorState::ThresholdBreached, "recovery must be sustained");

    clock.advance(LEASE);
    renew_all(&node);
    let report = node.evict_expired();
    assert_eq!(report.governor_state, GovernorState::ThresholdBreached);
    assert_eq!(report.suppressed, 1);

    clock.advance(LEASE);
    renew_all(&node);
    let report = node.evict_expired();
    assert_eq!(report.governor_state, GovernorState::Normal);
    assert_eq!(report.evicted.len(), 1);
    assert_eq!(report.evicted[0].instance.instance_id, "zombie");
    assert_eq!(node.registry().len(), 10);
}

#[tokio::test]
async fn test_status_reports_last_governor_evaluation() {
    let (node, clock) = solo_node();
    assert!(node.status().governor.is_none());

    clock.advance(Duration::from_secs(61));
    node.registry().evaluate_governor();

    let status = node.status();
    let report = status.governor.unwrap();
    assert!(!report.warming_up);
    assert_eq!(status.governor_state, GovernorState::Normal);
    assert_eq!(status.uptime_seconds, 61);
}
