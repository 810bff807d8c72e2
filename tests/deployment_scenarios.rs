//! Deployment upgrade reservations and heartbeat ordering.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use common::deployment;
use flowmill_core::config::DeploymentConfig;
use flowmill_core::deployment::{
    calculate_max_resource, max_resources_for_upgrade, DeploymentManager, DeploymentMonitor,
    InMemoryAdmission, InMemoryDeploymentRuntime, InMemoryDeploymentStore, InMemoryFixtureManager,
};
use flowmill_core::events::EventPublisher;
use flowmill_core::heartbeat::{Heartbeat, HeartbeatData, HeartbeatType, InstancesCache, PodStatus};
use flowmill_core::persistence::{InMemoryWorkflowArchive, WorkflowArchive};
use flowmill_core::DeploymentState;
use proptest::prelude::*;

#[test]
fn rolling_upgrade_envelope() {
    assert_eq!(calculate_max_resource(1.0, 1.0, 5, 5, 2, 0), 7.0);
    assert_eq!(calculate_max_resource(100.0, 100.0, 5, 5, 2, 0), 700.0);

    let old = deployment("site", 5, "1", "100", Some(("rolling_update", "2", "0")));
    let new = deployment("site", 5, "1", "100", None);
    assert_eq!(max_resources_for_upgrade(&old, &new).unwrap(), (7.0, 700.0));
}

#[tokio::test]
async fn upgrade_reserves_envelope_through_manager() {
    let admission = Arc::new(InMemoryAdmission::new());
    let history = Arc::new(InMemoryWorkflowArchive::default());
    let manager = Arc::new(DeploymentManager::new(
        Arc::new(InMemoryDeploymentStore::new()),
        Arc::new(InMemoryFixtureManager::new()),
        admission.clone(),
        Arc::new(InMemoryDeploymentRuntime::new()),
        history.clone(),
        EventPublisher::new(64),
        DeploymentConfig::default(),
    ));
    let monitor = DeploymentMonitor::new(manager.clone());

    let current = manager
        .create(deployment("site", 5, "1", "100", Some(("rolling_update", "2", "0"))))
        .await
        .unwrap();
    assert_eq!(current.state, DeploymentState::Waiting);
    assert_eq!(monitor.monitor(&current.key()).await.unwrap(), DeploymentState::Active);

    let next = current.next_generation(deployment("site", 5, "1", "100", None).template);
    let upgraded = manager.upgrade(next).await.unwrap();
    assert_eq!(upgraded.state, DeploymentState::Upgrading);

    let requests = admission.requests();
    let envelope = requests[requests.len() - 2].1;
    assert_eq!((envelope.cpu, envelope.mem), (7.0, 700.0));
    assert!(history.get(current.id).await.unwrap().is_some());
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn heartbeat(pod: &str, secs: i64, kind: HeartbeatType) -> Heartbeat {
    Heartbeat {
        date: at(secs),
        key: "shop/site".into(),
        data: HeartbeatData {
            kind,
            pod_status: PodStatus::ready(pod),
        },
    }
}

#[test]
fn stale_heartbeat_leaves_cache_unchanged() {
    let cache = InstancesCache::new(Duration::from_secs(3600));
    cache.register("shop/site");
    let now = Utc::now();

    let before = cache
        .apply(&heartbeat("P", 100, HeartbeatType::HeartBeat), now)
        .unwrap();
    let after = cache
        .apply(&heartbeat("P", 50, HeartbeatType::HeartBeat), now)
        .unwrap();

    assert_eq!(after.pods, before.pods);
    assert_eq!(after.available(), 1);
    assert_eq!(after.pods["P"].mtime, at(100));
}

#[test]
fn unregistered_deployment_ignores_heartbeats() {
    let cache = InstancesCache::new(Duration::from_secs(60));
    assert!(cache
        .apply(&heartbeat("P", 1, HeartbeatType::BirthCry), Utc::now())
        .is_none());
}

proptest! {
    #[test]
    fn heartbeat_order_does_not_matter(
        older in 0i64..1000,
        gap in 1i64..1000,
        older_tomb in any::<bool>(),
        newer_tomb in any::<bool>(),
    ) {
        let kind = |tomb: bool| if tomb { HeartbeatType::TombStone } else { HeartbeatType::HeartBeat };
        let first = heartbeat("P", older, kind(older_tomb));
        let second = heartbeat("P", older + gap, kind(newer_tomb));
        let now = Utc::now();

        let forward = InstancesCache::new(Duration::from_secs(3600));
        forward.register("shop/site");
        forward.apply(&first, now);
        let forward = forward.apply(&second, now).unwrap();

        let backward = InstancesCache::new(Duration::from_secs(3600));
        backward.register("shop/site");
        backward.apply(&second, now);
        let backward = backward.apply(&first, now).unwrap();

        prop_assert_eq!(forward.pods, backward.pods);
    }
}
