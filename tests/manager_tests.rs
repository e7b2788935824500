//! Tests for the bundle manager.
//!
//! Runtimes are in-memory fakes, so these cover queueing, redeploys,
//! deletion and teardown without any container work.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;

use common::{FakeFactory, demo_bundle, eventually, zip_bytes};
use microfaas::bundle::BundleSource;
use microfaas::manager::Manager;
use microfaas::runtime::RuntimeState;
use microfaas::Error;

const WAIT: Duration = Duration::from_secs(2);

fn setup() -> (Arc<FakeFactory>, Arc<Manager>) {
    let factory = FakeFactory::new();
    let manager = Arc::new(Manager::new(factory.clone()));
    (factory, manager)
}

fn bundle() -> BundleSource {
    BundleSource::Bytes(Bytes::from(demo_bundle()))
}

fn call(manager: &Manager, name: &str, n: u64) -> microfaas::Result<()> {
    manager.call(name, "app:greet", json!(n), Map::new())
}

fn delivery(runtime: &str, n: u64) -> (String, Value) {
    (runtime.to_string(), json!(n))
}

// =============================================================================
// Deploy / Call
// =============================================================================

#[tokio::test]
async fn test_deploy_and_call() {
    let (factory, manager) = setup();

    let info = manager.deploy("demo", bundle()).await.unwrap();
    assert_eq!(info.name, "demo");
    assert_eq!(info.revision, 1);
    assert_eq!(info.runtime_id, "rt-1");
    assert_eq!(info.state, RuntimeState::Ready);
    assert!(info.digest.starts_with("sha256:"));
    assert_eq!(manager.names(), vec!["demo"]);

    call(&manager, "demo", 1).unwrap();
    manager.join().await;
    assert_eq!(factory.delivered(), vec![delivery("rt-1", 1)]);
}

#[tokio::test]
async fn test_jobs_are_delivered_in_order() {
    let (factory, manager) = setup();
    manager.deploy("demo", bundle()).await.unwrap();

    for n in 0..10 {
        call(&manager, "demo", n).unwrap();
    }
    manager.join().await;

    let expected: Vec<_> = (0..10).map(|n| delivery("rt-1", n)).collect();
    assert_eq!(factory.delivered(), expected);
}

#[tokio::test]
async fn test_invalid_name_is_rejected_before_launch() {
    let (factory, manager) = setup();

    for name in ["", "-demo", "demo-", "has space", "UPPER/slash"] {
        let err = manager.deploy(name, bundle()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidBundleName { .. }), "{name:?}: {err}");
    }
    assert_eq!(factory.launched(), 0);
}

#[tokio::test]
async fn test_invalid_archive_is_rejected_before_launch() {
    let (factory, manager) = setup();

    let err = manager
        .deploy("demo", BundleSource::Bytes(Bytes::from_static(b"not a zip")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Archive(_)));
    assert_eq!(factory.launched(), 0);
    assert!(manager.names().is_empty());
}

#[tokio::test]
async fn test_call_unknown_bundle() {
    let (_factory, manager) = setup();
    let err = call(&manager, "nope", 1).unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_failed_job_does_not_stall_queue() {
    let (factory, manager) = setup();
    manager.deploy("demo", bundle()).await.unwrap();

    manager.call("demo", "fail", Value::Null, Map::new()).unwrap();
    call(&manager, "demo", 2).unwrap();
    tokio::time::timeout(WAIT, manager.join()).await.unwrap();

    assert_eq!(factory.delivered(), vec![delivery("rt-1", 2)]);
}

// =============================================================================
// Redeploy
// =============================================================================

#[tokio::test]
async fn test_redeploy_keeps_queued_and_in_flight_jobs() {
    let (factory, manager) = setup();
    let gate = Arc::new(Semaphore::new(0));
    factory.gate_calls(Some(gate.clone()));
    manager.deploy("demo", bundle()).await.unwrap();

    for n in 0..3 {
        call(&manager, "demo", n).unwrap();
    }
    // Job 0 is in flight on rt-1; jobs 1 and 2 are still queued.
    assert!(eventually(WAIT, || factory.started() == 1).await);

    factory.gate_calls(None);
    let info = manager
        .deploy("demo", BundleSource::Bytes(Bytes::from(zip_bytes(&[("app.py", "v2")]))))
        .await
        .unwrap();
    assert_eq!(info.revision, 2);
    assert_eq!(info.runtime_id, "rt-2");
    assert!(factory.runtime(0).is_stopped());
    assert_ne!(factory.digests()[0], factory.digests()[1]);

    // Stopping rt-1 failed job 0 mid-call; it is sent again to rt-2.
    tokio::time::timeout(WAIT, manager.join()).await.unwrap();
    assert_eq!(
        factory.delivered(),
        vec![delivery("rt-2", 0), delivery("rt-2", 1), delivery("rt-2", 2)]
    );
    assert_eq!(factory.started(), 4);
}

#[tokio::test]
async fn test_failed_redeploy_keeps_old_runtime() {
    let (factory, manager) = setup();
    manager.deploy("demo", bundle()).await.unwrap();

    factory.fail_next_launch();
    let err = manager.deploy("demo", bundle()).await.unwrap_err();
    assert!(matches!(err, Error::RetriesExhausted { .. }));

    let info = manager.bundle_info("demo").unwrap();
    assert_eq!(info.revision, 1);
    assert_eq!(info.runtime_id, "rt-1");
    assert!(!factory.runtime(0).is_stopped());

    call(&manager, "demo", 7).unwrap();
    manager.join().await;
    assert_eq!(factory.delivered(), vec![delivery("rt-1", 7)]);
}

#[tokio::test]
async fn test_bundle_stays_visible_during_redeploy() {
    let (factory, manager) = setup();
    manager.deploy("demo", bundle()).await.unwrap();

    let launch = Arc::new(Semaphore::new(0));
    factory.gate_launches(Some(launch.clone()));
    let redeploy = tokio::spawn({
        let manager = manager.clone();
        async move { manager.deploy("demo", bundle()).await }
    });
    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.deploy("fresh", bundle()).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The old revision keeps serving; the new name is not visible yet.
    assert_eq!(manager.names(), vec!["demo"]);
    call(&manager, "demo", 1).unwrap();
    tokio::time::timeout(WAIT, manager.join()).await.unwrap();
    assert_eq!(factory.delivered(), vec![delivery("rt-1", 1)]);
    assert!(call(&manager, "fresh", 1).unwrap_err().is_not_found());

    launch.add_permits(2);
    assert!(redeploy.await.unwrap().is_ok());
    assert!(first.await.unwrap().is_ok());
    assert_eq!(manager.names(), vec!["demo", "fresh"]);
    assert_eq!(manager.bundle_info("demo").unwrap().revision, 2);
}

#[tokio::test]
async fn test_concurrent_first_deploys_register_once() {
    let (factory, manager) = setup();

    let (a, b) = tokio::join!(
        manager.deploy("demo", bundle()),
        manager.deploy("demo", bundle())
    );
    let mut revisions = vec![a.unwrap().revision, b.unwrap().revision];
    revisions.sort();
    assert_eq!(revisions, vec![1, 2]);
    assert_eq!(manager.names(), vec!["demo"]);

    // Whichever launch registered first was swapped out and torn down.
    let info = manager.bundle_info("demo").unwrap();
    let stopped: Vec<bool> = (0..2).map(|i| factory.runtime(i).is_stopped()).collect();
    assert_eq!(stopped.iter().filter(|s| **s).count(), 1);
    assert_eq!(info.revision, 2);
}

// =============================================================================
// Delete
// =============================================================================

#[tokio::test]
async fn test_delete_with_join_drains_queue() {
    let (factory, manager) = setup();
    let gate = Arc::new(Semaphore::new(0));
    factory.gate_calls(Some(gate.clone()));
    manager.deploy("demo", bundle()).await.unwrap();
    for n in 0..3 {
        call(&manager, "demo", n).unwrap();
    }

    let delete = tokio::spawn({
        let manager = manager.clone();
        async move { manager.delete("demo", true).await }
    });
    assert!(eventually(WAIT, || manager.names().is_empty()).await);

    // Gone for new calls while the old ones drain.
    assert!(call(&manager, "demo", 9).unwrap_err().is_not_found());
    assert!(!delete.is_finished());

    gate.add_permits(3);
    tokio::time::timeout(WAIT, delete).await.unwrap().unwrap().unwrap();

    let expected: Vec<_> = (0..3).map(|n| delivery("rt-1", n)).collect();
    assert_eq!(factory.delivered(), expected);
    assert!(factory.runtime(0).is_stopped());
}

#[tokio::test]
async fn test_delete_without_join_discards_queue() {
    let (factory, manager) = setup();
    let gate = Arc::new(Semaphore::new(0));
    factory.gate_calls(Some(gate.clone()));
    manager.deploy("demo", bundle()).await.unwrap();
    for n in 0..3 {
        call(&manager, "demo", n).unwrap();
    }
    assert!(eventually(WAIT, || factory.started() == 1).await);

    tokio::time::timeout(WAIT, manager.delete("demo", false))
        .await
        .unwrap()
        .unwrap();

    gate.add_permits(3);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(factory.delivered().is_empty());
    assert_eq!(factory.started(), 1);
    assert!(factory.runtime(0).is_stopped());
    assert!(manager.bundle_info("demo").unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_join_returns_when_bundle_deleted_mid_job() {
    let (factory, manager) = setup();
    factory.gate_calls(Some(Arc::new(Semaphore::new(0))));
    manager.deploy("demo", bundle()).await.unwrap();
    call(&manager, "demo", 0).unwrap();
    call(&manager, "demo", 1).unwrap();
    assert!(eventually(WAIT, || factory.started() == 1).await);

    let join = tokio::spawn({
        let manager = manager.clone();
        async move { manager.join().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!join.is_finished());

    manager.delete("demo", false).await.unwrap();
    tokio::time::timeout(WAIT, join).await.unwrap().unwrap();
    assert!(factory.delivered().is_empty());
}

#[tokio::test]
async fn test_delete_unknown_bundle() {
    let (_factory, manager) = setup();
    let err = manager.delete("nope", true).await.unwrap_err();
    assert!(err.is_not_found());
}

// =============================================================================
// Introspection / Shutdown
// =============================================================================

#[tokio::test]
async fn test_list_reports_queue_depth() {
    let (factory, manager) = setup();
    let gate = Arc::new(Semaphore::new(0));
    factory.gate_calls(Some(gate.clone()));
    manager.deploy("b", bundle()).await.unwrap();
    factory.gate_calls(None);
    manager.deploy("a", bundle()).await.unwrap();

    for n in 0..3 {
        call(&manager, "b", n).unwrap();
    }
    assert!(eventually(WAIT, || factory.started() == 1).await);

    let list = manager.list();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].name, "a");
    assert_eq!(list[1].name, "b");
    assert_eq!(list[1].queued, 2);
    assert_eq!(list[1].unfinished, 3);

    gate.add_permits(3);
    tokio::time::timeout(WAIT, manager.join()).await.unwrap();
    assert_eq!(manager.bundle_info("b").unwrap().unfinished, 0);
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let (factory, manager) = setup();
    manager.deploy("a", bundle()).await.unwrap();
    manager.deploy("b", bundle()).await.unwrap();

    manager.shutdown().await;
    assert!(manager.names().is_empty());
    assert!(factory.runtime(0).is_stopped());
    assert!(factory.runtime(1).is_stopped());

    // A second shutdown has nothing left to do.
    manager.shutdown().await;
}

#[tokio::test]
async fn test_join_returns_after_shutdown_mid_job() {
    let (factory, manager) = setup();
    factory.gate_calls(Some(Arc::new(Semaphore::new(0))));
    manager.deploy("demo", bundle()).await.unwrap();
    call(&manager, "demo", 0).unwrap();
    assert!(eventually(WAIT, || factory.started() == 1).await);

    let join = tokio::spawn({
        let manager = manager.clone();
        async move { manager.join().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!join.is_finished());

    manager.shutdown().await;
    tokio::time::timeout(WAIT, join).await.unwrap().unwrap();
    assert!(factory.runtime(0).is_stopped());
}
