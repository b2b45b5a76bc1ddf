//! Leader election across several replicas sharing one lease.


use std::time::Duration;

use jx_controller::api::{LeaseExt, MetaExt, ObjectKey, Phase, TaskType};
use jx_controller::client::Op;
use jx_controller::error::ControllerError;
use test_harness::{assert_eventually, jxtask, test_config, TestCluster, TestReplica};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn at_most_one_replica_leads() {
    let tc = TestCluster::new(3).await;
    tc.wait_for_leader(TIMEOUT).await.expect("no leader elected");

    // Sample across several lease durations.
    for _ in 0..100 {
        let leaders = tc.leaders();
        assert!(leaders.len() <= 1, "multiple leaders: {:?}", leaders);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let lease = tc
        .cluster
        .leases
        .get_object(&ObjectKey::new("default", "jxtasks"))
        .expect("lease created");
    let leaders = tc.leaders();
    assert_eq!(lease.holder(), leaders.first().map(String::as_str));

    tc.shutdown().await;
}

#[tokio::test]
async fn standby_takes_over_when_leader_stops() {
    let mut tc = TestCluster::new(3).await;
    let first = tc.wait_for_leader(TIMEOUT).await.expect("no leader elected");

    tc.stop_replica(&first).await.expect("clean shutdown");

    // The stopped leader released its lease, so a standby wins on its next retry.
    let second = tc.wait_for_leader(TIMEOUT).await.expect("no new leader");
    assert_ne!(first, second);
    assert_eq!(tc.leaders().len(), 1);

    tc.shutdown().await;
}

#[tokio::test]
async fn new_leader_resumes_reconciling() {
    let mut tc = TestCluster::new(2).await;
    let first = tc.wait_for_leader(TIMEOUT).await.expect("no leader elected");

    let key = tc.submit(jxtask("resume", &[("worker", 2, TaskType::Batch)]));
    assert!(tc.wait_for_phase(&key, Phase::Running, TIMEOUT).await);

    tc.stop_replica(&first).await.expect("clean shutdown");
    tc.wait_for_leader(TIMEOUT).await.expect("no new leader");

    // Work submitted after failover is picked up by the new leader.
    let next = tc.submit(jxtask("after", &[("worker", 1, TaskType::Batch)]));
    assert!(tc.wait_for_phase(&next, Phase::Running, TIMEOUT).await);

    let uid = tc.stored(&key).unwrap().metadata.uid_str().to_string();
    tc.cluster
        .set_owned_pod_phases(&uid, jx_controller::api::PodPhase::Succeeded);
    assert!(tc.wait_for_phase(&key, Phase::Done, TIMEOUT).await);

    tc.shutdown().await;
}

#[tokio::test]
async fn failed_renewal_stops_the_replica() {
    let tc = TestCluster::new(1).await;
    tc.wait_for_leader(TIMEOUT).await.expect("no leader elected");

    let TestCluster {
        cluster,
        mut replicas,
    } = tc;
    let replica = replicas.remove(0);
    let state = replica.state.clone();

    cluster.leases.fail_next(Op::Get, 1000);
    let result = tokio::time::timeout(TIMEOUT, replica.wait())
        .await
        .expect("replica should exit after losing the lease");

    assert!(
        matches!(result, Err(ControllerError::LeadershipLost(_))),
        "unexpected result: {:?}",
        result
    );
    assert!(!state.is_leading());
}

#[tokio::test]
async fn late_replica_stays_standby() {
    let tc = TestCluster::new(1).await;
    let leader = tc.wait_for_leader(TIMEOUT).await.expect("no leader elected");

    let late = TestReplica::start(&tc.cluster, test_config("late")).await;
    assert_eventually(
        || async { late.state.caches_synced() },
        TIMEOUT,
        "standby caches should sync",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(1000)).await;

    assert!(!late.is_leading());
    assert_eq!(tc.leaders(), vec![leader]);

    late.stop().await.expect("clean shutdown");
    tc.shutdown().await;
}
