//! Lease-based leader election.
//!
//! Every replica runs a [`LeaderElector`] against the same [`Lease`] object. The holder
//! renews `renew_time` every retry period; a standby takes over once it has watched the
//! record stay unchanged for a full lease duration. All writes carry the resource
//! version they were based on, so two candidates can never both win the same round.
//!
//! If the holder cannot renew within the renew deadline it aborts its leading work
//! without waiting for it and [`LeaderElector::run`] returns
//! [`ControllerError::LeadershipLost`]. The process is expected to exit and be restarted.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{Lease, LeaseExt, LeaseSpec, ObjectKey};
use crate::client::ResourceClient;
use crate::config::LeaderElectionConfig;
use crate::error::{ControllerError, Result};

const JITTER_FACTOR: f64 = 1.2;

/// `base` plus a random extra of up to `JITTER_FACTOR * base`.
pub fn jittered(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    base + base.mul_f64(rng.gen_range(0.0..JITTER_FACTOR))
}

struct Observed {
    spec: LeaseSpec,
    at: Instant,
}

pub struct LeaderElector {
    config: LeaderElectionConfig,
    client: Arc<dyn ResourceClient<Lease>>,
    key: ObjectKey,
    identity: String,
    observed: Mutex<Option<Observed>>,
}

impl LeaderElector {
    pub fn new(
        config: LeaderElectionConfig,
        client: Arc<dyn ResourceClient<Lease>>,
        namespace: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        let key = ObjectKey::new(namespace, config.lock_name.clone());
        Self {
            config,
            client,
            key,
            identity: identity.into(),
            observed: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Campaign for the lease, run `on_started_leading` while holding it, and keep
    /// renewing.
    ///
    /// Returns `Ok(())` when `cancel` fires (the lease is released first), the leading
    /// future's error if it fails on its own, or `LeadershipLost` when renewal misses
    /// the renew deadline.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, on_started_leading: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if !self.acquire(&cancel).await {
            return Ok(());
        }

        tracing::info!(identity = %self.identity, lease = %self.key, "Became leader");
        let leading = cancel.child_token();
        let mut handle = tokio::spawn(on_started_leading(leading.clone()));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    leading.cancel();
                    let result = join_leading(handle).await;
                    self.release().await;
                    return result;
                }
                result = &mut handle => {
                    let result = flatten(result);
                    if let Err(e) = &result {
                        tracing::error!(identity = %self.identity, error = %e, "Leading work failed");
                    }
                    self.release().await;
                    return result;
                }
                _ = tokio::time::sleep(self.config.retry_period) => {
                    if !self.renew(&cancel).await && !cancel.is_cancelled() {
                        tracing::error!(
                            identity = %self.identity,
                            lease = %self.key,
                            "Failed to renew lease within deadline, stepping down"
                        );
                        // Another candidate may already hold the lease. Nothing the
                        // leading work does from here may reach the cluster.
                        leading.cancel();
                        handle.abort();
                        if let Err(e) = handle.await {
                            tracing::debug!(identity = %self.identity, error = %e, "Leading work aborted");
                        }
                        return Err(ControllerError::LeadershipLost(self.identity.clone()));
                    }
                }
            }
        }
    }

    /// Retry until the lease is ours. Returns false if cancelled first.
    async fn acquire(&self, cancel: &CancellationToken) -> bool {
        tracing::info!(identity = %self.identity, lease = %self.key, "Attempting to acquire lease");
        loop {
            if self.try_acquire_or_renew().await {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(jittered(self.config.retry_period)) => {}
            }
        }
    }

    /// Retry renewal until it succeeds or the renew deadline passes.
    async fn renew(&self, cancel: &CancellationToken) -> bool {
        let deadline = Instant::now() + self.config.renew_deadline;
        loop {
            if self.try_acquire_or_renew().await {
                return true;
            }
            let next = Instant::now() + self.config.retry_period;
            if next >= deadline {
                return false;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(next) => {}
            }
        }
    }

    /// One round: create the lease, renew our hold, or take over an expired one.
    pub async fn try_acquire_or_renew(&self) -> bool {
        let now = MicroTime(Utc::now());
        let lease_secs = i32::try_from(self.config.lease_duration.as_secs())
            .unwrap_or(i32::MAX)
            .max(1);

        let current = match self.client.get(&self.key).await {
            Ok(lease) => lease,
            Err(e) if e.is_not_found() => {
                let lease = Lease::with_spec(
                    &self.key.namespace,
                    &self.key.name,
                    LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        lease_duration_seconds: Some(lease_secs),
                        acquire_time: Some(now.clone()),
                        renew_time: Some(now),
                        lease_transitions: Some(0),
                        ..Default::default()
                    },
                );
                return match self.client.create(lease).await {
                    Ok(created) => {
                        self.observe(created.spec.unwrap_or_default());
                        true
                    }
                    Err(e) => {
                        tracing::debug!(identity = %self.identity, error = %e, "Lost lease creation race");
                        false
                    }
                };
            }
            Err(e) => {
                tracing::warn!(identity = %self.identity, error = %e, "Failed to read lease");
                return false;
            }
        };

        let observed_at = self.observe(current.spec.clone().unwrap_or_default());
        let holder = current.holder();
        let held_by_us = holder == Some(self.identity.as_str());
        if let Some(other) = holder.filter(|_| !held_by_us) {
            if observed_at + self.config.lease_duration > Instant::now() {
                tracing::trace!(identity = %self.identity, holder = other, "Lease held by another candidate");
                return false;
            }
            tracing::info!(identity = %self.identity, previous = other, "Lease expired, taking over");
        }

        let mut next = current.clone();
        let spec = next.spec.get_or_insert_with(LeaseSpec::default);
        spec.holder_identity = Some(self.identity.clone());
        spec.lease_duration_seconds = Some(lease_secs);
        spec.renew_time = Some(now.clone());
        if !held_by_us {
            spec.acquire_time = Some(now);
            spec.lease_transitions = Some(current.transitions().saturating_add(1));
        }

        match self.client.replace(next).await {
            Ok(updated) => {
                self.observe(updated.spec.unwrap_or_default());
                true
            }
            Err(e) => {
                tracing::debug!(identity = %self.identity, error = %e, "Lease update rejected");
                false
            }
        }
    }

    /// Record `spec` and return when it was first seen in this form.
    fn observe(&self, spec: LeaseSpec) -> Instant {
        let mut observed = self
            .observed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match observed.as_ref() {
            Some(o) if o.spec == spec => o.at,
            _ => {
                let at = Instant::now();
                *observed = Some(Observed { spec, at });
                at
            }
        }
    }

    /// Clear our hold so a standby can take over without waiting out the lease.
    async fn release(&self) {
        let mut lease = match self.client.get(&self.key).await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(identity = %self.identity, error = %e, "Could not read lease to release it");
                return;
            }
        };
        if lease.holder() != Some(self.identity.as_str()) {
            return;
        }

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        spec.holder_identity = None;
        spec.lease_duration_seconds = Some(1);
        spec.renew_time = Some(MicroTime(Utc::now()));
        match self.client.replace(lease).await {
            Ok(_) => tracing::info!(identity = %self.identity, lease = %self.key, "Released lease"),
            Err(e) => tracing::warn!(identity = %self.identity, error = %e, "Failed to release lease"),
        }
    }
}

async fn join_leading(handle: tokio::task::JoinHandle<Result<()>>) -> Result<()> {
    flatten(handle.await)
}

fn flatten(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(ControllerError::Internal(format!("leading task failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::client::{MemoryCluster, Op};

    fn fast_config() -> LeaderElectionConfig {
        LeaderElectionConfig {
            lock_name: "jxtasks".into(),
            lease_duration: Duration::from_millis(300),
            renew_deadline: Duration::from_millis(200),
            retry_period: Duration::from_millis(50),
        }
    }

    fn elector(cluster: &MemoryCluster, identity: &str) -> LeaderElector {
        LeaderElector::new(fast_config(), cluster.leases.clone(), "default", identity)
    }

    fn lease_key() -> ObjectKey {
        ObjectKey::new("default", "jxtasks")
    }

    #[test]
    fn jitter_stays_in_range() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= base && d <= base.mul_f64(1.0 + JITTER_FACTOR));
        }
    }

    #[tokio::test]
    async fn first_candidate_creates_lease() {
        let cluster = MemoryCluster::new();
        let a = elector(&cluster, "a");
        assert!(a.try_acquire_or_renew().await);

        let lease = cluster.leases.get_object(&lease_key()).unwrap();
        assert_eq!(lease.holder(), Some("a"));
        assert_eq!(lease.transitions(), 0);
    }

    #[tokio::test]
    async fn second_candidate_waits_for_expiry() {
        let cluster = MemoryCluster::new();
        let a = elector(&cluster, "a");
        let b = elector(&cluster, "b");
        assert!(a.try_acquire_or_renew().await);
        assert!(!b.try_acquire_or_renew().await);

        // a keeps renewing, so b keeps seeing a fresh record.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(a.try_acquire_or_renew().await);
            assert!(!b.try_acquire_or_renew().await);
        }

        // a goes quiet; b takes over after a full lease duration.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(b.try_acquire_or_renew().await);
        let lease = cluster.leases.get_object(&lease_key()).unwrap();
        assert_eq!(lease.holder(), Some("b"));
        assert_eq!(lease.transitions(), 1);
    }

    #[tokio::test]
    async fn released_lease_is_taken_immediately() {
        let cluster = MemoryCluster::new();
        let a = elector(&cluster, "a");
        let b = elector(&cluster, "b");
        assert!(a.try_acquire_or_renew().await);
        a.release().await;
        assert!(b.try_acquire_or_renew().await);
    }

    #[tokio::test]
    async fn renew_failure_cancels_leading_work() {
        let cluster = MemoryCluster::new();
        let a = elector(&cluster, "a");
        let cancel = CancellationToken::new();
        let (token_tx, token_rx) = tokio::sync::oneshot::channel();

        let run = {
            let cluster = cluster.clone();
            async move {
                a.run(cancel, move |leading| async move {
                    // Break the API once we lead.
                    cluster.leases.fail_next(Op::Get, 1000);
                    let _ = token_tx.send(leading.clone());
                    leading.cancelled().await;
                    Ok(())
                })
                .await
            }
        };

        let result = tokio::time::timeout(Duration::from_secs(2), run).await.unwrap();
        assert!(matches!(result, Err(ControllerError::LeadershipLost(ref id)) if id == "a"));
        assert!(token_rx.await.unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn lost_lease_does_not_wait_for_leading_work() {
        let cluster = MemoryCluster::new();
        let a = elector(&cluster, "a");
        let finished = Arc::new(AtomicBool::new(false));

        let run = {
            let cluster = cluster.clone();
            let finished = finished.clone();
            async move {
                a.run(CancellationToken::new(), move |_leading| async move {
                    cluster.leases.fail_next(Op::Get, 1000);
                    // Ignores its token, like a reconcile stuck in a slow API call.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }
        };

        let started = Instant::now();
        let result = tokio::time::timeout(Duration::from_millis(800), run)
            .await
            .unwrap();
        assert!(matches!(result, Err(ControllerError::LeadershipLost(_))));
        assert!(started.elapsed() < Duration::from_millis(800));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_releases_lease() {
        let cluster = MemoryCluster::new();
        let a = Arc::new(elector(&cluster, "a"));
        let cancel = CancellationToken::new();

        let handle = {
            let a = a.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                a.run(cancel, |leading| async move {
                    leading.cancelled().await;
                    Ok(())
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let lease = cluster.leases.get_object(&lease_key()).unwrap();
        assert_eq!(lease.holder(), None);
    }
}
