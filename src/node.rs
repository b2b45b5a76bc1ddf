use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::client::Clients;
use crate::config::ControllerConfig;
use crate::controller::{Controller, ControllerState};
use crate::error::Result;
use crate::health::run_health_server;
use crate::leader::LeaderElector;

/// One controller replica: caches, optional health server, and the leader-elected
/// worker pool.
pub struct Node {
    pub config: ControllerConfig,
    clients: Clients,
}

impl Node {
    pub fn new(config: ControllerConfig, clients: Clients) -> Self {
        Self { config, clients }
    }

    /// Run the replica until `cancel` fires or leadership is lost.
    ///
    /// 1. Starts the JxTask and Pod caches and the event router
    /// 2. Optionally serves the health endpoints
    /// 3. Campaigns for the lease; while leading, runs the worker pool
    ///
    /// `on_started` receives the controller's state once the caches are running, so
    /// callers can observe the replica.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an invalid configuration, and `LeadershipLost` when the
    /// lease could not be renewed. Either way every background task has stopped when
    /// this returns.
    pub async fn run<F>(self, cancel: CancellationToken, on_started: F) -> Result<()>
    where
        F: FnOnce(ControllerState),
    {
        self.config.validate()?;

        // Local token so caches also stop when leadership is lost.
        let local = cancel.child_token();
        let controller = Arc::new(Controller::start(
            self.config.clone(),
            self.clients.clone(),
            local.clone(),
        ));
        on_started(controller.state());

        let health = self.config.health_addr.map(|addr| {
            let state = controller.state();
            let token = local.clone();
            tokio::spawn(async move { run_health_server(addr, state, token).await })
        });

        let elector = LeaderElector::new(
            self.config.leader_election.clone(),
            self.clients.leases.clone(),
            self.config.lease_namespace.clone(),
            self.config.identity.clone(),
        );
        let leading = controller.clone();
        let result = elector
            .run(cancel.clone(), move |token| async move {
                leading.run_workers(token).await
            })
            .await;

        local.cancel();
        controller.join().await;
        if let Some(handle) = health {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Health server task failed");
            }
        }

        match &result {
            Ok(()) => tracing::info!(identity = %self.config.identity, "Controller stopped"),
            Err(e) => tracing::error!(identity = %self.config.identity, error = %e, "Controller stopped"),
        }
        result
    }
}
