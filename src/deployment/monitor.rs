//! Periodic reconciliation of deployments against the runtime.
//!
//! [`DeploymentMonitor`] drives each deployment toward a settled state:
//! retrying creation, promoting healthy rollouts, timing out stuck ones,
//! polling deployments whose heartbeats went quiet and enforcing the
//! termination policy. [`ReservationExtender`] refreshes the admission
//! reservation of every deployment that holds one before its TTL lapses.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::errors::{DeploymentError, DeploymentResult};
use super::lifecycle::DeploymentManager;
use super::types::Deployment;
use crate::constants::{StatusCode, TerminalStatus};
use crate::logging::log_error;
use crate::state_machine::DeploymentState;

/// How long pod start failures are tolerated before a rollout is marked failed
const POD_FAILURE_GRACE: Duration = Duration::from_secs(300);

fn age(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct DeploymentMonitor {
    manager: Arc<DeploymentManager>,
}

impl DeploymentMonitor {
    pub fn new(manager: Arc<DeploymentManager>) -> Self {
        Self { manager }
    }

    fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.manager.config().init_timeout_seconds)
    }

    fn grace_period(&self) -> Duration {
        Duration::from_secs(self.manager.config().heartbeat_grace_seconds)
    }

    /// Visit every deployment that is not terminated. Returns how many were visited.
    pub async fn monitor_all(&self) -> DeploymentResult<usize> {
        let deployments = self.manager.store().list().await?;
        let mut visited = 0;
        for deployment in deployments.iter().filter(|d| !d.state.is_terminal()) {
            visited += 1;
            if let Err(e) = self.monitor(&deployment.key()).await {
                log_error(
                    "deployment_monitor",
                    "monitor",
                    &e.to_string(),
                    Some(&deployment.key()),
                );
            }
        }
        Ok(visited)
    }

    /// Reconcile one deployment, returning its state afterwards
    pub async fn monitor(&self, key: &str) -> DeploymentResult<DeploymentState> {
        let _guard = self.manager.locks().lock(key).await;
        let mut deployment = self.manager.get(key).await?;
        let now = Utc::now();

        if deployment.state.holds_reservation() {
            if let Some(detail) = self.check_termination_policy(&mut deployment, now).await? {
                self.manager
                    .terminate_locked(&mut deployment, Some(detail))
                    .await?;
                return Ok(deployment.state);
            }
        }

        match deployment.state {
            DeploymentState::Init => self.monitor_init(&mut deployment, now).await?,
            DeploymentState::Waiting | DeploymentState::Upgrading => {
                self.monitor_rollout(&mut deployment, now).await?
            }
            DeploymentState::Active | DeploymentState::Error => {
                self.monitor_running(&mut deployment, now).await?
            }
            DeploymentState::Stopping => self.manager.stop_locked(&mut deployment).await?,
            DeploymentState::Terminating => {
                self.manager.terminate_locked(&mut deployment, None).await?
            }
            DeploymentState::Stopped | DeploymentState::Terminated => {}
        }
        Ok(deployment.state)
    }

    /// Update accrued cost and report which limit, if any, has been crossed
    async fn check_termination_policy(
        &self,
        deployment: &mut Deployment,
        now: DateTime<Utc>,
    ) -> DeploymentResult<Option<TerminalStatus>> {
        let run_seconds = deployment.run_seconds(now);
        deployment.cost_cents =
            self.manager
                .cost_model()
                .cost_cents(deployment.cpu, deployment.mem, run_seconds);
        self.manager.store().upsert(deployment).await?;

        let Some(policy) = deployment.template.termination_policy.as_ref() else {
            return Ok(None);
        };
        if let Some(limit) = policy.spending_limit_cents() {
            if deployment.cost_cents >= limit as f64 {
                return Ok(Some(TerminalStatus::new(
                    StatusCode::LimitSpendingExceeded,
                    format!(
                        "spent {:.0} cents, limit is {limit}",
                        deployment.cost_cents
                    ),
                )));
            }
        }
        if let Some(limit) = policy.time_limit_seconds() {
            if run_seconds >= limit as f64 {
                return Ok(Some(TerminalStatus::new(
                    StatusCode::LimitTimeExceeded,
                    format!("ran {run_seconds:.0} seconds, limit is {limit}"),
                )));
            }
        }
        Ok(None)
    }

    async fn monitor_init(&self, deployment: &mut Deployment, now: DateTime<Utc>) -> DeploymentResult<()> {
        let error = match self.manager.create_locked(deployment).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if deployment.state != DeploymentState::Init {
            return Ok(());
        }
        if age(deployment.launched_at, now) <= self.init_timeout() {
            debug!(deployment = %deployment.key(), error = %error, "Creation failed, retrying next pass");
            return Ok(());
        }

        let detail = TerminalStatus::new(
            StatusCode::CreatingDeployment,
            format!("Timeout creating deployment: {error}"),
        );
        self.manager.terminate_locked(deployment, Some(detail)).await
    }

    async fn monitor_rollout(&self, deployment: &mut Deployment, now: DateTime<Utc>) -> DeploymentResult<()> {
        let status = match self.manager.runtime().status(deployment).await {
            Ok(status) => status,
            Err(e) => {
                return Err(DeploymentError::collaborator(
                    StatusCode::InstanceComingUp,
                    e,
                ))
            }
        };
        let key = deployment.key();

        if status.is_healthy(deployment.min_scale()) {
            self.manager.instances().replace(&key, &status.pods, now);
            self.manager
                .mark(deployment, DeploymentState::Active, None)
                .await?;
            info!(deployment = %key, replicas = status.available_replicas, "✅ Deployment is active");
            return Ok(());
        }

        let waited = age(deployment.updated_at, now);
        if let Some((reason, message)) = status.failures.first() {
            if waited > POD_FAILURE_GRACE {
                let detail = TerminalStatus::new(StatusCode::InstanceComingUp, message.clone())
                    .with_detail(reason.clone());
                return self
                    .manager
                    .mark(deployment, DeploymentState::Error, Some(detail))
                    .await;
            }
        }

        if waited > self.init_timeout() {
            let detail = TerminalStatus::new(
                StatusCode::DeploymentTimeout,
                format!(
                    "Timeout. {} out of {} instances are available.",
                    status.available_replicas, status.desired_replicas
                ),
            );
            return self
                .manager
                .mark(deployment, DeploymentState::Error, Some(detail))
                .await;
        }
        Ok(())
    }

    /// Poll the runtime for deployments whose heartbeats have gone quiet
    async fn monitor_running(&self, deployment: &mut Deployment, now: DateTime<Utc>) -> DeploymentResult<()> {
        let key = deployment.key();
        let fresh = self
            .manager
            .instances()
            .freshness(&key)
            .is_some_and(|seen| age(seen, now) <= self.grace_period());
        if fresh {
            return Ok(());
        }

        let status = self
            .manager
            .runtime()
            .status(deployment)
            .await
            .map_err(|e| DeploymentError::collaborator(StatusCode::DeploymentDegraded, e))?;
        self.manager.instances().replace(&key, &status.pods, now);

        if status.is_healthy(deployment.min_scale()) {
            if deployment.state != DeploymentState::Active {
                self.manager
                    .mark(deployment, DeploymentState::Active, None)
                    .await?;
            }
            return Ok(());
        }

        let detail = TerminalStatus::new(
            StatusCode::DeploymentDegraded,
            format!(
                "{} of {} available",
                status.available_replicas, status.desired_replicas
            ),
        );
        warn!(deployment = %key, detail = %detail, "Deployment degraded");
        self.manager
            .mark(deployment, DeploymentState::Error, Some(detail))
            .await
    }

    pub fn run(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(self.manager.config().monitor_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.monitor_all().await {
                            log_error("deployment_monitor", "monitor_all", &e.to_string(), None);
                        }
                    }
                }
            }
            debug!("Deployment monitor stopped");
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReservationExtender {
    manager: Arc<DeploymentManager>,
}

impl ReservationExtender {
    pub fn new(manager: Arc<DeploymentManager>) -> Self {
        Self { manager }
    }

    /// Re-reserve every deployment holding a reservation. Returns how many succeeded.
    pub async fn extend_all(&self) -> DeploymentResult<usize> {
        let deployments = self.manager.store().list().await?;
        let mut extended = 0;
        for deployment in deployments.iter().filter(|d| d.state.holds_reservation()) {
            match self.extend(&deployment.key()).await {
                Ok(true) => extended += 1,
                Ok(false) => {}
                Err(e) => log_error(
                    "reservation_extender",
                    "extend",
                    &e.to_string(),
                    Some(&deployment.key()),
                ),
            }
        }
        Ok(extended)
    }

    /// Refresh the reservation of the latest copy of `key` under its lock.
    /// Returns false when it no longer holds one.
    async fn extend(&self, key: &str) -> DeploymentResult<bool> {
        let _guard = self.manager.locks().lock(key).await;
        let Some(deployment) = self.manager.store().get(key).await? else {
            return Ok(false);
        };
        if !deployment.state.holds_reservation() {
            return Ok(false);
        }
        let (cpu, mem) = self.manager.reservation_envelope(&deployment).await?;
        self.manager
            .admission()
            .reserve(
                &deployment.deployment_id,
                cpu,
                mem,
                self.manager.reservation_ttl(),
            )
            .await
            .map_err(|e| DeploymentError::collaborator(StatusCode::ReserveResource, e))?;
        Ok(true)
    }

    pub fn run(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(self.manager.config().extender_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match self.extend_all().await {
                        Ok(extended) => debug!(extended, "Reservations extended"),
                        Err(e) => log_error("reservation_extender", "extend_all", &e.to_string(), None),
                    },
                }
            }
        })
    }
}
