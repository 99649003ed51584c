//! Staged readiness cascade for a freshly provisioned fleet
//!
//! Three stages, strictly ordered, each with its own deadline and backoff:
//!
//! 1. **Fleet reachable** — every tagged instance reports cloud-level
//!    `running`.
//! 2. **Agents online** — every host has an active control-plane agent
//!    registration. Fresh hosts need the most time here.
//! 3. **Services active, endpoints healthy** — per host, per service
//!    descriptor of its role: a service-active check, then the role's
//!    health probe, both executed on the host itself.
//!
//! Probes within a stage fan out across hosts; a stage succeeds when every
//! probe has passed at least once and fails on its deadline.

use crate::error::{LabError, LabResult};
use crate::exec::RemoteExecutor;
use crate::experiment::{ExperimentId, TAG_EXPERIMENT_ID};
use crate::fleet::{Fleet, Host, ServiceDescriptor};
use crate::retry::{poll_until, Backoff};
use crate::traits::{CloudCompute, InstanceState};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(test)]
mod tests;

/// Deadlines and backoff for the cascade
#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    /// Stage 1 deadline (default 5 min)
    pub fleet_deadline: Duration,
    /// Stage 2 deadline (default 10 min; agents are slowest on fresh hosts)
    pub agent_deadline: Duration,
    /// Stage 3 deadline (default 10 min)
    pub service_deadline: Duration,
    /// Backoff between probe attempts within a stage
    pub backoff: Backoff,
    /// Deadline for each individual remote probe command
    pub command_deadline: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            fleet_deadline: Duration::from_secs(5 * 60),
            agent_deadline: Duration::from_secs(10 * 60),
            service_deadline: Duration::from_secs(10 * 60),
            backoff: Backoff::new(Duration::from_secs(5), 1.5, Duration::from_secs(30)),
            command_deadline: Duration::from_secs(60),
        }
    }
}

/// Drives the readiness cascade
pub struct ReadinessProber {
    cloud: Arc<dyn CloudCompute>,
    executor: RemoteExecutor,
    config: ProbeConfig,
}

impl ReadinessProber {
    /// Create a prober with default deadlines
    pub fn new(cloud: Arc<dyn CloudCompute>, executor: RemoteExecutor) -> Self {
        ReadinessProber {
            cloud,
            executor,
            config: ProbeConfig::default(),
        }
    }

    /// Override the probe configuration
    pub fn with_config(mut self, config: ProbeConfig) -> Self {
        self.config = config;
        self
    }

    /// Run all three stages in order; returns once the fleet is fit
    pub async fn wait_ready(&self, id: &ExperimentId, fleet: &Fleet) -> LabResult<()> {
        self.stage_fleet_running(id, fleet).await?;
        self.stage_agents_online(fleet).await?;
        self.stage_services_healthy(fleet).await?;
        tracing::info!(experiment = %id, hosts = fleet.len(), "Fleet ready");
        Ok(())
    }

    /// Stage 1: every tagged instance reports cloud-level running
    async fn stage_fleet_running(&self, id: &ExperimentId, fleet: &Fleet) -> LabResult<()> {
        tracing::info!(stage = 1, hosts = fleet.len(), "Readiness: waiting for fleet to run");
        let expected: BTreeSet<&str> = fleet.hosts().map(|h| h.id.as_str()).collect();
        let last_pending: Mutex<String> = Mutex::new("no instances observed".to_string());

        let wait = poll_until(self.config.backoff, || async {
            let views = match self
                .cloud
                .instances_by_tag(TAG_EXPERIMENT_ID, id.as_str())
                .await
            {
                Ok(views) => views,
                Err(e) if e.is_throttle() => {
                    tracing::debug!(stage = 1, error = %e, "Throttled, retrying");
                    return Ok(None);
                }
                Err(e) => return Err(LabError::discovery(e.to_string())),
            };

            let running: BTreeSet<&str> = views
                .iter()
                .filter(|v| v.state == InstanceState::Running)
                .map(|v| v.id.as_str())
                .collect();
            let pending: Vec<&str> = expected.difference(&running).copied().collect();

            if pending.is_empty() {
                Ok(Some(()))
            } else {
                tracing::debug!(stage = 1, pending = ?pending, "Instances not yet running");
                *last_pending.lock().unwrap() = pending.join(", ");
                Ok(None)
            }
        });

        match tokio::time::timeout(self.config.fleet_deadline, wait).await {
            Ok(result) => result?,
            Err(_) => {
                let detail = last_pending.lock().unwrap().clone();
                tracing::warn!(stage = 1, pending = %detail, "Readiness stage timed out");
                return Err(LabError::ReadinessTimeout { stage: 1, detail });
            }
        }
        tracing::info!(stage = 1, "Readiness: fleet running");
        Ok(())
    }

    /// Stage 2: every host has an active agent registration
    async fn stage_agents_online(&self, fleet: &Fleet) -> LabResult<()> {
        tracing::info!(stage = 2, "Readiness: waiting for agents");
        let pending: Arc<Mutex<BTreeSet<String>>> = Arc::new(Mutex::new(
            fleet.hosts().map(|h| h.id.clone()).collect(),
        ));

        let waits = fleet.hosts().map(|host| {
            let pending = Arc::clone(&pending);
            async move {
                poll_until::<(), LabError, _, _>(self.config.backoff, || async {
                    match self.executor.control().agent_online(&host.id).await {
                        Ok(true) => Ok(Some(())),
                        Ok(false) => Ok(None),
                        // Inventory lookups are retried until the deadline
                        Err(e) => {
                            tracing::debug!(stage = 2, host = %host.id, error = %e, "Inventory lookup failed");
                            Ok(None)
                        }
                    }
                })
                .await?;
                pending.lock().unwrap().remove(&host.id);
                tracing::info!(stage = 2, host = %host.id, "Agent online");
                Ok::<(), LabError>(())
            }
        });

        match tokio::time::timeout(self.config.agent_deadline, join_all(waits)).await {
            Ok(results) => {
                for result in results {
                    result?;
                }
            }
            Err(_) => {
                let detail = pending
                    .lock()
                    .unwrap()
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ");
                tracing::warn!(stage = 2, pending = %detail, "Readiness stage timed out");
                return Err(LabError::ReadinessTimeout { stage: 2, detail });
            }
        }
        tracing::info!(stage = 2, "Readiness: all agents online");
        Ok(())
    }

    /// Stage 3: services active and endpoints healthy, per host and role
    async fn stage_services_healthy(&self, fleet: &Fleet) -> LabResult<()> {
        tracing::info!(stage = 3, "Readiness: waiting for services");
        let pending: Arc<Mutex<BTreeSet<String>>> = Arc::new(Mutex::new(
            fleet
                .hosts()
                .flat_map(|h| {
                    h.role
                        .services()
                        .iter()
                        .map(move |s| probe_key(h, s))
                })
                .collect(),
        ));

        let waits = fleet.hosts().flat_map(|host| {
            let pending = Arc::clone(&pending);
            host.role.services().iter().map(move |descriptor| {
                let pending = Arc::clone(&pending);
                async move {
                    self.wait_service(host, descriptor).await?;
                    pending.lock().unwrap().remove(&probe_key(host, descriptor));
                    Ok::<(), LabError>(())
                }
            })
        });

        match tokio::time::timeout(self.config.service_deadline, join_all(waits)).await {
            Ok(results) => {
                for result in results {
                    result?;
                }
            }
            Err(_) => {
                let detail = pending
                    .lock()
                    .unwrap()
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ");
                tracing::warn!(stage = 3, pending = %detail, "Readiness stage timed out");
                return Err(LabError::ReadinessTimeout { stage: 3, detail });
            }
        }
        tracing::info!(stage = 3, "Readiness: all services healthy");
        Ok(())
    }

    /// Retry one (host, descriptor) pair until both checks pass once
    async fn wait_service(&self, host: &Host, descriptor: &ServiceDescriptor) -> LabResult<()> {
        let component = descriptor.component();
        poll_until(self.config.backoff, || async {
            if let Some(active) = descriptor.active_payload() {
                match self
                    .executor
                    .run(&host.id, &active, self.config.command_deadline)
                    .await
                {
                    Ok(_) => {}
                    Err(LabError::ExecutionFailed { stderr, .. }) => {
                        tracing::warn!(
                            stage = 3,
                            host = %host.id,
                            component,
                            stderr = %stderr,
                            "Service not active"
                        );
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                }
            }

            let payload = descriptor.probe.payload();
            match self
                .executor
                .run(&host.id, &payload, self.config.command_deadline)
                .await
            {
                Ok(_) => {
                    tracing::info!(
                        stage = 3,
                        host = %host.id,
                        component,
                        probe = descriptor.probe.kind(),
                        "Endpoint healthy"
                    );
                    Ok(Some(()))
                }
                Err(LabError::ExecutionFailed { stderr, .. }) => {
                    tracing::warn!(
                        stage = 3,
                        host = %host.id,
                        component,
                        probe = descriptor.probe.kind(),
                        stderr = %stderr,
                        "Endpoint unhealthy"
                    );
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })
        .await
    }
}

// A role may probe the same unit more than once (the coordinator checks
// both the port and the challenge), so the key carries the probe kind
fn probe_key(host: &Host, descriptor: &ServiceDescriptor) -> String {
    format!(
        "{}/{}/{}",
        host.id,
        descriptor.component(),
        descriptor.probe.kind()
    )
}
