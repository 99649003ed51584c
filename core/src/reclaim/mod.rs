//! Tag-scoped cloud resource reclamation
//!
//! Destroys every resource tagged with an experiment identity, in
//! dependency order, with no reliance on provisioner state. Runs both as
//! graceful teardown and as crash-path cleanup; the algorithm is identical
//! and safe to re-run. Once entered it is never cancelled.

use crate::error::{LabError, LabResult};
use crate::experiment::{ExperimentId, TAG_EXPERIMENT_ID};
use crate::retry::{poll_until, retry_transient, Backoff};
use crate::traits::{CloudCompute, CloudError, GatewayView, InstanceState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;


/// Reclaim tunables
#[derive(Debug, Clone, Copy)]
pub struct ReclaimConfig {
    /// How long to wait for instances to report terminated before moving on
    pub instance_wait_deadline: Duration,
    /// Backoff while waiting on instance termination
    pub instance_wait_backoff: Backoff,
    /// Backoff for throttled or transient API calls
    pub api_backoff: Backoff,
    /// Bounded attempts for throttled or transient API calls
    pub api_attempts: usize,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        ReclaimConfig {
            instance_wait_deadline: Duration::from_secs(10 * 60),
            instance_wait_backoff: Backoff::new(
                Duration::from_secs(5),
                1.5,
                Duration::from_secs(30),
            ),
            api_backoff: Backoff::new(Duration::from_secs(2), 2.0, Duration::from_secs(30)),
            api_attempts: 5,
        }
    }
}

/// Discovered resources, partitioned by kind; transient per invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReclaimPlan {
    /// Compute instances (non-terminated)
    pub instances: Vec<String>,
    /// Volumes
    pub volumes: Vec<String>,
    /// Security groups
    pub security_groups: Vec<String>,
    /// Subnets
    pub subnets: Vec<String>,
    /// Route tables
    pub route_tables: Vec<String>,
    /// Internet gateways with their attachments
    pub internet_gateways: Vec<GatewayView>,
    /// VPCs
    pub vpcs: Vec<String>,
}

impl ReclaimPlan {
    /// Total number of resources in the plan
    pub fn total(&self) -> usize {
        self.instances.len()
            + self.volumes.len()
            + self.security_groups.len()
            + self.subnets.len()
            + self.route_tables.len()
            + self.internet_gateways.len()
            + self.vpcs.len()
    }

    /// Whether nothing remains to destroy
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Outcome of one reclaim pass
#[derive(Debug, Clone, Default)]
pub struct ReclaimSummary {
    /// Resources destroyed (or already gone)
    pub deleted: usize,
    /// Human-readable failures, one per resource that would not die
    pub failures: Vec<String>,
}

impl ReclaimSummary {
    /// Whether the pass left nothing behind
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Destroys everything tagged with an experiment identity
pub struct Reclaimer {
    cloud: Arc<dyn CloudCompute>,
    config: ReclaimConfig,
}

impl Reclaimer {
    /// Create a reclaimer with default tunables
    pub fn new(cloud: Arc<dyn CloudCompute>) -> Self {
        Reclaimer {
            cloud,
            config: ReclaimConfig::default(),
        }
    }

    /// Override the tunables
    pub fn with_config(mut self, config: ReclaimConfig) -> Self {
        self.config = config;
        self
    }

    /// Materialise the reclaim plan by tag query, without side effects
    pub async fn discover(&self, id: &ExperimentId) -> LabResult<ReclaimPlan> {
        let tag = id.as_str();

        let instances = self
            .listed("instances", || self.cloud.instances_by_tag(TAG_EXPERIMENT_ID, tag))
            .await?
            .into_iter()
            .filter(|v| v.state != InstanceState::Terminated)
            .map(|v| v.id)
            .collect();

        Ok(ReclaimPlan {
            instances,
            volumes: self
                .listed("volumes", || self.cloud.volumes_by_tag(TAG_EXPERIMENT_ID, tag))
                .await?,
            security_groups: self
                .listed("security-groups", || {
                    self.cloud.security_groups_by_tag(TAG_EXPERIMENT_ID, tag)
                })
                .await?,
            subnets: self
                .listed("subnets", || self.cloud.subnets_by_tag(TAG_EXPERIMENT_ID, tag))
                .await?,
            route_tables: self
                .listed("route-tables", || {
                    self.cloud.route_tables_by_tag(TAG_EXPERIMENT_ID, tag)
                })
                .await?,
            internet_gateways: self
                .listed("internet-gateways", || {
                    self.cloud.internet_gateways_by_tag(TAG_EXPERIMENT_ID, tag)
                })
                .await?,
            vpcs: self
                .listed("vpcs", || self.cloud.vpcs_by_tag(TAG_EXPERIMENT_ID, tag))
                .await?,
        })
    }

    /// Discover and destroy everything tagged with the identity
    ///
    /// Deletion order respects cloud dependencies: instances first (with a
    /// bounded wait for termination to propagate), then volumes, security
    /// groups, subnets, route tables, internet gateways, and finally VPCs.
    /// "Not found" counts as success throughout, so re-running is safe.
    pub async fn execute(&self, id: &ExperimentId) -> LabResult<ReclaimSummary> {
        let plan = self.discover(id).await?;
        if plan.is_empty() {
            tracing::info!(experiment = %id, "Reclaim: nothing tagged, already clean");
            return Ok(ReclaimSummary::default());
        }

        tracing::info!(
            experiment = %id,
            resources = plan.total(),
            "Reclaim: destroying tagged resources"
        );
        let mut summary = ReclaimSummary::default();

        if !plan.instances.is_empty() {
            match self
                .with_retries("terminate-instances", || {
                    self.cloud.terminate_instances(&plan.instances)
                })
                .await
            {
                Ok(()) => {
                    summary.deleted += plan.instances.len();
                    self.wait_instances_terminated(id, &plan.instances).await;
                }
                Err(e) => summary
                    .failures
                    .push(format!("instances {:?}: {e}", plan.instances)),
            }
        }

        for volume in &plan.volumes {
            self.delete(&mut summary, "volume", volume, || {
                self.cloud.delete_volume(volume)
            })
            .await;
        }
        for group in &plan.security_groups {
            self.delete(&mut summary, "security-group", group, || {
                self.cloud.delete_security_group(group)
            })
            .await;
        }
        for subnet in &plan.subnets {
            self.delete(&mut summary, "subnet", subnet, || {
                self.cloud.delete_subnet(subnet)
            })
            .await;
        }
        for table in &plan.route_tables {
            self.delete(&mut summary, "route-table", table, || {
                self.cloud.delete_route_table(table)
            })
            .await;
        }
        for gateway in &plan.internet_gateways {
            for vpc in &gateway.attached_vpcs {
                self.delete(&mut summary, "igw-attachment", &gateway.id, || {
                    self.cloud.detach_internet_gateway(&gateway.id, vpc)
                })
                .await;
            }
            self.delete(&mut summary, "internet-gateway", &gateway.id, || {
                self.cloud.delete_internet_gateway(&gateway.id)
            })
            .await;
        }
        for vpc in &plan.vpcs {
            self.delete(&mut summary, "vpc", vpc, || self.cloud.delete_vpc(vpc))
                .await;
        }

        if summary.is_clean() {
            tracing::info!(experiment = %id, deleted = summary.deleted, "Reclaim complete");
        } else {
            tracing::error!(
                experiment = %id,
                deleted = summary.deleted,
                failures = summary.failures.len(),
                "Reclaim left resources behind"
            );
        }
        Ok(summary)
    }

    /// Bounded wait for termination to propagate; continues on deadline
    async fn wait_instances_terminated(&self, id: &ExperimentId, ids: &[String]) {
        let wait = poll_until(self.config.instance_wait_backoff, || async {
            match self
                .cloud
                .instances_by_tag(TAG_EXPERIMENT_ID, id.as_str())
                .await
            {
                Ok(views) => {
                    let live = views
                        .iter()
                        .filter(|v| {
                            ids.contains(&v.id) && v.state != InstanceState::Terminated
                        })
                        .count();
                    Ok::<_, LabError>(if live == 0 { Some(()) } else { None })
                }
                // Discovery hiccups here only delay the wait barrier
                Err(e) => {
                    tracing::debug!(error = %e, "Termination check failed, retrying");
                    Ok(None)
                }
            }
        });

        match tokio::time::timeout(self.config.instance_wait_deadline, wait).await {
            Ok(_) => tracing::info!(instances = ids.len(), "Instances terminated"),
            // Compute deletion eventually propagates; later kinds tolerate
            // dangling references
            Err(_) => tracing::warn!(
                instances = ids.len(),
                "Instance termination wait expired, continuing"
            ),
        }
    }

    async fn delete<F, Fut>(
        &self,
        summary: &mut ReclaimSummary,
        kind: &str,
        resource: &str,
        op: F,
    ) where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<(), CloudError>>,
    {
        let result = retry_transient(kind, self.config.api_attempts, self.config.api_backoff, CloudError::is_throttle, op).await;
        match result {
            Ok(()) => {
                tracing::info!(kind, resource, "Deleted");
                summary.deleted += 1;
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(kind, resource, "Already gone");
                summary.deleted += 1;
            }
            Err(e) => {
                tracing::error!(kind, resource, error = %e, "Delete failed");
                summary.failures.push(format!("{kind} {resource}: {e}"));
            }
        }
    }

    async fn listed<T, F, Fut>(&self, kind: &str, op: F) -> LabResult<Vec<T>>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<T>, CloudError>>,
    {
        // Throttles and transient describe failures retry with backoff;
        // persistent failure surfaces as discovery failure
        retry_transient(
            kind,
            self.config.api_attempts,
            self.config.api_backoff,
            |e: &CloudError| !e.is_not_found(),
            op,
        )
        .await
        .map_err(|e| LabError::discovery(format!("{kind}: {e}")))
    }
}
