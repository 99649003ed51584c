//! Declarative configuration inputs: infrastructure shape and test plan
//!
//! The orchestrator consumes these documents; it does not define their
//! schema beyond what deserialization and `validate` enforce at the
//! boundary.

use crate::error::{LabError, LabResult};
use crate::fleet::Role;
use crate::workload::{VariantOverrides, WorkloadSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Infrastructure configuration: per-role shape, network, storage, tagging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfrastructureConfig {
    /// Experiment-level metadata
    pub experiment: ExperimentSection,
    /// Cloud placement
    pub cloud: CloudSection,
    /// Network layout handed to the provisioner
    pub network: NetworkSection,
    /// Per-role compute shape
    pub compute: ComputeSection,
}

/// Experiment naming and extra tags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSection {
    /// Human-readable cluster identity
    pub name: String,
    /// Extra tags applied to every resource (CLI tags override these)
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Cloud placement parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSection {
    /// Region the whole experiment lives in
    pub region: String,
    /// Optional explicit availability zone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
}

/// Network layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// CIDR for the experiment VPC
    pub vpc_cidr: String,
    /// CIDR for the public subnet
    pub public_subnet_cidr: String,
}

/// Per-role compute shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeSection {
    /// Coordination service hosts
    pub coordinator: RoleShape,
    /// Storage hosts (carry attached volumes)
    pub storage: StorageShape,
    /// Broker hosts
    pub broker: RoleShape,
    /// Benchmark driver hosts
    pub worker: RoleShape,
}

impl ComputeSection {
    /// Host count for a role
    pub fn count(&self, role: Role) -> u32 {
        match role {
            Role::Coordinator => self.coordinator.count,
            Role::Storage => self.storage.shape.count,
            Role::Broker => self.broker.count,
            Role::Worker => self.worker.count,
        }
    }

    /// Instance type for a role
    pub fn instance_type(&self, role: Role) -> &str {
        match role {
            Role::Coordinator => &self.coordinator.instance_type,
            Role::Storage => &self.storage.shape.instance_type,
            Role::Broker => &self.broker.instance_type,
            Role::Worker => &self.worker.instance_type,
        }
    }
}

/// Count and instance type for one role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleShape {
    /// Number of hosts
    pub count: u32,
    /// Provider instance type
    pub instance_type: String,
}

/// Storage role shape plus volume parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageShape {
    /// Count and instance type
    #[serde(flatten)]
    pub shape: RoleShape,
    /// Attached volume parameters
    pub volume: VolumeSpec,
}

/// Attached volume parameters for storage hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Volume size in GiB
    pub size_gb: u32,
    /// Provider volume type (e.g. gp3)
    pub volume_type: String,
    /// Provisioned IOPS, when the type supports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<u32>,
    /// Provisioned throughput in MiB/s, when the type supports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput: Option<u32>,
}

impl InfrastructureConfig {
    /// Load and validate a YAML infrastructure config
    pub fn load(path: &Path) -> LabResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: InfrastructureConfig = serde_yaml::from_str(&text)
            .map_err(|e| LabError::config(format!("{}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Boundary validation
    pub fn validate(&self) -> LabResult<()> {
        if self.experiment.name.is_empty() {
            return Err(LabError::config("experiment.name must not be empty"));
        }
        for role in Role::ALL {
            if self.compute.count(role) == 0 {
                return Err(LabError::config(format!(
                    "compute.{role}.count must be at least 1"
                )));
            }
        }
        if self.compute.storage.volume.size_gb == 0 {
            return Err(LabError::config("storage volume size_gb must be positive"));
        }
        Ok(())
    }
}

/// Kind of a test variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    /// Producers publish at a fixed target rate
    FixedRate,
    /// Producers ramp towards the target rate
    RampUp,
    /// Producers publish unthrottled
    MaxRate,
}

/// One row of the test matrix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestVariant {
    /// Name, unique within the plan; names the result directory
    pub name: String,
    /// Variant kind
    pub kind: VariantKind,
    /// Target publish rate in msgs/s; required unless `max_rate`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_rate: Option<u64>,
    /// Overrides applied on top of the base workload
    #[serde(default)]
    pub workload_overrides: VariantOverrides,
}

/// Rule aborting the remainder of a matrix on persistent under-achievement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlateauPolicy {
    /// Maximum tolerated deviation below target, in percent
    pub allowed_deviation: f64,
    /// Consecutive under-target variants tolerated before aborting
    pub consecutive_fails_allowed: usize,
}

/// Test plan: base workload plus an ordered list of variants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlan {
    /// Plan name
    pub name: String,
    /// Base workload every variant starts from
    pub base_workload: WorkloadSpec,
    /// Variants, executed strictly in declared order
    pub test_runs: Vec<TestVariant>,
    /// Optional early-stop rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plateau: Option<PlateauPolicy>,
}

impl TestPlan {
    /// Load and validate a YAML test plan
    pub fn load(path: &Path) -> LabResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let plan: TestPlan = serde_yaml::from_str(&text)
            .map_err(|e| LabError::config(format!("{}: {e}", path.display())))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Boundary validation
    pub fn validate(&self) -> LabResult<()> {
        if self.test_runs.is_empty() {
            return Err(LabError::config("test plan has no test_runs"));
        }

        let mut seen = std::collections::BTreeSet::new();
        for variant in &self.test_runs {
            if variant.name.is_empty() {
                return Err(LabError::config("variant name must not be empty"));
            }
            if !seen.insert(variant.name.as_str()) {
                return Err(LabError::config(format!(
                    "duplicate variant name: {}",
                    variant.name
                )));
            }
            match variant.kind {
                VariantKind::FixedRate | VariantKind::RampUp => {
                    if variant.target_rate.is_none() {
                        return Err(LabError::config(format!(
                            "variant {} requires target_rate",
                            variant.name
                        )));
                    }
                }
                VariantKind::MaxRate => {}
            }
        }

        if let Some(plateau) = &self.plateau {
            if !(plateau.allowed_deviation > 0.0 && plateau.allowed_deviation <= 100.0) {
                return Err(LabError::config(
                    "plateau.allowed_deviation must be in (0, 100]",
                ));
            }
            if plateau.consecutive_fails_allowed == 0 {
                return Err(LabError::config(
                    "plateau.consecutive_fails_allowed must be at least 1",
                ));
            }
        }

        self.base_workload.validate()?;
        Ok(())
    }
}
