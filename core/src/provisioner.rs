//! Provisioner boundary: generated variables, output document, subprocess
//!
//! The provisioner is a black box. It receives a generated variables
//! document, and the only thing the orchestrator consumes back is its final
//! JSON output document naming each role's host identifiers and private
//! IPs. Child stdout/stderr are streamed line-wise into the experiment log,
//! never parsed.

use crate::config::InfrastructureConfig;
use crate::error::{LabError, LabResult};
use crate::experiment::{ExperimentId, TagSet};
use crate::fleet::{Fleet, Host, Role};
use crate::store::ExperimentDir;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Variables document handed to the provisioner
///
/// `default_tags` carries the full required tag set; the provisioner injects
/// it into every resource it creates, which is what makes tag-scoped
/// reclaim authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfraVars {
    /// Experiment identity (also present in `default_tags`)
    pub experiment_id: String,
    /// Cluster identity from the config
    pub experiment_name: String,
    /// Region
    pub region: String,
    /// Optional explicit availability zone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    /// VPC CIDR
    pub vpc_cidr: String,
    /// Public subnet CIDR
    pub public_subnet_cidr: String,
    /// Coordinator host count
    pub coordinator_count: u32,
    /// Coordinator instance type
    pub coordinator_instance_type: String,
    /// Storage host count
    pub storage_count: u32,
    /// Storage instance type
    pub storage_instance_type: String,
    /// Storage volume size in GiB
    pub storage_volume_size_gb: u32,
    /// Storage volume type
    pub storage_volume_type: String,
    /// Storage volume IOPS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_volume_iops: Option<u32>,
    /// Storage volume throughput in MiB/s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_volume_throughput: Option<u32>,
    /// Broker host count
    pub broker_count: u32,
    /// Broker instance type
    pub broker_instance_type: String,
    /// Worker host count
    pub worker_count: u32,
    /// Worker instance type
    pub worker_instance_type: String,
    /// Tag set injected into every created resource
    pub default_tags: BTreeMap<String, String>,
}

impl InfraVars {
    /// Render the variables document from config, identity, and CLI tags
    pub fn render(
        cfg: &InfrastructureConfig,
        id: &ExperimentId,
        cli_tags: &BTreeMap<String, String>,
    ) -> Self {
        let tags = TagSet::for_experiment(id, None)
            .merged(&cfg.experiment.tags)
            .merged(cli_tags);
        let default_tags = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        InfraVars {
            experiment_id: id.to_string(),
            experiment_name: cfg.experiment.name.clone(),
            region: cfg.cloud.region.clone(),
            availability_zone: cfg.cloud.availability_zone.clone(),
            vpc_cidr: cfg.network.vpc_cidr.clone(),
            public_subnet_cidr: cfg.network.public_subnet_cidr.clone(),
            coordinator_count: cfg.compute.count(Role::Coordinator),
            coordinator_instance_type: cfg.compute.instance_type(Role::Coordinator).to_string(),
            storage_count: cfg.compute.count(Role::Storage),
            storage_instance_type: cfg.compute.instance_type(Role::Storage).to_string(),
            storage_volume_size_gb: cfg.compute.storage.volume.size_gb,
            storage_volume_type: cfg.compute.storage.volume.volume_type.clone(),
            storage_volume_iops: cfg.compute.storage.volume.iops,
            storage_volume_throughput: cfg.compute.storage.volume.throughput,
            broker_count: cfg.compute.count(Role::Broker),
            broker_instance_type: cfg.compute.instance_type(Role::Broker).to_string(),
            worker_count: cfg.compute.count(Role::Worker),
            worker_instance_type: cfg.compute.instance_type(Role::Worker).to_string(),
            default_tags,
        }
    }
}

/// Host identifiers and private IPs for one role
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleOutputs {
    /// Cloud identifiers, in provisioning order
    pub ids: Vec<String>,
    /// Private IPs, index-aligned with `ids`
    pub private_ips: Vec<String>,
}

/// The provisioner's output document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvisionOutputs {
    /// Per-role outputs
    pub roles: BTreeMap<Role, RoleOutputs>,
}

impl ProvisionOutputs {
    /// Build the fleet from the output document
    pub fn fleet(&self) -> LabResult<Fleet> {
        let mut hosts = Vec::new();
        for (role, out) in &self.roles {
            if out.ids.len() != out.private_ips.len() {
                return Err(LabError::ProvisionerFailed(format!(
                    "role {role}: {} ids but {} private ips",
                    out.ids.len(),
                    out.private_ips.len()
                )));
            }
            for (id, ip) in out.ids.iter().zip(&out.private_ips) {
                hosts.push(Host {
                    id: id.clone(),
                    role: *role,
                    private_ip: ip.clone(),
                });
            }
        }
        Ok(Fleet::new(hosts))
    }
}

/// Errors from the provisioner boundary
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Subprocess exited non-zero (or was killed)
    #[error("provisioner exited with status {code:?}")]
    Exited {
        /// Exit code, when the process was not killed by a signal
        code: Option<i32>,
    },

    /// The output document could not be read or parsed
    #[error("provisioner output invalid: {0}")]
    Output(String),

    /// Spawning or talking to the subprocess failed
    #[error("provisioner IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else (used by non-subprocess implementations)
    #[error("{0}")]
    Other(String),
}

impl From<ProvisionError> for LabError {
    fn from(e: ProvisionError) -> Self {
        LabError::ProvisionerFailed(e.to_string())
    }
}

/// Infrastructure provisioning seam
#[async_trait]
pub trait Provision: Send + Sync {
    /// Create the infrastructure described by `vars`; returns the fleet doc
    async fn apply(
        &self,
        vars: &InfraVars,
        experiment: &ExperimentDir,
    ) -> Result<ProvisionOutputs, ProvisionError>;

    /// Destroy the infrastructure using the provisioner's own state
    ///
    /// Callers fall back to tag-scoped reclaim when this fails; a partial
    /// destroy is therefore acceptable here.
    async fn destroy(
        &self,
        vars: &InfraVars,
        experiment: &ExperimentDir,
    ) -> Result<(), ProvisionError>;
}

/// Terraform-backed provisioner
///
/// Runs `terraform` against a checked-out module directory. The generated
/// variables file is the one the sequencer wrote into the experiment store.
pub struct TerraformProvisioner {
    binary: PathBuf,
    module_dir: PathBuf,
}

impl TerraformProvisioner {
    /// Use the `terraform` binary from `PATH` against the given module dir
    pub fn new(module_dir: impl Into<PathBuf>) -> Self {
        TerraformProvisioner {
            binary: PathBuf::from("terraform"),
            module_dir: module_dir.into(),
        }
    }

    async fn run_streaming(
        &self,
        args: &[String],
        experiment: &ExperimentDir,
    ) -> Result<(), ProvisionError> {
        experiment.append_log(&format!("provisioner: terraform {}", args.join(" ")));

        let mut child = tokio::process::Command::new(&self.binary)
            .arg(format!("-chdir={}", self.module_dir.display()))
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = tokio::spawn(stream_lines(stdout, experiment.clone(), "provisioner"));
        let err_task = tokio::spawn(stream_lines(stderr, experiment.clone(), "provisioner!"));

        let status = child.wait().await?;
        let _ = out_task.await;
        let _ = err_task.await;

        if status.success() {
            Ok(())
        } else {
            Err(ProvisionError::Exited {
                code: status.code(),
            })
        }
    }

    async fn read_outputs(&self) -> Result<ProvisionOutputs, ProvisionError> {
        let output = tokio::process::Command::new(&self.binary)
            .arg(format!("-chdir={}", self.module_dir.display()))
            .args(["output", "-json"])
            .output()
            .await?;

        if !output.status.success() {
            return Err(ProvisionError::Exited {
                code: output.status.code(),
            });
        }

        parse_output_document(&output.stdout)
    }
}

/// Parse `terraform output -json`, unwrapping the per-output `value` layer
fn parse_output_document(bytes: &[u8]) -> Result<ProvisionOutputs, ProvisionError> {
    #[derive(Deserialize)]
    struct OutputValue {
        value: RoleOutputs,
    }

    let doc: BTreeMap<String, OutputValue> =
        serde_json::from_slice(bytes).map_err(|e| ProvisionError::Output(e.to_string()))?;

    let mut roles = BTreeMap::new();
    for (name, output) in doc {
        let Ok(role) = name.parse::<Role>() else {
            // Output names that are not roles are the provisioner's business
            continue;
        };
        roles.insert(role, output.value);
    }

    if roles.is_empty() {
        return Err(ProvisionError::Output(
            "no role outputs in provisioner document".to_string(),
        ));
    }
    Ok(ProvisionOutputs { roles })
}

async fn stream_lines(
    pipe: Option<impl AsyncRead + Unpin>,
    experiment: ExperimentDir,
    prefix: &'static str,
) {
    let Some(pipe) = pipe else { return };
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        experiment.append_log(&format!("{prefix}: {line}"));
    }
}

#[async_trait]
impl Provision for TerraformProvisioner {
    async fn apply(
        &self,
        _vars: &InfraVars,
        experiment: &ExperimentDir,
    ) -> Result<ProvisionOutputs, ProvisionError> {
        let var_file = experiment.infra_vars_path();
        self.run_streaming(&["init".to_string(), "-input=false".to_string()], experiment)
            .await?;
        self.run_streaming(
            &[
                "apply".to_string(),
                format!("-var-file={}", var_file.display()),
                "-auto-approve".to_string(),
                "-input=false".to_string(),
            ],
            experiment,
        )
        .await?;
        self.read_outputs().await
    }

    async fn destroy(
        &self,
        _vars: &InfraVars,
        experiment: &ExperimentDir,
    ) -> Result<(), ProvisionError> {
        let var_file = experiment.infra_vars_path();
        self.run_streaming(
            &[
                "destroy".to_string(),
                format!("-var-file={}", var_file.display()),
                "-auto-approve".to_string(),
                "-input=false".to_string(),
            ],
            experiment,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InfrastructureConfig;

    fn config() -> InfrastructureConfig {
        serde_yaml::from_str(
            r#"
experiment:
  name: perf-lab
  tags: { Team: messaging }
cloud: { region: us-west-2 }
network: { vpc_cidr: 10.0.0.0/16, public_subnet_cidr: 10.0.1.0/24 }
compute:
  coordinator: { count: 3, instance_type: m5.large }
  storage:
    count: 3
    instance_type: i3.xlarge
    volume: { size_gb: 500, volume_type: gp3 }
  broker: { count: 2, instance_type: m5.2xlarge }
  worker: { count: 1, instance_type: c5.2xlarge }
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_render_vars_carries_tags() {
        let id = ExperimentId::parse("exp-20250101-120000").unwrap();
        let mut cli = BTreeMap::new();
        cli.insert("Team".to_string(), "perf".to_string());

        let vars = InfraVars::render(&config(), &id, &cli);
        assert_eq!(vars.experiment_id, "exp-20250101-120000");
        assert_eq!(vars.broker_count, 2);
        assert_eq!(vars.default_tags.get("ExperimentID").unwrap(), vars.experiment_id.as_str());
        assert_eq!(vars.default_tags.get("Project").unwrap(), "broker-bench");
        assert_eq!(vars.default_tags.get("ManagedBy").unwrap(), "broker-bench");
        // CLI tag overrides the config tag
        assert_eq!(vars.default_tags.get("Team").unwrap(), "perf");
    }

    #[test]
    fn test_parse_output_document() {
        let doc = serde_json::json!({
            "broker": { "value": { "ids": ["i-1", "i-2"], "private_ips": ["10.0.1.1", "10.0.1.2"] } },
            "worker": { "value": { "ids": ["i-3"], "private_ips": ["10.0.1.3"] } },
            "unrelated_output": { "value": { "ids": [], "private_ips": [] } }
        });
        let outputs = parse_output_document(serde_json::to_vec(&doc).unwrap().as_slice()).unwrap();
        assert_eq!(outputs.roles.len(), 2);

        let fleet = outputs.fleet().unwrap();
        assert_eq!(fleet.by_role(Role::Broker).len(), 2);
        assert_eq!(fleet.by_role(Role::Worker)[0].private_ip, "10.0.1.3");
    }

    #[test]
    fn test_mismatched_outputs_rejected() {
        let outputs = ProvisionOutputs {
            roles: [(
                Role::Broker,
                RoleOutputs {
                    ids: vec!["i-1".to_string()],
                    private_ips: vec![],
                },
            )]
            .into_iter()
            .collect(),
        };
        assert!(outputs.fleet().is_err());
    }

    #[test]
    fn test_empty_output_document_rejected() {
        let doc = serde_json::json!({ "unrelated": { "value": { "ids": [], "private_ips": [] } } });
        assert!(parse_output_document(serde_json::to_vec(&doc).unwrap().as_slice()).is_err());
    }
}
