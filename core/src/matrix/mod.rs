//! Test-matrix execution
//!
//! Variants run strictly in declared order: each one is materialised into a
//! workload artefact, shipped to a worker host (round-robin), executed with
//! the sampler running in the background, and its results pulled back into
//! the store. A variant's failure does not abort the matrix; the optional
//! plateau policy does.

mod results;

pub use results::{
    parse_summary, write_report, BenchmarkSummary, LatencySummary, ReportDoc, ReportEntry,
    VariantRecord, VariantStatus,
};

use crate::config::{TestPlan, TestVariant};
use crate::error::{LabError, LabResult};
use crate::exec::RemoteExecutor;
use crate::fleet::{Fleet, Role};
use crate::retry::cancelled;
use crate::sampler::{self, MetricsSampler, SamplerConfig};
use crate::store::ExperimentDir;
use crate::workload::merge_workload;
use std::time::Duration;
use tokio::sync::watch;


/// Remote filesystem layout on worker hosts
const REMOTE_ROOT: &str = "/opt/benchmark";
const DRIVER_CONFIG: &str = "/opt/benchmark/driver.yaml";

/// Matrix-level tunables
#[derive(Debug, Clone, Copy)]
pub struct MatrixConfig {
    /// Slack added twice on top of test + warmup for the command deadline
    pub slack: Duration,
    /// Deadline for uploads, downloads, and housekeeping commands
    pub transfer_deadline: Duration,
    /// Sampler cadence during runs
    pub sampler: SamplerConfig,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        MatrixConfig {
            slack: Duration::from_secs(5 * 60),
            transfer_deadline: Duration::from_secs(2 * 60),
            sampler: SamplerConfig::default(),
        }
    }
}

/// Runs a test plan against a converged fleet
pub struct MatrixRunner {
    executor: RemoteExecutor,
    config: MatrixConfig,
}

impl MatrixRunner {
    /// Create a runner with default tunables
    pub fn new(executor: RemoteExecutor) -> Self {
        MatrixRunner {
            executor,
            config: MatrixConfig::default(),
        }
    }

    /// Override the tunables
    pub fn with_config(mut self, config: MatrixConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute the plan; returns one record per variant, in order
    ///
    /// The cancel channel latches: a signal during a variant cancels it
    /// (its directory gets a `Cancelled` record), later variants never
    /// run, and the call returns [`LabError::Cancelled`] so the sequencer
    /// drives teardown.
    pub async fn run(
        &self,
        plan: &TestPlan,
        fleet: &Fleet,
        experiment: &ExperimentDir,
        mut cancel: watch::Receiver<bool>,
    ) -> LabResult<Vec<VariantRecord>> {
        let workers = fleet.by_role(Role::Worker);
        if workers.is_empty() {
            return Err(LabError::config("fleet has no worker hosts"));
        }

        tracing::info!(
            plan = %plan.name,
            variants = plan.test_runs.len(),
            workers = workers.len(),
            "Matrix starting"
        );

        let mut records = Vec::with_capacity(plan.test_runs.len());
        let mut consecutive_misses = 0usize;
        let mut plateaued = false;

        for (index, variant) in plan.test_runs.iter().enumerate() {
            if *cancel.borrow() {
                // Unstarted variants leave no record; cleanup still runs
                return Err(LabError::Cancelled);
            }
            if plateaued {
                let record = VariantRecord {
                    variant: variant.name.clone(),
                    status: VariantStatus::Skipped,
                    error: Some("matrix aborted by plateau policy".to_string()),
                };
                self.write_record(experiment, &record)?;
                tracing::info!(variant = %variant.name, "Variant skipped (plateau)");
                records.push(record);
                continue;
            }

            let worker = &workers[index % workers.len()];
            tracing::info!(
                variant = %variant.name,
                index = index + 1,
                total = plan.test_runs.len(),
                worker = %worker.id,
                "Variant starting"
            );

            let record = self
                .run_variant(plan, variant, fleet, worker.id.as_str(), experiment, &mut cancel)
                .await?;

            if record.status == VariantStatus::Success {
                if let Some(policy) = &plan.plateau {
                    if let Some(target) = variant.target_rate {
                        let summary = self.read_summary(experiment, &variant.name)?;
                        let floor = target as f64 * (1.0 - policy.allowed_deviation / 100.0);
                        if summary.publish_rate < floor {
                            consecutive_misses += 1;
                            tracing::warn!(
                                variant = %variant.name,
                                achieved = summary.publish_rate,
                                target,
                                misses = consecutive_misses,
                                "Throughput below plateau floor"
                            );
                        } else {
                            consecutive_misses = 0;
                        }
                        if consecutive_misses >= policy.consecutive_fails_allowed {
                            plateaued = true;
                            tracing::warn!(
                                after = %variant.name,
                                "Plateau detected, skipping remaining variants"
                            );
                        }
                    }
                }
            }

            records.push(record);
        }

        tracing::info!(
            plan = %plan.name,
            completed = records
                .iter()
                .filter(|r| r.status == VariantStatus::Success)
                .count(),
            total = records.len(),
            "Matrix finished"
        );
        Ok(records)
    }

    /// Run one variant to a terminal record
    ///
    /// Only cancellation propagates as an error; failures terminate the
    /// variant, not the matrix.
    async fn run_variant(
        &self,
        plan: &TestPlan,
        variant: &TestVariant,
        fleet: &Fleet,
        worker: &str,
        experiment: &ExperimentDir,
        cancel: &mut watch::Receiver<bool>,
    ) -> LabResult<VariantRecord> {
        // Materialise and stage the workload before the sampler starts
        let staged = tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                return self.cancel_variant(experiment, variant, None).await;
            }
            staged = self.stage_workload(plan, variant, worker, experiment) => staged,
        };
        let deadline = match staged {
            Ok(deadline) => deadline,
            Err(e) => {
                let record = VariantRecord {
                    variant: variant.name.clone(),
                    status: VariantStatus::Failed,
                    error: Some(e.to_string()),
                };
                self.write_record(experiment, &record)?;
                tracing::error!(variant = %variant.name, error = %e, "Variant staging failed");
                return Ok(record);
            }
        };

        let mut sampler =
            MetricsSampler::new(self.executor.clone()).with_config(self.config.sampler);
        sampler.start(fleet);

        let run_result = tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                return self.cancel_variant(experiment, variant, Some(sampler)).await;
            }
            result = self.execute_and_collect(variant, worker, experiment, deadline) => result,
        };

        let series = sampler.stop().await;
        let metrics_dir = experiment.variant_metrics_dir(&variant.name)?;
        sampler::write_artifacts(&metrics_dir, &series)?;

        match run_result {
            Ok(summary) => {
                tracing::info!(
                    variant = %variant.name,
                    publish_rate = summary.publish_rate,
                    "Variant succeeded"
                );
                Ok(VariantRecord {
                    variant: variant.name.clone(),
                    status: VariantStatus::Success,
                    error: None,
                })
            }
            Err(e) => {
                let record = VariantRecord {
                    variant: variant.name.clone(),
                    status: VariantStatus::Failed,
                    error: Some(e.to_string()),
                };
                self.write_record(experiment, &record)?;
                tracing::error!(variant = %variant.name, error = %e, "Variant failed");
                Ok(record)
            }
        }
    }

    /// Merge, persist the manifest, and upload the artefact to the worker
    ///
    /// Returns the benchmark command deadline derived from the merged
    /// durations: test + warmup + 2 × slack.
    async fn stage_workload(
        &self,
        plan: &TestPlan,
        variant: &TestVariant,
        worker: &str,
        experiment: &ExperimentDir,
    ) -> LabResult<Duration> {
        let artifact = merge_workload(&plan.base_workload, variant)?;
        let yaml = artifact.to_yaml()?;

        let manifest = experiment
            .manifests_dir()
            .join(format!("{}.yaml", variant.name));
        std::fs::write(&manifest, &yaml)?;

        self.executor
            .run(
                worker,
                &format!("mkdir -p {REMOTE_ROOT}/workloads {REMOTE_ROOT}/results"),
                self.config.transfer_deadline,
            )
            .await?;
        self.executor
            .upload(
                worker,
                &remote_workload_path(&variant.name),
                &yaml,
                self.config.transfer_deadline,
            )
            .await?;

        Ok(artifact.run_duration() + 2 * self.config.slack)
    }

    /// Invoke the benchmark, pull the output back, and persist raw + summary
    async fn execute_and_collect(
        &self,
        variant: &TestVariant,
        worker: &str,
        experiment: &ExperimentDir,
        deadline: Duration,
    ) -> LabResult<BenchmarkSummary> {
        let payload = format!(
            "cd {REMOTE_ROOT} && bin/benchmark --drivers {DRIVER_CONFIG} {} --output {}",
            remote_workload_path(&variant.name),
            remote_output_path(&variant.name),
        );
        self.executor.run(worker, &payload, deadline).await?;

        let raw = self
            .executor
            .download(
                worker,
                &remote_output_path(&variant.name),
                self.config.transfer_deadline,
            )
            .await?;
        let summary = parse_summary(&variant.name, variant.target_rate, &raw)?;

        // Raw and parsed are written together so the directory is never a
        // partial mixture
        let dir = experiment.variant_dir(&variant.name)?;
        std::fs::write(dir.join("raw.json"), &raw)?;
        experiment.write_json(&dir.join("summary.json"), &summary)?;
        Ok(summary)
    }

    async fn cancel_variant(
        &self,
        experiment: &ExperimentDir,
        variant: &TestVariant,
        sampler: Option<MetricsSampler>,
    ) -> LabResult<VariantRecord> {
        tracing::warn!(variant = %variant.name, "Variant cancelled");
        if let Some(mut sampler) = sampler {
            let series = sampler.stop().await;
            let metrics_dir = experiment.variant_metrics_dir(&variant.name)?;
            sampler::write_artifacts(&metrics_dir, &series)?;
        }
        let record = VariantRecord {
            variant: variant.name.clone(),
            status: VariantStatus::Cancelled,
            error: Some("cancelled by user interrupt".to_string()),
        };
        self.write_record(experiment, &record)?;
        Err(LabError::Cancelled)
    }

    fn write_record(&self, experiment: &ExperimentDir, record: &VariantRecord) -> LabResult<()> {
        let dir = experiment.variant_dir(&record.variant)?;
        experiment.write_json(&dir.join("error.json"), record)
    }

    fn read_summary(&self, experiment: &ExperimentDir, variant: &str) -> LabResult<BenchmarkSummary> {
        let path = experiment.variant_dir(variant)?.join("summary.json");
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

fn remote_workload_path(variant: &str) -> String {
    format!("{REMOTE_ROOT}/workloads/{variant}.yaml")
}

fn remote_output_path(variant: &str) -> String {
    format!("{REMOTE_ROOT}/results/{variant}.json")
}
