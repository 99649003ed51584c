//! Phase sequencing for the experiment lifecycle
//!
//! The sequencer owns the phase state machine
//! `Init → Provision → Converge → RunMatrix → Report → Teardown` and is the
//! only component that transitions it. Every exit path that may have
//! created cloud resources drives the reclaimer to completion before the
//! causal error is re-raised; the reclaimer itself is never cancelled.

use crate::config::{InfrastructureConfig, TestPlan};
use crate::error::{LabError, LabResult};
use crate::exec::RemoteExecutor;
use crate::experiment::ExperimentId;
use crate::fleet::Fleet;
use crate::matrix::{self, MatrixConfig, MatrixRunner, ReportDoc};
use crate::probe::{ProbeConfig, ReadinessProber};
use crate::provisioner::{InfraVars, Provision};
use crate::reclaim::{ReclaimConfig, ReclaimPlan, Reclaimer};
use crate::retry::cancelled;
use crate::store::{ExperimentDir, Store};
use crate::traits::{CloudCompute, ControlPlane};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[cfg(test)]
mod tests;

/// Experiment phase
///
/// Monotonic except `Failed` (sink) and `Teardown`, which is reachable
/// from any non-terminal phase as a rollback target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Identity assigned, store directory created, `latest` updated
    Init,
    /// External provisioner creating infrastructure
    Provision,
    /// Readiness cascade running
    Converge,
    /// Test matrix executing
    RunMatrix,
    /// Report being rebuilt from stored artefacts
    Report,
    /// Resources being reclaimed
    Teardown,
    /// Terminal failure
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Init => "Init",
            Phase::Provision => "Provision",
            Phase::Converge => "Converge",
            Phase::RunMatrix => "RunMatrix",
            Phase::Report => "Report",
            Phase::Teardown => "Teardown",
            Phase::Failed => "Failed",
        };
        write!(f, "{name}")
    }
}

/// Per-component tunables bundled for the sequencer
#[derive(Debug, Clone, Copy, Default)]
pub struct SequencerConfig {
    /// Readiness cascade deadlines and backoff
    pub probe: ProbeConfig,
    /// Matrix runner tunables
    pub matrix: MatrixConfig,
    /// Reclaimer tunables
    pub reclaim: ReclaimConfig,
}

/// Drives an experiment through its phases
pub struct Sequencer {
    cloud: Arc<dyn CloudCompute>,
    control: Arc<dyn ControlPlane>,
    provisioner: Arc<dyn Provision>,
    store: Store,
    config: SequencerConfig,
    cli_tags: BTreeMap<String, String>,
    explicit_id: Option<ExperimentId>,
    phases: Mutex<Vec<Phase>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl Sequencer {
    /// Create a sequencer over the given backends and store
    pub fn new(
        cloud: Arc<dyn CloudCompute>,
        control: Arc<dyn ControlPlane>,
        provisioner: Arc<dyn Provision>,
        store: Store,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Sequencer {
            cloud,
            control,
            provisioner,
            store,
            config: SequencerConfig::default(),
            cli_tags: BTreeMap::new(),
            explicit_id: None,
            phases: Mutex::new(Vec::new()),
            cancel_tx,
            cancel_rx,
        }
    }

    /// Override component tunables
    pub fn with_config(mut self, config: SequencerConfig) -> Self {
        self.config = config;
        self
    }

    /// Extra tags from the CLI; override config-file tags
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.cli_tags = tags;
        self
    }

    /// Use an explicit experiment identity instead of generating one
    pub fn with_experiment_id(mut self, id: ExperimentId) -> Self {
        self.explicit_id = Some(id);
        self
    }

    /// Handle for signal wiring: sending `true` cancels the experiment
    pub fn cancel_handle(&self) -> watch::Sender<bool> {
        self.cancel_tx.clone()
    }

    /// The phase transitions emitted so far, in order
    pub fn phase_log(&self) -> Vec<Phase> {
        self.phases.lock().unwrap().clone()
    }

    /// The experiment store
    pub fn store(&self) -> &Store {
        &self.store
    }

    // ========================================================================
    // Public operations (the CLI surface)
    // ========================================================================

    /// Full lifecycle: Init → Provision → Converge → RunMatrix → Report →
    /// Teardown
    ///
    /// Guarantees that before this returns, on every path that may have
    /// created cloud resources, the reclaimer has run to completion. On
    /// failure the causal error is logged, teardown still runs, and the
    /// causal error is re-raised.
    pub async fn run_full(
        &self,
        cfg: &InfrastructureConfig,
        plan: &TestPlan,
    ) -> LabResult<ExperimentId> {
        cfg.validate()?;
        plan.validate()?;

        let (id, experiment, vars) = self.init(cfg)?;

        let result = async {
            let fleet = self.provision_and_converge(&experiment, &vars).await?;
            self.run_and_report(plan, &fleet, &experiment).await
        }
        .await;

        if let Err(e) = &result {
            experiment.append_log(&format!("lifecycle failed: {e}"));
            tracing::error!(experiment = %id, error = %e, "Lifecycle failed, tearing down");
        }

        // Teardown runs on every path and is never cancelled
        self.transition(Phase::Teardown, Some(&experiment));
        let reclaim = self.graceful_reclaim(&id, Some((&experiment, &vars))).await;

        match (result, reclaim) {
            (Ok(()), Ok(())) => {
                experiment.append_log("lifecycle complete, all resources reclaimed");
                tracing::info!(experiment = %id, "Lifecycle complete");
                Ok(id)
            }
            (Ok(()), Err(e)) => {
                self.transition(Phase::Failed, Some(&experiment));
                Err(e)
            }
            (Err(e), reclaim) => {
                if let Err(re) = reclaim {
                    experiment.append_log(&format!("reclaim after failure also failed: {re}"));
                }
                self.transition(Phase::Failed, Some(&experiment));
                Err(e)
            }
        }
    }

    /// Init + Provision + Converge; leaves the cluster running
    ///
    /// On failure the partially created infrastructure is reclaimed before
    /// the error propagates.
    pub async fn setup(&self, cfg: &InfrastructureConfig) -> LabResult<ExperimentId> {
        cfg.validate()?;
        let (id, experiment, vars) = self.init(cfg)?;

        match self.provision_and_converge(&experiment, &vars).await {
            Ok(_fleet) => {
                experiment.append_log("setup complete, cluster left running");
                tracing::info!(experiment = %id, "Setup complete, cluster running");
                Ok(id)
            }
            Err(e) => {
                experiment.append_log(&format!("setup failed: {e}"));
                tracing::error!(experiment = %id, error = %e, "Setup failed, reclaiming");
                self.transition(Phase::Teardown, Some(&experiment));
                if let Err(re) = self.graceful_reclaim(&id, Some((&experiment, &vars))).await {
                    experiment.append_log(&format!("reclaim after failure also failed: {re}"));
                }
                self.transition(Phase::Failed, Some(&experiment));
                Err(e)
            }
        }
    }

    /// RunMatrix + Report against a cluster created by `setup`
    pub async fn run_matrix(&self, plan: &TestPlan, id_or_latest: &str) -> LabResult<Vec<matrix::VariantRecord>> {
        plan.validate()?;
        let id = self.store.resolve(id_or_latest)?;
        let experiment = self.store.open_experiment(&id)?;
        let fleet: Fleet = serde_json::from_str(
            &std::fs::read_to_string(experiment.fleet_path())
                .map_err(|_| LabError::config(format!("experiment {id} has no fleet document; was setup run?")))?,
        )?;

        let mut records = None;
        let result = self
            .run_and_report_inner(plan, &fleet, &experiment, &mut records)
            .await;
        match result {
            Ok(()) => Ok(records.unwrap_or_default()),
            Err(e) => {
                experiment.append_log(&format!("matrix failed: {e}"));
                Err(e)
            }
        }
    }

    /// Rebuild the report from stored artefacts
    pub async fn report(&self, id_or_latest: &str) -> LabResult<ReportDoc> {
        let id = self.store.resolve(id_or_latest)?;
        let experiment = self.store.open_experiment(&id)?;
        self.transition(Phase::Report, Some(&experiment));
        matrix::write_report(&experiment)
    }

    /// Reclaim an experiment's resources, graceful-first
    ///
    /// Works from the tag query alone, so it cleans up after crashes that
    /// left no usable provisioner state.
    pub async fn teardown(&self, id_or_latest: &str) -> LabResult<()> {
        // Crash-path: accept identities whose store directory is gone
        let id = self
            .store
            .resolve(id_or_latest)
            .or_else(|_| ExperimentId::parse(id_or_latest))?;
        let context = match self.store.open_experiment(&id) {
            Ok(experiment) => {
                let vars = std::fs::read_to_string(experiment.infra_vars_path())
                    .ok()
                    .and_then(|text| serde_json::from_str::<InfraVars>(&text).ok());
                Some((experiment, vars))
            }
            Err(_) => None,
        };

        self.transition(Phase::Teardown, context.as_ref().map(|(e, _)| e));
        match &context {
            Some((experiment, Some(vars))) => {
                self.graceful_reclaim(&id, Some((experiment, vars))).await
            }
            _ => self.tag_reclaim(&id).await,
        }
    }

    /// Produce the reclaim plan without side effects
    pub async fn teardown_plan(&self, id_or_latest: &str) -> LabResult<ReclaimPlan> {
        let id = self
            .store
            .resolve(id_or_latest)
            .or_else(|_| ExperimentId::parse(id_or_latest))?;
        Reclaimer::new(Arc::clone(&self.cloud))
            .with_config(self.config.reclaim)
            .discover(&id)
            .await
    }

    // ========================================================================
    // Phase bodies
    // ========================================================================

    /// Init: assign identity, create the store tree, point `latest` at it
    fn init(
        &self,
        cfg: &InfrastructureConfig,
    ) -> LabResult<(ExperimentId, ExperimentDir, InfraVars)> {
        let id = self
            .explicit_id
            .clone()
            .unwrap_or_else(ExperimentId::generate);
        self.transition(Phase::Init, None);

        let experiment = self.store.create_experiment(&id)?;
        experiment.append_log(&format!("experiment {id} initialised"));

        let vars = InfraVars::render(cfg, &id, &self.cli_tags);
        experiment.write_json(&experiment.infra_vars_path(), &vars)?;
        tracing::info!(experiment = %id, dir = %experiment.path().display(), "Experiment initialised");
        Ok((id, experiment, vars))
    }

    /// Provision + Converge
    async fn provision_and_converge(
        &self,
        experiment: &ExperimentDir,
        vars: &InfraVars,
    ) -> LabResult<Fleet> {
        self.check_cancelled()?;
        self.transition(Phase::Provision, Some(experiment));

        let mut cancel = self.cancel_rx.clone();
        let outputs = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return Err(LabError::Cancelled),
            outputs = self.provisioner.apply(vars, experiment) => outputs?,
        };
        let fleet = outputs.fleet()?;
        experiment.write_json(&experiment.fleet_path(), &fleet)?;
        experiment.append_log(&format!("provisioned fleet of {} hosts", fleet.len()));

        self.check_cancelled()?;
        self.transition(Phase::Converge, Some(experiment));
        let executor = RemoteExecutor::new(Arc::clone(&self.control));
        let prober = ReadinessProber::new(Arc::clone(&self.cloud), executor)
            .with_config(self.config.probe);

        let id = experiment.id().clone();
        let mut cancel = self.cancel_rx.clone();
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return Err(LabError::Cancelled),
            ready = prober.wait_ready(&id, &fleet) => ready?,
        }
        experiment.append_log("fleet converged");
        Ok(fleet)
    }

    /// RunMatrix + Report
    async fn run_and_report(
        &self,
        plan: &TestPlan,
        fleet: &Fleet,
        experiment: &ExperimentDir,
    ) -> LabResult<()> {
        let mut records = None;
        self.run_and_report_inner(plan, fleet, experiment, &mut records)
            .await
    }

    async fn run_and_report_inner(
        &self,
        plan: &TestPlan,
        fleet: &Fleet,
        experiment: &ExperimentDir,
        records_out: &mut Option<Vec<matrix::VariantRecord>>,
    ) -> LabResult<()> {
        self.check_cancelled()?;
        self.transition(Phase::RunMatrix, Some(experiment));
        let executor = RemoteExecutor::new(Arc::clone(&self.control));
        let runner = MatrixRunner::new(executor).with_config(self.config.matrix);

        let records = runner
            .run(plan, fleet, experiment, self.cancel_rx.clone())
            .await?;
        experiment.append_log(&format!("matrix finished: {} variants", records.len()));
        *records_out = Some(records);

        // Report runs regardless of per-variant outcomes
        self.transition(Phase::Report, Some(experiment));
        matrix::write_report(experiment)?;
        Ok(())
    }

    /// Graceful-first reclaim: try the provisioner's destroy path, fall
    /// back to tag reclaim immediately on its failure; tag reclaim always
    /// runs afterwards as the final authority
    async fn graceful_reclaim(
        &self,
        id: &ExperimentId,
        context: Option<(&ExperimentDir, &InfraVars)>,
    ) -> LabResult<()> {
        if let Some((experiment, vars)) = context {
            match self.provisioner.destroy(vars, experiment).await {
                Ok(()) => experiment.append_log("provisioner destroy completed"),
                Err(e) => {
                    experiment.append_log(&format!(
                        "provisioner destroy failed, falling back to tag reclaim: {e}"
                    ));
                    tracing::warn!(error = %e, "Provisioner destroy failed, using tag reclaim");
                }
            }
        }
        self.tag_reclaim(id).await
    }

    async fn tag_reclaim(&self, id: &ExperimentId) -> LabResult<()> {
        let reclaimer = Reclaimer::new(Arc::clone(&self.cloud)).with_config(self.config.reclaim);
        let summary = reclaimer.execute(id).await?;
        if summary.is_clean() {
            Ok(())
        } else {
            Err(LabError::discovery(format!(
                "reclaim incomplete, {} resources left: {}",
                summary.failures.len(),
                summary.failures.join("; ")
            )))
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_cancelled(&self) -> LabResult<()> {
        if *self.cancel_rx.borrow() {
            Err(LabError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn transition(&self, phase: Phase, experiment: Option<&ExperimentDir>) {
        let mut phases = self.phases.lock().unwrap();
        let previous = phases.last().copied();
        phases.push(phase);
        drop(phases);

        tracing::info!(from = ?previous, to = %phase, "Phase transition");
        if let Some(experiment) = experiment {
            match previous {
                Some(previous) => {
                    experiment.append_log(&format!("phase transition: {previous} -> {phase}"))
                }
                None => experiment.append_log(&format!("phase transition: -> {phase}")),
            }
        }
    }
}
