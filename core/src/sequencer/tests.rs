//! End-to-end lifecycle tests over the in-memory fakes

use super::*;
use crate::config::{PlateauPolicy, TestVariant, VariantKind};
use crate::fleet::Role;
use crate::matrix::{VariantRecord, VariantStatus};
use crate::testkit::{FakeBehavior, FakeCloud, FakeControlPlane, FakeProvisioner};
use crate::workload::{MessageSize, VariantOverrides, WorkloadSpec};
use std::time::Duration;
use tempfile::TempDir;

fn infra_config() -> InfrastructureConfig {
    serde_yaml::from_str(
        r#"
experiment:
  name: perf-lab
cloud: { region: us-west-2 }
network: { vpc_cidr: 10.0.0.0/16, public_subnet_cidr: 10.0.1.0/24 }
compute:
  coordinator: { count: 1, instance_type: m5.large }
  storage:
    count: 1
    instance_type: i3.xlarge
    volume: { size_gb: 100, volume_type: gp3 }
  broker: { count: 1, instance_type: m5.2xlarge }
  worker: { count: 1, instance_type: c5.2xlarge }
"#,
    )
    .unwrap()
}

fn variant(name: &str, rate: u64) -> TestVariant {
    TestVariant {
        name: name.to_string(),
        kind: VariantKind::FixedRate,
        target_rate: Some(rate),
        workload_overrides: VariantOverrides::default(),
    }
}

fn test_plan(variants: Vec<TestVariant>, plateau: Option<PlateauPolicy>) -> TestPlan {
    TestPlan {
        name: "sweep".to_string(),
        base_workload: WorkloadSpec {
            name: "base".to_string(),
            topics: 1,
            partitions_per_topic: 4,
            message_size: MessageSize::Fixed(1024),
            subscriptions_per_topic: 1,
            consumers_per_subscription: 1,
            producers_per_topic: 1,
            consumer_backlog_size_gb: 0,
            test_duration_minutes: 1,
            warmup_duration_minutes: 1,
        },
        test_runs: variants,
        plateau,
    }
}

fn raw_output(rate: f64) -> String {
    format!(
        r#"{{"publishRate": [{rate}], "consumeRate": [{rate}],
            "aggregatedPublishLatencyAvg": 3.0,
            "aggregatedPublishLatency50pct": 2.5,
            "aggregatedPublishLatency95pct": 6.0,
            "aggregatedPublishLatency99pct": 9.0,
            "aggregatedPublishLatency999pct": 15.0,
            "aggregatedPublishLatencyMax": 20.0}}"#
    )
}

struct Fixture {
    cloud: Arc<FakeCloud>,
    control: Arc<FakeControlPlane>,
    provisioner: Arc<FakeProvisioner>,
    sequencer: Arc<Sequencer>,
    _tmp: TempDir,
}

fn fixture() -> Fixture {
    fixture_with(|p| p)
}

fn fixture_with(adjust: impl FnOnce(FakeProvisioner) -> FakeProvisioner) -> Fixture {
    let cloud = Arc::new(FakeCloud::new());
    let control = Arc::new(FakeControlPlane::new());
    let provisioner = Arc::new(adjust(FakeProvisioner::new(
        Arc::clone(&cloud),
        vec![
            (Role::Coordinator, 1),
            (Role::Storage, 1),
            (Role::Broker, 1),
            (Role::Worker, 1),
        ],
    )));

    let tmp = TempDir::new().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let sequencer = Arc::new(Sequencer::new(
        Arc::clone(&cloud) as Arc<dyn CloudCompute>,
        Arc::clone(&control) as Arc<dyn ControlPlane>,
        Arc::clone(&provisioner) as Arc<dyn Provision>,
        store,
    ));

    Fixture {
        cloud,
        control,
        provisioner,
        sequencer,
        _tmp: tmp,
    }
}

fn assert_legal_walk(phases: &[Phase]) {
    use Phase::*;
    assert_eq!(phases.first(), Some(&Init), "walk must start at Init");
    for pair in phases.windows(2) {
        let legal = matches!(
            (pair[0], pair[1]),
            (Init, Provision)
                | (Provision, Converge)
                | (Converge, RunMatrix)
                | (RunMatrix, Report)
                | (Report, Teardown)
                | (Init, Teardown)
                | (Provision, Teardown)
                | (Converge, Teardown)
                | (RunMatrix, Teardown)
                | (Teardown, Failed)
        );
        assert!(legal, "illegal transition {:?} -> {:?}", pair[0], pair[1]);
    }
}

// ============================================================================
// Scenario 1: happy path, one variant
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_full_lifecycle_happy_path() {
    let f = fixture();
    f.control
        .on("cat '/opt/benchmark/results/rate-1k.json'", FakeBehavior::success(raw_output(1000.0)));

    let plan = test_plan(vec![variant("rate-1k", 1000)], None);
    let id = f.sequencer.run_full(&infra_config(), &plan).await.unwrap();

    // All phases passed, in order
    assert_eq!(
        f.sequencer.phase_log(),
        vec![
            Phase::Init,
            Phase::Provision,
            Phase::Converge,
            Phase::RunMatrix,
            Phase::Report,
            Phase::Teardown,
        ]
    );
    assert_legal_walk(&f.sequencer.phase_log());

    // Result artefacts in place
    let experiment = f.sequencer.store().open_experiment(&id).unwrap();
    let variant_dir = experiment.path().join("benchmark_results/rate-1k");
    assert!(variant_dir.join("raw.json").is_file());
    assert!(variant_dir.join("summary.json").is_file());
    assert!(experiment.path().join("metrics/rate-1k/metrics.json").is_file());
    assert!(experiment.path().join("report/report.json").is_file());

    // latest points to the new experiment
    assert_eq!(f.sequencer.store().latest().unwrap().unwrap(), id);

    // Tag query returns nothing after exit
    assert_eq!(f.cloud.remaining_tagged(&id), 0);

    // Graceful path attempted the provisioner destroy before tag reclaim
    assert_eq!(
        f.provisioner
            .destroy_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

// ============================================================================
// Scenario 2: provisioner fails
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_provisioner_failure_cleans_up() {
    let f = fixture_with(FakeProvisioner::failing_apply);

    let plan = test_plan(vec![variant("rate-1k", 1000)], None);
    let err = f
        .sequencer
        .run_full(&infra_config(), &plan)
        .await
        .unwrap_err();

    assert!(matches!(err, LabError::ProvisionerFailed(_)));
    assert_eq!(err.exit_code(), 1);

    let phases = f.sequencer.phase_log();
    assert_eq!(
        phases,
        vec![Phase::Init, Phase::Provision, Phase::Teardown, Phase::Failed]
    );
    assert_legal_walk(&phases[..phases.len() - 1]);

    // Experiment directory exists and records the failure
    let id = f.sequencer.store().latest().unwrap().unwrap();
    let experiment = f.sequencer.store().open_experiment(&id).unwrap();
    let log = std::fs::read_to_string(experiment.path().join("orchestrator.log")).unwrap();
    assert!(log.contains("provisioner failed"), "log: {log}");

    assert_eq!(f.cloud.remaining_tagged(&id), 0);
}

// ============================================================================
// Scenario 3: readiness timeout on stage 3
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_reclaims_all_hosts() {
    let f = fixture();
    // The broker health endpoint is sick forever
    f.control
        .on("/admin/v2/brokers/health", FakeBehavior::failure("503"));

    let plan = test_plan(vec![variant("rate-1k", 1000)], None);
    let err = f
        .sequencer
        .run_full(&infra_config(), &plan)
        .await
        .unwrap_err();

    match err {
        LabError::ReadinessTimeout { stage, .. } => assert_eq!(stage, 3),
        other => panic!("unexpected error: {other}"),
    }

    let phases = f.sequencer.phase_log();
    assert_eq!(
        phases,
        vec![
            Phase::Init,
            Phase::Provision,
            Phase::Converge,
            Phase::Teardown,
            Phase::Failed
        ]
    );

    // Healthy hosts are destroyed along with the sick one
    let id = f.sequencer.store().latest().unwrap().unwrap();
    assert_eq!(f.cloud.remaining_tagged(&id), 0);
}

// ============================================================================
// Scenario 4: mid-matrix cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_mid_matrix_cancellation() {
    let f = fixture();
    f.control
        .on("cat '/opt/benchmark/results/v1.json'", FakeBehavior::success(raw_output(100.0)));
    f.control.on(
        "--output /opt/benchmark/results/v2.json",
        FakeBehavior::never_terminal(),
    );

    let cancel = f.sequencer.cancel_handle();
    let sequencer = Arc::clone(&f.sequencer);
    let plan = test_plan(
        vec![variant("v1", 100), variant("v2", 100), variant("v3", 100)],
        None,
    );
    let lifecycle =
        tokio::spawn(async move { sequencer.run_full(&infra_config(), &plan).await });

    // Interrupt while v2 is in flight
    tokio::time::sleep(Duration::from_secs(45)).await;
    cancel.send(true).unwrap();

    let err = lifecycle.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.exit_code(), 130);

    let id = f.sequencer.store().latest().unwrap().unwrap();
    let experiment = f.sequencer.store().open_experiment(&id).unwrap();

    // v2 carries a cancelled terminal record; v3 never ran
    let record: VariantRecord = serde_json::from_str(
        &std::fs::read_to_string(
            experiment.path().join("benchmark_results/v2/error.json"),
        )
        .unwrap(),
    )
    .unwrap();
    assert_eq!(record.status, VariantStatus::Cancelled);
    assert!(!experiment.path().join("benchmark_results/v3").exists());

    // v2's sampler was stopped and flushed
    assert!(experiment.path().join("metrics/v2/metrics.json").is_file());

    // Reclaim completed despite the cancellation
    assert_eq!(f.cloud.remaining_tagged(&id), 0);
    assert_eq!(f.sequencer.phase_log().last(), Some(&Phase::Failed));
}

// ============================================================================
// Scenario 5: plateau abort
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_plateau_abort_still_reports_and_tears_down() {
    let f = fixture();
    for (name, rate) in [("v1", 1000.0), ("v2", 800.0), ("v3", 800.0)] {
        f.control.on(
            format!("cat '/opt/benchmark/results/{name}.json'"),
            FakeBehavior::success(raw_output(rate)),
        );
    }

    let plan = test_plan(
        (1..=5).map(|i| variant(&format!("v{i}"), 1000)).collect(),
        Some(PlateauPolicy {
            allowed_deviation: 10.0,
            consecutive_fails_allowed: 2,
        }),
    );
    let id = f.sequencer.run_full(&infra_config(), &plan).await.unwrap();

    // Report and Teardown still ran
    assert_eq!(
        f.sequencer.phase_log(),
        vec![
            Phase::Init,
            Phase::Provision,
            Phase::Converge,
            Phase::RunMatrix,
            Phase::Report,
            Phase::Teardown,
        ]
    );

    let experiment = f.sequencer.store().open_experiment(&id).unwrap();
    let report: crate::matrix::ReportDoc = serde_json::from_str(
        &std::fs::read_to_string(experiment.path().join("report/report.json")).unwrap(),
    )
    .unwrap();
    let statuses: Vec<VariantStatus> = report.variants.iter().map(|v| v.status).collect();
    assert_eq!(
        statuses,
        vec![
            VariantStatus::Success,
            VariantStatus::Success,
            VariantStatus::Success,
            VariantStatus::Skipped,
            VariantStatus::Skipped,
        ]
    );
    assert_eq!(f.cloud.remaining_tagged(&id), 0);
}

// ============================================================================
// Scenario 6: crash-path cleanup by tag alone
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_crash_path_teardown_by_tag_alone() {
    let f = fixture();

    // Simulate a crashed orchestrator: resources exist, no store directory,
    // no provisioner state
    let id = ExperimentId::parse("exp-20250101-090000").unwrap();
    f.cloud.seed_experiment(
        &id,
        &[(Role::Broker, 2), (Role::Storage, 1), (Role::Worker, 1)],
    );
    assert!(f.cloud.remaining_tagged(&id) > 0);

    f.sequencer.teardown("exp-20250101-090000").await.unwrap();
    assert_eq!(f.cloud.remaining_tagged(&id), 0);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_is_idempotent() {
    let f = fixture();
    let id = ExperimentId::parse("exp-20250101-090000").unwrap();
    f.cloud.seed_experiment(&id, &[(Role::Broker, 1)]);

    f.sequencer.teardown(id.as_str()).await.unwrap();
    f.sequencer.teardown(id.as_str()).await.unwrap();
    assert_eq!(f.cloud.remaining_tagged(&id), 0);
}

// ============================================================================
// Split lifecycle: setup / run / report / teardown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_setup_leaves_cluster_running() {
    let f = fixture();

    let id = f.sequencer.setup(&infra_config()).await.unwrap();

    // Cluster is up, nothing reclaimed
    assert!(f.cloud.remaining_tagged(&id) > 0);
    assert_eq!(
        f.sequencer.phase_log(),
        vec![Phase::Init, Phase::Provision, Phase::Converge]
    );

    // Fleet document persisted for later `run`
    let experiment = f.sequencer.store().open_experiment(&id).unwrap();
    let fleet: Fleet =
        serde_json::from_str(&std::fs::read_to_string(experiment.fleet_path()).unwrap()).unwrap();
    assert_eq!(fleet.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_setup_failure_reclaims() {
    let f = fixture();
    f.control
        .on("/admin/v2/brokers/health", FakeBehavior::failure("503"));

    let err = f.sequencer.setup(&infra_config()).await.unwrap_err();
    assert!(matches!(err, LabError::ReadinessTimeout { stage: 3, .. }));

    let id = f.sequencer.store().latest().unwrap().unwrap();
    assert_eq!(f.cloud.remaining_tagged(&id), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_against_existing_cluster() {
    let f = fixture();
    f.control
        .on("cat '/opt/benchmark/results/v1.json'", FakeBehavior::success(raw_output(500.0)));

    let id = f.sequencer.setup(&infra_config()).await.unwrap();
    let plan = test_plan(vec![variant("v1", 500)], None);
    let records = f.sequencer.run_matrix(&plan, "latest").await.unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, VariantStatus::Success);

    // `run` leaves the cluster alone; teardown is a separate operation
    assert!(f.cloud.remaining_tagged(&id) > 0);
    f.sequencer.teardown("latest").await.unwrap();
    assert_eq!(f.cloud.remaining_tagged(&id), 0);
}

#[tokio::test(start_paused = true)]
async fn test_report_rebuild_from_store() {
    let f = fixture();
    f.control
        .on("cat '/opt/benchmark/results/v1.json'", FakeBehavior::success(raw_output(500.0)));

    let plan = test_plan(vec![variant("v1", 500)], None);
    let id = f.sequencer.run_full(&infra_config(), &plan).await.unwrap();

    // Rebuild after the cluster is long gone
    let report = f.sequencer.report(id.as_str()).await.unwrap();
    assert_eq!(report.experiment_id, id.to_string());
    assert_eq!(report.variants.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_dry_run_plan() {
    let f = fixture();
    let id = ExperimentId::parse("exp-20250101-090000").unwrap();
    f.cloud.seed_experiment(&id, &[(Role::Broker, 2), (Role::Worker, 1)]);

    let plan = f.sequencer.teardown_plan(id.as_str()).await.unwrap();
    assert_eq!(plan.instances.len(), 3);
    assert_eq!(plan.vpcs.len(), 1);

    // No side effects
    assert!(f.cloud.remaining_tagged(&id) > 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_never_provisions() {
    let f = fixture();
    let mut cfg = infra_config();
    cfg.compute.worker.count = 0;

    let err = f
        .sequencer
        .run_full(&cfg, &test_plan(vec![variant("v1", 100)], None))
        .await
        .unwrap_err();

    assert!(matches!(err, LabError::ConfigInvalid(_)));
    assert_eq!(err.exit_code(), 2);
    assert!(f.sequencer.phase_log().is_empty());
}
