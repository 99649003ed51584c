//! Tests for the readiness cascade

use super::*;
use crate::fleet::Role;
use crate::testkit::{FakeBehavior, FakeCloud, FakeControlPlane};
use std::time::Duration;

fn probe_config() -> ProbeConfig {
    ProbeConfig {
        fleet_deadline: Duration::from_secs(120),
        agent_deadline: Duration::from_secs(120),
        service_deadline: Duration::from_secs(120),
        backoff: Backoff::new(Duration::from_secs(5), 1.5, Duration::from_secs(30)),
        command_deadline: Duration::from_secs(30),
    }
}

fn setup(
    counts: &[(Role, usize)],
) -> (
    Arc<FakeCloud>,
    Arc<FakeControlPlane>,
    ReadinessProber,
    ExperimentId,
    Fleet,
) {
    let id = ExperimentId::parse("exp-20250101-120000").unwrap();
    let cloud = Arc::new(FakeCloud::new());
    let outputs = cloud.seed_experiment(&id, counts);
    let fleet = outputs.fleet().unwrap();

    let control = Arc::new(FakeControlPlane::new());
    let executor = RemoteExecutor::new(Arc::clone(&control) as Arc<dyn crate::traits::ControlPlane>);
    let prober = ReadinessProber::new(
        Arc::clone(&cloud) as Arc<dyn CloudCompute>,
        executor,
    )
    .with_config(probe_config());

    (cloud, control, prober, id, fleet)
}

#[tokio::test(start_paused = true)]
async fn test_happy_cascade() {
    let (_cloud, _control, prober, id, fleet) = setup(&[
        (Role::Coordinator, 1),
        (Role::Storage, 1),
        (Role::Broker, 1),
        (Role::Worker, 1),
    ]);

    prober.wait_ready(&id, &fleet).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stage1_waits_for_pending_instances() {
    let (cloud, _control, prober, id, fleet) = setup(&[(Role::Broker, 2), (Role::Worker, 1)]);

    // One broker comes up only after a few describe calls
    {
        let mut state = cloud.state.lock().unwrap();
        let inst = state.instances.iter_mut().find(|i| i.id.contains("broker")).unwrap();
        inst.state = crate::traits::InstanceState::Pending;
        inst.running_after = 3;
    }

    prober.wait_ready(&id, &fleet).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stage1_timeout_names_pending_host() {
    let (cloud, _control, prober, id, fleet) = setup(&[(Role::Broker, 1), (Role::Worker, 1)]);

    {
        let mut state = cloud.state.lock().unwrap();
        let inst = state.instances.iter_mut().find(|i| i.id.contains("worker")).unwrap();
        inst.state = crate::traits::InstanceState::Pending;
        inst.running_after = usize::MAX;
    }

    let err = prober.wait_ready(&id, &fleet).await.unwrap_err();
    match err {
        LabError::ReadinessTimeout { stage, detail } => {
            assert_eq!(stage, 1);
            assert!(detail.contains("worker"), "detail: {detail}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_stage2_timeout_on_offline_agent() {
    let (_cloud, control, prober, id, fleet) = setup(&[(Role::Broker, 1), (Role::Worker, 1)]);

    let worker_id = fleet.by_role(Role::Worker)[0].id.clone();
    control.set_agent_offline(&worker_id, true);

    let err = prober.wait_ready(&id, &fleet).await.unwrap_err();
    match err {
        LabError::ReadinessTimeout { stage, detail } => {
            assert_eq!(stage, 2);
            assert!(detail.contains(&worker_id));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_stage3_runs_role_probes() {
    let (_cloud, control, prober, id, fleet) = setup(&[
        (Role::Coordinator, 1),
        (Role::Storage, 1),
        (Role::Broker, 1),
        (Role::Worker, 1),
    ]);

    prober.wait_ready(&id, &fleet).await.unwrap();

    let payloads: Vec<String> = control.submitted().into_iter().map(|(_, p)| p).collect();
    assert!(payloads.iter().any(|p| p.contains("systemctl is-active --quiet zk.service")));
    assert!(payloads.iter().any(|p| p.contains("nc -z -w 5 127.0.0.1 2181")));
    assert!(payloads.iter().any(|p| p.contains("'ruok'")));
    assert!(payloads.iter().any(|p| p.contains("nc -z -w 5 127.0.0.1 3181")));
    assert!(payloads
        .iter()
        .any(|p| p.contains("/admin/v2/brokers/health")));
    assert!(payloads
        .iter()
        .any(|p| p.contains("test -x '/opt/benchmark/bin/benchmark'")));
}

#[tokio::test(start_paused = true)]
async fn test_stage3_retries_until_healthy() {
    let (_cloud, control, prober, id, fleet) = setup(&[(Role::Broker, 1), (Role::Worker, 1)]);

    // Health endpoint fails twice before passing; scripted by queueing a
    // failing rule first, then flipping it after a few attempts is not
    // possible with static rules, so emulate with poll counts: a command
    // that stays in flight, then reports failure, is covered by the
    // idempotence test below. Here: probe passes only on the third submit.
    control.on("/admin/v2/brokers/health", FakeBehavior::failure("503"));

    let handle = tokio::spawn(async move { prober.wait_ready(&id, &fleet).await });

    // Let two failing rounds elapse, then heal the endpoint
    tokio::time::sleep(Duration::from_secs(12)).await;
    control.on("/admin/v2/brokers/health", FakeBehavior::success("200"));

    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stage3_timeout_on_sick_broker() {
    let (_cloud, control, prober, id, fleet) = setup(&[
        (Role::Broker, 2),
        (Role::Worker, 1),
    ]);

    control.on("/admin/v2/brokers/health", FakeBehavior::failure("503"));

    let err = prober.wait_ready(&id, &fleet).await.unwrap_err();
    match err {
        LabError::ReadinessTimeout { stage, detail } => {
            assert_eq!(stage, 3);
            assert!(detail.contains("broker.service"), "detail: {detail}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_stage3_timeout_names_stuck_coordinator_probe() {
    let (_cloud, control, prober, id, fleet) = setup(&[
        (Role::Coordinator, 1),
        (Role::Worker, 1),
    ]);

    // The port accepts connections but the challenge never answers imok;
    // the timeout detail must name the challenge probe, not lose it to
    // the passing port probe on the same unit
    control.on("'ruok'", FakeBehavior::failure("no response"));

    let err = prober.wait_ready(&id, &fleet).await.unwrap_err();
    match err {
        LabError::ReadinessTimeout { stage, detail } => {
            assert_eq!(stage, 3);
            assert!(detail.contains("zk.service"), "detail: {detail}");
            assert!(detail.contains("challenge-response"), "detail: {detail}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_probe_idempotent_on_healthy_host() {
    let (_cloud, _control, prober, id, fleet) = setup(&[(Role::Storage, 1), (Role::Worker, 1)]);

    // Re-running the whole cascade on an already-healthy fleet succeeds
    prober.wait_ready(&id, &fleet).await.unwrap();
    prober.wait_ready(&id, &fleet).await.unwrap();
}
