//! Tests for the metrics sampler

use super::*;
use crate::experiment::ExperimentId;
use crate::testkit::{FakeBehavior, FakeCloud, FakeControlPlane};
use std::sync::Arc;

const SCRAPE_JSON: &str =
    r#"{"heap_used_mb": 512.5, "gc_time_seconds": 1.25, "cpu_percent": 42.0, "mem_used_mb": 2048}"#;

fn fixture() -> (Arc<FakeControlPlane>, MetricsSampler, Fleet) {
    let id = ExperimentId::parse("exp-20250101-120000").unwrap();
    let cloud = FakeCloud::new();
    let outputs = cloud.seed_experiment(
        &id,
        &[(Role::Storage, 1), (Role::Broker, 2), (Role::Worker, 1)],
    );
    let fleet = outputs.fleet().unwrap();

    let control = Arc::new(FakeControlPlane::new());
    control.on("jvm_memory_bytes_used", FakeBehavior::success(SCRAPE_JSON));

    let executor = RemoteExecutor::new(Arc::clone(&control) as Arc<dyn crate::traits::ControlPlane>);
    let sampler = MetricsSampler::new(executor).with_config(SamplerConfig {
        period: Duration::from_secs(30),
        command_deadline: Duration::from_secs(10),
    });
    (control, sampler, fleet)
}

#[tokio::test(start_paused = true)]
async fn test_collects_snapshots_at_cadence() {
    let (_control, mut sampler, fleet) = fixture();

    sampler.start(&fleet);
    tokio::time::sleep(Duration::from_secs(95)).await;
    let series = sampler.stop().await;

    // Immediate tick plus one per 30 s period
    assert_eq!(series.len(), 4);
    for snapshot in &series {
        // Brokers and storage only, never workers
        assert_eq!(snapshot.hosts.len(), 3);
        assert!(snapshot.hosts.iter().all(|h| h.role != Role::Worker));
        let health = &snapshot.hosts[0];
        assert_eq!(health.heap_used_mb, Some(512.5));
        assert_eq!(health.mem_used_mb, Some(2048.0));
    }
}

#[tokio::test(start_paused = true)]
async fn test_scrape_failure_never_fails_sampling() {
    let (control, mut sampler, fleet) = fixture();

    // Every scrape fails; the sampler keeps ticking and records empty
    // snapshots instead of erroring
    control.on("jvm_memory_bytes_used", FakeBehavior::failure("curl: (7) failed"));

    sampler.start(&fleet);
    tokio::time::sleep(Duration::from_secs(35)).await;
    let series = sampler.stop().await;

    assert!(!series.is_empty());
    for snapshot in &series {
        assert!(snapshot.hosts.is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_without_start_is_noop() {
    let (_control, mut sampler, _fleet) = fixture();
    let series = sampler.stop().await;
    assert!(series.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_double_start_ignored_and_stop_idempotent() {
    let (_control, mut sampler, fleet) = fixture();

    sampler.start(&fleet);
    sampler.start(&fleet);
    tokio::time::sleep(Duration::from_secs(5)).await;

    let first = sampler.stop().await;
    assert!(!first.is_empty());
    let second = sampler.stop().await;
    assert!(second.is_empty());
}

#[test]
fn test_chart_data_shape() {
    let t0 = Utc::now();
    let series = vec![
        HealthSnapshot {
            timestamp: t0,
            hosts: vec![HostHealth {
                host: "i-b1".into(),
                role: Role::Broker,
                heap_used_mb: Some(100.0),
                gc_time_seconds: Some(0.5),
                cpu_percent: Some(10.0),
                mem_used_mb: Some(1000.0),
            }],
        },
        HealthSnapshot {
            timestamp: t0,
            hosts: vec![], // scrape failed this period
        },
        HealthSnapshot {
            timestamp: t0,
            hosts: vec![HostHealth {
                host: "i-b1".into(),
                role: Role::Broker,
                heap_used_mb: Some(200.0),
                gc_time_seconds: Some(0.7),
                cpu_percent: Some(20.0),
                mem_used_mb: Some(1100.0),
            }],
        },
    ];

    let chart = ChartData::from_series(&series);
    assert_eq!(chart.timestamps.len(), 3);
    let host = chart.hosts.get("i-b1").unwrap();
    assert_eq!(host.heap_used_mb, vec![Some(100.0), None, Some(200.0)]);
    assert_eq!(host.cpu_percent, vec![Some(10.0), None, Some(20.0)]);
}

#[test]
fn test_write_artifacts() {
    let tmp = tempfile::TempDir::new().unwrap();
    let series = vec![HealthSnapshot {
        timestamp: Utc::now(),
        hosts: vec![],
    }];

    write_artifacts(tmp.path(), &series).unwrap();

    let metrics: Vec<HealthSnapshot> = serde_json::from_str(
        &std::fs::read_to_string(tmp.path().join("metrics.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(metrics.len(), 1);
    assert!(tmp.path().join("metrics_chart.json").is_file());
}

#[test]
fn test_scrape_payload_ports() {
    assert!(scrape_payload(Role::Broker).contains("localhost:8080/metrics"));
    assert!(scrape_payload(Role::Storage).contains("localhost:8000/metrics"));
}
