//! Background infrastructure health sampling
//!
//! One sampler task runs for the duration of a test variant, scraping the
//! broker and storage hosts at a fixed cadence through the executor. A
//! scrape failure logs a warning and skips that host for the period; the
//! sampler never fails the enclosing test.

use crate::error::LabResult;
use crate::exec::RemoteExecutor;
use crate::fleet::{Fleet, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[cfg(test)]
mod tests;

/// Sampling cadence and per-scrape deadline
#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    /// Period between scrapes (default 30 s)
    pub period: Duration,
    /// Deadline for each scrape command
    pub command_deadline: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            period: Duration::from_secs(30),
            command_deadline: Duration::from_secs(25),
        }
    }
}

/// Health reading from one host at one instant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostHealth {
    /// Host identifier
    pub host: String,
    /// Host role
    pub role: Role,
    /// JVM heap in use, MiB
    pub heap_used_mb: Option<f64>,
    /// Cumulative GC time, seconds
    pub gc_time_seconds: Option<f64>,
    /// CPU busy share, percent
    pub cpu_percent: Option<f64>,
    /// Memory in use, MiB
    pub mem_used_mb: Option<f64>,
}

/// One sampling period's readings across the fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// When the period started
    pub timestamp: DateTime<Utc>,
    /// Per-host readings; hosts whose scrape failed are absent
    pub hosts: Vec<HostHealth>,
}

/// Raw scrape output, one JSON object on stdout
#[derive(Debug, Deserialize)]
struct ScrapeOutput {
    heap_used_mb: Option<f64>,
    gc_time_seconds: Option<f64>,
    cpu_percent: Option<f64>,
    mem_used_mb: Option<f64>,
}

/// Metrics port per role; only brokers and storage nodes are scraped
fn metrics_port(role: Role) -> u16 {
    match role {
        Role::Broker => 8080,
        _ => 8000,
    }
}

/// Single scrape payload emitting one JSON object
fn scrape_payload(role: Role) -> String {
    let port = metrics_port(role);
    format!(
        r#"metrics=$(curl -s --max-time 5 http://localhost:{port}/metrics || true)
heap=$(printf '%s' "$metrics" | awk '$1 ~ /^jvm_memory_bytes_used/ && /area="heap"/ {{print $2/1048576; exit}}')
gc=$(printf '%s' "$metrics" | awk '$1 ~ /^jvm_gc_collection_seconds_sum/ {{sum += $2}} END {{if (sum != "") print sum}}')
cpu=$(vmstat 1 2 | tail -1 | awk '{{print 100-$15}}')
mem=$(free -m | awk '/^Mem:/{{print $3}}')
printf '{{"heap_used_mb": %s, "gc_time_seconds": %s, "cpu_percent": %s, "mem_used_mb": %s}}\n' "${{heap:-null}}" "${{gc:-null}}" "${{cpu:-null}}" "${{mem:-null}}""#
    )
}

struct Running {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<Vec<HealthSnapshot>>,
}

/// Samples infrastructure health on a background task
///
/// `start` and `stop` are total: starting twice is a logged no-op, stopping
/// without a running task returns an empty series.
pub struct MetricsSampler {
    executor: RemoteExecutor,
    config: SamplerConfig,
    running: Option<Running>,
}

impl MetricsSampler {
    /// Create a sampler with the default cadence
    pub fn new(executor: RemoteExecutor) -> Self {
        MetricsSampler {
            executor,
            config: SamplerConfig::default(),
            running: None,
        }
    }

    /// Override the cadence
    pub fn with_config(mut self, config: SamplerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start sampling the fleet's scrape targets
    pub fn start(&mut self, fleet: &Fleet) {
        if self.running.is_some() {
            tracing::warn!("Sampler already running, ignoring start");
            return;
        }

        let targets: Vec<(String, Role)> = fleet
            .scrape_targets()
            .into_iter()
            .map(|h| (h.id.clone(), h.role))
            .collect();
        let (stop_tx, stop_rx) = watch::channel(false);
        let executor = self.executor.clone();
        let config = self.config;

        tracing::info!(
            targets = targets.len(),
            period_secs = config.period.as_secs(),
            "Sampler started"
        );
        let task = tokio::spawn(sample_loop(executor, config, targets, stop_rx));
        self.running = Some(Running { stop_tx, task });
    }

    /// Stop sampling and return the collected series
    pub async fn stop(&mut self) -> Vec<HealthSnapshot> {
        let Some(running) = self.running.take() else {
            return Vec::new();
        };
        let _ = running.stop_tx.send(true);
        match running.task.await {
            Ok(series) => {
                tracing::info!(snapshots = series.len(), "Sampler stopped");
                series
            }
            Err(e) => {
                tracing::error!(error = %e, "Sampler task panicked");
                Vec::new()
            }
        }
    }
}

async fn sample_loop(
    executor: RemoteExecutor,
    config: SamplerConfig,
    targets: Vec<(String, Role)>,
    mut stop_rx: watch::Receiver<bool>,
) -> Vec<HealthSnapshot> {
    let mut series = Vec::new();
    let mut ticker = tokio::time::interval(config.period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = stop_rx.changed() => break,

            _ = ticker.tick() => {
                let snapshot = scrape_all(&executor, &config, &targets).await;
                series.push(snapshot);
            }
        }
    }
    series
}

async fn scrape_all(
    executor: &RemoteExecutor,
    config: &SamplerConfig,
    targets: &[(String, Role)],
) -> HealthSnapshot {
    let timestamp = Utc::now();
    let scrapes = targets.iter().map(|(host, role)| async move {
        let payload = scrape_payload(*role);
        match executor.run(host, &payload, config.command_deadline).await {
            Ok(outcome) => match serde_json::from_str::<ScrapeOutput>(outcome.stdout.trim()) {
                Ok(out) => Some(HostHealth {
                    host: host.clone(),
                    role: *role,
                    heap_used_mb: out.heap_used_mb,
                    gc_time_seconds: out.gc_time_seconds,
                    cpu_percent: out.cpu_percent,
                    mem_used_mb: out.mem_used_mb,
                }),
                Err(e) => {
                    tracing::warn!(host = %host, error = %e, "Unparseable scrape output, skipping");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(host = %host, error = %e, "Scrape failed, skipping host");
                None
            }
        }
    });

    let hosts = futures::future::join_all(scrapes)
        .await
        .into_iter()
        .flatten()
        .collect();
    HealthSnapshot { timestamp, hosts }
}

/// Chart-ready reshaping of a snapshot series
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChartData {
    /// Snapshot timestamps, in order
    pub timestamps: Vec<DateTime<Utc>>,
    /// Per-host metric series, index-aligned with `timestamps`
    pub hosts: BTreeMap<String, HostSeries>,
}

/// One host's metric series
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostSeries {
    /// JVM heap in use, MiB
    pub heap_used_mb: Vec<Option<f64>>,
    /// Cumulative GC time, seconds
    pub gc_time_seconds: Vec<Option<f64>>,
    /// CPU busy share, percent
    pub cpu_percent: Vec<Option<f64>>,
    /// Memory in use, MiB
    pub mem_used_mb: Vec<Option<f64>>,
}

impl ChartData {
    /// Reshape a series into per-host columns, padding missing scrapes
    pub fn from_series(series: &[HealthSnapshot]) -> Self {
        let mut chart = ChartData::default();
        for snapshot in series {
            chart.timestamps.push(snapshot.timestamp);
        }
        let names: std::collections::BTreeSet<&str> = series
            .iter()
            .flat_map(|s| s.hosts.iter().map(|h| h.host.as_str()))
            .collect();

        for name in names {
            let mut columns = HostSeries::default();
            for snapshot in series {
                let health = snapshot.hosts.iter().find(|h| h.host == name);
                columns.heap_used_mb.push(health.and_then(|h| h.heap_used_mb));
                columns
                    .gc_time_seconds
                    .push(health.and_then(|h| h.gc_time_seconds));
                columns.cpu_percent.push(health.and_then(|h| h.cpu_percent));
                columns.mem_used_mb.push(health.and_then(|h| h.mem_used_mb));
            }
            chart.hosts.insert(name.to_string(), columns);
        }
        chart
    }
}

/// Write the series and its chart shape into a metrics directory
pub fn write_artifacts(dir: &Path, series: &[HealthSnapshot]) -> LabResult<()> {
    let series_json = serde_json::to_string_pretty(series)?;
    std::fs::write(dir.join("metrics.json"), series_json)?;

    let chart = ChartData::from_series(series);
    let chart_json = serde_json::to_string_pretty(&chart)?;
    std::fs::write(dir.join("metrics_chart.json"), chart_json)?;
    Ok(())
}
