//! Benchmark output parsing and per-variant result records

use crate::error::{LabError, LabResult};
use crate::store::ExperimentDir;
use serde::{Deserialize, Serialize};
use std::fs;

/// Terminal state of one variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantStatus {
    /// Ran and produced results
    Success,
    /// Ran and failed (results missing or invalid)
    Failed,
    /// Interrupted mid-run
    Cancelled,
    /// Never ran because the plateau policy aborted the matrix
    Skipped,
}

/// Terminal record for one variant
///
/// Written as `error.json` in the variant's result directory when the
/// variant did not succeed; successful variants are described by their
/// `summary.json` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantRecord {
    /// Variant name
    pub variant: String,
    /// Terminal status
    pub status: VariantStatus,
    /// Error detail for failed/cancelled variants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Latency figures in milliseconds
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Mean
    pub avg: f64,
    /// Median
    pub p50: f64,
    /// 95th percentile
    pub p95: f64,
    /// 99th percentile
    pub p99: f64,
    /// 99.9th percentile
    pub p999: f64,
    /// Maximum
    pub max: f64,
}

/// Parsed summary of one variant's benchmark output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkSummary {
    /// Variant name
    pub variant: String,
    /// Target publish rate, when the variant had one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_rate: Option<u64>,
    /// Mean achieved publish rate, msgs/s
    pub publish_rate: f64,
    /// Mean achieved consume rate, msgs/s
    pub consume_rate: f64,
    /// Publish latency percentiles
    pub publish_latency: LatencySummary,
    /// End-to-end latency percentiles
    pub end_to_end_latency: LatencySummary,
}

/// The shape the benchmark harness writes; only the fields we consume
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HarnessOutput {
    #[serde(default)]
    publish_rate: Vec<f64>,
    #[serde(default)]
    consume_rate: Vec<f64>,
    #[serde(default)]
    aggregated_publish_latency_avg: f64,
    #[serde(default, rename = "aggregatedPublishLatency50pct")]
    aggregated_publish_latency_50pct: f64,
    #[serde(default, rename = "aggregatedPublishLatency95pct")]
    aggregated_publish_latency_95pct: f64,
    #[serde(default, rename = "aggregatedPublishLatency99pct")]
    aggregated_publish_latency_99pct: f64,
    #[serde(default, rename = "aggregatedPublishLatency999pct")]
    aggregated_publish_latency_999pct: f64,
    #[serde(default)]
    aggregated_publish_latency_max: f64,
    #[serde(default)]
    aggregated_end_to_end_latency_avg: f64,
    #[serde(default, rename = "aggregatedEndToEndLatency50pct")]
    aggregated_end_to_end_latency_50pct: f64,
    #[serde(default, rename = "aggregatedEndToEndLatency95pct")]
    aggregated_end_to_end_latency_95pct: f64,
    #[serde(default, rename = "aggregatedEndToEndLatency99pct")]
    aggregated_end_to_end_latency_99pct: f64,
    #[serde(default, rename = "aggregatedEndToEndLatency999pct")]
    aggregated_end_to_end_latency_999pct: f64,
    #[serde(default)]
    aggregated_end_to_end_latency_max: f64,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Parse the harness's raw JSON into a summary
pub fn parse_summary(
    variant: &str,
    target_rate: Option<u64>,
    raw_json: &str,
) -> LabResult<BenchmarkSummary> {
    let raw: HarnessOutput = serde_json::from_str(raw_json)
        .map_err(|e| LabError::Serde(format!("benchmark output for {variant}: {e}")))?;

    if raw.publish_rate.is_empty() {
        return Err(LabError::Serde(format!(
            "benchmark output for {variant} has no publishRate samples"
        )));
    }

    Ok(BenchmarkSummary {
        variant: variant.to_string(),
        target_rate,
        publish_rate: mean(&raw.publish_rate),
        consume_rate: mean(&raw.consume_rate),
        publish_latency: LatencySummary {
            avg: raw.aggregated_publish_latency_avg,
            p50: raw.aggregated_publish_latency_50pct,
            p95: raw.aggregated_publish_latency_95pct,
            p99: raw.aggregated_publish_latency_99pct,
            p999: raw.aggregated_publish_latency_999pct,
            max: raw.aggregated_publish_latency_max,
        },
        end_to_end_latency: LatencySummary {
            avg: raw.aggregated_end_to_end_latency_avg,
            p50: raw.aggregated_end_to_end_latency_50pct,
            p95: raw.aggregated_end_to_end_latency_95pct,
            p99: raw.aggregated_end_to_end_latency_99pct,
            p999: raw.aggregated_end_to_end_latency_999pct,
            max: raw.aggregated_end_to_end_latency_max,
        },
    })
}

/// Aggregated report document, one entry per variant in matrix order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEntry {
    /// Variant name
    pub variant: String,
    /// Terminal status
    pub status: VariantStatus,
    /// Parsed summary, for successful variants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<BenchmarkSummary>,
    /// Error detail, for the rest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The document the report phase writes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDoc {
    /// Experiment identity
    pub experiment_id: String,
    /// Per-variant outcome
    pub variants: Vec<ReportEntry>,
}

/// Rebuild the report from stored artefacts
///
/// Scans `benchmark_results/` for per-variant `summary.json` or
/// `error.json` files and writes `report/report.json`. Usable long after
/// the cluster is gone.
pub fn write_report(experiment: &ExperimentDir) -> LabResult<ReportDoc> {
    let results_root = experiment.path().join("benchmark_results");
    let mut variants = Vec::new();

    let mut dirs: Vec<_> = fs::read_dir(&results_root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect();
    dirs.sort_by_key(|e| e.file_name());

    for entry in dirs {
        let name = entry.file_name().to_string_lossy().to_string();
        let summary_path = entry.path().join("summary.json");
        let error_path = entry.path().join("error.json");

        if summary_path.is_file() {
            let summary: BenchmarkSummary =
                serde_json::from_str(&fs::read_to_string(&summary_path)?)?;
            variants.push(ReportEntry {
                variant: name,
                status: VariantStatus::Success,
                summary: Some(summary),
                error: None,
            });
        } else if error_path.is_file() {
            let record: VariantRecord = serde_json::from_str(&fs::read_to_string(&error_path)?)?;
            variants.push(ReportEntry {
                variant: name,
                status: record.status,
                summary: None,
                error: record.error,
            });
        } else {
            variants.push(ReportEntry {
                variant: name,
                status: VariantStatus::Failed,
                summary: None,
                error: Some("no terminal record found".to_string()),
            });
        }
    }

    let doc = ReportDoc {
        experiment_id: experiment.id().to_string(),
        variants,
    };
    experiment.write_json(&experiment.report_dir().join("report.json"), &doc)?;
    tracing::info!(
        experiment = %experiment.id(),
        variants = doc.variants.len(),
        "Report written"
    );
    Ok(doc)
}
