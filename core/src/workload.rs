//! Workload model: base spec, per-variant overrides, and the merged artefact
//!
//! A workload artefact is the fully-merged, serialised input consumed by the
//! remote benchmark binary. Merging is a pure function: the same
//! `(base, variant)` pair always renders byte-identical YAML.

use crate::config::{TestVariant, VariantKind};
use crate::error::{LabError, LabResult};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Message size: a fixed byte count or a weight-bucketed distribution
///
/// Distribution form: `{ "<lo>-<hi>": weight, ... }`. Weights are
/// normalised; per-message selection picks a bucket by weight and a size
/// uniformly inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageSize {
    /// Every message has this size in bytes
    Fixed(u32),
    /// Weighted size buckets, keyed `"<lo>-<hi>"`
    Distribution(BTreeMap<String, f64>),
}

/// One parsed size bucket with its normalised weight
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeBucket {
    /// Inclusive lower bound in bytes
    pub lo: u32,
    /// Inclusive upper bound in bytes
    pub hi: u32,
    /// Normalised weight in (0, 1]
    pub weight: f64,
}

impl MessageSize {
    /// Validate bounds and weights
    pub fn validate(&self) -> LabResult<()> {
        match self {
            MessageSize::Fixed(0) => Err(LabError::config("message_size must be positive")),
            MessageSize::Fixed(_) => Ok(()),
            MessageSize::Distribution(_) => self.buckets().map(|_| ()),
        }
    }

    /// Parse and normalise the distribution buckets
    ///
    /// A fixed size yields a single degenerate bucket.
    pub fn buckets(&self) -> LabResult<Vec<SizeBucket>> {
        match self {
            MessageSize::Fixed(n) => Ok(vec![SizeBucket {
                lo: *n,
                hi: *n,
                weight: 1.0,
            }]),
            MessageSize::Distribution(map) => {
                if map.is_empty() {
                    return Err(LabError::config("message_size distribution is empty"));
                }
                let mut buckets = Vec::with_capacity(map.len());
                let mut total = 0.0;
                for (key, weight) in map {
                    let (lo, hi) = parse_bucket_key(key)?;
                    if *weight <= 0.0 || !weight.is_finite() {
                        return Err(LabError::config(format!(
                            "message_size bucket {key:?} has non-positive weight"
                        )));
                    }
                    total += weight;
                    buckets.push(SizeBucket {
                        lo,
                        hi,
                        weight: *weight,
                    });
                }
                for bucket in &mut buckets {
                    bucket.weight /= total;
                }
                Ok(buckets)
            }
        }
    }

    /// Draw one message size
    pub fn sample<R: Rng>(&self, rng: &mut R) -> LabResult<u32> {
        let buckets = self.buckets()?;
        let index = WeightedIndex::new(buckets.iter().map(|b| b.weight))
            .map_err(|e| LabError::internal(format!("weighted index: {e}")))?;
        let bucket = buckets[index.sample(rng)];
        Ok(rng.gen_range(bucket.lo..=bucket.hi))
    }
}

fn parse_bucket_key(key: &str) -> LabResult<(u32, u32)> {
    let err = || {
        LabError::config(format!(
            "invalid message_size bucket {key:?} (expected \"<lo>-<hi>\")"
        ))
    };
    let (lo, hi) = key.split_once('-').ok_or_else(err)?;
    let lo: u32 = lo.trim().parse().map_err(|_| err())?;
    let hi: u32 = hi.trim().parse().map_err(|_| err())?;
    if lo == 0 || lo > hi {
        return Err(err());
    }
    Ok((lo, hi))
}

/// Base workload every variant starts from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Workload name (variant merges replace this with the variant name)
    pub name: String,
    /// Number of topics
    pub topics: u32,
    /// Partitions per topic
    pub partitions_per_topic: u32,
    /// Message size (fixed or distribution)
    pub message_size: MessageSize,
    /// Subscriptions per topic
    #[serde(default = "default_one")]
    pub subscriptions_per_topic: u32,
    /// Consumers per subscription
    #[serde(default = "default_one")]
    pub consumers_per_subscription: u32,
    /// Producers per topic
    #[serde(default = "default_one")]
    pub producers_per_topic: u32,
    /// Consumer backlog target in GiB (0 = none)
    #[serde(default)]
    pub consumer_backlog_size_gb: u32,
    /// Measured window in minutes
    #[serde(default = "default_test_minutes")]
    pub test_duration_minutes: u32,
    /// Warmup window in minutes
    #[serde(default = "default_warmup_minutes")]
    pub warmup_duration_minutes: u32,
}

fn default_one() -> u32 {
    1
}

fn default_test_minutes() -> u32 {
    5
}

fn default_warmup_minutes() -> u32 {
    1
}

impl WorkloadSpec {
    /// Boundary validation
    pub fn validate(&self) -> LabResult<()> {
        if self.topics == 0 || self.partitions_per_topic == 0 {
            return Err(LabError::config(
                "topics and partitions_per_topic must be positive",
            ));
        }
        if self.test_duration_minutes == 0 {
            return Err(LabError::config("test_duration_minutes must be positive"));
        }
        self.message_size.validate()
    }

    #[cfg(test)]
    pub(crate) fn default_for_tests() -> Self {
        WorkloadSpec {
            name: "base".to_string(),
            topics: 1,
            partitions_per_topic: 1,
            message_size: MessageSize::Fixed(1024),
            subscriptions_per_topic: 1,
            consumers_per_subscription: 1,
            producers_per_topic: 1,
            consumer_backlog_size_gb: 0,
            test_duration_minutes: 1,
            warmup_duration_minutes: 1,
        }
    }
}

/// Per-variant overrides of the base workload
///
/// Unknown keys are rejected when the test plan is parsed; this is the
/// merge-time boundary the workload contract requires.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariantOverrides {
    /// Override topic count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<u32>,
    /// Override partitions per topic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions_per_topic: Option<u32>,
    /// Override message size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_size: Option<MessageSize>,
    /// Override subscriptions per topic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriptions_per_topic: Option<u32>,
    /// Override consumers per subscription
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumers_per_subscription: Option<u32>,
    /// Override producers per topic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producers_per_topic: Option<u32>,
    /// Override consumer backlog in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_backlog_size_gb: Option<u32>,
    /// Override measured window in minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_duration_minutes: Option<u32>,
    /// Override warmup window in minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_duration_minutes: Option<u32>,
}

/// Fully-merged workload, keyed the way the benchmark harness expects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadArtifact {
    /// Variant name
    pub name: String,
    /// Number of topics
    pub topics: u32,
    /// Partitions per topic
    pub partitions_per_topic: u32,
    /// Message size (fixed or distribution)
    pub message_size: MessageSize,
    /// Subscriptions per topic
    pub subscriptions_per_topic: u32,
    /// Consumers per subscription
    pub consumer_per_subscription: u32,
    /// Producers per topic
    pub producers_per_topic: u32,
    /// Consumer backlog target in GiB
    #[serde(rename = "consumerBacklogSizeGB")]
    pub consumer_backlog_size_gb: u32,
    /// Measured window in minutes
    pub test_duration_minutes: u32,
    /// Warmup window in minutes
    pub warmup_duration_minutes: u32,
    /// Fixed publish rate in msgs/s; absent means unthrottled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_rate: Option<u64>,
}

impl WorkloadArtifact {
    /// Total wall-clock budget for one run of this workload
    pub fn run_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            u64::from(self.test_duration_minutes + self.warmup_duration_minutes) * 60,
        )
    }

    /// Stable YAML rendering (struct field order, sorted distribution keys)
    pub fn to_yaml(&self) -> LabResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Merge the base workload with a variant's overrides
///
/// Overrides win; every defaulted base field is present in the output. The
/// variant's kind decides the publish rate: fixed-rate and ramp-up variants
/// pin `producerRate` to the target, max-rate leaves it unset.
pub fn merge_workload(base: &WorkloadSpec, variant: &TestVariant) -> LabResult<WorkloadArtifact> {
    let o = &variant.workload_overrides;

    let producer_rate = match variant.kind {
        VariantKind::FixedRate | VariantKind::RampUp => Some(
            variant
                .target_rate
                .ok_or_else(|| LabError::config(format!("variant {} has no target_rate", variant.name)))?,
        ),
        VariantKind::MaxRate => None,
    };

    let artifact = WorkloadArtifact {
        name: variant.name.clone(),
        topics: o.topics.unwrap_or(base.topics),
        partitions_per_topic: o.partitions_per_topic.unwrap_or(base.partitions_per_topic),
        message_size: o
            .message_size
            .clone()
            .unwrap_or_else(|| base.message_size.clone()),
        subscriptions_per_topic: o
            .subscriptions_per_topic
            .unwrap_or(base.subscriptions_per_topic),
        consumer_per_subscription: o
            .consumers_per_subscription
            .unwrap_or(base.consumers_per_subscription),
        producers_per_topic: o.producers_per_topic.unwrap_or(base.producers_per_topic),
        consumer_backlog_size_gb: o
            .consumer_backlog_size_gb
            .unwrap_or(base.consumer_backlog_size_gb),
        test_duration_minutes: o.test_duration_minutes.unwrap_or(base.test_duration_minutes),
        warmup_duration_minutes: o
            .warmup_duration_minutes
            .unwrap_or(base.warmup_duration_minutes),
        producer_rate,
    };
    artifact.message_size.validate()?;
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn variant(kind: VariantKind, rate: Option<u64>) -> TestVariant {
        TestVariant {
            name: "v1".to_string(),
            kind,
            target_rate: rate,
            workload_overrides: VariantOverrides::default(),
        }
    }

    #[test]
    fn test_merge_overrides_win() {
        let base = WorkloadSpec::default_for_tests();
        let mut v = variant(VariantKind::FixedRate, Some(1000));
        v.workload_overrides.partitions_per_topic = Some(64);
        v.workload_overrides.test_duration_minutes = Some(3);

        let artifact = merge_workload(&base, &v).unwrap();
        assert_eq!(artifact.name, "v1");
        assert_eq!(artifact.partitions_per_topic, 64);
        assert_eq!(artifact.test_duration_minutes, 3);
        assert_eq!(artifact.topics, base.topics);
        assert_eq!(artifact.producer_rate, Some(1000));
    }

    #[test]
    fn test_merge_is_deterministic() {
        let base = WorkloadSpec::default_for_tests();
        let v = variant(VariantKind::FixedRate, Some(1000));

        let a = merge_workload(&base, &v).unwrap().to_yaml().unwrap();
        let b = merge_workload(&base, &v).unwrap().to_yaml().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_max_rate_omits_producer_rate() {
        let base = WorkloadSpec::default_for_tests();
        let artifact = merge_workload(&base, &variant(VariantKind::MaxRate, None)).unwrap();
        assert_eq!(artifact.producer_rate, None);

        let yaml = artifact.to_yaml().unwrap();
        assert!(!yaml.contains("producerRate"));
    }

    #[test]
    fn test_artifact_uses_harness_keys() {
        let base = WorkloadSpec::default_for_tests();
        let yaml = merge_workload(&base, &variant(VariantKind::FixedRate, Some(500)))
            .unwrap()
            .to_yaml()
            .unwrap();
        assert!(yaml.contains("partitionsPerTopic"));
        assert!(yaml.contains("messageSize"));
        assert!(yaml.contains("consumerBacklogSizeGB"));
        assert!(yaml.contains("testDurationMinutes"));
        assert!(yaml.contains("producerRate: 500"));
    }

    #[test]
    fn test_unknown_override_keys_rejected() {
        let err = serde_yaml::from_str::<VariantOverrides>("message_sizee: 100");
        assert!(err.is_err());
    }

    #[test]
    fn test_distribution_normalisation() {
        let mut map = BTreeMap::new();
        map.insert("100-200".to_string(), 3.0);
        map.insert("1000-2000".to_string(), 1.0);
        let size = MessageSize::Distribution(map);

        let buckets = size.buckets().unwrap();
        assert_eq!(buckets.len(), 2);
        let total: f64 = buckets.iter().map(|b| b.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((buckets.iter().find(|b| b.lo == 100).unwrap().weight - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_distribution_sampling_stays_in_bounds() {
        let mut map = BTreeMap::new();
        map.insert("100-200".to_string(), 1.0);
        map.insert("300-400".to_string(), 1.0);
        let size = MessageSize::Distribution(map);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let n = size.sample(&mut rng).unwrap();
            assert!((100..=200).contains(&n) || (300..=400).contains(&n));
        }
    }

    #[test]
    fn test_invalid_buckets_rejected() {
        for key in ["200-100", "abc", "-", "0-10", ""] {
            let mut map = BTreeMap::new();
            map.insert(key.to_string(), 1.0);
            assert!(
                MessageSize::Distribution(map).validate().is_err(),
                "bucket {key:?} should be rejected"
            );
        }

        let mut map = BTreeMap::new();
        map.insert("100-200".to_string(), 0.0);
        assert!(MessageSize::Distribution(map).validate().is_err());
    }

    #[test]
    fn test_message_size_yaml_forms() {
        let fixed: MessageSize = serde_yaml::from_str("1024").unwrap();
        assert_eq!(fixed, MessageSize::Fixed(1024));

        let dist: MessageSize = serde_yaml::from_str("{\"100-200\": 2, \"300-400\": 1}").unwrap();
        assert!(matches!(dist, MessageSize::Distribution(ref m) if m.len() == 2));
    }
}
