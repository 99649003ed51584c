//! Experiment identity and the cloud tag schema

use crate::error::{LabError, LabResult};
use crate::fleet::Role;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag key carrying the project name
pub const TAG_PROJECT: &str = "Project";
/// Tag key carrying the experiment identity; reclaim is scoped by this tag
pub const TAG_EXPERIMENT_ID: &str = "ExperimentID";
/// Tag key carrying the role of the tagged resource
pub const TAG_COMPONENT: &str = "Component";
/// Tag key marking resources as orchestrator-managed
pub const TAG_MANAGED_BY: &str = "ManagedBy";

/// Project name stamped into every resource tag set
pub const PROJECT_NAME: &str = "broker-bench";

/// Unique identity of one experiment, `exp-<UTC timestamp>`
///
/// Created at `Init` and immutable thereafter. Every cloud resource created
/// under the experiment carries this identity in its `ExperimentID` tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(String);

impl ExperimentId {
    /// Generate a fresh identity from the current UTC time
    pub fn generate() -> Self {
        ExperimentId(format!("exp-{}", Utc::now().format("%Y%m%d-%H%M%S")))
    }

    /// Parse a user-supplied identity
    ///
    /// Accepts anything shaped like `exp-...`; the `latest` shortcut is
    /// resolved by the store, not here.
    pub fn parse(s: &str) -> LabResult<Self> {
        if s.starts_with("exp-") && s.len() > 4 {
            Ok(ExperimentId(s.to_string()))
        } else {
            Err(LabError::config(format!(
                "invalid experiment id: {s:?} (expected exp-<timestamp>)"
            )))
        }
    }

    /// The identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Full tag set attached to every resource the experiment creates
///
/// The four required keys are always present; extra tags come from the
/// infrastructure config and the CLI, with CLI values winning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagSet {
    tags: BTreeMap<String, String>,
}

impl TagSet {
    /// Build the default tag set for an experiment
    pub fn for_experiment(id: &ExperimentId, component: Option<Role>) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert(TAG_PROJECT.to_string(), PROJECT_NAME.to_string());
        tags.insert(TAG_EXPERIMENT_ID.to_string(), id.to_string());
        tags.insert(TAG_MANAGED_BY.to_string(), PROJECT_NAME.to_string());
        if let Some(role) = component {
            tags.insert(TAG_COMPONENT.to_string(), role.to_string());
        }
        TagSet { tags }
    }

    /// Merge additional tags; later entries override earlier ones, but the
    /// required keys are never overridden
    pub fn merged(mut self, extra: &BTreeMap<String, String>) -> Self {
        for (k, v) in extra {
            if k != TAG_PROJECT && k != TAG_EXPERIMENT_ID && k != TAG_MANAGED_BY {
                self.tags.insert(k.clone(), v.clone());
            }
        }
        self
    }

    /// Iterate the tag pairs in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Look up a tag value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Parse a `KEY=VALUE` tag argument from the CLI
pub fn parse_tag_arg(arg: &str) -> LabResult<(String, String)> {
    match arg.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(LabError::config(format!(
            "invalid tag {arg:?} (expected KEY=VALUE)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_shape() {
        let id = ExperimentId::generate();
        assert!(id.as_str().starts_with("exp-"));
        assert_eq!(id.as_str().len(), "exp-20250101-120000".len());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ExperimentId::parse("exp-20250101-120000").is_ok());
        assert!(ExperimentId::parse("latest").is_err());
        assert!(ExperimentId::parse("exp-").is_err());
        assert!(ExperimentId::parse("").is_err());
    }

    #[test]
    fn test_required_tags_present() {
        let id = ExperimentId::parse("exp-20250101-120000").unwrap();
        let tags = TagSet::for_experiment(&id, Some(Role::Broker));
        assert_eq!(tags.get(TAG_PROJECT), Some(PROJECT_NAME));
        assert_eq!(tags.get(TAG_EXPERIMENT_ID), Some("exp-20250101-120000"));
        assert_eq!(tags.get(TAG_COMPONENT), Some("broker"));
        assert_eq!(tags.get(TAG_MANAGED_BY), Some(PROJECT_NAME));
    }

    #[test]
    fn test_merge_cannot_override_identity() {
        let id = ExperimentId::parse("exp-20250101-120000").unwrap();
        let mut extra = BTreeMap::new();
        extra.insert(TAG_EXPERIMENT_ID.to_string(), "exp-evil".to_string());
        extra.insert("Owner".to_string(), "perf-team".to_string());

        let tags = TagSet::for_experiment(&id, None).merged(&extra);
        assert_eq!(tags.get(TAG_EXPERIMENT_ID), Some("exp-20250101-120000"));
        assert_eq!(tags.get("Owner"), Some("perf-team"));
    }

    #[test]
    fn test_parse_tag_arg() {
        assert_eq!(
            parse_tag_arg("Owner=me").unwrap(),
            ("Owner".to_string(), "me".to_string())
        );
        assert!(parse_tag_arg("no-equals").is_err());
        assert!(parse_tag_arg("=value").is_err());
    }
}
