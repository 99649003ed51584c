//! Durable per-experiment artefact storage
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<exp-id>/
//!   orchestrator.log            append-only text log
//!   infra_vars.json             generated provisioner inputs
//!   benchmark_results/          per-variant raw + parsed output
//!   metrics/                    per-variant health snapshot series
//!   manifests/                  generated workload artefacts
//!   report/                     aggregated report document
//! <root>/latest                 pointer to the most recent <exp-id>
//! ```
//!
//! The `latest` pointer is a symlink replaced by create-at-temp-then-rename,
//! so a reader following it never observes a broken pointer.

use crate::error::{LabError, LabResult};
use crate::experiment::ExperimentId;
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// The experiment store root
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (and create if needed) a store at the given root
    pub fn open(root: impl Into<PathBuf>) -> LabResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Store { root })
    }

    /// The store root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory tree for a new experiment and point `latest` at it
    pub fn create_experiment(&self, id: &ExperimentId) -> LabResult<ExperimentDir> {
        let dir = ExperimentDir::open(self, id)?;
        self.update_latest(id)?;
        Ok(dir)
    }

    /// Open an existing experiment directory
    pub fn open_experiment(&self, id: &ExperimentId) -> LabResult<ExperimentDir> {
        let path = self.root.join(id.as_str());
        if !path.is_dir() {
            return Err(LabError::config(format!("unknown experiment: {id}")));
        }
        ExperimentDir::open(self, id)
    }

    /// Resolve a user-supplied identity, honouring the `latest` shortcut
    pub fn resolve(&self, id_or_latest: &str) -> LabResult<ExperimentId> {
        if id_or_latest == "latest" {
            self.latest()?
                .ok_or_else(|| LabError::config("no experiments found ('latest' does not exist)"))
        } else {
            let id = ExperimentId::parse(id_or_latest)?;
            if !self.root.join(id.as_str()).is_dir() {
                return Err(LabError::config(format!("unknown experiment: {id}")));
            }
            Ok(id)
        }
    }

    /// The experiment `latest` currently points at, if any
    pub fn latest(&self) -> LabResult<Option<ExperimentId>> {
        let link = self.root.join("latest");
        let target = match fs::read_link(&link) {
            Ok(target) => target,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            // Non-symlink fallback (see update_latest)
            Err(_) => PathBuf::from(fs::read_to_string(&link)?.trim()),
        };
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LabError::internal("latest pointer has no file name"))?;
        Ok(Some(ExperimentId::parse(name)?))
    }

    /// List experiments, newest first, with their last-modified times
    pub fn list(&self) -> LabResult<Vec<ExperimentListing>> {
        let latest = self.latest()?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("exp-") || !entry.path().is_dir() {
                continue;
            }
            let Ok(id) = ExperimentId::parse(name) else {
                continue;
            };
            let modified = entry.metadata()?.modified()?;
            entries.push(ExperimentListing {
                is_latest: latest.as_ref() == Some(&id),
                id,
                modified,
            });
        }
        entries.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(entries)
    }

    fn update_latest(&self, id: &ExperimentId) -> LabResult<()> {
        let link = self.root.join("latest");
        let tmp = self.root.join(".latest.tmp");
        let _ = fs::remove_file(&tmp);
        #[cfg(unix)]
        std::os::unix::fs::symlink(id.as_str(), &tmp)?;
        #[cfg(not(unix))]
        fs::write(&tmp, id.as_str())?;
        fs::rename(&tmp, &link)?;
        Ok(())
    }
}

/// One entry from [`Store::list`]
#[derive(Debug, Clone)]
pub struct ExperimentListing {
    /// Experiment identity
    pub id: ExperimentId,
    /// Directory last-modified time
    pub modified: std::time::SystemTime,
    /// Whether `latest` points here
    pub is_latest: bool,
}

/// Handle on one experiment's directory tree
///
/// Cheap to clone; the log appender is shared.
#[derive(Debug, Clone)]
pub struct ExperimentDir {
    id: ExperimentId,
    path: PathBuf,
    log: Arc<Mutex<File>>,
}

impl ExperimentDir {
    fn open(store: &Store, id: &ExperimentId) -> LabResult<Self> {
        let path = store.root.join(id.as_str());
        fs::create_dir_all(&path)?;
        fs::create_dir_all(path.join("benchmark_results"))?;
        fs::create_dir_all(path.join("metrics"))?;
        fs::create_dir_all(path.join("manifests"))?;
        fs::create_dir_all(path.join("report"))?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.join("orchestrator.log"))?;

        Ok(ExperimentDir {
            id: id.clone(),
            path,
            log: Arc::new(Mutex::new(log)),
        })
    }

    /// Experiment identity
    pub fn id(&self) -> &ExperimentId {
        &self.id
    }

    /// Root of this experiment's tree
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line to the experiment log
    pub fn append_log(&self, line: &str) {
        if let Ok(mut log) = self.log.lock() {
            // Log failures must never fail the experiment
            let _ = writeln!(log, "{} {}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"), line);
        }
    }

    /// Path of the generated provisioner variables document
    pub fn infra_vars_path(&self) -> PathBuf {
        self.path.join("infra_vars.json")
    }

    /// Path of the provisioned fleet document (written after Provision)
    pub fn fleet_path(&self) -> PathBuf {
        self.path.join("fleet.json")
    }

    /// Result directory for one variant (created on first use)
    pub fn variant_dir(&self, variant: &str) -> LabResult<PathBuf> {
        let dir = self.path.join("benchmark_results").join(variant);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Metrics directory for one variant (created on first use)
    pub fn variant_metrics_dir(&self, variant: &str) -> LabResult<PathBuf> {
        let dir = self.path.join("metrics").join(variant);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Directory of generated control-plane payload manifests
    pub fn manifests_dir(&self) -> PathBuf {
        self.path.join("manifests")
    }

    /// Directory the report phase writes into
    pub fn report_dir(&self) -> PathBuf {
        self.path.join("report")
    }

    /// Write a JSON document under the experiment tree
    pub fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> LabResult<()> {
        let text = serde_json::to_string_pretty(value)?;
        fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(s: &str) -> ExperimentId {
        ExperimentId::parse(s).unwrap()
    }

    #[test]
    fn test_create_experiment_layout() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let dir = store.create_experiment(&id("exp-20250101-120000")).unwrap();

        assert!(dir.path().join("orchestrator.log").is_file());
        assert!(dir.path().join("benchmark_results").is_dir());
        assert!(dir.path().join("metrics").is_dir());
        assert!(dir.path().join("manifests").is_dir());
        assert!(dir.path().join("report").is_dir());
    }

    #[test]
    fn test_latest_pointer_follows_newest() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();

        store.create_experiment(&id("exp-20250101-120000")).unwrap();
        assert_eq!(
            store.latest().unwrap().unwrap().as_str(),
            "exp-20250101-120000"
        );

        store.create_experiment(&id("exp-20250102-120000")).unwrap();
        assert_eq!(
            store.latest().unwrap().unwrap().as_str(),
            "exp-20250102-120000"
        );
    }

    #[test]
    fn test_resolve_latest_and_explicit() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        store.create_experiment(&id("exp-20250101-120000")).unwrap();

        assert_eq!(
            store.resolve("latest").unwrap().as_str(),
            "exp-20250101-120000"
        );
        assert_eq!(
            store.resolve("exp-20250101-120000").unwrap().as_str(),
            "exp-20250101-120000"
        );
        assert!(store.resolve("exp-20990101-000000").is_err());
    }

    #[test]
    fn test_resolve_latest_when_empty() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        assert!(store.resolve("latest").is_err());
    }

    #[test]
    fn test_log_appends() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let dir = store.create_experiment(&id("exp-20250101-120000")).unwrap();

        dir.append_log("phase transition: Init -> Provision");
        dir.append_log("phase transition: Provision -> Converge");

        let text = fs::read_to_string(dir.path().join("orchestrator.log")).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("Init -> Provision"));
    }

    #[test]
    fn test_list_marks_latest() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        store.create_experiment(&id("exp-20250101-120000")).unwrap();
        store.create_experiment(&id("exp-20250102-120000")).unwrap();

        let listings = store.list().unwrap();
        assert_eq!(listings.len(), 2);
        let latest: Vec<_> = listings.iter().filter(|l| l.is_latest).collect();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id.as_str(), "exp-20250102-120000");
    }
}
