use crate::error::{FinancialReportError, Result};
use crate::workflow::Stage;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = FinancialReportError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(RunId)
            .map_err(|e| FinancialReportError::Config(format!("invalid run id '{}': {}", s, e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Database,
    ChartSet,
    Report,
}

/// Handle to a file produced by a stage. Valid while the run's lease is held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub label: String,
    pub storage_location: PathBuf,
    pub created_at: DateTime<Utc>,
    pub producing_stage: Stage,
    pub size_bytes: u64,
}

impl Artifact {
    pub fn file_name(&self) -> String {
        self.storage_location
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.label.clone())
    }
}

/// Lays out artifacts as `<root>/<run_id>/<stage>/`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    pub fn stage_dir(&self, run_id: RunId, stage: Stage) -> PathBuf {
        self.run_dir(run_id).join(stage.name())
    }

    /// Opens a clean stage directory. Anything left by an earlier attempt is removed.
    pub async fn open_stage(&self, run_id: RunId, stage: Stage) -> Result<StageWorkspace> {
        let dir = self.stage_dir(run_id, stage);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("Cleared previous output of {} for run {}", stage, run_id),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(FinancialReportError::artifact(&dir, e)),
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| FinancialReportError::artifact(&dir, e))?;

        Ok(StageWorkspace {
            dir,
            stage,
            artifacts: Vec::new(),
            committed: false,
        })
    }

    pub fn lease(&self, run_id: RunId) -> RunLease {
        RunLease {
            dir: self.run_dir(run_id),
            retained: false,
        }
    }
}

/// Write guard for one stage's directory. Dropping it uncommitted deletes the directory.
#[derive(Debug)]
pub struct StageWorkspace {
    dir: PathBuf,
    stage: Stage,
    artifacts: Vec<Artifact>,
    committed: bool,
}

impl StageWorkspace {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn write(
        &mut self,
        kind: ArtifactKind,
        label: impl Into<String>,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<Artifact> {
        let path = self.dir.join(file_name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| FinancialReportError::artifact(&path, e))?;

        let artifact = Artifact {
            kind,
            label: label.into(),
            storage_location: path,
            created_at: Utc::now(),
            producing_stage: self.stage,
            size_bytes: bytes.len() as u64,
        };
        self.artifacts.push(artifact.clone());
        Ok(artifact)
    }

    pub fn commit(mut self) -> Vec<Artifact> {
        self.committed = true;
        std::mem::take(&mut self.artifacts)
    }
}

impl Drop for StageWorkspace {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("Discarded uncommitted output of {}", self.stage),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to discard {}: {}", self.dir.display(), e),
        }
    }
}

/// Ownership of a run's artifact directory.
///
/// The directory is deleted on [`RunLease::release`] or on drop, unless
/// [`RunLease::retain`] handed it over to the caller.
#[derive(Debug)]
pub struct RunLease {
    dir: PathBuf,
    retained: bool,
}

impl RunLease {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn release(mut self) -> Result<()> {
        self.retained = true;
        remove_run_dir(&self.dir)
    }

    /// Keeps the artifacts on disk and returns their directory.
    pub fn retain(mut self) -> PathBuf {
        self.retained = true;
        std::mem::take(&mut self.dir)
    }
}

fn remove_run_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {
            debug!("Released artifacts at {}", dir.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FinancialReportError::artifact(dir, e)),
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if self.retained {
            return;
        }
        if let Err(e) = remove_run_dir(&self.dir) {
            warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uncommitted_workspace_is_removed() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let run_id = RunId::new();

        let mut workspace = store.open_stage(run_id, Stage::Reporting).await.unwrap();
        workspace
            .write(ArtifactKind::Report, "report", "report.md", b"# draft")
            .await
            .unwrap();
        let dir = workspace.dir().to_path_buf();
        assert!(dir.join("report.md").exists());

        drop(workspace);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_reopening_a_stage_overwrites() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());
        let run_id = RunId::new();

        let mut first = store.open_stage(run_id, Stage::Database).await.unwrap();
        first
            .write(ArtifactKind::Database, "old", "old.json", b"{}")
            .await
            .unwrap();
        let committed = first.commit();
        assert_eq!(committed[0].size_bytes, 2);
        assert_eq!(committed[0].producing_stage, Stage::Database);

        let second = store.open_stage(run_id, Stage::Database).await.unwrap();
        assert!(!second.dir().join("old.json").exists());
        second.commit();
        assert_eq!(
            store.stage_dir(run_id, Stage::Database),
            root.path().join(run_id.to_string()).join("database")
        );
    }

    #[tokio::test]
    async fn test_lease_release_and_retain() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(root.path());

        let released = RunId::new();
        store.open_stage(released, Stage::Database).await.unwrap().commit();
        store.lease(released).release().unwrap();
        assert!(!store.run_dir(released).exists());

        let dropped = RunId::new();
        store.open_stage(dropped, Stage::Database).await.unwrap().commit();
        drop(store.lease(dropped));
        assert!(!store.run_dir(dropped).exists());

        let kept = RunId::new();
        store.open_stage(kept, Stage::Database).await.unwrap().commit();
        let path = store.lease(kept).retain();
        assert!(path.exists());
    }

    #[test]
    fn test_run_id_round_trip() {
        let id = RunId::new();
        assert_eq!(id.to_string().parse::<RunId>().unwrap(), id);
        assert!("not-a-uuid".parse::<RunId>().is_err());
    }
}
