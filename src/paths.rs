//! Deterministic on-disk layout keyed by the configuration location.
//!
//! Two orchestrators pointing at different configuration files must never
//! share state, so every per-project data root is prefixed with a short
//! digest of the configuration file's directory. A `.origin` marker inside
//! each root records which configuration created it.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;

use crate::error::{FleetError, Result};

/// Length of the hex-encoded configuration hash prefix.
const HASH_LEN: usize = 12;

const ORIGIN_FILE: &str = ".origin";

#[derive(Debug, Clone)]
pub struct FleetPaths {
    data_dir: PathBuf,
    config_dir: PathBuf,
    hash: String,
}

impl FleetPaths {
    pub fn new(config_path: &Path, data_dir: &Path) -> Self {
        let config_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let digest = Sha256::digest(config_dir.to_string_lossy().as_bytes());
        let hash: String = digest
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>()
            .chars()
            .take(HASH_LEN)
            .collect();

        Self {
            data_dir: data_dir.to_path_buf(),
            config_dir,
            hash,
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Globally-unique runtime key for a session, stable across restarts.
    pub fn runtime_key(&self, session_id: &str) -> String {
        format!("{}-{}", self.hash, session_id)
    }

    pub fn project_root(&self, project_id: &str) -> PathBuf {
        self.data_dir.join(format!("{}-{}", self.hash, project_id))
    }

    pub fn sessions_dir(&self, project_id: &str) -> PathBuf {
        self.project_root(project_id).join("sessions")
    }

    pub fn archive_dir(&self, project_id: &str) -> PathBuf {
        self.sessions_dir(project_id).join("archive")
    }

    pub fn events_file(&self, project_id: &str) -> PathBuf {
        self.project_root(project_id).join("events.jsonl")
    }

    pub fn outcomes_file(&self, project_id: &str) -> PathBuf {
        self.project_root(project_id).join("outcomes.jsonl")
    }

    pub fn plans_dir(&self, project_id: &str) -> PathBuf {
        self.project_root(project_id).join("plans")
    }

    pub fn plan_file(&self, project_id: &str, plan_id: &str) -> PathBuf {
        self.plans_dir(project_id).join(format!("{}.json", plan_id))
    }

    /// Drop-box the planning agent writes its task list into.
    pub fn plan_output_file(&self, project_id: &str, plan_id: &str) -> PathBuf {
        self.plans_dir(project_id)
            .join(format!("{}-output.json", plan_id))
    }

    /// Create the per-project directory tree and stamp (or verify) `.origin`.
    ///
    /// The origin marker detects hash collisions between configuration paths:
    /// if the root already exists but was created by a different configuration
    /// directory, refuse to reuse it.
    pub async fn ensure_project_root(&self, project_id: &str) -> Result<PathBuf> {
        let root = self.project_root(project_id);
        fs::create_dir_all(self.archive_dir(project_id)).await?;
        fs::create_dir_all(self.plans_dir(project_id)).await?;

        let origin_path = root.join(ORIGIN_FILE);
        let expected = self.config_dir.to_string_lossy().to_string();

        match fs::read_to_string(&origin_path).await {
            Ok(existing) => {
                let existing = existing.trim();
                if existing != expected {
                    return Err(FleetError::OriginMismatch {
                        path: root,
                        origin: existing.to_string(),
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::write(&origin_path, format!("{}\n", expected)).await?;
                debug!(project_id, root = %root.display(), "Project root initialized");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn hash_is_stable_and_short() {
        let a = FleetPaths::new(Path::new("/etc/fleet/config.yaml"), Path::new("/tmp/d"));
        let b = FleetPaths::new(Path::new("/etc/fleet/other.yaml"), Path::new("/tmp/d"));
        assert_eq!(a.hash(), b.hash(), "hash keys on the directory, not the file");
        assert_eq!(a.hash().len(), HASH_LEN);

        let c = FleetPaths::new(Path::new("/etc/other/config.yaml"), Path::new("/tmp/d"));
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn layout_is_keyed_by_hash_and_project() {
        let paths = FleetPaths::new(Path::new("/etc/fleet/config.yaml"), Path::new("/data"));
        let root = paths.project_root("web");
        assert!(
            root.file_name()
                .unwrap()
                .to_string_lossy()
                .ends_with("-web")
        );
        assert_eq!(paths.events_file("web"), root.join("events.jsonl"));
        assert_eq!(
            paths.plan_output_file("web", "plan-001"),
            root.join("plans/plan-001-output.json")
        );
    }

    #[tokio::test]
    async fn origin_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config_a = dir.path().join("a/config.yaml");
        let config_b = dir.path().join("b/config.yaml");
        let data = dir.path().join("data");

        let a = FleetPaths::new(&config_a, &data);
        a.ensure_project_root("web").await.unwrap();

        // Same root on disk, different configuration directory.
        let mut b = FleetPaths::new(&config_b, &data);
        b.hash = a.hash.clone();
        let err = b.ensure_project_root("web").await.unwrap_err();
        assert!(matches!(err, FleetError::OriginMismatch { .. }));

        // Re-entry from the original configuration is idempotent.
        a.ensure_project_root("web").await.unwrap();
    }
}
