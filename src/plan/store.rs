use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use super::Plan;
use crate::error::{FleetError, Result};

/// JSON plan records under `plans/`. Writes are temp + rename; interrupted
/// writes from a crashed process are swept on init.
pub struct PlanStore {
    plans_dir: PathBuf,
}

impl PlanStore {
    pub fn new(plans_dir: impl AsRef<Path>) -> Self {
        Self {
            plans_dir: plans_dir.as_ref().to_path_buf(),
        }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.plans_dir).await?;
        self.recover_interrupted_writes().await;
        Ok(())
    }

    async fn recover_interrupted_writes(&self) {
        if let Ok(mut entries) = fs::read_dir(&self.plans_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    debug!(path = %path.display(), "Removing interrupted write");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
    }

    fn plan_path(&self, plan_id: &str) -> PathBuf {
        self.plans_dir.join(format!("{}.json", plan_id))
    }

    pub async fn save(&self, plan: &Plan) -> Result<()> {
        fs::create_dir_all(&self.plans_dir).await?;
        let path = self.plan_path(&plan.id);
        let content = serde_json::to_string_pretty(plan)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load(&self, plan_id: &str) -> Result<Plan> {
        let path = self.plan_path(plan_id);
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FleetError::PlanNotFound(plan_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    pub async fn list(&self) -> Result<Vec<Plan>> {
        let mut plans = Vec::new();
        let mut entries = match fs::read_dir(&self.plans_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(plans),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") || name.ends_with("-output.json") {
                continue;
            }
            if let Ok(content) = fs::read_to_string(&path).await
                && let Ok(plan) = serde_json::from_str::<Plan>(&content)
            {
                plans.push(plan);
            }
        }

        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(plans)
    }

    /// Next sequential id, `plan-001` style.
    pub async fn next_id(&self) -> Result<String> {
        let plans = self.list().await?;
        let max_num = plans
            .iter()
            .filter_map(|p| p.id.strip_prefix("plan-").and_then(|s| s.parse::<u32>().ok()))
            .max()
            .unwrap_or(0);
        Ok(format!("plan-{:03}", max_num + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::new(dir.path().join("plans"));
        store.init().await.unwrap();

        let plan = Plan::new("plan-001", "web", "Add OAuth login");
        store.save(&plan).await.unwrap();

        let loaded = store.load("plan-001").await.unwrap();
        assert_eq!(loaded.id, plan.id);
        assert_eq!(loaded.project, "web");
        assert_eq!(loaded.status, plan.status);
        assert_eq!(loaded.feature, "Add OAuth login");
    }

    #[tokio::test]
    async fn missing_plan_is_typed() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::new(dir.path().join("plans"));
        assert!(matches!(
            store.load("plan-404").await.unwrap_err(),
            FleetError::PlanNotFound(_)
        ));
    }

    #[tokio::test]
    async fn next_id_is_sequential_and_ignores_output_files() {
        let dir = TempDir::new().unwrap();
        let plans_dir = dir.path().join("plans");
        let store = PlanStore::new(&plans_dir);
        store.init().await.unwrap();

        assert_eq!(store.next_id().await.unwrap(), "plan-001");
        store.save(&Plan::new("plan-001", "web", "x")).await.unwrap();
        tokio::fs::write(plans_dir.join("plan-001-output.json"), "{}")
            .await
            .unwrap();
        assert_eq!(store.next_id().await.unwrap(), "plan-002");
    }

    #[tokio::test]
    async fn init_sweeps_interrupted_writes() {
        let dir = TempDir::new().unwrap();
        let plans_dir = dir.path().join("plans");
        tokio::fs::create_dir_all(&plans_dir).await.unwrap();
        tokio::fs::write(plans_dir.join("plan-001.json.tmp"), "partial")
            .await
            .unwrap();

        let store = PlanStore::new(&plans_dir);
        store.init().await.unwrap();
        assert!(!plans_dir.join("plan-001.json.tmp").exists());
    }
}
