//! Flat `key=value` session metadata records.
//!
//! One file per session under `sessions/`, updated with write-temp + rename
//! so readers never observe a torn record. Unknown keys round-trip untouched;
//! this keeps the format forward-compatible across orchestrator versions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{FleetError, Result};
use crate::plugin::types::RuntimeHandle;
use crate::session::{Session, SessionStatus};

/// Attempts before `reserve_id` gives up on a prefix.
const MAX_ID_ATTEMPTS: u32 = 20;

const ARCHIVE_DIR: &str = "archive";

fn key_is_valid(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

pub struct MetadataStore {
    sessions_dir: PathBuf,
}

impl MetadataStore {
    pub fn new(sessions_dir: impl AsRef<Path>) -> Self {
        Self {
            sessions_dir: sessions_dir.as_ref().to_path_buf(),
        }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(session_id)
    }

    fn archive_dir(&self) -> PathBuf {
        self.sessions_dir.join(ARCHIVE_DIR)
    }

    /// Reserve the next `{prefix}-{n}` id. The exclusive create is the only
    /// serialization point: two concurrent spawns race on `create_new` and the
    /// loser retries with the next ordinal.
    pub async fn reserve_id(&self, prefix: &str) -> Result<String> {
        fs::create_dir_all(&self.sessions_dir).await?;

        let mut next = self.max_ordinal(prefix).await? + 1;
        for attempt in 0..MAX_ID_ATTEMPTS {
            let id = format!("{}-{}", prefix, next);
            let path = self.session_path(&id);
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    debug!(id, attempt, "Session id reserved");
                    return Ok(id);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    next += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(FleetError::IdCollision {
            prefix: prefix.to_string(),
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    async fn max_ordinal(&self, prefix: &str) -> Result<u64> {
        let mut max = 0u64;
        let mut entries = match fs::read_dir(&self.sessions_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix(prefix)
                && let Some(ordinal) = rest.strip_prefix('-')
                && let Ok(n) = ordinal.parse::<u64>()
            {
                max = max.max(n);
            }
        }
        Ok(max)
    }

    pub async fn write(&self, session: &Session) -> Result<()> {
        fs::create_dir_all(&self.sessions_dir).await?;
        let path = self.session_path(&session.id);
        let content = serialize_session(session)?;

        let tmp = self.sessions_dir.join(format!(".{}.tmp", session.id));
        fs::write(&tmp, &content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn read(&self, session_id: &str) -> Result<Session> {
        let path = self.session_path(session_id);
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FleetError::SessionNotFound(session_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        parse_session(session_id, &path, &content)
    }

    pub async fn exists(&self, session_id: &str) -> bool {
        fs::metadata(self.session_path(session_id)).await.is_ok()
    }

    /// All sessions, unordered. Freshly-reserved (still empty) records and
    /// unparseable files are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        let mut entries = match fs::read_dir(&self.sessions_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let id = name.to_string_lossy();
            if id.starts_with('.') {
                continue;
            }
            let content = match fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Skipping unreadable session record");
                    continue;
                }
            };
            if content.trim().is_empty() {
                // Reserved id whose spawn has not persisted metadata yet.
                continue;
            }
            match parse_session(&id, &path, &content) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Skipping malformed session record");
                }
            }
        }
        Ok(sessions)
    }

    /// Move the record to `sessions/archive/<id>_<unix-ts>`, preserving the
    /// original id in the filename.
    pub async fn archive(&self, session_id: &str) -> Result<()> {
        let path = self.session_path(session_id);
        if fs::metadata(&path).await.is_err() {
            return Ok(());
        }
        let archive_dir = self.archive_dir();
        fs::create_dir_all(&archive_dir).await?;
        let target = archive_dir.join(format!("{}_{}", session_id, Utc::now().timestamp()));
        fs::rename(&path, &target).await?;
        debug!(session_id, target = %target.display(), "Session archived");
        Ok(())
    }
}

fn serialize_session(session: &Session) -> Result<String> {
    let mut lines: Vec<(String, String)> = Vec::new();
    let mut push = |key: &str, value: String| {
        lines.push((key.to_string(), value));
    };

    push("project", session.project.clone());
    push("status", session.status.as_str().to_string());
    push("branch", session.branch.clone());
    push("createdAt", session.created_at.to_rfc3339());
    if let Some(worktree) = &session.worktree {
        push("worktree", worktree.to_string_lossy().to_string());
    }
    if let Some(issue) = &session.issue {
        push("issue", issue.clone());
    }
    if let Some(pr) = &session.pr {
        push("pr", pr.clone());
    }
    if let Some(summary) = &session.summary {
        push("summary", summary.clone());
    }
    if let Some(agent) = &session.agent {
        push("agent", agent.clone());
    }
    if let Some(key) = &session.runtime_key {
        push("tmuxName", key.clone());
    }
    if let Some(handle) = &session.runtime_handle {
        push("runtimeHandle", serde_json::to_string(handle)?);
    }
    if let Some(plan_id) = &session.plan_id {
        push("planId", plan_id.clone());
    }
    if let Some(at) = &session.last_activity_at {
        push("lastActivityAt", at.to_rfc3339());
    }
    for (key, value) in &session.metadata {
        if key_is_valid(key) {
            push(key, value.clone());
        } else {
            warn!(key, "Dropping metadata key with invalid characters");
        }
    }

    let mut out = String::new();
    for (key, value) in lines {
        // Values are opaque but must stay on one line.
        let value = value.replace('\n', " ");
        out.push_str(&key);
        out.push('=');
        out.push_str(&value);
        out.push('\n');
    }
    Ok(out)
}

fn parse_session(id: &str, path: &Path, content: &str) -> Result<Session> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) if key_is_valid(key) => {
                map.insert(key.to_string(), value.to_string());
            }
            _ => {
                warn!(session_id = id, line, "Skipping malformed metadata line");
            }
        }
    }

    let status = map
        .remove("status")
        .and_then(|s| SessionStatus::from_str(&s).ok())
        .ok_or_else(|| FleetError::MetadataParse {
            path: path.to_path_buf(),
            message: "missing or invalid status".to_string(),
        })?;
    let project = map
        .remove("project")
        .ok_or_else(|| FleetError::MetadataParse {
            path: path.to_path_buf(),
            message: "missing project".to_string(),
        })?;

    let runtime_handle = match map.remove("runtimeHandle") {
        Some(raw) => match serde_json::from_str::<RuntimeHandle>(&raw) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(session_id = id, error = %e, "Discarding unreadable runtime handle");
                None
            }
        },
        None => None,
    };

    Ok(Session {
        id: id.to_string(),
        project,
        status,
        branch: map.remove("branch").unwrap_or_default(),
        worktree: map.remove("worktree").map(PathBuf::from),
        issue: map.remove("issue"),
        pr: map.remove("pr"),
        summary: map.remove("summary"),
        agent: map.remove("agent"),
        runtime_key: map.remove("tmuxName"),
        runtime_handle,
        plan_id: map.remove("planId"),
        created_at: map
            .remove("createdAt")
            .and_then(|v| v.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now),
        last_activity_at: map
            .remove("lastActivityAt")
            .and_then(|v| v.parse::<DateTime<Utc>>().ok()),
        activity: None,
        metadata: map,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> MetadataStore {
        MetadataStore::new(dir.path().join("sessions"))
    }

    #[tokio::test]
    async fn reserve_id_is_sequential() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert_eq!(store.reserve_id("web").await.unwrap(), "web-1");
        assert_eq!(store.reserve_id("web").await.unwrap(), "web-2");
        assert_eq!(store.reserve_id("api").await.unwrap(), "api-1");
    }

    #[tokio::test]
    async fn reserve_id_survives_concurrent_spawns() {
        let dir = TempDir::new().unwrap();
        let sessions_dir = dir.path().join("sessions");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sessions_dir = sessions_dir.clone();
                tokio::spawn(async move {
                    MetadataStore::new(sessions_dir).reserve_id("web").await
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8, "every spawn got a distinct id");
    }

    #[tokio::test]
    async fn write_read_round_trip_preserves_unknown_keys() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut session = Session::new("web-1", "web", "feat/login");
        session.pr = Some("https://example.com/pull/7".to_string());
        session.runtime_handle = Some(RuntimeHandle {
            id: "tmux:fleet-web-1".to_string(),
            runtime_name: "tmux".to_string(),
            data: serde_json::json!({"window": 3}),
        });
        session
            .metadata
            .insert("futureKey".to_string(), "opaque value".to_string());
        session.set_reaction_tracker("ci-failed", 2, Utc::now());
        store.write(&session).await.unwrap();

        let loaded = store.read("web-1").await.unwrap();
        assert_eq!(loaded.project, "web");
        assert_eq!(loaded.status, SessionStatus::Spawning);
        assert_eq!(loaded.pr.as_deref(), Some("https://example.com/pull/7"));
        assert_eq!(loaded.metadata.get("futureKey").unwrap(), "opaque value");
        assert_eq!(loaded.reaction_attempts("ci-failed"), 2);
        let handle = loaded.runtime_handle.unwrap();
        assert_eq!(handle.runtime_name, "tmux");
        assert_eq!(handle.data["window"], 3);

        // Rewriting must not lose the unknown key.
        let mut again = store.read("web-1").await.unwrap();
        again.status = SessionStatus::Working;
        store.write(&again).await.unwrap();
        let reloaded = store.read("web-1").await.unwrap();
        assert_eq!(reloaded.metadata.get("futureKey").unwrap(), "opaque value");
    }

    #[tokio::test]
    async fn archive_preserves_id_and_removes_record() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let session = Session::new("web-1", "web", "feat/x");
        store.write(&session).await.unwrap();
        store.archive("web-1").await.unwrap();

        assert!(matches!(
            store.read("web-1").await.unwrap_err(),
            FleetError::SessionNotFound(_)
        ));

        let mut archived = tokio::fs::read_dir(dir.path().join("sessions/archive"))
            .await
            .unwrap();
        let entry = archived.next_entry().await.unwrap().unwrap();
        assert!(entry.file_name().to_string_lossy().starts_with("web-1_"));

        // Archiving twice is a no-op.
        store.archive("web-1").await.unwrap();
    }

    #[tokio::test]
    async fn list_skips_reserved_and_malformed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.write(&Session::new("web-1", "web", "a")).await.unwrap();
        store.reserve_id("web").await.unwrap(); // web-2, still empty
        tokio::fs::write(dir.path().join("sessions/web-3"), "status=nonsense\n")
            .await
            .unwrap();

        let sessions = store.list().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "web-1");
    }
}
