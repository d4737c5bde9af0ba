//! Session lifecycle over composed plugins.
//!
//! The manager owns identity issuance and metadata persistence; everything
//! that touches an agent goes through the plugin registry. Spawn is
//! all-or-nothing: any failure after id reservation rolls back the workspace
//! and releases the id by archiving the reserved skeleton.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{FleetConfig, ProjectConfig};
use crate::error::{FleetError, Result, action_err};
use crate::paths::FleetPaths;
use crate::plugin::types::{Issue, RuntimeContext};
use crate::plugin::PluginRegistry;
use crate::store::{EventStore, EventType, FleetEvent, MetadataStore};

use super::{Session, SessionStatus};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub project: String,
    /// Built by the caller (prompt generation is external); the manager only
    /// appends `prompt_sections`.
    pub prompt: String,
    pub issue: Option<u64>,
    pub branch: Option<String>,
    pub plan_id: Option<String>,
    pub summary: Option<String>,
    /// Extra sections (lessons bundle, sibling context) appended verbatim.
    pub prompt_sections: Vec<String>,
}

impl SpawnRequest {
    pub fn new(project: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            prompt: prompt.into(),
            issue: None,
            branch: None,
            plan_id: None,
            summary: None,
            prompt_sections: Vec::new(),
        }
    }

    pub fn with_issue(mut self, number: u64) -> Self {
        self.issue = Some(number);
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.prompt_sections.push(section.into());
        self
    }
}

pub struct SessionManager {
    config: Arc<FleetConfig>,
    paths: FleetPaths,
    registry: Arc<PluginRegistry>,
}

impl SessionManager {
    pub fn new(config: Arc<FleetConfig>, paths: FleetPaths, registry: Arc<PluginRegistry>) -> Self {
        Self {
            config,
            paths,
            registry,
        }
    }

    pub fn paths(&self) -> &FleetPaths {
        &self.paths
    }

    fn store(&self, project_id: &str) -> MetadataStore {
        MetadataStore::new(self.paths.sessions_dir(project_id))
    }

    async fn record_event(&self, project_id: &str, event: FleetEvent) {
        let events =
            EventStore::with_max_events(self.paths.events_file(project_id), self.config.max_events);
        if let Err(e) = events.append(&event).await {
            warn!(project_id, error = %e, "Failed to append session event");
        }
    }

    pub async fn spawn(&self, request: SpawnRequest) -> Result<Session> {
        let project = self.config.project(&request.project)?.clone();
        let project_id = request.project.clone();

        let runtime_name = project.runtime_plugin(&self.config.defaults).to_string();
        let runtime = self.registry.require_runtime(&runtime_name)?;
        let workspace_name = project.workspace_plugin(&self.config.defaults).to_string();
        let workspace = self.registry.require_workspace(&workspace_name)?;

        self.paths.ensure_project_root(&project_id).await?;

        let issue = match request.issue {
            Some(number) => Some(self.resolve_issue(number, &project).await?),
            None => None,
        };

        let store = self.store(&project_id);
        let id = store.reserve_id(&project.session_prefix).await?;
        let runtime_key = self.paths.runtime_key(&id);

        // Branch precedence: explicit > tracker-derived > ad-hoc.
        let branch = request
            .branch
            .clone()
            .or_else(|| {
                issue
                    .as_ref()
                    .map(|i| format!("issue-{}-{}", i.number, slug(&i.title)))
            })
            .unwrap_or_else(|| format!("session/{}", id));

        let worktree = match workspace.create(&id, &branch, &project).await {
            Ok(path) => path,
            Err(e) => {
                let _ = store.archive(&id).await;
                return Err(FleetError::WorkspaceCreateFailed(e.to_string()));
            }
        };

        let mut prompt = request.prompt.clone();
        for section in &request.prompt_sections {
            prompt.push_str("\n\n");
            prompt.push_str(section);
        }

        let context = RuntimeContext {
            key: runtime_key.clone(),
            workdir: worktree.clone(),
            prompt,
        };
        let handle = match runtime.create(&context).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = workspace.destroy(&worktree).await;
                let _ = store.archive(&id).await;
                return Err(FleetError::RuntimeCreateFailed(e.to_string()));
            }
        };

        let mut session = Session::new(&id, &project_id, &branch);
        session.worktree = Some(worktree.clone());
        session.issue = issue.as_ref().map(|i| i.url.clone());
        session.summary = request
            .summary
            .clone()
            .or_else(|| issue.as_ref().map(|i| i.title.clone()));
        session.agent = Some(project.agent_plugin(&self.config.defaults).to_string());
        session.runtime_key = Some(runtime_key);
        session.runtime_handle = Some(handle.clone());
        session.plan_id = request.plan_id.clone();

        if let Err(e) = store.write(&session).await {
            let _ = runtime.destroy(&handle).await;
            let _ = workspace.destroy(&worktree).await;
            let _ = store.archive(&id).await;
            return Err(e);
        }

        info!(
            session_id = %session.id,
            project = %project_id,
            branch = %session.branch,
            "Session spawned"
        );
        self.record_event(
            &project_id,
            FleetEvent::new(
                EventType::SessionSpawned,
                &session.id,
                &project_id,
                format!(
                    "{} spawned on `{}` ({})",
                    session.id,
                    session.branch,
                    session.summary.as_deref().unwrap_or("ad-hoc")
                ),
            ),
        )
        .await;
        Ok(session)
    }

    async fn resolve_issue(&self, number: u64, project: &ProjectConfig) -> Result<Issue> {
        let tracker_name = project
            .tracker
            .as_deref()
            .ok_or_else(|| FleetError::IssueUnreachable(format!("issue #{}: no tracker configured", number)))?;
        let tracker = self
            .registry
            .tracker(tracker_name)
            .ok_or_else(|| FleetError::IssueUnreachable(format!("issue #{}: tracker '{}' not registered", number, tracker_name)))?;
        tracker
            .get_issue(number, project)
            .await
            .map_err(|e| FleetError::IssueUnreachable(format!("issue #{}: {}", number, e)))
    }

    /// Send text to a session's agent, sanitized and bounded by a timeout.
    /// Runtimes deliver long payloads via their paste-buffer channel.
    pub async fn send(&self, project_id: &str, session_id: &str, text: &str) -> Result<()> {
        let session = self.get(project_id, session_id).await?;
        let handle = session.runtime_handle.as_ref().ok_or_else(|| {
            FleetError::Other(format!("session {} has no runtime handle", session_id))
        })?;

        let project = self.config.project(project_id)?;
        let runtime = self
            .registry
            .require_runtime(project.runtime_plugin(&self.config.defaults))?;

        let clean = sanitize(text);
        match timeout(SEND_TIMEOUT, runtime.send_message(handle, &clean)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(action_err(&format!("send to {}", session_id), e)),
            Err(_) => Err(FleetError::SendTimeout {
                session_id: session_id.to_string(),
                timeout_secs: SEND_TIMEOUT.as_secs(),
            }),
        }
    }

    /// Destroy runtime and workspace, then archive the metadata record under
    /// its original id. Plugin failures are logged, not fatal: a session must
    /// always be killable.
    pub async fn kill(&self, project_id: &str, session_id: &str) -> Result<()> {
        let store = self.store(project_id);
        let mut session = store.read(session_id).await?;
        let project = self.config.project(project_id)?;

        if let Some(handle) = &session.runtime_handle
            && let Some(runtime) = self
                .registry
                .runtime(project.runtime_plugin(&self.config.defaults))
            && let Err(e) = runtime.destroy(handle).await
        {
            warn!(session_id, error = %e, "Runtime destroy failed during kill");
        }

        if let Some(worktree) = &session.worktree
            && let Some(workspace) = self
                .registry
                .workspace(project.workspace_plugin(&self.config.defaults))
            && let Err(e) = workspace.destroy(worktree).await
        {
            warn!(session_id, error = %e, "Workspace destroy failed during kill");
        }

        session.status = SessionStatus::Killed;
        store.write(&session).await?;
        store.archive(session_id).await?;
        info!(session_id, project = project_id, "Session killed");
        Ok(())
    }

    /// Re-create a runtime on the existing workspace from the persisted
    /// handle. The session re-enters `spawning` and the next poll cycle
    /// re-classifies it.
    pub async fn restore(&self, project_id: &str, session_id: &str) -> Result<Session> {
        let store = self.store(project_id);
        let mut session = store.read(session_id).await?;

        let old_handle = session.runtime_handle.clone().ok_or_else(|| {
            FleetError::RuntimeCreateFailed(format!("session {} has no persisted handle", session_id))
        })?;
        let worktree = session.worktree.clone().ok_or_else(|| {
            FleetError::WorkspaceCreateFailed(format!("session {} has no workspace", session_id))
        })?;

        let runtime = self.registry.require_runtime(&old_handle.runtime_name)?;
        let context = RuntimeContext {
            key: session
                .runtime_key
                .clone()
                .unwrap_or_else(|| self.paths.runtime_key(session_id)),
            workdir: worktree,
            prompt: String::new(),
        };
        let handle = runtime
            .create(&context)
            .await
            .map_err(|e| FleetError::RuntimeCreateFailed(e.to_string()))?;

        session.runtime_handle = Some(handle);
        session.status = SessionStatus::Spawning;
        store.write(&session).await?;
        info!(session_id, project = project_id, "Session restored");
        self.record_event(
            project_id,
            FleetEvent::new(
                EventType::SessionRestored,
                session_id,
                project_id,
                format!("{} restored on `{}`", session_id, session.branch),
            ),
        )
        .await;
        Ok(session)
    }

    pub async fn get(&self, project_id: &str, session_id: &str) -> Result<Session> {
        self.store(project_id).read(session_id).await
    }

    /// Locate a session by id across all configured projects.
    pub async fn find(&self, session_id: &str) -> Result<Option<Session>> {
        for project_id in self.config.projects.keys() {
            match self.store(project_id).read(session_id).await {
                Ok(session) => return Ok(Some(session)),
                Err(FleetError::SessionNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// All sessions for a project. Sessions whose runtime no longer reports
    /// alive are marked `killed` in the metadata file (idempotent); the
    /// *returned* status is the one persisted before this call, so callers
    /// tracking transitions still observe the change.
    pub async fn list(&self, project_id: &str) -> Result<Vec<Session>> {
        let store = self.store(project_id);
        let sessions = store.list().await?;
        let project = self.config.project(project_id)?;
        let runtime = self
            .registry
            .runtime(project.runtime_plugin(&self.config.defaults));

        let Some(runtime) = runtime else {
            return Ok(sessions);
        };

        for session in &sessions {
            if session.status.is_terminal() {
                continue;
            }
            let Some(handle) = &session.runtime_handle else {
                continue;
            };
            if let Ok(false) = runtime.is_alive(handle).await {
                let mut dead = session.clone();
                dead.status = SessionStatus::Killed;
                if let Err(e) = store.write(&dead).await {
                    warn!(session_id = %session.id, error = %e, "Failed to mark dead session killed");
                } else {
                    debug!(session_id = %session.id, "Marked dead session killed");
                }
            }
        }
        Ok(sessions)
    }

    /// Persist a status change without touching other fields on disk.
    pub async fn update_status(
        &self,
        project_id: &str,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<Session> {
        let store = self.store(project_id);
        let mut session = store.read(session_id).await?;
        session.status = status;
        session.last_activity_at = Some(chrono::Utc::now());
        store.write(&session).await?;
        Ok(session)
    }

    pub async fn persist(&self, session: &Session) -> Result<()> {
        self.store(&session.project).write(session).await
    }

    /// Non-terminal sessions belonging to a plan, excluding one id.
    pub async fn active_plan_siblings(
        &self,
        project_id: &str,
        plan_id: &str,
        exclude: &str,
    ) -> Result<Vec<Session>> {
        let sessions = self.store(project_id).list().await?;
        Ok(sessions
            .into_iter()
            .filter(|s| {
                s.plan_id.as_deref() == Some(plan_id)
                    && s.id != exclude
                    && !s.status.is_terminal()
            })
            .collect())
    }
}

/// Strip control characters that could alter runtime delivery. Newlines and
/// tabs are content; everything else below 0x20 is not.
fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

fn slug(title: &str) -> String {
    let mut out = String::new();
    for c in title.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let out = out.trim_end_matches('-').to_string();
    out.chars().take(40).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_control_characters() {
        assert_eq!(sanitize("fix\x1b[31m this\x07"), "fix[31m this");
        assert_eq!(sanitize("line one\nline two\ttabbed"), "line one\nline two\ttabbed");
    }

    #[test]
    fn slug_is_branch_safe() {
        assert_eq!(slug("Fix: login fails on Safari!"), "fix-login-fails-on-safari");
        assert_eq!(slug("  weird   spacing  "), "weird-spacing");
        let long = slug(&"x".repeat(100));
        assert_eq!(long.len(), 40);
    }
}
