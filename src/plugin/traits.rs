//! Contracts the engine consumes. Implementations live in the host binary
//! and are registered at startup; the core only ever sees these seams.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::types::{
    ActivityState, CiCheck, CiSummary, Issue, IssueRequest, Mergeability, PendingComment, PrSize,
    PrState, PullRequest, Review, ReviewDecision, RuntimeContext, RuntimeHandle,
};
use crate::config::ProjectConfig;
use crate::error::Result;
use crate::session::Session;
use crate::store::FleetEvent;

/// Where agents execute: terminal multiplexer, container, whatever. Handles
/// are opaque and serializable so they survive orchestrator restarts.
///
/// `send_message` is expected to deliver long payloads through a paste-buffer
/// style channel so control characters and quoting survive intact; the core
/// sanitizes input but does not chunk it.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn create(&self, context: &RuntimeContext) -> Result<RuntimeHandle>;
    async fn destroy(&self, handle: &RuntimeHandle) -> Result<()>;
    async fn send_message(&self, handle: &RuntimeHandle, text: &str) -> Result<()>;
    async fn get_output(&self, handle: &RuntimeHandle, line_count: usize) -> Result<String>;
    async fn is_alive(&self, handle: &RuntimeHandle) -> Result<bool>;
}

/// Agent-specific liveness probes. Both methods are required: some agents
/// keep stale output on screen after exit, so the classifier consults
/// `is_process_running` even when `detect_activity` reports activity.
#[async_trait]
pub trait AgentProbe: Send + Sync {
    /// Classify the tail of the terminal output. `None` means "cannot tell";
    /// the classifier never coerces that into a state.
    fn detect_activity(&self, terminal_output: &str) -> Option<ActivityState>;

    async fn is_process_running(&self, handle: &RuntimeHandle) -> Result<bool>;
}

#[async_trait]
pub trait Workspace: Send + Sync {
    async fn create(
        &self,
        session_id: &str,
        branch: &str,
        project: &ProjectConfig,
    ) -> Result<PathBuf>;

    async fn destroy(&self, path: &Path) -> Result<()>;
}

#[async_trait]
pub trait Tracker: Send + Sync {
    async fn get_issue(&self, number: u64, project: &ProjectConfig) -> Result<Issue>;
    async fn create_issue(&self, request: &IssueRequest, project: &ProjectConfig) -> Result<Issue>;
}

#[async_trait]
pub trait Scm: Send + Sync {
    async fn detect_pr(
        &self,
        session: &Session,
        project: &ProjectConfig,
    ) -> Result<Option<PullRequest>>;

    async fn pr_state(&self, pr: &PullRequest) -> Result<PrState>;
    async fn ci_summary(&self, pr: &PullRequest) -> Result<CiSummary>;
    async fn ci_checks(&self, pr: &PullRequest) -> Result<Vec<CiCheck>>;
    async fn review_decision(&self, pr: &PullRequest) -> Result<ReviewDecision>;
    async fn reviews(&self, pr: &PullRequest) -> Result<Vec<Review>>;
    async fn pending_comments(&self, pr: &PullRequest) -> Result<Vec<PendingComment>>;
    async fn mergeability(&self, pr: &PullRequest) -> Result<Mergeability>;
    async fn list_open_prs(&self, project: &ProjectConfig) -> Result<Vec<PullRequest>>;
    async fn pr_summary(&self, pr: &PullRequest) -> Result<PrSize>;
}

/// Notification transport. Failures are swallowed per-notifier by the
/// routing layer; a broken webhook must never stall the poll cycle.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &FleetEvent) -> Result<()>;
}

/// External reconciliation workflow, reached through the
/// `spawn-reconciliation` reaction. The core only delegates.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn spawn_reconciliation(&self, project_id: &str, plan_id: Option<&str>) -> Result<()>;
}
