//! Append-only JSONL event log with lazy pruning.
//!
//! File order is append order and is the source of truth for per-session
//! timelines. Readers tolerate malformed lines (dropped silently) so a
//! partially-written tail never poisons history.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

pub const DEFAULT_MAX_EVENTS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Urgent,
    Action,
    Warning,
    Info,
}

impl EventPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::Action => "action",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

/// Closed set of event types. The dotted string form is the on-disk contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "session.spawned")]
    SessionSpawned,
    #[serde(rename = "session.restored")]
    SessionRestored,
    #[serde(rename = "session.working")]
    SessionWorking,
    #[serde(rename = "session.needs_input")]
    SessionNeedsInput,
    #[serde(rename = "session.stuck")]
    SessionStuck,
    #[serde(rename = "session.errored")]
    SessionErrored,
    #[serde(rename = "session.killed")]
    SessionKilled,
    #[serde(rename = "session.done")]
    SessionDone,
    #[serde(rename = "session.rebase_sent")]
    SessionRebaseSent,
    #[serde(rename = "pr.created")]
    PrCreated,
    #[serde(rename = "pr.review_pending")]
    PrReviewPending,
    #[serde(rename = "pr.approved")]
    PrApproved,
    #[serde(rename = "pr.mergeable")]
    PrMergeable,
    #[serde(rename = "pr.merged")]
    PrMerged,
    #[serde(rename = "ci.failing")]
    CiFailing,
    #[serde(rename = "ci.passing")]
    CiPassing,
    #[serde(rename = "ci.fix_sent")]
    CiFixSent,
    #[serde(rename = "ci.fix_failed")]
    CiFixFailed,
    #[serde(rename = "review.changes_requested")]
    ReviewChangesRequested,
    #[serde(rename = "review.feedback_sent")]
    ReviewFeedbackSent,
    #[serde(rename = "reaction.triggered")]
    ReactionTriggered,
    #[serde(rename = "reaction.escalated")]
    ReactionEscalated,
    #[serde(rename = "plan.created")]
    PlanCreated,
    #[serde(rename = "plan.ready")]
    PlanReady,
    #[serde(rename = "plan.failed")]
    PlanFailed,
    #[serde(rename = "plan.approved")]
    PlanApproved,
    #[serde(rename = "plan.executing")]
    PlanExecuting,
    #[serde(rename = "plan.complete")]
    PlanComplete,
    #[serde(rename = "plan.task_spawned")]
    PlanTaskSpawned,
    #[serde(rename = "outcome.recorded")]
    OutcomeRecorded,
    #[serde(rename = "retrospective.spawned")]
    RetrospectiveSpawned,
    #[serde(rename = "summary.all_complete")]
    SummaryAllComplete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionSpawned => "session.spawned",
            Self::SessionRestored => "session.restored",
            Self::SessionWorking => "session.working",
            Self::SessionNeedsInput => "session.needs_input",
            Self::SessionStuck => "session.stuck",
            Self::SessionErrored => "session.errored",
            Self::SessionKilled => "session.killed",
            Self::SessionDone => "session.done",
            Self::SessionRebaseSent => "session.rebase_sent",
            Self::PrCreated => "pr.created",
            Self::PrReviewPending => "pr.review_pending",
            Self::PrApproved => "pr.approved",
            Self::PrMergeable => "pr.mergeable",
            Self::PrMerged => "pr.merged",
            Self::CiFailing => "ci.failing",
            Self::CiPassing => "ci.passing",
            Self::CiFixSent => "ci.fix_sent",
            Self::CiFixFailed => "ci.fix_failed",
            Self::ReviewChangesRequested => "review.changes_requested",
            Self::ReviewFeedbackSent => "review.feedback_sent",
            Self::ReactionTriggered => "reaction.triggered",
            Self::ReactionEscalated => "reaction.escalated",
            Self::PlanCreated => "plan.created",
            Self::PlanReady => "plan.ready",
            Self::PlanFailed => "plan.failed",
            Self::PlanApproved => "plan.approved",
            Self::PlanExecuting => "plan.executing",
            Self::PlanComplete => "plan.complete",
            Self::PlanTaskSpawned => "plan.task_spawned",
            Self::OutcomeRecorded => "outcome.recorded",
            Self::RetrospectiveSpawned => "retrospective.spawned",
            Self::SummaryAllComplete => "summary.all_complete",
        }
    }

    /// Priority inferred from the type name. Keyword rules, in order:
    /// urgent, action, warning; `summary.*` and everything else are info.
    pub fn priority(&self) -> EventPriority {
        let name = self.as_str();
        if ["stuck", "needs_input", "errored"]
            .iter()
            .any(|k| name.contains(k))
        {
            return EventPriority::Urgent;
        }
        if ["approved", "ready", "merged", "completed"]
            .iter()
            .any(|k| name.contains(k))
        {
            return EventPriority::Action;
        }
        if ["fail", "changes_requested", "conflicts"]
            .iter()
            .any(|k| name.contains(k))
        {
            return EventPriority::Warning;
        }
        EventPriority::Info
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown event type: {}", s))
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub priority: EventPriority,
    pub session_id: String,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl FleetEvent {
    pub fn new(
        event_type: EventType,
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            priority: event_type.priority(),
            session_id: session_id.into(),
            project_id: project_id.into(),
            timestamp: Utc::now(),
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub project_id: Option<String>,
    pub types: Option<Vec<EventType>>,
    pub priorities: Option<Vec<EventPriority>>,
    pub session_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    pub fn with_types(mut self, types: Vec<EventType>) -> Self {
        self.types = Some(types);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &FleetEvent) -> bool {
        if let Some(project_id) = &self.project_id
            && &event.project_id != project_id
        {
            return false;
        }
        if let Some(types) = &self.types
            && !types.contains(&event.event_type)
        {
            return false;
        }
        if let Some(priorities) = &self.priorities
            && !priorities.contains(&event.priority)
        {
            return false;
        }
        if let Some(session_id) = &self.session_id
            && &event.session_id != session_id
        {
            return false;
        }
        if let Some(since) = &self.since
            && event.timestamp < *since
        {
            return false;
        }
        true
    }
}

pub struct EventStore {
    path: PathBuf,
    max_events: usize,
    /// Lazily-initialized line count; avoids re-counting the file per append.
    count: Mutex<Option<usize>>,
}

impl EventStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_max_events(path, DEFAULT_MAX_EVENTS)
    }

    pub fn with_max_events(path: impl AsRef<Path>, max_events: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_events: max_events.max(1),
            count: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. When the log has reached `max_events` lines the file
    /// is first rewritten keeping only the newest `max_events - 1` events, so
    /// the post-append line count never exceeds `max_events`.
    pub async fn append(&self, event: &FleetEvent) -> Result<()> {
        let cached = *self.count.lock();
        let count = match cached {
            Some(n) => n,
            None => self.count_lines().await?,
        };

        if count >= self.max_events {
            let events = self.read_all().await?;
            let keep = self.max_events.saturating_sub(1);
            let skip = events.len().saturating_sub(keep);
            let retained = &events[skip..];

            let mut content = String::new();
            for e in retained {
                content.push_str(&serde_json::to_string(e)?);
                content.push('\n');
            }
            let tmp = self.path.with_extension("jsonl.tmp");
            fs::write(&tmp, &content).await?;
            fs::rename(&tmp, &self.path).await?;
            *self.count.lock() = Some(retained.len());
            debug!(
                path = %self.path.display(),
                dropped = skip,
                "Event log pruned"
            );
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;

        let mut guard = self.count.lock();
        *guard = Some(guard.unwrap_or(0) + 1);
        Ok(())
    }

    /// All events in file (= append) order. Malformed lines are skipped.
    pub async fn read_all(&self) -> Result<Vec<FleetEvent>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        let mut malformed = 0usize;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<FleetEvent>(line) {
                Ok(event) => events.push(event),
                Err(_) => malformed += 1,
            }
        }
        if malformed > 0 {
            warn!(
                path = %self.path.display(),
                malformed,
                "Skipped malformed event lines"
            );
        }
        Ok(events)
    }

    /// Filtered query, newest-first, then offset/limit.
    pub async fn query(&self, filter: &EventFilter) -> Result<Vec<FleetEvent>> {
        let mut events = self.read_all().await?;
        events.retain(|e| filter.matches(e));
        // Stable sort: events sharing a timestamp keep file order.
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let events: Vec<FleetEvent> = events
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(events)
    }

    /// Most recent event of the given type for a session, if any.
    pub async fn latest_for_session(
        &self,
        session_id: &str,
        event_type: EventType,
    ) -> Result<Option<FleetEvent>> {
        let filter = EventFilter::for_session(session_id)
            .with_types(vec![event_type])
            .with_limit(1);
        Ok(self.query(&filter).await?.into_iter().next())
    }

    /// Count events per type for one session. Used by outcome capture.
    pub async fn counts_for_session(
        &self,
        session_id: &str,
    ) -> Result<HashMap<EventType, usize>> {
        let events = self.read_all().await?;
        let mut counts = HashMap::new();
        for event in events {
            if event.session_id == session_id {
                *counts.entry(event.event_type).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn count_lines(&self) -> Result<usize> {
        let count = self.read_all().await?.len();
        *self.count.lock() = Some(count);
        Ok(count)
    }
}
