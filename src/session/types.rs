use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plugin::types::{ActivityState, RuntimeHandle};

/// Primary status of a supervised agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Spawning,
    Working,
    PrOpen,
    CiFailed,
    ReviewPending,
    ChangesRequested,
    Approved,
    Mergeable,
    Merged,
    NeedsInput,
    Stuck,
    Errored,
    Killed,
    Done,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Working => "working",
            Self::PrOpen => "pr_open",
            Self::CiFailed => "ci_failed",
            Self::ReviewPending => "review_pending",
            Self::ChangesRequested => "changes_requested",
            Self::Approved => "approved",
            Self::Mergeable => "mergeable",
            Self::Merged => "merged",
            Self::NeedsInput => "needs_input",
            Self::Stuck => "stuck",
            Self::Errored => "errored",
            Self::Killed => "killed",
            Self::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Killed | Self::Done)
    }

    /// Statuses that imply an open, non-failing PR. Used to decide whether a
    /// `ci_failed` exit resolved the failure or abandoned it.
    pub fn is_pr_healthy(&self) -> bool {
        matches!(
            self,
            Self::PrOpen
                | Self::ReviewPending
                | Self::ChangesRequested
                | Self::Approved
                | Self::Mergeable
                | Self::Merged
        )
    }

    /// Statuses the classifier promotes to `working` once the agent shows
    /// signs of life again.
    pub fn is_promotable(&self) -> bool {
        matches!(self, Self::Spawning | Self::Stuck | Self::NeedsInput)
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spawning" => Ok(Self::Spawning),
            "working" => Ok(Self::Working),
            "pr_open" => Ok(Self::PrOpen),
            "ci_failed" => Ok(Self::CiFailed),
            "review_pending" => Ok(Self::ReviewPending),
            "changes_requested" => Ok(Self::ChangesRequested),
            "approved" => Ok(Self::Approved),
            "mergeable" => Ok(Self::Mergeable),
            "merged" => Ok(Self::Merged),
            "needs_input" => Ok(Self::NeedsInput),
            "stuck" => Ok(Self::Stuck),
            "errored" => Ok(Self::Errored),
            "killed" => Ok(Self::Killed),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown session status: {}", other)),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One supervised agent run: one issue (or prompt), one branch, one workspace.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub project: String,
    pub status: SessionStatus,
    pub branch: String,
    pub worktree: Option<PathBuf>,
    pub issue: Option<String>,
    pub pr: Option<String>,
    pub summary: Option<String>,
    pub agent: Option<String>,
    /// Globally-unique runtime key (`{hash}-{sessionId}`).
    pub runtime_key: Option<String>,
    pub runtime_handle: Option<RuntimeHandle>,
    pub plan_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Derived from terminal output; never persisted, never coerced when unknown.
    pub activity: Option<ActivityState>,
    /// Unrecognized metadata keys, preserved verbatim across read/write.
    pub metadata: BTreeMap<String, String>,
}

impl Session {
    pub fn new(id: impl Into<String>, project: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project: project.into(),
            status: SessionStatus::Spawning,
            branch: branch.into(),
            worktree: None,
            issue: None,
            pr: None,
            summary: None,
            agent: None,
            runtime_key: None,
            runtime_handle: None,
            plan_id: None,
            created_at: Utc::now(),
            last_activity_at: None,
            activity: None,
            metadata: BTreeMap::new(),
        }
    }

    /// PR number parsed from the stored URL's trailing path segment.
    pub fn pr_number(&self) -> Option<u64> {
        self.pr
            .as_deref()?
            .trim_end_matches('/')
            .rsplit('/')
            .next()?
            .parse()
            .ok()
    }

    pub fn cost(&self) -> Option<f64> {
        self.metadata.get("cost").and_then(|v| v.parse().ok())
    }

    // Reaction-tracker metadata section. The keys below are a known schema,
    // accessed only through these helpers so restart resumes the same retry
    // budget a live tracker had.

    fn attempts_key(reaction_key: &str) -> String {
        format!("reaction_{}_attempts", reaction_key.replace('-', "_"))
    }

    fn first_triggered_key(reaction_key: &str) -> String {
        format!("reaction_{}_firstTriggered", reaction_key.replace('-', "_"))
    }

    pub fn reaction_attempts(&self, reaction_key: &str) -> u32 {
        self.metadata
            .get(&Self::attempts_key(reaction_key))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn reaction_first_triggered(&self, reaction_key: &str) -> Option<DateTime<Utc>> {
        self.metadata
            .get(&Self::first_triggered_key(reaction_key))
            .and_then(|v| v.parse::<DateTime<Utc>>().ok())
    }

    pub fn set_reaction_tracker(
        &mut self,
        reaction_key: &str,
        attempts: u32,
        first_triggered: DateTime<Utc>,
    ) {
        self.metadata
            .insert(Self::attempts_key(reaction_key), attempts.to_string());
        self.metadata.insert(
            Self::first_triggered_key(reaction_key),
            first_triggered.to_rfc3339(),
        );
    }

    pub fn clear_reaction_tracker(&mut self, reaction_key: &str) {
        self.metadata.remove(&Self::attempts_key(reaction_key));
        self.metadata.remove(&Self::first_triggered_key(reaction_key));
    }

    pub fn review_attempts(&self) -> u32 {
        self.metadata
            .get("reviewAttempts")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn increment_review_attempts(&mut self) -> u32 {
        let next = self.review_attempts() + 1;
        self.metadata
            .insert("reviewAttempts".to_string(), next.to_string());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_set() {
        assert!(SessionStatus::Merged.is_terminal());
        assert!(SessionStatus::Killed.is_terminal());
        assert!(SessionStatus::Done.is_terminal());
        assert!(!SessionStatus::Stuck.is_terminal());
        assert!(!SessionStatus::Errored.is_terminal());
    }

    #[test]
    fn status_round_trips() {
        for s in [
            SessionStatus::Spawning,
            SessionStatus::CiFailed,
            SessionStatus::ChangesRequested,
            SessionStatus::Done,
        ] {
            assert_eq!(s.as_str().parse::<SessionStatus>().unwrap(), s);
        }
        assert!("nope".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn pr_number_from_url() {
        let mut session = Session::new("web-1", "web", "feat/x");
        session.pr = Some("https://github.com/acme/web/pull/123".to_string());
        assert_eq!(session.pr_number(), Some(123));

        session.pr = Some("https://github.com/acme/web/pull/123/".to_string());
        assert_eq!(session.pr_number(), Some(123));

        session.pr = None;
        assert_eq!(session.pr_number(), None);
    }

    #[test]
    fn reaction_tracker_round_trip() {
        let mut session = Session::new("web-1", "web", "feat/x");
        let t0 = Utc::now();
        session.set_reaction_tracker("ci-failed", 2, t0);

        assert_eq!(session.reaction_attempts("ci-failed"), 2);
        let restored = session.reaction_first_triggered("ci-failed").unwrap();
        assert!((restored - t0).num_milliseconds().abs() < 1000);

        session.clear_reaction_tracker("ci-failed");
        assert_eq!(session.reaction_attempts("ci-failed"), 0);
        assert!(session.reaction_first_triggered("ci-failed").is_none());
    }
}
