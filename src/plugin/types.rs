use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Activity derived from terminal output and process liveness. Derived, never
/// canonical: when a probe cannot tell, the answer is `None`, not a guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Active,
    Ready,
    Idle,
    WaitingInput,
    Blocked,
    Exited,
}

impl ActivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ready => "ready",
            Self::Idle => "idle",
            Self::WaitingInput => "waiting_input",
            Self::Blocked => "blocked",
            Self::Exited => "exited",
        }
    }
}

/// Opaque, serializable token identifying where an agent is executing.
/// Round-trips through session metadata across process restarts; the core
/// never inspects `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeHandle {
    pub id: String,
    pub runtime_name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Everything a runtime needs to start an agent.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    /// Globally-unique key (`{hash}-{sessionId}`), stable across restarts.
    pub key: String,
    pub workdir: PathBuf,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IssueRequest {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiSummary {
    Passing,
    Failing,
    Pending,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passing,
    Failing,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiCheck {
    pub name: String,
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    Pending,
    None,
}

#[derive(Debug, Clone)]
pub struct Review {
    pub state: ReviewDecision,
    pub body: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PendingComment {
    pub path: Option<String>,
    pub line: Option<u64>,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct Mergeability {
    pub mergeable: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PrSize {
    pub additions: u64,
    pub deletions: u64,
}

/// Fall back to parsing a review body for an explicit verdict marker.
///
/// Some SCM providers report `review_decision = none` for reviews posted by
/// the same identity that opened the PR. Review agents therefore embed
/// `APPROVE` / `REQUEST_CHANGES` in the comment body; this parses that marker
/// and nothing else. Silence is never approval.
pub fn parse_review_verdict(body: &str) -> Option<ReviewDecision> {
    for line in body.lines() {
        let line = line.trim();
        if line.contains("REQUEST_CHANGES") {
            return Some(ReviewDecision::ChangesRequested);
        }
        if line.contains("APPROVE") {
            return Some(ReviewDecision::Approved);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_handle_round_trips_as_json() {
        let handle = RuntimeHandle {
            id: "tmux:abc-web-1".to_string(),
            runtime_name: "tmux".to_string(),
            data: serde_json::json!({"pane": "%12"}),
        };
        let raw = serde_json::to_string(&handle).unwrap();
        let back: RuntimeHandle = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, handle);
    }

    #[test]
    fn review_verdict_markers() {
        assert_eq!(
            parse_review_verdict("Looks good.\n\nAPPROVE"),
            Some(ReviewDecision::Approved)
        );
        assert_eq!(
            parse_review_verdict("REQUEST_CHANGES: error handling is missing"),
            Some(ReviewDecision::ChangesRequested)
        );
        // REQUEST_CHANGES wins even though APPROVE is a substring match risk.
        assert_eq!(
            parse_review_verdict("I would not APPROVE this. REQUEST_CHANGES"),
            Some(ReviewDecision::ChangesRequested)
        );
        assert_eq!(parse_review_verdict("Nice work overall."), None);
    }
}
