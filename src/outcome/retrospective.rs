//! Post-mortem analysis sessions for failed runs.

use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::session::{Session, SessionManager, SpawnRequest};
use crate::store::Outcome;

pub struct RetrospectiveService {
    sessions: Arc<SessionManager>,
}

impl RetrospectiveService {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    /// Spawn an analysis session on a disposable branch. The retrospective
    /// agent reads the failed session's branch and history; its own work is
    /// never merged.
    pub async fn spawn(
        &self,
        project_id: &str,
        failed: &Session,
        outcome: &Outcome,
    ) -> Result<Session> {
        let mut prompt = format!(
            "Analyze why session {} on branch `{}` ended as `{}` instead of merging.\n",
            failed.id,
            failed.branch,
            outcome.outcome.as_str()
        );
        prompt.push_str(&format!(
            "It went through {} CI fix rounds and {} review rounds.\n",
            outcome.ci_retries, outcome.review_rounds
        ));
        if let Some(checks) = &outcome.failing_checks {
            prompt.push_str(&format!("Last failing checks: {}.\n", checks.join(", ")));
        }
        if let Some(pr) = &failed.pr {
            prompt.push_str(&format!("Its PR: {}\n", pr));
        }
        prompt.push_str(
            "Write your findings as a short report: root cause, what automation \
             could have caught it, and one concrete prevention step.",
        );

        let request = SpawnRequest::new(project_id, prompt)
            .with_branch(format!("retro/{}", failed.id))
            .with_summary(format!("Retrospective of {}", failed.id));
        let session = self.sessions.spawn(request).await?;

        info!(
            session_id = %session.id,
            failed_session = %failed.id,
            "Retrospective spawned"
        );
        Ok(session)
    }
}
