use chrono::{DateTime, Utc};

use crate::session::Session;

/// Per `(session, reaction-key)` retry state. Lives in memory, owned by the
/// lifecycle task; attempts and first-trigger time are mirrored into session
/// metadata so a restart resumes the same budget.
#[derive(Debug, Clone)]
pub struct ReactionTracker {
    pub attempts: u32,
    pub first_triggered: DateTime<Utc>,
    /// Not persisted: after an escalation the reaction stays quiet until the
    /// session leaves the triggering status and the tracker is cleared.
    pub escalated: bool,
}

impl ReactionTracker {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            first_triggered: Utc::now(),
            escalated: false,
        }
    }

    /// Rebuild from persisted metadata, so retry budgets survive restarts.
    pub fn restore(session: &Session, reaction_key: &str) -> Self {
        let attempts = session.reaction_attempts(reaction_key);
        let first_triggered = session
            .reaction_first_triggered(reaction_key)
            .unwrap_or_else(Utc::now);
        Self {
            attempts,
            first_triggered,
            escalated: false,
        }
    }
}

impl Default for ReactionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_resumes_persisted_budget() {
        let mut session = Session::new("web-1", "web", "feat/x");
        let t0 = Utc::now() - chrono::Duration::minutes(10);
        session.set_reaction_tracker("ci-failed", 2, t0);

        let tracker = ReactionTracker::restore(&session, "ci-failed");
        assert_eq!(tracker.attempts, 2);
        assert!((tracker.first_triggered - t0).num_seconds().abs() < 2);
        assert!(!tracker.escalated);

        let fresh = ReactionTracker::restore(&session, "stuck");
        assert_eq!(fresh.attempts, 0);
    }
}
