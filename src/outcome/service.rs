//! Terminal-state capture. One outcome record per session, written at the
//! moment the session leaves the live set.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::FleetConfig;
use crate::error::Result;
use crate::paths::FleetPaths;
use crate::session::{Session, SessionStatus};
use crate::store::{EventStore, EventType, FleetEvent, Outcome, OutcomeStore};

use super::lessons::outcome_kind_for;

pub struct OutcomeService {
    config: Arc<FleetConfig>,
    paths: FleetPaths,
}

impl OutcomeService {
    pub fn new(config: Arc<FleetConfig>, paths: FleetPaths) -> Self {
        Self { config, paths }
    }

    fn events(&self, project_id: &str) -> EventStore {
        EventStore::with_max_events(self.paths.events_file(project_id), self.config.max_events)
    }

    fn outcomes(&self, project_id: &str) -> OutcomeStore {
        OutcomeStore::new(self.paths.outcomes_file(project_id))
    }

    /// Summarize a session's history into one outcome record. CI retries and
    /// review rounds are recovered from the event log, failing checks from
    /// the most recent `ci.failing` event.
    pub async fn capture(
        &self,
        project_id: &str,
        session: &Session,
        old: SessionStatus,
        new: SessionStatus,
    ) -> Result<Outcome> {
        let events = self.events(project_id);
        let counts = events.counts_for_session(&session.id).await?;

        let failing_checks = match events
            .latest_for_session(&session.id, EventType::CiFailing)
            .await?
        {
            Some(event) => event.data.get("failingChecks").and_then(|v| {
                v.as_array().map(|list| {
                    list.iter()
                        .filter_map(|c| c.as_str().map(String::from))
                        .collect::<Vec<_>>()
                })
            }),
            None => None,
        };

        let duration = Utc::now().signed_duration_since(session.created_at);
        let outcome = Outcome {
            session_id: session.id.clone(),
            project_id: project_id.to_string(),
            outcome: outcome_kind_for(old, new),
            duration_ms: duration.num_milliseconds().max(0) as u64,
            ci_retries: counts.get(&EventType::CiFailing).copied().unwrap_or(0),
            review_rounds: counts
                .get(&EventType::ReviewChangesRequested)
                .copied()
                .unwrap_or(0),
            cost: session.cost(),
            failing_checks,
            plan_id: session.plan_id.clone(),
            timestamp: Utc::now(),
        };

        self.outcomes(project_id).append(&outcome).await?;

        let record_event = FleetEvent::new(
            EventType::OutcomeRecorded,
            &session.id,
            project_id,
            format!("Session {} finished: {}", session.id, outcome.outcome.as_str()),
        )
        .with_data(serde_json::json!({
            "outcome": outcome.outcome.as_str(),
            "ciRetries": outcome.ci_retries,
            "reviewRounds": outcome.review_rounds,
        }));
        if let Err(e) = events.append(&record_event).await {
            warn!(session_id = %session.id, error = %e, "Failed to record outcome event");
        }

        debug!(
            session_id = %session.id,
            outcome = outcome.outcome.as_str(),
            ci_retries = outcome.ci_retries,
            "Outcome captured"
        );
        Ok(outcome)
    }
}
