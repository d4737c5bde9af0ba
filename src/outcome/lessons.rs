//! Historical lessons distilled from recent outcomes.
//!
//! Rendered into spawn prompts so new sessions start with the failure
//! patterns of their predecessors in front of them.

use std::collections::HashMap;

use crate::classifier::{CheckCategory, classify_check};
use crate::store::{Outcome, OutcomeKind};

/// Outcomes considered when deriving lessons.
pub const DEFAULT_LESSON_WINDOW: usize = 20;

const MIN_CHECK_COUNT: usize = 2;
const MAX_TOP_CHECKS: usize = 3;
const CI_RETRY_THRESHOLD: f64 = 1.5;
const FAILURE_RATE_THRESHOLD: f64 = 0.30;

#[derive(Debug, Clone)]
pub struct ProjectLessons {
    /// `(check name, occurrence count, category)`, most frequent first.
    pub top_failing_checks: Vec<(String, usize, CheckCategory)>,
    pub avg_ci_retries: Option<f64>,
    /// `(rate, dominant failing-check category)`.
    pub failure_rate: Option<(f64, CheckCategory)>,
}

impl ProjectLessons {
    /// Derive lessons from recent outcomes. Returns `None` when there is
    /// nothing worth telling a new session.
    pub fn derive(outcomes: &[Outcome]) -> Option<Self> {
        if outcomes.is_empty() {
            return None;
        }

        let mut check_counts: HashMap<&str, usize> = HashMap::new();
        for outcome in outcomes {
            for check in outcome.failing_checks.iter().flatten() {
                *check_counts.entry(check.as_str()).or_insert(0) += 1;
            }
        }
        let mut top: Vec<(String, usize, CheckCategory)> = check_counts
            .into_iter()
            .filter(|(_, count)| *count >= MIN_CHECK_COUNT)
            .map(|(name, count)| (name.to_string(), count, classify_check(name)))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(MAX_TOP_CHECKS);

        let avg_retries =
            outcomes.iter().map(|o| o.ci_retries).sum::<usize>() as f64 / outcomes.len() as f64;
        let avg_ci_retries = (avg_retries > CI_RETRY_THRESHOLD).then_some(avg_retries);

        let failures = outcomes
            .iter()
            .filter(|o| o.outcome.is_failure())
            .count();
        let rate = failures as f64 / outcomes.len() as f64;
        let failure_rate = (rate > FAILURE_RATE_THRESHOLD).then(|| {
            let mut category_counts: HashMap<CheckCategory, usize> = HashMap::new();
            for outcome in outcomes {
                for check in outcome.failing_checks.iter().flatten() {
                    *category_counts.entry(classify_check(check)).or_insert(0) += 1;
                }
            }
            let dominant = category_counts
                .into_iter()
                .max_by_key(|(_, count)| *count)
                .map(|(category, _)| category)
                .unwrap_or(CheckCategory::Unknown);
            (rate, dominant)
        });

        if top.is_empty() && avg_ci_retries.is_none() && failure_rate.is_none() {
            return None;
        }

        Some(Self {
            top_failing_checks: top,
            avg_ci_retries,
            failure_rate,
        })
    }

    /// Markdown section for spawn prompts.
    pub fn render(&self) -> String {
        let mut out = String::from("## Lessons from recent sessions\n");

        for (name, count, category) in &self.top_failing_checks {
            out.push_str(&format!(
                "- `{}` failed in {} recent sessions. {}\n",
                name,
                count,
                category.recommendation()
            ));
        }
        if let Some(avg) = self.avg_ci_retries {
            out.push_str(&format!(
                "- Sessions here average {:.1} CI fix rounds; run the full check suite locally before pushing.\n",
                avg
            ));
        }
        if let Some((rate, category)) = &self.failure_rate {
            out.push_str(&format!(
                "- {:.0}% of recent sessions did not merge, mostly {} failures.\n",
                rate * 100.0,
                category.label().to_lowercase()
            ));
        }
        out.trim_end().to_string()
    }
}

/// Map a terminal transition to the recorded outcome kind. `done` counts as
/// a success; a kill that interrupts a stuck or errored session keeps that
/// classification.
pub fn outcome_kind_for(
    old: crate::session::SessionStatus,
    new: crate::session::SessionStatus,
) -> OutcomeKind {
    use crate::session::SessionStatus;
    match new {
        SessionStatus::Merged | SessionStatus::Done => OutcomeKind::Merged,
        _ => match old {
            SessionStatus::Stuck => OutcomeKind::Stuck,
            SessionStatus::Errored => OutcomeKind::Errored,
            _ => OutcomeKind::Killed,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn outcome(kind: OutcomeKind, ci_retries: usize, checks: &[&str]) -> Outcome {
        Outcome {
            session_id: "web-1".to_string(),
            project_id: "web".to_string(),
            outcome: kind,
            duration_ms: 1000,
            ci_retries,
            review_rounds: 0,
            cost: None,
            failing_checks: if checks.is_empty() {
                None
            } else {
                Some(checks.iter().map(|c| c.to_string()).collect())
            },
            plan_id: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn quiet_history_yields_no_lessons() {
        let outcomes = vec![
            outcome(OutcomeKind::Merged, 0, &[]),
            outcome(OutcomeKind::Merged, 1, &[]),
            outcome(OutcomeKind::Merged, 0, &[]),
        ];
        assert!(ProjectLessons::derive(&outcomes).is_none());
        assert!(ProjectLessons::derive(&[]).is_none());
    }

    #[test]
    fn repeated_checks_surface_with_recommendations() {
        let outcomes = vec![
            outcome(OutcomeKind::Merged, 1, &["unit-tests"]),
            outcome(OutcomeKind::Merged, 1, &["unit-tests", "clippy"]),
            outcome(OutcomeKind::Merged, 0, &["unit-tests"]),
        ];
        let lessons = ProjectLessons::derive(&outcomes).unwrap();
        assert_eq!(lessons.top_failing_checks.len(), 1, "clippy appeared once");
        assert_eq!(lessons.top_failing_checks[0].0, "unit-tests");
        assert_eq!(lessons.top_failing_checks[0].1, 3);

        let rendered = lessons.render();
        assert!(rendered.contains("unit-tests"));
        assert!(rendered.contains("failing tests"));
    }

    #[test]
    fn thresholds_gate_retry_and_failure_lessons() {
        let outcomes = vec![
            outcome(OutcomeKind::Killed, 3, &["build"]),
            outcome(OutcomeKind::Errored, 2, &["build"]),
            outcome(OutcomeKind::Merged, 1, &[]),
        ];
        let lessons = ProjectLessons::derive(&outcomes).unwrap();
        assert!(lessons.avg_ci_retries.unwrap() > 1.5);
        let (rate, category) = lessons.failure_rate.unwrap();
        assert!(rate > 0.3);
        assert_eq!(category, CheckCategory::Build);
    }

    #[test]
    fn outcome_kind_mapping() {
        use crate::session::SessionStatus;
        assert_eq!(
            outcome_kind_for(SessionStatus::Mergeable, SessionStatus::Merged),
            OutcomeKind::Merged
        );
        assert_eq!(
            outcome_kind_for(SessionStatus::Working, SessionStatus::Done),
            OutcomeKind::Merged
        );
        assert_eq!(
            outcome_kind_for(SessionStatus::Stuck, SessionStatus::Killed),
            OutcomeKind::Stuck
        );
        assert_eq!(
            outcome_kind_for(SessionStatus::Errored, SessionStatus::Killed),
            OutcomeKind::Errored
        );
        assert_eq!(
            outcome_kind_for(SessionStatus::Working, SessionStatus::Killed),
            OutcomeKind::Killed
        );
    }
}
