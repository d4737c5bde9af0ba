//! Read-only aggregation over the event log: how often each reaction fires,
//! how often automation resolves CI failures without a human. Consumed by
//! dashboards; the engine never reads these numbers back.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::store::{EventType, FleetEvent};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReactionStats {
    pub triggered: usize,
    pub skipped: usize,
    pub escalated: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CiFixStats {
    /// `ci.fix_sent` events.
    pub sent: usize,
    /// `ci.passing` with `resolved: true`.
    pub resolved: usize,
    /// `ci.fix_failed`: the session left `ci_failed` without a healthy PR.
    pub abandoned: usize,
    pub resolution_rate: Option<f64>,
    pub avg_attempts_to_resolve: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReactionReport {
    pub by_key: BTreeMap<String, ReactionStats>,
    pub ci: CiFixStats,
}

pub fn analyze(events: &[FleetEvent]) -> ReactionReport {
    let mut report = ReactionReport::default();
    let mut resolve_attempts: Vec<u64> = Vec::new();

    for event in events {
        match event.event_type {
            EventType::ReactionTriggered => {
                let key = event
                    .data
                    .get("reactionKey")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let stats = report.by_key.entry(key).or_default();
                if event
                    .data
                    .get("skipped")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                {
                    stats.skipped += 1;
                } else {
                    stats.triggered += 1;
                }
            }
            EventType::ReactionEscalated => {
                let key = event
                    .data
                    .get("reactionKey")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                report.by_key.entry(key).or_default().escalated += 1;
            }
            EventType::CiFixSent => {
                report.ci.sent += 1;
                report
                    .by_key
                    .entry("ci-failed".to_string())
                    .or_default()
                    .triggered += 1;
            }
            EventType::CiPassing => {
                if event
                    .data
                    .get("resolved")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                {
                    report.ci.resolved += 1;
                    if let Some(attempt) = event.data.get("attempt").and_then(|v| v.as_u64()) {
                        resolve_attempts.push(attempt);
                    }
                }
            }
            EventType::CiFixFailed => {
                report.ci.abandoned += 1;
            }
            _ => {}
        }
    }

    let outcomes = report.ci.resolved + report.ci.abandoned;
    if outcomes > 0 {
        report.ci.resolution_rate = Some(report.ci.resolved as f64 / outcomes as f64);
    }
    if !resolve_attempts.is_empty() {
        report.ci.avg_attempts_to_resolve =
            Some(resolve_attempts.iter().sum::<u64>() as f64 / resolve_attempts.len() as f64);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: EventType, data: serde_json::Value) -> FleetEvent {
        FleetEvent::new(event_type, "web-1", "web", "test").with_data(data)
    }

    #[test]
    fn counts_triggered_skipped_escalated_per_key() {
        let events = vec![
            event(
                EventType::ReactionTriggered,
                serde_json::json!({"reactionKey": "stuck"}),
            ),
            event(
                EventType::ReactionTriggered,
                serde_json::json!({"reactionKey": "stuck", "skipped": true}),
            ),
            event(
                EventType::ReactionEscalated,
                serde_json::json!({"reactionKey": "stuck", "attempts": 4}),
            ),
        ];
        let report = analyze(&events);
        let stuck = &report.by_key["stuck"];
        assert_eq!(stuck.triggered, 1);
        assert_eq!(stuck.skipped, 1);
        assert_eq!(stuck.escalated, 1);
    }

    #[test]
    fn ci_fix_loop_stats() {
        let events = vec![
            event(EventType::CiFixSent, serde_json::json!({"attempt": 1})),
            event(EventType::CiFixSent, serde_json::json!({"attempt": 2})),
            event(
                EventType::CiPassing,
                serde_json::json!({"resolved": true, "attempt": 2}),
            ),
            event(EventType::CiFixSent, serde_json::json!({"attempt": 1})),
            event(EventType::CiFixFailed, serde_json::json!({"attempt": 1})),
        ];
        let report = analyze(&events);
        assert_eq!(report.ci.sent, 3);
        assert_eq!(report.ci.resolved, 1);
        assert_eq!(report.ci.abandoned, 1);
        assert_eq!(report.ci.resolution_rate, Some(0.5));
        assert_eq!(report.ci.avg_attempts_to_resolve, Some(2.0));
    }

    #[test]
    fn empty_log_is_an_empty_report() {
        let report = analyze(&[]);
        assert!(report.by_key.is_empty());
        assert_eq!(report.ci.sent, 0);
        assert!(report.ci.resolution_rate.is_none());
    }
}
