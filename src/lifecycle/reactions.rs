//! Reaction dispatch: retry accounting, dedup, escalation, and the actions
//! themselves.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::classifier::format_classified_errors;
use crate::config::{ReactionAction, ReactionConfig};
use crate::plugin::types::{CheckStatus, PullRequest, ReviewDecision, parse_review_verdict};
use crate::session::{Session, SpawnRequest};
use crate::store::{EventFilter, EventPriority, EventType, FleetEvent};

use super::manager::LifecycleManager;

/// Lines of terminal tail inspected by the dedup check.
const DEDUP_TAIL_LINES: usize = 30;

/// Above this total diff size the CI message suggests splitting the PR.
const LARGE_PR_LINES: u64 = 800;

/// Conservative signals that the agent is already handling the event; no
/// keyword match means we send. False negatives only cost a redundant nudge.
fn addressing_indicators(reaction_key: &str) -> &'static [&'static str] {
    match reaction_key {
        "ci-failed" => &[
            "ci fail",
            "fixing ci",
            "fix ci",
            "failing check",
            "lint error",
            "test failure",
            "fixing test",
        ],
        "changes-requested" => &[
            "address comment",
            "addressing comment",
            "review comment",
            "review feedback",
            "addressing review",
        ],
        _ => &[],
    }
}

fn agent_already_addressing(reaction_key: &str, output: &str) -> bool {
    let indicators = addressing_indicators(reaction_key);
    if indicators.is_empty() {
        return false;
    }
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(DEDUP_TAIL_LINES);
    let tail = lines[start..].join("\n").to_lowercase();
    indicators.iter().any(|kw| tail.contains(kw))
}

fn default_message(reaction_key: &str) -> String {
    match reaction_key {
        "ci-failed" => {
            "CI is failing on your PR. Investigate the failing checks and push a fix.".to_string()
        }
        "stuck" => "You appear to have stalled. Summarize where you are and continue, or say \
                    what is blocking you."
            .to_string(),
        "needs-input" => "You are waiting on input. If the question can be resolved from the \
                          issue or the repository, resolve it and continue."
            .to_string(),
        other => format!("Automated nudge for '{}'.", other),
    }
}

impl LifecycleManager {
    /// Run one reaction attempt. Ordering is load-bearing:
    /// 1. increment the tracker (dedup-skipped sends still count),
    /// 2. dedup check,
    /// 3. escalation check (the action does not execute when it fires),
    /// 4. the action itself.
    pub(crate) async fn dispatch_reaction(
        &self,
        project_id: &str,
        session: &Session,
        event: &FleetEvent,
        key: &str,
        cfg: &ReactionConfig,
        output: Option<&str>,
    ) {
        let tracker = self.increment_tracker(project_id, session, key).await;
        if tracker.escalated {
            // Humans have it; stay quiet until the status changes.
            return;
        }
        let attempt = tracker.attempts;

        if cfg.action == ReactionAction::SendToAgent
            && let Some(output) = output
            && agent_already_addressing(key, output)
        {
            debug!(session_id = %session.id, key, attempt, "Send skipped; agent already on it");
            let skipped = FleetEvent::new(
                EventType::ReactionTriggered,
                &session.id,
                project_id,
                format!("Reaction '{}' skipped; agent already addressing it", key),
            )
            .with_data(serde_json::json!({
                "reactionKey": key,
                "attempt": attempt,
                "skipped": true,
            }));
            if let Err(e) = self.events(project_id).append(&skipped).await {
                warn!(error = %e, "Failed to record skipped reaction");
            }
            return;
        }

        let over_retries = attempt > cfg.retries();
        let over_deadline = match cfg.escalate_after() {
            Ok(Some(limit)) => Utc::now()
                .signed_duration_since(tracker.first_triggered)
                .to_std()
                .map(|elapsed| elapsed > limit)
                .unwrap_or(false),
            _ => false,
        };
        if over_retries || over_deadline {
            self.escalate(project_id, session, key, cfg, attempt).await;
            return;
        }

        match cfg.action {
            ReactionAction::SendToAgent => {
                self.react_send_to_agent(project_id, session, key, cfg, attempt)
                    .await;
            }
            ReactionAction::Notify => {
                self.react_notify(project_id, session, event, key, cfg, attempt)
                    .await;
            }
            ReactionAction::AutoMerge => {
                // Merge is performed elsewhere; surface it for a human.
                let notice = FleetEvent::new(
                    EventType::ReactionTriggered,
                    &session.id,
                    project_id,
                    format!("{} is ready to merge", session.id),
                )
                .with_priority(EventPriority::Action)
                .with_data(serde_json::json!({"reactionKey": key, "attempt": attempt}));
                if let Err(e) = self.events(project_id).append(&notice).await {
                    warn!(error = %e, "Failed to record auto-merge notice");
                }
                self.notify(project_id, &notice).await;
            }
            ReactionAction::SpawnReview => {
                self.react_spawn_review(project_id, session, key, attempt).await;
            }
            ReactionAction::ReviewGate => {
                self.react_review_gate(project_id, session, cfg, attempt).await;
            }
            ReactionAction::SpawnReconciliation => {
                self.react_reconciliation(project_id, session, key, attempt).await;
            }
            ReactionAction::SpawnRetrospective => {
                // Handled on terminal transitions, not via dispatch.
                debug!(key, "spawn-retrospective ignored outside terminal handling");
            }
        }
    }

    async fn escalate(
        &self,
        project_id: &str,
        session: &Session,
        key: &str,
        cfg: &ReactionConfig,
        attempts: u32,
    ) {
        warn!(session_id = %session.id, key, attempts, "Reaction escalated to humans");
        self.mark_tracker_escalated(project_id, &session.id, key);

        let event = FleetEvent::new(
            EventType::ReactionEscalated,
            &session.id,
            project_id,
            format!(
                "Automation for '{}' on {} exhausted after {} attempts; human attention needed",
                key, session.id, attempts
            ),
        )
        .with_priority(cfg.priority.unwrap_or(EventPriority::Urgent))
        .with_data(serde_json::json!({"reactionKey": key, "attempts": attempts}));

        if let Err(e) = self.events(project_id).append(&event).await {
            warn!(error = %e, "Failed to record escalation");
        }
        self.notify(project_id, &event).await;
    }

    async fn react_send_to_agent(
        &self,
        project_id: &str,
        session: &Session,
        key: &str,
        cfg: &ReactionConfig,
        attempt: u32,
    ) {
        let (message, failing_checks) = if key == "ci-failed" {
            self.enrich_ci_message(project_id, session, cfg, attempt).await
        } else {
            (
                cfg.message.clone().unwrap_or_else(|| default_message(key)),
                Vec::new(),
            )
        };

        if let Err(e) = self.sessions.send(project_id, &session.id, &message).await {
            warn!(session_id = %session.id, key, error = %e, "Reaction send failed");
            return;
        }

        let event = if key == "ci-failed" {
            FleetEvent::new(
                EventType::CiFixSent,
                &session.id,
                project_id,
                format!("CI fix instructions sent to {} (attempt {})", session.id, attempt),
            )
            .with_data(serde_json::json!({
                "attempt": attempt,
                "failingChecks": failing_checks,
            }))
        } else {
            FleetEvent::new(
                EventType::ReactionTriggered,
                &session.id,
                project_id,
                format!("Reaction '{}' message sent to {}", key, session.id),
            )
            .with_data(serde_json::json!({"reactionKey": key, "attempt": attempt}))
        };
        if let Err(e) = self.events(project_id).append(&event).await {
            warn!(error = %e, "Failed to record reaction send");
        }
    }

    /// Static message plus everything the agent needs to not guess: the
    /// classified failing checks, PR size, sibling merges, and a diff against
    /// the previous attempt's failures.
    async fn enrich_ci_message(
        &self,
        project_id: &str,
        session: &Session,
        cfg: &ReactionConfig,
        attempt: u32,
    ) -> (String, Vec<String>) {
        let mut sections = vec![
            cfg.message
                .clone()
                .unwrap_or_else(|| default_message("ci-failed")),
        ];
        let mut failing_names: Vec<String> = Vec::new();

        let scm = self
            .config
            .project(project_id)
            .ok()
            .and_then(|p| p.scm.as_deref().and_then(|name| self.registry.scm(name)));
        let pr = session.pr_number().zip(session.pr.clone()).map(|(number, url)| PullRequest { number, url });

        if let (Some(scm), Some(pr)) = (&scm, &pr) {
            match scm.ci_checks(pr).await {
                Ok(checks) => {
                    let failing: Vec<_> = checks
                        .into_iter()
                        .filter(|c| c.status == CheckStatus::Failing)
                        .collect();
                    if !failing.is_empty() {
                        failing_names = failing.iter().map(|c| c.name.clone()).collect();
                        sections.push(format_classified_errors(&failing));
                    }
                }
                Err(e) => debug!(error = %e, "ci_checks unavailable for enrichment"),
            }

            match scm.pr_summary(pr).await {
                Ok(size) => {
                    let mut line = format!("PR size: +{} -{}.", size.additions, size.deletions);
                    if size.additions + size.deletions > LARGE_PR_LINES {
                        line.push_str(" This is a large diff; if CI keeps failing, consider splitting it.");
                    }
                    sections.push(line);
                }
                Err(e) => debug!(error = %e, "pr_summary unavailable for enrichment"),
            }
        }

        if let Some(plan_id) = &session.plan_id {
            let merged = self.sibling_merges_since(project_id, session, plan_id).await;
            if merged > 0 {
                let default_branch = self
                    .config
                    .project(project_id)
                    .map(|p| p.default_branch.clone())
                    .unwrap_or_else(|_| "main".to_string());
                sections.push(format!(
                    "{} sibling PR(s) from your plan merged since you started. If the \
                     failures look unrelated to your change, rebase on {} first.",
                    merged, default_branch
                ));
            }
        }

        if let Some(analysis) = self
            .attempt_analysis(project_id, session, attempt, &failing_names)
            .await
        {
            sections.push(analysis);
        }

        (sections.join("\n\n"), failing_names)
    }

    async fn sibling_merges_since(
        &self,
        project_id: &str,
        session: &Session,
        plan_id: &str,
    ) -> usize {
        let filter = EventFilter {
            types: Some(vec![EventType::PrMerged]),
            since: Some(session.created_at),
            ..Default::default()
        };
        match self.events(project_id).query(&filter).await {
            Ok(events) => events
                .iter()
                .filter(|e| {
                    e.session_id != session.id
                        && e.data.get("planId").and_then(|v| v.as_str()) == Some(plan_id)
                })
                .count(),
            Err(_) => 0,
        }
    }

    /// Compare the current failing checks with those recorded by the previous
    /// `ci.fix_sent`. Only meaningful from the second attempt on.
    async fn attempt_analysis(
        &self,
        project_id: &str,
        session: &Session,
        attempt: u32,
        current: &[String],
    ) -> Option<String> {
        let previous = self
            .events(project_id)
            .latest_for_session(&session.id, EventType::CiFixSent)
            .await
            .ok()??;
        let previous: Vec<String> = previous
            .data
            .get("failingChecks")?
            .as_array()?
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();

        let still: Vec<&String> = current.iter().filter(|c| previous.contains(*c)).collect();
        let passing: Vec<&String> = previous.iter().filter(|c| !current.contains(*c)).collect();
        let fresh: Vec<&String> = current.iter().filter(|c| !previous.contains(*c)).collect();

        let mut out = format!("## Attempt {} analysis\n", attempt);
        if !still.is_empty() {
            out.push_str(&format!(
                "Still failing after your last fix: {}. Your previous approach did not \
                 address these.\n",
                join(&still)
            ));
        }
        if !passing.is_empty() {
            out.push_str(&format!("Now passing: {}.\n", join(&passing)));
        }
        if !fresh.is_empty() {
            out.push_str(&format!(
                "New failures introduced since the last attempt: {}.\n",
                join(&fresh)
            ));
        }
        Some(out.trim_end().to_string())
    }

    async fn react_notify(
        &self,
        project_id: &str,
        session: &Session,
        event: &FleetEvent,
        key: &str,
        cfg: &ReactionConfig,
        attempt: u32,
    ) {
        let notice = FleetEvent::new(
            EventType::ReactionTriggered,
            &session.id,
            project_id,
            event.message.clone(),
        )
        .with_priority(cfg.priority.unwrap_or(event.priority))
        .with_data(serde_json::json!({"reactionKey": key, "attempt": attempt}));

        if let Err(e) = self.events(project_id).append(&notice).await {
            warn!(error = %e, "Failed to record notify reaction");
        }
        self.notify(project_id, &notice).await;
    }

    async fn react_spawn_review(
        &self,
        project_id: &str,
        session: &Session,
        key: &str,
        attempt: u32,
    ) {
        let Some(pr_url) = &session.pr else {
            warn!(session_id = %session.id, "spawn-review without a PR; skipping");
            return;
        };

        let mut prompt = format!(
            "Review the pull request at {} (branch `{}`).\n",
            pr_url, session.branch
        );
        if let Some(plan_id) = &session.plan_id
            && let Ok(plan) = self.plans.get_plan(project_id, plan_id).await
            && let Some(task) = plan.task_for_session(&session.id)
        {
            prompt.push_str(&format!("\nThe PR implements: {}\n", task.title));
            if !task.acceptance_criteria.is_empty() {
                prompt.push_str("\nAcceptance criteria to verify:\n");
                for criterion in &task.acceptance_criteria {
                    prompt.push_str(&format!("- {}\n", criterion));
                }
            }
            if !task.constraints.is_empty() {
                prompt.push_str("\nConstraints it must respect:\n");
                for constraint in &task.constraints {
                    prompt.push_str(&format!("- {}\n", constraint));
                }
            }
            if !task.affected_files.is_empty() {
                prompt.push_str("\nExpected to touch only:\n");
                for file in &task.affected_files {
                    prompt.push_str(&format!("- `{}`\n", file));
                }
            }
        }
        prompt.push_str(
            "\nPost your findings as review comments. End your summary with APPROVE or \
             REQUEST_CHANGES on its own line.",
        );

        let request = SpawnRequest::new(project_id, prompt)
            .with_branch(format!("review/{}", session.id))
            .with_summary(format!("Review of {}", session.id));
        match self.sessions.spawn(request).await {
            Ok(reviewer) => {
                info!(session_id = %session.id, reviewer = %reviewer.id, "Review session spawned");
                let event = FleetEvent::new(
                    EventType::ReactionTriggered,
                    &session.id,
                    project_id,
                    format!("Review session {} spawned for {}", reviewer.id, session.id),
                )
                .with_data(serde_json::json!({
                    "reactionKey": key,
                    "attempt": attempt,
                    "reviewSession": reviewer.id,
                }));
                if let Err(e) = self.events(project_id).append(&event).await {
                    warn!(error = %e, "Failed to record review spawn");
                }
            }
            Err(e) => warn!(session_id = %session.id, error = %e, "Review spawn failed"),
        }
    }

    /// Forward reviewer feedback to the coding session.
    async fn react_review_gate(
        &self,
        project_id: &str,
        session: &Session,
        cfg: &ReactionConfig,
        attempt: u32,
    ) {
        let Some(pr) = session
            .pr_number()
            .zip(session.pr.clone())
            .map(|(number, url)| PullRequest { number, url })
        else {
            warn!(session_id = %session.id, "review-gate without a PR; skipping");
            return;
        };
        let scm = self
            .config
            .project(project_id)
            .ok()
            .and_then(|p| p.scm.as_deref().and_then(|name| self.registry.scm(name)));
        let Some(scm) = scm else {
            return;
        };

        let reviews = match scm.reviews(&pr).await {
            Ok(reviews) => reviews,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Failed to fetch reviews");
                return;
            }
        };
        let comments = scm.pending_comments(&pr).await.unwrap_or_default();

        let mut message = cfg
            .message
            .clone()
            .unwrap_or_else(|| format!("Reviewers requested changes on PR #{}.", pr.number));

        let requesting: Vec<_> = reviews
            .iter()
            .filter(|r| {
                r.state == ReviewDecision::ChangesRequested
                    || (r.state == ReviewDecision::None
                        && parse_review_verdict(&r.body) == Some(ReviewDecision::ChangesRequested))
            })
            .collect();
        if !requesting.is_empty() {
            message.push_str("\n\n## Review feedback\n");
            for review in requesting {
                message.push_str(&format!("{}\n\n", review.body.trim()));
            }
        }
        if !comments.is_empty() {
            message.push_str("\n## Inline comments\n");
            for comment in &comments {
                match (&comment.path, comment.line) {
                    (Some(path), Some(line)) => {
                        message.push_str(&format!("- {}:{} — {}\n", path, line, comment.body));
                    }
                    (Some(path), None) => {
                        message.push_str(&format!("- {} — {}\n", path, comment.body));
                    }
                    _ => message.push_str(&format!("- {}\n", comment.body)),
                }
            }
        }
        if let Some(plan_id) = &session.plan_id
            && self.sibling_merges_since(project_id, session, plan_id).await > 0
        {
            let default_branch = self
                .config
                .project(project_id)
                .map(|p| p.default_branch.clone())
                .unwrap_or_else(|_| "main".to_string());
            message.push_str(&format!(
                "\nA sibling PR from your plan merged recently; rebase on {} while you \
                 address the feedback.\n",
                default_branch
            ));
        }
        message.push_str("\nAddress every point, push the changes, and re-request review.");

        if let Err(e) = self.sessions.send(project_id, &session.id, &message).await {
            warn!(session_id = %session.id, error = %e, "Review feedback send failed");
            return;
        }

        let round = match self.sessions.get(project_id, &session.id).await {
            Ok(mut fresh) => {
                let round = fresh.increment_review_attempts();
                if let Err(e) = self.sessions.persist(&fresh).await {
                    warn!(session_id = %session.id, error = %e, "Failed to persist review round");
                }
                round
            }
            Err(_) => attempt,
        };

        let event = FleetEvent::new(
            EventType::ReviewFeedbackSent,
            &session.id,
            project_id,
            format!("Review feedback forwarded to {} (round {})", session.id, round),
        )
        .with_data(serde_json::json!({"reviewRound": round, "attempt": attempt}));
        if let Err(e) = self.events(project_id).append(&event).await {
            warn!(error = %e, "Failed to record review feedback");
        }
    }

    async fn react_reconciliation(
        &self,
        project_id: &str,
        session: &Session,
        key: &str,
        attempt: u32,
    ) {
        // The reconciliation workflow is an external collaborator; a single
        // registered implementation handles every project.
        let Some(reconciler) = self.registry.reconciler("default") else {
            warn!(project_id, "No reconciler registered; skipping");
            return;
        };
        match reconciler
            .spawn_reconciliation(project_id, session.plan_id.as_deref())
            .await
        {
            Ok(()) => {
                let event = FleetEvent::new(
                    EventType::ReactionTriggered,
                    &session.id,
                    project_id,
                    format!("Reconciliation spawned for {}", project_id),
                )
                .with_data(serde_json::json!({"reactionKey": key, "attempt": attempt}));
                if let Err(e) = self.events(project_id).append(&event).await {
                    warn!(error = %e, "Failed to record reconciliation");
                }
            }
            Err(e) => warn!(project_id, error = %e, "Reconciliation spawn failed"),
        }
    }
}

fn join(names: &[&String]) -> String {
    names
        .iter()
        .map(|n| format!("`{}`", n))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_matches_only_the_tail() {
        let mut output = String::new();
        for i in 0..100 {
            output.push_str(&format!("line {}\n", i));
        }
        output.push_str("I am fixing CI now\n");
        assert!(agent_already_addressing("ci-failed", &output));

        // The indicator scrolled out of the inspected tail.
        let mut scrolled = String::from("fixing ci\n");
        for i in 0..100 {
            scrolled.push_str(&format!("line {}\n", i));
        }
        assert!(!agent_already_addressing("ci-failed", &scrolled));
    }

    #[test]
    fn dedup_is_per_reaction_key() {
        let output = "currently addressing review feedback from the PR";
        assert!(agent_already_addressing("changes-requested", output));
        assert!(!agent_already_addressing("ci-failed", output));
        assert!(!agent_already_addressing("stuck", output));
    }
}
