//! The polling loop and transition engine.
//!
//! One background cycle per process re-classifies every non-terminal session,
//! emits events for transitions, dispatches configured reactions, and drives
//! plan, outcome and retrospective side effects. The cycle is best-effort:
//! a single session's probe failure never aborts its peers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{FleetConfig, ReactionAction};
use crate::error::{FleetError, Result};
use crate::outcome::{OutcomeService, RetrospectiveService};
use crate::paths::FleetPaths;
use crate::plan::PlanService;
use crate::plugin::PluginRegistry;
use crate::session::{Session, SessionManager, SessionStatus};
use crate::store::{EventStore, EventType, FleetEvent};

use super::classify::{ClassifyContext, classify_session};
use super::events_map::{reaction_key, status_event_type, transition_message};
use super::tracker::ReactionTracker;

pub(crate) fn scoped_id(project_id: &str, session_id: &str) -> String {
    format!("{}/{}", project_id, session_id)
}

pub struct LifecycleManager {
    pub(crate) config: Arc<FleetConfig>,
    pub(crate) paths: FleetPaths,
    pub(crate) registry: Arc<PluginRegistry>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) plans: Arc<PlanService>,
    pub(crate) outcomes: OutcomeService,
    pub(crate) retrospectives: RetrospectiveService,

    /// In-memory tracked status, the "old" side of transition detection.
    /// Keyed by `project/session`.
    pub(crate) statuses: Mutex<HashMap<String, SessionStatus>>,
    /// Reaction retry state, keyed by (`project/session`, reaction key).
    pub(crate) trackers: Mutex<HashMap<(String, String), ReactionTracker>>,
    /// Projects already announced as all-complete; cleared when a
    /// non-terminal session reappears.
    all_complete: Mutex<HashSet<String>>,

    /// Re-entrancy guard: timer ticks skip while a cycle (or a direct
    /// `check`) holds this.
    cycle_lock: tokio::sync::Mutex<()>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl LifecycleManager {
    pub fn new(
        config: Arc<FleetConfig>,
        paths: FleetPaths,
        registry: Arc<PluginRegistry>,
        sessions: Arc<SessionManager>,
        plans: Arc<PlanService>,
    ) -> Self {
        Self {
            outcomes: OutcomeService::new(Arc::clone(&config), paths.clone()),
            retrospectives: RetrospectiveService::new(Arc::clone(&sessions)),
            config,
            paths,
            registry,
            sessions,
            plans,
            statuses: Mutex::new(HashMap::new()),
            trackers: Mutex::new(HashMap::new()),
            all_complete: Mutex::new(HashSet::new()),
            cycle_lock: tokio::sync::Mutex::new(()),
            loop_task: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
        }
    }

    pub(crate) fn events(&self, project_id: &str) -> EventStore {
        EventStore::with_max_events(self.paths.events_file(project_id), self.config.max_events)
    }

    /// Start the background polling loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut task_guard = self.loop_task.lock();
        if task_guard.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        *self.shutdown_tx.lock() = Some(tx);

        let manager = Arc::clone(self);
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick is the interval start

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match manager.cycle_lock.try_lock() {
                            Ok(_guard) => {
                                if let Err(e) = manager.run_cycle().await {
                                    warn!(error = %e, "Poll cycle failed");
                                }
                            }
                            Err(_) => {
                                debug!("Poll tick skipped; previous cycle still running");
                            }
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Polling loop stopped");
        });
        *task_guard = Some(handle);
        info!(interval_secs = interval.as_secs(), "Lifecycle polling started");
    }

    /// Stop the timer and wait for any in-flight cycle to finish naturally.
    /// After this returns the lifecycle appends no further events.
    pub async fn stop(&self) {
        let tx = self.shutdown_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(true);
        }
        let handle = self.loop_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Lifecycle polling stopped");
    }

    /// Run one full poll cycle immediately, serialized against the timer.
    pub async fn poll_once(&self) -> Result<()> {
        let _guard = self.cycle_lock.lock().await;
        self.run_cycle().await
    }

    /// Push-based revalidation of a single session, serialized against the
    /// polling cycle. A no-op for terminal sessions.
    pub async fn check(&self, session_id: &str) -> Result<()> {
        let _guard = self.cycle_lock.lock().await;
        let session = self
            .sessions
            .find(session_id)
            .await?
            .ok_or_else(|| FleetError::SessionNotFound(session_id.to_string()))?;
        let project_id = session.project.clone();
        self.check_session(&project_id, &session).await
    }

    async fn run_cycle(&self) -> Result<()> {
        for project_id in self.config.projects.keys() {
            if let Err(e) = self.poll_project(project_id).await {
                warn!(project_id, error = %e, "Project poll failed");
            }
        }
        Ok(())
    }

    async fn poll_project(&self, project_id: &str) -> Result<()> {
        self.paths.ensure_project_root(project_id).await?;

        if let Err(e) = self.plans.poll_planning(project_id).await {
            warn!(project_id, error = %e, "Plan polling failed");
        }

        let sessions = self.sessions.list(project_id).await?;

        // Concurrent fan-out; each failure is contained to its session.
        let checks = sessions
            .iter()
            .map(|session| self.check_session(project_id, session));
        for (session, result) in sessions.iter().zip(futures::future::join_all(checks).await) {
            if let Err(e) = result {
                warn!(session_id = %session.id, error = %e, "Session check failed");
            }
        }

        self.check_all_complete(project_id, &sessions).await;
        self.prune(project_id, &sessions);
        Ok(())
    }

    pub(crate) async fn check_session(&self, project_id: &str, listed: &Session) -> Result<()> {
        let scoped = scoped_id(project_id, &listed.id);
        let mut old = {
            let statuses = self.statuses.lock();
            statuses.get(&scoped).copied().unwrap_or(listed.status)
        };
        // A session restored behind our back re-enters the live set.
        if old.is_terminal() && !listed.status.is_terminal() {
            old = listed.status;
        }
        if old.is_terminal() {
            return Ok(());
        }

        let project = self.config.project(project_id)?;
        let ctx = ClassifyContext {
            runtime: self
                .registry
                .runtime(project.runtime_plugin(&self.config.defaults)),
            agent: self
                .registry
                .agent(project.agent_plugin(&self.config.defaults)),
            scm: project
                .scm
                .as_deref()
                .and_then(|name| self.registry.scm(name)),
            project,
        };
        let result = classify_session(&ctx, listed, old).await;

        // Persist a freshly-detected PR in the same cycle, before reacting.
        let mut session = listed.clone();
        if let Some(pr) = &result.detected_pr {
            match self.sessions.get(project_id, &listed.id).await {
                Ok(mut fresh) => {
                    fresh.pr = Some(pr.url.clone());
                    if let Err(e) = self.sessions.persist(&fresh).await {
                        warn!(session_id = %listed.id, error = %e, "Failed to persist detected PR");
                    }
                    session = fresh;
                }
                Err(e) => {
                    warn!(session_id = %listed.id, error = %e, "Failed to reload session");
                    session.pr = Some(pr.url.clone());
                }
            }
        }
        session.activity = result.activity;

        let new = result.status;
        self.statuses.lock().insert(scoped, new);

        if new != old {
            self.handle_transition(project_id, &session, old, new, result.output.as_deref())
                .await?;
        } else {
            self.redispatch_standing_reaction(project_id, &session, new, result.output.as_deref())
                .await;
        }
        Ok(())
    }

    async fn handle_transition(
        &self,
        project_id: &str,
        session: &Session,
        old: SessionStatus,
        new: SessionStatus,
        output: Option<&str>,
    ) -> Result<()> {
        info!(
            session_id = %session.id,
            project = project_id,
            old = %old,
            new = %new,
            "Status transition"
        );

        let session = self
            .sessions
            .update_status(project_id, &session.id, new)
            .await
            .map(|mut persisted| {
                persisted.activity = session.activity;
                persisted
            })
            .unwrap_or_else(|e| {
                warn!(session_id = %session.id, error = %e, "Failed to persist status");
                let mut fallback = session.clone();
                fallback.status = new;
                fallback
            });
        let events = self.events(project_id);

        // Leaving ci_failed tells us whether the fix loop worked; this event
        // pair is the input for reaction analytics.
        if old == SessionStatus::CiFailed {
            let attempts = self.tracker_attempts(project_id, &session, "ci-failed");
            let event = if new.is_pr_healthy() {
                FleetEvent::new(
                    EventType::CiPassing,
                    &session.id,
                    project_id,
                    format!("CI recovered on {}'s PR", session.id),
                )
                .with_data(serde_json::json!({"resolved": true, "attempt": attempts}))
            } else {
                FleetEvent::new(
                    EventType::CiFixFailed,
                    &session.id,
                    project_id,
                    format!("CI fix loop on {} ended at {}", session.id, new),
                )
                .with_data(serde_json::json!({"attempt": attempts}))
            };
            events.append(&event).await?;
        }

        // Re-entering the old status later starts a fresh retry budget.
        if let Some(old_event) = status_event_type(old)
            && let Some(old_key) = reaction_key(old_event)
        {
            self.clear_tracker(project_id, &session, old_key).await;
        }

        let Some(event_type) = status_event_type(new) else {
            self.coordinate(project_id, &session, old, new).await;
            return Ok(());
        };
        let mut event = FleetEvent::new(
            event_type,
            &session.id,
            project_id,
            transition_message(&session, new),
        );
        if let Some(plan_id) = &session.plan_id {
            event = event.with_data(serde_json::json!({"planId": plan_id}));
        }
        events.append(&event).await?;

        match reaction_key(event_type)
            .and_then(|key| self.config.reaction_for(project_id, key).map(|cfg| (key, cfg.clone())))
        {
            Some((key, cfg))
                if cfg.auto != Some(false) || cfg.action == ReactionAction::Notify =>
            {
                self.dispatch_reaction(project_id, &session, &event, key, &cfg, output)
                    .await;
            }
            _ => {
                // No automated handling: non-info transitions go to humans.
                if event.priority != crate::store::EventPriority::Info {
                    self.notify(project_id, &event).await;
                }
            }
        }

        self.coordinate(project_id, &session, old, new).await;
        Ok(())
    }

    /// A session holding a reaction-bearing status keeps feeding its retry
    /// budget every cycle. Only nudge-style actions re-fire; one-shot actions
    /// (spawn-review, review-gate, reconciliation) run on transitions alone.
    async fn redispatch_standing_reaction(
        &self,
        project_id: &str,
        session: &Session,
        status: SessionStatus,
        output: Option<&str>,
    ) {
        if status.is_terminal() {
            return;
        }
        let Some(event_type) = status_event_type(status) else {
            return;
        };
        let Some(key) = reaction_key(event_type) else {
            return;
        };
        let Some(cfg) = self.config.reaction_for(project_id, key).cloned() else {
            return;
        };
        if !matches!(cfg.action, ReactionAction::SendToAgent | ReactionAction::Notify) {
            return;
        }
        if cfg.auto == Some(false) && cfg.action != ReactionAction::Notify {
            return;
        }

        let event = FleetEvent::new(
            event_type,
            &session.id,
            project_id,
            transition_message(session, status),
        );
        self.dispatch_reaction(project_id, session, &event, key, &cfg, output)
            .await;
    }

    async fn coordinate(
        &self,
        project_id: &str,
        session: &Session,
        old: SessionStatus,
        new: SessionStatus,
    ) {
        if new == SessionStatus::Merged
            && let Some(plan_id) = session.plan_id.clone()
        {
            match self.plans.spawn_ready_tasks(project_id, &plan_id).await {
                Ok(spawned) if !spawned.is_empty() => {
                    info!(plan_id, ?spawned, "Dependency-gated tasks spawned");
                }
                Ok(_) => {}
                Err(e) => warn!(plan_id, error = %e, "spawn_ready_tasks failed"),
            }
            self.send_sibling_rebases(project_id, session, &plan_id).await;
        }

        if !new.is_terminal() {
            return;
        }

        if let Some(plan_id) = session.plan_id.clone() {
            match self.plans.check_plan_completion(project_id, &plan_id).await {
                Ok(true) => {
                    self.run_plan_complete_reaction(project_id, &plan_id).await;
                }
                Ok(false) => {}
                Err(e) => warn!(plan_id, error = %e, "Plan completion check failed"),
            }
        }

        match self.outcomes.capture(project_id, session, old, new).await {
            Ok(outcome) => {
                if new != SessionStatus::Merged {
                    self.maybe_spawn_retrospective(project_id, session, &outcome)
                        .await;
                }
            }
            Err(e) => warn!(session_id = %session.id, error = %e, "Outcome capture failed"),
        }
    }

    async fn run_plan_complete_reaction(&self, project_id: &str, plan_id: &str) {
        let Some(cfg) = self.config.reaction_for(project_id, "plan-complete").cloned() else {
            return;
        };
        let event = FleetEvent::new(
            EventType::PlanComplete,
            plan_id,
            project_id,
            format!("Plan {} complete", plan_id),
        );
        if cfg.auto != Some(false) || cfg.action == ReactionAction::Notify {
            let mut placeholder = Session::new(plan_id, project_id, format!("plan/{}", plan_id));
            placeholder.plan_id = Some(plan_id.to_string());
            self.dispatch_reaction(project_id, &placeholder, &event, "plan-complete", &cfg, None)
                .await;
        }
    }

    async fn maybe_spawn_retrospective(
        &self,
        project_id: &str,
        session: &Session,
        outcome: &crate::store::Outcome,
    ) {
        let Some(cfg) = self.config.reaction_for(project_id, "session-failed") else {
            return;
        };
        if cfg.action != ReactionAction::SpawnRetrospective {
            return;
        }
        match self.retrospectives.spawn(project_id, session, outcome).await {
            Ok(retro) => {
                let event = FleetEvent::new(
                    EventType::RetrospectiveSpawned,
                    &session.id,
                    project_id,
                    format!("Retrospective {} spawned for {}", retro.id, session.id),
                )
                .with_data(serde_json::json!({"retrospectiveSession": retro.id}));
                if let Err(e) = self.events(project_id).append(&event).await {
                    warn!(error = %e, "Failed to record retrospective event");
                }
            }
            Err(e) => warn!(session_id = %session.id, error = %e, "Retrospective spawn failed"),
        }
    }

    /// Tell every still-active plan sibling to rebase on the freshly merged
    /// work. Best-effort and unthrottled.
    async fn send_sibling_rebases(&self, project_id: &str, merged: &Session, plan_id: &str) {
        let siblings = match self
            .sessions
            .active_plan_siblings(project_id, plan_id, &merged.id)
            .await
        {
            Ok(siblings) => siblings,
            Err(e) => {
                warn!(plan_id, error = %e, "Failed to list plan siblings");
                return;
            }
        };
        let default_branch = self
            .config
            .project(project_id)
            .map(|p| p.default_branch.clone())
            .unwrap_or_else(|_| "main".to_string());
        let pr_ref = merged
            .pr_number()
            .map(|n| format!("PR #{}", n))
            .unwrap_or_else(|| format!("session {}", merged.id));

        for sibling in siblings {
            let message = format!(
                "{} from your plan just merged into {branch}. Rebase your branch on the \
                 latest {branch} before continuing and resolve any conflicts with the \
                 merged changes.",
                pr_ref,
                branch = default_branch,
            );
            match self.sessions.send(project_id, &sibling.id, &message).await {
                Ok(()) => {
                    let event = FleetEvent::new(
                        EventType::SessionRebaseSent,
                        &sibling.id,
                        project_id,
                        format!("Rebase instruction sent to {} after {}", sibling.id, pr_ref),
                    )
                    .with_data(serde_json::json!({
                        "mergedSession": merged.id,
                        "planId": plan_id,
                    }));
                    if let Err(e) = self.events(project_id).append(&event).await {
                        warn!(error = %e, "Failed to record rebase event");
                    }
                }
                Err(e) => {
                    warn!(sibling = %sibling.id, error = %e, "Rebase send failed");
                }
            }
        }
    }

    async fn check_all_complete(&self, project_id: &str, sessions: &[Session]) {
        if sessions.is_empty() {
            return;
        }
        let all_terminal = {
            let statuses = self.statuses.lock();
            sessions.iter().all(|s| {
                statuses
                    .get(&scoped_id(project_id, &s.id))
                    .copied()
                    .unwrap_or(s.status)
                    .is_terminal()
            })
        };

        let newly_complete = {
            let mut latch = self.all_complete.lock();
            if all_terminal {
                latch.insert(project_id.to_string())
            } else {
                latch.remove(project_id);
                false
            }
        };

        if newly_complete {
            let event = FleetEvent::new(
                EventType::SummaryAllComplete,
                project_id,
                project_id,
                format!("All sessions in {} reached a terminal state", project_id),
            );
            if let Err(e) = self.events(project_id).append(&event).await {
                warn!(project_id, error = %e, "Failed to record summary event");
            }
            self.notify(project_id, &event).await;
        }
    }

    /// Drop in-memory state for sessions no longer in the list. The only GC
    /// for killed and cleaned-up sessions.
    fn prune(&self, project_id: &str, sessions: &[Session]) {
        let live: HashSet<String> = sessions
            .iter()
            .map(|s| scoped_id(project_id, &s.id))
            .collect();
        let prefix = format!("{}/", project_id);

        self.statuses
            .lock()
            .retain(|key, _| !key.starts_with(&prefix) || live.contains(key));
        self.trackers
            .lock()
            .retain(|(key, _), _| !key.starts_with(&prefix) || live.contains(key));
    }

    /// Fan an event out to every notifier routed for its priority. Failures
    /// are swallowed per notifier.
    pub(crate) async fn notify(&self, project_id: &str, event: &FleetEvent) {
        let names = self
            .config
            .notification_routing
            .route(event.priority)
            .to_vec();
        for name in names {
            match self.registry.notifier(&name) {
                Some(notifier) => {
                    if let Err(e) = notifier.notify(event).await {
                        warn!(notifier = %name, error = %e, "Notifier failed");
                    }
                }
                None => {
                    warn!(notifier = %name, project_id, "Notifier not registered");
                }
            }
        }
    }

    // Tracker plumbing. In-memory state is authoritative while the process
    // lives; metadata mirrors it for restarts.

    pub(crate) fn tracker_attempts(
        &self,
        project_id: &str,
        session: &Session,
        key: &str,
    ) -> u32 {
        let scoped = scoped_id(project_id, &session.id);
        self.trackers
            .lock()
            .get(&(scoped, key.to_string()))
            .map(|t| t.attempts)
            .unwrap_or_else(|| session.reaction_attempts(key))
    }

    pub(crate) async fn increment_tracker(
        &self,
        project_id: &str,
        session: &Session,
        key: &str,
    ) -> ReactionTracker {
        let snapshot = {
            let scoped = scoped_id(project_id, &session.id);
            let mut trackers = self.trackers.lock();
            let tracker = trackers
                .entry((scoped, key.to_string()))
                .or_insert_with(|| ReactionTracker::restore(session, key));
            tracker.attempts += 1;
            tracker.clone()
        };

        // Lazy persistence; a failed write costs at most one retry after a
        // restart.
        match self.sessions.get(project_id, &session.id).await {
            Ok(mut fresh) => {
                fresh.set_reaction_tracker(key, snapshot.attempts, snapshot.first_triggered);
                if let Err(e) = self.sessions.persist(&fresh).await {
                    warn!(session_id = %session.id, error = %e, "Failed to persist tracker");
                }
            }
            // Plan-scoped reactions track against a plan id, not a session.
            Err(FleetError::SessionNotFound(_)) => {}
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Failed to persist tracker");
            }
        }
        snapshot
    }

    pub(crate) fn mark_tracker_escalated(&self, project_id: &str, session_id: &str, key: &str) {
        let scoped = scoped_id(project_id, session_id);
        if let Some(tracker) = self.trackers.lock().get_mut(&(scoped, key.to_string())) {
            tracker.escalated = true;
        }
    }

    pub(crate) async fn clear_tracker(&self, project_id: &str, session: &Session, key: &str) {
        let scoped = scoped_id(project_id, &session.id);
        self.trackers.lock().remove(&(scoped, key.to_string()));

        if session.reaction_attempts(key) > 0 {
            match self.sessions.get(project_id, &session.id).await {
                Ok(mut fresh) => {
                    fresh.clear_reaction_tracker(key);
                    if let Err(e) = self.sessions.persist(&fresh).await {
                        warn!(session_id = %session.id, error = %e, "Failed to clear tracker");
                    }
                }
                Err(FleetError::SessionNotFound(_)) => {}
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Failed to clear tracker");
                }
            }
        }
    }
}
