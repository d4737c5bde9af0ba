//! Plan execution: planning-agent supervision, approval, dependency-gated
//! task spawning, completion detection.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::fs;
use tracing::{info, warn};

use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::outcome::ProjectLessons;
use crate::paths::FleetPaths;
use crate::plugin::PluginRegistry;
use crate::plugin::types::IssueRequest;
use crate::session::{SessionManager, SessionStatus, SpawnRequest};
use crate::store::{EventStore, EventType, FleetEvent, OutcomeStore};

use super::graph::validate_dependencies;
use super::store::PlanStore;
use super::{Plan, PlanOutput, PlanStatus, PlanTask};

pub struct PlanService {
    config: Arc<FleetConfig>,
    paths: FleetPaths,
    registry: Arc<PluginRegistry>,
    sessions: Arc<SessionManager>,
}

impl PlanService {
    pub fn new(
        config: Arc<FleetConfig>,
        paths: FleetPaths,
        registry: Arc<PluginRegistry>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            config,
            paths,
            registry,
            sessions,
        }
    }

    fn store(&self, project_id: &str) -> PlanStore {
        PlanStore::new(self.paths.plans_dir(project_id))
    }

    fn events(&self, project_id: &str) -> EventStore {
        EventStore::with_max_events(self.paths.events_file(project_id), self.config.max_events)
    }

    async fn emit(&self, project_id: &str, event: FleetEvent) {
        if let Err(e) = self.events(project_id).append(&event).await {
            warn!(project_id, error = %e, "Failed to append plan event");
        }
    }

    /// Spawn a planning agent on a disposable `plan/<id>` branch. The plan
    /// becomes `ready` when the agent drops `<id>-output.json`.
    pub async fn create_plan(
        &self,
        project_id: &str,
        feature: &str,
        planning_prompt: &str,
    ) -> Result<Plan> {
        self.config.project(project_id)?;
        self.paths.ensure_project_root(project_id).await?;
        let store = self.store(project_id);
        store.init().await?;

        let id = store.next_id().await?;
        let mut plan = Plan::new(&id, project_id, feature);

        let request = SpawnRequest::new(project_id, planning_prompt)
            .with_branch(format!("plan/{}", id))
            .with_summary(format!("Planning: {}", feature));
        let session = self.sessions.spawn(request).await?;
        plan.planning_session_id = Some(session.id.clone());
        store.save(&plan).await?;

        self.emit(
            project_id,
            FleetEvent::new(
                EventType::PlanCreated,
                &session.id,
                project_id,
                format!("Plan {} created: {}", plan.id, feature),
            ),
        )
        .await;
        info!(plan_id = %plan.id, project = project_id, "Plan created");
        Ok(plan)
    }

    pub async fn get_plan(&self, project_id: &str, plan_id: &str) -> Result<Plan> {
        self.store(project_id).load(plan_id).await
    }

    pub async fn list_plans(&self, project_id: &str) -> Result<Vec<Plan>> {
        self.store(project_id).list().await
    }

    /// Advance `planning` plans: promote to `ready` when the output file
    /// appears and validates; fail when the planning session died without
    /// producing one. Called from the poll cycle.
    pub async fn poll_planning(&self, project_id: &str) -> Result<()> {
        let store = self.store(project_id);
        for mut plan in store.list().await? {
            if plan.status != PlanStatus::Planning {
                continue;
            }

            let output_path = self.paths.plan_output_file(project_id, &plan.id);
            match fs::read_to_string(&output_path).await {
                Ok(content) => {
                    match serde_json::from_str::<PlanOutput>(&content)
                        .map_err(FleetError::from)
                        .and_then(|output| {
                            validate_dependencies(&output.tasks)?;
                            Ok(output)
                        }) {
                        Ok(output) => {
                            plan.tasks = output.tasks;
                            plan.status = PlanStatus::Ready;
                            plan.touch();
                            store.save(&plan).await?;
                            self.emit(
                                project_id,
                                FleetEvent::new(
                                    EventType::PlanReady,
                                    &plan.id,
                                    project_id,
                                    format!("Plan {} is ready ({} tasks)", plan.id, plan.tasks.len()),
                                ),
                            )
                            .await;
                        }
                        Err(e) => {
                            self.fail_plan(&store, project_id, &mut plan, e.to_string())
                                .await?;
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // No output yet; fail only if the planning agent is gone.
                    let dead = match &plan.planning_session_id {
                        Some(session_id) => {
                            match self.sessions.get(project_id, session_id).await {
                                Ok(session) => session.status.is_terminal(),
                                Err(FleetError::SessionNotFound(_)) => true,
                                Err(_) => false,
                            }
                        }
                        None => true,
                    };
                    if dead {
                        self.fail_plan(
                            &store,
                            project_id,
                            &mut plan,
                            "planning session exited without output".to_string(),
                        )
                        .await?;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn fail_plan(
        &self,
        store: &PlanStore,
        project_id: &str,
        plan: &mut Plan,
        reason: String,
    ) -> Result<()> {
        warn!(plan_id = %plan.id, reason = %reason, "Plan failed");
        plan.status = PlanStatus::Failed;
        plan.error = Some(reason.clone());
        plan.touch();
        store.save(plan).await?;
        self.emit(
            project_id,
            FleetEvent::new(
                EventType::PlanFailed,
                &plan.id,
                project_id,
                format!("Plan {} failed: {}", plan.id, reason),
            ),
        )
        .await;
        Ok(())
    }

    /// Approve a `ready` plan: create tracker issues (best-effort per task),
    /// move to `executing`, and spawn every dependency-free task.
    pub async fn approve_plan(&self, project_id: &str, plan_id: &str) -> Result<Plan> {
        let store = self.store(project_id);
        let mut plan = store.load(plan_id).await?;
        if plan.status != PlanStatus::Ready {
            return Err(FleetError::PlanValidation(format!(
                "plan {} is {}; only ready plans can be approved",
                plan_id, plan.status
            )));
        }

        plan.status = PlanStatus::Approved;
        plan.touch();
        store.save(&plan).await?;
        self.emit(
            project_id,
            FleetEvent::new(
                EventType::PlanApproved,
                &plan.id,
                project_id,
                format!("Plan {} approved", plan.id),
            ),
        )
        .await;

        self.create_task_issues(project_id, &mut plan).await;

        plan.status = PlanStatus::Executing;
        plan.touch();
        store.save(&plan).await?;
        self.emit(
            project_id,
            FleetEvent::new(
                EventType::PlanExecuting,
                &plan.id,
                project_id,
                format!("Plan {} executing", plan.id),
            ),
        )
        .await;

        let lessons = self.lessons_section(project_id).await;
        let ready: Vec<String> = plan
            .tasks
            .iter()
            .filter(|t| t.dependencies.is_empty())
            .map(|t| t.id.clone())
            .collect();
        for task_id in ready {
            let sections: Vec<String> = lessons.iter().cloned().collect();
            if let Err(e) = self
                .spawn_task(project_id, &mut plan, &task_id, sections)
                .await
            {
                warn!(plan_id, task_id = %task_id, error = %e, "Task spawn failed");
                if let Some(task) = plan.task_mut(&task_id) {
                    task.error = Some(e.to_string());
                }
            }
        }
        store.save(&plan).await?;
        Ok(plan)
    }

    async fn create_task_issues(&self, project_id: &str, plan: &mut Plan) {
        let Ok(project) = self.config.project(project_id) else {
            return;
        };
        let tracker = project
            .tracker
            .as_deref()
            .and_then(|name| self.registry.tracker(name));
        let Some(tracker) = tracker else {
            // No tracker configured or registered: tasks run without issues.
            return;
        };

        for task in &mut plan.tasks {
            let mut body = task.description.clone();
            if !task.acceptance_criteria.is_empty() {
                body.push_str("\n\n## Acceptance criteria\n");
                for criterion in &task.acceptance_criteria {
                    body.push_str(&format!("- {}\n", criterion));
                }
            }
            let request = IssueRequest {
                title: task.title.clone(),
                body,
                labels: vec!["fleet".to_string()],
            };
            match tracker.create_issue(&request, project).await {
                Ok(issue) => {
                    task.issue_number = Some(issue.number);
                    task.issue_url = Some(issue.url);
                }
                Err(e) => {
                    // Continue: one broken issue must not sink the plan.
                    warn!(task_id = %task.id, error = %e, "Issue creation failed");
                    task.error = Some(format!("issue creation failed: {}", e));
                }
            }
        }
    }

    /// Spawn pending tasks whose every dependency has merged. Invoked by the
    /// lifecycle engine on each sibling merge. Returns spawned task ids.
    pub async fn spawn_ready_tasks(&self, project_id: &str, plan_id: &str) -> Result<Vec<String>> {
        let store = self.store(project_id);
        let mut plan = store.load(plan_id).await?;
        if plan.status != PlanStatus::Executing {
            return Ok(Vec::new());
        }

        let mut merged: HashSet<String> = HashSet::new();
        for task in &plan.tasks {
            if let Some(session_id) = &task.session_id
                && let Ok(session) = self.sessions.get(project_id, session_id).await
                && session.status == SessionStatus::Merged
            {
                merged.insert(task.id.clone());
            }
        }

        let ready: Vec<String> = plan
            .tasks
            .iter()
            .filter(|t| {
                t.session_id.is_none()
                    && t.dependencies.iter().all(|d| merged.contains(d))
            })
            .map(|t| t.id.clone())
            .collect();

        let lessons = self.lessons_section(project_id).await;
        let mut spawned = Vec::new();
        for task_id in ready {
            let mut sections: Vec<String> = lessons.iter().cloned().collect();
            if let Some(siblings) = self.sibling_context(project_id, &plan, &task_id).await {
                sections.push(siblings);
            }
            if let Some(diffs) = self.dependency_diffs(project_id, &plan, &task_id).await {
                sections.push(diffs);
            }
            match self.spawn_task(project_id, &mut plan, &task_id, sections).await {
                Ok(()) => spawned.push(task_id),
                Err(e) => {
                    warn!(plan_id, task_id = %task_id, error = %e, "Task spawn failed");
                    if let Some(task) = plan.task_mut(&task_id) {
                        task.error = Some(e.to_string());
                    }
                }
            }
        }
        store.save(&plan).await?;
        Ok(spawned)
    }

    async fn spawn_task(
        &self,
        project_id: &str,
        plan: &mut Plan,
        task_id: &str,
        sections: Vec<String>,
    ) -> Result<()> {
        let task = plan
            .task(task_id)
            .ok_or_else(|| FleetError::PlanValidation(format!("no task '{}'", task_id)))?
            .clone();

        let mut request = SpawnRequest::new(project_id, task_prompt(&task))
            .with_branch(format!("task/{}-{}", plan.id, task.id))
            .with_plan(&plan.id)
            .with_summary(&task.title);
        for section in sections {
            request = request.with_section(section);
        }

        let session = self.sessions.spawn(request).await?;
        let session_id = session.id.clone();
        if let Some(task) = plan.task_mut(task_id) {
            task.session_id = Some(session_id.clone());
        }
        plan.touch();

        self.emit(
            project_id,
            FleetEvent::new(
                EventType::PlanTaskSpawned,
                &session_id,
                project_id,
                format!("Plan {} task {} spawned as {}", plan.id, task_id, session_id),
            )
            .with_data(serde_json::json!({
                "planId": plan.id,
                "taskId": task_id,
            })),
        )
        .await;
        Ok(())
    }

    /// True exactly once: when every task that has a session reached a
    /// terminal status and the plan flips to `done`. Sessionless tasks
    /// (failed issue creation) neither complete nor block.
    pub async fn check_plan_completion(&self, project_id: &str, plan_id: &str) -> Result<bool> {
        let store = self.store(project_id);
        let mut plan = store.load(plan_id).await?;
        if plan.status != PlanStatus::Executing {
            return Ok(false);
        }

        let mut any_session = false;
        for task in &plan.tasks {
            let Some(session_id) = &task.session_id else {
                continue;
            };
            any_session = true;
            let terminal = match self.sessions.get(project_id, session_id).await {
                Ok(session) => session.status.is_terminal(),
                // Archived by an explicit kill: terminal.
                Err(FleetError::SessionNotFound(_)) => true,
                Err(e) => return Err(e),
            };
            if !terminal {
                return Ok(false);
            }
        }
        if !any_session {
            return Ok(false);
        }

        plan.status = PlanStatus::Done;
        plan.touch();
        store.save(&plan).await?;
        self.emit(
            project_id,
            FleetEvent::new(
                EventType::PlanComplete,
                &plan.id,
                project_id,
                format!("Plan {} complete", plan.id),
            ),
        )
        .await;
        info!(plan_id, project = project_id, "Plan complete");
        Ok(true)
    }

    async fn lessons_section(&self, project_id: &str) -> Option<String> {
        let outcomes = OutcomeStore::new(self.paths.outcomes_file(project_id))
            .recent(crate::outcome::DEFAULT_LESSON_WINDOW)
            .await
            .ok()?;
        ProjectLessons::derive(&outcomes).map(|l| l.render())
    }

    async fn sibling_context(
        &self,
        project_id: &str,
        plan: &Plan,
        task_id: &str,
    ) -> Option<String> {
        let siblings = self
            .sessions
            .active_plan_siblings(project_id, &plan.id, task_id)
            .await
            .ok()?;
        if siblings.is_empty() {
            return None;
        }
        let mut out = String::from("## Sibling sessions working in parallel\n");
        for sibling in siblings {
            out.push_str(&format!(
                "- {} on `{}`: {}\n",
                sibling.id,
                sibling.branch,
                sibling.summary.as_deref().unwrap_or("(no summary)")
            ));
        }
        out.push_str("Coordinate through the issue tracker; avoid touching their files.");
        Some(out)
    }

    async fn dependency_diffs(
        &self,
        project_id: &str,
        plan: &Plan,
        task_id: &str,
    ) -> Option<String> {
        let task = plan.task(task_id)?;
        let project = self.config.project(project_id).ok()?;
        let scm = project.scm.as_deref().and_then(|name| self.registry.scm(name))?;

        let mut out = String::from("## Merged dependencies\n");
        let mut any = false;
        for dep_id in &task.dependencies {
            let dep = plan.task(dep_id)?;
            let session_id = dep.session_id.as_deref()?;
            let Ok(session) = self.sessions.get(project_id, session_id).await else {
                continue;
            };
            let Some(pr_url) = &session.pr else { continue };
            let Some(number) = session.pr_number() else {
                continue;
            };
            let pr = crate::plugin::types::PullRequest {
                number,
                url: pr_url.clone(),
            };
            if let Ok(size) = scm.pr_summary(&pr).await {
                out.push_str(&format!(
                    "- {} (PR #{}): +{} -{} — already on the default branch\n",
                    dep.title, number, size.additions, size.deletions
                ));
                any = true;
            }
        }
        any.then_some(out)
    }
}

fn task_prompt(task: &PlanTask) -> String {
    let mut prompt = format!("# {}\n\n{}\n", task.title, task.description);
    if let Some(issue_url) = &task.issue_url {
        prompt.push_str(&format!("\nTracked at: {}\n", issue_url));
    }
    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\n## Acceptance criteria\n");
        for criterion in &task.acceptance_criteria {
            prompt.push_str(&format!("- {}\n", criterion));
        }
    }
    if !task.constraints.is_empty() {
        prompt.push_str("\n## Constraints\n");
        for constraint in &task.constraints {
            prompt.push_str(&format!("- {}\n", constraint));
        }
    }
    if !task.affected_files.is_empty() {
        prompt.push_str("\n## Files expected to change\n");
        for file in &task.affected_files {
            prompt.push_str(&format!("- `{}`\n", file));
        }
    }
    if let Some(context) = &task.shared_context {
        prompt.push_str(&format!("\n## Shared context\n{}\n", context));
    }
    prompt
}
