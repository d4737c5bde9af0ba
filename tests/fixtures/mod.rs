//! Scenario-programmable mock plugins and a wired-up test harness.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tempfile::TempDir;

use fleet_commander::config::PluginDefaults;
use fleet_commander::error::{FleetError, Result};
use fleet_commander::plugin::types::{
    ActivityState, CiCheck, CiSummary, Issue, IssueRequest, Mergeability, PendingComment, PrSize,
    PrState, PullRequest, Review, ReviewDecision, RuntimeContext, RuntimeHandle,
};
use fleet_commander::plugin::{
    AgentProbe, Notifier, PluginRegistry, Reconciler, Runtime, Scm, Tracker, Workspace,
};
use fleet_commander::{
    EventStore, FleetConfig, FleetEvent, FleetPaths, LifecycleManager, NotificationRouting,
    PlanService, ProjectConfig, ReactionConfig, Session, SessionManager,
};

pub const PROJECT: &str = "web";

#[derive(Default)]
pub struct MockRuntime {
    pub alive: Mutex<HashMap<String, bool>>,
    pub outputs: Mutex<HashMap<String, String>>,
    /// `(handle id, message)` in send order.
    pub sent: Mutex<Vec<(String, String)>>,
    pub fail_create: Mutex<bool>,
    pub destroyed: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn messages_to(&self, handle_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(id, _)| id == handle_id)
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn create(&self, context: &RuntimeContext) -> Result<RuntimeHandle> {
        if *self.fail_create.lock() {
            return Err(FleetError::Other("runtime backend down".to_string()));
        }
        let id = format!("rt-{}", context.key);
        self.alive.lock().insert(id.clone(), true);
        self.outputs.lock().entry(id.clone()).or_default();
        Ok(RuntimeHandle {
            id,
            runtime_name: "mock".to_string(),
            data: serde_json::json!({"workdir": context.workdir}),
        })
    }

    async fn destroy(&self, handle: &RuntimeHandle) -> Result<()> {
        self.alive.lock().insert(handle.id.clone(), false);
        self.destroyed.lock().push(handle.id.clone());
        Ok(())
    }

    async fn send_message(&self, handle: &RuntimeHandle, text: &str) -> Result<()> {
        self.sent.lock().push((handle.id.clone(), text.to_string()));
        Ok(())
    }

    async fn get_output(&self, handle: &RuntimeHandle, _line_count: usize) -> Result<String> {
        Ok(self.outputs.lock().get(&handle.id).cloned().unwrap_or_default())
    }

    async fn is_alive(&self, handle: &RuntimeHandle) -> Result<bool> {
        Ok(self.alive.lock().get(&handle.id).copied().unwrap_or(false))
    }
}

/// Derives activity from markers in the terminal text; `[waiting]`,
/// `[idle]`, `[exited]`, anything else counts as active.
#[derive(Default)]
pub struct MockAgent {
    pub running: Mutex<HashMap<String, bool>>,
}

#[async_trait]
impl AgentProbe for MockAgent {
    fn detect_activity(&self, terminal_output: &str) -> Option<ActivityState> {
        if terminal_output.contains("[waiting]") {
            Some(ActivityState::WaitingInput)
        } else if terminal_output.contains("[idle]") {
            Some(ActivityState::Idle)
        } else if terminal_output.contains("[exited]") {
            Some(ActivityState::Exited)
        } else {
            Some(ActivityState::Active)
        }
    }

    async fn is_process_running(&self, handle: &RuntimeHandle) -> Result<bool> {
        Ok(self.running.lock().get(&handle.id).copied().unwrap_or(true))
    }
}

pub struct MockWorkspace {
    root: PathBuf,
    pub fail: Mutex<bool>,
    pub destroyed: Mutex<Vec<PathBuf>>,
}

impl MockWorkspace {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            fail: Mutex::new(false),
            destroyed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Workspace for MockWorkspace {
    async fn create(
        &self,
        session_id: &str,
        _branch: &str,
        _project: &ProjectConfig,
    ) -> Result<PathBuf> {
        if *self.fail.lock() {
            return Err(FleetError::Other("disk full".to_string()));
        }
        let path = self.root.join(session_id);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    async fn destroy(&self, path: &Path) -> Result<()> {
        self.destroyed.lock().push(path.to_path_buf());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockTracker {
    pub issues: Mutex<HashMap<u64, Issue>>,
    pub created: Mutex<Vec<Issue>>,
    pub fail_create: Mutex<bool>,
    next: AtomicU64,
}

impl MockTracker {
    pub fn seed_issue(&self, number: u64, title: &str) {
        self.issues.lock().insert(
            number,
            Issue {
                number,
                title: title.to_string(),
                url: format!("https://example.com/acme/web/issues/{}", number),
                body: None,
            },
        );
    }
}

#[async_trait]
impl Tracker for MockTracker {
    async fn get_issue(&self, number: u64, _project: &ProjectConfig) -> Result<Issue> {
        self.issues
            .lock()
            .get(&number)
            .cloned()
            .ok_or_else(|| FleetError::Other(format!("issue {} not found", number)))
    }

    async fn create_issue(&self, request: &IssueRequest, _project: &ProjectConfig) -> Result<Issue> {
        if *self.fail_create.lock() {
            return Err(FleetError::Other("tracker unavailable".to_string()));
        }
        let number = 100 + self.next.fetch_add(1, Ordering::SeqCst);
        let issue = Issue {
            number,
            title: request.title.clone(),
            url: format!("https://example.com/acme/web/issues/{}", number),
            body: Some(request.body.clone()),
        };
        self.created.lock().push(issue.clone());
        Ok(issue)
    }
}

/// Per-PR scripted answers for every SCM probe.
#[derive(Clone)]
pub struct PrScript {
    pub state: PrState,
    pub ci: CiSummary,
    pub checks: Vec<CiCheck>,
    pub review: ReviewDecision,
    pub mergeable: bool,
    pub reviews: Vec<Review>,
    pub comments: Vec<PendingComment>,
    pub size: PrSize,
}

impl Default for PrScript {
    fn default() -> Self {
        Self {
            state: PrState::Open,
            ci: CiSummary::None,
            checks: Vec::new(),
            review: ReviewDecision::None,
            mergeable: false,
            reviews: Vec::new(),
            comments: Vec::new(),
            size: PrSize {
                additions: 40,
                deletions: 12,
            },
        }
    }
}

#[derive(Default)]
pub struct MockScm {
    /// PRs returned by `detect_pr`, keyed by session id.
    pub detectable: Mutex<HashMap<String, PullRequest>>,
    pub prs: Mutex<HashMap<u64, PrScript>>,
}

impl MockScm {
    pub fn script(&self, number: u64, f: impl FnOnce(&mut PrScript)) {
        let mut prs = self.prs.lock();
        let script = prs.entry(number).or_default();
        f(script);
    }

    fn with_pr<T>(&self, pr: &PullRequest, f: impl FnOnce(&PrScript) -> T) -> Result<T> {
        self.prs
            .lock()
            .get(&pr.number)
            .map(f)
            .ok_or_else(|| FleetError::Other(format!("no script for PR #{}", pr.number)))
    }
}

#[async_trait]
impl Scm for MockScm {
    async fn detect_pr(
        &self,
        session: &Session,
        _project: &ProjectConfig,
    ) -> Result<Option<PullRequest>> {
        Ok(self.detectable.lock().get(&session.id).cloned())
    }

    async fn pr_state(&self, pr: &PullRequest) -> Result<PrState> {
        self.with_pr(pr, |s| s.state)
    }

    async fn ci_summary(&self, pr: &PullRequest) -> Result<CiSummary> {
        self.with_pr(pr, |s| s.ci)
    }

    async fn ci_checks(&self, pr: &PullRequest) -> Result<Vec<CiCheck>> {
        self.with_pr(pr, |s| s.checks.clone())
    }

    async fn review_decision(&self, pr: &PullRequest) -> Result<ReviewDecision> {
        self.with_pr(pr, |s| s.review)
    }

    async fn reviews(&self, pr: &PullRequest) -> Result<Vec<Review>> {
        self.with_pr(pr, |s| s.reviews.clone())
    }

    async fn pending_comments(&self, pr: &PullRequest) -> Result<Vec<PendingComment>> {
        self.with_pr(pr, |s| s.comments.clone())
    }

    async fn mergeability(&self, pr: &PullRequest) -> Result<Mergeability> {
        self.with_pr(pr, |s| Mergeability {
            mergeable: s.mergeable,
            reason: None,
        })
    }

    async fn list_open_prs(&self, _project: &ProjectConfig) -> Result<Vec<PullRequest>> {
        Ok(self
            .prs
            .lock()
            .iter()
            .filter(|(_, s)| s.state == PrState::Open)
            .map(|(number, _)| PullRequest {
                number: *number,
                url: pr_url(*number),
            })
            .collect())
    }

    async fn pr_summary(&self, pr: &PullRequest) -> Result<PrSize> {
        self.with_pr(pr, |s| s.size)
    }
}

#[derive(Default)]
pub struct MockNotifier {
    pub received: Mutex<Vec<FleetEvent>>,
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, event: &FleetEvent) -> Result<()> {
        self.received.lock().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockReconciler {
    pub calls: Mutex<Vec<(String, Option<String>)>>,
}

#[async_trait]
impl Reconciler for MockReconciler {
    async fn spawn_reconciliation(&self, project_id: &str, plan_id: Option<&str>) -> Result<()> {
        self.calls
            .lock()
            .push((project_id.to_string(), plan_id.map(String::from)));
        Ok(())
    }
}

pub fn pr_url(number: u64) -> String {
    format!("https://example.com/acme/web/pull/{}", number)
}

pub struct Harness {
    pub dir: TempDir,
    pub config: Arc<FleetConfig>,
    pub paths: FleetPaths,
    pub registry: Arc<PluginRegistry>,
    pub sessions: Arc<SessionManager>,
    pub plans: Arc<PlanService>,
    pub lifecycle: Arc<LifecycleManager>,
    pub runtime: Arc<MockRuntime>,
    pub agent: Arc<MockAgent>,
    pub workspace: Arc<MockWorkspace>,
    pub tracker: Arc<MockTracker>,
    pub scm: Arc<MockScm>,
    pub notifier: Arc<MockNotifier>,
    pub reconciler: Arc<MockReconciler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_reactions(HashMap::new())
    }

    pub fn with_reactions(reactions: HashMap<String, ReactionConfig>) -> Self {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("fleet.yaml");
        let data_dir = dir.path().join("data");

        let mut projects = HashMap::new();
        projects.insert(
            PROJECT.to_string(),
            ProjectConfig {
                name: "Web".to_string(),
                repo: "acme/web".to_string(),
                path: dir.path().join("repo"),
                default_branch: "main".to_string(),
                session_prefix: "web".to_string(),
                agent: None,
                runtime: None,
                workspace: None,
                tracker: Some("mock".to_string()),
                scm: Some("mock".to_string()),
                reactions: HashMap::new(),
            },
        );

        let config = Arc::new(FleetConfig {
            config_path: config_path.clone(),
            data_dir: data_dir.clone(),
            defaults: PluginDefaults {
                runtime: "mock".to_string(),
                agent: "mock".to_string(),
                workspace: "mock".to_string(),
                notifiers: vec!["mock".to_string()],
            },
            projects,
            notifiers: HashMap::new(),
            notification_routing: NotificationRouting {
                urgent: vec!["mock".to_string()],
                action: vec!["mock".to_string()],
                warning: vec!["mock".to_string()],
                info: Vec::new(),
            },
            reactions,
            poll_interval_secs: 1,
            max_events: 500,
        });

        let runtime = Arc::new(MockRuntime::default());
        let agent = Arc::new(MockAgent::default());
        let workspace = Arc::new(MockWorkspace::new(dir.path().join("worktrees")));
        let tracker = Arc::new(MockTracker::default());
        let scm = Arc::new(MockScm::default());
        let notifier = Arc::new(MockNotifier::default());
        let reconciler = Arc::new(MockReconciler::default());

        let registry = Arc::new(PluginRegistry::new());
        registry.register_runtime("mock", runtime.clone());
        registry.register_agent("mock", agent.clone());
        registry.register_workspace("mock", workspace.clone());
        registry.register_tracker("mock", tracker.clone());
        registry.register_scm("mock", scm.clone());
        registry.register_notifier("mock", notifier.clone());
        registry.register_reconciler("default", reconciler.clone());

        let paths = FleetPaths::new(&config_path, &data_dir);
        let sessions = Arc::new(SessionManager::new(
            config.clone(),
            paths.clone(),
            registry.clone(),
        ));
        let plans = Arc::new(PlanService::new(
            config.clone(),
            paths.clone(),
            registry.clone(),
            sessions.clone(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            config.clone(),
            paths.clone(),
            registry.clone(),
            sessions.clone(),
            plans.clone(),
        ));

        Self {
            dir,
            config,
            paths,
            registry,
            sessions,
            plans,
            lifecycle,
            runtime,
            agent,
            workspace,
            tracker,
            scm,
            notifier,
            reconciler,
        }
    }

    pub fn handle_id(session: &Session) -> String {
        session.runtime_handle.as_ref().unwrap().id.clone()
    }

    pub fn set_output(&self, session: &Session, text: &str) {
        self.runtime
            .outputs
            .lock()
            .insert(Self::handle_id(session), text.to_string());
    }

    /// Give the session a known PR in metadata, the way auto-detection
    /// would have persisted it.
    pub async fn attach_pr(&self, session: &Session, number: u64) {
        let mut fresh = self.sessions.get(PROJECT, &session.id).await.unwrap();
        fresh.pr = Some(pr_url(number));
        self.sessions.persist(&fresh).await.unwrap();
    }

    pub async fn events(&self) -> Vec<FleetEvent> {
        EventStore::new(self.paths.events_file(PROJECT))
            .read_all()
            .await
            .unwrap()
    }

    pub async fn events_of(&self, event_type: fleet_commander::EventType) -> Vec<FleetEvent> {
        self.events()
            .await
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn timestamp() -> chrono::DateTime<chrono::Utc> {
        Utc::now()
    }
}
