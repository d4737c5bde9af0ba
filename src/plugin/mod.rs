//! Plugin slots and the registry that resolves them.
//!
//! The host statically links its plugin implementations and registers each
//! under `(slot, name)` at startup; configuration then refers to plugins by
//! name. A missing plugin is an error only when a code path actually needs
//! it — lookups return `Option` so callers can fail closed and skip the
//! dependent path.

pub mod traits;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

pub use traits::{AgentProbe, Notifier, Reconciler, Runtime, Scm, Tracker, Workspace};
pub use types::{
    ActivityState, CheckStatus, CiCheck, CiSummary, Issue, IssueRequest, Mergeability,
    PendingComment, PrSize, PrState, PullRequest, Review, ReviewDecision, RuntimeContext,
    RuntimeHandle, parse_review_verdict,
};

use crate::error::{FleetError, Result};

#[derive(Default)]
pub struct PluginRegistry {
    runtimes: RwLock<HashMap<String, Arc<dyn Runtime>>>,
    agents: RwLock<HashMap<String, Arc<dyn AgentProbe>>>,
    workspaces: RwLock<HashMap<String, Arc<dyn Workspace>>>,
    trackers: RwLock<HashMap<String, Arc<dyn Tracker>>>,
    scms: RwLock<HashMap<String, Arc<dyn Scm>>>,
    notifiers: RwLock<HashMap<String, Arc<dyn Notifier>>>,
    reconcilers: RwLock<HashMap<String, Arc<dyn Reconciler>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_runtime(&self, name: impl Into<String>, plugin: Arc<dyn Runtime>) {
        self.runtimes.write().insert(name.into(), plugin);
    }

    pub fn register_agent(&self, name: impl Into<String>, plugin: Arc<dyn AgentProbe>) {
        self.agents.write().insert(name.into(), plugin);
    }

    pub fn register_workspace(&self, name: impl Into<String>, plugin: Arc<dyn Workspace>) {
        self.workspaces.write().insert(name.into(), plugin);
    }

    pub fn register_tracker(&self, name: impl Into<String>, plugin: Arc<dyn Tracker>) {
        self.trackers.write().insert(name.into(), plugin);
    }

    pub fn register_scm(&self, name: impl Into<String>, plugin: Arc<dyn Scm>) {
        self.scms.write().insert(name.into(), plugin);
    }

    pub fn register_notifier(&self, name: impl Into<String>, plugin: Arc<dyn Notifier>) {
        self.notifiers.write().insert(name.into(), plugin);
    }

    pub fn register_reconciler(&self, name: impl Into<String>, plugin: Arc<dyn Reconciler>) {
        self.reconcilers.write().insert(name.into(), plugin);
    }

    pub fn runtime(&self, name: &str) -> Option<Arc<dyn Runtime>> {
        self.runtimes.read().get(name).cloned()
    }

    pub fn agent(&self, name: &str) -> Option<Arc<dyn AgentProbe>> {
        self.agents.read().get(name).cloned()
    }

    pub fn workspace(&self, name: &str) -> Option<Arc<dyn Workspace>> {
        self.workspaces.read().get(name).cloned()
    }

    pub fn tracker(&self, name: &str) -> Option<Arc<dyn Tracker>> {
        self.trackers.read().get(name).cloned()
    }

    pub fn scm(&self, name: &str) -> Option<Arc<dyn Scm>> {
        self.scms.read().get(name).cloned()
    }

    pub fn notifier(&self, name: &str) -> Option<Arc<dyn Notifier>> {
        self.notifiers.read().get(name).cloned()
    }

    pub fn reconciler(&self, name: &str) -> Option<Arc<dyn Reconciler>> {
        self.reconcilers.read().get(name).cloned()
    }

    pub fn require_runtime(&self, name: &str) -> Result<Arc<dyn Runtime>> {
        self.runtime(name).ok_or_else(|| FleetError::PluginUnavailable {
            slot: "runtime",
            name: name.to_string(),
        })
    }

    pub fn require_workspace(&self, name: &str) -> Result<Arc<dyn Workspace>> {
        self.workspace(name)
            .ok_or_else(|| FleetError::PluginUnavailable {
                slot: "workspace",
                name: name.to_string(),
            })
    }
}
