use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::store::EventPriority;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_max_events() -> usize {
    crate::store::DEFAULT_MAX_EVENTS
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_session_prefix() -> String {
    "agent".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    /// Set after load; identifies this configuration for data isolation.
    #[serde(skip)]
    pub config_path: PathBuf,

    pub data_dir: PathBuf,

    #[serde(default)]
    pub defaults: PluginDefaults,

    #[serde(default)]
    pub projects: HashMap<String, ProjectConfig>,

    /// Plugin-specific notifier settings, opaque to the core.
    #[serde(default)]
    pub notifiers: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub notification_routing: NotificationRouting,

    /// Global reaction defaults, overridable per project at key granularity.
    #[serde(default)]
    pub reactions: HashMap<String, ReactionConfig>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl FleetConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let mut config: FleetConfig = serde_yaml_bw::from_str(&content)?;
        config.config_path = path.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (key, reaction) in self
            .reactions
            .iter()
            .chain(self.projects.values().flat_map(|p| p.reactions.iter()))
        {
            if let Some(spec) = &reaction.escalate_after {
                parse_duration(spec).map_err(|e| {
                    FleetError::Config(format!("reaction '{}': {}", key, e))
                })?;
            }
        }
        Ok(())
    }

    pub fn project(&self, project_id: &str) -> Result<&ProjectConfig> {
        self.projects
            .get(project_id)
            .ok_or_else(|| FleetError::UnknownProject(project_id.to_string()))
    }

    /// Reaction config for a key: project override wins wholesale, otherwise
    /// the global default applies.
    pub fn reaction_for(&self, project_id: &str, key: &str) -> Option<&ReactionConfig> {
        self.projects
            .get(project_id)
            .and_then(|p| p.reactions.get(key))
            .or_else(|| self.reactions.get(key))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDefaults {
    pub runtime: String,
    pub agent: String,
    pub workspace: String,
    #[serde(default)]
    pub notifiers: Vec<String>,
}

impl Default for PluginDefaults {
    fn default() -> Self {
        Self {
            runtime: "tmux".to_string(),
            agent: "claude".to_string(),
            workspace: "worktree".to_string(),
            notifiers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub name: String,
    /// `owner/repo` slug understood by the tracker and SCM plugins.
    pub repo: String,
    pub path: PathBuf,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    pub agent: Option<String>,
    pub runtime: Option<String>,
    pub workspace: Option<String>,
    pub tracker: Option<String>,
    pub scm: Option<String>,
    #[serde(default)]
    pub reactions: HashMap<String, ReactionConfig>,
}

impl ProjectConfig {
    pub fn runtime_plugin<'a>(&'a self, defaults: &'a PluginDefaults) -> &'a str {
        self.runtime.as_deref().unwrap_or(&defaults.runtime)
    }

    pub fn agent_plugin<'a>(&'a self, defaults: &'a PluginDefaults) -> &'a str {
        self.agent.as_deref().unwrap_or(&defaults.agent)
    }

    pub fn workspace_plugin<'a>(&'a self, defaults: &'a PluginDefaults) -> &'a str {
        self.workspace.as_deref().unwrap_or(&defaults.workspace)
    }
}

/// Per-priority fan-out lists of notifier plugin names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationRouting {
    #[serde(default)]
    pub urgent: Vec<String>,
    #[serde(default)]
    pub action: Vec<String>,
    #[serde(default)]
    pub warning: Vec<String>,
    #[serde(default)]
    pub info: Vec<String>,
}

impl NotificationRouting {
    pub fn route(&self, priority: EventPriority) -> &[String] {
        match priority {
            EventPriority::Urgent => &self.urgent,
            EventPriority::Action => &self.action,
            EventPriority::Warning => &self.warning,
            EventPriority::Info => &self.info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReactionAction {
    SendToAgent,
    Notify,
    /// Currently reduces to a notify at `action` priority; the merge itself
    /// happens elsewhere. Kept as a distinct action for future extension.
    AutoMerge,
    SpawnReview,
    ReviewGate,
    SpawnReconciliation,
    SpawnRetrospective,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionConfig {
    pub action: ReactionAction,
    pub message: Option<String>,
    pub retries: Option<u32>,
    /// Duration string `<n>{s|m|h}`. Bare integers are rejected at load.
    pub escalate_after: Option<String>,
    pub priority: Option<EventPriority>,
    /// `false` disables automatic dispatch; the transition is routed to
    /// humans instead. `notify` actions dispatch regardless.
    pub auto: Option<bool>,
}

impl ReactionConfig {
    pub const DEFAULT_RETRIES: u32 = 3;

    pub fn new(action: ReactionAction) -> Self {
        Self {
            action,
            message: None,
            retries: None,
            escalate_after: None,
            priority: None,
            auto: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_escalate_after(mut self, spec: impl Into<String>) -> Self {
        self.escalate_after = Some(spec.into());
        self
    }

    pub fn retries(&self) -> u32 {
        self.retries.unwrap_or(Self::DEFAULT_RETRIES)
    }

    pub fn escalate_after(&self) -> Result<Option<Duration>> {
        self.escalate_after
            .as_deref()
            .map(parse_duration)
            .transpose()
    }
}

/// Parse `<n>{s|m|h}` into a duration. This is the only accepted escalation
/// delay representation; bare integers are ambiguous and rejected.
pub fn parse_duration(spec: &str) -> Result<Duration> {
    let spec = spec.trim();
    let unit = spec
        .chars()
        .last()
        .ok_or_else(|| FleetError::InvalidDuration(spec.to_string()))?;
    let number = &spec[..spec.len() - unit.len_utf8()];
    let n: u64 = number
        .parse()
        .map_err(|_| FleetError::InvalidDuration(spec.to_string()))?;
    match unit {
        's' => Ok(Duration::from_secs(n)),
        'm' => Ok(Duration::from_secs(n * 60)),
        'h' => Ok(Duration::from_secs(n * 3600)),
        _ => Err(FleetError::InvalidDuration(spec.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_strings() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));

        assert!(parse_duration("30").is_err(), "bare integers are rejected");
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("-5m").is_err());
    }

    #[test]
    fn reaction_config_yaml() {
        let yaml = r#"
action: send-to-agent
message: "CI is failing on your PR."
retries: 2
escalateAfter: 30m
"#;
        let config: ReactionConfig = serde_yaml_bw::from_str(yaml).unwrap();
        assert_eq!(config.action, ReactionAction::SendToAgent);
        assert_eq!(config.retries(), 2);
        assert_eq!(
            config.escalate_after().unwrap(),
            Some(Duration::from_secs(1800))
        );
    }

    #[test]
    fn project_overrides_win() {
        let mut config = FleetConfig {
            config_path: PathBuf::new(),
            data_dir: PathBuf::from("/tmp"),
            defaults: PluginDefaults::default(),
            projects: HashMap::new(),
            notifiers: HashMap::new(),
            notification_routing: NotificationRouting::default(),
            reactions: HashMap::new(),
            poll_interval_secs: 30,
            max_events: 500,
        };
        config.reactions.insert(
            "ci-failed".to_string(),
            ReactionConfig::new(ReactionAction::SendToAgent).with_retries(3),
        );

        let mut project = ProjectConfig {
            name: "Web".to_string(),
            repo: "acme/web".to_string(),
            path: PathBuf::from("/src/web"),
            default_branch: default_branch(),
            session_prefix: "web".to_string(),
            agent: None,
            runtime: None,
            workspace: None,
            tracker: None,
            scm: None,
            reactions: HashMap::new(),
        };
        project.reactions.insert(
            "ci-failed".to_string(),
            ReactionConfig::new(ReactionAction::Notify),
        );
        config.projects.insert("web".to_string(), project);

        let global = config.reaction_for("api", "ci-failed").unwrap();
        assert_eq!(global.action, ReactionAction::SendToAgent);

        let overridden = config.reaction_for("web", "ci-failed").unwrap();
        assert_eq!(overridden.action, ReactionAction::Notify);

        assert!(config.reaction_for("web", "no-such-key").is_none());
    }

    #[test]
    fn validate_rejects_bad_escalation_spec() {
        let mut config = FleetConfig {
            config_path: PathBuf::new(),
            data_dir: PathBuf::from("/tmp"),
            defaults: PluginDefaults::default(),
            projects: HashMap::new(),
            notifiers: HashMap::new(),
            notification_routing: NotificationRouting::default(),
            reactions: HashMap::new(),
            poll_interval_secs: 30,
            max_events: 500,
        };
        config.reactions.insert(
            "ci-failed".to_string(),
            ReactionConfig::new(ReactionAction::SendToAgent).with_escalate_after("1800"),
        );
        assert!(config.validate().is_err());
    }
}
