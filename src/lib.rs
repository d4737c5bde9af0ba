pub mod analytics;
pub mod classifier;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod outcome;
pub mod paths;
pub mod plan;
pub mod plugin;
pub mod session;
pub mod store;

pub use config::{FleetConfig, NotificationRouting, ProjectConfig, ReactionAction, ReactionConfig};
pub use error::{FleetError, Result};
pub use lifecycle::LifecycleManager;
pub use outcome::{OutcomeService, ProjectLessons, RetrospectiveService};
pub use paths::FleetPaths;
pub use plan::{Plan, PlanService, PlanStatus, PlanTask};
pub use plugin::PluginRegistry;
pub use session::{Session, SessionManager, SessionStatus, SpawnRequest};
pub use store::{
    EventFilter, EventPriority, EventStore, EventType, FleetEvent, Outcome, OutcomeKind,
    OutcomeStore,
};
