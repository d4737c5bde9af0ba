//! Configuration types and loading.
//!
//! Read once at process start. The configuration file's path doubles as the
//! isolation key: its directory is hashed into every data-root name, so two
//! orchestrators with different configurations never share state.

mod settings;

pub use settings::{
    FleetConfig, NotificationRouting, PluginDefaults, ProjectConfig, ReactionAction,
    ReactionConfig, parse_duration,
};
