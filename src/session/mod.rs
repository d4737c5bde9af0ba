//! Session identity, metadata and lifecycle operations.

mod manager;
mod types;

pub use manager::{SessionManager, SpawnRequest};
pub use types::{Session, SessionStatus};
