//! Persistent stores: session metadata, event log, outcome log.
//!
//! Everything under here is the on-disk data contract described in the
//! directory layout; no in-memory state survives a restart except what these
//! stores can rebuild.

mod events;
mod metadata;
mod outcomes;

pub use events::{
    DEFAULT_MAX_EVENTS, EventFilter, EventPriority, EventStore, EventType, FleetEvent,
};
pub use metadata::MetadataStore;
pub use outcomes::{Outcome, OutcomeKind, OutcomeStore};
