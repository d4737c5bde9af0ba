//! Feature plans: a DAG of tasks, each of which eventually becomes a session.

mod graph;
mod service;
mod store;
mod types;

pub use service::PlanService;
pub use store::PlanStore;
pub use types::{Plan, PlanOutput, PlanStatus, PlanTask, TaskScope};
