//! Terminal-state capture, historical lessons, retrospectives.

mod lessons;
mod retrospective;
mod service;

pub use lessons::{DEFAULT_LESSON_WINDOW, ProjectLessons, outcome_kind_for};
pub use retrospective::RetrospectiveService;
pub use service::OutcomeService;
