//! Status-to-event and event-to-reaction mapping tables.

use crate::session::{Session, SessionStatus};
use crate::store::EventType;

/// Event emitted when a session *enters* the given status. Every status maps
/// to exactly one type, so a per-session timeline can be replayed from the
/// event log alone.
pub fn status_event_type(status: SessionStatus) -> Option<EventType> {
    Some(match status {
        SessionStatus::Spawning => EventType::SessionSpawned,
        SessionStatus::Working => EventType::SessionWorking,
        SessionStatus::PrOpen => EventType::PrCreated,
        SessionStatus::CiFailed => EventType::CiFailing,
        SessionStatus::ReviewPending => EventType::PrReviewPending,
        SessionStatus::ChangesRequested => EventType::ReviewChangesRequested,
        SessionStatus::Approved => EventType::PrApproved,
        SessionStatus::Mergeable => EventType::PrMergeable,
        SessionStatus::Merged => EventType::PrMerged,
        SessionStatus::NeedsInput => EventType::SessionNeedsInput,
        SessionStatus::Stuck => EventType::SessionStuck,
        SessionStatus::Errored => EventType::SessionErrored,
        SessionStatus::Killed => EventType::SessionKilled,
        SessionStatus::Done => EventType::SessionDone,
    })
}

/// Reaction configuration key governing an event type. Events without a key
/// are informational only.
pub fn reaction_key(event_type: EventType) -> Option<&'static str> {
    match event_type {
        EventType::PrCreated => Some("pr-created"),
        EventType::CiFailing => Some("ci-failed"),
        EventType::ReviewChangesRequested => Some("changes-requested"),
        EventType::SessionNeedsInput => Some("needs-input"),
        EventType::SessionStuck => Some("stuck"),
        EventType::SessionErrored => Some("errored"),
        EventType::PrApproved => Some("approved"),
        EventType::PrMergeable => Some("mergeable"),
        EventType::PlanComplete => Some("plan-complete"),
        _ => None,
    }
}

pub fn transition_message(session: &Session, new: SessionStatus) -> String {
    let subject = session
        .summary
        .as_deref()
        .unwrap_or(session.branch.as_str());
    match new {
        SessionStatus::Working => format!("{} is working ({})", session.id, subject),
        SessionStatus::PrOpen => match &session.pr {
            Some(url) => format!("{} opened a PR: {}", session.id, url),
            None => format!("{} opened a PR", session.id),
        },
        SessionStatus::CiFailed => format!("CI is failing on {}'s PR", session.id),
        SessionStatus::ReviewPending => format!("{}'s PR is waiting for review", session.id),
        SessionStatus::ChangesRequested => {
            format!("Changes requested on {}'s PR", session.id)
        }
        SessionStatus::Approved => format!("{}'s PR is approved", session.id),
        SessionStatus::Mergeable => format!("{}'s PR is approved and mergeable", session.id),
        SessionStatus::Merged => format!("{}'s PR merged ({})", session.id, subject),
        SessionStatus::NeedsInput => format!("{} is waiting for input", session.id),
        SessionStatus::Stuck => format!("{} looks stuck", session.id),
        SessionStatus::Errored => format!("{} hit an error", session.id),
        SessionStatus::Killed => format!("{} is gone", session.id),
        SessionStatus::Done => format!("{} finished ({})", session.id, subject),
        SessionStatus::Spawning => format!("{} is spawning", session.id),
    }
}
