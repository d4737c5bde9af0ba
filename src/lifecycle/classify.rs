//! State classification pipeline.
//!
//! Probes run in strict priority order and the first definitive answer wins;
//! later probes never execute. Probe failures and timeouts are conservative:
//! the persisted status is preserved and retried next cycle.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::config::ProjectConfig;
use crate::error::{Result, probe_err};
use crate::plugin::types::{
    ActivityState, CiSummary, PrState, PullRequest, ReviewDecision,
};
use crate::plugin::{AgentProbe, Runtime, Scm};
use crate::session::{Session, SessionStatus};

/// Read-only plugin probes share a tight budget; a hung SCM must not stall
/// the whole cycle.
const PROBE_TIMEOUT: Duration = Duration::from_secs(4);

/// How much terminal tail the activity probe sees.
const OUTPUT_LINES: usize = 50;

pub(crate) struct ClassifyContext<'a> {
    pub runtime: Option<Arc<dyn Runtime>>,
    pub agent: Option<Arc<dyn AgentProbe>>,
    pub scm: Option<Arc<dyn Scm>>,
    pub project: &'a ProjectConfig,
}

pub(crate) struct Classification {
    pub status: SessionStatus,
    /// PR discovered this cycle; the caller persists it before acting.
    pub detected_pr: Option<PullRequest>,
    pub activity: Option<ActivityState>,
    /// Tail of terminal output, reused by reaction dedup checks.
    pub output: Option<String>,
}

impl Classification {
    fn status(status: SessionStatus) -> Self {
        Self {
            status,
            detected_pr: None,
            activity: None,
            output: None,
        }
    }
}

async fn probe<T>(fut: impl Future<Output = Result<T>>) -> Result<T> {
    match timeout(PROBE_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(probe_err(
            "probe",
            format_args!("timed out after {}s", PROBE_TIMEOUT.as_secs()),
        )),
    }
}

pub(crate) async fn classify_session(
    ctx: &ClassifyContext<'_>,
    session: &Session,
    old: SessionStatus,
) -> Classification {
    let mut activity = None;
    let mut output_tail = None;

    // 1 + 2: runtime liveness, then activity. Both need a handle and the
    // runtime plugin; without them these probes are skipped, not failed.
    if let (Some(handle), Some(runtime)) = (&session.runtime_handle, &ctx.runtime) {
        match probe(runtime.is_alive(handle)).await {
            Ok(false) => return Classification::status(SessionStatus::Killed),
            Ok(true) => {}
            Err(e) => {
                debug!(session_id = %session.id, error = %e, "Liveness probe failed");
                return Classification::status(old);
            }
        }

        if let Some(agent) = &ctx.agent {
            match probe(runtime.get_output(handle, OUTPUT_LINES)).await {
                Ok(output) if !output.trim().is_empty() => {
                    activity = agent.detect_activity(&output);
                    output_tail = Some(output);

                    if activity == Some(ActivityState::WaitingInput) {
                        return Classification {
                            status: SessionStatus::NeedsInput,
                            detected_pr: None,
                            activity,
                            output: output_tail,
                        };
                    }

                    // Checked regardless of idle/active: some agents leave
                    // output on screen after the process exits.
                    match probe(agent.is_process_running(handle)).await {
                        Ok(false) => {
                            return Classification {
                                status: SessionStatus::Killed,
                                detected_pr: None,
                                activity,
                                output: output_tail,
                            };
                        }
                        Ok(true) => {}
                        Err(e) => {
                            debug!(session_id = %session.id, error = %e, "Process probe failed");
                            if matches!(old, SessionStatus::Stuck | SessionStatus::NeedsInput) {
                                // Preserve rather than coerce to working.
                                return Classification {
                                    status: old,
                                    detected_pr: None,
                                    activity,
                                    output: output_tail,
                                };
                            }
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(session_id = %session.id, error = %e, "Output probe failed");
                }
            }
        }
    }

    // 3: PR auto-detect. Persisting is the caller's job; classification
    // continues in the same cycle so a fresh PR is classified immediately.
    let mut detected_pr = None;
    let mut pr = known_pr(session);
    if let Some(scm) = &ctx.scm {
        if pr.is_none() {
            match probe(scm.detect_pr(session, ctx.project)).await {
                Ok(Some(found)) => {
                    debug!(session_id = %session.id, pr = %found.url, "PR detected");
                    detected_pr = Some(found.clone());
                    pr = Some(found);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(session_id = %session.id, error = %e, "PR detection failed");
                }
            }
        }

        // 4: PR state machine.
        if let Some(pr) = &pr {
            let status = match classify_pr(scm.as_ref(), pr).await {
                Ok(status) => status,
                Err(e) => {
                    debug!(session_id = %session.id, error = %e, "PR probe failed");
                    old
                }
            };
            return Classification {
                status,
                detected_pr,
                activity,
                output: output_tail,
            };
        }
    }

    // 5: fallback. A live, output-producing agent in a transient state is
    // promoted to working; anything else keeps its persisted status.
    let status = if old.is_promotable() {
        SessionStatus::Working
    } else {
        old
    };
    Classification {
        status,
        detected_pr,
        activity,
        output: output_tail,
    }
}

fn known_pr(session: &Session) -> Option<PullRequest> {
    let url = session.pr.clone()?;
    let number = session.pr_number()?;
    Some(PullRequest { number, url })
}

async fn classify_pr(scm: &dyn Scm, pr: &PullRequest) -> Result<SessionStatus> {
    match probe(scm.pr_state(pr)).await? {
        PrState::Merged => return Ok(SessionStatus::Merged),
        PrState::Closed => return Ok(SessionStatus::Killed),
        PrState::Open => {}
    }

    if probe(scm.ci_summary(pr)).await? == CiSummary::Failing {
        return Ok(SessionStatus::CiFailed);
    }

    match probe(scm.review_decision(pr)).await? {
        ReviewDecision::ChangesRequested => Ok(SessionStatus::ChangesRequested),
        ReviewDecision::Approved => match probe(scm.mergeability(pr)).await {
            Ok(m) if m.mergeable => Ok(SessionStatus::Mergeable),
            // Approval stands even when the mergeability probe is flaky.
            _ => Ok(SessionStatus::Approved),
        },
        ReviewDecision::Pending => Ok(SessionStatus::ReviewPending),
        ReviewDecision::None => Ok(SessionStatus::PrOpen),
    }
}
