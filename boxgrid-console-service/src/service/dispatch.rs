use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use boxgrid_common::model::protocol::CommandDispatch;
use boxgrid_common::model::{
    is_terminal_capability, normalize_capability, CommandId, CAPABILITY_COMPUTER_USE,
};
use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::service::routing::TerminalRouteTable;
use crate::service::session::{
    ActiveSession, CommandFailure, CommandSuccess, EnqueueError, SessionService,
};

/// Worker error code that invalidates a terminal route: the pinned node no
/// longer knows the terminal session.
const SESSION_NOT_FOUND_CODE: &str = "session_not_found";

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("No online worker advertises capability {capability}")]
    NoCapabilityWorker { capability: String },
    #[error("All workers advertising capability {capability} are saturated")]
    NoWorkerCapacity { capability: String },
    #[error("Command execution failed ({code}): {message}")]
    CommandExecution { code: String, message: String },
    #[error("Deadline exceeded")]
    DeadlineExceeded,
    #[error("Canceled")]
    Canceled,
    #[error("Unavailable: {0}")]
    Unavailable(String),
    #[error("Internal: {0}")]
    Internal(String),
}

impl From<CommandFailure> for DispatchError {
    fn from(value: CommandFailure) -> Self {
        match value {
            CommandFailure::Execution { code, message } => {
                DispatchError::CommandExecution { code, message }
            }
            CommandFailure::SessionClosed(cause) => DispatchError::Unavailable(cause.to_string()),
        }
    }
}

/// Invoked once the command frame is enqueued, with the minted command id.
/// The task machine uses it to mark the task running and wire cancellation.
pub type OnDispatched = Box<dyn FnOnce(CommandId) -> BoxFuture<'static, ()> + Send>;

struct Selected {
    session: Arc<ActiveSession>,
    /// True when this dispatch created the route reservation and is
    /// responsible for rolling it back on failure.
    route_created: bool,
}

/// Unregisters the pending entry when the dispatch leaves without a
/// delivered result (cancellation, deadline, enqueue failure), releasing
/// the capability slot exactly once.
struct PendingGuard<'a> {
    session: &'a Arc<ActiveSession>,
    command_id: CommandId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.unregister_pending(&self.command_id);
    }
}

/// Capability-aware routing of one command to one worker session, with
/// result correlation.
pub struct CommandDispatchService {
    sessions: Arc<SessionService>,
    routes: Arc<TerminalRouteTable>,
    round_robin: AtomicU64,
}

impl CommandDispatchService {
    pub fn new(sessions: Arc<SessionService>, routes: Arc<TerminalRouteTable>) -> Self {
        Self {
            sessions,
            routes,
            round_robin: AtomicU64::new(0),
        }
    }

    /// Dispatches one command and waits for its outcome.
    ///
    /// `timeout` semantics: `None` applies the 60s default, a zero value
    /// inherits only the caller's cancellation, a positive value sets the
    /// command deadline.
    pub async fn dispatch_command(
        &self,
        cancel: &CancellationToken,
        capability: &str,
        payload_json: Option<String>,
        timeout: Option<Duration>,
        owner_id: &str,
        on_dispatched: Option<OnDispatched>,
    ) -> Result<CommandSuccess, DispatchError> {
        let capability = normalize_capability(capability);
        if capability.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "capability must not be empty".to_string(),
            ));
        }
        let payload_json = match payload_json {
            Some(payload) if !payload.trim().is_empty() => payload,
            _ => "{}".to_string(),
        };

        let timeout = match timeout {
            Some(value) if value.is_zero() => None,
            Some(value) => Some(value),
            None => Some(DEFAULT_COMMAND_TIMEOUT),
        };
        let deadline = timeout.map(|value| tokio::time::Instant::now() + value);
        let deadline_unix_ms = timeout
            .and_then(|value| chrono::Duration::from_std(value).ok())
            .map(|value| (Utc::now() + value).timestamp_millis());

        self.routes.maybe_prune(Utc::now());

        let terminal_session_id = if is_terminal_capability(&capability) {
            let payload: serde_json::Value = serde_json::from_str(&payload_json).map_err(|e| {
                DispatchError::InvalidArgument(format!("payload is not valid JSON: {e}"))
            })?;
            payload
                .get("session_id")
                .and_then(|value| value.as_str())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        } else {
            None
        };

        let Selected {
            session,
            route_created,
        } = self.select_session(&capability, owner_id, terminal_session_id.as_deref())?;

        let command_id = CommandId::new_v4();
        let (result_tx, result_rx) = oneshot::channel();
        if let Err(cause) = session.register_pending(command_id, &capability, result_tx) {
            session.release(&capability);
            self.rollback_route(terminal_session_id.as_deref(), route_created);
            return Err(DispatchError::Unavailable(cause.to_string()));
        }
        let _pending_guard = PendingGuard {
            session: &session,
            command_id,
        };

        let frame = CommandDispatch {
            command_id: command_id.to_string(),
            capability: capability.clone(),
            payload_json,
            deadline_unix_ms,
        };
        if let Err(err) = session.enqueue_command(frame, cancel, deadline).await {
            self.rollback_route(terminal_session_id.as_deref(), route_created);
            return Err(match err {
                EnqueueError::Canceled => DispatchError::Canceled,
                EnqueueError::DeadlineExceeded => DispatchError::DeadlineExceeded,
                EnqueueError::Closed(cause) => DispatchError::Unavailable(cause.to_string()),
            });
        }
        debug!(%command_id, %capability, node_id = %session.node_id, "Command dispatched");

        if let Some(on_dispatched) = on_dispatched {
            on_dispatched(command_id).await;
        }

        let sleep = tokio::time::sleep_until(
            deadline.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(86400)),
        );
        tokio::pin!(sleep);
        tokio::select! {
            _ = cancel.cancelled() => Err(DispatchError::Canceled),
            _ = &mut sleep, if deadline.is_some() => Err(DispatchError::DeadlineExceeded),
            outcome = result_rx => match outcome {
                Err(_) => {
                    self.rollback_route(terminal_session_id.as_deref(), route_created);
                    Err(DispatchError::Unavailable(
                        "session closed before result".to_string(),
                    ))
                }
                Ok(Ok(success)) => {
                    if let Some(terminal_session_id) = &terminal_session_id {
                        self.routes.bind(terminal_session_id, &session.node_id, Utc::now());
                    }
                    Ok(success)
                }
                Ok(Err(failure)) => {
                    if let CommandFailure::Execution { code, .. } = &failure {
                        if code == SESSION_NOT_FOUND_CODE {
                            if let Some(terminal_session_id) = &terminal_session_id {
                                self.routes.clear(terminal_session_id);
                            }
                        }
                    }
                    if matches!(failure, CommandFailure::SessionClosed(_)) {
                        self.rollback_route(terminal_session_id.as_deref(), route_created);
                    }
                    Err(failure.into())
                }
            }
        }
    }

    fn rollback_route(&self, terminal_session_id: Option<&str>, route_created: bool) {
        if route_created {
            if let Some(terminal_session_id) = terminal_session_id {
                self.routes.clear(terminal_session_id);
            }
        }
    }

    fn select_session(
        &self,
        capability: &str,
        owner_id: &str,
        terminal_session_id: Option<&str>,
    ) -> Result<Selected, DispatchError> {
        match terminal_session_id {
            None => Ok(Selected {
                session: self.pick_session(capability, owner_id)?,
                route_created: false,
            }),
            Some(terminal_session_id) => {
                self.select_terminal_session(capability, owner_id, terminal_session_id)
            }
        }
    }

    /// General path: round-robin start index, circular scan over capacity
    /// snapshots, least-inflight first, acquire the first that admits us.
    fn pick_session(
        &self,
        capability: &str,
        owner_id: &str,
    ) -> Result<Arc<ActiveSession>, DispatchError> {
        let candidates = if capability == CAPABILITY_COMPUTER_USE {
            if owner_id.trim().is_empty() {
                return Err(DispatchError::InvalidArgument(
                    "owner_id is required for computerUse".to_string(),
                ));
            }
            self.sessions.sys_sessions_for_owner(owner_id)
        } else {
            self.sessions.sessions_advertising(capability)
        };
        if candidates.is_empty() {
            return Err(DispatchError::NoCapabilityWorker {
                capability: capability.to_string(),
            });
        }

        let start = (self.round_robin.fetch_add(1, Ordering::Relaxed) as usize) % candidates.len();
        let mut with_spare = Vec::with_capacity(candidates.len());
        for offset in 0..candidates.len() {
            let candidate = &candidates[(start + offset) % candidates.len()];
            if let Some((inflight, max_inflight)) = candidate.capability_snapshot(capability) {
                if inflight < max_inflight {
                    with_spare.push((inflight, candidate.clone()));
                }
            }
        }
        // Stable sort keeps the circular scan order within each inflight
        // bucket.
        with_spare.sort_by_key(|(inflight, _)| *inflight);
        for (_, candidate) in with_spare {
            if candidate.try_acquire(capability) {
                return Ok(candidate);
            }
        }
        Err(DispatchError::NoWorkerCapacity {
            capability: capability.to_string(),
        })
    }

    /// Sticky path: follow the route when present, otherwise pick and
    /// reserve, handling the reservation race and one stale-winner retry.
    fn select_terminal_session(
        &self,
        capability: &str,
        owner_id: &str,
        terminal_session_id: &str,
    ) -> Result<Selected, DispatchError> {
        let now = Utc::now();
        if let Some(node_id) = self.routes.lookup(terminal_session_id, now) {
            match self.sessions.get_session(&node_id) {
                Some(session) if session.has_capability(capability) => {
                    return if session.try_acquire(capability) {
                        Ok(Selected {
                            session,
                            route_created: false,
                        })
                    } else {
                        Err(DispatchError::NoWorkerCapacity {
                            capability: capability.to_string(),
                        })
                    };
                }
                _ => {
                    debug!(%terminal_session_id, %node_id, "Clearing stale terminal route");
                    self.routes.clear_if_node(terminal_session_id, &node_id);
                }
            }
        }

        for _ in 0..2 {
            let picked = self.pick_session(capability, owner_id)?;
            let winner = self
                .routes
                .reserve(terminal_session_id, &picked.node_id, now);
            if winner == picked.node_id {
                return Ok(Selected {
                    session: picked,
                    route_created: true,
                });
            }
            // Another dispatch won the reservation; move onto its node.
            picked.release(capability);
            match self.sessions.get_session(&winner) {
                Some(session) if session.has_capability(capability) => {
                    return if session.try_acquire(capability) {
                        Ok(Selected {
                            session,
                            route_created: false,
                        })
                    } else {
                        Err(DispatchError::NoWorkerCapacity {
                            capability: capability.to_string(),
                        })
                    };
                }
                _ => {
                    // The winner is already gone; drop the stale route and
                    // retry the pick once.
                    warn!(%terminal_session_id, %winner, "Reservation winner is offline");
                    self.routes.clear_if_node(terminal_session_id, &winner);
                }
            }
        }
        Err(DispatchError::Unavailable(
            "terminal route contention".to_string(),
        ))
    }
}
