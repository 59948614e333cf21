use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use boxgrid_common::model::protocol::{
    CommandDispatch, CommandResultFrame, ConnectAck, ConnectHello, ConnectRequest, ConnectResponse,
    HeartbeatAck, HeartbeatFrame,
};
use boxgrid_common::model::{
    normalize_capability, NodeId, SessionId, WorkerType, CAPABILITY_COMPUTER_USE, CommandId,
};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::model::{CapabilityInflight, NodeInflightStats};
use crate::repo::worker_node::{HeartbeatTouch, WorkerNodeRecord, WorkerNodeRepo};
use crate::service::credential::WorkerCredentialService;
use crate::service::routing::TerminalRouteTable;

/// Stream-level status kinds, mirroring the gRPC status space the rest of
/// the platform speaks.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("Unavailable: {0}")]
    Unavailable(String),
    #[error("Internal: {0}")]
    Internal(String),
}

/// Per-capability concurrency slots. `inflight` never exceeds
/// `max_inflight` and never goes below zero.
#[derive(Debug)]
pub struct CapabilitySlot {
    max_inflight: u32,
    inflight: AtomicU32,
}

impl CapabilitySlot {
    pub fn new(max_inflight: u32) -> Self {
        Self {
            max_inflight,
            inflight: AtomicU32::new(0),
        }
    }

    /// Atomic compare-and-increment against `max_inflight`.
    pub fn try_acquire(&self) -> bool {
        self.inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_inflight).then_some(current + 1)
            })
            .is_ok()
    }

    /// Saturating decrement.
    pub fn release(&self) {
        let _ = self
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }

    pub fn snapshot(&self) -> (u32, u32) {
        (self.inflight.load(Ordering::Acquire), self.max_inflight)
    }
}

#[derive(Clone, Debug)]
pub struct CommandSuccess {
    pub payload_json: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub enum CommandFailure {
    /// Worker-reported failure (or a synthetic one like `empty_result`).
    Execution { code: String, message: String },
    /// The session closed before the worker resulted.
    SessionClosed(SessionError),
}

pub type CommandOutcome = Result<CommandSuccess, CommandFailure>;

#[derive(Debug)]
struct PendingCommand {
    capability: String,
    result_tx: oneshot::Sender<CommandOutcome>,
}

#[derive(Debug)]
pub enum EnqueueError {
    Canceled,
    DeadlineExceeded,
    Closed(SessionError),
}

/// Live state of one accepted hello. At most one exists per node id; a
/// newer hello replaces (and closes) the previous one.
#[derive(Debug)]
pub struct ActiveSession {
    pub node_id: NodeId,
    pub session_id: SessionId,
    pub node_name: String,
    pub worker_type: WorkerType,
    pub owner_id: String,
    capabilities: HashMap<String, CapabilitySlot>,
    control_tx: mpsc::Sender<ConnectResponse>,
    command_tx: mpsc::Sender<ConnectResponse>,
    pending: Mutex<HashMap<CommandId, PendingCommand>>,
    close_cause: Mutex<Option<SessionError>>,
    done: CancellationToken,
    last_frame_ms: AtomicI64,
}

impl ActiveSession {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains_key(capability)
    }

    pub fn last_frame_ms(&self) -> i64 {
        self.last_frame_ms.load(Ordering::Relaxed)
    }

    fn touch(&self, now_ms: i64) {
        self.last_frame_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn capability_names(&self) -> impl Iterator<Item = &String> {
        self.capabilities.keys()
    }

    pub fn capability_snapshot(&self, capability: &str) -> Option<(u32, u32)> {
        self.capabilities.get(capability).map(|slot| slot.snapshot())
    }

    pub fn try_acquire(&self, capability: &str) -> bool {
        self.capabilities
            .get(capability)
            .is_some_and(|slot| slot.try_acquire())
    }

    pub fn release(&self, capability: &str) {
        if let Some(slot) = self.capabilities.get(capability) {
            slot.release();
        }
    }

    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn close_cause(&self) -> Option<SessionError> {
        self.close_cause.lock().unwrap().clone()
    }

    /// Registers a correlation entry for a command about to be enqueued.
    /// Fails when the session is already closed, so no waiter can be left
    /// behind after the close drained the pending table.
    pub fn register_pending(
        &self,
        command_id: CommandId,
        capability: &str,
        result_tx: oneshot::Sender<CommandOutcome>,
    ) -> Result<(), SessionError> {
        let cause = self.close_cause.lock().unwrap();
        if let Some(cause) = &*cause {
            return Err(cause.clone());
        }
        self.pending.lock().unwrap().insert(
            command_id,
            PendingCommand {
                capability: capability.to_string(),
                result_tx,
            },
        );
        Ok(())
    }

    /// Removes the correlation entry if the command was never resulted,
    /// releasing its capability slot and closing the result slot.
    pub fn unregister_pending(&self, command_id: &CommandId) {
        let removed = self.pending.lock().unwrap().remove(command_id);
        if let Some(entry) = removed {
            self.release(&entry.capability);
        }
    }

    /// Delivers a worker result to the pending table. A result for an
    /// unknown command id (raced with cancellation or timeout) is dropped.
    pub fn deliver_result(&self, frame: CommandResultFrame) -> Result<(), SessionError> {
        if frame.command_id.trim().is_empty() {
            return Err(SessionError::InvalidArgument(
                "command_id must not be empty".to_string(),
            ));
        }
        let command_id = CommandId::from_str(frame.command_id.trim())
            .map_err(|_| SessionError::InvalidArgument("Invalid command_id".to_string()))?;

        let entry = self.pending.lock().unwrap().remove(&command_id);
        let Some(entry) = entry else {
            debug!(%command_id, "Dropping result for unknown command");
            return Ok(());
        };
        self.release(&entry.capability);

        let completed_at = frame
            .completed_unix_ms
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        let outcome = if let Some(error) = frame.error {
            Err(CommandFailure::Execution {
                code: error.code,
                message: error.message,
            })
        } else if frame.payload_json.trim().is_empty() {
            Err(CommandFailure::Execution {
                code: "empty_result".to_string(),
                message: "Worker returned an empty result payload".to_string(),
            })
        } else {
            Ok(CommandSuccess {
                payload_json: frame.payload_json,
                completed_at,
            })
        };
        // The waiter may already be gone (canceled); that is fine.
        let _ = entry.result_tx.send(outcome);
        Ok(())
    }

    /// Enqueues a command frame on the bounded command queue, selectable
    /// against cancellation, the deadline and session close.
    pub async fn enqueue_command(
        &self,
        frame: CommandDispatch,
        cancel: &CancellationToken,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<(), EnqueueError> {
        let sleep = tokio::time::sleep_until(
            deadline.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(86400)),
        );
        tokio::pin!(sleep);
        tokio::select! {
            _ = cancel.cancelled() => Err(EnqueueError::Canceled),
            _ = &mut sleep, if deadline.is_some() => Err(EnqueueError::DeadlineExceeded),
            _ = self.done.cancelled() => Err(EnqueueError::Closed(self.closed_error())),
            result = self.command_tx.send(ConnectResponse::CommandDispatch(frame)) => {
                result.map_err(|_| EnqueueError::Closed(self.closed_error()))
            }
        }
    }

    pub async fn enqueue_control(&self, frame: ConnectResponse) -> Result<(), SessionError> {
        self.control_tx
            .send(frame)
            .await
            .map_err(|_| self.closed_error())
    }

    /// Control enqueue with a short bounded timeout; used for heartbeat acks.
    pub async fn enqueue_control_timeout(
        &self,
        frame: ConnectResponse,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        match self.control_tx.send_timeout(frame, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(SessionError::DeadlineExceeded(
                "Control queue is full".to_string(),
            )),
            Err(SendTimeoutError::Closed(_)) => Err(self.closed_error()),
        }
    }

    fn closed_error(&self) -> SessionError {
        self.close_cause()
            .unwrap_or_else(|| SessionError::Unavailable("Session closed".to_string()))
    }

    /// Idempotent close: records the first cause, signals `done`, and
    /// drains the pending table with the cause, releasing every slot.
    /// Returns whether this call performed the close.
    pub fn close(&self, cause: SessionError) -> bool {
        let drained = {
            let mut close_cause = self.close_cause.lock().unwrap();
            if close_cause.is_some() {
                return false;
            }
            *close_cause = Some(cause.clone());
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect::<Vec<_>>()
        };
        self.done.cancel();
        for (command_id, entry) in drained {
            debug!(%command_id, "Draining pending command on session close");
            self.release(&entry.capability);
            let _ = entry
                .result_tx
                .send(Err(CommandFailure::SessionClosed(cause.clone())));
        }
        true
    }

    fn inflight_stats(&self) -> Vec<CapabilityInflight> {
        let mut stats: Vec<CapabilityInflight> = self
            .capabilities
            .iter()
            .map(|(name, slot)| {
                let (inflight, max_inflight) = slot.snapshot();
                CapabilityInflight {
                    capability: name.clone(),
                    inflight,
                    max_inflight,
                }
            })
            .collect();
        stats.sort_by(|a, b| a.capability.cmp(&b.capability));
        stats
    }
}

/// The console half of the worker stream: drains the two bounded outbound
/// queues, control frames first. Exits when the session closes.
#[derive(Debug)]
pub struct SessionWriter {
    control_rx: mpsc::Receiver<ConnectResponse>,
    command_rx: mpsc::Receiver<ConnectResponse>,
    done: CancellationToken,
}

impl SessionWriter {
    pub async fn next(&mut self) -> Option<ConnectResponse> {
        tokio::select! {
            biased;
            Some(frame) = self.control_rx.recv() => Some(frame),
            Some(frame) = self.command_rx.recv() => Some(frame),
            _ = self.done.cancelled() => None,
            else => None,
        }
    }
}

#[derive(Debug)]
pub struct OpenSession {
    pub session: Arc<ActiveSession>,
    pub writer: SessionWriter,
}

/// Deferred handle onto the session service, breaking the construction
/// cycle with services (credentials) that need to evict sessions.
#[derive(Clone, Default)]
pub struct LazySessionDisconnect {
    inner: Arc<RwLock<Option<Arc<SessionService>>>>,
}

impl LazySessionDisconnect {
    pub fn set(&self, sessions: Arc<SessionService>) {
        *self.inner.write().unwrap() = Some(sessions);
    }

    pub async fn disconnect(&self, node_id: &NodeId, cause: SessionError) {
        let sessions = self.inner.read().unwrap().clone();
        if let Some(sessions) = sessions {
            sessions.disconnect(node_id, cause).await;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapabilityAvailability {
    pub advertised: bool,
    pub has_spare: bool,
}

/// Registry of live worker sessions plus the stream-facing operations:
/// hello/auth, heartbeat, result demux, replacement and close.
pub struct SessionService {
    sessions: RwLock<HashMap<NodeId, Arc<ActiveSession>>>,
    node_repo: Arc<dyn WorkerNodeRepo>,
    credentials: Arc<WorkerCredentialService>,
    routes: Arc<TerminalRouteTable>,
    config: SessionConfig,
}

impl SessionService {
    pub fn new(
        node_repo: Arc<dyn WorkerNodeRepo>,
        credentials: Arc<WorkerCredentialService>,
        routes: Arc<TerminalRouteTable>,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            node_repo,
            credentials,
            routes,
            config,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    /// The open-session contract: hello validation, credential check,
    /// worker-sys capability policy, replacement of any previous session,
    /// store upsert and the connect ack.
    pub async fn open_session(&self, hello: ConnectHello) -> Result<OpenSession, SessionError> {
        let node_id = hello.node_id.trim();
        if node_id.is_empty() {
            return Err(SessionError::InvalidArgument(
                "node_id must not be empty".to_string(),
            ));
        }
        if node_id.len() > self.config.max_node_id_length {
            return Err(SessionError::InvalidArgument(format!(
                "node_id exceeds {} bytes",
                self.config.max_node_id_length
            )));
        }
        let node_id = NodeId::new(node_id);

        self.credentials
            .verify(&node_id, &hello.worker_secret)
            .await?;

        let node_row = self
            .node_repo
            .get(&node_id.0)
            .await
            .map_err(|err| SessionError::Internal(format!("Failed to load node row: {err}")))?;
        let worker_type = node_row
            .as_ref()
            .and_then(|row| WorkerType::from_str(&row.worker_type).ok())
            .unwrap_or_default();
        let owner_id = node_row
            .as_ref()
            .map(|row| row.owner_id.clone())
            .unwrap_or_default();

        let capabilities = self.effective_capabilities(worker_type, &hello)?;
        let labels_json = serde_json::to_string(&hello.labels)
            .map_err(|err| SessionError::Internal(format!("Failed to encode labels: {err}")))?;

        let session_id = SessionId::new_v4();
        let (control_tx, control_rx) = mpsc::channel(self.config.control_outbound_buffer);
        let (command_tx, command_rx) = mpsc::channel(self.config.command_outbound_buffer);
        let done = CancellationToken::new();
        let session = Arc::new(ActiveSession {
            node_id: node_id.clone(),
            session_id,
            node_name: hello.node_name.clone(),
            worker_type,
            owner_id,
            capabilities,
            control_tx,
            command_tx,
            pending: Mutex::new(HashMap::new()),
            close_cause: Mutex::new(None),
            done: done.clone(),
            last_frame_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        });
        let writer = SessionWriter {
            control_rx,
            command_rx,
            done,
        };

        let previous = {
            let mut sessions = self.sessions.write().unwrap();
            sessions.insert(node_id.clone(), session.clone())
        };
        if let Some(previous) = previous {
            info!(
                node_id = %node_id,
                old_session_id = %previous.session_id,
                new_session_id = %session_id,
                "Replacing existing worker session"
            );
            previous.close(SessionError::FailedPrecondition(format!(
                "session replaced by {session_id}"
            )));
        }

        let now = Utc::now();
        let record = WorkerNodeRecord {
            node_id: node_id.0.clone(),
            session_id: Some(session_id.to_string()),
            name: hello.node_name.clone(),
            executor_kind: hello.executor_kind.clone(),
            labels: labels_json,
            owner_id: session.owner_id.clone(),
            worker_type: worker_type.as_str().to_string(),
            last_seen_ms: now.timestamp_millis(),
            created_ms: node_row
                .as_ref()
                .map(|row| row.created_ms)
                .unwrap_or_else(|| now.timestamp_millis()),
        };
        if let Err(err) = self.node_repo.upsert_session(&record).await {
            {
                let mut sessions = self.sessions.write().unwrap();
                if sessions
                    .get(&node_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &session))
                {
                    sessions.remove(&node_id);
                }
            }
            session.close(SessionError::Internal("Session open aborted".to_string()));
            return Err(SessionError::Internal(format!(
                "Failed to persist session: {err}"
            )));
        }

        session
            .enqueue_control(ConnectResponse::ConnectAck(ConnectAck {
                session_id: session_id.to_string(),
                heartbeat_interval_sec: self.config.heartbeat_interval.as_secs(),
            }))
            .await?;

        info!(node_id = %node_id, session_id = %session_id, "Worker session established");
        Ok(OpenSession { session, writer })
    }

    fn effective_capabilities(
        &self,
        worker_type: WorkerType,
        hello: &ConnectHello,
    ) -> Result<HashMap<String, CapabilitySlot>, SessionError> {
        if worker_type == WorkerType::Sys {
            let declared: Vec<String> = hello
                .capabilities
                .iter()
                .map(|declaration| normalize_capability(&declaration.name))
                .collect();
            if declared.len() != 1 || declared[0] != CAPABILITY_COMPUTER_USE {
                return Err(SessionError::PermissionDenied(format!(
                    "worker-sys nodes must advertise exactly {{{CAPABILITY_COMPUTER_USE}}}"
                )));
            }
            // The declared max_inflight is overridden for sys nodes.
            return Ok(HashMap::from([(
                CAPABILITY_COMPUTER_USE.to_string(),
                CapabilitySlot::new(1),
            )]));
        }

        let mut capabilities = HashMap::new();
        for declaration in &hello.capabilities {
            let name = normalize_capability(&declaration.name);
            if name.is_empty() {
                continue;
            }
            let max_inflight = if declaration.max_inflight == 0 {
                self.config.default_capability_max_inflight
            } else {
                declaration.max_inflight
            };
            capabilities.insert(name, CapabilitySlot::new(max_inflight));
        }
        Ok(capabilities)
    }

    /// Demultiplexes one incoming frame on an established session.
    pub async fn handle_frame(
        &self,
        session: &Arc<ActiveSession>,
        frame: ConnectRequest,
    ) -> Result<(), SessionError> {
        session.touch(Utc::now().timestamp_millis());
        match frame {
            ConnectRequest::Hello(_) => Err(SessionError::InvalidArgument(
                "hello is only valid as the first frame".to_string(),
            )),
            ConnectRequest::Heartbeat(heartbeat) => self.handle_heartbeat(session, heartbeat).await,
            ConnectRequest::CommandResult(result) => session.deliver_result(result),
        }
    }

    async fn handle_heartbeat(
        &self,
        session: &Arc<ActiveSession>,
        frame: HeartbeatFrame,
    ) -> Result<(), SessionError> {
        let frame_session_id = frame.session_id.trim();
        if frame_session_id.is_empty() {
            return Err(SessionError::InvalidArgument(
                "session_id must not be empty".to_string(),
            ));
        }
        if frame.node_id != session.node_id.0 {
            return Err(SessionError::InvalidArgument(
                "node_id does not match the session".to_string(),
            ));
        }

        let touched = self
            .node_repo
            .touch(
                &session.node_id.0,
                frame_session_id,
                Utc::now().timestamp_millis(),
            )
            .await
            .map_err(|err| SessionError::Internal(format!("Failed to touch node: {err}")))?;
        match touched {
            HeartbeatTouch::Touched => {}
            HeartbeatTouch::UnknownNode => {
                return Err(SessionError::NotFound(format!(
                    "Unknown node: {}",
                    session.node_id
                )))
            }
            HeartbeatTouch::SessionMismatch => {
                return Err(SessionError::FailedPrecondition(
                    "A newer session took over this node".to_string(),
                ))
            }
        }

        session
            .enqueue_control_timeout(
                ConnectResponse::HeartbeatAck(HeartbeatAck {
                    heartbeat_interval_sec: self.config.heartbeat_interval.as_secs(),
                }),
                self.config.heartbeat_ack_enqueue_timeout,
            )
            .await
    }

    /// Idempotent close-and-remove. Store and route cleanup only happen
    /// when this session is still the indexed one, i.e. removal is due to
    /// stream end rather than replacement. Lock order: sessions, then
    /// routes.
    pub async fn close_session(&self, session: &Arc<ActiveSession>, cause: SessionError) {
        if !session.close(cause.clone()) {
            return;
        }
        info!(node_id = %session.node_id, session_id = %session.session_id, %cause, "Worker session closed");

        let removed = {
            let mut sessions = self.sessions.write().unwrap();
            if sessions
                .get(&session.node_id)
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                sessions.remove(&session.node_id);
                true
            } else {
                false
            }
        };
        if removed {
            self.routes.clear_node(&session.node_id);
            if let Err(err) = self
                .node_repo
                .clear_session(&session.node_id.0, &session.session_id.to_string())
                .await
            {
                warn!(node_id = %session.node_id, "Failed to clear session row: {err}");
            }
        }
    }

    pub async fn disconnect(&self, node_id: &NodeId, cause: SessionError) {
        let session = self.get_session(node_id);
        if let Some(session) = session {
            self.close_session(&session, cause).await;
        }
    }

    pub fn get_session(&self, node_id: &NodeId) -> Option<Arc<ActiveSession>> {
        self.sessions.read().unwrap().get(node_id).cloned()
    }

    /// Online sessions advertising the capability, ordered by node id so
    /// that round-robin scans are deterministic.
    pub fn sessions_advertising(&self, capability: &str) -> Vec<Arc<ActiveSession>> {
        let mut sessions: Vec<Arc<ActiveSession>> = self
            .sessions
            .read()
            .unwrap()
            .values()
            .filter(|session| session.has_capability(capability))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        sessions
    }

    /// The computerUse candidate list: the owner's worker-sys sessions.
    pub fn sys_sessions_for_owner(&self, owner_id: &str) -> Vec<Arc<ActiveSession>> {
        let mut sessions: Vec<Arc<ActiveSession>> = self
            .sessions
            .read()
            .unwrap()
            .values()
            .filter(|session| {
                session.worker_type == WorkerType::Sys
                    && session.owner_id == owner_id
                    && session.has_capability(CAPABILITY_COMPUTER_USE)
            })
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        sessions
    }

    /// Snapshot-only availability check used by submit's pre-check; does
    /// not acquire anything.
    pub fn capability_availability(
        &self,
        capability: &str,
        owner_id: &str,
    ) -> CapabilityAvailability {
        let candidates = if capability == CAPABILITY_COMPUTER_USE {
            self.sys_sessions_for_owner(owner_id)
        } else {
            self.sessions_advertising(capability)
        };
        let advertised = !candidates.is_empty();
        let has_spare = candidates.iter().any(|session| {
            session
                .capability_snapshot(capability)
                .is_some_and(|(inflight, max_inflight)| inflight < max_inflight)
        });
        CapabilityAvailability {
            advertised,
            has_spare,
        }
    }

    /// Heartbeat liveness: closes every session that has not sent a frame
    /// within the offline TTL. Driven periodically by the server loop.
    pub async fn sweep_stale_sessions(&self, now: DateTime<Utc>) -> usize {
        let ttl_ms = self.config.offline_ttl.as_millis() as i64;
        let now_ms = now.timestamp_millis();
        let stale: Vec<Arc<ActiveSession>> = self
            .sessions
            .read()
            .unwrap()
            .values()
            .filter(|session| now_ms - session.last_frame_ms() >= ttl_ms)
            .cloned()
            .collect();
        let count = stale.len();
        for session in stale {
            warn!(node_id = %session.node_id, session_id = %session.session_id, "Evicting stale worker session");
            self.close_session(
                &session,
                SessionError::DeadlineExceeded("Heartbeat timed out".to_string()),
            )
            .await;
        }
        count
    }

    /// Read-only per-node per-capability inflight snapshot.
    pub fn inflight_stats(&self) -> Vec<NodeInflightStats> {
        let sessions: Vec<Arc<ActiveSession>> =
            self.sessions.read().unwrap().values().cloned().collect();
        let mut stats: Vec<NodeInflightStats> = sessions
            .iter()
            .map(|session| NodeInflightStats {
                node_id: session.node_id.clone(),
                session_id: session.session_id,
                capabilities: session.inflight_stats(),
            })
            .collect();
        stats.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        stats
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn capability_slot_respects_max_inflight() {
        let slot = CapabilitySlot::new(2);
        assert!(slot.try_acquire());
        assert!(slot.try_acquire());
        assert!(!slot.try_acquire());
        slot.release();
        assert!(slot.try_acquire());
        assert_eq!(slot.snapshot(), (2, 2));
    }

    #[test]
    fn capability_slot_release_saturates_at_zero() {
        let slot = CapabilitySlot::new(1);
        slot.release();
        slot.release();
        assert_eq!(slot.snapshot(), (0, 1));
        assert!(slot.try_acquire());
        assert_eq!(slot.snapshot(), (1, 1));
    }

    fn test_session() -> (Arc<ActiveSession>, SessionWriter) {
        let (control_tx, control_rx) = mpsc::channel(4);
        let (command_tx, command_rx) = mpsc::channel(4);
        let done = CancellationToken::new();
        let session = Arc::new(ActiveSession {
            node_id: NodeId::new("node-test"),
            session_id: SessionId::new_v4(),
            node_name: "test".to_string(),
            worker_type: WorkerType::Normal,
            owner_id: String::new(),
            capabilities: HashMap::from([("echo".to_string(), CapabilitySlot::new(2))]),
            control_tx,
            command_tx,
            pending: Mutex::new(HashMap::new()),
            close_cause: Mutex::new(None),
            done: done.clone(),
            last_frame_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        });
        let writer = SessionWriter {
            control_rx,
            command_rx,
            done,
        };
        (session, writer)
    }

    #[test]
    async fn writer_prefers_control_frames() {
        let (session, mut writer) = test_session();
        session
            .enqueue_command(
                CommandDispatch {
                    command_id: CommandId::new_v4().to_string(),
                    capability: "echo".to_string(),
                    payload_json: "{}".to_string(),
                    deadline_unix_ms: None,
                },
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        session
            .enqueue_control(ConnectResponse::HeartbeatAck(HeartbeatAck {
                heartbeat_interval_sec: 15,
            }))
            .await
            .unwrap();

        let first = writer.next().await.unwrap();
        assert!(matches!(first, ConnectResponse::HeartbeatAck(_)));
        let second = writer.next().await.unwrap();
        assert!(matches!(second, ConnectResponse::CommandDispatch(_)));
    }

    #[test]
    async fn close_drains_pending_and_releases_slots() {
        let (session, _writer) = test_session();
        assert!(session.try_acquire("echo"));
        let command_id = CommandId::new_v4();
        let (result_tx, result_rx) = oneshot::channel();
        session
            .register_pending(command_id, "echo", result_tx)
            .unwrap();

        assert!(session.close(SessionError::Unavailable("gone".to_string())));
        // Second close is a no-op.
        assert!(!session.close(SessionError::Unavailable("again".to_string())));

        let outcome = result_rx.await.unwrap();
        assert!(matches!(outcome, Err(CommandFailure::SessionClosed(_))));
        assert_eq!(session.capability_snapshot("echo"), Some((0, 2)));

        // Registering after close fails with the close cause.
        let (late_tx, _late_rx) = oneshot::channel();
        let err = session
            .register_pending(CommandId::new_v4(), "echo", late_tx)
            .unwrap_err();
        assert_eq!(err, SessionError::Unavailable("gone".to_string()));
    }

    #[test]
    async fn at_most_one_outcome_reaches_the_waiter() {
        let (session, _writer) = test_session();
        assert!(session.try_acquire("echo"));
        let command_id = CommandId::new_v4();
        let (result_tx, result_rx) = oneshot::channel();
        session
            .register_pending(command_id, "echo", result_tx)
            .unwrap();

        session
            .deliver_result(CommandResultFrame {
                command_id: command_id.to_string(),
                payload_json: r#"{"ok":true}"#.to_string(),
                error: None,
                completed_unix_ms: None,
            })
            .unwrap();
        // A duplicate result for the same command is dropped silently.
        session
            .deliver_result(CommandResultFrame {
                command_id: command_id.to_string(),
                payload_json: r#"{"ok":false}"#.to_string(),
                error: None,
                completed_unix_ms: None,
            })
            .unwrap();
        session.close(SessionError::Unavailable("gone".to_string()));

        let outcome = result_rx.await.unwrap();
        let success = outcome.expect("first delivery wins");
        assert_eq!(success.payload_json, r#"{"ok":true}"#);
        assert_eq!(session.capability_snapshot("echo"), Some((0, 2)));
    }

    #[test]
    async fn full_control_queue_times_out_the_enqueue() {
        let (session, _writer) = test_session();
        let ack = ConnectResponse::HeartbeatAck(HeartbeatAck {
            heartbeat_interval_sec: 15,
        });
        // The test session's control queue holds 4 frames.
        for _ in 0..4 {
            session.enqueue_control(ack.clone()).await.unwrap();
        }
        let err = session
            .enqueue_control_timeout(ack, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::DeadlineExceeded(_)));
    }

    #[test]
    async fn empty_result_payload_becomes_a_synthetic_error() {
        let (session, _writer) = test_session();
        assert!(session.try_acquire("echo"));
        let command_id = CommandId::new_v4();
        let (result_tx, result_rx) = oneshot::channel();
        session
            .register_pending(command_id, "echo", result_tx)
            .unwrap();
        session
            .deliver_result(CommandResultFrame {
                command_id: command_id.to_string(),
                payload_json: String::new(),
                error: None,
                completed_unix_ms: None,
            })
            .unwrap();
        match result_rx.await.unwrap() {
            Err(CommandFailure::Execution { code, .. }) => assert_eq!(code, "empty_result"),
            other => panic!("expected empty_result error, got {other:?}"),
        }
    }
}
