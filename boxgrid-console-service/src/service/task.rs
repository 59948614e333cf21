use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use boxgrid_common::model::{normalize_capability, TaskId, TaskMode, TaskStatus};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TaskConfig;
use crate::model::{SubmitTaskRequest, SubmittedTask, Task};
use crate::repo::task::{TaskRecord, TaskRepo};
use crate::repo::RepoError;
use crate::service::dispatch::{CommandDispatchService, DispatchError, OnDispatched};
use crate::service::scope;
use crate::service::session::SessionService;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Task not found")]
    TaskNotFound,
    #[error("Task is already in a terminal state")]
    TaskTerminal(Box<Task>),
    #[error("A submit for this request id is already in progress")]
    TaskRequestInProgress,
    #[error("No online worker advertises capability {capability}")]
    NoCapabilityWorker { capability: String },
    #[error("All workers advertising capability {capability} are saturated")]
    NoWorkerCapacity { capability: String },
    #[error("Internal: {0}")]
    Internal(String),
}

impl From<RepoError> for TaskError {
    fn from(error: RepoError) -> Self {
        TaskError::Internal(error.to_string())
    }
}

/// Invoked when a terminal transition cannot be persisted; wired to
/// operator alerting by the embedding service.
pub type CriticalPersistenceHandler = Box<dyn Fn(TaskId, &RepoError) + Send + Sync>;

struct LiveTask {
    cancel: CancellationToken,
    done: CancellationToken,
}

/// Owner-scoped, request-deduplicated, persisted tasks. Each task wraps
/// one dispatch attempt; terminal transitions are conditional updates and
/// absorbing.
///
/// Cheap to clone; all state lives behind one shared allocation so the
/// spawned task runners keep it alive independently of the handle.
#[derive(Clone)]
pub struct TaskService {
    state: Arc<TaskServiceState>,
}

struct TaskServiceState {
    repo: Arc<dyn TaskRepo>,
    dispatcher: Arc<CommandDispatchService>,
    sessions: Arc<SessionService>,
    live: Mutex<HashMap<TaskId, LiveTask>>,
    // Closes the lookup/insert race for concurrent same-request submits.
    reservations: Mutex<HashSet<(String, String)>>,
    last_prune_ms: AtomicI64,
    config: TaskConfig,
    critical_handler: RwLock<Option<CriticalPersistenceHandler>>,
}

struct ReservationGuard<'a> {
    service: &'a TaskServiceState,
    key: Option<(String, String)>,
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.service.reservations.lock().unwrap().remove(&key);
        }
    }
}

impl TaskService {
    pub fn new(
        repo: Arc<dyn TaskRepo>,
        dispatcher: Arc<CommandDispatchService>,
        sessions: Arc<SessionService>,
        config: TaskConfig,
    ) -> Self {
        Self {
            state: Arc::new(TaskServiceState {
                repo,
                dispatcher,
                sessions,
                live: Mutex::new(HashMap::new()),
                reservations: Mutex::new(HashSet::new()),
                last_prune_ms: AtomicI64::new(0),
                config,
                critical_handler: RwLock::new(None),
            }),
        }
    }

    pub fn set_critical_persistence_handler(&self, handler: CriticalPersistenceHandler) {
        *self.state.critical_handler.write().unwrap() = Some(handler);
    }

    pub async fn get_task(&self, owner_id: &str, task_id: &TaskId) -> Result<Task, TaskError> {
        self.state.get_task(owner_id, task_id).await
    }

    pub async fn cancel_task(&self, owner_id: &str, task_id: &TaskId) -> Result<Task, TaskError> {
        self.state.cancel_task(owner_id, task_id).await
    }

    pub async fn submit_task(
        &self,
        ctx: &CancellationToken,
        request: SubmitTaskRequest,
    ) -> Result<SubmittedTask, TaskError> {
        let state = self.state.as_ref();
        let owner_id = request.owner_id.trim().to_string();
        if owner_id.is_empty() {
            return Err(TaskError::InvalidArgument(
                "owner_id must not be empty".to_string(),
            ));
        }
        let capability = normalize_capability(&request.capability);
        if capability.is_empty() {
            return Err(TaskError::InvalidArgument(
                "capability must not be empty".to_string(),
            ));
        }
        let input_value: serde_json::Value = match &request.input_json {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw).map_err(|e| {
                TaskError::InvalidArgument(format!("input_json is not valid JSON: {e}"))
            })?,
            _ => serde_json::json!({}),
        };
        let input_value = scope::scope_input(&capability, &owner_id, input_value)
            .map_err(|e| TaskError::InvalidArgument(format!("input_json: {e}")))?;
        let input_json = input_value.to_string();

        let timeout = state.effective_timeout(request.timeout);
        let wait = state.effective_wait(request.wait, request.mode, timeout);

        state.maybe_prune_tasks().await;

        let request_id = request
            .request_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        let mut reservation = ReservationGuard {
            service: state,
            key: None,
        };
        if let Some(request_id) = &request_id {
            let key = (owner_id.clone(), request_id.clone());
            if !state.reservations.lock().unwrap().insert(key.clone()) {
                return Err(TaskError::TaskRequestInProgress);
            }
            reservation.key = Some(key);

            if let Some(existing) = state.repo.get_by_request(&owner_id, request_id).await? {
                drop(reservation);
                let task = Task::try_from(existing).map_err(TaskError::Internal)?;
                return state.resolve(ctx, task, request.mode, wait).await;
            }
        }

        // Pre-check by snapshot, not acquisition; the dispatch itself may
        // still lose the capacity race and fail with the same kinds.
        let availability = state.sessions.capability_availability(&capability, &owner_id);
        if !availability.advertised {
            return Err(TaskError::NoCapabilityWorker { capability });
        }
        if !availability.has_spare {
            return Err(TaskError::NoWorkerCapacity { capability });
        }

        let task_id = TaskId::new_v4();
        let now = Utc::now();
        let deadline = now
            + chrono::Duration::from_std(timeout)
                .map_err(|e| TaskError::Internal(format!("Invalid timeout: {e}")))?;
        let record = TaskRecord {
            task_id: task_id.to_string(),
            owner_id: owner_id.clone(),
            request_id: request_id.clone(),
            capability: capability.clone(),
            status: TaskStatus::Queued.as_str().to_string(),
            command_id: None,
            input_json: input_json.clone(),
            result_json: None,
            error_code: None,
            error_message: None,
            created_ms: now.timestamp_millis(),
            updated_ms: now.timestamp_millis(),
            deadline_ms: deadline.timestamp_millis(),
            completed_ms: None,
            expires_ms: None,
        };
        if !state.repo.insert(&record).await? {
            // A racer won the unique (owner_id, request_id) insert.
            drop(reservation);
            if let Some(request_id) = &request_id {
                if let Some(existing) = state.repo.get_by_request(&owner_id, request_id).await? {
                    let task = Task::try_from(existing).map_err(TaskError::Internal)?;
                    return state.resolve(ctx, task, request.mode, wait).await;
                }
            }
            return Err(TaskError::Internal(
                "Task insert conflicted without a visible task".to_string(),
            ));
        }
        drop(reservation);
        info!(%task_id, %capability, %owner_id, "Task queued");

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        state.live.lock().unwrap().insert(
            task_id,
            LiveTask {
                cancel: cancel.clone(),
                done: done.clone(),
            },
        );
        let runner = self.state.clone();
        let run_capability = capability.clone();
        let run_owner = owner_id.clone();
        tokio::spawn(async move {
            runner
                .run_task(task_id, run_capability, input_json, run_owner, timeout, cancel)
                .await;
        });

        let task = state.snapshot(&task_id).await?;
        state.resolve(ctx, task, request.mode, wait).await
    }
}

impl TaskServiceState {
    fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        effective_timeout(&self.config, requested)
    }

    fn effective_wait(&self, requested: Option<Duration>, mode: TaskMode, timeout: Duration) -> Duration {
        effective_wait(&self.config, requested, mode, timeout)
    }

    /// Resolves a submit against the (possibly already terminal) snapshot
    /// according to the requested mode.
    async fn resolve(
        &self,
        ctx: &CancellationToken,
        task: Task,
        mode: TaskMode,
        wait: Duration,
    ) -> Result<SubmittedTask, TaskError> {
        if task.status.is_terminal() || mode == TaskMode::Async {
            let completed = task.status.is_terminal();
            return Ok(SubmittedTask { task, completed });
        }

        let done = self
            .live
            .lock()
            .unwrap()
            .get(&task.task_id)
            .map(|live| live.done.clone());
        if let Some(done) = done {
            match mode {
                TaskMode::Sync => {
                    tokio::select! {
                        _ = done.cancelled() => {}
                        _ = ctx.cancelled() => {}
                    }
                }
                TaskMode::Auto => {
                    tokio::select! {
                        _ = done.cancelled() => {}
                        _ = ctx.cancelled() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                TaskMode::Async => unreachable!("async resolved above"),
            }
        }

        let task = self.snapshot(&task.task_id).await?;
        let completed = task.status.is_terminal();
        Ok(SubmittedTask { task, completed })
    }

    /// The task runner: dispatched -> running -> terminal, all through
    /// conditional updates so a concurrent cancel always wins exactly once.
    async fn run_task(
        &self,
        task_id: TaskId,
        capability: String,
        input_json: String,
        owner_id: String,
        timeout: Duration,
        cancel: CancellationToken,
    ) {
        let now_ms = Utc::now().timestamp_millis();
        match self.repo.mark_dispatched(&task_id.to_string(), now_ms).await {
            Ok(0) => {
                // Already terminal; a pre-dispatch cancel won the race.
                debug!(%task_id, "Skipping dispatch for already-terminal task");
                self.finish_runtime(&task_id);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(%task_id, "Failed to mark task dispatched: {err}");
                self.finish_runtime(&task_id);
                return;
            }
        }

        let on_dispatched: OnDispatched = {
            let repo = self.repo.clone();
            let cancel = cancel.clone();
            Box::new(move |command_id| {
                Box::pin(async move {
                    match repo
                        .mark_running(
                            &task_id.to_string(),
                            &command_id.to_string(),
                            Utc::now().timestamp_millis(),
                        )
                        .await
                    {
                        Ok(0) => {
                            // The task went terminal while the command was
                            // in flight; terminate the dispatch.
                            cancel.cancel();
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(%task_id, "Failed to mark task running: {err}");
                            cancel.cancel();
                        }
                    }
                })
            })
        };

        let outcome = self
            .dispatcher
            .dispatch_command(
                &cancel,
                &capability,
                Some(input_json),
                Some(timeout),
                &owner_id,
                Some(on_dispatched),
            )
            .await;

        let mut completed_at = Utc::now();
        let (status, result_json, error_code, error_message) = match outcome {
            Ok(success) => {
                completed_at = success.completed_at;
                match scope::unscope_result(&capability, &owner_id, &success.payload_json) {
                    Ok(unscoped) => (TaskStatus::Succeeded, Some(unscoped), None, None),
                    Err(err) => (
                        TaskStatus::Failed,
                        None,
                        Some("invalid_scoped_payload".to_string()),
                        Some(err.to_string()),
                    ),
                }
            }
            Err(DispatchError::NoCapabilityWorker { capability }) => (
                TaskStatus::Failed,
                None,
                Some("no_worker".to_string()),
                Some(format!("No online worker advertises {capability}")),
            ),
            Err(DispatchError::NoWorkerCapacity { capability }) => (
                TaskStatus::Failed,
                None,
                Some("no_capacity".to_string()),
                Some(format!("All workers advertising {capability} are saturated")),
            ),
            Err(DispatchError::DeadlineExceeded) => (
                TaskStatus::Timeout,
                None,
                Some("timeout".to_string()),
                Some("Command deadline exceeded".to_string()),
            ),
            Err(DispatchError::Canceled) => (
                TaskStatus::Canceled,
                None,
                Some("canceled".to_string()),
                Some("Task canceled".to_string()),
            ),
            Err(DispatchError::CommandExecution { code, message }) => {
                let code = if code.trim().is_empty() {
                    "dispatch_failed".to_string()
                } else {
                    code
                };
                (TaskStatus::Failed, None, Some(code), Some(message))
            }
            Err(other) => (
                TaskStatus::Failed,
                None,
                Some("dispatch_failed".to_string()),
                Some(other.to_string()),
            ),
        };

        self.finish_task(
            &task_id,
            status,
            result_json.as_deref(),
            error_code.as_deref(),
            error_message.as_deref(),
            completed_at,
        )
        .await;
        self.finish_runtime(&task_id);
    }

    async fn finish_task(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        result_json: Option<&str>,
        error_code: Option<&str>,
        error_message: Option<&str>,
        completed_at: DateTime<Utc>,
    ) {
        let expires_at = completed_at
            + chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let result = self
            .repo
            .finish(
                &task_id.to_string(),
                status.as_str(),
                result_json,
                error_code,
                error_message,
                completed_at.timestamp_millis(),
                expires_at.timestamp_millis(),
                Utc::now().timestamp_millis(),
            )
            .await;
        match result {
            Ok(0) => {
                debug!(%task_id, %status, "Terminal transition lost; task already terminal");
            }
            Ok(_) => {
                info!(%task_id, %status, "Task finished");
            }
            Err(err) => {
                error!(%task_id, "Failed to persist terminal transition: {err}");
                if let Some(handler) = &*self.critical_handler.read().unwrap() {
                    handler(*task_id, &err);
                }
                let _ = self
                    .repo
                    .finish(
                        &task_id.to_string(),
                        TaskStatus::Failed.as_str(),
                        None,
                        Some("persistence_error"),
                        Some("Failed to persist the task result"),
                        completed_at.timestamp_millis(),
                        expires_at.timestamp_millis(),
                        Utc::now().timestamp_millis(),
                    )
                    .await;
            }
        }
    }

    /// Idempotent runtime teardown: cancel-once, done-once, drop the live
    /// entry.
    fn finish_runtime(&self, task_id: &TaskId) {
        let live = self.live.lock().unwrap().remove(task_id);
        if let Some(live) = live {
            live.cancel.cancel();
            live.done.cancel();
        }
    }

    pub async fn get_task(&self, owner_id: &str, task_id: &TaskId) -> Result<Task, TaskError> {
        let task = self.snapshot(task_id).await?;
        if task.owner_id != owner_id {
            return Err(TaskError::TaskNotFound);
        }
        Ok(task)
    }

    /// No-op on terminal tasks (reported as `TaskTerminal` with the
    /// snapshot); otherwise writes canceled/canceled and unblocks any
    /// in-flight dispatch via the task context.
    pub async fn cancel_task(&self, owner_id: &str, task_id: &TaskId) -> Result<Task, TaskError> {
        let task = self.get_task(owner_id, task_id).await?;
        if task.status.is_terminal() {
            return Err(TaskError::TaskTerminal(Box::new(task)));
        }

        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let rows = self
            .repo
            .finish(
                &task_id.to_string(),
                TaskStatus::Canceled.as_str(),
                None,
                Some("canceled"),
                Some("Canceled by owner"),
                now.timestamp_millis(),
                expires_at.timestamp_millis(),
                now.timestamp_millis(),
            )
            .await?;
        if rows > 0 {
            if let Some(live) = self.live.lock().unwrap().get(task_id) {
                live.cancel.cancel();
            }
            info!(%task_id, "Task canceled");
            self.snapshot(task_id).await
        } else {
            let task = self.snapshot(task_id).await?;
            Err(TaskError::TaskTerminal(Box::new(task)))
        }
    }

    async fn snapshot(&self, task_id: &TaskId) -> Result<Task, TaskError> {
        let record = self
            .repo
            .get(&task_id.to_string())
            .await?
            .ok_or(TaskError::TaskNotFound)?;
        Task::try_from(record).map_err(TaskError::Internal)
    }

    /// Opportunistic retention prune, rate-limited by a CAS on the last
    /// prune timestamp.
    async fn maybe_prune_tasks(&self) {
        let now_ms = Utc::now().timestamp_millis();
        let interval_ms = self.config.prune_interval.as_millis() as i64;
        let last = self.last_prune_ms.load(Ordering::Relaxed);
        if now_ms - last < interval_ms {
            return;
        }
        if self
            .last_prune_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        match self.repo.prune_expired(now_ms).await {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "Pruned expired tasks"),
            Err(err) => warn!("Task prune failed: {err}"),
        }
    }
}

fn effective_timeout(config: &TaskConfig, requested: Option<Duration>) -> Duration {
    let timeout = match requested {
        Some(value) if !value.is_zero() => value,
        _ => config.default_timeout,
    };
    timeout.min(config.max_timeout)
}

/// In `auto` mode the wait is additionally clamped to the timeout, so the
/// submitter never waits past the task's own deadline.
fn effective_wait(
    config: &TaskConfig,
    requested: Option<Duration>,
    mode: TaskMode,
    timeout: Duration,
) -> Duration {
    let wait = requested.unwrap_or(config.default_wait).min(config.max_wait);
    if mode == TaskMode::Auto {
        wait.min(timeout)
    } else {
        wait
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn timeout_is_defaulted_and_clamped() {
        let config = TaskConfig::default();
        assert_eq!(effective_timeout(&config, None), Duration::from_secs(60));
        assert_eq!(
            effective_timeout(&config, Some(Duration::ZERO)),
            Duration::from_secs(60)
        );
        assert_eq!(
            effective_timeout(&config, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            effective_timeout(&config, Some(Duration::from_secs(100 * 60))),
            Duration::from_secs(10 * 60)
        );
    }

    #[test]
    fn wait_is_clamped_to_timeout_in_auto_mode() {
        let config = TaskConfig::default();
        let timeout = Duration::from_millis(200);
        assert_eq!(
            effective_wait(&config, None, TaskMode::Auto, timeout),
            timeout
        );
        assert_eq!(
            effective_wait(&config, None, TaskMode::Sync, timeout),
            Duration::from_millis(1500)
        );
        assert_eq!(
            effective_wait(
                &config,
                Some(Duration::from_secs(600)),
                TaskMode::Sync,
                Duration::from_secs(600)
            ),
            Duration::from_secs(60)
        );
    }
}
