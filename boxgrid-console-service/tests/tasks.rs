use test_r::test;

use std::time::Duration;

use crate::common::*;
use boxgrid_common::model::{TaskMode, TaskStatus, CAPABILITY_TERMINAL_EXEC};
use boxgrid_console_service::model::SubmitTaskRequest;
use boxgrid_console_service::service::task::TaskError;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn submit_request(capability: &str, input: serde_json::Value) -> SubmitTaskRequest {
    SubmitTaskRequest {
        owner_id: "owner-a".to_string(),
        capability: capability.to_string(),
        input_json: Some(input.to_string()),
        mode: TaskMode::Auto,
        wait: None,
        timeout: None,
        request_id: None,
    }
}

#[test]
async fn auto_submit_returns_the_completed_echo_task() {
    let env = test_env().await;
    install_worker(&env, "node-a", "secret-a").await;
    let open = connect(&env, "node-a", "secret-a", &[("echo", 4)]).await;
    let _worker = spawn_worker(env.services.session_service.clone(), open, echo_responder());

    let ctx = CancellationToken::new();
    let submitted = env
        .services
        .task_service
        .submit_task(&ctx, submit_request("echo", json!({"msg": "hi"})))
        .await
        .expect("submit should succeed");

    assert!(submitted.completed);
    assert_status(&submitted.task, TaskStatus::Succeeded);
    assert_eq!(submitted.task.owner_id, "owner-a");
    assert!(submitted.task.command_id.is_some());
    assert!(submitted.task.completed_at.is_some());
    assert!(submitted.task.expires_at.is_some());
    let result: serde_json::Value =
        serde_json::from_str(submitted.task.result_json.as_ref().unwrap()).unwrap();
    assert_eq!(result["msg"], "hi");
}

#[test]
async fn async_submit_returns_immediately_and_is_pollable() {
    let env = test_env().await;
    install_worker(&env, "node-a", "secret-a").await;
    let open = connect(&env, "node-a", "secret-a", &[("echo", 4)]).await;
    let _worker = spawn_worker(env.services.session_service.clone(), open, echo_responder());

    let ctx = CancellationToken::new();
    let mut request = submit_request("echo", json!({"n": 1}));
    request.mode = TaskMode::Async;
    let submitted = env
        .services
        .task_service
        .submit_task(&ctx, request)
        .await
        .expect("submit should succeed");
    assert!(!submitted.task.status.is_terminal() || submitted.completed);

    let task = wait_until_terminal(&env, "owner-a", &submitted.task.task_id).await;
    assert_status(&task, TaskStatus::Succeeded);
}

#[test]
async fn submit_without_workers_fails_fast() {
    let env = test_env().await;
    let ctx = CancellationToken::new();
    let err = env
        .services
        .task_service
        .submit_task(&ctx, submit_request("echo", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::NoCapabilityWorker { .. }));
}

#[test]
async fn invalid_input_json_is_rejected() {
    let env = test_env().await;
    install_worker(&env, "node-a", "secret-a").await;
    let open = connect(&env, "node-a", "secret-a", &[("echo", 4)]).await;
    let _worker = spawn_worker(env.services.session_service.clone(), open, echo_responder());

    let ctx = CancellationToken::new();
    let mut request = submit_request("echo", json!({}));
    request.input_json = Some("{not json".to_string());
    let err = env
        .services
        .task_service
        .submit_task(&ctx, request)
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::InvalidArgument(_)));
}

#[test]
async fn request_id_deduplicates_submits() {
    let env = test_env().await;
    install_worker(&env, "node-a", "secret-a").await;
    let open = connect(&env, "node-a", "secret-a", &[("echo", 4)]).await;
    let mut worker = spawn_worker(env.services.session_service.clone(), open, echo_responder());

    let ctx = CancellationToken::new();
    let mut request = submit_request("echo", json!({"msg": "once"}));
    request.request_id = Some("r1".to_string());

    let first = env
        .services
        .task_service
        .submit_task(&ctx, request.clone())
        .await
        .expect("first submit");
    let second = env
        .services
        .task_service
        .submit_task(&ctx, request.clone())
        .await
        .expect("second submit resolves against the stored task");
    assert_eq!(first.task.task_id, second.task.task_id);

    // The underlying command executed exactly once.
    assert_eq!(worker.drain_dispatches().len(), 1);
}

#[test]
async fn concurrent_same_request_submits_share_one_task() {
    let env = test_env().await;
    install_worker(&env, "node-a", "secret-a").await;
    let open = connect(&env, "node-a", "secret-a", &[("echo", 4)]).await;
    let mut worker = spawn_worker(env.services.session_service.clone(), open, echo_responder());

    let ctx = CancellationToken::new();
    let mut request = submit_request("echo", json!({"msg": "once"}));
    request.request_id = Some("r1".to_string());

    let submit = || {
        let task_service = env.services.task_service.clone();
        let ctx = ctx.clone();
        let request = request.clone();
        async move { task_service.submit_task(&ctx, request).await }
    };
    let (first, second) = tokio::join!(submit(), submit());

    let mut task_ids = Vec::new();
    let mut in_progress = 0;
    for outcome in [first, second] {
        match outcome {
            Ok(submitted) => task_ids.push(submitted.task.task_id),
            Err(TaskError::TaskRequestInProgress) => in_progress += 1,
            Err(other) => panic!("unexpected submit error: {other}"),
        }
    }
    // Either both submits share one task id, or the loser observed the
    // in-progress reservation.
    match task_ids.as_slice() {
        [a, b] => assert_eq!(a, b),
        [_] => assert_eq!(in_progress, 1),
        _ => panic!("at least one submit must win"),
    }
    assert_eq!(worker.drain_dispatches().len(), 1);
}

#[test]
async fn cancel_running_task_unblocks_the_dispatch() {
    let env = test_env().await;
    install_worker(&env, "node-a", "secret-a").await;
    let open = connect(&env, "node-a", "secret-a", &[("echo", 1)]).await;
    let mut worker = spawn_worker(
        env.services.session_service.clone(),
        open,
        silent_responder(),
    );

    let ctx = CancellationToken::new();
    let mut request = submit_request("echo", json!({}));
    request.mode = TaskMode::Async;
    request.timeout = Some(Duration::from_secs(30));
    let submitted = env
        .services
        .task_service
        .submit_task(&ctx, request)
        .await
        .expect("submit");
    let task_id = submitted.task.task_id;

    // Wait for the command to reach the worker so the task is running.
    worker.dispatches.recv().await.expect("dispatch expected");

    let canceled = env
        .services
        .task_service
        .cancel_task("owner-a", &task_id)
        .await
        .expect("cancel should succeed");
    assert_status(&canceled, TaskStatus::Canceled);
    assert_eq!(canceled.error_code.as_deref(), Some("canceled"));

    // Cancel on a terminal task reports TaskTerminal with the snapshot.
    let err = env
        .services
        .task_service
        .cancel_task("owner-a", &task_id)
        .await
        .unwrap_err();
    match err {
        TaskError::TaskTerminal(task) => assert_status(&task, TaskStatus::Canceled),
        other => panic!("expected TaskTerminal, got {other}"),
    }

    // The in-flight dispatch unwound and released its slot.
    for _ in 0..100 {
        if worker.session.capability_snapshot("echo") == Some((0, 1)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(worker.session.capability_snapshot("echo"), Some((0, 1)));
}

#[test]
async fn task_times_out_when_the_worker_never_results() {
    let env = test_env().await;
    install_worker(&env, "node-a", "secret-a").await;
    let open = connect(&env, "node-a", "secret-a", &[("echo", 1)]).await;
    let _worker = spawn_worker(
        env.services.session_service.clone(),
        open,
        silent_responder(),
    );

    let ctx = CancellationToken::new();
    let mut request = submit_request("echo", json!({}));
    request.mode = TaskMode::Sync;
    request.timeout = Some(Duration::from_millis(100));
    let submitted = env
        .services
        .task_service
        .submit_task(&ctx, request)
        .await
        .expect("submit");
    assert_status(&submitted.task, TaskStatus::Timeout);
    assert_eq!(submitted.task.error_code.as_deref(), Some("timeout"));
}

#[test]
async fn get_task_is_owner_scoped() {
    let env = test_env().await;
    install_worker(&env, "node-a", "secret-a").await;
    let open = connect(&env, "node-a", "secret-a", &[("echo", 4)]).await;
    let _worker = spawn_worker(env.services.session_service.clone(), open, echo_responder());

    let ctx = CancellationToken::new();
    let submitted = env
        .services
        .task_service
        .submit_task(&ctx, submit_request("echo", json!({})))
        .await
        .expect("submit");
    let task_id = submitted.task.task_id;

    env.services
        .task_service
        .get_task("owner-a", &task_id)
        .await
        .expect("owner can read the task");
    let err = env
        .services
        .task_service
        .get_task("owner-b", &task_id)
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::TaskNotFound));
}

#[test]
async fn terminal_results_are_rescoped_for_the_owner() {
    let env = test_env().await;
    install_worker(&env, "node-a", "secret-a").await;
    let open = connect(&env, "node-a", "secret-a", &[("terminalExec", 4)]).await;
    let mut worker = spawn_worker(env.services.session_service.clone(), open, echo_responder());

    let ctx = CancellationToken::new();
    let submitted = env
        .services
        .task_service
        .submit_task(
            &ctx,
            submit_request(
                CAPABILITY_TERMINAL_EXEC,
                json!({"session_id": "s1", "command": "ls"}),
            ),
        )
        .await
        .expect("submit");
    assert_status(&submitted.task, TaskStatus::Succeeded);

    // The worker saw the owner-scoped session id.
    let dispatches = worker.drain_dispatches();
    assert_eq!(dispatches.len(), 1);
    let seen: serde_json::Value = serde_json::from_str(&dispatches[0].payload_json).unwrap();
    assert_eq!(seen["session_id"], "owner-a/s1");

    // The persisted result is back in the owner's namespace.
    let result: serde_json::Value =
        serde_json::from_str(submitted.task.result_json.as_ref().unwrap()).unwrap();
    assert_eq!(result["session_id"], "s1");
}

#[test]
async fn unrescopable_results_fail_the_task() {
    let env = test_env().await;
    install_worker(&env, "node-a", "secret-a").await;
    let open = connect(&env, "node-a", "secret-a", &[("terminalExec", 4)]).await;
    let responder: Responder = Box::new(|dispatch| {
        Some(boxgrid_common::model::protocol::CommandResultFrame {
            command_id: dispatch.command_id.clone(),
            payload_json: json!({"session_id": "owner-b/s1"}).to_string(),
            error: None,
            completed_unix_ms: None,
        })
    });
    let _worker = spawn_worker(env.services.session_service.clone(), open, responder);

    let ctx = CancellationToken::new();
    let submitted = env
        .services
        .task_service
        .submit_task(
            &ctx,
            submit_request(CAPABILITY_TERMINAL_EXEC, json!({"session_id": "s1"})),
        )
        .await
        .expect("submit");
    assert_status(&submitted.task, TaskStatus::Failed);
    assert_eq!(
        submitted.task.error_code.as_deref(),
        Some("invalid_scoped_payload")
    );
    // The untrusted payload was not persisted.
    assert_eq!(submitted.task.result_json, None);
}

#[test]
async fn worker_errors_surface_as_task_failures_with_the_worker_code() {
    let env = test_env().await;
    install_worker(&env, "node-a", "secret-a").await;
    let open = connect(&env, "node-a", "secret-a", &[("echo", 4)]).await;
    let responder: Responder = Box::new(|dispatch| {
        Some(boxgrid_common::model::protocol::CommandResultFrame {
            command_id: dispatch.command_id.clone(),
            payload_json: String::new(),
            error: Some(boxgrid_common::model::protocol::CommandErrorBody {
                code: "python_error".to_string(),
                message: "SyntaxError".to_string(),
            }),
            completed_unix_ms: None,
        })
    });
    let _worker = spawn_worker(env.services.session_service.clone(), open, responder);

    let ctx = CancellationToken::new();
    let submitted = env
        .services
        .task_service
        .submit_task(&ctx, submit_request("echo", json!({})))
        .await
        .expect("submit");
    assert_status(&submitted.task, TaskStatus::Failed);
    assert_eq!(submitted.task.error_code.as_deref(), Some("python_error"));
    assert_eq!(submitted.task.error_message.as_deref(), Some("SyntaxError"));
}
