use test_r::test;

use crate::common::*;
use boxgrid_common::model::protocol::{ConnectRequest, ConnectResponse, HeartbeatFrame};
use boxgrid_common::model::{NodeId, WorkerType, CAPABILITY_COMPUTER_USE};
use boxgrid_console_service::service::session::SessionError;
use chrono::Utc;

fn heartbeat(node_id: &str, session_id: &str) -> ConnectRequest {
    ConnectRequest::Heartbeat(HeartbeatFrame {
        node_id: node_id.to_string(),
        session_id: session_id.to_string(),
        sent_at_unix_ms: Utc::now().timestamp_millis(),
    })
}

#[test]
async fn unknown_node_is_unauthenticated() {
    let env = test_env().await;
    let err = env
        .services
        .session_service
        .open_session(hello("node-ghost", "secret-1", &[("echo", 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Unauthenticated(_)));
}

#[test]
async fn wrong_secret_is_unauthenticated() {
    let env = test_env().await;
    install_worker(&env, "node-1", "secret-1").await;
    let err = env
        .services
        .session_service
        .open_session(hello("node-1", "not-the-secret", &[("echo", 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Unauthenticated(_)));
}

#[test]
async fn node_id_is_validated_before_auth() {
    let env = test_env().await;
    let err = env
        .services
        .session_service
        .open_session(hello("   ", "secret-1", &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidArgument(_)));

    let oversized = "n".repeat(129);
    let err = env
        .services
        .session_service
        .open_session(hello(&oversized, "secret-1", &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidArgument(_)));
}

#[test]
async fn session_replacement_closes_the_previous_stream() {
    let env = test_env().await;
    install_worker(&env, "node-1", "secret-1").await;

    let mut first = connect(&env, "node-1", "secret-1", &[("echo", 2)]).await;
    let session_a = first.session.clone();
    match first.writer.next().await {
        Some(ConnectResponse::ConnectAck(ack)) => {
            assert_eq!(ack.session_id, session_a.session_id.to_string())
        }
        other => panic!("expected connect ack, got {other:?}"),
    }

    let mut second = connect(&env, "node-1", "secret-1", &[("echo", 2)]).await;
    let session_b = second.session.clone();
    assert_ne!(session_a.session_id, session_b.session_id);

    // The first session is closed with FailedPrecondition and no longer
    // indexed.
    assert!(matches!(
        session_a.close_cause(),
        Some(SessionError::FailedPrecondition(_))
    ));
    let indexed = env
        .services
        .session_service
        .get_session(&NodeId::new("node-1"))
        .expect("node should stay online");
    assert_eq!(indexed.session_id, session_b.session_id);

    // A heartbeat carrying the stale session id fails with
    // FailedPrecondition and does not touch last_seen.
    let before = env.node_repo.get("node-1").await.unwrap().unwrap();
    let err = env
        .services
        .session_service
        .handle_frame(
            &session_a,
            heartbeat("node-1", &session_a.session_id.to_string()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::FailedPrecondition(_)));
    let after = env.node_repo.get("node-1").await.unwrap().unwrap();
    assert_eq!(before.last_seen_ms, after.last_seen_ms);

    // A heartbeat on the fresh session is acked.
    env.services
        .session_service
        .handle_frame(
            &session_b,
            heartbeat("node-1", &session_b.session_id.to_string()),
        )
        .await
        .expect("heartbeat should succeed");
    match second.writer.next().await {
        Some(ConnectResponse::ConnectAck(_)) => {}
        other => panic!("expected connect ack, got {other:?}"),
    }
    match second.writer.next().await {
        Some(ConnectResponse::HeartbeatAck(_)) => {}
        other => panic!("expected heartbeat ack, got {other:?}"),
    }
}

#[test]
async fn heartbeat_validation() {
    let env = test_env().await;
    install_worker(&env, "node-1", "secret-1").await;
    let open = connect(&env, "node-1", "secret-1", &[("echo", 1)]).await;

    let err = env
        .services
        .session_service
        .handle_frame(&open.session, heartbeat("node-1", ""))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidArgument(_)));

    let err = env
        .services
        .session_service
        .handle_frame(
            &open.session,
            heartbeat("node-2", &open.session.session_id.to_string()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidArgument(_)));
}

#[test]
async fn hello_is_rejected_on_an_established_session() {
    let env = test_env().await;
    install_worker(&env, "node-1", "secret-1").await;
    let open = connect(&env, "node-1", "secret-1", &[("echo", 1)]).await;
    let err = env
        .services
        .session_service
        .handle_frame(
            &open.session,
            ConnectRequest::Hello(hello("node-1", "secret-1", &[("echo", 1)])),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidArgument(_)));
}

#[test]
async fn worker_sys_capability_policy() {
    let env = test_env().await;
    let provisioned = env
        .services
        .provisioning_service
        .create_for_owner("owner-a", "sys", Utc::now())
        .await
        .expect("Failed to provision sys worker");
    let node_id = provisioned.worker_id.0.clone();
    let secret = provisioned.worker_secret.clone();

    // Declaring anything but exactly {computerUse} is refused, and no
    // session is stored.
    let err = env
        .services
        .session_service
        .open_session(hello(&node_id, &secret, &[("echo", 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::PermissionDenied(_)));
    let err = env
        .services
        .session_service
        .open_session(hello(&node_id, &secret, &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::PermissionDenied(_)));
    let err = env
        .services
        .session_service
        .open_session(hello(&node_id, &secret, &[("computerUse", 4), ("echo", 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::PermissionDenied(_)));
    assert!(env
        .services
        .session_service
        .get_session(&NodeId::new(node_id.as_str()))
        .is_none());

    // A correct declaration is accepted, with max_inflight rewritten to 1
    // regardless of the declared value.
    let open = env
        .services
        .session_service
        .open_session(hello(&node_id, &secret, &[("ComputerUse", 8)]))
        .await
        .expect("sys hello should be accepted");
    assert_eq!(open.session.worker_type, WorkerType::Sys);
    assert_eq!(open.session.owner_id, "owner-a");
    assert_eq!(
        open.session.capability_snapshot(CAPABILITY_COMPUTER_USE),
        Some((0, 1))
    );
}

#[test]
async fn stale_sessions_are_swept_after_the_offline_ttl() {
    let mut config = boxgrid_console_service::config::ConsoleServiceConfig::default();
    config.sessions.offline_ttl = std::time::Duration::from_millis(50);
    let env = test_env_with_config(config).await;
    install_worker(&env, "node-1", "secret-1").await;
    let open = connect(&env, "node-1", "secret-1", &[("echo", 1)]).await;
    let session = open.session.clone();

    // Fresh sessions are not touched.
    assert_eq!(
        env.services
            .session_service
            .sweep_stale_sessions(Utc::now())
            .await,
        0
    );

    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    assert_eq!(
        env.services
            .session_service
            .sweep_stale_sessions(Utc::now())
            .await,
        1
    );
    assert!(matches!(
        session.close_cause(),
        Some(SessionError::DeadlineExceeded(_))
    ));
    assert!(env
        .services
        .session_service
        .get_session(&NodeId::new("node-1"))
        .is_none());
}

#[test]
async fn normal_stream_end_clears_the_session_row() {
    let env = test_env().await;
    install_worker(&env, "node-1", "secret-1").await;
    let open = connect(&env, "node-1", "secret-1", &[("echo", 1)]).await;
    let session = open.session.clone();

    let row = env.node_repo.get("node-1").await.unwrap().unwrap();
    assert_eq!(row.session_id, Some(session.session_id.to_string()));

    env.services
        .session_service
        .close_session(
            &session,
            SessionError::Unavailable("stream closed by worker".to_string()),
        )
        .await;

    assert!(env
        .services
        .session_service
        .get_session(&NodeId::new("node-1"))
        .is_none());
    let row = env.node_repo.get("node-1").await.unwrap().unwrap();
    assert_eq!(row.session_id, None);
}
