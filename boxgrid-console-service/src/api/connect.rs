use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use boxgrid_common::model::protocol::ConnectRequest;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn, Instrument};

use crate::api::ApiState;
use crate::service::session::{SessionError, SessionService};

/// The worker-facing bidirectional stream: JSON frames over a websocket.
pub async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.sessions))
}

async fn handle_socket(socket: WebSocket, sessions: Arc<SessionService>) {
    let (mut sink, mut stream) = socket.split();

    // The first frame on a fresh stream must be a hello.
    let hello = match read_frame(&mut stream).await {
        Some(Ok(ConnectRequest::Hello(hello))) => hello,
        Some(Ok(_)) => {
            let err = SessionError::InvalidArgument(
                "the first frame must be a hello".to_string(),
            );
            close_with_error(&mut sink, &err).await;
            return;
        }
        Some(Err(err)) => {
            close_with_error(&mut sink, &err).await;
            return;
        }
        None => return,
    };

    let open = match sessions.open_session(hello).await {
        Ok(open) => open,
        Err(err) => {
            info!("Rejected worker stream: {err}");
            close_with_error(&mut sink, &err).await;
            return;
        }
    };
    let session = open.session;
    let mut writer = open.writer;
    let span = tracing::info_span!(
        "worker_session",
        node_id = %session.node_id,
        session_id = %session.session_id
    );

    let writer_session = session.clone();
    let write_task = tokio::spawn(
        async move {
            while let Some(frame) = writer.next().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("Failed to encode outbound frame: {err}");
                        break;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let reason = writer_session
                .close_cause()
                .map(|cause| cause.to_string())
                .unwrap_or_default();
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: reason.into(),
                })))
                .await;
        }
        .instrument(span.clone()),
    );

    async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let frame: ConnectRequest = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(err) => {
                            sessions
                                .close_session(
                                    &session,
                                    SessionError::InvalidArgument(format!(
                                        "malformed frame: {err}"
                                    )),
                                )
                                .await;
                            return;
                        }
                    };
                    if let Err(err) = sessions.handle_frame(&session, frame).await {
                        match err {
                            // Unknown node on heartbeat: the operation
                            // fails but the stream may continue.
                            SessionError::NotFound(message) => {
                                warn!("Heartbeat for unknown node: {message}");
                            }
                            err => {
                                sessions.close_session(&session, err).await;
                                return;
                            }
                        }
                    }
                }
                Ok(Message::Close(frame)) => {
                    debug!("Worker closed the stream: {frame:?}");
                    sessions
                        .close_session(
                            &session,
                            SessionError::Unavailable("stream closed by worker".to_string()),
                        )
                        .await;
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    sessions
                        .close_session(
                            &session,
                            SessionError::Unavailable(format!("stream error: {err}")),
                        )
                        .await;
                    return;
                }
            }
        }
        sessions
            .close_session(
                &session,
                SessionError::Unavailable("stream ended".to_string()),
            )
            .await;
    }
    .instrument(span)
    .await;

    write_task.await.ok();
}

async fn read_frame(
    stream: &mut SplitStream<WebSocket>,
) -> Option<Result<ConnectRequest, SessionError>> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                return Some(serde_json::from_str(&text).map_err(|err| {
                    SessionError::InvalidArgument(format!("malformed frame: {err}"))
                }))
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn close_with_error(sink: &mut SplitSink<WebSocket, Message>, err: &SessionError) {
    let close_frame = CloseFrame {
        code: close_code::ERROR,
        reason: err.to_string().into(),
    };
    if sink.send(Message::Close(Some(close_frame))).await.is_err() {
        debug!("Failed to send close frame");
    }
}
