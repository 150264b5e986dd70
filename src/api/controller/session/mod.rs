//! Exec sockets, port-forward control and the session registry.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::dto::session_dto::{
    ExecQuery, ExecSessionFrame, PortForwardStartRequest, PortForwardStartResponse,
    PortForwardStopRequest, PortForwardStopResponse,
};
use crate::api::dto::ApiResponse;
use crate::api::util::json::{to_json_app, validated};
use crate::app_state::AppState;
use crate::core::client::pods::PodRef;
use crate::domain::session::model::{ExecInput, ExecOutput, SessionFilter, SessionKind, SessionSummary};
use crate::domain::session::service::session_manager::SessionManager;
use crate::errors::AppError;

const FRAME_BUFFER: usize = 64;

pub struct SessionController;

impl SessionController {
    /// `GET /exec/{namespace}/{pod}`: upgrade to a websocket carrying exec frames.
    pub async fn exec(
        State(state): State<AppState>,
        Path((namespace, pod)): Path<(String, String)>,
        Query(query): Query<ExecQuery>,
        ws: WebSocketUpgrade,
    ) -> Response {
        let target = PodRef::new(namespace, pod).with_container(query.container.clone());
        let command = query.command();
        let sessions = state.sessions.clone();

        ws.on_upgrade(move |socket| run_exec_socket(socket, sessions, target, command))
    }

    pub async fn start_port_forward(
        State(state): State<AppState>,
        Json(request): Json<PortForwardStartRequest>,
    ) -> Result<Json<ApiResponse<PortForwardStartResponse>>, AppError> {
        let request = validated(request)?;
        let summary = state
            .sessions
            .start_port_forward(
                PodRef::new(request.namespace, request.pod),
                request.local_port,
                request.remote_port,
            )
            .await?;

        to_json_app(Ok(PortForwardStartResponse {
            session_id: summary.id,
            local_port: summary.local_port.unwrap_or_default(),
            remote_port: summary.remote_port.unwrap_or(request.remote_port),
        }))
    }

    /// Stopping a tunnel that is not running is not an error.
    pub async fn stop_port_forward(
        State(state): State<AppState>,
        Json(request): Json<PortForwardStopRequest>,
    ) -> Result<Json<ApiResponse<PortForwardStopResponse>>, AppError> {
        let request = validated(request)?;
        let stopped = state.sessions.stop_port_forward(
            &request.namespace,
            &request.pod,
            request.local_port,
            request.remote_port,
        );

        to_json_app(Ok(PortForwardStopResponse {
            stopped: stopped.is_some(),
            session_id: stopped.map(|s| s.id),
        }))
    }

    pub async fn list_port_forwards(
        State(state): State<AppState>,
        Query(filter): Query<SessionFilter>,
    ) -> Result<Json<ApiResponse<Vec<SessionSummary>>>, AppError> {
        let filter = SessionFilter {
            kind: Some(SessionKind::PortForward),
            ..filter
        };
        to_json_app(Ok(state.sessions.list(&filter)))
    }

    pub async fn list(
        State(state): State<AppState>,
        Query(filter): Query<SessionFilter>,
    ) -> Result<Json<ApiResponse<Vec<SessionSummary>>>, AppError> {
        to_json_app(Ok(state.sessions.list(&filter)))
    }

    pub async fn stop(
        State(state): State<AppState>,
        Path(id): Path<Uuid>,
    ) -> Result<Json<ApiResponse<SessionSummary>>, AppError> {
        to_json_app(state.sessions.stop(&id))
    }
}

async fn send_frame<T: Serialize>(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &T,
) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => sink.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!("Dropping unserializable exec frame: {}", e);
            Ok(())
        }
    }
}

async fn run_exec_socket(
    socket: WebSocket,
    sessions: Arc<SessionManager>,
    target: PodRef,
    command: Vec<String>,
) {
    let (mut sink, mut stream) = socket.split();
    let (input_tx, input_rx) = mpsc::channel(FRAME_BUFFER);
    let (output_tx, mut output_rx) = mpsc::channel(FRAME_BUFFER);

    let session = match sessions.start_exec(target, command, input_rx, output_tx).await {
        Ok(session) => session,
        Err(e) => {
            let _ = send_frame(&mut sink, &ExecOutput::Error { data: e.to_string() }).await;
            let _ = sink.close().await;
            return;
        }
    };
    let id = session.id;
    if send_frame(&mut sink, &ExecSessionFrame::new(id)).await.is_err() {
        let _ = sessions.stop(&id);
        return;
    }

    // Socket to session. Dropping `input_tx` on return ends the session.
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            let frame = match message {
                Message::Text(text) => serde_json::from_str::<ExecInput>(text.as_str()),
                Message::Binary(bytes) => serde_json::from_slice::<ExecInput>(&bytes),
                Message::Close(_) => break,
                _ => continue,
            };
            match frame {
                Ok(frame) => {
                    if input_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!("Session {}: ignoring malformed frame: {}", id, e),
            }
        }
    });

    // Session to socket, until the session drops its output.
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = output_rx.recv().await {
            if send_frame(&mut sink, &frame).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });

    tokio::select! {
        _ = &mut reader => {
            // Let the closing notice through before the socket goes away.
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), &mut writer).await;
            writer.abort();
        }
        _ = &mut writer => reader.abort(),
    }
    debug!("Exec socket for session {} closed", id);
}
