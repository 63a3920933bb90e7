use crate::hub::Topic;
use crate::manager::MessageManager;
use crate::policy::PolicyError;
use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use mailcove_lifecycle::Shutdown;
use msgstore::{MessageSummary, StoreError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpParams {
    pub listen: String,
}

impl Default for HttpParams {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9000".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<MessageManager>,
}

pub async fn start_http_listener(
    params: HttpParams,
    manager: Arc<MessageManager>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = params
        .listen
        .parse()
        .with_context(|| format!("parsing http listen address {}", params.listen))?;
    let listener = std::net::TcpListener::bind(addr)
        .with_context(|| format!("binding http listener on {addr}"))?;
    listener.set_nonblocking(true)?;
    tracing::info!("http listener on {addr}");

    let app = make_router(AppState { manager });
    let server = axum::Server::from_tcp(listener)?
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            let mut shutdown = Shutdown::subscribe();
            shutdown.wait().await;
        });
    tokio::spawn(async move {
        if let Err(err) = server.await {
            tracing::error!("http server: {err:#}");
        }
    });
    Ok(())
}

pub fn make_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(report_metrics))
        .route("/v1/mailbox/:name", get(list_mailbox).delete(purge_mailbox))
        .route(
            "/v1/mailbox/:name/:id",
            get(get_message).patch(patch_message).delete(delete_message),
        )
        .route("/v1/mailbox/:name/:id/source", get(get_message_source))
        .route("/v2/monitor/messages", get(monitor_messages))
        .with_state(state)
}

struct AppError(anyhow::Error);

// Map the error kinds a handler can surface onto HTTP statuses; the
// rest is a plain 500.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if let Some(err) = self.0.downcast_ref::<StoreError>() {
            match err {
                StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                StoreError::BadInput(_) => StatusCode::BAD_REQUEST,
                StoreError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                StoreError::StoreFull => StatusCode::INSUFFICIENT_STORAGE,
                StoreError::Io(_) | StoreError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            }
        } else if self.0.downcast_ref::<PolicyError>().is_some() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, format!("Error: {:#}", self.0)).into_response()
    }
}

// This enables using `?` on functions that return `Result<_, anyhow::Error>`
// to turn them into `Result<_, AppError>`.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

async fn report_metrics() -> Result<String, AppError> {
    let report = prometheus::TextEncoder::new()
        .encode_to_string(&prometheus::default_registry().gather())?;
    Ok(report)
}

async fn list_mailbox(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<MessageSummary>>, AppError> {
    let mailbox = state.manager.policy().resolve_name(&name)?;
    Ok(Json(state.manager.get_messages(&mailbox).await?))
}

/// Full message rendering: the summary fields plus the decoded body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct MessageDetail {
    #[serde(flatten)]
    summary: MessageSummary,
    body: String,
}

async fn get_message(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<Json<MessageDetail>, AppError> {
    let mailbox = state.manager.policy().resolve_name(&name)?;
    let msg = state.manager.get_message(&mailbox, &id).await?;
    Ok(Json(MessageDetail {
        body: body_text(&msg.source),
        summary: msg.summary,
    }))
}

async fn get_message_source(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let mailbox = state.manager.policy().resolve_name(&name)?;
    let msg = state.manager.get_message(&mailbox, &id).await?;
    Ok(([(header::CONTENT_TYPE, "message/rfc822")], msg.source).into_response())
}

#[derive(Debug, Deserialize)]
struct SeenPatch {
    seen: bool,
}

async fn patch_message(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Json(patch): Json<SeenPatch>,
) -> Result<StatusCode, AppError> {
    if !patch.seen {
        // The flag only ever goes one way; clearing it means purging
        // the message.
        return Err(StoreError::BadInput("seen can only be set to true".to_string()).into());
    }
    let mailbox = state.manager.policy().resolve_name(&name)?;
    state.manager.mark_seen(&mailbox, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_message(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let mailbox = state.manager.policy().resolve_name(&name)?;
    state.manager.remove_message(&mailbox, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn purge_mailbox(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    let mailbox = state.manager.policy().resolve_name(&name)?;
    state.manager.purge_messages(&mailbox).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn monitor_messages(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| monitor_stream(socket, state))
}

/// Forward a wildcard hub subscription over the socket until either
/// side goes away. A slow client sheds events in the hub, never here.
async fn monitor_stream(mut socket: WebSocket, state: AppState) {
    let mut sub = state.manager.hub().subscribe(Topic::All);
    let mut shutdown = Shutdown::subscribe();
    loop {
        tokio::select! {
            event = sub.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = shutdown.wait() => {
                socket.send(Message::Close(None)).await.ok();
                break;
            }
        }
    }
}

/// Everything after the first blank line, decoded leniently.
fn body_text(source: &[u8]) -> String {
    let mut offset = 0;
    for line in source.split_inclusive(|&b| b == b'\n') {
        offset += line.len();
        if line == b"\r\n" || line == b"\n" {
            return String::from_utf8_lossy(&source[offset..]).to_string();
        }
    }
    String::new()
}
