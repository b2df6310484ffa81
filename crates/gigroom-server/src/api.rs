use std::sync::Arc;

use axum::{
    extract::{FromRef, Path, State},
    http::{HeaderMap, Method},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use gigroom_shared::protocol::ChatMessage;
use gigroom_shared::{JobId, UserId};
use gigroom_store::JobParticipants;

use crate::auth::{Actor, JwtConfig};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::gateway::Gateway;
use crate::jobs::SqliteJobDirectory;
use crate::ws::chat_ws;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub jwt: Arc<JwtConfig>,
    pub jobs: Arc<SqliteJobDirectory>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(chat_ws))
        .route("/api/messages/send", post(send_message))
        .route("/api/messages/{job_id}", get(job_history))
        .route("/api/messages/{job_id}/unread", get(unread_messages))
        .route("/api/jobs/{job_id}/participants", put(put_participants))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    job_id: String,
    receiver_id: String,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageResponse {
    msg: &'static str,
    new_message: ChatMessage,
}

/// Participant record pushed by the job service. The job id comes from
/// the path.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParticipantsRequest {
    client: UserId,
    #[serde(default)]
    applicants: Vec<UserId>,
    #[serde(default)]
    hired_developer: Option<UserId>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn send_message(
    State(gateway): State<Arc<Gateway>>,
    Actor(actor): Actor,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ServerError> {
    let message = gateway
        .send_message(&actor, &req.job_id, &req.receiver_id, &req.message)
        .await?;

    Ok(Json(SendMessageResponse {
        msg: "Message sent successfully",
        new_message: message.into(),
    }))
}

async fn job_history(
    State(gateway): State<Arc<Gateway>>,
    Actor(actor): Actor,
    Path(job_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ServerError> {
    let job = JobId::parse(&job_id)?;
    let history = gateway.history(&actor, &job).await?;
    Ok(Json(history.into_iter().map(ChatMessage::from).collect()))
}

async fn unread_messages(
    State(gateway): State<Arc<Gateway>>,
    Actor(actor): Actor,
    Path(job_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ServerError> {
    let job = JobId::parse(&job_id)?;
    let unread = gateway.unread(&actor, &job).await?;
    Ok(Json(unread.into_iter().map(ChatMessage::from).collect()))
}

async fn put_participants(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(req): Json<ParticipantsRequest>,
) -> Result<Json<JobParticipants>, ServerError> {
    verify_service_token(&headers, &state.config)?;

    let participants = JobParticipants {
        job_id: JobId::parse(&job_id)?,
        client: req.client,
        applicants: req.applicants,
        hired_developer: req.hired_developer,
    };
    state.jobs.upsert(participants.clone()).await?;

    info!(
        job = %participants.job_id,
        applicants = participants.applicants.len(),
        hired = participants.hired_developer.is_some(),
        "Job participants updated"
    );
    Ok(Json(participants))
}

fn verify_service_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.service_token else {
        return Err(ServerError::Forbidden(
            "Participant sync is disabled (no SERVICE_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Unauthorized("Invalid service token".into()));
    }

    Ok(())
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(state, listener).await
}

/// Serve on an already-bound listener.
pub async fn serve_on(state: AppState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %listener.local_addr()?, "Starting HTTP server");
    axum::serve(listener, app).await?;

    Ok(())
}
