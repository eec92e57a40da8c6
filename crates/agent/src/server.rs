//! HTTP transport for the agent service.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use installer_proto::{
    abort_path, encode_frame, execute_path, shutdown_path, AbortRequest, ExecuteRequest, Message,
    ShutdownRequest, CONTENT_TYPE,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::Result;
use crate::service::AgentService;

/// Body of the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub status: String,
    pub hostname: String,
    pub advertise_ip: String,
}

pub fn create_router(service: Arc<AgentService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(&execute_path(), post(execute))
        .route(&shutdown_path(), post(shutdown))
        .route(&abort_path(), post(abort))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serves the agent until a shutdown request has been honored.
pub async fn serve(listener: TcpListener, service: Arc<AgentService>) -> std::io::Result<()> {
    let shutdown = service.shutdown_token();
    info!("Agent listening on {}", listener.local_addr()?);

    axum::serve(listener, create_router(service))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Agent stopped");
    Ok(())
}

fn proto_response<M: Message>(message: &M) -> Response {
    (
        [(header::CONTENT_TYPE, CONTENT_TYPE)],
        message.encode_to_bytes(),
    )
        .into_response()
}

async fn health(State(service): State<Arc<AgentService>>) -> Json<AgentIdentity> {
    let config = service.config();
    Json(AgentIdentity {
        status: "ok".to_string(),
        hostname: config.hostname.clone(),
        advertise_ip: config.advertise_ip.clone(),
    })
}

async fn execute(State(service): State<Arc<AgentService>>, body: Bytes) -> Result<Response> {
    ExecuteRequest::decode(&body)?;
    let session = service.execute().await?;
    let frames = session.map(|progress| Ok::<_, Infallible>(encode_frame(&progress)));

    Ok((
        [(header::CONTENT_TYPE, CONTENT_TYPE)],
        Body::from_stream(frames),
    )
        .into_response())
}

async fn shutdown(State(service): State<Arc<AgentService>>, body: Bytes) -> Result<Response> {
    ShutdownRequest::decode(&body)?;
    Ok(proto_response(&service.shutdown().await))
}

async fn abort(State(service): State<Arc<AgentService>>, body: Bytes) -> Result<Response> {
    AbortRequest::decode(&body)?;
    Ok(proto_response(&service.abort().await))
}
