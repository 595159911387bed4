//! HTTP+SSE binding over the dispatcher.
//!
//! Three endpoints: `POST /rpc` for single request/response exchanges,
//! `GET /sse` for the server-push notification stream, and `GET /health`
//! for liveness. Everything except `/health` demands a bearer credential
//! the configured verifier accepts.

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response as AxumResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::stream;
use mcpd::{Dispatcher, McpError, rpc::Response};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

const SSE_HEARTBEAT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/rpc", post(handle_rpc))
        .route("/sse", get(handle_sse))
        .route("/health", get(handle_health))
        .layer(CorsLayer::permissive())
        .with_state(AppState { dispatcher })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("Authorization")?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_owned)
}

/// Transport-level credential check shared by `/rpc` and `/sse`. A refusal
/// is a 401 carrying the `unauthorized` JSON-RPC envelope in the body.
async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<String>, AxumResponse> {
    let token = bearer_token(headers);
    match state.dispatcher.verifier().verify(token.as_deref()).await {
        Ok(_) => Ok(token),
        Err(e) => {
            warn!(reason = %e, "unauthorized request");
            let body = Response::err(
                None,
                McpError::Unauthorized {
                    reason: e.to_string(),
                },
            );
            Err((StatusCode::UNAUTHORIZED, Json(body)).into_response())
        }
    }
}

async fn handle_rpc(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> AxumResponse {
    let bearer = match authorize(&state, &headers).await {
        Ok(token) => token,
        Err(refusal) => return refusal,
    };

    let result = state.dispatcher.handle(&body, bearer.as_deref()).await;
    match result.response {
        Some(response) => Json(response).into_response(),
        // Notifications are acknowledged without a body.
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn handle_sse(State(state): State<AppState>, headers: HeaderMap) -> AxumResponse {
    if let Err(refusal) = authorize(&state, &headers).await {
        return refusal;
    }

    let receiver = state.dispatcher.notifications().subscribe();
    let events = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(envelope) => {
                    let event = Event::default().event("message").json_data(&envelope);
                    match event {
                        Ok(event) => return Some((Ok::<_, Infallible>(event), receiver)),
                        Err(e) => {
                            debug!(error = %e, "dropping unserializable notification");
                            continue;
                        }
                    }
                }
                // The bounded queue overflowed: this client is too slow to
                // keep up, disconnect it instead of stalling the bus.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE client lagged behind, disconnecting");
                    return None;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(SSE_HEARTBEAT)
                .text("keep-alive"),
        )
        .into_response()
}

async fn handle_health(State(state): State<AppState>) -> AxumResponse {
    Json(state.dispatcher.health().await).into_response()
}
