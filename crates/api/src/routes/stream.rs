//! Live notification stream route (SSE).
//!
//! One-directional push channel. The handler registers the connection,
//! flushes the unread backlog oldest-first, then forwards live envelopes;
//! keep-alive comment lines at the configured heartbeat interval keep the
//! channel open through intermediaries. Client disconnects (or server
//! shutdown draining the registry) end the stream, which releases the
//! connection's registry slot.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::stream::{Stream, StreamExt};

use crewflow_common::error::AppError;
use crewflow_notify::transport::StreamSession;

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/notifications/stream", get(subscribe))
}

/// GET /api/notifications/stream — Subscribe to live notification pushes.
async fn subscribe(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, AppError> {
    let session = StreamSession::connect(
        &state.pool,
        state.registry.clone(),
        auth.user_id,
        &auth.roles,
        state.config.backlog_limit,
    )
    .await?;

    let stream = session.into_stream().map(|envelope| {
        let kind = envelope.kind.to_string();
        let id = envelope.id.to_string();
        let json = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());
        Ok(SseEvent::default().event(kind).data(json).id(id))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(state.config.heartbeat_interval_secs))
            .text("heartbeat"),
    ))
}
