//! Realtime endpoints: an SSE event stream per connection plus room
//! membership changes.
//!
//! `GET /realtime/{tenant}/{namespace}/events?token=...` opens a stream; the
//! first event (`connected`) carries the connection id used by `join` and
//! `leave`.

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use execustack_tasks::tasks::namespace_path;
use execustack_tasks::util::normalize_name;
use execustack_tasks::Claims;

use crate::error::{AppError, AppResult};
use crate::realtime::{RealtimeEvent, RealtimeHub};
use crate::state::AppState;

/// Event announcing the connection id.
pub const CONNECTED_EVENT: &str = "connected";

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    pub token: String,
}

/// Body of `join` and `leave`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsRequest {
    pub connection_id: String,
    #[serde(default)]
    pub rooms: Vec<String>,
}

/// Rooms a namespace credential allows.
fn allowed_rooms(claims: &Claims) -> Vec<String> {
    claims
        .payload
        .get("rooms")
        .and_then(Value::as_array)
        .map(|rooms| {
            rooms
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Check that `claims` were issued for namespace `name` of `tenant`.
fn authorize(claims: &Claims, tenant: &str, name: &str) -> AppResult<()> {
    if claims.sub != tenant {
        return Err(AppError::Forbidden("token was issued for another tenant".to_string()));
    }
    if claims.payload.get("namespace").and_then(Value::as_str) != Some(name) {
        return Err(AppError::Forbidden("token was issued for another namespace".to_string()));
    }
    Ok(())
}

/// Open an event stream on a namespace.
///
/// GET /realtime/{tenant}/{namespace}/events?token=...
pub async fn events(
    State(state): State<AppState>,
    Path((tenant, name)): Path<(String, String)>,
    Query(params): Query<EventsParams>,
) -> AppResult<Response> {
    let claims = state.stack().tokens.verify(&params.token).await?;
    authorize(&claims, &tenant, &normalize_name(&name))?;
    let namespace = namespace_path(&tenant, &name);

    let (tx, rx) = mpsc::unbounded_channel::<RealtimeEvent>();
    let connection_id = state
        .hub
        .connect(&tenant, &namespace, allowed_rooms(&claims), tx.clone())
        .await;
    let _ = tx.send(RealtimeEvent {
        event: CONNECTED_EVENT.to_string(),
        payload: json!({ "connection_id": connection_id, "namespace": namespace }),
    });

    let event_stream = UnboundedReceiverStream::new(rx).map(|e| {
        let data = serde_json::to_string(&e.payload).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().event(e.event).data(data))
    });

    let cleanup_stream = CleanupStream {
        inner: Box::pin(event_stream),
        hub: state.hub.clone(),
        namespace,
        connection_id,
    };

    Ok(Sse::new(cleanup_stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
        .into_response())
}

/// Join rooms allowed by the connection's credential.
///
/// POST /realtime/{tenant}/{namespace}/join
pub async fn join(
    State(state): State<AppState>,
    Path((tenant, name)): Path<(String, String)>,
    Json(request): Json<RoomsRequest>,
) -> AppResult<Json<Value>> {
    let namespace = namespace_path(&tenant, &name);
    let joined = state
        .hub
        .join_rooms(&namespace, &request.connection_id, &request.rooms)
        .await?;
    Ok(Json(json!({ "namespace": namespace, "rooms": joined })))
}

/// Leave rooms.
///
/// POST /realtime/{tenant}/{namespace}/leave
pub async fn leave(
    State(state): State<AppState>,
    Path((tenant, name)): Path<(String, String)>,
    Json(request): Json<RoomsRequest>,
) -> AppResult<Json<Value>> {
    let namespace = namespace_path(&tenant, &name);
    state
        .hub
        .leave_rooms(&namespace, &request.connection_id, &request.rooms)
        .await?;
    Ok(Json(json!({ "namespace": namespace, "left": request.rooms })))
}

/// Stream wrapper that disconnects from the hub when the client goes away.
struct CleanupStream<S> {
    inner: std::pin::Pin<Box<S>>,
    hub: Arc<RealtimeHub>,
    namespace: String,
    connection_id: String,
}

impl<S: Stream<Item = Result<Event, Infallible>> + Send> Stream for CleanupStream<S> {
    type Item = Result<Event, Infallible>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<S> Drop for CleanupStream<S> {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let namespace = std::mem::take(&mut self.namespace);
        let connection_id = std::mem::take(&mut self.connection_id);
        tokio::spawn(async move {
            hub.disconnect(&namespace, &connection_id).await;
        });
    }
}
