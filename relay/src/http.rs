//! The relay's HTTP surface.
//!
//! Bodies are JSON. Channel reads are dual-mode: an `Accept: text/event-stream`
//! request gets a live server-sent-events stream (welcome first, then the
//! replayed history, then new messages as they arrive); anything else gets a
//! plain JSON snapshot. Both modes are backed by the same storage read.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt, stream};
use serde_derive::{Deserialize, Serialize};

use crate::{DeallocateStatus, Message, Relay, RelayError, Subscription, Welcome};

pub(crate) fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/{app_id}/allocate", post(allocate))
        .route("/{app_id}/list", get(list))
        .route("/{app_id}/{channel_id}", post(add_message).get(read_channel))
        .route("/{app_id}/{channel_id}/deallocate", post(deallocate))
        .with_state(relay)
}

#[derive(Deserialize)]
struct SideBody {
    side: String,
}

#[derive(Deserialize)]
struct MessageBody {
    side: String,
    phase: String,
    body: String,
}

#[derive(Serialize)]
struct AllocatedBody<'a> {
    welcome: &'a Welcome,
    #[serde(rename = "channel-id")]
    channel_id: u32,
}

#[derive(Serialize)]
struct ListBody<'a> {
    welcome: &'a Welcome,
    #[serde(rename = "channel-ids")]
    channel_ids: Vec<u32>,
}

#[derive(Serialize)]
struct ChannelBody<'a> {
    welcome: &'a Welcome,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct StatusBody {
    status: DeallocateStatus,
}

async fn allocate(
    State(relay): State<Arc<Relay>>,
    Path(app_id): Path<String>,
    Json(body): Json<SideBody>,
) -> Result<Response, ApiError> {
    let channel_id = relay.allocate(&app_id, &body.side)?;
    Ok(Json(AllocatedBody {
        welcome: relay.welcome(),
        channel_id,
    })
    .into_response())
}

async fn list(
    State(relay): State<Arc<Relay>>,
    Path(app_id): Path<String>,
) -> Result<Response, ApiError> {
    let channel_ids = relay.list(&app_id)?;
    Ok(Json(ListBody {
        welcome: relay.welcome(),
        channel_ids,
    })
    .into_response())
}

async fn add_message(
    State(relay): State<Arc<Relay>>,
    Path((app_id, channel_id)): Path<(String, u32)>,
    Json(body): Json<MessageBody>,
) -> Result<Response, ApiError> {
    let messages = relay.add_message(&app_id, channel_id, &body.side, &body.phase, &body.body)?;
    Ok(Json(ChannelBody {
        welcome: relay.welcome(),
        messages,
    })
    .into_response())
}

async fn read_channel(
    State(relay): State<Arc<Relay>>,
    Path((app_id, channel_id)): Path<(String, u32)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if !wants_event_stream(&headers) {
        let messages = relay.channel_messages(&app_id, channel_id)?;
        return Ok(Json(ChannelBody {
            welcome: relay.welcome(),
            messages,
        })
        .into_response());
    }
    let (history, subscription) = relay.clone().subscribe(&app_id, channel_id)?;
    Ok(event_stream(relay.welcome(), history, subscription).into_response())
}

async fn deallocate(
    State(relay): State<Arc<Relay>>,
    Path((app_id, channel_id)): Path<(String, u32)>,
    Json(body): Json<SideBody>,
) -> Result<Json<StatusBody>, ApiError> {
    let status = relay.deallocate(&app_id, channel_id, &body.side)?;
    Ok(Json(StatusBody { status }))
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|accept| accept.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

/// Welcome, replayed history, then live fan-out. The subscriber was
/// registered before this stream is polled, so nothing falls in between.
fn event_stream(
    welcome: &Welcome,
    history: Vec<Message>,
    subscription: Subscription,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>> + use<>> {
    let mut replay = Vec::with_capacity(history.len() + 1);
    replay.push(Event::default().event("welcome").json_data(welcome));
    replay.extend(
        history
            .into_iter()
            .map(|message| Event::default().json_data(&message)),
    );
    let live = subscription.map(|message| Event::default().json_data(&message));
    Sse::new(stream::iter(replay).chain(live)).keep_alive(KeepAlive::default())
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
