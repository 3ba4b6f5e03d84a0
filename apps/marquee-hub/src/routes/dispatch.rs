//! Administrative dispatch ingress.
//!
//! Thin JSON and SSE shims over the dispatch engine. Per-device outcomes
//! stay data in the response body; only the HTTP status of unary calls
//! reflects the single device's outcome. Fan-out responses are always
//! 200 because partial success is the normal case.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use marquee_proto::{CommandFrame, ContentFrame, DeviceCommand, MediaItem};

use crate::dispatch::{Acknowledgement, DispatchError, DispatchOutcome};
use crate::session::SessionSnapshot;
use crate::state::HubState;
use crate::stream::DispatchEvent;

use super::ApiError;

fn default_requires_ack() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct CommandDispatchRequest {
    pub command: DeviceCommand,
    #[serde(default = "default_requires_ack")]
    pub requires_ack: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ContentDispatchRequest {
    pub content: serde_json::Value,
    #[serde(default)]
    pub media: Vec<MediaItem>,
    #[serde(default = "default_requires_ack")]
    pub requires_ack: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl CommandDispatchRequest {
    fn into_frame(self) -> (CommandFrame, Option<u64>) {
        (
            CommandFrame::new(self.command, self.requires_ack),
            self.timeout_ms,
        )
    }
}

impl ContentDispatchRequest {
    fn into_frame(self) -> (ContentFrame, Option<u64>) {
        (
            ContentFrame::new(self.content, self.media, self.requires_ack),
            self.timeout_ms,
        )
    }
}

fn command_timeout(state: &HubState, timeout_ms: Option<u64>) -> Duration {
    Duration::from_millis(timeout_ms.unwrap_or(state.config.command_timeout_ms))
}

fn content_timeout(state: &HubState, timeout_ms: Option<u64>) -> Duration {
    Duration::from_millis(timeout_ms.unwrap_or(state.config.content_timeout_ms))
}

/// Only `completed` is success; device-reported failures surface as 502,
/// absence as 404 and silence as 504.
fn status_for(outcome: &DispatchOutcome) -> StatusCode {
    match outcome {
        DispatchOutcome::Completed => StatusCode::OK,
        DispatchOutcome::NotConnected => StatusCode::NOT_FOUND,
        DispatchOutcome::Timeout => StatusCode::GATEWAY_TIMEOUT,
        DispatchOutcome::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        DispatchOutcome::Failed(_)
        | DispatchOutcome::Rejected(_)
        | DispatchOutcome::Disconnected
        | DispatchOutcome::Cancelled => StatusCode::BAD_GATEWAY,
    }
}

pub async fn dispatch_command(
    State(state): State<HubState>,
    Path(device_id): Path<String>,
    Json(request): Json<CommandDispatchRequest>,
) -> impl IntoResponse {
    let (frame, timeout_ms) = request.into_frame();
    let timeout = command_timeout(&state, timeout_ms);
    let result = state.commands.dispatch(&device_id, frame, timeout).await;
    (status_for(&result.outcome), Json(result))
}

pub async fn dispatch_content(
    State(state): State<HubState>,
    Path(device_id): Path<String>,
    Json(request): Json<ContentDispatchRequest>,
) -> impl IntoResponse {
    let (frame, timeout_ms) = request.into_frame();
    let timeout = content_timeout(&state, timeout_ms);
    let result = state.content.dispatch(&device_id, frame, timeout).await;
    (status_for(&result.outcome), Json(result))
}

pub async fn broadcast_command(
    State(state): State<HubState>,
    Json(request): Json<CommandDispatchRequest>,
) -> impl IntoResponse {
    let CommandDispatchRequest {
        command,
        requires_ack,
        timeout_ms,
    } = request;
    let timeout = command_timeout(&state, timeout_ms);
    let report = state
        .commands
        .dispatch_all(
            move |_| CommandFrame::new(command.clone(), requires_ack),
            timeout,
        )
        .await;
    Json(report)
}

pub async fn broadcast_content(
    State(state): State<HubState>,
    Json(request): Json<ContentDispatchRequest>,
) -> impl IntoResponse {
    let ContentDispatchRequest {
        content,
        media,
        requires_ack,
        timeout_ms,
    } = request;
    let timeout = content_timeout(&state, timeout_ms);
    let report = state
        .content
        .dispatch_all(
            move |_| ContentFrame::new(content.clone(), media.clone(), requires_ack),
            timeout,
        )
        .await;
    Json(report)
}

pub async fn dispatch_command_to_fleet(
    State(state): State<HubState>,
    Path(fleet_id): Path<String>,
    Json(request): Json<CommandDispatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let CommandDispatchRequest {
        command,
        requires_ack,
        timeout_ms,
    } = request;
    let timeout = command_timeout(&state, timeout_ms);
    let report = state
        .commands
        .dispatch_fleet(
            &fleet_id,
            move |_| CommandFrame::new(command.clone(), requires_ack),
            timeout,
        )
        .await
        .map_err(fleet_error)?;
    Ok(Json(report))
}

pub async fn dispatch_content_to_fleet(
    State(state): State<HubState>,
    Path(fleet_id): Path<String>,
    Json(request): Json<ContentDispatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ContentDispatchRequest {
        content,
        media,
        requires_ack,
        timeout_ms,
    } = request;
    let timeout = content_timeout(&state, timeout_ms);
    let report = state
        .content
        .dispatch_fleet(
            &fleet_id,
            move |_| ContentFrame::new(content.clone(), media.clone(), requires_ack),
            timeout,
        )
        .await
        .map_err(fleet_error)?;
    Ok(Json(report))
}

pub async fn stream_command(
    State(state): State<HubState>,
    Path(device_id): Path<String>,
    Json(request): Json<CommandDispatchRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (frame, timeout_ms) = request.into_frame();
    let timeout = command_timeout(&state, timeout_ms);
    sse_events(state.commands.dispatch_stream(&device_id, frame, timeout))
}

pub async fn stream_content(
    State(state): State<HubState>,
    Path(device_id): Path<String>,
    Json(request): Json<ContentDispatchRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (frame, timeout_ms) = request.into_frame();
    let timeout = content_timeout(&state, timeout_ms);
    sse_events(state.content.dispatch_stream(&device_id, frame, timeout))
}

pub async fn stream_broadcast_command(
    State(state): State<HubState>,
    Json(request): Json<CommandDispatchRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let CommandDispatchRequest {
        command,
        requires_ack,
        timeout_ms,
    } = request;
    let timeout = command_timeout(&state, timeout_ms);
    sse_events(state.commands.dispatch_all_stream(
        move |_| CommandFrame::new(command.clone(), requires_ack),
        timeout,
    ))
}

pub async fn stream_broadcast_content(
    State(state): State<HubState>,
    Json(request): Json<ContentDispatchRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let ContentDispatchRequest {
        content,
        media,
        requires_ack,
        timeout_ms,
    } = request;
    let timeout = content_timeout(&state, timeout_ms);
    sse_events(state.content.dispatch_all_stream(
        move |_| ContentFrame::new(content.clone(), media.clone(), requires_ack),
        timeout,
    ))
}

pub async fn stream_command_to_fleet(
    State(state): State<HubState>,
    Path(fleet_id): Path<String>,
    Json(request): Json<CommandDispatchRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let CommandDispatchRequest {
        command,
        requires_ack,
        timeout_ms,
    } = request;
    let timeout = command_timeout(&state, timeout_ms);
    let events = state
        .commands
        .dispatch_fleet_stream(
            &fleet_id,
            move |_| CommandFrame::new(command.clone(), requires_ack),
            timeout,
        )
        .map_err(fleet_error)?;
    Ok(sse_events(events))
}

pub async fn stream_content_to_fleet(
    State(state): State<HubState>,
    Path(fleet_id): Path<String>,
    Json(request): Json<ContentDispatchRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let ContentDispatchRequest {
        content,
        media,
        requires_ack,
        timeout_ms,
    } = request;
    let timeout = content_timeout(&state, timeout_ms);
    let events = state
        .content
        .dispatch_fleet_stream(
            &fleet_id,
            move |_| ContentFrame::new(content.clone(), media.clone(), requires_ack),
            timeout,
        )
        .map_err(fleet_error)?;
    Ok(sse_events(events))
}

#[derive(Debug, Deserialize)]
pub struct DeviceListQuery {
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeviceListing {
    pub kind: String,
    pub devices: Vec<SessionSnapshot>,
}

pub async fn list_devices(
    State(state): State<HubState>,
    Query(query): Query<DeviceListQuery>,
) -> Result<Json<DeviceListing>, ApiError> {
    let kind = query.kind.as_deref().unwrap_or("commands");
    let devices = match kind {
        "commands" => state.commands.registry().snapshot(),
        "content" => state.content.registry().snapshot(),
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown stream kind: {other}"
            )))
        }
    };
    Ok(Json(DeviceListing {
        kind: kind.to_string(),
        devices,
    }))
}

fn fleet_error(err: DispatchError) -> ApiError {
    match err {
        DispatchError::FleetNotFound(_) => ApiError::NotFound("fleet not found"),
    }
}

fn sse_events<A>(
    events: mpsc::Receiver<DispatchEvent<A>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    A: Acknowledgement + Serialize,
{
    let stream = ReceiverStream::new(events).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".into());
        Ok(Event::default().event(event.name()).data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
