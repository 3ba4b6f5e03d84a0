//! Analytics ingress: the unary batch RPC plus read-side summaries.

use axum::extract::{Path, State};
use axum::Json;

use marquee_proto::{BatchAck, EventBatch};

use crate::analytics::{DeviceSummary, StoredEvent};
use crate::state::HubState;

use super::ApiError;

pub async fn ingest_batch(
    State(state): State<HubState>,
    Json(batch): Json<EventBatch>,
) -> Json<BatchAck> {
    Json(state.analytics.ingest(batch))
}

pub async fn list_devices(State(state): State<HubState>) -> Json<Vec<DeviceSummary>> {
    Json(state.analytics.device_summaries())
}

pub async fn device_events(
    State(state): State<HubState>,
    Path(fingerprint): Path<u32>,
) -> Result<Json<Vec<StoredEvent>>, ApiError> {
    state
        .analytics
        .events_for(fingerprint)
        .map(Json)
        .ok_or(ApiError::NotFound("unknown device fingerprint"))
}
