//! Fleet CRUD ingress.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::fleets::{Fleet, FleetError};
use crate::state::HubState;

use super::ApiError;

#[derive(Debug, Deserialize)]
pub struct CreateFleetRequest {
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct MembersRequest {
    pub members: Vec<String>,
}

pub async fn create_fleet(
    State(state): State<HubState>,
    Json(request): Json<CreateFleetRequest>,
) -> Result<Json<Fleet>, ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("fleet name must be non-empty".into()));
    }
    Ok(Json(state.fleets.create(&request.name, request.members)))
}

pub async fn list_fleets(State(state): State<HubState>) -> Json<Vec<Fleet>> {
    Json(state.fleets.list())
}

pub async fn get_fleet(
    State(state): State<HubState>,
    Path(fleet_id): Path<String>,
) -> Result<Json<Fleet>, ApiError> {
    state
        .fleets
        .get(&fleet_id)
        .map(Json)
        .ok_or(ApiError::NotFound("fleet not found"))
}

pub async fn delete_fleet(
    State(state): State<HubState>,
    Path(fleet_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.fleets.delete(&fleet_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound("fleet not found"))
    }
}

pub async fn replace_members(
    State(state): State<HubState>,
    Path(fleet_id): Path<String>,
    Json(request): Json<MembersRequest>,
) -> Result<Json<Fleet>, ApiError> {
    state
        .fleets
        .set_members(&fleet_id, request.members)
        .map(Json)
        .map_err(fleet_error)
}

pub async fn add_members(
    State(state): State<HubState>,
    Path(fleet_id): Path<String>,
    Json(request): Json<MembersRequest>,
) -> Result<Json<Fleet>, ApiError> {
    state
        .fleets
        .add_members(&fleet_id, request.members)
        .map(Json)
        .map_err(fleet_error)
}

pub async fn remove_member(
    State(state): State<HubState>,
    Path((fleet_id, device_id)): Path<(String, String)>,
) -> Result<Json<Fleet>, ApiError> {
    state
        .fleets
        .remove_member(&fleet_id, &device_id)
        .map(Json)
        .map_err(fleet_error)
}

fn fleet_error(err: FleetError) -> ApiError {
    match err {
        FleetError::NotFound(_) => ApiError::NotFound("fleet not found"),
    }
}
