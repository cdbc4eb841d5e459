//! Read endpoints under `/api`

use axum::{
    extract::State,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::{
    api::extractors::ValidatedPath,
    models::{BedId, EncounterId, PatientId, StockItemId, WardId},
    state::AppState,
    Result,
};

pub async fn list_wards(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(state.wards.list().await?))
}

pub async fn get_ward(
    State(state): State<AppState>,
    ValidatedPath(ward_id): ValidatedPath<WardId>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.wards.get(ward_id).await?))
}

/// Bed counts by status, computed from the bed records rather than the stored counter
pub async fn ward_occupancy(
    State(state): State<AppState>,
    ValidatedPath(ward_id): ValidatedPath<WardId>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.wards.occupancy(ward_id).await?))
}

/// Whether the ward can take an admission right now
pub async fn ward_availability(
    State(state): State<AppState>,
    ValidatedPath(ward_id): ValidatedPath<WardId>,
) -> Result<impl IntoResponse> {
    let occupancy = state.wards.occupancy(ward_id).await?;
    Ok(Json(json!({
        "ward_id": ward_id,
        "available_beds": occupancy.available,
        "can_admit": occupancy.can_admit(),
    })))
}

pub async fn ward_beds(
    State(state): State<AppState>,
    ValidatedPath(ward_id): ValidatedPath<WardId>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.wards.beds(ward_id).await?))
}

pub async fn ward_capacity_ledger(
    State(state): State<AppState>,
    ValidatedPath(ward_id): ValidatedPath<WardId>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.wards.capacity_ledger(ward_id).await?))
}

pub async fn get_bed(
    State(state): State<AppState>,
    ValidatedPath(bed_id): ValidatedPath<BedId>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.beds.get(bed_id).await?))
}

pub async fn bed_history(
    State(state): State<AppState>,
    ValidatedPath(bed_id): ValidatedPath<BedId>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.beds.history(bed_id).await?))
}

pub async fn get_encounter(
    State(state): State<AppState>,
    ValidatedPath(encounter_id): ValidatedPath<EncounterId>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.encounters.get(encounter_id).await?))
}

pub async fn encounter_timeline(
    State(state): State<AppState>,
    ValidatedPath(encounter_id): ValidatedPath<EncounterId>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.encounters.timeline(encounter_id).await?))
}

pub async fn patient_encounter(
    State(state): State<AppState>,
    ValidatedPath(patient_id): ValidatedPath<String>,
) -> Result<impl IntoResponse> {
    let patient_id = PatientId::new(patient_id);
    Ok(Json(state.encounters.active_for_patient(&patient_id).await?))
}

pub async fn list_stock_items(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(state.stock.list().await?))
}

pub async fn get_stock_item(
    State(state): State<AppState>,
    ValidatedPath(item_id): ValidatedPath<StockItemId>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.stock.get(item_id).await?))
}

pub async fn stock_ledger(
    State(state): State<AppState>,
    ValidatedPath(item_id): ValidatedPath<StockItemId>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.stock.entries(item_id).await?))
}
