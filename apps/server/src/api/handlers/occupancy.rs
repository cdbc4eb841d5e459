//! Occupancy and stock mutations
//!
//! Each handler resolves the actor, hands the validated body to one service operation and maps
//! the outcome to JSON. Every failure is a [`crate::Error`] and renders through its `IntoResponse`.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::{
    api::extractors::{Actor, ValidatedJson},
    services::{AdmitRequest, DischargeRequest, StockAdjustment, TransferRequest},
    state::AppState,
    Result,
};

/// POST /api/admit
pub async fn admit(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    ValidatedJson(request): ValidatedJson<AdmitRequest>,
) -> Result<impl IntoResponse> {
    let admission = state.encounters.admit(request, &ctx).await?;
    Ok((StatusCode::CREATED, Json(admission)))
}

/// POST /api/transfer
pub async fn transfer(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    ValidatedJson(request): ValidatedJson<TransferRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.encounters.transfer(request, &ctx).await?))
}

/// POST /api/discharge
pub async fn discharge(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    ValidatedJson(request): ValidatedJson<DischargeRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.encounters.discharge(request, &ctx).await?))
}

/// POST /api/stock-adjust
pub async fn stock_adjust(
    State(state): State<AppState>,
    Actor(ctx): Actor,
    ValidatedJson(request): ValidatedJson<StockAdjustment>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.stock.adjust(request, &ctx).await?))
}
