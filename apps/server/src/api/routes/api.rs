//! Occupancy API routes, nested under `/api`

use crate::api::handlers::{occupancy, reads};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/admit", post(occupancy::admit))
        .route("/transfer", post(occupancy::transfer))
        .route("/discharge", post(occupancy::discharge))
        .route("/stock-adjust", post(occupancy::stock_adjust))
        .route("/wards", get(reads::list_wards))
        .route("/wards/:id", get(reads::get_ward))
        .route("/wards/:id/occupancy", get(reads::ward_occupancy))
        .route("/wards/:id/availability", get(reads::ward_availability))
        .route("/wards/:id/beds", get(reads::ward_beds))
        .route("/wards/:id/capacity-ledger", get(reads::ward_capacity_ledger))
        .route("/beds/:id", get(reads::get_bed))
        .route("/beds/:id/history", get(reads::bed_history))
        .route("/encounters/:id", get(reads::get_encounter))
        .route("/encounters/:id/timeline", get(reads::encounter_timeline))
        .route("/patients/:id/encounter", get(reads::patient_encounter))
        .route("/stock", get(reads::list_stock_items))
        .route("/stock/:id", get(reads::get_stock_item))
        .route("/stock/:id/ledger", get(reads::stock_ledger))
}
