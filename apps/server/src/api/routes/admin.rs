//! Administrative routes, nested under `/admin`

use crate::api::handlers::admin;
use crate::state::AppState;
use axum::{
    routing::{get, post, put},
    Router,
};

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/wards", post(admin::create_ward))
        .route("/wards/:id/capacity", put(admin::resize_ward))
        .route("/wards/:id/status", put(admin::set_ward_status))
        .route(
            "/beds/:id/maintenance",
            post(admin::start_maintenance).delete(admin::end_maintenance),
        )
        .route(
            "/beds/:id/reservation",
            post(admin::reserve_bed).delete(admin::cancel_reservation),
        )
        .route(
            "/beds/:id/expected-vacancy",
            put(admin::set_expected_vacancy),
        )
        .route("/stock", post(admin::create_stock_item))
        .route("/stock/:id/verify", get(admin::verify_stock_ledger))
        .route("/consistency", get(admin::consistency_report))
}
