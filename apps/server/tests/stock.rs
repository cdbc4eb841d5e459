//! Medication stock ledger through the HTTP API

#[allow(unused)]
mod support;

use axum::http::StatusCode;
use serde_json::json;
use support::{assert_error_code, assert_status, create_stock_item, TestApp};

#[tokio::test]
async fn overdraw_is_rejected_and_balance_kept() -> anyhow::Result<()> {
    let app = TestApp::new();
    let item = create_stock_item(&app, "AMOX500", 10, 5, None).await?;

    let (status, body) = app
        .post(
            "/api/stock-adjust",
            &json!({ "item_id": item, "adjustment": -15, "reason": "dispensed ward 4" }),
        )
        .await?;
    assert_status(status, StatusCode::CONFLICT, "overdraw");
    assert_error_code(&body, "WOULD_GO_NEGATIVE");

    let stored = app.get(&format!("/api/stock/{item}")).await?;
    assert_eq!(stored["current_stock"], 10);
    let ledger = app.get(&format!("/api/stock/{item}/ledger")).await?;
    assert_eq!(ledger.as_array().map(Vec::len), Some(1));

    Ok(())
}

#[tokio::test]
async fn dispensing_below_minimum_is_flagged() -> anyhow::Result<()> {
    let app = TestApp::new();
    let item = create_stock_item(&app, "PARA1G", 10, 5, None).await?;

    let (status, outcome) = app
        .post(
            "/api/stock-adjust",
            &json!({ "item_id": item, "adjustment": -6, "reason": "dispensed" }),
        )
        .await?;
    assert_status(status, StatusCode::OK, "dispense");
    assert_eq!(outcome["previous_balance"], 10);
    assert_eq!(outcome["new_balance"], 4);
    assert_eq!(outcome["below_minimum"], true);
    assert_eq!(outcome["above_maximum"], false);

    let ledger = app.get(&format!("/api/stock/{item}/ledger")).await?;
    let deltas: Vec<i64> = ledger
        .as_array()
        .expect("ledger")
        .iter()
        .filter_map(|e| e["delta"].as_i64())
        .collect();
    assert_eq!(deltas, vec![10, -6]);
    assert_eq!(ledger[1]["actor"], support::ACTOR);

    let verification = app.get(&format!("/admin/stock/{item}/verify")).await?;
    assert_eq!(verification["balance"], 4);
    assert_eq!(verification["entries"], 2);

    Ok(())
}

#[tokio::test]
async fn maximum_is_advisory_by_default() -> anyhow::Result<()> {
    let app = TestApp::new();
    let item = create_stock_item(&app, "INS100", 10, 0, Some(20)).await?;

    let (status, outcome) = app
        .post(
            "/api/stock-adjust",
            &json!({ "item_id": item, "adjustment": 15, "reason": "pharmacy delivery" }),
        )
        .await?;
    assert_status(status, StatusCode::OK, "overfill");
    assert_eq!(outcome["new_balance"], 25);
    assert_eq!(outcome["above_maximum"], true);

    Ok(())
}

#[tokio::test]
async fn maximum_can_be_enforced() -> anyhow::Result<()> {
    let app = TestApp::new_with_config(|config| config.stock.enforce_max = true);
    let item = create_stock_item(&app, "INS100", 10, 0, Some(20)).await?;

    let (status, body) = app
        .post(
            "/api/stock-adjust",
            &json!({ "item_id": item, "adjustment": 15, "reason": "pharmacy delivery" }),
        )
        .await?;
    assert_status(status, StatusCode::CONFLICT, "enforced maximum");
    assert_error_code(&body, "WOULD_EXCEED_MAXIMUM");

    let stored = app.get(&format!("/api/stock/{item}")).await?;
    assert_eq!(stored["current_stock"], 10);

    Ok(())
}

#[tokio::test]
async fn adjustments_need_a_quantity_and_reason() -> anyhow::Result<()> {
    let app = TestApp::new();
    let item = create_stock_item(&app, "HEP5K", 3, 1, None).await?;

    for request in [
        json!({ "item_id": item, "adjustment": 0, "reason": "count" }),
        json!({ "item_id": item, "adjustment": -1, "reason": "" }),
    ] {
        let (status, body) = app.post("/api/stock-adjust", &request).await?;
        assert_status(status, StatusCode::BAD_REQUEST, "invalid adjustment");
        assert_error_code(&body, "VALIDATION_FAILED");
    }

    let (status, body) = app
        .post(
            "/admin/stock",
            &json!({
                "code": "BAD",
                "name": "Inverted limits",
                "unit": "vial",
                "minimum_stock": 10,
                "maximum_stock": 5,
            }),
        )
        .await?;
    assert_status(status, StatusCode::BAD_REQUEST, "max below min");
    assert_error_code(&body, "VALIDATION_FAILED");

    Ok(())
}
