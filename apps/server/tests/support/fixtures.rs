use axum::http::StatusCode;
use serde_json::{json, Value};

use super::{assert_status, str_field, TestApp};

/// A ward and its bed ids in bed-number order
pub struct WardFixture {
    pub id: String,
    pub beds: Vec<String>,
}

pub async fn create_ward(app: &TestApp, code: &str, total_beds: u32) -> anyhow::Result<WardFixture> {
    let (status, ward) = app
        .post(
            "/admin/wards",
            &json!({ "code": code, "name": format!("{code} ward"), "total_beds": total_beds }),
        )
        .await?;
    assert_status(status, StatusCode::CREATED, "create ward");
    let id = str_field(&ward, "id").to_string();

    let beds = app.get(&format!("/api/wards/{id}/beds")).await?;
    let mut beds: Vec<(u64, String)> = beds
        .as_array()
        .expect("bed list")
        .iter()
        .map(|b| (b["number"].as_u64().unwrap_or(0), str_field(b, "id").to_string()))
        .collect();
    beds.sort();

    Ok(WardFixture {
        id,
        beds: beds.into_iter().map(|(_, id)| id).collect(),
    })
}

pub async fn admit(
    app: &TestApp,
    patient: &str,
    ward: &WardFixture,
    bed: usize,
) -> anyhow::Result<(StatusCode, Value)> {
    app.post(
        "/api/admit",
        &json!({ "patient_id": patient, "ward_id": ward.id, "bed_id": ward.beds[bed] }),
    )
    .await
}

pub async fn available_beds(app: &TestApp, ward: &WardFixture) -> anyhow::Result<u64> {
    let ward = app.get(&format!("/api/wards/{}", ward.id)).await?;
    Ok(ward["available_beds"].as_u64().expect("available_beds"))
}

pub async fn create_stock_item(
    app: &TestApp,
    code: &str,
    opening: i64,
    minimum: i64,
    maximum: Option<i64>,
) -> anyhow::Result<String> {
    let (status, item) = app
        .post(
            "/admin/stock",
            &json!({
                "code": code,
                "name": format!("{code} tablets"),
                "unit": "tablet",
                "opening_stock": opening,
                "minimum_stock": minimum,
                "maximum_stock": maximum,
            }),
        )
        .await?;
    assert_status(status, StatusCode::CREATED, "create stock item");
    Ok(str_field(&item, "id").to_string())
}
