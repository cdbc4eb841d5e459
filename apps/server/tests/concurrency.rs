//! Contention behaviour: racing admissions, crossing transfers, lock timeouts and parallel
//! stock adjustments.

#[allow(unused)]
mod support;

use axum::http::{header, Method, StatusCode};
use futures::future::join_all;
use std::time::Duration;
use support::{assert_error_code, assert_status, available_beds, create_ward, TestApp};
use wardline::{
    db::{LockScope, OccupancyStore as _, OccupancyTx as _},
    models::{BedId, OperationContext, StockItemId, WardId},
    services::{AdmitRequest, StockAdjustment, TransferRequest},
    Error,
};

fn ctx() -> OperationContext {
    OperationContext::new("bed-manager")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_admissions_fill_a_bed_once() -> anyhow::Result<()> {
    let app = TestApp::new();
    let ward = create_ward(&app, "ICU", 1).await?;
    let ward_id: WardId = ward.id.parse()?;
    let bed_id: BedId = ward.beds[0].parse()?;

    let tasks = (0..8).map(|i| {
        let encounters = app.state.encounters.clone();
        tokio::spawn(async move {
            encounters
                .admit(
                    AdmitRequest {
                        patient_id: format!("P{i}"),
                        ward_id,
                        bed_id,
                    },
                    &ctx(),
                )
                .await
        })
    });
    let results: Vec<_> = join_all(tasks).await.into_iter().collect::<Result<_, _>>()?;

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 1, "exactly one admission wins");
    for result in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(
            matches!(result, Error::BedUnavailable { .. }),
            "unexpected error: {result}"
        );
    }
    assert_eq!(available_beds(&app, &ward).await?, 0);

    let report = app.state.consistency.check().await?;
    assert!(report.is_consistent(), "{:?}", report.breaches);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crossing_transfers_do_not_deadlock() -> anyhow::Result<()> {
    let app = TestApp::new();
    let east = create_ward(&app, "EAST", 2).await?;
    let west = create_ward(&app, "WEST", 2).await?;
    support::admit(&app, "P1", &east, 0).await?;
    support::admit(&app, "P2", &west, 0).await?;

    let east_beds: Vec<BedId> = east.beds.iter().map(|b| b.parse()).collect::<Result<_, _>>()?;
    let west_beds: Vec<BedId> = west.beds.iter().map(|b| b.parse()).collect::<Result<_, _>>()?;

    for round in 0..20 {
        // P1 and P2 swap wards each round, locking the same two wards from opposite ends
        let (p1_from, p1_to, p2_from, p2_to) = if round % 2 == 0 {
            (east_beds[0], west_beds[1], west_beds[0], east_beds[1])
        } else {
            (west_beds[1], east_beds[0], east_beds[1], west_beds[0])
        };

        let first = app.state.encounters.clone();
        let second = app.state.encounters.clone();
        let moves = async {
            tokio::join!(
                tokio::spawn(async move {
                    first
                        .transfer(
                            TransferRequest {
                                from_bed_id: p1_from,
                                to_bed_id: p1_to,
                            },
                            &ctx(),
                        )
                        .await
                }),
                tokio::spawn(async move {
                    second
                        .transfer(
                            TransferRequest {
                                from_bed_id: p2_from,
                                to_bed_id: p2_to,
                            },
                            &ctx(),
                        )
                        .await
                }),
            )
        };

        let (a, b) = tokio::time::timeout(Duration::from_secs(5), moves)
            .await
            .map_err(|_| anyhow::anyhow!("transfers stalled in round {round}"))?;
        a??;
        b??;
    }

    assert_eq!(available_beds(&app, &east).await?, 1);
    assert_eq!(available_beds(&app, &west).await?, 1);
    let report = app.state.consistency.check().await?;
    assert!(report.is_consistent(), "{:?}", report.breaches);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn swapping_two_occupied_beds_fails_cleanly() -> anyhow::Result<()> {
    let app = TestApp::new();
    let ward = create_ward(&app, "ICU", 2).await?;
    support::admit(&app, "P1", &ward, 0).await?;
    support::admit(&app, "P2", &ward, 1).await?;
    let a: BedId = ward.beds[0].parse()?;
    let b: BedId = ward.beds[1].parse()?;

    let forward = app.state.encounters.clone();
    let backward = app.state.encounters.clone();
    let (x, y) = tokio::time::timeout(
        Duration::from_secs(5),
        async {
            tokio::join!(
                tokio::spawn(async move {
                    forward
                        .transfer(TransferRequest { from_bed_id: a, to_bed_id: b }, &ctx())
                        .await
                }),
                tokio::spawn(async move {
                    backward
                        .transfer(TransferRequest { from_bed_id: b, to_bed_id: a }, &ctx())
                        .await
                }),
            )
        },
    )
    .await?;

    for result in [x?, y?] {
        assert!(matches!(result, Err(Error::DestinationUnavailable { .. })));
    }
    let bed = app.get(&format!("/api/beds/{a}")).await?;
    assert_eq!(bed["current_patient_id"], "P1");
    Ok(())
}

#[tokio::test]
async fn held_locks_surface_as_resource_busy() -> anyhow::Result<()> {
    let app = TestApp::new_with_config(|config| {
        config.occupancy.lock_timeout_ms = 50;
        config.occupancy.max_lock_attempts = 1;
    });
    let ward = create_ward(&app, "ICU", 1).await?;
    let ward_id: WardId = ward.id.parse()?;

    let held = app
        .state
        .store
        .begin(LockScope::new().ward(ward_id), Duration::from_secs(1))
        .await?;

    let (status, headers, body) = app
        .request(
            Method::POST,
            "/api/admit",
            Some(serde_json::json!({
                "patient_id": "P1",
                "ward_id": ward.id,
                "bed_id": ward.beds[0],
            })),
        )
        .await?;
    assert_status(status, StatusCode::SERVICE_UNAVAILABLE, "admit while ward is held");
    assert_error_code(&body, "RESOURCE_BUSY");
    assert_eq!(body["error"]["retryable"], true);
    assert!(headers.contains_key(header::RETRY_AFTER));

    held.rollback().await?;

    let (status, _) = support::admit(&app, "P1", &ward, 0).await?;
    assert_status(status, StatusCode::CREATED, "admit after release");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_dispensing_never_overdraws() -> anyhow::Result<()> {
    let app = TestApp::new();
    let item = support::create_stock_item(&app, "ONDAN4", 20, 2, None).await?;
    let item_id: StockItemId = item.parse()?;

    let tasks = (0..30).map(|i| {
        let stock = app.state.stock.clone();
        tokio::spawn(async move {
            stock
                .adjust(
                    StockAdjustment {
                        item_id,
                        adjustment: -1,
                        reason: format!("dose {i}"),
                    },
                    &ctx(),
                )
                .await
        })
    });
    let results: Vec<_> = join_all(tasks).await.into_iter().collect::<Result<_, _>>()?;

    let applied = results.iter().filter(|r| r.is_ok()).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(Error::WouldGoNegative { .. })))
        .count();
    assert_eq!(applied, 20);
    assert_eq!(refused, 10);

    let verification = app.state.stock.verify(item_id).await?;
    assert_eq!(verification.balance, 0);
    assert_eq!(verification.entries, 21);

    let (status, _, _) = app
        .request(Method::GET, &format!("/api/stock/{item}"), None)
        .await?;
    assert_status(status, StatusCode::OK, "read item");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn aborted_admission_leaves_no_trace() -> anyhow::Result<()> {
    let app = TestApp::new();
    let ward = create_ward(&app, "ICU", 1).await?;
    let ward_id: WardId = ward.id.parse()?;
    let bed_id: BedId = ward.beds[0].parse()?;

    let held = app
        .state
        .store
        .begin(LockScope::new().ward(ward_id), Duration::from_secs(1))
        .await?;
    let encounters = app.state.encounters.clone();
    let pending = tokio::spawn(async move {
        encounters
            .admit(
                AdmitRequest {
                    patient_id: "P1".to_string(),
                    ward_id,
                    bed_id,
                },
                &ctx(),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    pending.abort();
    assert!(pending.await.is_err_and(|e| e.is_cancelled()));
    held.rollback().await?;

    assert_eq!(available_beds(&app, &ward).await?, 1);
    let (status, _, body) = app
        .request(Method::GET, "/api/patients/P1/encounter", None)
        .await?;
    assert_status(status, StatusCode::NOT_FOUND, "no encounter after abort");
    assert_error_code(&body, "NOT_FOUND");
    let history = app.get(&format!("/api/beds/{bed_id}/history")).await?;
    assert_eq!(history.as_array().map(Vec::len), Some(0));

    let (status, _) = support::admit(&app, "P1", &ward, 0).await?;
    assert_status(status, StatusCode::CREATED, "admit after abort");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consistency_check_runs_alongside_transfers() -> anyhow::Result<()> {
    let app = TestApp::new();
    let ward = create_ward(&app, "MED", 4).await?;
    support::admit(&app, "P1", &ward, 0).await?;
    support::admit(&app, "P2", &ward, 2).await?;
    let beds: Vec<BedId> = ward.beds.iter().map(|b| b.parse()).collect::<Result<_, _>>()?;

    let encounters = app.state.encounters.clone();
    let shuttle = tokio::spawn(async move {
        for round in 0..40 {
            let (offset_from, offset_to) = if round % 2 == 0 { (0, 1) } else { (1, 0) };
            for pair in [0, 2] {
                encounters
                    .transfer(
                        TransferRequest {
                            from_bed_id: beds[pair + offset_from],
                            to_bed_id: beds[pair + offset_to],
                        },
                        &ctx(),
                    )
                    .await?;
            }
        }
        Ok::<_, Error>(())
    });

    let consistency = app.state.consistency.clone();
    let checks = tokio::spawn(async move {
        let mut breaches = Vec::new();
        for _ in 0..20 {
            breaches.extend(consistency.check().await?.breaches);
            tokio::task::yield_now().await;
        }
        Ok::<_, Error>(breaches)
    });

    let (moved, checked) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(shuttle, checks)
    })
    .await?;
    moved??;
    let breaches = checked??;
    assert!(breaches.is_empty(), "{breaches:?}");
    Ok(())
}
