//! PostgreSQL occupancy store

use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::{
    traits::{LockScope, OccupancyStore, OccupancyTx},
    transaction::PostgresOccupancyTx,
};
use crate::{
    models::{
        ActorId, Bed, BedEvent, BedEventId, BedId, Encounter, EncounterId, LedgerEntry,
        LedgerEntryId, LedgerSubject, PatientId, StockItem, StockItemId, Ward, WardId,
    },
    Error, Result,
};

pub(crate) const WARD_COLUMNS: &str =
    "id, code, name, department, total_beds, available_beds, status, created_at, updated_at";

pub(crate) const BED_COLUMNS: &str = "id, ward_id, number, code, status, current_patient_id, \
     reserved_for, occupied_at, expected_vacancy_at, updated_at";

pub(crate) const BED_EVENT_COLUMNS: &str = "id, bed_id, ward_id, kind, from_status, to_status, \
     patient_id, encounter_id, actor, at";

pub(crate) const ENCOUNTER_COLUMNS: &str = "id, patient_id, ward_id, bed_id, status, admitted_at, \
     admitted_by, discharged_at, discharged_by, discharge_summary, transfer_count, updated_at";

pub(crate) const STOCK_ITEM_COLUMNS: &str = "id, code, name, unit, current_stock, minimum_stock, \
     maximum_stock, created_at, updated_at";

pub(crate) const LEDGER_COLUMNS: &str =
    "id, subject_kind, subject_id, delta, reason, actor, balance_after, at";

/// Map driver errors onto the domain taxonomy.
///
/// Lock timeouts, deadlocks and serialization failures are contention; unique violations are
/// conflicts. Everything else stays a database error.
pub(crate) fn map_db_error(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some("55P03") | Some("40P01") | Some("40001") => {
                return Error::ResourceBusy {
                    resource: db_err.message().to_string(),
                    waited_ms: 0,
                };
            }
            Some("23505") => return Error::Conflict(db_err.message().to_string()),
            _ => {}
        }
    }
    Error::Database(err)
}

fn to_u32(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::InvariantBreach(format!("negative value {value} in column {column}")))
}

pub(crate) fn to_i32(value: u32, column: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::Validation(format!("{column} value {value} is out of range")))
}

pub(crate) fn ward_from_row(row: &PgRow) -> Result<Ward> {
    Ok(Ward {
        id: WardId(row.try_get("id")?),
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        department: row.try_get("department")?,
        total_beds: to_u32(row.try_get("total_beds")?, "total_beds")?,
        available_beds: to_u32(row.try_get("available_beds")?, "available_beds")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn bed_from_row(row: &PgRow) -> Result<Bed> {
    Ok(Bed {
        id: BedId(row.try_get("id")?),
        ward_id: WardId(row.try_get("ward_id")?),
        number: to_u32(row.try_get("number")?, "number")?,
        code: row.try_get("code")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        current_patient_id: row
            .try_get::<Option<String>, _>("current_patient_id")?
            .map(PatientId),
        reserved_for: row.try_get::<Option<String>, _>("reserved_for")?.map(PatientId),
        occupied_at: row.try_get("occupied_at")?,
        expected_vacancy_at: row.try_get("expected_vacancy_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn bed_event_from_row(row: &PgRow) -> Result<BedEvent> {
    Ok(BedEvent {
        id: BedEventId(row.try_get("id")?),
        bed_id: BedId(row.try_get("bed_id")?),
        ward_id: WardId(row.try_get("ward_id")?),
        kind: row.try_get::<String, _>("kind")?.parse()?,
        from_status: row.try_get::<String, _>("from_status")?.parse()?,
        to_status: row.try_get::<String, _>("to_status")?.parse()?,
        patient_id: row.try_get::<Option<String>, _>("patient_id")?.map(PatientId),
        encounter_id: row
            .try_get::<Option<Uuid>, _>("encounter_id")?
            .map(EncounterId),
        actor: ActorId(row.try_get("actor")?),
        at: row.try_get("at")?,
    })
}

pub(crate) fn encounter_from_row(row: &PgRow) -> Result<Encounter> {
    Ok(Encounter {
        id: EncounterId(row.try_get("id")?),
        patient_id: PatientId(row.try_get("patient_id")?),
        ward_id: WardId(row.try_get("ward_id")?),
        bed_id: BedId(row.try_get("bed_id")?),
        status: row.try_get::<String, _>("status")?.parse()?,
        admitted_at: row.try_get("admitted_at")?,
        admitted_by: ActorId(row.try_get("admitted_by")?),
        discharged_at: row.try_get("discharged_at")?,
        discharged_by: row.try_get::<Option<String>, _>("discharged_by")?.map(ActorId),
        discharge_summary: row.try_get("discharge_summary")?,
        transfer_count: to_u32(row.try_get("transfer_count")?, "transfer_count")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn stock_item_from_row(row: &PgRow) -> Result<StockItem> {
    Ok(StockItem {
        id: StockItemId(row.try_get("id")?),
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        unit: row.try_get("unit")?,
        current_stock: row.try_get("current_stock")?,
        minimum_stock: row.try_get("minimum_stock")?,
        maximum_stock: row.try_get("maximum_stock")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn ledger_entry_from_row(row: &PgRow) -> Result<LedgerEntry> {
    let kind: String = row.try_get("subject_kind")?;
    Ok(LedgerEntry {
        id: LedgerEntryId(row.try_get("id")?),
        subject: LedgerSubject::from_parts(&kind, row.try_get("subject_id")?)?,
        delta: row.try_get("delta")?,
        reason: row.try_get("reason")?,
        actor: ActorId(row.try_get("actor")?),
        balance_after: row.try_get("balance_after")?,
        at: row.try_get("at")?,
    })
}

/// PostgreSQL-backed occupancy store
#[derive(Clone)]
pub struct PostgresOccupancyStore {
    pool: PgPool,
}

impl PostgresOccupancyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("Failed to run migrations: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl OccupancyStore for PostgresOccupancyStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self, scope: LockScope, timeout: Duration) -> Result<Box<dyn OccupancyTx>> {
        let started = Instant::now();
        let tx = self.pool.begin().await.map_err(map_db_error)?;
        let mut unit = PostgresOccupancyTx::new(tx, scope);

        match unit.acquire_scope(timeout).await {
            Ok(()) => {
                crate::metrics::LOCK_WAIT_SECONDS
                    .with_label_values(&["postgres"])
                    .observe(started.elapsed().as_secs_f64());
                Ok(Box::new(unit))
            }
            Err(Error::ResourceBusy { resource, .. }) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                crate::metrics::LOCK_TIMEOUTS_TOTAL
                    .with_label_values(&["postgres"])
                    .inc();
                tracing::debug!(%resource, waited_ms, "Lock acquisition timed out");
                Err(Error::ResourceBusy {
                    resource,
                    waited_ms,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn get_ward(&self, id: WardId) -> Result<Option<Ward>> {
        let row = sqlx::query(&format!("SELECT {WARD_COLUMNS} FROM wards WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        row.as_ref().map(ward_from_row).transpose()
    }

    async fn list_wards(&self) -> Result<Vec<Ward>> {
        let rows = sqlx::query(&format!("SELECT {WARD_COLUMNS} FROM wards ORDER BY code"))
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        rows.iter().map(ward_from_row).collect()
    }

    async fn get_bed(&self, id: BedId) -> Result<Option<Bed>> {
        let row = sqlx::query(&format!("SELECT {BED_COLUMNS} FROM beds WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        row.as_ref().map(bed_from_row).transpose()
    }

    async fn list_beds(&self, ward_id: WardId) -> Result<Vec<Bed>> {
        let rows = sqlx::query(&format!(
            "SELECT {BED_COLUMNS} FROM beds WHERE ward_id = $1 ORDER BY number"
        ))
        .bind(ward_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(bed_from_row).collect()
    }

    async fn bed_history(&self, bed_id: BedId) -> Result<Vec<BedEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {BED_EVENT_COLUMNS} FROM bed_events WHERE bed_id = $1 ORDER BY seq"
        ))
        .bind(bed_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(bed_event_from_row).collect()
    }

    async fn get_encounter(&self, id: EncounterId) -> Result<Option<Encounter>> {
        let row = sqlx::query(&format!(
            "SELECT {ENCOUNTER_COLUMNS} FROM encounters WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(encounter_from_row).transpose()
    }

    async fn active_encounter_for_patient(
        &self,
        patient_id: &PatientId,
    ) -> Result<Option<Encounter>> {
        let row = sqlx::query(&format!(
            "SELECT {ENCOUNTER_COLUMNS} FROM encounters
             WHERE patient_id = $1 AND status = 'admitted'"
        ))
        .bind(patient_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(encounter_from_row).transpose()
    }

    async fn list_active_encounters(&self) -> Result<Vec<Encounter>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENCOUNTER_COLUMNS} FROM encounters
             WHERE status = 'admitted'
             ORDER BY admitted_at"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(encounter_from_row).collect()
    }

    async fn encounter_events(&self, encounter_id: EncounterId) -> Result<Vec<BedEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {BED_EVENT_COLUMNS} FROM bed_events WHERE encounter_id = $1 ORDER BY seq"
        ))
        .bind(encounter_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(bed_event_from_row).collect()
    }

    async fn get_stock_item(&self, id: StockItemId) -> Result<Option<StockItem>> {
        let row = sqlx::query(&format!(
            "SELECT {STOCK_ITEM_COLUMNS} FROM stock_items WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(stock_item_from_row).transpose()
    }

    async fn list_stock_items(&self) -> Result<Vec<StockItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {STOCK_ITEM_COLUMNS} FROM stock_items ORDER BY code"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(stock_item_from_row).collect()
    }

    async fn ledger_entries(&self, subject: LedgerSubject) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries
             WHERE subject_kind = $1 AND subject_id = $2
             ORDER BY seq"
        ))
        .bind(subject.kind())
        .bind(subject.id())
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(ledger_entry_from_row).collect()
    }
}
