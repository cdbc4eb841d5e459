//! PostgreSQL unit of work
//!
//! The scope is locked up front: `SELECT ... FOR UPDATE` on ward, bed and stock rows (sorted by
//! id) and transaction-scoped advisory locks for patients, in the global lock order. Lock waits
//! are bounded by `SET LOCAL lock_timeout`.

use async_trait::async_trait;
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

use super::{
    store::{
        bed_from_row, encounter_from_row, map_db_error, stock_item_from_row, to_i32,
        ward_from_row, BED_COLUMNS, ENCOUNTER_COLUMNS, STOCK_ITEM_COLUMNS, WARD_COLUMNS,
    },
    traits::{LockScope, OccupancyTx, ResourceKey},
};
use crate::{
    models::{
        Bed, BedEvent, BedId, Encounter, EncounterId, LedgerEntry, LedgerSubject, PatientId,
        StockItem, StockItemId, Ward, WardId,
    },
    Error, Result,
};

pub struct PostgresOccupancyTx {
    tx: Option<Transaction<'static, Postgres>>,
    scope: LockScope,
}

impl PostgresOccupancyTx {
    pub fn new(tx: Transaction<'static, Postgres>, scope: LockScope) -> Self {
        Self {
            tx: Some(tx),
            scope,
        }
    }

    fn tx_mut(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| Error::Internal("Transaction already completed".to_string()))
    }

    /// Take every lock of the scope, waiting at most `timeout` per lock.
    pub(crate) async fn acquire_scope(&mut self, timeout: Duration) -> Result<()> {
        let wards: Vec<Uuid> = self.scope.wards().iter().map(|id| id.0).collect();
        let beds: Vec<Uuid> = self.scope.beds().iter().map(|id| id.0).collect();
        let patients = self.scope.patients();
        let items: Vec<Uuid> = self.scope.stock_items().iter().map(|id| id.0).collect();
        let tx = self.tx_mut()?;

        // SET does not take bind parameters
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            timeout.as_millis().max(1)
        ))
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?;

        if !wards.is_empty() {
            sqlx::query("SELECT id FROM wards WHERE id = ANY($1) ORDER BY id FOR UPDATE")
                .bind(wards)
                .fetch_all(&mut **tx)
                .await
                .map_err(map_db_error)?;
        }
        if !beds.is_empty() {
            sqlx::query("SELECT id FROM beds WHERE id = ANY($1) ORDER BY id FOR UPDATE")
                .bind(beds)
                .fetch_all(&mut **tx)
                .await
                .map_err(map_db_error)?;
        }
        for patient in &patients {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(patient.as_str())
                .execute(&mut **tx)
                .await
                .map_err(map_db_error)?;
        }
        if !items.is_empty() {
            sqlx::query("SELECT id FROM stock_items WHERE id = ANY($1) ORDER BY id FOR UPDATE")
                .bind(items)
                .fetch_all(&mut **tx)
                .await
                .map_err(map_db_error)?;
        }
        Ok(())
    }
}

#[async_trait]
impl OccupancyTx for PostgresOccupancyTx {
    fn scope(&self) -> &LockScope {
        &self.scope
    }

    async fn ward(&mut self, id: WardId) -> Result<Ward> {
        let tx = self.tx_mut()?;
        let row = sqlx::query(&format!("SELECT {WARD_COLUMNS} FROM wards WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_db_error)?
            .ok_or_else(|| Error::not_found("Ward", id))?;
        ward_from_row(&row)
    }

    async fn bed(&mut self, id: BedId) -> Result<Bed> {
        let tx = self.tx_mut()?;
        let row = sqlx::query(&format!("SELECT {BED_COLUMNS} FROM beds WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_db_error)?
            .ok_or_else(|| Error::not_found("Bed", id))?;
        bed_from_row(&row)
    }

    async fn beds_in_ward(&mut self, ward_id: WardId) -> Result<Vec<Bed>> {
        self.scope.require(ResourceKey::Ward(ward_id))?;
        let tx = self.tx_mut()?;
        let rows = sqlx::query(&format!(
            "SELECT {BED_COLUMNS} FROM beds WHERE ward_id = $1 ORDER BY number"
        ))
        .bind(ward_id.0)
        .fetch_all(&mut **tx)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(bed_from_row).collect()
    }

    async fn count_available(&mut self, ward_id: WardId) -> Result<u32> {
        self.scope.require(ResourceKey::Ward(ward_id))?;
        let tx = self.tx_mut()?;
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS available FROM beds WHERE ward_id = $1 AND status = 'available'",
        )
        .bind(ward_id.0)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_db_error)?
        .try_get("available")?;
        u32::try_from(count)
            .map_err(|_| Error::InvariantBreach(format!("bed count {count} out of range")))
    }

    async fn encounter(&mut self, id: EncounterId) -> Result<Encounter> {
        let tx = self.tx_mut()?;
        let row = sqlx::query(&format!(
            "SELECT {ENCOUNTER_COLUMNS} FROM encounters WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| Error::not_found("Encounter", id))?;
        encounter_from_row(&row)
    }

    async fn active_encounter_for_patient(
        &mut self,
        patient_id: &PatientId,
    ) -> Result<Option<Encounter>> {
        let tx = self.tx_mut()?;
        let row = sqlx::query(&format!(
            "SELECT {ENCOUNTER_COLUMNS} FROM encounters
             WHERE patient_id = $1 AND status = 'admitted'"
        ))
        .bind(patient_id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(encounter_from_row).transpose()
    }

    async fn stock_item(&mut self, id: StockItemId) -> Result<StockItem> {
        let tx = self.tx_mut()?;
        let row = sqlx::query(&format!(
            "SELECT {STOCK_ITEM_COLUMNS} FROM stock_items WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| Error::not_found("StockItem", id))?;
        stock_item_from_row(&row)
    }

    async fn last_ledger_balance(&mut self, subject: LedgerSubject) -> Result<Option<i64>> {
        let tx = self.tx_mut()?;
        let row = sqlx::query(
            "SELECT balance_after FROM ledger_entries
             WHERE subject_kind = $1 AND subject_id = $2
             ORDER BY seq DESC
             LIMIT 1",
        )
        .bind(subject.kind())
        .bind(subject.id())
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_db_error)?;
        match row {
            Some(row) => Ok(Some(row.try_get("balance_after")?)),
            None => Ok(None),
        }
    }

    async fn insert_ward(&mut self, ward: &Ward) -> Result<()> {
        self.scope.require(ResourceKey::Ward(ward.id))?;
        let tx = self.tx_mut()?;
        sqlx::query(
            "INSERT INTO wards
                (id, code, name, department, total_beds, available_beds, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(ward.id.0)
        .bind(&ward.code)
        .bind(&ward.name)
        .bind(&ward.department)
        .bind(to_i32(ward.total_beds, "total_beds")?)
        .bind(to_i32(ward.available_beds, "available_beds")?)
        .bind(ward.status.as_str())
        .bind(ward.created_at)
        .bind(ward.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn update_ward(&mut self, ward: &Ward) -> Result<()> {
        self.scope.require(ResourceKey::Ward(ward.id))?;
        let tx = self.tx_mut()?;
        let updated = sqlx::query(
            "UPDATE wards
             SET name = $2, department = $3, total_beds = $4, available_beds = $5,
                 status = $6, updated_at = $7
             WHERE id = $1",
        )
        .bind(ward.id.0)
        .bind(&ward.name)
        .bind(&ward.department)
        .bind(to_i32(ward.total_beds, "total_beds")?)
        .bind(to_i32(ward.available_beds, "available_beds")?)
        .bind(ward.status.as_str())
        .bind(ward.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?
        .rows_affected();

        if updated == 0 {
            return Err(Error::not_found("Ward", ward.id));
        }
        Ok(())
    }

    async fn insert_bed(&mut self, bed: &Bed) -> Result<()> {
        self.scope.require(ResourceKey::Bed(bed.id))?;
        let tx = self.tx_mut()?;
        sqlx::query(
            "INSERT INTO beds
                (id, ward_id, number, code, status, current_patient_id, reserved_for,
                 occupied_at, expected_vacancy_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(bed.id.0)
        .bind(bed.ward_id.0)
        .bind(to_i32(bed.number, "number")?)
        .bind(&bed.code)
        .bind(bed.status.as_str())
        .bind(bed.current_patient_id.as_ref().map(|p| p.as_str()))
        .bind(bed.reserved_for.as_ref().map(|p| p.as_str()))
        .bind(bed.occupied_at)
        .bind(bed.expected_vacancy_at)
        .bind(bed.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn update_bed(&mut self, bed: &Bed) -> Result<()> {
        self.scope.require(ResourceKey::Bed(bed.id))?;
        let tx = self.tx_mut()?;
        // The ward is part of the match: a bed never changes ward.
        let updated = sqlx::query(
            "UPDATE beds
             SET status = $3, current_patient_id = $4, reserved_for = $5,
                 occupied_at = $6, expected_vacancy_at = $7, updated_at = $8
             WHERE id = $1 AND ward_id = $2",
        )
        .bind(bed.id.0)
        .bind(bed.ward_id.0)
        .bind(bed.status.as_str())
        .bind(bed.current_patient_id.as_ref().map(|p| p.as_str()))
        .bind(bed.reserved_for.as_ref().map(|p| p.as_str()))
        .bind(bed.occupied_at)
        .bind(bed.expected_vacancy_at)
        .bind(bed.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?
        .rows_affected();

        if updated == 0 {
            return Err(Error::InvariantBreach(format!(
                "bed {} is missing or not in ward {}",
                bed.id, bed.ward_id
            )));
        }
        Ok(())
    }

    async fn delete_bed(&mut self, id: BedId) -> Result<()> {
        self.scope.require(ResourceKey::Bed(id))?;
        let tx = self.tx_mut()?;
        let deleted = sqlx::query("DELETE FROM beds WHERE id = $1")
            .bind(id.0)
            .execute(&mut **tx)
            .await
            .map_err(map_db_error)?
            .rows_affected();
        if deleted == 0 {
            return Err(Error::not_found("Bed", id));
        }
        Ok(())
    }

    async fn append_bed_event(&mut self, event: &BedEvent) -> Result<()> {
        self.scope.require(ResourceKey::Bed(event.bed_id))?;
        let tx = self.tx_mut()?;
        sqlx::query(
            "INSERT INTO bed_events
                (id, bed_id, ward_id, kind, from_status, to_status, patient_id, encounter_id, actor, at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(event.id.0)
        .bind(event.bed_id.0)
        .bind(event.ward_id.0)
        .bind(event.kind.as_str())
        .bind(event.from_status.as_str())
        .bind(event.to_status.as_str())
        .bind(event.patient_id.as_ref().map(|p| p.as_str()))
        .bind(event.encounter_id.map(|e| e.0))
        .bind(event.actor.as_str())
        .bind(event.at)
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn insert_encounter(&mut self, encounter: &Encounter) -> Result<()> {
        self.scope
            .require(ResourceKey::Patient(encounter.patient_id.clone()))?;
        if encounter.is_active() {
            if let Some(existing) = self
                .active_encounter_for_patient(&encounter.patient_id)
                .await?
            {
                return Err(Error::PatientAlreadyAdmitted {
                    patient_id: encounter.patient_id.clone(),
                    encounter_id: existing.id,
                });
            }
        }
        let tx = self.tx_mut()?;
        sqlx::query(
            "INSERT INTO encounters
                (id, patient_id, ward_id, bed_id, status, admitted_at, admitted_by,
                 discharged_at, discharged_by, discharge_summary, transfer_count, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(encounter.id.0)
        .bind(encounter.patient_id.as_str())
        .bind(encounter.ward_id.0)
        .bind(encounter.bed_id.0)
        .bind(encounter.status.as_str())
        .bind(encounter.admitted_at)
        .bind(encounter.admitted_by.as_str())
        .bind(encounter.discharged_at)
        .bind(encounter.discharged_by.as_ref().map(|a| a.as_str()))
        .bind(&encounter.discharge_summary)
        .bind(to_i32(encounter.transfer_count, "transfer_count")?)
        .bind(encounter.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn update_encounter(&mut self, encounter: &Encounter) -> Result<()> {
        self.scope
            .require(ResourceKey::Patient(encounter.patient_id.clone()))?;
        let tx = self.tx_mut()?;
        let updated = sqlx::query(
            "UPDATE encounters
             SET ward_id = $2, bed_id = $3, status = $4, discharged_at = $5, discharged_by = $6,
                 discharge_summary = $7, transfer_count = $8, updated_at = $9
             WHERE id = $1",
        )
        .bind(encounter.id.0)
        .bind(encounter.ward_id.0)
        .bind(encounter.bed_id.0)
        .bind(encounter.status.as_str())
        .bind(encounter.discharged_at)
        .bind(encounter.discharged_by.as_ref().map(|a| a.as_str()))
        .bind(&encounter.discharge_summary)
        .bind(to_i32(encounter.transfer_count, "transfer_count")?)
        .bind(encounter.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?
        .rows_affected();

        if updated == 0 {
            return Err(Error::not_found("Encounter", encounter.id));
        }
        Ok(())
    }

    async fn insert_stock_item(&mut self, item: &StockItem) -> Result<()> {
        self.scope.require(ResourceKey::StockItem(item.id))?;
        let tx = self.tx_mut()?;
        sqlx::query(
            "INSERT INTO stock_items
                (id, code, name, unit, current_stock, minimum_stock, maximum_stock, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(item.id.0)
        .bind(&item.code)
        .bind(&item.name)
        .bind(&item.unit)
        .bind(item.current_stock)
        .bind(item.minimum_stock)
        .bind(item.maximum_stock)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn update_stock_item(&mut self, item: &StockItem) -> Result<()> {
        self.scope.require(ResourceKey::StockItem(item.id))?;
        let tx = self.tx_mut()?;
        let updated = sqlx::query(
            "UPDATE stock_items
             SET name = $2, unit = $3, current_stock = $4, minimum_stock = $5,
                 maximum_stock = $6, updated_at = $7
             WHERE id = $1",
        )
        .bind(item.id.0)
        .bind(&item.name)
        .bind(&item.unit)
        .bind(item.current_stock)
        .bind(item.minimum_stock)
        .bind(item.maximum_stock)
        .bind(item.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?
        .rows_affected();

        if updated == 0 {
            return Err(Error::not_found("StockItem", item.id));
        }
        Ok(())
    }

    async fn append_ledger_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        let key = match entry.subject {
            LedgerSubject::StockItem(id) => ResourceKey::StockItem(id),
            LedgerSubject::WardCapacity(id) => ResourceKey::Ward(id),
        };
        self.scope.require(key)?;
        let tx = self.tx_mut()?;
        sqlx::query(
            "INSERT INTO ledger_entries
                (id, subject_kind, subject_id, delta, reason, actor, balance_after, at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.id.0)
        .bind(entry.subject.kind())
        .bind(entry.subject.id())
        .bind(entry.delta)
        .bind(&entry.reason)
        .bind(entry.actor.as_str())
        .bind(entry.balance_after)
        .bind(entry.at)
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        let tx = this
            .tx
            .take()
            .ok_or_else(|| Error::Internal("Transaction already completed".to_string()))?;
        tx.commit().await.map_err(map_db_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        let tx = this
            .tx
            .take()
            .ok_or_else(|| Error::Internal("Transaction already completed".to_string()))?;
        tx.rollback().await.map_err(map_db_error)
    }
}
