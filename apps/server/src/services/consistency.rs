//! Read-side consistency checks over the whole occupancy state.
//!
//! Each ward is checked under its own lock, which every bed mutation in that ward also takes, so
//! a ward's beds, counter and encounters are seen at one consistent point. Stock items are
//! checked the same way under their item lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::{unit::UnitOfWork, LockSettings};
use crate::{
    db::{LockScope, OccupancyStore},
    models::{ledger, BedStatus, LedgerSubject, OperationContext, WardId},
    Error, Result,
};

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub checked_at: DateTime<Utc>,
    pub wards: usize,
    pub beds: usize,
    pub active_encounters: usize,
    pub stock_items: usize,
    pub breaches: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.breaches.is_empty()
    }

    /// Turn a report with breaches into an `InvariantBreach` error.
    pub fn into_result(self) -> Result<Self> {
        if self.breaches.is_empty() {
            Ok(self)
        } else {
            Err(Error::InvariantBreach(self.breaches.join("; ")))
        }
    }
}

#[derive(Clone)]
pub struct ConsistencyChecker {
    store: Arc<dyn OccupancyStore>,
    locks: LockSettings,
}

impl ConsistencyChecker {
    pub fn new(store: Arc<dyn OccupancyStore>, locks: LockSettings) -> Self {
        Self { store, locks }
    }

    pub async fn check(&self) -> Result<ConsistencyReport> {
        let ctx = OperationContext::system();
        let mut report = ConsistencyReport {
            checked_at: ctx.now,
            wards: 0,
            beds: 0,
            active_encounters: 0,
            stock_items: 0,
            breaches: Vec::new(),
        };

        for ward in self.store.list_wards().await? {
            self.check_ward(ward.id, &ctx, &mut report).await?;
        }
        self.check_encounter_slots(&ctx, &mut report).await?;
        for item in self.store.list_stock_items().await? {
            self.check_stock_item(item.id, &ctx, &mut report).await?;
        }

        if report.is_consistent() {
            tracing::info!(
                wards = report.wards,
                beds = report.beds,
                stock_items = report.stock_items,
                "Consistency check passed"
            );
        } else {
            for breach in &report.breaches {
                tracing::error!(breach = %breach, "Consistency invariant breached");
            }
        }
        Ok(report)
    }

    async fn check_ward(
        &self,
        ward_id: WardId,
        ctx: &OperationContext,
        report: &mut ConsistencyReport,
    ) -> Result<()> {
        let scope = LockScope::new().ward(ward_id);
        let mut unit = UnitOfWork::begin(self.store.as_ref(), scope, self.locks, ctx).await?;

        let outcome: Result<Vec<String>> = async {
            let mut breaches = Vec::new();
            let ward = unit.tx().ward(ward_id).await?;
            let beds = unit.tx().beds_in_ward(ward_id).await?;
            let available = beds.iter().filter(|b| b.is_available()).count() as u32;

            if ward.available_beds != available {
                breaches.push(format!(
                    "ward {} stores {} available beds but {} beds are available",
                    ward.code, ward.available_beds, available
                ));
            }
            if ward.total_beds as usize != beds.len() {
                breaches.push(format!(
                    "ward {} has capacity {} but {} bed records",
                    ward.code,
                    ward.total_beds,
                    beds.len()
                ));
            }

            let capacity = LedgerSubject::WardCapacity(ward_id);
            let entries = self.store.ledger_entries(capacity).await?;
            if let Err(e) = ledger::verify(capacity, &entries, i64::from(ward.total_beds)) {
                breaches.push(e.to_string());
            }

            for bed in &beds {
                if let Err(breach) = bed.check_invariants() {
                    breaches.push(breach);
                }
                if bed.status != BedStatus::Occupied {
                    continue;
                }
                let Some(patient_id) = bed.current_patient_id.as_ref() else {
                    continue;
                };
                match unit.tx().active_encounter_for_patient(patient_id).await? {
                    Some(encounter) if encounter.bed_id == bed.id => {}
                    Some(encounter) => breaches.push(format!(
                        "bed {} holds patient {} whose active encounter {} is in bed {}",
                        bed.code, patient_id, encounter.id, encounter.bed_id
                    )),
                    None => breaches.push(format!(
                        "bed {} holds patient {} without an active encounter",
                        bed.code, patient_id
                    )),
                }
            }

            report.wards += 1;
            report.beds += beds.len();
            Ok(breaches)
        }
        .await;

        let breaches = unit.finish(outcome).await?;
        report.breaches.extend(breaches);
        Ok(())
    }

    /// Every active encounter must sit in a bed occupied by its patient, and no patient may hold
    /// two active encounters.
    ///
    /// Each encounter is re-read under its patient lock. Admit, transfer and discharge all take
    /// that lock, so the encounter and the bed it points at cannot move while they are compared.
    async fn check_encounter_slots(
        &self,
        ctx: &OperationContext,
        report: &mut ConsistencyReport,
    ) -> Result<()> {
        let listed = self.store.list_active_encounters().await?;
        let mut seen = HashMap::new();

        for encounter in &listed {
            if let Some(other) = seen.insert(encounter.patient_id.clone(), encounter.id) {
                report.breaches.push(format!(
                    "patient {} holds active encounters {} and {}",
                    encounter.patient_id, other, encounter.id
                ));
            }
        }

        for patient_id in seen.keys() {
            let scope = LockScope::new().patient(patient_id);
            let mut unit = UnitOfWork::begin(self.store.as_ref(), scope, self.locks, ctx).await?;
            let outcome: Result<Option<String>> = async {
                // Discharged since the listing
                let Some(encounter) = unit.tx().active_encounter_for_patient(patient_id).await?
                else {
                    return Ok(None);
                };
                report.active_encounters += 1;
                let breach = match unit.tx().bed(encounter.bed_id).await {
                    Ok(bed) if bed.is_occupied_by(&encounter.patient_id) => None,
                    Ok(bed) => Some(format!(
                        "active encounter {} points at bed {} which is {}",
                        encounter.id, bed.code, bed.status
                    )),
                    Err(Error::NotFound { .. }) => Some(format!(
                        "active encounter {} points at missing bed {}",
                        encounter.id, encounter.bed_id
                    )),
                    Err(e) => return Err(e),
                };
                Ok(breach)
            }
            .await;

            if let Some(breach) = unit.finish(outcome).await? {
                report.breaches.push(breach);
            }
        }
        Ok(())
    }

    async fn check_stock_item(
        &self,
        item_id: crate::models::StockItemId,
        ctx: &OperationContext,
        report: &mut ConsistencyReport,
    ) -> Result<()> {
        let scope = LockScope::new().stock_item(item_id);
        let mut unit = UnitOfWork::begin(self.store.as_ref(), scope, self.locks, ctx).await?;
        let outcome = async {
            let item = unit.tx().stock_item(item_id).await?;
            let subject = LedgerSubject::StockItem(item_id);
            let entries = self.store.ledger_entries(subject).await?;
            Ok(ledger::verify(subject, &entries, item.current_stock)
                .err()
                .map(|e| e.to_string()))
        }
        .await;

        if let Some(breach) = unit.finish(outcome).await? {
            report.breaches.push(breach);
        }
        report.stock_items += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryOccupancyStore;
    use crate::services::{NewWard, WardAggregate};

    #[tokio::test]
    async fn fresh_state_is_consistent() {
        let store = Arc::new(MemoryOccupancyStore::new());
        let wards = WardAggregate::new(store.clone(), LockSettings::default());
        wards
            .create_ward(
                NewWard {
                    code: "MED".to_string(),
                    name: "General Medicine".to_string(),
                    department: None,
                    total_beds: 4,
                },
                &OperationContext::system(),
            )
            .await
            .unwrap();

        let report = ConsistencyChecker::new(store, LockSettings::default())
            .check()
            .await
            .unwrap();
        assert!(report.is_consistent(), "{:?}", report.breaches);
        assert_eq!(report.wards, 1);
        assert_eq!(report.beds, 4);
    }
}
