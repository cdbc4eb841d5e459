//! In-memory occupancy store
//!
//! Committed state lives behind a single `RwLock`. A unit of work holds per-resource locks from
//! the [`LockManager`] for its whole lifetime and buffers its writes; `commit` applies the buffer
//! under one write guard, so readers never observe half of a unit of work. A unit of work that
//! is dropped (cancelled request, error) simply never applies its buffer.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::locks::{LockManager, ScopeGuard};
use super::traits::{LockScope, OccupancyStore, OccupancyTx, ResourceKey};
use crate::{
    models::{
        Bed, BedEvent, BedId, BedStatus, Encounter, EncounterId, LedgerEntry, LedgerSubject,
        PatientId, StockItem, StockItemId, Ward, WardId,
    },
    Error, Result,
};

#[derive(Debug, Default)]
struct Tables {
    wards: HashMap<WardId, Ward>,
    beds: HashMap<BedId, Bed>,
    /// Append order is history order
    bed_events: Vec<BedEvent>,
    events_by_bed: HashMap<BedId, Vec<usize>>,
    events_by_encounter: HashMap<EncounterId, Vec<usize>>,
    encounters: HashMap<EncounterId, Encounter>,
    active_by_patient: HashMap<PatientId, EncounterId>,
    stock_items: HashMap<StockItemId, StockItem>,
    ledger: HashMap<LedgerSubject, Vec<LedgerEntry>>,
}

impl Tables {
    fn beds_in_ward(&self, ward_id: WardId) -> Vec<Bed> {
        let mut beds: Vec<Bed> = self
            .beds
            .values()
            .filter(|b| b.ward_id == ward_id)
            .cloned()
            .collect();
        beds.sort_by_key(|b| b.number);
        beds
    }

    fn events(&self, indexes: Option<&Vec<usize>>) -> Vec<BedEvent> {
        indexes
            .map(|idx| idx.iter().map(|&i| self.bed_events[i].clone()).collect())
            .unwrap_or_default()
    }

    fn push_event(&mut self, event: BedEvent) {
        let index = self.bed_events.len();
        self.events_by_bed.entry(event.bed_id).or_default().push(index);
        if let Some(encounter_id) = event.encounter_id {
            self.events_by_encounter
                .entry(encounter_id)
                .or_default()
                .push(index);
        }
        self.bed_events.push(event);
    }
}

#[derive(Clone, Default)]
pub struct MemoryOccupancyStore {
    tables: Arc<RwLock<Tables>>,
    locks: Arc<LockManager>,
}

impl MemoryOccupancyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OccupancyStore for MemoryOccupancyStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self, scope: LockScope, timeout: Duration) -> Result<Box<dyn OccupancyTx>> {
        let guard = self.locks.acquire(&scope, timeout).await?;
        Ok(Box::new(MemoryOccupancyTx {
            tables: self.tables.clone(),
            scope,
            writes: WriteSet::default(),
            _guard: guard,
        }))
    }

    async fn get_ward(&self, id: WardId) -> Result<Option<Ward>> {
        Ok(self.tables.read().await.wards.get(&id).cloned())
    }

    async fn list_wards(&self) -> Result<Vec<Ward>> {
        let mut wards: Vec<Ward> = self.tables.read().await.wards.values().cloned().collect();
        wards.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(wards)
    }

    async fn get_bed(&self, id: BedId) -> Result<Option<Bed>> {
        Ok(self.tables.read().await.beds.get(&id).cloned())
    }

    async fn list_beds(&self, ward_id: WardId) -> Result<Vec<Bed>> {
        Ok(self.tables.read().await.beds_in_ward(ward_id))
    }

    async fn bed_history(&self, bed_id: BedId) -> Result<Vec<BedEvent>> {
        let tables = self.tables.read().await;
        Ok(tables.events(tables.events_by_bed.get(&bed_id)))
    }

    async fn get_encounter(&self, id: EncounterId) -> Result<Option<Encounter>> {
        Ok(self.tables.read().await.encounters.get(&id).cloned())
    }

    async fn active_encounter_for_patient(
        &self,
        patient_id: &PatientId,
    ) -> Result<Option<Encounter>> {
        let tables = self.tables.read().await;
        Ok(tables
            .active_by_patient
            .get(patient_id)
            .and_then(|id| tables.encounters.get(id))
            .cloned())
    }

    async fn list_active_encounters(&self) -> Result<Vec<Encounter>> {
        let mut active: Vec<Encounter> = self
            .tables
            .read()
            .await
            .encounters
            .values()
            .filter(|e| e.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|e| e.admitted_at);
        Ok(active)
    }

    async fn encounter_events(&self, encounter_id: EncounterId) -> Result<Vec<BedEvent>> {
        let tables = self.tables.read().await;
        Ok(tables.events(tables.events_by_encounter.get(&encounter_id)))
    }

    async fn get_stock_item(&self, id: StockItemId) -> Result<Option<StockItem>> {
        Ok(self.tables.read().await.stock_items.get(&id).cloned())
    }

    async fn list_stock_items(&self) -> Result<Vec<StockItem>> {
        let mut items: Vec<StockItem> = self
            .tables
            .read()
            .await
            .stock_items
            .values()
            .cloned()
            .collect();
        items.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(items)
    }

    async fn ledger_entries(&self, subject: LedgerSubject) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .tables
            .read()
            .await
            .ledger
            .get(&subject)
            .cloned()
            .unwrap_or_default())
    }
}

/// Pending writes of one unit of work
#[derive(Debug, Default)]
struct WriteSet {
    wards: HashMap<WardId, Ward>,
    /// `None` marks a deleted bed
    beds: HashMap<BedId, Option<Bed>>,
    bed_events: Vec<BedEvent>,
    encounters: HashMap<EncounterId, Encounter>,
    stock_items: HashMap<StockItemId, StockItem>,
    ledger: Vec<LedgerEntry>,
}

pub struct MemoryOccupancyTx {
    tables: Arc<RwLock<Tables>>,
    scope: LockScope,
    writes: WriteSet,
    _guard: ScopeGuard,
}

impl MemoryOccupancyTx {
    fn ensure_locked(&self, key: ResourceKey) -> Result<()> {
        self.scope.require(key)
    }

    async fn find_bed(&self, id: BedId) -> Option<Bed> {
        match self.writes.beds.get(&id) {
            Some(pending) => pending.clone(),
            None => self.tables.read().await.beds.get(&id).cloned(),
        }
    }

    async fn find_encounter(&self, id: EncounterId) -> Option<Encounter> {
        match self.writes.encounters.get(&id) {
            Some(pending) => Some(pending.clone()),
            None => self.tables.read().await.encounters.get(&id).cloned(),
        }
    }
}

#[async_trait]
impl OccupancyTx for MemoryOccupancyTx {
    fn scope(&self) -> &LockScope {
        &self.scope
    }

    async fn ward(&mut self, id: WardId) -> Result<Ward> {
        if let Some(ward) = self.writes.wards.get(&id) {
            return Ok(ward.clone());
        }
        self.tables
            .read()
            .await
            .wards
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("Ward", id))
    }

    async fn bed(&mut self, id: BedId) -> Result<Bed> {
        self.find_bed(id)
            .await
            .ok_or_else(|| Error::not_found("Bed", id))
    }

    async fn beds_in_ward(&mut self, ward_id: WardId) -> Result<Vec<Bed>> {
        self.ensure_locked(ResourceKey::Ward(ward_id))?;
        let mut merged: HashMap<BedId, Bed> = self
            .tables
            .read()
            .await
            .beds
            .values()
            .filter(|b| b.ward_id == ward_id)
            .map(|b| (b.id, b.clone()))
            .collect();
        for (id, pending) in &self.writes.beds {
            match pending {
                Some(bed) if bed.ward_id == ward_id => {
                    merged.insert(*id, bed.clone());
                }
                Some(_) => {}
                None => {
                    merged.remove(id);
                }
            }
        }
        let mut beds: Vec<Bed> = merged.into_values().collect();
        beds.sort_by_key(|b| b.number);
        Ok(beds)
    }

    async fn count_available(&mut self, ward_id: WardId) -> Result<u32> {
        let beds = self.beds_in_ward(ward_id).await?;
        Ok(beds
            .iter()
            .filter(|b| b.status == BedStatus::Available)
            .count() as u32)
    }

    async fn encounter(&mut self, id: EncounterId) -> Result<Encounter> {
        self.find_encounter(id)
            .await
            .ok_or_else(|| Error::not_found("Encounter", id))
    }

    async fn active_encounter_for_patient(
        &mut self,
        patient_id: &PatientId,
    ) -> Result<Option<Encounter>> {
        if let Some(pending) = self
            .writes
            .encounters
            .values()
            .find(|e| &e.patient_id == patient_id && e.is_active())
        {
            return Ok(Some(pending.clone()));
        }
        let tables = self.tables.read().await;
        let Some(id) = tables.active_by_patient.get(patient_id) else {
            return Ok(None);
        };
        if self.writes.encounters.contains_key(id) {
            // Closed within this unit of work
            return Ok(None);
        }
        Ok(tables.encounters.get(id).cloned())
    }

    async fn stock_item(&mut self, id: StockItemId) -> Result<StockItem> {
        if let Some(item) = self.writes.stock_items.get(&id) {
            return Ok(item.clone());
        }
        self.tables
            .read()
            .await
            .stock_items
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("StockItem", id))
    }

    async fn last_ledger_balance(&mut self, subject: LedgerSubject) -> Result<Option<i64>> {
        if let Some(entry) = self.writes.ledger.iter().rev().find(|e| e.subject == subject) {
            return Ok(Some(entry.balance_after));
        }
        Ok(self
            .tables
            .read()
            .await
            .ledger
            .get(&subject)
            .and_then(|entries| entries.last())
            .map(|e| e.balance_after))
    }

    async fn insert_ward(&mut self, ward: &Ward) -> Result<()> {
        self.ensure_locked(ResourceKey::Ward(ward.id))?;
        let code_taken = {
            let tables = self.tables.read().await;
            tables.wards.contains_key(&ward.id)
                || tables.wards.values().any(|w| w.code == ward.code)
        } || self.writes.wards.values().any(|w| w.code == ward.code);
        if code_taken {
            return Err(Error::Conflict(format!(
                "ward code '{}' already exists",
                ward.code
            )));
        }
        self.writes.wards.insert(ward.id, ward.clone());
        Ok(())
    }

    async fn update_ward(&mut self, ward: &Ward) -> Result<()> {
        self.ensure_locked(ResourceKey::Ward(ward.id))?;
        self.ward(ward.id).await?;
        self.writes.wards.insert(ward.id, ward.clone());
        Ok(())
    }

    async fn insert_bed(&mut self, bed: &Bed) -> Result<()> {
        self.ensure_locked(ResourceKey::Bed(bed.id))?;
        let siblings = self.beds_in_ward(bed.ward_id).await?;
        if siblings
            .iter()
            .any(|b| b.id == bed.id || b.number == bed.number || b.code == bed.code)
        {
            return Err(Error::Conflict(format!(
                "bed {} ({}) already exists in ward {}",
                bed.number, bed.code, bed.ward_id
            )));
        }
        self.writes.beds.insert(bed.id, Some(bed.clone()));
        Ok(())
    }

    async fn update_bed(&mut self, bed: &Bed) -> Result<()> {
        self.ensure_locked(ResourceKey::Bed(bed.id))?;
        let existing = self.bed(bed.id).await?;
        if existing.ward_id != bed.ward_id {
            return Err(Error::InvariantBreach(format!(
                "bed {} cannot move from ward {} to {}",
                bed.id, existing.ward_id, bed.ward_id
            )));
        }
        self.writes.beds.insert(bed.id, Some(bed.clone()));
        Ok(())
    }

    async fn delete_bed(&mut self, id: BedId) -> Result<()> {
        self.ensure_locked(ResourceKey::Bed(id))?;
        self.bed(id).await?;
        self.writes.beds.insert(id, None);
        Ok(())
    }

    async fn append_bed_event(&mut self, event: &BedEvent) -> Result<()> {
        self.ensure_locked(ResourceKey::Bed(event.bed_id))?;
        self.writes.bed_events.push(event.clone());
        Ok(())
    }

    async fn insert_encounter(&mut self, encounter: &Encounter) -> Result<()> {
        self.ensure_locked(ResourceKey::Patient(encounter.patient_id.clone()))?;
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
        self.writes.encounters.insert(encounter.id, encounter.clone());
        Ok(())
    }

    async fn update_encounter(&mut self, encounter: &Encounter) -> Result<()> {
        self.ensure_locked(ResourceKey::Patient(encounter.patient_id.clone()))?;
        self.encounter(encounter.id).await?;
        self.writes.encounters.insert(encounter.id, encounter.clone());
        Ok(())
    }

    async fn insert_stock_item(&mut self, item: &StockItem) -> Result<()> {
        self.ensure_locked(ResourceKey::StockItem(item.id))?;
        let code_taken = self
            .tables
            .read()
            .await
            .stock_items
            .values()
            .any(|i| i.id == item.id || i.code == item.code);
        if code_taken {
            return Err(Error::Conflict(format!(
                "stock item code '{}' already exists",
                item.code
            )));
        }
        self.writes.stock_items.insert(item.id, item.clone());
        Ok(())
    }

    async fn update_stock_item(&mut self, item: &StockItem) -> Result<()> {
        self.ensure_locked(ResourceKey::StockItem(item.id))?;
        self.stock_item(item.id).await?;
        self.writes.stock_items.insert(item.id, item.clone());
        Ok(())
    }

    async fn append_ledger_entry(&mut self, entry: &LedgerEntry) -> Result<()> {
        let key = match entry.subject {
            LedgerSubject::StockItem(id) => ResourceKey::StockItem(id),
            LedgerSubject::WardCapacity(id) => ResourceKey::Ward(id),
        };
        self.ensure_locked(key)?;
        self.writes.ledger.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryOccupancyTx {
            tables,
            scope,
            writes,
            _guard,
        } = *self;
        let mut tables = tables.write().await;

        // Validate before touching anything so a failed commit leaves no trace.
        for encounter in writes.encounters.values().filter(|e| e.is_active()) {
            if let Some(other) = tables.active_by_patient.get(&encounter.patient_id) {
                if *other != encounter.id {
                    return Err(Error::InvariantBreach(format!(
                        "patient {} would hold two active encounters ({} and {})",
                        encounter.patient_id, other, encounter.id
                    )));
                }
            }
        }

        for (id, ward) in writes.wards {
            tables.wards.insert(id, ward);
        }
        for (id, pending) in writes.beds {
            match pending {
                Some(bed) => {
                    tables.beds.insert(id, bed);
                }
                None => {
                    tables.beds.remove(&id);
                }
            }
        }
        for event in writes.bed_events {
            tables.push_event(event);
        }
        for (id, encounter) in writes.encounters {
            if encounter.is_active() {
                tables
                    .active_by_patient
                    .insert(encounter.patient_id.clone(), id);
            } else if tables.active_by_patient.get(&encounter.patient_id) == Some(&id) {
                tables.active_by_patient.remove(&encounter.patient_id);
            }
            tables.encounters.insert(id, encounter);
        }
        for (id, item) in writes.stock_items {
            tables.stock_items.insert(id, item);
        }
        for entry in writes.ledger {
            tables.ledger.entry(entry.subject).or_default().push(entry);
        }

        tracing::trace!(scope = %scope, "Memory unit of work committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        tracing::trace!(scope = %self.scope, "Memory unit of work rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActorId, BedEventId, BedEventKind};
    use chrono::Utc;

    const TIMEOUT: Duration = Duration::from_millis(200);

    async fn seeded() -> (MemoryOccupancyStore, Ward, Bed) {
        let store = MemoryOccupancyStore::new();
        let now = Utc::now();
        let mut ward = Ward::new("ICU", "Intensive Care", None, now);
        ward.total_beds = 1;
        ward.available_beds = 1;
        let bed = Bed::new(ward.id, 1, ward.bed_code(1), now);

        let mut tx = store
            .begin(LockScope::new().ward(ward.id).bed(bed.id), TIMEOUT)
            .await
            .unwrap();
        tx.insert_ward(&ward).await.unwrap();
        tx.insert_bed(&bed).await.unwrap();
        tx.commit().await.unwrap();
        (store, ward, bed)
    }

    #[tokio::test]
    async fn dropped_unit_of_work_publishes_nothing() {
        let (store, ward, bed) = seeded().await;
        let patient = PatientId::from("P1");
        let now = Utc::now();

        let mut tx = store
            .begin(
                LockScope::new().ward(ward.id).bed(bed.id).patient(&patient),
                TIMEOUT,
            )
            .await
            .unwrap();
        let mut occupied = tx.bed(bed.id).await.unwrap();
        let from = occupied.status;
        occupied.allocate(&patient, now).unwrap();
        let clerk = ActorId::from("ward-clerk");
        let encounter = Encounter::admit(patient.clone(), ward.id, bed.id, clerk.clone(), now);
        tx.update_bed(&occupied).await.unwrap();
        tx.insert_encounter(&encounter).await.unwrap();
        tx.append_bed_event(&BedEvent {
            id: BedEventId::new(),
            bed_id: bed.id,
            ward_id: ward.id,
            kind: BedEventKind::Admission,
            from_status: from,
            to_status: occupied.status,
            patient_id: Some(patient.clone()),
            encounter_id: Some(encounter.id),
            actor: clerk,
            at: now,
        })
        .await
        .unwrap();

        // The unit sees its own writes until it goes away
        assert!(tx.active_encounter_for_patient(&patient).await.unwrap().is_some());
        drop(tx);

        let stored = store.get_bed(bed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BedStatus::Available);
        assert!(stored.current_patient_id.is_none());
        assert!(store.get_encounter(encounter.id).await.unwrap().is_none());
        assert!(store.active_encounter_for_patient(&patient).await.unwrap().is_none());
        assert!(store.bed_history(bed.id).await.unwrap().is_empty());

        // Locks went with it
        let again = store
            .begin(LockScope::new().ward(ward.id).bed(bed.id), TIMEOUT)
            .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn writes_outside_the_scope_are_refused() {
        let (store, ward, bed) = seeded().await;
        let mut tx = store
            .begin(LockScope::new().ward(ward.id), TIMEOUT)
            .await
            .unwrap();
        let mut held = tx.bed(bed.id).await.unwrap();
        held.start_maintenance(Utc::now()).unwrap();
        assert!(tx.update_bed(&held).await.is_err());
    }
}
