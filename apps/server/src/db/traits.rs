//! Core traits for occupancy storage backends

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::{
    models::{
        Bed, BedEvent, BedId, Encounter, EncounterId, LedgerEntry, LedgerSubject, PatientId,
        StockItem, StockItemId, Ward, WardId,
    },
    Error, Result,
};

/// A lockable resource.
///
/// The derived `Ord` is the global lock order: wards, then beds, then patients, then stock
/// items, ascending identity within each kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKey {
    Ward(WardId),
    Bed(BedId),
    Patient(PatientId),
    StockItem(StockItemId),
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Ward(id) => write!(f, "ward/{id}"),
            ResourceKey::Bed(id) => write!(f, "bed/{id}"),
            ResourceKey::Patient(id) => write!(f, "patient/{id}"),
            ResourceKey::StockItem(id) => write!(f, "stock_item/{id}"),
        }
    }
}

/// The set of resources a unit of work locks, iterated in global lock order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockScope {
    keys: BTreeSet<ResourceKey>,
}

impl LockScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ward(mut self, id: WardId) -> Self {
        self.keys.insert(ResourceKey::Ward(id));
        self
    }

    pub fn bed(mut self, id: BedId) -> Self {
        self.keys.insert(ResourceKey::Bed(id));
        self
    }

    pub fn patient(mut self, id: &PatientId) -> Self {
        self.keys.insert(ResourceKey::Patient(id.clone()));
        self
    }

    pub fn stock_item(mut self, id: StockItemId) -> Self {
        self.keys.insert(ResourceKey::StockItem(id));
        self
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.keys.contains(key)
    }

    /// Reject writes to resources the unit of work does not hold.
    pub fn require(&self, key: ResourceKey) -> Result<()> {
        if self.keys.contains(&key) {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "write to {key} outside lock scope {self}"
            )))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceKey> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn wards(&self) -> Vec<WardId> {
        self.keys
            .iter()
            .filter_map(|k| match k {
                ResourceKey::Ward(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn beds(&self) -> Vec<BedId> {
        self.keys
            .iter()
            .filter_map(|k| match k {
                ResourceKey::Bed(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn patients(&self) -> Vec<PatientId> {
        self.keys
            .iter()
            .filter_map(|k| match k {
                ResourceKey::Patient(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn stock_items(&self) -> Vec<StockItemId> {
        self.keys
            .iter()
            .filter_map(|k| match k {
                ResourceKey::StockItem(id) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.keys.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", keys.join(", "))
    }
}

/// Storage backend for wards, beds, encounters, stock items and their ledgers.
///
/// Plain reads observe committed state only. Every mutation goes through a unit of work
/// obtained from [`OccupancyStore::begin`], which holds exclusive locks on its scope until it
/// is committed, rolled back or dropped. Dropping a unit of work discards its writes.
#[async_trait]
pub trait OccupancyStore: Send + Sync {
    /// Backend name for logs and metrics
    fn backend(&self) -> &'static str;

    /// Lock every key of `scope` (in global order) and open a unit of work.
    ///
    /// # Errors
    /// * `ResourceBusy` - if the locks could not all be acquired within `timeout`
    async fn begin(&self, scope: LockScope, timeout: Duration) -> Result<Box<dyn OccupancyTx>>;

    async fn get_ward(&self, id: WardId) -> Result<Option<Ward>>;

    async fn list_wards(&self) -> Result<Vec<Ward>>;

    async fn get_bed(&self, id: BedId) -> Result<Option<Bed>>;

    /// Beds of a ward ordered by bed number
    async fn list_beds(&self, ward_id: WardId) -> Result<Vec<Bed>>;

    /// History of one bed, oldest first
    async fn bed_history(&self, bed_id: BedId) -> Result<Vec<BedEvent>>;

    async fn get_encounter(&self, id: EncounterId) -> Result<Option<Encounter>>;

    async fn active_encounter_for_patient(&self, patient_id: &PatientId)
        -> Result<Option<Encounter>>;

    async fn list_active_encounters(&self) -> Result<Vec<Encounter>>;

    /// Bed events recorded for an encounter, oldest first
    async fn encounter_events(&self, encounter_id: EncounterId) -> Result<Vec<BedEvent>>;

    async fn get_stock_item(&self, id: StockItemId) -> Result<Option<StockItem>>;

    async fn list_stock_items(&self) -> Result<Vec<StockItem>>;

    /// Ledger entries of a subject, oldest first
    async fn ledger_entries(&self, subject: LedgerSubject) -> Result<Vec<LedgerEntry>>;
}

/// A locked unit of work.
///
/// Reads see the unit's own pending writes. Writes to resources outside the lock scope are
/// rejected.
#[async_trait]
pub trait OccupancyTx: Send {
    fn scope(&self) -> &LockScope;

    async fn ward(&mut self, id: WardId) -> Result<Ward>;

    async fn bed(&mut self, id: BedId) -> Result<Bed>;

    /// Beds of a locked ward ordered by bed number
    async fn beds_in_ward(&mut self, ward_id: WardId) -> Result<Vec<Bed>>;

    /// Live count of a locked ward's beds with status `available`
    async fn count_available(&mut self, ward_id: WardId) -> Result<u32>;

    async fn encounter(&mut self, id: EncounterId) -> Result<Encounter>;

    async fn active_encounter_for_patient(
        &mut self,
        patient_id: &PatientId,
    ) -> Result<Option<Encounter>>;

    async fn stock_item(&mut self, id: StockItemId) -> Result<StockItem>;

    /// Snapshot recorded by the newest ledger entry of a subject
    async fn last_ledger_balance(&mut self, subject: LedgerSubject) -> Result<Option<i64>>;

    async fn insert_ward(&mut self, ward: &Ward) -> Result<()>;

    async fn update_ward(&mut self, ward: &Ward) -> Result<()>;

    async fn insert_bed(&mut self, bed: &Bed) -> Result<()>;

    async fn update_bed(&mut self, bed: &Bed) -> Result<()>;

    async fn delete_bed(&mut self, id: BedId) -> Result<()>;

    async fn append_bed_event(&mut self, event: &BedEvent) -> Result<()>;

    async fn insert_encounter(&mut self, encounter: &Encounter) -> Result<()>;

    async fn update_encounter(&mut self, encounter: &Encounter) -> Result<()>;

    async fn insert_stock_item(&mut self, item: &StockItem) -> Result<()>;

    async fn update_stock_item(&mut self, item: &StockItem) -> Result<()>;

    async fn append_ledger_entry(&mut self, entry: &LedgerEntry) -> Result<()>;

    /// Publish every write of the unit atomically and release its locks
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every write of the unit and release its locks
    async fn rollback(self: Box<Self>) -> Result<()>;
}
