//! Business logic layer - occupancy services

pub mod audit;
pub mod beds;
pub mod consistency;
pub mod encounters;
pub mod patients;
pub mod stock;
pub mod unit;
pub mod wards;

use std::time::Duration;

pub use audit::{AuditTrail, BedChange};
pub use beds::BedRegistry;
pub use consistency::{ConsistencyChecker, ConsistencyReport};
pub use encounters::{
    AdmitRequest, Admission, DischargeRequest, Discharge, EncounterManager, Transfer,
    TransferRequest,
};
pub use patients::{OpenPatientDirectory, PatientDirectory, StaticPatientDirectory};
pub use stock::{
    LedgerVerification, NewStockItem, StockAdjustment, StockAdjustmentOutcome, StockLedger,
};
pub use unit::UnitOfWork;
pub use wards::{NewWard, WardAggregate};

/// How long a unit of work may wait for its locks, and how often a lock scope built from
/// optimistically resolved ids is re-resolved before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl LockSettings {
    pub fn new(timeout: Duration, max_attempts: u32) -> Self {
        Self {
            timeout,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self::new(Duration::from_millis(2000), 3)
    }
}
