//! Domain models for the occupancy engine

pub mod bed;
pub mod context;
pub mod encounter;
pub mod ids;
pub mod ledger;
pub mod stock;
pub mod ward;

pub use bed::{Bed, BedEvent, BedEventKind, BedStatus};
pub use context::OperationContext;
pub use encounter::{Encounter, EncounterStatus};
pub use ids::{ActorId, BedEventId, BedId, EncounterId, LedgerEntryId, PatientId, StockItemId, WardId};
pub use ledger::{Adjustment, CapacityCounter, LedgerEntry, LedgerSubject, MaxPolicy};
pub use stock::StockItem;
pub use ward::{Ward, WardOccupancy, WardStatus};
