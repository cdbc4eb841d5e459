//! Database layer - occupancy storage backends

pub mod locks;
pub mod memory;
pub mod store;
pub mod traits;
pub mod transaction;

pub use memory::MemoryOccupancyStore;
pub use store::PostgresOccupancyStore;
pub use traits::{LockScope, OccupancyStore, OccupancyTx, ResourceKey};
pub use transaction::PostgresOccupancyTx;
