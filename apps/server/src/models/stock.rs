//! Medication inventory items

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::StockItemId;
use super::ledger::{CapacityCounter, LedgerSubject};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockItem {
    pub id: StockItemId,
    pub code: String,
    pub name: String,
    pub unit: String,
    pub current_stock: i64,
    /// Reorder threshold; going below it is reported, never rejected
    pub minimum_stock: i64,
    pub maximum_stock: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StockItem {
    pub fn subject(&self) -> LedgerSubject {
        LedgerSubject::StockItem(self.id)
    }

    pub fn counter(&self) -> CapacityCounter {
        CapacityCounter::new(self.subject(), self.current_stock, self.maximum_stock)
    }

    pub fn is_below_minimum(&self) -> bool {
        self.current_stock < self.minimum_stock
    }
}
