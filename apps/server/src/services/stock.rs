//! Medication stock ledger.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

use super::{unit::UnitOfWork, LockSettings};
use crate::{
    db::{LockScope, OccupancyStore},
    models::{
        ledger, CapacityCounter, LedgerEntry, LedgerEntryId, LedgerSubject, MaxPolicy,
        OperationContext, StockItem, StockItemId,
    },
    Error, Result,
};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewStockItem {
    #[validate(length(min = 1, max = 64, message = "code must be 1-64 characters"))]
    pub code: String,
    #[validate(length(min = 1, max = 200, message = "name must be 1-200 characters"))]
    pub name: String,
    #[validate(length(min = 1, max = 32, message = "unit must be 1-32 characters"))]
    pub unit: String,
    #[validate(range(min = 0, message = "opening_stock must not be negative"))]
    #[serde(default)]
    pub opening_stock: i64,
    #[validate(range(min = 0, message = "minimum_stock must not be negative"))]
    #[serde(default)]
    pub minimum_stock: i64,
    #[validate(range(min = 0, message = "maximum_stock must not be negative"))]
    pub maximum_stock: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StockAdjustment {
    pub item_id: StockItemId,
    /// Signed quantity; receipts are positive, dispensing negative
    pub adjustment: i64,
    #[validate(length(min = 1, max = 500, message = "reason must be 1-500 characters"))]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StockAdjustmentOutcome {
    pub item_id: StockItemId,
    pub entry_id: LedgerEntryId,
    pub previous_balance: i64,
    pub new_balance: i64,
    pub below_minimum: bool,
    pub above_maximum: bool,
}

/// Result of replaying a subject's ledger
#[derive(Debug, Clone, Serialize)]
pub struct LedgerVerification {
    pub subject: LedgerSubject,
    pub balance: i64,
    pub entries: usize,
}

#[derive(Clone)]
pub struct StockLedger {
    store: Arc<dyn OccupancyStore>,
    locks: LockSettings,
    policy: MaxPolicy,
}

impl StockLedger {
    pub fn new(store: Arc<dyn OccupancyStore>, locks: LockSettings, policy: MaxPolicy) -> Self {
        Self {
            store,
            locks,
            policy,
        }
    }

    pub fn policy(&self) -> MaxPolicy {
        self.policy
    }

    pub async fn get(&self, item_id: StockItemId) -> Result<StockItem> {
        self.store
            .get_stock_item(item_id)
            .await?
            .ok_or_else(|| Error::not_found("StockItem", item_id))
    }

    pub async fn list(&self) -> Result<Vec<StockItem>> {
        self.store.list_stock_items().await
    }

    pub async fn entries(&self, item_id: StockItemId) -> Result<Vec<LedgerEntry>> {
        self.get(item_id).await?;
        self.store
            .ledger_entries(LedgerSubject::StockItem(item_id))
            .await
    }

    /// Create an item; a non-zero opening balance becomes its first ledger entry.
    pub async fn create_item(
        &self,
        request: NewStockItem,
        ctx: &OperationContext,
    ) -> Result<StockItem> {
        let result = async {
            request.validate()?;
            if let Some(max) = request.maximum_stock {
                if max < request.minimum_stock {
                    return Err(Error::Validation(
                        "maximum_stock must not be below minimum_stock".to_string(),
                    ));
                }
            }

            let mut item = StockItem {
                id: StockItemId::new(),
                code: request.code.trim().to_string(),
                name: request.name.trim().to_string(),
                unit: request.unit.trim().to_string(),
                current_stock: 0,
                minimum_stock: request.minimum_stock,
                maximum_stock: request.maximum_stock,
                created_at: ctx.now,
                updated_at: ctx.now,
            };
            let scope = LockScope::new().stock_item(item.id);
            let mut unit = UnitOfWork::begin(self.store.as_ref(), scope, self.locks, ctx).await?;

            let outcome = async {
                let opening = item.counter().plan(request.opening_stock, MaxPolicy::Advisory)?;
                item.current_stock = opening.balance;
                unit.tx().insert_stock_item(&item).await?;
                if opening.delta != 0 {
                    unit.record_adjustment(&opening, "opening balance").await?;
                }
                Ok(item)
            }
            .await;
            unit.finish(outcome).await
        }
        .await;

        crate::metrics::record_operation("create_stock_item", &result);
        if let Ok(item) = &result {
            tracing::info!(
                item_id = %item.id,
                code = %item.code,
                current_stock = item.current_stock,
                "Stock item created"
            );
        }
        result
    }

    /// Apply a signed adjustment and append its ledger entry in one unit of work.
    #[tracing::instrument(
        name = "stock.adjust",
        skip(self, request, ctx),
        fields(item_id = %request.item_id, delta = request.adjustment, actor = %ctx.actor)
    )]
    pub async fn adjust(
        &self,
        request: StockAdjustment,
        ctx: &OperationContext,
    ) -> Result<StockAdjustmentOutcome> {
        let result = self.adjust_inner(request, ctx).await;

        crate::metrics::record_operation("stock_adjust", &result);
        match &result {
            Ok(outcome) => {
                let direction = if outcome.new_balance > outcome.previous_balance {
                    "in"
                } else {
                    "out"
                };
                let flag = if outcome.above_maximum {
                    "above_maximum"
                } else if outcome.below_minimum {
                    "below_minimum"
                } else {
                    "none"
                };
                crate::metrics::STOCK_ADJUSTMENTS_TOTAL
                    .with_label_values(&[direction, flag])
                    .inc();

                if outcome.above_maximum {
                    tracing::warn!(
                        new_balance = outcome.new_balance,
                        "Stock is above its maximum"
                    );
                }
                if outcome.below_minimum {
                    tracing::warn!(
                        new_balance = outcome.new_balance,
                        "Stock is below its minimum"
                    );
                }
                tracing::info!(
                    previous_balance = outcome.previous_balance,
                    new_balance = outcome.new_balance,
                    "Stock adjusted"
                );
            }
            Err(e) => tracing::debug!(code = e.code(), error = %e, "Stock adjustment rejected"),
        }
        result
    }

    async fn adjust_inner(
        &self,
        request: StockAdjustment,
        ctx: &OperationContext,
    ) -> Result<StockAdjustmentOutcome> {
        request.validate()?;
        if request.adjustment == 0 {
            return Err(Error::Validation("adjustment must not be zero".to_string()));
        }
        let reason = request.reason.trim();
        if reason.is_empty() {
            return Err(Error::Validation("reason must not be blank".to_string()));
        }

        let scope = LockScope::new().stock_item(request.item_id);
        let mut unit = UnitOfWork::begin(self.store.as_ref(), scope, self.locks, ctx).await?;

        let outcome = async {
            let mut item = unit.tx().stock_item(request.item_id).await?;
            let adjustment = item.counter().plan(request.adjustment, self.policy)?;
            let entry = unit.record_adjustment(&adjustment, reason).await?;

            item.current_stock = adjustment.balance;
            item.updated_at = ctx.now;
            unit.tx().update_stock_item(&item).await?;

            Ok(StockAdjustmentOutcome {
                item_id: item.id,
                entry_id: entry.id,
                previous_balance: adjustment.previous,
                new_balance: adjustment.balance,
                below_minimum: item.is_below_minimum(),
                above_maximum: adjustment.above_maximum,
            })
        }
        .await;
        unit.finish(outcome).await
    }

    /// Replay the item's ledger from zero and compare it with the stored balance.
    pub async fn verify(&self, item_id: StockItemId) -> Result<LedgerVerification> {
        let subject = LedgerSubject::StockItem(item_id);
        let scope = LockScope::new().stock_item(item_id);
        let ctx = OperationContext::system();

        // Hold the item lock so no adjustment lands between the two reads.
        let mut unit = UnitOfWork::begin(self.store.as_ref(), scope, self.locks, &ctx).await?;
        let outcome = async {
            let item = unit.tx().stock_item(item_id).await?;
            let entries = self.store.ledger_entries(subject).await?;
            ledger::verify(subject, &entries, item.current_stock)?;
            Ok(LedgerVerification {
                subject,
                balance: item.current_stock,
                entries: entries.len(),
            })
        }
        .await;
        let result = unit.finish(outcome).await;

        if let Err(e) = &result {
            if matches!(e, Error::InvariantBreach(_)) {
                tracing::error!(%subject, error = %e, "Ledger verification failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryOccupancyStore;

    fn ledger_with(policy: MaxPolicy) -> StockLedger {
        StockLedger::new(
            Arc::new(MemoryOccupancyStore::new()),
            LockSettings::default(),
            policy,
        )
    }

    fn saline(opening_stock: i64, maximum_stock: Option<i64>) -> NewStockItem {
        NewStockItem {
            code: "NACL-500".to_string(),
            name: "Sodium chloride 0.9% 500 ml".to_string(),
            unit: "bag".to_string(),
            opening_stock,
            minimum_stock: 5,
            maximum_stock,
        }
    }

    fn adjustment(item_id: StockItemId, delta: i64) -> StockAdjustment {
        StockAdjustment {
            item_id,
            adjustment: delta,
            reason: "ward round".to_string(),
        }
    }

    #[tokio::test]
    async fn overdraw_is_rejected_and_balance_kept() {
        let stock = ledger_with(MaxPolicy::Advisory);
        let ctx = OperationContext::new("pharmacist-1");
        let item = stock.create_item(saline(10, None), &ctx).await.unwrap();

        let err = stock.adjust(adjustment(item.id, -15), &ctx).await.unwrap_err();
        assert!(matches!(err, Error::WouldGoNegative { balance: 10, delta: -15, .. }));
        assert_eq!(stock.get(item.id).await.unwrap().current_stock, 10);
        assert_eq!(stock.entries(item.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispensing_below_minimum_is_flagged() {
        let stock = ledger_with(MaxPolicy::Advisory);
        let ctx = OperationContext::system();
        let item = stock.create_item(saline(10, None), &ctx).await.unwrap();

        let outcome = stock.adjust(adjustment(item.id, -6), &ctx).await.unwrap();
        assert_eq!(outcome.previous_balance, 10);
        assert_eq!(outcome.new_balance, 4);
        assert!(outcome.below_minimum);
        assert!(!outcome.above_maximum);

        let verified = stock.verify(item.id).await.unwrap();
        assert_eq!(verified.balance, 4);
        assert_eq!(verified.entries, 2);
    }

    #[tokio::test]
    async fn maximum_is_advisory_unless_enforced() {
        let ctx = OperationContext::system();

        let advisory = ledger_with(MaxPolicy::Advisory);
        let item = advisory.create_item(saline(8, Some(10)), &ctx).await.unwrap();
        let outcome = advisory.adjust(adjustment(item.id, 5), &ctx).await.unwrap();
        assert!(outcome.above_maximum);
        assert_eq!(outcome.new_balance, 13);

        let enforced = ledger_with(MaxPolicy::Enforced);
        let item = enforced.create_item(saline(8, Some(10)), &ctx).await.unwrap();
        let err = enforced.adjust(adjustment(item.id, 5), &ctx).await.unwrap_err();
        assert!(matches!(err, Error::WouldExceedMaximum { maximum: 10, .. }));
        assert_eq!(enforced.get(item.id).await.unwrap().current_stock, 8);
    }

    #[tokio::test]
    async fn zero_delta_and_blank_reason_are_validation_errors() {
        let stock = ledger_with(MaxPolicy::Advisory);
        let ctx = OperationContext::system();
        let item = stock.create_item(saline(1, None), &ctx).await.unwrap();

        let err = stock.adjust(adjustment(item.id, 0), &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut blank = adjustment(item.id, 1);
        blank.reason = "   ".to_string();
        let err = stock.adjust(blank, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
