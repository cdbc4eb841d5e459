//! Unit of work: a locked storage transaction plus the history it produced.

use std::collections::BTreeSet;

use super::{
    audit::{AuditTrail, BedChange},
    wards::refresh_available,
    LockSettings,
};
use crate::{
    db::{LockScope, OccupancyStore, OccupancyTx},
    models::{Adjustment, BedEvent, LedgerEntry, OperationContext, WardId},
    Result,
};

pub struct UnitOfWork {
    tx: Box<dyn OccupancyTx>,
    trail: AuditTrail,
    /// Wards whose beds changed; their available counts are recomputed before commit
    touched_wards: BTreeSet<WardId>,
    ctx: OperationContext,
}

impl UnitOfWork {
    /// Lock `scope` and open a unit of work on behalf of `ctx`.
    pub async fn begin(
        store: &dyn OccupancyStore,
        scope: LockScope,
        settings: LockSettings,
        ctx: &OperationContext,
    ) -> Result<Self> {
        tracing::debug!(scope = %scope, backend = store.backend(), "Opening unit of work");
        let tx = store.begin(scope, settings.timeout).await?;
        Ok(Self {
            tx,
            trail: AuditTrail::new(),
            touched_wards: BTreeSet::new(),
            ctx: ctx.clone(),
        })
    }

    pub fn tx(&mut self) -> &mut dyn OccupancyTx {
        self.tx.as_mut()
    }

    pub fn ctx(&self) -> &OperationContext {
        &self.ctx
    }

    pub fn scope(&self) -> &LockScope {
        self.tx.scope()
    }

    pub fn touch_ward(&mut self, ward_id: WardId) {
        self.touched_wards.insert(ward_id);
    }

    pub async fn record_bed_change(&mut self, change: BedChange<'_>) -> Result<BedEvent> {
        self.touched_wards.insert(change.bed.ward_id);
        self.trail
            .record_bed_change(self.tx.as_mut(), change, &self.ctx)
            .await
    }

    pub async fn record_adjustment(
        &mut self,
        adjustment: &Adjustment,
        reason: &str,
    ) -> Result<LedgerEntry> {
        self.trail
            .record_adjustment(self.tx.as_mut(), adjustment, reason, &self.ctx)
            .await
    }

    /// Recompute touched ward counters, commit, then publish the trail.
    pub async fn commit(mut self) -> Result<AuditTrail> {
        let mut counters = Vec::with_capacity(self.touched_wards.len());
        for ward_id in std::mem::take(&mut self.touched_wards) {
            let ward = refresh_available(self.tx.as_mut(), ward_id, self.ctx.now).await?;
            counters.push((ward.code, ward.available_beds));
        }

        self.tx.commit().await?;

        for (code, available) in counters {
            crate::metrics::WARD_AVAILABLE_BEDS
                .with_label_values(&[code.as_str()])
                .set(i64::from(available));
        }
        self.trail.publish(&self.ctx);
        Ok(self.trail)
    }

    pub async fn rollback(self) {
        if let Err(e) = self.tx.rollback().await {
            tracing::warn!(error = %e, "Failed to roll back unit of work");
        }
    }

    /// Commit on success, roll back on failure. The original error wins over a rollback error.
    pub async fn finish<T>(self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                self.rollback().await;
                Err(err)
            }
        }
    }
}
