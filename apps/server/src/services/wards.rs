//! Ward aggregate: capacity, status and the derived available-bed counter.

use serde::Deserialize;
use std::cmp::Reverse;
use std::sync::Arc;
use validator::Validate;

use super::{unit::UnitOfWork, LockSettings};
use crate::{
    db::{LockScope, OccupancyStore, OccupancyTx, ResourceKey},
    models::{
        Bed, BedId, BedStatus, CapacityCounter, LedgerEntry, LedgerSubject, MaxPolicy,
        OperationContext, Ward, WardId, WardOccupancy, WardStatus,
    },
    Error, Result,
};

/// Upper bound on beds per ward; keeps a resize inside one reasonable unit of work.
pub const MAX_WARD_BEDS: u32 = 500;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewWard {
    #[validate(length(min = 1, max = 32, message = "code must be 1-32 characters"))]
    pub code: String,
    #[validate(length(min = 1, max = 200, message = "name must be 1-200 characters"))]
    pub name: String,
    pub department: Option<String>,
    #[validate(range(max = 500, message = "a ward holds at most 500 beds"))]
    pub total_beds: u32,
}

/// Recompute a locked ward's available counter from its beds and persist it if it moved.
pub(crate) async fn refresh_available(
    tx: &mut dyn OccupancyTx,
    ward_id: WardId,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Ward> {
    let mut ward = tx.ward(ward_id).await?;
    let available = tx.count_available(ward_id).await?;
    if available > ward.total_beds {
        return Err(Error::InvariantBreach(format!(
            "ward {} has {} available beds but a capacity of {}",
            ward.code, available, ward.total_beds
        )));
    }
    if ward.available_beds != available {
        ward.available_beds = available;
        ward.updated_at = now;
        tx.update_ward(&ward).await?;
    }
    Ok(ward)
}

#[derive(Clone)]
pub struct WardAggregate {
    store: Arc<dyn OccupancyStore>,
    locks: LockSettings,
}

impl WardAggregate {
    pub fn new(store: Arc<dyn OccupancyStore>, locks: LockSettings) -> Self {
        Self { store, locks }
    }

    pub async fn get(&self, ward_id: WardId) -> Result<Ward> {
        self.store
            .get_ward(ward_id)
            .await?
            .ok_or_else(|| Error::not_found("Ward", ward_id))
    }

    pub async fn list(&self) -> Result<Vec<Ward>> {
        self.store.list_wards().await
    }

    pub async fn beds(&self, ward_id: WardId) -> Result<Vec<Bed>> {
        self.get(ward_id).await?;
        self.store.list_beds(ward_id).await
    }

    /// Live count of the ward's available beds
    pub async fn available_bed_count(&self, ward_id: WardId) -> Result<u32> {
        Ok(self.occupancy(ward_id).await?.available)
    }

    pub async fn can_admit(&self, ward_id: WardId) -> Result<bool> {
        Ok(self.occupancy(ward_id).await?.can_admit())
    }

    pub async fn occupancy(&self, ward_id: WardId) -> Result<WardOccupancy> {
        let ward = self.get(ward_id).await?;
        let beds = self.store.list_beds(ward_id).await?;
        Ok(WardOccupancy::from_beds(&ward, &beds))
    }

    /// Capacity ledger of the ward, oldest first
    pub async fn capacity_ledger(&self, ward_id: WardId) -> Result<Vec<LedgerEntry>> {
        self.get(ward_id).await?;
        self.store
            .ledger_entries(LedgerSubject::WardCapacity(ward_id))
            .await
    }

    /// Create a ward with beds `1..=total_beds` and an opening capacity entry.
    pub async fn create_ward(&self, request: NewWard, ctx: &OperationContext) -> Result<Ward> {
        let result = async {
            request.validate()?;
            if request.code.trim().is_empty() || request.name.trim().is_empty() {
                return Err(Error::Validation(
                    "ward code and name must not be blank".to_string(),
                ));
            }

            let ward = Ward::new(
                request.code.trim(),
                request.name.trim(),
                request.department.clone(),
                ctx.now,
            );
            let additions: Vec<BedId> = (0..request.total_beds).map(|_| BedId::new()).collect();
            let scope = additions
                .iter()
                .fold(LockScope::new().ward(ward.id), |scope, id| scope.bed(*id));

            let mut unit = UnitOfWork::begin(self.store.as_ref(), scope, self.locks, ctx).await?;
            let outcome = async {
                unit.tx().insert_ward(&ward).await?;
                apply_resize(&mut unit, ward.id, &[], additions, request.total_beds, "opening capacity")
                    .await
            }
            .await;
            unit.finish(outcome).await
        }
        .await;

        crate::metrics::record_operation("create_ward", &result);
        if let Ok(ward) = &result {
            tracing::info!(
                ward_id = %ward.id,
                code = %ward.code,
                total_beds = ward.total_beds,
                "Ward created"
            );
        }
        result
    }

    /// Change the ward's capacity.
    ///
    /// Growing appends beds after the highest existing number. Shrinking removes available beds,
    /// highest numbers first, and fails with `CapacityInUse` when too few are available.
    pub async fn resize(
        &self,
        ward_id: WardId,
        new_total: u32,
        reason: Option<&str>,
        ctx: &OperationContext,
    ) -> Result<Ward> {
        let reason = reason.map(str::trim).filter(|r| !r.is_empty()).unwrap_or("resize");
        let result = self.resize_with_retry(ward_id, new_total, reason, ctx).await;

        crate::metrics::record_operation("resize_ward", &result);
        if let Ok(ward) = &result {
            tracing::info!(
                ward_id = %ward.id,
                total_beds = ward.total_beds,
                available_beds = ward.available_beds,
                reason,
                "Ward resized"
            );
        }
        result
    }

    async fn resize_with_retry(
        &self,
        ward_id: WardId,
        new_total: u32,
        reason: &str,
        ctx: &OperationContext,
    ) -> Result<Ward> {
        if new_total > MAX_WARD_BEDS {
            return Err(Error::Validation(format!(
                "a ward holds at most {MAX_WARD_BEDS} beds"
            )));
        }

        for attempt in 1..=self.locks.max_attempts {
            // Bed ids are only known after reading; the ward lock then pins them.
            let beds = self.beds(ward_id).await?;
            let current = beds.len() as u32;
            let additions: Vec<BedId> = (current..new_total).map(|_| BedId::new()).collect();
            let scope = beds
                .iter()
                .map(|b| b.id)
                .chain(additions.iter().copied())
                .fold(LockScope::new().ward(ward_id), |scope, id| scope.bed(id));

            let mut unit = UnitOfWork::begin(self.store.as_ref(), scope, self.locks, ctx).await?;
            let locked = match unit.tx().beds_in_ward(ward_id).await {
                Ok(locked) => locked,
                Err(e) => return unit.finish(Err(e)).await,
            };
            let pinned = locked.len() == beds.len()
                && locked
                    .iter()
                    .all(|b| unit.scope().contains(&ResourceKey::Bed(b.id)));
            if !pinned {
                tracing::debug!(%ward_id, attempt, "Ward beds changed before lock, retrying resize");
                unit.rollback().await;
                continue;
            }

            let outcome = apply_resize(&mut unit, ward_id, &locked, additions, new_total, reason).await;
            return unit.finish(outcome).await;
        }

        Err(Error::ResourceBusy {
            resource: format!("ward/{ward_id}"),
            waited_ms: 0,
        })
    }

    pub async fn set_status(
        &self,
        ward_id: WardId,
        status: WardStatus,
        ctx: &OperationContext,
    ) -> Result<Ward> {
        let result = async {
            let scope = LockScope::new().ward(ward_id);
            let mut unit = UnitOfWork::begin(self.store.as_ref(), scope, self.locks, ctx).await?;
            let outcome = async {
                let mut ward = unit.tx().ward(ward_id).await?;
                if ward.status != status {
                    ward.status = status;
                    ward.updated_at = ctx.now;
                    unit.tx().update_ward(&ward).await?;
                }
                Ok(ward)
            }
            .await;
            unit.finish(outcome).await
        }
        .await;

        crate::metrics::record_operation("set_ward_status", &result);
        if let Ok(ward) = &result {
            tracing::info!(ward_id = %ward.id, status = ward.status.as_str(), "Ward status set");
        }
        result
    }
}

/// Reconcile a locked ward's beds with `new_total` and book the difference on its capacity
/// ledger. `beds` are the ward's current beds; `additions` supply ids for new beds.
async fn apply_resize(
    unit: &mut UnitOfWork,
    ward_id: WardId,
    beds: &[Bed],
    additions: Vec<BedId>,
    new_total: u32,
    reason: &str,
) -> Result<Ward> {
    let now = unit.ctx().now;
    let mut ward = unit.tx().ward(ward_id).await?;
    let current = beds.len() as u32;

    if new_total > current {
        let wanted = (new_total - current) as usize;
        if additions.len() < wanted {
            return Err(Error::Internal(format!(
                "resize of ward {} needs {} new beds but {} ids were locked",
                ward.code,
                wanted,
                additions.len()
            )));
        }
        let mut number = beds.iter().map(|b| b.number).max().unwrap_or(0);
        for id in additions.into_iter().take(wanted) {
            number += 1;
            let mut bed = Bed::new(ward_id, number, ward.bed_code(number), now);
            bed.id = id;
            unit.tx().insert_bed(&bed).await?;
        }
    } else if new_total < current {
        let requested = current - new_total;
        let mut removable: Vec<&Bed> = beds
            .iter()
            .filter(|b| b.status == BedStatus::Available)
            .collect();
        if (removable.len() as u32) < requested {
            return Err(Error::CapacityInUse {
                ward_id,
                requested,
                removable: removable.len() as u32,
            });
        }
        removable.sort_by_key(|b| Reverse(b.number));
        for bed in removable.into_iter().take(requested as usize) {
            unit.tx().delete_bed(bed.id).await?;
        }
    }

    if new_total != ward.total_beds {
        let counter = CapacityCounter::new(
            LedgerSubject::WardCapacity(ward_id),
            i64::from(ward.total_beds),
            None,
        );
        let adjustment = counter.plan(
            i64::from(new_total) - i64::from(ward.total_beds),
            MaxPolicy::Advisory,
        )?;
        unit.record_adjustment(&adjustment, reason).await?;
        ward.total_beds = new_total;
    }

    ward.available_beds = unit.tx().count_available(ward_id).await?;
    ward.updated_at = now;
    unit.tx().update_ward(&ward).await?;
    unit.touch_ward(ward_id);
    Ok(ward)
}
