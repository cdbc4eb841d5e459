//! Encounter manager: admission, transfer and discharge.
//!
//! Each operation is one unit of work over the beds, wards and patient slot it touches.
//! Identifiers that can change under concurrency (who occupies a source bed, which bed an
//! encounter holds) are read without locks to build the scope, then checked again once the
//! locks are held; a stale read restarts the operation, at most `max_attempts` times.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

use super::{
    beds,
    patients::{ensure_known, PatientDirectory},
    unit::UnitOfWork,
    LockSettings,
};
use crate::{
    db::{LockScope, OccupancyStore},
    models::{
        BedEvent, BedEventKind, BedId, Encounter, EncounterId, OperationContext, PatientId,
        WardId,
    },
    Error, Result,
};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AdmitRequest {
    #[validate(length(min = 1, max = 64, message = "patient_id must be 1-64 characters"))]
    pub patient_id: String,
    pub ward_id: WardId,
    pub bed_id: BedId,
}

#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    pub encounter_id: EncounterId,
    pub ward_id: WardId,
    pub bed_id: BedId,
    pub admitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TransferRequest {
    pub from_bed_id: BedId,
    pub to_bed_id: BedId,
}

#[derive(Debug, Clone, Serialize)]
pub struct Transfer {
    pub encounter_id: EncounterId,
    pub new_ward_id: WardId,
    pub new_bed_id: BedId,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DischargeRequest {
    pub encounter_id: EncounterId,
    #[validate(length(max = 4000, message = "discharge_summary is limited to 4000 characters"))]
    pub discharge_summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Discharge {
    pub encounter_id: EncounterId,
    pub discharged_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EncounterManager {
    store: Arc<dyn OccupancyStore>,
    patients: Arc<dyn PatientDirectory>,
    locks: LockSettings,
}

impl EncounterManager {
    pub fn new(
        store: Arc<dyn OccupancyStore>,
        patients: Arc<dyn PatientDirectory>,
        locks: LockSettings,
    ) -> Self {
        Self {
            store,
            patients,
            locks,
        }
    }

    pub async fn get(&self, encounter_id: EncounterId) -> Result<Encounter> {
        self.store
            .get_encounter(encounter_id)
            .await?
            .ok_or_else(|| Error::not_found("Encounter", encounter_id))
    }

    pub async fn active_for_patient(&self, patient_id: &PatientId) -> Result<Encounter> {
        self.store
            .active_encounter_for_patient(patient_id)
            .await?
            .ok_or_else(|| Error::not_found("Active encounter for patient", patient_id))
    }

    /// Bed events of the encounter in the order they happened
    pub async fn timeline(&self, encounter_id: EncounterId) -> Result<Vec<BedEvent>> {
        self.get(encounter_id).await?;
        self.store.encounter_events(encounter_id).await
    }

    #[tracing::instrument(
        name = "encounter.admit",
        skip(self, request, ctx),
        fields(patient_id = %request.patient_id, bed_id = %request.bed_id, actor = %ctx.actor)
    )]
    pub async fn admit(&self, request: AdmitRequest, ctx: &OperationContext) -> Result<Admission> {
        let result = self.admit_inner(request, ctx).await;
        crate::metrics::record_operation("admit", &result);
        match &result {
            Ok(admission) => tracing::info!(
                encounter_id = %admission.encounter_id,
                ward_id = %admission.ward_id,
                "Patient admitted"
            ),
            Err(e) => tracing::debug!(code = e.code(), error = %e, "Admission rejected"),
        }
        result
    }

    async fn admit_inner(&self, request: AdmitRequest, ctx: &OperationContext) -> Result<Admission> {
        request.validate()?;
        let patient_id = PatientId::new(request.patient_id.trim());
        ensure_known(self.patients.as_ref(), &patient_id).await?;

        let scope = LockScope::new()
            .ward(request.ward_id)
            .bed(request.bed_id)
            .patient(&patient_id);
        let mut unit = UnitOfWork::begin(self.store.as_ref(), scope, self.locks, ctx).await?;
        let outcome = admit_locked(&mut unit, &patient_id, request.ward_id, request.bed_id).await;
        unit.finish(outcome).await
    }

    #[tracing::instrument(
        name = "encounter.transfer",
        skip(self, request, ctx),
        fields(from_bed_id = %request.from_bed_id, to_bed_id = %request.to_bed_id, actor = %ctx.actor)
    )]
    pub async fn transfer(
        &self,
        request: TransferRequest,
        ctx: &OperationContext,
    ) -> Result<Transfer> {
        let result = self.transfer_inner(&request, ctx).await;
        crate::metrics::record_operation("transfer", &result);
        match &result {
            Ok(transfer) => tracing::info!(
                encounter_id = %transfer.encounter_id,
                new_ward_id = %transfer.new_ward_id,
                "Patient transferred"
            ),
            Err(e) => tracing::debug!(code = e.code(), error = %e, "Transfer rejected"),
        }
        result
    }

    async fn transfer_inner(
        &self,
        request: &TransferRequest,
        ctx: &OperationContext,
    ) -> Result<Transfer> {
        let (from, to) = (request.from_bed_id, request.to_bed_id);
        if from == to {
            return Err(Error::Validation(
                "from_bed_id and to_bed_id must differ".to_string(),
            ));
        }

        for attempt in 1..=self.locks.max_attempts {
            let source = self
                .store
                .get_bed(from)
                .await?
                .ok_or_else(|| Error::not_found("Bed", from))?;
            let destination = self
                .store
                .get_bed(to)
                .await?
                .ok_or_else(|| Error::not_found("Bed", to))?;
            let Some(patient_id) = source.current_patient_id.clone() else {
                return Err(Error::InvalidSourceBed {
                    bed_id: from,
                    reason: format!("bed is {}", source.status),
                });
            };

            let scope = LockScope::new()
                .ward(source.ward_id)
                .ward(destination.ward_id)
                .bed(from)
                .bed(to)
                .patient(&patient_id);
            let mut unit = UnitOfWork::begin(self.store.as_ref(), scope, self.locks, ctx).await?;

            let still_held = match unit.tx().bed(from).await {
                Ok(bed) => bed.is_occupied_by(&patient_id),
                Err(e) => return unit.finish(Err(e)).await,
            };
            if !still_held {
                tracing::debug!(attempt, bed_id = %from, "Source bed changed before lock, retrying");
                unit.rollback().await;
                continue;
            }

            let outcome = transfer_locked(&mut unit, &patient_id, from, to, destination.ward_id).await;
            return unit.finish(outcome).await;
        }

        Err(Error::ResourceBusy {
            resource: format!("bed/{from}"),
            waited_ms: 0,
        })
    }

    #[tracing::instrument(
        name = "encounter.discharge",
        skip(self, request, ctx),
        fields(encounter_id = %request.encounter_id, actor = %ctx.actor)
    )]
    pub async fn discharge(
        &self,
        request: DischargeRequest,
        ctx: &OperationContext,
    ) -> Result<Discharge> {
        let result = self.discharge_inner(request, ctx).await;
        crate::metrics::record_operation("discharge", &result);
        match &result {
            Ok(_) => tracing::info!("Patient discharged"),
            Err(e) => tracing::debug!(code = e.code(), error = %e, "Discharge rejected"),
        }
        result
    }

    async fn discharge_inner(
        &self,
        request: DischargeRequest,
        ctx: &OperationContext,
    ) -> Result<Discharge> {
        request.validate()?;
        let summary = request
            .discharge_summary
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        for attempt in 1..=self.locks.max_attempts {
            let encounter = self.get(request.encounter_id).await?;
            if !encounter.is_active() {
                return Err(Error::EncounterNotActive {
                    encounter_id: encounter.id,
                });
            }

            let scope = LockScope::new()
                .ward(encounter.ward_id)
                .bed(encounter.bed_id)
                .patient(&encounter.patient_id);
            let mut unit = UnitOfWork::begin(self.store.as_ref(), scope, self.locks, ctx).await?;

            let locked = match unit.tx().encounter(encounter.id).await {
                Ok(locked) => locked,
                Err(e) => return unit.finish(Err(e)).await,
            };
            if locked.is_active() && locked.bed_id != encounter.bed_id {
                tracing::debug!(attempt, encounter_id = %encounter.id, "Encounter moved before lock, retrying");
                unit.rollback().await;
                continue;
            }

            let outcome = discharge_locked(&mut unit, locked, summary.clone()).await;
            return unit.finish(outcome).await;
        }

        Err(Error::ResourceBusy {
            resource: format!("encounter/{}", request.encounter_id),
            waited_ms: 0,
        })
    }
}

async fn admit_locked(
    unit: &mut UnitOfWork,
    patient_id: &PatientId,
    ward_id: WardId,
    bed_id: BedId,
) -> Result<Admission> {
    let ctx = unit.ctx().clone();

    if let Some(existing) = unit.tx().active_encounter_for_patient(patient_id).await? {
        return Err(Error::PatientAlreadyAdmitted {
            patient_id: patient_id.clone(),
            encounter_id: existing.id,
        });
    }

    let ward = unit.tx().ward(ward_id).await?;
    if !ward.is_active() {
        return Err(Error::WardInactive {
            ward_id,
            reason: "ward is inactive".to_string(),
        });
    }

    let bed = unit.tx().bed(bed_id).await?;
    if bed.ward_id != ward_id {
        return Err(Error::BedWardMismatch {
            bed_id,
            expected: ward_id,
            actual: bed.ward_id,
        });
    }
    if !bed.accepts(patient_id) {
        return Err(Error::BedUnavailable {
            bed_id,
            status: bed.status,
        });
    }

    let encounter = Encounter::admit(
        patient_id.clone(),
        ward_id,
        bed_id,
        ctx.actor.clone(),
        ctx.now,
    );
    unit.tx().insert_encounter(&encounter).await?;
    beds::allocate(
        unit,
        bed_id,
        patient_id,
        Some(encounter.id),
        BedEventKind::Admission,
    )
    .await?;

    Ok(Admission {
        encounter_id: encounter.id,
        ward_id,
        bed_id,
        admitted_at: encounter.admitted_at,
    })
}

async fn transfer_locked(
    unit: &mut UnitOfWork,
    patient_id: &PatientId,
    from: BedId,
    to: BedId,
    to_ward_id: WardId,
) -> Result<Transfer> {
    let now = unit.ctx().now;

    let mut encounter = match unit.tx().active_encounter_for_patient(patient_id).await? {
        Some(encounter) if encounter.bed_id == from => encounter,
        Some(encounter) => {
            return Err(Error::InvariantBreach(format!(
                "bed {from} holds patient {patient_id} whose encounter {} is in bed {}",
                encounter.id, encounter.bed_id
            )));
        }
        None => {
            return Err(Error::InvalidSourceBed {
                bed_id: from,
                reason: format!("patient {patient_id} has no active encounter"),
            });
        }
    };

    let destination_ward = unit.tx().ward(to_ward_id).await?;
    if !destination_ward.is_active() {
        return Err(Error::DestinationUnavailable {
            bed_id: to,
            reason: format!("ward {} is inactive", destination_ward.code),
        });
    }

    let (_, destination) = beds::move_patient(unit, from, to, patient_id, Some(encounter.id)).await?;
    encounter.transfer_to(destination.ward_id, destination.id, now)?;
    unit.tx().update_encounter(&encounter).await?;

    Ok(Transfer {
        encounter_id: encounter.id,
        new_ward_id: destination.ward_id,
        new_bed_id: destination.id,
    })
}

async fn discharge_locked(
    unit: &mut UnitOfWork,
    mut encounter: Encounter,
    summary: Option<String>,
) -> Result<Discharge> {
    let ctx = unit.ctx().clone();
    if !encounter.is_active() {
        return Err(Error::EncounterNotActive {
            encounter_id: encounter.id,
        });
    }

    let bed = unit.tx().bed(encounter.bed_id).await?;
    if !bed.is_occupied_by(&encounter.patient_id) {
        return Err(Error::InvariantBreach(format!(
            "active encounter {} points at bed {} which is {} and not held by {}",
            encounter.id, bed.id, bed.status, encounter.patient_id
        )));
    }

    beds::release(
        unit,
        encounter.bed_id,
        Some(encounter.id),
        BedEventKind::Discharge,
    )
    .await?;
    encounter.discharge(summary, ctx.actor.clone(), ctx.now)?;
    unit.tx().update_encounter(&encounter).await?;

    Ok(Discharge {
        encounter_id: encounter.id,
        discharged_at: ctx.now,
    })
}
