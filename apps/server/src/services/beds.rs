//! Bed registry: bed status transitions and their history.
//!
//! The free functions are building blocks that run inside a caller's unit of work; the caller
//! must hold the bed and its ward. [`BedRegistry`] wraps the administrative transitions in their
//! own units of work.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::{
    audit::BedChange,
    patients::{ensure_known, PatientDirectory},
    unit::UnitOfWork,
    LockSettings,
};
use crate::{
    db::{LockScope, OccupancyStore},
    models::{
        Bed, BedEvent, BedEventKind, BedId, EncounterId, OperationContext, PatientId,
    },
    Error, Result,
};

/// Place `patient_id` in a bed that is available or reserved for them.
pub async fn allocate(
    unit: &mut UnitOfWork,
    bed_id: BedId,
    patient_id: &PatientId,
    encounter_id: Option<EncounterId>,
    kind: BedEventKind,
) -> Result<Bed> {
    let now = unit.ctx().now;
    let mut bed = unit.tx().bed(bed_id).await?;
    let from = bed.allocate(patient_id, now)?;
    unit.tx().update_bed(&bed).await?;
    unit.record_bed_change(BedChange {
        bed: &bed,
        kind,
        from,
        patient_id: Some(patient_id),
        encounter_id,
    })
    .await?;
    Ok(bed)
}

/// Free an occupied bed, returning it together with the patient who left.
pub async fn release(
    unit: &mut UnitOfWork,
    bed_id: BedId,
    encounter_id: Option<EncounterId>,
    kind: BedEventKind,
) -> Result<(Bed, PatientId)> {
    let now = unit.ctx().now;
    let mut bed = unit.tx().bed(bed_id).await?;
    let from = bed.status;
    let patient_id = bed.release(now)?;
    unit.tx().update_bed(&bed).await?;
    unit.record_bed_change(BedChange {
        bed: &bed,
        kind,
        from,
        patient_id: Some(&patient_id),
        encounter_id,
    })
    .await?;
    Ok((bed, patient_id))
}

/// Release `from` and allocate `to` for the same patient. Both beds are checked before either is
/// written, so a rejected move leaves the source untouched.
pub async fn move_patient(
    unit: &mut UnitOfWork,
    from_bed_id: BedId,
    to_bed_id: BedId,
    patient_id: &PatientId,
    encounter_id: Option<EncounterId>,
) -> Result<(Bed, Bed)> {
    if from_bed_id == to_bed_id {
        return Err(Error::Validation(
            "source and destination bed must differ".to_string(),
        ));
    }

    let source = unit.tx().bed(from_bed_id).await?;
    if !source.is_occupied_by(patient_id) {
        return Err(Error::InvalidSourceBed {
            bed_id: from_bed_id,
            reason: format!("bed is {} and not held by patient {}", source.status, patient_id),
        });
    }

    let destination = unit.tx().bed(to_bed_id).await?;
    if !destination.accepts(patient_id) {
        return Err(Error::DestinationUnavailable {
            bed_id: to_bed_id,
            reason: format!("bed is {}", destination.status),
        });
    }

    let (source, _) = release(unit, from_bed_id, encounter_id, BedEventKind::TransferOut).await?;
    let destination = allocate(
        unit,
        to_bed_id,
        patient_id,
        encounter_id,
        BedEventKind::TransferIn,
    )
    .await?;
    Ok((source, destination))
}

/// Standalone bed operations, each in its own unit of work.
#[derive(Clone)]
pub struct BedRegistry {
    store: Arc<dyn OccupancyStore>,
    patients: Arc<dyn PatientDirectory>,
    locks: LockSettings,
}

impl BedRegistry {
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

    pub async fn get(&self, bed_id: BedId) -> Result<Bed> {
        self.store
            .get_bed(bed_id)
            .await?
            .ok_or_else(|| Error::not_found("Bed", bed_id))
    }

    /// History survives bed removal, so a removed bed with history still answers.
    pub async fn history(&self, bed_id: BedId) -> Result<Vec<BedEvent>> {
        let history = self.store.bed_history(bed_id).await?;
        if history.is_empty() && self.store.get_bed(bed_id).await?.is_none() {
            return Err(Error::not_found("Bed", bed_id));
        }
        Ok(history)
    }

    pub async fn set_maintenance(&self, bed_id: BedId, ctx: &OperationContext) -> Result<Bed> {
        self.transition(
            "set_maintenance",
            bed_id,
            BedEventKind::MaintenanceStarted,
            ctx,
            |bed, at| bed.start_maintenance(at).map(|_| None),
        )
        .await
    }

    pub async fn clear_maintenance(&self, bed_id: BedId, ctx: &OperationContext) -> Result<Bed> {
        self.transition(
            "clear_maintenance",
            bed_id,
            BedEventKind::MaintenanceEnded,
            ctx,
            |bed, at| bed.end_maintenance(at).map(|_| None),
        )
        .await
    }

    pub async fn reserve(
        &self,
        bed_id: BedId,
        patient_id: &PatientId,
        ctx: &OperationContext,
    ) -> Result<Bed> {
        let patient = PatientId::new(patient_id.as_str().trim());
        ensure_known(self.patients.as_ref(), &patient).await?;
        self.transition(
            "reserve",
            bed_id,
            BedEventKind::Reserved,
            ctx,
            move |bed, at| {
                bed.reserve(&patient, at)?;
                Ok(Some(patient))
            },
        )
        .await
    }

    pub async fn cancel_reservation(&self, bed_id: BedId, ctx: &OperationContext) -> Result<Bed> {
        self.transition(
            "cancel_reservation",
            bed_id,
            BedEventKind::ReservationCancelled,
            ctx,
            |bed, at| bed.cancel_reservation(at),
        )
        .await
    }

    /// Record or clear the forecast discharge time of an occupied bed.
    pub async fn set_expected_vacancy(
        &self,
        bed_id: BedId,
        expected: Option<DateTime<Utc>>,
        ctx: &OperationContext,
    ) -> Result<Bed> {
        self.transition(
            "set_expected_vacancy",
            bed_id,
            BedEventKind::VacancyForecast,
            ctx,
            move |bed, at| {
                bed.set_expected_vacancy(expected, at)?;
                Ok(bed.current_patient_id.clone())
            },
        )
        .await
    }

    /// Run one bed transition under the bed and ward locks. `apply` returns the patient the
    /// event concerns, if any.
    async fn transition<F>(
        &self,
        operation: &'static str,
        bed_id: BedId,
        kind: BedEventKind,
        ctx: &OperationContext,
        apply: F,
    ) -> Result<Bed>
    where
        F: FnOnce(&mut Bed, DateTime<Utc>) -> Result<Option<PatientId>> + Send,
    {
        let result = async {
            // A bed never changes ward, so the unlocked read is enough to build the scope.
            let ward_id = self.get(bed_id).await?.ward_id;
            let scope = LockScope::new().ward(ward_id).bed(bed_id);
            let mut unit = UnitOfWork::begin(self.store.as_ref(), scope, self.locks, ctx).await?;

            let outcome = async {
                let mut bed = unit.tx().bed(bed_id).await?;
                let from = bed.status;
                let patient = apply(&mut bed, ctx.now)?;
                unit.tx().update_bed(&bed).await?;
                unit.record_bed_change(BedChange {
                    bed: &bed,
                    kind,
                    from,
                    patient_id: patient.as_ref(),
                    encounter_id: None,
                })
                .await?;
                Ok(bed)
            }
            .await;
            unit.finish(outcome).await
        }
        .await;

        crate::metrics::record_operation(operation, &result);
        if let Ok(bed) = &result {
            tracing::info!(
                bed_id = %bed.id,
                ward_id = %bed.ward_id,
                status = %bed.status,
                operation,
                "Bed updated"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryOccupancyStore;
    use crate::models::{BedStatus, Ward};
    use crate::services::OpenPatientDirectory;

    async fn seeded_ward(store: &MemoryOccupancyStore, beds: u32) -> (Ward, Vec<Bed>) {
        let ctx = OperationContext::system();
        let mut ward = Ward::new("T", "Test", None, ctx.now);
        let beds: Vec<Bed> = (1..=beds)
            .map(|n| Bed::new(ward.id, n, ward.bed_code(n), ctx.now))
            .collect();
        ward.total_beds = beds.len() as u32;

        let mut scope = LockScope::new().ward(ward.id);
        for bed in &beds {
            scope = scope.bed(bed.id);
        }
        let mut unit = UnitOfWork::begin(store, scope, LockSettings::default(), &ctx)
            .await
            .unwrap();
        unit.tx().insert_ward(&ward).await.unwrap();
        for bed in &beds {
            unit.tx().insert_bed(bed).await.unwrap();
        }
        unit.touch_ward(ward.id);
        unit.commit().await.unwrap();
        (ward, beds)
    }

    fn registry(store: &MemoryOccupancyStore) -> BedRegistry {
        BedRegistry::new(
            Arc::new(store.clone()),
            Arc::new(OpenPatientDirectory),
            LockSettings::default(),
        )
    }

    #[tokio::test]
    async fn maintenance_round_trip_updates_ward_counter() {
        let store = MemoryOccupancyStore::new();
        let (ward, beds) = seeded_ward(&store, 2).await;
        let registry = registry(&store);
        let ctx = OperationContext::new("porter-1");

        let bed = registry.set_maintenance(beds[0].id, &ctx).await.unwrap();
        assert_eq!(bed.status, BedStatus::Maintenance);
        let stored = store.get_ward(ward.id).await.unwrap().unwrap();
        assert_eq!(stored.available_beds, 1);

        let err = registry.set_maintenance(beds[0].id, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::InvalidBedTransition { .. }));

        registry.clear_maintenance(beds[0].id, &ctx).await.unwrap();
        let stored = store.get_ward(ward.id).await.unwrap().unwrap();
        assert_eq!(stored.available_beds, 2);

        let history = registry.history(beds[0].id).await.unwrap();
        let kinds: Vec<BedEventKind> = history.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![BedEventKind::MaintenanceStarted, BedEventKind::MaintenanceEnded]
        );
        assert_eq!(history[0].actor.as_str(), "porter-1");
    }

    #[tokio::test]
    async fn reservation_is_not_available_until_cancelled() {
        let store = MemoryOccupancyStore::new();
        let (ward, beds) = seeded_ward(&store, 1).await;
        let registry = registry(&store);
        let ctx = OperationContext::system();

        let bed = registry
            .reserve(beds[0].id, &PatientId::from("P7"), &ctx)
            .await
            .unwrap();
        assert_eq!(bed.reserved_for, Some(PatientId::from("P7")));
        assert_eq!(
            store.get_ward(ward.id).await.unwrap().unwrap().available_beds,
            0
        );

        let bed = registry.cancel_reservation(beds[0].id, &ctx).await.unwrap();
        assert_eq!(bed.status, BedStatus::Available);
        assert!(bed.reserved_for.is_none());
    }

    #[tokio::test]
    async fn failed_move_leaves_source_occupied() {
        let store = MemoryOccupancyStore::new();
        let (ward, beds) = seeded_ward(&store, 2).await;
        let ctx = OperationContext::system();
        let patient = PatientId::from("P1");
        let other = PatientId::from("P2");

        let scope = LockScope::new().ward(ward.id).bed(beds[0].id).bed(beds[1].id);
        let mut unit = UnitOfWork::begin(&store, scope.clone(), LockSettings::default(), &ctx)
            .await
            .unwrap();
        allocate(&mut unit, beds[0].id, &patient, None, BedEventKind::Admission)
            .await
            .unwrap();
        allocate(&mut unit, beds[1].id, &other, None, BedEventKind::Admission)
            .await
            .unwrap();
        unit.commit().await.unwrap();

        let mut unit = UnitOfWork::begin(&store, scope, LockSettings::default(), &ctx)
            .await
            .unwrap();
        let outcome = move_patient(&mut unit, beds[0].id, beds[1].id, &patient, None).await;
        let err = unit.finish(outcome).await.unwrap_err();
        assert!(matches!(err, Error::DestinationUnavailable { .. }));

        let source = store.get_bed(beds[0].id).await.unwrap().unwrap();
        assert!(source.is_occupied_by(&patient));
        assert_eq!(store.bed_history(beds[0].id).await.unwrap().len(), 1);
    }
}
