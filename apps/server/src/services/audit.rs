//! Bed history and ledger recording.
//!
//! Events are appended inside the unit of work that caused them, so history commits or rolls
//! back with the change itself. Once the unit commits, the trail is published on the `audit`
//! tracing target.

use crate::{
    db::OccupancyTx,
    models::{
        Adjustment, Bed, BedEvent, BedEventId, BedEventKind, BedStatus, EncounterId, LedgerEntry,
        OperationContext, PatientId,
    },
    Error, Result,
};

/// One bed status change, described after the bed has been mutated.
#[derive(Debug, Clone, Copy)]
pub struct BedChange<'a> {
    pub bed: &'a Bed,
    pub kind: BedEventKind,
    pub from: BedStatus,
    pub patient_id: Option<&'a PatientId>,
    pub encounter_id: Option<EncounterId>,
}

/// Everything a unit of work appended to history
#[derive(Debug, Default)]
pub struct AuditTrail {
    bed_events: Vec<BedEvent>,
    ledger_entries: Vec<LedgerEntry>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bed_events(&self) -> &[BedEvent] {
        &self.bed_events
    }

    pub fn ledger_entries(&self) -> &[LedgerEntry] {
        &self.ledger_entries
    }

    pub async fn record_bed_change(
        &mut self,
        tx: &mut dyn OccupancyTx,
        change: BedChange<'_>,
        ctx: &OperationContext,
    ) -> Result<BedEvent> {
        let event = BedEvent {
            id: BedEventId::new(),
            bed_id: change.bed.id,
            ward_id: change.bed.ward_id,
            kind: change.kind,
            from_status: change.from,
            to_status: change.bed.status,
            patient_id: change.patient_id.cloned(),
            encounter_id: change.encounter_id,
            actor: ctx.actor.clone(),
            at: ctx.now,
        };
        tx.append_bed_event(&event).await?;
        self.bed_events.push(event.clone());
        Ok(event)
    }

    /// Append a ledger entry for a planned adjustment.
    ///
    /// The snapshot is checked against the newest persisted entry of the subject before it is
    /// written; a mismatch means the counter and its ledger have drifted apart.
    pub async fn record_adjustment(
        &mut self,
        tx: &mut dyn OccupancyTx,
        adjustment: &Adjustment,
        reason: &str,
        ctx: &OperationContext,
    ) -> Result<LedgerEntry> {
        let last = tx.last_ledger_balance(adjustment.subject).await?.unwrap_or(0);
        if last != adjustment.previous {
            return Err(Error::InvariantBreach(format!(
                "{} has balance {} but its last ledger entry records {}",
                adjustment.subject, adjustment.previous, last
            )));
        }
        let entry = LedgerEntry::record(adjustment, reason, ctx.actor.clone(), ctx.now)?;
        tx.append_ledger_entry(&entry).await?;
        self.ledger_entries.push(entry.clone());
        Ok(entry)
    }

    /// Emit the committed trail.
    pub fn publish(&self, ctx: &OperationContext) {
        for event in &self.bed_events {
            tracing::info!(
                target: "audit",
                event_id = %event.id,
                kind = event.kind.as_str(),
                bed_id = %event.bed_id,
                ward_id = %event.ward_id,
                from = %event.from_status,
                to = %event.to_status,
                patient_id = event.patient_id.as_ref().map(|p| p.as_str()),
                encounter_id = event.encounter_id.map(|e| e.to_string()),
                actor = %event.actor,
                request_id = ctx.request_id.as_deref(),
                "Bed status changed"
            );
        }
        for entry in &self.ledger_entries {
            tracing::info!(
                target: "audit",
                entry_id = %entry.id,
                subject = %entry.subject,
                delta = entry.delta,
                balance_after = entry.balance_after,
                reason = %entry.reason,
                actor = %entry.actor,
                request_id = ctx.request_id.as_deref(),
                "Ledger adjusted"
            );
        }
    }
}
