//! Bed records, status transitions and bed history events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{ActorId, BedEventId, BedId, EncounterId, PatientId, WardId};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BedStatus {
    Available,
    Occupied,
    Maintenance,
    Reserved,
}

impl BedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BedStatus::Available => "available",
            BedStatus::Occupied => "occupied",
            BedStatus::Maintenance => "maintenance",
            BedStatus::Reserved => "reserved",
        }
    }
}

impl fmt::Display for BedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BedStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(BedStatus::Available),
            "occupied" => Ok(BedStatus::Occupied),
            "maintenance" => Ok(BedStatus::Maintenance),
            "reserved" => Ok(BedStatus::Reserved),
            other => Err(Error::Internal(format!("unknown bed status '{other}'"))),
        }
    }
}

/// A single allocatable bed. Belongs to exactly one ward for its lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bed {
    pub id: BedId,
    pub ward_id: WardId,
    /// 1-based position within the ward
    pub number: u32,
    pub code: String,
    pub status: BedStatus,
    /// Set iff `status == Occupied`
    pub current_patient_id: Option<PatientId>,
    /// Set iff `status == Reserved`
    pub reserved_for: Option<PatientId>,
    pub occupied_at: Option<DateTime<Utc>>,
    pub expected_vacancy_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Bed {
    pub fn new(ward_id: WardId, number: u32, code: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: BedId::new(),
            ward_id,
            number,
            code: code.into(),
            status: BedStatus::Available,
            current_patient_id: None,
            reserved_for: None,
            occupied_at: None,
            expected_vacancy_at: None,
            updated_at: now,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == BedStatus::Available
    }

    pub fn is_occupied_by(&self, patient_id: &PatientId) -> bool {
        self.status == BedStatus::Occupied && self.current_patient_id.as_ref() == Some(patient_id)
    }

    /// Whether `patient_id` may be placed here: the bed is free, or held for that patient.
    pub fn accepts(&self, patient_id: &PatientId) -> bool {
        match self.status {
            BedStatus::Available => true,
            BedStatus::Reserved => self.reserved_for.as_ref() == Some(patient_id),
            BedStatus::Occupied | BedStatus::Maintenance => false,
        }
    }

    /// Place a patient in the bed. Returns the status the bed left.
    pub fn allocate(&mut self, patient_id: &PatientId, at: DateTime<Utc>) -> Result<BedStatus> {
        if !self.accepts(patient_id) {
            return Err(Error::BedUnavailable {
                bed_id: self.id,
                status: self.status,
            });
        }
        let from = self.status;
        self.status = BedStatus::Occupied;
        self.current_patient_id = Some(patient_id.clone());
        self.reserved_for = None;
        self.occupied_at = Some(at);
        self.expected_vacancy_at = None;
        self.updated_at = at;
        Ok(from)
    }

    /// Free an occupied bed. Returns the patient who left it.
    pub fn release(&mut self, at: DateTime<Utc>) -> Result<PatientId> {
        let patient = match (self.status, self.current_patient_id.take()) {
            (BedStatus::Occupied, Some(patient)) => patient,
            (status, previous) => {
                self.current_patient_id = previous;
                return Err(Error::BedNotOccupied {
                    bed_id: self.id,
                    status,
                });
            }
        };
        self.status = BedStatus::Available;
        self.occupied_at = None;
        self.expected_vacancy_at = None;
        self.updated_at = at;
        Ok(patient)
    }

    pub fn start_maintenance(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(BedStatus::Available, BedStatus::Maintenance, at)
    }

    pub fn end_maintenance(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(BedStatus::Maintenance, BedStatus::Available, at)
    }

    pub fn reserve(&mut self, patient_id: &PatientId, at: DateTime<Utc>) -> Result<()> {
        self.transition(BedStatus::Available, BedStatus::Reserved, at)?;
        self.reserved_for = Some(patient_id.clone());
        Ok(())
    }

    /// Drop a reservation. Returns the patient the bed was held for.
    pub fn cancel_reservation(&mut self, at: DateTime<Utc>) -> Result<Option<PatientId>> {
        self.transition(BedStatus::Reserved, BedStatus::Available, at)?;
        Ok(self.reserved_for.take())
    }

    pub fn set_expected_vacancy(
        &mut self,
        expected: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != BedStatus::Occupied {
            return Err(Error::BedNotOccupied {
                bed_id: self.id,
                status: self.status,
            });
        }
        if let (Some(expected), Some(occupied_at)) = (expected, self.occupied_at) {
            if expected < occupied_at {
                return Err(Error::Validation(
                    "expected vacancy cannot precede occupation".to_string(),
                ));
            }
        }
        self.expected_vacancy_at = expected;
        self.updated_at = at;
        Ok(())
    }

    fn transition(&mut self, from: BedStatus, to: BedStatus, at: DateTime<Utc>) -> Result<()> {
        if self.status != from {
            return Err(Error::InvalidBedTransition {
                bed_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = at;
        Ok(())
    }

    /// Occupant and reservation fields must agree with the status.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let occupied = self.status == BedStatus::Occupied;
        if occupied != self.current_patient_id.is_some() {
            return Err(format!(
                "bed {} has status {} but current_patient_id {:?}",
                self.id, self.status, self.current_patient_id
            ));
        }
        let reserved = self.status == BedStatus::Reserved;
        if reserved != self.reserved_for.is_some() {
            return Err(format!(
                "bed {} has status {} but reserved_for {:?}",
                self.id, self.status, self.reserved_for
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BedEventKind {
    Admission,
    TransferOut,
    TransferIn,
    Discharge,
    MaintenanceStarted,
    MaintenanceEnded,
    Reserved,
    ReservationCancelled,
    VacancyForecast,
}

impl BedEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BedEventKind::Admission => "admission",
            BedEventKind::TransferOut => "transfer_out",
            BedEventKind::TransferIn => "transfer_in",
            BedEventKind::Discharge => "discharge",
            BedEventKind::MaintenanceStarted => "maintenance_started",
            BedEventKind::MaintenanceEnded => "maintenance_ended",
            BedEventKind::Reserved => "reserved",
            BedEventKind::ReservationCancelled => "reservation_cancelled",
            BedEventKind::VacancyForecast => "vacancy_forecast",
        }
    }
}

impl FromStr for BedEventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "admission" => BedEventKind::Admission,
            "transfer_out" => BedEventKind::TransferOut,
            "transfer_in" => BedEventKind::TransferIn,
            "discharge" => BedEventKind::Discharge,
            "maintenance_started" => BedEventKind::MaintenanceStarted,
            "maintenance_ended" => BedEventKind::MaintenanceEnded,
            "reserved" => BedEventKind::Reserved,
            "reservation_cancelled" => BedEventKind::ReservationCancelled,
            "vacancy_forecast" => BedEventKind::VacancyForecast,
            other => return Err(Error::Internal(format!("unknown bed event kind '{other}'"))),
        })
    }
}

/// Immutable entry in a bed's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BedEvent {
    pub id: BedEventId,
    pub bed_id: BedId,
    pub ward_id: WardId,
    pub kind: BedEventKind,
    pub from_status: BedStatus,
    pub to_status: BedStatus,
    pub patient_id: Option<PatientId>,
    pub encounter_id: Option<EncounterId>,
    pub actor: ActorId,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bed() -> Bed {
        Bed::new(WardId::new(), 1, "ICU-01", Utc::now())
    }

    #[test]
    fn allocate_then_release_round_trips_status() {
        let mut bed = bed();
        let patient = PatientId::from("P1");

        let from = bed.allocate(&patient, Utc::now()).unwrap();
        assert_eq!(from, BedStatus::Available);
        assert!(bed.is_occupied_by(&patient));
        assert!(bed.occupied_at.is_some());
        assert!(bed.check_invariants().is_ok());

        let left = bed.release(Utc::now()).unwrap();
        assert_eq!(left, patient);
        assert!(bed.is_available());
        assert!(bed.current_patient_id.is_none());
        assert!(bed.occupied_at.is_none());
        assert!(bed.check_invariants().is_ok());
    }

    #[test]
    fn occupied_bed_rejects_second_allocation() {
        let mut bed = bed();
        bed.allocate(&PatientId::from("P1"), Utc::now()).unwrap();

        let err = bed.allocate(&PatientId::from("P2"), Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            Error::BedUnavailable {
                status: BedStatus::Occupied,
                ..
            }
        ));
        assert!(bed.is_occupied_by(&PatientId::from("P1")));
    }

    #[test]
    fn release_of_free_bed_keeps_state() {
        let mut bed = bed();
        let err = bed.release(Utc::now()).unwrap_err();
        assert!(matches!(err, Error::BedNotOccupied { .. }));
        assert!(bed.is_available());
        assert!(bed.check_invariants().is_ok());
    }

    #[test]
    fn maintenance_only_from_available() {
        let mut bed = bed();
        bed.start_maintenance(Utc::now()).unwrap();
        assert_eq!(bed.status, BedStatus::Maintenance);
        assert!(bed.allocate(&PatientId::from("P1"), Utc::now()).is_err());

        let err = bed.start_maintenance(Utc::now()).unwrap_err();
        assert!(matches!(err, Error::InvalidBedTransition { .. }));

        bed.end_maintenance(Utc::now()).unwrap();
        assert!(bed.is_available());

        bed.allocate(&PatientId::from("P1"), Utc::now()).unwrap();
        assert!(bed.start_maintenance(Utc::now()).is_err());
    }

    #[test]
    fn reservation_admits_only_its_patient() {
        let mut bed = bed();
        let holder = PatientId::from("P1");
        bed.reserve(&holder, Utc::now()).unwrap();
        assert!(bed.check_invariants().is_ok());

        assert!(bed.allocate(&PatientId::from("P2"), Utc::now()).is_err());
        let from = bed.allocate(&holder, Utc::now()).unwrap();
        assert_eq!(from, BedStatus::Reserved);
        assert!(bed.reserved_for.is_none());
        assert!(bed.check_invariants().is_ok());
    }

    #[test]
    fn cancelled_reservation_frees_the_bed() {
        let mut bed = bed();
        bed.reserve(&PatientId::from("P1"), Utc::now()).unwrap();
        let holder = bed.cancel_reservation(Utc::now()).unwrap();
        assert_eq!(holder, Some(PatientId::from("P1")));
        assert!(bed.is_available());
        assert!(bed.check_invariants().is_ok());
    }

    #[test]
    fn expected_vacancy_requires_occupant() {
        let mut bed = bed();
        let later = Utc::now() + chrono::Duration::hours(4);
        assert!(bed.set_expected_vacancy(Some(later), Utc::now()).is_err());

        bed.allocate(&PatientId::from("P1"), Utc::now()).unwrap();
        bed.set_expected_vacancy(Some(later), Utc::now()).unwrap();
        assert_eq!(bed.expected_vacancy_at, Some(later));

        let earlier = Utc::now() - chrono::Duration::days(1);
        assert!(matches!(
            bed.set_expected_vacancy(Some(earlier), Utc::now()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn status_strings_parse_back() {
        for status in [
            BedStatus::Available,
            BedStatus::Occupied,
            BedStatus::Maintenance,
            BedStatus::Reserved,
        ] {
            assert_eq!(status.as_str().parse::<BedStatus>().unwrap(), status);
        }
        assert!("broken".parse::<BedStatus>().is_err());
    }
}
