//! Encounter (inpatient stay) records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::ids::{ActorId, BedId, EncounterId, PatientId, WardId};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncounterStatus {
    Admitted,
    Discharged,
}

impl EncounterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncounterStatus::Admitted => "admitted",
            EncounterStatus::Discharged => "discharged",
        }
    }
}

impl FromStr for EncounterStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admitted" => Ok(EncounterStatus::Admitted),
            "discharged" => Ok(EncounterStatus::Discharged),
            other => Err(Error::Internal(format!("unknown encounter status '{other}'"))),
        }
    }
}

/// One continuous inpatient stay. Transfers mutate `ward_id`/`bed_id` in place; the trail of
/// moves lives in the bed history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encounter {
    pub id: EncounterId,
    pub patient_id: PatientId,
    pub ward_id: WardId,
    pub bed_id: BedId,
    pub status: EncounterStatus,
    pub admitted_at: DateTime<Utc>,
    pub admitted_by: ActorId,
    pub discharged_at: Option<DateTime<Utc>>,
    pub discharged_by: Option<ActorId>,
    pub discharge_summary: Option<String>,
    pub transfer_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Encounter {
    pub fn admit(
        patient_id: PatientId,
        ward_id: WardId,
        bed_id: BedId,
        actor: ActorId,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EncounterId::new(),
            patient_id,
            ward_id,
            bed_id,
            status: EncounterStatus::Admitted,
            admitted_at: at,
            admitted_by: actor,
            discharged_at: None,
            discharged_by: None,
            discharge_summary: None,
            transfer_count: 0,
            updated_at: at,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == EncounterStatus::Admitted
    }

    pub fn transfer_to(&mut self, ward_id: WardId, bed_id: BedId, at: DateTime<Utc>) -> Result<()> {
        self.ensure_active()?;
        self.ward_id = ward_id;
        self.bed_id = bed_id;
        self.transfer_count += 1;
        self.updated_at = at;
        Ok(())
    }

    pub fn discharge(
        &mut self,
        summary: Option<String>,
        actor: ActorId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_active()?;
        self.status = EncounterStatus::Discharged;
        self.discharged_at = Some(at);
        self.discharged_by = Some(actor);
        self.discharge_summary = summary;
        self.updated_at = at;
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::EncounterNotActive {
                encounter_id: self.id,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encounter() -> Encounter {
        Encounter::admit(
            PatientId::from("P1"),
            WardId::new(),
            BedId::new(),
            ActorId::from("nurse-1"),
            Utc::now(),
        )
    }

    #[test]
    fn transfer_updates_location_and_counts() {
        let mut encounter = encounter();
        let ward = WardId::new();
        let bed = BedId::new();
        encounter.transfer_to(ward, bed, Utc::now()).unwrap();
        assert_eq!(encounter.ward_id, ward);
        assert_eq!(encounter.bed_id, bed);
        assert_eq!(encounter.transfer_count, 1);
    }

    #[test]
    fn discharged_encounters_are_terminal() {
        let mut encounter = encounter();
        encounter
            .discharge(Some("stable".into()), ActorId::from("dr-1"), Utc::now())
            .unwrap();
        assert!(!encounter.is_active());
        assert!(encounter.discharged_at.is_some());
        assert_eq!(encounter.discharge_summary.as_deref(), Some("stable"));

        let err = encounter
            .discharge(None, ActorId::from("dr-1"), Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::EncounterNotActive { .. }));
        assert!(encounter
            .transfer_to(WardId::new(), BedId::new(), Utc::now())
            .is_err());
    }
}
