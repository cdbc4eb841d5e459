//! Ward aggregate records and occupancy summaries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::bed::{Bed, BedStatus};
use super::ids::WardId;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WardStatus {
    Active,
    Inactive,
}

impl WardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WardStatus::Active => "active",
            WardStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for WardStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(WardStatus::Active),
            "inactive" => Ok(WardStatus::Inactive),
            other => Err(Error::Validation(format!("unknown ward status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ward {
    pub id: WardId,
    pub code: String,
    pub name: String,
    pub department: Option<String>,
    /// Declared capacity; always equals the number of bed records in the ward
    pub total_beds: u32,
    /// Cached count of beds with status `available`, refreshed in every unit of work
    /// that touches one of the ward's beds
    pub available_beds: u32,
    pub status: WardStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ward {
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        department: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WardId::new(),
            code: code.into(),
            name: name.into(),
            department,
            total_beds: 0,
            available_beds: 0,
            status: WardStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == WardStatus::Active
    }

    /// True iff the ward is active and has at least one available bed.
    pub fn can_admit(&self) -> bool {
        self.is_active() && self.available_beds > 0
    }

    /// Code for the n-th bed of this ward, e.g. `ICU-03`.
    pub fn bed_code(&self, number: u32) -> String {
        format!("{}-{:02}", self.code, number)
    }
}

/// Point-in-time breakdown of a ward's beds by status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WardOccupancy {
    pub ward_id: WardId,
    pub code: String,
    pub status: WardStatus,
    pub total_beds: u32,
    pub available: u32,
    pub occupied: u32,
    pub reserved: u32,
    pub maintenance: u32,
    /// Occupied beds over beds in service (maintenance excluded)
    pub occupancy_rate: f64,
}

impl WardOccupancy {
    pub fn from_beds(ward: &Ward, beds: &[Bed]) -> Self {
        let count = |status: BedStatus| beds.iter().filter(|b| b.status == status).count() as u32;
        let available = count(BedStatus::Available);
        let occupied = count(BedStatus::Occupied);
        let reserved = count(BedStatus::Reserved);
        let maintenance = count(BedStatus::Maintenance);
        let in_service = available + occupied + reserved;
        let occupancy_rate = if in_service == 0 {
            0.0
        } else {
            occupied as f64 / in_service as f64
        };

        Self {
            ward_id: ward.id,
            code: ward.code.clone(),
            status: ward.status,
            total_beds: beds.len() as u32,
            available,
            occupied,
            reserved,
            maintenance,
            occupancy_rate,
        }
    }

    /// Same rule as [`Ward::can_admit`], over the counted beds rather than the stored counter
    pub fn can_admit(&self) -> bool {
        self.status == WardStatus::Active && self.available > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PatientId;

    #[test]
    fn inactive_or_full_wards_cannot_admit() {
        let mut ward = Ward::new("ICU", "Intensive Care", None, Utc::now());
        assert!(!ward.can_admit());

        ward.total_beds = 2;
        ward.available_beds = 1;
        assert!(ward.can_admit());

        ward.status = WardStatus::Inactive;
        assert!(!ward.can_admit());
    }

    #[test]
    fn occupancy_excludes_maintenance_from_rate() {
        let ward = Ward::new("MED", "Medical", None, Utc::now());
        let now = Utc::now();
        let mut beds: Vec<Bed> = (1..=4)
            .map(|n| Bed::new(ward.id, n, ward.bed_code(n), now))
            .collect();
        beds[0].allocate(&PatientId::from("P1"), now).unwrap();
        beds[1].start_maintenance(now).unwrap();

        let occupancy = WardOccupancy::from_beds(&ward, &beds);
        assert_eq!(occupancy.total_beds, 4);
        assert_eq!(occupancy.available, 2);
        assert_eq!(occupancy.occupied, 1);
        assert_eq!(occupancy.maintenance, 1);
        assert!((occupancy.occupancy_rate - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn counted_occupancy_decides_admission() {
        let mut ward = Ward::new("MED", "Medical", None, Utc::now());
        let now = Utc::now();
        let mut beds = vec![Bed::new(ward.id, 1, ward.bed_code(1), now)];

        // Stored counter is still zero; the counted bed decides
        assert!(WardOccupancy::from_beds(&ward, &beds).can_admit());

        beds[0].allocate(&PatientId::from("P1"), now).unwrap();
        assert!(!WardOccupancy::from_beds(&ward, &beds).can_admit());

        beds[0].release(now).unwrap();
        ward.status = WardStatus::Inactive;
        assert!(!WardOccupancy::from_beds(&ward, &beds).can_admit());
    }

    #[test]
    fn bed_codes_are_zero_padded() {
        let ward = Ward::new("ICU", "Intensive Care", None, Utc::now());
        assert_eq!(ward.bed_code(3), "ICU-03");
        assert_eq!(ward.bed_code(12), "ICU-12");
    }
}
