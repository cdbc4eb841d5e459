//! Patient directory collaborator.
//!
//! Patient master data lives elsewhere; the occupancy engine only needs to know whether an id
//! refers to a known patient.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::{models::PatientId, Error, Result};

#[async_trait]
pub trait PatientDirectory: Send + Sync {
    async fn exists(&self, patient_id: &PatientId) -> Result<bool>;
}

/// Accepts every non-blank id.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenPatientDirectory;

#[async_trait]
impl PatientDirectory for OpenPatientDirectory {
    async fn exists(&self, patient_id: &PatientId) -> Result<bool> {
        Ok(!patient_id.is_blank())
    }
}

/// Fixed allow-list, used by deployments that mirror the patient index and by tests.
#[derive(Debug, Clone, Default)]
pub struct StaticPatientDirectory {
    known: HashSet<PatientId>,
}

impl StaticPatientDirectory {
    pub fn new<I, P>(patients: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PatientId>,
    {
        Self {
            known: patients.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PatientDirectory for StaticPatientDirectory {
    async fn exists(&self, patient_id: &PatientId) -> Result<bool> {
        Ok(self.known.contains(patient_id))
    }
}

/// Blank ids are a validation error; ids the directory does not know are `UnknownPatient`.
pub async fn ensure_known(directory: &dyn PatientDirectory, patient_id: &PatientId) -> Result<()> {
    if patient_id.is_blank() {
        return Err(Error::Validation("patient_id must not be blank".to_string()));
    }
    if !directory.exists(patient_id).await? {
        return Err(Error::UnknownPatient(patient_id.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_directory_rejects_blank_ids() {
        let directory = OpenPatientDirectory;
        let err = ensure_known(&directory, &PatientId::from("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(ensure_known(&directory, &PatientId::from("P1")).await.is_ok());
    }

    #[tokio::test]
    async fn static_directory_only_knows_listed_patients() {
        let directory = StaticPatientDirectory::new(["P1", "P2"]);
        assert!(ensure_known(&directory, &PatientId::from("P2")).await.is_ok());
        let err = ensure_known(&directory, &PatientId::from("P9"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPatient(ref p) if p.as_str() == "P9"));
    }
}
