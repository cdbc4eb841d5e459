//! Error types for the occupancy service

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::models::{BedId, BedStatus, EncounterId, PatientId, WardId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown patient: {0}")]
    UnknownPatient(PatientId),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Bed {bed_id} is not available (status: {status})")]
    BedUnavailable { bed_id: BedId, status: BedStatus },

    #[error("Bed {bed_id} is not occupied (status: {status})")]
    BedNotOccupied { bed_id: BedId, status: BedStatus },

    #[error("Patient {patient_id} already has an active encounter {encounter_id}")]
    PatientAlreadyAdmitted {
        patient_id: PatientId,
        encounter_id: EncounterId,
    },

    #[error("Ward {ward_id} is not accepting admissions: {reason}")]
    WardInactive { ward_id: WardId, reason: String },

    #[error("Bed {bed_id} belongs to ward {actual}, not {expected}")]
    BedWardMismatch {
        bed_id: BedId,
        expected: WardId,
        actual: WardId,
    },

    #[error("Invalid source bed {bed_id}: {reason}")]
    InvalidSourceBed { bed_id: BedId, reason: String },

    #[error("Destination bed {bed_id} is unavailable: {reason}")]
    DestinationUnavailable { bed_id: BedId, reason: String },

    #[error("Encounter {encounter_id} is not active")]
    EncounterNotActive { encounter_id: EncounterId },

    #[error("Bed {bed_id} cannot move from {from} to {to}")]
    InvalidBedTransition {
        bed_id: BedId,
        from: BedStatus,
        to: BedStatus,
    },

    #[error("Ward {ward_id} cannot shrink by {requested} beds: only {removable} available beds can be removed")]
    CapacityInUse {
        ward_id: WardId,
        requested: u32,
        removable: u32,
    },

    #[error("Adjustment of {delta} on {subject} would go negative (balance {balance})")]
    WouldGoNegative {
        subject: String,
        balance: i64,
        delta: i64,
    },

    #[error("Adjustment of {delta} on {subject} would exceed maximum {maximum} (balance {balance})")]
    WouldExceedMaximum {
        subject: String,
        balance: i64,
        delta: i64,
        maximum: i64,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Resource busy: {resource} (waited {waited_ms} ms)")]
    ResourceBusy { resource: String, waited_ms: u64 },

    #[error("Invariant breach: {0}")]
    InvariantBreach(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Error taxonomy used by callers to decide on retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    NotFound,
    Conflict,
    Contention,
    Invariant,
    Internal,
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Error::Database(_) => "DATABASE_ERROR",
            Error::Validation(_) => "VALIDATION_FAILED",
            Error::UnknownPatient(_) => "UNKNOWN_PATIENT",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::BedUnavailable { .. } => "BED_UNAVAILABLE",
            Error::BedNotOccupied { .. } => "BED_NOT_OCCUPIED",
            Error::PatientAlreadyAdmitted { .. } => "PATIENT_ALREADY_ADMITTED",
            Error::WardInactive { .. } => "WARD_INACTIVE",
            Error::BedWardMismatch { .. } => "BED_WARD_MISMATCH",
            Error::InvalidSourceBed { .. } => "INVALID_SOURCE_BED",
            Error::DestinationUnavailable { .. } => "DESTINATION_UNAVAILABLE",
            Error::EncounterNotActive { .. } => "ENCOUNTER_NOT_ACTIVE",
            Error::InvalidBedTransition { .. } => "INVALID_BED_TRANSITION",
            Error::CapacityInUse { .. } => "CAPACITY_IN_USE",
            Error::WouldGoNegative { .. } => "WOULD_GO_NEGATIVE",
            Error::WouldExceedMaximum { .. } => "WOULD_EXCEED_MAXIMUM",
            Error::Conflict(_) => "CONFLICT",
            Error::ResourceBusy { .. } => "RESOURCE_BUSY",
            Error::InvariantBreach(_) => "INVARIANT_BREACH",
            Error::Internal(_) | Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Validation(_) | Error::UnknownPatient(_) => ErrorClass::Validation,
            Error::NotFound { .. } => ErrorClass::NotFound,
            Error::BedUnavailable { .. }
            | Error::BedNotOccupied { .. }
            | Error::PatientAlreadyAdmitted { .. }
            | Error::WardInactive { .. }
            | Error::BedWardMismatch { .. }
            | Error::InvalidSourceBed { .. }
            | Error::DestinationUnavailable { .. }
            | Error::EncounterNotActive { .. }
            | Error::InvalidBedTransition { .. }
            | Error::CapacityInUse { .. }
            | Error::WouldGoNegative { .. }
            | Error::WouldExceedMaximum { .. }
            | Error::Conflict(_) => ErrorClass::Conflict,
            Error::ResourceBusy { .. } => ErrorClass::Contention,
            Error::InvariantBreach(_) => ErrorClass::Invariant,
            Error::Database(_) | Error::Internal(_) | Error::Other(_) => ErrorClass::Internal,
        }
    }

    /// Only contention is safe to retry; everything else needs a changed request or an operator.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Contention
    }

    fn status(&self) -> StatusCode {
        match self.class() {
            ErrorClass::Validation => StatusCode::BAD_REQUEST,
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::Conflict => StatusCode::CONFLICT,
            ErrorClass::Contention => StatusCode::SERVICE_UNAVAILABLE,
            ErrorClass::Invariant | ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<String> = errors
            .field_errors()
            .into_iter()
            .map(|(field, errs)| {
                let reasons: Vec<String> = errs
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                format!("{field}: {}", reasons.join(", "))
            })
            .collect();
        fields.sort();
        Error::Validation(fields.join("; "))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self.class() {
            ErrorClass::Internal => {
                tracing::error!(error = %self, "Internal error");
                "Internal server error".to_string()
            }
            ErrorClass::Invariant => {
                tracing::error!(error = %self, "Consistency invariant breached");
                self.to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "class": self.class(),
                "message": message,
                "retryable": self.is_retryable(),
            }
        }));

        let mut response = (status, body).into_response();
        if self.is_retryable() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_is_the_only_retryable_class() {
        let busy = Error::ResourceBusy {
            resource: "bed".into(),
            waited_ms: 10,
        };
        assert!(busy.is_retryable());
        assert_eq!(busy.status(), StatusCode::SERVICE_UNAVAILABLE);

        let unavailable = Error::BedUnavailable {
            bed_id: BedId::new(),
            status: BedStatus::Occupied,
        };
        assert!(!unavailable.is_retryable());
        assert_eq!(unavailable.code(), "BED_UNAVAILABLE");
        assert_eq!(unavailable.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn busy_responses_carry_retry_after() {
        let response = Error::ResourceBusy {
            resource: "ward".into(),
            waited_ms: 2000,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }

    #[test]
    fn invariant_breaches_are_server_errors() {
        let err = Error::InvariantBreach("ledger replay mismatch".into());
        assert_eq!(err.class(), ErrorClass::Invariant);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
