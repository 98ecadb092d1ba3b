use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{BranchId, SlotStart, TopicId};
use crate::store::StoreError;

/// Who has to act on a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorClass {
    /// Bad input. Resubmitting the same request will fail again.
    Validation,
    /// Stale topic/branch reference data on the caller's side.
    Reference,
    /// Lost the slot to another booking. Re-fetch availability.
    Conflict,
    /// Store timeout or failure. The whole request may be retried.
    Transient,
}

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("topic not found: {0}")]
    TopicNotFound(TopicId),

    #[error("branch not found: {0}")]
    BranchNotFound(BranchId),

    #[error("branch {branch} does not support topic {topic}")]
    UnsupportedTopicForBranch { topic: TopicId, branch: BranchId },

    #[error("invalid date-time: {0:?}")]
    InvalidDateTime(String),

    #[error("appointment must be in the future: {0}")]
    PastAppointment(NaiveDateTime),

    #[error("appointment time must be on a 30-minute boundary: {0}")]
    MisalignedSlot(NaiveDateTime),

    #[error("{0} is outside business hours")]
    OutsideBusinessHours(SlotStart),

    #[error("time slot is no longer available: branch {branch} at {slot_start}")]
    SlotTaken { branch: BranchId, slot_start: SlotStart },

    #[error("appointment not found: {0}")]
    AppointmentNotFound(Ulid),

    #[error("booking store unavailable: {0}")]
    StoreUnavailable(String),
}

impl BookingError {
    /// Stable machine-readable name of the rejection.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::MissingFields(_) => "MissingFields",
            BookingError::TopicNotFound(_) => "TopicNotFound",
            BookingError::BranchNotFound(_) => "BranchNotFound",
            BookingError::UnsupportedTopicForBranch { .. } => "UnsupportedTopicForBranch",
            BookingError::InvalidDateTime(_) => "InvalidDateTime",
            BookingError::PastAppointment(_) => "PastAppointment",
            BookingError::MisalignedSlot(_) => "MisalignedSlot",
            BookingError::OutsideBusinessHours(_) => "OutsideBusinessHours",
            BookingError::SlotTaken { .. } => "SlotTaken",
            BookingError::AppointmentNotFound(_) => "AppointmentNotFound",
            BookingError::StoreUnavailable(_) => "StoreUnavailable",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            BookingError::MissingFields(_)
            | BookingError::InvalidDateTime(_)
            | BookingError::PastAppointment(_)
            | BookingError::MisalignedSlot(_)
            | BookingError::OutsideBusinessHours(_) => ErrorClass::Validation,
            BookingError::TopicNotFound(_)
            | BookingError::BranchNotFound(_)
            | BookingError::UnsupportedTopicForBranch { .. }
            | BookingError::AppointmentNotFound(_) => ErrorClass::Reference,
            BookingError::SlotTaken { .. } => ErrorClass::Conflict,
            BookingError::StoreUnavailable(_) => ErrorClass::Transient,
        }
    }

    /// HTTP-equivalent status code.
    pub fn status(&self) -> u16 {
        match self {
            BookingError::TopicNotFound(_)
            | BookingError::BranchNotFound(_)
            | BookingError::AppointmentNotFound(_) => 404,
            BookingError::SlotTaken { .. } => 409,
            BookingError::StoreUnavailable(_) => 503,
            _ => 400,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            timestamp: Utc::now(),
        }
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(key) => BookingError::SlotTaken {
                branch: key.branch_id,
                slot_start: key.slot_start,
            },
            StoreError::NotFound(id) => BookingError::AppointmentNotFound(id),
            other => BookingError::StoreUnavailable(other.to_string()),
        }
    }
}

/// What a caller gets back for a failed request.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SlotKey;

    fn slot() -> SlotStart {
        let at = NaiveDateTime::parse_from_str("2026-02-09T09:00:00", "%Y-%m-%dT%H:%M:%S").unwrap();
        SlotStart::new(at).unwrap()
    }

    #[test]
    fn status_codes_follow_class() {
        assert_eq!(BookingError::MissingFields(vec!["name"]).status(), 400);
        assert_eq!(BookingError::TopicNotFound("9".into()).status(), 404);
        assert_eq!(
            BookingError::UnsupportedTopicForBranch { topic: "3".into(), branch: "2".into() }.status(),
            400
        );
        assert_eq!(BookingError::SlotTaken { branch: "1".into(), slot_start: slot() }.status(), 409);
        assert_eq!(BookingError::StoreUnavailable("down".into()).status(), 503);
    }

    #[test]
    fn store_conflict_becomes_slot_taken() {
        let err: BookingError = StoreError::Conflict(SlotKey::new("1".into(), slot())).into();
        assert_eq!(err.kind(), "SlotTaken");
        assert_eq!(err.class(), ErrorClass::Conflict);
    }

    #[test]
    fn store_failure_is_transient() {
        let err: BookingError = StoreError::Wal("disk full".into()).into();
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn report_carries_kind_and_message() {
        let report = BookingError::MissingFields(vec!["name", "email"]).report();
        assert_eq!(report.kind, "MissingFields");
        assert_eq!(report.message, "missing required fields: name, email");
    }
}
