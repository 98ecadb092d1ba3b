use std::fmt;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Length of every bookable slot. Appointments carry no duration field.
pub const SLOT_MINUTES: u32 = 30;

/// Canonical on-disk and on-wire form of a slot start.
pub const SLOT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub const DATE_FORMAT: &str = "%Y-%m-%d";

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(BranchId);
string_id!(TopicId);

/// A wall-clock instant that sits exactly on a 30-minute boundary.
///
/// Every comparison between the read path and the write path goes through this
/// type, so `09:00` and `09:00:00` can never end up as two different keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotStart(NaiveDateTime);

impl SlotStart {
    /// Returns `None` unless the minute is 0 or 30 and there are no seconds.
    pub fn new(at: NaiveDateTime) -> Option<Self> {
        let aligned = at.minute() % SLOT_MINUTES == 0 && at.second() == 0 && at.nanosecond() == 0;
        aligned.then_some(Self(at))
    }

    pub fn on(date: NaiveDate, time: NaiveTime) -> Option<Self> {
        Self::new(date.and_time(time))
    }

    pub fn at(&self) -> NaiveDateTime {
        self.0
    }

    pub fn date(&self) -> NaiveDate {
        self.0.date()
    }

    pub fn time(&self) -> NaiveTime {
        self.0.time()
    }
}

impl fmt::Display for SlotStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(SLOT_FORMAT))
    }
}

/// Parse a client-supplied date-time into branch-local wall-clock time.
///
/// Accepts `YYYY-MM-DDTHH:MM`, `YYYY-MM-DDTHH:MM:SS[.fff]` (with `T` or a
/// space), and RFC 3339 strings carrying an offset, which are converted to
/// local time.
pub fn parse_local_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Local).naive_local())
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

/// Uniqueness key of the booking store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub branch_id: BranchId,
    pub slot_start: SlotStart,
}

impl SlotKey {
    pub fn new(branch_id: BranchId, slot_start: SlotStart) -> Self {
        Self { branch_id, slot_start }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "branch {} at {}", self.branch_id, self.slot_start)
    }
}

/// A committed booking. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub topic_id: TopicId,
    pub branch_id: BranchId,
    pub slot_start: SlotStart,
    /// Empty when the customer gave no reason.
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl Appointment {
    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.branch_id.clone(), self.slot_start)
    }
}

/// A bookable start time, computed fresh on every read.
#[derive(Debug, Clone, Serialize)]
pub struct Slot {
    pub branch_id: BranchId,
    pub start: SlotStart,
    pub available: bool,
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.branch_id == other.branch_id && self.start == other.start
    }
}

impl Eq for Slot {}

/// Raw booking input as it arrives from a client. Everything is optional here;
/// the engine decides what is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BookingRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub topic_id: Option<String>,
    pub branch_id: Option<String>,
    pub slot_start: Option<String>,
    pub reason: Option<String>,
}

/// WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AppointmentBooked(Appointment),
    AppointmentDeleted { id: Ulid },
    AllAppointmentsDeleted,
}
