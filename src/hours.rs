use chrono::{Datelike, NaiveDate, NaiveTime, Timelike, Weekday};
use serde::Serialize;

use crate::model::SLOT_MINUTES;

/// Hour range in which no slots are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Lunch {
    pub start_hour: u32,
    pub end_hour: u32,
}

/// Opening window of a branch on one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BusinessHours {
    Closed,
    Open {
        open_hour: u32,
        close_hour: u32,
        lunch: Option<Lunch>,
    },
}

/// The one business-hours policy. Both slot listing and booking validation
/// call this, never their own copy of the rules.
pub fn hours_for(date: NaiveDate) -> BusinessHours {
    match date.weekday() {
        Weekday::Sun => BusinessHours::Closed,
        Weekday::Sat => BusinessHours::Open {
            open_hour: 9,
            close_hour: 13,
            lunch: None,
        },
        _ => BusinessHours::Open {
            open_hour: 9,
            close_hour: 17,
            lunch: Some(Lunch {
                start_hour: 12,
                end_hour: 13,
            }),
        },
    }
}

impl BusinessHours {
    pub fn is_closed(&self) -> bool {
        matches!(self, BusinessHours::Closed)
    }

    /// Whether a slot may start at `time`: inside `[open, close)` and outside lunch.
    /// Alignment to the 30-minute lattice is checked separately.
    pub fn admits(&self, time: NaiveTime) -> bool {
        match *self {
            BusinessHours::Closed => false,
            BusinessHours::Open {
                open_hour,
                close_hour,
                lunch,
            } => {
                let hour = time.hour();
                let in_lunch = lunch.is_some_and(|l| l.start_hour <= hour && hour < l.end_hour);
                open_hour <= hour && hour < close_hour && !in_lunch
            }
        }
    }

    /// Every slot start time of the day, ascending.
    pub fn slot_times(&self) -> Vec<NaiveTime> {
        let BusinessHours::Open { open_hour, close_hour, .. } = *self else {
            return Vec::new();
        };
        (open_hour..close_hour)
            .flat_map(|hour| (0..60).step_by(SLOT_MINUTES as usize).map(move |minute| (hour, minute)))
            .filter_map(|(hour, minute)| NaiveTime::from_hms_opt(hour, minute, 0))
            .filter(|t| self.admits(*t))
            .collect()
    }

    /// `HH:MM` rendering of the opening hour, for display surfaces.
    pub fn open_time(&self) -> Option<String> {
        match self {
            BusinessHours::Closed => None,
            BusinessHours::Open { open_hour, .. } => Some(format!("{open_hour:02}:00")),
        }
    }

    pub fn close_time(&self) -> Option<String> {
        match self {
            BusinessHours::Closed => None,
            BusinessHours::Open { close_hour, .. } => Some(format!("{close_hour:02}:00")),
        }
    }
}
