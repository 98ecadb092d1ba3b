use chrono::{Days, Local, NaiveDate};
use ulid::Ulid;

use crate::catalog::{Branch, Topic};
use crate::hours::{hours_for, BusinessHours};
use crate::model::{Appointment, BranchId, Slot, SlotKey, SlotStart, TopicId};

use super::{BookingEngine, BookingError};

impl BookingEngine {
    /// Every slot of `branch` on `date`, ascending, with live availability.
    ///
    /// Closed days yield an empty list. Nothing is cached: two calls with no
    /// commit in between return the same list.
    pub async fn slots_for(&self, branch: &BranchId, date: NaiveDate) -> Result<Vec<Slot>, BookingError> {
        if self.catalog.branch(branch).is_none() {
            return Err(BookingError::BranchNotFound(branch.clone()));
        }
        let started = std::time::Instant::now();
        let hours = hours_for(date);
        let mut slots = Vec::new();
        for time in hours.slot_times() {
            let Some(start) = SlotStart::on(date, time) else {
                continue;
            };
            let key = SlotKey::new(branch.clone(), start);
            let taken = self.bounded("exists", self.store.exists(&key)).await?;
            slots.push(Slot {
                branch_id: branch.clone(),
                start,
                available: !taken,
            });
        }
        metrics::histogram!(crate::observability::SLOT_QUERY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(slots)
    }

    /// Dates from tomorrow through the configured lookahead that still have
    /// at least one open slot.
    pub async fn available_dates_for(&self, branch: &BranchId) -> Result<Vec<NaiveDate>, BookingError> {
        let today = Local::now().date_naive();
        self.available_dates_from(branch, today, self.settings.lookahead_days)
            .await
    }

    /// Same as [`available_dates_for`](Self::available_dates_for) with an
    /// explicit `today` and window. `today` itself is never included.
    pub async fn available_dates_from(
        &self,
        branch: &BranchId,
        today: NaiveDate,
        days: u32,
    ) -> Result<Vec<NaiveDate>, BookingError> {
        let mut dates = Vec::new();
        for offset in 1..=u64::from(days) {
            let Some(date) = today.checked_add_days(Days::new(offset)) else {
                break;
            };
            if hours_for(date).is_closed() {
                continue;
            }
            let slots = self.slots_for(branch, date).await?;
            if slots.iter().any(|s| s.available) {
                dates.push(date);
            }
        }
        Ok(dates)
    }

    pub fn hours(&self, date: NaiveDate) -> BusinessHours {
        hours_for(date)
    }

    pub fn topics(&self) -> &[Topic] {
        self.catalog.topics()
    }

    pub fn branches(&self) -> &[Branch] {
        self.catalog.branches()
    }

    /// Branches offering `topic`. An unknown topic simply matches nothing.
    pub fn branches_for_topic(&self, topic: &TopicId) -> Vec<Branch> {
        self.catalog
            .branches_for_topic(topic)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn list_appointments(&self) -> Result<Vec<Appointment>, BookingError> {
        self.bounded("list", self.store.list()).await
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, BookingError> {
        self.bounded("get", self.store.get(id))
            .await?
            .ok_or(BookingError::AppointmentNotFound(id))
    }

    pub async fn appointments_for(
        &self,
        branch: &BranchId,
        date: NaiveDate,
    ) -> Result<Vec<Appointment>, BookingError> {
        if self.catalog.branch(branch).is_none() {
            return Err(BookingError::BranchNotFound(branch.clone()));
        }
        self.bounded("on_date", self.store.on_date(branch, date)).await
    }
}
