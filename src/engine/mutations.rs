use chrono::{Local, NaiveDateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use ulid::Ulid;

use crate::hours::hours_for;
use crate::model::{parse_local_datetime, Appointment, BookingRequest, BranchId, SlotStart, TopicId};

use super::{BookingEngine, BookingError};

/// Trimmed, non-blank value of an optional field.
fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl BookingEngine {
    /// Book against the current local wall-clock time.
    pub async fn book(&self, request: BookingRequest) -> Result<Appointment, BookingError> {
        self.book_at(request, Local::now().naive_local()).await
    }

    /// Validate and commit one booking as of `now`.
    ///
    /// Checks run in a fixed order and the first failure is returned. Nothing
    /// is written before the final commit, and a successful commit is never
    /// undone by a notification failure.
    pub async fn book_at(&self, request: BookingRequest, now: NaiveDateTime) -> Result<Appointment, BookingError> {
        let result = self.validate_and_commit(&request, now).await;
        let outcome = match &result {
            Ok(_) => "booked",
            Err(e) => e.kind(),
        };
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);

        match &result {
            Ok(appointment) => {
                info!(
                    "booked {} at branch {} for {}",
                    appointment.id, appointment.branch_id, appointment.slot_start
                );
                self.dispatcher.dispatch(self.confirmation(appointment));
            }
            Err(e) => debug!("booking rejected: {e}"),
        }
        result
    }

    async fn validate_and_commit(
        &self,
        request: &BookingRequest,
        now: NaiveDateTime,
    ) -> Result<Appointment, BookingError> {
        let name = present(&request.name);
        let email = present(&request.email);
        let topic = present(&request.topic_id);
        let branch = present(&request.branch_id);
        let raw_start = present(&request.slot_start);
        let (Some(name), Some(email), Some(topic), Some(branch), Some(raw_start)) =
            (name, email, topic, branch, raw_start)
        else {
            let missing = [
                ("name", name.is_none()),
                ("email", email.is_none()),
                ("topic_id", topic.is_none()),
                ("branch_id", branch.is_none()),
                ("slot_start", raw_start.is_none()),
            ]
            .into_iter()
            .filter_map(|(field, absent)| absent.then_some(field))
            .collect();
            return Err(BookingError::MissingFields(missing));
        };

        let topic_id = TopicId::from(topic);
        if !self.catalog.topic_exists(&topic_id) {
            return Err(BookingError::TopicNotFound(topic_id));
        }
        let branch_id = BranchId::from(branch);
        let Some(branch) = self.catalog.branch(&branch_id) else {
            return Err(BookingError::BranchNotFound(branch_id));
        };
        if !branch.supports(&topic_id) {
            return Err(BookingError::UnsupportedTopicForBranch {
                topic: topic_id,
                branch: branch_id,
            });
        }

        let at = parse_local_datetime(raw_start)
            .ok_or_else(|| BookingError::InvalidDateTime(raw_start.to_string()))?;
        if at <= now {
            return Err(BookingError::PastAppointment(at));
        }
        let slot_start = SlotStart::new(at).ok_or(BookingError::MisalignedSlot(at))?;
        if !hours_for(slot_start.date()).admits(slot_start.time()) {
            return Err(BookingError::OutsideBusinessHours(slot_start));
        }

        let appointment = Appointment {
            id: Ulid::new(),
            name: name.to_string(),
            email: email.to_string(),
            topic_id,
            branch_id,
            slot_start,
            reason: present(&request.reason).unwrap_or_default().to_string(),
            created_at: Utc::now(),
        };

        // Early exit for the common case. Not a guarantee: commit decides.
        let key = appointment.key();
        if self.bounded("exists", self.store.exists(&key)).await? {
            return Err(BookingError::SlotTaken {
                branch: key.branch_id,
                slot_start: key.slot_start,
            });
        }
        self.commit(&appointment).await?;
        Ok(appointment)
    }

    pub async fn delete_appointment(&self, id: Ulid) -> Result<Appointment, BookingError> {
        let removed = self.bounded("delete", self.store.delete(id)).await?;
        info!("deleted appointment {id}");
        Ok(removed)
    }

    /// Returns how many appointments were removed.
    pub async fn delete_all_appointments(&self) -> Result<usize, BookingError> {
        let removed = self.bounded("delete_all", self.store.delete_all()).await?;
        info!("deleted all appointments ({removed})");
        Ok(removed)
    }

    /// Send the confirmation for an existing appointment again.
    pub async fn resend_confirmation(&self, id: Ulid) -> Result<(Appointment, JoinHandle<usize>), BookingError> {
        let appointment = self.get_appointment(id).await?;
        let handle = self.dispatcher.dispatch(self.confirmation(&appointment));
        Ok((appointment, handle))
    }
}
