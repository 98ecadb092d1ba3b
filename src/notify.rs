use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::model::Appointment;

/// Everything a confirmation message needs, resolved against the catalog at booking time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub appointment: Appointment,
    pub topic_name: String,
    pub branch_name: String,
    pub branch_address: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("could not render message: {0}")]
    Render(String),
}

/// Outbound side effect of a successful booking.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, confirmation: &Confirmation) -> Result<(), NotifyError>;
}

/// Writes confirmations to the log. Used when no mail transport is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, c: &Confirmation) -> Result<(), NotifyError> {
        info!(
            id = %c.appointment.id,
            email = %c.appointment.email,
            "confirmation: {} at {} ({}) on {}",
            c.topic_name,
            c.branch_name,
            c.branch_address,
            c.appointment.slot_start
        );
        Ok(())
    }
}

/// Runs every notifier for a booking in the background, each with a bounded
/// number of attempts. Failures are logged and dropped: the booking stands.
#[derive(Clone)]
pub struct Dispatcher {
    notifiers: Vec<Arc<dyn Notifier>>,
    max_attempts: u32,
    backoff: Duration,
}

impl Dispatcher {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            notifiers: Vec::new(),
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Fire and forget. The handle resolves to how many notifiers delivered.
    pub fn dispatch(&self, confirmation: Confirmation) -> JoinHandle<usize> {
        let notifiers = self.notifiers.clone();
        let max_attempts = self.max_attempts;
        let backoff = self.backoff;
        tokio::spawn(async move {
            let mut delivered = 0;
            for notifier in &notifiers {
                if deliver(notifier.as_ref(), &confirmation, max_attempts, backoff).await {
                    delivered += 1;
                }
            }
            delivered
        })
    }
}

async fn deliver(notifier: &dyn Notifier, c: &Confirmation, max_attempts: u32, backoff: Duration) -> bool {
    for attempt in 1..=max_attempts {
        metrics::counter!(crate::observability::NOTIFY_ATTEMPTS_TOTAL, "notifier" => notifier.name())
            .increment(1);
        match notifier.send(c).await {
            Ok(()) => return true,
            Err(e) if attempt < max_attempts => {
                warn!(
                    "{} notification for {} failed (attempt {attempt}/{max_attempts}): {e}",
                    notifier.name(),
                    c.appointment.id
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                warn!(
                    "{} notification for {} abandoned after {max_attempts} attempts: {e}",
                    notifier.name(),
                    c.appointment.id
                );
                metrics::counter!(crate::observability::NOTIFY_FAILURES_TOTAL, "notifier" => notifier.name())
                    .increment(1);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SlotStart;
    use chrono::{NaiveDateTime, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};
    use ulid::Ulid;

    fn confirmation(branch: &str) -> Confirmation {
        let at = NaiveDateTime::parse_from_str("2026-04-01T10:00:00", "%Y-%m-%dT%H:%M:%S").unwrap();
        Confirmation {
            appointment: Appointment {
                id: Ulid::new(),
                name: "Edsger".into(),
                email: "edsger@example.com".into(),
                topic_id: "4".into(),
                branch_id: branch.into(),
                slot_start: SlotStart::new(at).unwrap(),
                reason: String::new(),
                created_at: Utc::now(),
            },
            topic_name: "Mortgage Services".into(),
            branch_name: "Westside Branch".into(),
            branch_address: "456 West Avenue".into(),
        }
    }

    /// Fails the first `failures` sends, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Notifier for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn send(&self, _c: &Confirmation) -> Result<(), NotifyError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(NotifyError::Transport("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let flaky = Arc::new(Flaky { failures: 2, calls: AtomicU32::new(0) });
        let dispatcher = Dispatcher::new(3, Duration::from_millis(1)).with(flaky.clone());
        let delivered = dispatcher.dispatch(confirmation("1")).await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let flaky = Arc::new(Flaky { failures: u32::MAX, calls: AtomicU32::new(0) });
        let dispatcher = Dispatcher::new(4, Duration::from_millis(1)).with(flaky.clone());
        let delivered = dispatcher.dispatch(confirmation("1")).await.unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn one_failing_notifier_does_not_block_others() {
        let healthy = Arc::new(Flaky { failures: 0, calls: AtomicU32::new(0) });
        let dispatcher = Dispatcher::new(2, Duration::from_millis(1))
            .with(Arc::new(Flaky { failures: u32::MAX, calls: AtomicU32::new(0) }))
            .with(healthy.clone())
            .with(Arc::new(LogNotifier));
        assert_eq!(dispatcher.dispatch(confirmation("3")).await.unwrap(), 2);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
    }
}
