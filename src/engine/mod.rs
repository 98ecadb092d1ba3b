mod error;
mod mutations;
mod queries;

pub use error::{BookingError, ErrorClass, ErrorReport};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::config::Config;
use crate::model::Appointment;
use crate::notify::{Confirmation, Dispatcher};
use crate::store::{BookingStore, StoreError};

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Upper bound on any single store call.
    pub store_timeout: Duration,
    /// How many days after today `available_dates_for` scans.
    pub lookahead_days: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            lookahead_days: 28,
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            store_timeout: cfg.store_timeout,
            lookahead_days: cfg.lookahead_days,
        }
    }
}

/// Availability and booking over one catalog and one store.
///
/// Holds no mutable state of its own. Every request is an independent
/// computation against the catalog and the store; the store's `commit` is
/// the only serialization point.
pub struct BookingEngine {
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn BookingStore>,
    dispatcher: Dispatcher,
    settings: EngineSettings,
}

impl BookingEngine {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn BookingStore>,
        dispatcher: Dispatcher,
        settings: EngineSettings,
    ) -> Self {
        Self {
            catalog,
            store,
            dispatcher,
            settings,
        }
    }

    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    /// Run one store call under `store_timeout`. An elapsed timer is a
    /// transient failure, same as the store reporting one.
    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, BookingError> {
        match tokio::time::timeout(self.settings.store_timeout, call).await {
            Ok(result) => result.map_err(BookingError::from),
            Err(_) => {
                warn!("store {op} timed out after {:?}", self.settings.store_timeout);
                Err(BookingError::StoreUnavailable(format!(
                    "{op} timed out after {:?}",
                    self.settings.store_timeout
                )))
            }
        }
    }

    /// Commit under `store_timeout`.
    ///
    /// The commit runs as its own task, so the timeout ends the wait but not
    /// the commit. If it lands after the caller gave up, the customer still
    /// gets a confirmation for the booking they now hold.
    async fn commit(&self, appointment: &Appointment) -> Result<(), BookingError> {
        let store = self.store.clone();
        let pending = appointment.clone();
        let mut task = tokio::spawn(async move { store.commit(&pending).await });

        match tokio::time::timeout(self.settings.store_timeout, &mut task).await {
            Ok(Ok(result)) => result.map_err(BookingError::from),
            Ok(Err(e)) => Err(BookingError::StoreUnavailable(format!("commit task failed: {e}"))),
            Err(_) => {
                warn!(
                    "store commit of {} timed out after {:?}",
                    appointment.id, self.settings.store_timeout
                );
                let dispatcher = self.dispatcher.clone();
                let confirmation = self.confirmation(appointment);
                tokio::spawn(async move {
                    if let Ok(Ok(())) = task.await {
                        info!("late commit of {} landed, confirming", confirmation.appointment.id);
                        dispatcher.dispatch(confirmation);
                    }
                });
                Err(BookingError::StoreUnavailable(format!(
                    "commit timed out after {:?}",
                    self.settings.store_timeout
                )))
            }
        }
    }

    /// Resolve display names for a confirmation. Falls back to raw ids if the
    /// catalog no longer knows the topic or branch.
    fn confirmation(&self, appointment: &Appointment) -> Confirmation {
        let topic_name = self
            .catalog
            .topic(&appointment.topic_id)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| appointment.topic_id.to_string());
        let (branch_name, branch_address) = match self.catalog.branch(&appointment.branch_id) {
            Some(b) => (b.name.clone(), b.address.clone()),
            None => (appointment.branch_id.to_string(), String::new()),
        };
        Confirmation {
            appointment: appointment.clone(),
            topic_name,
            branch_name,
            branch_address,
        }
    }
}
