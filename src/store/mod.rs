mod wal_store;

pub use wal_store::WalStore;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{Appointment, BranchId, SlotKey};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another appointment already holds this (branch, slot_start).
    #[error("slot already booked: {0}")]
    Conflict(SlotKey),

    #[error("appointment not found: {0}")]
    NotFound(Ulid),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable record of committed appointments.
///
/// `commit` is the only place double booking is decided: it must fail with
/// [`StoreError::Conflict`] when the key is held, and must never overwrite.
/// `exists` may report a key as taken slightly early (while a commit is in
/// flight) but never late.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn exists(&self, key: &SlotKey) -> Result<bool, StoreError>;

    async fn commit(&self, appointment: &Appointment) -> Result<(), StoreError>;

    async fn get(&self, id: Ulid) -> Result<Option<Appointment>, StoreError>;

    /// All appointments, ordered by slot start then branch.
    async fn list(&self) -> Result<Vec<Appointment>, StoreError>;

    /// Appointments of one branch on one date, ordered by slot start.
    async fn on_date(&self, branch: &BranchId, date: NaiveDate) -> Result<Vec<Appointment>, StoreError>;

    async fn delete(&self, id: Ulid) -> Result<Appointment, StoreError>;

    /// Returns how many appointments were removed.
    async fn delete_all(&self) -> Result<usize, StoreError>;
}
