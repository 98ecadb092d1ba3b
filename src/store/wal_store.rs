use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::{Appointment, BranchId, Event, SlotKey};
use crate::wal::Wal;

use super::{BookingStore, StoreError};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it, then drain every Append already queued.
/// 3. One fsync for the whole batch, one response per sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        // Non-append commands run only after the batch queued ahead of them is durable.
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// Write and fsync one batch. On failure every sender is rolled back, so
/// none of the batch may reach disk later: unsynced bytes are discarded.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        warn!("WAL flush of {} events failed: {e}", batch.len());
        if let Err(e) = wal.discard_unsynced() {
            error!("could not discard failed WAL batch: {e}");
        }
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Send one event to the writer task and wait until it is durable.
async fn append_event(wal_tx: &mpsc::Sender<WalCommand>, event: Event) -> Result<(), StoreError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append { event, response: tx })
        .await
        .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
        .map_err(|e| StoreError::Wal(e.to_string()))
}

/// The in-memory view of the WAL.
#[derive(Default)]
struct Index {
    slots: DashMap<SlotKey, Appointment>,
    by_id: DashMap<Ulid, SlotKey>,
}

impl Index {
    /// Take `key` for `appointment` unless another appointment holds it.
    fn reserve(&self, appointment: &Appointment) -> Result<(), StoreError> {
        let key = appointment.key();
        match self.slots.entry(key.clone()) {
            Entry::Occupied(_) => return Err(StoreError::Conflict(key)),
            Entry::Vacant(vacant) => {
                vacant.insert(appointment.clone());
            }
        }
        self.by_id.insert(appointment.id, key);
        Ok(())
    }

    fn release(&self, id: Ulid) -> Option<Appointment> {
        let (_, key) = self.by_id.remove(&id)?;
        self.slots
            .remove_if(&key, |_, held| held.id == id)
            .map(|(_, appointment)| appointment)
    }

    fn clear(&self) -> usize {
        let removed = self.slots.len();
        self.slots.clear();
        self.by_id.clear();
        removed
    }

    fn record_live(&self) {
        metrics::gauge!(crate::observability::APPOINTMENTS_LIVE).set(self.slots.len() as f64);
    }
}

/// Appointment store backed by an in-memory index and an append-only WAL.
///
/// The `(branch, slot_start)` index doubles as the uniqueness constraint: a
/// commit reserves its key with a single `DashMap` entry operation before the
/// event is made durable, and gives the key back if the WAL write fails.
///
/// Writes are cancel-safe. Once a write has touched the index, the WAL round
/// trip and any rollback run in a spawned task, so dropping the caller's
/// future never leaves memory and disk disagreeing.
pub struct WalStore {
    index: Arc<Index>,
    /// Shared by single-key writes, exclusive for bulk delete and compaction,
    /// so a snapshot never races a half-applied commit.
    gate: Arc<RwLock<()>>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl WalStore {
    /// Replay `path` and start the background writer. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::recover(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            index: Arc::new(Index::default()),
            gate: Arc::new(RwLock::new(())),
            wal_tx,
        };
        for event in &events {
            store.apply(event);
        }
        info!(
            "booking store opened: {} events replayed, {} appointments live",
            events.len(),
            store.index.slots.len()
        );
        store.index.record_live();
        Ok(store)
    }

    /// Replay one event. Uniqueness holds here too: the first booking of a
    /// key wins and later ones are skipped.
    fn apply(&self, event: &Event) {
        match event {
            Event::AppointmentBooked(appointment) => {
                if let Err(StoreError::Conflict(key)) = self.index.reserve(appointment) {
                    warn!("replay: skipping appointment {} for already booked {key}", appointment.id);
                }
            }
            Event::AppointmentDeleted { id } => {
                self.index.release(*id);
            }
            Event::AllAppointmentsDeleted => {
                self.index.clear();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.index.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.slots.is_empty()
    }

    /// Rewrite the WAL with one `AppointmentBooked` per live appointment.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.gate.write().await;
        let mut live: Vec<Appointment> = self.index.slots.iter().map(|e| e.value().clone()).collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));
        let events: Vec<Event> = live.into_iter().map(Event::AppointmentBooked).collect();
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        debug!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn joined<T>(result: Result<Result<T, StoreError>, tokio::task::JoinError>) -> Result<T, StoreError> {
    result.map_err(|e| StoreError::Wal(format!("store task failed: {e}")))?
}

#[async_trait]
impl BookingStore for WalStore {
    async fn exists(&self, key: &SlotKey) -> Result<bool, StoreError> {
        Ok(self.index.slots.contains_key(key))
    }

    async fn commit(&self, appointment: &Appointment) -> Result<(), StoreError> {
        let gate = self.gate.clone().read_owned().await;
        self.index.reserve(appointment)?;

        let index = self.index.clone();
        let wal_tx = self.wal_tx.clone();
        let appointment = appointment.clone();
        let task = tokio::spawn(async move {
            let _gate = gate;
            let id = appointment.id;
            let result = append_event(&wal_tx, Event::AppointmentBooked(appointment)).await;
            if result.is_err() {
                index.release(id);
            }
            index.record_live();
            result
        });
        joined(task.await)
    }

    async fn get(&self, id: Ulid) -> Result<Option<Appointment>, StoreError> {
        let Some(key) = self.index.by_id.get(&id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        Ok(self.index.slots.get(&key).map(|e| e.value().clone()))
    }

    async fn list(&self) -> Result<Vec<Appointment>, StoreError> {
        let mut all: Vec<Appointment> = self.index.slots.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| {
            a.slot_start
                .cmp(&b.slot_start)
                .then_with(|| a.branch_id.cmp(&b.branch_id))
        });
        Ok(all)
    }

    async fn on_date(&self, branch: &BranchId, date: NaiveDate) -> Result<Vec<Appointment>, StoreError> {
        let mut found: Vec<Appointment> = self
            .index
            .slots
            .iter()
            .filter(|e| &e.key().branch_id == branch && e.key().slot_start.date() == date)
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|a| a.slot_start);
        Ok(found)
    }

    async fn delete(&self, id: Ulid) -> Result<Appointment, StoreError> {
        let gate = self.gate.clone().read_owned().await;
        if !self.index.by_id.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }

        let index = self.index.clone();
        let wal_tx = self.wal_tx.clone();
        let task = tokio::spawn(async move {
            let _gate = gate;
            append_event(&wal_tx, Event::AppointmentDeleted { id }).await?;
            let removed = index.release(id).ok_or(StoreError::NotFound(id));
            index.record_live();
            removed
        });
        joined(task.await)
    }

    async fn delete_all(&self) -> Result<usize, StoreError> {
        let gate = self.gate.clone().write_owned().await;

        let index = self.index.clone();
        let wal_tx = self.wal_tx.clone();
        let task = tokio::spawn(async move {
            let _gate = gate;
            append_event(&wal_tx, Event::AllAppointmentsDeleted).await?;
            let removed = index.clear();
            index.record_live();
            Ok(removed)
        });
        joined(task.await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SlotStart;
    use chrono::{NaiveDateTime, Utc};
    use futures::FutureExt;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("branchbook_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("{}_{name}", Ulid::new()))
    }

    fn appointment(branch: &str, at: &str) -> Appointment {
        let at = NaiveDateTime::parse_from_str(at, "%Y-%m-%dT%H:%M:%S").unwrap();
        Appointment {
            id: Ulid::new(),
            name: "Alan".into(),
            email: "alan@example.com".into(),
            topic_id: "2".into(),
            branch_id: branch.into(),
            slot_start: SlotStart::new(at).unwrap(),
            reason: String::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn commit_then_exists() {
        let store = WalStore::open(&test_wal_path("commit_exists.wal")).unwrap();
        let a = appointment("1", "2026-03-02T09:00:00");
        assert!(!store.exists(&a.key()).await.unwrap());
        store.commit(&a).await.unwrap();
        assert!(store.exists(&a.key()).await.unwrap());
        assert_eq!(store.get(a.id).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn second_commit_on_same_key_conflicts() {
        let store = WalStore::open(&test_wal_path("conflict.wal")).unwrap();
        let first = appointment("1", "2026-03-02T10:30:00");
        let second = appointment("1", "2026-03-02T10:30:00");
        store.commit(&first).await.unwrap();
        let err = store.commit(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(ref k) if *k == first.key()));
        // The loser left nothing behind.
        assert_eq!(store.get(second.id).await.unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn same_time_other_branch_is_independent() {
        let store = WalStore::open(&test_wal_path("other_branch.wal")).unwrap();
        store.commit(&appointment("1", "2026-03-02T11:00:00")).await.unwrap();
        store.commit(&appointment("2", "2026-03-02T11:00:00")).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_commits_single_winner() {
        let store = Arc::new(WalStore::open(&test_wal_path("race.wal")).unwrap());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.commit(&appointment("3", "2026-03-03T14:00:00")).await
            }));
        }
        let mut wins = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(()) => wins += 1,
                Err(StoreError::Conflict(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn replay_restores_state() {
        let path = test_wal_path("replay.wal");
        let kept = appointment("1", "2026-03-04T09:30:00");
        let dropped = appointment("1", "2026-03-04T10:00:00");
        {
            let store = WalStore::open(&path).unwrap();
            store.commit(&kept).await.unwrap();
            store.commit(&dropped).await.unwrap();
            store.delete(dropped.id).await.unwrap();
        }
        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.list().await.unwrap(), vec![kept.clone()]);
        assert!(store.exists(&kept.key()).await.unwrap());
        assert!(!store.exists(&dropped.key()).await.unwrap());
    }

    #[tokio::test]
    async fn delete_frees_the_slot() {
        let store = WalStore::open(&test_wal_path("delete.wal")).unwrap();
        let a = appointment("2", "2026-03-05T15:30:00");
        store.commit(&a).await.unwrap();
        let removed = store.delete(a.id).await.unwrap();
        assert_eq!(removed, a);
        assert!(!store.exists(&a.key()).await.unwrap());
        store.commit(&appointment("2", "2026-03-05T15:30:00")).await.unwrap();
    }

    #[tokio::test]
    async fn delete_unknown_is_not_found() {
        let store = WalStore::open(&test_wal_path("delete_unknown.wal")).unwrap();
        let id = Ulid::new();
        assert!(matches!(store.delete(id).await, Err(StoreError::NotFound(x)) if x == id));
    }

    #[tokio::test]
    async fn delete_all_survives_replay() {
        let path = test_wal_path("delete_all.wal");
        {
            let store = WalStore::open(&path).unwrap();
            store.commit(&appointment("1", "2026-03-06T09:00:00")).await.unwrap();
            store.commit(&appointment("2", "2026-03-06T09:00:00")).await.unwrap();
            assert_eq!(store.delete_all().await.unwrap(), 2);
            store.commit(&appointment("3", "2026-03-06T09:00:00")).await.unwrap();
        }
        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn on_date_filters_and_orders() {
        let store = WalStore::open(&test_wal_path("on_date.wal")).unwrap();
        let late = appointment("1", "2026-03-09T16:00:00");
        let early = appointment("1", "2026-03-09T09:00:00");
        store.commit(&late).await.unwrap();
        store.commit(&early).await.unwrap();
        store.commit(&appointment("1", "2026-03-10T09:00:00")).await.unwrap();
        store.commit(&appointment("2", "2026-03-09T09:00:00")).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        let found = store.on_date(&"1".into(), date).await.unwrap();
        assert_eq!(found, vec![early, late]);
    }

    #[tokio::test]
    async fn compaction_keeps_live_appointments() {
        let path = test_wal_path("compact.wal");
        let live = appointment("4", "2026-03-11T13:30:00");
        {
            let store = WalStore::open(&path).unwrap();
            for _ in 0..5 {
                let churn = appointment("4", "2026-03-11T09:00:00");
                store.commit(&churn).await.unwrap();
                store.delete(churn.id).await.unwrap();
            }
            store.commit(&live).await.unwrap();
            assert_eq!(store.appends_since_compact().await, 11);
            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
        }
        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.list().await.unwrap(), vec![live]);
    }

    #[tokio::test]
    async fn commit_after_torn_tail_survives_restart() {
        let path = test_wal_path("torn_then_commit.wal");
        let before = appointment("1", "2026-03-12T09:00:00");
        let after = appointment("1", "2026-03-12T09:30:00");
        {
            let store = WalStore::open(&path).unwrap();
            store.commit(&before).await.unwrap();
        }
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[40, 0, 0, 0, 1, 2]).unwrap();
        }
        {
            let store = WalStore::open(&path).unwrap();
            assert_eq!(store.len(), 1);
            store.commit(&after).await.unwrap();
        }
        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.exists(&after.key()).await.unwrap());
        assert_eq!(store.get(after.id).await.unwrap(), Some(after));
    }

    #[tokio::test]
    async fn dropped_commit_still_settles() {
        let path = test_wal_path("dropped_commit.wal");
        let a = appointment("2", "2026-03-13T10:00:00");
        let store = WalStore::open(&path).unwrap();

        // One poll reserves the key and hands the WAL write to its own task.
        assert!(store.commit(&a).now_or_never().is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.exists(&a.key()).await.unwrap());
        assert_eq!(store.get(a.id).await.unwrap(), Some(a.clone()));
        let reopened = WalStore::open(&path).unwrap();
        assert_eq!(reopened.get(a.id).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn dropped_delete_still_settles() {
        let path = test_wal_path("dropped_delete.wal");
        let a = appointment("3", "2026-03-13T11:00:00");
        let store = WalStore::open(&path).unwrap();
        store.commit(&a).await.unwrap();

        assert!(store.delete(a.id).now_or_never().is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!store.exists(&a.key()).await.unwrap());
        let reopened = WalStore::open(&path).unwrap();
        assert!(reopened.is_empty());
    }

    #[tokio::test]
    async fn replay_keeps_first_booking_of_a_key() {
        let path = test_wal_path("duplicate_key.wal");
        let first = appointment("4", "2026-03-16T09:00:00");
        let second = appointment("4", "2026-03-16T09:00:00");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_buffered(&Event::AppointmentBooked(first.clone())).unwrap();
            wal.append_buffered(&Event::AppointmentBooked(second.clone())).unwrap();
            wal.append_buffered(&Event::AppointmentDeleted { id: second.id }).unwrap();
            wal.flush_sync().unwrap();
        }
        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.list().await.unwrap(), vec![first.clone()]);
        assert_eq!(store.get(first.id).await.unwrap(), Some(first));
        assert_eq!(store.get(second.id).await.unwrap(), None);
    }
}
