mod tables;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex as StdMutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use chrono::NaiveDate;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub use tables::{Overlay, Row, Tables, View};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A commit would violate a table constraint. Nothing was written.
    Constraint(String),
    /// A row this transaction wrote was changed by another commit after it
    /// was read. Nothing was written; re-read and retry.
    Conflict(String),
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Constraint(msg) => write!(f, "constraint violation: {msg}"),
            StoreError::Conflict(msg) => write!(f, "write conflict: {msg}"),
            StoreError::Io(msg) => write!(f, "storage I/O error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

struct Sequencer {
    wal: Option<Wal>,
    seq: u64,
}

/// In-memory tables made durable by the WAL.
///
/// Readers take the table lock briefly and never wait on disk. Commits are
/// serialized by the sequencer mutex: validate, append, then apply.
pub struct Database {
    tables: RwLock<Tables>,
    sequencer: Mutex<Sequencer>,
}

impl Database {
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            sequencer: Mutex::new(Sequencer { wal: None, seq: 0 }),
        }
    }

    /// Replay the log at `path` and keep appending to it.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let (wal, commits) = Wal::recover(path)?;
        let mut tables = Tables::default();
        let mut seq = 0;
        let count = commits.len();
        for commit in commits {
            seq = seq.max(commit.seq);
            for change in commit.changes {
                tables.apply(change);
            }
        }
        tracing::info!(path = %path.display(), commits = count, "replayed WAL");
        Ok(Self {
            tables: RwLock::new(tables),
            sequencer: Mutex::new(Sequencer {
                wal: Some(wal),
                seq,
            }),
        })
    }

    fn tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn tables_mut(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            db: self,
            overlay: Overlay::default(),
            changes: Vec::new(),
            read_versions: StdMutex::new(HashMap::new()),
        }
    }

    /// Run a read-only closure against committed state.
    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.tables())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let seq = self.sequencer.lock().await;
        seq.wal.as_ref().map_or(0, Wal::appends_since_compact)
    }

    /// Rewrite the WAL as a single snapshot record. No-op when in memory.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let mut sequencer = self.sequencer.lock().await;
        let seq = sequencer.seq;
        let Some(wal) = sequencer.wal.as_mut() else {
            return Ok(());
        };
        let changes = self.tables().snapshot();
        let rows = changes.len();
        wal.compact(&[Commit { seq, changes }])?;
        tracing::info!(rows, seq, "WAL compacted");
        Ok(())
    }
}

/// Staged writes over read-committed reads.
///
/// Reads see committed state plus this transaction's own writes. Nothing is
/// visible to others until `commit`; dropping the transaction discards it.
///
/// Every row read or written remembers the version it had at first sight.
/// `commit` fails with [`StoreError::Conflict`] if any row being written has
/// moved on since, so a stale read can never overwrite a newer commit.
pub struct Transaction<'a> {
    db: &'a Database,
    overlay: Overlay,
    changes: Vec<Change>,
    read_versions: StdMutex<HashMap<Ulid, u64>>,
}

impl Transaction<'_> {
    fn with_view<T>(&self, f: impl FnOnce(&View<'_>) -> T) -> T {
        let tables = self.db.tables();
        f(&View {
            tables: &tables,
            overlay: &self.overlay,
        })
    }

    /// Pin the committed version of `ids` unless already pinned.
    fn observe(&self, tables: &Tables, ids: impl IntoIterator<Item = Ulid>) {
        let mut seen = self
            .read_versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            seen.entry(id).or_insert_with(|| tables.version(id));
        }
    }

    pub fn get<R: Row>(&self, id: Ulid) -> Option<R> {
        self.with_view(|v| {
            self.observe(v.tables, [id]);
            v.get(id)
        })
    }

    pub fn find<R: Row>(&self, pred: impl Fn(&R) -> bool) -> Vec<R> {
        self.with_view(|v| {
            let rows = v.find(pred);
            self.observe(v.tables, rows.iter().map(Row::id));
            rows
        })
    }

    pub fn reservations_on(&self, court_id: Ulid, date: NaiveDate) -> Vec<Reservation> {
        self.with_view(|v| {
            let rows = v.reservations_on(court_id, date);
            self.observe(v.tables, rows.iter().map(|r| r.id));
            rows
        })
    }

    pub fn payments_for(&self, reservation_id: Ulid) -> Vec<Payment> {
        self.with_view(|v| {
            let rows = v.payments_for(reservation_id);
            self.observe(v.tables, rows.iter().map(|p| p.id));
            rows
        })
    }

    pub fn put<R: Row>(&mut self, row: R) {
        self.observe(&self.db.tables(), [row.id()]);
        R::staged_mut(&mut self.overlay).insert(row.id(), Some(row.clone()));
        self.changes.push(row.put_change());
    }

    pub fn delete<R: Row>(&mut self, id: Ulid) {
        self.observe(&self.db.tables(), [id]);
        R::staged_mut(&mut self.overlay).insert(id, None);
        self.changes.push(R::delete_change(id));
    }

    pub fn audit(&mut self, entry: AuditEntry) {
        self.changes.push(Change::AuditAppended(entry));
    }

    pub fn critical(&mut self, event: CriticalEvent) {
        self.changes.push(Change::CriticalEventAppended(event));
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Validate, log, apply. Returns the commit sequence number.
    pub async fn commit(self) -> Result<u64, StoreError> {
        if self.changes.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let mut sequencer = self.db.sequencer.lock().await;

        {
            let tables = self.db.tables();
            let seen = self
                .read_versions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(id) = self
                .overlay
                .written()
                .find(|id| seen.get(id).is_some_and(|&v| v != tables.version(*id)))
            {
                return Err(StoreError::Conflict(format!(
                    "row {id} was modified by another commit"
                )));
            }
            drop(seen);
            check_constraints(&View {
                tables: &tables,
                overlay: &self.overlay,
            })?;
        }

        let commit = Commit {
            seq: sequencer.seq + 1,
            changes: self.changes,
        };
        if let Some(wal) = sequencer.wal.as_mut() {
            wal.append(&commit)?;
        }
        sequencer.seq = commit.seq;

        let mut tables = self.db.tables_mut();
        for change in commit.changes {
            tables.apply(change);
        }
        drop(tables);

        metrics::histogram!(observability::COMMIT_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(commit.seq)
    }
}

/// Evaluate constraints on the state this commit would produce.
fn check_constraints(view: &View<'_>) -> Result<(), StoreError> {
    for r in Reservation::staged(view.overlay).values().flatten() {
        let before = view.tables.reservations.get(&r.id);

        if before.is_none() && view.get::<Court>(r.court_id).is_none() {
            return Err(StoreError::Constraint(format!(
                "reservation {} references missing court {}",
                r.id, r.court_id
            )));
        }

        // Only rows that newly claim a slot are checked, so pre-existing
        // drift never blocks unrelated writes.
        let claims_slot = r.holds_slot()
            && before.is_none_or(|b| {
                !b.holds_slot() || b.span != r.span || b.date != r.date || b.court_id != r.court_id
            });
        if claims_slot
            && let Some(other) = view
                .reservations_on(r.court_id, r.date)
                .into_iter()
                .find(|o| o.id != r.id && o.holds_slot() && o.span.overlaps(&r.span))
        {
            return Err(StoreError::Constraint(format!(
                "reservation {} overlaps reservation {} on court {} {}",
                r.id, other.id, r.court_id, r.date
            )));
        }
    }

    for p in Payment::staged(view.overlay).values().flatten() {
        if !view.exists_committed::<Payment>(p.id)
            && view.get::<Reservation>(p.reservation_id).is_none()
        {
            return Err(StoreError::Constraint(format!(
                "payment {} references missing reservation {}",
                p.id, p.reservation_id
            )));
        }
        if p.is_completed_deposit()
            && view
                .payments_for(p.reservation_id)
                .iter()
                .any(|o| o.id != p.id && o.is_completed_deposit())
        {
            return Err(StoreError::Constraint(format!(
                "reservation {} already has a completed deposit",
                p.reservation_id
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Utc};

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 5, 1).unwrap()
    }

    fn court() -> Court {
        Court {
            id: Ulid::new(),
            name: "Central".into(),
            location: "North".into(),
            court_type: "padel".into(),
            price_per_hour: 3000.0,
            rating: 4.0,
            active: true,
            created_at: Utc::now(),
        }
    }

    fn reservation(court_id: Ulid, start: u32, end: u32) -> Reservation {
        Reservation {
            id: Ulid::new(),
            court_id,
            user_id: None,
            requester_name: "Ana".into(),
            requester_email: "ana@example.com".into(),
            date: date(),
            span: Span::new(t(start), t(end)),
            status: ReservationStatus::Pending,
            payment_status: SettlementStatus::Pending,
            total_amount: 3000.0,
            deposit_amount: 1500.0,
            created_at: Utc::now(),
        }
    }

    fn deposit(reservation_id: Ulid, status: PaymentStatus) -> Payment {
        Payment {
            id: Ulid::new(),
            reservation_id,
            user_id: Ulid::new(),
            amount: 1500.0,
            kind: PaymentKind::Deposit,
            method: PaymentMethod::CreditCard,
            transaction_id: None,
            status,
            created_at: Utc::now(),
            processed_at: None,
            error_message: None,
        }
    }

    async fn seeded() -> (Database, Court) {
        let db = Database::in_memory();
        let c = court();
        let mut tx = db.begin();
        tx.put(c.clone());
        tx.commit().await.unwrap();
        (db, c)
    }

    #[tokio::test]
    async fn reads_see_own_writes_but_not_others() {
        let (db, c) = seeded().await;
        let r = reservation(c.id, 10, 11);

        let mut tx = db.begin();
        tx.put(r.clone());
        assert_eq!(tx.get::<Reservation>(r.id), Some(r.clone()));
        assert!(db.read(|t| t.reservations.is_empty()));

        tx.commit().await.unwrap();
        assert!(db.read(|t| t.reservations.contains_key(&r.id)));
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let (db, c) = seeded().await;
        {
            let mut tx = db.begin();
            tx.put(reservation(c.id, 10, 11));
        }
        assert!(db.read(|t| t.reservations.is_empty()));
    }

    #[tokio::test]
    async fn overlapping_insert_is_rejected_at_commit() {
        let (db, c) = seeded().await;
        let mut first = db.begin();
        let mut second = db.begin();
        first.put(reservation(c.id, 10, 12));
        second.put(reservation(c.id, 11, 13));

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
        assert_eq!(db.read(|t| t.reservations.len()), 1);
    }

    #[tokio::test]
    async fn cancelled_rows_free_their_slot() {
        let (db, c) = seeded().await;
        let mut r = reservation(c.id, 10, 12);
        let mut tx = db.begin();
        tx.put(r.clone());
        tx.commit().await.unwrap();

        r.status = ReservationStatus::Cancelled;
        let mut tx = db.begin();
        tx.put(r);
        tx.put(reservation(c.id, 10, 12));
        tx.commit().await.unwrap();
        assert_eq!(db.read(|t| t.reservations_on(c.id, date()).len()), 2);
    }

    #[tokio::test]
    async fn insert_requires_existing_court() {
        let db = Database::in_memory();
        let mut tx = db.begin();
        tx.put(reservation(Ulid::new(), 10, 11));
        assert!(matches!(
            tx.commit().await,
            Err(StoreError::Constraint(_))
        ));
    }

    #[tokio::test]
    async fn orphans_survive_court_deletion() {
        let (db, c) = seeded().await;
        let mut r = reservation(c.id, 10, 11);
        let mut tx = db.begin();
        tx.put(r.clone());
        tx.commit().await.unwrap();

        let mut tx = db.begin();
        tx.delete::<Court>(c.id);
        tx.commit().await.unwrap();

        // Updating an orphan does not re-check the foreign key.
        r.status = ReservationStatus::Cancelled;
        let mut tx = db.begin();
        tx.put(r);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn second_completed_deposit_is_rejected() {
        let (db, c) = seeded().await;
        let r = reservation(c.id, 10, 11);
        let mut tx = db.begin();
        tx.put(r.clone());
        tx.put(deposit(r.id, PaymentStatus::Completed));
        tx.commit().await.unwrap();

        let mut tx = db.begin();
        tx.put(deposit(r.id, PaymentStatus::Failed));
        tx.commit().await.unwrap();

        let mut tx = db.begin();
        tx.put(deposit(r.id, PaymentStatus::Completed));
        assert!(matches!(
            tx.commit().await,
            Err(StoreError::Constraint(_))
        ));
        assert_eq!(db.read(|t| t.payments_for(r.id).len()), 2);
    }

    #[tokio::test]
    async fn reopen_replays_and_compacts() {
        let dir = std::env::temp_dir().join("courtbook_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("reopen.wal");
        let _ = std::fs::remove_file(&path);

        let c = court();
        let r = reservation(c.id, 9, 10);
        {
            let db = Database::open(&path).unwrap();
            let mut tx = db.begin();
            tx.put(c.clone());
            tx.commit().await.unwrap();
            let mut tx = db.begin();
            tx.put(r.clone());
            tx.commit().await.unwrap();
            assert_eq!(db.appends_since_compact().await, 2);
            db.compact().await.unwrap();
            assert_eq!(db.appends_since_compact().await, 0);
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.read(|t| t.courts.get(&c.id).cloned()), Some(c.clone()));
        assert_eq!(db.read(|t| t.reservations_on(c.id, date()).len()), 1);

        // Sequence numbers continue after reopen.
        let mut tx = db.begin();
        tx.put(reservation(c.id, 10, 11));
        assert_eq!(tx.commit().await.unwrap(), 3);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn stale_write_is_rejected_as_conflict() {
        let (db, c) = seeded().await;
        let r = reservation(c.id, 10, 11);
        let mut tx = db.begin();
        tx.put(r.clone());
        tx.commit().await.unwrap();

        let mut settle = db.begin();
        let mut confirmed = settle.get::<Reservation>(r.id).unwrap();

        let mut cancel = db.begin();
        let mut cancelled = cancel.get::<Reservation>(r.id).unwrap();
        cancelled.status = ReservationStatus::Cancelled;
        cancel.put(cancelled);
        cancel.commit().await.unwrap();

        confirmed.status = ReservationStatus::Confirmed;
        settle.put(confirmed);
        assert!(matches!(
            settle.commit().await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(
            db.read(|t| t.reservations[&r.id].status),
            ReservationStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn rows_only_read_do_not_conflict() {
        let (db, c) = seeded().await;
        let r = reservation(c.id, 10, 11);

        let mut tx = db.begin();
        assert!(tx.get::<Court>(c.id).is_some());

        let mut other = db.begin();
        let mut renamed = c.clone();
        renamed.name = "Centre".into();
        other.put(renamed);
        other.commit().await.unwrap();

        tx.put(r.clone());
        tx.commit().await.unwrap();
        assert!(db.read(|t| t.reservations.contains_key(&r.id)));
    }

    #[tokio::test]
    async fn commits_after_torn_tail_survive_restart() {
        let dir = std::env::temp_dir().join("courtbook_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("torn_restart.wal");
        let _ = std::fs::remove_file(&path);

        let c = court();
        let r = reservation(c.id, 9, 10);
        {
            let db = Database::open(&path).unwrap();
            let mut tx = db.begin();
            tx.put(c.clone());
            tx.commit().await.unwrap();
        }
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xAB; 5]).unwrap();
        }
        {
            let db = Database::open(&path).unwrap();
            let mut tx = db.begin();
            tx.put(r.clone());
            tx.commit().await.unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert!(db.read(|t| t.courts.contains_key(&c.id)));
        assert!(db.read(|t| t.reservations.contains_key(&r.id)));
        let _ = std::fs::remove_file(&path);
    }
}
