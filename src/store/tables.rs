use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

/// Committed state of every table.
#[derive(Debug, Default, Clone)]
pub struct Tables {
    pub courts: BTreeMap<Ulid, Court>,
    pub users: BTreeMap<Ulid, User>,
    pub reservations: BTreeMap<Ulid, Reservation>,
    pub payments: BTreeMap<Ulid, Payment>,
    pub reports: BTreeMap<Ulid, IntegrityReport>,
    pub audit_log: Vec<AuditEntry>,
    pub critical_events: Vec<CriticalEvent>,
    /// (court, date) → reservation ids, cancelled ones included.
    by_court_day: HashMap<(Ulid, NaiveDate), BTreeSet<Ulid>>,
    /// reservation → payment ids.
    by_reservation: HashMap<Ulid, BTreeSet<Ulid>>,
    /// Row id → number of writes applied to it. Deletions count too.
    versions: HashMap<Ulid, u64>,
}

impl Tables {
    pub fn apply(&mut self, change: Change) {
        if let Some(id) = change.row_id() {
            *self.versions.entry(id).or_default() += 1;
        }
        match change {
            Change::CourtPut(court) => {
                self.courts.insert(court.id, court);
            }
            Change::CourtDeleted { id } => {
                self.courts.remove(&id);
            }
            Change::UserPut(user) => {
                self.users.insert(user.id, user);
            }
            Change::UserDeleted { id } => {
                self.users.remove(&id);
            }
            Change::ReservationPut(r) => {
                if let Some(old) = self.reservations.get(&r.id)
                    && (old.court_id, old.date) != (r.court_id, r.date)
                {
                    Self::unindex(&mut self.by_court_day, &(old.court_id, old.date), &r.id);
                }
                self.by_court_day
                    .entry((r.court_id, r.date))
                    .or_default()
                    .insert(r.id);
                self.reservations.insert(r.id, r);
            }
            Change::ReservationDeleted { id } => {
                if let Some(old) = self.reservations.remove(&id) {
                    Self::unindex(&mut self.by_court_day, &(old.court_id, old.date), &id);
                }
            }
            Change::PaymentPut(p) => {
                self.by_reservation
                    .entry(p.reservation_id)
                    .or_default()
                    .insert(p.id);
                self.payments.insert(p.id, p);
            }
            Change::PaymentDeleted { id } => {
                if let Some(old) = self.payments.remove(&id) {
                    Self::unindex(&mut self.by_reservation, &old.reservation_id, &id);
                }
            }
            Change::AuditAppended(entry) => self.audit_log.push(entry),
            Change::CriticalEventAppended(event) => self.critical_events.push(event),
            Change::ReportPut(report) => {
                self.reports.insert(report.id, report);
            }
            Change::ReportDeleted { id } => {
                self.reports.remove(&id);
            }
        }
    }

    /// Write count of a row id; 0 if it was never written.
    pub fn version(&self, id: Ulid) -> u64 {
        self.versions.get(&id).copied().unwrap_or(0)
    }

    fn unindex<K: std::hash::Hash + Eq>(
        index: &mut HashMap<K, BTreeSet<Ulid>>,
        key: &K,
        id: &Ulid,
    ) {
        if let Some(ids) = index.get_mut(key) {
            ids.remove(id);
            if ids.is_empty() {
                index.remove(key);
            }
        }
    }

    /// All reservations (cancelled included) for a court on a date.
    pub fn reservations_on(&self, court_id: Ulid, date: NaiveDate) -> Vec<&Reservation> {
        self.by_court_day
            .get(&(court_id, date))
            .into_iter()
            .flatten()
            .filter_map(|id| self.reservations.get(id))
            .collect()
    }

    pub fn payments_for(&self, reservation_id: Ulid) -> Vec<&Payment> {
        self.by_reservation
            .get(&reservation_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.payments.get(id))
            .collect()
    }

    /// Minimal change list that recreates the current state.
    pub fn snapshot(&self) -> Vec<Change> {
        let mut changes = Vec::with_capacity(
            self.courts.len()
                + self.users.len()
                + self.reservations.len()
                + self.payments.len()
                + self.reports.len()
                + self.audit_log.len()
                + self.critical_events.len(),
        );
        changes.extend(self.courts.values().cloned().map(Change::CourtPut));
        changes.extend(self.users.values().cloned().map(Change::UserPut));
        changes.extend(self.reservations.values().cloned().map(Change::ReservationPut));
        changes.extend(self.payments.values().cloned().map(Change::PaymentPut));
        changes.extend(self.reports.values().cloned().map(Change::ReportPut));
        changes.extend(self.audit_log.iter().cloned().map(Change::AuditAppended));
        changes.extend(
            self.critical_events
                .iter()
                .cloned()
                .map(Change::CriticalEventAppended),
        );
        changes
    }
}

/// Uncommitted writes of one transaction. `None` marks a deletion.
#[derive(Debug, Default)]
pub struct Overlay {
    courts: HashMap<Ulid, Option<Court>>,
    users: HashMap<Ulid, Option<User>>,
    reservations: HashMap<Ulid, Option<Reservation>>,
    payments: HashMap<Ulid, Option<Payment>>,
    reports: HashMap<Ulid, Option<IntegrityReport>>,
}

impl Overlay {
    /// Ids of every staged row, puts and deletions alike.
    pub fn written(&self) -> impl Iterator<Item = Ulid> + '_ {
        self.courts
            .keys()
            .chain(self.users.keys())
            .chain(self.reservations.keys())
            .chain(self.payments.keys())
            .chain(self.reports.keys())
            .copied()
    }
}

/// A table row addressable by id.
pub trait Row: Clone + Send + Sync + 'static {
    fn id(&self) -> Ulid;
    fn committed(tables: &Tables) -> &BTreeMap<Ulid, Self>;
    fn staged(overlay: &Overlay) -> &HashMap<Ulid, Option<Self>>;
    fn staged_mut(overlay: &mut Overlay) -> &mut HashMap<Ulid, Option<Self>>;
    fn put_change(self) -> Change;
    fn delete_change(id: Ulid) -> Change;
}

macro_rules! impl_row {
    ($ty:ty, $field:ident, $put:ident, $del:ident) => {
        impl Row for $ty {
            fn id(&self) -> Ulid {
                self.id
            }
            fn committed(tables: &Tables) -> &BTreeMap<Ulid, Self> {
                &tables.$field
            }
            fn staged(overlay: &Overlay) -> &HashMap<Ulid, Option<Self>> {
                &overlay.$field
            }
            fn staged_mut(overlay: &mut Overlay) -> &mut HashMap<Ulid, Option<Self>> {
                &mut overlay.$field
            }
            fn put_change(self) -> Change {
                Change::$put(self)
            }
            fn delete_change(id: Ulid) -> Change {
                Change::$del { id }
            }
        }
    };
}

impl_row!(Court, courts, CourtPut, CourtDeleted);
impl_row!(User, users, UserPut, UserDeleted);
impl_row!(Reservation, reservations, ReservationPut, ReservationDeleted);
impl_row!(Payment, payments, PaymentPut, PaymentDeleted);

impl_row!(IntegrityReport, reports, ReportPut, ReportDeleted);

/// Committed state seen through a transaction's own writes.
pub struct View<'a> {
    pub tables: &'a Tables,
    pub overlay: &'a Overlay,
}

impl View<'_> {
    pub fn get<R: Row>(&self, id: Ulid) -> Option<R> {
        match R::staged(self.overlay).get(&id) {
            Some(staged) => staged.clone(),
            None => R::committed(self.tables).get(&id).cloned(),
        }
    }

    pub fn exists_committed<R: Row>(&self, id: Ulid) -> bool {
        R::committed(self.tables).contains_key(&id)
    }

    /// Rows matching `pred`, ordered by id.
    pub fn find<R: Row>(&self, pred: impl Fn(&R) -> bool) -> Vec<R> {
        let staged = R::staged(self.overlay);
        let mut rows: BTreeMap<Ulid, R> = R::committed(self.tables)
            .values()
            .filter(|r| !staged.contains_key(&r.id()) && pred(r))
            .map(|r| (r.id(), r.clone()))
            .collect();
        for row in staged.values().flatten() {
            if pred(row) {
                rows.insert(row.id(), row.clone());
            }
        }
        rows.into_values().collect()
    }

    pub fn reservations_on(&self, court_id: Ulid, date: NaiveDate) -> Vec<Reservation> {
        let staged = &self.overlay.reservations;
        let mut rows: BTreeMap<Ulid, Reservation> = self
            .tables
            .reservations_on(court_id, date)
            .into_iter()
            .filter(|r| !staged.contains_key(&r.id))
            .map(|r| (r.id, r.clone()))
            .collect();
        for r in staged.values().flatten() {
            if r.court_id == court_id && r.date == date {
                rows.insert(r.id, r.clone());
            }
        }
        rows.into_values().collect()
    }

    pub fn payments_for(&self, reservation_id: Ulid) -> Vec<Payment> {
        let staged = &self.overlay.payments;
        let mut rows: BTreeMap<Ulid, Payment> = self
            .tables
            .payments_for(reservation_id)
            .into_iter()
            .filter(|p| !staged.contains_key(&p.id))
            .map(|p| (p.id, p.clone()))
            .collect();
        for p in staged.values().flatten() {
            if p.reservation_id == reservation_id {
                rows.insert(p.id, p.clone());
            }
        }
        rows.into_values().collect()
    }
}
