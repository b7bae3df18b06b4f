use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::Serialize;
use ulid::Ulid;

use crate::limits::MAX_RATING;
use crate::model::*;
use crate::observability;
use crate::roles::{Actor, Capability, authorize};
use crate::store::{Tables, Transaction};

use super::booking::persistence;
use super::{BookingError, Engine, audit, today};

const ALL_KINDS: [IssueKind; 7] = [
    IssueKind::OrphanCourt,
    IssueKind::OrphanUser,
    IssueKind::StalePending,
    IssueKind::StalePayment,
    IssueKind::InvalidEmail,
    IssueKind::NegativePrice,
    IssueKind::RatingOutOfRange,
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckSummary {
    pub issues_found: usize,
    pub issues: Vec<IntegrityReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityStats {
    pub detected: usize,
    pub fixed: usize,
    pub ignored: usize,
    /// Open (`detected`) reports per severity.
    pub open_by_severity: BTreeMap<Severity, usize>,
}

/// Point-in-time thresholds for one scan.
struct Scan {
    today: NaiveDate,
    now: DateTime<Utc>,
    stale_after: TimeDelta,
}

impl Scan {
    fn is_stale(&self, p: &Payment) -> bool {
        p.is_in_flight() && self.now - p.created_at > self.stale_after
    }

    /// Ids of rows currently exhibiting `kind`.
    fn affected(&self, t: &Tables, kind: IssueKind) -> Vec<Ulid> {
        match kind {
            IssueKind::OrphanCourt => t
                .reservations
                .values()
                .filter(|r| r.holds_slot() && !t.courts.contains_key(&r.court_id))
                .map(|r| r.id)
                .collect(),
            IssueKind::OrphanUser => t
                .reservations
                .values()
                .filter(|r| r.user_id.is_some_and(|u| !t.users.contains_key(&u)))
                .map(|r| r.id)
                .collect(),
            IssueKind::StalePending => t
                .reservations
                .values()
                .filter(|r| r.status == ReservationStatus::Pending && r.date < self.today)
                .map(|r| r.id)
                .collect(),
            IssueKind::StalePayment => t
                .payments
                .values()
                .filter(|p| self.is_stale(p))
                .map(|p| p.id)
                .collect(),
            IssueKind::InvalidEmail => t
                .users
                .values()
                .filter(|u| !plausible_email(&u.email))
                .map(|u| u.id)
                .collect(),
            IssueKind::NegativePrice => t
                .courts
                .values()
                .filter(|c| c.price_per_hour < 0.0)
                .map(|c| c.id)
                .collect(),
            IssueKind::RatingOutOfRange => t
                .courts
                .values()
                .filter(|c| !(0.0..=MAX_RATING).contains(&c.rating))
                .map(|c| c.id)
                .collect(),
        }
    }
}

fn describe(kind: IssueKind, count: usize) -> String {
    match kind {
        IssueKind::OrphanCourt => format!("{count} active reservations reference a missing court"),
        IssueKind::OrphanUser => format!("{count} reservations reference a missing user"),
        IssueKind::StalePending => format!("{count} pending reservations are in the past"),
        IssueKind::StalePayment => format!("{count} payments are stuck in flight"),
        IssueKind::InvalidEmail => format!("{count} users have an invalid email"),
        IssueKind::NegativePrice => format!("{count} courts have a negative price"),
        IssueKind::RatingOutOfRange => format!("{count} courts have a rating outside [0, 5]"),
    }
}

/// `local@domain.tld` with no whitespace.
fn plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !email.chars().any(char::is_whitespace)
        && !domain.contains('@')
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
}

/// Release a reservation without leaving `paid` on a cancelled row.
fn release(r: &mut Reservation) {
    r.status = ReservationStatus::Cancelled;
    if r.payment_status == SettlementStatus::Paid {
        r.payment_status = SettlementStatus::Refunded;
    }
}

impl Engine {
    fn scan(&self) -> Scan {
        Scan {
            today: today(),
            now: Utc::now(),
            stale_after: TimeDelta::from_std(self.settings.stale_payment).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Scan every table for drift and record one `detected` report per kind.
    ///
    /// An open report of the same kind is refreshed in place rather than
    /// duplicated.
    pub async fn run_check(&self, actor: &Actor) -> Result<CheckSummary, BookingError> {
        authorize(actor, Capability::RunIntegrity)?;
        let scan = self.scan();
        let findings: Vec<(IssueKind, Vec<Ulid>)> = self.db.read(|t| {
            ALL_KINDS
                .iter()
                .map(|&kind| (kind, scan.affected(t, kind)))
                .filter(|(_, ids)| !ids.is_empty())
                .collect()
        });

        let mut tx = self.db.begin();
        let mut issues = Vec::with_capacity(findings.len());
        for (kind, affected) in findings {
            let description = describe(kind, affected.len());
            let open = tx
                .find::<IntegrityReport>(|r| r.status == ReportStatus::Detected && r.kind == kind)
                .into_iter()
                .next();
            let report = match open {
                Some(mut existing) => {
                    if existing.affected != affected {
                        existing.affected = affected;
                        existing.description = description;
                        tx.put(existing.clone());
                    }
                    existing
                }
                None => {
                    let report = IntegrityReport {
                        id: Ulid::new(),
                        kind,
                        description,
                        affected,
                        status: ReportStatus::Detected,
                        created_at: scan.now,
                        fixed_at: None,
                        fixed_by: None,
                    };
                    tracing::warn!(
                        check_type = kind.check_type(),
                        table = kind.table(),
                        severity = kind.severity().as_str(),
                        affected = report.affected.len(),
                        "integrity issue detected"
                    );
                    tx.put(report.clone());
                    report
                }
            };
            issues.push(report);
        }
        tx.audit(audit(
            actor,
            "integrity_check",
            None,
            format!("{} issues found", issues.len()),
        ));
        tx.commit().await.map_err(|e| persistence(e, "integrity_check"))?;

        self.record_open_issues();
        Ok(CheckSummary {
            issues_found: issues.len(),
            issues,
        })
    }

    /// Repair the rows a report names, re-verifying each against current state.
    pub async fn apply_fix(&self, actor: &Actor, id: Ulid) -> Result<IntegrityReport, BookingError> {
        authorize(actor, Capability::RunIntegrity)?;
        let scan = self.scan();
        let mut tx = self.db.begin();
        let mut report = open_report(&tx, id)?;
        if !report.kind.auto_fixable() {
            return Err(BookingError::InvalidInput(format!(
                "{} issues need manual review: {}",
                report.kind.check_type(),
                report.kind.fix_description()
            )));
        }

        let mut touched: Vec<Reservation> = Vec::new();
        let mut repaired = 0usize;
        for &row in &report.affected {
            match report.kind {
                IssueKind::OrphanCourt => {
                    if let Some(mut r) = tx.get::<Reservation>(row)
                        && r.holds_slot()
                        && tx.get::<Court>(r.court_id).is_none()
                    {
                        release(&mut r);
                        tx.put(r.clone());
                        touched.push(r);
                        repaired += 1;
                    }
                }
                IssueKind::OrphanUser => {
                    if let Some(mut r) = tx.get::<Reservation>(row)
                        && r.user_id.is_some_and(|u| tx.get::<User>(u).is_none())
                    {
                        r.user_id = None;
                        tx.put(r);
                        repaired += 1;
                    }
                }
                IssueKind::StalePending => {
                    if let Some(mut r) = tx.get::<Reservation>(row)
                        && r.status == ReservationStatus::Pending
                        && r.date < scan.today
                    {
                        release(&mut r);
                        tx.put(r.clone());
                        touched.push(r);
                        repaired += 1;
                    }
                }
                IssueKind::StalePayment => {
                    if let Some(mut p) = tx.get::<Payment>(row)
                        && scan.is_stale(&p)
                    {
                        p.status = PaymentStatus::Failed;
                        p.processed_at = Some(scan.now);
                        p.error_message = Some("payment stalled and was failed by integrity fix".into());
                        if let Some(mut r) = tx.get::<Reservation>(p.reservation_id)
                            && r.payment_status != SettlementStatus::Paid
                        {
                            r.cancel_for_failed_payment();
                            tx.put(r.clone());
                            touched.push(r);
                        }
                        tx.put(p);
                        repaired += 1;
                    }
                }
                IssueKind::NegativePrice => {
                    if let Some(mut c) = tx.get::<Court>(row)
                        && c.price_per_hour < 0.0
                    {
                        c.price_per_hour = c.price_per_hour.abs();
                        tx.put(c);
                        repaired += 1;
                    }
                }
                IssueKind::RatingOutOfRange => {
                    if let Some(mut c) = tx.get::<Court>(row)
                        && !(0.0..=MAX_RATING).contains(&c.rating)
                    {
                        c.rating = if c.rating.is_nan() {
                            0.0
                        } else {
                            c.rating.clamp(0.0, MAX_RATING)
                        };
                        tx.put(c);
                        repaired += 1;
                    }
                }
                IssueKind::InvalidEmail => {}
            }
        }
        report.status = ReportStatus::Fixed;
        report.fixed_at = Some(scan.now);
        report.fixed_by = actor.user_id;
        tx.put(report.clone());
        tx.audit(audit(
            actor,
            "apply_integrity_fix",
            Some(("integrity_report", id)),
            format!("{}: {repaired} rows repaired", report.kind.fix_description()),
        ));
        tx.commit().await.map_err(|e| persistence(e, "apply_integrity_fix"))?;

        tracing::info!(report_id = %id, kind = ?report.kind, repaired, "integrity fix applied");
        for r in &touched {
            self.publish_booking_updated(r, Some(actor));
        }
        self.record_open_issues();
        Ok(report)
    }

    /// Close a report without touching the data it names.
    pub async fn ignore_issue(&self, actor: &Actor, id: Ulid) -> Result<IntegrityReport, BookingError> {
        authorize(actor, Capability::RunIntegrity)?;
        let mut tx = self.db.begin();
        let mut report = open_report(&tx, id)?;
        report.status = ReportStatus::Ignored;
        tx.put(report.clone());
        tx.audit(audit(
            actor,
            "ignore_integrity_issue",
            Some(("integrity_report", id)),
            report.description.clone(),
        ));
        tx.commit().await.map_err(|e| persistence(e, "ignore_integrity_issue"))?;
        self.record_open_issues();
        Ok(report)
    }

    /// Reports newest first, optionally filtered by status.
    pub fn list_reports(
        &self,
        actor: &Actor,
        status: Option<ReportStatus>,
    ) -> Result<Vec<IntegrityReport>, BookingError> {
        authorize(actor, Capability::RunIntegrity)?;
        let mut reports: Vec<IntegrityReport> = self.db.read(|t| {
            t.reports
                .values()
                .filter(|r| status.is_none_or(|s| r.status == s))
                .cloned()
                .collect()
        });
        reports.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(reports)
    }

    pub fn integrity_stats(&self, actor: &Actor) -> Result<IntegrityStats, BookingError> {
        authorize(actor, Capability::RunIntegrity)?;
        Ok(self.db.read(|t| {
            let mut stats = IntegrityStats::default();
            for r in t.reports.values() {
                match r.status {
                    ReportStatus::Detected => {
                        stats.detected += 1;
                        *stats.open_by_severity.entry(r.kind.severity()).or_default() += 1;
                    }
                    ReportStatus::Fixed => stats.fixed += 1,
                    ReportStatus::Ignored => stats.ignored += 1,
                }
            }
            stats
        }))
    }

    fn record_open_issues(&self) {
        let open = self.db.read(|t| {
            t.reports
                .values()
                .filter(|r| r.status == ReportStatus::Detected)
                .count()
        });
        metrics::gauge!(observability::INTEGRITY_ISSUES_OPEN).set(open as f64);
    }
}

fn open_report(tx: &Transaction<'_>, id: Ulid) -> Result<IntegrityReport, BookingError> {
    let report = tx
        .get::<IntegrityReport>(id)
        .ok_or(BookingError::not_found("integrity report", id))?;
    if report.status != ReportStatus::Detected {
        return Err(BookingError::InvalidTransition(format!(
            "report {id} is already {}",
            report.status.as_str()
        )));
    }
    Ok(report)
}
