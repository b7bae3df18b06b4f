use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::roles::Role;

/// Currency amounts. Prices are per hour; totals may be fractional.
pub type Money = f64;

/// Half-open interval `[start, end)` within a single calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Span {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Returns `None` for zero or negative durations.
    pub fn try_new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_hours(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 3600.0
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Courts & users ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Court {
    pub id: Ulid,
    pub name: String,
    pub location: String,
    pub court_type: String,
    pub price_per_hour: Money,
    /// Expected in `[0, 5]`; drift is repaired by the integrity auditor.
    pub rating: f64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

/// Payment state as seen from the reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "pending",
            SettlementStatus::Paid => "paid",
            SettlementStatus::Failed => "failed",
            SettlementStatus::Refunded => "refunded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub court_id: Ulid,
    pub user_id: Option<Ulid>,
    pub requester_name: String,
    pub requester_email: String,
    pub date: NaiveDate,
    pub span: Span,
    pub status: ReservationStatus,
    pub payment_status: SettlementStatus,
    pub total_amount: Money,
    pub deposit_amount: Money,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    /// Only non-cancelled reservations occupy their slot.
    pub fn holds_slot(&self) -> bool {
        self.status != ReservationStatus::Cancelled
    }

    /// Compensating transition: the slot goes back to the pool.
    pub fn cancel_for_failed_payment(&mut self) {
        self.status = ReservationStatus::Cancelled;
        self.payment_status = SettlementStatus::Failed;
    }
}

// ── Payments ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Deposit,
    Full,
    Refund,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Deposit => "deposit",
            PaymentKind::Full => "full",
            PaymentKind::Refund => "refund",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    CreditCard,
    DebitCard,
    Cash,
    Transfer,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::CreditCard => "credit_card",
            PaymentMethod::DebitCard => "debit_card",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Transfer => "transfer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed | PaymentStatus::Failed | PaymentStatus::Refunded
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub user_id: Ulid,
    pub amount: Money,
    pub kind: PaymentKind,
    pub method: PaymentMethod,
    pub transaction_id: Option<String>,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Payment {
    pub fn is_in_flight(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_completed_deposit(&self) -> bool {
        self.kind == PaymentKind::Deposit && self.status == PaymentStatus::Completed
    }
}

// ── Audit trail ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Ulid,
    pub user_id: Option<Ulid>,
    pub username: Option<String>,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<Ulid>,
    pub details: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalEvent {
    pub id: Ulid,
    pub event_type: String,
    pub description: String,
    pub severity: Severity,
    /// JSON text; kept as a string so the WAL stays self-describing-free.
    pub additional_data: Option<String>,
    pub at: DateTime<Utc>,
}

// ── Integrity reports ────────────────────────────────────────────

/// Every anomaly the auditor knows how to detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    OrphanCourt,
    OrphanUser,
    StalePending,
    StalePayment,
    InvalidEmail,
    NegativePrice,
    RatingOutOfRange,
}

impl IssueKind {
    pub fn check_type(&self) -> &'static str {
        match self {
            IssueKind::OrphanCourt | IssueKind::OrphanUser => "foreign_keys",
            IssueKind::StalePending | IssueKind::StalePayment | IssueKind::InvalidEmail => {
                "data_consistency"
            }
            IssueKind::NegativePrice | IssueKind::RatingOutOfRange => "formats",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            IssueKind::OrphanCourt | IssueKind::OrphanUser | IssueKind::StalePending => {
                "reservations"
            }
            IssueKind::StalePayment => "payments",
            IssueKind::InvalidEmail => "users",
            IssueKind::NegativePrice | IssueKind::RatingOutOfRange => "courts",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            IssueKind::OrphanCourt | IssueKind::NegativePrice | IssueKind::StalePayment => {
                Severity::High
            }
            IssueKind::OrphanUser | IssueKind::StalePending => Severity::Medium,
            IssueKind::InvalidEmail | IssueKind::RatingOutOfRange => Severity::Low,
        }
    }

    pub fn auto_fixable(&self) -> bool {
        !matches!(self, IssueKind::InvalidEmail)
    }

    pub fn fix_description(&self) -> &'static str {
        match self {
            IssueKind::OrphanCourt => "cancel reservations whose court no longer exists",
            IssueKind::OrphanUser => "clear the user reference of orphaned reservations",
            IssueKind::StalePending => "cancel pending reservations whose date has passed",
            IssueKind::StalePayment => "fail stuck payments and cancel their reservations",
            IssueKind::InvalidEmail => "review and correct user emails manually",
            IssueKind::NegativePrice => "replace negative prices with their absolute value",
            IssueKind::RatingOutOfRange => "clamp ratings into [0, 5]",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Detected,
    Fixed,
    Ignored,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Detected => "detected",
            ReportStatus::Fixed => "fixed",
            ReportStatus::Ignored => "ignored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub id: Ulid,
    pub kind: IssueKind,
    pub description: String,
    pub affected: Vec<Ulid>,
    pub status: ReportStatus,
    pub created_at: DateTime<Utc>,
    pub fixed_at: Option<DateTime<Utc>>,
    pub fixed_by: Option<Ulid>,
}

// ── WAL record format ────────────────────────────────────────────

/// A single row mutation. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    CourtPut(Court),
    CourtDeleted { id: Ulid },
    UserPut(User),
    UserDeleted { id: Ulid },
    ReservationPut(Reservation),
    ReservationDeleted { id: Ulid },
    PaymentPut(Payment),
    PaymentDeleted { id: Ulid },
    AuditAppended(AuditEntry),
    CriticalEventAppended(CriticalEvent),
    ReportPut(IntegrityReport),
    ReportDeleted { id: Ulid },
}

impl Change {
    /// Id of the table row this change writes. Log appends have none.
    pub fn row_id(&self) -> Option<Ulid> {
        match self {
            Change::CourtPut(c) => Some(c.id),
            Change::UserPut(u) => Some(u.id),
            Change::ReservationPut(r) => Some(r.id),
            Change::PaymentPut(p) => Some(p.id),
            Change::ReportPut(r) => Some(r.id),
            Change::CourtDeleted { id }
            | Change::UserDeleted { id }
            | Change::ReservationDeleted { id }
            | Change::PaymentDeleted { id }
            | Change::ReportDeleted { id } => Some(*id),
            Change::AuditAppended(_) | Change::CriticalEventAppended(_) => None,
        }
    }
}

/// One committed transaction. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub seq: u64,
    pub changes: Vec<Change>,
}
