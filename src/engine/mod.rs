mod availability;
mod booking;
mod conflict;
mod courts;
mod error;
mod integrity;
mod payments;
mod queries;

pub use availability::{free_spans, merge_overlapping, subtract_intervals};
pub use booking::{BookingReceipt, BookingRequest, DEPOSIT_RATIO};
pub use conflict::{check_no_conflict, find_conflict};
pub use courts::{CourtPatch, NewCourt};
pub use error::BookingError;
pub use integrity::{CheckSummary, IntegrityStats};
pub use payments::{DepositRequest, PaymentReceipt};

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveTime, Utc};
use ulid::Ulid;

use crate::gateway::PaymentGateway;
use crate::locks::LockRegistry;
use crate::model::*;
use crate::notify::{Channel, EventKind, NotifyHub};
use crate::roles::Actor;
use crate::store::{Database, StoreError};
use crate::tasks::TaskPool;

/// Whether deposit settlement runs inside the request or on the task pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMode {
    Inline,
    Background,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub lock_timeout: Duration,
    pub payment_mode: PaymentMode,
    pub gateway_timeout: Duration,
    /// Unpaid pending reservations older than this are released by the reaper.
    pub payment_deadline: Duration,
    /// Payments stuck in flight longer than this are reported by the auditor.
    pub stale_payment: Duration,
    pub opening: NaiveTime,
    pub closing: NaiveTime,
    /// Background jobs allowed to run at once.
    pub worker_pool_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            payment_mode: PaymentMode::Inline,
            gateway_timeout: Duration::from_secs(10),
            payment_deadline: Duration::from_secs(15 * 60),
            stale_payment: Duration::from_secs(30 * 60),
            opening: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN),
            closing: NaiveTime::from_hms_opt(23, 0, 0).unwrap_or(NaiveTime::MIN),
            worker_pool_size: 10,
        }
    }
}

/// The booking core. Owns every reservation and payment state transition.
pub struct Engine {
    pub db: Arc<Database>,
    pub locks: Arc<LockRegistry>,
    pub notify: Arc<NotifyHub>,
    pub tasks: TaskPool,
    gateway: Arc<dyn PaymentGateway>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        db: Arc<Database>,
        notify: Arc<NotifyHub>,
        gateway: Arc<dyn PaymentGateway>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            db,
            locks: Arc::new(LockRegistry::new()),
            notify,
            tasks: TaskPool::new(settings.worker_pool_size),
            gateway,
            settings,
        }
    }

    pub fn with_locks(mut self, locks: Arc<LockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Insert or refresh a user known to the session provider.
    pub async fn register_user(&self, user: User) -> Result<(), BookingError> {
        let mut tx = self.db.begin();
        let unchanged = tx.get::<User>(user.id).is_some_and(|u| {
            u.username == user.username && u.email == user.email && u.role == user.role
        });
        if unchanged {
            return Ok(());
        }
        tx.put(user);
        tx.commit().await?;
        Ok(())
    }

    /// Best-effort: notification is never allowed to fail the caller.
    pub(crate) fn publish(&self, channel: Channel, event: EventKind, data: serde_json::Value) {
        self.notify.publish(channel, event, data);
    }

    /// Record a store constraint violation as a critical event and alert staff.
    pub(crate) async fn record_integrity_violation(&self, context: &str, err: &StoreError) {
        let StoreError::Constraint(detail) = err else {
            return;
        };
        tracing::error!(context, detail = %detail, "integrity violation");
        let event = critical_event(
            "integrity_violation",
            format!("{context}: {detail}"),
            Severity::Critical,
            serde_json::json!({ "context": context }),
        );
        let payload = serde_json::json!({
            "id": event.id.to_string(),
            "event_type": event.event_type,
            "description": event.description,
            "severity": event.severity.as_str(),
        });
        let mut tx = self.db.begin();
        tx.critical(event);
        if let Err(e) = tx.commit().await {
            tracing::error!(error = %e, "failed to persist critical event");
        }
        self.publish(Channel::Admin, EventKind::CriticalEvent, payload);
    }
}

pub(crate) fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Audit row for a successful action.
pub(crate) fn audit(
    actor: &Actor,
    action: &str,
    resource: Option<(&str, Ulid)>,
    details: impl Into<String>,
) -> AuditEntry {
    AuditEntry {
        id: Ulid::new(),
        user_id: actor.user_id,
        username: actor.username.clone(),
        action: action.to_string(),
        resource_type: resource.map(|(kind, _)| kind.to_string()),
        resource_id: resource.map(|(_, id)| id),
        details: Some(details.into()),
        success: true,
        error_message: None,
        at: Utc::now(),
    }
}

/// Audit row for a rejected or failed action.
pub(crate) fn audit_failure(
    actor: &Actor,
    action: &str,
    resource: Option<(&str, Ulid)>,
    error: &BookingError,
) -> AuditEntry {
    AuditEntry {
        success: false,
        details: None,
        error_message: Some(error.to_string()),
        ..audit(actor, action, resource, "")
    }
}

pub(crate) fn critical_event(
    event_type: &str,
    description: String,
    severity: Severity,
    data: serde_json::Value,
) -> CriticalEvent {
    CriticalEvent {
        id: Ulid::new(),
        event_type: event_type.to_string(),
        description,
        severity,
        additional_data: Some(data.to_string()),
        at: Utc::now(),
    }
}
