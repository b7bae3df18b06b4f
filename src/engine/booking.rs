use std::time::Instant;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde_json::json;
use ulid::Ulid;

use crate::limits::{MAX_EMAIL_LEN, MAX_NAME_LEN};
use crate::locks::{court_day_key, deposit_key};
use crate::model::*;
use crate::notify::{Channel, EventKind};
use crate::observability;
use crate::roles::{Actor, Capability, authorize};
use crate::store::StoreError;

use super::conflict::{check_no_conflict, validate_interval};
use super::{BookingError, Engine, audit, audit_failure, today};

/// Fixed deposit policy: half of the total is due upfront.
pub const DEPOSIT_RATIO: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Used only when the actor is anonymous.
    pub requester_name: Option<String>,
    pub requester_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookingReceipt {
    pub reservation_id: Ulid,
    pub total_amount: Money,
    pub deposit_amount: Money,
    pub requires_payment: bool,
}

impl Engine {
    /// Claim a court slot as a `pending` reservation.
    ///
    /// The court/day lock is held from before the overlap check until after
    /// the commit, so two overlapping attempts can never both pass the check.
    pub async fn create_booking(
        &self,
        actor: &Actor,
        req: BookingRequest,
    ) -> Result<BookingReceipt, BookingError> {
        let started = Instant::now();
        let result = self.create_booking_inner(actor, &req).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::BOOKING_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(receipt) => {
                tracing::info!(
                    booking_id = %receipt.reservation_id,
                    court_id = %req.court_id,
                    date = %req.date,
                    total = receipt.total_amount,
                    "booking created"
                );
            }
            Err(e) => {
                tracing::info!(court_id = %req.court_id, date = %req.date, error = %e, "booking rejected");
                let mut tx = self.db.begin();
                tx.audit(audit_failure(
                    actor,
                    "create_booking_failed",
                    Some(("court", req.court_id)),
                    e,
                ));
                if let Err(audit_err) = tx.commit().await {
                    tracing::warn!(error = %audit_err, "failed to audit rejected booking");
                }
            }
        }
        result
    }

    async fn create_booking_inner(
        &self,
        actor: &Actor,
        req: &BookingRequest,
    ) -> Result<BookingReceipt, BookingError> {
        authorize(actor, Capability::CreateBooking)?;
        let span = validate_interval(req.date, req.start, req.end, today())?;
        let (name, email) = requester_identity(actor, req)?;

        let _guard = self
            .locks
            .acquire(&court_day_key(req.court_id, req.date), self.settings.lock_timeout)
            .await?;

        let mut tx = self.db.begin();
        let court = tx
            .get::<Court>(req.court_id)
            .filter(|c| c.active)
            .ok_or(BookingError::not_found("court", req.court_id))?;

        check_no_conflict(&tx.reservations_on(court.id, req.date), &span, None)?;

        let total_amount = court.price_per_hour * span.duration_hours();
        let deposit_amount = total_amount * DEPOSIT_RATIO;
        let reservation = Reservation {
            id: Ulid::new(),
            court_id: court.id,
            user_id: actor.user_id,
            requester_name: name,
            requester_email: email,
            date: req.date,
            span,
            status: ReservationStatus::Pending,
            payment_status: SettlementStatus::Pending,
            total_amount,
            deposit_amount,
            created_at: Utc::now(),
        };
        let id = reservation.id;
        let notice = json!({
            "booking_id": id.to_string(),
            "court_id": court.id.to_string(),
            "court_name": court.name,
            "user_name": reservation.requester_name,
            "date": req.date.to_string(),
            "start_time": span.start.format("%H:%M").to_string(),
            "end_time": span.end.format("%H:%M").to_string(),
            "created_at": reservation.created_at.to_rfc3339(),
        });

        tx.put(reservation);
        tx.audit(audit(
            actor,
            "create_booking",
            Some(("booking", id)),
            format!(
                "booking {id} for {} on {} from {} to {}",
                court.name,
                req.date,
                span.start.format("%H:%M"),
                span.end.format("%H:%M")
            ),
        ));

        if let Err(e) = tx.commit().await {
            self.record_integrity_violation("create_booking", &e).await;
            return Err(BookingError::BookingFailed(e.to_string()));
        }

        self.publish(Channel::Admin, EventKind::NewBooking, notice);
        Ok(BookingReceipt {
            reservation_id: id,
            total_amount,
            deposit_amount,
            requires_payment: true,
        })
    }

    /// Operator override of a reservation's status.
    pub async fn update_booking_status(
        &self,
        actor: &Actor,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<Reservation, BookingError> {
        authorize(actor, Capability::ManageBookings)?;
        let current = self
            .db
            .read(|t| t.reservations.get(&id).cloned())
            .ok_or(BookingError::not_found("booking", id))?;

        // Re-claiming a slot takes the same lock as a new booking.
        let _guard = if status != ReservationStatus::Cancelled && !current.holds_slot() {
            Some(
                self.locks
                    .acquire(&court_day_key(current.court_id, current.date), self.settings.lock_timeout)
                    .await?,
            )
        } else {
            None
        };

        let mut tx = self.db.begin();
        let mut reservation = tx
            .get::<Reservation>(id)
            .ok_or(BookingError::not_found("booking", id))?;
        let previous = reservation.status;
        if previous == status {
            return Ok(reservation);
        }

        match status {
            ReservationStatus::Cancelled => {
                if reservation.payment_status == SettlementStatus::Paid {
                    reservation.payment_status = SettlementStatus::Refunded;
                    if let Some(deposit) = tx
                        .payments_for(id)
                        .into_iter()
                        .find(Payment::is_completed_deposit)
                    {
                        tx.put(Payment {
                            id: Ulid::new(),
                            reservation_id: id,
                            user_id: deposit.user_id,
                            amount: deposit.amount,
                            kind: PaymentKind::Refund,
                            method: deposit.method,
                            transaction_id: deposit.transaction_id.clone(),
                            status: PaymentStatus::Refunded,
                            created_at: Utc::now(),
                            processed_at: Some(Utc::now()),
                            error_message: None,
                        });
                    }
                }
            }
            ReservationStatus::Confirmed | ReservationStatus::Pending => {
                if matches!(
                    reservation.payment_status,
                    SettlementStatus::Failed | SettlementStatus::Refunded
                ) {
                    return Err(BookingError::InvalidTransition(format!(
                        "booking {id} has payment status {}",
                        reservation.payment_status.as_str()
                    )));
                }
                if !reservation.holds_slot() {
                    check_no_conflict(
                        &tx.reservations_on(reservation.court_id, reservation.date),
                        &reservation.span,
                        Some(id),
                    )?;
                }
            }
        }
        reservation.status = status;

        tx.put(reservation.clone());
        tx.audit(audit(
            actor,
            "update_booking",
            Some(("booking", id)),
            format!("status {} -> {}", previous.as_str(), status.as_str()),
        ));
        tx.commit().await.map_err(|e| persistence(e, "update_booking"))?;

        tracing::info!(booking_id = %id, from = previous.as_str(), to = status.as_str(), "booking updated");
        self.publish_booking_updated(&reservation, Some(actor));
        Ok(reservation)
    }

    /// Hard-delete a reservation together with its payment history.
    pub async fn delete_booking(&self, actor: &Actor, id: Ulid) -> Result<(), BookingError> {
        authorize(actor, Capability::DeleteBookings)?;
        let mut tx = self.db.begin();
        let reservation = tx
            .get::<Reservation>(id)
            .ok_or(BookingError::not_found("booking", id))?;
        let payments = tx.payments_for(id);
        if payments.iter().any(Payment::is_in_flight) {
            return Err(BookingError::PaymentInProgress(id));
        }
        for p in &payments {
            tx.delete::<Payment>(p.id);
        }
        tx.delete::<Reservation>(id);
        tx.audit(audit(
            actor,
            "delete_booking",
            Some(("booking", id)),
            format!(
                "deleted booking {id} of {} ({} payments)",
                reservation.requester_name,
                payments.len()
            ),
        ));
        tx.commit().await.map_err(|e| persistence(e, "delete_booking"))?;

        tracing::info!(booking_id = %id, "booking deleted");
        self.publish(
            Channel::Admin,
            EventKind::BookingDeleted,
            json!({
                "booking_id": id.to_string(),
                "deleted_by": actor.username,
            }),
        );
        Ok(())
    }

    pub(crate) fn publish_booking_updated(&self, reservation: &Reservation, actor: Option<&Actor>) {
        let data = json!({
            "booking_id": reservation.id.to_string(),
            "status": reservation.status.as_str(),
            "payment_status": reservation.payment_status.as_str(),
            "updated_by": actor.and_then(|a| a.username.clone()),
        });
        self.publish(Channel::Admin, EventKind::BookingUpdated, data.clone());
        if let Some(user_id) = reservation.user_id {
            self.publish(Channel::User(user_id), EventKind::BookingUpdated, data);
        }
    }
}

/// Authenticated users book under their own identity; anonymous callers
/// must supply a name and email.
fn requester_identity(actor: &Actor, req: &BookingRequest) -> Result<(String, String), BookingError> {
    let name = actor
        .username
        .clone()
        .filter(|_| actor.user_id.is_some())
        .or_else(|| req.requester_name.clone())
        .map(|n| n.trim().to_string())
        .unwrap_or_default();
    let email = actor
        .email
        .clone()
        .filter(|_| actor.user_id.is_some())
        .or_else(|| req.requester_email.clone())
        .map(|e| e.trim().to_string())
        .unwrap_or_default();

    if name.is_empty() {
        return Err(BookingError::InvalidInput("requester name is required".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(BookingError::LimitExceeded("requester name too long"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(BookingError::LimitExceeded("requester email too long"));
    }
    Ok((name, email))
}

pub(crate) fn persistence(e: StoreError, context: &str) -> BookingError {
    if let StoreError::Conflict(detail) = &e {
        tracing::warn!(context, detail = %detail, "commit lost a write race");
    } else {
        tracing::error!(context, error = %e, "commit failed");
    }
    BookingError::from(e)
}

// ── Payment deadline ─────────────────────────────────────────────

impl Engine {
    /// Unpaid `pending` reservations created more than the payment deadline
    /// before `now`.
    pub fn collect_expired(&self, now: DateTime<Utc>) -> Vec<Ulid> {
        let Some(cutoff) = self.payment_cutoff(now) else {
            return Vec::new();
        };
        self.db.read(|t| {
            t.reservations
                .values()
                .filter(|r| is_unpaid_pending(r) && r.created_at <= cutoff)
                .filter(|r| !t.payments_for(r.id).iter().any(|p| p.is_in_flight()))
                .map(|r| r.id)
                .collect()
        })
    }

    /// Release one expired reservation. Returns `false` if it no longer
    /// qualifies, e.g. a deposit started in the meantime.
    pub async fn expire_reservation(&self, id: Ulid, now: DateTime<Utc>) -> Result<bool, BookingError> {
        let Some(cutoff) = self.payment_cutoff(now) else {
            return Ok(false);
        };
        let _guard = self
            .locks
            .acquire(&deposit_key(id), self.settings.lock_timeout)
            .await?;
        let mut tx = self.db.begin();
        let Some(mut reservation) = tx.get::<Reservation>(id) else {
            return Ok(false);
        };
        if !is_unpaid_pending(&reservation)
            || reservation.created_at > cutoff
            || tx.payments_for(id).iter().any(Payment::is_in_flight)
        {
            return Ok(false);
        }
        reservation.status = ReservationStatus::Cancelled;
        tx.put(reservation.clone());
        tx.audit(audit(
            &Actor::system(),
            "expire_booking",
            Some(("booking", id)),
            format!("no deposit within deadline, created {}", reservation.created_at.to_rfc3339()),
        ));
        tx.commit().await.map_err(|e| persistence(e, "expire_booking"))?;

        metrics::counter!(observability::RESERVATIONS_REAPED_TOTAL).increment(1);
        tracing::info!(booking_id = %id, "unpaid booking expired");
        self.publish_booking_updated(&reservation, None);
        Ok(true)
    }

    fn payment_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let deadline = TimeDelta::from_std(self.settings.payment_deadline).ok()?;
        now.checked_sub_signed(deadline)
    }
}

fn is_unpaid_pending(r: &Reservation) -> bool {
    r.status == ReservationStatus::Pending && r.payment_status == SettlementStatus::Pending
}
