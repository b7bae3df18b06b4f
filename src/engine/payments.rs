use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use ulid::Ulid;

use crate::gateway::{ChargeOutcome, ChargeRequest, PaymentGateway};
use crate::locks::deposit_key;
use crate::model::*;
use crate::notify::{Channel, EventKind, NotifyHub};
use crate::observability;
use crate::roles::{Actor, Capability, authorize};
use crate::store::{Database, StoreError, Transaction};

use super::booking::persistence;
use super::{BookingError, Engine, PaymentMode, audit, audit_failure, critical_event};

#[derive(Debug, Clone)]
pub struct DepositRequest {
    pub reservation_id: Ulid,
    pub method: PaymentMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub payment_id: Ulid,
    pub booking_id: Ulid,
    pub amount: Money,
    pub payment_status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub error: Option<String>,
}

impl PaymentReceipt {
    fn of(p: &Payment) -> Self {
        Self {
            payment_id: p.id,
            booking_id: p.reservation_id,
            amount: p.amount,
            payment_status: p.status,
            transaction_id: p.transaction_id.clone(),
            error: p.error_message.clone(),
        }
    }
}

impl Engine {
    /// Open a deposit attempt and settle it, inline or on the task pool.
    ///
    /// The deposit lock only covers attempt creation. It is released before
    /// the gateway is called.
    pub async fn process_deposit(
        &self,
        actor: &Actor,
        req: DepositRequest,
    ) -> Result<PaymentReceipt, BookingError> {
        authorize(actor, Capability::PayDeposit)?;
        let user_id = actor
            .user_id
            .ok_or_else(|| BookingError::Forbidden("sign in to pay a deposit".into()))?;
        let rid = req.reservation_id;

        let payment = {
            let _guard = self
                .locks
                .acquire(&deposit_key(rid), self.settings.lock_timeout)
                .await?;
            let mut tx = self.db.begin();
            let reservation = tx
                .get::<Reservation>(rid)
                .ok_or(BookingError::not_found("booking", rid))?;
            if reservation.user_id != Some(user_id) {
                return Err(BookingError::Forbidden(format!(
                    "booking {rid} belongs to another user"
                )));
            }
            let attempts = tx.payments_for(rid);
            if reservation.payment_status == SettlementStatus::Paid
                || attempts.iter().any(Payment::is_completed_deposit)
            {
                return Err(BookingError::AlreadyPaid(rid));
            }
            if attempts
                .iter()
                .any(|p| p.kind == PaymentKind::Deposit && p.is_in_flight())
            {
                return Err(BookingError::PaymentInProgress(rid));
            }
            if !reservation.holds_slot() {
                return Err(BookingError::NotPayable(rid));
            }

            let payment = Payment {
                id: Ulid::new(),
                reservation_id: rid,
                user_id,
                amount: reservation.deposit_amount,
                kind: PaymentKind::Deposit,
                method: req.method,
                transaction_id: None,
                status: PaymentStatus::Pending,
                created_at: Utc::now(),
                processed_at: None,
                error_message: None,
            };
            tx.put(payment.clone());
            tx.audit(audit(
                actor,
                "create_payment",
                Some(("payment", payment.id)),
                format!(
                    "deposit of {:.2} via {} for booking {rid}",
                    payment.amount,
                    req.method.as_str()
                ),
            ));
            tx.commit()
                .await
                .map_err(|e| persistence(e, "create_payment"))?;
            payment
        };

        let settlement = self.settlement();
        match self.settings.payment_mode {
            PaymentMode::Inline => settlement.run(payment, actor.clone()).await,
            PaymentMode::Background => {
                let receipt = PaymentReceipt::of(&payment);
                let handle = self.tasks.submit(
                    &format!("settle_deposit {}", payment.id),
                    false,
                    settlement.run(payment, actor.clone()),
                );
                tracing::info!(payment_id = %receipt.payment_id, task_id = %handle.id(), "deposit settlement queued");
                Ok(receipt)
            }
        }
    }

    /// Current state of one payment. Owners see their own; staff see all.
    pub fn payment_status(&self, actor: &Actor, id: Ulid) -> Result<Payment, BookingError> {
        authorize(actor, Capability::ViewOwn)?;
        let payment = self
            .db
            .read(|t| t.payments.get(&id).cloned())
            .ok_or(BookingError::not_found("payment", id))?;
        if actor.role.allows(Capability::ViewAllBookings) || actor.user_id == Some(payment.user_id) {
            Ok(payment)
        } else {
            Err(BookingError::Forbidden(format!("payment {id} belongs to another user")))
        }
    }

    pub fn list_payments(&self, actor: &Actor) -> Result<Vec<Payment>, BookingError> {
        authorize(actor, Capability::ViewOwn)?;
        let all = actor.role.allows(Capability::ViewAllBookings);
        let mut payments: Vec<Payment> = self.db.read(|t| {
            t.payments
                .values()
                .filter(|p| all || actor.user_id == Some(p.user_id))
                .cloned()
                .collect()
        });
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments)
    }

    pub(super) fn settlement(&self) -> Settlement {
        Settlement {
            db: self.db.clone(),
            notify: self.notify.clone(),
            gateway: self.gateway.clone(),
            timeout: self.settings.gateway_timeout,
        }
    }
}

pub(super) enum Verdict {
    Approved(String),
    Declined(String),
    Error(String),
}

/// Final-write attempts before a settlement gives up and compensates.
const SETTLE_ATTEMPTS: u32 = 3;

/// Rows a verdict resolves to, staged but not yet committed.
pub(super) struct Settled {
    payment: Payment,
    reservation: Reservation,
    event: EventKind,
    outcome: &'static str,
}

/// Everything a settlement needs, detached from the engine so it can run
/// on the task pool.
pub(super) struct Settlement {
    db: Arc<Database>,
    notify: Arc<NotifyHub>,
    gateway: Arc<dyn PaymentGateway>,
    timeout: Duration,
}

impl Settlement {
    /// Drive one payment to a terminal state. Never abandoned midway.
    async fn run(self, payment: Payment, actor: Actor) -> Result<PaymentReceipt, BookingError> {
        let mut tx = self.db.begin();
        let mut processing = payment.clone();
        processing.status = PaymentStatus::Processing;
        tx.put(processing);
        if let Err(e) = tx.commit().await {
            let err = persistence(e, "mark_processing");
            self.compensate(&payment, &actor, &err).await;
            return Err(err);
        }

        let request = ChargeRequest {
            idempotency_key: payment.id,
            amount: payment.amount,
            method: payment.method,
        };
        let verdict = match tokio::time::timeout(self.timeout, self.gateway.charge(&request)).await {
            Ok(Ok(ChargeOutcome::Approved { transaction_id })) => Verdict::Approved(transaction_id),
            Ok(Ok(ChargeOutcome::Declined { reason })) => Verdict::Declined(reason),
            Ok(Err(e)) => Verdict::Error(e.to_string()),
            Err(_) => Verdict::Error(format!("gateway timed out after {:?}", self.timeout)),
        };

        self.finish(&payment, verdict, &actor).await
    }

    /// Record the verdict. A write race re-reads and re-decides; any other
    /// failure falls back to [`Settlement::compensate`].
    pub(super) async fn finish(
        &self,
        payment: &Payment,
        verdict: Verdict,
        actor: &Actor,
    ) -> Result<PaymentReceipt, BookingError> {
        let mut attempt = 0;
        let settled = loop {
            attempt += 1;
            let mut tx = self.db.begin();
            let settled = match self.stage(&mut tx, payment, &verdict, actor) {
                Ok(settled) => settled,
                Err(err) => {
                    drop(tx);
                    self.compensate(payment, actor, &err).await;
                    return Err(err);
                }
            };
            match tx.commit().await {
                Ok(_) => break settled,
                Err(StoreError::Conflict(detail)) if attempt < SETTLE_ATTEMPTS => {
                    tracing::warn!(payment_id = %payment.id, attempt, detail = %detail, "settlement raced another write, re-reading");
                }
                Err(e) => {
                    let err = persistence(e, "settle_payment");
                    self.compensate(payment, actor, &err).await;
                    return Err(err);
                }
            }
        };

        let Settled {
            payment,
            reservation,
            event,
            outcome,
        } = settled;
        let rid = reservation.id;
        metrics::counter!(observability::PAYMENTS_TOTAL, "outcome" => outcome).increment(1);
        tracing::info!(
            payment_id = %payment.id,
            booking_id = %rid,
            outcome,
            booking_status = reservation.status.as_str(),
            "payment settled"
        );

        let data = json!({
            "payment_id": payment.id.to_string(),
            "booking_id": rid.to_string(),
            "amount": payment.amount,
            "status": payment.status.as_str(),
            "transaction_id": payment.transaction_id,
            "error": payment.error_message,
            "booking_status": reservation.status.as_str(),
        });
        self.notify.publish(Channel::User(payment.user_id), event, data);
        self.notify.publish(
            Channel::Admin,
            EventKind::BookingUpdated,
            json!({
                "booking_id": rid.to_string(),
                "status": reservation.status.as_str(),
                "payment_status": reservation.payment_status.as_str(),
                "updated_by": actor.username,
            }),
        );

        match verdict {
            Verdict::Error(msg) => Err(BookingError::ProcessorError(msg)),
            _ => Ok(PaymentReceipt::of(&payment)),
        }
    }

    /// Stage the verdict against freshly read rows.
    pub(super) fn stage(
        &self,
        tx: &mut Transaction<'_>,
        attempt: &Payment,
        verdict: &Verdict,
        actor: &Actor,
    ) -> Result<Settled, BookingError> {
        let pid = attempt.id;
        let rid = attempt.reservation_id;
        let mut payment = tx
            .get::<Payment>(pid)
            .ok_or(BookingError::not_found("payment", pid))?;
        let mut reservation = tx
            .get::<Reservation>(rid)
            .ok_or(BookingError::not_found("booking", rid))?;
        payment.processed_at = Some(Utc::now());

        let (event, outcome) = match verdict {
            Verdict::Approved(txn) if !reservation.holds_slot() => {
                payment.status = PaymentStatus::Refunded;
                payment.transaction_id = Some(txn.clone());
                payment.error_message =
                    Some("booking was cancelled during processing; charge refunded".into());
                (EventKind::PaymentFailed, "refunded")
            }
            Verdict::Approved(txn) => {
                payment.status = PaymentStatus::Completed;
                payment.transaction_id = Some(txn.clone());
                reservation.payment_status = SettlementStatus::Paid;
                reservation.status = ReservationStatus::Confirmed;
                (EventKind::PaymentSuccessful, "approved")
            }
            Verdict::Declined(reason) => {
                payment.status = PaymentStatus::Failed;
                payment.error_message = Some(reason.clone());
                reservation.cancel_for_failed_payment();
                (EventKind::PaymentFailed, "declined")
            }
            Verdict::Error(msg) => {
                payment.status = PaymentStatus::Failed;
                payment.error_message = Some(msg.clone());
                reservation.cancel_for_failed_payment();
                (EventKind::PaymentError, "error")
            }
        };

        tx.put(payment.clone());
        tx.put(reservation.clone());
        let entry = match verdict {
            Verdict::Error(msg) => audit_failure(
                actor,
                "process_payment",
                Some(("payment", pid)),
                &BookingError::ProcessorError(msg.clone()),
            ),
            _ => audit(
                actor,
                "process_payment",
                Some(("payment", pid)),
                format!(
                    "deposit {:.2} for booking {rid}: {}",
                    payment.amount,
                    payment.status.as_str()
                ),
            ),
        };
        tx.audit(entry);

        Ok(Settled {
            payment,
            reservation,
            event,
            outcome,
        })
    }

    /// The verdict could not be recorded. Fail the attempt in a fresh
    /// transaction, release the slot unless the booking is already paid,
    /// and tell the payer either way.
    async fn compensate(&self, attempt: &Payment, actor: &Actor, cause: &BookingError) {
        let pid = attempt.id;
        let rid = attempt.reservation_id;
        let message = format!("payment could not be recorded: {cause}");

        let mut tx = self.db.begin();
        if let Some(mut payment) = tx.get::<Payment>(pid)
            && payment.is_in_flight()
        {
            payment.status = PaymentStatus::Failed;
            payment.processed_at = Some(Utc::now());
            payment.error_message = Some(message.clone());
            tx.put(payment);
        }
        if let Some(mut reservation) = tx.get::<Reservation>(rid)
            && reservation.holds_slot()
            && reservation.payment_status != SettlementStatus::Paid
        {
            reservation.cancel_for_failed_payment();
            tx.put(reservation);
        }
        tx.audit(audit_failure(
            actor,
            "process_payment",
            Some(("payment", pid)),
            cause,
        ));
        tx.critical(critical_event(
            "payment_not_recorded",
            format!("payment {pid} for booking {rid}: {cause}"),
            Severity::High,
            json!({ "payment_id": pid.to_string(), "booking_id": rid.to_string() }),
        ));
        match tx.commit().await {
            Ok(_) => tracing::warn!(payment_id = %pid, booking_id = %rid, error = %cause, "payment compensated"),
            Err(e) => tracing::error!(payment_id = %pid, booking_id = %rid, error = %e, "payment compensation failed"),
        }

        metrics::counter!(observability::PAYMENTS_TOTAL, "outcome" => "error").increment(1);
        self.notify.publish(
            Channel::User(attempt.user_id),
            EventKind::PaymentError,
            json!({
                "payment_id": pid.to_string(),
                "booking_id": rid.to_string(),
                "amount": attempt.amount,
                "status": PaymentStatus::Failed.as_str(),
                "error": message,
            }),
        );
    }
}
