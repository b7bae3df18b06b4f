use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{DepositRequest, PaymentMode, PaymentReceipt};
use crate::model::{Money, Payment, PaymentKind, PaymentMethod, PaymentStatus};

use super::auth::Caller;
use super::error::ApiResult;
use super::{AppState, Body, Data, data};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositBody {
    pub booking_id: Ulid,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentView {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub user_id: Ulid,
    pub amount: Money,
    pub payment_type: PaymentKind,
    pub payment_method: PaymentMethod,
    pub transaction_id: Option<String>,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl From<Payment> for PaymentView {
    fn from(p: Payment) -> Self {
        Self {
            id: p.id,
            booking_id: p.reservation_id,
            user_id: p.user_id,
            amount: p.amount,
            payment_type: p.kind,
            payment_method: p.method,
            transaction_id: p.transaction_id,
            status: p.status,
            created_at: p.created_at,
            processed_at: p.processed_at,
            error_message: p.error_message,
        }
    }
}

/// Inline settlement answers with the final state; background settlement
/// answers `202` with the pending attempt.
pub async fn deposit(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Body(body): Body<DepositBody>,
) -> ApiResult<(StatusCode, Json<Data<PaymentReceipt>>)> {
    let receipt = state
        .engine
        .process_deposit(
            &actor,
            DepositRequest {
                reservation_id: body.booking_id,
                method: body.payment_method,
            },
        )
        .await?;
    let status = match state.engine.settings().payment_mode {
        PaymentMode::Inline => StatusCode::OK,
        PaymentMode::Background => StatusCode::ACCEPTED,
    };
    Ok((status, data(receipt)))
}

pub async fn list(
    State(state): State<AppState>,
    Caller(actor): Caller,
) -> ApiResult<Json<Data<Vec<PaymentView>>>> {
    let payments = state.engine.list_payments(&actor)?;
    Ok(data(payments.into_iter().map(PaymentView::from).collect()))
}

pub async fn status(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Data<PaymentView>>> {
    Ok(data(state.engine.payment_status(&actor, id)?.into()))
}
