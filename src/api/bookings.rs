use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::BookingRequest;
use crate::model::{Money, Reservation, ReservationStatus, SettlementStatus};

use super::auth::Caller;
use super::error::ApiResult;
use super::{AppState, Body, Data, data, format_time, parse_time};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBookingBody {
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
    pub requester_name: Option<String>,
    pub requester_email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingCreated {
    pub booking_id: Ulid,
    pub total_amount: Money,
    pub deposit_amount: Money,
    pub requires_payment: bool,
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub status: ReservationStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingView {
    pub id: Ulid,
    pub court_id: Ulid,
    pub user_id: Option<Ulid>,
    pub requester_name: String,
    pub requester_email: String,
    pub date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
    pub status: ReservationStatus,
    pub payment_status: SettlementStatus,
    pub total_amount: Money,
    pub deposit_amount: Money,
    pub created_at: DateTime<Utc>,
}

impl From<Reservation> for BookingView {
    fn from(r: Reservation) -> Self {
        Self {
            id: r.id,
            court_id: r.court_id,
            user_id: r.user_id,
            requester_name: r.requester_name,
            requester_email: r.requester_email,
            date: r.date,
            start_time: format_time(r.span.start),
            end_time: format_time(r.span.end),
            status: r.status,
            payment_status: r.payment_status,
            total_amount: r.total_amount,
            deposit_amount: r.deposit_amount,
            created_at: r.created_at,
        }
    }
}

pub(crate) fn views(bookings: Vec<Reservation>) -> Vec<BookingView> {
    bookings.into_iter().map(BookingView::from).collect()
}

pub async fn create(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Body(body): Body<CreateBookingBody>,
) -> ApiResult<(StatusCode, Json<Data<BookingCreated>>)> {
    let req = BookingRequest {
        court_id: body.court_id,
        date: body.date,
        start: parse_time("startTime", &body.start_time)?,
        end: parse_time("endTime", &body.end_time)?,
        requester_name: body.requester_name,
        requester_email: body.requester_email,
    };
    let receipt = state.engine.create_booking(&actor, req).await?;
    Ok((
        StatusCode::CREATED,
        data(BookingCreated {
            booking_id: receipt.reservation_id,
            total_amount: receipt.total_amount,
            deposit_amount: receipt.deposit_amount,
            requires_payment: receipt.requires_payment,
        }),
    ))
}

pub async fn list(
    State(state): State<AppState>,
    Caller(actor): Caller,
) -> ApiResult<Json<Data<Vec<BookingView>>>> {
    Ok(data(views(state.engine.list_bookings(&actor)?)))
}

pub async fn show(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Data<BookingView>>> {
    Ok(data(state.engine.get_booking(&actor, id)?.into()))
}

pub async fn update_status(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<Ulid>,
    Body(body): Body<StatusBody>,
) -> ApiResult<Json<Data<BookingView>>> {
    let updated = state
        .engine
        .update_booking_status(&actor, id, body.status)
        .await?;
    Ok(data(updated.into()))
}

pub async fn delete(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Data<Ulid>>> {
    state.engine.delete_booking(&actor, id).await?;
    Ok(data(id))
}
