use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{CourtPatch, NewCourt};
use crate::model::{Court, Money, Span};

use super::auth::Caller;
use super::bookings::{BookingView, views};
use super::error::ApiResult;
use super::{AppState, Body, Data, data, format_time};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCourtBody {
    pub name: String,
    pub location: String,
    pub court_type: String,
    pub price_per_hour: Money,
    #[serde(default)]
    pub rating: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCourtBody {
    pub name: Option<String>,
    pub location: Option<String>,
    pub price_per_hour: Option<Money>,
    pub rating: Option<f64>,
    pub active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct RetireParams {
    #[serde(default)]
    pub hard: bool,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityParams {
    pub date: NaiveDate,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourtView {
    pub id: Ulid,
    pub name: String,
    pub location: String,
    pub court_type: String,
    pub price_per_hour: Money,
    pub rating: f64,
    pub active: bool,
}

impl From<Court> for CourtView {
    fn from(c: Court) -> Self {
        Self {
            id: c.id,
            name: c.name,
            location: c.location,
            court_type: c.court_type,
            price_per_hour: c.price_per_hour,
            rating: c.rating,
            active: c.active,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeSlot {
    pub start_time: String,
    pub end_time: String,
}

impl From<Span> for FreeSlot {
    fn from(s: Span) -> Self {
        Self {
            start_time: format_time(s.start),
            end_time: format_time(s.end),
        }
    }
}

pub async fn list(State(state): State<AppState>) -> Json<Data<Vec<CourtView>>> {
    data(state.engine.list_courts().into_iter().map(CourtView::from).collect())
}

pub async fn create(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Body(body): Body<CreateCourtBody>,
) -> ApiResult<(StatusCode, Json<Data<CourtView>>)> {
    let court = state
        .engine
        .create_court(
            &actor,
            NewCourt {
                name: body.name,
                location: body.location,
                court_type: body.court_type,
                price_per_hour: body.price_per_hour,
                rating: body.rating,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, data(court.into())))
}

pub async fn update(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<Ulid>,
    Body(body): Body<UpdateCourtBody>,
) -> ApiResult<Json<Data<CourtView>>> {
    let patch = CourtPatch {
        name: body.name,
        location: body.location,
        price_per_hour: body.price_per_hour,
        rating: body.rating,
        active: body.active,
    };
    Ok(data(state.engine.update_court(&actor, id, patch).await?.into()))
}

pub async fn retire(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<Ulid>,
    Query(params): Query<RetireParams>,
) -> ApiResult<Json<Data<Ulid>>> {
    state.engine.retire_court(&actor, id, params.hard).await?;
    Ok(data(id))
}

pub async fn availability(
    State(state): State<AppState>,
    Path(id): Path<Ulid>,
    Query(params): Query<AvailabilityParams>,
) -> ApiResult<Json<Data<Vec<FreeSlot>>>> {
    let free = state.engine.availability(id, params.date)?;
    Ok(data(free.into_iter().map(FreeSlot::from).collect()))
}

pub async fn schedule(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Data<Vec<BookingView>>>> {
    Ok(data(views(state.engine.court_schedule(&actor, id)?)))
}
