//! HTTP and WebSocket surface over the booking engine.

pub mod auth;
mod bookings;
mod courts;
pub mod error;
mod integrity;
mod payments;
mod tasks;
mod ws;

use std::sync::Arc;

use axum::extract::{FromRequest, Request, State};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::NaiveTime;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::Engine;

use auth::SessionProvider;
use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub sessions: Arc<dyn SessionProvider>,
}

/// `{ "success": true, "data": ... }`, the envelope every success uses.
#[derive(Debug, Serialize)]
pub struct Data<T: Serialize> {
    pub success: bool,
    pub data: T,
}

pub fn data<T: Serialize>(data: T) -> Json<Data<T>> {
    Json(Data {
        success: true,
        data,
    })
}

/// A JSON request body. Malformed or mistyped bodies are rejected with the
/// usual error envelope instead of axum's plain-text 4xx.
#[derive(Debug)]
pub struct Body<T>(pub T);

impl<S, T> FromRequest<S> for Body<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Body(value)),
            Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
        }
    }
}

/// Accepts `HH:MM` and `HH:MM:SS`.
pub(crate) fn parse_time(field: &str, value: &str) -> Result<NaiveTime, ApiError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| ApiError::BadRequest(format!("{field} must look like HH:MM, got {value:?}")))
}

pub(crate) fn format_time(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/courts", get(courts::list).post(courts::create))
        .route("/courts/{id}", patch(courts::update).delete(courts::retire))
        .route("/courts/{id}/availability", get(courts::availability))
        .route("/courts/{id}/schedule", get(courts::schedule))
        .route("/bookings", get(bookings::list).post(bookings::create))
        .route(
            "/bookings/{id}",
            get(bookings::show)
                .patch(bookings::update_status)
                .delete(bookings::delete),
        )
        .route("/payments", get(payments::list))
        .route("/payments/deposit", post(payments::deposit))
        .route("/payments/{id}/status", get(payments::status))
        .route("/integrity/check", post(integrity::check))
        .route("/integrity/reports", get(integrity::reports))
        .route("/integrity/stats", get(integrity::stats))
        .route("/integrity/fix/{id}", post(integrity::fix))
        .route("/integrity/ignore/{id}", post(integrity::ignore))
        .route("/tasks", get(tasks::list))
        .route("/tasks/integrity-check", post(tasks::integrity_check))
        .route("/tasks/{id}", get(tasks::show).delete(tasks::cancel))
        .route("/ws", get(ws::upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "locksHeld": state.engine.locks.held_count(),
        "activeTasks": state.engine.tasks.active_count(),
    }))
}
