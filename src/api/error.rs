use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::engine::BookingError;
use crate::tasks::TaskError;

/// Everything a handler can fail with.
///
/// Domain outcomes come through [`BookingError`]; the rest are transport
/// concerns the engine never sees.
#[derive(Debug)]
pub enum ApiError {
    Booking(BookingError),
    Task(TaskError),
    Unauthorized(String),
    BadRequest(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<BookingError> for ApiError {
    fn from(e: BookingError) -> Self {
        ApiError::Booking(e)
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        ApiError::Task(e)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Booking(e) => write!(f, "{e}"),
            ApiError::Task(e) => write!(f, "{e}"),
            ApiError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            ApiError::BadRequest(msg) => write!(f, "bad request: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

fn booking_status(e: &BookingError) -> StatusCode {
    match e {
        BookingError::InvalidInterval(_)
        | BookingError::InvalidInput(_)
        | BookingError::AlreadyPaid(_)
        | BookingError::InvalidTransition(_)
        | BookingError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
        BookingError::Forbidden(_) => StatusCode::FORBIDDEN,
        BookingError::NotFound { .. } => StatusCode::NOT_FOUND,
        BookingError::Conflict { .. }
        | BookingError::ConcurrentModification(_)
        | BookingError::PaymentInProgress(_)
        | BookingError::NotPayable(_) => StatusCode::CONFLICT,
        BookingError::ProcessorError(_)
        | BookingError::PersistenceError(_)
        | BookingError::BookingFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        BookingError::LockTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Booking(e) => {
                let status = booking_status(e);
                // Store and processor internals stay in the log.
                let message = match e {
                    BookingError::PersistenceError(detail) | BookingError::BookingFailed(detail) => {
                        tracing::error!(error = %detail, code = e.code(), "request failed");
                        "the booking could not be saved, please try again".to_string()
                    }
                    _ => e.to_string(),
                };
                (status, e.code(), message)
            }
            ApiError::Task(e) => {
                let status = match e {
                    TaskError::NotFound(_) => StatusCode::NOT_FOUND,
                    TaskError::NotCancellable(_) => StatusCode::CONFLICT,
                    TaskError::Cancelled | TaskError::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let code = match e {
                    TaskError::NotFound(_) => "not_found",
                    TaskError::NotCancellable(_) => "not_cancellable",
                    TaskError::Cancelled => "cancelled",
                    TaskError::Failed(_) => "task_failed",
                };
                (status, code, e.to_string())
            }
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
        };

        let body = json!({
            "success": false,
            "message": message,
            "code": code,
        });
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}
