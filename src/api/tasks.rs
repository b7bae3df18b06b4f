use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Serialize;
use ulid::Ulid;

use crate::roles::{Capability, authorize};
use crate::tasks::{TaskError, TaskInfo};

use super::auth::Caller;
use super::error::ApiResult;
use super::integrity::CheckView;
use super::{AppState, Data, data};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submitted {
    pub task_id: Ulid,
}

pub async fn list(State(state): State<AppState>, Caller(actor): Caller) -> ApiResult<Json<Data<Vec<TaskInfo>>>> {
    authorize(&actor, Capability::ManageTasks)?;
    Ok(data(state.engine.tasks.list()))
}

/// Run an integrity scan on the worker pool and return its task id at once.
pub async fn integrity_check(
    State(state): State<AppState>,
    Caller(actor): Caller,
) -> ApiResult<(StatusCode, Json<Data<Submitted>>)> {
    authorize(&actor, Capability::RunIntegrity)?;
    let engine = state.engine.clone();
    let handle = state.engine.tasks.submit("integrity_check", true, async move {
        engine.run_check(&actor).await.map(CheckView::from)
    });
    Ok((StatusCode::ACCEPTED, data(Submitted { task_id: handle.id() })))
}

pub async fn show(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Data<TaskInfo>>> {
    authorize(&actor, Capability::ManageTasks)?;
    let info = state.engine.tasks.status(id).ok_or(TaskError::NotFound(id))?;
    Ok(data(info))
}

pub async fn cancel(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Data<TaskInfo>>> {
    authorize(&actor, Capability::ManageTasks)?;
    state.engine.tasks.cancel(id)?;
    let info = state.engine.tasks.status(id).ok_or(TaskError::NotFound(id))?;
    Ok(data(info))
}
