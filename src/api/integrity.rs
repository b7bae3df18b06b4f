use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{CheckSummary, IntegrityStats};
use crate::model::{IntegrityReport, ReportStatus, Severity};

use super::auth::Caller;
use super::error::ApiResult;
use super::{AppState, Data, data};

#[derive(Debug, Deserialize)]
pub struct ReportParams {
    pub status: Option<ReportStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportView {
    pub id: Ulid,
    pub check_type: &'static str,
    pub table_name: &'static str,
    pub severity: Severity,
    pub description: String,
    pub affected_records: Vec<Ulid>,
    pub auto_fixable: bool,
    pub fix_description: &'static str,
    pub status: ReportStatus,
    pub created_at: DateTime<Utc>,
    pub fixed_at: Option<DateTime<Utc>>,
    pub fixed_by: Option<Ulid>,
}

impl From<IntegrityReport> for ReportView {
    fn from(r: IntegrityReport) -> Self {
        Self {
            id: r.id,
            check_type: r.kind.check_type(),
            table_name: r.kind.table(),
            severity: r.kind.severity(),
            description: r.description,
            affected_records: r.affected,
            auto_fixable: r.kind.auto_fixable(),
            fix_description: r.kind.fix_description(),
            status: r.status,
            created_at: r.created_at,
            fixed_at: r.fixed_at,
            fixed_by: r.fixed_by,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckView {
    pub issues_found: usize,
    pub issues: Vec<ReportView>,
}

impl From<CheckSummary> for CheckView {
    fn from(s: CheckSummary) -> Self {
        Self {
            issues_found: s.issues_found,
            issues: s.issues.into_iter().map(ReportView::from).collect(),
        }
    }
}

pub async fn check(State(state): State<AppState>, Caller(actor): Caller) -> ApiResult<Json<Data<CheckView>>> {
    Ok(data(state.engine.run_check(&actor).await?.into()))
}

pub async fn reports(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Query(params): Query<ReportParams>,
) -> ApiResult<Json<Data<Vec<ReportView>>>> {
    let reports = state.engine.list_reports(&actor, params.status)?;
    Ok(data(reports.into_iter().map(ReportView::from).collect()))
}

pub async fn stats(State(state): State<AppState>, Caller(actor): Caller) -> ApiResult<Json<Data<IntegrityStats>>> {
    Ok(data(state.engine.integrity_stats(&actor)?))
}

pub async fn fix(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Data<ReportView>>> {
    Ok(data(state.engine.apply_fix(&actor, id).await?.into()))
}

pub async fn ignore(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<Ulid>,
) -> ApiResult<Json<Data<ReportView>>> {
    Ok(data(state.engine.ignore_issue(&actor, id).await?.into()))
}
