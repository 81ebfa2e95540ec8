//! # DateTime Record Handlers
//!
//! CRUD endpoints for operator-defined time windows under `/api/datetime`.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{ApiError, ErrorType};
use crate::models::datetime_record::Model;
use crate::repositories::DateTimeRecordRepository;
use crate::server::AppState;

/// Begin and end of a time window
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DateTimeRequest {
    #[schema(value_type = String, example = "2024-01-15T08:00:00")]
    pub begin_date_time: NaiveDateTime,
    #[schema(value_type = String, example = "2024-01-15T18:00:00")]
    pub end_date_time: NaiveDateTime,
}

/// Stored time window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DateTimeRecordResponse {
    pub id: i32,
    #[schema(value_type = String)]
    pub begin_date_time: NaiveDateTime,
    #[schema(value_type = String)]
    pub end_date_time: NaiveDateTime,
    #[schema(value_type = String)]
    pub created_at: chrono::DateTime<Utc>,
}

impl From<Model> for DateTimeRecordResponse {
    fn from(model: Model) -> Self {
        Self {
            id: model.id,
            begin_date_time: model.begin_datetime,
            end_date_time: model.end_datetime,
            created_at: model.created_at.with_timezone(&Utc),
        }
    }
}

fn repository(state: &AppState) -> DateTimeRecordRepository {
    DateTimeRecordRepository::new(state.db.clone())
}

#[utoipa::path(
    post,
    path = "/api/datetime",
    request_body = DateTimeRequest,
    responses(
        (status = 200, description = "Created time window", body = DateTimeRecordResponse),
        (status = 400, description = "Invalid window", body = ApiError)
    ),
    tag = "datetime"
)]
pub async fn create_datetime(
    State(state): State<AppState>,
    payload: Result<Json<DateTimeRequest>, JsonRejection>,
) -> Result<Json<DateTimeRecordResponse>, ApiError> {
    let Json(request) = payload?;
    let created = repository(&state)
        .create(request.begin_date_time, request.end_date_time)
        .await?;
    Ok(Json(created.into()))
}

#[utoipa::path(
    get,
    path = "/api/datetime/{id}",
    params(("id" = i32, Path, description = "Record id")),
    responses(
        (status = 200, description = "Time window", body = DateTimeRecordResponse),
        (status = 404, description = "Unknown record", body = ApiError)
    ),
    tag = "datetime"
)]
pub async fn get_datetime(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<Json<DateTimeRecordResponse>, ApiError> {
    repository(&state)
        .find_by_id(id)
        .await?
        .map(|record| Json(record.into()))
        .ok_or_else(|| ErrorType::NotFound.into())
}

/// All time windows, most recently created first
#[utoipa::path(
    get,
    path = "/api/datetime",
    responses(
        (status = 200, description = "Time windows", body = [DateTimeRecordResponse])
    ),
    tag = "datetime"
)]
pub async fn list_datetimes(
    State(state): State<AppState>,
) -> Result<Json<Vec<DateTimeRecordResponse>>, ApiError> {
    let records = repository(&state).list().await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

#[utoipa::path(
    get,
    path = "/api/datetime/latest",
    responses(
        (status = 200, description = "Most recent time window", body = DateTimeRecordResponse),
        (status = 404, description = "No records", body = ApiError)
    ),
    tag = "datetime"
)]
pub async fn latest_datetime(
    State(state): State<AppState>,
) -> Result<Json<DateTimeRecordResponse>, ApiError> {
    repository(&state)
        .latest()
        .await?
        .map(|record| Json(record.into()))
        .ok_or_else(|| ErrorType::NotFound.into())
}

#[utoipa::path(
    put,
    path = "/api/datetime/{id}",
    params(("id" = i32, Path, description = "Record id")),
    request_body = DateTimeRequest,
    responses(
        (status = 200, description = "Updated time window", body = DateTimeRecordResponse),
        (status = 400, description = "Invalid window", body = ApiError),
        (status = 404, description = "Unknown record", body = ApiError)
    ),
    tag = "datetime"
)]
pub async fn update_datetime(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    payload: Result<Json<DateTimeRequest>, JsonRejection>,
) -> Result<Json<DateTimeRecordResponse>, ApiError> {
    let Json(request) = payload?;
    repository(&state)
        .update(id, request.begin_date_time, request.end_date_time)
        .await?
        .map(|record| Json(record.into()))
        .ok_or_else(|| ErrorType::NotFound.into())
}

#[utoipa::path(
    delete,
    path = "/api/datetime/{id}",
    params(("id" = i32, Path, description = "Record id")),
    responses(
        (status = 200, description = "Deleted"),
        (status = 404, description = "Unknown record", body = ApiError)
    ),
    tag = "datetime"
)]
pub async fn delete_datetime(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<StatusCode, ApiError> {
    if repository(&state).delete(id).await? {
        Ok(StatusCode::OK)
    } else {
        Err(ErrorType::NotFound.into())
    }
}
