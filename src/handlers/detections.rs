//! # Train Detection Handlers
//!
//! Ingestion endpoint used by the MQTT bridge plus the read endpoints backed
//! by the query service.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
};
use serde_json::json;

use crate::codec::{self, DecodeError};
use crate::error::{ApiError, ErrorType, validation_error};
use crate::models::{DetectionEvent, NewDetection};
use crate::relay::IDEMPOTENCY_KEY_HEADER;
use crate::server::AppState;
use crate::stats::DetectionStats;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, ApiError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };

    let key = value
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|key| !key.is_empty() && key.len() <= MAX_IDEMPOTENCY_KEY_LEN)
        .ok_or_else(|| {
            validation_error(
                "Invalid Idempotency-Key header",
                json!({ "header": IDEMPOTENCY_KEY_HEADER, "max_length": MAX_IDEMPOTENCY_KEY_LEN }),
            )
        })?;

    Ok(Some(key.to_string()))
}

fn decode_error(err: DecodeError) -> ApiError {
    match err {
        DecodeError::MissingField(field) => validation_error(
            "Missing or invalid field",
            json!({ "field": field }),
        ),
        DecodeError::MalformedPayload(reason) => validation_error(
            "Request body must be a JSON object",
            json!({ "reason": reason }),
        ),
    }
}

/// Store a detection forwarded by the bridge
///
/// Requests carrying an `Idempotency-Key` already seen return the stored
/// event instead of creating another one.
#[utoipa::path(
    post,
    path = "/api/train/detection",
    request_body = DetectionEvent,
    params(
        ("Idempotency-Key" = Option<String>, Header, description = "Per-message key; retries reuse it")
    ),
    responses(
        (status = 200, description = "Stored detection", body = DetectionEvent),
        (status = 400, description = "Invalid detection", body = ApiError),
        (status = 503, description = "Event store unavailable", body = ApiError)
    ),
    tag = "detections"
)]
pub async fn ingest_detection(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DetectionEvent>, ApiError> {
    let dedupe_key = idempotency_key(&headers)?;
    let event = codec::decode(&body).map_err(decode_error)?;

    let mut detection = NewDetection::new(event);
    if let Some(key) = dedupe_key {
        detection = detection.with_dedupe_key(key);
    }

    let stored = state.store.insert(detection).await?;

    tracing::info!(
        id = ?stored.id,
        state = %stored.state,
        relay = %stored.relay,
        rounds = stored.rounds,
        "Detection ingested"
    );

    Ok(Json(stored))
}

/// List every detection, newest observation first
#[utoipa::path(
    get,
    path = "/api/train/detection",
    responses(
        (status = 200, description = "All detections", body = [DetectionEvent]),
        (status = 503, description = "Event store unavailable", body = ApiError)
    ),
    tag = "detections"
)]
pub async fn list_detections(
    State(state): State<AppState>,
) -> Result<Json<Vec<DetectionEvent>>, ApiError> {
    Ok(Json(state.queries.history().await?))
}

/// Most recent detection
#[utoipa::path(
    get,
    path = "/api/train/detection/latest",
    responses(
        (status = 200, description = "Latest detection", body = DetectionEvent),
        (status = 404, description = "No detections stored yet", body = ApiError)
    ),
    tag = "detections"
)]
pub async fn latest_detection(
    State(state): State<AppState>,
) -> Result<Json<DetectionEvent>, ApiError> {
    state
        .queries
        .latest()
        .await?
        .map(Json)
        .ok_or_else(|| ErrorType::NotFound.into())
}

#[utoipa::path(
    get,
    path = "/api/train/detection/{id}",
    params(("id" = i32, Path, description = "Detection id")),
    responses(
        (status = 200, description = "Detection", body = DetectionEvent),
        (status = 404, description = "Unknown detection", body = ApiError)
    ),
    tag = "detections"
)]
pub async fn get_detection(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<Json<DetectionEvent>, ApiError> {
    state
        .queries
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ErrorType::NotFound.into())
}

/// Aggregate detection statistics
#[utoipa::path(
    get,
    path = "/api/train/stats",
    responses(
        (status = 200, description = "Detection statistics", body = DetectionStats),
        (status = 503, description = "Event store unavailable", body = ApiError)
    ),
    tag = "detections"
)]
pub async fn detection_stats(
    State(state): State<AppState>,
) -> Result<Json<DetectionStats>, ApiError> {
    Ok(Json(state.queries.stats().await?))
}
