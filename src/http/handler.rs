//! JSON-over-HTTP handlers for recording events and checking quotas.

use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::StatusCode;
use actix_web::middleware::Next;
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use crate::config::QuotaConfig;
use crate::error::ArlError;
use crate::ratelimit::{RateLimiterBackend, Segment};

/// Errors reported to HTTP clients as `{"message": ...}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Malformed Content-Type header")]
    MalformedContentType,

    #[error("Content-Type header must be application/json")]
    UnsupportedMediaType,

    #[error("Empty key are not allowed")]
    EmptyKey,

    #[error("Method {0} not allowed")]
    MethodNotAllowed(String),

    #[error("Unknown segment: {0}")]
    UnknownSegment(String),

    #[error("key not found")]
    NotFound,

    #[error("Path {0} not found")]
    UnknownPath(String),

    #[error("Could not update storage")]
    UpdateFailed,

    #[error("Could not read storage")]
    ReadFailed,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MalformedContentType | ApiError::EmptyKey | ApiError::UnknownSegment(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::NotFound | ApiError::UnknownPath(_) => StatusCode::NOT_FOUND,
            ApiError::UpdateFailed | ApiError::ReadFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(Message::new(self.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct Message {
    message: String,
}

impl Message {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    #[serde(default)]
    key: String,
}

#[derive(Debug, Deserialize)]
pub struct CountQuery {
    #[serde(default)]
    key: String,
    #[serde(default)]
    segment: Option<String>,
}

#[derive(Debug, Serialize)]
struct CountResponse<'a> {
    key: &'a str,
    segment: Segment,
    count: u64,
}

/// Outcome of checking a key against its quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    HourExceeded,
    SecondExceeded,
    WithinLimit,
    /// Neither segment has any record for the key
    Unknown,
}

impl QuotaDecision {
    /// The hour quota is checked before the second quota. A count over
    /// quota is one strictly greater than the threshold.
    pub fn evaluate(hour: Option<u64>, second: Option<u64>, quota: &QuotaConfig) -> Self {
        if hour.is_some_and(|count| count > quota.per_hour) {
            return QuotaDecision::HourExceeded;
        }
        if second.is_some_and(|count| count > quota.per_second) {
            return QuotaDecision::SecondExceeded;
        }
        if hour.is_none() && second.is_none() {
            return QuotaDecision::Unknown;
        }
        QuotaDecision::WithinLimit
    }
}

/// Register the accounting routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/")
            .route(web::get().to(check_quota))
            .route(web::post().to(record_event))
            .default_service(web::to(method_not_allowed)),
    )
    .service(
        web::resource("/count")
            .route(web::get().to(count))
            .default_service(web::to(method_not_allowed)),
    )
    .default_service(web::to(unknown_path));
}

/// Reject requests that are not `application/json`.
pub async fn enforce_json<B: MessageBody>(
    req: ServiceRequest,
    next: Next<B>,
) -> Result<ServiceResponse<EitherBody<B>>, actix_web::Error> {
    let rejection = match req.mime_type() {
        Ok(Some(mime)) if mime.essence_str() == "application/json" => None,
        Ok(Some(_)) => Some(ApiError::UnsupportedMediaType),
        Ok(None) | Err(_) => Some(ApiError::MalformedContentType),
    };

    if let Some(err) = rejection {
        debug!(path = %req.path(), error = %err, "Rejected request content type");
        return Ok(req.into_response(err.error_response()).map_into_right_body());
    }

    next.call(req).await.map(ServiceResponse::map_into_left_body)
}

fn require_key(key: &str) -> Result<&str, ApiError> {
    if key.is_empty() {
        warn!("Received request with empty key");
        return Err(ApiError::EmptyKey);
    }
    Ok(key)
}

fn read_error(key: &str, segment: Segment, err: ArlError) -> ApiError {
    match err {
        ArlError::UnknownSegment(segment) => ApiError::UnknownSegment(segment),
        err => {
            error!(key = %key, segment = ?segment, error = %err, "Failed to read counter");
            ApiError::ReadFailed
        }
    }
}

/// `GET /?key=`: is the key over its hour or second quota?
#[instrument(skip(query, backend, quota), fields(key = %query.key))]
async fn check_quota(
    query: web::Query<KeyQuery>,
    backend: web::Data<dyn RateLimiterBackend>,
    quota: web::Data<QuotaConfig>,
) -> Result<HttpResponse, ApiError> {
    let key = require_key(&query.key)?;

    let hour = backend
        .count(key, Segment::Hour)
        .await
        .map_err(|e| read_error(key, Segment::Hour, e))?;
    let second = backend
        .count(key, Segment::Second)
        .await
        .map_err(|e| read_error(key, Segment::Second, e))?;

    let decision = QuotaDecision::evaluate(hour, second, &quota);
    debug!(?hour, ?second, ?decision, "Quota decision made");

    match decision {
        QuotaDecision::HourExceeded => {
            Ok(HttpResponse::Ok().json(Message::new("hour limit exceeded")))
        }
        QuotaDecision::SecondExceeded => {
            Ok(HttpResponse::Ok().json(Message::new("seconds limit exceeded")))
        }
        QuotaDecision::WithinLimit => Ok(HttpResponse::Ok().json(Message::new("within limit"))),
        QuotaDecision::Unknown => Err(ApiError::NotFound),
    }
}

/// `POST /?key=`: record one event.
#[instrument(skip(query, backend), fields(key = %query.key))]
async fn record_event(
    query: web::Query<KeyQuery>,
    backend: web::Data<dyn RateLimiterBackend>,
) -> Result<HttpResponse, ApiError> {
    let key = require_key(&query.key)?;

    backend.inc(key).await.map_err(|e| {
        error!(key = %key, error = %e, "Failed to record event");
        ApiError::UpdateFailed
    })?;

    Ok(HttpResponse::Ok().json(Message::new("ok")))
}

/// `GET /count?key=&segment=`: raw count for one segment.
#[instrument(skip(query, backend), fields(key = %query.key))]
async fn count(
    query: web::Query<CountQuery>,
    backend: web::Data<dyn RateLimiterBackend>,
) -> Result<HttpResponse, ApiError> {
    let key = require_key(&query.key)?;
    let segment: Segment = match query.segment.as_deref() {
        None => Segment::Second,
        Some(name) => name.parse().map_err(|e| read_error(key, Segment::Second, e))?,
    };

    let count = backend
        .count(key, segment)
        .await
        .map_err(|e| read_error(key, segment, e))?
        .ok_or(ApiError::NotFound)?;

    Ok(HttpResponse::Ok().json(CountResponse {
        key,
        segment,
        count,
    }))
}

async fn method_not_allowed(req: HttpRequest) -> Result<HttpResponse, ApiError> {
    Err(ApiError::MethodNotAllowed(req.method().to_string()))
}

async fn unknown_path(req: HttpRequest) -> Result<HttpResponse, ApiError> {
    debug!(path = %req.path(), "No route for path");
    Err(ApiError::UnknownPath(req.path().to_string()))
}
