//! Public endpoints hit by recipients: the open pixel, the link redirect and
//! the read confirmation.
//!
//! None of them leaks why a request was rejected. The pixel is served even
//! when nothing was recorded so that mail clients never show a broken image.

use askama::Template;
use axum::extract::Query;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Extension;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, EXPIRES, LOCATION, PRAGMA};
use http::{HeaderValue, StatusCode};
use uuid::Uuid;

use crate::render::ReadConfirmedPage;
use crate::tracking::{self, Outcome, CONFIRM_READ, LINK_REDIRECT, PIXEL_PNG, TRACK_OPEN};

use super::{ConfigExt, DbExt, Router};

pub fn router() -> Router {
    Router::new()
        .route(&format!("/{TRACK_OPEN}"), get(track_open))
        .route(&format!("/{LINK_REDIRECT}"), get(link_redirect))
        .route(&format!("/{CONFIRM_READ}"), get(confirm_read))
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TrackingQuery {
    pub msg: Option<String>,
    pub k: Option<String>,
    pub u: Option<String>,
}

fn required(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

pub async fn track_open(Extension(db): DbExt, Query(query): Query<TrackingQuery>) -> Response {
    let (msg, k) = match (required(query.msg), required(query.k)) {
        (Some(msg), Some(k)) => (msg, k),
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };

    match Uuid::parse_str(&msg) {
        Ok(id) => match tracking::record_open(&db, id, &k) {
            Ok(Outcome::Recorded) => tracing::debug!(mail = %id, "open recorded"),
            Ok(outcome) => tracing::debug!(mail = %id, ?outcome, "open not recorded"),
            Err(e) => tracing::warn!(mail = %id, "failed recording open: {e}"),
        },
        Err(_) => tracing::debug!(%msg, "open for malformed mail id"),
    }

    pixel()
}

fn pixel() -> Response {
    let body: &'static [u8] = &PIXEL_PNG;
    (
        [
            (CONTENT_TYPE, mime::IMAGE_PNG.essence_str()),
            (CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (PRAGMA, "no-cache"),
            (EXPIRES, "0"),
        ],
        body,
    )
        .into_response()
}

pub async fn link_redirect(
    Extension(db): DbExt,
    Extension(config): ConfigExt,
    Query(query): Query<TrackingQuery>,
) -> Response {
    let (msg, u, k) = match (required(query.msg), required(query.u), required(query.k)) {
        (Some(msg), Some(u), Some(k)) => (msg, u, k),
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };

    let target = match tracking::decode_url(&u) {
        Ok(url) if HeaderValue::from_str(&url).is_ok() => url,
        _ => {
            tracing::debug!(%msg, "undecodable link, redirecting to fallback");
            return found(&config.tracking.fallback_url);
        }
    };

    // The redirect happens regardless of the token; a mismatch only skips
    // recording the click.
    match Uuid::parse_str(&msg) {
        Ok(id) => match tracking::record_click(&db, id, &k, &target) {
            Ok(Outcome::Recorded) => tracing::debug!(mail = %id, url = %target, "click recorded"),
            Ok(outcome) => tracing::debug!(mail = %id, ?outcome, "click not recorded"),
            Err(e) => tracing::warn!(mail = %id, "failed recording click: {e}"),
        },
        Err(_) => tracing::debug!(%msg, "click for malformed mail id"),
    }

    found(&target)
}

fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(LOCATION, value)]).into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

pub async fn confirm_read(Extension(db): DbExt, Query(query): Query<TrackingQuery>) -> Response {
    let (msg, k) = match (required(query.msg), required(query.k)) {
        (Some(msg), Some(k)) => (msg, k),
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };
    let id = match Uuid::parse_str(&msg) {
        Ok(id) => id,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    match tracking::confirm_read(&db, id, &k) {
        Ok(Outcome::Recorded) => {
            tracing::info!(mail = %id, "read confirmed");
            match ReadConfirmedPage::default().render() {
                Ok(page) => Html(page).into_response(),
                Err(e) => {
                    tracing::error!("failed rendering confirmation page: {e}");
                    ok_text()
                }
            }
        }
        Ok(Outcome::TokenMismatch) => StatusCode::FORBIDDEN.into_response(),
        Ok(Outcome::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!(mail = %id, "failed confirming read: {e}");
            ok_text()
        }
    }
}

fn ok_text() -> Response {
    (StatusCode::OK, "OK").into_response()
}
