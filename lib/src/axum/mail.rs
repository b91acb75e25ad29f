use std::convert::Infallible;

use axum::extract::Path;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json};
use futures::stream::{self, Stream, StreamExt};
use http::StatusCode;

use crate::db::decode;
use crate::mail::{
    schedule_email, schedule_notification, MailDocument, MailId, MailStatus, ScheduleEmail,
    ScheduleNotification,
};
use crate::Result;

use super::extract::ApiKey;
use super::{ConfigExt, DbExt, Router};

pub fn router() -> Router {
    Router::new()
        .route("/api/mail", post(schedule))
        .route("/api/notification", post(notify))
        .route("/api/mail/:id", get(status))
        .route("/api/mail/:id/events", get(events))
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Scheduled {
    pub id: MailId,
}

pub async fn schedule(
    _: ApiKey,
    Extension(db): DbExt,
    Json(params): Json<ScheduleEmail>,
) -> Result<impl IntoResponse> {
    let id = schedule_email(&db, params)?;
    Ok((StatusCode::CREATED, Json(Scheduled { id })))
}

pub async fn notify(
    _: ApiKey,
    Extension(db): DbExt,
    Extension(config): ConfigExt,
    Json(params): Json<ScheduleNotification>,
) -> Result<impl IntoResponse> {
    let id = schedule_notification(&db, &config, params)?;
    Ok((StatusCode::CREATED, Json(Scheduled { id })))
}

pub async fn status(
    _: ApiKey,
    Extension(db): DbExt,
    Path(id): Path<MailId>,
) -> Result<Json<MailStatus>> {
    let doc = db.get::<MailDocument>(id)?;
    Ok(Json(doc.into()))
}

/// Streams the document status: once right away and again on every change,
/// which is what the reader page and ticket lists subscribe to.
pub async fn events(
    _: ApiKey,
    Extension(db): DbExt,
    Path(id): Path<MailId>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    // Subscribe before reading so that no change goes unnoticed.
    let watcher = db.watch_one::<MailDocument>(id)?;
    let current = db.get::<MailDocument>(id)?;

    let updates = stream::unfold(watcher, |mut watcher| async move {
        loop {
            let event = watcher.next().await?;
            if let sled::Event::Insert { value, .. } = &event {
                if let Ok(doc) = decode::<MailDocument>(value) {
                    return Some((status_event(doc.into()), watcher));
                }
            }
        }
    });
    let stream = stream::once(async move { status_event(current.into()) })
        .chain(updates)
        .map(Ok);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn status_event(status: MailStatus) -> Event {
    Event::default()
        .event("status")
        .json_data(&status)
        .unwrap_or_else(|e| Event::default().comment(format!("failed encoding status: {e}")))
}
