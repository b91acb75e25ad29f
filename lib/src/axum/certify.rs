use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{extract::Path, Extension, Json};
use chrono::Utc;
use http::StatusCode;

use crate::certify::{certify, movements_for, CertEvent, Stamp};
use crate::{ErrorKind, Result};

use super::extract::ApiKey;
use super::{ChainExt, DbExt, Router};

pub fn router() -> Router {
    Router::new()
        .route("/api/certify", post(certify_event))
        .route("/api/certify/:message_id", get(stamps))
}

/// Event to certify, as posted by the dashboard.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CertifyRequest {
    /// One of `read`, `send`, `receive`, `user_created`.
    #[serde(rename = "type")]
    pub kind: String,
    pub message_id: String,
    pub user_id: String,
    pub to_email: String,
    pub email: String,
}

impl TryFrom<CertifyRequest> for CertEvent {
    type Error = crate::Error;

    fn try_from(r: CertifyRequest) -> Result<Self> {
        let missing = |field: &str| -> crate::Error {
            ErrorKind::BadInput(format!("missing field `{field}` for `{}` event", r.kind)).into()
        };
        let at = Utc::now();
        let event = match r.kind.as_str() {
            "read" | "receive" => {
                if r.message_id.is_empty() {
                    return Err(missing("messageId"));
                }
                if r.user_id.is_empty() {
                    return Err(missing("userId"));
                }
                if r.kind == "read" {
                    CertEvent::Read {
                        message_id: r.message_id.clone(),
                        user_id: r.user_id.clone(),
                        at,
                    }
                } else {
                    CertEvent::Receive {
                        message_id: r.message_id.clone(),
                        user_id: r.user_id.clone(),
                        at,
                    }
                }
            }
            "send" => {
                if r.message_id.is_empty() {
                    return Err(missing("messageId"));
                }
                if r.to_email.is_empty() {
                    return Err(missing("toEmail"));
                }
                CertEvent::Send {
                    message_id: r.message_id.clone(),
                    from_user_id: r.user_id.clone(),
                    to_email: r.to_email.clone(),
                    at,
                }
            }
            "user_created" => {
                if r.user_id.is_empty() {
                    return Err(missing("userId"));
                }
                CertEvent::UserCreated {
                    user_id: r.user_id.clone(),
                    email: r.email.clone(),
                    at,
                }
            }
            other => {
                return Err(ErrorKind::BadInput(format!("unknown event type: {other}")).into())
            }
        };
        Ok(event)
    }
}

pub async fn certify_event(
    _: ApiKey,
    Extension(db): DbExt,
    Extension(chain): ChainExt,
    Json(request): Json<CertifyRequest>,
) -> Result<impl IntoResponse> {
    let event = CertEvent::try_from(request)?;
    let chain =
        chain.ok_or_else(|| ErrorKind::MissingConfig("chain.provider_url".to_string()))?;
    let movement = certify(chain.as_ref(), &db, event).await?;
    Ok((StatusCode::CREATED, Json(movement.stamp())))
}

pub async fn stamps(
    _: ApiKey,
    Extension(db): DbExt,
    Path(message_id): Path<String>,
) -> Result<Json<Vec<Stamp>>> {
    let stamps = movements_for(&db, &message_id)?
        .iter()
        .map(|m| m.stamp())
        .collect();
    Ok(Json(stamps))
}
