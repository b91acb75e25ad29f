use axum::response::{IntoResponse, Response};
use http::StatusCode;

use crate::{Error, ErrorKind};

/// Maps errors onto status codes.
///
/// Backtraces and internal error details are never part of the response,
/// they only end up in the application logs.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self.kind {
            ErrorKind::Forbidden => {
                tracing::debug!("{}", self.to_string());
                StatusCode::FORBIDDEN.into_response()
            }
            ErrorKind::BadInput(_) => {
                tracing::trace!("{}", self.to_string());
                (StatusCode::BAD_REQUEST, self.kind.to_string()).into_response()
            }
            ErrorKind::NotFound(_) => {
                tracing::debug!("{}", self.to_string());
                StatusCode::NOT_FOUND.into_response()
            }
            ErrorKind::MissingConfig(_) => {
                tracing::warn!("{}", self.to_string());
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            }
            _ => {
                tracing::error!("{}", self.to_string());
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
