use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_auth::AuthBearer;

use crate::error::{Error, ErrorKind};
use crate::Config;

/// Guards the mail api. Requires `Authorization: Bearer <api.key>` unless
/// no key is configured.
#[derive(Clone, Copy, Debug)]
pub struct ApiKey;

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ApiKey {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = parts
            .extensions
            .get::<Arc<Config>>()
            .cloned()
            .ok_or_else(|| ErrorKind::Other("config extension unavailable".to_string()))?;

        if config.api.key.is_empty() {
            return Ok(ApiKey);
        }

        let AuthBearer(token) = AuthBearer::from_request_parts(parts, state)
            .await
            .map_err(|_| ErrorKind::Forbidden)?;
        if keys_match(config.api.key.as_bytes(), token.as_bytes()) {
            Ok(ApiKey)
        } else {
            Err(ErrorKind::Forbidden.into())
        }
    }
}

fn keys_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
