//! Guard for destructive requests.
//!
//! A full-collection overwrite must carry `X-Confirm: overwrite-all`.

use axum::{extract::FromRequestParts, http::request::Parts};
use tabsync_engine::{CONFIRM_HEADER, CONFIRM_OVERWRITE};

use crate::error::AppError;

/// Proof that the request confirmed an overwrite.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmOverwrite;

impl<S> FromRequestParts<S> for ConfirmOverwrite
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let confirmed = parts
            .headers
            .get(CONFIRM_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == CONFIRM_OVERWRITE);

        if confirmed {
            Ok(ConfirmOverwrite)
        } else {
            tracing::warn!("Overwrite rejected: missing {} header", CONFIRM_HEADER);
            Err(AppError::PreconditionRequired(format!(
                "{CONFIRM_HEADER}: {CONFIRM_OVERWRITE} header required"
            )))
        }
    }
}
