use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;

use crate::auth::{self, AuthResult};
use crate::state::AppState;

/// Extractor that validates authentication via Bearer header or `?token=`.
pub struct Authenticated(pub AuthResult);

impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = StatusCode;

    fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let bearer = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(|s| s.to_string());
        let query_token = auth::extract_token_from_query(parts.uri.query().unwrap_or(""));

        let result = auth::validate_auth(
            &state.config.gateway,
            bearer.as_deref(),
            query_token.as_deref(),
            chrono::Utc::now().timestamp(),
        );

        async move { result.map(Authenticated).ok_or(StatusCode::UNAUTHORIZED) }
    }
}
