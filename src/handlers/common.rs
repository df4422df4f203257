use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Header carrying the opaque caller identity, supplied by the edge.
pub const CALLER_ID_HEADER: &str = "x-caller-id";

/// Header naming one confirm attempt.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Opaque caller identity. Requests without it never reach the engine.
#[derive(Debug, Clone)]
pub struct CallerId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(CALLER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| CallerId(value.to_string()))
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({
                        "type": "invalid_request",
                        "code": "missing_caller_identity",
                        "message": "caller identity header is required",
                    })),
                )
                    .into_response()
            })
    }
}
