//! Resolves the caller of a WebSocket upgrade to a [`UserId`].
//!
//! ## Example
//!
//! ```rust,no_run
//! # use async_trait::async_trait;
//! # use axum::{Router, response::{IntoResponse, Response}, routing::get};
//! # use pulse_hub::auth::{SessionValidator, WsAuth};
//! # use pulse_hub::store::UserId;
//! #[derive(Clone)]
//! struct AppState;
//!
//! #[async_trait]
//! impl SessionValidator for AppState {
//!     type Error = std::io::Error;
//!
//!     async fn validate_session(&self, token: &str) -> Result<UserId, Self::Error> {
//!         token
//!             .parse()
//!             .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad token"))
//!     }
//! }
//!
//! async fn whoami(WsAuth(user_id): WsAuth) -> Response {
//!     format!("user {user_id}").into_response()
//! }
//!
//! let app: Router = Router::new().route("/whoami", get(whoami)).with_state(AppState);
//! ```

use crate::store::UserId;
use crate::ws::upgrade::AuthenticatedUser;
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Query},
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

/// Implemented by the application state to turn a session token into a user id.
#[async_trait]
pub trait SessionValidator {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn validate_session(&self, token: &str) -> Result<UserId, Self::Error>;
}

/// The authenticated caller.
///
/// An [`AuthenticatedUser`] extension set by upstream middleware wins.
/// Otherwise the token comes from an `Authorization: Bearer` header or a
/// `?token=` query parameter and is checked with the state's
/// [`SessionValidator`]. Anything else is rejected with `401 Unauthorized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WsAuth(pub UserId);

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

impl<S> FromRequestParts<S> for WsAuth
where
    S: SessionValidator + Send + Sync + 'static,
{
    type Rejection = Response;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, <Self as FromRequestParts<S>>::Rejection>> + Send {
        Box::pin(async move {
            if let Some(AuthenticatedUser(user_id)) = parts.extensions.get::<AuthenticatedUser>() {
                return Ok(WsAuth(*user_id));
            }

            let token = match bearer_token(&parts.headers) {
                Some(token) => Some(token),
                None => Query::<TokenQuery>::from_request_parts(parts, state)
                    .await
                    .ok()
                    .map(|Query(q)| q.token),
            };
            let Some(token) = token else {
                return Err(StatusCode::UNAUTHORIZED.into_response());
            };

            match state.validate_session(&token).await {
                Ok(user_id) => Ok(WsAuth(user_id)),
                Err(e) => {
                    debug!("Session token rejected: {e}");
                    Err(StatusCode::UNAUTHORIZED.into_response())
                }
            }
        })
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    struct FixedSessions;

    #[derive(Debug, thiserror::Error)]
    #[error("unknown session")]
    struct UnknownSession;

    #[async_trait]
    impl SessionValidator for FixedSessions {
        type Error = UnknownSession;

        async fn validate_session(&self, token: &str) -> Result<UserId, Self::Error> {
            match token {
                "alice" => Ok(1),
                "bob" => Ok(2),
                _ => Err(UnknownSession),
            }
        }
    }

    async fn extract(request: Request<()>) -> Result<WsAuth, StatusCode> {
        let (mut parts, _) = request.into_parts();
        WsAuth::from_request_parts(&mut parts, &FixedSessions)
            .await
            .map_err(|response| response.status())
    }

    #[tokio::test]
    async fn extension_takes_precedence_over_tokens() {
        let mut request = Request::builder()
            .uri("/ws?token=bob")
            .body(())
            .unwrap();
        request.extensions_mut().insert(AuthenticatedUser(7));
        assert_eq!(extract(request).await, Ok(WsAuth(7)));
    }

    #[tokio::test]
    async fn bearer_header_then_query_token() {
        let request = Request::builder()
            .uri("/ws?token=bob")
            .header("Authorization", "Bearer alice")
            .body(())
            .unwrap();
        assert_eq!(extract(request).await, Ok(WsAuth(1)));

        let request = Request::builder().uri("/ws?token=bob").body(()).unwrap();
        assert_eq!(extract(request).await, Ok(WsAuth(2)));
    }

    #[tokio::test]
    async fn missing_or_invalid_token_is_unauthorized() {
        let request = Request::builder().uri("/ws").body(()).unwrap();
        assert_eq!(extract(request).await, Err(StatusCode::UNAUTHORIZED));

        let request = Request::builder()
            .uri("/ws?token=mallory")
            .body(())
            .unwrap();
        assert_eq!(extract(request).await, Err(StatusCode::UNAUTHORIZED));
    }
}
