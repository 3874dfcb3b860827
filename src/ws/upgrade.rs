//! The Axum handler that upgrades an authenticated HTTP request to a hub connection.

use crate::store::UserId;
use crate::ws::pipeline::Hub;
use axum::{
    extract::{State, ws::WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{instrument, warn};

/// The authenticated caller, as placed in the request extensions by whatever
/// middleware the application runs in front of the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserId);

/// Upgrades the request and hands the socket to the [`Hub`].
///
/// The caller's identity must already be resolved, either from an
/// [`AuthenticatedUser`] extension or through the `WsAuth` extractor. Without
/// one the request is rejected with `401 Unauthorized` and nothing is upgraded.
///
/// ## Example Usage
///
/// ```rust,no_run
/// # use axum::{Extension, Router, extract::{State, WebSocketUpgrade}, routing::get};
/// # use pulse_hub::{config::HubConfig, store::memory::MemoryStore};
/// # use pulse_hub::ws::{pipeline::Hub, upgrade::{AuthenticatedUser, upgrade_handler}};
/// # use std::sync::Arc;
/// # fn main() -> Result<(), pulse_hub::error::ConfigError> {
/// let hub = Arc::new(Hub::new(Arc::new(MemoryStore::new()), HubConfig::default())?);
/// let app: Router = Router::new()
///     .route(
///         "/ws",
///         get(|ws: WebSocketUpgrade,
///              State(hub): State<Arc<Hub>>,
///              user: Option<Extension<AuthenticatedUser>>| async move {
///             upgrade_handler(ws, State(hub), user.map(|Extension(AuthenticatedUser(id))| id)).await
///         }),
///     )
///     .with_state(hub);
/// # Ok(())
/// # }
/// ```
#[instrument(skip_all, fields(user_id = ?user_id))]
pub async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
    user_id: Option<UserId>,
) -> Response {
    let Some(user_id) = user_id else {
        warn!("WebSocket connection rejected: no authenticated user");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    ws.on_upgrade(move |socket| hub.handle_socket(socket, user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::store::memory::MemoryStore;
    use axum::{Router, routing::get};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const UPGRADE_REQUEST: &str = "GET /ws HTTP/1.1\r\n\
        Host: localhost\r\n\
        Connection: Upgrade\r\n\
        Upgrade: websocket\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        \r\n";

    #[tokio::test]
    async fn upgrade_without_a_user_is_unauthorized() {
        let hub = Arc::new(Hub::new(Arc::new(MemoryStore::new()), HubConfig::default()).unwrap());
        let app = Router::new()
            .route(
                "/ws",
                get(|ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>| async move {
                    upgrade_handler(ws, State(hub), None).await
                }),
            )
            .with_state(Arc::clone(&hub));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move { axum::serve(listener, app).await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(UPGRADE_REQUEST.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]);

        assert!(
            response.starts_with("HTTP/1.1 401"),
            "unexpected response: {response}"
        );
        assert!(hub.online_users().is_empty());
        server.abort();
    }
}
