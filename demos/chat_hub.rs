//! A runnable hub: in-memory storage, the notification engine, and a few routes.
//!
//! Tokens have the form `<user id>:<username>` and are accepted as long as the
//! user was seeded below. Try:
//!
//! ```text
//! websocat 'ws://127.0.0.1:3000/ws?token=1:alice'
//! websocat 'ws://127.0.0.1:3000/ws?token=2:bob'
//! {"message_type":"chat","recipient_id":1,"content":"hi"}
//! ```

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use pulse_hub::notify::NotificationView;
use pulse_hub::prelude::*;
use serde::Deserialize;
use std::{fmt, net::SocketAddr, sync::Arc};
use tracing::{info, warn};

const SEEDED_USERS: [(UserId, &str); 3] = [(1, "alice"), (2, "bob"), (3, "carol")];

#[derive(Debug)]
struct BadToken;

impl fmt::Display for BadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid token")
    }
}

impl std::error::Error for BadToken {}

#[derive(Clone)]
struct ServerState {
    hub: Arc<Hub>,
    engine: FanoutEngine,
    inbox: NotificationInbox,
}

#[async_trait::async_trait]
impl SessionValidator for ServerState {
    type Error = BadToken;

    async fn validate_session(&self, token: &str) -> Result<UserId, Self::Error> {
        let (id, username) = token.split_once(':').ok_or(BadToken)?;
        let id: UserId = id.parse().map_err(|_| BadToken)?;
        if SEEDED_USERS.iter().any(|&(seeded, name)| seeded == id && name == username) {
            Ok(id)
        } else {
            Err(BadToken)
        }
    }
}

#[derive(Deserialize)]
struct NewQuestion {
    question_id: i64,
    title: String,
}

async fn ws_route(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    WsAuth(user_id): WsAuth,
) -> Response {
    upgrade_handler(ws, State(state.hub), Some(user_id)).await
}

async fn ask_question(
    State(state): State<ServerState>,
    WsAuth(user_id): WsAuth,
    Json(question): Json<NewQuestion>,
) -> StatusCode {
    info!(user_id, question_id = question.question_id, "Question posted");
    state.engine.publish(DomainEvent::QuestionCreated {
        question_id: question.question_id,
        author_id: user_id,
        title: question.title,
    });
    StatusCode::ACCEPTED
}

async fn list_notifications(
    State(state): State<ServerState>,
    WsAuth(user_id): WsAuth,
) -> Result<Json<Vec<NotificationView>>, Response> {
    state.inbox.list(user_id, 50).await.map(Json).map_err(|e| {
        warn!(user_id, "Failed to list notifications: {e}");
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chat_hub=info".parse()?)
                .add_directive("pulse_hub=info".parse()?),
        )
        .init();

    let config = HubConfig::from_env()?;
    info!(?config, "Loaded configuration");

    let store = Arc::new(MemoryStore::new());
    for (id, username) in SEEDED_USERS {
        store.add_user(id, username).await;
    }

    let engine = FanoutEngine::start(store.clone(), &config)?;
    let hub = Arc::new(Hub::new(store.clone(), config.clone())?.with_notifications(engine.clone()));
    let state = ServerState {
        hub,
        engine,
        inbox: NotificationInbox::new(store, config.db_timeout()),
    };

    let app = Router::new()
        .route("/ws", get(ws_route))
        .route("/questions", post(ask_question))
        .route("/notifications", get(list_notifications))
        .route("/health", get(|| async { "OK" }))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    info!("Listening on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
