//! Websocket server and session lifecycle
//!
//! One task per connection reads inbound frames and processes each message
//! to completion before the next; a second task per connection drains that
//! connection's outbound queue. Connections only ever meet each other
//! through the game's watcher registry, never directly.

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::{HeaderValue, Method, header::CONTENT_TYPE},
    response::Response,
    routing::get,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    signal::{
        ctrl_c,
        unix::{SignalKind, signal},
    },
    sync::{Mutex, mpsc},
};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use super::{
    auth::Authenticator,
    bus::{self, Envelope, Publisher},
    config::Config,
    game::{Admission, Game, IncomingMessage, Options, SyncMessage, UpdateMessage},
    session::Tunnel,
    store::{self, CounterStore, StatusStore},
    verify::Turnstile,
    watcher::Id,
};

/// Delay before re-subscribing after losing the broadcast channel
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Websocket close code for connections refused at the handshake
const POLICY_VIOLATION: u16 = 1008;

/// Tunnel implementation backed by a per-connection outbound queue
///
/// Messages are serialized and pushed onto an unbounded channel drained by
/// the connection's writer task, so a slow or dead socket never blocks
/// whoever is broadcasting.
#[derive(Debug, Clone)]
pub struct WebTunnel {
    tx: mpsc::UnboundedSender<Message>,
}

impl WebTunnel {
    fn send_frame(&self, message: Message) {
        if self.tx.send(message).is_err() {
            debug!("outbound queue closed, message dropped");
        }
    }
}

impl Tunnel for WebTunnel {
    fn send_message(&self, message: &UpdateMessage) {
        self.send_frame(Message::Text(message.to_message().into()));
    }

    fn send_state(&self, state: &SyncMessage) {
        self.send_frame(Message::Text(state.to_message().into()));
    }

    fn close(self) {
        self.send_frame(Message::Close(None));
    }
}

/// State shared by every connection of one server instance
pub struct AppState<S> {
    /// The game engine; one logical owner per counter, so all message
    /// processing serializes behind this lock
    game: Mutex<Game>,
    /// Durable counter and game status store
    store: S,
    /// Proof-of-humanity verifier
    gate: Turnstile,
    /// Identity resolution collaborator
    auth: Authenticator,
    /// Live outbound tunnels by connection id
    tunnels: DashMap<Id, WebTunnel>,
    /// Cross-process broadcast publisher, when redis is configured
    publisher: Option<Publisher>,
}

impl<S> AppState<S> {
    /// Looks up the outbound tunnel for a connection
    fn tunnel_finder(&self) -> impl Fn(Id) -> Option<WebTunnel> + '_ {
        move |id| self.tunnels.get(&id).map(|tunnel| tunnel.value().clone())
    }

    /// Forwards locally committed events to the cross-process channel
    fn publish_hook(&self) -> impl FnMut(&UpdateMessage) + '_ {
        move |event: &UpdateMessage| {
            if let Some(publisher) = &self.publisher {
                publisher.publish(event);
            }
        }
    }
}

/// Builds the shared state, resuming the terminal flag from the store
///
/// # Arguments
///
/// * `store` - Durable counter and game status store
/// * `gate` - Proof-of-humanity verifier
/// * `auth` - Identity resolution collaborator
/// * `options` - Game configuration
/// * `publisher` - Cross-process broadcast publisher, when configured
///
/// # Errors
///
/// Returns a store error if the game status cannot be read at startup.
pub async fn init_state<S>(
    store: S,
    gate: Turnstile,
    auth: Authenticator,
    options: Options,
    publisher: Option<Publisher>,
) -> Result<Arc<AppState<S>>, store::Error>
where
    S: CounterStore + StatusStore,
{
    let status = store.status().await?;

    let mut game = Game::new(options);
    if status.is_ended() {
        game.mark_ended();
    }

    Ok(Arc::new(AppState {
        game: Mutex::new(game),
        store,
        gate,
        auth,
        tunnels: DashMap::new(),
        publisher,
    }))
}

/// Query parameters of the websocket handshake
#[derive(Debug, Deserialize)]
struct ConnectParams {
    /// Credential forwarded to the identity resolver
    token: Option<String>,
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn count_handler<S>(
    State(state): State<Arc<AppState<S>>>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response
where
    S: CounterStore + StatusStore + 'static,
{
    ws.on_upgrade(move |socket| handle_socket(state, socket, params.token))
}

/// Runs one connection from handshake to teardown
async fn handle_socket<S>(state: Arc<AppState<S>>, mut socket: WebSocket, token: Option<String>)
where
    S: CounterStore + StatusStore + 'static,
{
    let identity = match state.auth.resolve(token.as_deref()).await {
        Ok(identity) => identity,
        Err(error) => {
            debug!("refusing connection: {error}");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: POLICY_VIOLATION,
                    reason: "Unauthorized".into(),
                })))
                .await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let tunnel = WebTunnel { tx };
    let watcher_id = Id::new();

    // Each connection drains its own queue: a dead socket only stops its
    // own writer, never delivery to the others.
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
    });

    state.tunnels.insert(watcher_id, tunnel.clone());

    let admission = {
        let mut game = state.game.lock().await;
        game.add_session(watcher_id, identity, &state.store, state.tunnel_finder())
            .await
    };

    match admission {
        Ok(Admission::Active) => {
            while let Some(Ok(message)) = stream.next().await {
                match message {
                    Message::Text(text) => {
                        let Ok(incoming) = serde_json::from_str::<IncomingMessage>(&text) else {
                            debug!("ignoring malformed message from {watcher_id}");
                            continue;
                        };

                        let mut game = state.game.lock().await;
                        game.receive_message(
                            watcher_id,
                            incoming,
                            &state.store,
                            &state.gate,
                            state.publish_hook(),
                            state.tunnel_finder(),
                        )
                        .await;
                    }
                    Message::Ping(payload) => {
                        tunnel.send_frame(Message::Pong(payload));
                    }
                    Message::Close(_) => break,
                    Message::Binary(_) | Message::Pong(_) => {}
                }
            }

            state.tunnels.remove(&watcher_id);
            let mut game = state.game.lock().await;
            game.remove_session(watcher_id, state.tunnel_finder());
        }
        Ok(Admission::GameOver) => {
            // Snapshot and verdict are queued; flush them and hang up.
            tunnel.close();
            state.tunnels.remove(&watcher_id);
        }
        Err(error) => {
            warn!("refusing connection {watcher_id}: {error}");
            tunnel.close();
            state.tunnels.remove(&watcher_id);
        }
    }
}

/// Spawns the task re-broadcasting events committed by other instances
///
/// # Arguments
///
/// * `state` - Shared server state
/// * `client` - Redis client used for the pub/sub subscription
pub fn start_subscriber<S>(state: Arc<AppState<S>>, client: redis::Client)
where
    S: CounterStore + StatusStore + 'static,
{
    tokio::spawn(async move {
        loop {
            match client.get_async_pubsub().await {
                Ok(mut pubsub) => {
                    if let Err(error) = pubsub.subscribe(bus::CHANNEL).await {
                        error!("cannot subscribe to broadcast channel: {error}");
                    } else {
                        let mut messages = pubsub.on_message();
                        while let Some(message) = messages.next().await {
                            apply_envelope(&state, &message).await;
                        }
                        warn!("broadcast subscription ended, reconnecting");
                    }
                }
                Err(error) => {
                    error!("cannot reach broadcast channel: {error}");
                }
            }

            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
    });
}

/// Re-broadcasts one foreign envelope to this instance's viewers
async fn apply_envelope<S>(state: &Arc<AppState<S>>, message: &redis::Msg)
where
    S: CounterStore + StatusStore,
{
    let payload: String = match message.get_payload() {
        Ok(payload) => payload,
        Err(error) => {
            warn!("unreadable broadcast payload: {error}");
            return;
        }
    };

    let envelope: Envelope = match serde_json::from_str(&payload) {
        Ok(envelope) => envelope,
        Err(error) => {
            warn!("malformed broadcast payload: {error}");
            return;
        }
    };

    // Our own events were already broadcast locally when they committed.
    if state
        .publisher
        .as_ref()
        .is_some_and(|publisher| publisher.origin() == envelope.origin)
    {
        return;
    }

    let mut game = state.game.lock().await;
    game.apply_remote(&envelope.event, state.tunnel_finder());
}

/// Binds the listener and serves until shutdown
///
/// # Arguments
///
/// * `state` - Shared server state
/// * `config` - Runtime configuration
///
/// # Errors
///
/// Returns an IO error if the listener cannot be bound or the server
/// fails while running.
pub async fn serve<S>(state: Arc<AppState<S>>, config: &Config) -> std::io::Result<()>
where
    S: CounterStore + StatusStore + 'static,
{
    let cors = match &config.frontend_host {
        Some(origin) => CorsLayer::new()
            .allow_methods([Method::GET])
            .allow_headers([CONTENT_TYPE])
            .allow_origin(
                origin
                    .parse::<HeaderValue>()
                    .expect("Environment misconfigured!"),
            ),
        None => CorsLayer::permissive(),
    };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/v1/count", get(count_handler::<S>))
        .layer(cors)
        .with_state(state);

    let address = format!("0.0.0.0:{}", config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_web_tunnel_serializes_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tunnel = WebTunnel { tx };

        tunnel.send_message(&UpdateMessage::CountUpdated { value: 9 });
        tunnel.send_state(&SyncMessage::Initial {
            value: 9,
            high_score: 9,
            user_count: 1,
        });

        let Some(Message::Text(first)) = rx.recv().await else {
            panic!("expected a text frame");
        };
        assert_eq!(first.as_str(), r#"{"type":"count-updated","value":9}"#);

        let Some(Message::Text(second)) = rx.recv().await else {
            panic!("expected a text frame");
        };
        assert!(second.as_str().contains(r#""type":"initial""#));
    }

    #[tokio::test]
    async fn test_web_tunnel_close_sends_close_frame() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tunnel = WebTunnel { tx };

        tunnel.close();

        assert!(matches!(rx.recv().await, Some(Message::Close(None))));
    }

    #[tokio::test]
    async fn test_web_tunnel_survives_a_dead_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let tunnel = WebTunnel { tx };
        // Must not panic; the close path cleans the connection up later.
        tunnel.send_message(&UpdateMessage::GameOver);
    }
}
