//! Connection handlers for Duet server.
//!
//! This module wires the gateway to axum WebSockets: it authenticates the
//! upgrade, runs the per-connection session loop and translates gateway
//! results into `ack` and `error` frames.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use duet_core::{
    Connection, ConnectionContext, CreateMessage, Gateway, GatewayConfig, GatewayError, Hub,
    HubConfig, MemoryGroupStore, MemoryMessageStore, MemoryUserStore, PresenceRegistry, Services,
    TokenIdentity, User,
};
use duet_protocol::{codec, Encoding, Frame};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error codes carried by `error` frames.
pub mod codes {
    pub const MALFORMED_FRAME: u16 = 1002;
    pub const UNEXPECTED_FRAME: u16 = 1003;
    pub const VALIDATION: u16 = 4000;
    pub const AUTHENTICATION: u16 = 4001;
    pub const NOT_FOUND: u16 = 4004;
    pub const PERSISTENCE: u16 = 5000;
    pub const UNAVAILABLE: u16 = 5003;
}

/// Query parameter carrying the bearer token when headers are unavailable.
const TOKEN_PARAM: &str = "access_token";

/// Query parameter selecting the wire encoding.
const ENCODING_PARAM: &str = "encoding";

type Sink = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// Outbound queues and transport groups.
    pub hub: Arc<Hub>,
    /// Online users.
    pub presence: Arc<PresenceRegistry>,
    /// Lifecycle and send-path orchestration.
    pub gateway: Gateway,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state with in-memory stores seeded from `config.users`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub = Arc::new(Hub::with_config(HubConfig {
            max_connections: config.limits.max_connections,
            outbound_capacity: config.limits.outbound_queue,
        }));
        let presence = Arc::new(PresenceRegistry::new());

        let users = MemoryUserStore::new();
        let mut identity = TokenIdentity::new();
        for user in &config.users {
            users.insert(User::new(&user.username, user.display_name()));
            identity = identity.with_token(&user.token, &user.username);
        }
        info!(users = config.users.len(), "Seeded user directory");

        let services = Services {
            identity: Arc::new(identity),
            users: Arc::new(users),
            groups: Arc::new(MemoryGroupStore::new()),
            messages: Arc::new(MemoryMessageStore::new()),
            transport: hub.clone(),
        };

        let gateway = Gateway::with_config(
            Arc::clone(&presence),
            services,
            GatewayConfig {
                max_content_length: config.limits.max_content_length,
            },
        );

        Self {
            hub,
            presence,
            gateway,
            config,
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();

    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/online", get(online_handler))
        .with_state(state)
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops abnormally.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Duet server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, Arc::new(AppState::new(config))).await
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Online users handler.
async fn online_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let users = state.presence.online_users();
    axum::Json(serde_json::json!({
        "count": users.len(),
        "users": users,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(mut params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let query_token = params.remove(TOKEN_PARAM);
    let token = bearer_token(&headers).or(query_token);
    let encoding = Encoding::from_param(params.get(ENCODING_PARAM).map(String::as_str));

    let connection_id = format!("conn_{}", Uuid::new_v4().simple());
    let context = ConnectionContext::new(connection_id)
        .with_token(token)
        .with_params(params);

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, context, encoding))
}

/// Extract the token from an `Authorization: Bearer` header.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    context: ConnectionContext,
    encoding: Encoding,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = context.connection_id.clone();
    let (mut sender, receiver) = socket.split();

    let outbound = match state.hub.register(&connection_id) {
        Ok(rx) => rx,
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Connection refused");
            metrics::record_error("connection_limit");
            let refusal = Frame::error(0, codes::UNAVAILABLE, e.to_string());
            let _ = send_frame(&mut sender, encoding, &refusal).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    debug!(connection = %connection_id, ?encoding, "WebSocket connected");

    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = Frame::connected(&connection_id, heartbeat);
    if send_frame(&mut sender, encoding, &connected).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        finish(&state, &connection_id).await;
        return;
    }

    match state.gateway.connect(&context).await {
        Ok(joined) => {
            metrics::set_online_users(state.presence.online_count());
            let session = Session {
                state: &state,
                connection: joined.connection,
                encoding,
            };
            session.run(sender, receiver, outbound).await;
        }
        Err(e) => {
            log_gateway_error(&connection_id, &e);
            let rejection = Frame::error(0, error_code(&e), e.to_string());
            let _ = send_frame(&mut sender, encoding, &rejection).await;
            let _ = sender.send(Message::Close(None)).await;
        }
    }

    finish(&state, &connection_id).await;
}

/// Tear down a connection after its socket closed for any reason.
async fn finish(state: &AppState, connection_id: &str) {
    match state.gateway.disconnect(connection_id).await {
        Ok(outcome) => debug!(connection = %connection_id, ?outcome, "Disconnected"),
        Err(e) => {
            error!(connection = %connection_id, error = %e, "Disconnect cleanup failed");
            metrics::record_error("persistence");
        }
    }
    state.hub.unregister(connection_id);
    metrics::set_online_users(state.presence.online_count());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// A joined connection's message loop.
struct Session<'a> {
    state: &'a AppState,
    connection: Connection,
    encoding: Encoding,
}

impl Session<'_> {
    async fn run(
        &self,
        mut sender: Sink,
        mut receiver: futures_util::stream::SplitStream<WebSocket>,
        mut outbound: duet_core::Outbound,
    ) {
        let connection_id = self.connection.connection_id.as_str();
        let heartbeat = &self.state.config.heartbeat;
        let interval = Duration::from_millis(heartbeat.interval_ms.max(1));
        let timeout = Duration::from_millis(heartbeat.timeout_ms.max(1));

        let mut ping = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut deadline = Instant::now() + timeout;

        // Read buffer for partial frames
        let mut read_buffer = BytesMut::with_capacity(4096);

        'session: loop {
            tokio::select! {
                biased;

                // Events queued by the gateway for this connection
                Some(frame) = outbound.recv() => {
                    if send_frame(&mut sender, self.encoding, &frame).await.is_err() {
                        break;
                    }
                }

                _ = ping.tick() => {
                    let ping = Frame::ping_with_timestamp(unix_millis());
                    if send_frame(&mut sender, self.encoding, &ping).await.is_err() {
                        break;
                    }
                }

                () = tokio::time::sleep_until(deadline) => {
                    debug!(connection = %connection_id, "Heartbeat timeout");
                    metrics::record_error("timeout");
                    break;
                }

                msg = receiver.next() => {
                    deadline = Instant::now() + timeout;

                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            read_buffer.extend_from_slice(&data);

                            loop {
                                match codec::decode_from(&mut read_buffer) {
                                    Ok(Some(frame)) => {
                                        metrics::record_frame(data.len(), "inbound");
                                        if self.handle_frame(frame, &mut sender).await.is_err() {
                                            break 'session;
                                        }
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        read_buffer.clear();
                                        if self.reject_malformed(&e, &mut sender).await.is_err() {
                                            break 'session;
                                        }
                                        break;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            metrics::record_frame(text.len(), "inbound");
                            let handled = match codec::decode_json(&text) {
                                Ok(frame) => self.handle_frame(frame, &mut sender).await,
                                Err(e) => self.reject_malformed(&e, &mut sender).await,
                            };
                            if handled.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            debug!(connection = %connection_id, "Received close frame");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(connection = %connection_id, error = %e, "WebSocket error");
                            metrics::record_error("websocket");
                            break;
                        }
                        None => {
                            debug!(connection = %connection_id, "WebSocket stream ended");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Handle a decoded frame. An error means the socket is gone.
    async fn handle_frame(&self, frame: Frame, sender: &mut Sink) -> Result<()> {
        let connection_id = self.connection.connection_id.as_str();

        match frame {
            Frame::SendMessage {
                id,
                recipient_username,
                content,
            } => {
                debug!(connection = %connection_id, recipient = %recipient_username, "Send message");

                let start = std::time::Instant::now();
                let request = CreateMessage::new(recipient_username, content);
                let response = match self.state.gateway.send_message(&self.connection, request).await
                {
                    Ok(message) => {
                        metrics::record_message_sent(message.read_at.is_some());
                        Frame::ack(id)
                    }
                    Err(e) => {
                        log_gateway_error(connection_id, &e);
                        Frame::error(id, error_code(&e), e.to_string())
                    }
                };
                metrics::record_latency(start.elapsed().as_secs_f64());

                send_frame(sender, self.encoding, &response).await?;
            }

            Frame::Ping { timestamp } => {
                send_frame(sender, self.encoding, &Frame::pong(timestamp)).await?;
            }

            Frame::Pong { .. } => {}

            other => {
                warn!(connection = %connection_id, frame_type = ?other.frame_type(), "Unexpected frame type");
                metrics::record_error("unexpected_frame");
                let error = Frame::error(0, codes::UNEXPECTED_FRAME, "unexpected frame");
                send_frame(sender, self.encoding, &error).await?;
            }
        }

        Ok(())
    }

    async fn reject_malformed(
        &self,
        e: &duet_protocol::ProtocolError,
        sender: &mut Sink,
    ) -> Result<()> {
        warn!(connection = %self.connection.connection_id, error = %e, "Malformed frame");
        metrics::record_error("protocol");
        let error = Frame::error(0, codes::MALFORMED_FRAME, e.to_string());
        send_frame(sender, self.encoding, &error).await
    }
}

/// Map a gateway failure to its wire error code.
fn error_code(e: &GatewayError) -> u16 {
    match e {
        GatewayError::Authentication => codes::AUTHENTICATION,
        GatewayError::Validation(_) => codes::VALIDATION,
        GatewayError::NotFound(_) => codes::NOT_FOUND,
        GatewayError::Persistence(_) => codes::PERSISTENCE,
    }
}

fn log_gateway_error(connection_id: &str, e: &GatewayError) {
    match e {
        GatewayError::Persistence(_) => {
            error!(connection = %connection_id, error = %e, "Persistence failure");
            metrics::record_error("persistence");
        }
        GatewayError::Authentication => {
            warn!(connection = %connection_id, "Rejected unauthenticated connection");
            metrics::record_error("authentication");
        }
        GatewayError::Validation(_) | GatewayError::NotFound(_) => {
            warn!(connection = %connection_id, error = %e, "Request rejected");
            metrics::record_error("rejected");
        }
    }
}

/// Send a frame to the WebSocket in the connection's encoding.
async fn send_frame(sender: &mut Sink, encoding: Encoding, frame: &Frame) -> Result<()> {
    let message = match encoding {
        Encoding::MessagePack => Message::Binary(codec::encode(frame)?.to_vec()),
        Encoding::Json => Message::Text(codec::encode_json(frame)?),
    };
    let len = match &message {
        Message::Binary(data) => data.len(),
        Message::Text(text) => text.len(),
        _ => 0,
    };
    metrics::record_frame(len, "outbound");
    sender.send(message).await?;
    Ok(())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;
    use axum::http::HeaderValue;
    use duet_core::StoreError;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer t-amy"));
        assert_eq!(bearer_token(&headers), Some("t-amy".to_string()));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(error_code(&GatewayError::Authentication), 4001);
        assert_eq!(error_code(&GatewayError::Validation("x".into())), 4000);
        assert_eq!(error_code(&GatewayError::NotFound("x".into())), 4004);
        assert_eq!(
            error_code(&GatewayError::Persistence(StoreError::Timeout)),
            5000
        );
    }

    #[tokio::test]
    async fn test_state_seeds_users() {
        let config = Config {
            users: vec![UserConfig {
                username: "amy".into(),
                known_as: None,
                token: "t-amy".into(),
            }],
            ..Config::default()
        };
        let state = AppState::new(config);

        let _rx = state.hub.register("a1").unwrap();
        let ctx = ConnectionContext::new("a1")
            .with_token(Some("t-amy".into()))
            .with_param(duet_core::PEER_PARAM, "bob");
        let joined = state.gateway.connect(&ctx).await.unwrap();

        assert_eq!(joined.connection.username, "amy");
        assert_eq!(state.presence.online_users(), vec!["amy".to_string()]);
    }
}
