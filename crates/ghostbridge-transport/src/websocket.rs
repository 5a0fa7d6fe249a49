//! WebSocket transport for the GhostText extension.
//!
//! One listener serves both halves of the handshake: a plain request on
//! any path gets the discovery [`Greeting`], an upgrade request on any path
//! starts a session.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        rejection::ExtensionRejection,
        ws::{
            CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code,
            rejection::WebSocketUpgradeRejection,
        },
    },
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_TYPE, ORIGIN, USER_AGENT},
    },
    response::{IntoResponse, Response},
};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use ghostbridge_core::{
    ClientInfo, DocumentSnapshot, RecvError, SendError, SnapshotSink, SnapshotSource,
    SurfaceFactory,
};
use ghostbridge_session::SessionBridge;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::{
    ServerConfig,
    protocol::{self, Greeting},
};

/// Read half of an upgraded connection.
pub struct WsSource {
    stream: SplitStream<WebSocket>,
}

impl WsSource {
    #[must_use]
    pub const fn new(stream: SplitStream<WebSocket>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl SnapshotSource for WsSource {
    async fn recv(&mut self) -> Result<DocumentSnapshot, RecvError> {
        loop {
            let text = match self.stream.next().await {
                None => return Err(RecvError::Closed),
                Some(Err(e)) => return Err(RecvError::Transport(e.to_string())),
                Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                Some(Ok(Message::Binary(data))) => String::from_utf8(data.to_vec())
                    .map_err(|e| RecvError::Malformed(format!("binary message is not utf-8: {e}")))?,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => return Err(close_error(frame.as_ref())),
            };
            return Ok(protocol::decode_snapshot(&text)?);
        }
    }
}

/// Map a close frame to the session outcome it stands for.
///
/// Normal closure, going away and a missing status are orderly; every
/// other code is a failure worth reporting.
fn close_error(frame: Option<&CloseFrame>) -> RecvError {
    match frame {
        None => RecvError::Closed,
        Some(frame) => match frame.code {
            close_code::NORMAL | close_code::AWAY | close_code::STATUS => RecvError::Closed,
            code => RecvError::AbnormalClose {
                code,
                reason: frame.reason.as_str().to_owned(),
            },
        },
    }
}

/// Write half of an upgraded connection.
pub struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

impl WsSink {
    #[must_use]
    pub const fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl SnapshotSink for WsSink {
    async fn send(&mut self, snapshot: &DocumentSnapshot) -> Result<(), SendError> {
        let json = protocol::encode_snapshot(snapshot)?;
        self.sink
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| SendError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SendError> {
        self.sink
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            })))
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        self.sink
            .close()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))
    }
}

struct AppState<F>
where
    F: SurfaceFactory,
{
    bridge: Arc<SessionBridge<F>>,
    config: Arc<ServerConfig>,
    /// Port announced in the greeting.
    port: u16,
}

impl<F> Clone for AppState<F>
where
    F: SurfaceFactory,
{
    fn clone(&self) -> Self {
        Self {
            bridge: Arc::clone(&self.bridge),
            config: Arc::clone(&self.config),
            port: self.port,
        }
    }
}

async fn root<F>(
    State(state): State<AppState<F>>,
    headers: HeaderMap,
    peer: Result<ConnectInfo<SocketAddr>, ExtensionRejection>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response
where
    F: SurfaceFactory,
{
    let Ok(ws) = ws else {
        return discovery(state.port);
    };

    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
    if !state.config.origin_allowed(origin) {
        warn!(origin, "rejected connection from disallowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    let client = ClientInfo::new()
        .with_peer(peer.ok().map(|ConnectInfo(addr)| addr))
        .with_user_agent(
            headers
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
        );

    let config = &state.config;
    ws.read_buffer_size(config.read_buffer_size)
        .write_buffer_size(config.write_buffer_size)
        .max_message_size(config.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state.bridge, client))
}

fn discovery(port: u16) -> Response {
    match Greeting::new(port).to_body() {
        Ok(body) => ([(CONTENT_TYPE, "application/json")], body).into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode greeting");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_socket<F>(socket: WebSocket, bridge: Arc<SessionBridge<F>>, client: ClientInfo)
where
    F: SurfaceFactory,
{
    let (sink, stream) = socket.split();
    let session_id = client.session_id;
    let user_agent = client.user_agent_or_dash().to_owned();

    match bridge
        .open(WsSource::new(stream), WsSink::new(sink), client)
        .await
    {
        Ok(session) => {
            session.run().await;
        }
        // Dropping the socket is the only notice the browser gets.
        Err(err) => warn!(
            session = %session_id,
            user_agent,
            error = %err,
            "failed to open session"
        ),
    }
}

/// Build the router.
///
/// `port` is what the discovery greeting announces, normally the port the
/// listener is bound to.
#[must_use]
pub fn router<F>(config: ServerConfig, factory: F, port: u16) -> Router
where
    F: SurfaceFactory,
{
    let cors = if config.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new().allow_origin(AllowOrigin::list(
            config
                .allowed_origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        ))
    };

    let state = AppState {
        bridge: Arc::new(SessionBridge::new(factory, config.session.clone())),
        config: Arc::new(config),
        port,
    };

    Router::new()
        .fallback(root::<F>)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind the listener named by `config`.
///
/// # Errors
/// Returns error if the address cannot be bound.
pub async fn bind(config: &ServerConfig) -> std::io::Result<TcpListener> {
    TcpListener::bind(config.bind_addr()).await
}

/// Serve GhostText connections on `listener` until it fails.
///
/// # Errors
/// Returns error if the listener fails.
pub async fn serve<F>(listener: TcpListener, config: ServerConfig, factory: F) -> std::io::Result<()>
where
    F: SurfaceFactory,
{
    let addr = listener.local_addr()?;
    info!(%addr, "listening for GhostText connections");
    let app = router(config, factory, addr.port());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(code: u16) -> CloseFrame {
        CloseFrame {
            code,
            reason: "bye".into(),
        }
    }

    #[test]
    fn test_orderly_closes() {
        assert!(close_error(None).is_expected());
        assert!(close_error(Some(&frame(1000))).is_expected());
        assert!(close_error(Some(&frame(1001))).is_expected());
        assert!(close_error(Some(&frame(1005))).is_expected());
    }

    #[test]
    fn test_abnormal_close_keeps_code_and_reason() {
        let err = close_error(Some(&frame(1011)));
        assert!(!err.is_expected());
        let RecvError::AbnormalClose { code, reason } = err else {
            panic!("expected abnormal close");
        };
        assert_eq!(code, 1011);
        assert_eq!(reason, "bye");
    }
}
