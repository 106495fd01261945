//! WebSocket transport for real-time voice sessions
//!
//! The transport layer stays thin: it upgrades the connection, runs the
//! `hello` handshake, then shuttles frames between the socket and the
//! session task. Text frames carry JSON control messages; binary frames
//! carry single compressed audio packets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::audio::{AudioFormat, ListenMode};
use crate::config::Config;
use crate::events::EventBus;
use crate::pipeline::TurnPipeline;
use crate::session::{Session, SessionInbound, SessionOutbound};
use crate::{Error, Result};

/// How long a client gets to send `hello` before the connection is dropped
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Audio format parameters carried in both `hello` directions
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_ms: u32,
}

impl From<AudioFormat> for AudioParams {
    fn from(format: AudioFormat) -> Self {
        Self {
            sample_rate: format.sample_rate,
            channels: format.channels,
            frame_ms: format.frame_ms,
        }
    }
}

/// Incoming control message from client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlIn {
    /// Handshake; must be the first message on the socket
    Hello {
        #[serde(default)]
        device_id: Option<String>,
        /// Requested format; absent = server defaults
        #[serde(default)]
        audio: Option<AudioParams>,
    },
    /// Typed turn, bypasses transcription
    Text {
        content: String,
        #[serde(default)]
        speaker: Option<String>,
    },
    /// Adjust or drive the voice gate
    Listen {
        #[serde(default)]
        mode: Option<ListenMode>,
        #[serde(default)]
        action: Option<ListenAction>,
    },
    /// Cancel the in-flight turn
    Abort,
    /// Ping to keep connection alive
    Ping,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenAction {
    Start,
    Stop,
}

/// Outgoing control message to client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlOut {
    /// Handshake accepted; echoes the negotiated audio format
    Hello {
        session_id: String,
        audio: AudioParams,
    },
    /// Final transcription of the turn audio
    Transcript { text: String },
    /// Recognized intent
    Intent { name: String, confidence: f32 },
    /// Assistant text chunk (streamed)
    ReplyDelta { content: String },
    /// Assistant reply complete
    ReplyDone { message_id: String },
    /// Brackets a burst of binary audio frames
    Tts { action: TtsAction },
    /// Turn lifecycle marker
    Turn { event: TurnEvent },
    /// Error occurred
    Error { code: String, message: String },
    /// Pong response
    Pong,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnEvent {
    Started,
    Ended,
}

/// Shared state handed to every connection
pub struct AppState {
    pub config: Config,
    pub pipeline: TurnPipeline,
    pub events: EventBus,
}

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until shutdown
///
/// # Errors
///
/// Returns `Error::Io` if the listen address cannot be bound.
pub async fn serve(state: Arc<AppState>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port)
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address: {e}")))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gateway listening");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Run the handshake, then bridge the socket to a session task
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // First message must be hello, within the handshake window
    let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => return Some(text),
                Message::Binary(_) => {
                    tracing::warn!("dropping audio frame received before handshake");
                }
                Message::Close(_) => return None,
                _ => {}
            }
        }
        None
    })
    .await;

    let Ok(Some(text)) = hello else {
        tracing::debug!("connection closed before handshake");
        return;
    };

    let (device_id, format) = match parse_hello(&text, &state.config) {
        Ok(negotiated) => negotiated,
        Err(e) => {
            tracing::warn!(error = %e, "handshake rejected");
            send_control(
                &mut sender,
                &ControlOut::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<SessionOutbound>(64);
    let (inbound_tx, inbound_rx) = mpsc::channel::<SessionInbound>(64);

    let session = match Session::new(
        session_id.clone(),
        device_id.clone(),
        format,
        &state.config,
        state.pipeline.clone(),
        state.events.clone(),
        outbound_tx,
    ) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "failed to build session");
            send_control(
                &mut sender,
                &ControlOut::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    send_control(
        &mut sender,
        &ControlOut::Hello {
            session_id: session_id.clone(),
            audio: format.into(),
        },
    )
    .await;

    tracing::info!(session_id = %session_id, device_id = %device_id, "WebSocket connected");

    let session_task = tokio::spawn(session.run(inbound_rx));

    // Forward session output to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            let message = match outbound {
                SessionOutbound::Control(control) => match serde_json::to_string(&control) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize control message");
                        continue;
                    }
                },
                SessionOutbound::Audio(packet) => Message::Binary(packet.into()),
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    // Forward socket input to the session
    let recv_session_id = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let inbound = match msg {
                Message::Binary(data) => SessionInbound::Audio(data.to_vec()),
                Message::Text(text) => match serde_json::from_str::<ControlIn>(&text) {
                    Ok(control) => SessionInbound::Control(control),
                    Err(e) => {
                        tracing::warn!(session_id = %recv_session_id, error = %e, "invalid control message");
                        continue;
                    }
                },
                Message::Close(_) => {
                    tracing::info!(session_id = %recv_session_id, "WebSocket closed by client");
                    break;
                }
                _ => continue,
            };
            if inbound_tx.send(inbound).await.is_err() {
                break;
            }
        }
        let _ = inbound_tx.send(SessionInbound::Closed).await;
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let _ = session_task.await;
    tracing::info!(session_id = %session_id, "WebSocket disconnected");
}

/// Parse and validate the client's `hello`
fn parse_hello(text: &str, config: &Config) -> Result<(String, AudioFormat)> {
    let control: ControlIn = serde_json::from_str(text)
        .map_err(|e| Error::Protocol(format!("invalid handshake message: {e}")))?;

    let ControlIn::Hello { device_id, audio } = control else {
        return Err(Error::Protocol(
            "first message must be hello".to_string(),
        ));
    };

    let format = audio.map_or_else(
        || config.audio.format(),
        |requested| AudioFormat {
            sample_rate: requested.sample_rate,
            channels: requested.channels,
            frame_ms: requested.frame_ms,
        },
    );
    format.validate()?;

    Ok((device_id.unwrap_or_else(|| "unknown".to_string()), format))
}

async fn send_control(
    sender: &mut (impl SinkExt<Message> + Unpin),
    control: &ControlOut,
) {
    if let Ok(text) = serde_json::to_string(control) {
        let _ = sender.send(Message::Text(text.into())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_deserializes_with_format() {
        let json = r#"{"type":"hello","device_id":"dev-1","audio":{"sample_rate":16000,"channels":1,"frame_ms":60}}"#;
        let msg: ControlIn = serde_json::from_str(json).unwrap();
        let ControlIn::Hello { device_id, audio } = msg else {
            panic!("expected hello");
        };
        assert_eq!(device_id.as_deref(), Some("dev-1"));
        assert_eq!(audio.unwrap().frame_ms, 60);
    }

    #[test]
    fn listen_deserializes_bare() {
        let json = r#"{"type":"listen","action":"stop"}"#;
        let msg: ControlIn = serde_json::from_str(json).unwrap();
        let ControlIn::Listen { mode, action } = msg else {
            panic!("expected listen");
        };
        assert!(mode.is_none());
        assert!(matches!(action, Some(ListenAction::Stop)));
    }

    #[test]
    fn reply_delta_serializes() {
        let msg = ControlOut::ReplyDelta {
            content: "hello".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"reply_delta\""));
        assert!(json.contains("\"content\":\"hello\""));
    }

    #[test]
    fn tts_markers_serialize() {
        let json = serde_json::to_string(&ControlOut::Tts {
            action: TtsAction::Start,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"tts","action":"start"}"#);
    }

    #[test]
    fn hello_rejects_unsupported_format() {
        let config = Config::default();
        let json = r#"{"type":"hello","audio":{"sample_rate":44100,"channels":1,"frame_ms":60}}"#;
        let result = parse_hello(json, &config);
        assert!(result.is_err());
    }

    #[test]
    fn non_hello_first_message_is_protocol_error() {
        let config = Config::default();
        let err = parse_hello(r#"{"type":"ping"}"#, &config).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn hello_defaults_to_server_format() {
        let config = Config::default();
        let json = r#"{"type":"hello"}"#;
        let (device_id, format) = parse_hello(json, &config).unwrap();
        assert_eq!(device_id, "unknown");
        assert_eq!(format.sample_rate, 16000);
    }
}
