//! # WebSocket Streaming Transcription Handler
//!
//! Connection-facing loop for `/ws/transcribe`. Each connection is one actor
//! holding the protocol phase machine; the heavy lifting happens in a
//! dedicated per-connection session task fed over a channel, which keeps
//! recognition strictly serial for the session while the actor stays
//! responsive to frames.
//!
//! ## Protocol:
//! 1. Client connects and sends a handshake:
//!    `{"type":"start","format":"s16le","rate":16000,"model_size":"small"}`
//! 2. Client streams binary audio payloads (arbitrary chunking)
//! 3. Server pushes deltas:
//!    `{"type":"delta","append":"...","segments":[{start,end,text},...]}`
//! 4. Client sends the text frame `"stop"` (or `"close"`)
//! 5. Server flushes a last delta if any, sends `{"type":"final"}` exactly
//!    once, and closes normally
//!
//! Malformed or unsupported handshakes close with the protocol-error code
//! (1002) before any session resource is allocated; unexpected mid-stream
//! failures close with the internal-error code (1011). A transport
//! disconnect at any point is a normal termination path.

use crate::audio::session::{parse_handshake, StreamingSession, TranscriptDelta};
use crate::state::AppState;
use crate::transcription::{Transcriber, TranscriptSegment};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Protocol phase of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingHandshake,
    Streaming,
    Finalizing,
    Closed,
}

/// Commands forwarded from the actor to the session task.
enum SessionCommand {
    Audio(Vec<u8>),
    Finalize,
}

/// Outgoing protocol messages.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Delta {
        append: String,
        segments: Vec<TranscriptSegment>,
    },
    Final,
}

impl From<TranscriptDelta> for ServerMessage {
    fn from(delta: TranscriptDelta) -> Self {
        ServerMessage::Delta {
            append: delta.append,
            segments: delta.segments,
        }
    }
}

/// WebSocket actor for one streaming connection.
pub struct TranscribeWs {
    app_state: web::Data<AppState>,
    transcriber: Arc<dyn Transcriber>,

    session_id: String,
    fallback_model_size: Option<String>,

    phase: Phase,
    session_tx: Option<mpsc::UnboundedSender<SessionCommand>>,

    last_heartbeat: Instant,
    counted_stream: bool,
}

impl TranscribeWs {
    pub fn new(
        app_state: web::Data<AppState>,
        transcriber: Arc<dyn Transcriber>,
        fallback_model_size: Option<String>,
    ) -> Self {
        Self {
            app_state,
            transcriber,
            session_id: Uuid::new_v4().to_string(),
            fallback_model_size,
            phase: Phase::AwaitingHandshake,
            session_tx: None,
            last_heartbeat: Instant::now(),
            counted_stream: false,
        }
    }

    /// First text frame: validate the handshake and spin up the session.
    fn handle_handshake(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let (format, model_override) =
            match parse_handshake(text, self.fallback_model_size.as_deref()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "Rejected handshake");
                    self.close_with(ctx, ws::CloseCode::Protocol, e.to_string());
                    return;
                }
            };

        let config = self.app_state.get_config();
        let session = match StreamingSession::new(
            self.session_id.clone(),
            format,
            model_override,
            Arc::clone(&self.transcriber),
            &config,
        ) {
            Ok(session) => session,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "Session setup failed");
                self.close_with(ctx, ws::CloseCode::Error, "Internal error".to_string());
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.session_tx = Some(tx);
        self.phase = Phase::Streaming;
        self.app_state.stream_opened();
        self.counted_stream = true;

        info!(
            session_id = %self.session_id,
            format = %format.format,
            "Handshake accepted, streaming"
        );

        tokio::spawn(run_session(session, rx, ctx.address()));
    }

    /// Forward a command to the session task; a closed channel means the
    /// task died unexpectedly.
    fn send_command(&mut self, command: SessionCommand, ctx: &mut ws::WebsocketContext<Self>) {
        let alive = self
            .session_tx
            .as_ref()
            .map(|tx| tx.send(command).is_ok())
            .unwrap_or(false);

        if !alive {
            error!(session_id = %self.session_id, "Session task is gone");
            self.close_with(ctx, ws::CloseCode::Error, "Internal error".to_string());
        }
    }

    fn close_with(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        code: ws::CloseCode,
        reason: String,
    ) {
        self.phase = Phase::Closed;
        ctx.close(Some(ws::CloseReason {
            code,
            description: (!reason.is_empty()).then_some(reason),
        }));
        ctx.stop();
    }
}

impl Actor for TranscribeWs {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "WebSocket connection opened");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "Heartbeat timeout, dropping connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Runs on every termination path. Dropping the command channel ends the
    /// session task's receive loop, which runs the one-and-only teardown.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.phase = Phase::Closed;
        self.session_tx = None;

        if self.counted_stream {
            self.app_state.stream_closed();
        }

        debug!(session_id = %self.session_id, "WebSocket connection closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TranscribeWs {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match self.phase {
                Phase::AwaitingHandshake => self.handle_handshake(&text, ctx),
                Phase::Streaming => match &*text {
                    "stop" | "close" => {
                        info!(session_id = %self.session_id, "Stop signal received");
                        self.phase = Phase::Finalizing;
                        self.send_command(SessionCommand::Finalize, ctx);
                    }
                    // Unrelated text frames are not part of the protocol but
                    // also not an error.
                    other => {
                        debug!(session_id = %self.session_id, frame = %other, "Ignoring text frame")
                    }
                },
                Phase::Finalizing | Phase::Closed => {}
            },
            Ok(ws::Message::Binary(data)) => match self.phase {
                Phase::Streaming => self.send_command(SessionCommand::Audio(data.to_vec()), ctx),
                Phase::AwaitingHandshake => {
                    warn!(session_id = %self.session_id, "Audio before handshake");
                    self.close_with(
                        ctx,
                        ws::CloseCode::Protocol,
                        "Expected start handshake before audio".to_string(),
                    );
                }
                Phase::Finalizing | Phase::Closed => {}
            },
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, ?reason, "Client closed connection");
                self.phase = Phase::Closed;
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                // Transport-level failure: normal termination, not an error
                // surfaced to the client.
                info!(session_id = %self.session_id, error = %e, "Transport error, closing");
                ctx.stop();
            }
        }
    }
}

/// Outgoing protocol message from the session task.
#[derive(Message)]
#[rtype(result = "()")]
struct Outbound(ServerMessage);

impl Handler<Outbound> for TranscribeWs {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match serde_json::to_string(&msg.0) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(session_id = %self.session_id, error = %e, "Failed to encode message"),
        }
    }
}

/// Close request from the session task.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseConnection {
    code: ws::CloseCode,
    reason: Option<String>,
}

impl Handler<CloseConnection> for TranscribeWs {
    type Result = ();

    fn handle(&mut self, msg: CloseConnection, ctx: &mut Self::Context) {
        self.phase = Phase::Closed;
        ctx.close(Some(ws::CloseReason {
            code: msg.code,
            description: msg.reason,
        }));
        ctx.stop();
    }
}

/// The per-connection session task.
///
/// Owns the `StreamingSession` for its whole life: commands arrive over the
/// channel, deltas go back through the actor's mailbox. All exits converge
/// on the cleanup call at the bottom, so teardown runs exactly once whether
/// the stream finalized, errored, or simply disconnected.
async fn run_session(
    mut session: StreamingSession,
    mut rx: mpsc::UnboundedReceiver<SessionCommand>,
    addr: Addr<TranscribeWs>,
) {
    if let Err(e) = session.start().await {
        error!(session_id = %session.id(), error = %e, "Decode pipeline failed to start");
        addr.do_send(CloseConnection {
            code: ws::CloseCode::Error,
            reason: Some("Internal error".to_string()),
        });
        session.cleanup().await;
        return;
    }

    while let Some(command) = rx.recv().await {
        match command {
            SessionCommand::Audio(data) => match session.process_audio(&data, false).await {
                Ok(Some(delta)) => addr.do_send(Outbound(delta.into())),
                Ok(None) => {}
                Err(e) => {
                    error!(session_id = %session.id(), error = %e, "Streaming failure");
                    addr.do_send(CloseConnection {
                        code: ws::CloseCode::Error,
                        reason: Some("Internal error".to_string()),
                    });
                    break;
                }
            },
            SessionCommand::Finalize => {
                match session.finalize().await {
                    Ok(Some(delta)) => addr.do_send(Outbound(delta.into())),
                    Ok(None) => {}
                    Err(e) => {
                        error!(session_id = %session.id(), error = %e, "Finalization failure");
                        addr.do_send(CloseConnection {
                            code: ws::CloseCode::Error,
                            reason: Some("Internal error".to_string()),
                        });
                        break;
                    }
                }

                addr.do_send(Outbound(ServerMessage::Final));
                addr.do_send(CloseConnection {
                    code: ws::CloseCode::Normal,
                    reason: None,
                });
                info!(session_id = %session.id(), "Session finalized");
                break;
            }
        }
    }

    session.cleanup().await;
}

/// HTTP → WebSocket upgrade endpoint.
pub async fn ws_transcribe(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
    transcriber: web::Data<dyn Transcriber>,
) -> ActixResult<HttpResponse> {
    let query = web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .unwrap_or_else(|_| web::Query(HashMap::new()));

    let handler = TranscribeWs::new(
        app_state,
        transcriber.into_inner(),
        query.get("model_size").cloned(),
    );

    ws::start(handler, &req, stream)
}
