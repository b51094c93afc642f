//! # WebSocket Transport Boundary
//!
//! Translates between the session coordinator's abstract event stream and
//! the concrete WebSocket protocol. Two endpoints share the same actor:
//!
//! - `/ws/audio` — batch: one complete audio blob (binary, or base64 text
//!   from older clients) runs the full pipeline once
//! - `/ws/audio-stream` — streaming: raw PCM chunks with live partial
//!   transcripts, finalized by a `{"type":"stop"}` control frame,
//!   disconnect, or the idle window
//!
//! ## WebSocket Protocol:
//! - **Client → Server**: binary audio frames; text frames carrying JSON
//!   control messages (or a base64 blob on the batch endpoint)
//! - **Server → Client**: JSON events (`partial`/`final`/`reply`/`debug`/
//!   `error`) and at most one terminal binary frame of synthesized audio
//! - **Close codes**: normal completion, policy (unauthorized), error
//!   (internal failure)
//!
//! ## Actor Model:
//! Each connection is an independent Actix actor. Provider-side STT events
//! arrive as an attached stream, so they interleave with inbound frames in
//! the actor mailbox without either starving the other; the blocking
//! pipeline tail runs on a spawned task and reports back as a message.

use crate::config::AppConfig;
use crate::providers::reply::{build_reply_chain, ReplyChain};
use crate::providers::stt::{BatchSttBackend, VendorBatchStt};
use crate::providers::tts::{build_tts_chain, TtsChain};
use crate::session::coordinator::{FinalizeResult, FollowUp, SessionCoordinator, Step};
use crate::session::events::SttEvent;
use crate::session::SessionMode;
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// How often the actor checks the streaming idle-finalize window.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// WebSocket actor owning one voice session.
pub struct RelaySocket {
    coordinator: SessionCoordinator,
    provided_token: Option<String>,
    reply_chain: Arc<ReplyChain>,
    tts_chain: Arc<TtsChain>,
    batch_stt: Option<Arc<dyn BatchSttBackend>>,
    app_state: web::Data<AppState>,
    /// Whether this session was counted in the active-session metric
    counted: bool,
}

impl RelaySocket {
    pub fn new(
        mode: SessionMode,
        config: &AppConfig,
        provided_token: Option<String>,
        app_state: web::Data<AppState>,
    ) -> Self {
        let batch_stt: Option<Arc<dyn BatchSttBackend>> =
            match (&config.stt.api_key, &config.stt.batch_url) {
                (Some(key), Some(url)) => {
                    Some(Arc::new(VendorBatchStt::new(url.clone(), key.clone())))
                }
                _ => None,
            };

        Self {
            coordinator: SessionCoordinator::new(mode, config),
            provided_token,
            reply_chain: Arc::new(build_reply_chain(&config.reply)),
            tts_chain: Arc::new(build_tts_chain(&config.tts)),
            batch_stt,
            app_state,
            counted: false,
        }
    }

    /// Emit a step's events and execute its follow-up action.
    fn apply_step(&mut self, step: Step, ctx: &mut ws::WebsocketContext<Self>) {
        for event in &step.events {
            ctx.text(event.to_json());
        }

        match step.follow_up {
            None => {}
            Some(FollowUp::Finalize) => self.dispatch_finalize(ctx),
            Some(FollowUp::AwaitVendorFlush) => {
                // Give in-flight vendor events a short window to drain, then
                // force the pipeline with best-available data
                let flush = self.coordinator.flush_timeout();
                ctx.run_later(flush, |act, ctx| {
                    if !act.coordinator.finalize_dispatched() {
                        debug!(
                            session = act.coordinator.session_id(),
                            "vendor flush window expired, forcing finalize"
                        );
                        let step = act.coordinator.force_finalize();
                        act.apply_step(step, ctx);
                    }
                });
            }
            Some(FollowUp::CloseError) => {
                ctx.close(Some(internal_error_close()));
                ctx.stop();
            }
        }
    }

    /// Run the reply/synthesis tail on a worker task. The coordinator hands
    /// out the job at most once per session.
    fn dispatch_finalize(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(job) = self.coordinator.make_finalize_job(
            self.reply_chain.clone(),
            self.tts_chain.clone(),
            self.batch_stt.clone(),
        ) else {
            return;
        };

        let addr = ctx.address();
        tokio::spawn(async move {
            let result = job.run().await;
            addr.do_send(PipelineComplete(result));
        });
    }
}

/// Close reason for a failed token check.
fn unauthorized_close() -> ws::CloseReason {
    ws::CloseReason {
        code: ws::CloseCode::Policy,
        description: Some("Unauthorized".to_string()),
    }
}

/// Close reason for an unrecoverable server-side failure.
fn internal_error_close() -> ws::CloseReason {
    ws::CloseReason {
        code: ws::CloseCode::Error,
        description: None,
    }
}

/// Completed pipeline tail delivered back to the connection actor.
#[derive(Message)]
#[rtype(result = "()")]
struct PipelineComplete(FinalizeResult);

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let token = self.provided_token.take();
        if !self.coordinator.authenticate(token.as_deref()) {
            // Wrong or missing token: close with the policy code and send
            // nothing else
            ctx.close(Some(unauthorized_close()));
            ctx.stop();
            return;
        }

        self.app_state.increment_active_sessions();
        self.counted = true;
        info!(session = self.coordinator.session_id(), "voice session started");

        if let Some(events) = self.coordinator.begin_listening() {
            ctx.add_stream(UnboundedReceiverStream::new(events));
        }

        // Streaming sessions with a silent client are finalized after the
        // configured idle window, as if a stop frame had arrived
        ctx.run_interval(IDLE_SWEEP_INTERVAL, |act, ctx| {
            if act.coordinator.idle_finalize_due() {
                debug!(
                    session = act.coordinator.session_id(),
                    "idle window expired, finalizing"
                );
                let step = act.coordinator.request_stop();
                act.apply_step(step, ctx);
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if self.counted {
            self.app_state.decrement_active_sessions();
        }
        self.coordinator.mark_closed();

        let session = self.coordinator.session();
        let duration_ms = (chrono::Utc::now() - session.created_at).num_milliseconds();
        info!(
            session = %session.id,
            duration_ms,
            reply_len = session.reply_text.as_ref().map(String::len).unwrap_or(0),
            audio_bytes = session.audio_bytes_out.unwrap_or(0),
            "voice session closed"
        );
    }
}

/// Inbound transport frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                let step = self.coordinator.on_audio(&data);
                self.apply_step(step, ctx);
            }
            Ok(ws::Message::Text(text)) => {
                let step = self.coordinator.on_text_frame(&text);
                self.apply_step(step, ctx);
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(
                    session = self.coordinator.session_id(),
                    state = self.coordinator.state().as_str(),
                    ?reason,
                    "close frame received"
                );
                let step = self.coordinator.on_disconnect();
                let idle = step.events.is_empty() && step.follow_up.is_none();
                self.apply_step(step, ctx);
                if idle && !self.coordinator.finalize_dispatched() {
                    ctx.stop();
                }
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                // Transport failures are graceful end-of-input, not errors
                error!(session = self.coordinator.session_id(), error = %e, "websocket protocol error");
                let step = self.coordinator.on_disconnect();
                self.apply_step(step, ctx);
            }
        }
    }

    /// The client stream ended without a close frame: finalize with
    /// whatever the session has heard so far.
    fn finished(&mut self, ctx: &mut Self::Context) {
        let step = self.coordinator.on_disconnect();
        let idle = step.events.is_empty() && step.follow_up.is_none();
        self.apply_step(step, ctx);
        if idle && !self.coordinator.finalize_dispatched() {
            ctx.stop();
        }
    }
}

/// Provider-side transcription events, drained from the vendor channel.
impl StreamHandler<SttEvent> for RelaySocket {
    fn handle(&mut self, event: SttEvent, ctx: &mut Self::Context) {
        let step = self.coordinator.on_stt_event(event);
        self.apply_step(step, ctx);
    }

    /// The vendor channel closing is not a session event; the stop/flush
    /// path decides when the session ends.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(
            session = self.coordinator.session_id(),
            "vendor event stream ended"
        );
    }
}

/// Pipeline tail finished: emit the ordered events, the terminal audio
/// frame, and close normally.
impl Handler<PipelineComplete> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: PipelineComplete, ctx: &mut Self::Context) {
        let FinalizeResult {
            events,
            audio,
            reply_text,
        } = msg.0;

        for event in &events {
            ctx.text(event.to_json());
        }
        self.coordinator.record_reply(&reply_text);

        let audio_len = audio.as_ref().map(Vec::len);
        if let Some(bytes) = audio {
            ctx.binary(bytes);
        }
        self.coordinator.record_audio(audio_len);

        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Normal,
            description: None,
        }));
        ctx.stop();
    }
}

/// Extract the optional `token` query parameter.
fn query_token(req: &HttpRequest) -> Option<String> {
    web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .ok()
        .and_then(|query| query.get("token").cloned())
}

fn start_relay(
    mode: SessionMode,
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        peer = ?req.connection_info().peer_addr(),
        path = req.path(),
        "websocket connection request"
    );

    let config = app_state.get_config();
    let token = query_token(&req);
    let socket = RelaySocket::new(mode, &config, token, app_state);
    ws::start(socket, &req, stream)
}

/// `GET /ws/audio` — batch pipeline over one complete blob.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    start_relay(SessionMode::Batch, req, stream, app_state)
}

/// `GET /ws/audio-stream` — streaming pipeline over PCM chunks.
pub async fn audio_stream_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    start_relay(SessionMode::Streaming, req, stream, app_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_query_token_extraction() {
        let req = TestRequest::with_uri("/ws/audio?token=test123").to_http_request();
        assert_eq!(query_token(&req), Some("test123".to_string()));

        let req = TestRequest::with_uri("/ws/audio").to_http_request();
        assert_eq!(query_token(&req), None);

        let req = TestRequest::with_uri("/ws/audio-stream?token=abc&chunk_ms=160").to_http_request();
        assert_eq!(query_token(&req), Some("abc".to_string()));
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(unauthorized_close().code, ws::CloseCode::Policy);
        assert_eq!(internal_error_close().code, ws::CloseCode::Error);
    }
}
