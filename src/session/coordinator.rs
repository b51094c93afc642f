//! # Session Coordinator
//!
//! The state machine at the heart of the relay. One coordinator per
//! connection: it receives inbound audio/control frames from the transport,
//! drives the active speech-to-text variant, and once a final transcript
//! exists runs the reply and synthesis stages, emitting outbound events in a
//! fixed order.
//!
//! ## Structure:
//! - The frame/event handlers (`on_audio`, `on_text_frame`, `on_stt_event`,
//!   `on_disconnect`) are synchronous and transport-agnostic: each returns a
//!   `Step` with the events to emit plus an optional follow-up action for
//!   the transport layer to execute.
//! - The blocking tail of the pipeline (batch transcription, reply
//!   generation, synthesis) is packaged as a `FinalizeJob` the transport
//!   runs on a worker task, keeping the coordinator responsive to frames.
//!
//! ## Ordering Invariants:
//! - At most one `final` event per session; only non-empty transcripts
//!   produce one
//! - `reply` is emitted exactly once, after `final` (or after end-of-input
//!   when no transcript was recognized)
//! - The terminal audio frame, if any, follows `reply`

use crate::config::{AppConfig, SimulatorConfig};
use crate::pipeline::{normalize_transcript, StageTimer};
use crate::providers::reply::ReplyChain;
use crate::providers::stt::{spawn_vendor_stream, BatchSttBackend, SimulatorStt, VendorStreamHandle};
use crate::providers::tts::TtsChain;
use crate::session::audio::{probe_wav_duration, AudioIntake};
use crate::session::events::{ControlFrame, OutboundEvent, SttEvent};
use crate::session::{Session, SessionMode, SessionState};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Reply used when the session produced no recognizable speech.
pub const APOLOGY_REPLY: &str = "I couldn't hear anything. Please try again.";

/// The speech-to-text variant currently driving this session.
enum ActiveStt {
    /// Vendor realtime stream; events arrive on the coordinator's channel
    Vendor(VendorStreamHandle),
    /// Deterministic offline simulator, paced by ingested audio
    Simulator(SimulatorStt),
    /// Batch path: transcription deferred to the finalize job
    Batch,
}

/// Action the transport layer must execute after applying a step's events.
#[derive(Debug, PartialEq, Eq)]
pub enum FollowUp {
    /// Dispatch the finalize job (reply + synthesis tail)
    Finalize,
    /// Wait the configured flush timeout for in-flight vendor events, then
    /// force-finalize with best-available data
    AwaitVendorFlush,
    /// Unrecoverable failure: close with the internal-error code
    CloseError,
}

/// Result of one coordinator handler invocation.
#[derive(Debug, Default)]
pub struct Step {
    pub events: Vec<OutboundEvent>,
    pub follow_up: Option<FollowUp>,
}

impl Step {
    fn empty() -> Self {
        Self::default()
    }

    fn with_events(events: Vec<OutboundEvent>) -> Self {
        Self {
            events,
            follow_up: None,
        }
    }

    fn merge(&mut self, mut other: Step) {
        self.events.append(&mut other.events);
        if self.follow_up.is_none() {
            self.follow_up = other.follow_up;
        }
    }
}

pub struct SessionCoordinator {
    mode: SessionMode,
    state: SessionState,
    session: Session,
    stages: StageTimer,
    intake: AudioIntake,
    stt: ActiveStt,
    stt_stage: &'static str,
    simulator: SimulatorConfig,
    expected_token: Option<String>,
    stt_api_key: Option<String>,
    stt_streaming_url: String,
    sample_rate: u32,
    flush_timeout: Duration,
    idle_finalize: Duration,
    last_audio: Option<Instant>,
    final_emitted: bool,
    finalize_dispatched: bool,
}

impl SessionCoordinator {
    /// Create a coordinator for a freshly accepted connection.
    ///
    /// Takes a snapshot of the relevant configuration; nothing is shared
    /// mutably with other sessions.
    pub fn new(mode: SessionMode, config: &AppConfig) -> Self {
        Self {
            mode,
            state: SessionState::Accepted,
            session: Session::new(),
            stages: StageTimer::new(),
            intake: AudioIntake::new(&config.audio),
            stt: ActiveStt::Batch,
            stt_stage: "stt",
            simulator: config.simulator.clone(),
            expected_token: config.auth.ws_token.clone(),
            stt_api_key: config.stt.api_key.clone(),
            stt_streaming_url: config.stt.streaming_url.clone(),
            sample_rate: config.audio.sample_rate,
            flush_timeout: Duration::from_millis(config.audio.flush_timeout_ms),
            idle_finalize: Duration::from_millis(config.simulator.idle_finalize_ms),
            last_audio: None,
            final_emitted: false,
            finalize_dispatched: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn flush_timeout(&self) -> Duration {
        self.flush_timeout
    }

    pub fn finalize_dispatched(&self) -> bool {
        self.finalize_dispatched
    }

    /// Check the shared token. `Accepted → Authenticating`, then the caller
    /// either proceeds to `begin_listening` or closes unauthorized.
    pub fn authenticate(&mut self, provided: Option<&str>) -> bool {
        self.state = SessionState::Authenticating;

        let authorized = match &self.expected_token {
            None => true,
            Some(expected) => provided == Some(expected.as_str()),
        };

        if !authorized {
            warn!(session = %self.session.id, "rejected: invalid or missing token");
            self.state = SessionState::Closing;
        }
        authorized
    }

    /// Enter `Listening` and activate the speech-to-text variant.
    ///
    /// Returns the provider event channel when the vendor streaming variant
    /// was selected; the transport layer feeds it back into `on_stt_event`.
    pub fn begin_listening(&mut self) -> Option<UnboundedReceiver<SttEvent>> {
        self.state = SessionState::Listening;

        if self.mode == SessionMode::Batch {
            self.stt = ActiveStt::Batch;
            return None;
        }

        match &self.stt_api_key {
            Some(api_key) => {
                let (handle, events) = spawn_vendor_stream(
                    self.stt_streaming_url.clone(),
                    api_key.clone(),
                    self.sample_rate,
                );
                self.stt = ActiveStt::Vendor(handle);
                self.stt_stage = "stt:vendor";
                self.stages.start(self.stt_stage);
                info!(session = %self.session.id, "streaming session using vendor transcription");
                Some(events)
            }
            None => {
                self.stt = ActiveStt::Simulator(SimulatorStt::new(&self.simulator));
                self.stt_stage = "stt:simulator";
                self.stages.start(self.stt_stage);
                info!(session = %self.session.id, "streaming session using offline simulator");
                None
            }
        }
    }

    /// Handle one inbound binary frame.
    pub fn on_audio(&mut self, data: &[u8]) -> Step {
        if self.state != SessionState::Listening {
            return Step::empty();
        }

        self.session.mark_first_audio();
        self.last_audio = Some(Instant::now());

        if self.mode == SessionMode::Batch {
            // One complete blob starts the pipeline
            self.intake.append_blob(data);
            if let Some(duration) = probe_wav_duration(data) {
                debug!(session = %self.session.id, bytes = data.len(), duration_s = duration,
                       "received audio blob");
            }
            self.state = SessionState::Transcribing;
            return Step {
                events: Vec::new(),
                follow_up: Some(FollowUp::Finalize),
            };
        }

        if let Err(reason) = self.intake.append(data) {
            // Unusable frames are dropped, not fatal
            debug!(session = %self.session.id, %reason, "ignoring audio frame");
            return Step::empty();
        }
        debug!(
            session = %self.session.id,
            bytes = data.len(),
            peak = AudioIntake::peak_amplitude(data),
            ingested_ms = self.intake.ingested_ms(),
            "audio frame"
        );

        let mut provider_events = Vec::new();
        match &mut self.stt {
            ActiveStt::Vendor(handle) => handle.send_audio(data.to_vec()),
            ActiveStt::Simulator(sim) => {
                provider_events = sim.on_ingested(self.intake.ingested_ms());
            }
            ActiveStt::Batch => {}
        }

        let mut step = Step::empty();
        for event in provider_events {
            step.merge(self.on_stt_event(event));
        }
        step
    }

    /// Handle one inbound text frame: a JSON control message, or (batch
    /// path) a base64-encoded audio blob from older clients. Anything else
    /// is ignored.
    pub fn on_text_frame(&mut self, text: &str) -> Step {
        if serde_json::from_str::<ControlFrame>(text).is_ok() {
            // stop and end are synonyms: finalize with what has been heard
            return self.request_stop();
        }

        if self.mode == SessionMode::Batch && self.state == SessionState::Listening {
            if let Ok(blob) = BASE64.decode(text.trim()) {
                if !blob.is_empty() {
                    return self.on_audio(&blob);
                }
            }
        }

        debug!(session = %self.session.id, "ignoring unrecognized text frame");
        Step::empty()
    }

    /// Explicit end-of-input: the graceful equivalent of a disconnect.
    pub fn request_stop(&mut self) -> Step {
        if self.state != SessionState::Listening {
            return Step::empty();
        }
        debug!(
            session = %self.session.id,
            bytes = self.intake.len(),
            ingested_ms = self.intake.ingested_ms(),
            "stop requested"
        );
        self.state = SessionState::Transcribing;

        let simulator_final = match &mut self.stt {
            ActiveStt::Simulator(sim) => match sim.finish() {
                Some(SttEvent::Final(text)) => Some(text),
                _ => None,
            },
            ActiveStt::Vendor(handle) => {
                // Ask the vendor to flush; the transport waits briefly for
                // the final transcript before forcing the pipeline
                handle.finish();
                return Step {
                    events: Vec::new(),
                    follow_up: Some(FollowUp::AwaitVendorFlush),
                };
            }
            ActiveStt::Batch => {
                return Step {
                    events: Vec::new(),
                    follow_up: Some(FollowUp::Finalize),
                };
            }
        };

        match simulator_final {
            Some(text) => self.apply_final(text),
            None => self.force_finalize(),
        }
    }

    /// Handle one event drained from the provider channel.
    pub fn on_stt_event(&mut self, event: SttEvent) -> Step {
        match event {
            SttEvent::Partial(text) => {
                if !matches!(
                    self.state,
                    SessionState::Listening | SessionState::Transcribing
                ) {
                    return Step::empty();
                }
                self.session.mark_first_partial();
                self.session.partial_transcript = text.clone();
                Step::with_events(vec![OutboundEvent::Partial { text }])
            }

            SttEvent::Final(text) => self.apply_final(text),

            SttEvent::Degraded(reason) => {
                if !matches!(self.stt, ActiveStt::Vendor(_)) {
                    return Step::empty();
                }
                // Vendor is unusable mid-stream; continue on the simulator
                // for the remainder of this session only
                warn!(session = %self.session.id, %reason, "vendor degraded, falling back to simulator");
                self.stages.end(self.stt_stage, false, Some(&reason));

                let mut sim = SimulatorStt::new(&self.simulator);
                let catch_up = sim.on_ingested(self.intake.ingested_ms());
                let resumed_at = sim.partial_text();
                self.stt = ActiveStt::Simulator(sim);
                self.stt_stage = "stt:simulator";
                self.stages.start(self.stt_stage);

                let mut step = Step::with_events(vec![OutboundEvent::Debug {
                    stage: "stt".to_string(),
                    data: json!({
                        "fallback": "simulator",
                        "reason": reason,
                        "resumed_at": resumed_at,
                    }),
                }]);
                for event in catch_up {
                    step.merge(self.on_stt_event(event));
                }
                step
            }

            SttEvent::Fatal(reason) => {
                if self.state.is_terminal() {
                    return Step::empty();
                }
                self.state = SessionState::Errored;
                self.stages.end(self.stt_stage, false, Some(&reason));
                Step {
                    events: vec![OutboundEvent::Error { message: reason }],
                    follow_up: Some(FollowUp::CloseError),
                }
            }
        }
    }

    /// Transport disconnected: finalize with whatever is already available.
    pub fn on_disconnect(&mut self) -> Step {
        if self.finalize_dispatched
            || !matches!(
                self.state,
                SessionState::Listening | SessionState::Transcribing
            )
        {
            return Step::empty();
        }
        info!(session = %self.session.id, "client disconnected, finalizing with available data");
        self.state = SessionState::Transcribing;

        let simulator_final = match &mut self.stt {
            ActiveStt::Simulator(sim) => match sim.finish() {
                Some(SttEvent::Final(text)) => Some(text),
                _ => None,
            },
            ActiveStt::Vendor(handle) => {
                // No point waiting for a flush the client will never see
                handle.finish();
                None
            }
            ActiveStt::Batch => {
                return Step {
                    events: Vec::new(),
                    follow_up: Some(FollowUp::Finalize),
                };
            }
        };

        match simulator_final {
            Some(text) => self.apply_final(text),
            None => self.force_finalize(),
        }
    }

    /// Streaming sessions with no inbound audio for the configured idle
    /// window are finalized as if a stop frame had arrived.
    pub fn idle_finalize_due(&self) -> bool {
        self.mode == SessionMode::Streaming
            && self.state == SessionState::Listening
            && !self.intake.is_empty()
            && self
                .last_audio
                .map(|at| at.elapsed() >= self.idle_finalize)
                .unwrap_or(false)
    }

    /// Force the pipeline forward using the best transcript available.
    /// Used when the vendor flush window expires or on disconnect.
    pub fn force_finalize(&mut self) -> Step {
        if self.finalize_dispatched {
            return Step::empty();
        }
        if self.session.final_transcript().is_some() {
            return Step {
                events: Vec::new(),
                follow_up: Some(FollowUp::Finalize),
            };
        }
        let text = self.session.best_transcript();
        self.apply_final(text)
    }

    /// Record the final transcript (set-once), emit the `final` event for
    /// non-empty text, and hand off to the finalize job.
    fn apply_final(&mut self, raw: String) -> Step {
        if self.session.final_transcript().is_some() {
            // At most one final per session
            return Step::empty();
        }

        let normalized = normalize_transcript(&raw);
        let mut events = Vec::new();
        if normalized != raw {
            info!(session = %self.session.id, %raw, %normalized, "transcript normalized");
            events.push(OutboundEvent::Debug {
                stage: "normalize".to_string(),
                data: json!({ "raw": raw, "normalized": normalized }),
            });
        }

        self.stages
            .end(self.stt_stage, true, Some(&format!("len={}", normalized.len())));
        self.session.set_final_transcript(normalized.clone());

        if !normalized.is_empty() {
            events.push(OutboundEvent::Final { text: normalized });
            self.final_emitted = true;
        }

        self.state = SessionState::Replying;
        Step {
            events,
            follow_up: Some(FollowUp::Finalize),
        }
    }

    /// Package the blocking tail of the pipeline for a worker task.
    ///
    /// Returns `None` when the job was already dispatched; reply generation
    /// and synthesis run at most once per session.
    pub fn make_finalize_job(
        &mut self,
        reply_chain: Arc<ReplyChain>,
        tts_chain: Arc<TtsChain>,
        batch_stt: Option<Arc<dyn BatchSttBackend>>,
    ) -> Option<FinalizeJob> {
        if self.finalize_dispatched {
            return None;
        }
        self.finalize_dispatched = true;

        Some(FinalizeJob {
            session_id: self.session.id.clone(),
            transcript: self.session.final_transcript().map(str::to_string),
            blob: self.intake.take(),
            final_emitted: self.final_emitted,
            stages: std::mem::take(&mut self.stages),
            latency: self.session.latency_report(),
            reply_chain,
            tts_chain,
            batch_stt,
        })
    }

    /// The reply stage completed; the synthesized audio (if any) is about
    /// to be relayed.
    pub fn record_reply(&mut self, reply_text: &str) {
        self.session.reply_text = Some(reply_text.to_string());
        self.state = SessionState::Synthesizing;
    }

    /// The synthesis result has been relayed; the session is closing.
    pub fn record_audio(&mut self, audio_bytes: Option<usize>) {
        self.session.audio_bytes_out = audio_bytes;
        self.state = SessionState::Closing;
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The transport connection has been released.
    pub fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
    }

    #[cfg(test)]
    pub(crate) fn force_vendor_for_test(&mut self) {
        self.stt = ActiveStt::Vendor(VendorStreamHandle::dangling());
        self.stt_stage = "stt:vendor";
        self.stages.start(self.stt_stage);
    }
}

/// The blocking tail of the pipeline: (batch STT →) reply → synthesis.
///
/// Runs on a worker task so the coordinator stays responsive; the returned
/// events are emitted by the transport in order, followed by the audio
/// frame and the close.
pub struct FinalizeJob {
    session_id: String,
    transcript: Option<String>,
    blob: Vec<u8>,
    final_emitted: bool,
    stages: StageTimer,
    latency: serde_json::Value,
    reply_chain: Arc<ReplyChain>,
    tts_chain: Arc<TtsChain>,
    batch_stt: Option<Arc<dyn BatchSttBackend>>,
}

/// Outcome of the finalize job.
pub struct FinalizeResult {
    pub events: Vec<OutboundEvent>,
    pub audio: Option<Vec<u8>>,
    pub reply_text: String,
}

impl FinalizeJob {
    pub async fn run(mut self) -> FinalizeResult {
        let mut events = Vec::new();

        // Transcript: already known (streaming), or produced here (batch)
        let raw = match self.transcript.take() {
            Some(text) => text,
            None => match &self.batch_stt {
                Some(backend) => {
                    let stage = format!("stt:{}", backend.name());
                    self.stages.start(&stage);
                    match backend.transcribe(&self.blob).await {
                        Ok(text) => {
                            self.stages
                                .end(&stage, true, Some(&format!("len={}", text.len())));
                            text
                        }
                        Err(e) => {
                            warn!(session = %self.session_id, error = %e, "batch transcription failed");
                            self.stages.end(&stage, false, Some(&e.to_string()));
                            String::new()
                        }
                    }
                }
                None => {
                    self.stages
                        .end("stt", false, Some("no transcription backend configured"));
                    String::new()
                }
            },
        };

        // Normalization is idempotent, so re-applying to an
        // already-normalized streaming transcript changes nothing
        let transcript = normalize_transcript(&raw);
        if transcript != raw {
            events.push(OutboundEvent::Debug {
                stage: "normalize".to_string(),
                data: json!({ "raw": raw, "normalized": transcript }),
            });
        }
        if !self.final_emitted && !transcript.is_empty() {
            events.push(OutboundEvent::Final {
                text: transcript.clone(),
            });
        }

        // Reply: the event is emitted unconditionally; an empty chain result
        // substitutes an echo, or the apology when nothing was heard
        let generated = self.reply_chain.generate(&transcript, &mut self.stages).await;
        let reply_text = if !generated.is_empty() {
            generated
        } else if transcript.is_empty() {
            APOLOGY_REPLY.to_string()
        } else {
            format!("You said: '{transcript}'.")
        };
        events.push(OutboundEvent::Reply {
            text: reply_text.clone(),
        });

        // Synthesis: failure is non-fatal, the session just closes without
        // an audio frame
        let audio = self.tts_chain.synthesize(&reply_text, &mut self.stages).await;

        events.push(OutboundEvent::Debug {
            stage: "timings".to_string(),
            data: json!({
                "stages": self.stages.report(),
                "latency": self.latency,
            }),
        });

        info!(
            session = %self.session_id,
            transcript_len = transcript.len(),
            reply_len = reply_text.len(),
            audio_bytes = audio.as_ref().map(Vec::len).unwrap_or(0),
            "pipeline complete"
        );

        FinalizeResult {
            events,
            audio,
            reply_text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::providers::reply::RuleBasedReply;
    use anyhow::anyhow;
    use async_trait::async_trait;

    fn test_config() -> AppConfig {
        AppConfig::default()
    }

    fn rule_based_chain() -> Arc<ReplyChain> {
        Arc::new(ReplyChain::new(vec![Box::new(RuleBasedReply)]))
    }

    fn silent_tts() -> Arc<TtsChain> {
        Arc::new(TtsChain::new(Vec::new(), true, 250, 22050))
    }

    fn empty_chain() -> Arc<ReplyChain> {
        Arc::new(ReplyChain::new(Vec::new()))
    }

    /// 500 ms of silence at 16 kHz mono 16-bit.
    fn pcm_chunk_500ms() -> Vec<u8> {
        vec![0u8; 16_000]
    }

    fn count<F: Fn(&OutboundEvent) -> bool>(events: &[OutboundEvent], pred: F) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }

    #[test]
    fn test_authentication_against_shared_token() {
        let mut config = test_config();
        config.auth.ws_token = Some("secret".to_string());

        let mut coordinator = SessionCoordinator::new(SessionMode::Streaming, &config);
        assert!(!coordinator.authenticate(Some("wrong")));
        assert_eq!(coordinator.state(), &SessionState::Closing);

        let mut coordinator = SessionCoordinator::new(SessionMode::Streaming, &config);
        assert!(!coordinator.authenticate(None));

        let mut coordinator = SessionCoordinator::new(SessionMode::Streaming, &config);
        assert!(coordinator.authenticate(Some("secret")));

        // Without a configured token every connection is accepted
        let mut coordinator = SessionCoordinator::new(SessionMode::Streaming, &test_config());
        assert!(coordinator.authenticate(None));
    }

    #[tokio::test]
    async fn test_streaming_simulator_stop_scenario() {
        // 1500 ms of audio then a stop frame: at least one partial must
        // precede the final, and the final carries the complete phrase
        let config = test_config();
        let mut coordinator = SessionCoordinator::new(SessionMode::Streaming, &config);
        assert!(coordinator.authenticate(None));
        assert!(coordinator.begin_listening().is_none()); // simulator, no channel

        let mut events = Vec::new();
        for _ in 0..3 {
            events.extend(coordinator.on_audio(&pcm_chunk_500ms()).events);
        }
        assert!(
            count(&events, |e| matches!(e, OutboundEvent::Partial { .. })) >= 1,
            "expected at least one partial before stop"
        );

        let step = coordinator.on_text_frame(r#"{"type":"stop"}"#);
        assert_eq!(step.follow_up, Some(FollowUp::Finalize));
        events.extend(step.events);

        let finals: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                OutboundEvent::Final { text } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(finals, vec![config.simulator.phrase.clone()]);

        // Partial events all precede the final
        let final_index = events
            .iter()
            .position(|e| matches!(e, OutboundEvent::Final { .. }))
            .unwrap();
        let last_partial = events
            .iter()
            .rposition(|e| matches!(e, OutboundEvent::Partial { .. }))
            .unwrap();
        assert!(last_partial < final_index);

        // The finalize job completes the ordering: reply follows final
        let job = coordinator
            .make_finalize_job(rule_based_chain(), silent_tts(), None)
            .expect("job dispatches once");
        let result = job.run().await;
        events.extend(result.events);

        assert_eq!(count(&events, |e| matches!(e, OutboundEvent::Reply { .. })), 1);
        assert_eq!(count(&events, |e| matches!(e, OutboundEvent::Final { .. })), 1);
        let reply_index = events
            .iter()
            .position(|e| matches!(e, OutboundEvent::Reply { .. }))
            .unwrap();
        assert!(final_index < reply_index);
        assert!(result.audio.is_some(), "silent fallback audio expected");
    }

    #[tokio::test]
    async fn test_disconnect_without_stop_still_replies_once() {
        let config = test_config();
        let mut coordinator = SessionCoordinator::new(SessionMode::Streaming, &config);
        coordinator.authenticate(None);
        coordinator.begin_listening();

        let mut events = Vec::new();
        // Only 1000 ms of audio, then the client vanishes
        events.extend(coordinator.on_audio(&pcm_chunk_500ms()).events);
        events.extend(coordinator.on_audio(&pcm_chunk_500ms()).events);

        let step = coordinator.on_disconnect();
        assert_eq!(step.follow_up, Some(FollowUp::Finalize));
        events.extend(step.events);

        let job = coordinator
            .make_finalize_job(rule_based_chain(), silent_tts(), None)
            .unwrap();
        events.extend(job.run().await.events);

        assert_eq!(count(&events, |e| matches!(e, OutboundEvent::Reply { .. })), 1);
        assert!(count(&events, |e| matches!(e, OutboundEvent::Final { .. })) <= 1);

        let final_index = events
            .iter()
            .position(|e| matches!(e, OutboundEvent::Final { .. }));
        let reply_index = events
            .iter()
            .position(|e| matches!(e, OutboundEvent::Reply { .. }))
            .unwrap();
        if let Some(final_index) = final_index {
            assert!(final_index < reply_index);
        }

        // A second disconnect (or late stop) must not re-run the pipeline
        assert!(coordinator.on_disconnect().events.is_empty());
        assert!(coordinator
            .make_finalize_job(rule_based_chain(), silent_tts(), None)
            .is_none());
    }

    #[tokio::test]
    async fn test_batch_blob_without_stt_backend_yields_apology() {
        // A silent WAV blob with no transcription backend configured: no
        // final event, the apology reply, and a fallback silent audio frame
        let config = test_config();
        let mut coordinator = SessionCoordinator::new(SessionMode::Batch, &config);
        coordinator.authenticate(None);
        coordinator.begin_listening();

        let blob = crate::providers::tts::silent_wav_clip(1000, 16000);
        let step = coordinator.on_audio(&blob);
        assert_eq!(step.follow_up, Some(FollowUp::Finalize));
        assert!(step.events.is_empty());

        let job = coordinator
            .make_finalize_job(rule_based_chain(), silent_tts(), None)
            .unwrap();
        let result = job.run().await;

        assert_eq!(
            count(&result.events, |e| matches!(e, OutboundEvent::Final { .. })),
            0
        );
        assert_eq!(result.reply_text, APOLOGY_REPLY);
        let audio = result.audio.expect("fallback audio frame expected");
        assert!(!audio.is_empty());
    }

    #[tokio::test]
    async fn test_batch_accepts_base64_text_blob() {
        let config = test_config();
        let mut coordinator = SessionCoordinator::new(SessionMode::Batch, &config);
        coordinator.authenticate(None);
        coordinator.begin_listening();

        let blob = crate::providers::tts::silent_wav_clip(200, 16000);
        let encoded = BASE64.encode(&blob);
        let step = coordinator.on_text_frame(&encoded);
        assert_eq!(step.follow_up, Some(FollowUp::Finalize));
    }

    #[tokio::test]
    async fn test_batch_stt_backend_produces_final_event() {
        struct FixedTranscript;

        #[async_trait]
        impl BatchSttBackend for FixedTranscript {
            fn name(&self) -> &'static str {
                "fixed"
            }
            async fn transcribe(&self, _audio: &[u8]) -> anyhow::Result<String> {
                Ok("hello claria".to_string())
            }
        }

        let config = test_config();
        let mut coordinator = SessionCoordinator::new(SessionMode::Batch, &config);
        coordinator.authenticate(None);
        coordinator.begin_listening();
        coordinator.on_audio(&[0u8; 64]);

        let job = coordinator
            .make_finalize_job(rule_based_chain(), silent_tts(), Some(Arc::new(FixedTranscript)))
            .unwrap();
        let result = job.run().await;

        // The misheard brand is normalized before the final event
        let final_text = result
            .events
            .iter()
            .find_map(|e| match e {
                OutboundEvent::Final { text } => Some(text.clone()),
                _ => None,
            })
            .expect("final event expected");
        assert_eq!(final_text, "hello Klarvia");

        assert!(result
            .events
            .iter()
            .any(|e| matches!(e, OutboundEvent::Debug { stage, .. } if stage == "normalize")));
    }

    #[tokio::test]
    async fn test_failed_batch_backend_still_replies() {
        struct AlwaysFails;

        #[async_trait]
        impl BatchSttBackend for AlwaysFails {
            fn name(&self) -> &'static str {
                "failing"
            }
            async fn transcribe(&self, _audio: &[u8]) -> anyhow::Result<String> {
                Err(anyhow!("backend unavailable"))
            }
        }

        let config = test_config();
        let mut coordinator = SessionCoordinator::new(SessionMode::Batch, &config);
        coordinator.authenticate(None);
        coordinator.begin_listening();
        coordinator.on_audio(&[0u8; 64]);

        let job = coordinator
            .make_finalize_job(rule_based_chain(), silent_tts(), Some(Arc::new(AlwaysFails)))
            .unwrap();
        let result = job.run().await;
        assert_eq!(result.reply_text, APOLOGY_REPLY);
    }

    #[test]
    fn test_malformed_control_frames_are_ignored() {
        let config = test_config();
        let mut coordinator = SessionCoordinator::new(SessionMode::Streaming, &config);
        coordinator.authenticate(None);
        coordinator.begin_listening();
        coordinator.on_audio(&pcm_chunk_500ms());

        for frame in ["{not json", r#"{"type":"pause"}"#, "", "stop"] {
            let step = coordinator.on_text_frame(frame);
            assert!(step.events.is_empty());
            assert!(step.follow_up.is_none());
        }
        assert_eq!(coordinator.state(), &SessionState::Listening);
    }

    #[test]
    fn test_at_most_one_final() {
        let config = test_config();
        let mut coordinator = SessionCoordinator::new(SessionMode::Streaming, &config);
        coordinator.authenticate(None);
        coordinator.begin_listening();
        coordinator.force_vendor_for_test();
        coordinator.on_audio(&pcm_chunk_500ms());

        let first = coordinator.on_stt_event(SttEvent::Final("hello world".to_string()));
        assert_eq!(
            count(&first.events, |e| matches!(e, OutboundEvent::Final { .. })),
            1
        );

        let second = coordinator.on_stt_event(SttEvent::Final("hello world again".to_string()));
        assert!(second.events.is_empty());
    }

    #[test]
    fn test_vendor_degradation_falls_back_to_simulator() {
        let config = test_config();
        let mut coordinator = SessionCoordinator::new(SessionMode::Streaming, &config);
        coordinator.authenticate(None);
        coordinator.begin_listening();
        coordinator.force_vendor_for_test();

        // 1500 ms ingested before the vendor gives up
        for _ in 0..3 {
            coordinator.on_audio(&pcm_chunk_500ms());
        }

        let step = coordinator.on_stt_event(SttEvent::Degraded("model deprecated".to_string()));
        assert!(step
            .events
            .iter()
            .any(|e| matches!(e, OutboundEvent::Debug { stage, .. } if stage == "stt")));
        // The simulator catches up to the already-ingested audio
        assert!(step
            .events
            .iter()
            .any(|e| matches!(e, OutboundEvent::Partial { .. })));

        // A stop now finalizes through the simulator with the full phrase
        let stop = coordinator.request_stop();
        let final_text = stop.events.iter().find_map(|e| match e {
            OutboundEvent::Final { text } => Some(text.clone()),
            _ => None,
        });
        assert_eq!(final_text, Some(config.simulator.phrase));
    }

    #[test]
    fn test_vendor_fatal_errors_the_session() {
        let config = test_config();
        let mut coordinator = SessionCoordinator::new(SessionMode::Streaming, &config);
        coordinator.authenticate(None);
        coordinator.begin_listening();
        coordinator.force_vendor_for_test();

        let step = coordinator.on_stt_event(SttEvent::Fatal("handshake failed".to_string()));
        assert_eq!(step.follow_up, Some(FollowUp::CloseError));
        assert!(matches!(step.events.as_slice(), [OutboundEvent::Error { .. }]));
        assert_eq!(coordinator.state(), &SessionState::Errored);
    }

    #[tokio::test]
    async fn test_echo_substitution_when_chain_produces_nothing() {
        let config = test_config();
        let mut coordinator = SessionCoordinator::new(SessionMode::Streaming, &config);
        coordinator.authenticate(None);
        coordinator.begin_listening();
        coordinator.force_vendor_for_test();
        coordinator.on_audio(&pcm_chunk_500ms());
        coordinator.on_stt_event(SttEvent::Final("tell me something".to_string()));

        let job = coordinator
            .make_finalize_job(empty_chain(), silent_tts(), None)
            .unwrap();
        let result = job.run().await;
        assert_eq!(result.reply_text, "You said: 'tell me something'.");
    }

    #[test]
    fn test_audio_ignored_outside_listening() {
        let config = test_config();
        let mut coordinator = SessionCoordinator::new(SessionMode::Streaming, &config);
        // Never authenticated/listening: frames are dropped silently
        let step = coordinator.on_audio(&pcm_chunk_500ms());
        assert!(step.events.is_empty());
        assert!(step.follow_up.is_none());
    }
}
