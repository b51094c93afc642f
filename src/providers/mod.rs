//! # Provider Adapters
//!
//! Narrow interfaces over the three external capabilities the relay depends
//! on, each with multiple backend variants selected by configuration and
//! tried in a fixed priority order with fallthrough (one attempt per variant
//! per call, never retry):
//!
//! - **STT** (`stt`): vendor streaming, vendor batch, offline simulator
//! - **Reply** (`reply`): local command, HTTP proxy, rule-based, hosted chat
//! - **TTS** (`tts`): hosted voice, offline engine, silent-clip fallback
//!
//! Adapter failures are converted to fallback behavior at this boundary;
//! only unrecoverable setup failures (no usable variant at all) reach the
//! session coordinator.

pub mod reply;   // Reply-generation fallback chain
pub mod stt;     // Speech-to-text variants
pub mod tts;     // Text-to-speech fallback chain

pub use reply::{build_reply_chain, ReplyBackend, ReplyChain};
pub use stt::{spawn_vendor_stream, BatchSttBackend, SimulatorStt, VendorBatchStt, VendorStreamHandle};
pub use tts::{build_tts_chain, silent_wav_clip, TtsBackend, TtsChain};
