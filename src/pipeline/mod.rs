//! # Pipeline Support Module
//!
//! Cross-cutting helpers for the voice pipeline: per-session stage timing
//! and transcript normalization.
//!
//! ## Key Components:
//! - **Stage Timer**: Wall-clock start/end records for named pipeline stages
//!   (STT, reply generation, TTS), surfaced to clients as debug events
//! - **Transcript Normalizer**: Rewrites known misrecognitions of the brand
//!   name to the canonical spelling before the reply engine sees them

pub mod normalize;   // Brand-name transcript normalization
pub mod stages;      // Stage timing records for diagnostics

pub use normalize::normalize_transcript;
pub use stages::{StageRecord, StageTimer};
