//! # Inbound Audio Intake
//!
//! Accumulates the raw audio a session receives and derives the cumulative
//! ingested-audio duration from the byte count and configured PCM format.
//! The duration clock paces the offline transcription simulator and feeds
//! the session's diagnostics.
//!
//! ## Audio Format:
//! - 16-bit little-endian signed PCM (streaming path)
//! - Mono by default (channel count from configuration)
//! - The batch path stores whatever blob the client sent (typically a
//!   complete WAV file) without reinterpreting it

use crate::config::AudioConfig;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Buffer of inbound audio plus the format needed to interpret it.
pub struct AudioIntake {
    sample_rate: u32,
    channels: u16,
    bytes_per_sample: u16,
    buffer: Vec<u8>,
}

impl AudioIntake {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            bytes_per_sample: config.bit_depth / 8,
            buffer: Vec::new(),
        }
    }

    /// Append one inbound frame of PCM data.
    ///
    /// Frames with an odd byte count cannot be 16-bit samples and are
    /// rejected; the caller logs and drops them without failing the session.
    pub fn append(&mut self, data: &[u8]) -> Result<(), String> {
        if data.is_empty() {
            return Err("audio frame is empty".to_string());
        }
        if data.len() % self.bytes_per_sample as usize != 0 {
            return Err(format!(
                "audio frame length {} is not a multiple of the sample size",
                data.len()
            ));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Store a complete blob as-is (batch path).
    pub fn append_blob(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Cumulative duration of ingested PCM, in milliseconds.
    pub fn ingested_ms(&self) -> u64 {
        let bytes_per_second =
            self.sample_rate as u64 * self.channels as u64 * self.bytes_per_sample as u64;
        if bytes_per_second == 0 {
            return 0;
        }
        self.buffer.len() as u64 * 1000 / bytes_per_second
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Hand the accumulated audio to the finalize pipeline.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Peak absolute sample amplitude over the most recent frame-sized
    /// window. Used only for debug logging of microphone levels.
    pub fn peak_amplitude(data: &[u8]) -> i16 {
        let mut cursor = Cursor::new(data);
        let mut peak: i16 = 0;
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            peak = peak.max(sample.saturating_abs());
        }
        peak
    }
}

/// Probe a WAV blob for its duration in seconds, for diagnostics.
///
/// Returns `None` for anything that does not parse as 16-bit WAV; callers
/// only use this for logging, never for control flow.
pub fn probe_wav_duration(blob: &[u8]) -> Option<f64> {
    let mut cursor = Cursor::new(blob);
    let (header, data) = wav::read(&mut cursor).ok()?;
    let samples = match data {
        wav::BitDepth::Sixteen(track) => track.len(),
        wav::BitDepth::Eight(track) => track.len(),
        wav::BitDepth::TwentyFour(track) => track.len(),
        wav::BitDepth::ThirtyTwoFloat(track) => track.len(),
        wav::BitDepth::Empty => 0,
    };
    let frames = samples as f64 / header.channel_count.max(1) as f64;
    Some(frames / header.sampling_rate.max(1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn intake() -> AudioIntake {
        AudioIntake::new(&AppConfig::default().audio)
    }

    #[test]
    fn test_ingested_duration_from_byte_count() {
        let mut intake = intake();
        // 16 kHz mono 16-bit: 32 bytes per millisecond
        intake.append(&vec![0u8; 32_000]).unwrap();
        assert_eq!(intake.ingested_ms(), 1000);

        intake.append(&vec![0u8; 16_000]).unwrap();
        assert_eq!(intake.ingested_ms(), 1500);
    }

    #[test]
    fn test_rejects_invalid_frames() {
        let mut intake = intake();
        assert!(intake.append(&[]).is_err());
        assert!(intake.append(&[0u8; 33]).is_err());
        assert_eq!(intake.ingested_ms(), 0);
    }

    #[test]
    fn test_take_drains_the_buffer() {
        let mut intake = intake();
        intake.append(&[0u8; 64]).unwrap();
        let blob = intake.take();
        assert_eq!(blob.len(), 64);
        assert!(intake.is_empty());
    }

    #[test]
    fn test_peak_amplitude() {
        // Samples 100, -2000, 50 little-endian
        let mut data = Vec::new();
        for sample in [100i16, -2000, 50] {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        assert_eq!(AudioIntake::peak_amplitude(&data), 2000);
    }

    #[test]
    fn test_probe_wav_duration() {
        let clip = crate::providers::tts::silent_wav_clip(500, 22050);
        let duration = probe_wav_duration(&clip).expect("clip parses");
        assert!((duration - 0.5).abs() < 0.01);

        assert!(probe_wav_duration(b"definitely not wav").is_none());
    }
}
