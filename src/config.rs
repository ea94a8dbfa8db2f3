//! Engine configuration.
//!
//! Every field has a default so a host can pass a partial JSON object (or
//! nothing at all) and still get a working session.

use serde::{Deserialize, Serialize};

use crate::dsp::effects::EffectParameters;
use crate::error::EngineError;

/// Session-wide settings, fixed once the engine is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Samples per render block.
    pub block_size: usize,
    /// Channels in the exported asset (and in interleaved output).
    pub channels: u16,
    /// Longest delay the delay line can hold, in milliseconds.
    pub max_delay_ms: f32,
    /// Maximum number of tracks, lead track included.
    pub max_tracks: usize,
    /// Slots in the control -> render command queue.
    pub command_capacity: usize,
    /// FFT window used for spectrum snapshots. Must be a power of two.
    pub analysis_size: usize,
    pub master_gain: f32,
    /// Volume given to newly added tracks.
    pub default_track_volume: f32,
    pub recording: RecordingConfig,
    /// Effect settings in force when the engine starts.
    pub effects: EffectParameters,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            block_size: 128,
            channels: 2,
            max_delay_ms: 2000.0,
            max_tracks: 32,
            command_capacity: 1024,
            analysis_size: 1024,
            master_gain: 0.8,
            default_track_volume: 0.5,
            recording: RecordingConfig::default(),
            effects: EffectParameters::default(),
        }
    }
}

/// Capture and export settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// 16 (integer PCM) or 32 (float PCM).
    pub bits_per_sample: u16,
    /// Capacity of the render -> recorder ring, in seconds of audio.
    pub ring_seconds: f32,
    /// Spill space reserved on the render side before it has to grow.
    pub backlog_seconds: f32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            bits_per_sample: 16,
            ring_seconds: 2.0,
            backlog_seconds: 10.0,
        }
    }
}

impl EngineConfig {
    /// Parse a (possibly partial) JSON configuration and validate it.
    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if !(8_000..=384_000).contains(&self.sample_rate) {
            return Err(EngineError::Config(format!(
                "sample_rate {} outside 8000..=384000",
                self.sample_rate
            )));
        }
        if self.block_size == 0 || self.block_size > 8192 {
            return Err(EngineError::Config(format!(
                "block_size {} outside 1..=8192",
                self.block_size
            )));
        }
        if self.channels == 0 || self.channels > 8 {
            return Err(EngineError::Config(format!("channels {} outside 1..=8", self.channels)));
        }
        if !self.max_delay_ms.is_finite() || self.max_delay_ms < 1.0 {
            return Err(EngineError::Config("max_delay_ms must be >= 1".into()));
        }
        if self.max_tracks == 0 {
            return Err(EngineError::Config("max_tracks must be >= 1".into()));
        }
        if self.command_capacity < 16 {
            return Err(EngineError::Config("command_capacity must be >= 16".into()));
        }
        if !self.analysis_size.is_power_of_two() || self.analysis_size < 32 {
            return Err(EngineError::Config(format!(
                "analysis_size {} must be a power of two >= 32",
                self.analysis_size
            )));
        }
        if !(0.0..=2.0).contains(&self.master_gain) {
            return Err(EngineError::Config("master_gain outside 0..=2".into()));
        }
        if !(0.0..=1.0).contains(&self.default_track_volume) {
            return Err(EngineError::Config("default_track_volume outside 0..=1".into()));
        }
        match self.recording.bits_per_sample {
            16 | 32 => {}
            other => {
                return Err(EngineError::Config(format!(
                    "bits_per_sample {other} unsupported (16 or 32)"
                )));
            }
        }
        if !(self.recording.ring_seconds > 0.0) || !(self.recording.backlog_seconds >= 0.0) {
            return Err(EngineError::Config("recording buffer sizes must be positive".into()));
        }
        self.effects
            .validate(self.max_delay_ms)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(())
    }

    /// Seconds of audio in one block.
    pub fn block_duration(&self) -> f64 {
        self.block_size as f64 / self.sample_rate as f64
    }

    pub(crate) fn seconds_to_samples(&self, seconds: f32) -> usize {
        (seconds.max(0.0) as f64 * self.sample_rate as f64).ceil() as usize
    }
}
