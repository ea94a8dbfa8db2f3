//! Voice presets — a portable snapshot of the lead voice.
//!
//! A preset is plain JSON text; where it is stored is up to the host.

use serde::{Deserialize, Serialize};

use crate::dsp::effects::EffectParameters;
use crate::dsp::oscillator::{Waveform, check_frequency};
use crate::error::{EngineError, check_range};

/// Lead voice settings: pitch, shape, level and optionally the effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoicePreset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub frequency: f32,
    pub waveform: Waveform,
    /// Lead track volume, `0..=1`.
    pub volume: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effects: Option<EffectParameters>,
}

impl VoicePreset {
    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string(self).map_err(|e| EngineError::state(format!("preset encoding: {e}")))
    }

    /// Parse and validate against an engine's limits.
    pub fn from_json(text: &str, sample_rate: f64, max_delay_ms: f32) -> Result<Self, EngineError> {
        let preset: VoicePreset =
            serde_json::from_str(text).map_err(|e| EngineError::param("preset", e, "malformed preset"))?;
        preset.validate(sample_rate, max_delay_ms)?;
        Ok(preset)
    }

    pub fn validate(&self, sample_rate: f64, max_delay_ms: f32) -> Result<(), EngineError> {
        check_frequency(self.frequency, sample_rate)?;
        check_range("volume", self.volume, 0.0, 1.0)?;
        if let Some(effects) = &self.effects {
            effects.validate(max_delay_ms)?;
        }
        Ok(())
    }
}
