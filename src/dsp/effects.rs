//! EffectsChain — delay followed by reverb, driven by one shared parameter set.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, check_range};

use super::delay::Delay;
use super::reverb::Reverb;

/// Effect settings shared by every track's chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectParameters {
    pub delay_time_ms: f32,
    /// Must stay below 1 so echoes decay.
    pub delay_feedback: f32,
    pub reverb_mix: f32,
    pub reverb_room_size: f32,
    pub reverb_damping: f32,
}

impl Default for EffectParameters {
    fn default() -> Self {
        Self {
            delay_time_ms: 250.0,
            delay_feedback: 0.0,
            reverb_mix: 0.0,
            reverb_room_size: 0.5,
            reverb_damping: 0.5,
        }
    }
}

impl EffectParameters {
    pub fn validate(&self, max_delay_ms: f32) -> Result<(), EngineError> {
        check_range("delay_time_ms", self.delay_time_ms, 0.0, max_delay_ms)?;
        check_range("delay_feedback", self.delay_feedback, 0.0, 1.0)?;
        if self.delay_feedback >= 1.0 {
            return Err(EngineError::param("delay_feedback", self.delay_feedback, "must be < 1"));
        }
        check_range("reverb_mix", self.reverb_mix, 0.0, 1.0)?;
        check_range("reverb_room_size", self.reverb_room_size, 0.0, 1.0)?;
        check_range("reverb_damping", self.reverb_damping, 0.0, 1.0)?;
        Ok(())
    }

    /// Return a copy with one effect value replaced, validated.
    pub fn with(&self, kind: EffectKind, value: f32, max_delay_ms: f32) -> Result<Self, EngineError> {
        let mut next = *self;
        match kind {
            EffectKind::Delay => next.delay_feedback = value,
            EffectKind::DelayTime => next.delay_time_ms = value,
            EffectKind::Reverb => next.reverb_mix = value,
            EffectKind::RoomSize => next.reverb_room_size = value,
            EffectKind::Damping => next.reverb_damping = value,
        }
        next.validate(max_delay_ms)?;
        Ok(next)
    }
}

/// Names accepted by `request_set_effect`.
///
/// `delay` sets the feedback amount and `reverb` the wet mix; the remaining
/// names reach the other parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    Delay,
    DelayTime,
    Reverb,
    RoomSize,
    Damping,
}

impl FromStr for EffectKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delay" => Ok(EffectKind::Delay),
            "delay_time" | "delayTime" => Ok(EffectKind::DelayTime),
            "reverb" => Ok(EffectKind::Reverb),
            "room_size" | "roomSize" => Ok(EffectKind::RoomSize),
            "damping" => Ok(EffectKind::Damping),
            _ => Err(EngineError::param("effect", s, "unknown effect")),
        }
    }
}

/// Delay then reverb, in place.
#[derive(Debug, Clone)]
pub struct EffectsChain {
    delay: Delay,
    reverb: Reverb,
    params: EffectParameters,
}

impl EffectsChain {
    /// Allocates the delay line and reverb bank. Build this off the render path.
    pub fn new(sample_rate: f64, max_delay_ms: f32, params: EffectParameters) -> Self {
        let mut chain = Self {
            delay: Delay::new(sample_rate, max_delay_ms),
            reverb: Reverb::new(sample_rate),
            params,
        };
        chain.apply(params);
        chain
    }

    fn apply(&mut self, params: EffectParameters) {
        self.params = params;
        self.delay.set_params(params.delay_time_ms, params.delay_feedback);
        self.reverb
            .set_params(params.reverb_room_size, params.reverb_damping, params.reverb_mix);
    }

    pub fn params(&self) -> &EffectParameters {
        &self.params
    }

    /// Process one block. New parameters are latched before the first sample.
    pub fn process_block(&mut self, params: &EffectParameters, block: &mut [f32]) {
        if *params != self.params {
            self.apply(*params);
        }
        self.delay.process_block(block);
        if self.params.reverb_mix > 0.0 {
            self.reverb.process_block(block);
        } else {
            // Keep the tail state moving so re-enabling the reverb is seamless.
            for &s in block.iter() {
                self.reverb.process(s);
            }
        }
    }

    pub fn clear(&mut self) {
        self.delay.clear();
        self.reverb.clear();
    }
}
