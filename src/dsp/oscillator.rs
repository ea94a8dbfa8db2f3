//! Phase-accumulating oscillators with PolyBLEP anti-aliasing.

use std::f64::consts::TAU;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Supported waveform shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

impl FromStr for Waveform {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sine" => Ok(Waveform::Sine),
            "square" => Ok(Waveform::Square),
            "sawtooth" | "saw" => Ok(Waveform::Sawtooth),
            "triangle" => Ok(Waveform::Triangle),
            _ => Err(EngineError::param("waveform", s, "unknown waveform")),
        }
    }
}

impl fmt::Display for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Waveform::Sine => "sine",
            Waveform::Square => "square",
            Waveform::Sawtooth => "sawtooth",
            Waveform::Triangle => "triangle",
        };
        f.write_str(name)
    }
}

/// Validate an oscillator frequency: finite, positive, below Nyquist.
pub fn check_frequency(frequency: f32, sample_rate: f64) -> Result<f32, EngineError> {
    if !frequency.is_finite() || frequency <= 0.0 {
        return Err(EngineError::param("frequency", frequency, "must be > 0"));
    }
    if frequency as f64 >= sample_rate / 2.0 {
        return Err(EngineError::param("frequency", frequency, "must be below Nyquist"));
    }
    Ok(frequency)
}

/// A band-limited oscillator.
///
/// Frequency and waveform changes are staged and only take effect at the
/// start of the next [`Oscillator::render_block`] call. Phase is never reset
/// by either change.
#[derive(Debug, Clone)]
pub struct Oscillator {
    frequency: f64,
    waveform: Waveform,
    /// Radians, always in `[0, 2π)`.
    phase: f64,
    sample_rate: f64,
    pending_frequency: Option<f64>,
    pending_waveform: Option<Waveform>,
}

impl Oscillator {
    pub fn new(frequency: f32, waveform: Waveform, sample_rate: f64) -> Result<Self, EngineError> {
        let frequency = check_frequency(frequency, sample_rate)?;
        Ok(Oscillator {
            frequency: frequency as f64,
            waveform,
            phase: 0.0,
            sample_rate,
            pending_frequency: None,
            pending_waveform: None,
        })
    }

    pub fn frequency(&self) -> f32 {
        self.frequency as f32
    }

    pub fn waveform(&self) -> Waveform {
        self.waveform
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }

    /// Stage a new frequency for the next block.
    pub fn set_frequency(&mut self, frequency: f32) -> Result<(), EngineError> {
        let frequency = check_frequency(frequency, self.sample_rate)?;
        self.pending_frequency = Some(frequency as f64);
        Ok(())
    }

    /// Stage a new shape for the next block.
    pub fn set_waveform(&mut self, waveform: Waveform) {
        self.pending_waveform = Some(waveform);
    }

    /// Fill `out` with the next `out.len()` samples.
    pub fn render_block(&mut self, out: &mut [f32]) {
        if let Some(f) = self.pending_frequency.take() {
            self.frequency = f;
        }
        if let Some(w) = self.pending_waveform.take() {
            self.waveform = w;
        }

        let inc = TAU * self.frequency / self.sample_rate;
        // Normalized increment for the BLEP window.
        let dt = self.frequency / self.sample_rate;
        for sample in out.iter_mut() {
            let t = self.phase / TAU;
            *sample = match self.waveform {
                Waveform::Sine => self.phase.sin(),
                Waveform::Sawtooth => sawtooth(t, dt),
                Waveform::Square => square(t, dt),
                Waveform::Triangle => triangle(t),
            } as f32;

            self.phase += inc;
            if self.phase >= TAU {
                self.phase -= TAU;
            }
        }
    }
}

/// Rises from -1 to +1, then drops. PolyBLEP smooths the drop.
fn sawtooth(t: f64, dt: f64) -> f64 {
    2.0 * t - 1.0 - poly_blep(t, dt)
}

fn square(t: f64, dt: f64) -> f64 {
    let mut value = if t < 0.5 { 1.0 } else { -1.0 };
    value += poly_blep(t, dt);
    value -= poly_blep((t + 0.5) % 1.0, dt);
    value
}

/// Piecewise linear: -1 -> +1 over the first half cycle, back over the second.
fn triangle(t: f64) -> f64 {
    if t < 0.5 { 4.0 * t - 1.0 } else { 3.0 - 4.0 * t }
}

/// PolyBLEP (Polynomial Band-Limited Step) correction.
///
/// `t` is the normalized phase in `[0, 1)`, `dt` the normalized increment.
fn poly_blep(t: f64, dt: f64) -> f64 {
    if t < dt {
        let t = t / dt;
        2.0 * t - t * t - 1.0
    } else if t > 1.0 - dt {
        let t = (t - 1.0) / dt;
        t * t + 2.0 * t + 1.0
    } else {
        0.0
    }
}
