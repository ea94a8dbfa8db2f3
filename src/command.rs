//! Messages crossing the control/render boundary.
//!
//! Everything the renderer receives is fully built on the control thread, and
//! everything it lets go of is sent back so it is dropped there.

use crate::dsp::effects::EffectParameters;
use crate::dsp::oscillator::{Oscillator, Waveform};
use crate::dsp::track::{Track, TrackId, TrackSource};

/// A state change applied by the renderer at the next block boundary.
#[derive(Debug)]
pub enum Command {
    /// Replace the lead track's source with a fresh oscillator.
    StartVoice(Oscillator),
    StopVoice,
    SetFrequency(f32),
    SetWaveform(Waveform),
    AddTrack(Box<Track>),
    RemoveTrack(TrackId),
    SetTrackVolume(TrackId, f32),
    MuteTrack(TrackId, bool),
    SetTrackSource(TrackId, TrackSource),
    SetEffects(EffectParameters),
    SetMasterGain(f32),
    /// Begin capturing at the next block.
    StartCapture,
    /// Stop capturing and publish how many samples the session holds.
    SealCapture,
    SetRunning(bool),
}

/// Objects released by the renderer.
#[derive(Debug)]
pub enum Retired {
    Track(Box<Track>),
    Source(TrackSource),
}

/// A block whose mixed output was not finite and was replaced with silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderFault {
    pub block_index: u64,
    /// How many samples in the block were NaN or infinite.
    pub bad_samples: usize,
}
