//! Timeline — tones scheduled on a track.
//!
//! A [`Timeline`] is the host-facing list of clips in seconds. It is turned
//! into a [`ClipPlayer`] on the control thread, with every clip's oscillator
//! built up front, so playback never allocates. Time starts at the first
//! block the player renders.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, check_range};

use super::oscillator::{Oscillator, Waveform};

/// One scheduled tone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Seconds from the start of playback.
    pub start_time: f32,
    /// Seconds.
    pub duration: f32,
    pub frequency: f32,
    #[serde(default = "full_scale")]
    pub amplitude: f32,
    #[serde(default = "default_waveform")]
    pub waveform: Waveform,
}

fn full_scale() -> f32 {
    1.0
}

fn default_waveform() -> Waveform {
    Waveform::Sine
}

/// Clips for one track. Order does not matter; overlapping clips add up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub clips: Vec<Clip>,
}

impl Timeline {
    pub const MAX_CLIPS: usize = 256;

    /// Seconds until the last clip ends.
    pub fn duration(&self) -> f32 {
        self.clips
            .iter()
            .map(|c| c.start_time + c.duration)
            .fold(0.0, f32::max)
    }
}

#[derive(Debug)]
struct ScheduledClip {
    start: u64,
    end: u64,
    amplitude: f32,
    osc: Oscillator,
}

/// Render-side player for a [`Timeline`].
#[derive(Debug)]
pub struct ClipPlayer {
    /// Sorted by start.
    clips: Vec<ScheduledClip>,
    position: u64,
    scratch: Vec<f32>,
}

impl ClipPlayer {
    /// Validate every clip and build the player. `max_block` is the largest
    /// slice `render` is expected to see; bigger ones are handled in pieces.
    pub fn new(timeline: &Timeline, sample_rate: f64, max_block: usize) -> Result<Self, EngineError> {
        if timeline.clips.len() > Timeline::MAX_CLIPS {
            return Err(EngineError::param(
                "clips",
                timeline.clips.len(),
                "too many clips",
            ));
        }
        let to_samples = |seconds: f32| (seconds as f64 * sample_rate).round() as u64;

        let mut clips = Vec::with_capacity(timeline.clips.len());
        for clip in &timeline.clips {
            if !clip.start_time.is_finite() || clip.start_time < 0.0 {
                return Err(EngineError::param("start_time", clip.start_time, "must be >= 0"));
            }
            if !clip.duration.is_finite() || clip.duration <= 0.0 {
                return Err(EngineError::param("duration", clip.duration, "must be > 0"));
            }
            check_range("amplitude", clip.amplitude, 0.0, 1.0)?;
            let osc = Oscillator::new(clip.frequency, clip.waveform, sample_rate)?;
            let start = to_samples(clip.start_time);
            clips.push(ScheduledClip {
                start,
                end: start + to_samples(clip.duration),
                amplitude: clip.amplitude,
                osc,
            });
        }
        clips.sort_by_key(|c| c.start);

        Ok(ClipPlayer {
            clips,
            position: 0,
            scratch: vec![0.0; max_block.max(1)],
        })
    }

    /// Samples rendered so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_finished(&self) -> bool {
        self.clips.iter().all(|c| c.end <= self.position)
    }

    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let block_start = self.position;
        let block_end = block_start + out.len() as u64;

        for clip in &mut self.clips {
            if clip.start >= block_end {
                break;
            }
            if clip.end <= block_start {
                continue;
            }
            let from = (clip.start.max(block_start) - block_start) as usize;
            let to = (clip.end.min(block_end) - block_start) as usize;
            for region in out[from..to].chunks_mut(self.scratch.len()) {
                let tone = &mut self.scratch[..region.len()];
                clip.osc.render_block(tone);
                for (o, &t) in region.iter_mut().zip(tone.iter()) {
                    *o += clip.amplitude * t;
                }
            }
        }
        self.position = block_end;
    }
}
