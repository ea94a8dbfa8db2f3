//! Mixer — Sums track outputs with master gain and a tanh limiter.

use super::effects::EffectParameters;
use super::track::{Track, TrackId};

/// Ordered set of tracks summed into one stream.
///
/// Insertion order is mixing order. Storage for `max_tracks` is reserved up
/// front so adding a track on the render thread never reallocates.
#[derive(Debug)]
pub struct Mixer {
    tracks: Vec<Box<Track>>,
    max_tracks: usize,
    master_gain: f32,
    scratch: Vec<f32>,
}

impl Mixer {
    pub fn new(max_tracks: usize, block_size: usize, master_gain: f32) -> Self {
        Mixer {
            tracks: Vec::with_capacity(max_tracks),
            max_tracks,
            master_gain,
            scratch: vec![0.0; block_size.max(1)],
        }
    }

    pub fn master_gain(&self) -> f32 {
        self.master_gain
    }

    pub fn set_master_gain(&mut self, gain: f32) {
        self.master_gain = gain;
    }

    /// Append a track. Hands it back when the reserved capacity is used up.
    pub fn add_track(&mut self, track: Box<Track>) -> Result<(), Box<Track>> {
        if self.tracks.len() >= self.max_tracks {
            return Err(track);
        }
        self.tracks.push(track);
        Ok(())
    }

    /// Remove a track, keeping the order of the others.
    pub fn remove_track(&mut self, id: TrackId) -> Option<Box<Track>> {
        let index = self.tracks.iter().position(|t| t.id() == id)?;
        Some(self.tracks.remove(index))
    }

    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id() == id).map(|t| &mut **t)
    }

    pub fn track_ids(&self) -> impl Iterator<Item = TrackId> + '_ {
        self.tracks.iter().map(|t| t.id())
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Render every track into `out`: sum, apply master gain, soft clip.
    pub fn render(&mut self, params: &EffectParameters, out: &mut [f32]) {
        let Mixer {
            tracks,
            master_gain,
            scratch,
            ..
        } = self;
        let step = scratch.len();

        for chunk in out.chunks_mut(step) {
            chunk.fill(0.0);
            let scratch = &mut scratch[..chunk.len()];
            for track in tracks.iter_mut() {
                track.render(params, scratch);
                for (acc, &s) in chunk.iter_mut().zip(scratch.iter()) {
                    *acc += s;
                }
            }
            for s in chunk.iter_mut() {
                *s = soft_clip(*s * *master_gain);
            }
        }
    }
}

/// Soft clipper using tanh to prevent harsh digital clipping.
pub fn soft_clip(x: f32) -> f32 {
    x.tanh()
}
