//! Audio Engine — the real-time render side.
//!
//! [`AudioRenderer`] is driven by the host's audio callback. It owns the
//! mixer and every track, and it talks to the control side only through
//! lock-free rings:
//!
//! - commands in, drained at each block boundary
//! - released objects out, so they are freed off this thread
//! - render faults out, for logging
//! - mixed samples out to the recorder
//!
//! The analyzer gets the newest output through an overwriting queue: when
//! the control side falls behind, the oldest samples give way.
//!
//! Nothing here locks, logs, or allocates in steady state.

use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use ringbuf::traits::{Consumer, Producer};
use ringbuf::{HeapCons, HeapProd};

use crate::command::{Command, RenderFault, Retired};
use crate::metrics::EngineMetrics;
use crate::recorder::CaptureTap;

use super::effects::EffectParameters;
use super::mixer::Mixer;
use super::track::{TrackId, TrackSource};

/// Ring ends and state handed to the renderer at construction.
pub(crate) struct RenderLinks {
    pub commands: HeapCons<Command>,
    pub retired: HeapProd<Retired>,
    pub faults: HeapProd<RenderFault>,
    pub analysis: Arc<ArrayQueue<f32>>,
    pub capture: CaptureTap,
    pub metrics: Arc<EngineMetrics>,
}

/// Renders the mix block by block. Move this into the audio callback.
pub struct AudioRenderer {
    commands: HeapCons<Command>,
    retired: HeapProd<Retired>,
    faults: HeapProd<RenderFault>,
    analysis: Arc<ArrayQueue<f32>>,
    capture: CaptureTap,
    metrics: Arc<EngineMetrics>,
    mixer: Mixer,
    effects: EffectParameters,
    block_size: usize,
    /// Mono scratch for interleaved output.
    mono: Vec<f32>,
    running: bool,
    block_index: u64,
}

impl AudioRenderer {
    pub(crate) fn new(links: RenderLinks, mixer: Mixer, effects: EffectParameters, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        AudioRenderer {
            commands: links.commands,
            retired: links.retired,
            faults: links.faults,
            analysis: links.analysis,
            capture: links.capture,
            metrics: links.metrics,
            mixer,
            effects,
            block_size,
            mono: vec![0.0; block_size],
            running: true,
            block_index: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks rendered so far.
    pub fn block_index(&self) -> u64 {
        self.block_index
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Fill a mono buffer. Any length is accepted; it is processed in
    /// `block_size` chunks and commands are applied before each chunk.
    pub fn render(&mut self, out: &mut [f32]) {
        for chunk in out.chunks_mut(self.block_size) {
            self.render_block(chunk);
        }
    }

    /// Fill an interleaved buffer, copying the mono mix to every channel.
    pub fn render_interleaved(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        out.fill(0.0);
        let mut mono = std::mem::take(&mut self.mono);
        for frames in out.chunks_mut(self.block_size * channels) {
            let count = frames.len() / channels;
            if count == 0 {
                break;
            }
            self.render_block(&mut mono[..count]);
            for (frame, &s) in frames.chunks_exact_mut(channels).zip(&mono[..count]) {
                frame.fill(s);
            }
        }
        self.mono = mono;
    }

    fn render_block(&mut self, out: &mut [f32]) {
        self.apply_commands();

        if self.running {
            self.mixer.render(&self.effects, out);
        } else {
            out.fill(0.0);
        }

        let bad_samples = out.iter().filter(|s| !s.is_finite()).count();
        if bad_samples > 0 {
            out.fill(0.0);
            self.metrics.render_fault();
            // A full fault ring only loses the log line; the counter is kept.
            let _ = self.faults.try_push(RenderFault {
                block_index: self.block_index,
                bad_samples,
            });
        }

        if self.capture.capture(out) {
            self.metrics.recorder_widened();
        }

        let mut stale = false;
        for &s in out.iter() {
            stale |= self.analysis.force_push(s).is_some();
        }
        if stale {
            self.metrics.analysis_underrun();
        }

        self.block_index += 1;
        self.metrics.block_rendered();
    }

    fn apply_commands(&mut self) {
        while let Some(command) = self.commands.try_pop() {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::StartVoice(osc) => self.swap_source(TrackId::LEAD, TrackSource::Oscillator(osc)),
            Command::StopVoice => self.swap_source(TrackId::LEAD, TrackSource::Silent),
            Command::SetFrequency(frequency) => {
                if let Some(osc) = self.lead_oscillator() {
                    // Validated by the controller; a rejection leaves the
                    // oscillator untouched.
                    let _ = osc.set_frequency(frequency);
                }
            }
            Command::SetWaveform(waveform) => {
                if let Some(osc) = self.lead_oscillator() {
                    osc.set_waveform(waveform);
                }
            }
            Command::AddTrack(track) => {
                if let Err(track) = self.mixer.add_track(track) {
                    self.retire(Retired::Track(track));
                }
            }
            Command::RemoveTrack(id) => {
                if let Some(track) = self.mixer.remove_track(id) {
                    self.retire(Retired::Track(track));
                }
            }
            Command::SetTrackVolume(id, volume) => {
                if let Some(track) = self.mixer.track_mut(id) {
                    track.set_volume(volume);
                }
            }
            Command::MuteTrack(id, muted) => {
                if let Some(track) = self.mixer.track_mut(id) {
                    track.set_muted(muted);
                }
            }
            Command::SetTrackSource(id, source) => self.swap_source(id, source),
            Command::SetEffects(params) => self.effects = params,
            Command::SetMasterGain(gain) => self.mixer.set_master_gain(gain),
            Command::StartCapture => self.capture.begin(),
            Command::SealCapture => self.capture.seal(),
            Command::SetRunning(running) => self.running = running,
        }
    }

    fn lead_oscillator(&mut self) -> Option<&mut super::oscillator::Oscillator> {
        self.mixer.track_mut(TrackId::LEAD)?.oscillator_mut()
    }

    fn swap_source(&mut self, id: TrackId, source: TrackSource) {
        let old = match self.mixer.track_mut(id) {
            Some(track) => track.replace_source(source),
            None => source,
        };
        if !matches!(old, TrackSource::Silent) {
            self.retire(Retired::Source(old));
        }
    }

    fn retire(&mut self, item: Retired) {
        if let Err(item) = self.retired.try_push(item) {
            self.metrics.retire_overflow();
            drop(item);
        }
    }
}

impl std::fmt::Debug for AudioRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioRenderer")
            .field("block_size", &self.block_size)
            .field("block_index", &self.block_index)
            .field("running", &self.running)
            .field("tracks", &self.mixer.len())
            .finish()
    }
}
