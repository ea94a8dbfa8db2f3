//! EngineController — the control side of one engine instance.
//!
//! Requests are validated here, synchronously, and forwarded to the
//! [`AudioRenderer`] as commands. A rejected request leaves both sides
//! exactly as they were.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use log::{debug, info, warn};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::{Deserialize, Deserializer, Serialize};

use crate::command::{Command, RenderFault, Retired};
use crate::config::EngineConfig;
use crate::dsp::effects::{EffectKind, EffectParameters, EffectsChain};
use crate::dsp::engine::{AudioRenderer, RenderLinks};
use crate::dsp::mixer::Mixer;
use crate::dsp::oscillator::{Oscillator, Waveform, check_frequency};
use crate::dsp::renderer::{AssetEncoder, PcmFormat, WavEncoder};
use crate::dsp::spectrum::{SpectrumAnalyzer, SpectrumSnapshot};
use crate::dsp::timeline::{ClipPlayer, Timeline};
use crate::dsp::track::{InputFeed, SourceSpec, Track, TrackId, TrackSource};
use crate::error::{EngineError, check_range};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::preset::VoicePreset;
use crate::recorder::{RecordedAsset, Recorder, RecorderEvent, RecorderState, RecordingTicket, capture_channel};

const FAULT_CAPACITY: usize = 64;

/// Called on the control thread with each finished recording.
pub type FinalizedHandler = Box<dyn FnMut(RecordedAsset) + Send>;

/// The voice currently playing on the lead track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoiceState {
    pub frequency: f32,
    pub waveform: Waveform,
}

/// What a track is playing, as last requested.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceKind {
    Silent,
    Oscillator { frequency: f32, waveform: Waveform },
    Input,
    Timeline { clips: usize, duration: f32 },
}

/// Control-side view of a track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrackInfo {
    pub id: TrackId,
    pub volume: f32,
    pub muted: bool,
    pub source: SourceKind,
}

/// Something the host should know about, produced by [`EngineController::poll`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    RenderFault { block_index: u64, bad_samples: usize },
    RecordingFinalized { session: u64, samples: usize, bytes: usize },
    RecordingFailed { session: u64, error: String },
    RecordingDiscarded { session: u64 },
}

/// Control handle of an engine. Lives on a non-real-time thread.
pub struct EngineController {
    config: EngineConfig,
    sample_rate: f64,
    commands: HeapProd<Command>,
    retired: HeapCons<Retired>,
    faults: HeapCons<RenderFault>,
    analysis: Arc<ArrayQueue<f32>>,
    /// Newest `analysis_size` output samples, oldest first.
    analysis_window: Vec<f32>,
    analysis_scratch: Vec<f32>,
    analyzer: SpectrumAnalyzer,
    recorder: Recorder,
    finished: VecDeque<RecordedAsset>,
    on_finalized: Option<FinalizedHandler>,
    metrics: Arc<EngineMetrics>,
    tracks: Vec<TrackInfo>,
    next_track_id: u32,
    voice: Option<VoiceState>,
    effects: EffectParameters,
    master_gain: f32,
    shut_down: bool,
}

impl EngineController {
    /// Build an engine: a controller for the host and a renderer for the
    /// audio callback. Instances are fully independent.
    pub fn init(config: EngineConfig) -> Result<(EngineController, AudioRenderer), EngineError> {
        config.validate()?;
        let sample_rate = config.sample_rate as f64;

        let (commands, command_rx) = HeapRb::<Command>::new(config.command_capacity).split();
        let (retired_tx, retired) = HeapRb::<Retired>::new(config.command_capacity + config.max_tracks).split();
        let (faults_tx, faults) = HeapRb::<RenderFault>::new(FAULT_CAPACITY).split();
        let analysis = Arc::new(ArrayQueue::new(config.analysis_size));

        let ring_samples = config
            .seconds_to_samples(config.recording.ring_seconds)
            .max(config.block_size * 2);
        let backlog_samples = config.seconds_to_samples(config.recording.backlog_seconds);
        let format = PcmFormat {
            sample_rate: config.sample_rate,
            channels: config.channels,
            bits_per_sample: config.recording.bits_per_sample,
        };
        let (capture, recorder) = capture_channel(ring_samples, backlog_samples, format, Box::new(WavEncoder));

        let metrics = Arc::new(EngineMetrics::default());

        let mut mixer = Mixer::new(config.max_tracks, config.block_size, config.master_gain);
        let lead = Track::new(
            TrackId::LEAD,
            TrackSource::Silent,
            config.default_track_volume,
            EffectsChain::new(sample_rate, config.max_delay_ms, config.effects),
        );
        mixer
            .add_track(Box::new(lead))
            .map_err(|_| EngineError::Config("no room for the lead track".into()))?;

        let renderer = AudioRenderer::new(
            RenderLinks {
                commands: command_rx,
                retired: retired_tx,
                faults: faults_tx,
                analysis: Arc::clone(&analysis),
                capture,
                metrics: Arc::clone(&metrics),
            },
            mixer,
            config.effects,
            config.block_size,
        );

        let controller = EngineController {
            sample_rate,
            commands,
            retired,
            faults,
            analysis,
            analysis_window: vec![0.0; config.analysis_size],
            analysis_scratch: Vec::with_capacity(config.analysis_size),
            analyzer: SpectrumAnalyzer::new(config.sample_rate, config.analysis_size),
            recorder,
            finished: VecDeque::new(),
            on_finalized: None,
            metrics,
            tracks: vec![TrackInfo {
                id: TrackId::LEAD,
                volume: config.default_track_volume.clamp(0.0, 1.0),
                muted: false,
                source: SourceKind::Silent,
            }],
            next_track_id: 1,
            voice: None,
            effects: config.effects,
            master_gain: config.master_gain,
            shut_down: false,
            config,
        };
        info!(
            "engine initialized: {} Hz, {}-sample blocks, {} tracks max",
            controller.config.sample_rate, controller.config.block_size, controller.config.max_tracks
        );
        Ok((controller, renderer))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.shut_down {
            return Err(EngineError::state("engine is shut down"));
        }
        Ok(())
    }

    fn send(&mut self, command: Command) -> Result<(), EngineError> {
        self.commands.try_push(command).map_err(|_| {
            self.metrics.request_rejected();
            EngineError::QueueFull
        })
    }

    fn track_index(&self, id: TrackId) -> Result<usize, EngineError> {
        self.tracks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| EngineError::state(format!("unknown track {id}")))
    }

    // Voice

    /// Start the lead voice, replacing any voice already playing.
    pub fn request_start(&mut self, frequency: f32, waveform: Waveform) -> Result<(), EngineError> {
        self.ensure_open()?;
        let osc = Oscillator::new(frequency, waveform, self.sample_rate)?;
        self.send(Command::StartVoice(osc))?;
        self.voice = Some(VoiceState { frequency, waveform });
        self.tracks[0].source = SourceKind::Oscillator { frequency, waveform };
        info!("voice started: {frequency} Hz {waveform}");
        Ok(())
    }

    /// Stop the lead voice. Stopping when nothing plays is a no-op.
    pub fn request_stop(&mut self) -> Result<(), EngineError> {
        self.ensure_open()?;
        if self.voice.is_none() {
            return Ok(());
        }
        self.send(Command::StopVoice)?;
        self.voice = None;
        self.tracks[0].source = SourceKind::Silent;
        info!("voice stopped");
        Ok(())
    }

    /// Retune the lead voice from the next block. Validated even when no
    /// voice is playing, in which case nothing else happens.
    pub fn request_set_frequency(&mut self, frequency: f32) -> Result<(), EngineError> {
        self.ensure_open()?;
        check_frequency(frequency, self.sample_rate)?;
        let Some(voice) = self.voice else {
            return Ok(());
        };
        self.send(Command::SetFrequency(frequency))?;
        self.set_voice(VoiceState { frequency, ..voice });
        debug!("frequency -> {frequency} Hz");
        Ok(())
    }

    pub fn request_set_waveform(&mut self, waveform: Waveform) -> Result<(), EngineError> {
        self.ensure_open()?;
        let Some(voice) = self.voice else {
            return Ok(());
        };
        self.send(Command::SetWaveform(waveform))?;
        self.set_voice(VoiceState { waveform, ..voice });
        debug!("waveform -> {waveform}");
        Ok(())
    }

    fn set_voice(&mut self, voice: VoiceState) {
        self.voice = Some(voice);
        self.tracks[0].source = SourceKind::Oscillator {
            frequency: voice.frequency,
            waveform: voice.waveform,
        };
    }

    pub fn voice(&self) -> Option<VoiceState> {
        self.voice
    }

    // Presets

    /// The playing voice, lead volume and effects as preset JSON.
    pub fn save_preset(&self, name: Option<&str>) -> Result<String, EngineError> {
        let voice = self.voice.ok_or_else(|| EngineError::state("no voice to save"))?;
        VoicePreset {
            name: name.map(str::to_owned),
            frequency: voice.frequency,
            waveform: voice.waveform,
            volume: self.tracks[0].volume,
            effects: Some(self.effects),
        }
        .to_json()
    }

    /// Apply preset JSON, all of it or nothing. A playing voice is retuned
    /// from the next block; an idle engine stays idle and takes only the
    /// volume and effects.
    pub fn request_load_preset(&mut self, text: &str) -> Result<VoicePreset, EngineError> {
        self.ensure_open()?;
        let preset = VoicePreset::from_json(text, self.sample_rate, self.config.max_delay_ms)?;
        let voice_commands = if self.voice.is_some() { 2 } else { 0 };
        let needed = 1 + usize::from(preset.effects.is_some()) + voice_commands;
        if self.commands.vacant_len() < needed {
            self.metrics.request_rejected();
            return Err(EngineError::QueueFull);
        }

        self.request_set_track_volume(TrackId::LEAD, preset.volume)?;
        if let Some(effects) = preset.effects {
            self.request_set_effects(effects)?;
        }
        self.request_set_frequency(preset.frequency)?;
        self.request_set_waveform(preset.waveform)?;
        info!(
            "preset {} loaded",
            preset.name.as_deref().unwrap_or("(unnamed)")
        );
        Ok(preset)
    }

    // Tracks

    /// Add a silent track with the next free id.
    pub fn request_add_track(&mut self) -> Result<TrackId, EngineError> {
        let id = self.next_free_id()?;
        self.request_add_track_with_id(id)?;
        Ok(id)
    }

    /// Add a silent track under a host-chosen id.
    pub fn request_add_track_with_id(&mut self, id: TrackId) -> Result<(), EngineError> {
        self.add_track(id, TrackSource::Silent, SourceKind::Silent)
    }

    /// Add a track fed by the host. Push samples through the returned feed.
    pub fn request_add_input_track(&mut self) -> Result<InputFeed, EngineError> {
        let id = self.next_free_id()?;
        let capacity = self
            .config
            .seconds_to_samples(self.config.recording.ring_seconds)
            .max(self.config.block_size * 2);
        let (producer, consumer) = HeapRb::<f32>::new(capacity).split();
        self.add_track(id, TrackSource::Input(consumer), SourceKind::Input)?;
        Ok(InputFeed::new(id, producer))
    }

    /// Lowest unused id above every id handed out so far; once the top of
    /// the id space is taken, the lowest free id instead.
    fn next_free_id(&self) -> Result<TrackId, EngineError> {
        let taken = |id: u32| self.tracks.iter().any(|t| t.id.0 == id);
        let mut candidate = Some(self.next_track_id);
        while let Some(id) = candidate {
            if !taken(id) {
                return Ok(TrackId(id));
            }
            candidate = id.checked_add(1);
        }
        (1..self.next_track_id)
            .find(|&id| !taken(id))
            .map(TrackId)
            .ok_or_else(|| EngineError::state("track ids exhausted"))
    }

    fn add_track(&mut self, id: TrackId, source: TrackSource, kind: SourceKind) -> Result<(), EngineError> {
        self.ensure_open()?;
        if self.tracks.iter().any(|t| t.id == id) {
            return Err(EngineError::state(format!("duplicate track id {id}")));
        }
        if self.tracks.len() >= self.config.max_tracks {
            return Err(EngineError::state(format!(
                "track capacity of {} exhausted",
                self.config.max_tracks
            )));
        }
        let volume = self.config.default_track_volume;
        let effects = EffectsChain::new(self.sample_rate, self.config.max_delay_ms, self.effects);
        let track = Box::new(Track::new(id, source, volume, effects));
        self.send(Command::AddTrack(track))?;

        self.tracks.push(TrackInfo {
            id,
            volume,
            muted: false,
            source: kind,
        });
        self.next_track_id = self.next_track_id.max(id.0.saturating_add(1));
        info!("added {id}");
        Ok(())
    }

    pub fn request_remove_track(&mut self, id: TrackId) -> Result<(), EngineError> {
        self.ensure_open()?;
        if id == TrackId::LEAD {
            return Err(EngineError::state("the lead track cannot be removed"));
        }
        let index = self.track_index(id)?;
        self.send(Command::RemoveTrack(id))?;
        self.tracks.remove(index);
        info!("removed {id}");
        Ok(())
    }

    pub fn request_set_track_volume(&mut self, id: TrackId, volume: f32) -> Result<(), EngineError> {
        self.ensure_open()?;
        check_range("volume", volume, 0.0, 1.0)?;
        let index = self.track_index(id)?;
        self.send(Command::SetTrackVolume(id, volume))?;
        self.tracks[index].volume = volume;
        debug!("{id} volume -> {volume}");
        Ok(())
    }

    pub fn request_mute_track(&mut self, id: TrackId, muted: bool) -> Result<(), EngineError> {
        self.ensure_open()?;
        let index = self.track_index(id)?;
        self.send(Command::MuteTrack(id, muted))?;
        self.tracks[index].muted = muted;
        debug!("{id} muted -> {muted}");
        Ok(())
    }

    /// Replace what a non-lead track plays.
    pub fn request_set_track_source(&mut self, id: TrackId, spec: SourceSpec) -> Result<(), EngineError> {
        self.ensure_open()?;
        if id == TrackId::LEAD {
            return Err(EngineError::state("the lead track follows the voice; use start/stop"));
        }
        let index = self.track_index(id)?;
        let source = TrackSource::from_spec(spec, self.sample_rate)?;
        self.send(Command::SetTrackSource(id, source))?;
        self.tracks[index].source = match spec {
            SourceSpec::Silence => SourceKind::Silent,
            SourceSpec::Oscillator { frequency, waveform } => SourceKind::Oscillator { frequency, waveform },
        };
        debug!("{id} source -> {:?}", self.tracks[index].source);
        Ok(())
    }

    /// Play `timeline` on a non-lead track, starting from the next block.
    pub fn request_set_track_timeline(&mut self, id: TrackId, timeline: Timeline) -> Result<(), EngineError> {
        self.ensure_open()?;
        if id == TrackId::LEAD {
            return Err(EngineError::state("the lead track follows the voice; use start/stop"));
        }
        let index = self.track_index(id)?;
        let player = ClipPlayer::new(&timeline, self.sample_rate, self.config.block_size)?;
        self.send(Command::SetTrackSource(id, TrackSource::Timeline(player)))?;
        self.tracks[index].source = SourceKind::Timeline {
            clips: timeline.clips.len(),
            duration: timeline.duration(),
        };
        info!("{id} timeline: {} clips, {:.2}s", timeline.clips.len(), timeline.duration());
        Ok(())
    }

    /// Track ids in mixing order.
    pub fn track_ids(&self) -> Vec<TrackId> {
        self.tracks.iter().map(|t| t.id).collect()
    }

    pub fn tracks(&self) -> &[TrackInfo] {
        &self.tracks
    }

    // Effects and gain

    /// Set one effect value by name (`delay`, `delay_time`, `reverb`,
    /// `room_size`, `damping`).
    pub fn request_set_effect(&mut self, name: &str, value: f32) -> Result<(), EngineError> {
        self.ensure_open()?;
        let kind: EffectKind = name.parse()?;
        let next = self.effects.with(kind, value, self.config.max_delay_ms)?;
        self.send(Command::SetEffects(next))?;
        self.effects = next;
        debug!("effect {name} -> {value}");
        Ok(())
    }

    pub fn request_set_effects(&mut self, params: EffectParameters) -> Result<(), EngineError> {
        self.ensure_open()?;
        params.validate(self.config.max_delay_ms)?;
        self.send(Command::SetEffects(params))?;
        self.effects = params;
        debug!("effects -> {params:?}");
        Ok(())
    }

    pub fn effects(&self) -> &EffectParameters {
        &self.effects
    }

    pub fn request_set_master_gain(&mut self, gain: f32) -> Result<(), EngineError> {
        self.ensure_open()?;
        check_range("master_gain", gain, 0.0, 2.0)?;
        self.send(Command::SetMasterGain(gain))?;
        self.master_gain = gain;
        debug!("master gain -> {gain}");
        Ok(())
    }

    pub fn master_gain(&self) -> f32 {
        self.master_gain
    }

    // Recording

    /// Start capturing from the next block. Returns the session number.
    pub fn request_start_recording(&mut self) -> Result<u64, EngineError> {
        self.ensure_open()?;
        self.recorder.check_can_start()?;
        self.send(Command::StartCapture)?;
        Ok(self.recorder.begin())
    }

    /// Stop capturing at the next block. The asset is delivered later via
    /// the finalized handler (or [`EngineController::take_recording`]).
    pub fn request_stop_recording(&mut self) -> Result<RecordingTicket, EngineError> {
        self.recorder.check_can_stop()?;
        self.send(Command::SealCapture)?;
        Ok(self.recorder.stop())
    }

    pub fn retry_export(&mut self) -> Result<EngineEvent, EngineError> {
        let event = self.recorder.retry_export()?;
        Ok(self.handle_recorder_event(event))
    }

    pub fn discard_recording(&mut self) -> Result<(), EngineError> {
        if let Some(event) = self.recorder.discard()? {
            self.handle_recorder_event(event);
        }
        Ok(())
    }

    pub fn recorder_state(&self) -> RecorderState {
        self.recorder.state()
    }

    /// Register the recording handoff. Assets finished earlier and not yet
    /// taken are delivered immediately.
    pub fn set_on_recording_finalized(&mut self, mut handler: FinalizedHandler) {
        while let Some(asset) = self.finished.pop_front() {
            handler(asset);
        }
        self.on_finalized = Some(handler);
    }

    pub fn set_asset_encoder(&mut self, encoder: Box<dyn AssetEncoder>) {
        self.recorder.set_encoder(encoder);
    }

    /// Oldest finished recording not yet handed to a handler.
    pub fn take_recording(&mut self) -> Option<RecordedAsset> {
        self.finished.pop_front()
    }

    fn handle_recorder_event(&mut self, event: RecorderEvent) -> EngineEvent {
        match event {
            RecorderEvent::Finalized(asset) => {
                let summary = EngineEvent::RecordingFinalized {
                    session: asset.session,
                    samples: asset.samples.len(),
                    bytes: asset.bytes.len(),
                };
                match self.on_finalized.as_mut() {
                    Some(handler) => handler(asset),
                    None => self.finished.push_back(asset),
                }
                summary
            }
            RecorderEvent::Failed { session, error } => EngineEvent::RecordingFailed {
                session,
                error: error.to_string(),
            },
            RecorderEvent::Discarded { session } => EngineEvent::RecordingDiscarded { session },
        }
    }

    // Housekeeping

    /// Drop released objects, log render faults and advance the recorder.
    /// Call regularly from the control thread.
    pub fn poll(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        let released = self.retired.pop_iter().count();
        if released > 0 {
            debug!("released {released} objects from the render thread");
        }

        while let Some(fault) = self.faults.try_pop() {
            warn!(
                "block {} had {} non-finite samples; replaced with silence",
                fault.block_index, fault.bad_samples
            );
            events.push(EngineEvent::RenderFault {
                block_index: fault.block_index,
                bad_samples: fault.bad_samples,
            });
        }

        if let Some(event) = self.recorder.pump() {
            events.push(self.handle_recorder_event(event));
        }
        events
    }

    // Analysis

    /// Spectrum of the newest `analysis_size` output samples.
    ///
    /// The renderer overwrites samples nobody read in time, so the queue
    /// only ever holds the latest window. Never blocks the renderer.
    pub fn spectrum_snapshot(&mut self) -> Result<SpectrumSnapshot, EngineError> {
        let size = self.analysis_window.len();
        self.analysis_scratch.clear();
        // Bounded so a renderer pushing concurrently cannot keep us here.
        while self.analysis_scratch.len() < size {
            let Some(sample) = self.analysis.pop() else { break };
            self.analysis_scratch.push(sample);
        }
        let fresh = self.analysis_scratch.len();
        if fresh > 0 {
            self.analysis_window.copy_within(fresh.., 0);
            self.analysis_window[size - fresh..].copy_from_slice(&self.analysis_scratch);
        }
        self.analyzer.analyze(&self.analysis_window)
    }

    /// Analyze an arbitrary block with this engine's analyzer.
    pub fn analyze_block(&mut self, block: &[f32]) -> Result<SpectrumSnapshot, EngineError> {
        self.analyzer.analyze(block)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // Lifecycle

    /// Silence the renderer from the next block. Later requests fail with
    /// `InvalidState`; polling and recording handoff keep working.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        if self.shut_down {
            return Ok(());
        }
        self.send(Command::SetRunning(false))?;
        self.shut_down = true;
        self.voice = None;
        info!("engine shut down");
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    // Host envelope

    pub fn dispatch(&mut self, request: HostRequest) -> Result<HostResponse, EngineError> {
        match request {
            HostRequest::Start { frequency, waveform } => self.request_start(frequency, waveform)?,
            HostRequest::Stop => self.request_stop()?,
            HostRequest::SetFrequency { frequency } => self.request_set_frequency(frequency)?,
            HostRequest::SetWaveform { waveform } => self.request_set_waveform(waveform)?,
            HostRequest::AddTrack { id: Some(id) } => {
                self.request_add_track_with_id(id)?;
                return Ok(HostResponse::TrackAdded { id });
            }
            HostRequest::AddTrack { id: None } => {
                let id = self.request_add_track()?;
                return Ok(HostResponse::TrackAdded { id });
            }
            HostRequest::RemoveTrack { id } => self.request_remove_track(id)?,
            HostRequest::SetTrackVolume { id, volume } => self.request_set_track_volume(id, volume)?,
            HostRequest::MuteTrack { id, muted } => self.request_mute_track(id, muted)?,
            HostRequest::SetTrackSource { id, source } => self.request_set_track_source(id, source)?,
            HostRequest::SetTrackTimeline { id, timeline } => self.request_set_track_timeline(id, timeline)?,
            HostRequest::SetEffect { effect, value } => self.request_set_effect(&effect, value)?,
            HostRequest::SetMasterGain { gain } => self.request_set_master_gain(gain)?,
            HostRequest::StartRecording => {
                let session = self.request_start_recording()?;
                return Ok(HostResponse::Recording { session });
            }
            HostRequest::StopRecording => {
                let ticket = self.request_stop_recording()?;
                return Ok(HostResponse::Recording {
                    session: ticket.session,
                });
            }
            HostRequest::RetryExport => {
                let event = self.retry_export()?;
                return Ok(HostResponse::Events { events: vec![event] });
            }
            HostRequest::DiscardRecording => self.discard_recording()?,
            HostRequest::GetSpectrum => return Ok(HostResponse::Spectrum(self.spectrum_snapshot()?)),
            HostRequest::GetMetrics => return Ok(HostResponse::Metrics(self.metrics())),
            HostRequest::ListTracks => {
                return Ok(HostResponse::Tracks {
                    tracks: self.tracks.clone(),
                });
            }
            HostRequest::Poll => return Ok(HostResponse::Events { events: self.poll() }),
            HostRequest::SavePreset { name } => {
                let preset = self.save_preset(name.as_deref())?;
                return Ok(HostResponse::Preset { preset });
            }
            HostRequest::LoadPreset { preset } => {
                self.request_load_preset(&preset)?;
            }
            HostRequest::Shutdown => self.shutdown()?,
        }
        Ok(HostResponse::Ok)
    }

    /// Decode a JSON request, run it, and encode the response.
    pub fn dispatch_json(&mut self, text: &str) -> Result<String, EngineError> {
        let request: HostRequest =
            serde_json::from_str(text).map_err(|e| EngineError::param("request", e, "malformed request"))?;
        let response = self.dispatch(request)?;
        serde_json::to_string(&response).map_err(|e| EngineError::state(format!("response encoding: {e}")))
    }
}

impl std::fmt::Debug for EngineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineController")
            .field("tracks", &self.tracks)
            .field("voice", &self.voice)
            .field("effects", &self.effects)
            .field("recorder", &self.recorder.state())
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

/// Request envelope used by JSON and JS hosts. Numeric fields also accept
/// strings such as `"0.4"`, which is what HTML range inputs produce.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostRequest {
    Start {
        #[serde(deserialize_with = "loose_f32")]
        frequency: f32,
        #[serde(default = "default_waveform")]
        waveform: Waveform,
    },
    Stop,
    SetFrequency {
        #[serde(deserialize_with = "loose_f32")]
        frequency: f32,
    },
    SetWaveform {
        waveform: Waveform,
    },
    AddTrack {
        #[serde(default)]
        id: Option<TrackId>,
    },
    RemoveTrack {
        id: TrackId,
    },
    SetTrackVolume {
        id: TrackId,
        #[serde(deserialize_with = "loose_f32")]
        volume: f32,
    },
    MuteTrack {
        id: TrackId,
        muted: bool,
    },
    SetTrackSource {
        id: TrackId,
        source: SourceSpec,
    },
    SetTrackTimeline {
        id: TrackId,
        timeline: Timeline,
    },
    SetEffect {
        effect: String,
        #[serde(deserialize_with = "loose_f32")]
        value: f32,
    },
    SetMasterGain {
        #[serde(deserialize_with = "loose_f32")]
        gain: f32,
    },
    StartRecording,
    StopRecording,
    RetryExport,
    DiscardRecording,
    GetSpectrum,
    GetMetrics,
    ListTracks,
    SavePreset {
        #[serde(default)]
        name: Option<String>,
    },
    /// `preset` is the JSON text produced by `save-preset`.
    LoadPreset {
        preset: String,
    },
    Poll,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostResponse {
    Ok,
    TrackAdded { id: TrackId },
    Recording { session: u64 },
    Spectrum(SpectrumSnapshot),
    Metrics(MetricsSnapshot),
    Tracks { tracks: Vec<TrackInfo> },
    Events { events: Vec<EngineEvent> },
    Preset { preset: String },
}

fn default_waveform() -> Waveform {
    Waveform::Sine
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose<T> {
    Value(T),
    Text(String),
}

fn loose_f32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
    match Loose::<f32>::deserialize(deserializer)? {
        Loose::Value(v) => Ok(v),
        Loose::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::dsp::mixer::soft_clip;

    const BLOCK: usize = 128;

    fn engine() -> (EngineController, AudioRenderer) {
        let _ = env_logger::builder().is_test(true).try_init();
        EngineController::init(EngineConfig::default()).unwrap()
    }

    fn render_blocks(renderer: &mut AudioRenderer, blocks: usize) -> Vec<f32> {
        let mut out = vec![0.0; blocks * BLOCK];
        renderer.render(&mut out);
        out
    }

    /// Lead voice as the mixer produces it with default gains and dry effects.
    fn lead_expected(raw: &[f32]) -> Vec<f32> {
        let cfg = EngineConfig::default();
        raw.iter()
            .map(|&s| soft_clip(cfg.master_gain * cfg.default_track_volume * s))
            .collect()
    }

    #[test]
    fn silent_until_voice_starts() {
        let (mut ctl, mut renderer) = engine();
        assert!(render_blocks(&mut renderer, 2).iter().all(|&s| s == 0.0));
        ctl.request_start(440.0, Waveform::Sine).unwrap();
        assert!(render_blocks(&mut renderer, 1).iter().any(|&s| s.abs() > 0.01));
        ctl.request_stop().unwrap();
        assert!(render_blocks(&mut renderer, 1).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn frequency_change_applies_from_next_block() {
        let (mut ctl, mut renderer) = engine();
        ctl.request_start(440.0, Waveform::Sine).unwrap();
        let first = render_blocks(&mut renderer, 1);
        ctl.request_set_frequency(880.0).unwrap();
        let second = render_blocks(&mut renderer, 1);

        let mut reference = Oscillator::new(440.0, Waveform::Sine, 44100.0).unwrap();
        let mut raw = vec![0.0; 2 * BLOCK];
        reference.render_block(&mut raw[..BLOCK]);
        reference.set_frequency(880.0).unwrap();
        reference.render_block(&mut raw[BLOCK..]);
        let expected = lead_expected(&raw);

        let actual: Vec<f32> = first.into_iter().chain(second).collect();
        for (i, (a, e)) in actual.iter().zip(&expected).enumerate() {
            assert!((a - e).abs() < 1e-5, "sample {i}: {a} vs {e}");
        }
    }

    #[test]
    fn mute_applies_at_block_boundary() {
        let (mut ctl, mut renderer) = engine();
        ctl.request_start(300.0, Waveform::Triangle).unwrap();
        let before = render_blocks(&mut renderer, 1);
        ctl.request_mute_track(TrackId::LEAD, true).unwrap();
        let after = render_blocks(&mut renderer, 1);
        assert!(before.iter().any(|&s| s != 0.0));
        assert!(after.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn rejected_requests_leave_state_alone() {
        let (mut ctl, _renderer) = engine();
        ctl.request_start(440.0, Waveform::Sine).unwrap();

        assert!(matches!(
            ctl.request_set_frequency(-10.0),
            Err(EngineError::InvalidParameter { name: "frequency", .. })
        ));
        assert_eq!(ctl.voice().unwrap().frequency, 440.0);

        assert!(matches!(
            ctl.request_set_effect("chorus", 0.5),
            Err(EngineError::InvalidParameter { .. })
        ));
        assert!(ctl.request_set_effect("delay", 1.0).is_err());
        assert_eq!(ctl.effects(), &EffectParameters::default());

        assert!(ctl.request_set_track_volume(TrackId::LEAD, 1.5).is_err());
        assert!(matches!(
            ctl.request_mute_track(TrackId(42), true),
            Err(EngineError::InvalidState(_))
        ));
        assert!(matches!(ctl.request_stop_recording(), Err(EngineError::InvalidState(_))));
        assert!(ctl.request_set_master_gain(2.5).is_err());
        assert_eq!(ctl.master_gain(), 0.8);
    }

    #[test]
    fn track_lifecycle() {
        let (mut ctl, mut renderer) = engine();
        let a = ctl.request_add_track().unwrap();
        let b = ctl.request_add_track().unwrap();
        assert_eq!((a, b), (TrackId(1), TrackId(2)));
        assert!(matches!(
            ctl.request_add_track_with_id(a),
            Err(EngineError::InvalidState(_))
        ));
        assert!(ctl.request_remove_track(TrackId::LEAD).is_err());

        ctl.request_set_track_source(
            b,
            SourceSpec::Oscillator {
                frequency: 220.0,
                waveform: Waveform::Square,
            },
        )
        .unwrap();
        assert!(render_blocks(&mut renderer, 1).iter().any(|&s| s != 0.0));

        ctl.request_remove_track(a).unwrap();
        assert_eq!(ctl.track_ids(), vec![TrackId::LEAD, b]);
        render_blocks(&mut renderer, 1);
        ctl.poll();
        assert_eq!(ctl.metrics().retire_overflows, 0);
    }

    #[test]
    fn ids_after_the_top_of_the_id_space() {
        let (mut ctl, _renderer) = engine();
        ctl.request_add_track_with_id(TrackId(u32::MAX)).unwrap();
        assert_eq!(ctl.request_add_track().unwrap(), TrackId(1));
        assert_eq!(ctl.request_add_input_track().unwrap().track(), TrackId(2));
        assert_eq!(
            ctl.dispatch_json(r#"{ "type": "add-track" }"#).unwrap(),
            r#"{"type":"track-added","id":"track-3"}"#
        );
    }

    #[test]
    fn timeline_track_plays_its_clips() {
        let (mut ctl, mut renderer) = engine();
        let id = ctl.request_add_track().unwrap();
        assert!(matches!(
            ctl.request_set_track_timeline(TrackId::LEAD, Timeline::default()),
            Err(EngineError::InvalidState(_))
        ));

        let reply = ctl
            .dispatch_json(&format!(
                r#"{{ "type": "set-track-timeline", "id": "{id}",
                     "timeline": {{ "clips": [ {{ "start_time": 0, "duration": 0.01, "frequency": 440 }} ] }} }}"#
            ))
            .unwrap();
        assert_eq!(reply, r#"{"type":"ok"}"#);
        assert!(matches!(ctl.tracks()[1].source, SourceKind::Timeline { clips: 1, .. }));

        // 0.01 s at 44.1 kHz is 441 samples: four blocks of tone, then silence.
        let out = render_blocks(&mut renderer, 6);
        assert!(out[..441].iter().any(|&s| s != 0.0));
        assert!(out[441..].iter().all(|&s| s == 0.0));

        ctl.request_set_track_source(id, SourceSpec::Silence).unwrap();
        render_blocks(&mut renderer, 1);
        ctl.poll();
        assert_eq!(ctl.metrics().retire_overflows, 0);
    }

    #[test]
    fn capacity_is_enforced() {
        let cfg = EngineConfig {
            max_tracks: 3,
            ..Default::default()
        };
        let (mut ctl, _renderer) = EngineController::init(cfg).unwrap();
        ctl.request_add_track().unwrap();
        ctl.request_add_track().unwrap();
        assert!(matches!(ctl.request_add_track(), Err(EngineError::InvalidState(_))));
        assert_eq!(ctl.track_ids().len(), 3);
    }

    #[test]
    fn full_queue_rejects_synchronously() {
        let cfg = EngineConfig {
            command_capacity: 16,
            ..Default::default()
        };
        let (mut ctl, mut renderer) = EngineController::init(cfg).unwrap();
        for i in 0..16 {
            ctl.request_set_master_gain(i as f32 * 0.1).unwrap();
        }
        assert_eq!(ctl.request_set_master_gain(1.9), Err(EngineError::QueueFull));
        assert!((ctl.master_gain() - 1.5).abs() < 1e-6);
        assert_eq!(ctl.metrics().rejected_requests, 1);

        render_blocks(&mut renderer, 1);
        ctl.request_set_master_gain(1.9).unwrap();
    }

    #[test]
    fn recording_captures_blocks_between_start_and_stop() {
        let (mut ctl, mut renderer) = engine();
        ctl.request_start(440.0, Waveform::Sawtooth).unwrap();
        render_blocks(&mut renderer, 2);

        let session = ctl.request_start_recording().unwrap();
        assert_eq!(ctl.recorder_state(), RecorderState::Recording);
        let recorded = render_blocks(&mut renderer, 5);
        ctl.poll();
        let ticket = ctl.request_stop_recording().unwrap();
        assert_eq!(ticket.session, session);
        assert_eq!(ctl.recorder_state(), RecorderState::Stopped);
        assert!(ctl.take_recording().is_none(), "asset must not exist before the seal");

        render_blocks(&mut renderer, 1);
        let events = ctl.poll();
        assert!(events.iter().any(|e| matches!(e, EngineEvent::RecordingFinalized { samples, .. } if *samples == 5 * BLOCK)));
        assert_eq!(ctl.recorder_state(), RecorderState::Idle);

        let asset = ctl.take_recording().unwrap();
        assert_eq!(asset.samples, recorded);
        assert_eq!(&asset.bytes[0..4], b"RIFF");
    }

    #[test]
    fn recording_of_zero_blocks() {
        let (mut ctl, mut renderer) = engine();
        ctl.request_start_recording().unwrap();
        ctl.request_stop_recording().unwrap();
        render_blocks(&mut renderer, 1);
        ctl.poll();
        assert!(ctl.take_recording().unwrap().samples.is_empty());
    }

    #[test]
    fn finalized_handler_receives_asset() {
        let (mut ctl, mut renderer) = engine();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        ctl.set_on_recording_finalized(Box::new(move |asset| sink.lock().unwrap().push(asset.session)));

        ctl.request_start_recording().unwrap();
        render_blocks(&mut renderer, 3);
        ctl.request_stop_recording().unwrap();
        render_blocks(&mut renderer, 1);
        ctl.poll();
        assert_eq!(*received.lock().unwrap(), vec![1]);
        assert!(ctl.take_recording().is_none());
    }

    #[test]
    fn non_finite_input_degrades_to_silence() {
        let (mut ctl, mut renderer) = engine();
        let mut feed = ctl.request_add_input_track().unwrap();
        ctl.request_set_track_volume(feed.track(), 1.0).unwrap();
        feed.push(&[f32::NAN; BLOCK]);

        let out = render_blocks(&mut renderer, 1);
        assert!(out.iter().all(|&s| s == 0.0));
        let events = ctl.poll();
        assert!(matches!(events[0], EngineEvent::RenderFault { block_index: 0, bad_samples } if bad_samples == BLOCK));
        assert_eq!(ctl.metrics().render_faults, 1);

        feed.push(&[0.25; BLOCK]);
        let out = render_blocks(&mut renderer, 1);
        assert!(out.iter().all(|&s| s > 0.0));
    }

    #[test]
    fn spectrum_tracks_the_voice() {
        let (mut ctl, mut renderer) = engine();
        assert!(ctl.spectrum_snapshot().unwrap().magnitudes.iter().all(|&m| m == 0.0));

        ctl.request_start(1000.0, Waveform::Sine).unwrap();
        render_blocks(&mut renderer, 20);
        let snap = ctl.spectrum_snapshot().unwrap();
        assert_eq!(snap.fft_size, 1024);
        let expected = (1000.0f32 * 1024.0 / 44100.0).round() as usize;
        assert_eq!(snap.peak_bin(), Some(expected));
    }

    #[test]
    fn spectrum_follows_newest_block_after_idle() {
        let (mut ctl, mut renderer) = engine();
        // Nobody reads the analysis queue for far longer than it holds.
        render_blocks(&mut renderer, 40);
        assert!(ctl.metrics().analysis_underruns > 0);

        ctl.request_start(1000.0, Waveform::Sine).unwrap();
        render_blocks(&mut renderer, 1024 / BLOCK);
        let snap = ctl.spectrum_snapshot().unwrap();
        let expected = (1000.0f32 * 1024.0 / 44100.0).round() as usize;
        assert_eq!(snap.peak_bin(), Some(expected));
        assert_eq!(ctl.metrics().blocks_rendered, 48);
    }

    #[test]
    fn partial_refresh_keeps_window_order() {
        let (mut ctl, mut renderer) = engine();
        render_blocks(&mut renderer, 1024 / BLOCK);
        ctl.spectrum_snapshot().unwrap();

        // One fresh block lands at the end of the window.
        ctl.request_start(1000.0, Waveform::Sine).unwrap();
        render_blocks(&mut renderer, 1);
        ctl.spectrum_snapshot().unwrap();
        let window = &ctl.analysis_window;
        assert!(window[..1024 - BLOCK].iter().all(|&s| s == 0.0));
        assert!(window[1024 - BLOCK..].iter().any(|&s| s != 0.0));
    }

    #[test]
    fn shutdown_silences_and_rejects() {
        let (mut ctl, mut renderer) = engine();
        ctl.request_start(440.0, Waveform::Sine).unwrap();
        render_blocks(&mut renderer, 1);
        ctl.shutdown().unwrap();
        assert!(render_blocks(&mut renderer, 2).iter().all(|&s| s == 0.0));
        assert!(!renderer.is_running());
        assert!(matches!(
            ctl.request_start(440.0, Waveform::Sine),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn interleaved_output_duplicates_channels() {
        let (mut ctl, mut renderer) = engine();
        ctl.request_start(440.0, Waveform::Sine).unwrap();
        let mut out = vec![0.0; 2 * 200];
        renderer.render_interleaved(&mut out, 2);
        for frame in out.chunks(2) {
            assert_eq!(frame[0], frame[1]);
        }
        assert_eq!(renderer.block_index(), 2);
    }

    #[test]
    fn preset_round_trip() {
        let (mut ctl, mut renderer) = engine();
        ctl.request_start(330.0, Waveform::Triangle).unwrap();
        ctl.request_set_track_volume(TrackId::LEAD, 0.7).unwrap();
        ctl.request_set_effect("reverb", 0.2).unwrap();
        let saved = ctl.save_preset(Some("pad")).unwrap();

        ctl.request_start(880.0, Waveform::Square).unwrap();
        ctl.request_set_track_volume(TrackId::LEAD, 0.1).unwrap();
        ctl.request_set_effects(EffectParameters::default()).unwrap();

        let preset = ctl.request_load_preset(&saved).unwrap();
        assert_eq!(preset.name.as_deref(), Some("pad"));
        assert_eq!(
            ctl.voice(),
            Some(VoiceState {
                frequency: 330.0,
                waveform: Waveform::Triangle
            })
        );
        assert_eq!(ctl.tracks()[0].volume, 0.7);
        assert!((ctl.effects().reverb_mix - 0.2).abs() < 1e-6);
        assert_eq!(ctl.save_preset(Some("pad")).unwrap(), saved);

        render_blocks(&mut renderer, 2);
        assert_eq!(ctl.metrics().rejected_requests, 0);
    }

    #[test]
    fn malformed_preset_changes_nothing() {
        let (mut ctl, _renderer) = engine();
        ctl.request_start(440.0, Waveform::Sine).unwrap();
        let before = (ctl.voice(), ctl.tracks()[0], *ctl.effects());

        for text in ["{", "440,0.5,0", r#"{ "frequency": -1, "waveform": "sine", "volume": 0.5 }"#] {
            assert!(matches!(
                ctl.request_load_preset(text),
                Err(EngineError::InvalidParameter { .. })
            ));
        }
        assert_eq!((ctl.voice(), ctl.tracks()[0], *ctl.effects()), before);
    }

    #[test]
    fn preset_on_idle_engine() {
        let (mut ctl, _renderer) = engine();
        assert!(matches!(ctl.save_preset(None), Err(EngineError::InvalidState(_))));

        ctl.request_load_preset(r#"{ "frequency": 220, "waveform": "sawtooth", "volume": 0.25 }"#)
            .unwrap();
        assert_eq!(ctl.voice(), None);
        assert_eq!(ctl.tracks()[0].volume, 0.25);

        let reply = ctl.dispatch_json(r#"{ "type": "save-preset" }"#);
        assert!(matches!(reply, Err(EngineError::InvalidState(_))));
    }

    #[test]
    fn json_requests() {
        let (mut ctl, _renderer) = engine();
        let reply = ctl
            .dispatch_json(r#"{ "type": "set-effect", "effect": "reverb", "value": "0.4" }"#)
            .unwrap();
        assert_eq!(reply, r#"{"type":"ok"}"#);
        assert!((ctl.effects().reverb_mix - 0.4).abs() < 1e-6);

        let reply = ctl
            .dispatch_json(r#"{ "type": "add-track", "id": "track-5" }"#)
            .unwrap();
        assert_eq!(reply, r#"{"type":"track-added","id":"track-5"}"#);

        let reply = ctl.dispatch_json(r#"{ "type": "add-track" }"#).unwrap();
        assert_eq!(reply, r#"{"type":"track-added","id":"track-6"}"#);

        let reply = ctl
            .dispatch_json(r#"{ "type": "mute-track", "id": 6, "muted": true }"#)
            .unwrap();
        assert_eq!(reply, r#"{"type":"ok"}"#);
        let listed = serde_json::to_value(ctl.tracks()).unwrap();
        assert_eq!(listed[2]["id"], "track-6");
        assert_eq!(listed[2]["muted"], true);

        assert!(ctl.dispatch_json(r#"{ "type": "warp" }"#).is_err());
        assert!(matches!(
            ctl.dispatch_json(r#"{ "type": "start", "frequency": 0 }"#),
            Err(EngineError::InvalidParameter { .. })
        ));
    }
}
