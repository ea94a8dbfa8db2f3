pub mod command;
pub mod config;
pub mod control;
pub mod dsp;
pub mod error;
pub mod metrics;
#[cfg(feature = "playback")]
pub mod playback;
pub mod preset;
pub mod recorder;

pub use crate::config::{EngineConfig, RecordingConfig};
pub use crate::control::{EngineController, EngineEvent, HostRequest, HostResponse, TrackInfo};
pub use crate::dsp::effects::EffectParameters;
pub use crate::dsp::engine::AudioRenderer;
pub use crate::dsp::oscillator::Waveform;
pub use crate::dsp::spectrum::SpectrumSnapshot;
pub use crate::dsp::timeline::{Clip, Timeline};
pub use crate::dsp::track::{InputFeed, SourceSpec, TrackId};
pub use crate::error::EngineError;
pub use crate::preset::VoicePreset;
pub use crate::recorder::{RecordedAsset, RecorderState, RecordingTicket};

use wasm_bindgen::prelude::*;

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// WASM-exposed: return the wavecrafter-core version string.
#[wasm_bindgen]
pub fn core_version() -> String {
    VERSION.to_string()
}

/// Build an engine from a configuration.
pub fn init(config: EngineConfig) -> Result<(EngineController, AudioRenderer), EngineError> {
    EngineController::init(config)
}

fn js_err(e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&format!("{e}"))
}

fn parse_track(id: &str) -> Result<TrackId, JsValue> {
    id.parse::<TrackId>().map_err(js_err)
}

/// WASM-exposed engine for AudioWorklet hosts.
///
/// Control and render share one object here because the worklet drives both
/// from the same thread; `process` is the render callback.
#[wasm_bindgen]
pub struct WasmSynth {
    controller: EngineController,
    renderer: AudioRenderer,
}

#[wasm_bindgen]
impl WasmSynth {
    /// `config` is a (possibly partial) `EngineConfig` object, or undefined.
    #[wasm_bindgen(constructor)]
    pub fn new(config: JsValue) -> Result<WasmSynth, JsValue> {
        let config: EngineConfig = if config.is_undefined() || config.is_null() {
            EngineConfig::default()
        } else {
            serde_wasm_bindgen::from_value(config).map_err(js_err)?
        };
        let (controller, renderer) = EngineController::init(config).map_err(js_err)?;
        Ok(WasmSynth { controller, renderer })
    }

    pub fn start(&mut self, frequency: f32, waveform: &str) -> Result<(), JsValue> {
        let waveform: Waveform = waveform.parse().map_err(js_err)?;
        self.controller.request_start(frequency, waveform).map_err(js_err)
    }

    pub fn stop(&mut self) -> Result<(), JsValue> {
        self.controller.request_stop().map_err(js_err)
    }

    #[wasm_bindgen(js_name = setFrequency)]
    pub fn set_frequency(&mut self, frequency: f32) -> Result<(), JsValue> {
        self.controller.request_set_frequency(frequency).map_err(js_err)
    }

    #[wasm_bindgen(js_name = setWaveform)]
    pub fn set_waveform(&mut self, waveform: &str) -> Result<(), JsValue> {
        let waveform: Waveform = waveform.parse().map_err(js_err)?;
        self.controller.request_set_waveform(waveform).map_err(js_err)
    }

    /// Returns the new id as `track-N`.
    #[wasm_bindgen(js_name = addTrack)]
    pub fn add_track(&mut self) -> Result<String, JsValue> {
        self.controller
            .request_add_track()
            .map(|id| id.to_string())
            .map_err(js_err)
    }

    #[wasm_bindgen(js_name = removeTrack)]
    pub fn remove_track(&mut self, id: &str) -> Result<(), JsValue> {
        let id = parse_track(id)?;
        self.controller.request_remove_track(id).map_err(js_err)
    }

    #[wasm_bindgen(js_name = setTrackVolume)]
    pub fn set_track_volume(&mut self, id: &str, volume: f32) -> Result<(), JsValue> {
        let id = parse_track(id)?;
        self.controller.request_set_track_volume(id, volume).map_err(js_err)
    }

    #[wasm_bindgen(js_name = muteTrack)]
    pub fn mute_track(&mut self, id: &str, muted: bool) -> Result<(), JsValue> {
        let id = parse_track(id)?;
        self.controller.request_mute_track(id, muted).map_err(js_err)
    }

    #[wasm_bindgen(js_name = setEffect)]
    pub fn set_effect(&mut self, name: &str, value: f32) -> Result<(), JsValue> {
        self.controller.request_set_effect(name, value).map_err(js_err)
    }

    #[wasm_bindgen(js_name = setMasterGain)]
    pub fn set_master_gain(&mut self, gain: f32) -> Result<(), JsValue> {
        self.controller.request_set_master_gain(gain).map_err(js_err)
    }

    #[wasm_bindgen(js_name = startRecording)]
    pub fn start_recording(&mut self) -> Result<f64, JsValue> {
        self.controller
            .request_start_recording()
            .map(|session| session as f64)
            .map_err(js_err)
    }

    #[wasm_bindgen(js_name = stopRecording)]
    pub fn stop_recording(&mut self) -> Result<f64, JsValue> {
        self.controller
            .request_stop_recording()
            .map(|ticket| ticket.session as f64)
            .map_err(js_err)
    }

    /// Encoded bytes of the oldest finished recording, if any.
    #[wasm_bindgen(js_name = takeRecording)]
    pub fn take_recording(&mut self) -> Option<Vec<u8>> {
        self.controller.take_recording().map(|asset| asset.bytes)
    }

    #[wasm_bindgen(js_name = retryExport)]
    pub fn retry_export(&mut self) -> Result<JsValue, JsValue> {
        let event = self.controller.retry_export().map_err(js_err)?;
        serde_wasm_bindgen::to_value(&event).map_err(js_err)
    }

    #[wasm_bindgen(js_name = discardRecording)]
    pub fn discard_recording(&mut self) -> Result<(), JsValue> {
        self.controller.discard_recording().map_err(js_err)
    }

    /// `timeline` is `{ clips: [{ start_time, duration, frequency, amplitude?, waveform? }] }`.
    #[wasm_bindgen(js_name = setTrackTimeline)]
    pub fn set_track_timeline(&mut self, id: &str, timeline: JsValue) -> Result<(), JsValue> {
        let id = parse_track(id)?;
        let timeline = serde_wasm_bindgen::from_value(timeline).map_err(js_err)?;
        self.controller.request_set_track_timeline(id, timeline).map_err(js_err)
    }

    /// Preset JSON for the playing voice.
    #[wasm_bindgen(js_name = savePreset)]
    pub fn save_preset(&self, name: Option<String>) -> Result<String, JsValue> {
        self.controller.save_preset(name.as_deref()).map_err(js_err)
    }

    #[wasm_bindgen(js_name = loadPreset)]
    pub fn load_preset(&mut self, preset: &str) -> Result<(), JsValue> {
        self.controller.request_load_preset(preset).map(|_| ()).map_err(js_err)
    }

    /// Render callback: fill a mono output buffer.
    pub fn process(&mut self, out: &mut [f32]) {
        self.renderer.render(out);
    }

    #[wasm_bindgen(js_name = processInterleaved)]
    pub fn process_interleaved(&mut self, out: &mut [f32], channels: usize) {
        self.renderer.render_interleaved(out, channels);
    }

    /// Drain pending events as an array of tagged objects.
    pub fn poll(&mut self) -> Result<JsValue, JsValue> {
        let events = self.controller.poll();
        serde_wasm_bindgen::to_value(&events).map_err(js_err)
    }

    /// Normalized magnitudes of the newest analysis window.
    pub fn spectrum(&mut self) -> Result<Vec<f32>, JsValue> {
        self.controller
            .spectrum_snapshot()
            .map(|snap| snap.magnitudes)
            .map_err(js_err)
    }

    pub fn metrics(&self) -> Result<JsValue, JsValue> {
        serde_wasm_bindgen::to_value(&self.controller.metrics()).map_err(js_err)
    }

    /// Run a JSON `HostRequest` and return the JSON response.
    pub fn dispatch(&mut self, request: &str) -> Result<String, JsValue> {
        self.controller.dispatch_json(request).map_err(js_err)
    }

    pub fn shutdown(&mut self) -> Result<(), JsValue> {
        self.controller.shutdown().map_err(js_err)
    }
}
