//! DSP — real-time synthesis, effects, mixing and analysis.
//!
//! The same code serves the native playback path (cpal) and the browser
//! (AudioWorklet + WASM). Everything under here that runs per block is
//! allocation-free once constructed.

pub mod delay;
pub mod effects;
pub mod engine;
pub mod mixer;
pub mod oscillator;
pub mod renderer;
pub mod reverb;
pub mod spectrum;
pub mod timeline;
pub mod track;
