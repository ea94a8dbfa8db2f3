//! Playback on the host's default output device.
//!
//! No enumeration: the default device is opened at the engine's sample rate
//! and the renderer is moved into its callback.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use log::{error, info};

use crate::dsp::engine::AudioRenderer;
use crate::error::EngineError;

const FRAMES_PER_CHUNK: usize = 1024;

/// A running output stream. Dropping it stops playback.
pub struct Playback {
    _stream: cpal::Stream,
    pub channels: u16,
    pub sample_rate: u32,
}

fn stream_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Stream(e.to_string())
}

/// Open the default output device and start rendering into it.
pub fn start(renderer: AudioRenderer, sample_rate: u32) -> Result<Playback, EngineError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| EngineError::Stream("no output device available".into()))?;
    let supported = device.default_output_config().map_err(stream_err)?;
    let sample_format = supported.sample_format();
    let mut config: cpal::StreamConfig = supported.into();
    config.sample_rate = cpal::SampleRate(sample_rate);

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build::<f32>(&device, &config, renderer)?,
        cpal::SampleFormat::I16 => build::<i16>(&device, &config, renderer)?,
        cpal::SampleFormat::U16 => build::<u16>(&device, &config, renderer)?,
        other => return Err(EngineError::Stream(format!("unsupported sample format {other:?}"))),
    };
    stream.play().map_err(stream_err)?;

    info!(
        "playback started: {} channels at {} Hz ({sample_format:?})",
        config.channels, sample_rate
    );
    Ok(Playback {
        _stream: stream,
        channels: config.channels,
        sample_rate,
    })
}

fn build<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut renderer: AudioRenderer,
) -> Result<cpal::Stream, EngineError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut mix = vec![0.0f32; FRAMES_PER_CHUNK * channels];

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for chunk in data.chunks_mut(mix.len()) {
                    let mix = &mut mix[..chunk.len()];
                    renderer.render_interleaved(mix, channels);
                    for (out, &s) in chunk.iter_mut().zip(mix.iter()) {
                        *out = T::from_sample(s);
                    }
                }
            },
            |err| error!("output stream error: {err}"),
            None,
        )
        .map_err(stream_err)
}
