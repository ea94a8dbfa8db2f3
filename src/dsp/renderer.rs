//! WAV renderer — encodes captured mono samples into an exportable asset.

use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Sample layout of an exported asset. Fixed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// 16 for integer PCM, 32 for float.
    pub bits_per_sample: u16,
}

impl PcmFormat {
    fn spec(&self) -> Result<hound::WavSpec, EngineError> {
        let sample_format = match self.bits_per_sample {
            16 => hound::SampleFormat::Int,
            32 => hound::SampleFormat::Float,
            other => {
                return Err(EngineError::EncodingFailure(format!(
                    "unsupported bit depth {other}"
                )));
            }
        };
        Ok(hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: self.bits_per_sample,
            sample_format,
        })
    }
}

/// Turns a finished capture into bytes.
///
/// The engine calls this on the control thread; implementations may be slow
/// but must not touch the filesystem.
pub trait AssetEncoder: Send {
    fn encode(&self, samples: &[f32], format: &PcmFormat) -> Result<Vec<u8>, EngineError>;

    /// MIME type of the encoded bytes.
    fn mime_type(&self) -> &'static str {
        "audio/wav"
    }
}

/// RIFF/WAVE PCM encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct WavEncoder;

impl AssetEncoder for WavEncoder {
    fn encode(&self, samples: &[f32], format: &PcmFormat) -> Result<Vec<u8>, EngineError> {
        encode_wav(samples, format)
    }
}

/// Encode mono samples as WAV, duplicating each sample across all channels.
pub fn encode_wav(samples: &[f32], format: &PcmFormat) -> Result<Vec<u8>, EngineError> {
    let spec = format.spec()?;
    let data_len = samples.len() * format.channels as usize * (format.bits_per_sample as usize / 8);
    let mut cursor = Cursor::new(Vec::with_capacity(44 + data_len));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            let s = if s.is_finite() { s } else { 0.0 };
            for _ in 0..format.channels {
                match spec.sample_format {
                    hound::SampleFormat::Int => {
                        writer.write_sample((s * 32767.0).round().clamp(-32768.0, 32767.0) as i16)?
                    }
                    hound::SampleFormat::Float => writer.write_sample(s)?,
                }
            }
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEREO_16: PcmFormat = PcmFormat {
        sample_rate: 44100,
        channels: 2,
        bits_per_sample: 16,
    };

    #[test]
    fn wav_header_valid() {
        let wav = encode_wav(&[0.0, 0.5, -0.5], &STEREO_16).unwrap();

        // Check RIFF header
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");

        // Check sample rate
        let sr = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        assert_eq!(sr, 44100);

        // Check channels
        let ch = u16::from_le_bytes([wav[22], wav[23]]);
        assert_eq!(ch, 2);
    }

    #[test]
    fn wav_size_correct() {
        let wav = encode_wav(&vec![0.25; 22050], &STEREO_16).unwrap();
        // 22050 samples * 2 channels * 2 bytes
        let reader = hound::WavReader::new(Cursor::new(&wav)).unwrap();
        assert_eq!(reader.len(), 44100);
        assert_eq!(reader.duration(), 22050);
    }

    #[test]
    fn int_samples_round_trip_through_reader() {
        let wav = encode_wav(&[1.0, -1.0, 0.5, 2.0], &STEREO_16).unwrap();
        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![32767, 32767, -32767, -32767, 16384, 16384, 32767, 32767]);
    }

    #[test]
    fn float_format_keeps_values() {
        let format = PcmFormat {
            sample_rate: 48000,
            channels: 1,
            bits_per_sample: 32,
        };
        let wav = WavEncoder.encode(&[0.125, -0.75], &format).unwrap();
        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_format, hound::SampleFormat::Float);
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0.125, -0.75]);
    }

    #[test]
    fn empty_capture_is_a_valid_file() {
        let wav = encode_wav(&[], &STEREO_16).unwrap();
        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.len(), 0);
    }

    #[test]
    fn rejects_unsupported_depth() {
        let format = PcmFormat {
            bits_per_sample: 24,
            ..STEREO_16
        };
        assert!(matches!(encode_wav(&[0.0], &format), Err(EngineError::EncodingFailure(_))));
    }
}
