//! Track — one source, an effects chain, and a gain stage.

use std::fmt;
use std::str::FromStr;

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::{HeapCons, HeapProd};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::EngineError;

use super::effects::{EffectParameters, EffectsChain};
use super::oscillator::{Oscillator, Waveform};
use super::timeline::ClipPlayer;

/// Stable track identifier. Id 0 is the lead track that carries the voice.
///
/// Serialized as `track-N`; a bare number or `"N"` is also read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u32);

impl TrackId {
    pub const LEAD: TrackId = TrackId(0);
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track-{}", self.0)
    }
}

impl FromStr for TrackId {
    type Err = EngineError;

    /// Accepts `track-3` or a bare `3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("track-").unwrap_or(s);
        digits
            .parse::<u32>()
            .map(TrackId)
            .map_err(|_| EngineError::param("track_id", s, "expected `track-N`"))
    }
}

impl Serialize for TrackId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TrackId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u32),
            Text(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(TrackId(n)),
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// What a track plays, as requested by the host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceSpec {
    Silence,
    Oscillator { frequency: f32, waveform: Waveform },
}

/// The render-side source of a track.
pub enum TrackSource {
    Silent,
    Oscillator(Oscillator),
    /// Samples pushed by the host through an [`InputFeed`]. Missing samples
    /// read as silence.
    Input(HeapCons<f32>),
    /// Scheduled clips; silent once the last one ends.
    Timeline(ClipPlayer),
}

impl TrackSource {
    pub fn from_spec(spec: SourceSpec, sample_rate: f64) -> Result<Self, EngineError> {
        match spec {
            SourceSpec::Silence => Ok(TrackSource::Silent),
            SourceSpec::Oscillator { frequency, waveform } => {
                Ok(TrackSource::Oscillator(Oscillator::new(frequency, waveform, sample_rate)?))
            }
        }
    }

    fn render(&mut self, out: &mut [f32]) {
        match self {
            TrackSource::Silent => out.fill(0.0),
            TrackSource::Oscillator(osc) => osc.render_block(out),
            TrackSource::Input(cons) => {
                let read = cons.pop_slice(out);
                out[read..].fill(0.0);
            }
            TrackSource::Timeline(player) => player.render(out),
        }
    }
}

impl fmt::Debug for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackSource::Silent => f.write_str("Silent"),
            TrackSource::Oscillator(osc) => f.debug_tuple("Oscillator").field(osc).finish(),
            TrackSource::Input(cons) => f
                .debug_struct("Input")
                .field("buffered", &cons.occupied_len())
                .finish(),
            TrackSource::Timeline(player) => f.debug_tuple("Timeline").field(player).finish(),
        }
    }
}

/// Host end of an input track.
pub struct InputFeed {
    track: TrackId,
    producer: HeapProd<f32>,
}

impl InputFeed {
    pub(crate) fn new(track: TrackId, producer: HeapProd<f32>) -> Self {
        Self { track, producer }
    }

    pub fn track(&self) -> TrackId {
        self.track
    }

    /// Queue samples for the track. Returns how many fit; the rest are dropped.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        self.producer.push_slice(samples)
    }

    /// Free space in samples.
    pub fn capacity_left(&self) -> usize {
        self.producer.vacant_len()
    }
}

impl fmt::Debug for InputFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputFeed")
            .field("track", &self.track)
            .field("vacant", &self.producer.vacant_len())
            .finish()
    }
}

/// A mixer channel. Owned by the render thread once added.
#[derive(Debug)]
pub struct Track {
    id: TrackId,
    source: TrackSource,
    volume: f32,
    muted: bool,
    effects: EffectsChain,
}

impl Track {
    pub fn new(id: TrackId, source: TrackSource, volume: f32, effects: EffectsChain) -> Self {
        Self {
            id,
            source,
            volume: volume.clamp(0.0, 1.0),
            muted: false,
            effects,
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn oscillator_mut(&mut self) -> Option<&mut Oscillator> {
        match &mut self.source {
            TrackSource::Oscillator(osc) => Some(osc),
            _ => None,
        }
    }

    /// Swap in a new source, handing back the old one.
    pub fn replace_source(&mut self, source: TrackSource) -> TrackSource {
        std::mem::replace(&mut self.source, source)
    }

    /// Render one block: source, then effects, then volume.
    ///
    /// A muted track still advances its source and effect state so that
    /// unmuting picks up where it would have been.
    pub fn render(&mut self, params: &EffectParameters, out: &mut [f32]) {
        self.source.render(out);
        self.effects.process_block(params, out);
        if out.iter().any(|s| !s.is_finite()) {
            // Don't let one bad block poison the feedback paths for good.
            self.effects.clear();
        }
        if self.muted {
            out.fill(0.0);
            return;
        }
        for s in out.iter_mut() {
            *s *= self.volume;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::HeapRb;
    use ringbuf::traits::Split;

    const SR: f64 = 48000.0;

    fn chain() -> EffectsChain {
        EffectsChain::new(SR, 100.0, EffectParameters::default())
    }

    fn osc_track(volume: f32) -> Track {
        let osc = Oscillator::new(440.0, Waveform::Sine, SR).unwrap();
        Track::new(TrackId(1), TrackSource::Oscillator(osc), volume, chain())
    }

    #[test]
    fn volume_scales_source() {
        let params = EffectParameters::default();
        let mut full = osc_track(1.0);
        let mut half = osc_track(0.5);
        let mut a = vec![0.0; 64];
        let mut b = vec![0.0; 64];
        full.render(&params, &mut a);
        half.render(&params, &mut b);
        for (x, y) in a.iter().zip(&b) {
            assert!((x * 0.5 - y).abs() < 1e-6);
        }
    }

    #[test]
    fn muted_track_outputs_zeros_and_keeps_phase() {
        let params = EffectParameters::default();
        let mut track = osc_track(1.0);
        track.set_muted(true);
        let mut out = vec![1.0; 32];
        track.render(&params, &mut out);
        assert!(out.iter().all(|&s| s == 0.0));

        let phase = track.oscillator_mut().unwrap().phase();
        assert!(phase > 0.0, "muted track should keep advancing");
    }

    #[test]
    fn input_underrun_reads_silence() {
        let (prod, cons) = HeapRb::<f32>::new(16).split();
        let mut feed = InputFeed::new(TrackId(2), prod);
        assert_eq!(feed.push(&[0.5, 0.5, 0.5]), 3);

        let mut track = Track::new(TrackId(2), TrackSource::Input(cons), 1.0, chain());
        let mut out = vec![9.0; 8];
        track.render(&EffectParameters::default(), &mut out);
        assert_eq!(&out[..3], &[0.5, 0.5, 0.5]);
        assert!(out[3..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn replace_source_returns_previous() {
        let mut track = osc_track(1.0);
        let old = track.replace_source(TrackSource::Silent);
        assert!(matches!(old, TrackSource::Oscillator(_)));
        assert!(track.oscillator_mut().is_none());
    }

    #[test]
    fn track_id_parsing() {
        assert_eq!("track-3".parse::<TrackId>().unwrap(), TrackId(3));
        assert_eq!("7".parse::<TrackId>().unwrap(), TrackId(7));
        assert!("lead".parse::<TrackId>().is_err());
        assert_eq!(TrackId(4).to_string(), "track-4");
    }

    #[test]
    fn track_id_json_uses_the_display_form() {
        assert_eq!(serde_json::to_string(&TrackId(4)).unwrap(), r#""track-4""#);
        assert_eq!(serde_json::from_str::<TrackId>(r#""track-4""#).unwrap(), TrackId(4));
        assert_eq!(serde_json::from_str::<TrackId>("4").unwrap(), TrackId(4));
        assert!(serde_json::from_str::<TrackId>(r#""lead""#).is_err());
    }

    #[test]
    fn source_spec_from_json() {
        let spec: SourceSpec =
            serde_json::from_str(r#"{ "type": "oscillator", "frequency": 220.0, "waveform": "square" }"#)
                .unwrap();
        let source = TrackSource::from_spec(spec, SR).unwrap();
        assert!(matches!(source, TrackSource::Oscillator(_)));
        assert!(
            TrackSource::from_spec(
                SourceSpec::Oscillator {
                    frequency: -1.0,
                    waveform: Waveform::Sine
                },
                SR
            )
            .is_err()
        );
    }
}
