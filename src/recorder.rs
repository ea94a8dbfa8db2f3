//! Recorder — captures the mixed output and finalizes it into an asset.
//!
//! The render side owns a [`CaptureTap`] that pushes every block into a
//! sample ring. The control side owns the [`Recorder`] state machine, which
//! drains the ring into a [`RecordingBuffer`] and encodes it once the render
//! side has sealed the session and every sealed sample has arrived.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{error, info};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::Serialize;

use crate::dsp::renderer::{AssetEncoder, PcmFormat};
use crate::error::EngineError;

const UNSEALED: u64 = u64::MAX;
const DRAIN_CHUNK: usize = 4096;

#[derive(Debug)]
struct CaptureShared {
    /// Sample count of the current session once sealed, `UNSEALED` before.
    sealed_at: AtomicU64,
}

/// Build the two ends of a capture path.
pub fn capture_channel(
    ring_samples: usize,
    backlog_samples: usize,
    format: PcmFormat,
    encoder: Box<dyn AssetEncoder>,
) -> (CaptureTap, Recorder) {
    let (producer, consumer) = HeapRb::<f32>::new(ring_samples.max(1)).split();
    let shared = Arc::new(CaptureShared {
        sealed_at: AtomicU64::new(UNSEALED),
    });
    let tap = CaptureTap {
        producer,
        backlog: Vec::with_capacity(backlog_samples),
        active: false,
        captured: 0,
        shared: Arc::clone(&shared),
    };
    let recorder = Recorder {
        state: RecorderState::Idle,
        consumer,
        shared,
        buffer: RecordingBuffer::default(),
        session: 0,
        drained: 0,
        format,
        encoder,
        discard_when_sealed: false,
        scratch: vec![0.0; DRAIN_CHUNK],
    };
    (tap, recorder)
}

/// Render-side end of the capture path.
pub struct CaptureTap {
    producer: HeapProd<f32>,
    /// Samples that did not fit in the ring, oldest first.
    backlog: Vec<f32>,
    active: bool,
    captured: u64,
    shared: Arc<CaptureShared>,
}

impl CaptureTap {
    pub(crate) fn begin(&mut self) {
        self.active = true;
        self.captured = 0;
    }

    pub(crate) fn seal(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.shared.sealed_at.store(self.captured, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Capture one block. Call once per block even when inactive so the
    /// backlog keeps draining.
    ///
    /// Returns `true` when the backlog had to grow past its reserved size.
    pub(crate) fn capture(&mut self, block: &[f32]) -> bool {
        self.flush_backlog();
        if !self.active {
            return false;
        }
        self.captured += block.len() as u64;

        // Ordering: nothing may overtake samples still waiting in the backlog.
        let pushed = if self.backlog.is_empty() {
            self.producer.push_slice(block)
        } else {
            0
        };
        let rest = &block[pushed..];
        if rest.is_empty() {
            return false;
        }
        let widened = self.backlog.len() + rest.len() > self.backlog.capacity();
        self.backlog.extend_from_slice(rest);
        widened
    }

    fn flush_backlog(&mut self) {
        if self.backlog.is_empty() {
            return;
        }
        let n = self.producer.push_slice(&self.backlog);
        self.backlog.drain(..n);
    }
}

/// Where the recorder is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    Idle,
    Recording,
    /// Sealed or waiting to be sealed; the asset has not been handed off yet.
    Stopped,
}

/// Returned by a successful stop. The asset itself arrives later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordingTicket {
    pub session: u64,
}

/// Append-only capture of one session. Read-only once sealed.
#[derive(Debug, Clone, Default)]
pub struct RecordingBuffer {
    samples: Vec<f32>,
    sealed: bool,
}

impl RecordingBuffer {
    fn append(&mut self, samples: &[f32]) {
        if !self.sealed {
            self.samples.extend_from_slice(samples);
        }
    }

    fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }
}

/// A finished recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAsset {
    pub session: u64,
    pub format: PcmFormat,
    pub mime_type: &'static str,
    /// Mono samples in capture order.
    pub samples: Vec<f32>,
    /// The encoded file.
    pub bytes: Vec<u8>,
}

impl RecordedAsset {
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.format.sample_rate as f64
    }
}

/// Outcome of driving the recorder.
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    Finalized(RecordedAsset),
    /// Encoding failed. The capture is kept; retry or discard it.
    Failed { session: u64, error: EngineError },
    Discarded { session: u64 },
}

/// Control-side recording state machine.
pub struct Recorder {
    state: RecorderState,
    consumer: HeapCons<f32>,
    shared: Arc<CaptureShared>,
    buffer: RecordingBuffer,
    session: u64,
    drained: u64,
    format: PcmFormat,
    encoder: Box<dyn AssetEncoder>,
    discard_when_sealed: bool,
    scratch: Vec<f32>,
}

impl Recorder {
    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    pub fn buffer(&self) -> &RecordingBuffer {
        &self.buffer
    }

    pub fn set_encoder(&mut self, encoder: Box<dyn AssetEncoder>) {
        self.encoder = encoder;
    }

    pub(crate) fn check_can_start(&self) -> Result<(), EngineError> {
        match self.state {
            RecorderState::Idle => Ok(()),
            RecorderState::Recording => Err(EngineError::state("already recording")),
            RecorderState::Stopped => Err(EngineError::state("previous recording not handed off yet")),
        }
    }

    /// Open a new session. The caller must then tell the tap to begin.
    pub(crate) fn begin(&mut self) -> u64 {
        self.session += 1;
        self.buffer = RecordingBuffer::default();
        self.drained = 0;
        self.discard_when_sealed = false;
        self.shared.sealed_at.store(UNSEALED, Ordering::Release);
        self.state = RecorderState::Recording;
        info!("recording session {} started", self.session);
        self.session
    }

    pub(crate) fn check_can_stop(&self) -> Result<(), EngineError> {
        match self.state {
            RecorderState::Recording => Ok(()),
            _ => Err(EngineError::state("not recording")),
        }
    }

    /// Mark the session stopped. The caller must then tell the tap to seal.
    pub(crate) fn stop(&mut self) -> RecordingTicket {
        self.state = RecorderState::Stopped;
        info!("recording session {} stopping", self.session);
        RecordingTicket {
            session: self.session,
        }
    }

    /// Drain captured samples and finalize once the session is complete.
    pub fn pump(&mut self) -> Option<RecorderEvent> {
        loop {
            let n = self.consumer.pop_slice(&mut self.scratch);
            if n == 0 {
                break;
            }
            self.drained += n as u64;
            self.buffer.append(&self.scratch[..n]);
        }

        if self.state != RecorderState::Stopped || self.buffer.is_sealed() {
            return None;
        }
        let sealed_at = self.shared.sealed_at.load(Ordering::Acquire);
        if sealed_at == UNSEALED || self.drained < sealed_at {
            return None;
        }

        self.buffer.seal();
        if self.discard_when_sealed {
            return Some(self.reset_discarded());
        }
        Some(self.export())
    }

    /// Encode the sealed buffer again after a failure.
    pub fn retry_export(&mut self) -> Result<RecorderEvent, EngineError> {
        if self.state != RecorderState::Stopped || !self.buffer.is_sealed() {
            return Err(EngineError::state("no sealed recording to export"));
        }
        Ok(self.export())
    }

    /// Drop the stopped session. If it is still being drained, it is dropped
    /// as soon as the last sample arrives.
    pub fn discard(&mut self) -> Result<Option<RecorderEvent>, EngineError> {
        match self.state {
            RecorderState::Stopped if self.buffer.is_sealed() => Ok(Some(self.reset_discarded())),
            RecorderState::Stopped => {
                self.discard_when_sealed = true;
                Ok(None)
            }
            RecorderState::Recording => Err(EngineError::state("stop the recording before discarding it")),
            RecorderState::Idle => Err(EngineError::state("nothing to discard")),
        }
    }

    fn reset_discarded(&mut self) -> RecorderEvent {
        self.buffer = RecordingBuffer::default();
        self.state = RecorderState::Idle;
        info!("recording session {} discarded", self.session);
        RecorderEvent::Discarded {
            session: self.session,
        }
    }

    fn export(&mut self) -> RecorderEvent {
        match self.encoder.encode(self.buffer.samples(), &self.format) {
            Ok(bytes) => {
                let buffer = std::mem::take(&mut self.buffer);
                self.state = RecorderState::Idle;
                info!(
                    "recording session {} finalized: {} samples, {} bytes",
                    self.session,
                    buffer.len(),
                    bytes.len()
                );
                RecorderEvent::Finalized(RecordedAsset {
                    session: self.session,
                    format: self.format,
                    mime_type: self.encoder.mime_type(),
                    samples: buffer.samples,
                    bytes,
                })
            }
            Err(e) => {
                error!("recording session {} failed to encode: {e}", self.session);
                RecorderEvent::Failed {
                    session: self.session,
                    error: e,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::renderer::WavEncoder;
    use std::sync::atomic::AtomicBool;

    const FORMAT: PcmFormat = PcmFormat {
        sample_rate: 8000,
        channels: 1,
        bits_per_sample: 32,
    };

    fn pair(ring: usize, backlog: usize) -> (CaptureTap, Recorder) {
        capture_channel(ring, backlog, FORMAT, Box::new(WavEncoder))
    }

    fn block(index: usize, len: usize) -> Vec<f32> {
        (0..len).map(|i| (index * 1000 + i) as f32 * 1e-6).collect()
    }

    fn record(tap: &mut CaptureTap, recorder: &mut Recorder, blocks: usize, len: usize) -> RecordedAsset {
        recorder.check_can_start().unwrap();
        recorder.begin();
        tap.begin();
        for b in 0..blocks {
            tap.capture(&block(b, len));
            recorder.pump();
        }
        recorder.check_can_stop().unwrap();
        recorder.stop();
        tap.seal();
        // Keep the render side ticking until the backlog is gone.
        for _ in 0..1000 {
            if let Some(event) = recorder.pump() {
                match event {
                    RecorderEvent::Finalized(asset) => return asset,
                    other => panic!("unexpected {other:?}"),
                }
            }
            tap.capture(&[9.0; 4]);
        }
        panic!("recording never finalized");
    }

    fn expected(blocks: usize, len: usize) -> Vec<f32> {
        (0..blocks).flat_map(|b| block(b, len)).collect()
    }

    #[test]
    fn round_trip_zero_one_and_many_blocks() {
        for blocks in [0, 1, 37] {
            let (mut tap, mut recorder) = pair(4096, 1024);
            let asset = record(&mut tap, &mut recorder, blocks, 128);
            assert_eq!(asset.samples, expected(blocks, 128), "{blocks} blocks");
            assert_eq!(recorder.state(), RecorderState::Idle);
            assert_eq!(&asset.bytes[0..4], b"RIFF");
        }
    }

    #[test]
    fn backlog_preserves_order_when_ring_is_small() {
        let (mut tap, mut recorder) = pair(100, 64);
        recorder.begin();
        tap.begin();
        let mut widened = false;
        // No pumping while capturing: the ring overflows into the backlog.
        for b in 0..20 {
            widened |= tap.capture(&block(b, 50));
        }
        assert!(widened, "backlog should have grown past its reservation");
        recorder.stop();
        tap.seal();

        let mut asset = None;
        for _ in 0..100 {
            if let Some(RecorderEvent::Finalized(a)) = recorder.pump() {
                asset = Some(a);
                break;
            }
            tap.capture(&[]);
        }
        assert_eq!(asset.unwrap().samples, expected(20, 50));
    }

    #[test]
    fn stop_while_idle_is_invalid() {
        let (_tap, recorder) = pair(64, 0);
        assert!(matches!(recorder.check_can_stop(), Err(EngineError::InvalidState(_))));
    }

    #[test]
    fn start_twice_is_invalid() {
        let (_tap, mut recorder) = pair(64, 0);
        recorder.begin();
        assert!(matches!(recorder.check_can_start(), Err(EngineError::InvalidState(_))));
    }

    #[test]
    fn sessions_are_independent() {
        let (mut tap, mut recorder) = pair(4096, 0);
        let first = record(&mut tap, &mut recorder, 2, 16);
        let second = record(&mut tap, &mut recorder, 3, 16);
        assert_eq!(first.session, 1);
        assert_eq!(second.session, 2);
        assert_eq!(second.samples, expected(3, 16));
    }

    struct FlakyEncoder {
        fail: Arc<AtomicBool>,
    }

    impl AssetEncoder for FlakyEncoder {
        fn encode(&self, samples: &[f32], format: &PcmFormat) -> Result<Vec<u8>, EngineError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::EncodingFailure("disk full".into()));
            }
            WavEncoder.encode(samples, format)
        }
    }

    #[test]
    fn failed_export_keeps_capture_for_retry() {
        let fail = Arc::new(AtomicBool::new(true));
        let (mut tap, mut recorder) = capture_channel(
            4096,
            0,
            FORMAT,
            Box::new(FlakyEncoder {
                fail: Arc::clone(&fail),
            }),
        );
        recorder.begin();
        tap.begin();
        tap.capture(&block(0, 32));
        recorder.stop();
        tap.seal();

        let event = recorder.pump().unwrap();
        assert!(matches!(
            event,
            RecorderEvent::Failed {
                error: EngineError::EncodingFailure(_),
                ..
            }
        ));
        assert_eq!(recorder.state(), RecorderState::Stopped);
        assert_eq!(recorder.buffer().samples(), &expected(1, 32)[..]);
        assert!(recorder.check_can_start().is_err());

        fail.store(false, Ordering::SeqCst);
        match recorder.retry_export().unwrap() {
            RecorderEvent::Finalized(asset) => assert_eq!(asset.samples, expected(1, 32)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(recorder.state(), RecorderState::Idle);
    }

    #[test]
    fn discard_before_drain_completes() {
        let (mut tap, mut recorder) = pair(4096, 0);
        recorder.begin();
        tap.begin();
        tap.capture(&block(0, 64));
        recorder.stop();
        assert_eq!(recorder.discard().unwrap(), None);
        tap.seal();
        assert_eq!(recorder.pump(), Some(RecorderEvent::Discarded { session: 1 }));
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert!(recorder.discard().is_err());
    }

    #[test]
    fn retry_requires_sealed_capture() {
        let (_tap, mut recorder) = pair(64, 0);
        assert!(recorder.retry_export().is_err());
    }
}
