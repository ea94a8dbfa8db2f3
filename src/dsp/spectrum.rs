//! FFT-based spectrum analyzer for visualization snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use serde::Serialize;

use crate::error::EngineError;

/// Per-bin magnitudes of one analysis window, normalized to `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectrumSnapshot {
    /// `fft_size / 2 + 1` values, DC first.
    pub magnitudes: Vec<f32>,
    pub sample_rate: u32,
    pub fft_size: usize,
}

impl SpectrumSnapshot {
    /// An all-zero snapshot, used before any audio has been analyzed.
    pub fn silent(fft_size: usize, sample_rate: u32) -> Self {
        Self {
            magnitudes: vec![0.0; fft_size / 2 + 1],
            sample_rate,
            fft_size,
        }
    }

    /// Centre frequency of `bin` in Hz.
    pub fn bin_frequency(&self, bin: usize) -> f32 {
        bin as f32 * self.sample_rate as f32 / self.fft_size as f32
    }

    /// Index of the loudest bin, or `None` for silence.
    pub fn peak_bin(&self) -> Option<usize> {
        let (index, &value) = self
            .magnitudes
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))?;
        (value > 0.0).then_some(index)
    }

    pub fn to_db(&self, floor_db: f32) -> Vec<f32> {
        self.magnitudes.iter().map(|&m| magnitude_to_db(m, floor_db)).collect()
    }
}

/// Linear magnitude to decibels, clamped at `floor_db`.
pub fn magnitude_to_db(magnitude: f32, floor_db: f32) -> f32 {
    if magnitude <= 0.0 {
        return floor_db;
    }
    (20.0 * magnitude.log10()).max(floor_db)
}

struct Plan {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl Plan {
    fn new(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let fft = planner.plan_fft_forward(size);
        // Hann window for smooth frequency response
        let window = (0..size)
            .map(|i| {
                let x = i as f32 / size as f32;
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * x).cos())
            })
            .collect();
        Self {
            input: fft.make_input_vec(),
            spectrum: fft.make_output_vec(),
            scratch: fft.make_scratch_vec(),
            window,
            fft,
        }
    }
}

/// Spectrum analyzer using a real FFT.
///
/// Plans are cached per size, so repeated calls with the same block length
/// only allocate the returned snapshot.
pub struct SpectrumAnalyzer {
    planner: RealFftPlanner<f32>,
    plans: HashMap<usize, Plan>,
    sample_rate: u32,
    max_fft_size: usize,
}

impl SpectrumAnalyzer {
    pub fn new(sample_rate: u32, max_fft_size: usize) -> Self {
        Self {
            planner: RealFftPlanner::new(),
            plans: HashMap::new(),
            sample_rate,
            max_fft_size: max_fft_size.next_power_of_two(),
        }
    }

    pub fn max_fft_size(&self) -> usize {
        self.max_fft_size
    }

    /// FFT length used for a block of `len` samples.
    pub fn fft_size_for(&self, len: usize) -> usize {
        len.next_power_of_two().min(self.max_fft_size)
    }

    /// Analyze one block.
    ///
    /// Blocks whose length is not a power of two are zero-padded; blocks
    /// longer than `max_fft_size` keep only their most recent samples.
    pub fn analyze(&mut self, block: &[f32]) -> Result<SpectrumSnapshot, EngineError> {
        if block.is_empty() {
            return Err(EngineError::InvalidBlockSize(0));
        }
        let size = self.fft_size_for(block.len());
        let recent = &block[block.len().saturating_sub(size)..];

        let planner = &mut self.planner;
        let plan = self.plans.entry(size).or_insert_with(|| Plan::new(planner, size));

        for (i, slot) in plan.input.iter_mut().enumerate() {
            *slot = recent.get(i).map_or(0.0, |&s| s * plan.window[i]);
        }
        plan.fft
            .process_with_scratch(&mut plan.input, &mut plan.spectrum, &mut plan.scratch)
            .map_err(|e| EngineError::state(format!("fft failed: {e}")))?;

        let mut magnitudes: Vec<f32> = plan.spectrum.iter().map(|c| c.norm()).collect();
        let peak = magnitudes.iter().copied().fold(0.0f32, f32::max);
        if peak > 0.0 && peak.is_finite() {
            for m in &mut magnitudes {
                *m /= peak;
            }
        } else {
            magnitudes.fill(0.0);
        }

        Ok(SpectrumSnapshot {
            magnitudes,
            sample_rate: self.sample_rate,
            fft_size: size,
        })
    }
}
