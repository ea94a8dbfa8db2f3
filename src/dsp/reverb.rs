//! Reverb effect — Schroeder-style algorithmic reverb.
//!
//! Eight parallel comb filters feed four series allpass diffusers. Comb
//! lengths are distinct primes so their resonances never line up.

/// Fixed-length circular line: read the oldest sample, then overwrite it.
#[derive(Debug, Clone)]
struct Line {
    samples: Vec<f32>,
    cursor: usize,
}

impl Line {
    fn new(len: usize) -> Self {
        Line {
            samples: vec![0.0; len.max(1)],
            cursor: 0,
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    fn cycle(&mut self, write: impl FnOnce(f32) -> f32) -> f32 {
        let oldest = self.samples[self.cursor];
        self.samples[self.cursor] = write(oldest);
        self.cursor += 1;
        if self.cursor == self.samples.len() {
            self.cursor = 0;
        }
        oldest
    }

    fn reset(&mut self) {
        self.samples.fill(0.0);
        self.cursor = 0;
    }
}

/// Feedback comb with a one-pole lowpass in the loop.
#[derive(Debug, Clone)]
struct Comb {
    line: Line,
    feedback: f32,
    /// Lowpass coefficient; 0 leaves the loop bright.
    damping: f32,
    lowpass: f32,
}

impl Comb {
    fn new(len: usize) -> Self {
        Comb {
            line: Line::new(len),
            feedback: 0.0,
            damping: 0.0,
            lowpass: 0.0,
        }
    }

    #[inline]
    fn tick(&mut self, input: f32) -> f32 {
        let (feedback, damping, lowpass) = (self.feedback, self.damping, &mut self.lowpass);
        self.line.cycle(|oldest| {
            *lowpass = oldest + damping * (*lowpass - oldest);
            input + feedback * *lowpass
        })
    }

    fn retune(&mut self, feedback: f32, damping: f32) {
        self.feedback = feedback;
        self.damping = damping;
    }

    fn reset(&mut self) {
        self.line.reset();
        self.lowpass = 0.0;
    }
}

/// Schroeder allpass diffuser with a fixed gain of one half.
#[derive(Debug, Clone)]
struct Diffuser {
    line: Line,
}

impl Diffuser {
    const GAIN: f32 = 0.5;

    #[inline]
    fn tick(&mut self, input: f32) -> f32 {
        self.line.cycle(|oldest| input + Self::GAIN * oldest) - input
    }
}

// Tuning at 44.1 kHz; scaled and snapped to primes at construction.
const COMB_TUNING: [usize; 8] = [1116, 1188, 1277, 1356, 1422, 1491, 1557, 1617];
const ALLPASS_TUNING: [usize; 4] = [556, 441, 341, 225];
const INPUT_GAIN: f32 = 0.015;
const ROOM_SCALE: f32 = 0.28;
const ROOM_OFFSET: f32 = 0.7;

/// A mono comb-bank reverb blended with the dry signal by `mix`.
#[derive(Debug, Clone)]
pub struct Reverb {
    combs: Vec<Comb>,
    diffusers: Vec<Diffuser>,
    room_size: f32,
    damping: f32,
    mix: f32,
}

impl Reverb {
    pub fn new(sample_rate: f64) -> Self {
        let scale = sample_rate / 44100.0;

        let mut last = 1;
        let combs = COMB_TUNING
            .iter()
            .map(|&t| {
                // Strictly increasing primes, so all lengths are mutually prime.
                let size = next_prime((((t as f64) * scale) as usize).max(last + 1));
                last = size;
                Comb::new(size)
            })
            .collect();

        let diffusers = ALLPASS_TUNING
            .iter()
            .map(|&t| Diffuser {
                line: Line::new(((t as f64) * scale) as usize),
            })
            .collect();

        let mut reverb = Self {
            combs,
            diffusers,
            room_size: 0.5,
            damping: 0.5,
            mix: 0.0,
        };
        reverb.update_parameters();
        reverb
    }

    /// Set room size, damping and mix (each clamped to `[0, 1]`).
    pub fn set_params(&mut self, room_size: f32, damping: f32, mix: f32) {
        let room_size = room_size.clamp(0.0, 1.0);
        let damping = damping.clamp(0.0, 1.0);
        self.mix = mix.clamp(0.0, 1.0);
        if room_size != self.room_size || damping != self.damping {
            self.room_size = room_size;
            self.damping = damping;
            self.update_parameters();
        }
    }

    fn update_parameters(&mut self) {
        let feedback = self.room_size * ROOM_SCALE + ROOM_OFFSET;
        for comb in &mut self.combs {
            comb.retune(feedback, self.damping);
        }
    }

    /// Comb lengths in samples, in bank order.
    pub fn comb_lengths(&self) -> Vec<usize> {
        self.combs.iter().map(|c| c.line.len()).collect()
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let scaled = input * INPUT_GAIN;

        let mut wet = 0.0f32;
        for comb in &mut self.combs {
            wet += comb.tick(scaled);
        }
        for diffuser in &mut self.diffusers {
            wet = diffuser.tick(wet);
        }

        input * (1.0 - self.mix) + wet * self.mix
    }

    /// Process a block in place.
    pub fn process_block(&mut self, block: &mut [f32]) {
        for s in block.iter_mut() {
            *s = self.process(*s);
        }
    }

    pub fn clear(&mut self) {
        for comb in &mut self.combs {
            comb.reset();
        }
        for diffuser in &mut self.diffusers {
            diffuser.line.reset();
        }
    }
}

fn next_prime(mut n: usize) -> usize {
    if n <= 2 {
        return 2;
    }
    if n % 2 == 0 {
        n += 1;
    }
    while !is_prime(n) {
        n += 2;
    }
    n
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}
