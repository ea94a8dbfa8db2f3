//! Delay effect — a circular delay line with feedback.

/// A mono feedback delay.
///
/// The buffer is sized once for `max_delay_ms`; changing the delay time
/// afterwards never reallocates. Output is `dry + feedback × delayed`, so a
/// feedback of zero passes the input through untouched.
#[derive(Debug, Clone)]
pub struct Delay {
    buffer: Vec<f32>,
    write_pos: usize,
    sample_rate: f64,
    delay_samples: usize,
    feedback: f32,
}

impl Delay {
    pub fn new(sample_rate: f64, max_delay_ms: f32) -> Self {
        let buffer_size = (sample_rate * max_delay_ms as f64 / 1000.0) as usize + 1;
        Self {
            buffer: vec![0.0; buffer_size.max(2)],
            write_pos: 0,
            sample_rate,
            delay_samples: 1,
            feedback: 0.0,
        }
    }

    /// Update time and feedback. The time is clamped to what the buffer holds
    /// and to at least one sample; feedback is clamped below 1.
    pub fn set_params(&mut self, delay_time_ms: f32, feedback: f32) {
        let samples = (delay_time_ms.max(0.0) as f64 * self.sample_rate / 1000.0).round() as usize;
        self.delay_samples = samples.clamp(1, self.buffer.len() - 1);
        self.feedback = feedback.clamp(0.0, 0.999);
    }

    pub fn delay_samples(&self) -> usize {
        self.delay_samples
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let len = self.buffer.len();
        let read_pos = (self.write_pos + len - self.delay_samples) % len;
        let delayed = self.buffer[read_pos];

        let wet = delayed * self.feedback;
        self.buffer[self.write_pos] = input + wet;
        self.write_pos = (self.write_pos + 1) % len;

        input + wet
    }

    /// Process a block in place.
    pub fn process_block(&mut self, block: &mut [f32]) {
        if self.feedback == 0.0 {
            // Keep the line primed so raising feedback later has history.
            for &s in block.iter() {
                self.buffer[self.write_pos] = s;
                self.write_pos = (self.write_pos + 1) % self.buffer.len();
            }
            return;
        }
        for s in block.iter_mut() {
            *s = self.process(*s);
        }
    }

    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
    }
}
