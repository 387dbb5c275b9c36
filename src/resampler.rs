/// Streaming linear-interpolation resampler for 16-bit mono PCM.
///
/// Unlike a one-shot resample, the read position and the last input sample
/// carry over between calls, so 20 ms chunks join without clicks and the
/// output length over a stream tracks `n * to / from` exactly.
///
/// Positions are kept as integers in units of `1 / to` input samples, so
/// long streams never drift.
#[derive(Debug, Clone)]
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    /// Next output position relative to the start of the next chunk.
    /// `-to_rate` means "at the carried-over previous sample".
    pos: i64,
    prev: Option<i16>,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Resampler {
            from_rate,
            to_rate,
            pos: 0,
            prev: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate
    }

    /// Resample one chunk, continuing from where the previous call stopped.
    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        if self.is_passthrough() {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let n = input.len() as i64;
        let to = self.to_rate as i64;
        let step = self.from_rate as i64;
        let prev = self.prev.unwrap_or(input[0]);
        let sample_at = |idx: i64| -> f64 {
            if idx < 0 { prev as f64 } else { input[idx as usize] as f64 }
        };

        let mut out = Vec::with_capacity(((n * to) / step + 2) as usize);

        // Stop before the last input sample: interpolating past it needs the
        // next chunk, which will see it as `prev`.
        while self.pos < (n - 1) * to {
            let idx = self.pos.div_euclid(to);
            let frac = (self.pos.rem_euclid(to) as f64) / (to as f64);
            let s = sample_at(idx) * (1.0 - frac) + sample_at(idx + 1) * frac;
            out.push(s.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
            self.pos += step;
        }

        self.pos -= n * to;
        self.prev = Some(input[input.len() - 1]);
        out
    }

    /// Forget carried-over state (new stream).
    pub fn reset(&mut self) {
        self.pos = 0;
        self.prev = None;
    }
}

/// Decode 16-bit LE PCM bytes into samples (a trailing odd byte is ignored).
pub fn pcm_from_le_bytes(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Encode samples as 16-bit LE PCM bytes.
pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}
