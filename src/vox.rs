// ─────────────────────────────────────────────────────────────────────
//  VOX: level-keyed push-to-talk with trailing hangover
// ─────────────────────────────────────────────────────────────────────
//
//  Each 20 ms chunk yields one RMS value.
//
//    Unkeyed ──rms > threshold && tx permitted──▶ Keyed (decay = delay)
//    Keyed   ──rms > threshold──▶ Keyed (decay = delay)
//    Keyed   ──rms ≤ threshold──▶ decay -= 1, Unkeyed once decay hits 0
//
//  With delay = N the last loud chunk is followed by exactly N quiet
//  chunks before the key drops, which bridges gaps between words.
//  A manual key-up gets the same N quiet chunks.

/// RMS of 16-bit PCM samples (0 for empty input).
#[inline]
pub fn compute_rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let s = s as f64;
            s * s
        })
        .sum();
    (sum_sq / (samples.len() as f64)).sqrt()
}

/// Outcome of feeding one chunk to [`Vox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxDecision {
    /// Turn PTT on.
    KeyUp,
    /// Turn PTT off.
    Unkey,
    /// Leave PTT as it is.
    Hold,
}

#[derive(Debug, Clone)]
pub struct Vox {
    threshold: u32,
    delay: u32,
    decay: u32,
    /// PTT as of the previous chunk.
    keyed: bool,
}

impl Vox {
    pub fn new(threshold: u32, delay: u32) -> Self {
        Vox { threshold, delay, decay: 0, keyed: false }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn delay(&self) -> u32 {
        self.delay
    }

    /// Feed one chunk's RMS.
    ///
    /// `keyed` is the current PTT state (it can also be changed by the
    /// manual button); `tx_permitted` is the half-duplex gate. A key-up
    /// from outside starts a full hangover, so manual PTT drops after
    /// `delay` quiet chunks like a VOX key-up would.
    pub fn update(&mut self, rms: f64, keyed: bool, tx_permitted: bool) -> VoxDecision {
        if keyed && !self.keyed {
            self.decay = self.delay;
        }
        self.keyed = keyed;

        if rms > self.threshold as f64 {
            self.decay = self.delay;
            if !keyed && tx_permitted {
                self.keyed = true;
                return VoxDecision::KeyUp;
            }
            return VoxDecision::Hold;
        }

        if keyed {
            self.decay = self.decay.saturating_sub(1);
            if self.decay == 0 {
                self.keyed = false;
                return VoxDecision::Unkey;
            }
        }
        VoxDecision::Hold
    }
}
