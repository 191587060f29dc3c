//! Token samplers over the model's output logits.
//!
//! Temperature 0 short-circuits to greedy argmax. Any other temperature
//! scales the logits, applies softmax, and then draws either from the full
//! distribution (categorical) or from the top-p nucleus.

use crate::tensor::{div_in_place, softmax};

/// Sampler with temperature, top-p and a deterministic xorshift RNG.
#[derive(Debug)]
pub struct Sampler {
    /// Scratch index buffer for nucleus selection, sized to the vocabulary.
    indices: Vec<usize>,
    pub temperature: f32,
    pub topp: f32,
    rng_state: u64,
}

impl Sampler {
    /// # Arguments
    /// * `vocab_size` - Size of the vocabulary
    /// * `temperature` - Sampling temperature (0.0 for greedy)
    /// * `topp` - Nucleus threshold in [0, 1]; values outside (0, 1) disable it
    /// * `rng_seed` - Seed for reproducible draws
    pub fn new(vocab_size: usize, temperature: f32, topp: f32, rng_seed: u64) -> Self {
        assert!(vocab_size > 0, "Vocab size must be positive");
        assert!(temperature >= 0.0, "Temperature must be non-negative");
        assert!((0.0..=1.0).contains(&topp), "Top-p must be between 0.0 and 1.0");

        Self {
            indices: vec![0; vocab_size],
            temperature,
            topp,
            // xorshift cannot leave an all-zero state
            rng_state: rng_seed.max(1),
        }
    }

    /// Xorshift64* step.
    fn random_u32(&mut self) -> u32 {
        self.rng_state ^= self.rng_state >> 12;
        self.rng_state ^= self.rng_state << 25;
        self.rng_state ^= self.rng_state >> 27;
        ((self.rng_state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Random float in [0, 1).
    fn random_f32(&mut self) -> f32 {
        (self.random_u32() >> 8) as f32 / 16777216.0
    }

    /// Greedy decoding: index of the maximum logit.
    fn sample_argmax(logits: &[f32]) -> usize {
        logits
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i)
            .unwrap_or_default()
    }

    /// Draw from a full probability distribution; the last index absorbs
    /// rounding shortfall.
    fn sample_mult(probs: &[f32], coin: f32) -> usize {
        let mut cdf = 0.0;
        for (i, &prob) in probs.iter().enumerate() {
            cdf += prob;
            if coin < cdf {
                return i;
            }
        }
        probs.len().saturating_sub(1)
    }

    /// Nucleus sampling: draw from the smallest probability-sorted prefix
    /// whose mass exceeds `topp`.
    ///
    /// Candidates below `(1 - topp) / (n - 1)` can never make the nucleus and
    /// are dropped up front. The survivors form a max-heap; elements are
    /// extracted in descending order only until the mass bound is crossed,
    /// which keeps the sort partial.
    fn sample_topp(&mut self, probs: &[f32], coin: f32) -> usize {
        let n = probs.len();
        let cutoff = (1.0 - self.topp) / (n.saturating_sub(1).max(1)) as f32;

        let mut n0 = 0;
        for (i, &prob) in probs.iter().enumerate() {
            if prob >= cutoff {
                self.indices[n0] = i;
                n0 += 1;
            }
        }

        let heap = &mut self.indices[..n0];
        for i in (0..n0 / 2).rev() {
            sift_down(heap, i, n0, probs);
        }

        // Extract descending into the tail of the buffer until the
        // cumulative mass exceeds topp.
        let mut cumulative_prob = 0.0;
        let mut last_index = 0;
        let mut i = n0;
        while i > 0 {
            i -= 1;
            heap.swap(0, i);
            cumulative_prob += probs[heap[i]];
            if cumulative_prob > self.topp {
                last_index = i;
                break;
            }
            sift_down(heap, 0, i, probs);
        }

        let r = coin * cumulative_prob;
        let mut cdf = 0.0;
        for j in (last_index..n0).rev() {
            cdf += probs[heap[j]];
            if r < cdf {
                return heap[j];
            }
        }
        heap[last_index]
    }

    /// Samples a token index from raw logits.
    ///
    /// Temperature 0 returns the argmax without touching the buffer.
    /// Otherwise the logits are scaled and softmaxed in place before the
    /// categorical or nucleus draw.
    pub fn sample(&mut self, logits: &mut [f32]) -> usize {
        if self.temperature == 0.0 {
            Self::sample_argmax(logits)
        } else {
            div_in_place(logits, self.temperature);
            softmax(logits);

            let coin = self.random_f32();
            if self.topp <= 0.0 || self.topp >= 1.0 {
                Self::sample_mult(logits, coin)
            } else {
                self.sample_topp(logits, coin)
            }
        }
    }
}

/// Restores the max-heap property (by probability) for the first `n`
/// entries of `indices`, starting from `from`.
fn sift_down(indices: &mut [usize], mut from: usize, n: usize, probs: &[f32]) {
    loop {
        let mut next = 2 * from + 1;
        if next >= n {
            break;
        }
        let right = next + 1;
        if right < n && probs[indices[right]] > probs[indices[next]] {
            next = right;
        }
        if probs[indices[next]] > probs[indices[from]] {
            indices.swap(from, next);
            from = next;
        } else {
            break;
        }
    }
}
