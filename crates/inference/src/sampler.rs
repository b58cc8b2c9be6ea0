//! Temperature + top-p token selection.

use meshlm_core::kernels::softmax;

/// Nucleus sampler with a seedable 64-bit xorshift PRNG. The seed may change
/// between tokens, never inside a token step.
pub struct Sampler {
    temperature: f32,
    top_p: f32,
    rng_state: u64,
    /// `(probability, token)` scratch, reused across steps.
    candidates: Vec<(f32, u32)>,
    probs: Vec<f32>,
}

impl Sampler {
    pub const DEFAULT_TEMPERATURE: f32 = 0.8;
    pub const DEFAULT_TOP_P: f32 = 0.9;

    pub fn new(vocab_size: usize, temperature: f32, top_p: f32, seed: u64) -> Self {
        Self {
            temperature,
            top_p,
            rng_state: seed.max(1),
            candidates: Vec::with_capacity(vocab_size),
            probs: vec![0.0; vocab_size],
        }
    }

    pub fn set_temperature(&mut self, temperature: f32) {
        self.temperature = temperature;
    }

    pub fn set_top_p(&mut self, top_p: f32) {
        self.top_p = top_p;
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.rng_state = seed.max(1);
    }

    /// Pick the next token. Temperature at or below zero is argmax.
    pub fn sample(&mut self, logits: &[f32]) -> u32 {
        if self.temperature <= 0.0 {
            return argmax(logits);
        }

        self.probs.resize(logits.len(), 0.0);
        for (p, &l) in self.probs.iter_mut().zip(logits) {
            *p = l / self.temperature;
        }
        softmax(&mut self.probs);

        // Smallest prefix of the sorted distribution with cumulative
        // probability >= top_p, renormalized by its own mass.
        self.candidates.clear();
        self.candidates
            .extend(self.probs.iter().enumerate().map(|(t, &p)| (p, t as u32)));
        self.candidates.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));

        let mut cumulative = 0.0f32;
        let mut cutoff = self.candidates.len();
        for (i, &(p, _)) in self.candidates.iter().enumerate() {
            cumulative += p;
            if cumulative >= self.top_p {
                cutoff = i + 1;
                break;
            }
        }

        let r = self.random_f32() * cumulative;
        let mut cdf = 0.0f32;
        for &(p, token) in &self.candidates[..cutoff] {
            cdf += p;
            if r < cdf {
                return token;
            }
        }
        self.candidates[cutoff - 1].1
    }

    /// xorshift64 step, reduced to a float in [0, 1).
    fn random_f32(&mut self) -> f32 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        ((self.rng_state >> 40) as f32) / 16_777_216.0
    }
}

fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    for (t, &l) in logits.iter().enumerate() {
        if l > logits[best] {
            best = t;
        }
    }
    best as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_temperature_is_argmax() {
        let mut sampler = Sampler::new(4, 0.0, 0.9, 42);
        assert_eq!(sampler.sample(&[0.1, 3.0, -1.0, 2.9]), 1);
    }

    #[test]
    fn fixed_seed_is_deterministic() {
        let logits = vec![0.5, 1.5, 0.2, 2.0, -0.3];
        let mut a = Sampler::new(5, 0.8, 0.9, 1234);
        let mut b = Sampler::new(5, 0.8, 0.9, 1234);
        for _ in 0..32 {
            assert_eq!(a.sample(&logits), b.sample(&logits));
        }
    }

    #[test]
    fn reseeding_restarts_the_stream() {
        let logits = vec![0.5, 1.5, 0.2, 2.0, -0.3];
        let mut sampler = Sampler::new(5, 0.8, 0.9, 7);
        let first: Vec<u32> = (0..8).map(|_| sampler.sample(&logits)).collect();
        sampler.set_seed(7);
        let second: Vec<u32> = (0..8).map(|_| sampler.sample(&logits)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn tight_top_p_collapses_to_the_mode() {
        // One token carries almost all the mass; any draw lands on it.
        let logits = vec![10.0, 0.0, 0.0, 0.0];
        let mut sampler = Sampler::new(4, 1.0, 0.5, 99);
        for _ in 0..16 {
            assert_eq!(sampler.sample(&logits), 0);
        }
    }
}
