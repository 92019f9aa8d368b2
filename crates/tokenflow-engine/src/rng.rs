use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// The kernel's only randomness source: a ChaCha8 stream seeded from the
/// scenario. Serialized with its stream position so a restored snapshot
/// continues the exact draw sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimRng {
    seed: u64,
    rng: ChaCha8Rng,
}

impl SimRng {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform draw from `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Uniform draw from the inclusive range `[min, max]`.
    pub fn range(&mut self, min: f64, max: f64) -> f64 {
        if min >= max {
            return min;
        }
        self.rng.gen_range(min..=max)
    }

    /// Deterministic identifier for `uuid()` in formulas: a function of the
    /// seed and the log sequence, so replays mint identical ids.
    pub fn deterministic_uuid(&self, sequence: u64) -> String {
        let hi = self.seed.rotate_left(17) ^ sequence.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        uuid_from_parts(hi, sequence)
    }
}

fn uuid_from_parts(hi: u64, lo: u64) -> String {
    let bytes = ((hi as u128) << 64 | lo as u128).to_be_bytes();
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3],
        bytes[4], bytes[5],
        bytes[6], bytes[7],
        bytes[8], bytes[9],
        bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    )
}
