use log::debug;
use rand::Rng;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Large prime used to spread successive page seeds across the seed space.
pub const PAGE_SEED_STRIDE: u64 = 15_485_863;

/// Largest accepted base. With a `u32` page index the derived seed stays
/// below `u64::MAX`, so `base + index * PAGE_SEED_STRIDE` is always exact.
pub const MAX_BASE_SEED: u64 = i64::MAX as u64;

/// Upper bound (exclusive) for freshly drawn bases.
const MAX_DRAWN_SEED: u64 = u32::MAX as u64;

/// `base + index * PAGE_SEED_STRIDE`. `base` must not exceed [`MAX_BASE_SEED`];
/// [`SeedDeriver`] and [`sanitize_seed`] enforce that.
pub fn derive_seed(base: u64, index: u32) -> u64 {
    base + u64::from(index) * PAGE_SEED_STRIDE
}

pub fn random_seed() -> u64 {
    rand::rng().random_range(0..MAX_DRAWN_SEED)
}

/// Accepts only finite, non-negative integers up to [`MAX_BASE_SEED`].
/// Anything else (NaN, fractions, negative or oversized numbers, strings, null)
/// is rejected.
pub fn sanitize_seed(raw: &Value) -> Option<u64> {
    match raw {
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                return (v <= MAX_BASE_SEED).then_some(v);
            }
            let f = n.as_f64()?;
            // `MAX_BASE_SEED as f64` rounds up to 2^63, hence the strict bound.
            if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f < MAX_BASE_SEED as f64 {
                Some(f as u64)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Lenient deserializer for seed fields in persisted records and requests.
pub fn deserialize_lenient_seed<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(sanitize_seed))
}

/// Per-book seed source. Without a base it runs in "genesis" mode: the first
/// call draws a random base which every later call reuses.
#[derive(Debug, Clone, Default)]
pub struct SeedDeriver {
    base: Option<u64>,
}

impl SeedDeriver {
    /// Out-of-range bases are discarded, which means genesis mode.
    pub fn new(base: Option<u64>) -> Self {
        let base = base.filter(|b| {
            let ok = *b <= MAX_BASE_SEED;
            if !ok {
                debug!("Discarding out-of-range seed base: {}", b);
            }
            ok
        });
        Self { base }
    }

    pub fn base(&self) -> Option<u64> {
        self.base
    }

    pub fn base_or_draw(&mut self) -> u64 {
        match self.base {
            Some(b) => b,
            None => {
                let b = random_seed();
                debug!("Genesis seed drawn: {}", b);
                self.base = Some(b);
                b
            }
        }
    }

    pub fn seed_for(&mut self, index: u32) -> u64 {
        let base = self.base_or_draw();
        derive_seed(base, index)
    }
}
