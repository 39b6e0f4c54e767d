use std::sync::atomic::{AtomicU32, Ordering};

/// Mulberry32: a tiny 32-bit PRNG with a single word of state. The same seed
/// yields the same sequence on every run and platform, which is the whole
/// point: `uuid()`, `rand()`, every `faker.*` call and schema generation all
/// draw from one stream per engine instance.
#[derive(Debug)]
pub struct Mulberry32 {
    state: AtomicU32,
}

impl Mulberry32 {
    pub fn new(seed: u32) -> Self {
        Self {
            state: AtomicU32::new(seed),
        }
    }

    /// Seed from string parts, e.g. `(global seed, request id)`, so
    /// identical traces replay identically regardless of interleaving.
    pub fn seeded(parts: &[&str]) -> Self {
        let mut hash: u32 = 0x811c_9dc5; // FNV-1a
        for part in parts {
            for b in part.as_bytes() {
                hash ^= u32::from(*b);
                hash = hash.wrapping_mul(0x0100_0193);
            }
            hash ^= 0xff;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        Self::new(hash)
    }

    pub fn next_u32(&self) -> u32 {
        let old = self.state.fetch_add(0x6D2B_79F5, Ordering::Relaxed);
        let mut z = old.wrapping_add(0x6D2B_79F5);
        z = (z ^ (z >> 15)).wrapping_mul(z | 1);
        z ^= z.wrapping_add((z ^ (z >> 7)).wrapping_mul(z | 61));
        z ^ (z >> 14)
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f64(&self) -> f64 {
        f64::from(self.next_u32()) / 4_294_967_296.0
    }

    /// Uniform integer in `[lo, hi]` (inclusive). Swapped bounds tolerated.
    pub fn int_in_range(&self, lo: i64, hi: i64) -> i64 {
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        let span = (hi - lo + 1) as f64;
        lo + (self.next_f64() * span) as i64
    }

    pub fn float_in_range(&self, lo: f64, hi: f64) -> f64 {
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        lo + self.next_f64() * (hi - lo)
    }

    pub fn chance(&self, p: f64) -> bool {
        self.next_f64() < p
    }

    pub fn pick<'a, T>(&self, items: &'a [T]) -> &'a T {
        &items[(self.next_f64() * items.len() as f64) as usize % items.len()]
    }

    /// v4 identifier built from the stream.
    pub fn uuid(&self) -> String {
        let mut bytes = [0u8; 16];
        for chunk in bytes.chunks_mut(4) {
            chunk.copy_from_slice(&self.next_u32().to_le_bytes());
        }
        uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .to_string()
    }
}
