//! Shared workload generation for the tiermalloc benchmarks.

/// Deterministic xorshift generator so every run replays the same request mix.
#[derive(Debug, Clone)]
pub struct XorShift64(u64);

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

/// Request sizes skewed towards small objects: mostly under 256 bytes, some
/// up to 32 KiB, and an occasional large request above the size-class ceiling.
pub fn mixed_sizes(count: usize, seed: u64) -> Vec<usize> {
    let mut rng = XorShift64::new(seed);
    (0..count)
        .map(|_| {
            let r = rng.next_u64();
            match r % 100 {
                0 => 256 * 1024 + (r >> 8) as usize % (768 * 1024),
                1..=14 => 257 + (r >> 8) as usize % (32 * 1024),
                _ => 1 + (r >> 8) as usize % 256,
            }
        })
        .collect()
}
