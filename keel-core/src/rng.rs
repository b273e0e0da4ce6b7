//! Injected randomness.
//!
//! Everything in the workspace that needs entropy (output shuffling, peer
//! selection bias) takes a [`RngCore`] parameter instead of reaching for a
//! process-global generator, so tests can pin a seed and stay deterministic.

pub use rand_core::RngCore;

/// A small, fast, _non-cryptographic_ rng (xorshift64*). Good enough for
/// shuffles and sampling; never used for key material.
#[derive(Debug, Clone)]
pub struct FastRng {
    state: u64,
}

impl FastRng {
    pub fn new() -> Self {
        Self::from_u64(0x9e37_79b9_7f4a_7c15)
    }

    pub fn from_u64(seed: u64) -> Self {
        Self {
            // xorshift state must be non-zero
            state: if seed == 0 { 0xdead_beef_f00b_aa44 } else { seed },
        }
    }
}

impl Default for FastRng {
    fn default() -> Self {
        Self::new()
    }
}

impl RngCore for FastRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand_core::impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// A uniform sample in `[0, upper_bound)` via rejection sampling, so there is
/// no modulo bias. `upper_bound` of 0 is treated as 1.
pub fn next_upto<R: RngCore>(rng: &mut R, upper_bound: u32) -> u32 {
    if upper_bound < 2 {
        return 0;
    }
    // reject values in the final partial bucket of the u32 range
    let cutoff = (u32::MAX - upper_bound + 1) % upper_bound;
    loop {
        let r = rng.next_u32();
        if r >= cutoff {
            return r % upper_bound;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deterministic_for_a_seed() {
        let mut a = FastRng::from_u64(7);
        let mut b = FastRng::from_u64(7);
        for _ in 0..32 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn next_upto_stays_in_range() {
        let mut rng = FastRng::from_u64(99);
        for bound in [1u32, 2, 3, 10, 1000] {
            for _ in 0..100 {
                assert!(next_upto(&mut rng, bound) < bound);
            }
        }
        assert_eq!(next_upto(&mut rng, 0), 0);
    }
}
