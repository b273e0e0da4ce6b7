//! The BIP-37 bloom filter installed on peers so they relay only
//! wallet-relevant transactions.

use keel_core::varint;

/// Target false-positive rate for a freshly installed filter. High enough to
/// give the wallet some plausible deniability about which transactions are
/// actually its own.
pub const BLOOM_DEFAULT_FALSEPOSITIVE_RATE: f64 = 0.0005;
/// Rate used once a filter has degraded and been rebuilt.
pub const BLOOM_REDUCED_FALSEPOSITIVE_RATE: f64 = 0.000_05;
/// Maximum serialized filter size accepted by the network.
pub const BLOOM_MAX_FILTER_LENGTH: usize = 36_000;
pub const BLOOM_MAX_HASH_FUNCS: u32 = 50;

/// `filteradd` behavior flags.
pub const BLOOM_UPDATE_NONE: u8 = 0;
pub const BLOOM_UPDATE_ALL: u8 = 1;
pub const BLOOM_UPDATE_P2PUBKEY_ONLY: u8 = 2;

/// A probabilistic set: no false negatives, tunable false positives.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    filter: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: u8,
    element_count: usize,
}

impl BloomFilter {
    /// Sizes the filter for `element_count` elements at `fp_rate`, capped at
    /// the protocol's maximum filter length.
    pub fn new(
        fp_rate: f64,
        element_count: usize,
        tweak: u32,
        flags: u8,
    ) -> Self {
        let ln2 = std::f64::consts::LN_2;
        let length = if fp_rate < f64::EPSILON {
            BLOOM_MAX_FILTER_LENGTH
        } else {
            ((-1.0 / (ln2 * ln2))
                * element_count as f64
                * fp_rate.ln()
                / 8.0) as usize
        };
        let length = length.clamp(1, BLOOM_MAX_FILTER_LENGTH);

        let hash_funcs = ((length as f64 * 8.0 / element_count.max(1) as f64)
            * ln2) as u32;
        let hash_funcs = hash_funcs.clamp(1, BLOOM_MAX_HASH_FUNCS);

        Self {
            filter: vec![0u8; length],
            hash_funcs,
            tweak,
            flags,
            element_count: 0,
        }
    }

    fn bit_index(&self, data: &[u8], hash_num: u32) -> usize {
        let seed = hash_num
            .wrapping_mul(0xfba4_c795)
            .wrapping_add(self.tweak);
        murmur3_32(data, seed) as usize % (self.filter.len() * 8)
    }

    pub fn insert(&mut self, data: &[u8]) {
        for i in 0..self.hash_funcs {
            let idx = self.bit_index(data, i);
            self.filter[idx / 8] |= 1 << (idx % 8);
        }
        self.element_count += 1;
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        (0..self.hash_funcs).all(|i| {
            let idx = self.bit_index(data, i);
            self.filter[idx / 8] & (1 << (idx % 8)) != 0
        })
    }

    /// Inserts only if not already (probabilistically) present, so the
    /// element count stays meaningful.
    pub fn insert_unique(&mut self, data: &[u8]) {
        if !self.contains(data) {
            self.insert(data);
        }
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// The wire form of a `filterload` payload.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(self.filter.len() + 9 + 4 + 4 + 1);
        varint::write(&mut buf, self.filter.len() as u64);
        buf.extend_from_slice(&self.filter);
        buf.extend_from_slice(&self.hash_funcs.to_le_bytes());
        buf.extend_from_slice(&self.tweak.to_le_bytes());
        buf.push(self.flags);
        buf
    }
}

/// 32-bit murmur3, the hash BIP-37 specifies for filter membership.
fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h = (h ^ k).rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let mut k = 0u32;
    for (i, &byte) in chunks.remainder().iter().enumerate() {
        k |= (byte as u32) << (8 * i);
    }
    if k != 0 {
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn murmur3_reference_vectors() {
        // vectors from the murmur3 reference implementation
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_32(b"hello", 0), 0x248b_fa47);
        assert_eq!(murmur3_32(b"hello, world", 0), 0x345f_a2fc);
    }

    #[test]
    fn inserted_elements_are_contained() {
        let mut filter =
            BloomFilter::new(BLOOM_DEFAULT_FALSEPOSITIVE_RATE, 10, 7, BLOOM_UPDATE_ALL);
        let elems: Vec<Vec<u8>> =
            (0u8..10).map(|i| vec![i; 20]).collect();
        for elem in &elems {
            filter.insert_unique(elem);
        }
        for elem in &elems {
            assert!(filter.contains(elem));
        }
        assert_eq!(filter.element_count(), 10);
    }

    #[test]
    fn unrelated_element_is_probably_absent() {
        let mut filter =
            BloomFilter::new(BLOOM_REDUCED_FALSEPOSITIVE_RATE, 100, 0, BLOOM_UPDATE_ALL);
        for i in 0u8..100 {
            filter.insert(&[i; 32]);
        }
        // at 5e-5 fp rate a single probe virtually never false-positives
        assert!(!filter.contains(&[0xAB; 33]));
    }

    #[test]
    fn serialization_layout() {
        let filter = BloomFilter::new(0.01, 3, 0xdead_beef, BLOOM_UPDATE_ALL);
        let bytes = filter.serialize();
        let (len, used) = varint::read(&bytes).unwrap();
        assert_eq!(len as usize + used + 4 + 4 + 1, bytes.len());
        assert_eq!(bytes[bytes.len() - 1], BLOOM_UPDATE_ALL);
    }
}
