//! Double-hash Bloom filter over a [`PagedBitSet`].
//!
//! Two 64-bit Murmur hashes are combined as `h1 + i*h2` to derive the bucket
//! for each of the `hash_count` probes; `h2` re-hashes the key with `h1` as
//! seed. This combinatorial generation gives the same false-positive bounds
//! as independent hash functions at a fraction of the hashing cost.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;

use crate::errors::ConfigurationError;
use crate::utils::bitset::PagedBitSet;
use crate::utils::murmur;

/// Slack added on top of `elements * buckets_per_element`.
const EXCESS: u64 = 20;

/// Largest supported buckets-per-element ratio.
const MAX_BUCKETS_PER_ELEMENT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    hash_count: u8,
    bitset: PagedBitSet,
}

/// False-positive probability of a filter with `buckets` buckets per element
/// probed `k` times per key.
fn false_positive_rate(buckets: usize, k: usize) -> f64 {
    (1.0 - (-(k as f64) / buckets as f64).exp()).powi(k as i32)
}

/// Probe count minimizing the false-positive rate at the given ratio.
fn optimal_k(buckets_per_element: usize) -> u8 {
    let k = (buckets_per_element as f64 * std::f64::consts::LN_2).round() as u8;
    k.max(1)
}

/// Largest ratio the bit capacity can accommodate for `elements` keys.
fn max_buckets_per_element(elements: u64) -> usize {
    let elements = elements.max(1);
    let ceiling = (i64::MAX as u64 - EXCESS) / elements;
    (ceiling as usize).min(MAX_BUCKETS_PER_ELEMENT).max(1)
}

fn buckets_for(elements: u64, buckets_per_element: usize) -> PagedBitSet {
    PagedBitSet::with_capacity(elements * buckets_per_element as u64 + EXCESS)
}

impl BloomFilter {
    fn new(hash_count: u8, bitset: PagedBitSet) -> Self {
        debug_assert!(hash_count >= 1);
        BloomFilter { hash_count, bitset }
    }

    /// A filter with the lowest practical false-positive probability for
    /// `elements` keys at the requested buckets-per-element ratio. The ratio
    /// is clamped when the bit capacity cannot accommodate it.
    pub fn with_buckets(elements: u64, target_buckets_per_element: usize) -> Self {
        let max = max_buckets_per_element(elements);
        let buckets_per_element = target_buckets_per_element.min(max);
        if buckets_per_element < target_buckets_per_element {
            warn!(
                "Cannot provide an optimal BloomFilter for {} elements ({}/{} buckets per element)",
                elements, buckets_per_element, target_buckets_per_element
            );
        }
        BloomFilter::new(
            optimal_k(buckets_per_element),
            buckets_for(elements, buckets_per_element),
        )
    }

    /// The smallest filter that holds `elements` keys under the given
    /// false-positive probability.
    pub fn with_fp_rate(elements: u64, max_false_positive: f64) -> Result<Self, ConfigurationError> {
        if !(0.0..=1.0).contains(&max_false_positive) {
            return Err(ConfigurationError::InvalidBloomSpec(format!(
                "invalid false positive probability {max_false_positive}"
            )));
        }
        let max = max_buckets_per_element(elements);
        let mut buckets_per_element = 1;
        while buckets_per_element <= max {
            let k = optimal_k(buckets_per_element) as usize;
            if false_positive_rate(buckets_per_element, k) <= max_false_positive {
                return Ok(BloomFilter::new(
                    optimal_k(buckets_per_element),
                    buckets_for(elements, buckets_per_element),
                ));
            }
            buckets_per_element += 1;
        }
        Err(ConfigurationError::InvalidBloomSpec(format!(
            "unable to satisfy false positive probability {max_false_positive} \
             with at most {max} buckets per element"
        )))
    }

    /// A single-bit filter that reports every key as present, for tests.
    pub fn always_matching() -> Self {
        let mut bitset = PagedBitSet::with_capacity(64);
        bitset.set_range(0, 64);
        BloomFilter::new(1, bitset)
    }

    pub fn hash_count(&self) -> u8 {
        self.hash_count
    }

    pub fn buckets(&self) -> u64 {
        self.bitset.capacity()
    }

    fn hash_buckets(&self, key: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let h1 = murmur::hash64(key, 0);
        let h2 = murmur::hash64(key, h1);
        let max = self.buckets();
        (0..self.hash_count as u64)
            .map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) as i64).unsigned_abs() % max)
    }

    pub fn add(&mut self, key: &[u8]) {
        let buckets: Vec<u64> = self.hash_buckets(key).collect();
        for bucket in buckets {
            self.bitset.set(bucket);
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.hash_buckets(key).all(|bucket| self.bitset.get(bucket))
    }

    /// Adds a string key, hashed in the compatibility byte layout.
    pub fn add_str(&mut self, key: &str) {
        self.add(&murmur::utf16_bytes(key));
    }

    pub fn contains_str(&self, key: &str) -> bool {
        self.contains(&murmur::utf16_bytes(key))
    }

    /// Unsets every bucket.
    pub fn clear(&mut self) {
        self.bitset.clear_all();
    }

    /// Writes `hash_count: i32 | words: i32 | raw words as big-endian i64`.
    pub fn serialize<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mut remaining = self.bitset.num_words();
        out.write_i32::<BigEndian>(self.hash_count as i32)?;
        out.write_i32::<BigEndian>(remaining as i32)?;
        for p in 0..self.bitset.page_count() {
            for &word in self.bitset.page(p) {
                if remaining == 0 {
                    break;
                }
                out.write_i64::<BigEndian>(word as i64)?;
                remaining -= 1;
            }
        }
        Ok(())
    }

    pub fn deserialize<R: Read>(input: &mut R) -> io::Result<Self> {
        let hash_count = input.read_i32::<BigEndian>()?;
        let word_len = input.read_i32::<BigEndian>()?;
        if hash_count < 1 || word_len < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "corrupt bloom filter header",
            ));
        }
        let mut bitset = PagedBitSet::with_capacity((word_len as u64) << 6);
        let mut remaining = word_len as usize;
        for p in 0..bitset.page_count() {
            let page = bitset.page_mut(p);
            for word in page.iter_mut() {
                if remaining == 0 {
                    break;
                }
                *word = input.read_i64::<BigEndian>()? as u64;
                remaining -= 1;
            }
        }
        Ok(BloomFilter::new(hash_count as u8, bitset))
    }

    /// Serialized length in bytes.
    pub fn serialized_size(&self) -> usize {
        4 + 4 + self.bitset.num_words() * 8
    }
}
