use std::error::Error;
use std::fmt::{Display, Formatter};

use md5::{Digest, Md5};

/// Malformed bloom filter payload. Never surfaced to callers; a target reset is used instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BloomFilterError {
    NegativePadding(i32),
    PaddingTooLarge(i32),
    NegativeHashCount(i32),
    ZeroHashCount,
    PaddingWithoutBitmap(i32),
}

impl Display for BloomFilterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BloomFilterError::NegativePadding(padding) => {
                write!(f, "invalid padding: {padding}")
            }
            BloomFilterError::PaddingTooLarge(padding) => {
                write!(f, "invalid padding, must be less than 8: {padding}")
            }
            BloomFilterError::NegativeHashCount(count) => {
                write!(f, "invalid hash count: {count}")
            }
            BloomFilterError::ZeroHashCount => {
                write!(f, "invalid hash count: 0 for a non-empty bitmap")
            }
            BloomFilterError::PaddingWithoutBitmap(padding) => {
                write!(f, "invalid padding when bitmap length is 0: {padding}")
            }
        }
    }
}

impl Error for BloomFilterError {}

/// Server-built bloom filter over the document names a target still matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> Result<Self, BloomFilterError> {
        if padding < 0 {
            return Err(BloomFilterError::NegativePadding(padding));
        }
        if padding >= 8 {
            return Err(BloomFilterError::PaddingTooLarge(padding));
        }
        if hash_count < 0 {
            return Err(BloomFilterError::NegativeHashCount(hash_count));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(BloomFilterError::ZeroHashCount);
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(BloomFilterError::PaddingWithoutBitmap(padding));
        }

        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 || value.is_empty() {
            return false;
        }

        let (hash1, hash2) = md5_hashes(value);

        (0..u64::from(self.hash_count)).all(|index| {
            let bit = self.bit_index(hash1, hash2, index);
            self.is_bit_set(bit)
        })
    }

    // Double hashing in wrapping 64-bit arithmetic.
    fn bit_index(&self, hash1: u64, hash2: u64, index: u64) -> u64 {
        hash1.wrapping_add(hash2.wrapping_mul(index)) % self.bit_count
    }

    fn is_bit_set(&self, bit: u64) -> bool {
        let byte = self.bitmap[(bit / 8) as usize];
        byte & (1 << (bit % 8)) != 0
    }
}

/// The two little-endian 64-bit halves of the MD5 digest of `value`.
fn md5_hashes(value: &str) -> (u64, u64) {
    let digest = u128::from_le_bytes(Md5::digest(value.as_bytes()).into());
    (digest as u64, (digest >> 64) as u64)
}
