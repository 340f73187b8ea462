// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Hashing and sizing helpers shared by build and probe.

/// Fibonacci multiplier of the multiplicative hash.
const HASH_MUL: u64 = 0x9E37_79B9_7F4A_7C15;

/// Default upper bound of the bucket count.
pub const MAX_BUCKET_SIZE: u32 = 1 << 31;

pub struct JoinHashMapHelper;

impl JoinHashMapHelper {
    /// The smallest power of two that is at least twice `row_count`, capped at `max_size`.
    pub fn calc_bucket_num(row_count: usize, max_size: u32) -> u32 {
        let wanted = row_count.saturating_mul(2).max(1);
        let size = wanted.checked_next_power_of_two().unwrap_or(usize::MAX);
        size.min(max_size as usize) as u32
    }

    /// Map a hash value to a bucket. `bucket_size` must be a power of two.
    #[inline]
    pub fn bucket_of(hash: u32, bucket_size: u32) -> u32 {
        hash & (bucket_size - 1)
    }

    #[inline]
    pub fn hash_u64(v: u64) -> u32 {
        (v.wrapping_mul(HASH_MUL) >> 32) as u32
    }

    #[inline]
    pub fn hash_u128(v: u128) -> u32 {
        let lo = v as u64;
        let hi = (v >> 64) as u64;
        Self::hash_u64(lo ^ hi.wrapping_mul(HASH_MUL).rotate_left(29))
    }

    /// Hash a byte string, folding eight bytes at a time.
    pub fn hash_bytes(bytes: &[u8]) -> u32 {
        let mut h = bytes.len() as u64;
        for chunk in bytes.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            h = (h ^ u64::from_le_bytes(word))
                .wrapping_mul(HASH_MUL)
                .rotate_left(31);
        }
        Self::hash_u64(h)
    }
}
