//! Small helpers shared by the worker and the retry policy.

/// Upper bound for reconnect backoff, in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Exponential backoff in milliseconds for the `attempt`-th consecutive failure.
///
/// `base_ms` doubles with every attempt up to [`MAX_BACKOFF_MS`]. `seed`
/// spreads concurrent callers apart when the `jitter` feature is on.
pub fn calculate_backoff(attempt: u32, base_ms: u64, seed: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base_ms.saturating_mul(1u64 << exponent).min(MAX_BACKOFF_MS);

    if cfg!(feature = "jitter") {
        apply_jitter(delay, seed)
    } else {
        delay
    }
}

/// Stable 64-bit seed for [`apply_jitter`] derived from an identifier.
pub fn hash_seed(id: &str) -> u64 {
    id.bytes()
        .fold(0u64, |hash, byte| hash.wrapping_mul(31).wrapping_add(u64::from(byte)))
}

/// Add up to 25% deterministic jitter derived from `seed`.
pub fn apply_jitter(delay_ms: u64, seed: u64) -> u64 {
    let spread = delay_ms / 4;
    if spread == 0 {
        return delay_ms;
    }
    // splitmix64 finalizer
    let mut x = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    delay_ms + x % (spread + 1)
}
