//! RFC 6238 one-time codes from a stored base32 seed.

use anyhow::{anyhow, Result};
use totp_rs::{Algorithm, Secret, TOTP};

const DIGITS: usize = 6;
const STEP: u64 = 30;

/// Codes closer than this to the end of their window are not submitted.
pub const MIN_REMAINING_SECS: u64 = 5;

/// Removes whitespace and padding and uppercases the seed.
pub fn normalize_seed(seed: &str) -> String {
    seed.chars()
        .filter(|c| !c.is_whitespace() && *c != '=' && *c != '-')
        .collect::<String>()
        .to_ascii_uppercase()
}

fn build(seed: &str) -> Result<TOTP> {
    let normalized = normalize_seed(seed);
    if normalized.is_empty() {
        return Err(anyhow!("TOTP seed is empty"));
    }
    let bytes = Secret::Encoded(normalized)
        .to_bytes()
        .map_err(|e| anyhow!("TOTP seed is not valid base32: {:?}", e))?;
    Ok(TOTP::new_unchecked(Algorithm::SHA1, DIGITS, 1, STEP, bytes))
}

/// Code for an explicit Unix time.
pub fn generate_at(seed: &str, unix_secs: u64) -> Result<String> {
    Ok(build(seed)?.generate(unix_secs))
}

/// Code for the current time.
pub fn generate(seed: &str) -> Result<String> {
    generate_at(seed, crate::utils::unix_now())
}

pub fn validate_seed(seed: &str) -> bool {
    build(seed).is_ok()
}

/// Seconds left in the 30 second window containing `unix_secs`.
pub fn seconds_remaining(unix_secs: u64) -> u64 {
    STEP - (unix_secs % STEP)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 SHA-1 test key "12345678901234567890" in base32.
    const RFC_SEED: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn matches_rfc6238_vectors() {
        assert_eq!(generate_at(RFC_SEED, 59).unwrap(), "287082");
        assert_eq!(generate_at(RFC_SEED, 1_111_111_109).unwrap(), "081804");
        assert_eq!(generate_at(RFC_SEED, 1_234_567_890).unwrap(), "005924");
    }

    #[test]
    fn seed_formatting_is_ignored() {
        let spaced = "gezd gnbv gy3t qojq gezd gnbv gy3t qojq";
        assert_eq!(generate_at(spaced, 59).unwrap(), "287082");
        assert_eq!(normalize_seed(" ab cd== "), "ABCD");
    }

    #[test]
    fn rejects_invalid_seeds() {
        assert!(!validate_seed(""));
        assert!(!validate_seed("not base32 !!"));
        assert!(validate_seed(RFC_SEED));
    }

    #[test]
    fn window_remaining() {
        assert_eq!(seconds_remaining(0), 30);
        assert_eq!(seconds_remaining(29), 1);
        assert_eq!(seconds_remaining(30), 30);
    }
}
