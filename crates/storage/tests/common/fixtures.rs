use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of data as hex string
#[allow(dead_code)]
pub fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    result.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Generate deterministic printable text using a seeded pseudo-random generator.
/// Same seed produces same output (reproducible tests)
#[allow(dead_code)]
pub fn seeded_text(seed: u64, len: usize) -> String {
    let mut state = seed;
    (0..len)
        .map(|_| {
            // Simple LCG (Linear Congruential Generator)
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            char::from(b'a' + ((state >> 33) % 26) as u8)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hash() {
        let data = b"hello world";
        let hash = sha256_hash(data);
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_seeded_text_deterministic() {
        assert_eq!(seeded_text(42, 1000), seeded_text(42, 1000));
        assert_ne!(seeded_text(42, 1000), seeded_text(43, 1000));
    }
}
