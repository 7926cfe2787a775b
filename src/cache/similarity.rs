//! Deterministic text fingerprints for near-duplicate lookups.
//!
//! Each whitespace token is hashed (SHA-256, so fingerprints are stable across
//! processes and persisted tiers) and expanded into a pseudo-random vector of
//! `dim` components in `[-1, 1]`; the sum is normalised to a unit vector.
//! Distinct tokens are close to orthogonal, so texts sharing most tokens land
//! close together under cosine similarity and unrelated texts do not.

use sha2::{Digest, Sha256};

/// SplitMix64 step, used to expand one token hash into many components.
fn splitmix64(state: u64) -> u64 {
    let mut z = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Fingerprint `text` into a unit vector of length `dim`.
///
/// Returns an all-zero vector for empty text, and an empty one for `dim == 0`.
pub fn fingerprint(text: &str, dim: usize) -> Vec<f32> {
    if dim == 0 {
        return Vec::new();
    }
    let mut acc = vec![0.0f64; dim];
    for token in text.split_whitespace() {
        let token = token.to_lowercase();
        let digest = Sha256::digest(token.as_bytes());
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        let hv = u64::from_le_bytes(seed);
        for (i, slot) in acc.iter_mut().enumerate() {
            let bits = splitmix64(hv.wrapping_add(i as u64));
            *slot += (bits as f64 / u64::MAX as f64) * 2.0 - 1.0;
        }
    }
    let norm = acc.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 1e-9 {
        acc.iter_mut().for_each(|v| *v /= norm);
    }
    acc.into_iter().map(|v| v as f32).collect()
}

/// Cosine similarity in `[-1, 1]`; 0.0 for mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let mag_b = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if mag_a < 1e-9 || mag_b < 1e-9 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}
