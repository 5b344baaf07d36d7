//! Embedding vectors, lossy quantization, and duplicate-detection hashes.
//!
//! Three distinct keys are derived from record content, each serving a
//! different tier of the engine:
//!
//! - [`Vector`]: the full-precision embedding used for hot-tier similarity
//!   search.
//! - [`QuantizedVector`]: an i8 scalar quantization of the embedding used
//!   by the warm tier. Lossy, with a bounded per-component error of one
//!   quantization step.
//! - [`content_hash`] / [`fingerprint`]: the exact-duplicate key (blake3)
//!   and the near-duplicate key (64-bit simhash). Both are derived from
//!   content only, so they are identical at every tier.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A full-precision embedding vector.
///
/// Stored as `f32` with a cached L2 norm so repeated cosine comparisons
/// during a search scan don't recompute it.
#[derive(Debug, Clone)]
pub struct Vector {
    /// The vector components
    data: Arc<[f32]>,
    /// Pre-computed L2 norm for cosine similarity
    norm: f32,
}

impl PartialEq for Vector {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Serialize for Vector {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.data.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Vector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let data = Vec::<f32>::deserialize(deserializer)?;
        Ok(Vector::new(data))
    }
}

impl Vector {
    /// Create a new vector from raw components.
    ///
    /// # Panics
    ///
    /// Panics if `data` is empty.
    pub fn new(data: Vec<f32>) -> Self {
        assert!(!data.is_empty(), "Vector data cannot be empty");
        let norm = data.iter().map(|x| x * x).sum::<f32>().sqrt();
        Self {
            data: Arc::from(data.into_boxed_slice()),
            norm,
        }
    }

    /// Number of dimensions.
    pub fn dimensions(&self) -> usize {
        self.data.len()
    }

    /// Raw component access.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Cached L2 norm.
    pub fn norm(&self) -> f32 {
        self.norm
    }

    /// Cosine similarity in `[-1.0, 1.0]`.
    ///
    /// Returns 0.0 for zero-norm vectors or dimension mismatches rather
    /// than NaN, so ranking comparisons stay total.
    pub fn cosine_similarity(&self, other: &Vector) -> f32 {
        if self.data.len() != other.data.len() || self.norm == 0.0 || other.norm == 0.0 {
            return 0.0;
        }
        let dot: f32 = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a * b)
            .sum();
        dot / (self.norm * other.norm)
    }
}

/// A lossy i8 scalar quantization of a [`Vector`].
///
/// Components are mapped linearly from `[min, max]` onto `[-127, 127]`.
/// Dequantization reconstructs each component to within one quantization
/// step (`(max - min) / 254`), which bounds the warm tier's ranking error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedVector {
    /// Quantized components
    codes: Vec<i8>,
    /// Minimum component value before quantization
    min: f32,
    /// Maximum component value before quantization
    max: f32,
}

impl QuantizedVector {
    /// Quantize a full-precision vector.
    pub fn from_vector(vector: &Vector) -> Self {
        let data = vector.as_slice();
        let min = data.iter().copied().fold(f32::INFINITY, f32::min);
        let max = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let range = max - min;

        let codes = if range == 0.0 {
            vec![0i8; data.len()]
        } else {
            data.iter()
                .map(|&x| {
                    let scaled = (x - min) / range; // 0.0..=1.0
                    (scaled * 254.0 - 127.0).round() as i8
                })
                .collect()
        };

        Self { codes, min, max }
    }

    /// Number of dimensions.
    pub fn dimensions(&self) -> usize {
        self.codes.len()
    }

    /// Approximate byte footprint (codes only; the reason this tier exists).
    pub fn size_bytes(&self) -> usize {
        self.codes.len()
    }

    /// Reconstruct an approximate full-precision vector for scoring.
    pub fn dequantize(&self) -> Vector {
        let range = self.max - self.min;
        let data: Vec<f32> = self
            .codes
            .iter()
            .map(|&c| {
                if range == 0.0 {
                    self.min
                } else {
                    ((c as f32 + 127.0) / 254.0) * range + self.min
                }
            })
            .collect();
        Vector::new(data)
    }
}

/// Exact-duplicate key: blake3 hash of the content, hex encoded.
///
/// Tier-independent; migrating a record never changes its content hash.
pub fn content_hash(content: &str) -> String {
    hex::encode(blake3::hash(content.as_bytes()).as_bytes())
}

/// Near-duplicate key: 64-bit simhash over whitespace tokens.
///
/// Similar content yields fingerprints with small hamming distance. The
/// fingerprint is derived from content only, so it survives every tier
/// transition unchanged (unlike the embedding, which is quantized away).
pub fn fingerprint(content: &str) -> u64 {
    let mut weights = [0i64; 64];

    for token in content.split_whitespace() {
        let digest = blake3::hash(token.as_bytes());
        let token_bits = u64::from_le_bytes(
            digest.as_bytes()[..8]
                .try_into()
                .unwrap_or([0u8; 8]),
        );
        for (bit, weight) in weights.iter_mut().enumerate() {
            if token_bits >> bit & 1 == 1 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }

    let mut result = 0u64;
    for (bit, &weight) in weights.iter().enumerate() {
        if weight > 0 {
            result |= 1 << bit;
        }
    }
    result
}

/// Hamming distance between two fingerprints (0..=64).
pub fn fingerprint_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}
