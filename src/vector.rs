//! # Vector codec & similarity kernels
//!
//! The lowest layer of the engine: turning `Vec<f32>` embeddings into the
//! canonical on-disk byte layout and back, validating them, and scoring
//! pairs of vectors under the configured metric.
//!
//! ## Blob layout
//!
//! A vector serializes as a little-endian `i32` length prefix followed by
//! `length` little-endian `f32` components:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬─────┬──────────┐
//! │ len: i32 │ v[0]:f32 │ v[1]:f32 │ ... │ v[n]:f32 │
//! └──────────┴──────────┴──────────┴─────┴──────────┘
//!   4 bytes     4 bytes                     total = 4 + 4·len
//! ```
//!
//! The prefix is not optional: [`decode_vector`] rejects buffers under
//! 4 bytes, buffers whose prefix is negative, and buffers whose byte count
//! disagrees with the prefix. Encoding and decoding round-trip bit-exactly
//! for every finite `f32`.
//!
//! ## Metrics
//!
//! | metric | similarity | distance (index-internal) |
//! |--------|-----------|---------------------------|
//! | cosine | `⟨a,b⟩ / (‖a‖·‖b‖)`, 0 when either norm is 0 | `1 − sim` |
//! | dot | `⟨a,b⟩` | `−⟨a,b⟩` |
//! | euclidean | `1 / (1 + ‖a−b‖)` | `‖a−b‖` |
//!
//! The euclidean *similarity* form is monotone with `−‖a−b‖` and lands in
//! `(0, 1]`, so all three metrics fuse uniformly in the hybrid ranker.
//!
//! ## Quantization
//!
//! [`QuantizedVector`] provides the optional compact in-memory form used by
//! the IVF inverted lists: 8-bit scalar (per-vector min/max) or sign-bit
//! binary. Quantization is lossy; the record table always keeps the exact
//! f32 blob.

use crate::config::{QuantizationConfig, QuantizationType};
use crate::error::{Error, Result};

/// Serialize a vector into the canonical length-prefixed blob.
pub fn encode_vector(v: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 4 * v.len());
    buf.extend_from_slice(&(v.len() as i32).to_le_bytes());
    for x in v {
        buf.extend_from_slice(&x.to_le_bytes());
    }
    buf
}

/// Deserialize a length-prefixed blob back into a vector.
///
/// # Errors
/// `InvalidVector` when the buffer is under 4 bytes, the length prefix is
/// negative, or the byte count is inconsistent with the prefix.
pub fn decode_vector(op: &'static str, buf: &[u8]) -> Result<Vec<f32>> {
    if buf.len() < 4 {
        return Err(Error::invalid_vector(
            op,
            format!("blob too short: {} bytes", buf.len()),
        ));
    }
    let len = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len < 0 {
        return Err(Error::invalid_vector(
            op,
            format!("negative length prefix: {len}"),
        ));
    }
    let len = len as usize;
    if buf.len() != 4 + 4 * len {
        return Err(Error::invalid_vector(
            op,
            format!("blob of {} bytes inconsistent with length {len}", buf.len()),
        ));
    }
    let mut v = Vec::with_capacity(len);
    for chunk in buf[4..].chunks_exact(4) {
        v.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(v)
}

/// Reject vectors containing NaN or ±Inf.
pub fn validate_vector(op: &'static str, v: &[f32]) -> Result<()> {
    for (i, x) in v.iter().enumerate() {
        if !x.is_finite() {
            return Err(Error::invalid_vector(
                op,
                format!("non-finite component {x} at index {i}"),
            ));
        }
    }
    Ok(())
}

fn check_dims(op: &'static str, a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(Error::dimension(op, a.len(), b.len()));
    }
    Ok(())
}

/// Cosine similarity; defined as 0 when either vector has zero norm.
pub fn cosine(op: &'static str, a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(op, a, b)?;
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        na += a[i] * a[i];
        nb += b[i] * b[i];
    }
    if na == 0.0 || nb == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (na.sqrt() * nb.sqrt()))
}

/// Plain inner product.
pub fn dot(op: &'static str, a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(op, a, b)?;
    Ok(a.iter().zip(b).map(|(x, y)| x * y).sum())
}

/// Euclidean distance `‖a−b‖`.
pub fn euclidean_distance(op: &'static str, a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(op, a, b)?;
    Ok(a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt())
}

/// Euclidean similarity `1 / (1 + ‖a−b‖)` — higher is closer, range (0, 1].
pub fn euclidean_similarity(op: &'static str, a: &[f32], b: &[f32]) -> Result<f32> {
    Ok(1.0 / (1.0 + euclidean_distance(op, a, b)?))
}

/// L2 norm.
pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit norm in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let n = norm(v);
    if n > 0.0 {
        for x in v.iter_mut() {
            *x /= n;
        }
    }
}

use crate::config::SimilarityMetric;

impl SimilarityMetric {
    /// Similarity under this metric; higher is closer.
    pub fn score(self, op: &'static str, a: &[f32], b: &[f32]) -> Result<f32> {
        match self {
            SimilarityMetric::Cosine => cosine(op, a, b),
            SimilarityMetric::Dot => dot(op, a, b),
            SimilarityMetric::Euclidean => euclidean_similarity(op, a, b),
        }
    }

    /// Distance form used inside the indexes; lower is closer. Callers have
    /// already checked dimensions.
    pub(crate) fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            SimilarityMetric::Cosine => {
                let mut dot = 0.0f32;
                let mut na = 0.0f32;
                let mut nb = 0.0f32;
                for i in 0..a.len() {
                    dot += a[i] * b[i];
                    na += a[i] * a[i];
                    nb += b[i] * b[i];
                }
                if na == 0.0 || nb == 0.0 {
                    1.0
                } else {
                    1.0 - dot / (na.sqrt() * nb.sqrt())
                }
            }
            SimilarityMetric::Dot => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
            SimilarityMetric::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }

    /// Convert a distance produced by [`distance`](Self::distance) back to
    /// the similarity scale used by the ranker.
    pub(crate) fn distance_to_similarity(self, d: f32) -> f32 {
        match self {
            SimilarityMetric::Cosine => 1.0 - d,
            SimilarityMetric::Dot => -d,
            SimilarityMetric::Euclidean => 1.0 / (1.0 + d),
        }
    }
}

/// Lossy compact form of a vector, used by the IVF inverted lists when
/// quantization is enabled.
#[derive(Debug, Clone)]
pub enum QuantizedVector {
    /// 8-bit codes with a per-vector affine range.
    Scalar {
        min: f32,
        scale: f32,
        codes: Vec<u8>,
    },
    /// One sign bit per component, packed into u64 words.
    Binary { words: Vec<u64>, len: usize },
}

impl QuantizedVector {
    /// Quantize `v` per the configured scheme.
    pub fn quantize(config: &QuantizationConfig, v: &[f32]) -> Self {
        match config.kind {
            QuantizationType::Scalar => {
                let min = v.iter().copied().fold(f32::INFINITY, f32::min);
                let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let range = (max - min).max(f32::EPSILON);
                let scale = range / 255.0;
                let codes = v
                    .iter()
                    .map(|x| (((x - min) / scale).round().clamp(0.0, 255.0)) as u8)
                    .collect();
                QuantizedVector::Scalar { min, scale, codes }
            }
            QuantizationType::Binary => {
                let mut words = vec![0u64; v.len().div_ceil(64)];
                for (i, x) in v.iter().enumerate() {
                    if *x > 0.0 {
                        words[i / 64] |= 1 << (i % 64);
                    }
                }
                QuantizedVector::Binary { words, len: v.len() }
            }
        }
    }

    /// Reconstruct an approximate f32 vector.
    pub fn dequantize(&self) -> Vec<f32> {
        match self {
            QuantizedVector::Scalar { min, scale, codes } => {
                codes.iter().map(|c| min + *c as f32 * scale).collect()
            }
            QuantizedVector::Binary { words, len } => (0..*len)
                .map(|i| {
                    if words[i / 64] >> (i % 64) & 1 == 1 {
                        1.0
                    } else {
                        -1.0
                    }
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            QuantizedVector::Scalar { codes, .. } => codes.len(),
            QuantizedVector::Binary { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let v = vec![0.1f32, -2.5, 3.75, 0.0, f32::MIN_POSITIVE];
        let blob = encode_vector(&v);
        assert_eq!(blob.len(), 4 + 4 * v.len());
        let back = decode_vector("test", &blob).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn test_decode_rejects_short_blob() {
        let err = decode_vector("test", &[0u8; 3]).unwrap_err();
        assert!(matches!(err, Error::InvalidVector { .. }));
    }

    #[test]
    fn test_decode_rejects_negative_length() {
        let blob = (-1i32).to_le_bytes().to_vec();
        assert!(decode_vector("test", &blob).is_err());
    }

    #[test]
    fn test_decode_rejects_inconsistent_length() {
        let mut blob = encode_vector(&[1.0, 2.0]);
        blob.push(0);
        assert!(decode_vector("test", &blob).is_err());
    }

    #[test]
    fn test_validate_rejects_nan_and_inf() {
        assert!(validate_vector("test", &[0.0, f32::NAN]).is_err());
        assert!(validate_vector("test", &[f32::INFINITY]).is_err());
        assert!(validate_vector("test", &[1.0, -1.0]).is_ok());
    }

    #[test]
    fn test_cosine_zero_norm_is_zero() {
        assert_eq!(cosine("test", &[0.0, 0.0], &[1.0, 2.0]).unwrap(), 0.0);
    }

    #[test]
    fn test_cosine_identical_is_one() {
        let v = [0.3f32, 0.4, 0.5];
        let s = cosine("test", &v, &v).unwrap();
        assert!((s - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let err = dot("test", &[1.0], &[1.0, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidDimension {
                expected: 1,
                got: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_euclidean_similarity_monotone() {
        let origin = [0.0f32, 0.0];
        let near = euclidean_similarity("test", &origin, &[0.1, 0.0]).unwrap();
        let far = euclidean_similarity("test", &origin, &[5.0, 0.0]).unwrap();
        assert!(near > far);
        assert!(near <= 1.0 && far > 0.0);
    }

    #[test]
    fn test_metric_distance_agrees_with_similarity() {
        let a = [0.2f32, 0.8, -0.1];
        let b = [0.3f32, 0.7, 0.2];
        for metric in [
            SimilarityMetric::Cosine,
            SimilarityMetric::Dot,
            SimilarityMetric::Euclidean,
        ] {
            let sim = metric.score("test", &a, &b).unwrap();
            let via_dist = metric.distance_to_similarity(metric.distance(&a, &b));
            assert!((sim - via_dist).abs() < 1e-5, "{metric:?}");
        }
    }

    #[test]
    fn test_scalar_quantization_roundtrip_error_bounded() {
        let config = QuantizationConfig::default();
        let v: Vec<f32> = (0..64).map(|i| (i as f32 * 0.37).sin()).collect();
        let q = QuantizedVector::quantize(&config, &v);
        let back = q.dequantize();
        assert_eq!(back.len(), v.len());
        // 8-bit codes over a [-1, 1] range: worst case half a step.
        for (x, y) in v.iter().zip(&back) {
            assert!((x - y).abs() < 2.0 / 255.0);
        }
    }

    #[test]
    fn test_binary_quantization_keeps_signs() {
        let config = QuantizationConfig {
            kind: QuantizationType::Binary,
            ..QuantizationConfig::default()
        };
        let v = vec![0.5f32, -0.5, 2.0, -0.1, 0.3];
        let q = QuantizedVector::quantize(&config, &v);
        let back = q.dequantize();
        for (x, y) in v.iter().zip(&back) {
            assert_eq!(x.signum(), *y);
        }
    }
}
