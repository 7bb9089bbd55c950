//! # Configuration
//!
//! This module defines [`StoreConfig`], the closed record of every option the
//! engine recognizes, along with the nested per-component blocks and the YAML
//! loader. Configuration is a *closed* record: unknown fields in the YAML (or
//! in a programmatically built map) are rejected at open time rather than
//! silently ignored, so a typo like `ef_serach` fails loudly.
//!
//! ## YAML format
//!
//! ```yaml
//! path: "/var/lib/app/vectors.db"
//! dimensions: 0            # 0 = auto-detect on first write
//! similarity: cosine       # cosine | dot | euclidean
//! index: hnsw              # flat | hnsw | ivf
//!
//! hnsw:
//!   m: 16
//!   ef_construction: 200
//!   ef_search: 64
//!
//! ivf:
//!   n_centroids: 256
//!   n_probe: 8
//!
//! adapt_policy: smart      # strict | smart | truncate | pad | warn_only
//!
//! text_similarity:
//!   enabled: true
//!   default_weight: 0.3
//! ```
//!
//! ## Examples
//!
//! ### Loading from a file
//!
//! ```no_run
//! use quiver::config::load_config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/app/quiver.yaml")?;
//! println!("db at {}", config.path);
//! # Ok(())
//! # }
//! ```
//!
//! ### Programmatic construction
//!
//! ```rust
//! use quiver::config::StoreConfig;
//!
//! let mut config = StoreConfig::new("vectors.db");
//! config.dimensions = 384;
//! config.hnsw.ef_search = 100;
//! assert!(config.validate().is_ok());
//! ```

use std::collections::HashMap;
use std::fs;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Similarity metric used for scoring and index distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    Dot,
    Euclidean,
}

/// Which candidate-generation index serves vector queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    /// Exhaustive scoring straight off the record table.
    Flat,
    /// Hierarchical small-world graph (default).
    #[default]
    Hnsw,
    /// Inverted-file index over k-means centroids.
    Ivf,
}

/// How incoming vectors are reconciled against the store dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdaptPolicy {
    /// Any mismatch is an error.
    Strict,
    /// Auto-detect on first write; truncate+renormalize or noise-pad after.
    #[default]
    Smart,
    /// Always keep the leading components.
    Truncate,
    /// Always pad to the store dimension.
    Pad,
    /// Pass through untouched, log a warning.
    WarnOnly,
}

/// HNSW graph parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HnswConfig {
    /// Max neighbors per node on layers above the base; the base layer
    /// allows 2·m.
    pub m: usize,
    /// Candidate-list size while building.
    pub ef_construction: usize,
    /// Candidate-list size while searching.
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

/// IVF index parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IvfConfig {
    /// Number of k-means centroids to train.
    pub n_centroids: usize,
    /// How many centroid lists a query scans.
    pub n_probe: usize,
    /// Training runs on at most this many sampled vectors.
    pub training_sample_cap: usize,
    /// Pending/assigned ratio beyond which a retrain is recommended.
    pub retrain_pending_ratio: f32,
}

impl Default for IvfConfig {
    fn default() -> Self {
        Self {
            n_centroids: 256,
            n_probe: 8,
            training_sample_cap: 10_000,
            retrain_pending_ratio: 0.25,
        }
    }
}

/// Fuzzy/phonetic text-similarity scoring options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct TextSimilarityConfig {
    pub enabled: bool,
    /// Blend weight applied when a query doesn't specify one.
    pub default_weight: f32,
    /// Per-term multiplicative boosts, applied when the term occurs on both
    /// sides of a comparison.
    pub boost_terms: HashMap<String, f32>,
    /// Bidirectional translation pairs; paired tokens score as equal.
    pub term_pairs: Vec<(String, String)>,
    /// Let boosts push scores past 1.0 instead of clamping.
    pub allow_score_above_one: bool,
}

/// Kind of vector quantization applied to IVF inverted lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationType {
    #[default]
    Scalar,
    Binary,
}

/// Quantized in-memory storage options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QuantizationConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: QuantizationType,
    /// Bits per component for scalar quantization. Only 8 is supported.
    pub n_bits: u8,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: QuantizationType::Scalar,
            n_bits: 8,
        }
    }
}

/// Chat auto-retain behavior (see the memory module).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AutoRetainConfig {
    pub enabled: bool,
    /// Fire extraction once this many counted messages accumulate.
    pub trigger_every: usize,
    /// How many trailing messages the extractor sees.
    pub window_size: usize,
    /// Which roles count toward the trigger.
    pub roles: Vec<String>,
}

impl Default for AutoRetainConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_every: 10,
            window_size: 20,
            roles: vec!["user".to_string(), "assistant".to_string()],
        }
    }
}

/// The full set of options the engine recognizes.
///
/// Everything except `path` is optional and has a sensible default. Unknown
/// fields are rejected when deserializing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StoreConfig {
    /// Path to the SQLite file. Required.
    pub path: String,
    /// Declared store dimension; 0 means auto-detect on the first write.
    pub dimensions: usize,
    pub similarity: SimilarityMetric,
    pub index: IndexType,
    pub hnsw: HnswConfig,
    pub ivf: IvfConfig,
    pub adapt_policy: AdaptPolicy,
    pub text_similarity: TextSimilarityConfig,
    pub quantization: QuantizationConfig,
    pub auto_retain: AutoRetainConfig,
    /// Upper bound on pooled connections. The current engine keeps a single
    /// connection; values > 1 are accepted for forward compatibility.
    pub max_conns: usize,
    /// Batch size for streaming/scoring loops.
    pub batch_size: usize,
    /// Window length for the dimension-upgrade suggestion heuristic.
    pub adapt_window: usize,
    /// Seed for the store's rng (HNSW layer draws, k-means, noise padding).
    /// Fixing it makes index construction and search order reproducible.
    pub rng_seed: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            dimensions: 0,
            similarity: SimilarityMetric::default(),
            index: IndexType::default(),
            hnsw: HnswConfig::default(),
            ivf: IvfConfig::default(),
            adapt_policy: AdaptPolicy::default(),
            text_similarity: TextSimilarityConfig::default(),
            quantization: QuantizationConfig::default(),
            auto_retain: AutoRetainConfig::default(),
            max_conns: 1,
            batch_size: 256,
            adapt_window: 64,
            rng_seed: None,
        }
    }
}

impl StoreConfig {
    /// A default configuration pointed at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Check the whole record for internal consistency.
    ///
    /// Called by `Store::open`; exposed so callers can validate eagerly.
    pub fn validate(&self) -> Result<()> {
        const OP: &str = "open";
        if self.path.is_empty() {
            return Err(Error::invalid_config(OP, "path must not be empty"));
        }
        if self.hnsw.m < 2 {
            return Err(Error::invalid_config(OP, "hnsw.m must be at least 2"));
        }
        if self.hnsw.ef_construction < self.hnsw.m {
            return Err(Error::invalid_config(
                OP,
                "hnsw.ef_construction must be >= hnsw.m",
            ));
        }
        if self.hnsw.ef_search == 0 {
            return Err(Error::invalid_config(OP, "hnsw.ef_search must be positive"));
        }
        if self.ivf.n_centroids == 0 || self.ivf.n_probe == 0 {
            return Err(Error::invalid_config(
                OP,
                "ivf.n_centroids and ivf.n_probe must be positive",
            ));
        }
        if self.ivf.n_probe > self.ivf.n_centroids {
            return Err(Error::invalid_config(
                OP,
                "ivf.n_probe cannot exceed ivf.n_centroids",
            ));
        }
        if !(0.0..=1.0).contains(&self.text_similarity.default_weight) {
            return Err(Error::invalid_config(
                OP,
                "text_similarity.default_weight must be in [0, 1]",
            ));
        }
        for (term, boost) in &self.text_similarity.boost_terms {
            if *boost < 0.0 {
                return Err(Error::invalid_config(
                    OP,
                    format!("boost for {term:?} must be non-negative"),
                ));
            }
        }
        if self.quantization.enabled
            && self.quantization.kind == QuantizationType::Scalar
            && self.quantization.n_bits != 8
        {
            return Err(Error::invalid_config(
                OP,
                "scalar quantization supports n_bits = 8 only",
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::invalid_config(OP, "batch_size must be positive"));
        }
        if self.adapt_window == 0 {
            return Err(Error::invalid_config(OP, "adapt_window must be positive"));
        }
        if self.auto_retain.enabled
            && (self.auto_retain.trigger_every == 0 || self.auto_retain.window_size == 0)
        {
            return Err(Error::invalid_config(
                OP,
                "auto_retain.trigger_every and window_size must be positive",
            ));
        }
        Ok(())
    }
}

/// Read and deserialize a [`StoreConfig`] from a YAML file.
///
/// Unknown fields in the file are a hard error — the record is closed.
///
/// # Errors
/// `InvalidConfig` when the file can't be read, doesn't parse, or fails
/// [`StoreConfig::validate`].
pub fn load_config(path: &str) -> Result<StoreConfig> {
    const OP: &str = "load_config";
    let text = fs::read_to_string(path)
        .map_err(|e| Error::invalid_config(OP, format!("cannot read {path}: {e}")))?;
    let config: StoreConfig =
        serde_yaml::from_str(&text).map_err(|e| Error::invalid_config(OP, e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = StoreConfig::new(":memory:");
        assert!(config.validate().is_ok());
        assert_eq!(config.adapt_policy, AdaptPolicy::Smart);
        assert_eq!(config.index, IndexType::Hnsw);
    }

    #[test]
    fn test_empty_path_rejected() {
        let config = StoreConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "path: a.db\nef_serach: 10\n";
        let parsed: std::result::Result<StoreConfig, _> = serde_yaml::from_str(yaml);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_nested_yaml_roundtrip() {
        let yaml = r#"
path: vectors.db
dimensions: 384
similarity: euclidean
index: ivf
ivf:
  n_centroids: 64
  n_probe: 4
adapt_policy: truncate
"#;
        let config: StoreConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.similarity, SimilarityMetric::Euclidean);
        assert_eq!(config.index, IndexType::Ivf);
        assert_eq!(config.ivf.n_centroids, 64);
        assert_eq!(config.adapt_policy, AdaptPolicy::Truncate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_n_probe_bound() {
        let mut config = StoreConfig::new("a.db");
        config.ivf.n_probe = config.ivf.n_centroids + 1;
        assert!(config.validate().is_err());
    }
}
