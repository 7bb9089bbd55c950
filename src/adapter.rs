//! # Dimension adapter
//!
//! Heterogeneous embedding models produce vectors of different lengths; the
//! adapter reconciles an incoming vector of length `D_in` against the active
//! store (or collection) dimension `D_s` according to the configured
//! [`AdaptPolicy`]. Queries pass through the same entry point so the read
//! path is adapted symmetrically.
//!
//! Every reshaping emits an observable [`Event::DimAdapted`]. When the
//! recent-write window shows a sustained shift to a new dimension (> 80% of
//! the window), the adapter emits [`Event::DimUpgradeSuggested`] — advisory
//! only, never acted on automatically.

use std::collections::VecDeque;

use parking_lot::Mutex;
use rand::Rng;
use rand::rngs::StdRng;

use crate::config::AdaptPolicy;
use crate::error::{Error, Result};
use crate::events::{AdaptKind, Event};
use crate::vector;

/// Result of running a vector through the adapter.
#[derive(Debug)]
pub(crate) struct AdaptOutcome {
    /// The (possibly reshaped) vector, ready for encoding.
    pub vector: Vec<f32>,
    /// `Some(dim)` when the store should record `dim` as its auto-detected
    /// dimension (first write against `D_s == 0`).
    pub detected: Option<usize>,
    /// Events to publish after the enclosing transaction commits.
    pub events: Vec<Event>,
}

/// Policy-driven dimension reconciliation. One adapter per store; interior
/// mutability covers the upgrade-suggestion window.
pub(crate) struct DimensionAdapter {
    policy: AdaptPolicy,
    window_len: usize,
    window: Mutex<VecDeque<usize>>,
}

impl DimensionAdapter {
    pub(crate) fn new(policy: AdaptPolicy, window_len: usize) -> Self {
        Self {
            policy,
            window_len,
            window: Mutex::new(VecDeque::with_capacity(window_len)),
        }
    }

    /// Reconcile `v` against `store_dim`.
    ///
    /// A `store_dim` of 0 means no dimension has been established yet; the
    /// first write detects it regardless of policy (the strict policy has
    /// nothing to compare against until then).
    pub(crate) fn adapt(
        &self,
        op: &'static str,
        id: &str,
        mut v: Vec<f32>,
        store_dim: usize,
        rng: &mut StdRng,
    ) -> Result<AdaptOutcome> {
        let d_in = v.len();

        if store_dim == 0 {
            return Ok(AdaptOutcome {
                vector: v,
                detected: Some(d_in),
                events: Vec::new(),
            });
        }

        let mut events = self.track_window(d_in, store_dim);

        if d_in == store_dim {
            return Ok(AdaptOutcome {
                vector: v,
                detected: None,
                events,
            });
        }

        match self.policy {
            AdaptPolicy::Strict => Err(Error::dimension(op, store_dim, d_in)),
            AdaptPolicy::Smart => {
                let kind = if d_in > store_dim {
                    v.truncate(store_dim);
                    vector::normalize(&mut v);
                    AdaptKind::Truncated
                } else {
                    noise_extend(&mut v, store_dim, rng);
                    AdaptKind::NoisePadded
                };
                events.push(Event::DimAdapted {
                    kind,
                    from: d_in,
                    to: store_dim,
                    id: id.to_string(),
                });
                Ok(AdaptOutcome {
                    vector: v,
                    detected: None,
                    events,
                })
            }
            AdaptPolicy::Truncate => {
                let kind = if d_in > store_dim {
                    // Renormalize only when the dropped tail carried mass,
                    // so truncating zero padding is the exact inverse of
                    // adding it.
                    let dropped_mass = v[store_dim..].iter().any(|x| *x != 0.0);
                    v.truncate(store_dim);
                    if dropped_mass {
                        vector::normalize(&mut v);
                    }
                    AdaptKind::Truncated
                } else {
                    v.resize(store_dim, 0.0);
                    AdaptKind::ZeroPadded
                };
                events.push(Event::DimAdapted {
                    kind,
                    from: d_in,
                    to: store_dim,
                    id: id.to_string(),
                });
                Ok(AdaptOutcome {
                    vector: v,
                    detected: None,
                    events,
                })
            }
            AdaptPolicy::Pad => {
                let kind = if d_in < store_dim {
                    v.resize(store_dim, 0.0);
                    AdaptKind::ZeroPadded
                } else {
                    v.truncate(store_dim);
                    AdaptKind::Truncated
                };
                events.push(Event::DimAdapted {
                    kind,
                    from: d_in,
                    to: store_dim,
                    id: id.to_string(),
                });
                Ok(AdaptOutcome {
                    vector: v,
                    detected: None,
                    events,
                })
            }
            AdaptPolicy::WarnOnly => {
                tracing::warn!(
                    id,
                    got = d_in,
                    expected = store_dim,
                    "dimension mismatch passed through (warn_only policy)"
                );
                Ok(AdaptOutcome {
                    vector: v,
                    detected: None,
                    events,
                })
            }
        }
    }

    /// Record an incoming dimension and, once the window fills, check
    /// whether a single new dimension dominates it.
    fn track_window(&self, d_in: usize, store_dim: usize) -> Vec<Event> {
        let mut window = self.window.lock();
        window.push_back(d_in);
        if window.len() < self.window_len {
            return Vec::new();
        }
        let mut counts: std::collections::HashMap<usize, usize> = std::collections::HashMap::new();
        for d in window.iter() {
            *counts.entry(*d).or_insert(0) += 1;
        }
        let threshold = (self.window_len as f32 * 0.8).ceil() as usize;
        let suggestion = counts
            .iter()
            .filter(|(d, _)| **d != store_dim)
            .find(|(_, n)| **n >= threshold)
            .map(|(d, _)| *d);
        window.clear();
        match suggestion {
            Some(to) => vec![Event::DimUpgradeSuggested {
                from: store_dim,
                to,
            }],
            None => Vec::new(),
        }
    }
}

/// Extend `v` to `target` components with uniform noise whose standard
/// deviation is 1% of the input's component standard deviation.
fn noise_extend(v: &mut Vec<f32>, target: usize, rng: &mut StdRng) {
    let n = v.len() as f32;
    let mean = v.iter().sum::<f32>() / n;
    let var = v.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
    let sigma = 0.01 * var.sqrt();
    // U(-a, a) has standard deviation a/sqrt(3).
    let a = sigma * 3.0f32.sqrt();
    while v.len() < target {
        let noise = if a > 0.0 { rng.gen_range(-a..=a) } else { 0.0 };
        v.push(noise);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn adapter(policy: AdaptPolicy) -> DimensionAdapter {
        DimensionAdapter::new(policy, 8)
    }

    #[test]
    fn test_first_write_detects_dimension() {
        let a = adapter(AdaptPolicy::Strict);
        let out = a.adapt("upsert", "a", vec![1.0, 2.0, 3.0], 0, &mut rng()).unwrap();
        assert_eq!(out.detected, Some(3));
        assert_eq!(out.vector.len(), 3);
    }

    #[test]
    fn test_strict_rejects_mismatch() {
        let a = adapter(AdaptPolicy::Strict);
        let err = a.adapt("upsert", "a", vec![1.0, 2.0], 3, &mut rng()).unwrap_err();
        assert!(matches!(err, Error::InvalidDimension { expected: 3, got: 2, .. }));
    }

    #[test]
    fn test_smart_truncates_and_renormalizes() {
        let a = adapter(AdaptPolicy::Smart);
        let out = a
            .adapt("upsert", "a", vec![3.0, 4.0, 9.0], 2, &mut rng())
            .unwrap();
        assert_eq!(out.vector.len(), 2);
        assert!((vector::norm(&out.vector) - 1.0).abs() < 1e-6);
        assert!(matches!(
            out.events.as_slice(),
            [Event::DimAdapted { kind: AdaptKind::Truncated, from: 3, to: 2, .. }]
        ));
    }

    #[test]
    fn test_smart_noise_pad_is_small() {
        let a = adapter(AdaptPolicy::Smart);
        let out = a
            .adapt("upsert", "a", vec![1.0, -1.0, 0.5, -0.5], 8, &mut rng())
            .unwrap();
        assert_eq!(out.vector.len(), 8);
        for x in &out.vector[4..] {
            assert!(x.abs() < 0.05, "noise component {x} too large");
        }
    }

    #[test]
    fn test_truncate_of_zero_pad_roundtrips() {
        let a = adapter(AdaptPolicy::Pad);
        let v = vec![0.2f32, 0.4, 0.6];
        let padded = a.adapt("upsert", "a", v.clone(), 6, &mut rng()).unwrap().vector;
        assert_eq!(padded.len(), 6);

        let t = adapter(AdaptPolicy::Truncate);
        let back = t.adapt("upsert", "a", padded, 3, &mut rng()).unwrap().vector;
        assert_eq!(back, v);
    }

    #[test]
    fn test_warn_only_passes_through() {
        let a = adapter(AdaptPolicy::WarnOnly);
        let out = a.adapt("query", "q", vec![1.0, 2.0], 5, &mut rng()).unwrap();
        assert_eq!(out.vector, vec![1.0, 2.0]);
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_upgrade_suggested_when_new_dim_dominates() {
        let a = adapter(AdaptPolicy::Smart);
        let mut r = rng();
        let mut suggested = false;
        for _ in 0..8 {
            let out = a.adapt("upsert", "x", vec![0.5; 768], 384, &mut r).unwrap();
            if out
                .events
                .iter()
                .any(|e| matches!(e, Event::DimUpgradeSuggested { from: 384, to: 768 }))
            {
                suggested = true;
            }
        }
        assert!(suggested);
    }

    #[test]
    fn test_no_upgrade_for_mixed_dims() {
        let a = adapter(AdaptPolicy::Smart);
        let mut r = rng();
        let mut suggested = false;
        for i in 0..8 {
            let d = if i % 2 == 0 { 768 } else { 512 };
            let out = a.adapt("upsert", "x", vec![0.5; d], 384, &mut r).unwrap();
            suggested |= out
                .events
                .iter()
                .any(|e| matches!(e, Event::DimUpgradeSuggested { .. }));
        }
        assert!(!suggested);
    }
}
