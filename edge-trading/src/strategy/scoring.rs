//! Explainable 1-5 scoring.
//!
//! Every unit reports named components in `[0, 1]` and a weight per
//! component. The weighted average only covers components that are both
//! present and weighted, and one fixed quantization maps it onto 1-5 so
//! scores from different strategies can be compared directly.

use std::collections::{BTreeMap, HashMap};

/// Named `[0, 1]` component scores.
pub type Components = BTreeMap<String, f64>;

/// Score used when nothing can be weighed.
pub const DEFAULT_SCORE: u8 = 3;

/// Lowest score a scan may emit a signal for.
pub const MIN_SIGNAL_SCORE: u8 = 3;

/// Quantization thresholds, highest first.
const BANDS: [(f64, u8); 4] = [(0.80, 5), (0.65, 4), (0.50, 3), (0.35, 2)];

/// Component weights for one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Weights(BTreeMap<String, f64>);

impl Weights {
    pub fn new(pairs: &[(&str, f64)]) -> Self {
        Self(pairs.iter().map(|(k, w)| (k.to_string(), *w)).collect())
    }

    /// Apply configured overrides. Unknown names are accepted; they only
    /// matter if some component of that name is ever reported.
    pub fn with_overrides(mut self, overrides: Option<&HashMap<String, f64>>) -> Self {
        if let Some(overrides) = overrides {
            for (name, weight) in overrides {
                self.0.insert(name.clone(), weight.max(0.0));
            }
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, w)| (k.as_str(), *w))
    }
}

/// Weighted average of the components that carry a weight, or `None` when
/// the weighted set is empty.
pub fn weighted_average(components: &Components, weights: &Weights) -> Option<f64> {
    let mut sum = 0.0;
    let mut total = 0.0;
    for (name, weight) in weights.iter() {
        if let Some(value) = components.get(name) {
            if !value.is_finite() || !weight.is_finite() {
                continue;
            }
            sum += value.clamp(0.0, 1.0) * weight;
            total += weight;
        }
    }
    (total > 0.0).then(|| sum / total)
}

/// Map a `[0, 1]` average onto 1-5.
pub fn quantize(avg: f64) -> u8 {
    BANDS
        .iter()
        .find(|(floor, _)| avg >= *floor)
        .map(|(_, score)| *score)
        .unwrap_or(1)
}

/// Final 1-5 score.
pub fn score(components: &Components, weights: &Weights) -> u8 {
    weighted_average(components, weights)
        .map(quantize)
        .unwrap_or(DEFAULT_SCORE)
}

/// Step function helper: the value of the first band whose predicate holds.
///
/// Component rules are all of the form "above X gives a, above Y gives b,
/// otherwise c"; this keeps them to one line each.
pub fn band(value: f64, steps: &[(f64, f64)], otherwise: f64) -> f64 {
    steps
        .iter()
        .find(|(floor, _)| value > *floor)
        .map(|(_, s)| *s)
        .unwrap_or(otherwise)
}

/// Build a component map from literal pairs.
pub fn components(pairs: &[(&str, f64)]) -> Components {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clamp(0.0, 1.0))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights() -> Weights {
        Weights::new(&[("a", 0.5), ("b", 0.5)])
    }

    #[test]
    fn test_empty_components_default_to_three() {
        assert_eq!(score(&Components::new(), &weights()), 3);
    }

    #[test]
    fn test_unweighted_components_ignored() {
        let c = components(&[("unrelated", 1.0)]);
        assert_eq!(score(&c, &weights()), 3);
    }

    #[test]
    fn test_absent_keys_not_treated_as_zero() {
        // Only "a" present: average is a's value, not a/2
        let c = components(&[("a", 0.9)]);
        assert_eq!(score(&c, &weights()), 5);
    }

    #[test]
    fn test_quantization_boundaries() {
        assert_eq!(quantize(0.80), 5);
        assert_eq!(quantize(0.7999), 4);
        assert_eq!(quantize(0.65), 4);
        assert_eq!(quantize(0.50), 3);
        assert_eq!(quantize(0.35), 2);
        assert_eq!(quantize(0.3499), 1);
        assert_eq!(quantize(0.0), 1);
    }

    #[test]
    fn test_weighted_mix() {
        let w = Weights::new(&[("a", 0.75), ("b", 0.25)]);
        let c = components(&[("a", 1.0), ("b", 0.0)]);
        assert!((weighted_average(&c, &w).unwrap() - 0.75).abs() < 1e-12);
        assert_eq!(score(&c, &w), 4);
    }

    #[test]
    fn test_zero_weights_fall_back_to_default() {
        let w = Weights::new(&[("a", 0.0)]);
        assert_eq!(score(&components(&[("a", 1.0)]), &w), 3);
    }

    #[test]
    fn test_overrides() {
        let mut o = HashMap::new();
        o.insert("b".to_string(), 3.0);
        o.insert("c".to_string(), -1.0);
        let w = weights().with_overrides(Some(&o));
        assert_eq!(w.get("b"), Some(3.0));
        assert_eq!(w.get("c"), Some(0.0));
    }

    #[test]
    fn test_band() {
        let steps = [(5.0, 1.0), (2.0, 0.8), (0.0, 0.6)];
        assert_eq!(band(6.0, &steps, 0.2), 1.0);
        assert_eq!(band(5.0, &steps, 0.2), 0.8);
        assert_eq!(band(-1.0, &steps, 0.2), 0.2);
    }
}
