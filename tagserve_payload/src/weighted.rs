//! Weighted categorical draws over a fixed set of keys.
//!
//! A [`Table`] is built once from `(key, weight)` pairs whose weights partition
//! the unit interval. Each positive weight becomes a cumulative upper bound and
//! a draw of `u` in `[0, 1)` selects the first key whose bound exceeds `u`. The
//! lookup is a binary search over the bounds; the selected key is the same one
//! a front-to-back linear scan would find.

use rand::Rng;
use tracing::debug;

use crate::ValidationError;

/// Absolute tolerance allowed between the sum of weights and 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

/// Returns true if `weight` is a usable probability, that is finite and in
/// `[0, 1]`.
#[must_use]
pub fn is_probability(weight: f64) -> bool {
    weight.is_finite() && (0.0..=1.0).contains(&weight)
}

#[derive(Debug, Clone)]
/// Precomputed cumulative bounds for a weighted categorical draw.
///
/// Bounds are strictly increasing and the table is never empty. Keys with a
/// zero weight are dropped at build time as they can never be selected.
pub struct Table<K> {
    entries: Vec<(K, f64)>,
}

impl<K> Table<K> {
    /// Build a table from `(key, weight)` pairs, accumulating in the order
    /// given.
    ///
    /// # Errors
    ///
    /// Returns an error if any weight is not a probability, if no key carries
    /// positive weight or if the weights do not sum to 1.0 within
    /// [`WEIGHT_SUM_TOLERANCE`].
    pub fn build<I>(weights: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (K, f64)>,
    {
        let mut entries = Vec::new();
        let mut sum = 0.0_f64;
        for (key, weight) in weights {
            if !is_probability(weight) {
                return Err(ValidationError::CategoryWeight { weight });
            }
            if weight == 0.0 {
                continue;
            }
            sum += weight;
            entries.push((key, sum));
        }

        if entries.is_empty() {
            return Err(ValidationError::NoCategories);
        }
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ValidationError::WeightSum { sum });
        }
        debug!(
            categories = entries.len(),
            sum, "built weighted distribution table"
        );

        Ok(Self { entries })
    }

    /// Select the key whose cumulative bound is the first to exceed `u`.
    ///
    /// Values at or past the final bound, possible only through floating
    /// point error near 1.0, select the last key. This function never fails.
    #[must_use]
    pub fn draw(&self, u: f64) -> &K {
        let idx = self.entries.partition_point(|(_, bound)| *bound <= u);
        let idx = idx.min(self.entries.len() - 1);
        &self.entries[idx].0
    }

    /// Draw a uniform value from `rng` and select a key with it.
    pub fn sample<R>(&self, rng: &mut R) -> &K
    where
        R: Rng + ?Sized,
    {
        self.draw(rng.random::<f64>())
    }

    /// The number of selectable keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false, a built table holds at least one key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(key, cumulative_bound)` pairs in draw order.
    pub fn bounds(&self) -> impl Iterator<Item = (&K, f64)> {
        self.entries.iter().map(|(k, b)| (k, *b))
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::SmallRng};
    use rustc_hash::FxHashMap;

    use super::{Table, WEIGHT_SUM_TOLERANCE};
    use crate::ValidationError;

    fn linear_draw<K>(table: &Table<K>, u: f64) -> &K {
        for (key, bound) in table.bounds() {
            if u < bound {
                return key;
            }
        }
        table.bounds().last().expect("table is never empty").0
    }

    #[test]
    fn distribution_fidelity() {
        let table = Table::build([("a", 0.2), ("b", 0.3), ("c", 0.5)]).expect("valid weights");
        let mut rng = SmallRng::seed_from_u64(19_690_716);
        let total = 100_000;

        let mut counts: FxHashMap<&str, u32> = FxHashMap::default();
        for _ in 0..total {
            *counts.entry(*table.sample(&mut rng)).or_default() += 1;
        }

        for (key, expected) in [("a", 0.2), ("b", 0.3), ("c", 0.5)] {
            let observed = f64::from(counts[key]) / f64::from(total);
            assert!(
                (observed - expected).abs() < 0.01,
                "{key}: observed {observed}, expected {expected}"
            );
        }
    }

    #[test]
    fn zero_selects_first_positive_category() {
        let table =
            Table::build([("none", 0.0), ("first", 0.4), ("second", 0.6)]).expect("valid weights");
        assert_eq!(*table.draw(0.0), "first");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn near_one_selects_last_category() {
        let table = Table::build([("a", 0.5), ("b", 0.5)]).expect("valid weights");
        assert_eq!(*table.draw(1.0 - f64::EPSILON), "b");
        assert_eq!(*table.draw(1.0), "b");
    }

    #[test]
    fn bound_is_exclusive() {
        let table = Table::build([("a", 0.25), ("b", 0.75)]).expect("valid weights");
        assert_eq!(*table.draw(0.249_999), "a");
        assert_eq!(*table.draw(0.25), "b");
    }

    #[test]
    fn sum_must_be_unity() {
        for weights in [[0.5, 0.49], [0.5, 0.51]] {
            let res = Table::build([("a", weights[0]), ("b", weights[1])]);
            assert!(matches!(res, Err(ValidationError::WeightSum { .. })));
        }
        assert!(Table::build([("a", 0.1), ("b", 0.2), ("c", 0.7)]).is_ok());
    }

    #[test]
    fn rejects_out_of_range_weights() {
        for weight in [-0.1, 1.5, f64::NAN, f64::INFINITY] {
            let res = Table::build([("a", weight)]);
            assert!(
                matches!(res, Err(ValidationError::CategoryWeight { .. })),
                "{weight} accepted"
            );
        }
    }

    #[test]
    fn rejects_empty() {
        let res: Result<Table<&str>, _> = Table::build([]);
        assert!(matches!(res, Err(ValidationError::NoCategories)));
        let res = Table::build([("a", 0.0)]);
        assert!(matches!(res, Err(ValidationError::NoCategories)));
    }

    fn unit_weights() -> impl Strategy<Value = Vec<f64>> {
        prop::collection::vec(1_u32..1_000, 1..64).prop_map(|raw| {
            let total: u32 = raw.iter().sum();
            let mut weights: Vec<f64> = raw
                .iter()
                .map(|w| f64::from(*w) / f64::from(total))
                .collect();
            // Push any accumulated rounding into the final weight.
            let head: f64 = weights[..weights.len() - 1].iter().sum();
            let last = weights.len() - 1;
            weights[last] = (1.0 - head).max(0.0);
            weights
        })
    }

    // Binary search must agree with a linear scan for every draw.
    proptest! {
        #[test]
        fn binary_search_matches_linear_scan(weights in unit_weights(), u in 0.0_f64..1.0) {
            let table = Table::build(weights.iter().copied().enumerate()).expect("valid weights");
            prop_assert_eq!(table.draw(u), linear_draw(&table, u));
        }
    }

    proptest! {
        #[test]
        fn bounds_strictly_increase_to_one(weights in unit_weights()) {
            let table = Table::build(weights.iter().copied().enumerate()).expect("valid weights");
            let mut prev = 0.0;
            for (_, bound) in table.bounds() {
                prop_assert!(bound > prev);
                prev = bound;
            }
            prop_assert!((prev - 1.0).abs() <= WEIGHT_SUM_TOLERANCE);
        }
    }
}
