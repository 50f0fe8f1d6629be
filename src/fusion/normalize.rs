//! Feature normalization: clip to a declared range and impute missing
//! values from a per-feature EWMA, or zero if the feature has never been
//! observed.

use std::collections::HashMap;

const EWMA_ALPHA: f64 = 0.3;

/// Tracks a per-feature exponential moving average so a missing reading
/// (channel stopped, insufficient window coverage) can be imputed with
/// the feature's recent trend rather than a hard zero.
#[derive(Default)]
pub struct EwmaImputer {
    state: HashMap<&'static str, f64>,
}

impl EwmaImputer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clip `value` to `[lo, hi]`, update the feature's EWMA, and return
    /// the clipped value.
    pub fn observe(&mut self, key: &'static str, value: f64, lo: f64, hi: f64) -> f64 {
        let clipped = value.clamp(lo, hi);
        let next = match self.state.get(key) {
            Some(prev) => EWMA_ALPHA * clipped + (1.0 - EWMA_ALPHA) * prev,
            None => clipped,
        };
        self.state.insert(key, next);
        clipped
    }

    /// The last-known EWMA for a feature that is missing this tick, or 0
    /// if it has never been observed.
    pub fn impute(&self, key: &'static str) -> f64 {
        self.state.get(key).copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_observed_feature_imputes_zero() {
        let imputer = EwmaImputer::new();
        assert_eq!(imputer.impute("hr"), 0.0);
    }

    #[test]
    fn observed_feature_imputes_last_ewma() {
        let mut imputer = EwmaImputer::new();
        imputer.observe("hr", 0.8, 0.0, 1.0);
        imputer.observe("hr", 0.6, 0.0, 1.0);
        let imputed = imputer.impute("hr");
        assert!(imputed > 0.6 && imputed < 0.8);
    }

    #[test]
    fn out_of_range_values_are_clipped() {
        let mut imputer = EwmaImputer::new();
        assert_eq!(imputer.observe("x", 5.0, 0.0, 1.0), 1.0);
        assert_eq!(imputer.observe("y", -5.0, 0.0, 1.0), 0.0);
    }
}
