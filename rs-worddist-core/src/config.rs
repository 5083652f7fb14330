use serde::{Deserialize, Serialize};

use crate::error::{DistError, Result};

/// How `symmetric_kldiv` combines the two one-way divergences.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SymmetricMode {
	/// `0.5 * KL(A||B) + 0.5 * KL(B||A)`.
	#[default]
	BothDirections,
	/// `0.5 * KL(A||B) + 0.5 * KL(A||B)`, i.e. the one-way divergence.
	/// Kept for parity with results produced by the older geolocation runs.
	SourceCompatible,
}

/// Run-wide settings for building and comparing distributions.
///
/// # Invariants
/// - `tolerance` is strictly positive
/// - `ngram_order` is at least 1
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DistributionConfig {
	/// Items with a count below this are dropped at `finish_before_global`.
	pub min_count: u64,

	/// Default `partial` flag used when ranking cells.
	pub partial: bool,

	/// Compute both divergence forms and fail on disagreement.
	pub consistency_check: bool,

	/// Maximum allowed slow/fast difference when `consistency_check` is on.
	pub(crate) tolerance: f64,

	pub symmetric_mode: SymmetricMode,

	/// Drop stopwords before adding tokens.
	pub ignore_stopwords: bool,

	/// 1 for unigrams, n >= 2 for space-joined n-grams.
	pub(crate) ngram_order: usize,

	/// Pipeline worker threads (0 = one per CPU).
	pub workers: usize,
}

impl Default for DistributionConfig {
	fn default() -> Self {
		Self {
			min_count: 0,
			partial: true,
			consistency_check: false,
			tolerance: 1e-8,
			symmetric_mode: SymmetricMode::default(),
			ignore_stopwords: true,
			ngram_order: 1,
			workers: 0,
		}
	}
}

impl DistributionConfig {
	pub fn tolerance(&self) -> f64 {
		self.tolerance
	}

	/// Sets the slow/fast comparison tolerance.
	///
	/// # Errors
	/// Returns an error if the value is not a positive finite number.
	pub fn set_tolerance(&mut self, tolerance: f64) -> Result<()> {
		if !(tolerance.is_finite() && tolerance > 0.0) {
			return Err(DistError::InvalidConfig(format!("tolerance must be > 0, got {tolerance}")));
		}
		self.tolerance = tolerance;
		Ok(())
	}

	pub fn ngram_order(&self) -> usize {
		self.ngram_order
	}

	/// Sets the n-gram order used when ingesting documents.
	///
	/// # Errors
	/// Returns an error if `n == 0`.
	pub fn set_ngram_order(&mut self, n: usize) -> Result<()> {
		if n == 0 {
			return Err(DistError::InvalidConfig("ngram order must be >= 1".to_owned()));
		}
		self.ngram_order = n;
		Ok(())
	}

	/// Number of worker threads the pipeline actually uses.
	pub fn effective_workers(&self) -> usize {
		if self.workers == 0 { num_cpus::get().max(1) } else { self.workers }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults() {
		let config = DistributionConfig::default();
		assert_eq!(config.min_count, 0);
		assert!(config.partial);
		assert!(!config.consistency_check);
		assert_eq!(config.tolerance(), 1e-8);
		assert_eq!(config.symmetric_mode, SymmetricMode::BothDirections);
		assert_eq!(config.ngram_order(), 1);
		assert!(config.effective_workers() >= 1);
	}

	#[test]
	fn test_rejects_invalid_values() {
		let mut config = DistributionConfig::default();
		assert!(config.set_tolerance(0.0).is_err());
		assert!(config.set_tolerance(f64::NAN).is_err());
		assert!(config.set_ngram_order(0).is_err());
		config.set_tolerance(1e-6).unwrap();
		config.set_ngram_order(2).unwrap();
		assert_eq!(config.tolerance(), 1e-6);
		assert_eq!(config.ngram_order(), 2);
	}
}
