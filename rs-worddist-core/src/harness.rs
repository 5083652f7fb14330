//! Differential harness comparing the slow and fast KL divergence on small
//! random corpora.
//!
//! Every trial builds a fresh context with a handful of training documents
//! over a vocabulary of at most `MAX_VOCAB_SIZE` words plus one evaluation
//! document containing words the training corpus never saw. Both
//! algorithms are then run on every ordered pair, partial and full.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dist::context::Context;
use crate::dist::distribution::Distribution;
use crate::dist::divergence::{fast_kl_divergence, slow_kl_divergence, values_agree};
use crate::error::Result;

pub const MAX_VOCAB_SIZE: usize = 20;

/// A pair on which the two algorithms disagreed.
#[derive(Clone, Debug, PartialEq)]
pub struct Mismatch {
	pub trial: usize,
	pub from: usize,
	pub to: usize,
	pub partial: bool,
	pub slow: f64,
	pub fast: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HarnessReport {
	pub trials: usize,
	pub comparisons: usize,
	/// Largest finite `|slow - fast|` seen.
	pub max_difference: f64,
	pub mismatches: Vec<Mismatch>,
}

impl HarnessReport {
	pub fn is_consistent(&self) -> bool {
		self.mismatches.is_empty()
	}
}

/// Seeded generator of random corpora for slow/fast comparisons.
pub struct DifferentialHarness {
	rng: StdRng,
	vocab_size: usize,
	num_training: usize,
	max_count: u32,
	tolerance: f64,
}

impl DifferentialHarness {
	/// Same seed, same corpora.
	pub fn new(seed: u64) -> Self {
		Self { rng: StdRng::seed_from_u64(seed), vocab_size: 12, num_training: 4, max_count: 6, tolerance: 1e-8 }
	}

	/// Clamped to `1..=MAX_VOCAB_SIZE`.
	pub fn with_vocab_size(mut self, vocab_size: usize) -> Self {
		self.vocab_size = vocab_size.clamp(1, MAX_VOCAB_SIZE);
		self
	}

	pub fn with_training_documents(mut self, num_training: usize) -> Self {
		self.num_training = num_training.max(1);
		self
	}

	pub fn with_tolerance(mut self, tolerance: f64) -> Self {
		self.tolerance = tolerance;
		self
	}

	/// Random counts over the shared vocabulary. Never empty.
	fn random_counts(&mut self) -> Vec<u32> {
		let mut counts: Vec<u32> = (0..self.vocab_size)
			.map(|_| if self.rng.random_bool(0.5) { self.rng.random_range(1..=self.max_count) } else { 0 })
			.collect();
		if counts.iter().all(|&count| count == 0) {
			let index = self.rng.random_range(0..self.vocab_size);
			counts[index] = 1;
		}
		counts
	}

	fn fill(dist: &mut Distribution, counts: &[u32]) -> Result<()> {
		for (i, &count) in counts.iter().enumerate() {
			if count > 0 {
				dist.add_count(&format!("w{i}"), f64::from(count))?;
			}
		}
		Ok(())
	}

	fn build_trial(&mut self) -> Result<(Arc<Context>, Vec<Distribution>)> {
		let context = Context::pseudo_good_turing();
		let mut dists = Vec::with_capacity(self.num_training + 1);
		for _ in 0..self.num_training {
			let counts = self.random_counts();
			let mut dist = context.new_distribution(true);
			Self::fill(&mut dist, &counts)?;
			dist.finish_before_global(0)?;
			dists.push(dist);
		}
		context.finish_global()?;
		for dist in &mut dists {
			dist.finish_after_global()?;
		}

		let counts = self.random_counts();
		let mut eval = context.new_distribution(false);
		Self::fill(&mut eval, &counts)?;
		for novel in 0..self.rng.random_range(1..=3) {
			eval.add_count(&format!("novel{novel}"), f64::from(self.rng.random_range(1..=self.max_count)))?;
		}
		eval.finish(0)?;
		dists.push(eval);
		Ok((context, dists))
	}

	/// Runs `trials` random corpora and collects every disagreement.
	pub fn run(&mut self, trials: usize) -> Result<HarnessReport> {
		let mut report = HarnessReport::default();
		for trial in 0..trials {
			let (_, dists) = self.build_trial()?;
			for (from, a) in dists.iter().enumerate() {
				for (to, b) in dists.iter().enumerate() {
					for partial in [true, false] {
						let slow = slow_kl_divergence(a, b, partial)?;
						let fast = fast_kl_divergence(a, b, partial)?;
						report.comparisons += 1;
						if slow.is_finite() && fast.is_finite() {
							report.max_difference = report.max_difference.max((slow - fast).abs());
						}
						if !values_agree(slow, fast, self.tolerance) {
							log::warn!("trial {trial}: KL({from} || {to}) partial = {partial}: slow = {slow}, fast = {fast}");
							report.mismatches.push(Mismatch { trial, from, to, partial, slow, fast });
						}
					}
				}
			}
			report.trials += 1;
		}
		log::info!(
			"differential harness: {} trials, {} comparisons, max difference {:e}",
			report.trials,
			report.comparisons,
			report.max_difference
		);
		Ok(report)
	}

	/// Builds one random corpus without comparing anything. The evaluation
	/// document comes last.
	pub fn sample(&mut self) -> Result<(Arc<Context>, Vec<Distribution>)> {
		self.build_trial()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_fast_matches_slow_on_random_corpora() {
		let report = DifferentialHarness::new(7).run(25).unwrap();
		assert_eq!(report.trials, 25);
		// 4 training + 1 evaluation document, every ordered pair, two modes
		assert_eq!(report.comparisons, 25 * 5 * 5 * 2);
		assert!(report.is_consistent(), "{:?}", report.mismatches);
		assert!(report.max_difference < 1e-8);
	}

	#[test]
	fn test_full_vocabulary_and_many_documents() {
		let mut harness = DifferentialHarness::new(99).with_vocab_size(50).with_training_documents(8);
		assert_eq!(harness.vocab_size, MAX_VOCAB_SIZE);
		assert!(harness.run(10).unwrap().is_consistent());
	}

	#[test]
	fn test_same_seed_same_corpus() {
		let (_, first) = DifferentialHarness::new(3).sample().unwrap();
		let (_, second) = DifferentialHarness::new(3).sample().unwrap();
		assert_eq!(first.len(), second.len());
		for (a, b) in first.iter().zip(&second) {
			assert_eq!(a.num_tokens(), b.num_tokens());
			assert_eq!(a.num_types(), b.num_types());
		}
	}

	#[test]
	fn test_mismatches_are_reported() {
		// A negative tolerance rejects every finite pair
		let report = DifferentialHarness::new(11).with_tolerance(-1.0).run(2).unwrap();
		assert!(!report.is_consistent());
		assert_eq!(report.mismatches.len(), report.comparisons);
		assert_eq!(report.mismatches[0].trial, 0);
	}
}
