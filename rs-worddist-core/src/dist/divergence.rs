//! KL divergence and related comparisons between finished distributions.
//!
//! Two independent algorithms compute the same value:
//! - `slow_kl_divergence` sums `p * (ln p - ln q)` over every item explicitly
//!   (the union of both distributions and the aggregate, plus one term per
//!   never-seen pseudo-type) and can report each item's contribution.
//! - `fast_kl_divergence` only loops over the two local vocabularies and
//!   folds everything else into two closed-form terms.
//!
//! `KlEngine::Checked` runs both and fails when they disagree.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};

use super::distribution::Distribution;
use super::smoothing::{SmoothedView, SmoothingStrategy};
use super::vocab::VocabItem;
use crate::config::{DistributionConfig, SymmetricMode};
use crate::error::{DistError, Result};

/// Remaining overall mass below this is rounding residue of an empty set.
const EMPTY_MASS_EPSILON: f64 = 1e-12;

/// Which algorithm computes a KL divergence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KlEngine {
	Slow,
	Fast,
	/// Runs both and returns the fast value if they agree within `tolerance`.
	Checked { tolerance: f64 },
}

impl KlEngine {
	pub fn from_config(config: &DistributionConfig) -> Self {
		if config.consistency_check {
			KlEngine::Checked { tolerance: config.tolerance() }
		} else {
			KlEngine::Fast
		}
	}
}

/// Per-item contributions of a slow KL computation.
#[derive(Clone, Debug, Default)]
pub struct KlBreakdown {
	pub total: f64,
	pub per_item: AHashMap<VocabItem, f64>,
	/// Combined contribution of the never-seen pseudo-types.
	pub never_seen: f64,
}

impl KlBreakdown {
	/// Items sorted by decreasing contribution.
	pub fn top_items(&self, limit: usize) -> Vec<(VocabItem, f64)> {
		let mut items: Vec<(VocabItem, f64)> = self.per_item.iter().map(|(item, kl)| (*item, *kl)).collect();
		items.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
		items.truncate(limit);
		items
	}
}

/// `p * (ln p - ln q)` with `0 ln 0 = 0`.
pub(crate) fn kl_term(p: f64, q: f64) -> f64 {
	if p <= 0.0 {
		0.0
	} else if q <= 0.0 {
		f64::INFINITY
	} else {
		p * (p.ln() - q.ln())
	}
}

fn views<'a, S: SmoothingStrategy>(
	a: &'a Distribution<S>,
	b: &'a Distribution<S>,
) -> Result<(SmoothedView<'a>, SmoothedView<'a>)> {
	if !Arc::ptr_eq(a.context(), b.context()) {
		return Err(DistError::ContextMismatch);
	}
	Ok((a.view()?, b.view()?))
}

fn slow_kl<S: SmoothingStrategy>(
	a: &Distribution<S>,
	b: &Distribution<S>,
	partial: bool,
	mut breakdown: Option<&mut KlBreakdown>,
) -> Result<f64> {
	let (pa, pb) = views(a, b)?;
	let strategy = a.context().strategy();

	let mut items: AHashSet<VocabItem> = pa.storage.iter().map(|(item, _)| item).collect();
	if !partial {
		items.extend(pb.storage.iter().map(|(item, _)| item));
		items.extend(pa.stats.known_items().map(|(item, _)| item));
	}

	let mut total = 0.0;
	for item in items {
		let kl = kl_term(strategy.lookup(&pa, item), strategy.lookup(&pb, item));
		total += kl;
		if let Some(breakdown) = breakdown.as_deref_mut() {
			breakdown.per_item.insert(item, kl);
		}
	}

	if !partial {
		let num_unseen = pa.stats.total_num_unseen_item_types();
		let p_share = strategy.never_seen_mass(&pa) / num_unseen as f64;
		let q_share = strategy.never_seen_mass(&pb) / num_unseen as f64;
		let mut never_seen = 0.0;
		for _ in 0..num_unseen {
			never_seen += kl_term(p_share, q_share);
		}
		total += never_seen;
		if let Some(breakdown) = breakdown.as_deref_mut() {
			breakdown.never_seen = never_seen;
		}
	}

	if let Some(breakdown) = breakdown {
		breakdown.total = total;
	}
	Ok(total)
}

/// Explicit item-by-item KL divergence `KL(a || b)`.
///
/// With `partial`, only the items seen in `a` are summed.
pub fn slow_kl_divergence<S: SmoothingStrategy>(a: &Distribution<S>, b: &Distribution<S>, partial: bool) -> Result<f64> {
	slow_kl(a, b, partial, None)
}

/// Like `slow_kl_divergence`, also returning every item's contribution.
pub fn slow_kl_breakdown<S: SmoothingStrategy>(
	a: &Distribution<S>,
	b: &Distribution<S>,
	partial: bool,
) -> Result<KlBreakdown> {
	let mut breakdown = KlBreakdown::default();
	slow_kl(a, b, partial, Some(&mut breakdown))?;
	Ok(breakdown)
}

/// KL divergence `KL(a || b)` in time proportional to the two local
/// vocabularies.
///
/// Components:
/// 1. items seen by both
/// 2. items seen by `a` only (`b` backs off)
/// 3. items seen by `b` only (`a` backs off), skipped when `partial`
/// 4. items known globally but seen by neither: both sides back off in
///    proportion to the same overall probabilities, so the sum collapses to
///    one term over their remaining overall mass (skipped when `partial`)
/// 5. never-seen pseudo-types, which share their mass uniformly on both
///    sides (skipped when `partial`)
pub fn fast_kl_divergence<S: SmoothingStrategy>(a: &Distribution<S>, b: &Distribution<S>, partial: bool) -> Result<f64> {
	let (pa, pb) = views(a, b)?;
	let strategy = a.context().strategy();
	let stats = pa.stats;

	let mut total = 0.0;
	let mut a_known_mass = 0.0;
	for (item, count) in pa.storage.iter() {
		let p = strategy.local_prob(&pa, count);
		let other_count = pb.storage.get(item);
		let q = if other_count > 0.0 {
			strategy.local_prob(&pb, other_count)
		} else {
			strategy.lookup(&pb, item)
		};
		total += kl_term(p, q);
		if let Some(prob) = stats.overall_prob(item) {
			a_known_mass += prob;
		}
	}
	if partial {
		return Ok(total);
	}

	let mut b_only_known_mass = 0.0;
	for (item, count) in pb.storage.iter() {
		if pa.storage.contains(item) {
			continue;
		}
		total += kl_term(strategy.lookup(&pa, item), strategy.local_prob(&pb, count));
		if let Some(prob) = stats.overall_prob(item) {
			b_only_known_mass += prob;
		}
	}

	let remaining = stats.total_item_prob() - a_known_mass - b_only_known_mass;
	if remaining > EMPTY_MASS_EPSILON {
		let p_coef = strategy.backoff_coefficient(&pa);
		let q_coef = strategy.backoff_coefficient(&pb);
		total += kl_term(p_coef * remaining, q_coef * remaining);
	}

	total += kl_term(strategy.never_seen_mass(&pa), strategy.never_seen_mass(&pb));
	Ok(total)
}

/// Two infinities agree only with each other.
pub(crate) fn values_agree(slow: f64, fast: f64, tolerance: f64) -> bool {
	if slow.is_infinite() || fast.is_infinite() { slow == fast } else { (slow - fast).abs() <= tolerance }
}

/// Runs both algorithms and fails if they differ by more than `tolerance`.
pub fn checked_kl_divergence<S: SmoothingStrategy>(
	a: &Distribution<S>,
	b: &Distribution<S>,
	partial: bool,
	tolerance: f64,
) -> Result<f64> {
	let slow = slow_kl_divergence(a, b, partial)?;
	let fast = fast_kl_divergence(a, b, partial)?;
	if !values_agree(slow, fast, tolerance) {
		log::warn!("KL mismatch (partial = {partial}): slow = {slow}, fast = {fast}");
		return Err(DistError::AssertionMismatch { slow, fast });
	}
	Ok(fast)
}

impl<S: SmoothingStrategy> Distribution<S> {
	/// `KL(self || other)` with the fast algorithm.
	pub fn kl_divergence(&self, other: &Distribution<S>, partial: bool) -> Result<f64> {
		fast_kl_divergence(self, other, partial)
	}

	pub fn kl_divergence_with(&self, other: &Distribution<S>, partial: bool, engine: KlEngine) -> Result<f64> {
		match engine {
			KlEngine::Slow => slow_kl_divergence(self, other, partial),
			KlEngine::Fast => fast_kl_divergence(self, other, partial),
			KlEngine::Checked { tolerance } => checked_kl_divergence(self, other, partial, tolerance),
		}
	}

	pub fn kl_breakdown(&self, other: &Distribution<S>, partial: bool) -> Result<KlBreakdown> {
		slow_kl_breakdown(self, other, partial)
	}

	/// Average of two one-way divergences, combined according to `mode`.
	pub fn symmetric_kldiv(&self, other: &Distribution<S>, partial: bool, mode: SymmetricMode) -> Result<f64> {
		let forward = self.kl_divergence(other, partial)?;
		let backward = match mode {
			SymmetricMode::BothDirections => other.kl_divergence(self, partial)?,
			SymmetricMode::SourceCompatible => self.kl_divergence(other, partial)?,
		};
		Ok(0.5 * forward + 0.5 * backward)
	}

	/// Cosine of the angle between the two probability vectors.
	///
	/// Unsmoothed vectors use relative counts; smoothed ones use `lookup`.
	/// With `partial`, only the items of `self` are compared.
	pub fn cosine_similarity(&self, other: &Distribution<S>, partial: bool, smoothed: bool) -> Result<f64> {
		let (pa, pb) = views(self, other)?;
		let strategy = self.context().strategy();

		let mut items: AHashSet<VocabItem> = pa.storage.iter().map(|(item, _)| item).collect();
		if !partial {
			items.extend(pb.storage.iter().map(|(item, _)| item));
		}

		let prob = |view: &SmoothedView<'_>, item: VocabItem| {
			if smoothed {
				strategy.lookup(view, item)
			} else if view.storage.num_tokens() > 0.0 {
				view.storage.get(item) / view.storage.num_tokens()
			} else {
				0.0
			}
		};

		let (mut dot, mut norm_a, mut norm_b) = (0.0, 0.0, 0.0);
		for item in items {
			let (p, q) = (prob(&pa, item), prob(&pb, item));
			dot += p * q;
			norm_a += p * p;
			norm_b += q * q;
		}
		if norm_a == 0.0 || norm_b == 0.0 {
			return Ok(0.0);
		}
		Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dist::context::Context;
	use crate::dist::smoothing::Unsmoothed;
	use proptest::prelude::*;

	const TOLERANCE: f64 = 1e-8;

	fn corpus<S: SmoothingStrategy>(context: &Arc<Context<S>>, docs: &[Vec<u32>]) -> Vec<Distribution<S>> {
		build_corpus(context, docs, true)
	}

	/// With `private`, every document also gets an item of its own.
	fn build_corpus<S: SmoothingStrategy>(
		context: &Arc<Context<S>>,
		docs: &[Vec<u32>],
		private: bool,
	) -> Vec<Distribution<S>> {
		let mut dists: Vec<Distribution<S>> = docs
			.iter()
			.enumerate()
			.map(|(j, counts)| {
				let mut dist = context.new_distribution(true);
				if private {
					dist.add_count(&format!("doc{j}"), 1.0).unwrap();
				}
				for (i, count) in counts.iter().enumerate() {
					dist.add_count(&format!("w{i}"), *count as f64).unwrap();
				}
				dist.finish_before_global(0).unwrap();
				dist
			})
			.collect();
		context.finish_global().unwrap();
		for dist in &mut dists {
			dist.finish_after_global().unwrap();
		}
		dists
	}

	fn sample() -> (Arc<Context>, Vec<Distribution>) {
		let context = Context::pseudo_good_turing();
		let dists = corpus(&context, &[vec![5, 2, 1, 0, 0], vec![4, 0, 0, 3, 1], vec![6, 1, 0, 0, 0]]);
		(context, dists)
	}

	#[test]
	fn test_kl_to_self_is_zero() {
		let (_context, dists) = sample();
		for dist in &dists {
			for partial in [true, false] {
				assert!(dist.kl_divergence(dist, partial).unwrap().abs() < TOLERANCE);
				assert!(slow_kl_divergence(dist, dist, partial).unwrap().abs() < TOLERANCE);
			}
		}
	}

	#[test]
	fn test_slow_and_fast_agree_on_sample() {
		let (_context, dists) = sample();
		for a in &dists {
			for b in &dists {
				for partial in [true, false] {
					let slow = slow_kl_divergence(a, b, partial).unwrap();
					let fast = fast_kl_divergence(a, b, partial).unwrap();
					assert!((slow - fast).abs() < TOLERANCE, "slow {slow} fast {fast}");
				}
			}
		}
	}

	#[test]
	fn test_held_out_document_with_novel_items() {
		let (context, dists) = sample();
		let mut held_out = context.new_distribution(false);
		held_out.add_items(["w0", "w0", "w3", "unknown", "other"]).unwrap();
		held_out.finish(0).unwrap();
		for dist in &dists {
			for partial in [true, false] {
				let checked = held_out.kl_divergence_with(dist, partial, KlEngine::Checked { tolerance: TOLERANCE });
				assert!(checked.is_ok());
				let reverse = dist.kl_divergence_with(&held_out, partial, KlEngine::Checked { tolerance: TOLERANCE });
				assert!(reverse.is_ok());
			}
		}
	}

	#[test]
	fn test_full_kl_is_non_negative() {
		let (_context, dists) = sample();
		for a in &dists {
			for b in &dists {
				assert!(a.kl_divergence(b, false).unwrap() >= -TOLERANCE);
			}
		}
	}

	#[test]
	fn test_document_covering_the_corpus() {
		let context = Context::pseudo_good_turing();
		// The first document holds every training word
		let dists = build_corpus(&context, &[vec![3, 1], vec![1, 0]], false);
		assert_eq!(dists[0].overall_unseen_mass(), 0.0);
		for a in &dists {
			for b in &dists {
				for partial in [true, false] {
					let checked = a.kl_divergence_with(b, partial, KlEngine::Checked { tolerance: TOLERANCE }).unwrap();
					if !partial {
						assert!(checked >= -TOLERANCE, "KL = {checked}");
					}
				}
			}
		}
		assert!(dists[0].kl_divergence(&dists[1], false).unwrap() > 0.0);
	}

	#[test]
	fn test_breakdown_sums_to_total() {
		let (_context, dists) = sample();
		let breakdown = dists[0].kl_breakdown(&dists[1], false).unwrap();
		let sum: f64 = breakdown.per_item.values().sum::<f64>() + breakdown.never_seen;
		assert!((sum - breakdown.total).abs() < 1e-12);
		let top = breakdown.top_items(2);
		assert_eq!(top.len(), 2);
		assert!(top[0].1 >= top[1].1);

		let partial = dists[0].kl_breakdown(&dists[1], true).unwrap();
		assert_eq!(partial.per_item.len(), dists[0].num_types());
		assert_eq!(partial.never_seen, 0.0);
	}

	#[test]
	fn test_symmetric_modes() {
		let (_context, dists) = sample();
		let (a, b) = (&dists[0], &dists[1]);
		let ab = a.kl_divergence(b, false).unwrap();
		let ba = b.kl_divergence(a, false).unwrap();

		let both = a.symmetric_kldiv(b, false, SymmetricMode::BothDirections).unwrap();
		assert!((both - 0.5 * (ab + ba)).abs() < 1e-12);
		let reverse = b.symmetric_kldiv(a, false, SymmetricMode::BothDirections).unwrap();
		assert!((both - reverse).abs() < 1e-12);

		// The source-compatible average collapses to the one-way divergence
		let source = a.symmetric_kldiv(b, false, SymmetricMode::SourceCompatible).unwrap();
		assert!((source - ab).abs() < 1e-12);
	}

	#[test]
	fn test_mismatched_contexts_are_rejected() {
		let (_context, dists) = sample();
		let other = Context::pseudo_good_turing();
		let foreign = corpus(&other, &[vec![1, 2]]);
		assert!(matches!(dists[0].kl_divergence(&foreign[0], true), Err(DistError::ContextMismatch)));
	}

	#[test]
	fn test_unfinished_distribution_is_rejected() {
		let (context, dists) = sample();
		let open = context.new_distribution(false);
		assert!(dists[0].kl_divergence(&open, true).unwrap_err().is_lifecycle_violation());
	}

	#[test]
	fn test_unsmoothed_engines_agree() {
		let context = Context::new(Unsmoothed);
		let dists = corpus(&context, &[vec![2, 1, 1], vec![2, 1, 1]]);
		// Each document has a private item the other lacks: infinite both ways
		let slow = slow_kl_divergence(&dists[0], &dists[1], false).unwrap();
		let checked = checked_kl_divergence(&dists[0], &dists[1], false, TOLERANCE).unwrap();
		assert!(slow.is_infinite());
		assert_eq!(slow, checked);
	}

	#[test]
	fn test_cosine_similarity() {
		let (_context, dists) = sample();
		let (a, b) = (&dists[0], &dists[2]);
		for smoothed in [true, false] {
			let self_sim = a.cosine_similarity(a, false, smoothed).unwrap();
			assert!((self_sim - 1.0).abs() < 1e-12);
			let sim = a.cosine_similarity(b, false, smoothed).unwrap();
			assert!(sim > 0.0 && sim < 1.0);
		}
	}

	proptest! {
		#[test]
		fn fast_matches_slow_on_small_vocabularies(
			docs in prop::collection::vec(prop::collection::vec(0u32..6, 1..16), 2..5),
			held_out in prop::collection::vec(0u32..4, 1..20),
			private in any::<bool>(),
		) {
			let context = Context::pseudo_good_turing();
			let dists = build_corpus(&context, &docs, private);
			let mut eval = context.new_distribution(false);
			for (i, count) in held_out.iter().enumerate() {
				eval.add_count(&format!("w{i}"), *count as f64).unwrap();
			}
			eval.add_count("eval-only", 1.0).unwrap();
			eval.finish(0).unwrap();

			let all: Vec<&Distribution> = dists.iter().chain(std::iter::once(&eval)).collect();
			for &a in &all {
				for &b in &all {
					for partial in [true, false] {
						let slow = slow_kl_divergence(a, b, partial).unwrap();
						let fast = fast_kl_divergence(a, b, partial).unwrap();
						prop_assert!((slow - fast).abs() < TOLERANCE, "slow {} fast {}", slow, fast);
					}
				}
			}
		}

		#[test]
		fn full_kl_obeys_gibbs_inequality(
			docs in prop::collection::vec(prop::collection::vec(0u32..6, 1..12), 2..5),
			private in any::<bool>(),
		) {
			prop_assume!(private || docs.iter().all(|counts| counts.iter().any(|&count| count > 0)));
			let context = Context::pseudo_good_turing();
			let dists = build_corpus(&context, &docs, private);
			for a in &dists {
				prop_assert!(a.kl_divergence(a, false).unwrap().abs() < TOLERANCE);
				for b in &dists {
					prop_assert!(a.kl_divergence(b, false).unwrap() >= -TOLERANCE);
				}
			}
		}
	}
}
