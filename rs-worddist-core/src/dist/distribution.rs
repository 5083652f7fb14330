use std::fmt;
use std::sync::Arc;

use super::context::Context;
use super::smoothing::{PseudoGoodTuring, SmoothedView, SmoothingStrategy};
use super::storage::ItemStorage;
use super::vocab::VocabItem;
use crate::error::{DistError, Result};

/// Overall unseen masses this close to zero are rounding residue.
const RESIDUAL_MASS_TOLERANCE: f64 = 1e-10;

/// Lifecycle of a distribution. States only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
	/// Accepting items and merges.
	Open,
	/// Local unseen mass computed; waiting for the global aggregate.
	LocallyFinished,
	/// Immutable and queryable.
	GloballyFinished,
}

/// A smoothed distribution over vocabulary items for one document or cell.
///
/// # Responsibilities
/// - Accumulate item counts while `Open`
/// - Compute the local unseen mass and (for training distributions) feed
///   the context's global aggregate
/// - Answer smoothed probability queries once globally finished
///
/// # Invariants
/// - `unseen_mass` is set exactly once, leaving `Open`
/// - `overall_unseen_mass` is set exactly once, leaving `LocallyFinished`,
///   and is never negative
pub struct Distribution<S: SmoothingStrategy = PseudoGoodTuring> {
	context: Arc<Context<S>>,
	storage: ItemStorage,
	training: bool,
	state: Lifecycle,
	unseen_mass: f64,
	overall_unseen_mass: f64,
}

impl<S: SmoothingStrategy> Distribution<S> {
	pub(crate) fn new(context: Arc<Context<S>>, training: bool) -> Self {
		Self {
			context,
			storage: ItemStorage::new(),
			training,
			state: Lifecycle::Open,
			unseen_mass: 0.0,
			overall_unseen_mass: 0.0,
		}
	}

	fn require(&self, expected: Lifecycle, operation: &'static str) -> Result<()> {
		if self.state != expected {
			return Err(DistError::LifecycleViolation { operation, state: self.state });
		}
		Ok(())
	}

	/// Adds one occurrence of every token.
	///
	/// # Errors
	/// `LifecycleViolation` if the distribution is not `Open`.
	pub fn add_items<I, T>(&mut self, tokens: I) -> Result<()>
	where
		I: IntoIterator<Item = T>,
		T: AsRef<str>,
	{
		self.require(Lifecycle::Open, "add items")?;
		for token in tokens {
			let item = self.context.vocab().memoize(token.as_ref());
			self.storage.add(item, 1.0);
		}
		Ok(())
	}

	/// Adds one occurrence of every n-gram of `tokens`, joined by spaces.
	///
	/// Sequences shorter than `n` add nothing; `n <= 1` falls back to
	/// `add_items`.
	pub fn add_ngrams<T: AsRef<str>>(&mut self, tokens: &[T], n: usize) -> Result<()> {
		if n <= 1 {
			return self.add_items(tokens);
		}
		self.require(Lifecycle::Open, "add n-grams")?;
		if tokens.len() < n {
			return Ok(());
		}
		for i in 0..=tokens.len() - n {
			let ngram = tokens[i..i + n].iter().map(|token| token.as_ref()).collect::<Vec<&str>>().join(" ");
			let item = self.context.vocab().memoize(&ngram);
			self.storage.add(item, 1.0);
		}
		Ok(())
	}

	/// Adds a pre-counted word, e.g. from a word-count listing.
	pub fn add_count(&mut self, word: &str, count: f64) -> Result<()> {
		self.require(Lifecycle::Open, "add counts")?;
		let item = self.context.vocab().memoize(word);
		self.storage.add(item, count);
		Ok(())
	}

	/// Adds `count` occurrences of an already memoized item.
	///
	/// # Errors
	/// `UnknownItem` if the id was not issued by this context's vocabulary.
	pub fn add_item(&mut self, item: VocabItem, count: f64) -> Result<()> {
		self.require(Lifecycle::Open, "add items")?;
		if !item.is_valid() || item.id() as usize > self.context.vocab().len() {
			return Err(DistError::UnknownItem(item.id()));
		}
		self.storage.add(item, count);
		Ok(())
	}

	/// Adds `weight * count` for every item of `other`.
	///
	/// # Errors
	/// - `LifecycleViolation` if either side is not `Open`
	/// - `ContextMismatch` if the two were created by different contexts
	/// - `InvalidConfig` if `weight` is outside `[0, 1]`
	pub fn merge(&mut self, other: &Distribution<S>, weight: f64) -> Result<()> {
		self.require(Lifecycle::Open, "merge into")?;
		other.require(Lifecycle::Open, "merge from")?;
		if !Arc::ptr_eq(&self.context, &other.context) {
			return Err(DistError::ContextMismatch);
		}
		if !(0.0..=1.0).contains(&weight) {
			return Err(DistError::InvalidConfig(format!("merge weight must be in [0, 1], got {weight}")));
		}
		for (item, count) in other.storage.iter() {
			self.storage.add(item, weight * count);
		}
		Ok(())
	}

	/// Ends the local phase: prunes rare items, computes the local unseen
	/// mass and, for training distributions, contributes to the aggregate.
	///
	/// # Errors
	/// - `LifecycleViolation` if not `Open`
	/// - `BarrierViolation` if a training distribution finishes after the
	///   aggregate was frozen
	pub fn finish_before_global(&mut self, min_count: u64) -> Result<()> {
		self.require(Lifecycle::Open, "finish before global")?;
		if self.training && self.context.is_frozen() {
			return Err(DistError::BarrierViolation(
				"training distribution finished after the aggregate was frozen".to_owned(),
			));
		}
		if min_count > 0 {
			let pruned = self.storage.prune_below(min_count as f64);
			if pruned > 0 {
				log::debug!("pruned {pruned} item(s) with count < {min_count}");
			}
		}
		if self.training {
			self.context.note_distribution(&self.storage)?;
			self.context.release_open_training();
		}
		self.unseen_mass = self.context.strategy().compute_local_unseen_mass(&self.storage);
		self.state = Lifecycle::LocallyFinished;
		log::debug!(
			"locally finished: {} tokens, {} types, unseen mass {:.6}",
			self.storage.num_tokens(),
			self.storage.num_types(),
			self.unseen_mass
		);
		Ok(())
	}

	/// Ends the global phase: computes the overall unseen mass against the
	/// frozen aggregate. The distribution is immutable afterwards.
	///
	/// # Errors
	/// - `LifecycleViolation` if not `LocallyFinished`
	/// - `BarrierViolation` if the aggregate is not frozen
	/// - `InconsistentAggregate` if the overall unseen mass is negative
	pub fn finish_after_global(&mut self) -> Result<()> {
		self.require(Lifecycle::LocallyFinished, "finish after global")?;
		let stats = self.context.require_stats()?;
		let mass = self.context.strategy().compute_global_unseen_mass(&self.storage, stats);
		if mass < -RESIDUAL_MASS_TOLERANCE || mass.is_nan() {
			return Err(DistError::InconsistentAggregate { overall_unseen_mass: mass });
		}
		self.overall_unseen_mass = if mass < RESIDUAL_MASS_TOLERANCE { 0.0 } else { mass };
		self.state = Lifecycle::GloballyFinished;
		log::debug!("globally finished: overall unseen mass {:.6}", self.overall_unseen_mass);
		Ok(())
	}

	/// Runs both finish steps, for distributions that do not feed the
	/// aggregate (evaluation documents, cells built after training).
	///
	/// # Errors
	/// `BarrierViolation` if the aggregate is not frozen yet, plus anything
	/// the two steps return.
	pub fn finish(&mut self, min_count: u64) -> Result<()> {
		self.context.require_stats()?;
		self.finish_before_global(min_count)?;
		self.finish_after_global()
	}

	pub fn state(&self) -> Lifecycle {
		self.state
	}

	pub fn is_finished(&self) -> bool {
		self.state == Lifecycle::GloballyFinished
	}

	pub fn is_training(&self) -> bool {
		self.training
	}

	pub fn context(&self) -> &Arc<Context<S>> {
		&self.context
	}

	pub fn storage(&self) -> &ItemStorage {
		&self.storage
	}

	/// Stored items and their counts, in no particular order.
	pub fn items(&self) -> impl Iterator<Item = (VocabItem, f64)> + '_ {
		self.storage.iter()
	}

	pub fn count(&self, item: VocabItem) -> f64 {
		self.storage.get(item)
	}

	pub fn num_tokens(&self) -> f64 {
		self.storage.num_tokens()
	}

	pub fn num_types(&self) -> usize {
		self.storage.num_types()
	}

	/// Mass reserved for locally unseen items (0 while `Open`).
	pub fn unseen_mass(&self) -> f64 {
		self.unseen_mass
	}

	/// Overall mass of the locally unseen items (0 until globally finished).
	pub fn overall_unseen_mass(&self) -> f64 {
		self.overall_unseen_mass
	}

	/// Query view, only available once globally finished.
	pub fn view(&self) -> Result<SmoothedView<'_>> {
		self.require(Lifecycle::GloballyFinished, "query")?;
		Ok(SmoothedView {
			storage: &self.storage,
			stats: self.context.require_stats()?,
			unseen_mass: self.unseen_mass,
			overall_unseen_mass: self.overall_unseen_mass,
		})
	}

	/// Smoothed probability of `item`.
	pub fn lookup(&self, item: VocabItem) -> Result<f64> {
		let view = self.view()?;
		Ok(self.context.strategy().lookup(&view, item))
	}

	/// Smoothed probability of a word; unknown words get the never-seen share.
	pub fn lookup_str(&self, word: &str) -> Result<f64> {
		let view = self.view()?;
		let strategy = self.context.strategy();
		Ok(match self.context.vocab().lookup(word) {
			Some(item) => strategy.lookup(&view, item),
			None => strategy.never_seen_mass(&view) / view.stats.total_num_unseen_item_types() as f64,
		})
	}

	/// Total probability of all items never seen in training.
	pub fn never_seen_mass(&self) -> Result<f64> {
		let view = self.view()?;
		Ok(self.context.strategy().never_seen_mass(&view))
	}

	/// Item with the highest count among those accepted by `predicate`.
	/// Ties go to the lowest id.
	pub fn most_common_item<F>(&self, mut predicate: F) -> Option<VocabItem>
	where
		F: FnMut(VocabItem) -> bool,
	{
		self.storage
			.iter()
			.filter(|(item, _)| predicate(*item))
			.max_by(|(a_item, a_count), (b_item, b_count)| {
				a_count.total_cmp(b_count).then_with(|| b_item.cmp(a_item))
			})
			.map(|(item, _)| item)
	}
}

impl<S: SmoothingStrategy> Drop for Distribution<S> {
	fn drop(&mut self) {
		if self.training && self.state == Lifecycle::Open {
			self.context.release_open_training();
		}
	}
}

impl<S: SmoothingStrategy> fmt::Debug for Distribution<S> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Distribution")
			.field("state", &self.state)
			.field("training", &self.training)
			.field("num_tokens", &self.storage.num_tokens())
			.field("num_types", &self.storage.num_types())
			.field("unseen_mass", &self.unseen_mass)
			.field("overall_unseen_mass", &self.overall_unseen_mass)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dist::smoothing::Unsmoothed;
	use proptest::prelude::*;

	fn finished_training(context: &Arc<Context>, docs: &[&[(&str, u32)]]) -> Vec<Distribution> {
		let mut dists: Vec<Distribution> = docs
			.iter()
			.map(|counts| {
				let mut dist = context.new_distribution(true);
				for (word, count) in counts.iter() {
					dist.add_count(word, *count as f64).unwrap();
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

	fn total_mass(dist: &Distribution) -> f64 {
		let stats = dist.context().stats().unwrap();
		let mut items: Vec<VocabItem> = stats.known_items().map(|(item, _)| item).collect();
		items.extend(dist.storage().iter().map(|(item, _)| item).filter(|item| !stats.contains(*item)));
		let seen: f64 = items.iter().map(|item| dist.lookup(*item).unwrap()).sum();
		seen + dist.never_seen_mass().unwrap()
	}

	#[test]
	fn test_lifecycle_order() {
		let context = Context::pseudo_good_turing();
		let mut dist = context.new_distribution(true);
		dist.add_items(["a", "b", "a"]).unwrap();
		assert_eq!(dist.state(), Lifecycle::Open);
		assert!(dist.lookup(context.vocab().memoize("a")).is_err());
		assert!(dist.finish_after_global().unwrap_err().is_lifecycle_violation());

		dist.finish_before_global(0).unwrap();
		assert_eq!(dist.state(), Lifecycle::LocallyFinished);
		assert!(dist.finish_after_global().unwrap_err().is_lifecycle_violation());

		context.finish_global().unwrap();
		dist.finish_after_global().unwrap();
		assert!(dist.is_finished());
		assert!(dist.finish_after_global().unwrap_err().is_lifecycle_violation());
	}

	#[test]
	fn test_add_after_local_finish_fails() {
		let context = Context::pseudo_good_turing();
		let mut dist = context.new_distribution(false);
		dist.add_items(["a"]).unwrap();
		dist.finish_before_global(0).unwrap();
		let err = dist.add_items(["b"]).unwrap_err();
		assert!(matches!(
			err,
			DistError::LifecycleViolation { state: Lifecycle::LocallyFinished, .. }
		));
		assert!(dist.finish_before_global(0).unwrap_err().is_lifecycle_violation());
	}

	#[test]
	fn test_training_after_freeze_is_rejected() {
		let context = Context::pseudo_good_turing();
		context.finish_global().unwrap();
		let mut late = context.new_distribution(true);
		late.add_items(["a"]).unwrap();
		assert!(matches!(late.finish_before_global(0), Err(DistError::BarrierViolation(_))));
		assert_eq!(late.state(), Lifecycle::Open);
	}

	#[test]
	fn test_finish_requires_frozen_aggregate() {
		let context = Context::pseudo_good_turing();
		let mut held_out = context.new_distribution(false);
		held_out.add_items(["x"]).unwrap();
		assert!(matches!(held_out.finish(0), Err(DistError::BarrierViolation(_))));
		assert_eq!(held_out.state(), Lifecycle::Open);
		context.finish_global().unwrap();
		held_out.finish(0).unwrap();
		assert!(held_out.is_finished());
	}

	#[test]
	fn test_min_count_pruning() {
		let context = Context::pseudo_good_turing();
		let mut dist = context.new_distribution(false);
		dist.add_items(["a", "a", "a", "b", "c", "c"]).unwrap();
		dist.finish_before_global(2).unwrap();
		assert_eq!(dist.num_types(), 2);
		assert_eq!(dist.num_tokens(), 5.0);
		assert_eq!(dist.count(context.vocab().memoize("b")), 0.0);
	}

	#[test]
	fn test_min_count_one_drops_fractional_merged_counts() {
		let context = Context::pseudo_good_turing();
		let mut cell = context.new_distribution(false);
		let mut doc = context.new_distribution(false);
		doc.add_items(["a", "a", "b"]).unwrap();
		cell.merge(&doc, 0.5).unwrap();
		cell.finish_before_global(1).unwrap();
		assert_eq!(cell.count(context.vocab().memoize("b")), 0.0);
		assert_eq!(cell.count(context.vocab().memoize("a")), 1.0);
		assert_eq!(cell.num_tokens(), 1.0);
	}

	#[test]
	fn test_merge_weights_counts() {
		let context = Context::pseudo_good_turing();
		let mut cell = context.new_distribution(false);
		let mut doc = context.new_distribution(false);
		doc.add_items(["a", "a", "b"]).unwrap();
		cell.merge(&doc, 0.5).unwrap();
		assert_eq!(cell.count(context.vocab().memoize("a")), 1.0);
		assert_eq!(cell.num_tokens(), 1.5);
		assert!(matches!(cell.merge(&doc, 1.5), Err(DistError::InvalidConfig(_))));

		let other = Context::pseudo_good_turing();
		let foreign = other.new_distribution(false);
		assert!(matches!(cell.merge(&foreign, 1.0), Err(DistError::ContextMismatch)));

		doc.finish_before_global(0).unwrap();
		assert!(cell.merge(&doc, 1.0).unwrap_err().is_lifecycle_violation());
	}

	#[test]
	fn test_add_ngrams() {
		let context = Context::pseudo_good_turing();
		let mut dist = context.new_distribution(false);
		dist.add_ngrams(&["the", "cat", "sat"], 2).unwrap();
		dist.add_ngrams(&["alone"], 2).unwrap();
		assert_eq!(dist.num_tokens(), 2.0);
		assert_eq!(dist.count(context.vocab().memoize("the cat")), 1.0);
		assert_eq!(dist.count(context.vocab().memoize("cat sat")), 1.0);
	}

	#[test]
	fn test_add_item_rejects_foreign_ids() {
		let context = Context::pseudo_good_turing();
		let other = Context::pseudo_good_turing();
		other.vocab().memoize("a");
		let foreign = other.vocab().memoize("b");
		let mut dist = context.new_distribution(false);
		assert!(matches!(dist.add_item(foreign, 1.0), Err(DistError::UnknownItem(2))));
	}

	#[test]
	fn test_three_way_lookup() {
		let context = Context::pseudo_good_turing();
		let dists = finished_training(&context, &[&[("a", 3), ("b", 1)], &[("a", 1), ("c", 3)]]);
		let vocab = context.vocab();
		let stats = context.stats().unwrap();
		let (a, b, c) = (vocab.memoize("a"), vocab.memoize("b"), vocab.memoize("c"));
		let first = &dists[0];

		// Case 1: seen locally
		let u = first.unseen_mass();
		assert!((u - 0.25).abs() < 1e-12);
		assert!((first.lookup(a).unwrap() - 0.75 * 0.75).abs() < 1e-12);

		// Case 2: backed off to the aggregate
		let g = stats.globally_unseen_item_prob();
		let q_c = stats.overall_prob(c).unwrap();
		let overall_unseen = 1.0 - stats.overall_prob(a).unwrap() - stats.overall_prob(b).unwrap();
		assert!((first.overall_unseen_mass() - overall_unseen).abs() < 1e-12);
		assert!((first.lookup(c).unwrap() - u * (1.0 - g) * q_c / overall_unseen).abs() < 1e-12);

		// Case 3: never seen anywhere
		let expected = u * g / stats.total_num_unseen_item_types() as f64;
		assert!((first.lookup_str("zebra").unwrap() - expected).abs() < 1e-12);
		let zebra = vocab.memoize("zebra");
		assert!((first.lookup(zebra).unwrap() - expected).abs() < 1e-12);
	}

	#[test]
	fn test_lookup_mass_sums_to_one_for_held_out() {
		let context = Context::pseudo_good_turing();
		let _training = finished_training(&context, &[&[("a", 3), ("b", 1)], &[("c", 2), ("d", 1)]]);
		let mut held_out = context.new_distribution(false);
		held_out.add_items(["a", "novel", "novel", "other"]).unwrap();
		held_out.finish(0).unwrap();
		assert!((total_mass(&held_out) - 1.0).abs() < 1e-8);
	}

	#[test]
	fn test_covering_documents_sum_to_one() {
		let context = Context::pseudo_good_turing();
		let dists = finished_training(&context, &[&[("a", 3), ("b", 1)], &[("a", 1)]]);
		let first = &dists[0];
		assert_eq!(first.overall_unseen_mass(), 0.0);
		assert!((first.never_seen_mass().unwrap() - first.unseen_mass()).abs() < 1e-15);
		for dist in &dists {
			assert!((total_mass(dist) - 1.0).abs() < 1e-12);
		}
		for a in &dists {
			for b in &dists {
				assert!(a.kl_divergence(b, false).unwrap() >= -1e-12);
			}
		}
	}

	#[test]
	fn test_inconsistent_aggregate_is_detected() {
		let context = Context::new(BrokenMass);
		let mut dist = context.new_distribution(false);
		dist.add_items(["a"]).unwrap();
		context.finish_global().unwrap();
		dist.finish_before_global(0).unwrap();
		assert!(matches!(dist.finish_after_global(), Err(DistError::InconsistentAggregate { .. })));
	}

	/// Pretends the local items carry more than the whole overall mass.
	struct BrokenMass;

	impl SmoothingStrategy for BrokenMass {
		fn name(&self) -> &'static str {
			"broken"
		}
		fn compute_local_unseen_mass(&self, storage: &ItemStorage) -> f64 {
			Unsmoothed.compute_local_unseen_mass(storage)
		}
		fn compute_global_unseen_mass(&self, _storage: &ItemStorage, _stats: &crate::dist::context::GlobalStats) -> f64 {
			-0.25
		}
		fn local_prob(&self, view: &SmoothedView<'_>, count: f64) -> f64 {
			Unsmoothed.local_prob(view, count)
		}
		fn backoff_coefficient(&self, _view: &SmoothedView<'_>) -> f64 {
			0.0
		}
		fn never_seen_mass(&self, _view: &SmoothedView<'_>) -> f64 {
			0.0
		}
	}

	#[test]
	fn test_most_common_item() {
		let context = Context::pseudo_good_turing();
		let mut dist = context.new_distribution(false);
		dist.add_items(["b", "a", "a", "c", "c"]).unwrap();
		let vocab = context.vocab();
		let (b, a, c) = (vocab.memoize("b"), vocab.memoize("a"), vocab.memoize("c"));
		// Tie between a and c goes to the lower id
		assert_eq!(dist.most_common_item(|_| true), Some(a));
		assert_eq!(dist.most_common_item(|item| item != a), Some(c));
		assert_eq!(dist.most_common_item(|item| item == b), Some(b));
		assert_eq!(dist.most_common_item(|_| false), None);
	}

	proptest! {
		#[test]
		fn merge_order_does_not_matter(
			b_counts in prop::collection::vec(0u32..6, 8),
			c_counts in prop::collection::vec(0u32..6, 8),
			weight_index in 0usize..3,
		) {
			let weight = [0.25, 0.5, 1.0][weight_index];
			let context = Context::pseudo_good_turing();
			let build = |counts: &[u32]| {
				let mut dist = context.new_distribution(false);
				for (i, count) in counts.iter().enumerate() {
					dist.add_count(&format!("w{i}"), *count as f64).unwrap();
				}
				dist
			};
			let (b, c) = (build(&b_counts), build(&c_counts));
			let mut first = build(&[1, 2, 3]);
			let mut second = build(&[1, 2, 3]);
			first.merge(&b, weight).unwrap();
			first.merge(&c, weight).unwrap();
			second.merge(&c, weight).unwrap();
			second.merge(&b, weight).unwrap();

			prop_assert_eq!(first.num_types(), second.num_types());
			prop_assert_eq!(first.num_tokens(), second.num_tokens());
			for (item, count) in first.storage().iter() {
				prop_assert_eq!(second.count(item), count);
			}
		}

		#[test]
		fn lookup_mass_sums_to_one(
			docs in prop::collection::vec(prop::collection::vec(0u32..5, 1..12), 2..5),
			local in 0usize..5,
			private in any::<bool>(),
		) {
			// Without the private item a document can cover the whole corpus
			prop_assume!(private || docs.iter().all(|counts| counts.iter().any(|&count| count > 0)));
			let context = Context::pseudo_good_turing();
			let mut dists: Vec<Distribution> = docs
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
			let dist = &dists[local % dists.len()];
			prop_assert!(dist.unseen_mass() >= 0.0 && dist.unseen_mass() <= 0.5);
			prop_assert!((total_mass(dist) - 1.0).abs() < 1e-8);
		}
	}
}
