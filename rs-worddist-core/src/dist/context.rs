use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::distribution::Distribution;
use super::smoothing::{pseudo_good_turing_mass, PseudoGoodTuring, SmoothingStrategy};
use super::storage::ItemStorage;
use super::vocab::{VocabItem, Vocabulary};
use crate::error::{DistError, Result};

/// Corpus-wide statistics computed once from every training distribution.
///
/// # Invariants
/// - `overall_item_probs` holds `count / total_tokens` for every training item
/// - `total_num_unseen_item_types >= 1`
/// - `globally_unseen_item_prob` is in `(0, 0.5]`
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GlobalStats {
	overall_item_probs: AHashMap<VocabItem, f64>,
	total_item_prob: f64,
	total_tokens: f64,
	num_types_seen_once: usize,
	total_num_unseen_item_types: usize,
	globally_unseen_item_prob: f64,
	num_distributions: usize,
}

impl GlobalStats {
	/// Builds the aggregate from the summed counts of `num_distributions`
	/// training distributions.
	pub fn from_counts(counts: &ItemStorage, num_distributions: usize) -> Self {
		let total_tokens = counts.num_tokens();
		let num_types_seen_once = counts.num_types_seen_once();

		let overall_item_probs: AHashMap<VocabItem, f64> = if total_tokens > 0.0 {
			counts.iter().map(|(item, count)| (item, count / total_tokens)).collect()
		} else {
			AHashMap::new()
		};
		let total_item_prob = overall_item_probs.values().sum();

		Self {
			overall_item_probs,
			total_item_prob,
			total_tokens,
			num_types_seen_once,
			total_num_unseen_item_types: num_types_seen_once.max(1),
			globally_unseen_item_prob: pseudo_good_turing_mass(num_types_seen_once, total_tokens),
			num_distributions,
		}
	}

	/// Overall probability of `item`, `None` if it never occurred in training.
	pub fn overall_prob(&self, item: VocabItem) -> Option<f64> {
		self.overall_item_probs.get(&item).copied()
	}

	pub fn contains(&self, item: VocabItem) -> bool {
		self.overall_item_probs.contains_key(&item)
	}

	/// Every item seen in training, with its overall probability.
	pub fn known_items(&self) -> impl Iterator<Item = (VocabItem, f64)> + '_ {
		self.overall_item_probs.iter().map(|(item, prob)| (*item, *prob))
	}

	pub fn num_known_items(&self) -> usize {
		self.overall_item_probs.len()
	}

	/// Sum of all overall probabilities (1 up to rounding, 0 when empty).
	pub fn total_item_prob(&self) -> f64 {
		self.total_item_prob
	}

	pub fn total_tokens(&self) -> f64 {
		self.total_tokens
	}

	pub fn num_types_seen_once(&self) -> usize {
		self.num_types_seen_once
	}

	pub fn total_num_unseen_item_types(&self) -> usize {
		self.total_num_unseen_item_types
	}

	pub fn globally_unseen_item_prob(&self) -> f64 {
		self.globally_unseen_item_prob
	}

	pub fn num_distributions(&self) -> usize {
		self.num_distributions
	}
}

/// Serializable image of a frozen context: the vocabulary in id order and
/// the aggregate keyed by those ids.
#[derive(Serialize, Deserialize, Debug)]
pub struct Snapshot {
	pub vocabulary: Vec<String>,
	pub stats: GlobalStats,
}

#[derive(Default)]
struct Accumulator {
	counts: ItemStorage,
	num_distributions: usize,
}

/// Per-run state shared by every distribution: the vocabulary, the
/// smoothing strategy and the two-phase global aggregate.
///
/// # Lifecycle
/// 1. Training distributions note their counts while finishing locally.
/// 2. `finish_global` freezes the aggregate once no training distribution
///    is still open.
/// 3. From then on the aggregate is read-only and training contributions
///    are rejected.
pub struct Context<S: SmoothingStrategy = PseudoGoodTuring> {
	vocab: Vocabulary,
	strategy: S,
	accumulator: Mutex<Accumulator>,
	stats: OnceLock<GlobalStats>,
	open_training: AtomicUsize,
}

impl Context<PseudoGoodTuring> {
	/// Context using pseudo-Good-Turing smoothing.
	pub fn pseudo_good_turing() -> Arc<Self> {
		Self::new(PseudoGoodTuring)
	}
}

impl<S: SmoothingStrategy> Context<S> {
	pub fn new(strategy: S) -> Arc<Self> {
		Arc::new(Self {
			vocab: Vocabulary::new(),
			strategy,
			accumulator: Mutex::new(Accumulator::default()),
			stats: OnceLock::new(),
			open_training: AtomicUsize::new(0),
		})
	}

	/// Restores a context whose aggregate is already frozen.
	pub fn from_snapshot(snapshot: Snapshot, strategy: S) -> Arc<Self> {
		Arc::new(Self {
			vocab: Vocabulary::from_strings(snapshot.vocabulary),
			strategy,
			accumulator: Mutex::new(Accumulator::default()),
			stats: OnceLock::from(snapshot.stats),
			open_training: AtomicUsize::new(0),
		})
	}

	/// Captures the vocabulary and the frozen aggregate.
	///
	/// # Errors
	/// `BarrierViolation` if the aggregate is not frozen yet.
	pub fn snapshot(&self) -> Result<Snapshot> {
		let stats = self.require_stats()?;
		Ok(Snapshot { vocabulary: self.vocab.to_strings(), stats: stats.clone() })
	}

	pub fn vocab(&self) -> &Vocabulary {
		&self.vocab
	}

	pub fn strategy(&self) -> &S {
		&self.strategy
	}

	/// Creates an empty `Open` distribution. Training distributions feed the
	/// global aggregate when they finish their local phase.
	pub fn new_distribution(self: &Arc<Self>, training: bool) -> Distribution<S> {
		if training {
			self.open_training.fetch_add(1, Ordering::SeqCst);
		}
		Distribution::new(Arc::clone(self), training)
	}

	/// The frozen aggregate, if `finish_global` has run.
	pub fn stats(&self) -> Option<&GlobalStats> {
		self.stats.get()
	}

	pub fn is_frozen(&self) -> bool {
		self.stats.get().is_some()
	}

	pub(crate) fn require_stats(&self) -> Result<&GlobalStats> {
		self.stats
			.get()
			.ok_or_else(|| DistError::BarrierViolation("global aggregate is not frozen yet".to_owned()))
	}

	/// Training distributions created but not yet locally finished.
	pub fn open_training_distributions(&self) -> usize {
		self.open_training.load(Ordering::SeqCst)
	}

	/// Adds the counts of a locally finished training distribution.
	pub(crate) fn note_distribution(&self, storage: &ItemStorage) -> Result<()> {
		let mut accumulator = self.accumulator.lock();
		if self.is_frozen() {
			return Err(DistError::BarrierViolation(
				"training distribution finished after the aggregate was frozen".to_owned(),
			));
		}
		for (item, count) in storage.iter() {
			accumulator.counts.add(item, count);
		}
		accumulator.num_distributions += 1;
		Ok(())
	}

	pub(crate) fn release_open_training(&self) {
		self.open_training.fetch_sub(1, Ordering::SeqCst);
	}

	/// Freezes the aggregate from everything noted so far.
	///
	/// # Errors
	/// `BarrierViolation` if the aggregate is already frozen or a training
	/// distribution is still open.
	pub fn finish_global(&self) -> Result<&GlobalStats> {
		let mut accumulator = self.accumulator.lock();
		if self.is_frozen() {
			return Err(DistError::BarrierViolation("global aggregate already frozen".to_owned()));
		}
		let open = self.open_training_distributions();
		if open > 0 {
			return Err(DistError::BarrierViolation(format!(
				"{open} training distribution(s) have not finished their local phase"
			)));
		}

		let accumulated = std::mem::take(&mut *accumulator);
		let stats = GlobalStats::from_counts(&accumulated.counts, accumulated.num_distributions);
		log::info!(
			"global aggregate frozen ({}): {} distributions, {} types, {} tokens, {} seen once, unseen prob {:.6}",
			self.strategy.name(),
			stats.num_distributions(),
			stats.num_known_items(),
			stats.total_tokens(),
			stats.num_types_seen_once(),
			stats.globally_unseen_item_prob(),
		);
		let _ = self.stats.set(stats);
		self.require_stats()
	}
}
