//! Cell (region) distributions and the strategies ranking cells for a
//! document.
//!
//! A cell pools the counts of the training documents assigned to it and is
//! finished like an evaluation document, after the global aggregate is
//! frozen. Rankings only consider non-empty cells.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::dist::context::Context;
use crate::dist::distribution::Distribution;
use crate::dist::divergence::KlEngine;
use crate::dist::smoothing::{PseudoGoodTuring, SmoothingStrategy};
use crate::dist::vocab::VocabItem;
use crate::error::{DistError, Result};

/// Distribution of a cell, built from the training documents it contains.
pub struct CellDistribution<S: SmoothingStrategy = PseudoGoodTuring> {
	label: String,
	dist: Distribution<S>,
	num_docs: usize,
}

impl<S: SmoothingStrategy> CellDistribution<S> {
	pub fn new(context: &Arc<Context<S>>, label: impl Into<String>) -> Self {
		Self { label: label.into(), dist: context.new_distribution(false), num_docs: 0 }
	}

	/// Adds the counts of a training document.
	///
	/// Non-training documents are skipped with a warning and `Ok(false)` is
	/// returned. The document may be in any lifecycle state; the cell must
	/// still be `Open`.
	///
	/// # Errors
	/// - `ContextMismatch` if the document comes from another context
	/// - `LifecycleViolation` if the cell is already finished
	pub fn add_document(&mut self, doc: &Distribution<S>) -> Result<bool> {
		if !Arc::ptr_eq(doc.context(), self.dist.context()) {
			return Err(DistError::ContextMismatch);
		}
		if !doc.is_training() {
			log::warn!("cell {}: skipping non-training document", self.label);
			return Ok(false);
		}
		for (item, count) in doc.items() {
			self.dist.add_item(item, count)?;
		}
		self.num_docs += 1;
		Ok(true)
	}

	/// Finishes the cell. The aggregate must already be frozen.
	pub fn finish(&mut self, min_count: u64) -> Result<()> {
		self.dist.finish(min_count)?;
		log::debug!("cell {}: {} documents, {} tokens", self.label, self.num_docs, self.dist.num_tokens());
		Ok(())
	}

	pub fn label(&self) -> &str {
		&self.label
	}

	pub fn num_docs(&self) -> usize {
		self.num_docs
	}

	pub fn is_empty(&self) -> bool {
		self.num_docs == 0
	}

	pub fn distribution(&self) -> &Distribution<S> {
		&self.dist
	}
}

/// Scores every non-empty cell and sorts the result. Ties go to the lower
/// index.
fn rank_cells<S, F>(cells: &[CellDistribution<S>], descending: bool, mut score: F) -> Result<Vec<(usize, f64)>>
where
	S: SmoothingStrategy,
	F: FnMut(&CellDistribution<S>) -> Result<f64>,
{
	let mut ranked = Vec::with_capacity(cells.len());
	for (index, cell) in cells.iter().enumerate() {
		if !cell.is_empty() {
			ranked.push((index, score(cell)?));
		}
	}
	ranked.sort_by(|a, b| {
		let order = if descending { b.1.total_cmp(&a.1) } else { a.1.total_cmp(&b.1) };
		order.then_with(|| a.0.cmp(&b.0))
	});
	Ok(ranked)
}

/// Cells ordered by increasing `KL(doc || cell)`.
pub fn rank_cells_by_kl<S: SmoothingStrategy>(
	doc: &Distribution<S>,
	cells: &[CellDistribution<S>],
	partial: bool,
	engine: KlEngine,
) -> Result<Vec<(usize, f64)>> {
	rank_cells(cells, false, |cell| doc.kl_divergence_with(cell.distribution(), partial, engine))
}

/// Cells ordered by decreasing cosine similarity with `doc`.
pub fn rank_cells_by_cosine<S: SmoothingStrategy>(
	doc: &Distribution<S>,
	cells: &[CellDistribution<S>],
	partial: bool,
	smoothed: bool,
) -> Result<Vec<(usize, f64)>> {
	rank_cells(cells, true, |cell| doc.cosine_similarity(cell.distribution(), partial, smoothed))
}

/// Distribution over cells for one item: the item's smoothed probability in
/// every non-empty cell, normalized to sum to 1.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemCellDistribution {
	probs: Vec<(usize, f64)>,
}

impl ItemCellDistribution {
	pub fn for_item<S: SmoothingStrategy>(item: VocabItem, cells: &[CellDistribution<S>]) -> Result<Self> {
		let mut probs = Vec::with_capacity(cells.len());
		for (index, cell) in cells.iter().enumerate() {
			if !cell.is_empty() {
				probs.push((index, cell.distribution().lookup(item)?));
			}
		}
		Ok(Self::normalized(probs))
	}

	/// Sums the per-item distributions of every item of `doc`, weighted by
	/// its count, and renormalizes.
	pub fn for_distribution<S: SmoothingStrategy>(
		doc: &Distribution<S>,
		cells: &[CellDistribution<S>],
		cache: &ItemCellCache,
	) -> Result<Self> {
		let mut totals: AHashMap<usize, f64> = AHashMap::new();
		for (item, count) in doc.items() {
			let item_dist = cache.get_or_compute(item, cells)?;
			for &(index, prob) in &item_dist.probs {
				*totals.entry(index).or_insert(0.0) += count * prob;
			}
		}
		let mut probs: Vec<(usize, f64)> = totals.into_iter().collect();
		probs.sort_by_key(|(index, _)| *index);
		Ok(Self::normalized(probs))
	}

	fn normalized(mut probs: Vec<(usize, f64)>) -> Self {
		let total: f64 = probs.iter().map(|(_, prob)| prob).sum();
		if total > 0.0 {
			for (_, prob) in &mut probs {
				*prob /= total;
			}
		}
		Self { probs }
	}

	/// Probability of the cell at `index`, 0 for empty or unknown cells.
	pub fn prob(&self, index: usize) -> f64 {
		self.probs.iter().find(|(i, _)| *i == index).map_or(0.0, |(_, prob)| *prob)
	}

	/// Cells ordered by decreasing probability, ties to the lower index.
	pub fn ranked(&self) -> Vec<(usize, f64)> {
		let mut ranked = self.probs.clone();
		ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
		ranked
	}
}

/// Memoized `ItemCellDistribution`s for one fixed set of finished cells.
///
/// Computing a per-item distribution touches every cell, so results are
/// kept up to `capacity` entries; beyond that the least recently used
/// entry is evicted.
pub struct ItemCellCache {
	capacity: usize,
	state: Mutex<LruState>,
}

#[derive(Default)]
struct LruState {
	tick: u64,
	entries: AHashMap<VocabItem, (Arc<ItemCellDistribution>, u64)>,
	/// Last use tick to item, oldest first.
	order: BTreeMap<u64, VocabItem>,
}

impl LruState {
	fn touch(&mut self, item: VocabItem) -> Option<Arc<ItemCellDistribution>> {
		self.tick += 1;
		let tick = self.tick;
		let (found, last_used) = self.entries.get_mut(&item)?;
		self.order.remove(&*last_used);
		*last_used = tick;
		self.order.insert(tick, item);
		Some(Arc::clone(&*found))
	}

	fn insert(&mut self, item: VocabItem, value: Arc<ItemCellDistribution>, capacity: usize) -> Arc<ItemCellDistribution> {
		// Another thread may have computed it meanwhile
		if let Some(found) = self.touch(item) {
			return found;
		}
		while self.entries.len() >= capacity {
			let Some((_, oldest)) = self.order.pop_first() else {
				break;
			};
			self.entries.remove(&oldest);
		}
		self.entries.insert(item, (Arc::clone(&value), self.tick));
		self.order.insert(self.tick, item);
		value
	}
}

impl ItemCellCache {
	pub const DEFAULT_CAPACITY: usize = 10_000;

	pub fn new(capacity: usize) -> Self {
		Self { capacity: capacity.max(1), state: Mutex::new(LruState::default()) }
	}

	pub fn len(&self) -> usize {
		self.state.lock().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn contains(&self, item: VocabItem) -> bool {
		self.state.lock().entries.contains_key(&item)
	}

	pub fn get_or_compute<S: SmoothingStrategy>(
		&self,
		item: VocabItem,
		cells: &[CellDistribution<S>],
	) -> Result<Arc<ItemCellDistribution>> {
		if let Some(found) = self.state.lock().touch(item) {
			return Ok(found);
		}
		// Computed without holding the lock
		let computed = Arc::new(ItemCellDistribution::for_item(item, cells)?);
		Ok(self.state.lock().insert(item, computed, self.capacity))
	}
}

impl Default for ItemCellCache {
	fn default() -> Self {
		Self::new(Self::DEFAULT_CAPACITY)
	}
}

/// Cells ordered by decreasing probability under the document's summed
/// per-item cell distributions.
pub fn rank_cells_by_item_probability<S: SmoothingStrategy>(
	doc: &Distribution<S>,
	cells: &[CellDistribution<S>],
	cache: &ItemCellCache,
) -> Result<Vec<(usize, f64)>> {
	Ok(ItemCellDistribution::for_distribution(doc, cells, cache)?.ranked())
}

/// Per-word weighting for `naive_bayes_score`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum NaiveBayesWeighting {
	/// Every context word counts the same.
	#[default]
	Equal,
	/// A word at distance `d` weighs `1 / (1 + d)`.
	InverseDistance,
}

impl NaiveBayesWeighting {
	fn weight(self, distance: usize) -> f64 {
		match self {
			NaiveBayesWeighting::Equal => 1.0,
			NaiveBayesWeighting::InverseDistance => 1.0 / (1.0 + distance as f64),
		}
	}
}

/// Prior blended into a naive Bayes score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Baseline {
	/// Prior probability or any positive prior count.
	pub prior: f64,
	/// Share of the score given to the prior, in `[0, 1]`. Words get the rest.
	pub weight: f64,
}

/// Weighted mean log-probability of the context words under `dist`, blended
/// with the log of a prior:
///
/// `(1 - b) * sum(w_i * ln p_i) / sum(w_i) + b * ln(prior)`
///
/// `context` yields `(distance, word)` pairs. Without a baseline `b = 0`.
///
/// # Errors
/// `InvalidConfig` for a baseline weight outside `[0, 1]` or a non-positive
/// prior, plus lookup errors.
pub fn naive_bayes_score<S, I, T>(
	dist: &Distribution<S>,
	context: I,
	weighting: NaiveBayesWeighting,
	baseline: Option<Baseline>,
) -> Result<f64>
where
	S: SmoothingStrategy,
	I: IntoIterator<Item = (usize, T)>,
	T: AsRef<str>,
{
	if let Some(baseline) = baseline {
		if !(0.0..=1.0).contains(&baseline.weight) {
			return Err(DistError::InvalidConfig(format!("baseline weight must be in [0, 1], got {}", baseline.weight)));
		}
		if !(baseline.prior > 0.0) {
			return Err(DistError::InvalidConfig(format!("baseline prior must be > 0, got {}", baseline.prior)));
		}
	}

	let mut total = 0.0;
	let mut total_weight = 0.0;
	for (distance, word) in context {
		let weight = weighting.weight(distance);
		total += weight * dist.lookup_str(word.as_ref())?.ln();
		total_weight += weight;
	}
	if total_weight > 0.0 {
		total /= total_weight;
	}

	Ok(match baseline {
		Some(baseline) => (1.0 - baseline.weight) * total + baseline.weight * baseline.prior.ln(),
		None => total,
	})
}

/// Cells ordered by decreasing naive Bayes score, using each cell's
/// document count as its prior when `baseline_weight` is given.
pub fn rank_cells_by_naive_bayes<S, T>(
	context: &[(usize, T)],
	cells: &[CellDistribution<S>],
	weighting: NaiveBayesWeighting,
	baseline_weight: Option<f64>,
) -> Result<Vec<(usize, f64)>>
where
	S: SmoothingStrategy,
	T: AsRef<str>,
{
	rank_cells(cells, true, |cell| {
		let baseline = baseline_weight.map(|weight| Baseline { prior: cell.num_docs() as f64, weight });
		let words = context.iter().map(|(distance, word)| (*distance, word.as_ref()));
		naive_bayes_score(cell.distribution(), words, weighting, baseline)
	})
}
