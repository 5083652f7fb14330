use ahash::AHashMap;

use super::vocab::VocabItem;

/// Sparse item -> count table owned by a single distribution.
///
/// # Invariants
/// - Every stored value is strictly positive (zero entries are removed)
/// - `num_tokens` equals the sum of stored values
/// - `num_types` equals the number of stored entries
#[derive(Clone, Debug, Default)]
pub struct ItemStorage {
	counts: AHashMap<VocabItem, f64>,
	num_tokens: f64,
}

impl ItemStorage {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds `delta` to the count of `item`, creating the entry if absent.
	///
	/// Non-positive or non-finite deltas are ignored: counts only grow.
	pub fn add(&mut self, item: VocabItem, delta: f64) {
		if !(delta.is_finite() && delta > 0.0) {
			return;
		}
		*self.counts.entry(item).or_insert(0.0) += delta;
		self.num_tokens += delta;
	}

	/// Overwrites the count of `item`. A value of zero (or less) removes it.
	pub fn set(&mut self, item: VocabItem, value: f64) {
		if !(value.is_finite() && value > 0.0) {
			self.remove(item);
			return;
		}
		let old = self.counts.insert(item, value).unwrap_or(0.0);
		self.num_tokens += value - old;
	}

	/// Removes `item`, returning its previous count.
	pub fn remove(&mut self, item: VocabItem) -> Option<f64> {
		let old = self.counts.remove(&item)?;
		self.num_tokens -= old;
		if self.counts.is_empty() {
			// Drop accumulated rounding residue
			self.num_tokens = 0.0;
		}
		Some(old)
	}

	pub fn contains(&self, item: VocabItem) -> bool {
		self.counts.contains_key(&item)
	}

	/// Count of `item`, 0 if absent.
	pub fn get(&self, item: VocabItem) -> f64 {
		self.counts.get(&item).copied().unwrap_or(0.0)
	}

	/// All `(item, count)` pairs, in unspecified order.
	pub fn iter(&self) -> impl Iterator<Item = (VocabItem, f64)> + '_ {
		self.counts.iter().map(|(item, count)| (*item, *count))
	}

	pub fn num_tokens(&self) -> f64 {
		self.num_tokens
	}

	pub fn num_types(&self) -> usize {
		self.counts.len()
	}

	pub fn is_empty(&self) -> bool {
		self.counts.is_empty()
	}

	/// Number of items whose count is exactly 1.
	pub fn num_types_seen_once(&self) -> usize {
		self.counts.values().filter(|&&count| count == 1.0).count()
	}

	/// Drops every item whose count is below `min_count`; returns how many
	/// types were removed.
	pub fn prune_below(&mut self, min_count: f64) -> usize {
		let before = self.counts.len();
		self.counts.retain(|_, count| *count >= min_count);
		let removed = before - self.counts.len();
		if removed > 0 {
			self.num_tokens = self.counts.values().sum();
		}
		removed
	}
}
