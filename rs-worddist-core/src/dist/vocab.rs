use std::fmt;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{DistError, Result};

/// Compact handle for an interned vocabulary string.
///
/// `0` is never issued, so a zeroed handle can act as a sentinel.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VocabItem(u32);

impl VocabItem {
	pub const INVALID: VocabItem = VocabItem(0);

	pub fn id(self) -> u32 {
		self.0
	}

	pub fn is_valid(self) -> bool {
		self.0 != 0
	}
}

impl fmt::Display for VocabItem {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

#[derive(Default)]
struct Tables {
	/// `strings[i]` is the string of id `i + 1`.
	strings: Vec<Box<str>>,
	ids: AHashMap<Box<str>, u32>,
}

/// Bidirectional string <-> id table shared by every distribution of a run.
///
/// # Invariants
/// - Ids are issued consecutively from 1 and never reused
/// - Entries are never removed
///
/// Reads take a shared lock; only first-time insertions take the write lock,
/// so parallel workers can memoize concurrently.
#[derive(Default)]
pub struct Vocabulary {
	tables: RwLock<Tables>,
}

impl Vocabulary {
	pub fn new() -> Self {
		Self::default()
	}

	/// Rebuilds a vocabulary issuing ids `1..=strings.len()` in order.
	pub fn from_strings<I, S>(strings: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let vocab = Self::new();
		for s in strings {
			vocab.memoize(s.as_ref());
		}
		vocab
	}

	/// Returns the id for `word`, issuing the next unused one if needed.
	pub fn memoize(&self, word: &str) -> VocabItem {
		if let Some(&id) = self.tables.read().ids.get(word) {
			return VocabItem(id);
		}

		let mut tables = self.tables.write();
		// Another writer may have inserted it between the two locks
		if let Some(&id) = tables.ids.get(word) {
			return VocabItem(id);
		}
		tables.strings.push(word.into());
		let id = tables.strings.len() as u32;
		tables.ids.insert(word.into(), id);
		VocabItem(id)
	}

	/// Returns the id for `word` without inserting it.
	pub fn lookup(&self, word: &str) -> Option<VocabItem> {
		self.tables.read().ids.get(word).map(|&id| VocabItem(id))
	}

	/// Returns the string behind `item`.
	///
	/// # Errors
	/// `UnknownItem` if the id was never issued.
	pub fn unmemoize(&self, item: VocabItem) -> Result<String> {
		let tables = self.tables.read();
		if item.0 == 0 {
			return Err(DistError::UnknownItem(item.0));
		}
		tables
			.strings
			.get(item.0 as usize - 1)
			.map(|s| s.to_string())
			.ok_or(DistError::UnknownItem(item.0))
	}

	pub fn len(&self) -> usize {
		self.tables.read().strings.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// All strings in id order, suitable for `from_strings`.
	pub fn to_strings(&self) -> Vec<String> {
		self.tables.read().strings.iter().map(|s| s.to_string()).collect()
	}
}

impl fmt::Debug for Vocabulary {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Vocabulary").field("len", &self.len()).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::thread;

	#[test]
	fn test_memoize_is_idempotent() {
		let vocab = Vocabulary::new();
		let the = vocab.memoize("the");
		let cat = vocab.memoize("cat");
		assert_eq!(vocab.memoize("the"), the);
		assert_ne!(the, cat);
		assert!(the.is_valid());
		assert_eq!(the.id(), 1);
		assert_eq!(cat.id(), 2);
		assert_eq!(vocab.len(), 2);
	}

	#[test]
	fn test_unmemoize() {
		let vocab = Vocabulary::new();
		let item = vocab.memoize("sat");
		assert_eq!(vocab.unmemoize(item).unwrap(), "sat");
		assert!(matches!(vocab.unmemoize(VocabItem::INVALID), Err(DistError::UnknownItem(0))));
		assert!(matches!(vocab.unmemoize(VocabItem(42)), Err(DistError::UnknownItem(42))));
	}

	#[test]
	fn test_lookup_does_not_insert() {
		let vocab = Vocabulary::new();
		assert_eq!(vocab.lookup("dog"), None);
		assert!(vocab.is_empty());
		let dog = vocab.memoize("dog");
		assert_eq!(vocab.lookup("dog"), Some(dog));
	}

	#[test]
	fn test_from_strings_reproduces_ids() {
		let vocab = Vocabulary::new();
		let ids: Vec<VocabItem> = ["a", "b", "c"].iter().map(|w| vocab.memoize(w)).collect();
		let restored = Vocabulary::from_strings(vocab.to_strings());
		for (id, w) in ids.iter().zip(["a", "b", "c"]) {
			assert_eq!(restored.lookup(w), Some(*id));
		}
	}

	#[test]
	fn test_concurrent_memoize_issues_unique_ids() {
		let vocab = Arc::new(Vocabulary::new());
		let handles: Vec<_> = (0..4)
			.map(|_| {
				let vocab = Arc::clone(&vocab);
				thread::spawn(move || (0..100).map(|i| vocab.memoize(&format!("w{i}"))).collect::<Vec<_>>())
			})
			.collect();
		let results: Vec<Vec<VocabItem>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
		for other in &results[1..] {
			assert_eq!(&results[0], other);
		}
		assert_eq!(vocab.len(), 100);
	}
}
