//! Dunning log-likelihood ratio (G²) for comparing item frequencies.
//!
//! For two corpora the contingency table is
//!
//! ```text
//!               corpus 1   corpus 2
//! item              a          b
//! other tokens      c          d
//! ```
//!
//! `dunning_log_likelihood` computes G² from expected cell values,
//! `dunning_log_likelihood_entropy` from the multinomial entropy identity.
//! Both give the same number and are kept so each can check the other.

use super::distribution::Distribution;
use super::smoothing::SmoothingStrategy;
use super::vocab::VocabItem;

/// G² together with the expected item counts in each corpus.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DunningScore {
	pub g2: f64,
	pub expected_1: f64,
	pub expected_2: f64,
}

/// `x ln x` with `0 ln 0 = 0`.
fn x_ln_x(x: f64) -> f64 {
	if x > 0.0 { x * x.ln() } else { 0.0 }
}

/// `observed * ln(observed / expected)`, 0 for an empty cell.
fn cell_term(observed: f64, expected: f64) -> f64 {
	if observed > 0.0 { observed * (observed / expected).ln() } else { 0.0 }
}

/// G² via expected values: `2 * sum(O * ln(O / E))` over the four cells,
/// where `E = row total * column total / N`.
pub fn dunning_log_likelihood(a: f64, b: f64, c: f64, d: f64) -> DunningScore {
	let n = a + b + c + d;
	if n <= 0.0 {
		return DunningScore { g2: 0.0, expected_1: 0.0, expected_2: 0.0 };
	}
	let (corpus_1, corpus_2) = (a + c, b + d);
	let (item_total, other_total) = (a + b, c + d);

	let expected_1 = corpus_1 * item_total / n;
	let expected_2 = corpus_2 * item_total / n;
	let expected_3 = corpus_1 * other_total / n;
	let expected_4 = corpus_2 * other_total / n;

	let g2 = 2.0
		* (cell_term(a, expected_1) + cell_term(b, expected_2) + cell_term(c, expected_3) + cell_term(d, expected_4));
	DunningScore { g2, expected_1, expected_2 }
}

/// G² via the entropy identity:
/// `2 * (sum cells x ln x + N ln N - sum rows r ln r - sum columns k ln k)`.
pub fn dunning_log_likelihood_entropy(a: f64, b: f64, c: f64, d: f64) -> f64 {
	let n = a + b + c + d;
	2.0 * (x_ln_x(a) + x_ln_x(b) + x_ln_x(c) + x_ln_x(d) + x_ln_x(n)
		- x_ln_x(a + b)
		- x_ln_x(c + d)
		- x_ln_x(a + c)
		- x_ln_x(b + d))
}

/// G² for a 2 x k table: the item count and the remaining token count in
/// each of k corpora. With k = 2 this equals the four-cell versions.
///
/// Missing entries (slices of different lengths) count as zero.
pub fn dunning_log_likelihood_table(item_counts: &[f64], other_counts: &[f64]) -> f64 {
	let columns = item_counts.len().max(other_counts.len());
	let cell = |counts: &[f64], j: usize| counts.get(j).copied().unwrap_or(0.0);

	let mut cells = 0.0;
	let mut column_terms = 0.0;
	let (mut item_total, mut other_total) = (0.0, 0.0);
	for j in 0..columns {
		let (item, other) = (cell(item_counts, j), cell(other_counts, j));
		cells += x_ln_x(item) + x_ln_x(other);
		column_terms += x_ln_x(item + other);
		item_total += item;
		other_total += other;
	}
	let n = item_total + other_total;
	2.0 * (cells + x_ln_x(n) - x_ln_x(item_total) - x_ln_x(other_total) - column_terms)
}

impl<S: SmoothingStrategy> Distribution<S> {
	/// Compares the raw count of `item` here and in `other`.
	pub fn dunning_log_likelihood(&self, other: &Distribution<S>, item: VocabItem) -> DunningScore {
		let (a, b) = (self.count(item), other.count(item));
		dunning_log_likelihood(a, b, self.num_tokens() - a, other.num_tokens() - b)
	}

	/// Every item of either distribution with its G² score, highest first.
	/// Items more frequent in `other` come out too; check the expected values
	/// to tell the direction.
	pub fn dunning_comparison(&self, other: &Distribution<S>, limit: usize) -> Vec<(VocabItem, DunningScore)> {
		let mut items: Vec<VocabItem> = self.storage().iter().map(|(item, _)| item).collect();
		items.extend(other.storage().iter().map(|(item, _)| item).filter(|item| !self.storage().contains(*item)));

		let mut scored: Vec<(VocabItem, DunningScore)> =
			items.into_iter().map(|item| (item, self.dunning_log_likelihood(other, item))).collect();
		scored.sort_by(|x, y| y.1.g2.total_cmp(&x.1.g2).then_with(|| x.0.cmp(&y.0)));
		scored.truncate(limit);
		scored
	}
}
