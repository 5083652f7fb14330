use super::context::GlobalStats;
use super::storage::ItemStorage;
use super::vocab::VocabItem;

/// Everything a strategy needs to answer a probability query for one
/// globally finished distribution.
#[derive(Clone, Copy, Debug)]
pub struct SmoothedView<'a> {
	pub storage: &'a ItemStorage,
	pub stats: &'a GlobalStats,
	pub unseen_mass: f64,
	pub overall_unseen_mass: f64,
}

/// A smoothing algorithm, chosen when the context is created.
///
/// A strategy splits a distribution's probability mass three ways:
/// items seen locally, items absent locally but known to the aggregate
/// (backed off in proportion to their overall probability), and items
/// never seen anywhere (sharing `never_seen_mass` uniformly among
/// `total_num_unseen_item_types` pseudo-types). The three parts sum to 1.
pub trait SmoothingStrategy: Send + Sync + 'static {
	/// Short name, used in logs.
	fn name(&self) -> &'static str;

	/// Mass reserved for items absent from `storage`. Called once, when the
	/// distribution finishes its local phase.
	fn compute_local_unseen_mass(&self, storage: &ItemStorage) -> f64;

	/// Overall probability mass of the items absent from `storage`.
	fn compute_global_unseen_mass(&self, storage: &ItemStorage, stats: &GlobalStats) -> f64 {
		let seen: f64 = storage.iter().filter_map(|(item, _)| stats.overall_prob(item)).sum();
		1.0 - seen
	}

	/// Probability of a locally seen item with the given count.
	fn local_prob(&self, view: &SmoothedView<'_>, count: f64) -> f64;

	/// Factor turning an overall item probability into the probability of a
	/// locally absent but globally known item.
	fn backoff_coefficient(&self, view: &SmoothedView<'_>) -> f64;

	/// Total mass of all items never seen in the training corpus.
	fn never_seen_mass(&self, view: &SmoothedView<'_>) -> f64;

	fn lookup(&self, view: &SmoothedView<'_>, item: VocabItem) -> f64 {
		let count = view.storage.get(item);
		if count > 0.0 {
			return self.local_prob(view, count);
		}
		match view.stats.overall_prob(item) {
			Some(prob) => self.backoff_coefficient(view) * prob,
			None => self.never_seen_mass(view) / view.stats.total_num_unseen_item_types() as f64,
		}
	}
}

/// Upper bound on the unseen mass, for both the local and the global estimate.
pub const MAX_UNSEEN_MASS: f64 = 0.5;

/// Good-Turing style estimate of unseen mass from the number of singletons.
///
/// Returns `min(0.5, max(1, n1) / tokens)`, or 0.5 when there are no tokens.
/// Flooring `n1` at one keeps unseen items away from zero probability, the
/// ceiling keeps seen items away from it.
pub fn pseudo_good_turing_mass(num_types_seen_once: usize, num_tokens: f64) -> f64 {
	if num_tokens <= 0.0 {
		return MAX_UNSEEN_MASS;
	}
	(num_types_seen_once.max(1) as f64 / num_tokens).min(MAX_UNSEEN_MASS)
}

/// Pseudo-Good-Turing smoothing with back-off to the corpus-wide aggregate.
#[derive(Clone, Copy, Debug, Default)]
pub struct PseudoGoodTuring;

impl SmoothingStrategy for PseudoGoodTuring {
	fn name(&self) -> &'static str {
		"pseudo-good-turing"
	}

	fn compute_local_unseen_mass(&self, storage: &ItemStorage) -> f64 {
		pseudo_good_turing_mass(storage.num_types_seen_once(), storage.num_tokens())
	}

	fn local_prob(&self, view: &SmoothedView<'_>, count: f64) -> f64 {
		count / view.storage.num_tokens() * (1.0 - view.unseen_mass)
	}

	fn backoff_coefficient(&self, view: &SmoothedView<'_>) -> f64 {
		// No globally known item can be absent locally
		if view.overall_unseen_mass <= 0.0 {
			return 0.0;
		}
		view.unseen_mass * (1.0 - view.stats.globally_unseen_item_prob()) / view.overall_unseen_mass
	}

	/// `u * g`, or all of `u` when the distribution covers every known item
	/// and nothing is left to back off to.
	fn never_seen_mass(&self, view: &SmoothedView<'_>) -> f64 {
		if view.overall_unseen_mass <= 0.0 {
			return view.unseen_mass;
		}
		view.unseen_mass * view.stats.globally_unseen_item_prob()
	}
}

/// Maximum-likelihood estimate: absent items get zero probability.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unsmoothed;

impl SmoothingStrategy for Unsmoothed {
	fn name(&self) -> &'static str {
		"unsmoothed"
	}

	fn compute_local_unseen_mass(&self, _storage: &ItemStorage) -> f64 {
		0.0
	}

	fn local_prob(&self, view: &SmoothedView<'_>, count: f64) -> f64 {
		count / view.storage.num_tokens()
	}

	fn backoff_coefficient(&self, _view: &SmoothedView<'_>) -> f64 {
		0.0
	}

	fn never_seen_mass(&self, _view: &SmoothedView<'_>) -> f64 {
		0.0
	}
}
