use thiserror::Error;

use crate::dist::distribution::Lifecycle;

/// Errors raised by the distribution core.
///
/// Every variant except `Io` and `Snapshot` signals a programming error in
/// the caller (wrong ordering, foreign ids, mismatched aggregates) and is not
/// meant to be retried.
#[derive(Debug, Error)]
pub enum DistError {
	/// A mutation or finish step was attempted in the wrong lifecycle state.
	#[error("lifecycle violation: cannot {operation} while {state:?}")]
	LifecycleViolation { operation: &'static str, state: Lifecycle },

	/// The global aggregate was used before being frozen, frozen twice,
	/// or frozen while training distributions were still open.
	#[error("aggregate barrier violation: {0}")]
	BarrierViolation(String),

	/// An id that was never issued by the vocabulary.
	#[error("unknown vocabulary item: {0}")]
	UnknownItem(u32),

	/// `overall_unseen_mass` went negative: the aggregate and the local
	/// vocabulary do not come from the same corpus.
	#[error("inconsistent aggregate: overall unseen mass = {overall_unseen_mass}")]
	InconsistentAggregate { overall_unseen_mass: f64 },

	/// Slow and fast divergence disagree beyond tolerance.
	#[error("slow/fast divergence mismatch: slow = {slow}, fast = {fast}")]
	AssertionMismatch { slow: f64, fast: f64 },

	/// Two distributions built on different contexts were combined.
	#[error("distributions belong to different contexts")]
	ContextMismatch,

	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error("snapshot encoding failed: {0}")]
	Snapshot(#[from] postcard::Error),
}

impl DistError {
	/// True for every variant the error taxonomy files under
	/// "lifecycle violation" (state ordering and barrier ordering).
	pub fn is_lifecycle_violation(&self) -> bool {
		matches!(self, DistError::LifecycleViolation { .. } | DistError::BarrierViolation(_))
	}
}

pub type Result<T> = std::result::Result<T, DistError>;
