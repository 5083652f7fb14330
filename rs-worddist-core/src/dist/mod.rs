//! Smoothed item distributions and the measures defined on them.
//!
//! This module provides:
//! - The vocabulary memoizer (`Vocabulary`, `VocabItem`)
//! - Per-distribution count storage (`ItemStorage`)
//! - The per-run context holding the corpus-wide aggregate (`Context`)
//! - Two-phase distributions (`Distribution`)
//! - Smoothing strategies, divergences and the Dunning G² test

/// String to id memoizer shared by every distribution of a run.
pub mod vocab;

/// Item to count mapping with incrementally maintained totals.
pub mod storage;

/// Per-run context: vocabulary, smoothing strategy and the global aggregate.
///
/// Owns the barrier between the local and the global phase.
pub mod context;

/// Distribution lifecycle, ingestion, merging and smoothed lookups.
pub mod distribution;

/// `SmoothingStrategy` trait and its implementations.
pub mod smoothing;

/// KL divergence (slow, fast and checked), symmetric KL and cosine similarity.
pub mod divergence;

/// Dunning log-likelihood ratio.
pub mod dunning;

pub use context::{Context, GlobalStats, Snapshot};
pub use distribution::{Distribution, Lifecycle};
pub use divergence::{KlBreakdown, KlEngine};
pub use dunning::DunningScore;
pub use smoothing::{PseudoGoodTuring, SmoothingStrategy, Unsmoothed};
pub use storage::ItemStorage;
pub use vocab::{VocabItem, Vocabulary};
