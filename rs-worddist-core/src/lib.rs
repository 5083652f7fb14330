//! Word and n-gram distribution core.
//!
//! This crate provides the statistical layer of a document geolocation
//! system:
//! - A memoizer turning words and n-grams into compact ids
//! - Two-phase smoothed distributions backed off to a corpus-wide aggregate
//! - KL divergence (slow and fast forms), cosine similarity and Dunning G²
//! - Cell distributions and rankings built on top of them
//! - A parallel pipeline running the whole two-phase build
//!
//! All state lives in an explicit `Context`, so several corpora can be
//! processed side by side.

/// Distributions, smoothing and divergence measures.
pub mod dist;

/// Run-wide configuration.
pub mod config;

/// Error type shared by the whole crate.
pub mod error;

/// Cell (region) distributions and ranking strategies.
pub mod cell;

/// Parallel two-phase batch builder.
pub mod pipeline;

/// Seeded differential harness comparing the slow and fast divergence.
pub mod harness;

/// I/O utilities (line files, stopwords, snapshots).
pub mod io;

pub use config::{DistributionConfig, SymmetricMode};
pub use error::{DistError, Result};
