//! Parallel two-phase batch builder.
//!
//! `Pipeline::run` ingests every document on worker threads, freezes the
//! global aggregate once all training documents have finished their local
//! phase, then finishes every document against it.

use std::sync::{mpsc, Arc};
use std::thread;

use ahash::AHashSet;

use crate::cell::{rank_cells_by_kl, CellDistribution};
use crate::config::DistributionConfig;
use crate::dist::context::Context;
use crate::dist::distribution::Distribution;
use crate::dist::divergence::KlEngine;
use crate::dist::smoothing::{PseudoGoodTuring, SmoothingStrategy};
use crate::error::Result;

/// Work is split into `workers * CHUNKS_PER_WORKER` chunks.
const CHUNKS_PER_WORKER: usize = 8;

/// A tokenized input document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
	pub id: String,
	pub tokens: Vec<String>,
	/// Training documents feed the global aggregate.
	pub training: bool,
}

impl Document {
	pub fn new<I, T>(id: impl Into<String>, tokens: I, training: bool) -> Self
	where
		I: IntoIterator<Item = T>,
		T: Into<String>,
	{
		Self { id: id.into(), tokens: tokens.into_iter().map(Into::into).collect(), training }
	}
}

/// A document and its globally finished distribution.
#[derive(Debug)]
pub struct BuiltDocument<S: SmoothingStrategy = PseudoGoodTuring> {
	pub id: String,
	pub dist: Distribution<S>,
}

/// Output of `Pipeline::run`, in input order.
#[derive(Debug)]
pub struct Built<S: SmoothingStrategy = PseudoGoodTuring> {
	pub documents: Vec<BuiltDocument<S>>,
}

impl<S: SmoothingStrategy> Built<S> {
	pub fn len(&self) -> usize {
		self.documents.len()
	}

	pub fn is_empty(&self) -> bool {
		self.documents.is_empty()
	}

	pub fn training(&self) -> impl Iterator<Item = &BuiltDocument<S>> + '_ {
		self.documents.iter().filter(|doc| doc.dist.is_training())
	}

	pub fn evaluation(&self) -> impl Iterator<Item = &BuiltDocument<S>> + '_ {
		self.documents.iter().filter(|doc| !doc.dist.is_training())
	}

	pub fn get(&self, id: &str) -> Option<&BuiltDocument<S>> {
		self.documents.iter().find(|doc| doc.id == id)
	}
}

/// Builds the distributions of a whole corpus against one context.
///
/// # Responsibilities
/// - Stopword filtering and n-gram construction
/// - Local phase on `workers * 8` chunks in parallel
/// - The barrier (`Context::finish_global`)
/// - Global phase, again in parallel
pub struct Pipeline<S: SmoothingStrategy = PseudoGoodTuring> {
	context: Arc<Context<S>>,
	config: DistributionConfig,
	stopwords: AHashSet<String>,
}

impl<S: SmoothingStrategy> Pipeline<S> {
	/// `stopwords` are compared against lowercased tokens.
	pub fn new(context: Arc<Context<S>>, config: DistributionConfig, stopwords: AHashSet<String>) -> Self {
		Self { context, config, stopwords }
	}

	pub fn context(&self) -> &Arc<Context<S>> {
		&self.context
	}

	pub fn config(&self) -> &DistributionConfig {
		&self.config
	}

	fn is_stopword(&self, token: &str) -> bool {
		self.config.ignore_stopwords && self.stopwords.contains(&token.to_lowercase())
	}

	/// Runs both phases over `documents`.
	///
	/// The context must not be frozen yet if any document is a training
	/// document. On error the context is left partially filled and should be
	/// discarded.
	pub fn run(&self, documents: Vec<Document>) -> Result<Built<S>> {
		let workers = self.config.effective_workers();
		let chunk_size = documents.len().div_ceil(workers * CHUNKS_PER_WORKER).max(1);
		log::info!("building {} documents on {} workers (chunks of {})", documents.len(), workers, chunk_size);

		let mut built = self.build_local(&documents, chunk_size)?;

		let stats = self.context.finish_global()?;
		log::info!("aggregate ready: {} known items over {} tokens", stats.num_known_items(), stats.total_tokens());

		self.finish_global_phase(&mut built, chunk_size)?;
		log::info!("all {} documents finished", built.len());
		Ok(Built { documents: built })
	}

	fn build_document(&self, doc: &Document) -> Result<BuiltDocument<S>> {
		let tokens: Vec<&str> = doc.tokens.iter().map(String::as_str).filter(|token| !self.is_stopword(token)).collect();

		let mut dist = self.context.new_distribution(doc.training);
		dist.add_ngrams(&tokens, self.config.ngram_order())?;
		if doc.training {
			dist.finish_before_global(self.config.min_count)?;
		}
		Ok(BuiltDocument { id: doc.id.clone(), dist })
	}

	/// Builds every document and locally finishes the training ones.
	/// Chunks are reassembled in input order.
	fn build_local(&self, documents: &[Document], chunk_size: usize) -> Result<Vec<BuiltDocument<S>>> {
		let (tx, rx) = mpsc::channel();
		thread::scope(|scope| {
			for (index, chunk) in documents.chunks(chunk_size).enumerate() {
				let tx = tx.clone();
				scope.spawn(move || {
					let built: Result<Vec<BuiltDocument<S>>> = chunk.iter().map(|doc| self.build_document(doc)).collect();
					// The receiver outlives the scope
					let _ = tx.send((index, built));
				});
			}
		});
		drop(tx);

		let mut parts: Vec<(usize, Result<Vec<BuiltDocument<S>>>)> = rx.iter().collect();
		parts.sort_by_key(|(index, _)| *index);

		let mut built = Vec::with_capacity(documents.len());
		for (_, part) in parts {
			built.extend(part?);
		}
		Ok(built)
	}

	fn finish_global_phase(&self, documents: &mut [BuiltDocument<S>], chunk_size: usize) -> Result<()> {
		let min_count = self.config.min_count;
		let (tx, rx) = mpsc::channel();
		thread::scope(|scope| {
			for chunk in documents.chunks_mut(chunk_size) {
				let tx = tx.clone();
				scope.spawn(move || {
					let finished = chunk.iter_mut().try_for_each(|doc| {
						if doc.dist.is_training() { doc.dist.finish_after_global() } else { doc.dist.finish(min_count) }
					});
					let _ = tx.send(finished);
				});
			}
		});
		drop(tx);
		rx.iter().collect()
	}

	/// Pools the training documents into cells.
	///
	/// `assign` maps a training document to a cell index in `labels`, or
	/// `None` to leave it out. Cells are finished before returning.
	pub fn build_cells<F>(&self, built: &Built<S>, labels: &[String], mut assign: F) -> Result<Vec<CellDistribution<S>>>
	where
		F: FnMut(&BuiltDocument<S>) -> Option<usize>,
	{
		let mut cells: Vec<CellDistribution<S>> =
			labels.iter().map(|label| CellDistribution::new(&self.context, label.as_str())).collect();
		for doc in built.training() {
			match assign(doc).and_then(|index| cells.get_mut(index)) {
				Some(cell) => {
					cell.add_document(&doc.dist)?;
				}
				None => log::debug!("document {} has no cell", doc.id),
			}
		}
		for cell in &mut cells {
			cell.finish(self.config.min_count)?;
		}
		Ok(cells)
	}

	/// Ranks the cells for every evaluation document with the configured KL
	/// engine and `partial` flag.
	pub fn rank_evaluation(&self, built: &Built<S>, cells: &[CellDistribution<S>]) -> Result<Vec<(String, Vec<(usize, f64)>)>> {
		let engine = KlEngine::from_config(&self.config);
		built
			.evaluation()
			.map(|doc| -> Result<(String, Vec<(usize, f64)>)> {
				Ok((doc.id.clone(), rank_cells_by_kl(&doc.dist, cells, self.config.partial, engine)?))
			})
			.collect()
	}
}
