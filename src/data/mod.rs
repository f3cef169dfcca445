//! Sparse dataset storage: pages, metadata, ingestion, and the factory.
//!
//! # Overview
//!
//! A training dataset is a sequence of fixed-format CSR chunks
//! ([`SparsePage`]) plus one [`MetaInfo`]. Datasets are built once, through
//! an [`Adapter`] or from the versioned binary format, and are immutable
//! afterwards. Datasets larger than memory are backed by the on-disk
//! [`PageCache`] and streamed batch by batch.
//!
//! [`DMatrix`] is the entry point: [`DMatrix::load`] resolves a data uri
//! (text stream, binary file, optional cache prefix) and
//! [`DMatrix::create`] wraps an already ingested source, reconciling the
//! dataset shape across distributed workers.

pub mod adapter;
mod dmatrix;
mod group_builder;
mod meta;
mod page;
mod page_cache;
pub mod parser;
pub mod uri;

pub use adapter::{Adapter, CscAdapter, CsrAdapter, DenseAdapter, FileAdapter, RowBlock};
pub use dmatrix::{Batches, DMatrix, MatrixSource, DEFAULT_PAGE_SIZE};
pub use group_builder::ParallelGroupBuilder;
pub use meta::{InfoBuffer, MetaInfo};
pub use page::{Entry, SparsePage};
pub use page_cache::{PageCache, PageCacheWriter, PageIter};
pub use parser::{LineParser, RowBatch, RowParser, TextFormat};
