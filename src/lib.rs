//! pagemat: paged sparse-matrix storage for gradient boosting training.
//!
//! This crate is the data layer of a gradient-boosting trainer: it
//! represents a training dataset, possibly larger than memory, as a
//! sequence of compressed-sparse-row pages with operations to merge and
//! append pages, transpose between row- and column-major layouts, persist
//! a versioned binary format, and reconcile the dataset shape across
//! cooperating distributed workers.
//!
//! # Key Types
//!
//! - [`DMatrix`] - dataset factory: in-memory or disk-paged, uri loading
//! - [`SparsePage`] / [`Entry`] - one CSR chunk of the dataset
//! - [`MetaInfo`] - labels, weights, margins, group boundaries
//! - [`ParallelGroupBuilder`] - lock-free two-pass bucket construction
//! - [`Communicator`] - explicit handle to the distributed worker group
//!
//! # Loading data
//!
//! ```no_run
//! use pagemat::{DMatrix, SingleWorker};
//!
//! // Stream a text file, caching pages on disk under `cache/train`.
//! let dmat = DMatrix::load(
//!     "data/train.libsvm#cache/train",
//!     false,
//!     false,
//!     "auto",
//!     pagemat::DEFAULT_PAGE_SIZE,
//!     &SingleWorker,
//! )?;
//! for batch in dmat.batches()? {
//!     let _page = batch?;
//!     // feed the page to the trainer
//! }
//! # Ok::<(), pagemat::DataError>(())
//! ```

pub mod collective;
pub mod data;
pub mod error;
pub mod io;
pub mod utils;

pub use collective::{Communicator, SingleWorker, StaticGroup};
pub use data::{
    Adapter, Batches, CscAdapter, CsrAdapter, DMatrix, DenseAdapter, Entry, FileAdapter,
    InfoBuffer, MatrixSource, MetaInfo, PageCache, ParallelGroupBuilder, RowBlock, SparsePage,
    DEFAULT_PAGE_SIZE,
};
pub use error::{ConfigurationError, ConsistencyError, DataError, FormatError, IngestionError};
pub use utils::run_with_threads;
