//! CSR pages: the unit of sparse-matrix storage.

use rayon::prelude::*;

use super::adapter::RowBlock;
use super::group_builder::ParallelGroupBuilder;
use crate::error::ConsistencyError;
use crate::utils::{chunk_ranges, resolve_threads, run_with_threads};

/// One stored element: a column index and a value.
///
/// After a [`SparsePage::transpose`] the page is keyed by column and
/// `index` holds the row instead.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Entry {
    /// Feature (column) index, or row index in a column-keyed page.
    pub index: u32,
    /// Stored value.
    pub fvalue: f32,
}

impl Entry {
    #[inline]
    pub fn new(index: u32, fvalue: f32) -> Self {
        Self { index, fvalue }
    }
}

/// One bounded CSR chunk of a dataset that may exceed memory.
///
/// # Structure
///
/// - `offset`: row boundaries, length `num_rows + 1`, `offset[0] == 0`,
///   nondecreasing, `offset.last() == data.len()`
/// - `data`: entries of all rows, back to back
/// - `base_rowid`: this page's starting row index within the virtual whole
///   matrix, so multi-page matrices transpose and merge correctly
///
/// A page is append-only while being built and read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SparsePage {
    pub offset: Vec<u64>,
    pub data: Vec<Entry>,
    pub base_rowid: u64,
}

impl Default for SparsePage {
    fn default() -> Self {
        Self::new()
    }
}

impl SparsePage {
    pub fn new() -> Self {
        Self {
            offset: vec![0],
            data: Vec::new(),
            base_rowid: 0,
        }
    }

    /// Number of rows in this page.
    #[inline]
    pub fn num_rows(&self) -> usize {
        self.offset.len() - 1
    }

    /// Number of stored entries.
    #[inline]
    pub fn num_nonzeros(&self) -> usize {
        self.data.len()
    }

    /// True when the page holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reset to an empty page starting at row 0.
    pub fn clear(&mut self) {
        self.offset.clear();
        self.offset.push(0);
        self.data.clear();
        self.base_rowid = 0;
    }

    /// Entries of row `i` (panics if out of bounds).
    #[inline]
    pub fn row(&self, i: usize) -> &[Entry] {
        assert!(i < self.num_rows(), "row {} out of bounds", i);
        &self.data[self.offset[i] as usize..self.offset[i + 1] as usize]
    }

    /// Iterate over the rows of this page.
    pub fn rows(&self) -> impl Iterator<Item = &[Entry]> + '_ {
        (0..self.num_rows()).map(move |i| self.row(i))
    }

    /// Append another row-keyed page.
    ///
    /// `other.offset[0]` must be 0. Appended row boundaries become
    /// `prior_total + other.offset[i + 1]`.
    pub fn push(&mut self, other: &SparsePage) {
        debug_assert_eq!(other.offset.first().copied(), Some(0));
        let top = *self.offset.last().expect("offset nonempty");
        self.data.extend_from_slice(&other.data);
        self.offset.reserve(other.num_rows());
        for i in 0..other.num_rows() {
            self.offset.push(top + other.offset[i + 1]);
        }
    }

    /// Ingest an externally parsed batch of rows.
    ///
    /// A block without a values array carries an implicit value of 1.0 for
    /// every entry.
    pub fn push_rows(&mut self, block: &RowBlock<'_>) {
        let n = block.num_rows();
        let first = block.offset[0] as usize;
        let last = block.offset[n] as usize;
        self.offset.reserve(n);
        self.data.reserve(last - first);

        let mut top = *self.offset.last().expect("offset nonempty");
        for i in 0..n {
            top += block.offset[i + 1] - block.offset[i];
            self.offset.push(top);
        }
        for j in first..last {
            let fvalue = block.value.map_or(1.0, |v| v[j]);
            self.data.push(Entry::new(block.index[j], fvalue));
        }
        debug_assert_eq!(*self.offset.last().unwrap() as usize, self.data.len());
    }

    /// Merge another column-keyed page into this one.
    ///
    /// An empty `other` is a no-op. An empty `self` becomes a copy of
    /// `other`. Otherwise both pages must have the same column count; for
    /// each column the merged segment is self's entries followed by
    /// other's. A width mismatch is a consistency error, never padded.
    pub fn push_csc(&mut self, other: &SparsePage) -> Result<(), ConsistencyError> {
        if other.data.is_empty() {
            return Ok(());
        }
        if self.data.is_empty() {
            self.offset = other.offset.clone();
            self.data = other.data.clone();
            return Ok(());
        }
        if self.offset.len() != other.offset.len() {
            return Err(ConsistencyError::ColumnWidth {
                left: self.offset.len() - 1,
                right: other.offset.len() - 1,
            });
        }

        let n_cols = self.offset.len() - 1;
        let mut offset = Vec::with_capacity(self.offset.len());
        offset.push(0u64);
        let mut data = Vec::with_capacity(self.data.len() + other.data.len());
        for i in 0..n_cols {
            data.extend_from_slice(&self.data[self.offset[i] as usize..self.offset[i + 1] as usize]);
            data.extend_from_slice(
                &other.data[other.offset[i] as usize..other.offset[i + 1] as usize],
            );
            offset.push(data.len() as u64);
        }

        self.offset = offset;
        self.data = data;
        Ok(())
    }

    /// Produce the column-keyed transpose of this row-keyed page.
    ///
    /// Each transposed entry records `base_rowid + row_within_page` as its
    /// index, so the pages of a multi-page matrix can be transposed
    /// independently and merged with [`push_csc`](Self::push_csc).
    /// `num_columns` must exceed every column index stored in the page.
    ///
    /// Rows are statically split across a pool of `n_threads` threads
    /// (0 = auto); both passes of the underlying two-pass bucket builder
    /// replay the same chunk-to-thread assignment.
    pub fn transpose(&self, num_columns: usize, n_threads: usize) -> SparsePage {
        let n_threads = resolve_threads(n_threads);
        let ranges = chunk_ranges(self.num_rows(), n_threads);
        let mut builder = ParallelGroupBuilder::<Entry>::new();
        builder.init_budget(num_columns, n_threads);

        run_with_threads(n_threads, || {
            ranges.par_iter().enumerate().for_each(|(tid, range)| {
                for i in range.clone() {
                    for entry in self.row(i) {
                        // SAFETY: each chunk index is a distinct logical
                        // thread id touching only its own counters.
                        unsafe { builder.add_budget(entry.index as usize, tid) };
                    }
                }
            });

            builder.init_storage();

            ranges.par_iter().enumerate().for_each(|(tid, range)| {
                for i in range.clone() {
                    let row_id = (self.base_rowid + i as u64) as u32;
                    for entry in self.row(i) {
                        // SAFETY: replays the budget pass sequence per
                        // thread id, writing only into disjoint sub-ranges.
                        unsafe {
                            builder.push(entry.index as usize, Entry::new(row_id, entry.fvalue), tid)
                        };
                    }
                }
            });
        });

        let (offset, data) = builder.into_parts();
        SparsePage {
            offset,
            data,
            base_rowid: 0,
        }
    }
}
