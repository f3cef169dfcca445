//! Uniform ingestion interface over external input layouts.
//!
//! An [`Adapter`] normalizes one specific input layout (dense matrix, CSR,
//! CSC, parsed file stream) into [`RowBlock`] batches, which is the only
//! shape the matrix factory consumes. Adapters are read once, front to
//! back; a block stays valid until the next `next_block` call.

use ndarray::ArrayView2;
use rayon::prelude::*;

use super::group_builder::ParallelGroupBuilder;
use super::page::Entry;
use super::parser::{RowBatch, RowParser};
use crate::error::IngestionError;

/// A borrowed batch of externally parsed rows.
///
/// `offset` has one bound per row plus a terminator and may be a window
/// into a larger array (`offset[0]` need not be 0); `index` and `value` are
/// indexed by the offset values themselves. A missing `value` array means
/// every entry has the implicit value 1.0. `label` carries one value per
/// row when the source has labels.
#[derive(Debug, Clone, Copy)]
pub struct RowBlock<'a> {
    pub offset: &'a [u64],
    pub index: &'a [u32],
    pub value: Option<&'a [f32]>,
    pub label: Option<&'a [f32]>,
}

impl RowBlock<'_> {
    /// Number of rows in the block.
    #[inline]
    pub fn num_rows(&self) -> usize {
        self.offset.len() - 1
    }

    /// Number of entries in the block.
    #[inline]
    pub fn num_entries(&self) -> usize {
        (self.offset[self.num_rows()] - self.offset[0]) as usize
    }
}

/// Uniform ingestion contract consumed by the matrix factory.
pub trait Adapter {
    /// The next batch of rows, or `None` when the input is exhausted.
    fn next_block(&mut self) -> Result<Option<RowBlock<'_>>, IngestionError>;

    /// Column count known up front; 0 when only the data can tell.
    fn num_cols_hint(&self) -> u64 {
        0
    }
}

// ============================================================================
// Dense
// ============================================================================

/// Adapter over a dense sample-major matrix (`[n_rows, n_cols]`).
///
/// Values equal to `missing` (`NaN` matches `NaN`) are dropped.
pub struct DenseAdapter {
    offset: Vec<u64>,
    index: Vec<u32>,
    value: Vec<f32>,
    num_cols: u64,
    done: bool,
}

impl DenseAdapter {
    pub fn new(matrix: ArrayView2<'_, f32>, missing: f32) -> Self {
        let n_rows = matrix.nrows();
        let n_cols = matrix.ncols();
        let keep = |v: f32| {
            if missing.is_nan() {
                !v.is_nan()
            } else {
                v != missing
            }
        };

        // Count per row in parallel, then fill sequentially.
        let counts: Vec<usize> = (0..n_rows)
            .into_par_iter()
            .map(|r| (0..n_cols).filter(|&c| keep(matrix[[r, c]])).count())
            .collect();

        let total: usize = counts.iter().sum();
        let mut offset = Vec::with_capacity(n_rows + 1);
        offset.push(0u64);
        let mut index = Vec::with_capacity(total);
        let mut value = Vec::with_capacity(total);
        for r in 0..n_rows {
            for c in 0..n_cols {
                let v = matrix[[r, c]];
                if keep(v) {
                    index.push(c as u32);
                    value.push(v);
                }
            }
            offset.push(index.len() as u64);
        }
        debug_assert_eq!(index.len(), total);

        Self {
            offset,
            index,
            value,
            num_cols: n_cols as u64,
            done: false,
        }
    }
}

impl Adapter for DenseAdapter {
    fn next_block(&mut self) -> Result<Option<RowBlock<'_>>, IngestionError> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        Ok(Some(RowBlock {
            offset: &self.offset,
            index: &self.index,
            value: Some(&self.value),
            label: None,
        }))
    }

    fn num_cols_hint(&self) -> u64 {
        self.num_cols
    }
}

// ============================================================================
// CSR
// ============================================================================

/// Adapter over caller-owned CSR arrays; zero-copy.
pub struct CsrAdapter<'a> {
    offset: &'a [u64],
    index: &'a [u32],
    value: &'a [f32],
    num_cols: u64,
    done: bool,
}

impl<'a> CsrAdapter<'a> {
    /// `offset` is the row boundary array (`offset[0] == 0`), `index` and
    /// `value` the entry arrays, `num_cols` the declared width.
    pub fn new(offset: &'a [u64], index: &'a [u32], value: &'a [f32], num_cols: u64) -> Self {
        debug_assert_eq!(offset.first().copied(), Some(0));
        debug_assert_eq!(offset.last().map(|&n| n as usize), Some(index.len()));
        Self {
            offset,
            index,
            value,
            num_cols,
            done: false,
        }
    }
}

impl Adapter for CsrAdapter<'_> {
    fn next_block(&mut self) -> Result<Option<RowBlock<'_>>, IngestionError> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        Ok(Some(RowBlock {
            offset: self.offset,
            index: self.index,
            value: Some(self.value),
            label: None,
        }))
    }

    fn num_cols_hint(&self) -> u64 {
        self.num_cols
    }
}

// ============================================================================
// CSC
// ============================================================================

/// Adapter over CSC arrays, normalized to row order at construction.
///
/// The column-to-row flip reuses the two-pass bucket builder with rows as
/// the groups.
pub struct CscAdapter {
    offset: Vec<u64>,
    index: Vec<u32>,
    value: Vec<f32>,
    num_cols: u64,
    done: bool,
}

impl CscAdapter {
    /// `col_ptr` is the column boundary array (`col_ptr[0] == 0`),
    /// `row_index`/`value` the entry arrays, `num_rows` the matrix height.
    pub fn new(col_ptr: &[u64], row_index: &[u32], value: &[f32], num_rows: usize) -> Self {
        let n_cols = col_ptr.len().saturating_sub(1);
        let mut builder = ParallelGroupBuilder::<Entry>::new();
        builder.init_budget(num_rows, 1);
        for &r in row_index {
            // SAFETY: single logical thread.
            unsafe { builder.add_budget(r as usize, 0) };
        }
        builder.init_storage();
        for c in 0..n_cols {
            for j in col_ptr[c] as usize..col_ptr[c + 1] as usize {
                // SAFETY: replays the budget pass on the same thread.
                unsafe { builder.push(row_index[j] as usize, Entry::new(c as u32, value[j]), 0) };
            }
        }
        let (offset, entries) = builder.into_parts();

        Self {
            offset,
            index: entries.iter().map(|e| e.index).collect(),
            value: entries.iter().map(|e| e.fvalue).collect(),
            num_cols: n_cols as u64,
            done: false,
        }
    }
}

impl Adapter for CscAdapter {
    fn next_block(&mut self) -> Result<Option<RowBlock<'_>>, IngestionError> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        Ok(Some(RowBlock {
            offset: &self.offset,
            index: &self.index,
            value: Some(&self.value),
            label: None,
        }))
    }

    fn num_cols_hint(&self) -> u64 {
        self.num_cols
    }
}

// ============================================================================
// File stream
// ============================================================================

/// Adapter over the external row-stream parser.
pub struct FileAdapter<P> {
    parser: P,
    batch: Option<RowBatch>,
}

impl<P: RowParser> FileAdapter<P> {
    pub fn new(parser: P) -> Self {
        Self {
            parser,
            batch: None,
        }
    }
}

impl<P: RowParser> Adapter for FileAdapter<P> {
    fn next_block(&mut self) -> Result<Option<RowBlock<'_>>, IngestionError> {
        self.batch = self.parser.next_batch()?;
        Ok(self.batch.as_ref().map(RowBatch::as_block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn collect_rows(adapter: &mut dyn Adapter) -> Vec<Vec<(u32, f32)>> {
        let mut rows = Vec::new();
        while let Some(block) = adapter.next_block().unwrap() {
            for i in 0..block.num_rows() {
                let lo = block.offset[i] as usize;
                let hi = block.offset[i + 1] as usize;
                let row = (lo..hi)
                    .map(|j| (block.index[j], block.value.map_or(1.0, |v| v[j])))
                    .collect();
                rows.push(row);
            }
        }
        rows
    }

    #[test]
    fn dense_drops_nan_missing() {
        let m = array![[1.0, f32::NAN, 2.0], [f32::NAN, 3.0, f32::NAN]];
        let mut a = DenseAdapter::new(m.view(), f32::NAN);
        assert_eq!(a.num_cols_hint(), 3);
        let rows = collect_rows(&mut a);
        assert_eq!(rows, vec![vec![(0, 1.0), (2, 2.0)], vec![(1, 3.0)]]);
    }

    #[test]
    fn dense_finite_missing_value() {
        let m = array![[1.0, 0.0], [0.0, 2.0]];
        let mut a = DenseAdapter::new(m.view(), 0.0);
        let rows = collect_rows(&mut a);
        assert_eq!(rows, vec![vec![(0, 1.0)], vec![(1, 2.0)]]);
    }

    #[test]
    fn dense_yields_exactly_one_block() {
        let m = array![[1.0f32]];
        let mut a = DenseAdapter::new(m.view(), f32::NAN);
        assert!(a.next_block().unwrap().is_some());
        assert!(a.next_block().unwrap().is_none());
    }

    #[test]
    fn csr_zero_copy_view() {
        let offset = [0u64, 2, 2, 3];
        let index = [0u32, 4, 2];
        let value = [1.0f32, 2.0, 3.0];
        let mut a = CsrAdapter::new(&offset, &index, &value, 5);
        assert_eq!(a.num_cols_hint(), 5);
        let rows = collect_rows(&mut a);
        assert_eq!(rows, vec![vec![(0, 1.0), (4, 2.0)], vec![], vec![(2, 3.0)]]);
    }

    #[test]
    fn csc_normalizes_to_rows() {
        // Columns: col0 = {row0: 1.0, row2: 4.0}, col1 = {row1: 3.0}
        let col_ptr = [0u64, 2, 3];
        let row_index = [0u32, 2, 1];
        let value = [1.0f32, 4.0, 3.0];
        let mut a = CscAdapter::new(&col_ptr, &row_index, &value, 3);
        assert_eq!(a.num_cols_hint(), 2);
        let rows = collect_rows(&mut a);
        assert_eq!(rows, vec![vec![(0, 1.0)], vec![(1, 3.0)], vec![(0, 4.0)]]);
    }

    #[test]
    fn csc_empty() {
        let col_ptr = [0u64];
        let mut a = CscAdapter::new(&col_ptr, &[], &[], 0);
        let rows = collect_rows(&mut a);
        assert!(rows.is_empty());
    }
}
