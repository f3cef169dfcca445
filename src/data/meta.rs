//! Per-dataset metadata: labels, weights, margins, group boundaries.

use std::io::{Read, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{ConfigurationError, FormatError, IngestionError};
use crate::io::{
    read_f32s, read_u64, read_u64s, read_version, write_f32s, write_u64, write_u64s, write_version,
};

/// Metadata attached to a [`SparsePage`](super::SparsePage) matrix.
///
/// Built once during ingestion and treated as immutable for the life of the
/// owning matrix. `group_ptr`, when nonempty, is a prefix-sum boundary
/// array: it starts at 0, is strictly increasing, and ends at `num_rows`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaInfo {
    /// Number of rows in the matrix.
    pub num_rows: u64,
    /// Number of columns.
    pub num_cols: u64,
    /// Number of stored entries, summed over all pages.
    pub num_nonzeros: u64,
    /// Per-row training labels.
    pub labels: Vec<f32>,
    /// Query-group boundaries for ranking tasks.
    pub group_ptr: Vec<u64>,
    /// Per-row sample weights.
    pub weights: Vec<f32>,
    /// Per-row initial prediction margins.
    pub base_margin: Vec<f32>,
}

/// Borrowed numeric buffer for [`MetaInfo::set_info`].
///
/// Closed union over the supported source widths; one generic copy routine
/// handles every (source, destination) pairing.
#[derive(Debug, Clone, Copy)]
pub enum InfoBuffer<'a> {
    F32(&'a [f32]),
    F64(&'a [f64]),
    U32(&'a [u32]),
    U64(&'a [u64]),
}

impl InfoBuffer<'_> {
    /// Number of elements in the buffer.
    pub fn len(&self) -> usize {
        match self {
            InfoBuffer::F32(s) => s.len(),
            InfoBuffer::F64(s) => s.len(),
            InfoBuffer::U32(s) => s.len(),
            InfoBuffer::U64(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn copy_into<T>(&self, out: &mut Vec<T>, from_f64: impl Fn(f64) -> T) {
        out.clear();
        out.reserve(self.len());
        match *self {
            InfoBuffer::F32(s) => out.extend(s.iter().map(|&v| from_f64(v as f64))),
            InfoBuffer::F64(s) => out.extend(s.iter().map(|&v| from_f64(v))),
            InfoBuffer::U32(s) => out.extend(s.iter().map(|&v| from_f64(v as f64))),
            InfoBuffer::U64(s) => out.extend(s.iter().map(|&v| from_f64(v as f64))),
        }
    }

    fn to_f32s(self, out: &mut Vec<f32>) {
        self.copy_into(out, |v| v as f32);
    }

    fn to_u64s(self, out: &mut Vec<u64>) {
        self.copy_into(out, |v| v as u64);
    }
}

impl MetaInfo {
    /// Reset every field to empty/zero.
    pub fn clear(&mut self) {
        *self = MetaInfo::default();
    }

    /// Number of query groups, 0 when ungrouped.
    pub fn num_groups(&self) -> usize {
        self.group_ptr.len().saturating_sub(1)
    }

    /// Set a metadata field from a type-erased numeric buffer.
    ///
    /// Recognized keys are `"label"`, `"weight"` and `"base_margin"` (direct
    /// copy, resized to the buffer length) and `"group"`, which interprets
    /// the buffer as per-group sizes and stores the cumulative boundary
    /// array. Any other key is a configuration error.
    pub fn set_info(&mut self, key: &str, values: InfoBuffer<'_>) -> Result<(), ConfigurationError> {
        match key {
            "label" => values.to_f32s(&mut self.labels),
            "weight" => values.to_f32s(&mut self.weights),
            "base_margin" => values.to_f32s(&mut self.base_margin),
            "group" => {
                let mut sizes = Vec::new();
                values.to_u64s(&mut sizes);
                self.group_ptr = prefix_sum(&sizes);
            }
            _ => return Err(ConfigurationError::UnknownInfoKey(key.to_owned())),
        }
        Ok(())
    }

    /// Write the binary metadata block: version record, the three counts,
    /// then the four arrays, in fixed order.
    pub fn save_binary<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        write_version(w)?;
        write_u64(w, self.num_rows)?;
        write_u64(w, self.num_cols)?;
        write_u64(w, self.num_nonzeros)?;
        write_f32s(w, &self.labels)?;
        write_u64s(w, &self.group_ptr)?;
        write_f32s(w, &self.weights)?;
        write_f32s(w, &self.base_margin)
    }

    /// Read a binary metadata block written by [`save_binary`](Self::save_binary).
    ///
    /// Fails on a major-version mismatch or a short read.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, FormatError> {
        read_version(r)?;
        let num_rows = read_u64(r)?;
        let num_cols = read_u64(r)?;
        let num_nonzeros = read_u64(r)?;
        let labels = read_f32s(r)?;
        let group_ptr = read_u64s(r)?;
        let weights = read_f32s(r)?;
        let base_margin = read_f32s(r)?;
        Ok(MetaInfo {
            num_rows,
            num_cols,
            num_nonzeros,
            labels,
            group_ptr,
            weights,
            base_margin,
        })
    }

    /// Replace `self` with a metadata block read from `r`.
    ///
    /// On failure `self` is untouched: the block is parsed into a fresh
    /// value and only assigned once complete.
    pub fn load_binary<R: Read>(&mut self, r: &mut R) -> Result<(), FormatError> {
        *self = Self::read_from(r)?;
        Ok(())
    }
}

/// Per-group sizes to a cumulative boundary array with a leading 0.
fn prefix_sum(sizes: &[u64]) -> Vec<u64> {
    let mut ptr = Vec::with_capacity(sizes.len() + 1);
    ptr.push(0);
    let mut acc = 0u64;
    for &s in sizes {
        acc += s;
        ptr.push(acc);
    }
    ptr
}

// ============================================================================
// Sidecar files
// ============================================================================

/// Load `<name>.group`: whitespace-separated per-group sizes, returned as a
/// cumulative boundary array. `Ok(None)` when the file does not exist.
pub(crate) fn try_load_group(path: &Path) -> Result<Option<Vec<u64>>, IngestionError> {
    let Some(text) = read_sidecar(path)? else {
        return Ok(None);
    };
    let mut sizes = Vec::new();
    for token in text.split_whitespace() {
        let n: u64 = token.parse().map_err(|_| IngestionError::Sidecar {
            path: path.display().to_string(),
            msg: format!("expected an integer group size, got {token:?}"),
        })?;
        sizes.push(n);
    }
    debug!(path = %path.display(), groups = sizes.len(), "loaded group sidecar");
    Ok(Some(prefix_sum(&sizes)))
}

/// Load `<name>.weight` / `<name>.base_margin`: whitespace-separated floats,
/// one per row. `Ok(None)` when the file does not exist.
pub(crate) fn try_load_floats(path: &Path) -> Result<Option<Vec<f32>>, IngestionError> {
    let Some(text) = read_sidecar(path)? else {
        return Ok(None);
    };
    let mut values = Vec::new();
    for token in text.split_whitespace() {
        let v: f32 = token.parse().map_err(|_| IngestionError::Sidecar {
            path: path.display().to_string(),
            msg: format!("expected a float, got {token:?}"),
        })?;
        values.push(v);
    }
    debug!(path = %path.display(), values = values.len(), "loaded float sidecar");
    Ok(Some(values))
}

fn read_sidecar(path: &Path) -> Result<Option<String>, IngestionError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(IngestionError::Io(e)),
    }
}
