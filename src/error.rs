//! Error types for the storage layer.
//!
//! Every failure here is fatal for the load or merge that produced it: a
//! half-loaded dataset would silently corrupt downstream training, so there
//! is no degraded mode and no retry path. Callers propagate with `?` and
//! abort the operation.

use std::io;

use thiserror::Error;

/// A binary stream did not match the supported on-disk format.
#[derive(Debug, Error)]
pub enum FormatError {
    /// Leading magic number did not identify a known file type.
    #[error("bad magic number: expected {expected:#010x}, got {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    /// The stored major version is not the supported one. Regenerate the
    /// file with the current version of this library.
    #[error(
        "binary format version {major}.{minor} is not supported; \
         re-save the data with format version {supported}"
    )]
    UnsupportedVersion { major: u32, minor: u32, supported: u32 },

    /// The stream ended before a full record could be read.
    #[error("truncated stream: expected {expected} more bytes")]
    Truncated { expected: usize },

    /// Structurally invalid content behind a valid header.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Stored checksum does not match the bytes on disk.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The caller handed us something we cannot interpret.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// `set_info` key that is not one of the recognized metadata fields.
    #[error("unknown metadata key: {0:?}")]
    UnknownInfoKey(String),

    /// Data uri that does not follow `path[?format=<fmt>][#cache[:cache...]]`.
    #[error("malformed data uri {uri:?}: {reason}")]
    MalformedUri { uri: String, reason: String },

    /// Format name that no parser supports.
    #[error("unrecognized input format: {0:?}")]
    UnknownFormat(String),
}

/// Cooperating pages or workers disagree about the dataset shape.
#[derive(Debug, Error)]
pub enum ConsistencyError {
    /// A distributed worker reported a column count that differs from the
    /// group maximum.
    #[error(
        "worker {rank} has a different number of columns than worker {max_rank} \
         ({cols} vs. {max_cols})"
    )]
    ColumnCount {
        rank: usize,
        cols: u64,
        max_rank: usize,
        max_cols: u64,
    },

    /// Column-wise merge of two pages with different column counts.
    #[error("cannot merge column pages of different widths: {left} vs. {right} columns")]
    ColumnWidth { left: usize, right: usize },
}

/// The external row-stream parser failed.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A line the parser could not interpret.
    #[error("parse error at line {line}: {msg}")]
    Parse { line: u64, msg: String },

    /// A sidecar metadata file with an unparseable token.
    #[error("bad sidecar file {path:?}: {msg}")]
    Sidecar { path: String, msg: String },

    /// Boundary wrapper: the underlying failure plus a best-effort guess at
    /// what format the input actually was.
    #[error("failed to parse input stream ({format_hint}): {source}")]
    Stream {
        format_hint: String,
        #[source]
        source: Box<IngestionError>,
    },
}

/// Union of the failure families, for operations that can hit several.
#[derive(Debug, Error)]
pub enum DataError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offender() {
        let err = ConsistencyError::ColumnCount {
            rank: 1,
            cols: 9,
            max_rank: 2,
            max_cols: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("worker 1"));
        assert!(msg.contains("9 vs. 7"));

        let err = ConfigurationError::UnknownInfoKey("margin".into());
        assert!(err.to_string().contains("margin"));
    }

    #[test]
    fn data_error_from_families() {
        let e: DataError = FormatError::Truncated { expected: 8 }.into();
        assert!(matches!(e, DataError::Format(_)));

        let e: DataError = ConsistencyError::ColumnWidth { left: 3, right: 4 }.into();
        assert!(matches!(e, DataError::Consistency(_)));
    }
}
