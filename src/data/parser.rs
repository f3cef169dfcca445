//! Row-stream parser collaborator.
//!
//! [`RowParser`] is the call contract the matrix factory relies on: a
//! stream of owned [`RowBatch`]es, partitioned by (part, npart) so
//! distributed workers can split one input file. [`LineParser`] is the
//! bundled implementation for the text formats the loader recognizes
//! (libsvm and csv); anything fancier is expected to come from outside
//! through the same trait.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::data::adapter::RowBlock;
use crate::error::{ConfigurationError, IngestionError};

/// Lines consumed per [`RowBatch`].
const BATCH_LINES: usize = 4096;

/// An owned batch of parsed rows. `offset[0] == 0`.
#[derive(Debug, Clone, Default)]
pub struct RowBatch {
    pub offset: Vec<u64>,
    pub index: Vec<u32>,
    pub value: Vec<f32>,
    pub label: Vec<f32>,
}

impl RowBatch {
    pub fn new() -> Self {
        Self {
            offset: vec![0],
            ..Default::default()
        }
    }

    /// Number of rows in the batch.
    pub fn num_rows(&self) -> usize {
        self.offset.len() - 1
    }

    /// Borrow as the uniform block shape adapters produce.
    pub fn as_block(&self) -> RowBlock<'_> {
        RowBlock {
            offset: &self.offset,
            index: &self.index,
            value: Some(&self.value),
            label: if self.label.is_empty() {
                None
            } else {
                Some(&self.label)
            },
        }
    }
}

/// Call contract of the external row-stream parser.
pub trait RowParser {
    /// The next batch of rows, or `None` when this worker's partition is
    /// exhausted.
    fn next_batch(&mut self) -> Result<Option<RowBatch>, IngestionError>;
}

impl<P: RowParser + ?Sized> RowParser for Box<P> {
    fn next_batch(&mut self) -> Result<Option<RowBatch>, IngestionError> {
        (**self).next_batch()
    }
}

impl<P: RowParser + ?Sized> RowParser for &mut P {
    fn next_batch(&mut self) -> Result<Option<RowBatch>, IngestionError> {
        (**self).next_batch()
    }
}

// ============================================================================
// Formats
// ============================================================================

/// Text formats the bundled line parser understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    /// Sniff binary magic, else guess from the extension (libsvm default).
    Auto,
    Csv,
    Libsvm,
}

impl TextFormat {
    pub fn parse(name: &str) -> Result<Self, ConfigurationError> {
        match name {
            "auto" => Ok(TextFormat::Auto),
            "csv" => Ok(TextFormat::Csv),
            "libsvm" => Ok(TextFormat::Libsvm),
            _ => Err(ConfigurationError::UnknownFormat(name.to_owned())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TextFormat::Auto => "auto",
            TextFormat::Csv => "csv",
            TextFormat::Libsvm => "libsvm",
        }
    }
}

/// Best-effort format guess from a file extension, used to annotate parser
/// failures and to resolve `auto` for the line parser.
pub fn guess_format(path: &str) -> Option<TextFormat> {
    match path.rsplit('.').next() {
        Some("csv") => Some(TextFormat::Csv),
        Some("libsvm") => Some(TextFormat::Libsvm),
        _ => None,
    }
}

// ============================================================================
// Line parser
// ============================================================================

/// Whitespace/comma text parser over one byte-range partition of a file.
///
/// The file is split into `npart` byte ranges; a line belongs to the
/// partition containing its first byte. Partition `part` seeks to its range
/// start, skips the line straddling the boundary (it belongs to the
/// previous partition), and reads until its range end.
pub struct LineParser {
    reader: BufReader<File>,
    format: TextFormat,
    /// Absolute byte position of the next unread byte.
    pos: u64,
    /// Exclusive upper bound: lines starting at or past this belong to the
    /// next partition.
    end: u64,
    /// 1-based line counter within this partition, for diagnostics.
    line_no: u64,
}

impl LineParser {
    /// Open partition `part` of `npart` of the file at `path`.
    pub fn open(
        path: &Path,
        format: TextFormat,
        part: usize,
        npart: usize,
    ) -> Result<Self, IngestionError> {
        assert!(npart > 0 && part < npart, "invalid partition");
        let format = match format {
            TextFormat::Auto => {
                guess_format(&path.to_string_lossy()).unwrap_or(TextFormat::Libsvm)
            }
            other => other,
        };

        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let begin = size * part as u64 / npart as u64;
        let end = size * (part + 1) as u64 / npart as u64;

        let mut reader = BufReader::new(file);
        let mut pos = begin;
        if begin > 0 {
            // Peek the byte before the range: if it is a newline the range
            // starts exactly on a line, otherwise skip the straddling line.
            reader.seek(SeekFrom::Start(begin - 1))?;
            let mut b = [0u8; 1];
            reader.read_exact(&mut b)?;
            if b[0] != b'\n' {
                let mut skipped = String::new();
                pos += reader.read_line(&mut skipped)? as u64;
            }
        }

        Ok(Self {
            reader,
            format,
            pos,
            end,
            line_no: 0,
        })
    }

    fn parse_line(&self, line: &str, batch: &mut RowBatch) -> Result<(), IngestionError> {
        let parse_err = |msg: String| IngestionError::Parse {
            line: self.line_no,
            msg,
        };
        match self.format {
            TextFormat::Libsvm => {
                let mut tokens = line.split_whitespace();
                let Some(first) = tokens.next() else {
                    return Ok(()); // blank line
                };
                let label: f32 = first
                    .parse()
                    .map_err(|_| parse_err(format!("expected a label, got {first:?}")))?;
                batch.label.push(label);
                for token in tokens {
                    let (idx, val) = token
                        .split_once(':')
                        .ok_or_else(|| parse_err(format!("expected index:value, got {token:?}")))?;
                    let idx: u32 = idx
                        .parse()
                        .map_err(|_| parse_err(format!("bad feature index {idx:?}")))?;
                    let val: f32 = val
                        .parse()
                        .map_err(|_| parse_err(format!("bad feature value {val:?}")))?;
                    batch.index.push(idx);
                    batch.value.push(val);
                }
                batch.offset.push(batch.index.len() as u64);
            }
            TextFormat::Csv | TextFormat::Auto => {
                if line.trim().is_empty() {
                    return Ok(());
                }
                for (c, cell) in line.trim().split(',').enumerate() {
                    let val: f32 = cell
                        .trim()
                        .parse()
                        .map_err(|_| parse_err(format!("bad csv value {cell:?}")))?;
                    batch.index.push(c as u32);
                    batch.value.push(val);
                }
                batch.offset.push(batch.index.len() as u64);
            }
        }
        Ok(())
    }
}

impl RowParser for LineParser {
    fn next_batch(&mut self) -> Result<Option<RowBatch>, IngestionError> {
        let mut batch = RowBatch::new();
        let mut line = String::new();
        while batch.num_rows() < BATCH_LINES && self.pos < self.end {
            line.clear();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            self.pos += n as u64;
            self.line_no += 1;
            self.parse_line(line.trim_end_matches(['\n', '\r']), &mut batch)?;
        }
        if batch.num_rows() == 0 {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    fn read_all(parser: &mut LineParser) -> RowBatch {
        let mut all = RowBatch::new();
        while let Some(batch) = parser.next_batch().unwrap() {
            let base = *all.offset.last().unwrap();
            all.offset.extend(batch.offset[1..].iter().map(|&o| base + o));
            all.index.extend(&batch.index);
            all.value.extend(&batch.value);
            all.label.extend(&batch.label);
        }
        all
    }

    #[test]
    fn libsvm_basic() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "train.libsvm", "1 0:1.5 3:2.0\n0 1:0.5\n\n1\n");
        let mut p = LineParser::open(&path, TextFormat::Auto, 0, 1).unwrap();
        let b = read_all(&mut p);
        assert_eq!(b.num_rows(), 3);
        assert_eq!(b.offset, vec![0, 2, 3, 3]);
        assert_eq!(b.index, vec![0, 3, 1]);
        assert_eq!(b.value, vec![1.5, 2.0, 0.5]);
        assert_eq!(b.label, vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn csv_basic() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "train.csv", "1.0,2.0\n3.0,4.0\n");
        let mut p = LineParser::open(&path, TextFormat::Auto, 0, 1).unwrap();
        let b = read_all(&mut p);
        assert_eq!(b.num_rows(), 2);
        assert_eq!(b.offset, vec![0, 2, 4]);
        assert_eq!(b.index, vec![0, 1, 0, 1]);
        assert_eq!(b.value, vec![1.0, 2.0, 3.0, 4.0]);
        assert!(b.label.is_empty());
    }

    #[test]
    fn libsvm_bad_token_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "bad.libsvm", "1 0:1.5\n0 oops\n");
        let mut p = LineParser::open(&path, TextFormat::Libsvm, 0, 1).unwrap();
        p.next_batch().unwrap_err();
    }

    #[test]
    fn csv_bad_cell_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "bad.csv", "1.0,x\n");
        let mut p = LineParser::open(&path, TextFormat::Csv, 0, 1).unwrap();
        let err = p.next_batch().unwrap_err();
        assert!(matches!(err, IngestionError::Parse { line: 1, .. }));
    }

    #[test]
    fn partitions_cover_all_lines_once() {
        let dir = tempfile::tempdir().unwrap();
        let content: String = (0..100).map(|i| format!("{i}.0\n")).collect();
        let path = write_file(&dir, "part.csv", &content);

        for npart in [1, 2, 3, 4, 7] {
            let mut seen = Vec::new();
            for part in 0..npart {
                let mut p = LineParser::open(&path, TextFormat::Csv, part, npart).unwrap();
                let b = read_all(&mut p);
                seen.extend(b.value);
            }
            seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let expected: Vec<f32> = (0..100).map(|i| i as f32).collect();
            assert_eq!(seen, expected, "npart={npart}");
        }
    }

    #[test]
    fn format_names_roundtrip() {
        for f in [TextFormat::Auto, TextFormat::Csv, TextFormat::Libsvm] {
            assert_eq!(TextFormat::parse(f.name()).unwrap(), f);
        }
        assert!(TextFormat::parse("parquet").is_err());
    }

    #[test]
    fn guess_from_extension() {
        assert_eq!(guess_format("data/train.csv"), Some(TextFormat::Csv));
        assert_eq!(guess_format("train.libsvm"), Some(TextFormat::Libsvm));
        assert_eq!(guess_format("train.txt"), None);
    }
}
