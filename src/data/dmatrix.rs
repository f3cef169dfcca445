//! Matrix factory: in-memory vs. disk-paged construction, uri loading, and
//! distributed shape reconciliation.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use super::adapter::{Adapter, FileAdapter};
use super::meta::{try_load_floats, try_load_group, MetaInfo};
use super::page::{Entry, SparsePage};
use super::page_cache::{PageCache, PageCacheWriter, PageIter};
use super::parser::{guess_format, LineParser, RowParser, TextFormat};
use super::uri::{parse_uri, rewrite_cache_shards};
use crate::collective::Communicator;
use crate::error::{ConsistencyError, DataError, FormatError, IngestionError};
use crate::io::{
    read_f32, read_magic, read_u32, read_u64, read_u64s, write_u32, write_u64, write_u64s,
    DATASET_MAGIC,
};

/// Default bound on entries per cached page (8 bytes each, so 32 MiB).
pub const DEFAULT_PAGE_SIZE: usize = 4 << 20;

/// Test-only override for the partition count of non-distributed loads.
const TEST_NPART_ENV: &str = "PAGEMAT_TEST_NPART";

/// A fully ingested dataset: metadata plus one in-memory page.
///
/// This is what adapters and the binary loader produce, and what the
/// factory turns into a [`DMatrix`].
#[derive(Debug, Clone, Default)]
pub struct MatrixSource {
    pub info: MetaInfo,
    pub page: SparsePage,
}

impl MatrixSource {
    pub fn new(info: MetaInfo, page: SparsePage) -> Self {
        Self { info, page }
    }

    /// Drain an adapter into a single page, tracking shape and labels.
    pub fn from_adapter(adapter: &mut dyn Adapter) -> Result<Self, IngestionError> {
        let mut info = MetaInfo::default();
        let mut page = SparsePage::new();
        let mut max_col = 0u64;
        while let Some(block) = adapter.next_block()? {
            if let Some(labels) = block.label {
                info.labels.extend_from_slice(labels);
            }
            let lo = block.offset[0] as usize;
            let hi = block.offset[block.num_rows()] as usize;
            for j in lo..hi {
                max_col = max_col.max(block.index[j] as u64 + 1);
            }
            page.push_rows(&block);
        }
        info.num_rows = page.num_rows() as u64;
        info.num_nonzeros = page.num_nonzeros() as u64;
        info.num_cols = max_col.max(adapter.num_cols_hint());
        Ok(Self { info, page })
    }
}

#[derive(Debug)]
enum Storage {
    InMemory(SparsePage),
    Paged(PageCache),
}

/// A training dataset: one [`MetaInfo`] plus either an in-memory page or an
/// ordered sequence of cached page batches.
#[derive(Debug)]
pub struct DMatrix {
    info: MetaInfo,
    storage: Storage,
}

/// Iterator over the page batches of a matrix.
pub enum Batches<'a> {
    InMemory(Option<&'a SparsePage>),
    Paged(PageIter),
}

impl<'a> Iterator for Batches<'a> {
    type Item = Result<Cow<'a, SparsePage>, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Batches::InMemory(page) => page.take().map(|p| Ok(Cow::Borrowed(p))),
            Batches::Paged(iter) => iter.next().map(|r| r.map(Cow::Owned)),
        }
    }
}

impl DMatrix {
    pub fn info(&self) -> &MetaInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut MetaInfo {
        &mut self.info
    }

    pub fn num_rows(&self) -> u64 {
        self.info.num_rows
    }

    pub fn num_cols(&self) -> u64 {
        self.info.num_cols
    }

    pub fn num_nonzeros(&self) -> u64 {
        self.info.num_nonzeros
    }

    /// Whether this matrix is backed by the on-disk page cache.
    pub fn is_paged(&self) -> bool {
        matches!(self.storage, Storage::Paged(_))
    }

    /// The single in-memory page, when not paged.
    pub fn page(&self) -> Option<&SparsePage> {
        match &self.storage {
            Storage::InMemory(page) => Some(page),
            Storage::Paged(_) => None,
        }
    }

    /// Iterate the page batches in row order.
    pub fn batches(&self) -> Result<Batches<'_>, DataError> {
        match &self.storage {
            Storage::InMemory(page) => Ok(Batches::InMemory(Some(page))),
            Storage::Paged(cache) => Ok(Batches::Paged(cache.batches()?)),
        }
    }

    /// Build an in-memory matrix from an adapter, without distributed
    /// reconciliation.
    pub fn from_adapter(adapter: &mut dyn Adapter) -> Result<Self, DataError> {
        let source = MatrixSource::from_adapter(adapter)?;
        Ok(Self {
            info: source.info,
            storage: Storage::InMemory(source.page),
        })
    }

    /// Wrap an ingested source, choosing the representation.
    ///
    /// With an empty `cache_prefix` the in-memory representation is built;
    /// if the process is part of a distributed job, every worker first
    /// reports its local column count, the reports are summed into a
    /// world-sized vector, and any nonzero report disagreeing with the
    /// maximum is a fatal consistency error naming the disagreeing rank.
    /// A worker holding no data silently adopts the maximum.
    ///
    /// With a non-empty `cache_prefix` the on-disk page cache is created
    /// (if absent) or reused, and the paged representation is returned.
    pub fn create(
        mut source: MatrixSource,
        cache_prefix: &str,
        comm: &dyn Communicator,
    ) -> Result<Self, DataError> {
        if cache_prefix.is_empty() {
            if comm.is_distributed() {
                let mut ncols = vec![0u64; comm.world_size()];
                ncols[comm.rank()] = source.info.num_cols;
                comm.allreduce_sum(&mut ncols);
                let max_cols = *ncols.iter().max().expect("world is nonempty");
                let max_rank = ncols
                    .iter()
                    .position(|&v| v == max_cols)
                    .expect("max exists");

                if source.info.num_cols == 0 && source.info.num_rows == 0 {
                    warn!(rank = comm.rank(), "matrix on this worker is empty");
                    source.info.num_cols = max_cols;
                }
                for (rank, &cols) in ncols.iter().enumerate() {
                    if cols != 0 && cols != max_cols {
                        return Err(ConsistencyError::ColumnCount {
                            rank,
                            cols,
                            max_rank,
                            max_cols,
                        }
                        .into());
                    }
                }
            }
            Ok(Self {
                info: source.info,
                storage: Storage::InMemory(source.page),
            })
        } else {
            if !PageCache::exists(cache_prefix) {
                let mut writer = PageCacheWriter::create(cache_prefix)?;
                for chunk in split_rows(&source.page, DEFAULT_PAGE_SIZE) {
                    writer.write_page(&chunk)?;
                }
                writer.finalize(&source.info)?;
            } else {
                debug!(prefix = cache_prefix, "reusing existing page cache");
            }
            let cache = PageCache::open(cache_prefix)?;
            let info = cache.load_info()?;
            Ok(Self {
                info,
                storage: Storage::Paged(cache),
            })
        }
    }

    /// Load a dataset from a uri.
    ///
    /// The uri follows `path[?format=<fmt>][#cachePrefix[:cachePrefix...]]`.
    /// With `load_row_split` each worker reads its own partition of the
    /// file and cache shard paths are rewritten per rank so workers never
    /// collide. When `file_format` is `"auto"` and a single partition is
    /// requested, the file is probed for the binary dataset magic and, on a
    /// match, loaded directly into memory; otherwise the input streams
    /// through the row parser. After streaming ingestion the column count
    /// is reconciled via an all-reduce maximum across the worker group.
    /// Non-split loads opportunistically pick up `.group`, `.base_margin`
    /// and `.weight` sidecar files.
    pub fn load(
        uri: &str,
        silent: bool,
        load_row_split: bool,
        file_format: &str,
        page_size: usize,
        comm: &dyn Communicator,
    ) -> Result<Self, DataError> {
        let parsed = parse_uri(uri)?;
        let mut cache = parsed.cache.clone();
        if load_row_split {
            if let Some(c) = &cache {
                cache = Some(rewrite_cache_shards(c, comm.rank(), comm.world_size()));
            }
        }
        let cache_prefix = cache.as_deref().unwrap_or("");

        let mut format = TextFormat::parse(file_format)?;
        if format == TextFormat::Auto {
            if let Some(q) = parsed.format.as_deref() {
                format = TextFormat::parse(q)?;
            }
        }

        let (part, npart) = if load_row_split {
            (comm.rank(), comm.world_size())
        } else {
            (0, test_npart())
        };
        if npart != 1 && !silent {
            info!(part, npart, "loading one partition of the data");
        }

        let path = Path::new(&parsed.path);

        // Legacy fast path: a recognized binary magic loads a single page
        // directly into memory.
        if format == TextFormat::Auto && npart == 1 && probe_magic(path) == Some(DATASET_MAGIC) {
            let source = read_binary_file(path)?;
            let dmat = Self::create(source, cache_prefix, comm)?;
            if !silent {
                info!(
                    rows = dmat.info.num_rows,
                    cols = dmat.info.num_cols,
                    entries = dmat.info.num_nonzeros,
                    uri,
                    "matrix loaded from binary file"
                );
            }
            return Ok(dmat);
        }

        let mut dmat = (|| -> Result<DMatrix, DataError> {
            let mut parser = LineParser::open(path, format, part, npart)?;
            if cache_prefix.is_empty() {
                let mut adapter = FileAdapter::new(&mut parser);
                DMatrix::from_adapter(&mut adapter)
            } else {
                create_paged_from_parser(&mut parser, cache_prefix, page_size)
            }
        })()
        .map_err(|e| annotate_stream_failure(e, &parsed.path, format))?;

        // Partitioned workers may not see the real number of columns; sync
        // up after the matrix is loaded.
        let mut cols = [dmat.info.num_cols];
        comm.allreduce_max(&mut cols);
        dmat.info.num_cols = cols[0];

        if !load_row_split {
            let info = &mut dmat.info;
            if let Some(group_ptr) = try_load_group(&suffixed(&parsed.path, ".group"))? {
                if !silent {
                    info!(groups = group_ptr.len() - 1, path = %parsed.path, "groups loaded");
                }
                info.group_ptr = group_ptr;
            }
            if let Some(base_margin) = try_load_floats(&suffixed(&parsed.path, ".base_margin"))? {
                if !silent {
                    info!(count = base_margin.len(), path = %parsed.path, "base margins loaded");
                }
                info.base_margin = base_margin;
            }
            if let Some(weights) = try_load_floats(&suffixed(&parsed.path, ".weight"))? {
                if !silent {
                    info!(count = weights.len(), path = %parsed.path, "weights loaded");
                }
                info.weights = weights;
            }
        }

        if !silent {
            info!(
                rows = dmat.info.num_rows,
                cols = dmat.info.num_cols,
                entries = dmat.info.num_nonzeros,
                uri,
                "matrix loaded"
            );
        }
        Ok(dmat)
    }

    /// Persist the matrix in the binary dataset format the loader's fast
    /// path reads back. A paged matrix is materialized page by page.
    pub fn save_binary(&self, path: &Path) -> Result<(), DataError> {
        let mut w = BufWriter::new(File::create(path)?);
        write_u32(&mut w, DATASET_MAGIC)?;
        self.info.save_binary(&mut w)?;
        match &self.storage {
            Storage::InMemory(page) => write_page_arrays(&mut w, page)?,
            Storage::Paged(_) => {
                let mut merged = SparsePage::new();
                for batch in self.batches()? {
                    merged.push(batch?.as_ref());
                }
                write_page_arrays(&mut w, &merged)?;
            }
        }
        w.flush()?;
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn suffixed(path: &str, suffix: &str) -> std::path::PathBuf {
    std::path::PathBuf::from(format!("{path}{suffix}"))
}

fn test_npart() -> usize {
    std::env::var(TEST_NPART_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&n| n >= 1)
        .unwrap_or(1)
}

/// Capability probe: the leading magic of the file, `None` when the file
/// cannot be read that far (the parser path will surface the real error).
fn probe_magic(path: &Path) -> Option<u32> {
    let mut file = File::open(path).ok()?;
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf).ok()?;
    Some(u32::from_le_bytes(buf))
}

/// Wrap a streaming-ingestion failure once, annotated with a best-effort
/// guess at the input format.
fn annotate_stream_failure(err: DataError, path: &str, format: TextFormat) -> DataError {
    let DataError::Ingestion(inner) = err else {
        return err;
    };
    let hint = match (format, guess_format(path)) {
        (TextFormat::Auto, Some(guessed)) => {
            warn!(
                extension = guessed.name(),
                "no format parameter in the input uri; consider providing one like \
                 filename?format={}",
                guessed.name()
            );
            format!("guessed {} from the file extension", guessed.name())
        }
        (TextFormat::Auto, None) => {
            warn!(
                "no format parameter in the input uri and the extension is not \
                 recognized; consider a uri parameter like filename?format=csv"
            );
            "format unknown, used the default parser".to_owned()
        }
        (explicit, _) => format!("format {}", explicit.name()),
    };
    IngestionError::Stream {
        format_hint: hint,
        source: Box::new(inner),
    }
    .into()
}

/// Stream a parser into a fresh page cache (unless one already exists) and
/// open the paged representation.
fn create_paged_from_parser<P: RowParser>(
    parser: &mut P,
    cache_prefix: &str,
    page_size: usize,
) -> Result<DMatrix, DataError> {
    if !PageCache::exists(cache_prefix) {
        let mut writer = PageCacheWriter::create(cache_prefix)?;
        let mut info = MetaInfo::default();
        let mut page = SparsePage::new();
        let mut rows_flushed = 0u64;
        let mut max_col = 0u64;
        while let Some(batch) = parser.next_batch()? {
            info.labels.extend_from_slice(&batch.label);
            for &i in &batch.index {
                max_col = max_col.max(i as u64 + 1);
            }
            page.push_rows(&batch.as_block());
            if page.num_nonzeros() >= page_size.max(1) && page.num_rows() > 0 {
                info.num_nonzeros += page.num_nonzeros() as u64;
                rows_flushed += page.num_rows() as u64;
                writer.write_page(&page)?;
                page.clear();
                page.base_rowid = rows_flushed;
            }
        }
        if page.num_rows() > 0 || rows_flushed == 0 {
            info.num_nonzeros += page.num_nonzeros() as u64;
            rows_flushed += page.num_rows() as u64;
            writer.write_page(&page)?;
        }
        info.num_rows = rows_flushed;
        info.num_cols = max_col;
        writer.finalize(&info)?;
    } else {
        debug!(prefix = cache_prefix, "reusing existing page cache");
    }

    let cache = PageCache::open(cache_prefix)?;
    let info = cache.load_info()?;
    Ok(DMatrix {
        info,
        storage: Storage::Paged(cache),
    })
}

/// Split one page into chunks of at most `page_size` entries (and at least
/// one row), tagging each chunk with its base row id.
fn split_rows(page: &SparsePage, page_size: usize) -> Vec<SparsePage> {
    let mut out = Vec::new();
    let mut cur = SparsePage::new();
    cur.base_rowid = page.base_rowid;
    for (r, row) in page.rows().enumerate() {
        if !cur.is_empty() && cur.num_nonzeros() + row.len() > page_size {
            out.push(std::mem::take(&mut cur));
            cur.base_rowid = page.base_rowid + r as u64;
        }
        cur.data.extend_from_slice(row);
        cur.offset.push(cur.data.len() as u64);
    }
    if cur.num_rows() > 0 || out.is_empty() {
        out.push(cur);
    }
    out
}

fn write_page_arrays<W: Write>(w: &mut W, page: &SparsePage) -> Result<(), DataError> {
    write_u64s(w, &page.offset)?;
    write_u64(w, page.data.len() as u64)?;
    for e in &page.data {
        w.write_all(&e.index.to_le_bytes())?;
        w.write_all(&e.fvalue.to_le_bytes())?;
    }
    Ok(())
}

/// Read a binary dataset file: magic, metadata block, then the page arrays.
fn read_binary_file(path: &Path) -> Result<MatrixSource, DataError> {
    let mut r = BufReader::new(File::open(path)?);
    read_magic(&mut r, DATASET_MAGIC)?;
    let info = MetaInfo::read_from(&mut r)?;
    let offset = read_u64s(&mut r)?;
    let n_entries = read_u64(&mut r)? as usize;
    let mut data = Vec::with_capacity(n_entries.min(1 << 20));
    for _ in 0..n_entries {
        let index = read_u32(&mut r)?;
        let fvalue = read_f32(&mut r)?;
        data.push(Entry::new(index, fvalue));
    }

    if offset.first() != Some(&0) || offset.last().copied() != Some(data.len() as u64) {
        return Err(FormatError::Corrupt(
            "page offsets do not match entry count".to_owned(),
        )
        .into());
    }
    Ok(MatrixSource::new(
        info,
        SparsePage {
            offset,
            data,
            base_rowid: 0,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::{SingleWorker, StaticGroup};
    use crate::data::adapter::DenseAdapter;
    use ndarray::array;

    fn dense_matrix() -> DMatrix {
        let m = array![
            [1.0, f32::NAN, 2.0],
            [f32::NAN, 3.0, f32::NAN],
            [4.0, 5.0, 6.0],
        ];
        let mut adapter = DenseAdapter::new(m.view(), f32::NAN);
        DMatrix::from_adapter(&mut adapter).unwrap()
    }

    /// Contribution vectors for the column-count protocol: rank r reports
    /// `cols[r]` in its own slot.
    fn column_reports(cols: &[u64]) -> Vec<Vec<u64>> {
        cols.iter()
            .enumerate()
            .map(|(r, &c)| {
                let mut v = vec![0u64; cols.len()];
                v[r] = c;
                v
            })
            .collect()
    }

    #[test]
    fn from_adapter_counts() {
        let dmat = dense_matrix();
        assert_eq!(dmat.num_rows(), 3);
        assert_eq!(dmat.num_cols(), 3);
        assert_eq!(dmat.num_nonzeros(), 6);
        assert!(!dmat.is_paged());
        let page = dmat.page().unwrap();
        assert_eq!(page.row(1), &[Entry::new(1, 3.0)]);
    }

    #[test]
    fn create_single_worker_is_plain_wrap() {
        let m = array![[1.0f32, 2.0]];
        let mut adapter = DenseAdapter::new(m.view(), f32::NAN);
        let source = MatrixSource::from_adapter(&mut adapter).unwrap();
        let dmat = DMatrix::create(source, "", &SingleWorker).unwrap();
        assert_eq!(dmat.num_cols(), 2);
    }

    #[test]
    fn create_distributed_empty_worker_adopts_maximum() {
        // Workers report [0, 7, 7]; all three must resolve to 7.
        let reports = column_reports(&[0, 7, 7]);
        for rank in 0..3 {
            let comm = StaticGroup::new(rank, reports.clone());
            let source = MatrixSource {
                info: MetaInfo {
                    num_cols: [0, 7, 7][rank],
                    num_rows: if rank == 0 { 0 } else { 5 },
                    ..Default::default()
                },
                page: SparsePage::new(),
            };
            let dmat = DMatrix::create(source, "", &comm).unwrap();
            assert_eq!(dmat.num_cols(), 7, "rank {rank}");
        }
    }

    #[test]
    fn create_distributed_mismatch_names_rank() {
        // Workers report [7, 9, 7]: rank 1 holds the maximum, so the first
        // disagreeing nonzero report (rank 0) is named.
        let reports = column_reports(&[7, 9, 7]);
        let comm = StaticGroup::new(2, reports);
        let source = MatrixSource {
            info: MetaInfo {
                num_cols: 7,
                num_rows: 4,
                ..Default::default()
            },
            page: SparsePage::new(),
        };
        let err = DMatrix::create(source, "", &comm).unwrap_err();
        match err {
            DataError::Consistency(ConsistencyError::ColumnCount {
                rank,
                cols,
                max_rank,
                max_cols,
            }) => {
                assert_eq!(rank, 0);
                assert_eq!(cols, 7);
                assert_eq!(max_rank, 1);
                assert_eq!(max_cols, 9);
            }
            other => panic!("expected a column count error, got {other:?}"),
        }
    }

    #[test]
    fn create_with_cache_prefix_is_paged() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("train").to_string_lossy().into_owned();

        let dmat = dense_matrix();
        let source = MatrixSource::new(dmat.info().clone(), dmat.page().unwrap().clone());
        let paged = DMatrix::create(source, &prefix, &SingleWorker).unwrap();

        assert!(paged.is_paged());
        assert_eq!(paged.num_rows(), 3);
        assert_eq!(paged.num_nonzeros(), 6);

        let pages: Vec<_> = paged
            .batches()
            .unwrap()
            .map(|b| b.unwrap().into_owned())
            .collect();
        let total_rows: usize = pages.iter().map(|p| p.num_rows()).sum();
        assert_eq!(total_rows, 3);
        assert_eq!(pages[0].base_rowid, 0);
    }

    #[test]
    fn create_reuses_existing_cache() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("train").to_string_lossy().into_owned();

        let dmat = dense_matrix();
        let source = MatrixSource::new(dmat.info().clone(), dmat.page().unwrap().clone());
        DMatrix::create(source, &prefix, &SingleWorker).unwrap();

        // A second create with a different source must reuse the cache on
        // disk, not rebuild it.
        let other = MatrixSource::new(
            MetaInfo {
                num_rows: 99,
                num_cols: 99,
                num_nonzeros: 99,
                ..Default::default()
            },
            SparsePage::new(),
        );
        let reused = DMatrix::create(other, &prefix, &SingleWorker).unwrap();
        assert_eq!(reused.num_rows(), 3);
        assert_eq!(reused.num_cols(), 3);
    }

    #[test]
    fn split_rows_respects_page_size() {
        let mut page = SparsePage::new();
        for r in 0..10u32 {
            page.data.push(Entry::new(r, r as f32));
            page.data.push(Entry::new(r + 1, r as f32));
            page.offset.push(page.data.len() as u64);
        }

        let chunks = split_rows(&page, 5);
        assert!(chunks.len() > 1);
        let mut rows = 0usize;
        let mut entries = 0usize;
        for chunk in &chunks {
            assert!(chunk.num_nonzeros() <= 5 || chunk.num_rows() == 1);
            assert_eq!(chunk.base_rowid, rows as u64);
            rows += chunk.num_rows();
            entries += chunk.num_nonzeros();
        }
        assert_eq!(rows, 10);
        assert_eq!(entries, 20);
    }

    #[test]
    fn split_rows_empty_page_yields_one_empty_chunk() {
        let chunks = split_rows(&SparsePage::new(), 8);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].num_rows(), 0);
    }

    #[test]
    fn binary_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.bin");

        let mut dmat = dense_matrix();
        dmat.info_mut()
            .set_info("label", crate::data::InfoBuffer::F32(&[0.0, 1.0, 0.0]))
            .unwrap();
        dmat.save_binary(&path).unwrap();

        let source = read_binary_file(&path).unwrap();
        assert_eq!(&source.info, dmat.info());
        assert_eq!(&source.page, dmat.page().unwrap());
    }

    #[test]
    fn read_binary_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, b"definitely not a matrix").unwrap();
        assert!(matches!(
            read_binary_file(&path),
            Err(DataError::Format(FormatError::BadMagic { .. }))
        ));
    }

    #[test]
    fn probe_magic_reads_leading_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, DATASET_MAGIC.to_le_bytes()).unwrap();
        assert_eq!(probe_magic(&path), Some(DATASET_MAGIC));
        assert_eq!(probe_magic(&dir.path().join("absent")), None);
    }
}
