//! On-disk page cache for external-memory matrices.
//!
//! A cache prefix names two files: `{prefix}.row.page` holds the page
//! sequence, `{prefix}.cache` the dataset metadata. The page file is
//! append-only while being built (single writer) and read-only afterwards,
//! so concurrent readers are safe once [`PageCacheWriter::finalize`] has
//! run.
//!
//! Page file layout: magic, version record, then one record per page:
//!
//! ```text
//! [n_rows: u64][n_entries: u64][crc32: u32][offsets][entries]
//! ```
//!
//! The checksum covers the offsets and entries bytes of that record, so
//! corruption is detected page by page without reading the whole file up
//! front. Iteration ends at a clean end-of-file on a record boundary.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use tracing::debug;

use super::meta::MetaInfo;
use super::page::{Entry, SparsePage};
use crate::error::{DataError, FormatError};
use crate::io::{read_magic, read_version, write_u32, write_u64, write_version, PAGE_CACHE_MAGIC};

fn page_file(prefix: &str) -> PathBuf {
    PathBuf::from(format!("{prefix}.row.page"))
}

fn meta_file(prefix: &str) -> PathBuf {
    PathBuf::from(format!("{prefix}.cache"))
}

/// Single writer building a page cache.
pub struct PageCacheWriter {
    pages: BufWriter<File>,
    prefix: String,
    pages_written: u64,
}

impl PageCacheWriter {
    /// Create the cache files for `prefix`, truncating any previous ones.
    pub fn create(prefix: &str) -> Result<Self, DataError> {
        let mut pages = BufWriter::new(File::create(page_file(prefix))?);
        write_u32(&mut pages, PAGE_CACHE_MAGIC)?;
        write_version(&mut pages)?;
        Ok(Self {
            pages,
            prefix: prefix.to_owned(),
            pages_written: 0,
        })
    }

    /// Append one page record.
    pub fn write_page(&mut self, page: &SparsePage) -> Result<(), DataError> {
        let mut payload =
            Vec::with_capacity(page.offset.len() * 8 + page.data.len() * 8);
        for &o in &page.offset {
            payload.extend_from_slice(&o.to_le_bytes());
        }
        for e in &page.data {
            payload.extend_from_slice(&e.index.to_le_bytes());
            payload.extend_from_slice(&e.fvalue.to_le_bytes());
        }

        write_u64(&mut self.pages, page.num_rows() as u64)?;
        write_u64(&mut self.pages, page.data.len() as u64)?;
        write_u32(&mut self.pages, crc32fast::hash(&payload))?;
        self.pages.write_all(&payload)?;
        self.pages_written += 1;
        Ok(())
    }

    /// Flush the page file and persist the metadata, completing the cache.
    pub fn finalize(mut self, info: &MetaInfo) -> Result<(), DataError> {
        self.pages.flush()?;
        let mut meta = BufWriter::new(File::create(meta_file(&self.prefix))?);
        write_u32(&mut meta, PAGE_CACHE_MAGIC)?;
        info.save_binary(&mut meta)?;
        meta.flush()?;
        debug!(prefix = %self.prefix, pages = self.pages_written, "page cache written");
        Ok(())
    }
}

/// Read handle to a completed page cache.
#[derive(Debug, Clone)]
pub struct PageCache {
    prefix: String,
}

impl PageCache {
    /// Whether a completed cache exists under `prefix`.
    pub fn exists(prefix: &str) -> bool {
        page_file(prefix).is_file() && meta_file(prefix).is_file()
    }

    /// Open an existing cache, validating the page file header.
    pub fn open(prefix: &str) -> Result<Self, DataError> {
        let mut r = BufReader::new(File::open(page_file(prefix))?);
        read_magic(&mut r, PAGE_CACHE_MAGIC)?;
        read_version(&mut r)?;
        Ok(Self {
            prefix: prefix.to_owned(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Load the dataset metadata stored at finalize time.
    pub fn load_info(&self) -> Result<MetaInfo, DataError> {
        let mut r = BufReader::new(File::open(meta_file(&self.prefix))?);
        read_magic(&mut r, PAGE_CACHE_MAGIC)?;
        Ok(MetaInfo::read_from(&mut r)?)
    }

    /// Sequentially iterate the cached pages. Each page is tagged with the
    /// `base_rowid` of its first row within the whole matrix.
    pub fn batches(&self) -> Result<PageIter, DataError> {
        let mut reader = BufReader::new(File::open(page_file(&self.prefix))?);
        read_magic(&mut reader, PAGE_CACHE_MAGIC)?;
        read_version(&mut reader)?;
        Ok(PageIter {
            reader,
            next_base_rowid: 0,
        })
    }
}

/// Sequential reader over the records of a page file.
pub struct PageIter {
    reader: BufReader<File>,
    next_base_rowid: u64,
}

impl PageIter {
    /// Read the next record, `Ok(None)` on a clean end-of-file.
    fn read_page(&mut self) -> Result<Option<SparsePage>, FormatError> {
        let Some(n_rows) = read_u64_or_eof(&mut self.reader)? else {
            return Ok(None);
        };
        let n_rows = n_rows as usize;
        let mut buf = [0u8; 8];
        crate::io::read_exact_or_truncated(&mut self.reader, &mut buf)?;
        let n_entries = u64::from_le_bytes(buf) as usize;
        crate::io::read_exact_or_truncated(&mut self.reader, &mut buf[..4])?;
        let expected_crc = u32::from_le_bytes(buf[..4].try_into().expect("4 bytes"));

        let mut payload = vec![0u8; (n_rows + 1) * 8 + n_entries * 8];
        crate::io::read_exact_or_truncated(&mut self.reader, &mut payload)?;
        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != expected_crc {
            return Err(FormatError::ChecksumMismatch {
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        let mut offset = Vec::with_capacity(n_rows + 1);
        for chunk in payload[..(n_rows + 1) * 8].chunks_exact(8) {
            offset.push(u64::from_le_bytes(chunk.try_into().expect("8 bytes")));
        }
        let mut data = Vec::with_capacity(n_entries);
        for chunk in payload[(n_rows + 1) * 8..].chunks_exact(8) {
            let index = u32::from_le_bytes(chunk[..4].try_into().expect("4 bytes"));
            let fvalue = f32::from_le_bytes(chunk[4..].try_into().expect("4 bytes"));
            data.push(Entry::new(index, fvalue));
        }
        if offset.first() != Some(&0) || offset.last().copied() != Some(data.len() as u64) {
            return Err(FormatError::Corrupt(
                "page offsets do not match entry count".to_owned(),
            ));
        }

        let base_rowid = self.next_base_rowid;
        self.next_base_rowid += n_rows as u64;
        Ok(Some(SparsePage {
            offset,
            data,
            base_rowid,
        }))
    }
}

impl Iterator for PageIter {
    type Item = Result<SparsePage, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_page() {
            Ok(Some(page)) => Some(Ok(page)),
            Ok(None) => None,
            Err(e) => Some(Err(e.into())),
        }
    }
}

/// Read a `u64`, distinguishing a clean end-of-stream (`None`) from a
/// truncated record.
fn read_u64_or_eof<R: Read>(r: &mut R) -> Result<Option<u64>, FormatError> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < 8 {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FormatError::Truncated {
                expected: 8 - filled,
            });
        }
        filled += n;
    }
    Ok(Some(u64::from_le_bytes(buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(rows: &[&[(u32, f32)]], base_rowid: u64) -> SparsePage {
        let mut p = SparsePage::new();
        p.base_rowid = base_rowid;
        for row in rows {
            for &(i, v) in *row {
                p.data.push(Entry::new(i, v));
            }
            p.offset.push(p.data.len() as u64);
        }
        p
    }

    #[test]
    fn roundtrip_two_pages() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("train").to_string_lossy().into_owned();
        assert!(!PageCache::exists(&prefix));

        let p0 = page(&[&[(0, 1.0), (2, 2.0)], &[(1, 3.0)]], 0);
        let p1 = page(&[&[(2, 4.0)]], 2);
        let info = MetaInfo {
            num_rows: 3,
            num_cols: 3,
            num_nonzeros: 4,
            ..Default::default()
        };

        let mut w = PageCacheWriter::create(&prefix).unwrap();
        w.write_page(&p0).unwrap();
        w.write_page(&p1).unwrap();
        w.finalize(&info).unwrap();
        assert!(PageCache::exists(&prefix));

        let cache = PageCache::open(&prefix).unwrap();
        assert_eq!(cache.load_info().unwrap(), info);

        let pages: Vec<_> = cache.batches().unwrap().map(Result::unwrap).collect();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].base_rowid, 0);
        assert_eq!(pages[0].offset, p0.offset);
        assert_eq!(pages[0].data, p0.data);
        assert_eq!(pages[1].base_rowid, 2);
        assert_eq!(pages[1].data, p1.data);
    }

    #[test]
    fn missing_cache_does_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("nope").to_string_lossy().into_owned();
        assert!(!PageCache::exists(&prefix));
        assert!(PageCache::open(&prefix).is_err());
    }

    #[test]
    fn corrupted_page_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("train").to_string_lossy().into_owned();

        let mut w = PageCacheWriter::create(&prefix).unwrap();
        w.write_page(&page(&[&[(0, 1.0)]], 0)).unwrap();
        w.finalize(&MetaInfo::default()).unwrap();

        // Flip a byte inside the record payload.
        let path = page_file(&prefix);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let cache = PageCache::open(&prefix).unwrap();
        let got: Result<Vec<_>, _> = cache.batches().unwrap().collect();
        assert!(matches!(
            got,
            Err(DataError::Format(FormatError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn truncated_record_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("train").to_string_lossy().into_owned();

        let mut w = PageCacheWriter::create(&prefix).unwrap();
        w.write_page(&page(&[&[(0, 1.0), (1, 2.0)]], 0)).unwrap();
        w.finalize(&MetaInfo::default()).unwrap();

        let path = page_file(&prefix);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

        let cache = PageCache::open(&prefix).unwrap();
        let got: Result<Vec<_>, _> = cache.batches().unwrap().collect();
        assert!(matches!(
            got,
            Err(DataError::Format(FormatError::Truncated { .. }))
        ));
    }

    #[test]
    fn wrong_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("train").to_string_lossy().into_owned();
        std::fs::write(page_file(&prefix), 0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        std::fs::write(meta_file(&prefix), b"junk").unwrap();
        assert!(matches!(
            PageCache::open(&prefix),
            Err(DataError::Format(FormatError::BadMagic { .. }))
        ));
    }
}
