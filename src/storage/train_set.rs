//! `train_set.npy`: the materialized triples as a NumPy `(n, 3)` array of
//! little-endian `i64`. Rows use the same layout as [`crate::core::encoding`].
//!
//! # File format (NPY v1.0)
//!
//! ```text
//! [magic: "\x93NUMPY"]
//! [major: 1][minor: 0]
//! [header_len: u16 LE]
//! [header: "{'descr': '<i8', 'fortran_order': False, 'shape': (n, 3), }" padded with spaces, ending in '\n']
//! [data: n * 3 * i64 LE, row-major]
//! ```
//!
//! The preamble plus header is padded to a multiple of 64 bytes.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use atomic_write_file::AtomicWriteFile;

use crate::core::{IndexedTriple, RECORD_SIZE};
use crate::error::{Error, Result};

pub const TRAIN_SET_FILE: &str = "train_set.npy";

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const PREAMBLE: usize = 10;
const ALIGNMENT: usize = 64;
const DESCR: &str = "<i8";

fn header(rows: usize) -> Vec<u8> {
    let mut dict = format!("{{'descr': '{DESCR}', 'fortran_order': False, 'shape': ({rows}, 3), }}");
    let unpadded = PREAMBLE + dict.len() + 1;
    let padding = (ALIGNMENT - unpadded % ALIGNMENT) % ALIGNMENT;
    dict.push_str(&" ".repeat(padding));
    dict.push('\n');

    let mut out = Vec::with_capacity(PREAMBLE + dict.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    out
}

/// Atomically replace `path` with an array holding `rows`.
pub fn write_npy(path: &Path, rows: &[IndexedTriple]) -> Result<()> {
    let mut file = AtomicWriteFile::options().open(path)?;
    {
        let mut writer = BufWriter::with_capacity(1 << 20, &mut file);
        writer.write_all(&header(rows.len()))?;
        for row in rows {
            writer.write_all(&row.to_bytes())?;
        }
        writer.flush()?;
    }
    file.commit()?;
    Ok(())
}

/// Read an array written by [`write_npy`].
pub fn read_npy(path: &Path) -> Result<Vec<IndexedTriple>> {
    let bytes = fs::read(path)?;
    let corrupt = |reason: &str| Error::CorruptIndex { path: path.to_path_buf(), reason: reason.to_string() };

    if bytes.len() < PREAMBLE || &bytes[..6] != MAGIC {
        return Err(corrupt("missing NPY magic"));
    }
    if bytes[6] != 1 {
        return Err(corrupt("unsupported NPY version"));
    }
    let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
    let data_start = PREAMBLE + header_len;
    let header = bytes
        .get(PREAMBLE..data_start)
        .and_then(|h| std::str::from_utf8(h).ok())
        .ok_or_else(|| corrupt("truncated header"))?;

    if !header.contains(&format!("'descr': '{DESCR}'")) || !header.contains("'fortran_order': False") {
        return Err(corrupt("expected a C-ordered <i8 array"));
    }
    let rows = parse_rows(header).ok_or_else(|| corrupt("expected shape (n, 3)"))?;

    let data = &bytes[data_start..];
    if data.len() != rows * RECORD_SIZE {
        return Err(corrupt("data length does not match shape"));
    }
    let mut record = [0u8; RECORD_SIZE];
    Ok(data
        .chunks_exact(RECORD_SIZE)
        .map(|chunk| {
            record.copy_from_slice(chunk);
            IndexedTriple::from_bytes(&record)
        })
        .collect())
}

fn parse_rows(header: &str) -> Option<usize> {
    let shape = header.split("'shape':").nth(1)?;
    let inner = shape.trim_start().strip_prefix('(')?.split(')').next()?;
    let mut dims = inner.split(',').map(str::trim);
    let rows = dims.next()?.parse().ok()?;
    (dims.next()? == "3").then_some(rows)
}

/// Accumulates every materialized row and rewrites the whole array after
/// each chunk, so the file on disk always ends at a chunk boundary.
pub struct TrainSetWriter {
    path: PathBuf,
    rows: Vec<IndexedTriple>,
}

impl TrainSetWriter {
    pub fn create(dir: &Path) -> Self {
        Self { path: dir.join(TRAIN_SET_FILE), rows: Vec::new() }
    }

    /// Continue from an earlier run, keeping its first `rows` rows.
    pub fn resume(dir: &Path, rows: u64) -> Result<Self> {
        let mut writer = Self::create(dir);
        if rows == 0 {
            return Ok(writer);
        }
        if !writer.path.exists() {
            return Err(Error::Progress(format!(
                "{} is missing but {rows} rows were recorded as materialized",
                writer.path.display()
            )));
        }
        writer.rows = read_npy(&writer.path)?;
        if (writer.rows.len() as u64) < rows {
            return Err(Error::Progress(format!(
                "{} holds {} rows, fewer than the {rows} recorded as materialized",
                writer.path.display(),
                writer.rows.len()
            )));
        }
        writer.rows.truncate(rows as usize);
        Ok(writer)
    }

    pub fn append(&mut self, rows: &[IndexedTriple]) -> Result<()> {
        self.rows.extend_from_slice(rows);
        write_npy(&self.path, &self.rows)
    }

    pub fn len(&self) -> u64 {
        self.rows.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_header_is_aligned() {
        for rows in [0, 3, 1_000_000_000] {
            let header = header(rows);
            assert_eq!(header.len() % ALIGNMENT, 0);
            assert_eq!(header.last(), Some(&b'\n'));
        }
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TRAIN_SET_FILE);
        let rows = vec![IndexedTriple::new(0, 0, 1), IndexedTriple::new(1, 0, 2)];
        write_npy(&path, &rows).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 64 + 2 * RECORD_SIZE);
        assert_eq!(read_npy(&path).unwrap(), rows);
    }

    #[test]
    fn test_writer_resume_truncates_to_recorded_rows() {
        let dir = TempDir::new().unwrap();
        let mut writer = TrainSetWriter::create(dir.path());
        writer.append(&[IndexedTriple::new(0, 0, 1)]).unwrap();
        writer.append(&[IndexedTriple::new(1, 0, 2), IndexedTriple::new(0, 1, 2)]).unwrap();

        let mut resumed = TrainSetWriter::resume(dir.path(), 1).unwrap();
        assert_eq!(resumed.len(), 1);
        resumed.append(&[IndexedTriple::new(2, 1, 0)]).unwrap();
        assert_eq!(
            read_npy(&dir.path().join(TRAIN_SET_FILE)).unwrap(),
            vec![IndexedTriple::new(0, 0, 1), IndexedTriple::new(2, 1, 0)]
        );
        assert!(matches!(TrainSetWriter::resume(dir.path(), 9), Err(Error::Progress(_))));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TRAIN_SET_FILE);
        fs::write(&path, b"not an array").unwrap();
        assert!(matches!(read_npy(&path), Err(Error::CorruptIndex { .. })));
    }
}
