//! Chunked, restartable reader over whitespace-delimited triple files.
//!
//! Each line holds one triple (or quad); only the first three whitespace
//! separated tokens are kept. The reader yields [`Chunk`]s of at most
//! `chunk_size` triples and records a [`ReadPosition`] after each one, which
//! can be handed back to [`TripleReader::open_at`] to continue a crashed run.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::{Chunk, ReadPosition};
use crate::error::{Error, Result};

const READ_BUFFER_BYTES: usize = 8 * 1024 * 1024;

pub struct TripleReader {
    path: PathBuf,
    reader: BufReader<File>,
    chunk_size: usize,
    max_rows: Option<u64>,
    position: ReadPosition,
    malformed: u64,
    line_buffer: Vec<u8>,
    exhausted: bool,
}

impl TripleReader {
    /// Open `path` at its beginning.
    pub fn open(path: &Path, chunk_size: usize, max_rows: Option<u64>) -> Result<Self> {
        Self::open_at(path, chunk_size, max_rows, ReadPosition::default())
    }

    /// Open `path` and continue from a position recorded by an earlier run.
    pub fn open_at(
        path: &Path,
        chunk_size: usize,
        max_rows: Option<u64>,
        start: ReadPosition,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Config("chunk size must be greater than zero".to_string()));
        }

        let input_error = |source| Error::Input { path: path.to_path_buf(), source };
        let mut file = File::open(path).map_err(input_error)?;
        let file_len = file.metadata().map_err(input_error)?.len();
        if start.byte_offset > file_len {
            return Err(Error::Progress(format!(
                "resume offset {} lies beyond the end of {} ({} bytes)",
                start.byte_offset,
                path.display(),
                file_len
            )));
        }
        file.seek(SeekFrom::Start(start.byte_offset)).map_err(input_error)?;

        debug!(path = %path.display(), offset = start.byte_offset, line = start.line, "opened triple file");

        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::with_capacity(READ_BUFFER_BYTES, file),
            chunk_size,
            max_rows,
            position: start,
            malformed: 0,
            line_buffer: Vec::with_capacity(1024),
            exhausted: false,
        })
    }

    /// Position right after the last chunk handed out.
    pub fn position(&self) -> ReadPosition {
        self.position
    }

    /// Malformed lines skipped by this reader instance.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    fn rows_left(&self) -> Option<u64> {
        self.max_rows.map(|cap| cap.saturating_sub(self.position.rows))
    }

    fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.exhausted || self.rows_left() == Some(0) {
            return Ok(None);
        }

        let mut chunk = Chunk { index: self.position.chunks, ..Chunk::default() };

        while chunk.len() < self.chunk_size && self.rows_left() != Some(0) {
            self.line_buffer.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.line_buffer)
                .map_err(|source| Error::Input { path: self.path.clone(), source })?;
            if read == 0 {
                self.exhausted = true;
                break;
            }
            self.position.byte_offset += read as u64;
            self.position.line += 1;

            let Ok(line) = std::str::from_utf8(&self.line_buffer) else {
                warn!(line = self.position.line, "skipping line that is not valid UTF-8");
                chunk.malformed += 1;
                continue;
            };

            let mut tokens = line.split_whitespace();
            match (tokens.next(), tokens.next(), tokens.next()) {
                (Some(subject), Some(relation), Some(object)) => {
                    chunk.push(subject, relation, object);
                    self.position.rows += 1;
                }
                (None, _, _) => {}
                _ => {
                    warn!(
                        line = self.position.line,
                        content = line.trim_end(),
                        "skipping malformed line with fewer than three tokens"
                    );
                    chunk.malformed += 1;
                }
            }
        }

        self.malformed += chunk.malformed;
        if chunk.is_empty() {
            return Ok(None);
        }

        self.position.chunks += 1;
        chunk.end = self.position;
        Ok(Some(chunk))
    }
}

impl Iterator for TripleReader {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(err) => {
                self.exhausted = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_input(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_chunks_respect_size_and_order() {
        let file = write_input("a p b .\nb p c .\na q c .\n");
        let chunks: Vec<Chunk> =
            TripleReader::open(file.path(), 2, None).unwrap().map(|c| c.unwrap()).collect();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].subjects, vec!["a", "b"]);
        assert_eq!(chunks[1].relations, vec!["q"]);
        assert_eq!(chunks[1].index, 1);
        assert_eq!(chunks[1].end.rows, 3);
    }

    #[test]
    fn test_quad_graph_label_is_discarded() {
        let file = write_input("<s> <p> <o> <g> .\n");
        let chunk = TripleReader::open(file.path(), 10, None).unwrap().next().unwrap().unwrap();
        assert_eq!(chunk.objects, vec!["<o>"]);
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let file = write_input("a p b\nonly two\n\nb p c\n");
        let mut reader = TripleReader::open(file.path(), 10, None).unwrap();
        let chunk = reader.next().unwrap().unwrap();
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk.malformed, 1);
        assert!(reader.next().is_none());
        assert_eq!(reader.malformed(), 1);
    }

    #[test]
    fn test_max_rows_caps_output() {
        let file = write_input("a p b\nb p c\nc p d\n");
        let rows: usize =
            TripleReader::open(file.path(), 2, Some(2)).unwrap().map(|c| c.unwrap().len()).sum();
        assert_eq!(rows, 2);
    }

    #[test]
    fn test_reopen_at_recorded_position() {
        let file = write_input("a p b\nb p c\nc p d\n");
        let mut reader = TripleReader::open(file.path(), 1, None).unwrap();
        let first = reader.next().unwrap().unwrap();

        let resumed: Vec<Chunk> = TripleReader::open_at(file.path(), 1, None, first.end)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed[0].subjects, vec!["b"]);
        assert_eq!(resumed[0].index, 1);
    }

    #[test]
    fn test_missing_file_is_input_error() {
        let err = TripleReader::open(Path::new("/nonexistent/triples.nt"), 1, None).err().unwrap();
        assert!(matches!(err, Error::Input { .. }));
    }
}
