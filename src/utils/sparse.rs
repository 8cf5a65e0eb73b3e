// file: src/utils/sparse.rs
// version: 1.0.0
// guid: 3f0c9b1e-7a52-4d8e-b6a1-5c2e8d9f0a14

//! Chunked iteration over sparse files
//!
//! Walks a file with `SEEK_DATA`/`SEEK_HOLE` and yields aligned records
//! describing data runs and holes. Every record is at most one chunk long
//! and never crosses a multiple of the chunk size, so callers can map
//! records directly onto page-aligned remote writes.

use crate::error::CloudImagesError;
use crate::Result;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tracing::{debug, warn};

/// Chunk size used by all uploaders and partition copies (4 MiB)
pub const CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// One record of a sparse file walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub size: u64,
    pub is_data: bool,
}

impl Chunk {
    /// Offset of the last byte covered by this chunk
    pub fn end_inclusive(&self) -> u64 {
        self.offset + self.size - 1
    }
}

/// Lazy, single-pass iterator over the data runs and holes of a file
pub struct SparseChunks<'a> {
    file: &'a File,
    chunk_size: u64,
    file_size: u64,
    pos: u64,
    run_end: u64,
    run_is_data: bool,
    sparse_supported: bool,
}

impl<'a> SparseChunks<'a> {
    /// Create a walker over `file` using the given power-of-two chunk size
    pub fn new(file: &'a File, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 || !chunk_size.is_power_of_two() {
            return Err(CloudImagesError::validation(format!(
                "Chunk size must be a power of two, got {}",
                chunk_size
            )));
        }

        let file_size = file.metadata()?.len();
        Ok(Self {
            file,
            chunk_size,
            file_size,
            pos: 0,
            run_end: 0,
            run_is_data: false,
            sparse_supported: true,
        })
    }

    /// Total size of the underlying file
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Only the data records, holes skipped
    pub fn data(self) -> impl Iterator<Item = Result<Chunk>> + 'a {
        self.filter(|chunk| !matches!(chunk, Ok(c) if !c.is_data))
    }

    fn next_run(&mut self) -> Result<()> {
        if !self.sparse_supported {
            self.run_end = self.file_size;
            self.run_is_data = true;
            return Ok(());
        }

        match seek(self.file, self.pos, libc::SEEK_DATA) {
            Ok(Some(data)) if data > self.pos => {
                self.run_end = data.min(self.file_size);
                self.run_is_data = false;
            }
            Ok(Some(data)) => {
                let hole = seek(self.file, data, libc::SEEK_HOLE)?.unwrap_or(self.file_size);
                self.run_end = hole.min(self.file_size);
                self.run_is_data = true;
            }
            Ok(None) => {
                self.run_end = self.file_size;
                self.run_is_data = false;
            }
            Err(e) => {
                warn!("Sparse seeking unsupported ({}), treating file as fully allocated", e);
                self.sparse_supported = false;
                self.run_end = self.file_size;
                self.run_is_data = true;
            }
        }

        // A run must make progress, otherwise fall back to plain reads
        if self.run_end <= self.pos {
            self.sparse_supported = false;
            self.run_end = self.file_size;
            self.run_is_data = true;
        }

        debug!(
            "Sparse run {}..{} ({})",
            self.pos,
            self.run_end,
            if self.run_is_data { "data" } else { "hole" }
        );
        Ok(())
    }
}

impl Iterator for SparseChunks<'_> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.file_size {
            return None;
        }

        if self.pos >= self.run_end {
            if let Err(e) = self.next_run() {
                self.pos = self.file_size;
                return Some(Err(e));
            }
        }

        let boundary = (self.pos / self.chunk_size + 1) * self.chunk_size;
        let end = boundary.min(self.run_end);
        let chunk = Chunk {
            offset: self.pos,
            size: end - self.pos,
            is_data: self.run_is_data,
        };
        self.pos = end;
        Some(Ok(chunk))
    }
}

/// `lseek` wrapper; `Ok(None)` when there is no further data (ENXIO)
fn seek(file: &File, offset: u64, whence: libc::c_int) -> Result<Option<u64>> {
    let ret = unsafe { libc::lseek(file.as_raw_fd(), offset as libc::off_t, whence) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENXIO) {
            return Ok(None);
        }
        return Err(CloudImagesError::IoError(err));
    }
    Ok(Some(ret as u64))
}

/// Read exactly the bytes covered by a chunk
pub fn read_chunk(file: &File, chunk: &Chunk) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; chunk.size as usize];
    file.read_exact_at(&mut buf, chunk.offset)?;
    Ok(buf)
}

/// Copy the data runs of `src` into `dst` starting at `dst_offset`.
///
/// Holes are skipped, so `dst` keeps whatever it had there (zeroes for a
/// freshly allocated sparse file). Returns the number of data bytes copied.
pub fn sparse_copy(src: &Path, dst: &File, dst_offset: u64) -> Result<u64> {
    let file = File::open(src)?;
    let mut copied = 0u64;

    for chunk in SparseChunks::new(&file, CHUNK_SIZE)?.data() {
        let chunk = chunk?;
        let buf = read_chunk(&file, &chunk)?;
        dst.write_all_at(&buf, dst_offset + chunk.offset)?;
        copied += chunk.size;
    }

    debug!(
        "Copied {} data bytes from {} at offset {}",
        copied,
        src.display(),
        dst_offset
    );
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MIB: u64 = 1024 * 1024;

    fn sparse_fixture() -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(10 * MIB).unwrap();
        file.as_file().write_all_at(b"boot sector", 0).unwrap();
        file.as_file().write_all_at(&vec![0xab; 5 * MIB as usize], 3 * MIB).unwrap();
        file.as_file().write_all_at(b"tail", 10 * MIB - 4).unwrap();
        file
    }

    #[test]
    fn test_chunks_cover_file_in_order() {
        // Arrange
        let fixture = sparse_fixture();

        // Act
        let chunks: Vec<Chunk> = SparseChunks::new(fixture.as_file(), CHUNK_SIZE)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        // Assert
        let mut expected_offset = 0;
        for chunk in &chunks {
            assert_eq!(chunk.offset, expected_offset);
            assert!(chunk.size > 0 && chunk.size <= CHUNK_SIZE);
            assert_eq!(
                chunk.offset / CHUNK_SIZE,
                chunk.end_inclusive() / CHUNK_SIZE,
                "chunk crosses an alignment boundary: {:?}",
                chunk
            );
            expected_offset += chunk.size;
        }
        assert_eq!(expected_offset, 10 * MIB);
    }

    #[test]
    fn test_data_chunks_reconstruct_contents() {
        let fixture = sparse_fixture();
        let original = std::fs::read(fixture.path()).unwrap();

        let mut rebuilt = vec![0u8; original.len()];
        for chunk in SparseChunks::new(fixture.as_file(), CHUNK_SIZE).unwrap().data() {
            let chunk = chunk.unwrap();
            assert!(chunk.is_data);
            let bytes = read_chunk(fixture.as_file(), &chunk).unwrap();
            assert_eq!(bytes.len() as u64, chunk.size);
            rebuilt[chunk.offset as usize..(chunk.offset + chunk.size) as usize]
                .copy_from_slice(&bytes);
        }

        assert_eq!(rebuilt, original);
    }

    #[test]
    fn test_small_chunk_size_splits_runs() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![1u8; 10_000]).unwrap();
        file.flush().unwrap();

        let chunks: Vec<Chunk> = SparseChunks::new(file.as_file(), 4096)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        let sizes: Vec<u64> = chunks.iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![4096, 4096, 1808]);
        assert!(chunks.iter().all(|c| c.is_data));
    }

    #[test]
    fn test_empty_file_yields_nothing() {
        let file = NamedTempFile::new().unwrap();
        let mut chunks = SparseChunks::new(file.as_file(), CHUNK_SIZE).unwrap();
        assert!(chunks.next().is_none());
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        let file = NamedTempFile::new().unwrap();
        assert!(SparseChunks::new(file.as_file(), 3000).is_err());
    }

    #[test]
    fn test_sparse_copy_places_data_at_offset() {
        let fixture = sparse_fixture();
        let target = NamedTempFile::new().unwrap();
        target.as_file().set_len(12 * MIB).unwrap();

        sparse_copy(fixture.path(), target.as_file(), MIB).unwrap();

        let mut head = [0u8; 11];
        target.as_file().read_exact_at(&mut head, MIB).unwrap();
        assert_eq!(&head, b"boot sector");
        let mut tail = [0u8; 4];
        target.as_file().read_exact_at(&mut tail, 11 * MIB - 4).unwrap();
        assert_eq!(&tail, b"tail");
    }
}
