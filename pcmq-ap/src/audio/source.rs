//! Sequential PCM source reader
//!
//! Reads a headerless PCM file front to back into pooled buffers. The cursor
//! only moves forward; a new session opens a new reader. The file handle is
//! held for the whole session and closed when the reader is dropped, which
//! covers every exit path (stop, end of stream, failure).

use crate::error::{Error, Result};
use crate::playback::buffer_pool::AudioBuffer;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Sequential reader over a raw PCM stream
pub struct PcmSource<R = File> {
    inner: R,
    path: PathBuf,
    cursor: u64,
    end_of_stream: bool,
    len_hint: Option<u64>,
}

impl<R> std::fmt::Debug for PcmSource<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcmSource")
            .field("path", &self.path)
            .field("cursor", &self.cursor)
            .field("end_of_stream", &self.end_of_stream)
            .field("len_hint", &self.len_hint)
            .finish()
    }
}

impl PcmSource<File> {
    /// Open a PCM file for reading
    ///
    /// # Errors
    /// `NotFound` if the path does not exist or cannot be opened for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::NotFound {
            path: path.to_path_buf(),
            source,
        })?;

        let metadata = file.metadata().map_err(|source| Error::NotFound {
            path: path.to_path_buf(),
            source,
        })?;
        if metadata.is_dir() {
            return Err(Error::NotFound {
                path: path.to_path_buf(),
                source: std::io::Error::new(ErrorKind::InvalidInput, "path is a directory"),
            });
        }

        debug!(
            "Opened PCM source {} ({} bytes)",
            path.display(),
            metadata.len()
        );

        Ok(Self {
            inner: file,
            path: path.to_path_buf(),
            cursor: 0,
            end_of_stream: false,
            len_hint: Some(metadata.len()),
        })
    }
}

impl<R: Read> PcmSource<R> {
    /// Wrap an arbitrary byte stream (length unknown)
    pub fn from_reader(inner: R, label: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            path: label.into(),
            cursor: 0,
            end_of_stream: false,
            len_hint: None,
        }
    }

    /// Fill `buffer` from the current cursor
    ///
    /// Reads until the buffer is full or the stream ends, so a result smaller
    /// than the buffer capacity only happens at end of stream. The buffer's
    /// valid length is set to the returned byte count.
    ///
    /// # Errors
    /// `Io` on any read failure other than `Interrupted`. Not retried.
    pub fn fill(&mut self, buffer: &mut AudioBuffer) -> Result<usize> {
        let storage = buffer.storage_mut();
        let mut filled = 0;

        while filled < storage.len() && !self.end_of_stream {
            match self.inner.read(&mut storage[filled..]) {
                Ok(0) => {
                    self.end_of_stream = true;
                    debug!(
                        "End of stream for {} at byte {}",
                        self.path.display(),
                        self.cursor + filled as u64
                    );
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => {
                    // Bytes already read are discarded with the session
                    self.cursor += filled as u64;
                    buffer.set_valid_bytes(0);
                    return Err(Error::Io {
                        offset: self.cursor,
                        source,
                    });
                }
            }
        }

        self.cursor += filled as u64;
        buffer.set_valid_bytes(filled);
        trace!(
            "Filled buffer {} with {} bytes (cursor={})",
            buffer.id(),
            filled,
            self.cursor
        );
        Ok(filled)
    }

    /// True once a read returned 0 bytes
    pub fn at_end(&self) -> bool {
        self.end_of_stream
    }

    /// Byte offset of the next read
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Total stream length when known (regular files)
    pub fn len_hint(&self) -> Option<u64> {
        self.len_hint
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::buffer_pool::BufferPool;
    use std::io::{Cursor, Write};

    /// Reader that hands out at most `chunk` bytes per call
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Reader that fails after `ok_bytes`
    struct Failing {
        ok_bytes: usize,
        served: usize,
    }

    impl Read for Failing {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.served >= self.ok_bytes {
                return Err(std::io::Error::new(ErrorKind::Other, "media removed"));
            }
            let n = buf.len().min(self.ok_bytes - self.served);
            buf[..n].fill(7);
            self.served += n;
            Ok(n)
        }
    }

    #[test]
    fn test_fill_full_then_partial_then_end() {
        let pool = BufferPool::new(1, 4).unwrap();
        let mut source = PcmSource::from_reader(Cursor::new(vec![1u8, 2, 3, 4, 5, 6]), "mem");
        let mut buffer = pool.acquire_free().unwrap();

        assert_eq!(source.fill(&mut buffer).unwrap(), 4);
        assert_eq!(buffer.valid_data(), &[1, 2, 3, 4]);
        assert!(!source.at_end());

        assert_eq!(source.fill(&mut buffer).unwrap(), 2);
        assert_eq!(buffer.valid_data(), &[5, 6]);
        assert!(source.at_end());
        assert_eq!(source.cursor(), 6);

        assert_eq!(source.fill(&mut buffer).unwrap(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_exact_multiple_needs_extra_read_for_end() {
        let pool = BufferPool::new(1, 4).unwrap();
        let mut source = PcmSource::from_reader(Cursor::new(vec![0u8; 8]), "mem");
        let mut buffer = pool.acquire_free().unwrap();

        assert_eq!(source.fill(&mut buffer).unwrap(), 4);
        assert_eq!(source.fill(&mut buffer).unwrap(), 4);
        // Not known to be at end until a read returns 0
        assert!(!source.at_end());
        assert_eq!(source.fill(&mut buffer).unwrap(), 0);
        assert!(source.at_end());
    }

    #[test]
    fn test_short_reads_are_accumulated() {
        let pool = BufferPool::new(1, 10).unwrap();
        let data: Vec<u8> = (0..25).collect();
        let mut source = PcmSource::from_reader(
            Trickle {
                data: data.clone(),
                pos: 0,
                chunk: 3,
            },
            "trickle",
        );
        let mut buffer = pool.acquire_free().unwrap();

        assert_eq!(source.fill(&mut buffer).unwrap(), 10);
        assert_eq!(buffer.valid_data(), &data[..10]);
        assert!(!source.at_end());
    }

    #[test]
    fn test_read_error_reports_offset() {
        let pool = BufferPool::new(1, 8).unwrap();
        let mut source = PcmSource::from_reader(
            Failing {
                ok_bytes: 12,
                served: 0,
            },
            "failing",
        );
        let mut buffer = pool.acquire_free().unwrap();

        assert_eq!(source.fill(&mut buffer).unwrap(), 8);
        match source.fill(&mut buffer) {
            Err(Error::Io { offset, .. }) => assert_eq!(offset, 12),
            other => panic!("Expected Io error, got {:?}", other),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_open_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = PcmSource::open(dir.path().join("missing.pcm"));
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_open_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            PcmSource::open(dir.path()),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_open_reports_length() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 100]).unwrap();
        file.flush().unwrap();

        let source = PcmSource::open(file.path()).unwrap();
        assert_eq!(source.len_hint(), Some(100));
        assert_eq!(source.cursor(), 0);
        assert_eq!(source.path(), file.path());
    }
}
