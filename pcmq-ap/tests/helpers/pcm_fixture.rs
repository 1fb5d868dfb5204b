//! Temporary PCM files

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Raw PCM file on disk plus the bytes it contains
pub struct PcmFixture {
    file: NamedTempFile,
    bytes: Vec<u8>,
}

impl PcmFixture {
    /// File of `len` bytes
    ///
    /// The pattern has period 251, so it never lines up with power-of-two
    /// buffer sizes and a dropped or repeated buffer changes the byte stream.
    pub fn with_len(len: usize) -> Self {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Self::with_bytes(bytes)
    }

    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        let mut file = NamedTempFile::new().expect("Failed to create temp PCM file");
        file.write_all(&bytes).expect("Failed to write PCM data");
        file.flush().expect("Failed to flush PCM data");
        Self { file, bytes }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}
