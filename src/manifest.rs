//! Overlay manifest — the small JSON document shipped alongside the blob
//! stream.
//!
//! One entry per blob, in stream order.  Each entry names the blob, its
//! on-wire size, the distinct disk and memory chunk ids it covers (for
//! receiver-side prefetch), and the compression mode that produced it —
//! the controller may hot-swap compression mid-stream, so the mode lives
//! per blob; the top-level `compression` field records the mode in effect
//! at finalize.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compress::{CompressedBlob, CompressionMode};
use crate::delta::PAGE_SIZE;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlobEntry {
    pub file:          String,
    /// Compressed size in bytes; the receiver splits the concatenated
    /// stream on these boundaries.
    pub size:          u64,
    pub disk_chunks:   Vec<u64>,
    pub memory_chunks: Vec<u64>,
    pub compression:   CompressionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverlayManifest {
    pub blobs:            Vec<BlobEntry>,
    /// Mode in effect when the stream was finalized.
    pub compression:      CompressionMode,
    pub chunk_size:       u32,
    /// Whether serialized items carry their 32-byte fingerprints.
    #[serde(default)]
    pub with_hash:        bool,
    pub base_disk_sha256: String,
    pub base_mem_sha256:  String,
    /// Recovered image sizes; the receiver pre-sizes its output files.
    pub disk_size:        u64,
    pub memory_size:      u64,
}

impl OverlayManifest {
    pub fn new(
        compression: CompressionMode,
        with_hash: bool,
        base_disk_sha256: [u8; 32],
        base_mem_sha256: [u8; 32],
    ) -> Self {
        Self {
            blobs: Vec::new(),
            compression,
            chunk_size: PAGE_SIZE as u32,
            with_hash,
            base_disk_sha256: hex::encode(base_disk_sha256),
            base_mem_sha256: hex::encode(base_mem_sha256),
            disk_size: 0,
            memory_size: 0,
        }
    }

    /// Append the entry describing one written blob.
    pub fn push_blob(&mut self, blob: &CompressedBlob) {
        self.blobs.push(BlobEntry {
            file: format!("overlay_{}.{}", blob.seq + 1, blob.mode.algorithm.extension()),
            size: blob.data.len() as u64,
            disk_chunks: blob.disk_chunks.clone(),
            memory_chunks: blob.memory_chunks.clone(),
            compression: blob.mode,
        });
    }

    pub fn total_blob_bytes(&self) -> u64 {
        self.blobs.iter().map(|b| b.size).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let f = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(f, self).map_err(io::Error::from)
    }

    pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let f = BufReader::new(File::open(path)?);
        serde_json::from_reader(f).map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressAlgorithm;

    #[test]
    fn manifest_json_roundtrip() {
        let mut m = OverlayManifest::new(CompressionMode::default(), false, [1u8; 32], [2u8; 32]);
        m.disk_size = 1 << 20;
        m.memory_size = (1 << 20) + 1024;
        m.push_blob(&CompressedBlob {
            seq: 0,
            data: vec![0u8; 812],
            uncompressed_len: 4096,
            mode: CompressionMode::new(CompressAlgorithm::Gzip, 3),
            item_count: 1,
            disk_chunks: vec![12, 44, 45],
            memory_chunks: vec![0, 1, 2, 17],
        });

        let bytes = m.to_bytes().unwrap();
        let back = OverlayManifest::from_bytes(&bytes).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.blobs[0].file, "overlay_1.gz");
        assert_eq!(back.total_blob_bytes(), 812);
        assert_eq!(back.chunk_size, 4096);
    }

    #[test]
    fn manifest_field_names_are_frozen() {
        let m = OverlayManifest::new(
            CompressionMode::new(CompressAlgorithm::Lzma, 9),
            false,
            [0u8; 32],
            [0u8; 32],
        );
        let json: serde_json::Value = serde_json::from_slice(&m.to_bytes().unwrap()).unwrap();
        assert_eq!(json["compression"]["type"], "lzma");
        assert_eq!(json["compression"]["level"], 9);
        assert!(json["base_disk_sha256"].is_string());
        assert!(json["blobs"].as_array().unwrap().is_empty());
    }
}
