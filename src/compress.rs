//! Compression codecs and blob packaging.
//!
//! Serialized delta records are batched into blobs of a target uncompressed
//! size (default 1 MiB) and each blob is compressed independently, so the
//! receiver can decode blobs as they arrive.  The algorithm and level are
//! hot-swappable between blobs: every blob records the mode that produced
//! it in the overlay manifest, never inline in the stream.
//!
//! # Levels
//! Levels run 1–9 for BZIP2 and GZIP.  LZMA accepts the level for interface
//! parity but `lzma-rs` encodes at a single preset; the level is recorded in
//! the manifest regardless so both endpoints log the same mode.

use std::collections::BTreeSet;
use std::io::{self, Read};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::delta::{DeltaError, DeltaItem, Domain};

/// Default uncompressed byte threshold per blob.
pub const DEFAULT_BLOB_SIZE: usize = 1024 * 1024;

// ── Algorithm selection ──────────────────────────────────────────────────────

/// Compression algorithm for overlay blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressAlgorithm {
    Lzma,
    Bzip2,
    Gzip,
}

impl CompressAlgorithm {
    /// Human-readable name (also the manifest encoding).
    pub fn name(self) -> &'static str {
        match self {
            CompressAlgorithm::Lzma  => "lzma",
            CompressAlgorithm::Bzip2 => "bzip2",
            CompressAlgorithm::Gzip  => "gzip",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "lzma" | "xz" => Some(CompressAlgorithm::Lzma),
            "bzip2"       => Some(CompressAlgorithm::Bzip2),
            "gzip" | "gz" => Some(CompressAlgorithm::Gzip),
            _             => None,
        }
    }

    /// Conventional file extension for blob names in the manifest.
    pub fn extension(self) -> &'static str {
        match self {
            CompressAlgorithm::Lzma  => "xz",
            CompressAlgorithm::Bzip2 => "bz2",
            CompressAlgorithm::Gzip  => "gz",
        }
    }

    fn to_code(self) -> u8 {
        match self {
            CompressAlgorithm::Lzma  => 1,
            CompressAlgorithm::Bzip2 => 2,
            CompressAlgorithm::Gzip  => 3,
        }
    }

    fn from_code(v: u8) -> Option<Self> {
        match v {
            1 => Some(CompressAlgorithm::Lzma),
            2 => Some(CompressAlgorithm::Bzip2),
            3 => Some(CompressAlgorithm::Gzip),
            _ => None,
        }
    }
}

/// One point in the compression mode space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionMode {
    #[serde(rename = "type")]
    pub algorithm: CompressAlgorithm,
    pub level:     u32,
}

impl Default for CompressionMode {
    fn default() -> Self {
        Self { algorithm: CompressAlgorithm::Lzma, level: 9 }
    }
}

impl CompressionMode {
    pub fn new(algorithm: CompressAlgorithm, level: u32) -> Self {
        Self { algorithm, level: level.clamp(1, 9) }
    }
}

/// Atomic holder for the current compression mode, read by compressor
/// workers at each blob boundary and written by the controller.
#[derive(Debug)]
pub struct CompressionSelector {
    packed: std::sync::atomic::AtomicU32,
}

impl CompressionSelector {
    pub fn new(mode: CompressionMode) -> Self {
        let s = Self { packed: std::sync::atomic::AtomicU32::new(0) };
        s.store(mode);
        s
    }

    pub fn store(&self, mode: CompressionMode) {
        let packed = (mode.algorithm.to_code() as u32) << 8 | mode.level.clamp(1, 9);
        self.packed.store(packed, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn load(&self) -> CompressionMode {
        let packed = self.packed.load(std::sync::atomic::Ordering::Relaxed);
        CompressionMode {
            algorithm: CompressAlgorithm::from_code((packed >> 8) as u8)
                .unwrap_or(CompressAlgorithm::Lzma),
            level: packed & 0xFF,
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait and implementations ──────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn algorithm(&self) -> CompressAlgorithm;
    fn compress(&self, data: &[u8], level: u32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn algorithm(&self) -> CompressAlgorithm { CompressAlgorithm::Lzma }
    fn compress(&self, data: &[u8], _: u32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut std::io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_decompress(&mut std::io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

pub struct Bzip2Codec;
impl Codec for Bzip2Codec {
    fn algorithm(&self) -> CompressAlgorithm { CompressAlgorithm::Bzip2 }
    fn compress(&self, data: &[u8], level: u32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        bzip2::read::BzEncoder::new(data, bzip2::Compression::new(level.clamp(1, 9)))
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        bzip2::read::BzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

pub struct GzipCodec;
impl Codec for GzipCodec {
    fn algorithm(&self) -> CompressAlgorithm { CompressAlgorithm::Gzip }
    fn compress(&self, data: &[u8], level: u32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        flate2::read::GzEncoder::new(data, flate2::Compression::new(level.clamp(1, 9)))
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

/// Resolve an algorithm to its codec.
pub fn get_codec(algorithm: CompressAlgorithm) -> Box<dyn Codec> {
    match algorithm {
        CompressAlgorithm::Lzma  => Box::new(LzmaCodec),
        CompressAlgorithm::Bzip2 => Box::new(Bzip2Codec),
        CompressAlgorithm::Gzip  => Box::new(GzipCodec),
    }
}

// ── Blob packaging ───────────────────────────────────────────────────────────

/// An uncompressed batch of serialized delta records, ready for a compressor
/// worker.  `seq` restores dedup-emit order at the sink.
#[derive(Debug)]
pub struct PendingBlob {
    pub seq:           u64,
    pub payload:       Vec<u8>,
    pub item_count:    usize,
    pub disk_chunks:   Vec<u64>,
    pub memory_chunks: Vec<u64>,
}

/// A compressed blob plus the manifest data describing it.
#[derive(Debug)]
pub struct CompressedBlob {
    pub seq:              u64,
    pub data:             Vec<u8>,
    pub uncompressed_len: usize,
    pub mode:             CompressionMode,
    pub item_count:       usize,
    pub disk_chunks:      Vec<u64>,
    pub memory_chunks:    Vec<u64>,
}

/// Accumulates serialized items up to the target blob size.
///
/// Items are appended in the exact order they arrive; the builder never
/// reorders, so the dedup stage's producer-before-consumer discipline
/// survives packaging.
pub struct BlobBuilder {
    target_size:   usize,
    with_hash:     bool,
    buf:           Vec<u8>,
    item_count:    usize,
    disk_chunks:   BTreeSet<u64>,
    memory_chunks: BTreeSet<u64>,
    next_seq:      u64,
}

impl BlobBuilder {
    pub fn new(target_size: usize, with_hash: bool) -> Self {
        Self {
            target_size: target_size.max(1),
            with_hash,
            buf: Vec::new(),
            item_count: 0,
            disk_chunks: BTreeSet::new(),
            memory_chunks: BTreeSet::new(),
            next_seq: 0,
        }
    }

    /// Append one item.  Returns a full blob when the threshold is crossed.
    pub fn push(&mut self, item: &DeltaItem) -> Result<Option<PendingBlob>, DeltaError> {
        item.write_to(&mut self.buf, self.with_hash)?;
        self.item_count += 1;
        match item.domain {
            Domain::Disk   => { self.disk_chunks.insert(item.chunk_id()); }
            Domain::Memory => { self.memory_chunks.insert(item.chunk_id()); }
        }
        if self.buf.len() >= self.target_size {
            Ok(self.take())
        } else {
            Ok(None)
        }
    }

    /// Hand off whatever has accumulated, if anything.  Called at threshold
    /// crossings and once more at shutdown for the final partial blob.
    pub fn take(&mut self) -> Option<PendingBlob> {
        if self.buf.is_empty() {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        Some(PendingBlob {
            seq,
            payload: std::mem::take(&mut self.buf),
            item_count: std::mem::take(&mut self.item_count),
            disk_chunks: std::mem::take(&mut self.disk_chunks).into_iter().collect(),
            memory_chunks: std::mem::take(&mut self.memory_chunks).into_iter().collect(),
        })
    }
}

/// Compress one pending blob with the given mode.
///
/// A failure here is fatal for the overlay; no partial blob is ever
/// committed downstream.
pub fn compress_blob(blob: PendingBlob, mode: CompressionMode) -> Result<CompressedBlob, CodecError> {
    let codec = get_codec(mode.algorithm);
    let data = codec.compress(&blob.payload, mode.level)?;
    Ok(CompressedBlob {
        seq: blob.seq,
        uncompressed_len: blob.payload.len(),
        data,
        mode,
        item_count: blob.item_count,
        disk_chunks: blob.disk_chunks,
        memory_chunks: blob.memory_chunks,
    })
}

/// Decompress a blob back to its serialized item stream.
pub fn decompress_blob(data: &[u8], algorithm: CompressAlgorithm) -> Result<Vec<u8>, CodecError> {
    get_codec(algorithm).decompress(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{DeltaRef, PAGE_SIZE};

    fn raw_item(domain: Domain, offset: u64, byte: u8) -> DeltaItem {
        DeltaItem {
            domain,
            offset,
            length: PAGE_SIZE as u16,
            fingerprint: None,
            reference: DeltaRef::Raw(vec![byte; PAGE_SIZE]),
        }
    }

    #[test]
    fn codecs_roundtrip() {
        let data: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();
        for algorithm in [CompressAlgorithm::Lzma, CompressAlgorithm::Bzip2, CompressAlgorithm::Gzip] {
            let codec = get_codec(algorithm);
            let packed = codec.compress(&data, 5).unwrap();
            assert_eq!(codec.decompress(&packed).unwrap(), data);
        }
    }

    #[test]
    fn builder_splits_at_threshold_and_tracks_chunks() {
        let mut builder = BlobBuilder::new(6000, false);

        let full = builder.push(&raw_item(Domain::Disk, 8192, b'a')).unwrap();
        assert!(full.is_none());
        let full = builder.push(&raw_item(Domain::Memory, 0, b'b')).unwrap().unwrap();
        assert_eq!(full.seq, 0);
        assert_eq!(full.item_count, 2);
        assert_eq!(full.disk_chunks, vec![2]);
        assert_eq!(full.memory_chunks, vec![0]);

        // Final partial blob flushes via take().
        builder.push(&raw_item(Domain::Disk, 0, b'c')).unwrap();
        let tail = builder.take().unwrap();
        assert_eq!(tail.seq, 1);
        assert_eq!(tail.disk_chunks, vec![0]);
        assert!(builder.take().is_none());
    }

    #[test]
    fn blob_roundtrip_preserves_item_order() {
        let items = vec![
            raw_item(Domain::Memory, 0, 1),
            raw_item(Domain::Disk, 4096, 2),
            raw_item(Domain::Memory, 4096, 3),
        ];
        let mut builder = BlobBuilder::new(usize::MAX, false);
        for item in &items {
            builder.push(item).unwrap();
        }
        let pending = builder.take().unwrap();
        let blob = compress_blob(pending, CompressionMode::new(CompressAlgorithm::Gzip, 6)).unwrap();

        let payload = decompress_blob(&blob.data, blob.mode.algorithm).unwrap();
        let back = crate::delta::read_list(&payload[..], false).unwrap();
        assert_eq!(back, items);
    }

    #[test]
    fn selector_swaps_atomically() {
        let sel = CompressionSelector::new(CompressionMode::default());
        assert_eq!(sel.load(), CompressionMode::default());
        let next = CompressionMode::new(CompressAlgorithm::Gzip, 1);
        sel.store(next);
        assert_eq!(sel.load(), next);
    }
}
