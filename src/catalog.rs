//! Base-image catalogs: page fingerprint indexes over the base disk and the
//! base memory snapshot.
//!
//! # Metadata file format
//! Repeated fixed-width records, big-endian: `u64 offset, u32 length,
//! [u8; 32] sha256`.  No header, no footer, no length prefix; readers
//! terminate at EOF.  Duplicate fingerprints collapse to the first
//! occurrence at load time.
//!
//! # Builders
//! The metadata is produced offline, once per base image:
//! - disk: a 4 KiB window slid over the image at 512-byte stride, recording
//!   each distinct page hash, plus a whole-image SHA-256 for integrity;
//! - memory: every aligned 4 KiB of the payload (the final page may be
//!   short and is hashed over its actual range).

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::delta::PAGE_SIZE;

/// Stride of the sliding window used for base-disk hashing.
pub const DISK_HASH_STRIDE: usize = 512;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("truncated metadata record (stream ended mid-record)")]
    TruncatedRecord,
    #[error("base image is smaller than one page ({size} bytes)")]
    ImageTooSmall { size: u64 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── BaseHashIndex ────────────────────────────────────────────────────────────

/// In-memory fingerprint index over one base image.
///
/// Lives for the full hand-off session; shared read-only across stages.
#[derive(Debug, Default)]
pub struct BaseHashIndex {
    /// fingerprint → (offset, length).  Unique keys; first occurrence wins.
    by_hash: HashMap<[u8; 32], (u64, u32)>,
    /// offset → fingerprint for records at 4 KiB-aligned offsets (full
    /// pages, plus the short memory tail).  Backs the diff stage's
    /// unchanged-page fast path.
    aligned: HashMap<u64, [u8; 32]>,
}

impl BaseHashIndex {
    /// Stream metadata records until EOF.
    pub fn load<R: Read>(mut r: R) -> Result<Self, CatalogError> {
        let mut index = BaseHashIndex::default();
        loop {
            let offset = match r.read_u64::<BigEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let length = read_rest(&mut r, |r| r.read_u32::<BigEndian>())?;
            let mut fp = [0u8; 32];
            read_rest(&mut r, |r| r.read_exact(&mut fp))?;

            index.by_hash.entry(fp).or_insert((offset, length));
            if offset % PAGE_SIZE as u64 == 0 {
                index.aligned.entry(offset).or_insert(fp);
            }
        }
        Ok(index)
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        Self::load(BufReader::new(File::open(path)?))
    }

    /// O(1) lookup by page fingerprint.
    #[inline]
    pub fn lookup(&self, fp: &[u8; 32]) -> Option<(u64, u32)> {
        self.by_hash.get(fp).copied()
    }

    /// Fingerprint of the aligned full page at `offset`, if recorded.
    #[inline]
    pub fn aligned_hash(&self, offset: u64) -> Option<&[u8; 32]> {
        self.aligned.get(&offset)
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

/// Map a mid-record EOF to `TruncatedRecord`.
fn read_rest<R, T>(r: &mut R, f: impl FnOnce(&mut R) -> io::Result<T>) -> Result<T, CatalogError> {
    f(r).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CatalogError::TruncatedRecord
        } else {
            CatalogError::Io(e)
        }
    })
}

fn write_record<W: Write>(w: &mut W, offset: u64, length: u32, fp: &[u8; 32]) -> io::Result<()> {
    w.write_u64::<BigEndian>(offset)?;
    w.write_u32::<BigEndian>(length)?;
    w.write_all(fp)
}

// ── Builders ─────────────────────────────────────────────────────────────────

/// Hash a base disk image into its metadata file.
///
/// Slides a 4 KiB window at [`DISK_HASH_STRIDE`] over the image and records
/// each distinct page hash once, at its first offset.  Records are written
/// in offset order.  Returns the whole-image SHA-256.
pub fn build_disk_meta<P: AsRef<Path>, Q: AsRef<Path>>(
    disk_path: P,
    meta_path: Q,
) -> Result<[u8; 32], CatalogError> {
    let mut disk = BufReader::new(File::open(&disk_path)?);

    let mut window = vec![0u8; PAGE_SIZE];
    let got = fill(&mut disk, &mut window)?;
    if got < PAGE_SIZE {
        return Err(CatalogError::ImageTooSmall { size: got as u64 });
    }

    let mut whole = Sha256::new();
    whole.update(&window);

    let mut seen: HashMap<[u8; 32], u64> = HashMap::new();
    let mut offset = 0u64;
    let mut stride_buf = [0u8; DISK_HASH_STRIDE];
    loop {
        let fp: [u8; 32] = Sha256::digest(&window).into();
        seen.entry(fp).or_insert(offset);

        let n = fill(&mut disk, &mut stride_buf)?;
        if n < DISK_HASH_STRIDE {
            break; // tail shorter than one stride ends the slide
        }
        whole.update(&stride_buf);
        window.copy_within(DISK_HASH_STRIDE.., 0);
        window[PAGE_SIZE - DISK_HASH_STRIDE..].copy_from_slice(&stride_buf);
        offset += DISK_HASH_STRIDE as u64;
    }

    let mut records: Vec<(u64, [u8; 32])> = seen.into_iter().map(|(fp, off)| (off, fp)).collect();
    records.sort_by_key(|(off, _)| *off);

    let mut out = BufWriter::new(File::create(&meta_path)?);
    for (off, fp) in &records {
        write_record(&mut out, *off, PAGE_SIZE as u32, fp)?;
    }
    out.flush()?;

    tracing::debug!(
        records = records.len(),
        disk = %disk_path.as_ref().display(),
        "base disk metadata written"
    );
    Ok(whole.finalize().into())
}

/// Hash a base memory payload into its metadata file.
///
/// Every aligned 4 KiB page is hashed; the final page may be short and is
/// hashed over its actual range.  Returns the whole-payload SHA-256.
pub fn build_memory_meta<P: AsRef<Path>, Q: AsRef<Path>>(
    mem_path: P,
    meta_path: Q,
) -> Result<[u8; 32], CatalogError> {
    let mut mem = BufReader::new(File::open(&mem_path)?);
    let mut out = BufWriter::new(File::create(&meta_path)?);

    let mut whole = Sha256::new();
    let mut page = vec![0u8; PAGE_SIZE];
    let mut offset = 0u64;
    let mut records = 0usize;
    loop {
        let n = fill(&mut mem, &mut page)?;
        if n == 0 {
            break;
        }
        whole.update(&page[..n]);
        let fp: [u8; 32] = Sha256::digest(&page[..n]).into();
        write_record(&mut out, offset, n as u32, &fp)?;
        records += 1;
        offset += n as u64;
        if n < PAGE_SIZE {
            break;
        }
    }
    out.flush()?;

    tracing::debug!(
        records,
        memory = %mem_path.as_ref().display(),
        "base memory metadata written"
    );
    Ok(whole.finalize().into())
}

/// SHA-256 of an entire file, streamed.
pub fn whole_file_sha256<P: AsRef<Path>>(path: P) -> io::Result<[u8; 32]> {
    let mut f = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Read until `buf` is full or EOF; returns bytes read.
fn fill<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn disk_meta_roundtrip() {
        let dir = tempdir().unwrap();
        let disk = dir.path().join("base.raw");
        let meta = dir.path().join("base.raw-meta");

        // Two distinct pages followed by a repeat of the first.
        let mut image = vec![0x11u8; PAGE_SIZE];
        image.extend(vec![0x22u8; PAGE_SIZE]);
        image.extend(vec![0x11u8; PAGE_SIZE]);
        std::fs::write(&disk, &image).unwrap();

        let whole = build_disk_meta(&disk, &meta).unwrap();
        assert_eq!(whole, <[u8; 32]>::from(Sha256::digest(&image)));

        let index = BaseHashIndex::load_file(&meta).unwrap();
        let fp: [u8; 32] = Sha256::digest(&vec![0x11u8; PAGE_SIZE]).into();
        // Duplicate page collapsed to its first offset.
        assert_eq!(index.lookup(&fp), Some((0, PAGE_SIZE as u32)));
        assert_eq!(index.aligned_hash(0), Some(&fp));
    }

    #[test]
    fn memory_meta_hashes_short_tail() {
        let dir = tempdir().unwrap();
        let mem = dir.path().join("base.mem");
        let meta = dir.path().join("base.mem-meta");

        let mut payload = vec![0x33u8; PAGE_SIZE];
        payload.extend(vec![0x44u8; 1024]);
        std::fs::write(&mem, &payload).unwrap();

        build_memory_meta(&mem, &meta).unwrap();
        let index = BaseHashIndex::load_file(&meta).unwrap();

        let tail_fp: [u8; 32] = Sha256::digest(&vec![0x44u8; 1024]).into();
        assert_eq!(index.lookup(&tail_fp), Some((PAGE_SIZE as u64, 1024)));
        // The tail is visible to the unchanged-page fast path too.
        assert_eq!(index.aligned_hash(PAGE_SIZE as u64), Some(&tail_fp));
    }

    #[test]
    fn truncated_meta_is_rejected() {
        let mut buf = Vec::new();
        write_record(&mut buf, 0, PAGE_SIZE as u32, &[5u8; 32]).unwrap();
        buf.truncate(buf.len() - 7);
        assert!(matches!(
            BaseHashIndex::load(&buf[..]),
            Err(CatalogError::TruncatedRecord)
        ));
    }

    #[test]
    fn tiny_base_image_rejected() {
        let dir = tempdir().unwrap();
        let disk = dir.path().join("tiny.raw");
        std::fs::write(&disk, b"not a page").unwrap();
        assert!(matches!(
            build_disk_meta(&disk, dir.path().join("tiny-meta")),
            Err(CatalogError::ImageTooSmall { .. })
        ));
    }
}
