//! Reconstruction: the inverse of the overlay pipeline.
//!
//! A single thread walks the manifest's blob sequence over the concatenated
//! overlay stream, decompresses each blob with the mode recorded for it,
//! decodes the delta records in order, and resolves every reference against
//! the base image mmaps, the all-zero page, and the table of pages already
//! materialized in this run.  Each recovered page is written at its offset
//! into the domain's output file and then becomes available for later
//! `SELF` items — both domains share one table, so cross-domain
//! self-references resolve naturally.
//!
//! On any failure the partial output files are deleted before the error is
//! returned; a half-recovered VM image must never be bootable by accident.
//!
//! # Side channel
//! Every recovered page emits a `"<1|2>:<chunk_id>"` line (1 = disk,
//! 2 = memory) so a FUSE layer can wake readers waiting on that chunk; the
//! stream ends with the literal `end_of_pipe`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use memmap2::Mmap;
use thiserror::Error;

use crate::compress::{decompress_blob, CodecError};
use crate::delta::{DeltaError, DeltaItem, DeltaRef, Domain};
use crate::diff::{apply_patch, DiffError};
use crate::manifest::OverlayManifest;

/// Side-channel domain codes (not the wire domain codes).
pub const PIPE_INDEX_DISK: u8 = 1;
pub const PIPE_INDEX_MEMORY: u8 = 2;

/// Side-channel terminator.
pub const END_OF_PIPE: &str = "end_of_pipe";

#[derive(Error, Debug)]
pub enum RecoverError {
    #[error("overlay stream ended before blob {seq} ({got}/{want} bytes)")]
    TruncatedStream { seq: usize, got: usize, want: usize },
    #[error("dangling self-reference: index {index} not materialized yet")]
    MissingSelfRef { index: u64 },
    #[error("recovered page at {domain} offset {offset} is {got} bytes, expected {expected}")]
    SizeMismatch { domain: &'static str, offset: u64, got: usize, expected: usize },
    #[error("{domain} base reference {offset}..{end} is outside the base image ({len} bytes)")]
    BaseMismatch { domain: &'static str, offset: u64, end: u64, len: u64 },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Delta(#[from] DeltaError),
    #[error("patch apply failed at offset {offset}: {source}")]
    Patch { offset: u64, source: DiffError },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoverReport {
    pub items:        u64,
    pub disk_items:   u64,
    pub memory_items: u64,
    pub blobs:        usize,
}

/// index → materialized page bytes for this reconstruction run.
///
/// Grows with the overlay (it is dropped when the run ends); keeping every
/// page is what makes arbitrarily-late self-references resolvable.
#[derive(Debug, Default)]
pub struct SelfReferenceTable {
    map: HashMap<u64, Vec<u8>>,
}

impl SelfReferenceTable {
    pub fn get(&self, index: u64) -> Option<&[u8]> {
        self.map.get(&index).map(Vec::as_slice)
    }

    pub fn insert(&mut self, index: u64, page: Vec<u8>) {
        self.map.insert(index, page);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Reconstruct the modified VM from `base + overlay`.
///
/// `overlay` is the concatenated blob stream described by `manifest`;
/// `notify` receives the side-channel chunk events when present.
pub fn reconstruct(
    base_disk: &Path,
    base_mem: &Path,
    manifest: &OverlayManifest,
    overlay: &mut dyn Read,
    out_disk: &Path,
    out_mem: &Path,
    mut notify: Option<&mut dyn Write>,
) -> Result<RecoverReport, RecoverError> {
    let started = Instant::now();
    let mut outputs = OutputFiles::create(base_disk, base_mem, out_disk, out_mem, manifest)?;

    let result = run_reconstruction(base_disk, base_mem, manifest, overlay, &mut outputs, &mut notify);

    match result {
        Ok(report) => {
            if let Some(pipe) = notify.as_deref_mut() {
                writeln!(pipe, "{END_OF_PIPE}")?;
            }
            outputs.keep()?;
            tracing::info!(
                items = report.items,
                blobs = report.blobs,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "reconstruction finished"
            );
            Ok(report)
        }
        Err(e) => {
            // Never leave a half-recovered image behind.
            outputs.discard();
            Err(e)
        }
    }
}

fn run_reconstruction(
    base_disk: &Path,
    base_mem: &Path,
    manifest: &OverlayManifest,
    overlay: &mut dyn Read,
    outputs: &mut OutputFiles,
    notify: &mut Option<&mut dyn Write>,
) -> Result<RecoverReport, RecoverError> {
    let disk_map = map_readonly(base_disk)?;
    let mem_map = map_readonly(base_mem)?;

    let mut table = SelfReferenceTable::default();
    let mut report = RecoverReport { blobs: manifest.blobs.len(), ..Default::default() };

    for (seq, entry) in manifest.blobs.iter().enumerate() {
        let mut compressed = vec![0u8; entry.size as usize];
        read_exact_or_truncated(overlay, &mut compressed, seq)?;
        let payload = decompress_blob(&compressed, entry.compression.algorithm)?;

        let mut cursor = &payload[..];
        while let Some(item) = DeltaItem::read_from(&mut cursor, manifest.with_hash)? {
            let page = resolve_item(&item, &disk_map, &mem_map, &table)?;
            if page.len() != item.length as usize {
                return Err(RecoverError::SizeMismatch {
                    domain: item.domain.name(),
                    offset: item.offset,
                    got: page.len(),
                    expected: item.length as usize,
                });
            }

            outputs.write_page(item.domain, item.offset, &page)?;
            table.insert(item.index(), page);

            report.items += 1;
            let pipe_index = match item.domain {
                Domain::Disk => {
                    report.disk_items += 1;
                    PIPE_INDEX_DISK
                }
                Domain::Memory => {
                    report.memory_items += 1;
                    PIPE_INDEX_MEMORY
                }
            };
            if let Some(pipe) = notify.as_deref_mut() {
                writeln!(pipe, "{}:{}", pipe_index, item.chunk_id())?;
            }
        }
    }

    Ok(report)
}

/// Materialize one item's page bytes.
fn resolve_item(
    item: &DeltaItem,
    disk_map: &Mmap,
    mem_map: &Mmap,
    table: &SelfReferenceTable,
) -> Result<Vec<u8>, RecoverError> {
    let len = item.length as usize;
    match &item.reference {
        DeltaRef::Raw(data) => Ok(data.clone()),
        DeltaRef::Zero => Ok(vec![0u8; len]),
        DeltaRef::BaseDisk(offset) => base_slice(disk_map, "disk", *offset, len).map(<[u8]>::to_vec),
        DeltaRef::BaseMem(offset) => base_slice(mem_map, "memory", *offset, len).map(<[u8]>::to_vec),
        DeltaRef::SelfRef(index) => table
            .get(*index)
            .map(<[u8]>::to_vec)
            .ok_or(RecoverError::MissingSelfRef { index: *index }),
        DeltaRef::Xdelta(patch) => {
            let (map, name) = match item.domain {
                Domain::Disk => (disk_map, "disk"),
                Domain::Memory => (mem_map, "memory"),
            };
            let base = base_slice(map, name, item.offset, len)?;
            apply_patch(base, patch)
                .map_err(|source| RecoverError::Patch { offset: item.offset, source })
        }
    }
}

fn base_slice<'a>(
    map: &'a Mmap,
    domain: &'static str,
    offset: u64,
    len: usize,
) -> Result<&'a [u8], RecoverError> {
    let start = offset as usize;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= map.len())
        .ok_or(RecoverError::BaseMismatch {
            domain,
            offset,
            end: offset.saturating_add(len as u64),
            len: map.len() as u64,
        })?;
    Ok(&map[start..end])
}

fn map_readonly(path: &Path) -> Result<Mmap, RecoverError> {
    let file = File::open(path)?;
    Ok(unsafe { Mmap::map(&file)? })
}

fn read_exact_or_truncated(
    r: &mut dyn Read,
    buf: &mut [u8],
    seq: usize,
) -> Result<(), RecoverError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(RecoverError::TruncatedStream { seq, got: filled, want: buf.len() });
        }
        filled += n;
    }
    Ok(())
}

// ── Output files ─────────────────────────────────────────────────────────────

/// The two recovered images, deleted as a pair if reconstruction fails.
struct OutputFiles {
    disk:      File,
    memory:    File,
    disk_path: PathBuf,
    mem_path:  PathBuf,
    committed: bool,
}

impl OutputFiles {
    fn create(
        base_disk: &Path,
        base_mem: &Path,
        out_disk: &Path,
        out_mem: &Path,
        manifest: &OverlayManifest,
    ) -> Result<Self, RecoverError> {
        // Pages absent from the overlay were unchanged, so the outputs start
        // as copies of the base images, resized to the declared lengths
        // (regions past the base end read back as zeros).
        std::fs::copy(base_disk, out_disk)?;
        std::fs::copy(base_mem, out_mem)?;
        let disk = File::options().write(true).open(out_disk)?;
        let memory = File::options().write(true).open(out_mem)?;
        disk.set_len(manifest.disk_size)?;
        memory.set_len(manifest.memory_size)?;
        Ok(Self {
            disk,
            memory,
            disk_path: out_disk.to_owned(),
            mem_path: out_mem.to_owned(),
            committed: false,
        })
    }

    fn write_page(&mut self, domain: Domain, offset: u64, page: &[u8]) -> io::Result<()> {
        let file = match domain {
            Domain::Disk => &mut self.disk,
            Domain::Memory => &mut self.memory,
        };
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(page)
    }

    fn keep(&mut self) -> io::Result<()> {
        self.disk.flush()?;
        self.memory.flush()?;
        self.committed = true;
        Ok(())
    }

    fn discard(&mut self) {
        let _ = std::fs::remove_file(&self.disk_path);
        let _ = std::fs::remove_file(&self.mem_path);
        self.committed = true; // nothing left to clean up
    }
}

impl Drop for OutputFiles {
    fn drop(&mut self) {
        if !self.committed {
            self.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{compress_blob, BlobBuilder, CompressAlgorithm, CompressionMode};
    use crate::delta::{page_index, PAGE_SIZE};
    use tempfile::tempdir;

    /// Pack items into a single-blob overlay plus its manifest.
    fn overlay_of(items: &[DeltaItem], disk_size: u64, mem_size: u64) -> (Vec<u8>, OverlayManifest) {
        let mut builder = BlobBuilder::new(usize::MAX, false);
        for item in items {
            builder.push(item).unwrap();
        }
        let mode = CompressionMode::new(CompressAlgorithm::Gzip, 6);
        let mut manifest = OverlayManifest::new(mode, false, [0u8; 32], [0u8; 32]);
        manifest.disk_size = disk_size;
        manifest.memory_size = mem_size;
        let mut stream = Vec::new();
        if let Some(pending) = builder.take() {
            let blob = compress_blob(pending, mode).unwrap();
            stream.extend_from_slice(&blob.data);
            manifest.push_blob(&blob);
        }
        (stream, manifest)
    }

    fn item(domain: Domain, offset: u64, reference: DeltaRef) -> DeltaItem {
        let length = match &reference {
            DeltaRef::Raw(d) => d.len() as u16,
            _ => PAGE_SIZE as u16,
        };
        DeltaItem { domain, offset, length, fingerprint: None, reference }
    }

    #[test]
    fn resolves_all_reference_kinds() {
        let dir = tempdir().unwrap();
        let base_disk_data = vec![0xD0u8; 2 * PAGE_SIZE];
        let base_mem_data = vec![0xA0u8; 2 * PAGE_SIZE];
        let base_disk = dir.path().join("base.raw");
        let base_mem = dir.path().join("base.mem");
        std::fs::write(&base_disk, &base_disk_data).unwrap();
        std::fs::write(&base_mem, &base_mem_data).unwrap();

        let novel = vec![0x42u8; PAGE_SIZE];
        let items = vec![
            item(Domain::Disk, 0, DeltaRef::Raw(novel.clone())),
            item(Domain::Disk, PAGE_SIZE as u64, DeltaRef::Zero),
            item(Domain::Memory, 0, DeltaRef::BaseDisk(PAGE_SIZE as u64)),
            item(Domain::Memory, PAGE_SIZE as u64, DeltaRef::SelfRef(page_index(Domain::Disk, 0))),
        ];
        let (stream, manifest) =
            overlay_of(&items, 2 * PAGE_SIZE as u64, 2 * PAGE_SIZE as u64);

        let out_disk = dir.path().join("out.raw");
        let out_mem = dir.path().join("out.mem");
        let mut pipe = Vec::new();
        let report = reconstruct(
            &base_disk,
            &base_mem,
            &manifest,
            &mut &stream[..],
            &out_disk,
            &out_mem,
            Some(&mut pipe),
        )
        .unwrap();

        assert_eq!(report.items, 4);
        assert_eq!(report.disk_items, 2);

        let disk = std::fs::read(&out_disk).unwrap();
        assert_eq!(&disk[..PAGE_SIZE], &novel[..]);
        assert!(disk[PAGE_SIZE..].iter().all(|&b| b == 0));

        let mem = std::fs::read(&out_mem).unwrap();
        assert_eq!(&mem[..PAGE_SIZE], &base_disk_data[PAGE_SIZE..]); // cross-domain base hit
        assert_eq!(&mem[PAGE_SIZE..], &novel[..]); // cross-domain self-reference

        let pipe = String::from_utf8(pipe).unwrap();
        let lines: Vec<&str> = pipe.lines().collect();
        assert_eq!(lines, vec!["1:0", "1:1", "2:0", "2:1", END_OF_PIPE]);
    }

    #[test]
    fn dangling_self_ref_deletes_outputs() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        std::fs::write(&base, vec![0u8; PAGE_SIZE]).unwrap();

        let items = vec![item(Domain::Disk, 0, DeltaRef::SelfRef(12345))];
        let (stream, manifest) = overlay_of(&items, PAGE_SIZE as u64, 0);

        let out_disk = dir.path().join("out.raw");
        let out_mem = dir.path().join("out.mem");
        let err = reconstruct(&base, &base, &manifest, &mut &stream[..], &out_disk, &out_mem, None)
            .unwrap_err();
        assert!(matches!(err, RecoverError::MissingSelfRef { index: 12345 }));
        assert!(!out_disk.exists());
        assert!(!out_mem.exists());
    }

    #[test]
    fn base_reference_outside_image_is_rejected() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        std::fs::write(&base, vec![0u8; PAGE_SIZE]).unwrap();

        let items = vec![item(Domain::Disk, 0, DeltaRef::BaseDisk(64 * PAGE_SIZE as u64))];
        let (stream, manifest) = overlay_of(&items, PAGE_SIZE as u64, 0);

        let err = reconstruct(
            &base,
            &base,
            &manifest,
            &mut &stream[..],
            &dir.path().join("out.raw"),
            &dir.path().join("out.mem"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RecoverError::BaseMismatch { .. }));
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        std::fs::write(&base, vec![0u8; PAGE_SIZE]).unwrap();

        let items = vec![item(Domain::Disk, 0, DeltaRef::Raw(vec![1u8; PAGE_SIZE]))];
        let (stream, manifest) = overlay_of(&items, PAGE_SIZE as u64, 0);

        let err = reconstruct(
            &base,
            &base,
            &manifest,
            &mut &stream[..stream.len() / 2],
            &dir.path().join("out.raw"),
            &dir.path().join("out.mem"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RecoverError::TruncatedStream { .. }));
    }
}
