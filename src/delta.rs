//! Delta records — the single item type flowing through the overlay pipeline.
//!
//! # On-wire layout (all fields big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   offset      byte offset within the item's domain (LE never)
//!    8      2   length      original page length, 0 < length <= 4096
//!   10      1   tag         low 4 bits = domain, high 4 bits = ref kind
//! -- RAW / XDELTA --
//!   11      8   data_len
//!   19      N   data        page bytes, or algorithm-tagged patch
//! -- SELF / BASE_DISK / BASE_MEM --
//!   11      8   data        producer index, or base-image byte offset
//! -- ZERO --
//!   (no payload)
//! -- when with_hash --
//!   ...    32   fingerprint SHA-256 of the original page
//! ```
//!
//! # Tag codes
//! Domain: `MEMORY=0x01 DISK=0x02`.  Ref kind: `RAW=0x10 XDELTA=0x20
//! SELF=0x30 BASE_DISK=0x40 BASE_MEM=0x50 ZERO=0x60`.  These values are
//! frozen; both endpoints of a hand-off must agree byte-for-byte.
//!
//! # Stable identifier
//! `index(domain, offset) = (offset << 1) | (domain & 1)` gives every page a
//! single monotone-in-offset key per domain.  A `SELF(j)` item copies its
//! bytes from the page whose index is `j`, which must have been emitted
//! earlier in the same stream.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// Universal unit of work: a 4 KiB aligned page.
pub const PAGE_SIZE: usize = 4096;

// ── Domain ───────────────────────────────────────────────────────────────────

/// Which image a page belongs to.  The two domains share the delta format but
/// have separate base images and separate chunk-number spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Domain {
    Memory = 0x01,
    Disk   = 0x02,
}

impl Domain {
    pub fn from_tag(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Domain::Memory),
            0x02 => Some(Domain::Disk),
            _    => None,
        }
    }

    /// Human-readable name (for diagnostics only — never parsed).
    pub fn name(self) -> &'static str {
        match self {
            Domain::Memory => "memory",
            Domain::Disk   => "disk",
        }
    }
}

/// Stable per-page identifier used for self-references.
///
/// Monotone in `offset` within a domain; memory indexes are odd, disk
/// indexes even, so the two spaces never collide.
#[inline]
pub fn page_index(domain: Domain, offset: u64) -> u64 {
    (offset << 1) | (domain as u64 & 1)
}

/// Recover the domain of a page index (the inverse of [`page_index`]'s
/// low bit).
#[inline]
pub fn index_domain(index: u64) -> Domain {
    if index & 1 == 1 { Domain::Memory } else { Domain::Disk }
}

// ── Ref kinds ────────────────────────────────────────────────────────────────

pub const REF_RAW:       u8 = 0x10;
pub const REF_XDELTA:    u8 = 0x20;
pub const REF_SELF:      u8 = 0x30;
pub const REF_BASE_DISK: u8 = 0x40;
pub const REF_BASE_MEM:  u8 = 0x50;
pub const REF_ZERO:      u8 = 0x60;

/// How a page's bytes are represented in the overlay stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaRef {
    /// Literal bytes of the page.
    Raw(Vec<u8>),
    /// Algorithm-tagged binary patch against the aligned page at `offset`
    /// of the same-domain base image (see `diff::apply_patch`).
    Xdelta(Vec<u8>),
    /// The all-zero page.
    Zero,
    /// Byte copy from the base disk image at the given offset.
    BaseDisk(u64),
    /// Byte copy from the base memory image at the given offset.
    BaseMem(u64),
    /// Byte copy from the earlier item with the given page index.
    SelfRef(u64),
}

impl DeltaRef {
    /// On-wire ref-kind code (high nibble of the tag byte).
    pub fn kind(&self) -> u8 {
        match self {
            DeltaRef::Raw(_)      => REF_RAW,
            DeltaRef::Xdelta(_)   => REF_XDELTA,
            DeltaRef::SelfRef(_)  => REF_SELF,
            DeltaRef::BaseDisk(_) => REF_BASE_DISK,
            DeltaRef::BaseMem(_)  => REF_BASE_MEM,
            DeltaRef::Zero        => REF_ZERO,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            DeltaRef::Raw(_)      => "raw",
            DeltaRef::Xdelta(_)   => "xdelta",
            DeltaRef::SelfRef(_)  => "self",
            DeltaRef::BaseDisk(_) => "base_disk",
            DeltaRef::BaseMem(_)  => "base_mem",
            DeltaRef::Zero        => "zero",
        }
    }

    /// True for the two payload-carrying kinds that dedup may still rewrite.
    #[inline]
    pub fn is_rewritable(&self) -> bool {
        matches!(self, DeltaRef::Raw(_) | DeltaRef::Xdelta(_))
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum DeltaError {
    #[error("truncated delta record in overlay stream")]
    Truncated,
    #[error("unknown ref kind {kind:#04x} in tag byte {tag:#04x}")]
    UnknownRefKind { tag: u8, kind: u8 },
    #[error("unknown domain {domain:#04x} in tag byte {tag:#04x}")]
    UnknownDomain { tag: u8, domain: u8 },
    #[error("delta item at offset {offset} has invalid length {length} (must be 1..=4096)")]
    BadLength { offset: u64, length: u16 },
    #[error("delta item at offset {offset} has no fingerprint but with_hash is set")]
    MissingFingerprint { offset: u64 },
    #[error("reordering changed the delta list (before: {before} items, after: {after})")]
    ReorderChanged { before: usize, after: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── DeltaItem ────────────────────────────────────────────────────────────────

/// One page-worth of overlay record.
///
/// Produced by the diff stage with `Raw`/`Xdelta` references and a populated
/// fingerprint, rewritten in place by dedup, serialized by the compressor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaItem {
    pub domain:      Domain,
    /// Absolute byte offset within the domain; always 4 KiB aligned.
    pub offset:      u64,
    /// Original page length.  4096 except possibly the final memory page.
    pub length:      u16,
    /// SHA-256 of the original page.  Carried through diff/dedup; written to
    /// the wire only when `with_hash` is set (required in residue mode).
    pub fingerprint: Option<[u8; 32]>,
    pub reference:   DeltaRef,
}

impl DeltaItem {
    /// Stable identifier of this page within the overlay stream.
    #[inline]
    pub fn index(&self) -> u64 {
        page_index(self.domain, self.offset)
    }

    /// Chunk number within the domain (`offset / 4096`).
    #[inline]
    pub fn chunk_id(&self) -> u64 {
        self.offset / PAGE_SIZE as u64
    }

    /// Serialized size in bytes, without actually serializing.
    pub fn serialized_len(&self, with_hash: bool) -> usize {
        let body = match &self.reference {
            DeltaRef::Raw(d) | DeltaRef::Xdelta(d) => 8 + d.len(),
            DeltaRef::SelfRef(_) | DeltaRef::BaseDisk(_) | DeltaRef::BaseMem(_) => 8,
            DeltaRef::Zero => 0,
        };
        8 + 2 + 1 + body + if with_hash { 32 } else { 0 }
    }

    /// Serialize one record.  Fails with `MissingFingerprint` if `with_hash`
    /// is set but the item carries none.
    pub fn write_to<W: Write>(&self, mut w: W, with_hash: bool) -> Result<(), DeltaError> {
        w.write_u64::<BigEndian>(self.offset)?;
        w.write_u16::<BigEndian>(self.length)?;
        w.write_u8(self.reference.kind() | self.domain as u8)?;

        match &self.reference {
            DeltaRef::Raw(data) | DeltaRef::Xdelta(data) => {
                w.write_u64::<BigEndian>(data.len() as u64)?;
                w.write_all(data)?;
            }
            DeltaRef::SelfRef(v) | DeltaRef::BaseDisk(v) | DeltaRef::BaseMem(v) => {
                w.write_u64::<BigEndian>(*v)?;
            }
            DeltaRef::Zero => {}
        }

        if with_hash {
            let fp = self.fingerprint
                .ok_or(DeltaError::MissingFingerprint { offset: self.offset })?;
            w.write_all(&fp)?;
        }
        Ok(())
    }

    /// Decode one record from a stream.
    ///
    /// Returns `Ok(None)` at a clean end of stream (no bytes left before the
    /// next record) and `Err(Truncated)` if the stream ends mid-record.
    pub fn read_from<R: Read>(mut r: R, with_hash: bool) -> Result<Option<DeltaItem>, DeltaError> {
        let mut header = [0u8; 11];
        if !read_or_eof(&mut r, &mut header)? {
            return Ok(None);
        }

        let offset = u64::from_be_bytes(header[0..8].try_into().unwrap());
        let length = u16::from_be_bytes(header[8..10].try_into().unwrap());
        let tag    = header[10];

        if length == 0 || length as usize > PAGE_SIZE {
            return Err(DeltaError::BadLength { offset, length });
        }

        let domain = Domain::from_tag(tag & 0x0F)
            .ok_or(DeltaError::UnknownDomain { tag, domain: tag & 0x0F })?;
        let kind = tag & 0xF0;

        let reference = match kind {
            REF_RAW | REF_XDELTA => {
                let data_len = read_u64_be(&mut r)?;
                let mut data = vec![0u8; data_len as usize];
                r.read_exact(&mut data).map_err(map_eof)?;
                if kind == REF_RAW { DeltaRef::Raw(data) } else { DeltaRef::Xdelta(data) }
            }
            REF_SELF      => DeltaRef::SelfRef(read_u64_be(&mut r)?),
            REF_BASE_DISK => DeltaRef::BaseDisk(read_u64_be(&mut r)?),
            REF_BASE_MEM  => DeltaRef::BaseMem(read_u64_be(&mut r)?),
            REF_ZERO      => DeltaRef::Zero,
            _ => return Err(DeltaError::UnknownRefKind { tag, kind }),
        };

        let fingerprint = if with_hash {
            let mut fp = [0u8; 32];
            r.read_exact(&mut fp).map_err(map_eof)?;
            Some(fp)
        } else {
            None
        };

        Ok(Some(DeltaItem { domain, offset, length, fingerprint, reference }))
    }
}

/// Write a whole list of items back-to-back.
pub fn write_list<W: Write>(items: &[DeltaItem], mut w: W, with_hash: bool) -> Result<(), DeltaError> {
    for item in items {
        item.write_to(&mut w, with_hash)?;
    }
    Ok(())
}

/// Read items until end of stream.
pub fn read_list<R: Read>(mut r: R, with_hash: bool) -> Result<Vec<DeltaItem>, DeltaError> {
    let mut items = Vec::new();
    while let Some(item) = DeltaItem::read_from(&mut r, with_hash)? {
        items.push(item);
    }
    Ok(items)
}

// ── Internal read helpers ────────────────────────────────────────────────────

fn read_u64_be<R: Read>(r: &mut R) -> Result<u64, DeltaError> {
    r.read_u64::<BigEndian>().map_err(map_eof)
}

fn map_eof(e: io::Error) -> DeltaError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        DeltaError::Truncated
    } else {
        DeltaError::Io(e)
    }
}

/// Fill `buf` completely, or return `Ok(false)` if the stream was already at
/// end.  A partial fill is a truncation error.
fn read_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, DeltaError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(DeltaError::Truncated);
        }
        filled += n;
    }
    Ok(true)
}

// ── Statistics ───────────────────────────────────────────────────────────────

/// Per-domain breakdown of emitted items, tallied by the blob stage and
/// logged after encode.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainStats {
    pub items:            u64,
    pub raw:              u64,
    pub xdelta:           u64,
    pub zero:             u64,
    pub base_disk:        u64,
    pub base_mem:         u64,
    pub self_same_domain: u64,
    pub self_cross_domain: u64,
    pub raw_bytes:        u64,
    pub xdelta_bytes:     u64,
    pub serialized_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaStats {
    pub memory: DomainStats,
    pub disk:   DomainStats,
}

impl DeltaStats {
    pub fn record(&mut self, item: &DeltaItem, with_hash: bool) {
        let s = match item.domain {
            Domain::Memory => &mut self.memory,
            Domain::Disk   => &mut self.disk,
        };
        s.items += 1;
        s.serialized_bytes += item.serialized_len(with_hash) as u64;
        match &item.reference {
            DeltaRef::Raw(d) => {
                s.raw += 1;
                s.raw_bytes += d.len() as u64;
            }
            DeltaRef::Xdelta(d) => {
                s.xdelta += 1;
                s.xdelta_bytes += d.len() as u64;
            }
            DeltaRef::Zero        => s.zero += 1,
            DeltaRef::BaseDisk(_) => s.base_disk += 1,
            DeltaRef::BaseMem(_)  => s.base_mem += 1,
            DeltaRef::SelfRef(j)  => {
                if index_domain(*j) == item.domain {
                    s.self_same_domain += 1;
                } else {
                    s.self_cross_domain += 1;
                }
            }
        }
    }

    /// Log the breakdown at info level, one line per domain.
    pub fn log_summary(&self) {
        for (name, s) in [("disk", &self.disk), ("memory", &self.memory)] {
            if s.items == 0 {
                tracing::info!(domain = name, "no modified pages");
                continue;
            }
            tracing::info!(
                domain = name,
                items = s.items,
                zero = s.zero,
                base_disk = s.base_disk,
                base_mem = s.base_mem,
                self_same = s.self_same_domain,
                self_cross = s.self_cross_domain,
                xdelta = s.xdelta,
                raw = s.raw,
                xdelta_bytes = s.xdelta_bytes,
                raw_bytes = s.raw_bytes,
                serialized_bytes = s.serialized_bytes,
                "overlay breakdown"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(item: &DeltaItem, with_hash: bool) -> DeltaItem {
        let mut buf = Vec::new();
        item.write_to(&mut buf, with_hash).unwrap();
        assert_eq!(buf.len(), item.serialized_len(with_hash));
        DeltaItem::read_from(&buf[..], with_hash).unwrap().unwrap()
    }

    #[test]
    fn raw_disk_tag_byte() {
        // 4096 x "B" at disk offset 0 serializes with tag 0x12.
        let item = DeltaItem {
            domain: Domain::Disk,
            offset: 0,
            length: PAGE_SIZE as u16,
            fingerprint: None,
            reference: DeltaRef::Raw(vec![b'B'; PAGE_SIZE]),
        };
        let mut buf = Vec::new();
        item.write_to(&mut buf, false).unwrap();
        assert_eq!(buf[10], 0x12);
        assert_eq!(roundtrip(&item, false), item);
    }

    #[test]
    fn all_kinds_roundtrip() {
        let items = vec![
            DeltaItem {
                domain: Domain::Memory, offset: 4096, length: 4096,
                fingerprint: Some([7u8; 32]),
                reference: DeltaRef::Xdelta(vec![1, 2, 3]),
            },
            DeltaItem {
                domain: Domain::Memory, offset: 8192, length: 4096,
                fingerprint: Some([8u8; 32]),
                reference: DeltaRef::Zero,
            },
            DeltaItem {
                domain: Domain::Disk, offset: 12288, length: 4096,
                fingerprint: Some([9u8; 32]),
                reference: DeltaRef::BaseMem(65536),
            },
            DeltaItem {
                domain: Domain::Disk, offset: 16384, length: 4096,
                fingerprint: Some([10u8; 32]),
                reference: DeltaRef::SelfRef(page_index(Domain::Memory, 4096)),
            },
        ];
        let mut buf = Vec::new();
        write_list(&items, &mut buf, true).unwrap();
        let back = read_list(&buf[..], true).unwrap();
        assert_eq!(back, items);
    }

    #[test]
    fn short_tail_roundtrip() {
        let item = DeltaItem {
            domain: Domain::Memory, offset: 61440, length: 1024,
            fingerprint: None,
            reference: DeltaRef::Raw(vec![0xAB; 1024]),
        };
        assert_eq!(roundtrip(&item, false), item);
    }

    #[test]
    fn clean_eof_returns_none() {
        assert!(DeltaItem::read_from(&[][..], false).unwrap().is_none());
    }

    #[test]
    fn truncated_record_is_error() {
        let item = DeltaItem {
            domain: Domain::Disk, offset: 0, length: 4096,
            fingerprint: None,
            reference: DeltaRef::Raw(vec![0u8; 128]),
        };
        let mut buf = Vec::new();
        item.write_to(&mut buf, false).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            DeltaItem::read_from(&buf[..], false),
            Err(DeltaError::Truncated)
        ));
    }

    #[test]
    fn missing_fingerprint_rejected() {
        let item = DeltaItem {
            domain: Domain::Disk, offset: 0, length: 4096,
            fingerprint: None,
            reference: DeltaRef::Zero,
        };
        assert!(matches!(
            item.write_to(Vec::new(), true),
            Err(DeltaError::MissingFingerprint { .. })
        ));
    }

    #[test]
    fn index_is_injective_across_domains() {
        assert_ne!(page_index(Domain::Memory, 4096), page_index(Domain::Disk, 4096));
        assert_eq!(index_domain(page_index(Domain::Memory, 8192)), Domain::Memory);
        assert_eq!(index_domain(page_index(Domain::Disk, 8192)), Domain::Disk);
        // Monotone in offset within a domain.
        assert!(page_index(Domain::Disk, 4096) < page_index(Domain::Disk, 8192));
    }
}
