//! Seekable byte view over an incoming memory snapshot.
//!
//! A snapshot may arrive as a stream: the hypervisor side pushes byte chunks
//! of arbitrary size into a bounded queue while the pipeline consumes pages.
//! [`SnapshotReader`] presents that queue as a blocking `seek`/`read`/`tell`
//! source backed by a growable buffer.  The buffer never shrinks during a
//! single snapshot; snapshots are bounded by VM memory size.
//!
//! # RAM framing
//! The snapshot begins with a hypervisor-specific header the pipeline treats
//! as opaque, terminated by the `"pc.ram"` tag preceded by a 1-byte length
//! prefix; the 8-byte big-endian total-memory-size field sits immediately
//! before that prefix, with its low 12 bits used as feature flags (the
//! `MEM_SIZE` bit 0x04 must be set).  A table of `(id, length)` block records
//! follows the tag until the declared total is covered; the page-aligned RAM
//! payload begins right after.  If the header length is not 4 KiB-aligned
//! the pipeline aborts — the payload must be page-aligned.

use std::io::{self, Read};

use crossbeam_channel::Receiver;
use thiserror::Error;

use crate::delta::PAGE_SIZE;

/// RAM section tag written by the hypervisor.
pub const RAM_ID: &[u8] = b"pc.ram";

/// Feature flag in the low 12 bits of the total-memory-size field.
pub const RAM_SAVE_FLAG_MEM_SIZE: u64 = 0x04;

/// Low bits of the size field reserved for feature flags.
pub const RAM_SIZE_FLAG_MASK: u64 = 0xfff;

/// The tag must appear within this many header bytes; scanning further means
/// the stream is not a memory snapshot at all.
const RAM_TAG_SCAN_LIMIT: usize = 32 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("cannot find \"pc.ram\" tag in the first {RAM_TAG_SCAN_LIMIT} snapshot bytes")]
    MissingRamTag,
    #[error("total-memory-size field flags {flags:#05x} lack the MEM_SIZE bit")]
    BadRamFlags { flags: u64 },
    #[error("snapshot header length {len} is not 4 KiB-aligned")]
    UnalignedHeader { len: u64 },
    #[error("snapshot stream ended inside the framing header")]
    TruncatedHeader,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── SnapshotReader ───────────────────────────────────────────────────────────

/// Blocking seekable source over a producer/consumer byte queue.
///
/// End of stream is signalled by the producer dropping its sender; every
/// read past the buffered end first blocks on the queue until enough data
/// has arrived or the stream ends.
pub struct SnapshotReader {
    rx:  Option<Receiver<Vec<u8>>>,
    buf: Vec<u8>,
    pos: usize,
}

impl SnapshotReader {
    pub fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self { rx: Some(rx), buf: Vec::new(), pos: 0 }
    }

    /// A reader over bytes that are already fully available (a file read
    /// into memory, or a test fixture).
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { rx: None, buf: data, pos: 0 }
    }

    /// Block until the buffer holds at least `target` bytes or the stream
    /// ends.  Returns the buffered length.
    fn fill_to(&mut self, target: usize) -> usize {
        while self.buf.len() < target {
            let chunk = match &self.rx {
                Some(rx) => match rx.recv() {
                    Ok(c) => c,
                    Err(_) => {
                        self.rx = None;
                        break;
                    }
                },
                None => break,
            };
            self.buf.extend_from_slice(&chunk);
        }
        self.buf.len()
    }

    /// Reposition the cursor, blocking until the stream has reached `offset`
    /// (or ended — seeking past end parks the cursor at end of data).
    pub fn seek(&mut self, offset: u64) {
        let have = self.fill_to(offset as usize);
        self.pos = (offset as usize).min(have);
    }

    pub fn tell(&self) -> u64 {
        self.pos as u64
    }

    /// Read up to `n` bytes from the cursor, blocking until they are
    /// available or the stream ends.  A short return means end of stream.
    pub fn read_up_to(&mut self, n: usize) -> &[u8] {
        let end = self.fill_to(self.pos + n).min(self.pos + n);
        let out = &self.buf[self.pos..end];
        self.pos = end;
        out
    }
}

impl Read for SnapshotReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let got = self.read_up_to(out.len());
        out[..got.len()].copy_from_slice(got);
        Ok(got.len())
    }
}

// ── RAM framing ──────────────────────────────────────────────────────────────

/// Parsed framing of a memory snapshot.
#[derive(Debug, Clone)]
pub struct RamLayout {
    /// Byte offset where the page-aligned RAM payload begins.
    pub header_len:   u64,
    /// Declared total memory size (flags bits cleared).
    pub total_memory: u64,
    /// RAM block table: `(id, length)` in declaration order.
    pub blocks:       Vec<(String, u64)>,
}

/// Locate the RAM payload and leave the reader positioned at its start.
pub fn parse_ram_header(r: &mut SnapshotReader) -> Result<RamLayout, SnapshotError> {
    // Scan forward for the tag; it may straddle chunk boundaries, so search
    // the growing buffer rather than individual reads.
    let tag_pos = find_ram_tag(r)?;

    // The 8-byte size/flags field sits before the 1-byte length prefix.
    let field_pos = tag_pos
        .checked_sub(1 + 8)
        .ok_or(SnapshotError::MissingRamTag)?;
    r.seek(field_pos as u64);
    let mut field = [0u8; 8];
    read_exactly(r, &mut field)?;
    let raw = u64::from_be_bytes(field);
    let flags = raw & RAM_SIZE_FLAG_MASK;
    if flags & RAM_SAVE_FLAG_MEM_SIZE == 0 {
        return Err(SnapshotError::BadRamFlags { flags });
    }
    let total_memory = raw & !RAM_SIZE_FLAG_MASK;

    // Block table starts at the length prefix of "pc.ram" itself and runs
    // until the declared total is covered.
    let mut blocks = Vec::new();
    let mut covered = 0u64;
    while covered < total_memory {
        let mut len_byte = [0u8; 1];
        read_exactly(r, &mut len_byte)?;
        let mut id = vec![0u8; len_byte[0] as usize];
        read_exactly(r, &mut id)?;
        let mut block_len = [0u8; 8];
        read_exactly(r, &mut block_len)?;
        let block_len = u64::from_be_bytes(block_len);
        blocks.push((String::from_utf8_lossy(&id).into_owned(), block_len));
        covered += block_len;
    }

    let header_len = r.tell();
    if header_len % PAGE_SIZE as u64 != 0 {
        return Err(SnapshotError::UnalignedHeader { len: header_len });
    }

    tracing::debug!(header_len, total_memory, blocks = blocks.len(), "snapshot framing parsed");
    Ok(RamLayout { header_len, total_memory, blocks })
}

/// Find the start of `"pc.ram"` with a valid 1-byte length prefix.
fn find_ram_tag(r: &mut SnapshotReader) -> Result<usize, SnapshotError> {
    let mut searched = 0usize;
    loop {
        let have = r.fill_to(searched + PAGE_SIZE);
        let window = &r.buf[..have];
        for i in searched..window.len().saturating_sub(RAM_ID.len() - 1) {
            if &window[i..i + RAM_ID.len()] == RAM_ID
                && i >= 1
                && window[i - 1] as usize == RAM_ID.len()
            {
                return Ok(i);
            }
        }
        if have <= searched + RAM_ID.len() || have >= RAM_TAG_SCAN_LIMIT {
            // No growth since last pass (stream ended) or scan cap reached.
            return Err(SnapshotError::MissingRamTag);
        }
        // Re-scan the last few bytes in case the tag straddled the boundary.
        searched = have.saturating_sub(RAM_ID.len());
    }
}

fn read_exactly(r: &mut SnapshotReader, out: &mut [u8]) -> Result<(), SnapshotError> {
    let got = r.read_up_to(out.len());
    if got.len() < out.len() {
        return Err(SnapshotError::TruncatedHeader);
    }
    out.copy_from_slice(got);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    /// Bytes of header before the size field: the opaque prefix is sized so
    /// the block table ends exactly on the first page boundary.
    const FIELD_AT: usize = PAGE_SIZE - (8 + 1 + RAM_ID.len() + 8);

    /// A minimal framed snapshot: opaque prefix, size/flags field, the block
    /// table (pc.ram only) ending page-aligned, then the payload.
    fn framed_snapshot(payload: &[u8], total_memory: u64) -> Vec<u8> {
        let mut out = vec![0xEEu8; FIELD_AT]; // opaque hypervisor prefix
        out.extend_from_slice(&((total_memory & !RAM_SIZE_FLAG_MASK) | RAM_SAVE_FLAG_MEM_SIZE).to_be_bytes());
        out.push(RAM_ID.len() as u8);
        out.extend_from_slice(RAM_ID);
        out.extend_from_slice(&total_memory.to_be_bytes());
        assert_eq!(out.len() % PAGE_SIZE, 0);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn parse_framed_header() {
        let payload = vec![0xABu8; 2 * PAGE_SIZE];
        let data = framed_snapshot(&payload, PAGE_SIZE as u64 * 2);
        let mut r = SnapshotReader::from_bytes(data);
        let layout = parse_ram_header(&mut r).unwrap();
        assert_eq!(layout.header_len, PAGE_SIZE as u64);
        assert_eq!(layout.total_memory, PAGE_SIZE as u64 * 2);
        assert_eq!(layout.blocks, vec![("pc.ram".to_string(), PAGE_SIZE as u64 * 2)]);
        assert_eq!(r.read_up_to(PAGE_SIZE), &payload[..PAGE_SIZE]);
    }

    #[test]
    fn missing_tag_is_rejected() {
        let mut r = SnapshotReader::from_bytes(vec![0u8; 8 * PAGE_SIZE]);
        assert!(matches!(parse_ram_header(&mut r), Err(SnapshotError::MissingRamTag)));
    }

    #[test]
    fn missing_mem_size_flag_is_rejected() {
        let payload = vec![0u8; PAGE_SIZE];
        let mut data = framed_snapshot(&payload, PAGE_SIZE as u64);
        // Clear the flag bits inside the size field.
        let raw = u64::from_be_bytes(data[FIELD_AT..FIELD_AT + 8].try_into().unwrap());
        data[FIELD_AT..FIELD_AT + 8].copy_from_slice(&(raw & !RAM_SIZE_FLAG_MASK).to_be_bytes());
        let mut r = SnapshotReader::from_bytes(data);
        assert!(matches!(parse_ram_header(&mut r), Err(SnapshotError::BadRamFlags { .. })));
    }

    #[test]
    fn unaligned_header_is_rejected() {
        let payload = vec![0u8; PAGE_SIZE];
        let mut data = framed_snapshot(&payload, PAGE_SIZE as u64);
        // Shift everything by one byte so the header end loses alignment.
        data.insert(0, 0xEE);
        let mut r = SnapshotReader::from_bytes(data);
        assert!(matches!(parse_ram_header(&mut r), Err(SnapshotError::UnalignedHeader { .. })));
    }

    #[test]
    fn reader_blocks_until_stream_arrives() {
        let (tx, rx) = bounded::<Vec<u8>>(4);
        let producer = std::thread::spawn(move || {
            for chunk in [vec![1u8; 100], vec![2u8; 100], vec![3u8; 56]] {
                tx.send(chunk).unwrap();
                std::thread::sleep(std::time::Duration::from_millis(2));
            }
            // Dropping the sender ends the stream.
        });

        let mut r = SnapshotReader::new(rx);
        r.seek(150);
        assert_eq!(r.tell(), 150);
        let got = r.read_up_to(200).to_vec();
        assert_eq!(got.len(), 106); // 256 total - 150
        assert_eq!(got[0], 2);
        assert!(r.read_up_to(16).is_empty());
        producer.join().unwrap();
    }
}
