//! Page diffing against the base image.
//!
//! One worker pool per domain turns modified pages into delta items.  Per
//! page: fingerprint, the unchanged-page fast path (skip when the aligned
//! base page already has this hash), the optional free-memory skip, then a
//! binary diff against the aligned base page.  The patch is emitted only
//! when strictly smaller than the page; every failure mode (no base page,
//! diff error, oversized patch) falls back to a RAW item, never an error.
//!
//! # Patch format
//! The first patch byte names the algorithm, so the decoder stays correct
//! across mid-stream algorithm swaps:
//!
//! ```text
//! 0x01  bsdiff patch, body deflate-compressed
//! 0x02  xor-rle patch: RLE frames over base XOR page
//!       ZRUN frame: 0x01 <u16 BE count>          (that many zero bytes)
//!       LIT  frame: 0x00 <u16 BE count> <bytes>  (literal xor bytes)
//! ```

use std::collections::HashSet;
use std::io::Read;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use memmap2::Mmap;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::catalog::BaseHashIndex;
use crate::control::StageStats;
use crate::delta::{DeltaItem, DeltaRef, Domain, PAGE_SIZE};

const PATCH_TAG_BSDIFF:  u8 = 0x01;
const PATCH_TAG_XOR_RLE: u8 = 0x02;

#[derive(Error, Debug)]
pub enum DiffError {
    #[error("empty patch")]
    EmptyPatch,
    #[error("unknown patch algorithm tag {0:#04x}")]
    UnknownPatchTag(u8),
    #[error("bsdiff apply failed: {0}")]
    BsdiffApply(String),
    #[error("xor-rle patch is malformed")]
    MalformedXorRle,
    #[error("patch output length {got} != base length {expected}")]
    LengthMismatch { got: usize, expected: usize },
}

// ── Algorithm selection ──────────────────────────────────────────────────────

/// Binary diff algorithm, selectable per domain and hot-swappable at page
/// boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffAlgorithm {
    Bsdiff,
    XorRle,
    None,
}

impl DiffAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            DiffAlgorithm::Bsdiff => "bsdiff",
            DiffAlgorithm::XorRle => "xor-rle",
            DiffAlgorithm::None   => "none",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "bsdiff"            => Some(DiffAlgorithm::Bsdiff),
            "xor-rle" | "xor"   => Some(DiffAlgorithm::XorRle),
            "none"              => Some(DiffAlgorithm::None),
            _                   => None,
        }
    }

    fn to_code(self) -> u8 {
        match self {
            DiffAlgorithm::Bsdiff => 0,
            DiffAlgorithm::XorRle => 1,
            DiffAlgorithm::None   => 2,
        }
    }

    fn from_code(v: u8) -> Self {
        match v {
            0 => DiffAlgorithm::Bsdiff,
            1 => DiffAlgorithm::XorRle,
            _ => DiffAlgorithm::None,
        }
    }
}

/// Atomic holder for a domain's current diff algorithm.
#[derive(Debug)]
pub struct DiffSelector {
    code: AtomicU8,
}

impl DiffSelector {
    pub fn new(algorithm: DiffAlgorithm) -> Self {
        Self { code: AtomicU8::new(algorithm.to_code()) }
    }

    pub fn store(&self, algorithm: DiffAlgorithm) {
        self.code.store(algorithm.to_code(), Ordering::Relaxed);
    }

    pub fn load(&self) -> DiffAlgorithm {
        DiffAlgorithm::from_code(self.code.load(Ordering::Relaxed))
    }
}

// ── Patch encode / decode ────────────────────────────────────────────────────

/// Diff `page` against `base`, returning a tagged patch only when it is
/// strictly smaller than the page itself.
pub fn diff_page(algorithm: DiffAlgorithm, base: &[u8], page: &[u8]) -> Option<Vec<u8>> {
    match algorithm {
        DiffAlgorithm::None => None,
        DiffAlgorithm::Bsdiff => {
            let mut body = Vec::new();
            bsdiff::diff(base, page, &mut body).ok()?;
            // bsdiff emits uncompressed control+diff blocks; a page-sized
            // diff block would never beat RAW, so the body is deflated.
            let mut patch = vec![PATCH_TAG_BSDIFF];
            flate2::read::DeflateEncoder::new(&body[..], flate2::Compression::fast())
                .read_to_end(&mut patch)
                .ok()?;
            (patch.len() < page.len()).then_some(patch)
        }
        DiffAlgorithm::XorRle => {
            if base.len() != page.len() {
                return None;
            }
            let patch = xor_rle_encode(base, page);
            (patch.len() < page.len()).then_some(patch)
        }
    }
}

/// Apply a tagged patch to the base page.
pub fn apply_patch(base: &[u8], patch: &[u8]) -> Result<Vec<u8>, DiffError> {
    let (&tag, body) = patch.split_first().ok_or(DiffError::EmptyPatch)?;
    match tag {
        PATCH_TAG_BSDIFF => {
            let mut inflated = Vec::with_capacity(base.len() / 2);
            flate2::read::DeflateDecoder::new(body)
                .read_to_end(&mut inflated)
                .map_err(|e| DiffError::BsdiffApply(e.to_string()))?;
            let mut out = Vec::with_capacity(base.len());
            bsdiff::patch(base, &mut inflated.as_slice(), &mut out)
                .map_err(|e| DiffError::BsdiffApply(e.to_string()))?;
            Ok(out)
        }
        PATCH_TAG_XOR_RLE => {
            let out = xor_rle_decode(base, body)?;
            if out.len() != base.len() {
                return Err(DiffError::LengthMismatch { got: out.len(), expected: base.len() });
            }
            Ok(out)
        }
        other => Err(DiffError::UnknownPatchTag(other)),
    }
}

fn xor_rle_encode(base: &[u8], page: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.push(PATCH_TAG_XOR_RLE);

    let mut i = 0usize;
    while i < page.len() {
        // Count a zero run in the xor stream.
        let mut run = 0usize;
        while i + run < page.len() && base[i + run] == page[i + run] && run < u16::MAX as usize {
            run += 1;
        }
        if run >= 4 {
            out.push(0x01);
            out.extend_from_slice(&(run as u16).to_be_bytes());
            i += run;
            continue;
        }
        // Literal xor bytes until the next long zero run.
        let lit_start = i;
        let mut lit = 0usize;
        while i < page.len() && lit < u16::MAX as usize {
            let mut peek = 0usize;
            while i + peek < page.len() && base[i + peek] == page[i + peek] && peek < 4 {
                peek += 1;
            }
            if peek >= 4 {
                break;
            }
            lit += 1;
            i += 1;
        }
        out.push(0x00);
        out.extend_from_slice(&(lit as u16).to_be_bytes());
        for j in lit_start..lit_start + lit {
            out.push(base[j] ^ page[j]);
        }
    }
    out
}

fn xor_rle_decode(base: &[u8], body: &[u8]) -> Result<Vec<u8>, DiffError> {
    let mut out = Vec::with_capacity(base.len());
    let mut i = 0usize;
    while i < body.len() {
        let frame = body[i];
        i += 1;
        if i + 2 > body.len() {
            return Err(DiffError::MalformedXorRle);
        }
        let count = u16::from_be_bytes([body[i], body[i + 1]]) as usize;
        i += 2;
        match frame {
            0x01 => {
                if out.len() + count > base.len() {
                    return Err(DiffError::MalformedXorRle);
                }
                let at = out.len();
                out.extend_from_slice(&base[at..at + count]);
            }
            0x00 => {
                if i + count > body.len() || out.len() + count > base.len() {
                    return Err(DiffError::MalformedXorRle);
                }
                for j in 0..count {
                    out.push(base[out.len()] ^ body[i + j]);
                }
                i += count;
            }
            _ => return Err(DiffError::MalformedXorRle),
        }
    }
    Ok(out)
}

// ── Worker pool ──────────────────────────────────────────────────────────────

/// One modified page handed to a diff worker.  The domain is fixed per pool.
#[derive(Debug)]
pub struct PageJob {
    pub offset: u64,
    pub data:   Vec<u8>,
}

/// Shared inputs of one domain's diff pool.
pub struct DiffContext {
    pub domain:            Domain,
    /// Read-only mmap of the same-domain base image; `None` when the base
    /// is unavailable (every page then falls back to RAW).
    pub base:              Option<Arc<Mmap>>,
    /// Same-domain base catalog, for the unchanged-page fast path.
    pub base_index:        Arc<BaseHashIndex>,
    pub algorithm:         Arc<DiffSelector>,
    /// Memory chunk ids known to be free in the guest; pages in this set are
    /// skipped when `apply_free_memory` is on.
    pub free_pfns:         Option<Arc<HashSet<u64>>>,
    pub apply_free_memory: bool,
    pub stats:             Arc<StageStats>,
    /// Retarget knob: workers at or above this count run at a reduced duty
    /// cycle instead of exiting, so the pool never deadlocks on shutdown.
    pub active:            Arc<AtomicUsize>,
}

/// Spawn `workers` diff threads for one domain.
///
/// Workers drain `rx` until the feeder closes it, then drop `tx`.  They are
/// stateless across pages; output order within the domain is not
/// offset-ordered.
pub fn spawn_diff_workers(
    ctx: Arc<DiffContext>,
    workers: usize,
    rx: Receiver<PageJob>,
    tx: Sender<DeltaItem>,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker_idx| {
            let ctx = Arc::clone(&ctx);
            let rx = rx.clone();
            let tx = tx.clone();
            std::thread::spawn(move || diff_worker_loop(&ctx, worker_idx, rx, tx))
        })
        .collect()
}

fn diff_worker_loop(ctx: &DiffContext, worker_idx: usize, rx: Receiver<PageJob>, tx: Sender<DeltaItem>) {
    while let Ok(job) = rx.recv() {
        if worker_idx >= ctx.active.load(Ordering::Relaxed) {
            // Deactivated worker: yield its timeslice instead of exiting.
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        if let Some(item) = diff_one_page(ctx, job) {
            if tx.send(item).is_err() {
                return; // downstream gone, nothing left to do
            }
        }
    }
}

/// Turn one page into a delta item, or `None` when the page is skipped.
fn diff_one_page(ctx: &DiffContext, job: PageJob) -> Option<DeltaItem> {
    let t0 = Instant::now();
    let fp: [u8; 32] = Sha256::digest(&job.data).into();

    // Unchanged page: identical to the aligned base page (or the recorded
    // short tail), never emitted.
    if let Some(base_fp) = ctx.base_index.aligned_hash(job.offset) {
        if *base_fp == fp {
            ctx.stats.record_skip(job.data.len() as u64);
            return None;
        }
    }

    // Guest-reported free page: content is garbage, do not transfer.
    if ctx.domain == Domain::Memory && ctx.apply_free_memory {
        if let Some(free) = &ctx.free_pfns {
            if free.contains(&(job.offset / PAGE_SIZE as u64)) {
                ctx.stats.record_free_skip(job.data.len() as u64);
                return None;
            }
        }
    }

    // Short tail pages are always RAW; the base comparison window would not
    // line up and the receiver writes exactly `length` bytes.
    let reference = if job.data.len() < PAGE_SIZE {
        DeltaRef::Raw(job.data.clone())
    } else {
        match base_page(ctx, job.offset, job.data.len()) {
            Some(base) => match diff_page(ctx.algorithm.load(), base, &job.data) {
                Some(patch) => DeltaRef::Xdelta(patch),
                None        => DeltaRef::Raw(job.data.clone()),
            },
            // Modified image larger than the base: nothing to diff against.
            None => DeltaRef::Raw(job.data.clone()),
        }
    };

    let out_len = match &reference {
        DeltaRef::Xdelta(p) => p.len(),
        _                   => job.data.len(),
    };
    ctx.stats.record(job.data.len() as u64, out_len as u64, t0.elapsed());

    Some(DeltaItem {
        domain: ctx.domain,
        offset: job.offset,
        length: job.data.len() as u16,
        fingerprint: Some(fp),
        reference,
    })
}

fn base_page<'a>(ctx: &'a DiffContext, offset: u64, len: usize) -> Option<&'a [u8]> {
    let base = ctx.base.as_ref()?;
    let start = offset as usize;
    let end = start.checked_add(len)?;
    if end > base.len() {
        return None;
    }
    Some(&base[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_rle_roundtrip_sparse_change() {
        let base = vec![0x55u8; PAGE_SIZE];
        let mut page = base.clone();
        page[100] = 0xAA;
        page[3000..3010].copy_from_slice(&[9u8; 10]);

        let patch = diff_page(DiffAlgorithm::XorRle, &base, &page).expect("patch smaller");
        assert!(patch.len() < PAGE_SIZE);
        assert_eq!(apply_patch(&base, &patch).unwrap(), page);
    }

    #[test]
    fn bsdiff_roundtrip() {
        let base: Vec<u8> = (0u8..=255).cycle().take(PAGE_SIZE).collect();
        let mut page = base.clone();
        page[512..520].copy_from_slice(b"modified");

        let patch = diff_page(DiffAlgorithm::Bsdiff, &base, &page).expect("patch smaller");
        assert_eq!(patch[0], PATCH_TAG_BSDIFF);
        assert_eq!(apply_patch(&base, &patch).unwrap(), page);
    }

    #[test]
    fn incompressible_change_yields_no_patch() {
        // Every byte differs; the xor stream has no zero runs to exploit.
        let base = vec![b'A'; PAGE_SIZE];
        let page = vec![b'B'; PAGE_SIZE];
        assert!(diff_page(DiffAlgorithm::XorRle, &base, &page).is_none());
    }

    #[test]
    fn none_algorithm_never_patches() {
        let base = vec![0u8; PAGE_SIZE];
        let mut page = base.clone();
        page[0] = 1;
        assert!(diff_page(DiffAlgorithm::None, &base, &page).is_none());
    }

    #[test]
    fn unknown_patch_tag_rejected() {
        let base = vec![0u8; 16];
        assert!(matches!(
            apply_patch(&base, &[0x7F, 1, 2, 3]),
            Err(DiffError::UnknownPatchTag(0x7F))
        ));
    }

    #[test]
    fn selector_swaps() {
        let sel = DiffSelector::new(DiffAlgorithm::Bsdiff);
        assert_eq!(sel.load(), DiffAlgorithm::Bsdiff);
        sel.store(DiffAlgorithm::None);
        assert_eq!(sel.load(), DiffAlgorithm::None);
    }
}
