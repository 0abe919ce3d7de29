//! Multi-source deduplication.
//!
//! A single thread reads from both domain diff queues and rewrites each
//! payload-carrying item against four catalogs, in fixed priority order so
//! encoders and decoders agree:
//!
//! 1. the all-zero page,
//! 2. the base catalogs (the item's own domain preferred on a same-hash
//!    collision, base memory otherwise),
//! 3. pages already emitted in this overlay (self-reference).
//!
//! Anything that misses every catalog keeps its RAW/XDELTA payload and
//! registers its fingerprint in the self index.  The stage is the only
//! writer of that index, which is what keeps self-references acyclic: the
//! index only grows, and a producer is always the first occurrence of a
//! fingerprint, so every consumer lands after it in the emitted stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use sha2::{Digest, Sha256};

use crate::catalog::BaseHashIndex;
use crate::control::StageStats;
use crate::delta::{DeltaItem, DeltaRef, Domain, PAGE_SIZE};

/// Poll back-off when both input queues are momentarily empty.
const IDLE_BACKOFF: Duration = Duration::from_micros(500);

/// Tallies surfaced to the controller and the encode report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupCounters {
    pub n_zero:      u64,
    pub n_base_disk: u64,
    pub n_base_mem:  u64,
    pub n_self:      u64,
}

/// The growing fingerprint → (index, length) map over pages already kept in
/// this overlay.  Single-writer; created empty per overlay.
#[derive(Debug, Default)]
pub struct SelfHashIndex {
    map: HashMap<[u8; 32], (u64, u16)>,
}

impl SelfHashIndex {
    pub fn lookup(&self, fp: &[u8; 32], length: u16) -> Option<u64> {
        match self.map.get(fp) {
            // Equal content implies equal length; anything else would make
            // the receiver copy the wrong number of bytes.
            Some((index, len)) if *len == length => Some(*index),
            _ => None,
        }
    }

    pub fn insert_first(&mut self, fp: [u8; 32], index: u64, length: u16) {
        self.map.entry(fp).or_insert((index, length));
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// SHA-256 of `length` zero bytes.
pub fn zero_fingerprint(length: usize) -> [u8; 32] {
    static ZERO_PAGE: [u8; PAGE_SIZE] = [0u8; PAGE_SIZE];
    Sha256::digest(&ZERO_PAGE[..length.min(PAGE_SIZE)]).into()
}

/// Rewrite one item in place.  Returns which counter (if any) it hit.
pub fn dedup_item(
    item: &mut DeltaItem,
    base_disk: &BaseHashIndex,
    base_mem: &BaseHashIndex,
    self_index: &mut SelfHashIndex,
    counters: &mut DedupCounters,
) {
    if !item.reference.is_rewritable() {
        return;
    }
    let Some(fp) = item.fingerprint else {
        // Diff always populates the fingerprint; an item without one can
        // only pass through untouched.
        return;
    };

    // 1. Zero page.  Short pages qualify only when the shortened range is
    //    itself all zero (the hash is over the actual range).
    if fp == zero_fingerprint(item.length as usize) {
        item.reference = DeltaRef::Zero;
        counters.n_zero += 1;
        return;
    }

    // Short tail pages never match base catalogs or earlier full pages;
    // the lengths cannot line up.
    if item.length as usize != PAGE_SIZE {
        self_index.insert_first(fp, item.index(), item.length);
        return;
    }

    // 2. Base catalogs, own domain first on a same-hash collision.
    let (first, second, first_is_mem) = match item.domain {
        Domain::Memory => (base_mem, base_disk, true),
        Domain::Disk   => (base_disk, base_mem, false),
    };
    for (catalog, is_mem) in [(first, first_is_mem), (second, !first_is_mem)] {
        if let Some((offset, len)) = catalog.lookup(&fp) {
            if len as usize != PAGE_SIZE {
                continue;
            }
            item.reference = if is_mem {
                counters.n_base_mem += 1;
                DeltaRef::BaseMem(offset)
            } else {
                counters.n_base_disk += 1;
                DeltaRef::BaseDisk(offset)
            };
            return;
        }
    }

    // 3. Self-reference against an already-kept page.
    if let Some(producer) = self_index.lookup(&fp, item.length) {
        // The producer was registered when it was emitted, so it precedes
        // this consumer in the stream by construction.
        debug_assert_ne!(producer, item.index());
        item.reference = DeltaRef::SelfRef(producer);
        counters.n_self += 1;
        return;
    }

    // 4. Catalog miss: keep the payload, become a potential producer.
    self_index.insert_first(fp, item.index(), item.length);
}

/// Run the dedup stage until both inputs close.
///
/// Reads the two domain queues fairly (non-blocking poll of each with
/// back-off) and forwards every item, rewritten or not, in consumption
/// order.
pub fn run_dedup(
    memory_rx: Receiver<DeltaItem>,
    disk_rx: Receiver<DeltaItem>,
    tx: Sender<DeltaItem>,
    base_disk: Arc<BaseHashIndex>,
    base_mem: Arc<BaseHashIndex>,
    stats: Arc<StageStats>,
) -> DedupCounters {
    let mut self_index = SelfHashIndex::default();
    let mut counters = DedupCounters::default();
    let mut memory_open = true;
    let mut disk_open = true;

    while memory_open || disk_open {
        let mut progressed = false;
        for (rx, open) in [(&memory_rx, &mut memory_open), (&disk_rx, &mut disk_open)] {
            if !*open {
                continue;
            }
            match rx.try_recv() {
                Ok(mut item) => {
                    progressed = true;
                    let t0 = Instant::now();
                    let in_len = item.serialized_len(true) as u64;
                    dedup_item(&mut item, &base_disk, &base_mem, &mut self_index, &mut counters);
                    let out_len = item.serialized_len(true) as u64;
                    stats.record(in_len, out_len, t0.elapsed());
                    if tx.send(item).is_err() {
                        return counters; // downstream gone
                    }
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => *open = false,
            }
        }
        if !progressed && (memory_open || disk_open) {
            std::thread::sleep(IDLE_BACKOFF);
        }
    }

    tracing::debug!(
        zero = counters.n_zero,
        base_disk = counters.n_base_disk,
        base_mem = counters.n_base_mem,
        self_ref = counters.n_self,
        self_index = self_index.len(),
        "dedup finished"
    );
    counters
}
