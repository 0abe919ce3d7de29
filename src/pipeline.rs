//! Overlay construction pipeline — wiring, back-pressure, and the sink.
//!
//! ```text
//! disk feeder ──▶ diff pool (disk) ──┐
//!                                    ├─▶ dedup ─▶ batcher ─▶ compress pool ─▶ sink
//! mem  feeder ──▶ diff pool (mem) ───┘
//! ```
//!
//! Stages talk over bounded queues; a slow downstream stage back-pressures
//! everything above it.  End of stream is the channel closing: each stage
//! drops its sender when its input is exhausted, and the close ripples
//! through the pipeline.  Cancellation stops the feeders, lets the queues
//! drain, and joins every worker before returning.
//!
//! Ordering: diff output within a domain is unordered (parallel workers);
//! dedup forwards in consumption order; the batcher never reorders; blobs
//! are compressed in parallel but the sink restores sequence order before
//! writing.  That chain is what keeps every self-reference producer ahead
//! of its consumers on the wire.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use memmap2::Mmap;
use thiserror::Error;

use crate::catalog::{whole_file_sha256, BaseHashIndex, CatalogError};
use crate::compress::{
    compress_blob, BlobBuilder, CodecError, CompressedBlob, CompressionSelector, PendingBlob,
    DEFAULT_BLOB_SIZE,
};
use crate::control::{
    spawn_controller, BandwidthMonitor, ControlHandles, CreationMode, ProfileTable, StageStats,
};
use crate::dedup::{run_dedup, DedupCounters};
use crate::delta::{DeltaError, DeltaItem, DeltaStats, Domain, PAGE_SIZE};
use crate::diff::{spawn_diff_workers, DiffContext, DiffSelector, PageJob};
use crate::manifest::OverlayManifest;
use crate::recover::RecoverError;
use crate::reorder;
use crate::snapshot::{parse_ram_header, SnapshotError, SnapshotReader};

/// Default bound of every inter-stage queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Delta(#[from] DeltaError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Recover(#[from] RecoverError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("overlay creation cancelled")]
    Cancelled,
    #[error("overlay deadline exceeded")]
    DeadlineExceeded,
    #[error("pipeline worker panicked in {0}")]
    WorkerPanic(&'static str),
}

// ── Base VM ──────────────────────────────────────────────────────────────────

/// The immutable base image pair plus its loaded catalogs and read-only
/// mmaps, shared by every stage for the life of a hand-off session.
pub struct BaseVm {
    pub disk_path:     PathBuf,
    pub memory_path:   PathBuf,
    pub disk_index:    Arc<BaseHashIndex>,
    pub memory_index:  Arc<BaseHashIndex>,
    pub disk_map:      Arc<Mmap>,
    pub memory_map:    Arc<Mmap>,
    pub disk_sha256:   [u8; 32],
    pub memory_sha256: [u8; 32],
}

impl BaseVm {
    pub fn load<P: AsRef<Path>>(
        disk: P,
        disk_meta: P,
        memory: P,
        memory_meta: P,
    ) -> Result<Self, OverlayError> {
        let disk_path = disk.as_ref().to_owned();
        let memory_path = memory.as_ref().to_owned();

        let disk_file = File::open(&disk_path)?;
        let memory_file = File::open(&memory_path)?;
        // Mapped read-only and shared without locking across all workers.
        let disk_map = Arc::new(unsafe { Mmap::map(&disk_file)? });
        let memory_map = Arc::new(unsafe { Mmap::map(&memory_file)? });

        Ok(Self {
            disk_index: Arc::new(BaseHashIndex::load_file(&disk_meta)?),
            memory_index: Arc::new(BaseHashIndex::load_file(&memory_meta)?),
            disk_sha256: whole_file_sha256(&disk_path)?,
            memory_sha256: whole_file_sha256(&memory_path)?,
            disk_path,
            memory_path,
            disk_map,
            memory_map,
        })
    }
}

// ── Inputs and configuration ─────────────────────────────────────────────────

/// How the modified memory arrives.
pub enum MemoryInput {
    /// A full snapshot stream with the hypervisor framing header in front.
    Framed(SnapshotReader),
    /// A bare page-aligned payload (already positioned at offset 0).
    Payload(SnapshotReader),
}

/// The live VM state to transfer.
pub struct ModifiedVm {
    pub disk_path: PathBuf,
    pub memory:    MemoryInput,
    /// Dirty disk chunk ids from the hypervisor; `None` scans every page.
    pub disk_chunks: Option<Vec<u64>>,
}

/// Optional reordering of the finished delta list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReorderPass {
    /// Streaming mode: no reordering, lowest latency.
    #[default]
    None,
    /// Sort by `(domain, offset)` for sequential receiver writes.
    Linear,
    /// Hoist the listed memory chunks to the front in access order.
    Access(Vec<u64>),
}

pub struct OverlayConfig {
    pub mode:              CreationMode,
    pub blob_size:         usize,
    pub queue_depth:       usize,
    pub with_hash:         bool,
    pub apply_free_memory: bool,
    pub free_pfn_set:      Option<HashSet<u64>>,
    pub reorder:           ReorderPass,
    /// Run the adaptive controller.  Off by default so an encode is fully
    /// deterministic unless the caller opts in.
    pub adaptive:          bool,
    pub profile:           Option<Arc<ProfileTable>>,
    pub max_cores:         usize,
    /// Fixed downstream bandwidth in bits/sec for non-network destinations.
    pub fixed_network_bps: Option<f64>,
    pub cancel:            Option<Arc<AtomicBool>>,
    /// Deadline for the whole overlay operation.  Per-page work is never
    /// timed out; hitting the deadline cancels the run as a whole.
    pub deadline:          Option<Duration>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            mode: CreationMode::default(),
            blob_size: DEFAULT_BLOB_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            with_hash: false,
            apply_free_memory: false,
            free_pfn_set: None,
            reorder: ReorderPass::None,
            adaptive: false,
            profile: None,
            max_cores: 4,
            fixed_network_bps: None,
            cancel: None,
            deadline: None,
        }
    }
}

/// What an encode run produced, beyond the overlay bytes themselves.
#[derive(Debug)]
pub struct EncodeReport {
    pub manifest:             OverlayManifest,
    pub stats:                DeltaStats,
    pub dedup:                DedupCounters,
    pub disk_pages_skipped:   u64,
    pub memory_pages_skipped: u64,
    pub memory_pages_free:    u64,
    pub bytes_written:        u64,
    pub elapsed:              Duration,
}

// ── Encode ───────────────────────────────────────────────────────────────────

/// Build an overlay for `modified` against `base`, streaming blobs into
/// `out`.  Returns the finalized manifest and run statistics.
pub fn encode_overlay(
    base: &BaseVm,
    modified: ModifiedVm,
    cfg: OverlayConfig,
    out: &mut dyn Write,
) -> Result<EncodeReport, OverlayError> {
    let started = Instant::now();
    let cancel = cfg.cancel.clone().unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

    // Deadline watchdog: cancels the run as a whole once the budget is spent.
    let deadline_hit = Arc::new(AtomicBool::new(false));
    let watchdog_done = Arc::new(AtomicBool::new(false));
    let watchdog = cfg.deadline.map(|deadline| {
        let cancel = Arc::clone(&cancel);
        let deadline_hit = Arc::clone(&deadline_hit);
        let done = Arc::clone(&watchdog_done);
        std::thread::spawn(move || {
            let end = Instant::now() + deadline;
            while Instant::now() < end {
                if done.load(Ordering::Relaxed) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(50).min(deadline));
            }
            if !done.load(Ordering::Relaxed) {
                deadline_hit.store(true, Ordering::Relaxed);
                cancel.store(true, Ordering::Relaxed);
            }
        })
    });

    // Shared monitors and mode selectors.
    let disk_diff_stats = Arc::new(StageStats::default());
    let memory_diff_stats = Arc::new(StageStats::default());
    let dedup_stats = Arc::new(StageStats::default());
    let compress_stats = Arc::new(StageStats::default());
    let bandwidth = Arc::new(match cfg.fixed_network_bps {
        Some(bps) => BandwidthMonitor::fixed(bps),
        None => BandwidthMonitor::new(),
    });
    let disk_diff_algo = Arc::new(DiffSelector::new(cfg.mode.disk_diff));
    let memory_diff_algo = Arc::new(DiffSelector::new(cfg.mode.memory_diff));
    let compression = Arc::new(CompressionSelector::new(cfg.mode.compression));
    let disk_diff_active = Arc::new(AtomicUsize::new(cfg.mode.workers.disk_diff));
    let memory_diff_active = Arc::new(AtomicUsize::new(cfg.mode.workers.memory_diff));
    let compress_active = Arc::new(AtomicUsize::new(cfg.mode.workers.compress));

    // Queues.
    let depth = cfg.queue_depth.max(1);
    let (disk_page_tx, disk_page_rx) = bounded::<PageJob>(depth);
    let (mem_page_tx, mem_page_rx) = bounded::<PageJob>(depth);
    let (disk_item_tx, disk_item_rx) = bounded::<DeltaItem>(depth);
    let (mem_item_tx, mem_item_rx) = bounded::<DeltaItem>(depth);
    let (merged_tx, merged_rx) = bounded::<DeltaItem>(depth);
    let (pending_tx, pending_rx) = bounded::<PendingBlob>(depth);
    let (blob_tx, blob_rx) = bounded::<CompressedBlob>(depth);

    // Feeders.
    let disk_feeder = spawn_disk_feeder(
        modified.disk_path.clone(),
        modified.disk_chunks.clone(),
        disk_page_tx,
        Arc::clone(&cancel),
    );
    let memory_feeder = spawn_memory_feeder(modified.memory, mem_page_tx, Arc::clone(&cancel));

    // Diff pools.
    let disk_ctx = Arc::new(DiffContext {
        domain: Domain::Disk,
        base: Some(Arc::clone(&base.disk_map)),
        base_index: Arc::clone(&base.disk_index),
        algorithm: Arc::clone(&disk_diff_algo),
        free_pfns: None,
        apply_free_memory: false,
        stats: Arc::clone(&disk_diff_stats),
        active: Arc::clone(&disk_diff_active),
    });
    let free_pfns = cfg.free_pfn_set.clone().map(Arc::new);
    let memory_ctx = Arc::new(DiffContext {
        domain: Domain::Memory,
        base: Some(Arc::clone(&base.memory_map)),
        base_index: Arc::clone(&base.memory_index),
        algorithm: Arc::clone(&memory_diff_algo),
        free_pfns,
        apply_free_memory: cfg.apply_free_memory,
        stats: Arc::clone(&memory_diff_stats),
        active: Arc::clone(&memory_diff_active),
    });
    let disk_diff_pool =
        spawn_diff_workers(disk_ctx, cfg.mode.workers.disk_diff, disk_page_rx, disk_item_tx);
    let memory_diff_pool =
        spawn_diff_workers(memory_ctx, cfg.mode.workers.memory_diff, mem_page_rx, mem_item_tx);

    // Dedup.
    let dedup_thread = {
        let base_disk = Arc::clone(&base.disk_index);
        let base_mem = Arc::clone(&base.memory_index);
        let stats = Arc::clone(&dedup_stats);
        std::thread::spawn(move || {
            run_dedup(mem_item_rx, disk_item_rx, merged_tx, base_disk, base_mem, stats)
        })
    };

    // Batcher (plus the optional reorder pass, which needs the full list).
    let batcher = spawn_batcher(
        merged_rx,
        pending_tx,
        cfg.blob_size,
        cfg.with_hash,
        cfg.reorder.clone(),
        Arc::clone(&cancel),
    );

    // Compressor pool.
    let compress_pool: Vec<JoinHandle<Result<(), OverlayError>>> = (0..cfg.mode.workers.compress.max(1))
        .map(|worker_idx| {
            let rx = pending_rx.clone();
            let tx = blob_tx.clone();
            let selector = Arc::clone(&compression);
            let stats = Arc::clone(&compress_stats);
            let active = Arc::clone(&compress_active);
            std::thread::spawn(move || {
                while let Ok(pending) = rx.recv() {
                    if worker_idx >= active.load(Ordering::Relaxed) {
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    let t0 = Instant::now();
                    let in_len = pending.payload.len() as u64;
                    let blob = compress_blob(pending, selector.load())?;
                    stats.record(in_len, blob.data.len() as u64, t0.elapsed());
                    if tx.send(blob).is_err() {
                        break;
                    }
                }
                Ok(())
            })
        })
        .collect();
    drop(pending_rx);
    drop(blob_tx);

    // Controller.
    let controller_stop = Arc::new(AtomicBool::new(false));
    let controller = if cfg.adaptive {
        let handles = ControlHandles {
            disk_diff_stats: Arc::clone(&disk_diff_stats),
            memory_diff_stats: Arc::clone(&memory_diff_stats),
            dedup_stats: Arc::clone(&dedup_stats),
            compress_stats: Arc::clone(&compress_stats),
            bandwidth: Arc::clone(&bandwidth),
            disk_diff_algo: Arc::clone(&disk_diff_algo),
            memory_diff_algo: Arc::clone(&memory_diff_algo),
            compression: Arc::clone(&compression),
            disk_diff_active: Arc::clone(&disk_diff_active),
            memory_diff_active: Arc::clone(&memory_diff_active),
            compress_active: Arc::clone(&compress_active),
        };
        let profile = cfg.profile.clone().unwrap_or_else(|| Arc::new(ProfileTable::builtin()));
        Some(spawn_controller(
            handles,
            profile,
            cfg.mode,
            cfg.max_cores,
            Arc::clone(&controller_stop),
        ))
    } else {
        None
    };

    // Sink: restore blob sequence order, write, feed the manifest.  The
    // manifest has exactly one mutator — this loop.
    let mut manifest = OverlayManifest::new(
        cfg.mode.compression,
        cfg.with_hash,
        base.disk_sha256,
        base.memory_sha256,
    );
    let mut bytes_written = 0u64;
    let mut holdback: BTreeMap<u64, CompressedBlob> = BTreeMap::new();
    let mut next_seq = 0u64;
    for blob in blob_rx.iter() {
        holdback.insert(blob.seq, blob);
        while let Some(blob) = holdback.remove(&next_seq) {
            out.write_all(&blob.data)?;
            bytes_written += blob.data.len() as u64;
            bandwidth.record(blob.data.len() as u64);
            manifest.push_blob(&blob);
            next_seq += 1;
        }
    }
    // A non-empty holdback means a compressor died mid-sequence; its error
    // surfaces below at join time.
    if !holdback.is_empty() {
        tracing::warn!(blobs = holdback.len(), "unwritten out-of-sequence blobs at shutdown");
    }
    out.flush()?;
    manifest.compression = compression.load();

    // Tear-down: join every stage, surface the first failure.
    controller_stop.store(true, Ordering::Relaxed);

    let disk_size = join_worker(disk_feeder, "disk feeder")??;
    let memory_size = join_worker(memory_feeder, "memory feeder")??;
    for handle in disk_diff_pool {
        join_worker(handle, "disk diff worker")?;
    }
    for handle in memory_diff_pool {
        join_worker(handle, "memory diff worker")?;
    }
    let dedup = join_worker(dedup_thread, "dedup")?;
    let stats = join_worker(batcher, "batcher")??;
    for handle in compress_pool {
        join_worker(handle, "compressor")??;
    }
    if let Some(handle) = controller {
        join_worker(handle, "controller")?;
    }
    watchdog_done.store(true, Ordering::Relaxed);
    if let Some(handle) = watchdog {
        join_worker(handle, "deadline watchdog")?;
    }

    if deadline_hit.load(Ordering::Relaxed) {
        return Err(OverlayError::DeadlineExceeded);
    }
    if cancel.load(Ordering::Relaxed) {
        return Err(OverlayError::Cancelled);
    }

    manifest.disk_size = disk_size;
    manifest.memory_size = memory_size;

    stats.log_summary();
    tracing::info!(
        blobs = manifest.blobs.len(),
        bytes_written,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "overlay encoded"
    );

    Ok(EncodeReport {
        manifest,
        stats,
        dedup,
        disk_pages_skipped: disk_diff_stats.skipped.load(Ordering::Relaxed),
        memory_pages_skipped: memory_diff_stats.skipped.load(Ordering::Relaxed),
        memory_pages_free: memory_diff_stats.skipped_free.load(Ordering::Relaxed),
        bytes_written,
        elapsed: started.elapsed(),
    })
}

fn join_worker<T>(handle: JoinHandle<T>, stage: &'static str) -> Result<T, OverlayError> {
    handle.join().map_err(|_| OverlayError::WorkerPanic(stage))
}

// ── Feeders ──────────────────────────────────────────────────────────────────

fn spawn_disk_feeder(
    path: PathBuf,
    chunks: Option<Vec<u64>>,
    tx: Sender<PageJob>,
    cancel: Arc<AtomicBool>,
) -> JoinHandle<Result<u64, OverlayError>> {
    std::thread::spawn(move || {
        let mut file = File::open(&path)?;
        let disk_size = file.metadata()?.len();

        let offsets: Box<dyn Iterator<Item = u64>> = match chunks {
            Some(list) => Box::new(list.into_iter().map(|c| c * PAGE_SIZE as u64)),
            None => Box::new((0..disk_size.div_ceil(PAGE_SIZE as u64)).map(|c| c * PAGE_SIZE as u64)),
        };

        let mut page = vec![0u8; PAGE_SIZE];
        for offset in offsets {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            if offset >= disk_size {
                continue;
            }
            file.seek(SeekFrom::Start(offset))?;
            let want = PAGE_SIZE.min((disk_size - offset) as usize);
            file.read_exact(&mut page[..want])?;
            if tx.send(PageJob { offset, data: page[..want].to_vec() }).is_err() {
                break; // downstream gone
            }
        }
        Ok(disk_size)
    })
}

fn spawn_memory_feeder(
    input: MemoryInput,
    tx: Sender<PageJob>,
    cancel: Arc<AtomicBool>,
) -> JoinHandle<Result<u64, OverlayError>> {
    std::thread::spawn(move || {
        let mut reader = match input {
            MemoryInput::Framed(mut r) => {
                parse_ram_header(&mut r)?;
                r
            }
            MemoryInput::Payload(r) => r,
        };

        let mut offset = 0u64;
        loop {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            let page = reader.read_up_to(PAGE_SIZE).to_vec();
            if page.is_empty() {
                break;
            }
            let len = page.len() as u64;
            if tx.send(PageJob { offset, data: page }).is_err() {
                break;
            }
            offset += len;
            if len < PAGE_SIZE as u64 {
                break; // short final page ends the payload
            }
        }
        Ok(offset)
    })
}

// ── Batcher ──────────────────────────────────────────────────────────────────

fn spawn_batcher(
    rx: Receiver<DeltaItem>,
    tx: Sender<PendingBlob>,
    blob_size: usize,
    with_hash: bool,
    reorder_pass: ReorderPass,
    cancel: Arc<AtomicBool>,
) -> JoinHandle<Result<DeltaStats, OverlayError>> {
    std::thread::spawn(move || {
        let mut stats = DeltaStats::default();
        let mut builder = BlobBuilder::new(blob_size, with_hash);

        let mut feed = |item: &DeltaItem,
                        builder: &mut BlobBuilder,
                        stats: &mut DeltaStats|
         -> Result<bool, OverlayError> {
            stats.record(item, with_hash);
            if let Some(pending) = builder.push(item)? {
                if tx.send(pending).is_err() {
                    return Ok(false);
                }
            }
            Ok(true)
        };

        match reorder_pass {
            ReorderPass::None => {
                for item in rx.iter() {
                    if cancel.load(Ordering::Relaxed) {
                        // Keep draining so upstream stages can finish.
                        continue;
                    }
                    if !feed(&item, &mut builder, &mut stats)? {
                        return Ok(stats);
                    }
                }
            }
            pass => {
                let mut items: Vec<DeltaItem> = rx.iter().collect();
                if !cancel.load(Ordering::Relaxed) {
                    match pass {
                        ReorderPass::Linear => reorder::reorder_linear(&mut items)?,
                        ReorderPass::Access(access) => {
                            reorder::reorder_by_access(&access, &mut items)?
                        }
                        ReorderPass::None => unreachable!(),
                    }
                    for item in &items {
                        if !feed(item, &mut builder, &mut stats)? {
                            return Ok(stats);
                        }
                    }
                }
            }
        }

        // Flush the final partial blob regardless of size.
        if let Some(pending) = builder.take() {
            let _ = tx.send(pending);
        }
        Ok(stats)
    })
}
