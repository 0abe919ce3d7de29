//! Adaptive scheduling: stage monitors, the mode profile table, and the
//! controller that keeps system output rate matched to the network.
//!
//! Every stage updates a shared [`StageStats`] block as it processes items.
//! The controller ticks every ~100 ms, derives each stage's per-byte cost
//! `p` (busy seconds per input byte) and ratio `r` (output/input bytes),
//! both cumulative and over the last tick window, and estimates
//!
//! ```text
//! P_total = Σ p_i · parallelism_i
//! R_total = Π r_i
//! system_throughput_bps = (cores_total / P_total) / R_total
//! ```
//!
//! After a warm-up of 20 ticks it consults the profile table roughly every
//! 2 s: the cheapest mode whose calibrated expected throughput covers the
//! measured network bandwidth wins.  With no matching mode it falls back
//! to scaling worker counts linearly with `network / system`, clamped to
//! `[1, max_cores]`.  Mode changes are applied through shared selectors, so
//! compression swaps take effect at the next blob boundary and diff swaps
//! at the next page boundary.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::compress::{CompressAlgorithm, CompressionMode, CompressionSelector};
use crate::diff::{DiffAlgorithm, DiffSelector};

/// Controller tick period.
pub const TICK: Duration = Duration::from_millis(100);

/// Ticks to wait before the first mode decision.
pub const WARMUP_TICKS: u32 = 20;

/// Ticks between profile consultations after warm-up (~2 s).
pub const DECISION_TICKS: u32 = 20;

// ── Stage monitoring ─────────────────────────────────────────────────────────

/// Lock-free counters one pipeline stage updates as it works.
#[derive(Debug, Default)]
pub struct StageStats {
    pub in_bytes:     AtomicU64,
    pub out_bytes:    AtomicU64,
    pub busy_ns:      AtomicU64,
    pub items:        AtomicU64,
    /// Pages dropped by the unchanged-page fast path.
    pub skipped:      AtomicU64,
    /// Pages dropped by the free-memory predicate.
    pub skipped_free: AtomicU64,
}

impl StageStats {
    pub fn record(&self, in_bytes: u64, out_bytes: u64, busy: Duration) {
        self.in_bytes.fetch_add(in_bytes, Ordering::Relaxed);
        self.out_bytes.fetch_add(out_bytes, Ordering::Relaxed);
        self.busy_ns.fetch_add(busy.as_nanos() as u64, Ordering::Relaxed);
        self.items.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self, bytes: u64) {
        self.in_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free_skip(&self, bytes: u64) {
        self.in_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.skipped_free.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            in_bytes:  self.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            busy_ns:   self.busy_ns.load(Ordering::Relaxed),
            items:     self.items.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    pub in_bytes:  u64,
    pub out_bytes: u64,
    pub busy_ns:   u64,
    pub items:     u64,
}

impl StatsSnapshot {
    /// Per-byte cost in seconds, or `None` before any input arrived.
    pub fn time_block(&self) -> Option<f64> {
        (self.in_bytes > 0).then(|| self.busy_ns as f64 / 1e9 / self.in_bytes as f64)
    }

    /// Output/input byte ratio, or `None` before any input arrived.
    pub fn ratio_block(&self) -> Option<f64> {
        (self.in_bytes > 0).then(|| self.out_bytes as f64 / self.in_bytes as f64)
    }

    /// Counters accumulated since `earlier` (the last tick window).
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            in_bytes:  self.in_bytes.saturating_sub(earlier.in_bytes),
            out_bytes: self.out_bytes.saturating_sub(earlier.out_bytes),
            busy_ns:   self.busy_ns.saturating_sub(earlier.busy_ns),
            items:     self.items.saturating_sub(earlier.items),
        }
    }
}

/// Downstream bandwidth observation, fed by the sink.
#[derive(Debug)]
pub struct BandwidthMonitor {
    bytes:      AtomicU64,
    started_ns: AtomicU64,
    /// Fixed bits/sec for non-network destinations (local disk), bit-cast.
    fixed_bps:  AtomicU64,
    epoch:      Instant,
}

impl BandwidthMonitor {
    pub fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            started_ns: AtomicU64::new(0),
            fixed_bps: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Report a constant bandwidth instead of measuring (the original used
    /// a fixed 200 MB/s figure when writing to local disk).
    pub fn fixed(bits_per_sec: f64) -> Self {
        let m = Self::new();
        m.fixed_bps.store(bits_per_sec.to_bits(), Ordering::Relaxed);
        m
    }

    pub fn record(&self, bytes: u64) {
        if self.started_ns.load(Ordering::Relaxed) == 0 {
            let now = self.epoch.elapsed().as_nanos() as u64;
            self.started_ns.store(now.max(1), Ordering::Relaxed);
        }
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Observed (or fixed) bandwidth in bits/sec; `None` before first write.
    pub fn bits_per_sec(&self) -> Option<f64> {
        let fixed = f64::from_bits(self.fixed_bps.load(Ordering::Relaxed));
        if fixed > 0.0 {
            return Some(fixed);
        }
        let started = self.started_ns.load(Ordering::Relaxed);
        if started == 0 {
            return None;
        }
        let elapsed = (self.epoch.elapsed().as_nanos() as u64).saturating_sub(started) as f64 / 1e9;
        if elapsed <= 0.0 {
            return None;
        }
        Some(self.bytes.load(Ordering::Relaxed) as f64 * 8.0 / elapsed)
    }
}

impl Default for BandwidthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

// ── Mode space ───────────────────────────────────────────────────────────────

/// Per-stage worker counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageWorkers {
    pub disk_diff:   usize,
    pub memory_diff: usize,
    pub compress:    usize,
}

impl Default for StageWorkers {
    fn default() -> Self {
        Self { disk_diff: 4, memory_diff: 4, compress: 4 }
    }
}

/// One point in the overlay creation mode space: what the controller tunes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CreationMode {
    pub disk_diff:   DiffAlgorithm,
    pub memory_diff: DiffAlgorithm,
    pub compression: CompressionMode,
    pub workers:     StageWorkers,
}

impl Default for CreationMode {
    fn default() -> Self {
        Self {
            disk_diff:   DiffAlgorithm::Bsdiff,
            memory_diff: DiffAlgorithm::Bsdiff,
            compression: CompressionMode::default(),
            workers:     StageWorkers::default(),
        }
    }
}

// ── Profile table ────────────────────────────────────────────────────────────

/// One profiled mode: expected total per-byte cost and total ratio, measured
/// offline on reference hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub mode:    CreationMode,
    pub p_total: f64,
    pub r_total: f64,
}

impl ProfileEntry {
    /// Uncalibrated expected throughput on `cores` cores, in bits/sec.
    pub fn expected_bps(&self, cores: f64) -> f64 {
        (cores / self.p_total) / self.r_total * 8.0
    }
}

/// Immutable mode lookup handed to the controller at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileTable {
    pub entries: Vec<ProfileEntry>,
}

/// Result of a profile consultation.
#[derive(Debug, Clone)]
pub enum ModeDecision {
    /// A profiled mode covers the network; switch to it.
    Matched(ProfileEntry),
    /// Nothing matches; scale cores by `network / system`.
    BestEffort,
}

impl ProfileTable {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Built-in table spanning the diff × compression × level mode space.
    ///
    /// The per-unit costs are reference-hardware measurements; at runtime
    /// every expectation is calibrated by the observed/predicted ratio of
    /// the current mode, so absolute accuracy matters less than ordering.
    pub fn builtin() -> Self {
        // (algorithm, seconds-per-byte at level 1, ratio at level 1)
        let comp = [
            (CompressAlgorithm::Gzip,  9.0e-9, 0.48),
            (CompressAlgorithm::Bzip2, 5.5e-8, 0.42),
            (CompressAlgorithm::Lzma,  1.4e-7, 0.36),
        ];
        let diff = [
            (DiffAlgorithm::None,   4.0e-9, 1.00),
            (DiffAlgorithm::XorRle, 9.0e-9, 0.80),
            (DiffAlgorithm::Bsdiff, 1.1e-7, 0.55),
        ];

        let mut entries = Vec::new();
        for (d, d_p, d_r) in diff {
            for (c, c_p, c_r) in comp {
                for level in [1u32, 3, 5, 7, 9] {
                    // Higher levels cost more time and squeeze a bit more.
                    let scale = 1.0 + 0.35 * (level - 1) as f64;
                    let p_comp = c_p * scale;
                    let r_comp = c_r * (1.0 - 0.015 * (level - 1) as f64);
                    let workers = StageWorkers::default();
                    let p_total = d_p * (workers.disk_diff + workers.memory_diff) as f64
                        + p_comp * workers.compress as f64;
                    let r_total = d_r * r_comp;
                    entries.push(ProfileEntry {
                        mode: CreationMode {
                            disk_diff: d,
                            memory_diff: d,
                            compression: CompressionMode::new(c, level),
                            workers,
                        },
                        p_total,
                        r_total,
                    });
                }
            }
        }
        Self { entries }
    }

    /// Pick the cheapest mode whose calibrated expected throughput covers
    /// the network bandwidth.
    ///
    /// `calibration` is `measured_system_bps / predicted_bps_of_current_mode`
    /// and corrects the reference-hardware numbers for this machine.
    pub fn select(&self, cores: f64, calibration: f64, network_bps: f64) -> ModeDecision {
        let calibration = if calibration.is_finite() && calibration > 0.0 {
            calibration
        } else {
            1.0
        };
        let mut best: Option<&ProfileEntry> = None;
        for entry in &self.entries {
            if entry.expected_bps(cores) * calibration < network_bps {
                continue;
            }
            // Cheapest = lowest CPU spend among the qualifying modes.
            match best {
                Some(b) if b.p_total <= entry.p_total => {}
                _ => best = Some(entry),
            }
        }
        match best {
            Some(entry) => ModeDecision::Matched(entry.clone()),
            None => ModeDecision::BestEffort,
        }
    }
}

// ── Controller ───────────────────────────────────────────────────────────────

/// Shared handles through which the controller retunes the running pipeline.
pub struct ControlHandles {
    pub disk_diff_stats:   Arc<StageStats>,
    pub memory_diff_stats: Arc<StageStats>,
    pub dedup_stats:       Arc<StageStats>,
    pub compress_stats:    Arc<StageStats>,
    pub bandwidth:         Arc<BandwidthMonitor>,
    pub disk_diff_algo:    Arc<DiffSelector>,
    pub memory_diff_algo:  Arc<DiffSelector>,
    pub compression:       Arc<CompressionSelector>,
    /// Active-worker knobs: disk diff, memory diff, compress.
    pub disk_diff_active:   Arc<AtomicUsize>,
    pub memory_diff_active: Arc<AtomicUsize>,
    pub compress_active:    Arc<AtomicUsize>,
}

/// Spawn the supervisor thread.  It runs until `stop` is set.
pub fn spawn_controller(
    handles: ControlHandles,
    profile: Arc<ProfileTable>,
    mut mode: CreationMode,
    max_cores: usize,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let cores_total = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(max_cores.max(1)) as f64;

        let mut tick: u32 = 0;
        let mut prev = [StatsSnapshot::default(); 4];
        let mut mode_changed_once = false;

        while !stop.load(Ordering::Relaxed) {
            std::thread::sleep(TICK);
            tick += 1;

            let stages = [
                &handles.disk_diff_stats,
                &handles.memory_diff_stats,
                &handles.dedup_stats,
                &handles.compress_stats,
            ];
            let parallelism = [
                handles.disk_diff_active.load(Ordering::Relaxed) as f64,
                handles.memory_diff_active.load(Ordering::Relaxed) as f64,
                1.0, // dedup is single-threaded
                handles.compress_active.load(Ordering::Relaxed) as f64,
            ];

            let snaps: Vec<StatsSnapshot> = stages.iter().map(|s| s.snapshot()).collect();
            let cur: Vec<StatsSnapshot> =
                snaps.iter().zip(prev.iter()).map(|(now, old)| now.since(old)).collect();
            prev.copy_from_slice(&snaps);

            let Some((_p_total, _r_total, _bps)) = totals(&snaps, &parallelism, cores_total) else {
                continue; // some stage has no input yet
            };
            let Some((p_cur, r_cur, system_bps_cur)) = totals(&cur, &parallelism, cores_total) else {
                continue;
            };
            let Some(network_bps) = handles.bandwidth.bits_per_sec() else {
                continue;
            };

            tracing::debug!(
                tick,
                system_mbps = system_bps_cur / 1e6,
                network_mbps = network_bps / 1e6,
                p_total = p_cur,
                r_total = r_cur,
                "throughput"
            );

            if tick < WARMUP_TICKS || tick % DECISION_TICKS != 0 || mode_changed_once {
                continue;
            }

            // Calibrate the profile's reference numbers by how the current
            // mode actually performs here.
            let calibration = profile
                .entries
                .iter()
                .find(|e| e.mode == mode)
                .map(|e| system_bps_cur / e.expected_bps(cores_total))
                .unwrap_or(1.0);

            match profile.select(cores_total, calibration, network_bps) {
                ModeDecision::Matched(entry) => {
                    if entry.mode != mode {
                        apply_mode(&handles, &entry.mode);
                        tracing::info!(
                            disk_diff = entry.mode.disk_diff.name(),
                            memory_diff = entry.mode.memory_diff.name(),
                            compression = entry.mode.compression.algorithm.name(),
                            level = entry.mode.compression.level,
                            "mode change"
                        );
                        mode = entry.mode;
                        mode_changed_once = true;
                    }
                }
                ModeDecision::BestEffort => {
                    let ratio = network_bps / system_bps_cur;
                    let cur_cores = handles.compress_active.load(Ordering::Relaxed);
                    let wanted = if ratio > 1.0 {
                        ((cur_cores as f64 * ratio).ceil() as usize).min(max_cores.max(1))
                    } else {
                        ((cur_cores as f64 * ratio).floor() as usize).max(1)
                    };
                    if wanted != cur_cores {
                        tracing::debug!(from = cur_cores, to = wanted, "retarget cores");
                        handles.disk_diff_active.store(wanted, Ordering::Relaxed);
                        handles.memory_diff_active.store(wanted, Ordering::Relaxed);
                        handles.compress_active.store(wanted, Ordering::Relaxed);
                        mode.workers = StageWorkers {
                            disk_diff: wanted,
                            memory_diff: wanted,
                            compress: wanted,
                        };
                    }
                }
            }
        }
    })
}

/// `(P_total, R_total, estimated bits/sec)` over one set of snapshots, or
/// `None` when any stage has not processed input yet.
fn totals(snaps: &[StatsSnapshot], parallelism: &[f64], cores: f64) -> Option<(f64, f64, f64)> {
    let mut p_total = 0.0;
    let mut r_total = 1.0;
    for (snap, par) in snaps.iter().zip(parallelism) {
        let p = snap.time_block()?;
        let r = snap.ratio_block()?;
        if p <= 0.0 || r <= 0.0 {
            return None;
        }
        p_total += p * par;
        r_total *= r;
    }
    let bps = (cores / p_total) / r_total * 8.0;
    Some((p_total, r_total, bps))
}

fn apply_mode(handles: &ControlHandles, mode: &CreationMode) {
    handles.disk_diff_algo.store(mode.disk_diff);
    handles.memory_diff_algo.store(mode.memory_diff);
    handles.compression.store(mode.compression);
    handles.disk_diff_active.store(mode.workers.disk_diff, Ordering::Relaxed);
    handles.memory_diff_active.store(mode.workers.memory_diff, Ordering::Relaxed);
    handles.compress_active.store(mode.workers.compress, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_windows_subtract() {
        let stats = StageStats::default();
        stats.record(1000, 500, Duration::from_millis(10));
        let first = stats.snapshot();
        stats.record(1000, 400, Duration::from_millis(30));
        let second = stats.snapshot();

        let window = second.since(&first);
        assert_eq!(window.in_bytes, 1000);
        assert_eq!(window.out_bytes, 400);
        assert_eq!(window.items, 1);
    }

    #[test]
    fn per_byte_cost_and_ratio() {
        let stats = StageStats::default();
        stats.record(4096, 2048, Duration::from_micros(100));
        let snap = stats.snapshot();
        let p = snap.time_block().unwrap();
        assert!((p - 100e-6 / 4096.0).abs() < 1e-12);
        assert!((snap.ratio_block().unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn builtin_profile_covers_mode_space() {
        let table = ProfileTable::builtin();
        assert_eq!(table.entries.len(), 3 * 3 * 5);
        // Heavier compression never reports a better ratio at equal settings.
        let gz1 = table.entries.iter()
            .find(|e| e.mode.compression == CompressionMode::new(CompressAlgorithm::Gzip, 1)
                 && e.mode.disk_diff == DiffAlgorithm::None)
            .unwrap();
        let gz9 = table.entries.iter()
            .find(|e| e.mode.compression == CompressionMode::new(CompressAlgorithm::Gzip, 9)
                 && e.mode.disk_diff == DiffAlgorithm::None)
            .unwrap();
        assert!(gz9.r_total < gz1.r_total);
        assert!(gz9.p_total > gz1.p_total);
    }

    #[test]
    fn select_prefers_cheapest_qualifying_mode() {
        let table = ProfileTable::builtin();
        // A slow network: many modes qualify, the cheapest CPU-wise wins.
        let decision = table.select(4.0, 1.0, 1e6);
        match decision {
            ModeDecision::Matched(entry) => {
                for other in &table.entries {
                    if other.expected_bps(4.0) >= 1e6 {
                        assert!(entry.p_total <= other.p_total);
                    }
                }
            }
            ModeDecision::BestEffort => panic!("a 1 Mbit/s network must be coverable"),
        }
    }

    #[test]
    fn select_falls_back_when_network_outruns_everything() {
        let table = ProfileTable::builtin();
        assert!(matches!(table.select(4.0, 1.0, 1e15), ModeDecision::BestEffort));
    }

    #[test]
    fn fixed_bandwidth_monitor() {
        let m = BandwidthMonitor::fixed(200.0 * 1024.0 * 1024.0 * 8.0);
        assert_eq!(m.bits_per_sec(), Some(200.0 * 1024.0 * 1024.0 * 8.0));
    }

    #[test]
    fn profile_table_json_roundtrip() {
        let table = ProfileTable::builtin();
        let json = table.to_json().unwrap();
        let back = ProfileTable::from_json(&json).unwrap();
        assert_eq!(back.entries.len(), table.entries.len());
    }
}
