//! # vmsynth — VM hand-off engine for cloudlet offloading
//!
//! Turns the live state of a running VM (paged memory snapshot + raw disk
//! image) into a compact binary overlay relative to an immutable base VM,
//! and reconstructs an exact byte-identical modified VM on the other side.
//!
//! Pipeline guarantees (frozen for overlay format v1):
//! - The universal unit of work is the 4 KiB aligned page; only the final
//!   memory page may be short
//! - All wire fields are big-endian; the tag byte packs domain (low nibble)
//!   and ref kind (high nibble) — see `delta.rs` for the frozen codes
//! - Page fingerprints are SHA-256 over the actual page range
//! - Dedup priority is fixed (ZERO, then base catalogs, then self) so both
//!   endpoints make identical decisions
//! - A `SELF` consumer never precedes its producer in the emitted stream,
//!   through batching, parallel compression, and reordering alike
//! - Blobs are independently decompressible; compression mode is recorded
//!   per blob in the manifest, never negotiated inline
//! - Decode failures are fatal and delete partial outputs — a half-recovered
//!   image is never left behind

pub mod delta;
pub mod catalog;
pub mod snapshot;
pub mod diff;
pub mod dedup;
pub mod reorder;
pub mod compress;
pub mod manifest;
pub mod control;
pub mod pipeline;
pub mod recover;
pub mod residue;

// Flat re-exports for the most common types.
pub use delta::{page_index, DeltaError, DeltaItem, DeltaRef, Domain, PAGE_SIZE};
pub use catalog::{build_disk_meta, build_memory_meta, BaseHashIndex, CatalogError};
pub use snapshot::{parse_ram_header, RamLayout, SnapshotError, SnapshotReader};
pub use diff::{apply_patch, diff_page, DiffAlgorithm};
pub use dedup::{DedupCounters, SelfHashIndex};
pub use compress::{CompressAlgorithm, CompressionMode, CodecError, DEFAULT_BLOB_SIZE};
pub use manifest::{BlobEntry, OverlayManifest};
pub use control::{CreationMode, ProfileTable, StageWorkers};
pub use pipeline::{
    encode_overlay, BaseVm, EncodeReport, MemoryInput, ModifiedVm, OverlayConfig, OverlayError,
    ReorderPass,
};
pub use recover::{reconstruct, RecoverError, RecoverReport, END_OF_PIPE};
pub use residue::{diff_residue, merge_residue, ResidueError};
