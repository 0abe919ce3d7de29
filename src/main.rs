use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use vmsynth::control::CreationMode;
use vmsynth::pipeline::{encode_overlay, BaseVm, MemoryInput, ModifiedVm, OverlayConfig};
use vmsynth::{
    build_disk_meta, build_memory_meta, reconstruct, CompressAlgorithm, CompressionMode,
    DiffAlgorithm, OverlayManifest, ProfileTable, SnapshotReader,
};

#[derive(Parser)]
#[command(name = "vmsynth", version = "1.0.0", about = "VM hand-off overlay engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hash a base disk image into its companion metadata file
    HashDisk {
        image: PathBuf,
        /// Metadata output path (default: <image>-meta)
        #[arg(short, long)]
        meta: Option<PathBuf>,
    },
    /// Hash a base memory payload into its companion metadata file
    HashMemory {
        image: PathBuf,
        #[arg(short, long)]
        meta: Option<PathBuf>,
    },
    /// Build an overlay from a modified VM against its base
    Encode {
        #[arg(long)]
        base_disk: PathBuf,
        #[arg(long)]
        base_disk_meta: PathBuf,
        #[arg(long)]
        base_mem: PathBuf,
        #[arg(long)]
        base_mem_meta: PathBuf,
        #[arg(long)]
        modified_disk: PathBuf,
        /// Modified memory snapshot (raw payload, or framed with --framed)
        #[arg(long)]
        modified_mem: PathBuf,
        /// The memory file carries the hypervisor framing header
        #[arg(long)]
        framed: bool,
        /// Overlay blob stream output
        #[arg(short, long)]
        output: PathBuf,
        /// Manifest output (default: <output>.manifest)
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Diff algorithm: bsdiff, xor-rle, none
        #[arg(long, default_value = "bsdiff")]
        diff: String,
        /// Compression: lzma, bzip2, gzip
        #[arg(long, default_value = "lzma")]
        compression: String,
        #[arg(long, default_value = "9")]
        level: u32,
        /// Workers per parallel stage
        #[arg(long, default_value = "4")]
        workers: usize,
        /// Target uncompressed blob size in KiB
        #[arg(long, default_value = "1024")]
        blob_size: usize,
        /// Run the adaptive controller
        #[arg(long)]
        adaptive: bool,
        /// Profile table JSON (default: built-in table)
        #[arg(long)]
        profile: Option<PathBuf>,
    },
    /// Reconstruct the modified VM from base + overlay
    Decode {
        #[arg(long)]
        base_disk: PathBuf,
        #[arg(long)]
        base_mem: PathBuf,
        #[arg(long)]
        overlay: PathBuf,
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        out_disk: PathBuf,
        #[arg(long)]
        out_mem: PathBuf,
        /// Write chunk-id notifications to this pipe/file
        #[arg(long)]
        notify: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        // ── Hashing ──────────────────────────────────────────────────────────
        Commands::HashDisk { image, meta } => {
            let meta = meta.unwrap_or_else(|| default_meta_path(&image));
            let sha = build_disk_meta(&image, &meta)?;
            println!("Hashed {} -> {}", image.display(), meta.display());
            println!("  image sha256: {}", hex::encode(sha));
        }
        Commands::HashMemory { image, meta } => {
            let meta = meta.unwrap_or_else(|| default_meta_path(&image));
            let sha = build_memory_meta(&image, &meta)?;
            println!("Hashed {} -> {}", image.display(), meta.display());
            println!("  image sha256: {}", hex::encode(sha));
        }

        // ── Encode ───────────────────────────────────────────────────────────
        Commands::Encode {
            base_disk,
            base_disk_meta,
            base_mem,
            base_mem_meta,
            modified_disk,
            modified_mem,
            framed,
            output,
            manifest,
            diff,
            compression,
            level,
            workers,
            blob_size,
            adaptive,
            profile,
        } => {
            let base = BaseVm::load(&base_disk, &base_disk_meta, &base_mem, &base_mem_meta)?;

            let diff = DiffAlgorithm::from_name(&diff)
                .ok_or_else(|| format!("unknown diff algorithm '{diff}'"))?;
            let algorithm = CompressAlgorithm::from_name(&compression)
                .ok_or_else(|| format!("unknown compression '{compression}'"))?;

            let mut mode = CreationMode::default();
            mode.disk_diff = diff;
            mode.memory_diff = diff;
            mode.compression = CompressionMode::new(algorithm, level);
            mode.workers.disk_diff = workers;
            mode.workers.memory_diff = workers;
            mode.workers.compress = workers;

            let profile = match profile {
                Some(path) => Some(Arc::new(ProfileTable::from_json(&std::fs::read(path)?)?)),
                None => None,
            };
            let cfg = OverlayConfig {
                mode,
                blob_size: blob_size * 1024,
                adaptive,
                profile,
                ..OverlayConfig::default()
            };

            let mem_reader = SnapshotReader::from_bytes(std::fs::read(&modified_mem)?);
            let modified = ModifiedVm {
                disk_path: modified_disk,
                memory: if framed {
                    MemoryInput::Framed(mem_reader)
                } else {
                    MemoryInput::Payload(mem_reader)
                },
                disk_chunks: None,
            };

            let manifest_path =
                manifest.unwrap_or_else(|| output.with_extension("overlay.manifest"));
            let mut out = BufWriter::new(File::create(&output)?);
            let report = encode_overlay(&base, modified, cfg, &mut out)?;
            out.flush()?;
            report.manifest.write_file(&manifest_path)?;

            println!("Overlay: {}  ({} B in {} blobs)",
                output.display(), report.bytes_written, report.manifest.blobs.len());
            println!("Manifest: {}", manifest_path.display());
            println!(
                "  dedup: zero={} base_disk={} base_mem={} self={}",
                report.dedup.n_zero,
                report.dedup.n_base_disk,
                report.dedup.n_base_mem,
                report.dedup.n_self,
            );
            println!(
                "  skipped: disk={} memory={} free={}",
                report.disk_pages_skipped, report.memory_pages_skipped, report.memory_pages_free,
            );
        }

        // ── Decode ───────────────────────────────────────────────────────────
        Commands::Decode {
            base_disk,
            base_mem,
            overlay,
            manifest,
            out_disk,
            out_mem,
            notify,
        } => {
            let manifest = OverlayManifest::read_file(&manifest)?;
            let mut overlay = File::open(&overlay)?;
            let mut notify_file = match notify {
                Some(path) => Some(File::create(path)?),
                None => None,
            };
            let notify_ref: Option<&mut dyn Write> =
                notify_file.as_mut().map(|f| f as &mut dyn Write);

            let report = reconstruct(
                &base_disk,
                &base_mem,
                &manifest,
                &mut overlay,
                &out_disk,
                &out_mem,
                notify_ref,
            )?;
            println!(
                "Recovered {} pages ({} disk, {} memory) from {} blobs",
                report.items, report.disk_items, report.memory_items, report.blobs,
            );
            println!("  disk:   {}", out_disk.display());
            println!("  memory: {}", out_mem.display());
        }
    }

    Ok(())
}

fn default_meta_path(image: &PathBuf) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push("-meta");
    PathBuf::from(name)
}
