//! Residue operations: delta-of-delta for iterative hand-off.
//!
//! After a first overlay has been shipped, later rounds only need what
//! changed since: [`diff_residue`] shrinks a fresh delta list against the
//! previous one, and [`merge_residue`] folds such a residue back over an
//! older list on the receiving side.
//!
//! Residue lists are serialized `with_hash`: the fingerprints are what
//! makes same-page comparison possible without payload decoding.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::delta::{DeltaItem, DeltaRef, Domain, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum ResidueError {
    #[error("previous delta item at offset {offset} has no fingerprint")]
    MissingFingerprint { offset: u64 },
    #[error("memory item at offset {offset} has tail length but the base read came back full")]
    TailNotShort { offset: u64 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Merge ────────────────────────────────────────────────────────────────────

/// Overlay `new` items over `old` by page index.
///
/// A new item for an unseen page is appended.  A new item for an existing
/// page replaces it — and when the replaced item was the producer of
/// self-references, the first surviving consumer is promoted to carry the
/// producer's payload and the remaining consumers are re-pointed at it, so
/// the merged list still resolves without the removed item.
pub fn merge_residue(old: Vec<DeltaItem>, new: Vec<DeltaItem>) -> Vec<DeltaItem> {
    let mut slots: Vec<Option<DeltaItem>> = old.into_iter().map(Some).collect();

    let mut pos_by_index: HashMap<u64, usize> = HashMap::new();
    let mut consumers: HashMap<u64, Vec<u64>> = HashMap::new();
    for (pos, slot) in slots.iter().enumerate() {
        let item = slot.as_ref().unwrap();
        pos_by_index.insert(item.index(), pos);
        if let DeltaRef::SelfRef(producer) = item.reference {
            consumers.entry(producer).or_default().push(item.index());
        }
    }

    let mut new_disk = 0u64;
    let mut new_mem = 0u64;
    let mut overwrite_disk = 0u64;
    let mut overwrite_mem = 0u64;

    let mut appended = Vec::new();
    for new_item in new {
        let Some(pos) = pos_by_index.remove(&new_item.index()) else {
            match new_item.domain {
                Domain::Disk => new_disk += 1,
                Domain::Memory => new_mem += 1,
            }
            appended.push(new_item);
            continue;
        };

        let old_item = slots[pos].take().expect("position map tracks live slots");

        // Hand the dropped producer's payload to its first surviving
        // consumer; consumers always sit behind their producer, so the
        // promoted item stays ahead of the ones re-pointed at it.
        if let Some(referred) = consumers.remove(&old_item.index()) {
            let mut surviving = referred.iter().filter(|&&idx| {
                pos_by_index
                    .get(&idx)
                    .is_some_and(|&p| slots[p].is_some())
            });
            if let Some(&promoted_index) = surviving.next() {
                let remaining: Vec<u64> = surviving.copied().collect();
                let promoted_pos = pos_by_index[&promoted_index];
                {
                    let promoted = slots[promoted_pos].as_mut().unwrap();
                    promoted.reference = old_item.reference.clone();
                    promoted.fingerprint = old_item.fingerprint;
                }
                for idx in &remaining {
                    let p = pos_by_index[idx];
                    if let Some(consumer) = slots[p].as_mut() {
                        consumer.reference = DeltaRef::SelfRef(promoted_index);
                    }
                }
                consumers.insert(promoted_index, remaining);
            }
        }

        match new_item.domain {
            Domain::Disk => overwrite_disk += 1,
            Domain::Memory => overwrite_mem += 1,
        }
        appended.push(new_item);
    }

    tracing::debug!(
        new_disk,
        new_mem,
        overwrite_disk,
        overwrite_mem,
        "residue merged over previous overlay"
    );

    slots.into_iter().flatten().chain(appended).collect()
}

// ── Diff ─────────────────────────────────────────────────────────────────────

/// Reduce `new` against the previous overlay `old`.
///
/// Pages identical to last round (same fingerprint) are dropped; changed
/// pages are kept; memory pages present last round but clean now are
/// reverted to the base — full pages as a `BASE_MEM` reference, the short
/// tail page as raw bytes re-read from the base memory file (the tail's
/// length can change between rounds, so only the base bytes are
/// authoritative).  A full-length read where the tail was expected means
/// the previous item was not the tail at all.
pub fn diff_residue(
    old: &[DeltaItem],
    new: Vec<DeltaItem>,
    base_mem: &Path,
) -> Result<Vec<DeltaItem>, ResidueError> {
    let old_by_index: HashMap<u64, &DeltaItem> =
        old.iter().map(|item| (item.index(), item)).collect();
    let new_indexes: HashSet<u64> = new.iter().map(DeltaItem::index).collect();

    let mut ret = Vec::new();
    let mut created = 0u64;
    let mut overwritten = 0u64;
    let mut identical = 0u64;
    let mut reverted = 0u64;

    for item in new {
        let Some(old_item) = old_by_index.get(&item.index()) else {
            created += 1;
            ret.push(item);
            continue;
        };
        let previous = old_item
            .fingerprint
            .ok_or(ResidueError::MissingFingerprint { offset: old_item.offset })?;
        if item.fingerprint == Some(previous) {
            identical += 1;
        } else {
            overwritten += 1;
            ret.push(item);
        }
    }

    // Pages in the previous overlay that are clean this round went back to
    // their base content.
    let mut base = File::open(base_mem)?;
    for item in old {
        if item.domain == Domain::Disk || new_indexes.contains(&item.index()) {
            continue;
        }

        base.seek(SeekFrom::Start(item.offset))?;
        let mut page = vec![0u8; PAGE_SIZE];
        let got = read_up_to(&mut base, &mut page)?;
        page.truncate(got);

        let reverted_item = if (item.length as usize) != PAGE_SIZE {
            // The snapshot tail: its length is whatever the base holds there.
            if got == PAGE_SIZE {
                return Err(ResidueError::TailNotShort { offset: item.offset });
            }
            DeltaItem {
                domain: item.domain,
                offset: item.offset,
                length: got as u16,
                fingerprint: Some(Sha256::digest(&page).into()),
                reference: DeltaRef::Raw(page),
            }
        } else {
            DeltaItem {
                domain: item.domain,
                offset: item.offset,
                length: PAGE_SIZE as u16,
                fingerprint: Some(Sha256::digest(&page).into()),
                reference: DeltaRef::BaseMem(item.offset),
            }
        };
        ret.push(reverted_item);
        reverted += 1;
    }

    tracing::debug!(created, overwritten, identical, reverted, "residue diffed");
    Ok(ret)
}

fn read_up_to(r: &mut File, buf: &mut [u8]) -> io::Result<usize> {
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
    use crate::reorder::self_references_well_formed;
    use tempfile::tempdir;

    fn raw(domain: Domain, offset: u64, data: Vec<u8>) -> DeltaItem {
        let fp: [u8; 32] = Sha256::digest(&data).into();
        DeltaItem {
            domain,
            offset,
            length: data.len() as u16,
            fingerprint: Some(fp),
            reference: DeltaRef::Raw(data),
        }
    }

    fn self_ref(domain: Domain, offset: u64, producer: u64) -> DeltaItem {
        DeltaItem {
            domain,
            offset,
            length: PAGE_SIZE as u16,
            fingerprint: Some([3u8; 32]),
            reference: DeltaRef::SelfRef(producer),
        }
    }

    #[test]
    fn merge_appends_new_pages_and_overwrites_old() {
        let old = vec![raw(Domain::Disk, 0, vec![1u8; PAGE_SIZE])];
        let new = vec![
            raw(Domain::Disk, 0, vec![2u8; PAGE_SIZE]),
            raw(Domain::Memory, 4096, vec![3u8; PAGE_SIZE]),
        ];
        let merged = merge_residue(old, new.clone());
        assert_eq!(merged, new);
    }

    #[test]
    fn merge_promotes_first_surviving_consumer() {
        let payload = vec![7u8; PAGE_SIZE];
        let producer = raw(Domain::Memory, 0, payload.clone());
        let consumer_a = self_ref(Domain::Memory, 4096, producer.index());
        let consumer_b = self_ref(Domain::Memory, 8192, producer.index());
        let old = vec![producer.clone(), consumer_a.clone(), consumer_b.clone()];

        // The producer's page changed this round.
        let replacement = raw(Domain::Memory, 0, vec![8u8; PAGE_SIZE]);
        let merged = merge_residue(old, vec![replacement.clone()]);

        assert_eq!(merged.len(), 3);
        // First consumer now owns the payload.
        assert_eq!(merged[0].index(), consumer_a.index());
        assert_eq!(merged[0].reference, DeltaRef::Raw(payload));
        // Second consumer points at the promoted one.
        assert_eq!(merged[1].reference, DeltaRef::SelfRef(consumer_a.index()));
        // Replacement goes to the back.
        assert_eq!(merged[2], replacement);
        assert!(self_references_well_formed(&merged));
    }

    #[test]
    fn diff_drops_identical_keeps_changed() {
        let dir = tempdir().unwrap();
        let base_mem = dir.path().join("base.mem");
        std::fs::write(&base_mem, vec![0u8; 4 * PAGE_SIZE]).unwrap();

        let same = raw(Domain::Memory, 0, vec![1u8; PAGE_SIZE]);
        let mut changed_old = raw(Domain::Memory, 4096, vec![2u8; PAGE_SIZE]);
        changed_old.fingerprint = Some([9u8; 32]);
        let changed_new = raw(Domain::Memory, 4096, vec![3u8; PAGE_SIZE]);
        let brand_new = raw(Domain::Disk, 8192, vec![4u8; PAGE_SIZE]);

        let old = vec![same.clone(), changed_old];
        let new = vec![same.clone(), changed_new.clone(), brand_new.clone()];
        let out = diff_residue(&old, new, &base_mem).unwrap();

        assert_eq!(out, vec![changed_new, brand_new]);
    }

    #[test]
    fn diff_reverts_clean_memory_pages_to_base() {
        let dir = tempdir().unwrap();
        let base_mem = dir.path().join("base.mem");
        std::fs::write(&base_mem, vec![0x5Au8; 2 * PAGE_SIZE]).unwrap();

        let gone = raw(Domain::Memory, 4096, vec![1u8; PAGE_SIZE]);
        // Disk items are never reverted by the memory residue pass.
        let disk_gone = raw(Domain::Disk, 0, vec![2u8; PAGE_SIZE]);
        let out = diff_residue(&[gone, disk_gone], Vec::new(), &base_mem).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].reference, DeltaRef::BaseMem(4096));
        assert_eq!(out[0].length as usize, PAGE_SIZE);
        assert!(out[0].fingerprint.is_some());
    }

    #[test]
    fn diff_reverts_short_tail_as_raw() {
        let dir = tempdir().unwrap();
        let base_mem = dir.path().join("base.mem");
        let mut content = vec![0x11u8; PAGE_SIZE];
        content.extend(vec![0x22u8; 1024]); // short tail in the base too
        std::fs::write(&base_mem, &content).unwrap();

        let tail = raw(Domain::Memory, PAGE_SIZE as u64, vec![9u8; 1024]);
        let out = diff_residue(&[tail], Vec::new(), &base_mem).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].length, 1024);
        assert_eq!(out[0].reference, DeltaRef::Raw(vec![0x22u8; 1024]));
    }

    #[test]
    fn diff_rejects_full_read_where_tail_expected() {
        let dir = tempdir().unwrap();
        let base_mem = dir.path().join("base.mem");
        std::fs::write(&base_mem, vec![0u8; 4 * PAGE_SIZE]).unwrap();

        // Claims to be a 1 KiB tail at offset 0, but the base has a full
        // page there.
        let bogus_tail = raw(Domain::Memory, 0, vec![9u8; 1024]);
        let err = diff_residue(&[bogus_tail], Vec::new(), &base_mem).unwrap_err();
        assert!(matches!(err, ResidueError::TailNotShort { offset: 0 }));
    }
}
