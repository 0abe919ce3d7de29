//! Property tests over the frozen wire format and the patch codecs.

use proptest::prelude::*;
use vmsynth::{apply_patch, diff_page, DeltaItem, DeltaRef, DiffAlgorithm, Domain, PAGE_SIZE};

fn arb_domain() -> impl Strategy<Value = Domain> {
    prop_oneof![Just(Domain::Memory), Just(Domain::Disk)]
}

fn arb_reference() -> impl Strategy<Value = DeltaRef> {
    prop_oneof![
        proptest::collection::vec(any::<u8>(), 0..2048).prop_map(DeltaRef::Raw),
        proptest::collection::vec(any::<u8>(), 1..512).prop_map(DeltaRef::Xdelta),
        Just(DeltaRef::Zero),
        (0u64..1 << 40).prop_map(DeltaRef::BaseDisk),
        (0u64..1 << 40).prop_map(DeltaRef::BaseMem),
        (0u64..1 << 40).prop_map(DeltaRef::SelfRef),
    ]
}

fn arb_item() -> impl Strategy<Value = DeltaItem> {
    (
        arb_domain(),
        0u64..1 << 40,
        1u16..=PAGE_SIZE as u16,
        any::<[u8; 32]>(),
        arb_reference(),
    )
        .prop_map(|(domain, chunk, length, fp, reference)| DeltaItem {
            domain,
            offset: chunk * PAGE_SIZE as u64,
            length,
            fingerprint: Some(fp),
            reference,
        })
}

proptest! {
    #[test]
    fn wire_roundtrip(items in proptest::collection::vec(arb_item(), 0..24), with_hash in any::<bool>()) {
        let mut buf = Vec::new();
        vmsynth::delta::write_list(&items, &mut buf, with_hash).unwrap();
        let back = vmsynth::delta::read_list(&buf[..], with_hash).unwrap();
        // Fingerprints are dropped on the wire unless with_hash is set.
        prop_assert_eq!(back.len(), items.len());
        for (decoded, original) in back.iter().zip(&items) {
            prop_assert_eq!(decoded.domain, original.domain);
            prop_assert_eq!(decoded.offset, original.offset);
            prop_assert_eq!(decoded.length, original.length);
            prop_assert_eq!(&decoded.reference, &original.reference);
            if with_hash {
                prop_assert_eq!(decoded.fingerprint, original.fingerprint);
            } else {
                prop_assert_eq!(decoded.fingerprint, None);
            }
        }
    }

    #[test]
    fn xor_rle_patch_roundtrip(
        base in proptest::collection::vec(any::<u8>(), PAGE_SIZE..=PAGE_SIZE),
        edits in proptest::collection::vec((0usize..PAGE_SIZE, any::<u8>()), 0..64),
    ) {
        let mut page = base.clone();
        for (at, byte) in edits {
            page[at] = byte;
        }
        if let Some(patch) = diff_page(DiffAlgorithm::XorRle, &base, &page) {
            prop_assert!(patch.len() < PAGE_SIZE);
            prop_assert_eq!(apply_patch(&base, &patch).unwrap(), page);
        } else {
            // Only an edit set touching most of the page can defeat the
            // patch size bound.
            prop_assert!(base.iter().zip(&page).filter(|(a, b)| a != b).count() > 512);
        }
    }

    #[test]
    fn bsdiff_patch_roundtrip(
        seed_edit in 0usize..PAGE_SIZE - 64,
    ) {
        let base: Vec<u8> = (0u8..=255).cycle().take(PAGE_SIZE).collect();
        let mut page = base.clone();
        page[seed_edit..seed_edit + 64].fill(0x5A);
        if let Some(patch) = diff_page(DiffAlgorithm::Bsdiff, &base, &page) {
            prop_assert_eq!(apply_patch(&base, &patch).unwrap(), page);
        }
    }
}
