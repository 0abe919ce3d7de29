//! Delta-list reordering for access locality.
//!
//! Both passes permute the full item list without adding or dropping
//! anything, and both preserve the one ordering rule of the stream: a
//! `SELF(j)` consumer must stay behind its producer.  Reordering requires
//! the whole list in memory; streaming mode skips it and accepts the
//! locality penalty at reconstruction.

use std::collections::HashMap;

use crate::delta::{page_index, DeltaError, DeltaItem, DeltaRef, Domain, PAGE_SIZE};

/// Sort by `(domain, offset)` for sequential writes on the receiver, then
/// hoist every self-reference producer back in front of its first consumer.
pub fn reorder_linear(items: &mut Vec<DeltaItem>) -> Result<(), DeltaError> {
    let before = fingerprint_of_list(items);

    items.sort_by_key(|item| (item.domain as u8, item.offset));

    let mut i = 0;
    while i < items.len() {
        if let DeltaRef::SelfRef(producer_index) = items[i].reference {
            let producer_pos = items.iter().position(|it| it.index() == producer_index);
            if let Some(q) = producer_pos {
                if q > i {
                    let producer = items.remove(q);
                    items.insert(i, producer);
                    // The consumer shifted one slot right; skip past the
                    // hoisted producer.
                }
            }
        }
        i += 1;
    }

    verify_unchanged(items, before)
}

/// Move the accessed memory chunks (and, transitively, their producers) to
/// the front of the list, in access order.
///
/// Chunks that do not appear in the overlay are ignored; everything else
/// keeps its relative `(domain, offset)` order behind the accessed prefix.
pub fn reorder_by_access(access: &[u64], items: &mut Vec<DeltaItem>) -> Result<(), DeltaError> {
    let before = fingerprint_of_list(items);

    items.sort_by_key(|item| (item.domain as u8, item.offset));

    // Walking the access list backwards and pushing to the front yields
    // front-of-list order equal to access order.
    for chunk in access.iter().rev() {
        let target = page_index(Domain::Memory, chunk * PAGE_SIZE as u64);
        let Some(pos) = items.iter().position(|it| it.index() == target) else {
            continue;
        };
        let item = items.remove(pos);
        let producer = match item.reference {
            DeltaRef::SelfRef(j) => Some(j),
            _ => None,
        };
        items.insert(0, item);

        if let Some(j) = producer {
            if let Some(ppos) = items.iter().position(|it| it.index() == j) {
                let prod = items.remove(ppos);
                items.insert(0, prod);
            }
        }
    }

    verify_unchanged(items, before)
}

/// Check the self-reference ordering rule over a finished list.
pub fn self_references_well_formed(items: &[DeltaItem]) -> bool {
    let mut emitted: HashMap<u64, usize> = HashMap::new();
    for (pos, item) in items.iter().enumerate() {
        if let DeltaRef::SelfRef(j) = item.reference {
            match emitted.get(&j) {
                Some(&q) if q < pos => {}
                _ => return false,
            }
        }
        emitted.insert(item.index(), pos);
    }
    true
}

fn fingerprint_of_list(items: &[DeltaItem]) -> (usize, u64) {
    // Length plus an order-independent index sum is enough to catch a
    // dropped or duplicated item.
    (items.len(), items.iter().map(|i| i.index()).fold(0u64, u64::wrapping_add))
}

fn verify_unchanged(items: &[DeltaItem], before: (usize, u64)) -> Result<(), DeltaError> {
    let after = fingerprint_of_list(items);
    if before != after {
        return Err(DeltaError::ReorderChanged { before: before.0, after: after.0 });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(domain: Domain, offset: u64, reference: DeltaRef) -> DeltaItem {
        DeltaItem {
            domain,
            offset,
            length: PAGE_SIZE as u16,
            fingerprint: None,
            reference,
        }
    }

    #[test]
    fn linear_reorder_keeps_producer_first() {
        // Producer lives at a higher offset than its consumer, so a plain
        // offset sort would put the consumer first.
        let producer = item(Domain::Memory, 65536, DeltaRef::Raw(vec![1u8; PAGE_SIZE]));
        let consumer = item(Domain::Memory, 0, DeltaRef::SelfRef(producer.index()));
        let other = item(Domain::Disk, 4096, DeltaRef::Zero);

        let mut list = vec![producer.clone(), consumer.clone(), other];
        reorder_linear(&mut list).unwrap();

        assert_eq!(list.len(), 3);
        assert!(self_references_well_formed(&list));
        let p = list.iter().position(|i| i.index() == producer.index()).unwrap();
        let c = list.iter().position(|i| i.index() == consumer.index()).unwrap();
        assert!(p < c);
    }

    #[test]
    fn access_reorder_moves_chunks_to_front() {
        let a = item(Domain::Memory, 0, DeltaRef::Raw(vec![1u8; PAGE_SIZE]));
        let b = item(Domain::Memory, 4096, DeltaRef::Zero);
        let c = item(Domain::Memory, 8192, DeltaRef::Zero);
        let mut list = vec![a, b, c];

        // Access chunk 2 first, then chunk 0; chunk 7 is absent.
        reorder_by_access(&[2, 0, 7], &mut list).unwrap();

        assert_eq!(list[0].offset, 8192);
        assert_eq!(list[1].offset, 0);
        assert_eq!(list[2].offset, 4096);
    }

    #[test]
    fn access_reorder_drags_producer_along() {
        let producer = item(Domain::Memory, 40960, DeltaRef::Raw(vec![2u8; PAGE_SIZE]));
        let consumer = item(Domain::Memory, 0, DeltaRef::SelfRef(producer.index()));
        let filler = item(Domain::Memory, 4096, DeltaRef::Zero);
        let mut list = vec![producer.clone(), consumer.clone(), filler];

        // Accessing the consumer's chunk must hoist the producer too.
        reorder_by_access(&[0], &mut list).unwrap();

        assert_eq!(list[0].index(), producer.index());
        assert_eq!(list[1].index(), consumer.index());
        assert!(self_references_well_formed(&list));
    }

    #[test]
    fn well_formedness_detects_dangling_and_forward_refs() {
        let producer = item(Domain::Memory, 0, DeltaRef::Raw(vec![1u8; PAGE_SIZE]));
        let consumer = item(Domain::Memory, 4096, DeltaRef::SelfRef(producer.index()));
        assert!(self_references_well_formed(&[producer.clone(), consumer.clone()]));
        // Consumer before producer.
        assert!(!self_references_well_formed(&[consumer.clone(), producer]));
        // Producer missing entirely.
        assert!(!self_references_well_formed(&[consumer]));
    }
}
