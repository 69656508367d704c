//! Long-pointer activation: a backing source that places every superblock
//! in its own 4 GiB window, so parents and children routinely disagree on
//! their upper pointer halves. The sanity checker verifies the
//! pointer-prefix counts and next-block modes on every pass.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use octrie::{Arena, KeyMode, SuperblockSource, Trie};

/// Aligning every superblock to 8 GiB forces each one into a distinct
/// 4 GiB window, which is what the production allocator never does and the
/// long-pointer machinery exists for.
struct SpreadSource;

const SPREAD_ALIGN: usize = 1 << 33;

impl SuperblockSource for SpreadSource {
    fn superblock_alloc(&self, size: usize, _align: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, SPREAD_ALIGN).ok()?;
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn superblock_free(&self, ptr: NonNull<u8>, size: usize, _align: usize) {
        let layout = Layout::from_size_align(size, SPREAD_ALIGN).expect("layout was allocatable");
        dealloc(ptr.as_ptr(), layout);
    }
}

fn spread_trie() -> Trie {
    let arena = Arc::new(Arena::with_source(Box::new(SpreadSource)));
    Trie::with_arena(usize::MAX, KeyMode::LengthPrefixed, arena)
}

#[test]
fn pointer_prefix_nodes_come_and_go() {
    let mut trie = spread_trie();
    // Enough entries under one parent to spill across superblocks.
    let count = 500usize;
    for i in 0..count {
        trie.insert(format!("node/{i:04}").as_bytes(), i).unwrap();
        if i % 64 == 0 {
            trie.check().unwrap();
        }
    }
    trie.check().unwrap();
    let profile = trie.fill_profile();
    assert!(
        profile.pointer_prefix_nodes > 0,
        "spread superblocks must activate pointer-prefix nodes"
    );

    for i in 0..count {
        assert_eq!(trie.find(format!("node/{i:04}").as_bytes()), Some(&i));
    }

    for i in 0..count {
        assert_eq!(trie.erase(format!("node/{i:04}").as_bytes()), Some(i));
        if i % 64 == 0 {
            trie.check().unwrap();
        }
    }
    assert!(trie.is_empty());
    trie.check().unwrap();
    assert_eq!(trie.fill_profile().pointer_prefix_nodes, 0);
}

#[test]
fn mask_nodes_grow_long_next_blocks() {
    let mut trie = spread_trie();
    // Full single-byte fanout converts the root to a mask node whose
    // children land all over the address space.
    for octet in 0..=255u8 {
        trie.insert(&[octet, octet], usize::from(octet)).unwrap();
    }
    trie.check().unwrap();
    let profile = trie.fill_profile();
    assert!(profile.mask_nodes > 0);
    assert!(
        profile.long_next_blocks > 0,
        "crossing children must force long-pointer next-blocks"
    );
    for octet in 0..=255u8 {
        assert_eq!(trie.find(&[octet, octet]), Some(&usize::from(octet)));
    }
    for octet in 0..=255u8 {
        assert_eq!(trie.erase(&[octet, octet]), Some(usize::from(octet)));
        if octet % 32 == 0 {
            trie.check().unwrap();
        }
    }
    assert!(trie.is_empty());
}

#[test]
fn mixed_windows_survive_random_churn() {
    use rand::rngs::StdRng;
    use rand::{Rng, RngCore, SeedableRng};
    use std::collections::BTreeMap;

    let mut rng = StdRng::seed_from_u64(42);
    let mut trie = spread_trie();
    let mut model: BTreeMap<Vec<u8>, usize> = BTreeMap::new();
    for round in 0..4_000usize {
        let len = rng.gen_range(1..8);
        let mut key = vec![0u8; len];
        rng.fill_bytes(&mut key);
        key[0] %= 8;
        if rng.gen_bool(0.6) {
            let (slot, occupied) = trie.insert(&key, round).unwrap();
            if occupied {
                *slot = round;
            }
            model.insert(key, round);
        } else {
            assert_eq!(trie.erase(&key), model.remove(&key));
        }
        if round % 500 == 0 {
            trie.check().unwrap();
        }
    }
    trie.check().unwrap();
    let entries: Vec<(Vec<u8>, usize)> = trie.iter().map(|(k, v)| (k.into_vec(), v)).collect();
    let expect: Vec<(Vec<u8>, usize)> = model.iter().map(|(k, v)| (k.clone(), *v)).collect();
    assert_eq!(entries, expect);
}
