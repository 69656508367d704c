use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use octrie::{Arena, KeyMode, Trie};

/// Every 2-byte key: exercises the scan-to-mask conversion at full fanout,
/// next-block growth to the 128-byte class, and the way back down.
#[test]
fn all_two_byte_keys() {
    let arena = std::sync::Arc::new(Arena::new());
    let mut trie = Trie::with_arena(1 << 17, KeyMode::LengthPrefixed, arena);
    for first in 0..=255u8 {
        for second in 0..=255u8 {
            let key = [first, second];
            trie.insert(&key, usize::from(first) << 8 | usize::from(second))
                .unwrap();
        }
    }
    assert_eq!(trie.len(), 65_536);
    trie.check().unwrap();

    let profile = trie.fill_profile();
    assert!(profile.mask_nodes > 0, "full fanout must use mask nodes");

    let mut expect = Vec::with_capacity(65_536);
    for first in 0..=255u8 {
        for second in 0..=255u8 {
            expect.push(vec![first, second]);
        }
    }
    let keys: Vec<Vec<u8>> = trie.iter().map(|(k, _)| k.into_vec()).collect();
    assert_eq!(keys, expect);

    // Drop every key with an even first byte.
    for first in (0..=255u8).step_by(2) {
        for second in 0..=255u8 {
            let key = [first, second];
            assert_eq!(
                trie.erase(&key),
                Some(usize::from(first) << 8 | usize::from(second))
            );
        }
    }
    assert_eq!(trie.len(), 32_768);
    trie.check().unwrap();

    let keys: Vec<Vec<u8>> = trie.iter().map(|(k, _)| k.into_vec()).collect();
    let expect: Vec<Vec<u8>> = expect.into_iter().filter(|k| k[0] % 2 == 1).collect();
    assert_eq!(keys, expect);

    for first in (0..=255u8).step_by(2) {
        assert_eq!(trie.find(&[first, 7]), None);
    }
    for first in (1..=255u8).step_by(2) {
        assert_eq!(
            trie.find(&[first, 7]),
            Some(&(usize::from(first) << 8 | 7))
        );
    }
}

#[test]
fn random_keys_against_model() {
    let mut rng = StdRng::seed_from_u64(0x0c7e1e);
    let arena = std::sync::Arc::new(Arena::new());
    let mut trie = Trie::with_arena(usize::MAX, KeyMode::LengthPrefixed, arena);
    let mut model: BTreeMap<Vec<u8>, usize> = BTreeMap::new();

    for round in 0..20_000usize {
        let len = rng.gen_range(0..12);
        let mut key = vec![0u8; len];
        rng.fill_bytes(&mut key);
        // Skew towards a few hot prefixes so splits and merges happen.
        if len > 2 && rng.gen_bool(0.5) {
            key[0] = b'a';
            key[1] = key[1] % 4;
        }

        if rng.gen_bool(0.6) {
            let (slot, occupied) = trie.insert(&key, round).unwrap();
            if occupied {
                *slot = round;
            }
            model.insert(key, round);
        } else {
            assert_eq!(trie.erase(&key), model.remove(&key), "round {round}");
        }

        if round % 2_500 == 0 {
            trie.check().unwrap();
        }
    }
    trie.check().unwrap();
    assert_eq!(trie.len(), model.len());

    for (key, value) in &model {
        assert_eq!(trie.find(key), Some(value));
    }
    let entries: Vec<(Vec<u8>, usize)> = trie.iter().map(|(k, v)| (k.into_vec(), v)).collect();
    let expect: Vec<(Vec<u8>, usize)> = model.iter().map(|(k, v)| (k.clone(), *v)).collect();
    assert_eq!(entries, expect);

    // Longest-prefix queries agree with a linear scan of the model.
    for _ in 0..500 {
        let len = rng.gen_range(0..10);
        let mut probe = vec![0u8; len];
        rng.fill_bytes(&mut probe);
        if len > 2 && rng.gen_bool(0.5) {
            probe[0] = b'a';
            probe[1] = probe[1] % 4;
        }
        let expect = model
            .iter()
            .filter(|(k, _)| probe.starts_with(k))
            .max_by_key(|(k, _)| k.len())
            .map(|(k, v)| (v, k.len()));
        assert_eq!(trie.findnear(&probe), expect);
    }

    for key in model.keys() {
        assert!(trie.erase(key).is_some());
    }
    assert!(trie.is_empty());
    trie.check().unwrap();
}

#[test]
fn dense_shared_prefixes() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut trie = Trie::new(usize::MAX);
    let mut keys = Vec::new();
    for i in 0..4_000usize {
        let key = format!("shared/deep/prefix/{:03}/{}", i % 37, i);
        trie.insert(key.as_bytes(), i).unwrap();
        keys.push(key);
    }
    trie.check().unwrap();
    // Erase in random order, checking as the structure collapses.
    for i in (1..keys.len()).rev() {
        let j = rng.gen_range(0..=i);
        keys.swap(i, j);
    }
    for (i, key) in keys.iter().enumerate() {
        assert!(trie.erase(key.as_bytes()).is_some());
        if i % 500 == 0 {
            trie.check().unwrap();
        }
    }
    assert!(trie.is_empty());
}
