use octrie::{KeyMode, Trie, TrieError};

#[test]
fn single_key() {
    let mut trie = Trie::new(1024);
    trie.insert(b"hello", 1).unwrap();
    assert_eq!(trie.find(b"hello"), Some(&1));
    assert_eq!(trie.find(b"help"), None);
    assert_eq!(trie.find(b"hell"), None);
    assert_eq!(trie.find(b"hello!"), None);
    assert_eq!(trie.len(), 1);
    assert_eq!(trie.max_keylen(), 5);
    trie.check().unwrap();
}

#[test]
fn shared_prefix_fans_out_in_one_node() {
    let mut trie = Trie::new(1024);
    trie.insert(b"hello", 1).unwrap();
    trie.insert(b"help", 2).unwrap();
    trie.insert(b"helm", 3).unwrap();
    trie.check().unwrap();

    // One interior scan node carries the shared "hel" and the three
    // branches; the leaves hang off it.
    let profile = trie.fill_profile();
    assert_eq!(profile.mask_nodes, 0);
    assert_eq!(profile.scan_nodes.iter().sum::<usize>(), 4);

    let entries: Vec<(Box<[u8]>, usize)> = trie.iter().collect();
    assert_eq!(
        entries,
        vec![
            (Box::from(&b"hello"[..]), 1),
            (Box::from(&b"helm"[..]), 3),
            (Box::from(&b"help"[..]), 2),
        ]
    );
}

#[test]
fn findnear_returns_longest_stored_prefix() {
    let mut trie = Trie::new(1024);
    trie.insert(b"a", 1).unwrap();
    trie.insert(b"ab", 2).unwrap();
    trie.insert(b"abc", 3).unwrap();
    trie.check().unwrap();

    assert_eq!(trie.findnear(b"abcd"), Some((&3, 3)));
    assert_eq!(trie.findnear(b"ax"), Some((&1, 1)));
    assert_eq!(trie.findnear(b"abc"), Some((&3, 3)));
    assert_eq!(trie.findnear(b"ab"), Some((&2, 2)));
    assert_eq!(trie.findnear(b"b"), None);
    assert_eq!(trie.findnear(b""), None);
}

#[test]
fn long_prefix_stress() {
    let mut trie = Trie::new(1024);
    let lengths = [1usize, 2, 4, 8, 16, 32, 64, 128, 256];
    for (i, &len) in lengths.iter().enumerate() {
        let key = vec![b'a'; len];
        trie.insert(&key, i).unwrap();
        trie.check().unwrap();
    }
    assert_eq!(trie.len(), lengths.len());
    assert_eq!(trie.max_keylen(), 256);
    for (i, &len) in lengths.iter().enumerate() {
        assert_eq!(trie.find(&vec![b'a'; len]), Some(&i));
    }
    for (i, &len) in lengths.iter().enumerate().rev() {
        let key = vec![b'a'; len];
        assert_eq!(trie.erase(&key), Some(i));
        trie.check().unwrap();
        for (j, &remaining) in lengths.iter().enumerate().take(i) {
            assert_eq!(trie.find(&vec![b'a'; remaining]), Some(&j), "len {remaining}");
        }
        assert_eq!(trie.find(&key), None);
    }
    assert!(trie.is_empty());
    assert_eq!(trie.max_keylen(), 0);
}

#[test]
fn occupied_insert_keeps_the_stored_value() {
    let mut trie = Trie::new(16);
    trie.insert(b"key", 1).unwrap();
    let (slot, occupied) = trie.insert(b"key", 2).unwrap();
    assert!(occupied);
    assert_eq!(*slot, 1);
    *slot = 9;
    assert_eq!(trie.find(b"key"), Some(&9));
    assert_eq!(trie.len(), 1);
}

#[test]
fn capacity_is_enforced() {
    let mut trie = Trie::new(2);
    trie.insert(b"one", 1).unwrap();
    trie.insert(b"two", 2).unwrap();
    assert_eq!(trie.insert(b"three", 3), Err(TrieError::Capacity));
    // An occupied insert is not a new element and still succeeds.
    let (_, occupied) = trie.insert(b"one", 7).unwrap();
    assert!(occupied);
    assert_eq!(trie.len(), 2);
    trie.erase(b"one").unwrap();
    trie.insert(b"three", 3).unwrap();
    assert_eq!(trie.len(), 2);
}

#[test]
fn empty_key_is_a_key() {
    let mut trie = Trie::new(8);
    trie.insert(b"", 42).unwrap();
    assert_eq!(trie.find(b""), Some(&42));
    trie.insert(b"x", 1).unwrap();
    trie.check().unwrap();
    let keys: Vec<Box<[u8]>> = trie.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![Box::from(&b""[..]), Box::from(&b"x"[..])]);
    assert_eq!(trie.erase(b""), Some(42));
    trie.check().unwrap();
}

#[test]
fn insert_erase_restores_structure() {
    let mut trie = Trie::new(1024);
    for (i, key) in [&b"romane"[..], b"romanus", b"romulus", b"rubens", b"ruber"]
        .iter()
        .enumerate()
    {
        trie.insert(key, i).unwrap();
    }
    trie.check().unwrap();
    let before: Vec<(Box<[u8]>, usize)> = trie.iter().collect();

    trie.insert(b"rom", 99).unwrap();
    trie.check().unwrap();
    assert_eq!(trie.erase(b"rom"), Some(99));
    trie.check().unwrap();

    let after: Vec<(Box<[u8]>, usize)> = trie.iter().collect();
    assert_eq!(before, after);
    assert_eq!(trie.erase(b"rom"), None);
}

#[test]
fn iter_prefix_confines_the_walk() {
    let mut trie = Trie::new(64);
    for (i, key) in [
        &b"alpha"[..],
        b"alphabet",
        b"alpine",
        b"beta",
        b"betamax",
        b"gamma",
    ]
    .iter()
    .enumerate()
    {
        trie.insert(key, i).unwrap();
    }
    trie.check().unwrap();

    let alph: Vec<Box<[u8]>> = trie.iter_prefix(b"alph").map(|(k, _)| k).collect();
    assert_eq!(alph, vec![Box::from(&b"alpha"[..]), Box::from(&b"alphabet"[..])]);
    let beta: Vec<Box<[u8]>> = trie.iter_prefix(b"beta").map(|(k, _)| k).collect();
    assert_eq!(beta, vec![Box::from(&b"beta"[..]), Box::from(&b"betamax"[..])]);
    assert_eq!(trie.iter_prefix(b"delta").count(), 0);
    assert_eq!(trie.iter_prefix(b"").count(), 6);
}

#[test]
fn cursor_reports_heap_budget() {
    let mut trie = Trie::new(64);
    trie.insert(b"some key", 1).unwrap();
    assert!(trie.iter_heap_size() > 0);
    let cursor = trie.cursor();
    assert!(cursor.heap_size() >= trie.iter_heap_size() / 2);
}

#[test]
fn clear_returns_everything() {
    let arena = std::sync::Arc::new(octrie::Arena::new());
    {
        let mut trie = Trie::with_arena(4096, KeyMode::LengthPrefixed, arena.clone());
        for i in 0..1000usize {
            trie.insert(format!("key-{i:04}").as_bytes(), i).unwrap();
        }
        trie.check().unwrap();
        assert!(arena.stats().live_bytes > 0);
        trie.clear();
        assert!(trie.is_empty());
        assert_eq!(trie.max_keylen(), 0);
        assert_eq!(trie.find(b"key-0001"), None);
    }
    // Trees dropped: every superblock went back to the source.
    assert_eq!(arena.stats().superblocks, 0);
}

#[test]
fn generic_branch_finder_matches_simd() {
    octrie::set_generic_branch_finder(true);
    let mut trie = Trie::new(4096);
    for i in 0..500usize {
        trie.insert(format!("prefix/{i}").as_bytes(), i).unwrap();
    }
    trie.check().unwrap();
    for i in 0..500usize {
        assert_eq!(trie.find(format!("prefix/{i}").as_bytes()), Some(&i));
    }
    octrie::set_generic_branch_finder(false);
    for i in 0..500usize {
        assert_eq!(trie.find(format!("prefix/{i}").as_bytes()), Some(&i));
    }
}

#[test]
fn extend_bulk_inserts() {
    let mut trie = Trie::new(100);
    trie.extend((0..50usize).map(|i| (format!("k{i}"), i)));
    assert_eq!(trie.len(), 50);
    assert_eq!(trie.find(b"k17"), Some(&17));
}
