use octrie::Trie;

#[test]
fn nul_terminated_basics() {
    let mut trie = Trie::new_nt(64);
    trie.insert_nt(b"alpha\0", 1).unwrap();
    trie.insert_nt(b"beta\0ignored", 2).unwrap();
    // No terminator: the whole slice is the key.
    trie.insert_nt(b"gamma", 3).unwrap();
    trie.check().unwrap();

    assert_eq!(trie.find_nt(b"alpha\0"), Some(&1));
    assert_eq!(trie.find_nt(b"alpha"), Some(&1));
    assert_eq!(trie.find_nt(b"beta\0whatever"), Some(&2));
    assert_eq!(trie.find_nt(b"gamma\0trailing"), Some(&3));
    assert_eq!(trie.find_nt(b"alp"), None);
    assert_eq!(trie.find_nt(b"alphaz"), None);

    // The stored keys carry no terminator bytes.
    let keys: Vec<Box<[u8]>> = trie.iter().map(|(k, _)| k).collect();
    assert_eq!(
        keys,
        vec![
            Box::from(&b"alpha"[..]),
            Box::from(&b"beta"[..]),
            Box::from(&b"gamma"[..]),
        ]
    );

    assert_eq!(trie.erase_nt(b"beta\0"), Some(2));
    assert_eq!(trie.find_nt(b"beta"), None);
    trie.check().unwrap();
}

#[test]
fn nt_lookup_never_walks_past_a_terminator() {
    let mut trie = Trie::new_nt(64);
    trie.insert_nt(b"prefix", 1).unwrap();
    trie.insert_nt(b"prefix-longer", 2).unwrap();
    trie.check().unwrap();

    // The key ends exactly where the terminator sits, deep inside the
    // stored prefix of the longer entry.
    assert_eq!(trie.find_nt(b"prefix\0-longer"), Some(&1));
    assert_eq!(trie.find_nt(b"prefix-lo\0nger"), None);
    assert_eq!(trie.find_nt(b"prefix-longer\0"), Some(&2));
}
