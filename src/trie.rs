//! The octet-stride radix tree.
//!
//! [`Trie`] maps arbitrary byte strings to one machine word each. The tree
//! stores compressed prefixes inside its nodes, keeps branch fanout in
//! sorted scan arrays or 256-bit masks depending on density, and allocates
//! every node from a buddy [`Arena`]. There are no parent pointers;
//! mutations and iteration carry an explicit path stack.

pub(crate) mod mask;
pub(crate) mod node;
pub(crate) mod scan;

pub mod check;
pub mod cursor;

use std::sync::Arc;

use arrayvec::ArrayVec;
use log::trace;

use crate::buddy::Arena;
use check::SanityError;
use cursor::{Cursor, Iter};
use node::{
    branch_len, free_scan, has_value, is_long, is_mask, node_size, read_scan, scan_aux,
    scan_child, scan_fits, scan_min_size, scan_octets, scan_prefix, scan_value_ptr, NodePtr,
    ScanParts,
};

pub use node::set_generic_branch_finder;

/// Key discipline, chosen once per tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Keys are passed with an explicit length; zero bytes are ordinary.
    LengthPrefixed,
    /// Keys end at the first zero byte; stored prefixes never contain zero.
    NulTerminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrieError {
    /// The configured element capacity is exhausted.
    Capacity,
    /// The arena's backing allocator is exhausted.
    OutOfMemory,
}

impl std::fmt::Display for TrieError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrieError::Capacity => write!(f, "tree is at its configured capacity"),
            TrieError::OutOfMemory => write!(f, "arena backing allocator exhausted"),
        }
    }
}

impl std::error::Error for TrieError {}

/// One level of a mutation or iteration path: the node, the branch octet
/// taken out of it, and the branch position (mask nodes reuse the octet).
#[derive(Debug, Clone, Copy)]
pub(crate) struct PathElem {
    pub node: NodePtr,
    pub octet: u8,
    pub pos: u8,
}

/// Keys up to this long walk mutation paths on the call stack.
pub(crate) const PATH_STACK_DEPTH: usize = 256;

/// Per-level path storage: automatic for short keys, heap beyond.
pub(crate) enum PathStack {
    Inline(ArrayVec<PathElem, { PATH_STACK_DEPTH + 1 }>),
    Heap(Vec<PathElem>),
}

impl PathStack {
    pub(crate) fn for_keylen(keylen: usize) -> Self {
        if keylen <= PATH_STACK_DEPTH {
            PathStack::Inline(ArrayVec::new())
        } else {
            PathStack::Heap(Vec::with_capacity(keylen + 1))
        }
    }

    pub(crate) fn push(&mut self, elem: PathElem) {
        match self {
            PathStack::Inline(stack) => stack.push(elem),
            PathStack::Heap(stack) => stack.push(elem),
        }
    }

    pub(crate) fn pop(&mut self) -> Option<PathElem> {
        match self {
            PathStack::Inline(stack) => stack.pop(),
            PathStack::Heap(stack) => stack.pop(),
        }
    }

    pub(crate) fn last(&self) -> Option<&PathElem> {
        match self {
            PathStack::Inline(stack) => stack.last(),
            PathStack::Heap(stack) => stack.last(),
        }
    }
}

/// A byte-string keyed map onto machine words.
pub struct Trie {
    root: Option<NodePtr>,
    count: usize,
    capacity: usize,
    max_keylen: usize,
    mode: KeyMode,
    arena: Arc<Arena>,
}

impl Trie {
    /// A length-prefixed tree over the process-wide default arena.
    pub fn new(capacity: usize) -> Self {
        Self::with_arena(capacity, KeyMode::LengthPrefixed, Arena::process_default())
    }

    /// A null-terminated-key tree over the process-wide default arena.
    pub fn new_nt(capacity: usize) -> Self {
        Self::with_arena(capacity, KeyMode::NulTerminated, Arena::process_default())
    }

    pub fn with_arena(capacity: usize, mode: KeyMode, arena: Arc<Arena>) -> Self {
        Trie {
            root: None,
            count: 0,
            capacity,
            max_keylen: 0,
            mode,
            arena,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The configured element capacity.
    pub fn max_size(&self) -> usize {
        self.capacity
    }

    /// The longest key length (in octets) observed since the tree was last
    /// empty.
    pub fn max_keylen(&self) -> usize {
        self.max_keylen
    }

    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub(crate) fn root(&self) -> Option<NodePtr> {
        self.root
    }

    /// Removes every entry and returns all nodes to the arena.
    pub fn clear(&mut self) {
        if let Some(root) = self.root.take() {
            self.free_subtree(root);
        }
        self.count = 0;
        self.max_keylen = 0;
    }

    // ---- lookups ------------------------------------------------------

    pub fn find(&self, key: &[u8]) -> Option<&usize> {
        debug_assert!(self.mode == KeyMode::LengthPrefixed || !key.contains(&0));
        self.descend_value(key).map(|slot| unsafe { &*slot })
    }

    pub fn find_mut(&mut self, key: &[u8]) -> Option<&mut usize> {
        self.descend_value(key).map(|slot| unsafe { &mut *slot })
    }

    /// Null-terminated lookup: the key ends at its first zero byte (or at
    /// the end of the slice). Requires [`KeyMode::NulTerminated`].
    pub fn find_nt(&self, key: &[u8]) -> Option<&usize> {
        assert_eq!(self.mode, KeyMode::NulTerminated);
        self.descend_value_nt(key).map(|slot| unsafe { &*slot })
    }

    /// Longest-prefix match: the value of the longest stored key that is a
    /// prefix of `key`, along with that key's length.
    pub fn findnear(&self, key: &[u8]) -> Option<(&usize, usize)> {
        let mut best: Option<(*mut usize, usize)> = None;
        let mut n = self.root?;
        let mut depth = 0usize;
        loop {
            let h = unsafe { n.header() };
            if is_mask(h) {
                if has_value(h) {
                    best = Some((unsafe { node::mask_value_ptr(n) }, depth));
                }
                if depth == key.len() {
                    break;
                }
                match unsafe { mask::lookup(n, h, key[depth]) } {
                    Some(child) => {
                        n = child;
                        depth += 1;
                    }
                    None => break,
                }
            } else {
                let prefix = unsafe { scan_prefix(n, h) };
                if key.len() - depth < prefix.len() || &key[depth..depth + prefix.len()] != prefix
                {
                    break;
                }
                depth += prefix.len();
                if has_value(h) {
                    best = Some((unsafe { scan_value_ptr(n, h) }, depth));
                }
                if depth == key.len() {
                    break;
                }
                match node::find_branch(unsafe { scan_octets(n, h) }, key[depth]) {
                    Ok(idx) => {
                        n = unsafe { scan_child(n, h, idx) };
                        depth += 1;
                    }
                    Err(_) => break,
                }
            }
        }
        best.map(|(slot, matched)| (unsafe { &*slot }, matched))
    }

    fn descend_value(&self, key: &[u8]) -> Option<*mut usize> {
        let mut n = self.root?;
        let mut depth = 0usize;
        loop {
            let h = unsafe { n.header() };
            if is_mask(h) {
                if depth == key.len() {
                    return has_value(h).then(|| unsafe { node::mask_value_ptr(n) });
                }
                n = unsafe { mask::lookup(n, h, key[depth])? };
                depth += 1;
            } else {
                let prefix = unsafe { scan_prefix(n, h) };
                if key.len() - depth < prefix.len() || &key[depth..depth + prefix.len()] != prefix
                {
                    return None;
                }
                depth += prefix.len();
                if depth == key.len() {
                    return has_value(h).then(|| unsafe { scan_value_ptr(n, h) });
                }
                let idx = node::find_branch(unsafe { scan_octets(n, h) }, key[depth]).ok()?;
                n = unsafe { scan_child(n, h, idx) };
                depth += 1;
            }
        }
    }

    /// The null-terminated descent never scans ahead for the key length: a
    /// zero (or the end of the slice) terminates the key, and stored
    /// prefixes are known to be free of zeros.
    fn descend_value_nt(&self, key: &[u8]) -> Option<*mut usize> {
        let at = |i: usize| -> Option<u8> {
            match key.get(i) {
                Some(&0) | None => None,
                Some(&b) => Some(b),
            }
        };
        let mut n = self.root?;
        let mut depth = 0usize;
        loop {
            let h = unsafe { n.header() };
            if is_mask(h) {
                match at(depth) {
                    None => return has_value(h).then(|| unsafe { node::mask_value_ptr(n) }),
                    Some(octet) => {
                        n = unsafe { mask::lookup(n, h, octet)? };
                        depth += 1;
                    }
                }
            } else {
                for &pb in unsafe { scan_prefix(n, h) } {
                    if at(depth) != Some(pb) {
                        return None;
                    }
                    depth += 1;
                }
                match at(depth) {
                    None => return has_value(h).then(|| unsafe { scan_value_ptr(n, h) }),
                    Some(octet) => {
                        let idx = node::find_branch(unsafe { scan_octets(n, h) }, octet).ok()?;
                        n = unsafe { scan_child(n, h, idx) };
                        depth += 1;
                    }
                }
            }
        }
    }

    // ---- mutation -----------------------------------------------------

    /// Inserts `key`, returning the value slot and whether the key was
    /// already occupied. An occupied insert leaves the stored value
    /// untouched; the caller decides through the returned slot.
    pub fn insert(&mut self, key: &[u8], value: usize) -> Result<(&mut usize, bool), TrieError> {
        debug_assert!(self.mode == KeyMode::LengthPrefixed || !key.contains(&0));
        self.insert_impl(key, value)
    }

    /// Null-terminated insert; the stored key ends at the first zero byte.
    pub fn insert_nt(
        &mut self,
        key: &[u8],
        value: usize,
    ) -> Result<(&mut usize, bool), TrieError> {
        assert_eq!(self.mode, KeyMode::NulTerminated);
        let end = key.iter().position(|&b| b == 0).unwrap_or(key.len());
        self.insert_impl(&key[..end], value)
    }

    /// Removes `key`, returning its value.
    pub fn erase(&mut self, key: &[u8]) -> Option<usize> {
        self.erase_impl(key)
    }

    pub fn erase_nt(&mut self, key: &[u8]) -> Option<usize> {
        assert_eq!(self.mode, KeyMode::NulTerminated);
        let end = key.iter().position(|&b| b == 0).unwrap_or(key.len());
        self.erase_impl(&key[..end])
    }

    fn insert_impl(&mut self, key: &[u8], value: usize) -> Result<(&mut usize, bool), TrieError> {
        let Some(mut n) = self.root else {
            self.check_capacity()?;
            let chain = scan::leaf_chain(&self.arena, key, value)?;
            self.root = Some(chain);
            return self.finish_insert(key);
        };
        let mut path = PathStack::for_keylen(key.len());
        let mut depth = 0usize;
        loop {
            let h = unsafe { n.header() };
            if is_mask(h) {
                if depth == key.len() {
                    if has_value(h) {
                        let slot = unsafe { node::mask_value_ptr(n) };
                        return Ok((unsafe { &mut *slot }, true));
                    }
                    self.check_capacity()?;
                    unsafe {
                        node::mask_value_ptr(n).write(value);
                        n.set_header(h | 1 << 8);
                    }
                    return self.finish_insert(key);
                }
                let octet = key[depth];
                match unsafe { mask::lookup(n, h, octet) } {
                    Some(child) => {
                        path.push(PathElem {
                            node: n,
                            octet,
                            pos: 0,
                        });
                        n = child;
                        depth += 1;
                    }
                    None => {
                        self.check_capacity()?;
                        let chain = scan::leaf_chain(&self.arena, &key[depth + 1..], value)?;
                        mask::insert_branch(&self.arena, n, octet, chain)?;
                        return self.finish_insert(key);
                    }
                }
            } else {
                let prefix = unsafe { scan_prefix(n, h) };
                let rest = &key[depth..];
                let equal = prefix
                    .iter()
                    .zip(rest.iter())
                    .take_while(|(a, b)| a == b)
                    .count();
                if equal < prefix.len() {
                    self.check_capacity()?;
                    self.split_scan(&mut path, n, depth, equal, key, value)?;
                    return self.finish_insert(key);
                }
                depth += prefix.len();
                if depth == key.len() {
                    if has_value(h) {
                        let slot = unsafe { scan_value_ptr(n, h) };
                        return Ok((unsafe { &mut *slot }, true));
                    }
                    self.check_capacity()?;
                    self.scan_set_value(&mut path, n, value)?;
                    return self.finish_insert(key);
                }
                let octet = key[depth];
                match node::find_branch(unsafe { scan_octets(n, h) }, octet) {
                    Ok(idx) => {
                        path.push(PathElem {
                            node: n,
                            octet,
                            pos: idx as u8,
                        });
                        n = unsafe { scan_child(n, h, idx) };
                        depth += 1;
                    }
                    Err(at) => {
                        self.check_capacity()?;
                        self.scan_add_branch(&mut path, n, at, octet, &key[depth + 1..], value)?;
                        return self.finish_insert(key);
                    }
                }
            }
        }
    }

    fn check_capacity(&self) -> Result<(), TrieError> {
        if self.count == self.capacity {
            return Err(TrieError::Capacity);
        }
        Ok(())
    }

    fn finish_insert(&mut self, key: &[u8]) -> Result<(&mut usize, bool), TrieError> {
        self.count += 1;
        self.max_keylen = self.max_keylen.max(key.len());
        let slot = self
            .descend_value(key)
            .expect("freshly inserted key must resolve");
        Ok((unsafe { &mut *slot }, false))
    }

    fn erase_impl(&mut self, key: &[u8]) -> Option<usize> {
        self.root?;
        let mut path = PathStack::for_keylen(key.len());
        let mut n = self.root.unwrap();
        let mut depth = 0usize;
        loop {
            let h = unsafe { n.header() };
            if is_mask(h) {
                if depth == key.len() {
                    if !has_value(h) {
                        return None;
                    }
                    let value = unsafe { node::mask_value_ptr(n).read() };
                    unsafe { n.set_header(h & !(1 << 8)) };
                    self.finish_erase();
                    return Some(value);
                }
                let octet = key[depth];
                let child = unsafe { mask::lookup(n, h, octet)? };
                path.push(PathElem {
                    node: n,
                    octet,
                    pos: 0,
                });
                n = child;
                depth += 1;
            } else {
                let prefix = unsafe { scan_prefix(n, h) };
                if key.len() - depth < prefix.len() || &key[depth..depth + prefix.len()] != prefix
                {
                    return None;
                }
                depth += prefix.len();
                if depth == key.len() {
                    if !has_value(h) {
                        return None;
                    }
                    let value = unsafe { scan_value_ptr(n, h).read() };
                    self.scan_erase_value(&mut path, n)
                        .expect("arena exhausted during erase reshape");
                    self.finish_erase();
                    return Some(value);
                }
                let octet = key[depth];
                let idx = node::find_branch(unsafe { scan_octets(n, h) }, octet).ok()?;
                path.push(PathElem {
                    node: n,
                    octet,
                    pos: idx as u8,
                });
                n = unsafe { scan_child(n, h, idx) };
                depth += 1;
            }
        }
    }

    fn finish_erase(&mut self) {
        self.count -= 1;
        if self.count == 0 {
            debug_assert!(self.root.is_none());
            self.max_keylen = 0;
        }
    }

    // ---- structural plumbing ------------------------------------------

    /// Points the parent level at `new_child`, promoting the parent to
    /// long-pointer mode (and resizing it, recursively) when the child's
    /// upper half no longer matches.
    pub(crate) fn relink(
        &mut self,
        path: &mut PathStack,
        new_child: NodePtr,
    ) -> Result<(), TrieError> {
        match path.pop() {
            None => {
                self.root = Some(new_child);
                Ok(())
            }
            Some(elem) => {
                let h = unsafe { elem.node.header() };
                if is_mask(h) {
                    mask::set_child(&self.arena, elem.node, elem.octet, new_child)?;
                    path.push(elem);
                    Ok(())
                } else {
                    let mut parts = unsafe { read_scan(elem.node) };
                    parts.children[elem.pos as usize] = new_child;
                    let node = self.commit_scan(path, elem.node, &parts)?;
                    path.push(PathElem { node, ..elem });
                    Ok(())
                }
            }
        }
    }

    /// Rewrites a scan node from its decoded parts: in place when the size
    /// class is unchanged, otherwise through a fresh minimum-class node and
    /// a parent relink. Returns the node's (possibly new) address.
    pub(crate) fn commit_scan(
        &mut self,
        path: &mut PathStack,
        n: NodePtr,
        parts: &ScanParts,
    ) -> Result<NodePtr, TrieError> {
        let h = unsafe { n.header() };
        let cur = node_size(h);
        let p = parts.prefix.len();
        let b = parts.octets.len();
        let long_here = parts.children.iter().any(|c| c.upper() != n.upper());
        let tail_here = long_here || parts.value.is_some();

        // Shrink only when the smaller class would also hold one more
        // branch (the hysteresis margin) alongside the current tail word.
        let shrink_to = scan_min_size(p, b + 1, tail_here).filter(|&target| target < cur);
        if scan_fits(p, b, tail_here, cur) && shrink_to.is_none() {
            let old_aux = is_long(h).then(|| unsafe { scan_aux(n, h) });
            unsafe { node::write_scan(&self.arena, n, cur, parts, old_aux)? };
            return Ok(n);
        }
        if let Some(target) = shrink_to {
            trace!("scan node {:?}: {} -> {} bytes", n, cur, target);
        } else {
            trace!("scan node {:?}: grow from {} bytes", n, cur);
        }
        let m = scan::materialize_full(&self.arena, parts)?;
        unsafe { free_scan(&self.arena, n) };
        self.relink(path, m.top)?;
        for elem in m.chain {
            path.push(elem);
        }
        Ok(m.holder)
    }

    /// Frees a whole subtree, next-blocks and auxiliaries included.
    pub(crate) fn free_subtree(&mut self, root: NodePtr) {
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            let h = unsafe { n.header() };
            if is_mask(h) {
                unsafe {
                    mask::for_each_child(n, h, |_, child| stack.push(child));
                    mask::free_storage(&self.arena, n);
                    self.arena.free(n.non_null(), node::class_of_size(128));
                }
            } else {
                for idx in 0..branch_len(h) {
                    stack.push(unsafe { scan_child(n, h, idx) });
                }
                unsafe { free_scan(&self.arena, n) };
            }
        }
    }

    // ---- iteration and diagnostics ------------------------------------

    /// A cursor positioned before the first entry.
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self)
    }

    /// Iterator over `(key, value)` in ascending byte-lexicographic order;
    /// each key is handed out as an owned boxed slice.
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(Cursor::new(self))
    }

    /// Iterator over the entries whose keys start with `prefix`.
    pub fn iter_prefix(&self, prefix: &[u8]) -> Iter<'_> {
        Iter::new(Cursor::with_prefix(self, prefix))
    }

    /// Heap footprint of a cursor over this tree, so a caller can budget
    /// iteration up front.
    pub fn iter_heap_size(&self) -> usize {
        Cursor::heap_size_for(self.max_keylen)
    }

    /// Validates the structural invariants of the whole tree.
    pub fn check(&self) -> Result<(), SanityError> {
        check::check_tree(self)
    }

    /// Node population by variant and size class.
    pub fn fill_profile(&self) -> FillProfile {
        let mut profile = FillProfile::default();
        let Some(root) = self.root else {
            return profile;
        };
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            let h = unsafe { n.header() };
            if is_mask(h) {
                profile.mask_nodes += 1;
                if has_value(h) {
                    profile.values += 1;
                }
                unsafe {
                    mask::for_each_child(n, h, |_, child| stack.push(child));
                    mask::count_blocks(n, h, &mut profile);
                }
            } else {
                profile.scan_nodes[node::class_of_size(node_size(h)) - 1] += 1;
                if is_long(h) {
                    profile.pointer_prefix_nodes += 1;
                }
                if has_value(h) {
                    profile.values += 1;
                }
                for idx in 0..branch_len(h) {
                    stack.push(unsafe { scan_child(n, h, idx) });
                }
            }
        }
        profile
    }
}

/// Node population statistics; see [`Trie::fill_profile`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FillProfile {
    /// Scan nodes by size class (16, 32, 64, 128 bytes).
    pub scan_nodes: [usize; 4],
    pub mask_nodes: usize,
    pub pointer_prefix_nodes: usize,
    pub next_blocks: usize,
    pub long_next_blocks: usize,
    pub values: usize,
}

impl Drop for Trie {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for Trie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trie")
            .field("len", &self.count)
            .field("capacity", &self.capacity)
            .field("max_keylen", &self.max_keylen)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Default for Trie {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl<K: AsRef<[u8]>> Extend<(K, usize)> for Trie {
    /// Bulk insert; panics when the tree is at capacity or the arena is
    /// exhausted, like the collection `Extend` impls it mirrors.
    fn extend<I: IntoIterator<Item = (K, usize)>>(&mut self, entries: I) {
        for (key, value) in entries {
            let (slot, _) = self.insert(key.as_ref(), value).expect("extend past limits");
            *slot = value;
        }
    }
}
