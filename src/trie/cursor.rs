//! Stateful traversal with key reconstruction.
//!
//! The tree stores no parent pointers and no whole keys; a [`Cursor`] owns
//! an explicit frame stack and a byte buffer, rebuilding each key from the
//! prefixes and branch octets along its path. Entries are visited in
//! ascending byte-lexicographic order; a node's own value precedes its
//! subtree, which is exactly that order because every extension of a key
//! sorts after it.

use super::mask;
use super::node::{self, has_value, is_mask, prefix_len, scan_child, scan_octets, scan_prefix,
    scan_value_ptr, NodePtr};
use super::Trie;

#[derive(Debug, Clone, Copy)]
enum FramePos {
    /// Just pushed; the node's own value (if any) is still unvisited.
    Entered,
    /// Positioned on the node's own value.
    AtValue,
    /// Positioned under the branch at this index (scan nodes).
    Scan(usize),
    /// Positioned under this branch octet (mask nodes).
    Mask(u8),
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    node: NodePtr,
    /// Key length before this node's prefix octets were appended.
    base: usize,
    pos: FramePos,
}

/// A stateful walk over the tree in key order. Advance with [`Cursor::next`];
/// `key`/`value` read the current entry.
pub struct Cursor<'a> {
    _trie: &'a Trie,
    stack: Vec<Frame>,
    key: Vec<u8>,
    slot: *const usize,
    /// Frames below this index belong to the pinned prefix and are never
    /// advanced; popping down to it ends the iteration.
    floor: usize,
    started: bool,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(trie: &'a Trie) -> Self {
        Self::with_prefix(trie, &[])
    }

    /// A cursor confined to the subtree of keys starting with `prefix`.
    pub(crate) fn with_prefix(trie: &'a Trie, prefix: &[u8]) -> Self {
        let mut cursor = Cursor {
            _trie: trie,
            stack: Vec::with_capacity(trie.max_keylen() + 1),
            key: Vec::with_capacity(trie.max_keylen()),
            slot: std::ptr::null(),
            floor: 0,
            started: false,
        };
        let Some(mut n) = trie.root() else {
            return cursor;
        };
        let mut depth = 0usize;
        loop {
            let h = unsafe { n.header() };
            if is_mask(h) {
                if depth >= prefix.len() {
                    cursor.push_entered(n);
                    break;
                }
                let octet = prefix[depth];
                match unsafe { mask::lookup(n, h, octet) } {
                    Some(child) => {
                        cursor.push_entered(n);
                        cursor.top_mut().pos = FramePos::Mask(octet);
                        cursor.key.push(octet);
                        n = child;
                        depth += 1;
                    }
                    None => {
                        cursor.stack.clear();
                        break;
                    }
                }
            } else {
                let node_prefix = unsafe { scan_prefix(n, h) };
                let remaining = prefix.len() - depth;
                if remaining <= node_prefix.len() {
                    if node_prefix[..remaining] == prefix[depth..] {
                        cursor.push_entered(n);
                    } else {
                        cursor.stack.clear();
                    }
                    break;
                }
                if node_prefix != &prefix[depth..depth + node_prefix.len()] {
                    cursor.stack.clear();
                    break;
                }
                depth += node_prefix.len();
                let octet = prefix[depth];
                match node::find_branch(unsafe { scan_octets(n, h) }, octet) {
                    Ok(idx) => {
                        cursor.push_entered(n);
                        cursor.top_mut().pos = FramePos::Scan(idx);
                        cursor.key.push(octet);
                        n = unsafe { scan_child(n, h, idx) };
                        depth += 1;
                    }
                    Err(_) => {
                        cursor.stack.clear();
                        break;
                    }
                }
            }
        }
        cursor.floor = cursor.stack.len().saturating_sub(1);
        cursor
    }

    /// Heap footprint of a cursor over a tree with the given `max_keylen`.
    pub(crate) fn heap_size_for(max_keylen: usize) -> usize {
        (max_keylen + 1) * std::mem::size_of::<Frame>() + max_keylen
    }

    pub fn heap_size(&self) -> usize {
        self.stack.capacity() * std::mem::size_of::<Frame>() + self.key.capacity()
    }

    fn push_entered(&mut self, n: NodePtr) {
        let base = self.key.len();
        let h = unsafe { n.header() };
        if !is_mask(h) {
            self.key.extend_from_slice(unsafe { scan_prefix(n, h) });
        }
        self.stack.push(Frame {
            node: n,
            base,
            pos: FramePos::Entered,
        });
    }

    fn top_mut(&mut self) -> &mut Frame {
        self.stack.last_mut().expect("frame stack non-empty")
    }

    /// Advances to the next entry; `false` once the walk is exhausted.
    pub fn next(&mut self) -> bool {
        if !self.started {
            self.started = true;
            if self.stack.is_empty() {
                return false;
            }
            return self.descend_min();
        }
        self.advance()
    }

    /// The current key. Only meaningful after `next()` returned `true`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(!self.slot.is_null());
        &self.key
    }

    pub fn value(&self) -> usize {
        debug_assert!(!self.slot.is_null());
        unsafe { self.slot.read() }
    }

    /// Descends smallest-first from the top frame until a value is found.
    /// Every subtree carries at least one value, so this always yields.
    fn descend_min(&mut self) -> bool {
        loop {
            let frame = *self.stack.last().expect("descend from a frame");
            let h = unsafe { frame.node.header() };
            debug_assert!(matches!(frame.pos, FramePos::Entered));
            if has_value(h) {
                self.top_mut().pos = FramePos::AtValue;
                self.slot = unsafe { self.value_ptr_of(frame.node, h) };
                return true;
            }
            if is_mask(h) {
                let octet =
                    unsafe { mask::next_octet(frame.node, 0) }.expect("valueless mask branches");
                self.enter_mask_branch(frame.node, h, octet);
            } else {
                self.enter_scan_branch(frame.node, h, 0);
            }
        }
    }

    fn advance(&mut self) -> bool {
        loop {
            let Some(frame) = self.stack.last().copied() else {
                return false;
            };
            let h = unsafe { frame.node.header() };
            if is_mask(h) {
                let from = match frame.pos {
                    FramePos::AtValue => 0usize,
                    FramePos::Mask(octet) => octet as usize + 1,
                    FramePos::Entered | FramePos::Scan(_) => {
                        unreachable!("mask frame in scan state")
                    }
                };
                if let Some(octet) = unsafe { mask::next_octet(frame.node, from) } {
                    self.key.truncate(frame.base);
                    self.enter_mask_branch(frame.node, h, octet);
                    return self.descend_min();
                }
            } else {
                let next = match frame.pos {
                    FramePos::AtValue => 0usize,
                    FramePos::Scan(idx) => idx + 1,
                    FramePos::Entered | FramePos::Mask(_) => {
                        unreachable!("scan frame in mask state")
                    }
                };
                if next < node::branch_len(h) {
                    self.key.truncate(frame.base + prefix_len(h));
                    self.enter_scan_branch(frame.node, h, next);
                    return self.descend_min();
                }
            }
            self.stack.pop();
            self.key.truncate(frame.base);
            if self.stack.len() == self.floor {
                self.stack.clear();
                return false;
            }
        }
    }

    fn enter_scan_branch(&mut self, n: NodePtr, h: u16, idx: usize) {
        self.top_mut().pos = FramePos::Scan(idx);
        let octet = unsafe { scan_octets(n, h)[idx] };
        self.key.push(octet);
        let child = unsafe { scan_child(n, h, idx) };
        self.push_entered(child);
    }

    fn enter_mask_branch(&mut self, n: NodePtr, h: u16, octet: u8) {
        self.top_mut().pos = FramePos::Mask(octet);
        self.key.push(octet);
        let child = unsafe { mask::lookup(n, h, octet) }.expect("bitmap said present");
        self.push_entered(child);
    }

    unsafe fn value_ptr_of(&self, n: NodePtr, h: u16) -> *const usize {
        if is_mask(h) {
            node::mask_value_ptr(n)
        } else {
            scan_value_ptr(n, h)
        }
    }
}

/// Owning-key iterator adapter over [`Cursor`].
pub struct Iter<'a> {
    cursor: Cursor<'a>,
}

impl<'a> Iter<'a> {
    pub(crate) fn new(cursor: Cursor<'a>) -> Self {
        Iter { cursor }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = (Box<[u8]>, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.next() {
            Some((self.cursor.key().into(), self.cursor.value()))
        } else {
            None
        }
    }
}

impl<'a> std::iter::FusedIterator for Iter<'a> {}
