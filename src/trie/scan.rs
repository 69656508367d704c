//! Scan-node operations: leaf chains, split parents, merges, prefix
//! move-up, and the insert/erase reshapes of the linear-scan variant.
//!
//! Everything here manipulates decoded [`ScanParts`] and hands the result
//! to [`Trie::commit_scan`](super::Trie) (in place or through a rebuild)
//! or materialises fresh node chains bottom-up. Children always travel as
//! full pointers; the codec re-encodes them against whatever address the
//! new node lands on.

use arrayvec::ArrayVec;
use log::trace;

use super::mask;
use super::node::{
    branch_len, build_scan, free_scan, has_value, is_long, is_mask, node_size, prefix_len,
    read_scan, scan_aux, scan_fits, scan_min_size, write_scan, BuildError, NodePtr, ScanParts,
    MAX_BRANCH_TAIL, MAX_PREFIX,
};
use super::{PathElem, PathStack, Trie, TrieError};
use crate::buddy::Arena;

/// Largest prefix a value-carrying chain terminal can hold (128-byte node,
/// header + prefix + value word).
pub(crate) const TERMINAL_MAX_PREFIX: usize = 118;
/// Largest prefix of an interior chain node (header + prefix + one branch).
pub(crate) const INTERIOR_MAX_PREFIX: usize = 121;
/// Interior limit when the single child needs the long-pointer tail word.
pub(crate) const INTERIOR_MAX_PREFIX_TAIL: usize = 113;
/// A parent/child merge fires only when the combined payload stays within
/// this size class; anything bigger would re-split on the next insert.
pub(crate) const MERGE_MAX_SIZE: usize = 64;

/// Result of materialising [`ScanParts`] that may not fit a single node:
/// the top of the produced chain, path elements for any interior nodes,
/// and the node actually holding the branch array and value.
pub(crate) struct Materialized {
    pub top: NodePtr,
    pub chain: ArrayVec<PathElem, 2>,
    pub holder: NodePtr,
}

impl Materialized {
    fn single(n: NodePtr) -> Self {
        Materialized {
            top: n,
            chain: ArrayVec::new(),
            holder: n,
        }
    }
}

fn interior_parts(prefix: &[u8], octet: u8, child: NodePtr) -> ScanParts {
    let mut parts = ScanParts::default();
    parts
        .prefix
        .try_extend_from_slice(prefix)
        .expect("interior prefix within bounds");
    parts.insert_branch(0, octet, child);
    parts
}

/// Builds `parts` as a single node when possible, otherwise as a short
/// chain: prefix overflow hoists leading octets into one or two interior
/// parents; branch overflow falls back to a mask node.
pub(crate) fn materialize_full(
    arena: &Arena,
    parts: &ScanParts,
) -> Result<Materialized, TrieError> {
    match build_scan(arena, parts) {
        Ok(n) => Ok(Materialized::single(n)),
        Err(BuildError::Oom) => Err(TrieError::OutOfMemory),
        Err(BuildError::Overflow) => {
            if scan_min_size(0, parts.octets.len(), true).is_some() {
                // The prefix is the blocker; cut it under an interior parent.
                for limit in [INTERIOR_MAX_PREFIX, INTERIOR_MAX_PREFIX_TAIL] {
                    let cut = limit.min(parts.prefix.len() - 1);
                    let mut bottom_parts = parts.clone();
                    bottom_parts.prefix.clear();
                    bottom_parts
                        .prefix
                        .try_extend_from_slice(&parts.prefix[cut + 1..])
                        .expect("cut prefix shrinks");
                    let bottom = match build_scan(arena, &bottom_parts) {
                        Ok(bottom) => bottom,
                        Err(BuildError::Overflow) => continue,
                        Err(BuildError::Oom) => return Err(TrieError::OutOfMemory),
                    };
                    let top_parts =
                        interior_parts(&parts.prefix[..cut], parts.prefix[cut], bottom);
                    match build_scan(arena, &top_parts) {
                        Ok(top) => {
                            let mut chain = ArrayVec::new();
                            chain.push(PathElem {
                                node: top,
                                octet: parts.prefix[cut],
                                pos: 0,
                            });
                            return Ok(Materialized {
                                top,
                                chain,
                                holder: bottom,
                            });
                        }
                        Err(BuildError::Overflow) => {
                            unsafe { free_scan(arena, bottom) };
                            continue;
                        }
                        Err(BuildError::Oom) => {
                            unsafe { free_scan(arena, bottom) };
                            return Err(TrieError::OutOfMemory);
                        }
                    }
                }
                unreachable!("an interior node over {INTERIOR_MAX_PREFIX_TAIL} octets always fits")
            } else {
                // Out of scan branches: the payload becomes a mask node.
                let m = mask::build_node(arena, parts)?;
                if parts.prefix.is_empty() {
                    return Ok(Materialized::single(m));
                }
                let last = parts.prefix[parts.prefix.len() - 1];
                let ip = interior_parts(&parts.prefix[..parts.prefix.len() - 1], last, m);
                let above = materialize_full(arena, &ip)?;
                let mut chain = above.chain;
                chain.push(PathElem {
                    node: above.holder,
                    octet: last,
                    pos: 0,
                });
                Ok(Materialized {
                    top: above.top,
                    chain,
                    holder: m,
                })
            }
        }
    }
}

pub(crate) fn materialize(arena: &Arena, parts: &ScanParts) -> Result<NodePtr, TrieError> {
    materialize_full(arena, parts).map(|m| m.top)
}

/// Stores a residual key plus value as the shortest chain of scan nodes:
/// interiors carry maximal prefix segments and one branch, the terminal
/// carries the tail and the value.
pub(crate) fn leaf_chain(arena: &Arena, key: &[u8], value: usize) -> Result<NodePtr, TrieError> {
    match chain_limited(arena, key, value, INTERIOR_MAX_PREFIX) {
        Ok(head) => Ok(head),
        Err(BuildError::Oom) => Err(TrieError::OutOfMemory),
        // An interior landed in a different 4 GiB window than its child and
        // needs the tail word; re-cut the chain with the smaller segment.
        Err(BuildError::Overflow) => chain_limited(arena, key, value, INTERIOR_MAX_PREFIX_TAIL)
            .map_err(|e| match e {
                BuildError::Oom => TrieError::OutOfMemory,
                BuildError::Overflow => unreachable!("tail-sized interiors always fit"),
            }),
    }
}

fn chain_limited(
    arena: &Arena,
    rest: &[u8],
    value: usize,
    interior_max: usize,
) -> Result<NodePtr, BuildError> {
    // Cut the key front-to-back, then build back-to-front so every node
    // links a finished child (keys can be far deeper than the call stack).
    let mut segments: Vec<(usize, usize)> = Vec::new();
    let mut off = 0usize;
    while rest.len() - off > TERMINAL_MAX_PREFIX {
        let cut = interior_max.min(rest.len() - off - 1);
        segments.push((off, cut));
        off += cut + 1;
    }
    let mut node = build_scan(arena, &ScanParts::leaf(&rest[off..], value))?;
    for &(start, cut) in segments.iter().rev() {
        let parts = interior_parts(&rest[start..start + cut], rest[start + cut], node);
        node = match build_scan(arena, &parts) {
            Ok(head) => head,
            Err(e) => {
                free_chain(arena, node);
                return Err(e);
            }
        };
    }
    Ok(node)
}

/// Frees a single-branch chain built by [`leaf_chain`].
fn free_chain(arena: &Arena, mut n: NodePtr) {
    loop {
        let parts = unsafe { read_scan(n) };
        unsafe { free_scan(arena, n) };
        if parts.children.len() == 1 && parts.value.is_none() {
            n = parts.children[0];
        } else {
            return;
        }
    }
}

/// The coalesced form of a single-branch, valueless node and its scan
/// child, provided the combined payload stays within [`MERGE_MAX_SIZE`].
pub(crate) fn merged_parts(
    parent_prefix: &[u8],
    octet: u8,
    child: &ScanParts,
) -> Option<ScanParts> {
    let combined = parent_prefix.len() + 1 + child.prefix.len();
    if combined > MAX_PREFIX {
        return None;
    }
    let size = scan_min_size(combined, child.octets.len(), child.value.is_some())?;
    if size > MERGE_MAX_SIZE {
        return None;
    }
    let mut parts = ScanParts::default();
    parts
        .prefix
        .try_extend_from_slice(parent_prefix)
        .expect("combined prefix bounded above");
    parts.prefix.push(octet);
    parts
        .prefix
        .try_extend_from_slice(&child.prefix)
        .expect("combined prefix bounded above");
    parts.octets = child.octets.clone();
    parts.children = child.children.clone();
    parts.value = child.value;
    Some(parts)
}

impl Trie {
    /// Splits a scan node whose prefix diverges from the key at `equal`
    /// octets (§ the central mutation of insert): a fresh parent takes the
    /// common prefix, with the shortened old node and the new residual as
    /// its branches — or the new value itself when the key is exhausted.
    pub(crate) fn split_scan(
        &mut self,
        path: &mut PathStack,
        n: NodePtr,
        depth: usize,
        equal: usize,
        key: &[u8],
        value: usize,
    ) -> Result<(), TrieError> {
        let old_parts = unsafe { read_scan(n) };
        debug_assert!(equal < old_parts.prefix.len());
        let prefix: ArrayVec<u8, MAX_PREFIX> = old_parts.prefix.clone();

        let mut shortened = old_parts;
        shortened.prefix.clear();
        shortened
            .prefix
            .try_extend_from_slice(&prefix[equal + 1..])
            .expect("shortened prefix shrinks");
        let residual_old = materialize(&self.arena, &shortened)?;

        let parent = if depth + equal == key.len() {
            // The new key ends at the divergence: the parent carries the
            // value and a single branch into the old residual.
            let mut parts = ScanParts::leaf(&prefix[..equal], value);
            parts.insert_branch(0, prefix[equal], residual_old);
            parts
        } else {
            let residual_new =
                leaf_chain(&self.arena, &key[depth + equal + 1..], value)?;
            let mut parts = ScanParts::default();
            parts
                .prefix
                .try_extend_from_slice(&prefix[..equal])
                .expect("common prefix shrinks");
            parts.insert_branch(0, prefix[equal], residual_old);
            let new_octet = key[depth + equal];
            let at = if new_octet < prefix[equal] { 0 } else { 1 };
            parts.insert_branch(at, new_octet, residual_new);
            parts
        };
        trace!("split at depth {} + {}", depth, equal);
        let top = materialize(&self.arena, &parent)?;
        unsafe { free_scan(&self.arena, n) };
        self.relink(path, top)
    }

    /// Value-only insert into a scan node (key fully consumed, no value
    /// yet): in place or grown when the tail word fits, via prefix move-up
    /// when the prefix is the blocker, via mask conversion when the branch
    /// array is.
    pub(crate) fn scan_set_value(
        &mut self,
        path: &mut PathStack,
        n: NodePtr,
        value: usize,
    ) -> Result<(), TrieError> {
        let h = unsafe { n.header() };
        let p = prefix_len(h);
        let b = branch_len(h);
        debug_assert!(!has_value(h));
        if scan_min_size(p, b, true).is_none() {
            if b <= MAX_BRANCH_TAIL {
                let mut k = (1..=p)
                    .find(|&k| scan_fits(p - k, b, true, 128))
                    .expect("an empty prefix always leaves room for the tail word");
                if p - k == 1 {
                    k += 1;
                }
                self.move_prefix_up(path, n, k)?;
            } else {
                // 24 or 25 branches: only the mask layout has a value slot.
                if p > 0 {
                    self.move_prefix_up(path, n, p)?;
                }
                let mut parts = unsafe { read_scan(n) };
                parts.value = Some(value);
                return mask::from_parts(&self.arena, n, &parts);
            }
        }
        let mut parts = unsafe { read_scan(n) };
        parts.value = Some(value);
        self.commit_scan(path, n, &parts).map(|_| ())
    }

    /// Inserts a missing branch octet, with the residual key as a fresh
    /// leaf chain. Escalates exactly like `scan_set_value` when the scan
    /// packing runs out.
    pub(crate) fn scan_add_branch(
        &mut self,
        path: &mut PathStack,
        n: NodePtr,
        at: usize,
        octet: u8,
        rest: &[u8],
        value: usize,
    ) -> Result<(), TrieError> {
        let h = unsafe { n.header() };
        let p = prefix_len(h);
        let b = branch_len(h);
        let chain = leaf_chain(&self.arena, rest, value)?;
        let tail = has_value(h) || is_long(h) || chain.upper() != n.upper();
        if !scan_fits(p, b + 1, tail, 128) {
            if scan_min_size(0, b + 1, tail).is_some() {
                let mut k = (1..=p)
                    .find(|&k| scan_fits(p - k, b + 1, tail, 128))
                    .expect("an empty prefix always leaves room for one branch");
                if p - k == 1 {
                    k += 1;
                }
                self.move_prefix_up(path, n, k)?;
            } else {
                // The scan maximum is reached: convert to a mask node.
                if p > 0 {
                    self.move_prefix_up(path, n, p)?;
                }
                let mut parts = unsafe { read_scan(n) };
                parts.insert_branch(at, octet, chain);
                trace!("scan -> mask with {} branches", parts.octets.len());
                return mask::from_parts(&self.arena, n, &parts);
            }
        }
        let mut parts = unsafe { read_scan(n) };
        parts.insert_branch(at, octet, chain);
        self.commit_scan(path, n, &parts).map(|_| ())
    }

    /// Moves the leading `k` prefix octets of `n` into its parent — a
    /// single-branch parent absorbs them, anyone else gets an intermediate
    /// node. `n` keeps its size class (the caller is about to refill the
    /// freed bytes); the path is extended so the caller can keep committing
    /// against `n`.
    pub(crate) fn move_prefix_up(
        &mut self,
        path: &mut PathStack,
        n: NodePtr,
        k: usize,
    ) -> Result<(), TrieError> {
        let h = unsafe { n.header() };
        let size = node_size(h);
        let parts = unsafe { read_scan(n) };
        let p = parts.prefix.len();
        debug_assert!(k >= 1 && k <= p && p - k != 1);
        let moved: ArrayVec<u8, MAX_PREFIX> = parts.prefix[..k].iter().copied().collect();
        let branch_octet = moved[k - 1];

        let mut shortened = parts;
        let tail: ArrayVec<u8, MAX_PREFIX> = shortened.prefix[k..].iter().copied().collect();
        shortened.prefix = tail;
        let old_aux = is_long(h).then(|| unsafe { scan_aux(n, h) });
        unsafe { write_scan(&self.arena, n, size, &shortened, old_aux)? };
        trace!("moved {} prefix octets up", k);

        if let Some(&elem) = path.last() {
            let ph = unsafe { elem.node.header() };
            if !is_mask(ph) && branch_len(ph) == 1 && !has_value(ph) {
                let mut pparts = unsafe { read_scan(elem.node) };
                let new_plen = pparts.prefix.len() + k;
                if new_plen <= INTERIOR_MAX_PREFIX_TAIL {
                    pparts.prefix.push(elem.octet);
                    pparts
                        .prefix
                        .try_extend_from_slice(&moved[..k - 1])
                        .expect("absorbed prefix bounded above");
                    pparts.octets[0] = branch_octet;
                    let elem = path.pop().expect("just observed");
                    let node = self.commit_scan(path, elem.node, &pparts)?;
                    path.push(PathElem {
                        node,
                        octet: branch_octet,
                        pos: 0,
                    });
                    return Ok(());
                }
            }
        }

        let ip = interior_parts(&moved[..k - 1], branch_octet, n);
        let above = materialize_full(&self.arena, &ip)?;
        self.relink(path, above.top)?;
        for elem in above.chain {
            path.push(elem);
        }
        path.push(PathElem {
            node: above.holder,
            octet: branch_octet,
            pos: 0,
        });
        Ok(())
    }

    /// Removes the value of a scan node, then cleans up: an empty node is
    /// freed (cascading the branch removal), a single-branch node tries to
    /// merge with its child, everyone else shrinks by hysteresis.
    pub(crate) fn scan_erase_value(
        &mut self,
        path: &mut PathStack,
        n: NodePtr,
    ) -> Result<(), TrieError> {
        let mut parts = unsafe { read_scan(n) };
        debug_assert!(parts.value.is_some());
        parts.value = None;
        if parts.octets.is_empty() {
            unsafe { free_scan(&self.arena, n) };
            return self.remove_branch_cascade(path);
        }
        if parts.octets.len() == 1 {
            return self.merge_child_or_commit(path, n, parts);
        }
        self.commit_scan(path, n, &parts).map(|_| ())
    }

    /// Child-merge: `n` has one branch and no value; coalesce with its scan
    /// child when the combined payload is small enough, else just commit.
    fn merge_child_or_commit(
        &mut self,
        path: &mut PathStack,
        n: NodePtr,
        parts: ScanParts,
    ) -> Result<(), TrieError> {
        debug_assert!(parts.octets.len() == 1 && parts.value.is_none());
        let child = parts.children[0];
        let ch = unsafe { child.header() };
        if !is_mask(ch) {
            let child_parts = unsafe { read_scan(child) };
            if let Some(merged) = merged_parts(&parts.prefix, parts.octets[0], &child_parts) {
                trace!("merging single-branch node into child");
                let m = materialize(&self.arena, &merged)?;
                unsafe {
                    free_scan(&self.arena, child);
                    free_scan(&self.arena, n);
                }
                return self.relink(path, m);
            }
        }
        self.commit_scan(path, n, &parts).map(|_| ())
    }

    /// Ascends after a node freed itself: each ancestor loses the branch
    /// and then shrinks, merges, converts back from mask form, or is freed
    /// in turn.
    pub(crate) fn remove_branch_cascade(
        &mut self,
        path: &mut PathStack,
    ) -> Result<(), TrieError> {
        loop {
            let Some(elem) = path.pop() else {
                self.root = None;
                return Ok(());
            };
            let n = elem.node;
            let h = unsafe { n.header() };
            if is_mask(h) {
                mask::erase_branch(&self.arena, n, elem.octet);
                if mask::branch_count(n) < mask::MASK_TO_SCAN {
                    trace!("mask -> scan at {} branches", mask::branch_count(n));
                    mask::to_scan(&self.arena, n)?;
                }
                return Ok(());
            }
            let mut parts = unsafe { read_scan(n) };
            parts.remove_branch(elem.pos as usize);
            if parts.octets.is_empty() && parts.value.is_none() {
                unsafe { free_scan(&self.arena, n) };
                continue;
            }
            if parts.octets.is_empty() {
                // A bare value remains; a single-branch valueless parent
                // can absorb it.
                if let Some(&pe) = path.last() {
                    let ph = unsafe { pe.node.header() };
                    if !is_mask(ph) && branch_len(ph) == 1 && !has_value(ph) {
                        let pparts = unsafe { read_scan(pe.node) };
                        if let Some(merged) = merged_parts(&pparts.prefix, pe.octet, &parts) {
                            trace!("merging leaf into single-branch parent");
                            let m = materialize(&self.arena, &merged)?;
                            unsafe {
                                free_scan(&self.arena, n);
                                free_scan(&self.arena, pe.node);
                            }
                            path.pop();
                            return self.relink(path, m);
                        }
                    }
                }
                self.commit_scan(path, n, &parts)?;
                return Ok(());
            }
            if parts.octets.len() == 1 && parts.value.is_none() {
                return self.merge_child_or_commit(path, n, parts);
            }
            self.commit_scan(path, n, &parts)?;
            return Ok(());
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buddy::Arena;

    #[test]
    fn leaf_chain_shapes() {
        let arena = Arena::new();
        // Short key: a single terminal of minimum class.
        let head = leaf_chain(&arena, b"abc", 9).unwrap();
        let parts = unsafe { read_scan(head) };
        assert_eq!(parts.prefix.as_slice(), b"abc");
        assert_eq!(parts.value, Some(9));
        assert!(parts.octets.is_empty());
        unsafe { free_scan(&arena, head) };

        // A 300-octet residual needs interiors.
        let key = vec![0x41u8; 300];
        let head = leaf_chain(&arena, &key, 1).unwrap();
        let mut n = head;
        let mut consumed = 0;
        let mut nodes = 0;
        loop {
            let parts = unsafe { read_scan(n) };
            consumed += parts.prefix.len();
            nodes += 1;
            if let Some(value) = parts.value {
                assert_eq!(value, 1);
                assert!(parts.octets.is_empty());
                break;
            }
            assert_eq!(parts.octets.len(), 1);
            consumed += 1;
            let next = parts.children[0];
            unsafe { free_scan(&arena, n) };
            n = next;
        }
        unsafe { free_scan(&arena, n) };
        assert_eq!(consumed, 300);
        assert_eq!(nodes, 3);
    }

    #[test]
    fn merge_gate_respects_size_class() {
        let child = ScanParts::leaf(b"xy", 5);
        assert!(merged_parts(b"abc", b'q', &child).is_some());
        // 60 octets of combined prefix pushes past the 64-byte class.
        let child = ScanParts::leaf(&[7u8; 40], 5);
        assert!(merged_parts(&[3u8; 30], b'q', &child).is_none());
    }

    #[test]
    fn materialize_hoists_long_prefixes() {
        let arena = Arena::new();
        let parts = ScanParts::leaf(&[0x61; 127], 3);
        // 127 octets with a value cannot sit in one node.
        let m = materialize_full(&arena, &parts).unwrap();
        assert_ne!(m.top, m.holder);
        assert_eq!(m.chain.len(), 1);
        let top_parts = unsafe { read_scan(m.top) };
        assert_eq!(top_parts.octets.len(), 1);
        let bottom = top_parts.children[0];
        assert_eq!(bottom, m.holder);
        let bottom_parts = unsafe { read_scan(bottom) };
        assert_eq!(
            top_parts.prefix.len() + 1 + bottom_parts.prefix.len(),
            127
        );
        assert_eq!(bottom_parts.value, Some(3));
        unsafe {
            free_scan(&arena, bottom);
            free_scan(&arena, m.top);
        }
    }
}
