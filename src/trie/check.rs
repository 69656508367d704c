//! Structural invariant checker.
//!
//! [`Trie::check`](super::Trie::check) walks the whole tree and validates
//! the packed layout: alignment, header well-formedness, branch ordering,
//! size-class tightness (with the hysteresis margin), pointer-prefix and
//! next-block coherence, and the count bookkeeping. Tests call it after
//! every mutation batch; debug builds additionally assert local invariants
//! inside the mutation helpers.

use super::mask;
use super::node::{
    self, aux_class, aux_lp_count, aux_size_for_host, branch_len, has_value, is_long, is_mask,
    node_size, prefix_len, scan_aux, scan_child, scan_fits, scan_min_size, scan_octets,
    scan_prefix, NodePtr, LB_CAP, LB_MAX_CHAIN, MASK_LOCAL_CAP,
};
use super::Trie;
use crate::bits::popcount32;
use crate::buddy::CLASS_SIZES;

/// A structural invariant violation, with the key path leading to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanityError {
    /// Key octets consumed down to the offending node.
    pub path: Vec<u8>,
    pub detail: String,
}

impl std::fmt::Display for SanityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sanity: {} (at path {:02x?})", self.detail, self.path)
    }
}

impl std::error::Error for SanityError {}

struct Checker<'a> {
    trie: &'a Trie,
    path: Vec<u8>,
    values: usize,
}

impl Checker<'_> {
    fn fail(&self, detail: impl Into<String>) -> SanityError {
        SanityError {
            path: self.path.clone(),
            detail: detail.into(),
        }
    }

    fn ensure(&self, cond: bool, detail: &str) -> Result<(), SanityError> {
        if cond {
            Ok(())
        } else {
            Err(self.fail(detail))
        }
    }

    fn check_node(&mut self, n: NodePtr) -> Result<(), SanityError> {
        let h = unsafe { n.header() };
        let code = node::size_code(h);
        self.ensure(
            matches!(code, 1..=5 | 7),
            &format!("bad size code {code}"),
        )?;
        let size = node_size(h);
        self.ensure(n.addr() % size == 0, "node misaligned for its class")?;
        if is_mask(h) {
            self.check_mask(n, h)
        } else {
            self.check_scan(n, h, size)
        }
    }

    fn check_scan(&mut self, n: NodePtr, h: u16, size: usize) -> Result<(), SanityError> {
        let p = prefix_len(h);
        let b = branch_len(h);
        let octets = unsafe { scan_octets(n, h) };
        for pair in octets.windows(2) {
            self.ensure(pair[0] < pair[1], "branch octets not strictly increasing")?;
        }
        self.ensure(b > 0 || has_value(h), "empty scan node without value")?;
        let tail = has_value(h) || is_long(h);
        self.ensure(
            scan_fits(p, b, tail, size),
            "payload exceeds the node's size class",
        )?;
        if let Some(tighter) = scan_min_size(p, b + 1, tail) {
            self.ensure(
                tighter >= size,
                "node exceeds the minimum class plus hysteresis margin",
            )?;
        }

        let mut lp = 0usize;
        for idx in 0..b {
            let child = unsafe { scan_child(n, h, idx) };
            if child.upper() != n.upper() {
                lp += 1;
            }
        }
        if is_long(h) {
            let aux = unsafe { scan_aux(n, h) };
            let aux_size = CLASS_SIZES[unsafe { aux_class(aux) }];
            self.ensure(
                aux_size == aux_size_for_host(size),
                "pointer-prefix node class mismatch",
            )?;
            self.ensure(aux.addr() % aux_size == 0, "pointer-prefix node misaligned")?;
            let recorded = unsafe { aux_lp_count(aux) };
            self.ensure(
                recorded == lp,
                &format!("lp_count {recorded} but {lp} children cross windows"),
            )?;
            self.ensure(lp > 0, "long-pointer mode with no crossing children")?;
        } else {
            self.ensure(lp == 0, "crossing child without long-pointer mode")?;
        }

        if has_value(h) {
            self.values += 1;
            if self.path.len() + p > self.trie.max_keylen() {
                return Err(self.fail("key longer than recorded max_keylen"));
            }
        }
        for idx in 0..b {
            let child = unsafe { scan_child(n, h, idx) };
            let before = self.path.len();
            self.path.extend_from_slice(unsafe { scan_prefix(n, h) });
            self.path.push(octets[idx]);
            self.check_node(child)?;
            self.path.truncate(before);
        }
        Ok(())
    }

    fn check_mask(&mut self, n: NodePtr, h: u16) -> Result<(), SanityError> {
        self.ensure(prefix_len(h) == 0, "mask node with prefix bits set")?;
        self.ensure(branch_len(h) == 0, "mask node with branch nibble set")?;

        let mut total = 0usize;
        let mut used_expect = 0u8;
        for sub in 0..8 {
            let word = unsafe { node::mask_bitmap_word(n, sub) };
            if word != 0 {
                used_expect |= 1 << sub;
            }
            total += popcount32(word) as usize;
        }
        let used = unsafe { node::mask_used(n) };
        self.ensure(used == used_expect, "used byte disagrees with bitmap")?;
        self.ensure(total >= 2, "mask node with fewer than two branches")?;
        let count = unsafe { node::mask_count_byte(n) } as usize;
        self.ensure(
            count == total % 256,
            &format!("count byte {count} but bitmap holds {total}"),
        )?;

        let local = unsafe { node::mask_local(n) };
        if local != node::LOCAL_NONE {
            self.ensure(local < 8, "local index out of range")?;
            self.ensure(!is_long(h), "local storage inside a long-pointer mask")?;
            self.ensure(
                used & (1 << local) != 0,
                "local index points at an empty sub-mask",
            )?;
            let word = unsafe { node::mask_bitmap_word(n, local as usize) };
            self.ensure(
                popcount32(word) as usize <= MASK_LOCAL_CAP,
                "local storage over capacity",
            )?;
        }

        for sub in 0..8 {
            if used & (1 << sub) == 0 || local == sub as u8 {
                continue;
            }
            let cnt = popcount32(unsafe { node::mask_bitmap_word(n, sub) }) as usize;
            let nb = unsafe { node::mask_nb_ptr(n, h, sub) };
            if unsafe { node::nb_is_long(nb) } {
                let mut seen = 0usize;
                let mut blocks = 0usize;
                let mut cur = Some(nb);
                while let Some(lb) = cur {
                    self.ensure(lb.addr() % 128 == 0, "long next-block misaligned")?;
                    let c = unsafe { node::lb_count(lb) };
                    self.ensure(c <= LB_CAP, "long next-block over capacity")?;
                    let next = unsafe { node::lb_chain(lb) };
                    if next.is_some() {
                        self.ensure(c == LB_CAP, "non-tail chain block not full")?;
                    }
                    seen += c;
                    blocks += 1;
                    cur = next;
                }
                self.ensure(blocks <= LB_MAX_CHAIN, "next-block chain too deep")?;
                self.ensure(
                    seen == cnt,
                    &format!("chain holds {seen} children, bitmap says {cnt}"),
                )?;
            } else {
                let tag = unsafe { node::nb_tag(nb) } as usize;
                self.ensure((1..=4).contains(&tag), "bad next-block tag")?;
                self.ensure(
                    nb.addr() % CLASS_SIZES[tag] == 0,
                    "next-block misaligned for its class",
                )?;
                self.ensure(
                    cnt <= CLASS_SIZES[tag] / 4,
                    "next-block smaller than its population",
                )?;
            }
        }

        if has_value(h) {
            self.values += 1;
        }
        let mut children: Vec<(u8, NodePtr)> = Vec::with_capacity(total);
        unsafe { mask::for_each_child(n, h, |octet, child| children.push((octet, child))) };
        self.ensure(children.len() == total, "child walk disagrees with bitmap")?;
        for (octet, child) in children {
            self.path.push(octet);
            self.check_node(child)?;
            self.path.pop();
        }
        Ok(())
    }
}

pub(crate) fn check_tree(trie: &Trie) -> Result<(), SanityError> {
    let mut checker = Checker {
        trie,
        path: Vec::new(),
        values: 0,
    };
    match trie.root() {
        None => {
            if trie.len() != 0 {
                return Err(checker.fail("empty root with nonzero count"));
            }
            Ok(())
        }
        Some(root) => {
            if trie.len() == 0 {
                return Err(checker.fail("nonzero root with zero count"));
            }
            checker.check_node(root)?;
            if checker.values != trie.len() {
                return Err(SanityError {
                    path: Vec::new(),
                    detail: format!(
                        "tree count {} but {} values reachable",
                        trie.len(),
                        checker.values
                    ),
                });
            }
            Ok(())
        }
    }
}
