//! Mask-node operations: the 256-wide bitmap variant and its next-blocks.
//!
//! A mask node is always 128 bytes and carries no prefix. Its 256-bit
//! bitmap is split into eight 32-bit sub-masks; each populated sub-mask
//! owns a next-block holding the child pointers for that 32-octet range,
//! except that one small group may live in the embedded local slots of the
//! node itself. Short next-blocks hold 32-bit child pointers whose upper
//! halves come from the block's own address; when a child lands in a
//! different 4 GiB window the block is converted into a chain of up to
//! three long-pointer blocks with full 64-bit slots.
//!
//! All block surgery keeps one ordering rule: positions are computed from
//! the bitmap before the bit itself is flipped.

use arrayvec::ArrayVec;

use super::node::{
    has_value, is_long, is_mask, lb_chain, lb_count, lb_set_chain, lb_set_count, lb_set_slot,
    lb_slot, mask_bitmap_word, mask_count_byte, mask_header, mask_local, mask_local_slot,
    mask_nb_hi, mask_nb_lo, mask_nb_ptr, mask_set_bitmap_word, mask_set_count_byte,
    mask_set_local, mask_set_local_slot, mask_set_nb_hi, mask_set_nb_lo, mask_set_used,
    mask_used, mask_value_ptr, nb_capacity, nb_child, nb_child_lo, nb_is_long, nb_set_child_lo,
    nb_tag, node_size, scan_aux, write_scan, NodePtr, ScanParts, LB_CAP, LOCAL_NONE,
    MASK_LOCAL_CAP,
};
use super::{FillProfile, TrieError};
use crate::bits::{popcount32, popcount_range, scan_forward_set};
use crate::buddy::{Arena, CLASS_SIZES};

/// Below this many branches a mask node converts back to a 128-byte scan
/// node (the scan form holds up to 25, leaving insert headroom).
pub(crate) const MASK_TO_SCAN: usize = 20;

#[inline]
fn sub_of(octet: u8) -> usize {
    (octet >> 5) as usize
}

#[inline]
fn bit_of(octet: u8) -> u32 {
    (octet & 31) as u32
}

#[inline]
fn below_mask(bit: u32) -> u32 {
    (1u32 << bit) - 1
}

/// Smallest short next-block class holding `count` children.
fn short_class_for(count: usize) -> usize {
    debug_assert!((1..=32).contains(&count));
    match count {
        1..=4 => 1,
        5..=8 => 2,
        9..=16 => 3,
        _ => 4,
    }
}

/// The number of branches in the node (the count byte is mod 256; the
/// bitmap is authoritative).
pub(crate) fn branch_count(n: NodePtr) -> usize {
    let words = unsafe { bitmap_words(n) };
    popcount_range(&words, 0, 255)
}

unsafe fn bitmap_words(n: NodePtr) -> [u32; 8] {
    let mut words = [0u32; 8];
    for (sub, word) in words.iter_mut().enumerate() {
        *word = mask_bitmap_word(n, sub);
    }
    words
}

/// Lowest populated octet at or above `from`, for ordered traversal.
pub(crate) unsafe fn next_octet(n: NodePtr, from: usize) -> Option<u8> {
    if from > 255 {
        return None;
    }
    let words = bitmap_words(n);
    scan_forward_set(&words, from, 255).map(|bit| bit as u8)
}

/// The child for `octet`, if its bit is set.
pub(crate) unsafe fn lookup(n: NodePtr, h: u16, octet: u8) -> Option<NodePtr> {
    let sub = sub_of(octet);
    let w = mask_bitmap_word(n, sub);
    if w & (1 << bit_of(octet)) == 0 {
        return None;
    }
    let pos = popcount32(w & below_mask(bit_of(octet))) as usize;
    Some(child_at(n, h, sub, pos))
}

unsafe fn child_at(n: NodePtr, h: u16, sub: usize, pos: usize) -> NodePtr {
    if mask_local(n) == sub as u8 {
        return NodePtr::from_parts(n.upper(), mask_local_slot(n, pos));
    }
    let nb = mask_nb_ptr(n, h, sub);
    if nb_is_long(nb) {
        chain_get(nb, pos)
    } else {
        nb_child(nb, pos)
    }
}

unsafe fn chain_get(mut lb: NodePtr, mut pos: usize) -> NodePtr {
    loop {
        let cnt = lb_count(lb);
        if pos < cnt {
            return lb_slot(lb, pos);
        }
        pos -= cnt;
        lb = lb_chain(lb).expect("position within chain");
    }
}

/// Visits every `(octet, child)` pair in ascending octet order.
pub(crate) unsafe fn for_each_child(n: NodePtr, h: u16, mut f: impl FnMut(u8, NodePtr)) {
    for sub in 0..8 {
        let mut bits = mask_bitmap_word(n, sub);
        let mut pos = 0usize;
        while bits != 0 {
            let bit = bits.trailing_zeros();
            f((sub * 32) as u8 + bit as u8, child_at(n, h, sub, pos));
            pos += 1;
            bits &= bits - 1;
        }
    }
}

// ---- block construction ----------------------------------------------

unsafe fn write_short_block(blk: NodePtr, class: usize, children: &[NodePtr]) {
    debug_assert!(!children.is_empty() && children.len() <= CLASS_SIZES[class] / 4);
    blk.write_u32(0, children[0].lower() | class as u32);
    for (idx, child) in children.iter().enumerate().skip(1) {
        blk.write_u32(4 * idx, child.lower());
    }
}

/// Chain of long-pointer blocks over full child pointers.
unsafe fn build_chain(arena: &Arena, children: &[NodePtr]) -> Result<NodePtr, TrieError> {
    debug_assert!(!children.is_empty() && children.len() <= 32);
    let mut head: Option<NodePtr> = None;
    let mut prev: Option<NodePtr> = None;
    for chunk in children.chunks(LB_CAP) {
        let raw = match arena.alloc(4) {
            Some(raw) => raw,
            None => {
                if let Some(head) = head {
                    free_block_or_chain(arena, head);
                }
                return Err(TrieError::OutOfMemory);
            }
        };
        let lb = NodePtr::new(raw);
        lb_set_count(lb, chunk.len());
        lb_set_chain(lb, None);
        for (idx, child) in chunk.iter().enumerate() {
            lb_set_slot(lb, idx, *child);
        }
        match prev {
            Some(prev) => lb_set_chain(prev, Some(lb)),
            None => head = Some(lb),
        }
        prev = Some(lb);
    }
    Ok(head.expect("at least one chunk"))
}

/// Smallest block holding `children`: a short block when they share the
/// block's window, a long-pointer chain otherwise.
unsafe fn new_block_for(
    arena: &Arena,
    children: &[NodePtr],
) -> Result<NodePtr, TrieError> {
    let first_upper = children[0].upper();
    if children.iter().all(|c| c.upper() == first_upper) {
        let class = short_class_for(children.len());
        if let Some(raw) = arena.alloc(class) {
            let blk = NodePtr::new(raw);
            if blk.upper() == first_upper {
                write_short_block(blk, class, children);
                return Ok(blk);
            }
            arena.free(raw, class);
        } else {
            return Err(TrieError::OutOfMemory);
        }
    }
    build_chain(arena, children)
}

unsafe fn free_block_or_chain(arena: &Arena, nb: NodePtr) {
    if nb_is_long(nb) {
        let mut cur = Some(nb);
        while let Some(lb) = cur {
            cur = lb_chain(lb);
            arena.free(lb.non_null(), 4);
        }
    } else {
        arena.free(nb.non_null(), nb_tag(nb) as usize);
    }
}

/// Frees every next-block of the node (children untouched).
pub(crate) unsafe fn free_storage(arena: &Arena, n: NodePtr) {
    let h = n.header();
    for sub in 0..8 {
        if mask_used(n) & (1 << sub) == 0 || mask_local(n) == sub as u8 {
            continue;
        }
        free_block_or_chain(arena, mask_nb_ptr(n, h, sub));
    }
}

// ---- node long mode and local slots -----------------------------------

/// Points the node's sub-mask entry at `blk`, switching the node into
/// long-pointer mode when the block lives in another window.
unsafe fn attach_block(
    arena: &Arena,
    n: NodePtr,
    sub: usize,
    blk: NodePtr,
) -> Result<(), TrieError> {
    if blk.upper() != n.upper() && !is_long(n.header()) {
        promote_long(arena, n)?;
    }
    mask_set_nb_lo(n, sub, blk.lower());
    if is_long(n.header()) {
        mask_set_nb_hi(n, sub, blk.upper());
    }
    Ok(())
}

/// Switches the node to long-pointer mode. The upper-half slots alias the
/// embedded local storage, so a resident local group is spilled first.
unsafe fn promote_long(arena: &Arena, n: NodePtr) -> Result<(), TrieError> {
    if mask_local(n) != LOCAL_NONE {
        spill_local(arena, n)?;
    }
    let h = n.header();
    if is_long(h) {
        return Ok(());
    }
    n.set_header(h | 1 << 3);
    for sub in 0..8 {
        let hi = if mask_used(n) & (1 << sub) != 0 {
            n.upper()
        } else {
            0
        };
        mask_set_nb_hi(n, sub, hi);
    }
    Ok(())
}

/// Clears long-pointer mode when every remaining block shares the node's
/// window again.
unsafe fn try_clear_long(n: NodePtr) {
    let h = n.header();
    if !is_long(h) {
        return;
    }
    for sub in 0..8 {
        if mask_used(n) & (1 << sub) != 0 && mask_nb_hi(n, sub) != n.upper() {
            return;
        }
    }
    n.set_header(h & !(1 << 3));
}

unsafe fn spill_local(arena: &Arena, n: NodePtr) -> Result<(), TrieError> {
    let sub = mask_local(n) as usize;
    debug_assert!(!is_long(n.header()));
    let cnt = popcount32(mask_bitmap_word(n, sub)) as usize;
    let children: ArrayVec<NodePtr, MASK_LOCAL_CAP> = (0..cnt)
        .map(|idx| NodePtr::from_parts(n.upper(), mask_local_slot(n, idx)))
        .collect();
    let blk = new_block_for(arena, &children)?;
    mask_set_local(n, LOCAL_NONE);
    attach_block(arena, n, sub, blk)
}

/// Moves one small, same-window short block into the free embedded local
/// slot; run after frees so the cheapest storage stays occupied.
unsafe fn try_reclaim_local(arena: &Arena, n: NodePtr) {
    let h = n.header();
    if is_long(h) || mask_local(n) != LOCAL_NONE {
        return;
    }
    for sub in 0..8 {
        if mask_used(n) & (1 << sub) == 0 {
            continue;
        }
        let cnt = popcount32(mask_bitmap_word(n, sub)) as usize;
        if cnt > MASK_LOCAL_CAP {
            continue;
        }
        let nb = mask_nb_ptr(n, h, sub);
        if nb_is_long(nb) || nb.upper() != n.upper() {
            continue;
        }
        for idx in 0..cnt {
            mask_set_local_slot(n, idx, nb_child_lo(nb, idx));
        }
        mask_set_local(n, sub as u8);
        mask_set_nb_lo(n, sub, 0);
        arena.free(nb.non_null(), nb_tag(nb) as usize);
        return;
    }
}

// ---- insert ------------------------------------------------------------

/// Adds a branch whose bit is not yet set.
pub(crate) fn insert_branch(
    arena: &Arena,
    n: NodePtr,
    octet: u8,
    child: NodePtr,
) -> Result<(), TrieError> {
    unsafe {
        let h = n.header();
        let sub = sub_of(octet);
        let w = mask_bitmap_word(n, sub);
        debug_assert_eq!(w & (1 << bit_of(octet)), 0);
        let pos = popcount32(w & below_mask(bit_of(octet))) as usize;
        let occupied = popcount32(w) as usize;

        if occupied == 0 {
            if !is_long(h) && mask_local(n) == LOCAL_NONE && child.upper() == n.upper() {
                mask_set_local(n, sub as u8);
                mask_set_local_slot(n, 0, child.lower());
            } else {
                let blk = new_block_for(arena, &[child])?;
                attach_block(arena, n, sub, blk)?;
            }
        } else if mask_local(n) == sub as u8 {
            insert_local(arena, n, sub, pos, occupied, child)?;
        } else {
            let nb = mask_nb_ptr(n, n.header(), sub);
            if nb_is_long(nb) {
                chain_insert(arena, nb, pos, child)?;
            } else {
                insert_short(arena, n, sub, nb, pos, occupied, child)?;
            }
        }

        mask_set_bitmap_word(n, sub, w | (1 << bit_of(octet)));
        mask_set_used(n, mask_used(n) | (1 << sub));
        mask_set_count_byte(n, mask_count_byte(n).wrapping_add(1));
        Ok(())
    }
}

unsafe fn insert_local(
    arena: &Arena,
    n: NodePtr,
    sub: usize,
    pos: usize,
    occupied: usize,
    child: NodePtr,
) -> Result<(), TrieError> {
    debug_assert!(!is_long(n.header()));
    if occupied < MASK_LOCAL_CAP && child.upper() == n.upper() {
        for idx in (pos..occupied).rev() {
            mask_set_local_slot(n, idx + 1, mask_local_slot(n, idx));
        }
        mask_set_local_slot(n, pos, child.lower());
        return Ok(());
    }
    spill_local(arena, n)?;
    let nb = mask_nb_ptr(n, n.header(), sub);
    if nb_is_long(nb) {
        chain_insert(arena, nb, pos, child)
    } else {
        insert_short(arena, n, sub, nb, pos, occupied, child)
    }
}

unsafe fn insert_short(
    arena: &Arena,
    n: NodePtr,
    sub: usize,
    nb: NodePtr,
    pos: usize,
    occupied: usize,
    child: NodePtr,
) -> Result<(), TrieError> {
    if child.upper() != nb.upper() {
        // The new child crosses windows: the whole group goes long.
        let mut children: ArrayVec<NodePtr, 32> =
            (0..occupied).map(|idx| nb_child(nb, idx)).collect();
        children.insert(pos, child);
        let head = build_chain(arena, &children)?;
        free_block_or_chain(arena, nb);
        return attach_block(arena, n, sub, head);
    }
    let cap = nb_capacity(nb);
    if occupied < cap {
        for idx in (pos..occupied).rev() {
            nb_set_child_lo(nb, idx + 1, nb_child_lo(nb, idx));
        }
        nb_set_child_lo(nb, pos, child.lower());
        return Ok(());
    }
    // Power-of-two step up.
    let class = nb_tag(nb) as usize + 1;
    debug_assert!(class <= 4);
    let Some(raw) = arena.alloc(class) else {
        return Err(TrieError::OutOfMemory);
    };
    let blk = NodePtr::new(raw);
    if blk.upper() != nb.upper() {
        arena.free(raw, class);
        let mut children: ArrayVec<NodePtr, 32> =
            (0..occupied).map(|idx| nb_child(nb, idx)).collect();
        children.insert(pos, child);
        let head = build_chain(arena, &children)?;
        free_block_or_chain(arena, nb);
        return attach_block(arena, n, sub, head);
    }
    let mut children: ArrayVec<NodePtr, 32> = (0..occupied).map(|idx| nb_child(nb, idx)).collect();
    children.insert(pos, child);
    write_short_block(blk, class, &children);
    arena.free(nb.non_null(), nb_tag(nb) as usize);
    attach_block(arena, n, sub, blk)
}

unsafe fn chain_insert(
    arena: &Arena,
    head: NodePtr,
    mut pos: usize,
    child: NodePtr,
) -> Result<(), TrieError> {
    let mut blk = head;
    let mut item = child;
    loop {
        let cnt = lb_count(blk);
        if pos > cnt {
            pos -= cnt;
            blk = lb_chain(blk).expect("insert position within chain");
            continue;
        }
        if cnt < LB_CAP {
            for idx in (pos..cnt).rev() {
                lb_set_slot(blk, idx + 1, lb_slot(blk, idx));
            }
            lb_set_slot(blk, pos, item);
            lb_set_count(blk, cnt + 1);
            return Ok(());
        }
        if pos == LB_CAP {
            pos = 0;
            blk = next_or_grow(arena, blk)?;
            continue;
        }
        // Full block: the last slot ripples into the next one.
        let evicted = lb_slot(blk, LB_CAP - 1);
        for idx in (pos..LB_CAP - 1).rev() {
            lb_set_slot(blk, idx + 1, lb_slot(blk, idx));
        }
        lb_set_slot(blk, pos, item);
        item = evicted;
        pos = 0;
        blk = next_or_grow(arena, blk)?;
    }
}

unsafe fn next_or_grow(arena: &Arena, blk: NodePtr) -> Result<NodePtr, TrieError> {
    if let Some(next) = lb_chain(blk) {
        return Ok(next);
    }
    let raw = arena.alloc(4).ok_or(TrieError::OutOfMemory)?;
    let lb = NodePtr::new(raw);
    lb_set_count(lb, 0);
    lb_set_chain(lb, None);
    lb_set_chain(blk, Some(lb));
    Ok(lb)
}

// ---- erase -------------------------------------------------------------

/// Removes a branch whose bit is set. Never fails: shrink and demotion
/// attempts that would need a fresh allocation are simply skipped when the
/// arena has nothing suitable.
pub(crate) fn erase_branch(arena: &Arena, n: NodePtr, octet: u8) {
    unsafe {
        let h = n.header();
        let sub = sub_of(octet);
        let w = mask_bitmap_word(n, sub);
        debug_assert_ne!(w & (1 << bit_of(octet)), 0);
        let pos = popcount32(w & below_mask(bit_of(octet))) as usize;
        let occupied = popcount32(w) as usize;

        if occupied == 1 {
            if mask_local(n) == sub as u8 {
                mask_set_local(n, LOCAL_NONE);
            } else {
                free_block_or_chain(arena, mask_nb_ptr(n, h, sub));
                mask_set_nb_lo(n, sub, 0);
                if is_long(h) {
                    mask_set_nb_hi(n, sub, 0);
                }
            }
            mask_set_used(n, mask_used(n) & !(1 << sub));
        } else if mask_local(n) == sub as u8 {
            for idx in pos..occupied - 1 {
                mask_set_local_slot(n, idx, mask_local_slot(n, idx + 1));
            }
        } else {
            let nb = mask_nb_ptr(n, h, sub);
            if nb_is_long(nb) {
                chain_remove(arena, nb, pos);
                try_demote_chain(arena, n, sub, occupied - 1);
            } else {
                for idx in pos..occupied - 1 {
                    nb_set_child_lo(nb, idx, nb_child_lo(nb, idx + 1));
                }
                try_shrink_short(arena, n, sub, nb, occupied - 1);
            }
        }

        mask_set_bitmap_word(n, sub, w & !(1 << bit_of(octet)));
        mask_set_count_byte(n, mask_count_byte(n).wrapping_sub(1));
        try_clear_long(n);
        try_reclaim_local(arena, n);
    }
}

unsafe fn chain_remove(arena: &Arena, head: NodePtr, mut pos: usize) {
    let mut prev: Option<NodePtr> = None;
    let mut blk = head;
    loop {
        let cnt = lb_count(blk);
        if pos < cnt {
            break;
        }
        pos -= cnt;
        prev = Some(blk);
        blk = lb_chain(blk).expect("remove position within chain");
    }
    let cnt = lb_count(blk);
    for idx in pos..cnt - 1 {
        lb_set_slot(blk, idx, lb_slot(blk, idx + 1));
    }
    // Pull successors forward so only the tail block is partial.
    let mut cur = blk;
    loop {
        let cnt = lb_count(cur);
        match lb_chain(cur) {
            Some(next) => {
                lb_set_slot(cur, cnt - 1, lb_slot(next, 0));
                let ncnt = lb_count(next);
                for idx in 0..ncnt - 1 {
                    lb_set_slot(next, idx, lb_slot(next, idx + 1));
                }
                prev = Some(cur);
                cur = next;
            }
            None => {
                let remaining = cnt - 1;
                if remaining == 0 {
                    if let Some(prev) = prev {
                        lb_set_chain(prev, None);
                        arena.free(cur.non_null(), 4);
                    } else {
                        // A lone head never empties here; the caller frees
                        // the whole sub-mask storage instead.
                        lb_set_count(cur, 0);
                        debug_assert!(false, "chain head emptied during remove");
                    }
                } else {
                    lb_set_count(cur, remaining);
                }
                return;
            }
        }
    }
}

/// Demotes a long chain back to one short block when every child shares a
/// window and a fresh block lands in it. Skipped rather than failed on any
/// mismatch.
unsafe fn try_demote_chain(arena: &Arena, n: NodePtr, sub: usize, count: usize) {
    let h = n.header();
    let head = mask_nb_ptr(n, h, sub);
    let mut children: ArrayVec<NodePtr, 32> = ArrayVec::new();
    let mut cur = Some(head);
    while let Some(lb) = cur {
        for idx in 0..lb_count(lb) {
            children.push(lb_slot(lb, idx));
        }
        cur = lb_chain(lb);
    }
    debug_assert_eq!(children.len(), count);
    let upper = children[0].upper();
    if children.iter().any(|c| c.upper() != upper) {
        return;
    }
    // Only when attaching cannot need a promotion (erase must not fail).
    if upper != n.upper() && !is_long(h) {
        return;
    }
    let class = short_class_for(count);
    let Some(raw) = arena.alloc(class) else { return };
    let blk = NodePtr::new(raw);
    if blk.upper() != upper {
        arena.free(raw, class);
        return;
    }
    write_short_block(blk, class, &children);
    free_block_or_chain(arena, head);
    attach_block(arena, n, sub, blk).expect("same-window attach cannot allocate");
}

/// One-class shrink of a short block, a quarter under the lower capacity.
unsafe fn try_shrink_short(arena: &Arena, n: NodePtr, sub: usize, nb: NodePtr, count: usize) {
    let class = nb_tag(nb) as usize;
    if class <= 1 {
        return;
    }
    let lower_cap = CLASS_SIZES[class - 1] / 4;
    if count > lower_cap - lower_cap / 4 {
        return;
    }
    let target = short_class_for(count);
    let Some(raw) = arena.alloc(target) else { return };
    let blk = NodePtr::new(raw);
    if blk.upper() != nb.upper() {
        arena.free(raw, target);
        return;
    }
    let children: ArrayVec<NodePtr, 32> = (0..count).map(|idx| nb_child(nb, idx)).collect();
    write_short_block(blk, target, &children);
    arena.free(nb.non_null(), class);
    attach_block(arena, n, sub, blk).expect("same-window attach cannot allocate");
}

// ---- parent-pointer updates -------------------------------------------

/// Replaces the child for `octet` (whose bit is set) with `new_child`.
pub(crate) fn set_child(
    arena: &Arena,
    n: NodePtr,
    octet: u8,
    new_child: NodePtr,
) -> Result<(), TrieError> {
    unsafe {
        let h = n.header();
        let sub = sub_of(octet);
        let w = mask_bitmap_word(n, sub);
        debug_assert_ne!(w & (1 << bit_of(octet)), 0);
        let pos = popcount32(w & below_mask(bit_of(octet))) as usize;

        if mask_local(n) == sub as u8 {
            if new_child.upper() == n.upper() {
                mask_set_local_slot(n, pos, new_child.lower());
                return Ok(());
            }
            spill_local(arena, n)?;
            return set_child(arena, n, octet, new_child);
        }
        let nb = mask_nb_ptr(n, h, sub);
        if nb_is_long(nb) {
            chain_set(nb, pos, new_child);
            return Ok(());
        }
        if new_child.upper() == nb.upper() {
            nb_set_child_lo(nb, pos, new_child.lower());
            return Ok(());
        }
        let occupied = popcount32(w) as usize;
        let mut children: ArrayVec<NodePtr, 32> =
            (0..occupied).map(|idx| nb_child(nb, idx)).collect();
        children[pos] = new_child;
        let head = build_chain(arena, &children)?;
        free_block_or_chain(arena, nb);
        attach_block(arena, n, sub, head)
    }
}

unsafe fn chain_set(mut lb: NodePtr, mut pos: usize, child: NodePtr) {
    loop {
        let cnt = lb_count(lb);
        if pos < cnt {
            lb_set_slot(lb, pos, child);
            return;
        }
        pos -= cnt;
        lb = lb_chain(lb).expect("set position within chain");
    }
}

// ---- conversions -------------------------------------------------------

/// Writes a mask image for `parts` into the 128-byte node `n`, allocating
/// all next-blocks first so a failure leaves `n` untouched.
unsafe fn init_mask(arena: &Arena, n: NodePtr, parts: &ScanParts) -> Result<(), TrieError> {
    debug_assert!(parts.prefix.is_empty());
    debug_assert!(parts.octets.len() >= 2);

    let mut bitmap = [0u32; 8];
    let mut groups: [ArrayVec<NodePtr, 32>; 8] = std::array::from_fn(|_| ArrayVec::new());
    for (&octet, &child) in parts.octets.iter().zip(parts.children.iter()) {
        bitmap[sub_of(octet)] |= 1 << bit_of(octet);
        groups[sub_of(octet)].push(child);
    }

    let free_built = |blocks: &[Option<NodePtr>; 8]| {
        for blk in blocks.iter().flatten() {
            unsafe { free_block_or_chain(arena, *blk) };
        }
    };

    let mut blocks: [Option<NodePtr>; 8] = [None; 8];
    let mut local: Option<usize> = None;
    for (sub, group) in groups.iter().enumerate() {
        if group.is_empty() {
            continue;
        }
        if local.is_none()
            && group.len() <= MASK_LOCAL_CAP
            && group.iter().all(|c| c.upper() == n.upper())
        {
            local = Some(sub);
            continue;
        }
        match new_block_for(arena, group) {
            Ok(blk) => blocks[sub] = Some(blk),
            Err(e) => {
                free_built(&blocks);
                return Err(e);
            }
        }
    }
    let mut long = blocks.iter().flatten().any(|blk| blk.upper() != n.upper());
    if long {
        if let Some(sub) = local.take() {
            // The upper-half slots displace the local storage.
            match new_block_for(arena, &groups[sub]) {
                Ok(blk) => blocks[sub] = Some(blk),
                Err(e) => {
                    free_built(&blocks);
                    return Err(e);
                }
            }
            long = blocks.iter().flatten().any(|blk| blk.upper() != n.upper());
        }
    }

    n.set_header(mask_header(parts.value.is_some(), long));
    mask_set_count_byte(n, parts.octets.len() as u8);
    let mut used = 0u8;
    for (sub, word) in bitmap.iter().enumerate() {
        mask_set_bitmap_word(n, sub, *word);
        if *word != 0 {
            used |= 1 << sub;
        }
    }
    mask_set_used(n, used);
    mask_set_local(n, local.map_or(LOCAL_NONE, |sub| sub as u8));
    for sub in 0..8 {
        mask_set_nb_lo(n, sub, 0);
        mask_set_nb_hi(n, sub, 0);
    }
    for (sub, blk) in blocks.iter().enumerate() {
        if let Some(blk) = blk {
            mask_set_nb_lo(n, sub, blk.lower());
            if long {
                mask_set_nb_hi(n, sub, blk.upper());
            }
        }
    }
    if let Some(sub) = local {
        for (idx, child) in groups[sub].iter().enumerate() {
            mask_set_local_slot(n, idx, child.lower());
        }
    }
    if let Some(value) = parts.value {
        mask_value_ptr(n).write(value);
    }
    Ok(())
}

/// In-place conversion of a zero-prefix 128-byte scan node. The node's
/// address is preserved, so the parent pointer and all window
/// relationships stay valid.
pub(crate) fn from_parts(arena: &Arena, n: NodePtr, parts: &ScanParts) -> Result<(), TrieError> {
    unsafe {
        let h = n.header();
        debug_assert!(!is_mask(h) && node_size(h) == 128);
        let old_aux = is_long(h).then(|| scan_aux(n, h));
        init_mask(arena, n, parts)?;
        if let Some(aux) = old_aux {
            arena.free(aux.non_null(), super::node::aux_class(aux));
        }
        Ok(())
    }
}

/// A fresh 128-byte mask node for `parts` (prefix handled by the caller).
pub(crate) fn build_node(arena: &Arena, parts: &ScanParts) -> Result<NodePtr, TrieError> {
    let raw = arena.alloc(4).ok_or(TrieError::OutOfMemory)?;
    let n = NodePtr::new(raw);
    let mut stripped = parts.clone();
    stripped.prefix.clear();
    match unsafe { init_mask(arena, n, &stripped) } {
        Ok(()) => Ok(n),
        Err(e) => {
            unsafe { arena.free(raw, 4) };
            Err(e)
        }
    }
}

/// In-place conversion back to a zero-prefix 128-byte scan node; fires
/// when the branch count drops under [`MASK_TO_SCAN`].
pub(crate) fn to_scan(arena: &Arena, n: NodePtr) -> Result<(), TrieError> {
    unsafe {
        let h = n.header();
        debug_assert!(is_mask(h));
        let mut parts = ScanParts::default();
        for_each_child(n, h, |octet, child| {
            parts.octets.push(octet);
            parts.children.push(child);
        });
        if has_value(h) {
            parts.value = Some(mask_value_ptr(n).read());
        }
        let mut doomed: ArrayVec<NodePtr, 8> = ArrayVec::new();
        for sub in 0..8 {
            if mask_used(n) & (1 << sub) != 0 && mask_local(n) != sub as u8 {
                doomed.push(mask_nb_ptr(n, h, sub));
            }
        }
        write_scan(arena, n, 128, &parts, None)?;
        for blk in doomed {
            free_block_or_chain(arena, blk);
        }
        Ok(())
    }
}

/// Next-block population for [`FillProfile`](super::FillProfile).
pub(crate) unsafe fn count_blocks(n: NodePtr, h: u16, profile: &mut FillProfile) {
    for sub in 0..8 {
        if mask_used(n) & (1 << sub) == 0 || mask_local(n) == sub as u8 {
            continue;
        }
        let nb = mask_nb_ptr(n, h, sub);
        if nb_is_long(nb) {
            let mut cur = Some(nb);
            while let Some(lb) = cur {
                profile.long_next_blocks += 1;
                cur = lb_chain(lb);
            }
        } else {
            profile.next_blocks += 1;
        }
    }
}
