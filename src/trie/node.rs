//! The node layout codec.
//!
//! Every node, auxiliary block and next-block is an untyped 16–128-byte slot
//! from the buddy [`Arena`](crate::buddy::Arena); this module is the only
//! place that knows where the bits live. Everything above it works with
//! [`NodePtr`] handles and the decoded [`ScanParts`] form.
//!
//! Header word (16 bits, little-endian, at offset 0):
//!
//! | bits  | field                                                    |
//! |-------|----------------------------------------------------------|
//! | 0–2   | size code: 1=16, 2=32, 3=64, 4/5=128 scan, 7=128 mask    |
//! | 3     | long-pointer flag                                        |
//! | 4–7   | branch-count low nibble (code 5 contributes bit 4)       |
//! | 8     | has-value                                                |
//! | 9–15  | prefix length (octets)                                   |
//!
//! A scan node packs the prefix octets, the sorted branch octets, the
//! 4-byte-aligned short-pointer array, and — only when a value is present or
//! the node is in long-pointer mode — a tail word occupying the last eight
//! bytes. Short pointers hold the low 32 bits of a child address (the low
//! three bits are zero for nodes and are reused as a tag in next-blocks);
//! the upper 32 bits come from the owning node's own address, or from the
//! pointer-prefix auxiliary when the long flag is set.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use arrayvec::ArrayVec;
use sptr::Strict;

use super::TrieError;
use crate::buddy::{Arena, CLASS_SIZES};

pub(crate) const SC_16: u16 = 1;
pub(crate) const SC_32: u16 = 2;
pub(crate) const SC_64: u16 = 3;
pub(crate) const SC_128_LO: u16 = 4;
pub(crate) const SC_128_HI: u16 = 5;
pub(crate) const SC_MASK: u16 = 7;

const HDR_LONG: u16 = 1 << 3;
const HDR_VALUE: u16 = 1 << 8;

/// Hard branch limits of the 128-byte scan node; the smaller classes are
/// bounded by their packing, not by the header encoding.
pub(crate) const MAX_BRANCH: usize = 25;
pub(crate) const MAX_BRANCH_TAIL: usize = 23;

pub(crate) const MAX_PREFIX: usize = 127;

// Pointer-prefix auxiliary block.
const AUX_LP_OFF: usize = 0;
const AUX_CLASS_OFF: usize = 2;
const AUX_VALUE_OFF: usize = 8;
const AUX_UPPERS_OFF: usize = 16;

// Mask node field offsets (node size is always 128).
pub(crate) const MASK_COUNT_OFF: usize = 2;
pub(crate) const MASK_USED_OFF: usize = 3;
pub(crate) const MASK_LOCAL_OFF: usize = 4;
pub(crate) const MASK_BITMAP_OFF: usize = 8;
pub(crate) const MASK_NB_OFF: usize = 40;
pub(crate) const MASK_HI_OFF: usize = 72;
pub(crate) const MASK_LOCAL_SLOTS_OFF: usize = 72;
pub(crate) const MASK_LOCAL_CAP: usize = 12;
pub(crate) const MASK_VALUE_OFF: usize = 120;
pub(crate) const LOCAL_NONE: u8 = 0xFF;

// Next-block tag values (low three bits of word 0).
pub(crate) const NB_LONG_TAG: u8 = 7;
// Long-pointer next-block: tag word, chain pointer, 14 full child pointers.
pub(crate) const LB_CHAIN_OFF: usize = 8;
pub(crate) const LB_SLOTS_OFF: usize = 16;
pub(crate) const LB_CAP: usize = 14;
/// Three chained long blocks cover a full 32-entry sub-mask.
pub(crate) const LB_MAX_CHAIN: usize = 3;

/// Handle to any arena block: node, pointer-prefix auxiliary or next-block.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodePtr(NonNull<u8>);

impl NodePtr {
    pub(crate) fn new(ptr: NonNull<u8>) -> Self {
        debug_assert_eq!(ptr.addr().get() & 7, 0);
        NodePtr(ptr)
    }

    pub(crate) fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub(crate) fn addr(self) -> usize {
        // Expose the address: short-pointer words round-trip through plain
        // integers, so reconstruction must use exposed provenance.
        self.0.as_ptr().expose_addr()
    }

    pub(crate) fn upper(self) -> u32 {
        (self.addr() >> 32) as u32
    }

    pub(crate) fn lower(self) -> u32 {
        self.addr() as u32
    }

    pub(crate) fn from_parts(upper: u32, lower: u32) -> Self {
        let addr = ((upper as usize) << 32) | (lower & !7) as usize;
        let ptr = sptr::from_exposed_addr_mut::<u8>(addr);
        debug_assert!(!ptr.is_null());
        NodePtr(unsafe { NonNull::new_unchecked(ptr) })
    }

    pub(crate) fn from_addr(addr: usize) -> Self {
        let ptr = sptr::from_exposed_addr_mut::<u8>(addr);
        debug_assert!(!ptr.is_null());
        NodePtr(unsafe { NonNull::new_unchecked(ptr) })
    }

    pub(crate) fn non_null(self) -> NonNull<u8> {
        self.0
    }

    pub(crate) unsafe fn read_u8(self, off: usize) -> u8 {
        self.0.as_ptr().add(off).read()
    }

    pub(crate) unsafe fn write_u8(self, off: usize, v: u8) {
        self.0.as_ptr().add(off).write(v)
    }

    pub(crate) unsafe fn read_u16(self, off: usize) -> u16 {
        debug_assert_eq!(off % 2, 0);
        (self.0.as_ptr().add(off) as *const u16).read()
    }

    pub(crate) unsafe fn write_u16(self, off: usize, v: u16) {
        debug_assert_eq!(off % 2, 0);
        (self.0.as_ptr().add(off) as *mut u16).write(v)
    }

    pub(crate) unsafe fn read_u32(self, off: usize) -> u32 {
        debug_assert_eq!(off % 4, 0);
        (self.0.as_ptr().add(off) as *const u32).read()
    }

    pub(crate) unsafe fn write_u32(self, off: usize, v: u32) {
        debug_assert_eq!(off % 4, 0);
        (self.0.as_ptr().add(off) as *mut u32).write(v)
    }

    pub(crate) unsafe fn read_u64(self, off: usize) -> u64 {
        debug_assert_eq!(off % 8, 0);
        (self.0.as_ptr().add(off) as *const u64).read()
    }

    pub(crate) unsafe fn write_u64(self, off: usize, v: u64) {
        debug_assert_eq!(off % 8, 0);
        (self.0.as_ptr().add(off) as *mut u64).write(v)
    }

    pub(crate) unsafe fn header(self) -> u16 {
        self.read_u16(0)
    }

    pub(crate) unsafe fn set_header(self, h: u16) {
        self.write_u16(0, h)
    }
}

impl std::fmt::Debug for NodePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodePtr({:#x})", self.0.as_ptr() as usize)
    }
}

// ---- header decoding --------------------------------------------------

#[inline]
pub(crate) fn size_code(h: u16) -> u16 {
    h & 7
}

#[inline]
pub(crate) fn is_mask(h: u16) -> bool {
    size_code(h) == SC_MASK
}

#[inline]
pub(crate) fn is_long(h: u16) -> bool {
    h & HDR_LONG != 0
}

#[inline]
pub(crate) fn has_value(h: u16) -> bool {
    h & HDR_VALUE != 0
}

#[inline]
pub(crate) fn branch_len(h: u16) -> usize {
    (((h >> 4) & 0xF) + if size_code(h) == SC_128_HI { 16 } else { 0 }) as usize
}

#[inline]
pub(crate) fn prefix_len(h: u16) -> usize {
    (h >> 9) as usize
}

/// Node byte size from the header.
#[inline]
pub(crate) fn node_size(h: u16) -> usize {
    match size_code(h) {
        SC_16 => 16,
        SC_32 => 32,
        SC_64 => 64,
        SC_128_LO | SC_128_HI | SC_MASK => 128,
        code => unreachable!("bad size code {code}"),
    }
}

/// Buddy size class backing a node of `size` bytes.
#[inline]
pub(crate) fn class_of_size(size: usize) -> usize {
    debug_assert!(size.is_power_of_two() && (16..=128).contains(&size));
    size.trailing_zeros() as usize - 3
}

pub(crate) fn scan_header(
    size: usize,
    prefix_len: usize,
    br_len: usize,
    value: bool,
    long: bool,
) -> u16 {
    debug_assert!(prefix_len <= MAX_PREFIX);
    let code = match size {
        16 => SC_16,
        32 => SC_32,
        64 => SC_64,
        128 => {
            if br_len >= 16 {
                SC_128_HI
            } else {
                SC_128_LO
            }
        }
        _ => unreachable!("bad scan node size {size}"),
    };
    debug_assert!(br_len < 16 || size == 128);
    code | ((long as u16) << 3)
        | (((br_len as u16) & 0xF) << 4)
        | ((value as u16) << 8)
        | ((prefix_len as u16) << 9)
}

pub(crate) fn mask_header(value: bool, long: bool) -> u16 {
    SC_MASK | ((long as u16) << 3) | ((value as u16) << 8)
}

// ---- scan node packing ------------------------------------------------

/// Offset of the short-pointer array for the given prefix and branch count.
#[inline]
pub(crate) fn scan_ptrs_off(prefix_len: usize, br_len: usize) -> usize {
    (2 + prefix_len + br_len + 3) & !3
}

/// Whether `(prefix_len, br_len)` plus an optional tail word (value or
/// pointer-prefix pointer) packs into a node of `size` bytes.
pub(crate) fn scan_fits(prefix_len: usize, br_len: usize, tail: bool, size: usize) -> bool {
    if prefix_len > MAX_PREFIX || br_len > MAX_BRANCH {
        return false;
    }
    if br_len >= 16 && size != 128 {
        return false;
    }
    scan_ptrs_off(prefix_len, br_len) + 4 * br_len + if tail { 8 } else { 0 } <= size
}

/// Smallest size class holding the payload, or `None` when it exceeds 128.
pub(crate) fn scan_min_size(prefix_len: usize, br_len: usize, tail: bool) -> Option<usize> {
    [16usize, 32, 64, 128]
        .into_iter()
        .find(|&size| scan_fits(prefix_len, br_len, tail, size))
}

/// Decoded form of a scan node. Children are full pointers; re-encoding
/// against a new node address is the builder's job. One slot of headroom
/// past the scan maximum lets an insert overfill the parts on its way into
/// a mask conversion.
#[derive(Debug, Default, Clone)]
pub(crate) struct ScanParts {
    pub prefix: ArrayVec<u8, MAX_PREFIX>,
    pub octets: ArrayVec<u8, { MAX_BRANCH + 1 }>,
    pub children: ArrayVec<NodePtr, { MAX_BRANCH + 1 }>,
    pub value: Option<usize>,
}

impl ScanParts {
    pub(crate) fn leaf(prefix: &[u8], value: usize) -> Self {
        let mut parts = ScanParts::default();
        parts.prefix.try_extend_from_slice(prefix).expect("prefix within node bounds");
        parts.value = Some(value);
        parts
    }

    pub(crate) fn insert_branch(&mut self, at: usize, octet: u8, child: NodePtr) {
        self.octets.insert(at, octet);
        self.children.insert(at, child);
    }

    pub(crate) fn remove_branch(&mut self, at: usize) -> NodePtr {
        self.octets.remove(at);
        self.children.remove(at)
    }
}

pub(crate) unsafe fn scan_prefix<'a>(n: NodePtr, h: u16) -> &'a [u8] {
    std::slice::from_raw_parts(n.as_ptr().add(2), prefix_len(h))
}

pub(crate) unsafe fn scan_octets<'a>(n: NodePtr, h: u16) -> &'a [u8] {
    std::slice::from_raw_parts(n.as_ptr().add(2 + prefix_len(h)), branch_len(h))
}

pub(crate) unsafe fn scan_ptr_word(n: NodePtr, h: u16, idx: usize) -> u32 {
    debug_assert!(idx < branch_len(h));
    n.read_u32(scan_ptrs_off(prefix_len(h), branch_len(h)) + 4 * idx)
}

/// The pointer-prefix auxiliary of a long-mode scan node.
pub(crate) unsafe fn scan_aux(n: NodePtr, h: u16) -> NodePtr {
    debug_assert!(is_long(h) && !is_mask(h));
    NodePtr::from_addr(n.read_u64(node_size(h) - 8) as usize)
}

/// Reconstructs the full child pointer at `idx`.
pub(crate) unsafe fn scan_child(n: NodePtr, h: u16, idx: usize) -> NodePtr {
    let lower = scan_ptr_word(n, h, idx);
    let upper = if is_long(h) {
        aux_upper(scan_aux(n, h), idx)
    } else {
        n.upper()
    };
    NodePtr::from_parts(upper, lower)
}

/// Location of the node's value word; only meaningful when `has_value`.
pub(crate) unsafe fn scan_value_ptr(n: NodePtr, h: u16) -> *mut usize {
    if is_long(h) {
        scan_aux(n, h).as_ptr().add(AUX_VALUE_OFF) as *mut usize
    } else {
        n.as_ptr().add(node_size(h) - 8) as *mut usize
    }
}

pub(crate) unsafe fn read_scan(n: NodePtr) -> ScanParts {
    let h = n.header();
    debug_assert!(!is_mask(h));
    let mut parts = ScanParts::default();
    parts
        .prefix
        .try_extend_from_slice(scan_prefix(n, h))
        .expect("prefix length is header-bounded");
    parts
        .octets
        .try_extend_from_slice(scan_octets(n, h))
        .expect("branch length is header-bounded");
    for idx in 0..branch_len(h) {
        parts.children.push(scan_child(n, h, idx));
    }
    if has_value(h) {
        parts.value = Some(scan_value_ptr(n, h).read());
    }
    parts
}

pub(crate) fn aux_size_for_host(host_size: usize) -> usize {
    // A 32-byte auxiliary covers the small hosts; beyond that the host's
    // own class always has room for its maximum branch count.
    if host_size <= 32 {
        32
    } else {
        host_size
    }
}

pub(crate) unsafe fn aux_lp_count(aux: NodePtr) -> usize {
    aux.read_u16(AUX_LP_OFF) as usize
}

pub(crate) unsafe fn aux_class(aux: NodePtr) -> usize {
    aux.read_u8(AUX_CLASS_OFF) as usize
}

pub(crate) unsafe fn aux_upper(aux: NodePtr, idx: usize) -> u32 {
    aux.read_u32(AUX_UPPERS_OFF + 4 * idx)
}

/// Writes `parts` into the already-allocated node `n` of `size` bytes.
///
/// Decides long-pointer mode from the children's upper halves against the
/// node's own; `old_aux` is the node's previous auxiliary (in-place
/// rewrites only — the size class must be unchanged), which is reused or
/// freed as the new mode requires.
///
/// # Safety
///
/// `n` must be a live arena block of `size` bytes and `parts` must satisfy
/// `scan_fits` for the mode the node ends up in.
pub(crate) unsafe fn write_scan(
    arena: &Arena,
    n: NodePtr,
    size: usize,
    parts: &ScanParts,
    old_aux: Option<NodePtr>,
) -> Result<(), TrieError> {
    let p = parts.prefix.len();
    let b = parts.octets.len();
    debug_assert_eq!(b, parts.children.len());
    let lp = parts
        .children
        .iter()
        .filter(|c| c.upper() != n.upper())
        .count();
    let long = lp > 0;
    debug_assert!(scan_fits(p, b, long || parts.value.is_some(), size));

    // Secure the auxiliary before touching the node so an allocation
    // failure leaves the old encoding intact.
    let aux = if long {
        let aux = match old_aux {
            Some(aux) => {
                debug_assert_eq!(CLASS_SIZES[aux_class(aux)], aux_size_for_host(size));
                aux
            }
            None => {
                let aux_size = aux_size_for_host(size);
                let block = arena
                    .alloc(class_of_size(aux_size))
                    .ok_or(TrieError::OutOfMemory)?;
                NodePtr::new(block)
            }
        };
        Some(aux)
    } else {
        if let Some(aux) = old_aux {
            arena.free(aux.non_null(), aux_class(aux));
        }
        None
    };

    n.set_header(scan_header(size, p, b, parts.value.is_some(), long));
    std::ptr::copy_nonoverlapping(parts.prefix.as_ptr(), n.as_ptr().add(2), p);
    std::ptr::copy_nonoverlapping(parts.octets.as_ptr(), n.as_ptr().add(2 + p), b);
    let ptrs = scan_ptrs_off(p, b);
    for (idx, child) in parts.children.iter().enumerate() {
        n.write_u32(ptrs + 4 * idx, child.lower());
    }
    match aux {
        Some(aux) => {
            aux.write_u16(AUX_LP_OFF, lp as u16);
            aux.write_u8(AUX_CLASS_OFF, class_of_size(aux_size_for_host(size)) as u8);
            aux.write_u64(AUX_VALUE_OFF, parts.value.unwrap_or(0) as u64);
            for (idx, child) in parts.children.iter().enumerate() {
                aux.write_u32(AUX_UPPERS_OFF + 4 * idx, child.upper());
            }
            n.write_u64(size - 8, aux.addr() as u64);
        }
        None => {
            if let Some(value) = parts.value {
                n.write_u64(size - 8, value as u64);
            }
        }
    }
    Ok(())
}

/// Why a scan node could not be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BuildError {
    /// The payload exceeds the 128-byte class (caller converts or re-cuts).
    Overflow,
    Oom,
}

/// Allocates and writes a fresh scan node of minimum size class.
///
/// The node's own address decides whether long-pointer mode is needed, so
/// the allocation may have to be retried one class up when the first
/// placement demands a tail word the class cannot hold.
pub(crate) fn build_scan(arena: &Arena, parts: &ScanParts) -> Result<NodePtr, BuildError> {
    let p = parts.prefix.len();
    let b = parts.octets.len();
    let mut tail = parts.value.is_some();
    loop {
        let size = scan_min_size(p, b, tail).ok_or(BuildError::Overflow)?;
        let block = arena.alloc(class_of_size(size)).ok_or(BuildError::Oom)?;
        let n = NodePtr::new(block);
        let long = parts.children.iter().any(|c| c.upper() != n.upper());
        if long && !scan_fits(p, b, true, size) {
            unsafe { arena.free(n.non_null(), class_of_size(size)) };
            if tail {
                return Err(BuildError::Overflow);
            }
            tail = true;
            continue;
        }
        unsafe {
            write_scan(arena, n, size, parts, None).map_err(|_| BuildError::Oom)?;
        }
        return Ok(n);
    }
}

/// Frees a scan node together with its auxiliary (children untouched).
pub(crate) unsafe fn free_scan(arena: &Arena, n: NodePtr) {
    let h = n.header();
    debug_assert!(!is_mask(h));
    if is_long(h) {
        let aux = scan_aux(n, h);
        arena.free(aux.non_null(), aux_class(aux));
    }
    arena.free(n.non_null(), class_of_size(node_size(h)));
}

// ---- mask node raw fields ---------------------------------------------

pub(crate) unsafe fn mask_bitmap_word(n: NodePtr, sub: usize) -> u32 {
    n.read_u32(MASK_BITMAP_OFF + 4 * sub)
}

pub(crate) unsafe fn mask_set_bitmap_word(n: NodePtr, sub: usize, w: u32) {
    n.write_u32(MASK_BITMAP_OFF + 4 * sub, w)
}

pub(crate) unsafe fn mask_used(n: NodePtr) -> u8 {
    n.read_u8(MASK_USED_OFF)
}

pub(crate) unsafe fn mask_set_used(n: NodePtr, used: u8) {
    n.write_u8(MASK_USED_OFF, used)
}

pub(crate) unsafe fn mask_count_byte(n: NodePtr) -> u8 {
    n.read_u8(MASK_COUNT_OFF)
}

pub(crate) unsafe fn mask_set_count_byte(n: NodePtr, count: u8) {
    n.write_u8(MASK_COUNT_OFF, count)
}

pub(crate) unsafe fn mask_local(n: NodePtr) -> u8 {
    n.read_u8(MASK_LOCAL_OFF)
}

pub(crate) unsafe fn mask_set_local(n: NodePtr, sub: u8) {
    n.write_u8(MASK_LOCAL_OFF, sub)
}

pub(crate) unsafe fn mask_nb_lo(n: NodePtr, sub: usize) -> u32 {
    n.read_u32(MASK_NB_OFF + 4 * sub)
}

pub(crate) unsafe fn mask_set_nb_lo(n: NodePtr, sub: usize, lo: u32) {
    n.write_u32(MASK_NB_OFF + 4 * sub, lo)
}

pub(crate) unsafe fn mask_nb_hi(n: NodePtr, sub: usize) -> u32 {
    n.read_u32(MASK_HI_OFF + 4 * sub)
}

pub(crate) unsafe fn mask_set_nb_hi(n: NodePtr, sub: usize, hi: u32) {
    n.write_u32(MASK_HI_OFF + 4 * sub, hi)
}

pub(crate) unsafe fn mask_local_slot(n: NodePtr, idx: usize) -> u32 {
    debug_assert!(idx < MASK_LOCAL_CAP);
    n.read_u32(MASK_LOCAL_SLOTS_OFF + 4 * idx)
}

pub(crate) unsafe fn mask_set_local_slot(n: NodePtr, idx: usize, lo: u32) {
    debug_assert!(idx < MASK_LOCAL_CAP);
    n.write_u32(MASK_LOCAL_SLOTS_OFF + 4 * idx, lo)
}

pub(crate) unsafe fn mask_value_ptr(n: NodePtr) -> *mut usize {
    n.as_ptr().add(MASK_VALUE_OFF) as *mut usize
}

/// Full pointer to the next-block of a populated sub-mask.
pub(crate) unsafe fn mask_nb_ptr(n: NodePtr, h: u16, sub: usize) -> NodePtr {
    let upper = if is_long(h) {
        mask_nb_hi(n, sub)
    } else {
        n.upper()
    };
    NodePtr::from_parts(upper, mask_nb_lo(n, sub))
}

// ---- next-blocks ------------------------------------------------------

pub(crate) unsafe fn nb_tag(nb: NodePtr) -> u8 {
    (nb.read_u32(0) & 7) as u8
}

pub(crate) unsafe fn nb_is_long(nb: NodePtr) -> bool {
    nb_tag(nb) == NB_LONG_TAG
}

/// Capacity (in short child pointers) of a short next-block.
pub(crate) unsafe fn nb_capacity(nb: NodePtr) -> usize {
    let class = nb_tag(nb) as usize;
    debug_assert!((1..=4).contains(&class));
    CLASS_SIZES[class] / 4
}

pub(crate) unsafe fn nb_child_lo(nb: NodePtr, idx: usize) -> u32 {
    let w = nb.read_u32(4 * idx);
    if idx == 0 {
        w & !7
    } else {
        w
    }
}

pub(crate) unsafe fn nb_set_child_lo(nb: NodePtr, idx: usize, lo: u32) {
    debug_assert_eq!(lo & 7, 0);
    if idx == 0 {
        let tag = nb.read_u32(0) & 7;
        nb.write_u32(0, lo | tag);
    } else {
        nb.write_u32(4 * idx, lo);
    }
}

pub(crate) unsafe fn nb_child(nb: NodePtr, idx: usize) -> NodePtr {
    NodePtr::from_parts(nb.upper(), nb_child_lo(nb, idx))
}

// Long-pointer next-blocks: 128 bytes, tag 7 plus an entry count in word 0,
// a full chain pointer, and LB_CAP full child pointers.

pub(crate) unsafe fn lb_count(lb: NodePtr) -> usize {
    ((lb.read_u32(0) >> 3) & 0x3F) as usize
}

pub(crate) unsafe fn lb_set_count(lb: NodePtr, count: usize) {
    debug_assert!(count <= LB_CAP);
    lb.write_u32(0, NB_LONG_TAG as u32 | ((count as u32) << 3));
}

pub(crate) unsafe fn lb_chain(lb: NodePtr) -> Option<NodePtr> {
    let addr = lb.read_u64(LB_CHAIN_OFF) as usize;
    (addr != 0).then(|| NodePtr::from_addr(addr))
}

pub(crate) unsafe fn lb_set_chain(lb: NodePtr, next: Option<NodePtr>) {
    lb.write_u64(LB_CHAIN_OFF, next.map_or(0, |n| n.addr() as u64));
}

pub(crate) unsafe fn lb_slot(lb: NodePtr, idx: usize) -> NodePtr {
    debug_assert!(idx < LB_CAP);
    NodePtr::from_addr(lb.read_u64(LB_SLOTS_OFF + 8 * idx) as usize)
}

pub(crate) unsafe fn lb_set_slot(lb: NodePtr, idx: usize, child: NodePtr) {
    debug_assert!(idx < LB_CAP);
    lb.write_u64(LB_SLOTS_OFF + 8 * idx, child.addr() as u64);
}

// ---- branch finder ----------------------------------------------------

/// Position of `key` in a sorted octet array: `Ok(found)` / `Err(insert)`.
pub(crate) type FindFn = fn(&[u8], u8) -> Result<usize, usize>;

pub(crate) fn find_branch_generic(octets: &[u8], key: u8) -> Result<usize, usize> {
    for (idx, &octet) in octets.iter().enumerate() {
        if octet == key {
            return Ok(idx);
        }
        if octet > key {
            return Err(idx);
        }
    }
    Err(octets.len())
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn find_branch_sse2(octets: &[u8], key: u8) -> Result<usize, usize> {
    use core::arch::x86_64::*;
    unsafe {
        let needle = _mm_set1_epi8(key as i8);
        let bias = _mm_set1_epi8(i8::MIN);
        let needle_biased = _mm_xor_si128(needle, bias);
        let mut idx = 0;
        while idx + 16 <= octets.len() {
            let chunk = _mm_loadu_si128(octets.as_ptr().add(idx) as *const __m128i);
            let eq = _mm_movemask_epi8(_mm_cmpeq_epi8(chunk, needle)) as u32;
            if eq != 0 {
                return Ok(idx + eq.trailing_zeros() as usize);
            }
            // Biasing both sides turns the signed byte compare unsigned.
            let gt = _mm_movemask_epi8(_mm_cmpgt_epi8(
                _mm_xor_si128(chunk, bias),
                needle_biased,
            )) as u32;
            if gt != 0 {
                return Err(idx + gt.trailing_zeros() as usize);
            }
            idx += 16;
        }
        while idx < octets.len() {
            let octet = *octets.get_unchecked(idx);
            if octet == key {
                return Ok(idx);
            }
            if octet > key {
                return Err(idx);
            }
            idx += 1;
        }
        Err(octets.len())
    }
}

static FINDER: AtomicPtr<()> = AtomicPtr::new(std::ptr::null_mut());

fn default_finder() -> FindFn {
    #[cfg(target_arch = "x86_64")]
    {
        find_branch_sse2
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        find_branch_generic
    }
}

/// Runtime off switch: force the generic branch finder (or restore the
/// platform default). Used by tests to cover both code paths.
pub fn set_generic_branch_finder(generic: bool) {
    let f: FindFn = if generic {
        find_branch_generic
    } else {
        default_finder()
    };
    FINDER.store(f as *mut (), Ordering::Relaxed);
}

#[inline]
pub(crate) fn find_branch(octets: &[u8], key: u8) -> Result<usize, usize> {
    let mut f = FINDER.load(Ordering::Relaxed);
    if f.is_null() {
        f = default_finder() as *mut ();
        FINDER.store(f, Ordering::Relaxed);
    }
    let f: FindFn = unsafe { std::mem::transmute(f) };
    f(octets, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_roundtrip() {
        for &(size, p, b, v, long) in &[
            (16usize, 0usize, 1usize, false, false),
            (16, 6, 0, true, false),
            (32, 4, 4, false, false),
            (64, 10, 10, false, true),
            (128, 0, 25, false, false),
            (128, 0, 23, true, false),
            (128, 118, 0, true, false),
            (128, 127, 0, false, false),
        ] {
            let h = scan_header(size, p, b, v, long);
            assert_eq!(node_size(h), size);
            assert_eq!(prefix_len(h), p);
            assert_eq!(branch_len(h), b);
            assert_eq!(has_value(h), v);
            assert_eq!(is_long(h), long);
            assert!(!is_mask(h));
        }
        let mh = mask_header(true, false);
        assert!(is_mask(mh));
        assert!(has_value(mh));
        assert_eq!(node_size(mh), 128);
    }

    #[test]
    fn packing_capacities() {
        // The numbers the layout is tuned around: 25 branches bare, 23 with
        // a value or auxiliary pointer in the tail word.
        assert!(scan_fits(0, 25, false, 128));
        assert!(!scan_fits(0, 26, false, 128));
        assert!(scan_fits(0, 23, true, 128));
        assert!(!scan_fits(0, 24, true, 128));
        assert_eq!(scan_min_size(0, 0, true), Some(16));
        assert_eq!(scan_min_size(6, 0, true), Some(16));
        assert_eq!(scan_min_size(7, 0, true), Some(32));
        assert_eq!(scan_min_size(22, 0, true), Some(32));
        assert_eq!(scan_min_size(54, 0, true), Some(64));
        assert_eq!(scan_min_size(118, 0, true), Some(128));
        assert_eq!(scan_min_size(119, 0, true), None);
        assert_eq!(scan_min_size(0, 12, false), Some(64));
        assert_eq!(scan_min_size(0, 13, false), Some(128));
    }

    #[test]
    fn short_pointer_roundtrip() {
        let arena = Arena::new();
        let block = arena.alloc(2).unwrap();
        let n = NodePtr::new(block);
        let rebuilt = NodePtr::from_parts(n.upper(), n.lower());
        assert_eq!(rebuilt.addr(), n.addr());
        unsafe { arena.free(block, 2) };
    }

    #[test]
    fn scan_write_read_roundtrip() {
        let arena = Arena::new();
        let leaf_a = NodePtr::new(arena.alloc(1).unwrap());
        let leaf_b = NodePtr::new(arena.alloc(1).unwrap());
        let mut parts = ScanParts::leaf(b"abc", 7);
        let (first, second) = if leaf_a.addr() < leaf_b.addr() {
            (leaf_a, leaf_b)
        } else {
            (leaf_b, leaf_a)
        };
        parts.insert_branch(0, b'x', first);
        parts.insert_branch(1, b'y', second);
        let n = build_scan(&arena, &parts).unwrap();
        unsafe {
            let h = n.header();
            assert_eq!(scan_prefix(n, h), b"abc");
            assert_eq!(scan_octets(n, h), b"xy");
            assert_eq!(scan_child(n, h, 0), first);
            assert_eq!(scan_child(n, h, 1), second);
            assert_eq!(scan_value_ptr(n, h).read(), 7);
            let reread = read_scan(n);
            assert_eq!(reread.prefix.as_slice(), b"abc");
            assert_eq!(reread.octets.as_slice(), b"xy");
            assert_eq!(reread.value, Some(7));
            free_scan(&arena, n);
            arena.free(leaf_a.non_null(), 1);
            arena.free(leaf_b.non_null(), 1);
        }
    }

    proptest! {
        #[test]
        fn finders_agree(
            mut octets in prop::collection::vec(any::<u8>(), 0..26),
            key in any::<u8>(),
        ) {
            octets.sort_unstable();
            octets.dedup();
            let generic = find_branch_generic(&octets, key);
            #[cfg(target_arch = "x86_64")]
            prop_assert_eq!(find_branch_sse2(&octets, key), generic);
            // Both outcomes describe a sorted position.
            match generic {
                Ok(found) => prop_assert_eq!(octets[found], key),
                Err(at) => {
                    if at > 0 {
                        prop_assert!(octets[at - 1] < key);
                    }
                    if at < octets.len() {
                        prop_assert!(octets[at] > key);
                    }
                }
            }
        }
    }
}
