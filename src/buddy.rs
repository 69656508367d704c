//! A buddy sub-allocator producing the 8–128-byte aligned node slots the
//! packed node layout depends on.
//!
//! An [`Arena`] carves superblocks obtained from a [`SuperblockSource`] into
//! power-of-two slots of 8, 16, 32, 64 and 128 bytes. Superblocks are
//! aligned to their own size, so the top bits of any in-superblock pointer
//! locate the superblock header. The header occupies the superblock's first
//! chunk(s) and carries a one-bit-per-buddy-pair map per size class; a bit
//! is set while exactly one half of the pair is free, which makes the
//! coalescing decision on free a single bit test. Free blocks are threaded
//! into per-class doubly-linked lists through their own first 16 bytes,
//! which is why the 8-byte class is never handed out on 64-bit targets.
//!
//! A fully free superblock is returned to its source. Out-of-memory is
//! surfaced as `None`; the arena never retries.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use log::debug;

/// Block sizes by size class. Class 0 exists for layout arithmetic but is
/// never allocated on 64-bit targets (a free block must hold two links).
pub const CLASS_SIZES: [usize; 5] = [8, 16, 32, 64, 128];

/// The largest size class, i.e. the raw chunk granularity of a superblock.
pub const MAX_CLASS: usize = 4;

const CHUNK: usize = 128;
const MIN_SUPERBLOCK: usize = 4096;
const MAX_SUPERBLOCK: usize = 4 << 20;

/// Backing allocator for superblocks.
///
/// Implementations must return memory aligned to `align` (the arena always
/// passes `align == size`). The default [`SystemSource`] wraps `std::alloc`;
/// tests substitute sources that place superblocks in chosen address
/// windows to exercise the long-pointer paths.
pub trait SuperblockSource {
    // Sources travel inside the (shareable) arena, so implementations
    // handed to `with_source` must be `Send + Sync`.
    fn superblock_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must originate from `superblock_alloc` on the same source with
    /// the same `size` and `align`, and must not be freed twice.
    unsafe fn superblock_free(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

/// [`SuperblockSource`] over the global allocator.
#[derive(Debug, Default)]
pub struct SystemSource;

impl SuperblockSource for SystemSource {
    fn superblock_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, align).ok()?;
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn superblock_free(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let layout = Layout::from_size_align(size, align).expect("layout was allocatable");
        dealloc(ptr.as_ptr(), layout);
    }
}

/// Superblock header, stored at offset 0 of every superblock and followed by
/// the per-class buddy-pair bitmaps.
#[repr(C)]
struct SbHeader {
    free_bytes: u32,
    capacity: u32,
}

/// Point-in-time arena counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    pub superblocks: usize,
    pub live_bytes: usize,
    pub free_bytes: usize,
}

struct ArenaInner {
    free_heads: [Option<NonNull<u8>>; 5],
    superblocks: Vec<NonNull<u8>>,
    live_bytes: usize,
}

// The raw pointers are exclusively owned superblock memory, only ever
// touched under the arena lock.
unsafe impl Send for ArenaInner {}

/// A node sub-allocator instance.
///
/// Arenas may be shared by several trees; all bookkeeping sits behind one
/// mutex, which is what lets the process-wide default arena be handed out
/// as an `Arc` while each tree itself stays single-owner.
pub struct Arena {
    inner: Mutex<ArenaInner>,
    source: Box<dyn SuperblockSource + Send + Sync>,
    sb_size: usize,
    // Byte offset of each class's pair bitmap inside the header area.
    pair_offs: [usize; 4],
    reserved_chunks: usize,
}

fn default_superblock_size() -> usize {
    page_size::get().clamp(MIN_SUPERBLOCK, MAX_SUPERBLOCK)
}

fn header_layout(sb_size: usize) -> ([usize; 4], usize) {
    let mut offs = [0usize; 4];
    let mut off = std::mem::size_of::<SbHeader>();
    for (class, slot) in offs.iter_mut().enumerate() {
        *slot = off;
        let pairs = sb_size / CLASS_SIZES[class] / 2;
        off += pairs.div_ceil(8);
    }
    (offs, off.div_ceil(CHUNK))
}

impl Arena {
    /// An arena over the global allocator with a page-sized superblock.
    pub fn new() -> Self {
        Self::with_source(Box::new(SystemSource))
    }

    pub fn with_source(source: Box<dyn SuperblockSource + Send + Sync>) -> Self {
        Self::with_superblock_size(source, default_superblock_size())
    }

    /// `sb_size` must be a power of two in the 4 KiB – 4 MiB window.
    pub fn with_superblock_size(
        source: Box<dyn SuperblockSource + Send + Sync>,
        sb_size: usize,
    ) -> Self {
        assert!(sb_size.is_power_of_two());
        assert!((MIN_SUPERBLOCK..=MAX_SUPERBLOCK).contains(&sb_size));
        let (pair_offs, reserved_chunks) = header_layout(sb_size);
        Arena {
            inner: Mutex::new(ArenaInner {
                free_heads: [None; 5],
                superblocks: Vec::new(),
                live_bytes: 0,
            }),
            source,
            sb_size,
            pair_offs,
            reserved_chunks,
        }
    }

    /// The lazily initialised process-wide default arena. Superblocks it
    /// still holds at process exit go back to the operating system with
    /// the process.
    pub fn process_default() -> Arc<Arena> {
        static DEFAULT: OnceLock<Arc<Arena>> = OnceLock::new();
        DEFAULT.get_or_init(|| Arc::new(Arena::new())).clone()
    }

    fn lock(&self) -> MutexGuard<'_, ArenaInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates one block of `class` (1..=4), aligned to its own size and
    /// with its first header word cleared. Returns `None` when the backing
    /// source is exhausted.
    pub fn alloc(&self, class: usize) -> Option<NonNull<u8>> {
        assert!((1..=MAX_CLASS).contains(&class), "class 0 is unused on 64-bit targets");
        let mut inner = self.lock();
        let block = self.alloc_inner(&mut inner, class)?;
        unsafe {
            let header = self.superblock_of(block);
            (*header).free_bytes -= CLASS_SIZES[class] as u32;
            // Clear the node header word; the free bit of a live block.
            std::ptr::write_bytes(block.as_ptr(), 0, 2);
        }
        inner.live_bytes += CLASS_SIZES[class];
        Some(block)
    }

    /// Releases a block back to the arena, coalescing buddies.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Arena::alloc`] on this arena with the same
    /// `class`, and must not be used after this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>, class: usize) {
        debug_assert!((1..=MAX_CLASS).contains(&class));
        let mut inner = self.lock();
        let header = self.superblock_of(ptr);
        (*header).free_bytes += CLASS_SIZES[class] as u32;
        inner.live_bytes -= CLASS_SIZES[class];
        self.free_inner(&mut inner, ptr, class);
        if (*header).free_bytes == (*header).capacity {
            self.release_superblock(&mut inner, header);
        }
    }

    pub fn stats(&self) -> ArenaStats {
        let inner = self.lock();
        let mut free_bytes = 0;
        for &sb in &inner.superblocks {
            free_bytes += unsafe { (*(sb.as_ptr() as *mut SbHeader)).free_bytes as usize };
        }
        ArenaStats {
            superblocks: inner.superblocks.len(),
            live_bytes: inner.live_bytes,
            free_bytes,
        }
    }

    fn alloc_inner(&self, inner: &mut ArenaInner, class: usize) -> Option<NonNull<u8>> {
        if let Some(block) = self.pop_free(inner, class) {
            return Some(block);
        }
        if class == MAX_CLASS {
            self.grow(inner)?;
            return self.pop_free(inner, class);
        }
        // Split one block of the next class; the upper half becomes free.
        let parent = self.alloc_inner(inner, class + 1)?;
        let buddy = unsafe {
            NonNull::new_unchecked(parent.as_ptr().map_addr(|a| a + CLASS_SIZES[class]))
        };
        self.push_free(inner, buddy, class);
        unsafe { self.set_pair_bit(parent, class, true) };
        Some(parent)
    }

    fn free_inner(&self, inner: &mut ArenaInner, block: NonNull<u8>, class: usize) {
        if class == MAX_CLASS {
            self.push_free(inner, block, class);
            return;
        }
        unsafe {
            if self.pair_bit(block, class) {
                // Buddy is free at the same class: merge upward.
                self.set_pair_bit(block, class, false);
                let buddy = self.buddy_of(block, class);
                self.unlink(inner, buddy, class);
                let merged = if block.addr() < buddy.addr() { block } else { buddy };
                self.free_inner(inner, merged, class + 1);
            } else {
                self.set_pair_bit(block, class, true);
                self.push_free(inner, block, class);
            }
        }
    }

    fn grow(&self, inner: &mut ArenaInner) -> Option<()> {
        let base = self.source.superblock_alloc(self.sb_size, self.sb_size)?;
        debug_assert_eq!(base.addr().get() % self.sb_size, 0);
        let chunks = self.sb_size / CHUNK;
        let capacity = ((chunks - self.reserved_chunks) * CHUNK) as u32;
        unsafe {
            // Zero the header area, pair bitmaps included.
            std::ptr::write_bytes(base.as_ptr(), 0, self.reserved_chunks * CHUNK);
            let header = base.as_ptr() as *mut SbHeader;
            (*header).free_bytes = capacity;
            (*header).capacity = capacity;
            for chunk in (self.reserved_chunks..chunks).rev() {
                let block = NonNull::new_unchecked(base.as_ptr().map_addr(|a| a + chunk * CHUNK));
                self.push_free(inner, block, MAX_CLASS);
            }
        }
        inner.superblocks.push(base);
        debug!(
            "arena: acquired {}-byte superblock at {:#x}",
            self.sb_size,
            base.addr()
        );
        Some(())
    }

    fn release_superblock(&self, inner: &mut ArenaInner, header: *mut SbHeader) {
        let base = unsafe { NonNull::new_unchecked(header as *mut u8) };
        let chunks = self.sb_size / CHUNK;
        // A fully free superblock has coalesced back into 128-byte chunks.
        for chunk in self.reserved_chunks..chunks {
            let block =
                unsafe { NonNull::new_unchecked(base.as_ptr().map_addr(|a| a + chunk * CHUNK)) };
            self.unlink(inner, block, MAX_CLASS);
        }
        inner.superblocks.retain(|&sb| sb != base);
        debug!("arena: released superblock at {:#x}", base.addr());
        unsafe { self.source.superblock_free(base, self.sb_size, self.sb_size) };
    }

    fn superblock_of(&self, ptr: NonNull<u8>) -> *mut SbHeader {
        ptr.as_ptr().map_addr(|a| a & !(self.sb_size - 1)) as *mut SbHeader
    }

    fn buddy_of(&self, block: NonNull<u8>, class: usize) -> NonNull<u8> {
        let base = self.superblock_of(block) as usize;
        unsafe {
            NonNull::new_unchecked(
                block
                    .as_ptr()
                    .map_addr(|a| base + ((a - base) ^ CLASS_SIZES[class])),
            )
        }
    }

    unsafe fn pair_bit_slot(&self, block: NonNull<u8>, class: usize) -> (*mut u8, u8) {
        let base = self.superblock_of(block) as *mut u8;
        let offset = block.addr().get() - base.addr();
        let pair = offset / CLASS_SIZES[class] / 2;
        let byte = base.map_addr(|a| a + self.pair_offs[class] + pair / 8);
        (byte, 1 << (pair % 8))
    }

    unsafe fn pair_bit(&self, block: NonNull<u8>, class: usize) -> bool {
        let (byte, mask) = self.pair_bit_slot(block, class);
        *byte & mask != 0
    }

    unsafe fn set_pair_bit(&self, block: NonNull<u8>, class: usize, value: bool) {
        let (byte, mask) = self.pair_bit_slot(block, class);
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }

    // Free-list links live in the block itself: next at offset 0, prev at 8.

    fn pop_free(&self, inner: &mut ArenaInner, class: usize) -> Option<NonNull<u8>> {
        let block = inner.free_heads[class]?;
        unsafe {
            let next = link_next(block);
            inner.free_heads[class] = next;
            if let Some(next) = next {
                set_link_prev(next, None);
            }
            if class < MAX_CLASS {
                self.set_pair_bit(block, class, false);
            }
        }
        Some(block)
    }

    fn push_free(&self, inner: &mut ArenaInner, block: NonNull<u8>, class: usize) {
        unsafe {
            set_link_next(block, inner.free_heads[class]);
            set_link_prev(block, None);
            if let Some(head) = inner.free_heads[class] {
                set_link_prev(head, Some(block));
            }
        }
        inner.free_heads[class] = Some(block);
    }

    fn unlink(&self, inner: &mut ArenaInner, block: NonNull<u8>, class: usize) {
        unsafe {
            let next = link_next(block);
            let prev = link_prev(block);
            match prev {
                Some(prev) => set_link_next(prev, next),
                None => inner.free_heads[class] = next,
            }
            if let Some(next) = next {
                set_link_prev(next, prev);
            }
        }
    }
}

unsafe fn link_next(block: NonNull<u8>) -> Option<NonNull<u8>> {
    NonNull::new((block.as_ptr() as *mut *mut u8).read())
}

unsafe fn link_prev(block: NonNull<u8>) -> Option<NonNull<u8>> {
    NonNull::new((block.as_ptr() as *mut *mut u8).add(1).read())
}

unsafe fn set_link_next(block: NonNull<u8>, next: Option<NonNull<u8>>) {
    (block.as_ptr() as *mut *mut u8).write(next.map_or(std::ptr::null_mut(), NonNull::as_ptr));
}

unsafe fn set_link_prev(block: NonNull<u8>, prev: Option<NonNull<u8>>) {
    (block.as_ptr() as *mut *mut u8)
        .add(1)
        .write(prev.map_or(std::ptr::null_mut(), NonNull::as_ptr));
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        for &sb in &inner.superblocks {
            unsafe { self.source.superblock_free(sb, self.sb_size, self.sb_size) };
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Arena")
            .field("superblock_size", &self.sb_size)
            .field("superblocks", &stats.superblocks)
            .field("live_bytes", &stats.live_bytes)
            .field("free_bytes", &stats.free_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicIsize, Ordering};

    #[test]
    fn alloc_is_class_aligned_and_distinct() {
        let arena = Arena::new();
        let mut seen = Vec::new();
        for class in 1..=MAX_CLASS {
            for _ in 0..16 {
                let block = arena.alloc(class).unwrap();
                assert_eq!(block.addr().get() % CLASS_SIZES[class], 0);
                seen.push((block, class));
            }
        }
        for (i, &(a, ca)) in seen.iter().enumerate() {
            for &(b, cb) in &seen[i + 1..] {
                let (a0, a1) = (a.addr().get(), a.addr().get() + CLASS_SIZES[ca]);
                let (b0, b1) = (b.addr().get(), b.addr().get() + CLASS_SIZES[cb]);
                assert!(a1 <= b0 || b1 <= a0, "overlapping blocks");
            }
        }
        for (block, class) in seen {
            unsafe { arena.free(block, class) };
        }
        assert_eq!(arena.stats().superblocks, 0);
    }

    #[test]
    fn alloc_clears_header_word() {
        let arena = Arena::new();
        let block = arena.alloc(1).unwrap();
        unsafe {
            block.as_ptr().write(0xAA);
            block.as_ptr().add(1).write(0xBB);
            arena.free(block, 1);
        }
        let again = arena.alloc(1).unwrap();
        unsafe {
            assert_eq!(again.as_ptr().read(), 0);
            assert_eq!(again.as_ptr().add(1).read(), 0);
            arena.free(again, 1);
        }
    }

    #[test]
    fn coalescing_releases_superblock() {
        let arena = Arena::new();
        let blocks: Vec<_> = (0..64).map(|_| arena.alloc(1).unwrap()).collect();
        assert_eq!(arena.stats().superblocks, 1);
        let live = arena.stats().live_bytes;
        assert_eq!(live, 64 * 16);
        for block in blocks {
            unsafe { arena.free(block, 1) };
        }
        let stats = arena.stats();
        assert_eq!(stats.superblocks, 0);
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.free_bytes, 0);
    }

    struct CountingSource {
        outstanding: AtomicIsize,
    }

    impl SuperblockSource for CountingSource {
        fn superblock_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
            self.outstanding.fetch_add(1, Ordering::Relaxed);
            SystemSource.superblock_alloc(size, align)
        }
        unsafe fn superblock_free(&self, ptr: NonNull<u8>, size: usize, align: usize) {
            self.outstanding.fetch_sub(1, Ordering::Relaxed);
            SystemSource.superblock_free(ptr, size, align)
        }
    }

    #[test]
    fn source_balance_across_drop() {
        // Leak-check the source ledger: the arena hands every superblock back.
        let source = Box::leak(Box::new(CountingSource {
            outstanding: AtomicIsize::new(0),
        }));
        {
            struct Borrowed(&'static CountingSource);
            impl SuperblockSource for Borrowed {
                fn superblock_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
                    self.0.superblock_alloc(size, align)
                }
                unsafe fn superblock_free(&self, ptr: NonNull<u8>, size: usize, align: usize) {
                    self.0.superblock_free(ptr, size, align)
                }
            }
            let arena = Arena::with_source(Box::new(Borrowed(source)));
            let mut held = Vec::new();
            for class in 1..=MAX_CLASS {
                for _ in 0..100 {
                    held.push((arena.alloc(class).unwrap(), class));
                }
            }
            for (block, class) in held.drain(..37) {
                unsafe { arena.free(block, class) };
            }
            // The rest is reclaimed by Drop.
        }
        assert_eq!(source.outstanding.load(Ordering::Relaxed), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        #[test]
        fn random_alloc_free_stays_disjoint(ops in prop::collection::vec((1usize..=4, any::<bool>(), any::<prop::sample::Index>()), 1..400)) {
            let arena = Arena::new();
            let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
            for (class, is_alloc, index) in ops {
                if is_alloc || live.is_empty() {
                    let block = arena.alloc(class).unwrap();
                    prop_assert_eq!(block.addr().get() % CLASS_SIZES[class], 0);
                    // Fill the block; overlap with a live block would be
                    // caught by the interval check below on later allocs.
                    unsafe { std::ptr::write_bytes(block.as_ptr(), 0x5A, CLASS_SIZES[class]) };
                    live.push((block, class));
                } else {
                    let victim = index.index(live.len());
                    let (block, class) = live.swap_remove(victim);
                    unsafe { arena.free(block, class) };
                }
                let mut spans: Vec<(usize, usize)> = live
                    .iter()
                    .map(|&(b, c)| (b.addr().get(), b.addr().get() + CLASS_SIZES[c]))
                    .collect();
                spans.sort_unstable();
                for pair in spans.windows(2) {
                    prop_assert!(pair[0].1 <= pair[1].0, "overlap");
                }
            }
            let expect_live: usize = live.iter().map(|&(_, c)| CLASS_SIZES[c]).sum();
            prop_assert_eq!(arena.stats().live_bytes, expect_live);
            for (block, class) in live {
                unsafe { arena.free(block, class) };
            }
            prop_assert_eq!(arena.stats().superblocks, 0);
        }
    }
}
