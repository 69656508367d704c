//! A cache-conscious, in-memory associative container keyed by arbitrary
//! byte strings.
//!
//! The container is an octet-stride radix tree: every edge consumes one byte
//! of the key, long unary paths are compressed into per-node prefixes, and
//! each key maps to a single machine word. Interior nodes come in five size
//! classes (8 to 128 bytes) and two structural variants — a linear-scan node
//! with a sorted branch array, and a 256-wide bitmap node for dense fanout —
//! both bit-packed so that a lookup touches one cache line per level.
//! Nodes live in a small buddy sub-allocator ([`buddy::Arena`]) that carves
//! aligned slots out of page-sized superblocks.
//!
//! Child pointers are stored as 32-bit "short" pointers; when a child lands
//! in a different 4 GiB window than its parent, the parent grows an auxiliary
//! block carrying the upper pointer halves. This, and the low-bit tag
//! packing, assume a 64-bit little-endian target.
//!
//! ```
//! use octrie::Trie;
//!
//! let mut trie = Trie::new(1024);
//! trie.insert(b"hello", 1).unwrap();
//! trie.insert(b"help", 2).unwrap();
//! assert_eq!(trie.find(b"hello"), Some(&1));
//! assert_eq!(trie.findnear(b"helpful"), Some((&2, 4)));
//! assert_eq!(trie.erase(b"hello"), Some(1));
//! ```
#![allow(unstable_name_collisions)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("octrie short/long pointer packing requires a 64-bit target");

pub mod bits;
pub mod buddy;
pub mod trie;

pub use buddy::{Arena, ArenaStats, SuperblockSource};
pub use trie::check::SanityError;
pub use trie::cursor::{Cursor, Iter};
pub use trie::{set_generic_branch_finder, FillProfile, KeyMode, Trie, TrieError};
