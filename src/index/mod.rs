//! Hot-reloadable IP range index.
//!
//! This module provides [`RangeIndex`], the shared containment structure
//! every protocol server of an endpoint queries:
//! - Lock-free reads through an atomically swapped [`PrefixTrie`]
//! - Wholesale reload that builds the new trie before publishing it
//! - Copy-on-write single-prefix inserts

mod trie;


pub use trie::PrefixTrie;

use arc_swap::{ArcSwap, Guard};
use ipnet::IpNet;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Concurrency-safe CIDR containment index with hot reload support.
///
/// Readers load the current trie without locking. Writers (`reload` and
/// `insert`) serialize on a mutex that is held only for the publish, never
/// for building a trie from a prefix list.
///
/// # Example
///
/// ```
/// use rangegate::RangeIndex;
///
/// let index = RangeIndex::build(&["10.0.0.0/24".parse().unwrap()]);
/// assert!(index.contains("10.0.0.1".parse().unwrap()));
///
/// index.reload(&["192.168.0.0/16".parse().unwrap()]);
/// assert!(!index.contains("10.0.0.1".parse().unwrap()));
/// assert!(index.contains("192.168.3.4".parse().unwrap()));
/// ```
pub struct RangeIndex {
    /// The published trie, wrapped in ArcSwap for atomic replacement.
    current: ArcSwap<PrefixTrie>,
    /// Serializes writers so an insert never races a reload.
    writer: Mutex<()>,
    /// Incremented on every publish.
    generation: AtomicU64,
}

impl Default for RangeIndex {
    fn default() -> Self {
        Self::from_trie(PrefixTrie::new())
    }
}

impl RangeIndex {
    /// Build a fully populated index from a list of prefixes.
    pub fn build(prefixes: &[IpNet]) -> Self {
        Self::from_trie(PrefixTrie::from_prefixes(prefixes))
    }

    /// Wrap an already built trie.
    pub fn from_trie(trie: PrefixTrie) -> Self {
        Self {
            current: ArcSwap::from_pointee(trie),
            writer: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Check whether `ip` falls inside any stored prefix.
    #[inline]
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.current.load().contains(ip)
    }

    /// Replace the whole prefix set.
    ///
    /// The new trie is built before the writer lock is taken. Queries that
    /// already loaded the old trie finish against it; queries starting after
    /// this call returns see the new one.
    pub fn reload(&self, prefixes: &[IpNet]) {
        let trie = PrefixTrie::from_prefixes(prefixes);
        let (v4, v6) = (trie.v4_count(), trie.v6_count());

        let _guard = self.writer.lock();
        self.current.store(Arc::new(trie));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        log::info!(
            "Reloaded range index: {} IPv4 + {} IPv6 prefixes (generation {})",
            v4,
            v6,
            generation
        );
    }

    /// Add one prefix to the live index.
    ///
    /// The current trie is cloned, extended and republished, so this is far
    /// costlier than [`contains`](Self::contains) and takes the writer lock
    /// for the whole copy. Returns `false` if the prefix was already covered.
    pub fn insert(&self, net: IpNet) -> bool {
        let _guard = self.writer.lock();
        let mut trie = PrefixTrie::clone(&self.current.load());
        if !trie.insert(net) {
            return false;
        }
        self.current.store(Arc::new(trie));
        self.generation.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Get a guard on the currently published trie.
    ///
    /// Holding the guard pins that trie; it is freed once the last guard or
    /// `Arc` referring to it is dropped.
    pub fn snapshot(&self) -> Guard<Arc<PrefixTrie>> {
        self.current.load()
    }

    /// Number of publishes since construction.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Get the number of stored prefixes.
    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    /// Check if the index holds no prefixes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for RangeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeIndex")
            .field("prefixes", &self.len())
            .field("generation", &self.generation())
            .finish()
    }
}
