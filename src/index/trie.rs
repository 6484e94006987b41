//! Binary prefix trie for CIDR containment.

use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Child slot value meaning "no child". The root lives at index 0 and is
/// never anyone's child, so 0 is free to use as the sentinel.
const NO_CHILD: u32 = 0;

#[derive(Debug, Clone, Copy, Default)]
struct Node {
    children: [u32; 2],
    terminal: bool,
}

/// One address family's trie. Keys are left-aligned in a `u128`, so the
/// same walk serves 32-bit and 128-bit addresses.
#[derive(Debug, Clone)]
struct BitTrie {
    nodes: Vec<Node>,
    prefixes: usize,
}

impl BitTrie {
    fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
            prefixes: 0,
        }
    }

    fn insert(&mut self, key: u128, prefix_len: u8) -> bool {
        let mut idx = 0usize;
        for depth in 0..prefix_len {
            if self.nodes[idx].terminal {
                // Already covered by a shorter prefix
                return false;
            }
            let bit = bit_at(key, depth);
            idx = match self.nodes[idx].children[bit] {
                NO_CHILD => {
                    let child = self.nodes.len() as u32;
                    self.nodes.push(Node::default());
                    self.nodes[idx].children[bit] = child;
                    child as usize
                }
                child => child as usize,
            };
        }

        if self.nodes[idx].terminal {
            return false;
        }

        // Everything below a terminal node is redundant
        let dropped = self.count_terminals_below(idx);
        self.nodes[idx].children = [NO_CHILD; 2];
        self.nodes[idx].terminal = true;
        self.prefixes = self.prefixes + 1 - dropped;
        true
    }

    fn contains(&self, key: u128, width: u8) -> bool {
        let mut idx = 0usize;
        for depth in 0..width {
            let node = &self.nodes[idx];
            if node.terminal {
                return true;
            }
            match node.children[bit_at(key, depth)] {
                NO_CHILD => return false,
                child => idx = child as usize,
            }
        }
        self.nodes[idx].terminal
    }

    fn count_terminals_below(&self, idx: usize) -> usize {
        let mut count = 0;
        let mut stack: Vec<u32> = self.nodes[idx]
            .children
            .iter()
            .copied()
            .filter(|&c| c != NO_CHILD)
            .collect();
        while let Some(child) = stack.pop() {
            let node = &self.nodes[child as usize];
            if node.terminal {
                count += 1;
            }
            stack.extend(node.children.iter().copied().filter(|&c| c != NO_CHILD));
        }
        count
    }
}

#[inline]
fn bit_at(key: u128, depth: u8) -> usize {
    ((key >> (127 - u32::from(depth))) & 1) as usize
}

#[inline]
fn v4_key(addr: Ipv4Addr) -> u128 {
    u128::from(u32::from(addr)) << 96
}

#[inline]
fn v6_key(addr: Ipv6Addr) -> u128 {
    u128::from(addr)
}

/// Immutable-once-published containment structure over IPv4 and IPv6 CIDR
/// blocks.
///
/// Matching is boolean: an address is contained when any stored prefix is
/// an ancestor of it in the bit trie. Redundant prefixes (covered by a
/// shorter one) are not stored.
///
/// # Examples
/// ```
/// use rangegate::index::PrefixTrie;
///
/// let nets = ["10.0.0.0/24".parse().unwrap(), "fc00::/7".parse().unwrap()];
/// let trie = PrefixTrie::from_prefixes(&nets);
/// assert!(trie.contains("10.0.0.255".parse().unwrap()));
/// assert!(!trie.contains("10.0.1.0".parse().unwrap()));
/// assert!(trie.contains("fd00::1".parse().unwrap()));
/// ```
#[derive(Debug, Clone)]
pub struct PrefixTrie {
    v4: BitTrie,
    v6: BitTrie,
}

impl Default for PrefixTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl PrefixTrie {
    /// Create an empty trie.
    pub fn new() -> Self {
        Self {
            v4: BitTrie::new(),
            v6: BitTrie::new(),
        }
    }

    /// Build a trie from a list of prefixes.
    ///
    /// Shorter prefixes are inserted first so covered entries never allocate
    /// nodes.
    pub fn from_prefixes(prefixes: &[IpNet]) -> Self {
        let mut sorted: Vec<&IpNet> = prefixes.iter().collect();
        sorted.sort_by_key(|net| net.prefix_len());

        let mut trie = Self::new();
        for net in sorted {
            trie.insert(*net);
        }
        trie
    }

    /// Insert a prefix. Returns `false` if it was already covered.
    pub fn insert(&mut self, net: IpNet) -> bool {
        match net.trunc() {
            IpNet::V4(n) => self.v4.insert(v4_key(n.network()), n.prefix_len()),
            IpNet::V6(n) => self.v6.insert(v6_key(n.network()), n.prefix_len()),
        }
    }

    /// Check whether `ip` falls inside any stored prefix.
    #[inline]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.v4.contains(v4_key(v4), 32),
            IpAddr::V6(v6) => self.v6.contains(v6_key(v6), 128),
        }
    }

    /// Get the number of stored IPv4 prefixes.
    pub fn v4_count(&self) -> usize {
        self.v4.prefixes
    }

    /// Get the number of stored IPv6 prefixes.
    pub fn v6_count(&self) -> usize {
        self.v6.prefixes
    }

    /// Get the total number of stored prefixes.
    pub fn len(&self) -> usize {
        self.v4_count() + self.v6_count()
    }

    /// Check if the trie holds no prefixes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie(entries: &[&str]) -> PrefixTrie {
        let nets: Vec<IpNet> = entries.iter().map(|e| e.parse().unwrap()).collect();
        PrefixTrie::from_prefixes(&nets)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ipv4_boundaries() {
        let t = trie(&["10.0.0.0/24"]);

        assert!(t.contains(ip("10.0.0.0")));
        assert!(t.contains(ip("10.0.0.255")));
        assert!(!t.contains(ip("10.0.1.0")));
        assert!(!t.contains(ip("9.255.255.255")));
    }

    #[test]
    fn test_single_address_prefix() {
        let t = trie(&["192.168.1.5/32", "2001:db8::1/128"]);

        assert!(t.contains(ip("192.168.1.5")));
        assert!(!t.contains(ip("192.168.1.4")));
        assert!(!t.contains(ip("192.168.1.6")));
        assert!(t.contains(ip("2001:db8::1")));
        assert!(!t.contains(ip("2001:db8::2")));
    }

    #[test]
    fn test_ipv6_ranges() {
        let t = trie(&["fc00::/7", "2001:db8::/32"]);

        assert!(t.contains(ip("fc00::1")));
        assert!(t.contains(ip("fdff:ffff::1")));
        assert!(t.contains(ip("2001:db8:ffff::1")));
        assert!(!t.contains(ip("2001:4860::1")));
        assert!(!t.contains(ip("::1")));
    }

    #[test]
    fn test_families_are_separate() {
        let t = trie(&["0.0.0.0/0"]);

        assert!(t.contains(ip("8.8.8.8")));
        assert!(!t.contains(ip("::1")));
        assert!(!t.contains(ip("::ffff:8.8.8.8")));
    }

    #[test]
    fn test_default_route_v6() {
        let t = trie(&["::/0"]);
        assert!(t.contains(ip("2001:4860::1")));
        assert!(!t.contains(ip("1.1.1.1")));
    }

    #[test]
    fn test_host_bits_are_masked() {
        let t = trie(&["10.0.0.7/24"]);
        assert!(t.contains(ip("10.0.0.200")));
    }

    #[test]
    fn test_covered_prefix_is_not_stored() {
        let mut t = trie(&["10.0.0.0/8"]);
        assert!(!t.insert("10.1.0.0/16".parse().unwrap()));
        assert_eq!(t.v4_count(), 1);
    }

    #[test]
    fn test_shorter_prefix_prunes_longer() {
        let mut t = PrefixTrie::new();
        assert!(t.insert("10.1.0.0/16".parse().unwrap()));
        assert!(t.insert("10.2.3.0/24".parse().unwrap()));
        assert_eq!(t.len(), 2);

        assert!(t.insert("10.0.0.0/8".parse().unwrap()));
        assert_eq!(t.len(), 1);
        assert!(t.contains(ip("10.200.0.1")));
    }

    #[test]
    fn test_duplicate_insert() {
        let mut t = PrefixTrie::new();
        assert!(t.insert("1.2.3.4/32".parse().unwrap()));
        assert!(!t.insert("1.2.3.4/32".parse().unwrap()));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_empty_trie() {
        let t = PrefixTrie::new();
        assert!(t.is_empty());
        assert!(!t.contains(ip("0.0.0.0")));
        assert!(!t.contains(ip("::")));
    }

    #[test]
    fn test_every_address_in_small_range() {
        let t = trie(&["172.16.4.0/22"]);
        for third in 0u8..=255 {
            let addr = IpAddr::V4(Ipv4Addr::new(172, 16, third, 17));
            assert_eq!(t.contains(addr), (4..8).contains(&third), "{}", addr);
        }
    }
}
