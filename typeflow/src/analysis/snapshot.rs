//! Persistent, branchable key/value snapshots
//!
//! A snapshot records only the entries written while it was open and links
//! to the snapshot it was derived from, so deriving is O(1) and a sealed
//! snapshot stays readable for as long as the table lives. Merging several
//! snapshots recomputes just the keys written since their common ancestor;
//! every other key already agrees across all parents.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Handle of a sealed snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Snapshot(u32);

#[derive(Debug)]
struct Node<K, V> {
    parent: Option<Snapshot>,
    depth: u32,
    entries: HashMap<K, V>,
}

/// Table of snapshots with exactly one open (writable) snapshot at a time
///
/// Keys never written read as `V::default()`.
#[derive(Debug)]
pub struct SnapshotTable<K, V> {
    nodes: Vec<Node<K, V>>,
    open: Node<K, V>,
}

impl<K, V> SnapshotTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy + Default + PartialEq,
{
    /// Create a table whose open snapshot is an empty root
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            open: Self::root(),
        }
    }

    fn root() -> Node<K, V> {
        Node {
            parent: None,
            depth: 0,
            entries: HashMap::new(),
        }
    }

    fn node(&self, snapshot: Snapshot) -> &Node<K, V> {
        &self.nodes[snapshot.0 as usize]
    }

    /// Replace the open snapshot with a new one built from `parents`
    ///
    /// No parents starts an empty root and one parent derives from it. With
    /// several parents, every key written on some path since their common
    /// ancestor is set to `merge(key, values)`, where `values` holds the
    /// key's value in each parent, in order. Unsealed writes of the previous
    /// open snapshot are discarded.
    pub fn start_new_snapshot<F>(&mut self, parents: &[Snapshot], mut merge: F)
    where
        F: FnMut(K, &[V]) -> V,
    {
        match parents {
            [] => self.open = Self::root(),
            [parent] => {
                self.open = Node {
                    parent: Some(*parent),
                    depth: self.node(*parent).depth + 1,
                    entries: HashMap::new(),
                };
            }
            [first, rest @ ..] => {
                let ancestor = rest
                    .iter()
                    .try_fold(*first, |acc, &next| self.common_ancestor(acc, next));

                let mut changed: HashSet<K> = HashSet::new();
                for &parent in parents {
                    let mut cursor = Some(parent);
                    while let Some(current) = cursor {
                        if Some(current) == ancestor {
                            break;
                        }
                        let node = self.node(current);
                        changed.extend(node.entries.keys().copied());
                        cursor = node.parent;
                    }
                }

                let mut entries = HashMap::with_capacity(changed.len());
                let mut values = Vec::with_capacity(parents.len());
                for key in changed {
                    values.clear();
                    values.extend(parents.iter().map(|&p| self.get_in(p, key)));
                    entries.insert(key, merge(key, &values));
                }

                self.open = Node {
                    parent: ancestor,
                    depth: ancestor.map_or(0, |a| self.node(a).depth + 1),
                    entries,
                };
            }
        }
    }

    /// Deepest snapshot both `a` and `b` derive from, if they share a root
    fn common_ancestor(&self, mut a: Snapshot, mut b: Snapshot) -> Option<Snapshot> {
        while self.node(a).depth > self.node(b).depth {
            a = self.node(a).parent?;
        }
        while self.node(b).depth > self.node(a).depth {
            b = self.node(b).parent?;
        }
        while a != b {
            a = self.node(a).parent?;
            b = self.node(b).parent?;
        }
        Some(a)
    }

    /// Value of `key` in the open snapshot
    pub fn get(&self, key: K) -> V {
        match self.open.entries.get(&key) {
            Some(value) => *value,
            None => self.lookup(self.open.parent, key),
        }
    }

    /// Value of `key` in a sealed snapshot
    pub fn get_in(&self, snapshot: Snapshot, key: K) -> V {
        self.lookup(Some(snapshot), key)
    }

    fn lookup(&self, mut cursor: Option<Snapshot>, key: K) -> V {
        while let Some(current) = cursor {
            let node = self.node(current);
            if let Some(value) = node.entries.get(&key) {
                return *value;
            }
            cursor = node.parent;
        }
        V::default()
    }

    /// Write `key` in the open snapshot and return its previous value
    pub fn set(&mut self, key: K, value: V) -> V {
        let previous = self.get(key);
        if previous != value {
            self.open.entries.insert(key, value);
        }
        previous
    }

    /// Freeze the open snapshot and return its handle
    ///
    /// The table is left with a fresh snapshot derived from the sealed one.
    pub fn seal(&mut self) -> Snapshot {
        let handle = Snapshot(self.nodes.len() as u32);
        let depth = self.open.depth;
        let sealed = std::mem::replace(
            &mut self.open,
            Node {
                parent: Some(handle),
                depth: depth + 1,
                entries: HashMap::new(),
            },
        );
        self.nodes.push(sealed);
        handle
    }

    pub fn snapshot_count(&self) -> usize {
        self.nodes.len()
    }
}

impl<K, V> Default for SnapshotTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy + Default + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}
