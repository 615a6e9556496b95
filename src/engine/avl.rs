//! AVALON - AVL Tree Map
//! Height-balanced ordered map with soft (tombstone) and hard deletion.
//!
//! Nodes live in a dense arena and link to each other by index, so every
//! node can keep a parent link for the iterative bottom-up rebalance
//! without owning cycles. A hard delete moves the last arena slot into the
//! freed one and patches the links of the moved node.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::mem;

use serde::{Deserialize, Serialize};

use crate::types::{KeyOrder, Lookup, NaturalOrder};

/// Index of a node inside the tree arena.
type NodeId = usize;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node<K, V> {
    key: K,
    value: V,
    /// Leaf is 0, an absent child counts as -1.
    height: i32,
    tombstone: bool,
    left: Option<NodeId>,
    right: Option<NodeId>,
    parent: Option<NodeId>,
}

/// One row of a breadth-first traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelEntry<'a, K, V> {
    pub level: usize,
    pub key: &'a K,
    pub value: &'a V,
    pub tombstone: bool,
}

/// Ordered map backed by an AVL tree.
///
/// ## Counters
/// - `len()` counts live entries
/// - `hidden_len()` counts every node, tombstones included
///
/// The comparator is not serialized; a deserialized map gets `C::default()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, V: Serialize",
    deserialize = "K: Deserialize<'de>, V: Deserialize<'de>, C: Default"
))]
pub struct AvlTreeMap<K, V, C = NaturalOrder> {
    nodes: Vec<Node<K, V>>,
    root: Option<NodeId>,
    size: usize,
    hidden_size: usize,
    #[serde(skip)]
    order: C,
}

impl<K: Ord, V> AvlTreeMap<K, V> {
    /// Create an empty map ordered by `K: Ord`.
    pub fn new() -> Self {
        Self::with_order(NaturalOrder)
    }
}

impl<K, V, C: Default> Default for AvlTreeMap<K, V, C> {
    fn default() -> Self {
        Self::with_order(C::default())
    }
}

impl<K, V, C> AvlTreeMap<K, V, C> {
    /// Create an empty map using an injected key order.
    pub fn with_order(order: C) -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            size: 0,
            hidden_size: 0,
            order,
        }
    }

    /// The key order this map compares with.
    pub fn order(&self) -> &C {
        &self.order
    }

    pub(crate) fn set_order(&mut self, order: C) {
        self.order = order;
    }

    /// Number of live (non-tombstoned) entries.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Number of nodes, tombstones included.
    pub fn hidden_len(&self) -> usize {
        self.hidden_size
    }

    /// True if there are no live entries. Tombstones may still be present.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Height of the whole tree; -1 when empty.
    pub fn height(&self) -> i32 {
        self.height_of(self.root)
    }

    /// Smallest key in the tree, tombstoned or not.
    pub fn first_key(&self) -> Option<&K> {
        self.root.map(|root| &self.nodes[self.leftmost(root)].key)
    }

    /// Largest key in the tree, tombstoned or not.
    pub fn last_key(&self) -> Option<&K> {
        self.root.map(|root| &self.nodes[self.rightmost(root)].key)
    }

    /// Drop every node and reset both counters.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = None;
        self.size = 0;
        self.hidden_size = 0;
    }

    /// In-order iterator over live entries.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(&self.nodes, self.root)
    }

    /// Breadth-first traversal of every node, tombstones included.
    pub fn level_order(&self) -> Vec<LevelEntry<'_, K, V>> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut queue: VecDeque<(usize, NodeId)> = self.root.map(|r| (0, r)).into_iter().collect();
        while let Some((level, id)) = queue.pop_front() {
            let node = &self.nodes[id];
            out.push(LevelEntry {
                level,
                key: &node.key,
                value: &node.value,
                tombstone: node.tombstone,
            });
            for child in [node.left, node.right].into_iter().flatten() {
                queue.push_back((level + 1, child));
            }
        }
        out
    }

    /// Structural check for maps that came off disk: every link in bounds,
    /// parent links consistent with child links, counters matching the nodes.
    pub(crate) fn is_well_formed(&self) -> bool {
        let live = self.nodes.iter().filter(|n| !n.tombstone).count();
        if self.hidden_size != self.nodes.len() || self.size != live {
            return false;
        }
        let Some(root) = self.root else {
            return self.nodes.is_empty();
        };
        if root >= self.nodes.len() || self.nodes[root].parent.is_some() {
            return false;
        }

        let mut seen = 0;
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            seen += 1;
            if seen > self.nodes.len() {
                return false;
            }
            for child in [self.nodes[id].left, self.nodes[id].right].into_iter().flatten() {
                if child >= self.nodes.len() || self.nodes[child].parent != Some(id) {
                    return false;
                }
                stack.push(child);
            }
        }
        seen == self.nodes.len()
    }

    fn height_of(&self, id: Option<NodeId>) -> i32 {
        id.map_or(-1, |id| self.nodes[id].height)
    }

    fn balance(&self, id: Option<NodeId>) -> i32 {
        match id {
            Some(id) => self.height_of(self.nodes[id].left) - self.height_of(self.nodes[id].right),
            None => 0,
        }
    }

    fn update_height(&mut self, id: NodeId) {
        let height = 1 + self
            .height_of(self.nodes[id].left)
            .max(self.height_of(self.nodes[id].right));
        self.nodes[id].height = height;
    }

    fn leftmost(&self, mut id: NodeId) -> NodeId {
        while let Some(left) = self.nodes[id].left {
            id = left;
        }
        id
    }

    fn rightmost(&self, mut id: NodeId) -> NodeId {
        while let Some(right) = self.nodes[id].right {
            id = right;
        }
        id
    }

    fn alloc(&mut self, key: K, value: V, tombstone: bool, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            key,
            value,
            height: 0,
            tombstone,
            left: None,
            right: None,
            parent,
        });
        if !tombstone {
            self.size += 1;
        }
        self.hidden_size += 1;
        id
    }

    /// Point `parent`'s link that referenced `old` at `new`; the root if there is no parent.
    fn replace_child(&mut self, parent: Option<NodeId>, old: NodeId, new: Option<NodeId>) {
        match parent {
            None => self.root = new,
            Some(p) => {
                let node = &mut self.nodes[p];
                if node.left == Some(old) {
                    node.left = new;
                } else {
                    node.right = new;
                }
            }
        }
    }

    fn rotate_left(&mut self, a: NodeId) -> NodeId {
        let Some(b) = self.nodes[a].right else {
            return a;
        };
        let parent = self.nodes[a].parent;
        let inner = self.nodes[b].left;

        self.nodes[a].right = inner;
        if let Some(inner) = inner {
            self.nodes[inner].parent = Some(a);
        }
        self.nodes[b].left = Some(a);
        self.nodes[a].parent = Some(b);
        self.nodes[b].parent = parent;
        self.replace_child(parent, a, Some(b));

        self.update_height(a);
        self.update_height(b);
        b
    }

    fn rotate_right(&mut self, a: NodeId) -> NodeId {
        let Some(b) = self.nodes[a].left else {
            return a;
        };
        let parent = self.nodes[a].parent;
        let inner = self.nodes[b].right;

        self.nodes[a].left = inner;
        if let Some(inner) = inner {
            self.nodes[inner].parent = Some(a);
        }
        self.nodes[b].right = Some(a);
        self.nodes[a].parent = Some(b);
        self.nodes[b].parent = parent;
        self.replace_child(parent, a, Some(b));

        self.update_height(a);
        self.update_height(b);
        b
    }

    /// Restore the AVL property at `id`; returns the root of the (possibly rotated) subtree.
    fn rebalance(&mut self, id: NodeId) -> NodeId {
        self.update_height(id);
        let balance = self.balance(Some(id));

        if balance > 1 {
            let left = self.nodes[id].left;
            if self.balance(left) < 0 {
                if let Some(left) = left {
                    self.rotate_left(left);
                }
            }
            self.rotate_right(id)
        } else if balance < -1 {
            let right = self.nodes[id].right;
            if self.balance(right) > 0 {
                if let Some(right) = right {
                    self.rotate_right(right);
                }
            }
            self.rotate_left(id)
        } else {
            id
        }
    }

    fn rebalance_upward(&mut self, start: NodeId) {
        let mut current = Some(start);
        while let Some(id) = current {
            let subtree_root = self.rebalance(id);
            current = self.nodes[subtree_root].parent;
        }
    }

    fn swap_entries(&mut self, a: NodeId, b: NodeId) {
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let (head, tail) = self.nodes.split_at_mut(high);
        let (x, y) = (&mut head[low], &mut tail[0]);
        mem::swap(&mut x.key, &mut y.key);
        mem::swap(&mut x.value, &mut y.value);
        mem::swap(&mut x.tombstone, &mut y.tombstone);
    }

    /// Unlink `id` from the tree and return it. Counters are left to the caller.
    fn remove_node(&mut self, id: NodeId) -> Node<K, V> {
        let (left, right, parent) = {
            let node = &self.nodes[id];
            (node.left, node.right, node.parent)
        };

        if let (Some(_), Some(right)) = (left, right) {
            // The successor has no left child, so the second call takes the branch below.
            let successor = self.leftmost(right);
            self.swap_entries(id, successor);
            return self.remove_node(successor);
        }

        let child = left.or(right);
        if let Some(child) = child {
            self.nodes[child].parent = parent;
        }
        self.replace_child(parent, id, child);
        if let Some(start) = child.or(parent) {
            self.rebalance_upward(start);
        }
        self.release(id)
    }

    /// Free the arena slot of a detached node, moving the last slot into it.
    fn release(&mut self, id: NodeId) -> Node<K, V> {
        let moved_from = self.nodes.len() - 1;
        let node = self.nodes.swap_remove(id);
        if id != moved_from {
            let (parent, left, right) = {
                let moved = &self.nodes[id];
                (moved.parent, moved.left, moved.right)
            };
            for child in [left, right].into_iter().flatten() {
                self.nodes[child].parent = Some(id);
            }
            self.replace_child(parent, moved_from, Some(id));
        }
        node
    }
}

impl<K, V, C: KeyOrder<K>> AvlTreeMap<K, V, C> {
    fn find(&self, key: &K) -> Option<NodeId> {
        let mut current = self.root;
        while let Some(id) = current {
            current = match self.order.compare(key, &self.nodes[id].key) {
                Ordering::Greater => self.nodes[id].right,
                Ordering::Less => self.nodes[id].left,
                Ordering::Equal => return Some(id),
            };
        }
        None
    }

    /// True if a node exists for `key`, even a tombstoned one.
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Returns the value for `key` unless it is absent or tombstoned.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.lookup(key).found()
    }

    /// Like `get`, but tells a tombstone apart from a missing key.
    pub fn lookup(&self, key: &K) -> Lookup<&V> {
        match self.find(key) {
            Some(id) if self.nodes[id].tombstone => Lookup::Deleted,
            Some(id) => Lookup::Found(&self.nodes[id].value),
            None => Lookup::Missing,
        }
    }

    /// Insert or overwrite. Returns the previous live value.
    ///
    /// Overwriting a tombstoned key revives it: the live counter goes back
    /// up, the node counter does not change and `None` is returned.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        self.insert_entry(key, value, false)
    }

    /// Insert or overwrite `key` as a tombstone carrying `value`.
    /// Returns the live value it hid, if any.
    pub fn put_tombstone(&mut self, key: K, value: V) -> Option<V> {
        self.insert_entry(key, value, true)
    }

    fn insert_entry(&mut self, key: K, value: V, tombstone: bool) -> Option<V> {
        let Some(mut current) = self.root else {
            let id = self.alloc(key, value, tombstone, None);
            self.root = Some(id);
            return None;
        };

        loop {
            match self.order.compare(&key, &self.nodes[current].key) {
                Ordering::Greater => match self.nodes[current].right {
                    Some(right) => current = right,
                    None => {
                        let id = self.alloc(key, value, tombstone, Some(current));
                        self.nodes[current].right = Some(id);
                        self.rebalance_upward(id);
                        return None;
                    }
                },
                Ordering::Less => match self.nodes[current].left {
                    Some(left) => current = left,
                    None => {
                        let id = self.alloc(key, value, tombstone, Some(current));
                        self.nodes[current].left = Some(id);
                        self.rebalance_upward(id);
                        return None;
                    }
                },
                Ordering::Equal => {
                    let node = &mut self.nodes[current];
                    let previous = mem::replace(&mut node.value, value);
                    let was_live = !node.tombstone;
                    node.tombstone = tombstone;
                    match (was_live, tombstone) {
                        (true, true) => self.size = self.size.saturating_sub(1),
                        (false, false) => self.size += 1,
                        _ => {}
                    }
                    return was_live.then_some(previous);
                }
            }
        }
    }

    /// Hard delete: unlink the node and rebalance. Returns the removed live value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let id = self.find(key)?;
        let node = self.remove_node(id);
        self.hidden_size -= 1;
        if node.tombstone {
            None
        } else {
            self.size -= 1;
            Some(node.value)
        }
    }

    /// Soft delete: flag the node as a tombstone without touching the tree shape.
    /// Returns true if a live entry was hidden.
    pub fn mark_as_deleted(&mut self, key: &K) -> bool {
        let Some(id) = self.find(key) else {
            return false;
        };
        let node = &mut self.nodes[id];
        if node.tombstone {
            return false;
        }
        node.tombstone = true;
        self.size = self.size.saturating_sub(1);
        true
    }
}

impl<K, V, C: KeyOrder<K>> Extend<(K, V)> for AvlTreeMap<K, V, C> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.put(key, value);
        }
    }
}

impl<K, V, C: KeyOrder<K> + Default> FromIterator<(K, V)> for AvlTreeMap<K, V, C> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::default();
        map.extend(iter);
        map
    }
}

/// In-order iterator over the live entries of an [`AvlTreeMap`].
pub struct Iter<'a, K, V> {
    nodes: &'a [Node<K, V>],
    stack: Vec<NodeId>,
}

impl<'a, K, V> Iter<'a, K, V> {
    fn new(nodes: &'a [Node<K, V>], root: Option<NodeId>) -> Self {
        let mut iter = Self {
            nodes,
            stack: Vec::new(),
        };
        iter.push_left_spine(root);
        iter
    }

    fn push_left_spine(&mut self, mut current: Option<NodeId>) {
        while let Some(id) = current {
            self.stack.push(id);
            current = self.nodes[id].left;
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let nodes = self.nodes;
        while let Some(id) = self.stack.pop() {
            let node = &nodes[id];
            self.push_left_spine(node.right);
            if !node.tombstone {
                return Some((&node.key, &node.value));
            }
        }
        None
    }
}
