use std::cmp::Ordering;

use crate::{error::SortError, log_trace, tuple::Tuple};

use super::{
    arena::{NodeArena, NodeId},
    observer::SortObserver,
    ordering::SortOrder,
};

#[derive(Debug, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// The observer absorbed or vetoed the row.
    Duplicate,
    /// No node could be allocated. The buffer is unchanged and the row is
    /// handed back so the caller can retry after making room.
    Full(Tuple),
}

/// In-memory ordered multiset of rows: an AVL tree hanging off the arena's
/// head sentinel. Equal rows never occupy two tree nodes; they hang off one
/// on its duplicate chain.
pub struct SortBuffer {
    arena: NodeArena,
    order: SortOrder,
    observer: Box<dyn SortObserver>,
    /// (node, direction taken) for the current insert descent.
    path: Vec<(NodeId, Ordering)>,
    pending_tag: u32,
    last_tag: u32,
    displaced: Vec<u32>,
    rows: usize,
}

impl SortBuffer {
    pub fn new(
        order: SortOrder,
        observer: Box<dyn SortObserver>,
        initial_nodes: usize,
        capacity: usize,
    ) -> Self {
        SortBuffer {
            // One extra slot for the sentinel.
            arena: NodeArena::new(initial_nodes.saturating_add(1), capacity.saturating_add(1)),
            order,
            observer,
            path: Vec::new(),
            pending_tag: 0,
            last_tag: 0,
            displaced: Vec::new(),
            rows: 0,
        }
    }

    pub fn order(&self) -> &SortOrder {
        &self.order
    }

    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub fn grow(&mut self, percent: usize) {
        self.arena.grow(percent);
    }

    /// Rows currently held, duplicate chains included.
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Tag stamped on every row inserted from now on.
    pub fn set_pending_tag(&mut self, tag: u32) {
        self.pending_tag = tag;
    }

    /// Tag of the row most recently returned by `remove_first`.
    pub fn last_removed_tag(&self) -> u32 {
        self.last_tag
    }

    /// Drop every row and return all nodes to the arena.
    pub fn reset(&mut self) {
        self.arena.reset();
        self.pending_tag = 0;
        self.displaced.clear();
        self.rows = 0;
    }

    pub fn insert(&mut self, row: Tuple) -> Result<InsertOutcome, SortError> {
        let Some(root) = self.arena.node(NodeId::HEAD).right else {
            let q = match self.allocate_unique(row)? {
                Ok(q) => q,
                Err(outcome) => return Ok(outcome),
            };
            self.arena.node_mut(NodeId::HEAD).right = Some(q);
            return Ok(InsertOutcome::Inserted);
        };

        let mut path = std::mem::take(&mut self.path);
        path.clear();
        let outcome = self.insert_below(root, row, &mut path);
        self.path = path;
        outcome
    }

    fn insert_below(
        &mut self,
        root: NodeId,
        row: Tuple,
        path: &mut Vec<(NodeId, Ordering)>,
    ) -> Result<InsertOutcome, SortError> {
        // Index in `path` of the deepest node with a nonzero balance; the
        // only place a rotation can be needed.
        let mut pivot = 0;
        let mut p = root;
        loop {
            let c = self
                .order
                .compare(&row, self.arena.key(p), self.observer.as_mut())?;
            if c == Ordering::Equal {
                return self.insert_duplicate(p, row);
            }
            path.push((p, c));
            match link(&self.arena, p, c) {
                Some(next) => {
                    if self.arena.node(next).balance != 0 {
                        pivot = path.len();
                    }
                    p = next;
                }
                None => {
                    let q = match self.allocate_unique(row)? {
                        Ok(q) => q,
                        Err(outcome) => return Ok(outcome),
                    };
                    set_link(&mut self.arena, p, c, Some(q));
                    break;
                }
            }
        }
        self.rebalance_after_insert(path, pivot);
        Ok(InsertOutcome::Inserted)
    }

    /// Allocate a node for a row whose key is new to the buffer and let the
    /// observer see it. The observer is not consulted when the arena is
    /// exhausted.
    fn allocate_unique(&mut self, row: Tuple) -> Result<Result<NodeId, InsertOutcome>, SortError> {
        let Some(q) = self.arena.allocate() else {
            return Ok(Err(InsertOutcome::Full(row)));
        };
        let row = match self.observer.insert_non_duplicate(row) {
            Ok(Some(row)) => row,
            Ok(None) => {
                self.arena.free(q);
                return Ok(Err(InsertOutcome::Duplicate));
            }
            Err(e) => {
                self.arena.free(q);
                return Err(e);
            }
        };
        let node = self.arena.node_mut(q);
        node.key = Some(row);
        node.tag = self.pending_tag;
        self.rows += 1;
        Ok(Ok(q))
    }

    /// Chain `row` onto the tree node `existing`. The chain stays ordered by
    /// tag and, within a tag, by arrival, with the tree node holding the
    /// first row.
    fn insert_duplicate(&mut self, existing: NodeId, row: Tuple) -> Result<InsertOutcome, SortError> {
        if self.pending_tag < self.arena.node(existing).tag {
            return self.displace_owner(existing, row);
        }
        let existing_key = self
            .arena
            .node_mut(existing)
            .key
            .as_mut()
            .expect("live tree node without a key");
        let row = match self.observer.insert_duplicate(row, existing_key)? {
            Some(row) => row,
            None => return Ok(InsertOutcome::Duplicate),
        };
        let Some(q) = self.arena.allocate() else {
            return Ok(InsertOutcome::Full(row));
        };
        let node = self.arena.node_mut(q);
        node.key = Some(row);
        node.tag = self.pending_tag;
        let prev = self.chain_position(existing, self.pending_tag);
        self.link_into_chain(existing, prev, q);
        self.rows += 1;
        log_trace!("row chained on an equal key, {} rows held", self.rows);
        Ok(InsertOutcome::Inserted)
    }

    /// A row with a lower tag ties the row on `existing`: it takes over the
    /// tree node and the observer sees the previous holder as the newcomer.
    /// An absorbed previous holder leaves its tag in `displaced`.
    fn displace_owner(&mut self, existing: NodeId, row: Tuple) -> Result<InsertOutcome, SortError> {
        let Some(q) = self.arena.allocate() else {
            return Ok(InsertOutcome::Full(row));
        };
        let node = self.arena.node_mut(existing);
        let previous = node.key.replace(row).expect("live tree node without a key");
        let previous_tag = std::mem::replace(&mut node.tag, self.pending_tag);
        let owner_key = node.key.as_mut().expect("live tree node without a key");
        match self.observer.insert_duplicate(previous, owner_key) {
            Ok(Some(previous)) => {
                let node = self.arena.node_mut(q);
                node.key = Some(previous);
                node.tag = previous_tag;
                self.link_into_chain(existing, existing, q);
                self.rows += 1;
            }
            Ok(None) => {
                self.arena.free(q);
                self.displaced.push(previous_tag);
            }
            Err(e) => {
                self.arena.free(q);
                return Err(e);
            }
        }
        Ok(InsertOutcome::Inserted)
    }

    /// The chain member (or the tree node itself) a row tagged `tag` goes
    /// behind.
    fn chain_position(&self, owner: NodeId, tag: u32) -> NodeId {
        let Some(tail) = self.arena.node(owner).dup_tail else {
            return owner;
        };
        if self.arena.node(tail).tag <= tag {
            return tail;
        }
        let mut prev = owner;
        while let Some(next) = self.arena.node(prev).dup_chain {
            if self.arena.node(next).tag > tag {
                break;
            }
            prev = next;
        }
        prev
    }

    fn link_into_chain(&mut self, owner: NodeId, prev: NodeId, q: NodeId) {
        let after = self.arena.node(prev).dup_chain;
        self.arena.node_mut(q).dup_chain = after;
        self.arena.node_mut(prev).dup_chain = Some(q);
        if after.is_none() {
            self.arena.node_mut(owner).dup_tail = Some(q);
        }
    }

    /// Tag of a row the observer absorbed while it was being pushed off a
    /// tree node by a lower-tagged equal row. Only happens with distinct
    /// tags, that is while merging.
    pub fn take_displaced_tag(&mut self) -> Option<u32> {
        self.displaced.pop()
    }

    fn rebalance_after_insert(&mut self, path: &[(NodeId, Ordering)], pivot: usize) {
        let (s, dir) = path[pivot];
        let a = sign(dir);
        let parent = if pivot == 0 {
            NodeId::HEAD
        } else {
            path[pivot - 1].0
        };

        // Every node strictly below the pivot had balance 0 and now leans
        // toward the new leaf.
        for &(node, d) in &path[pivot + 1..] {
            self.arena.node_mut(node).balance = sign(d);
        }

        let bs = self.arena.node(s).balance;
        if bs == 0 {
            self.arena.node_mut(s).balance = a;
            return;
        }
        if bs == -a {
            self.arena.node_mut(s).balance = 0;
            return;
        }

        let r = link(&self.arena, s, dir).expect("pivot leans toward the insert");
        let new_top = if self.arena.node(r).balance == a {
            // Single rotation.
            let inner = link_dir(&self.arena, r, -a);
            set_link_dir(&mut self.arena, s, a, inner);
            set_link_dir(&mut self.arena, r, -a, Some(s));
            self.arena.node_mut(s).balance = 0;
            self.arena.node_mut(r).balance = 0;
            r
        } else {
            // Double rotation.
            let p = link_dir(&self.arena, r, -a).expect("inner grandchild exists");
            let p_out = link_dir(&self.arena, p, a);
            let p_in = link_dir(&self.arena, p, -a);
            set_link_dir(&mut self.arena, r, -a, p_out);
            set_link_dir(&mut self.arena, p, a, Some(r));
            set_link_dir(&mut self.arena, s, a, p_in);
            set_link_dir(&mut self.arena, p, -a, Some(s));
            let bp = self.arena.node(p).balance;
            let (bal_s, bal_r) = if bp == a {
                (-a, 0)
            } else if bp == 0 {
                (0, 0)
            } else {
                (0, a)
            };
            self.arena.node_mut(s).balance = bal_s;
            self.arena.node_mut(r).balance = bal_r;
            self.arena.node_mut(p).balance = 0;
            p
        };

        let parent_node = self.arena.node_mut(parent);
        if parent_node.right == Some(s) {
            parent_node.right = Some(new_top);
        } else {
            parent_node.left = Some(new_top);
        }
    }

    /// Remove and return the smallest row. Equal rows come out in tag order,
    /// and in arrival order within a tag.
    pub fn remove_first(&mut self) -> Option<Tuple> {
        let root = self.arena.node(NodeId::HEAD).right?;
        let mut p = root;
        while let Some(l) = self.arena.node(p).left {
            p = l;
        }
        if let Some(d) = self.arena.node(p).dup_chain {
            // The chain head moves up into the tree node.
            let (key, tag, next) = {
                let head = self.arena.node_mut(d);
                (head.key.take(), head.tag, head.dup_chain)
            };
            let node = self.arena.node_mut(p);
            let row = std::mem::replace(&mut node.key, key).expect("live tree node without a key");
            self.last_tag = std::mem::replace(&mut node.tag, tag);
            node.dup_chain = next;
            if next.is_none() {
                node.dup_tail = None;
            }
            self.arena.free(d);
            self.rows -= 1;
            return Some(row);
        }
        let (new_root, _, removed) = self.delete_leftmost(root);
        self.arena.node_mut(NodeId::HEAD).right = new_root;
        Some(self.release(removed))
    }

    fn release(&mut self, id: NodeId) -> Tuple {
        let node = self.arena.node_mut(id);
        let key = node.key.take().expect("live tree node without a key");
        self.last_tag = node.tag;
        self.arena.free(id);
        self.rows -= 1;
        key
    }

    /// Unlink the leftmost node of the subtree at `node`. Returns the new
    /// subtree root, whether the subtree got shorter and the unlinked node.
    fn delete_leftmost(&mut self, node: NodeId) -> (Option<NodeId>, bool, NodeId) {
        let Some(left) = self.arena.node(node).left else {
            return (self.arena.node(node).right, true, node);
        };
        let (new_left, shrunk, removed) = self.delete_leftmost(left);
        self.arena.node_mut(node).left = new_left;
        if !shrunk {
            return (Some(node), false, removed);
        }
        match self.arena.node(node).balance {
            -1 => {
                self.arena.node_mut(node).balance = 0;
                (Some(node), true, removed)
            }
            0 => {
                self.arena.node_mut(node).balance = 1;
                (Some(node), false, removed)
            }
            _ => {
                let (top, shrunk) = self.rotate_after_left_shrink(node);
                (Some(top), shrunk, removed)
            }
        }
    }

    /// `node` was right-heavy and its left subtree just got shorter.
    fn rotate_after_left_shrink(&mut self, node: NodeId) -> (NodeId, bool) {
        let r = self.arena.node(node).right.expect("right-heavy node has a right child");
        match self.arena.node(r).balance {
            0 => {
                let inner = self.arena.node(r).left;
                self.arena.node_mut(node).right = inner;
                self.arena.node_mut(r).left = Some(node);
                self.arena.node_mut(node).balance = 1;
                self.arena.node_mut(r).balance = -1;
                (r, false)
            }
            1 => {
                let inner = self.arena.node(r).left;
                self.arena.node_mut(node).right = inner;
                self.arena.node_mut(r).left = Some(node);
                self.arena.node_mut(node).balance = 0;
                self.arena.node_mut(r).balance = 0;
                (r, true)
            }
            _ => {
                let p = self.arena.node(r).left.expect("left-heavy child has a left child");
                let (p_left, p_right) = {
                    let pn = self.arena.node(p);
                    (pn.left, pn.right)
                };
                self.arena.node_mut(r).left = p_right;
                self.arena.node_mut(p).right = Some(r);
                self.arena.node_mut(node).right = p_left;
                self.arena.node_mut(p).left = Some(node);
                let bp = self.arena.node(p).balance;
                self.arena.node_mut(node).balance = if bp == 1 { -1 } else { 0 };
                self.arena.node_mut(r).balance = if bp == -1 { 1 } else { 0 };
                self.arena.node_mut(p).balance = 0;
                (p, true)
            }
        }
    }
}

fn sign(dir: Ordering) -> i8 {
    if dir == Ordering::Less {
        -1
    } else {
        1
    }
}

fn link(arena: &NodeArena, id: NodeId, dir: Ordering) -> Option<NodeId> {
    link_dir(arena, id, sign(dir))
}

fn set_link(arena: &mut NodeArena, id: NodeId, dir: Ordering, child: Option<NodeId>) {
    set_link_dir(arena, id, sign(dir), child)
}

fn link_dir(arena: &NodeArena, id: NodeId, dir: i8) -> Option<NodeId> {
    let node = arena.node(id);
    if dir < 0 {
        node.left
    } else {
        node.right
    }
}

fn set_link_dir(arena: &mut NodeArena, id: NodeId, dir: i8, child: Option<NodeId>) {
    let node = arena.node_mut(id);
    if dir < 0 {
        node.left = child;
    } else {
        node.right = child;
    }
}
