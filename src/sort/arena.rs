// Node pool backing the sort buffer.
//
// Slots are addressed by index. Slot 0 is the head sentinel: its right link
// is the root of the tree. Freed slots go on a LIFO free list; fresh slots
// come from the end of the backing vector, whose reservation doubles until
// it reaches `max_capacity`.

use crate::tuple::Tuple;

const GROWTH_MULTIPLIER: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeId(u32);

impl NodeId {
    pub const HEAD: NodeId = NodeId(0);

    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Default)]
pub struct Node {
    pub left: Option<NodeId>,
    pub right: Option<NodeId>,
    /// height(right) - height(left), always in -1..=1.
    pub balance: i8,
    pub key: Option<Tuple>,
    /// Next row on the duplicate chain. On a tree node this is the chain
    /// head.
    pub dup_chain: Option<NodeId>,
    /// Last row on the chain; only kept on the tree node.
    pub dup_tail: Option<NodeId>,
    pub tag: u32,
}

impl Node {
    fn clear(&mut self) {
        *self = Node::default();
    }
}

pub struct NodeArena {
    slots: Vec<Node>,
    free_list: Vec<NodeId>,
    max_capacity: usize,
    initial_size: usize,
}

impl NodeArena {
    /// `max_capacity` counts the sentinel, so at most `max_capacity - 1`
    /// nodes can be live at once.
    pub fn new(initial_size: usize, max_capacity: usize) -> Self {
        let max_capacity = max_capacity.max(2);
        let initial_size = initial_size.clamp(2, max_capacity);
        let mut arena = NodeArena {
            slots: Vec::with_capacity(initial_size),
            free_list: Vec::new(),
            max_capacity,
            initial_size,
        };
        arena.slots.push(Node::default());
        arena
    }

    pub fn allocate(&mut self) -> Option<NodeId> {
        if let Some(id) = self.free_list.pop() {
            return Some(id);
        }
        if self.slots.len() >= self.max_capacity || self.slots.len() >= u32::MAX as usize {
            return None;
        }
        if self.slots.len() == self.slots.capacity() {
            let target = (self.slots.capacity().max(self.initial_size) * GROWTH_MULTIPLIER)
                .min(self.max_capacity);
            self.slots
                .try_reserve_exact(target - self.slots.len())
                .ok()?;
        }
        self.slots.push(Node::default());
        Some(NodeId(self.slots.len() as u32 - 1))
    }

    pub fn free(&mut self, id: NodeId) {
        debug_assert!(id != NodeId::HEAD, "the sentinel is never freed");
        self.slots[id.index()].clear();
        self.free_list.push(id);
    }

    /// Raise the maximum number of slots by `percent`.
    pub fn grow(&mut self, percent: usize) {
        let increase = self.max_capacity.saturating_mul(percent) / 100;
        self.max_capacity = self.max_capacity.saturating_add(increase);
    }

    pub fn capacity(&self) -> usize {
        self.max_capacity - 1
    }

    /// Number of nodes currently handed out.
    pub fn live(&self) -> usize {
        self.slots.len() - self.free_list.len() - 1
    }

    /// Free every node but keep the backing allocation.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.free_list.clear();
        self.slots.push(Node::default());
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.slots[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.slots[id.index()]
    }

    pub fn key(&self, id: NodeId) -> &Tuple {
        self.slots[id.index()]
            .key
            .as_ref()
            .expect("live tree node without a key")
    }
}
