//! # Intrusive Queue
//!
//! Circular doubly linked lists whose nodes live in a fixed table and refer to
//! each other by index. A record that wants to sit on a list owns one node id
//! in the table; list heads are ordinary nodes too, so a head whose links point
//! at itself is an empty list.
//!
//! ```text
//!   head ─► n3 ─► n7 ─► n1 ─┐
//!    ▲                       │
//!    └───────────────────────┘   (prev links mirror next links)
//! ```
//!
//! Every node is either self-linked (detached) or part of exactly one cycle.
//! `remove` repairs both neighbours and self-links the removed node, so calling
//! it again on a detached node is harmless.

/// Index of a node within a [`LinkTable`].
pub type NodeId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    prev: NodeId,
    next: NodeId,
}

/// A table of `N` list nodes.
pub struct LinkTable<const N: usize> {
    links: [Link; N],
}

impl<const N: usize> LinkTable<N> {
    /// Create a table with every node detached.
    pub fn new() -> Self {
        assert!(N <= NodeId::MAX as usize);
        let mut table = Self {
            links: [Link { prev: 0, next: 0 }; N],
        };
        table.reset();
        table
    }

    /// Detach every node.
    pub fn reset(&mut self) {
        for i in 0..N {
            self.init(i as NodeId);
        }
    }

    /// Self-link `node`, making it an empty head or a detached member.
    #[inline]
    pub fn init(&mut self, node: NodeId) {
        self.links[node as usize] = Link { prev: node, next: node };
    }

    /// Append `node` at the tail of the list headed by `head`.
    ///
    /// `node` must be detached.
    pub fn insert_tail(&mut self, head: NodeId, node: NodeId) {
        debug_assert!(self.is_detached(node), "node {} already linked", node);
        let tail = self.links[head as usize].prev;
        self.links[node as usize] = Link { prev: tail, next: head };
        self.links[tail as usize].next = node;
        self.links[head as usize].prev = node;
    }

    /// Unlink `node` from whatever list it is on.
    pub fn remove(&mut self, node: NodeId) {
        let Link { prev, next } = self.links[node as usize];
        self.links[prev as usize].next = next;
        self.links[next as usize].prev = prev;
        self.init(node);
    }

    /// True if the list headed by `head` has no members.
    #[inline]
    pub fn is_empty(&self, head: NodeId) -> bool {
        self.links[head as usize].next == head
    }

    /// True if `node` is not on any list.
    #[inline]
    pub fn is_detached(&self, node: NodeId) -> bool {
        let link = self.links[node as usize];
        link.next == node && link.prev == node
    }

    /// First member of the list headed by `head`.
    #[inline]
    pub fn first(&self, head: NodeId) -> Option<NodeId> {
        let next = self.links[head as usize].next;
        (next != head).then_some(next)
    }

    /// Successor of `node`. On a head this is the first member, on the last
    /// member it is the head.
    #[inline]
    pub fn next(&self, node: NodeId) -> NodeId {
        self.links[node as usize].next
    }

    /// Iterate over the members of the list headed by `head`, front to back.
    pub fn iter(&self, head: NodeId) -> Iter<'_, N> {
        Iter {
            table: self,
            head,
            cursor: self.next(head),
        }
    }

    /// Number of members on the list headed by `head`. O(n).
    pub fn len(&self, head: NodeId) -> usize {
        self.iter(head).count()
    }
}

impl<const N: usize> Default for LinkTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward iterator over a list. The table is borrowed, so the list cannot
/// change underneath it; callers that move nodes while walking a list step
/// with [`LinkTable::next`] and capture the successor first.
pub struct Iter<'a, const N: usize> {
    table: &'a LinkTable<N>,
    head: NodeId,
    cursor: NodeId,
}

impl<const N: usize> Iterator for Iter<'_, N> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        if self.cursor == self.head {
            return None;
        }
        let node = self.cursor;
        self.cursor = self.table.next(node);
        Some(node)
    }
}
