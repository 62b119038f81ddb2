//! Intrusive ordering indices for pending tasks.
//!
//! The pending queue must support an ordered first-fit scan ("first task
//! that fits the remaining capacity"), O(1) removal by task id, insertion
//! behind all equal-or-more-urgent entries, and a peek at the least urgent
//! entry. A doubly linked list with a hash index over the node links covers
//! all of that; a heap would lose the ordered scan. The same structure with
//! plain tail insertion doubles as the FIFO admission-order index.

use std::collections::HashMap;

use crate::types::TaskId;

#[derive(Debug, Clone, Copy)]
struct Node {
    prev: Option<TaskId>,
    next: Option<TaskId>,
    priority: u8,
}

/// Doubly linked task list indexed by task id.
#[derive(Debug, Default)]
pub(crate) struct TaskList {
    nodes: HashMap<TaskId, Node>,
    head: Option<TaskId>,
    tail: Option<TaskId>,
}

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Appends `id` at the tail, ignoring priority. FIFO use.
    pub fn push_back(&mut self, id: TaskId) {
        self.insert_node(id, 0, self.tail);
    }

    /// Inserts `id` immediately after the last entry whose priority is
    /// equal or more urgent, so that equal-priority newcomers queue behind
    /// equal-priority incumbents.
    pub fn insert_by_priority(&mut self, id: TaskId, priority: u8) {
        let mut after = self.tail;
        while let Some(cur) = after {
            if self.nodes[&cur].priority <= priority {
                break;
            }
            after = self.nodes[&cur].prev;
        }
        self.insert_node(id, priority, after);
    }

    /// Removes `id` from the list. Returns whether it was present.
    pub fn remove(&mut self, id: TaskId) -> bool {
        let Some(node) = self.nodes.remove(&id) else {
            return false;
        };
        match node.prev {
            Some(prev) => {
                if let Some(n) = self.nodes.get_mut(&prev) {
                    n.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(n) = self.nodes.get_mut(&next) {
                    n.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        true
    }

    pub fn peek_front(&self) -> Option<TaskId> {
        self.head
    }

    /// The least urgent entry, with its priority.
    pub fn peek_back(&self) -> Option<(TaskId, u8)> {
        self.tail.map(|id| (id, self.nodes[&id].priority))
    }

    /// Iterates ids from the most urgent end.
    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        std::iter::successors(self.head, move |id| self.nodes[id].next)
    }

    /// Removes and returns all ids in front-to-back order.
    pub fn drain_in_order(&mut self) -> Vec<TaskId> {
        let ids: Vec<TaskId> = self.iter().collect();
        self.nodes.clear();
        self.head = None;
        self.tail = None;
        ids
    }

    fn insert_node(&mut self, id: TaskId, priority: u8, after: Option<TaskId>) {
        debug_assert!(!self.nodes.contains_key(&id));
        let next = match after {
            Some(prev) => self.nodes[&prev].next,
            None => self.head,
        };
        self.nodes.insert(
            id,
            Node {
                prev: after,
                next,
                priority,
            },
        );
        match after {
            Some(prev) => {
                if let Some(n) = self.nodes.get_mut(&prev) {
                    n.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        match next {
            Some(next_id) => {
                if let Some(n) = self.nodes.get_mut(&next_id) {
                    n.prev = Some(id);
                }
            }
            None => self.tail = Some(id),
        }
    }
}
