//! Arena-backed compressed trie.
//!
//! Nodes live in a `Vec` and refer to each other by [`NodeId`]; each node
//! keeps its parent's id so removals can walk upwards without owning
//! pointers. Children are kept sorted by the first byte of their segment,
//! which both allows binary search and makes depth-first walks come out in
//! byte order.

/// Index of a node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

const ROOT: NodeId = NodeId(0);

#[derive(Debug)]
struct Node<V> {
    segment: Vec<u8>,
    value: Option<V>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

impl<V> Node<V> {
    fn new(segment: Vec<u8>, parent: Option<NodeId>) -> Self {
        Self {
            segment,
            value: None,
            children: Vec::new(),
            parent,
        }
    }
}

/// Radix tree keyed by byte strings
#[derive(Debug)]
pub struct RadixTree<V> {
    nodes: Vec<Node<V>>,
    free: Vec<NodeId>,
    len: usize,
}

/// Length of the common prefix of `a` and `b`
fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

impl<V> Default for RadixTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> RadixTree<V> {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(Vec::new(), None)],
            free: Vec::new(),
            len: 0,
        }
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of live nodes, not counting the root
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len() - 1
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.nodes.push(Node::new(Vec::new(), None));
        self.free.clear();
        self.len = 0;
    }

    fn node(&self, id: NodeId) -> &Node<V> {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<V> {
        &mut self.nodes[id.0]
    }

    fn alloc(&mut self, node: Node<V>) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id.0] = node;
                id
            }
            None => {
                self.nodes.push(node);
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        node.segment = Vec::new();
        node.value = None;
        node.children = Vec::new();
        node.parent = None;
        self.free.push(id);
    }

    /// Position of the child starting with `first`, or where it would go
    fn child_slot(&self, parent: NodeId, first: u8) -> Result<usize, usize> {
        self.node(parent)
            .children
            .binary_search_by(|child| self.node(*child).segment[0].cmp(&first))
    }

    fn child_starting_with(&self, parent: NodeId, first: u8) -> Option<NodeId> {
        self.child_slot(parent, first)
            .ok()
            .map(|slot| self.node(parent).children[slot])
    }

    /// Node whose path spells exactly `key`
    fn find(&self, key: &[u8]) -> Option<NodeId> {
        let mut current = ROOT;
        let mut rest = key;
        while !rest.is_empty() {
            let child = self.child_starting_with(current, rest[0])?;
            let segment = &self.node(child).segment;
            // A segment longer than what is left would have been split at
            // our length if the key existed.
            if rest.len() < segment.len() || !rest.starts_with(segment) {
                return None;
            }
            rest = &rest[segment.len()..];
            current = child;
        }
        Some(current)
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.find(key).and_then(|id| self.node(id).value.as_ref())
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        let id = self.find(key)?;
        self.node_mut(id).value.as_mut()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Insert `value` under `key`, returning the value it replaced
    pub fn insert(&mut self, key: &[u8], value: V) -> Option<V> {
        let mut current = ROOT;
        let mut rest = key;

        while !rest.is_empty() {
            match self.child_slot(current, rest[0]) {
                Err(slot) => {
                    let mut leaf = Node::new(rest.to_vec(), Some(current));
                    leaf.value = Some(value);
                    let leaf = self.alloc(leaf);
                    self.node_mut(current).children.insert(slot, leaf);
                    self.len += 1;
                    return None;
                }
                Ok(slot) => {
                    let child = self.node(current).children[slot];
                    let matched = common_prefix_len(&self.node(child).segment, rest);
                    if matched < self.node(child).segment.len() {
                        self.split(child, matched);
                    }
                    rest = &rest[matched..];
                    current = child;
                }
            }
        }

        let previous = self.node_mut(current).value.replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Cut `id`'s segment at `at`; the tail, value and children move to a
    /// new node that becomes `id`'s only child.
    fn split(&mut self, id: NodeId, at: usize) {
        let node = self.node_mut(id);
        let tail_segment = node.segment.split_off(at);
        let value = node.value.take();
        let children = std::mem::take(&mut node.children);

        let mut tail = Node::new(tail_segment, Some(id));
        tail.value = value;
        tail.children = children;
        let tail_id = self.alloc(tail);

        let moved = self.node(tail_id).children.clone();
        for child in moved {
            self.node_mut(child).parent = Some(tail_id);
        }
        self.node_mut(id).children = vec![tail_id];
    }

    /// Remove `key`, returning its value
    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        let id = self.find(key)?;
        let value = self.node_mut(id).value.take()?;
        self.len -= 1;
        self.collapse(id);
        Some(value)
    }

    /// Restore the shape invariants upwards from `id` after its value went
    /// away: valueless leaves are detached, a valueless node with a single
    /// child absorbs that child.
    fn collapse(&mut self, mut id: NodeId) {
        while id != ROOT {
            let node = self.node(id);
            if node.value.is_some() {
                return;
            }
            match node.children.len() {
                0 => {
                    let Some(parent) = node.parent else {
                        return;
                    };
                    self.detach(parent, id);
                    self.release(id);
                    id = parent;
                }
                1 => {
                    self.merge(id);
                    return;
                }
                _ => return,
            }
        }
    }

    fn detach(&mut self, parent: NodeId, child: NodeId) {
        let children = &mut self.node_mut(parent).children;
        if let Some(pos) = children.iter().position(|c| *c == child) {
            children.remove(pos);
        }
    }

    /// Fold the single child of `id` into `id`.
    fn merge(&mut self, id: NodeId) {
        debug_assert_ne!(id, ROOT);
        let child = self.node(id).children[0];

        let child_node = self.node_mut(child);
        let child_segment = std::mem::take(&mut child_node.segment);
        let child_value = child_node.value.take();
        let grandchildren = std::mem::take(&mut child_node.children);

        for grandchild in &grandchildren {
            self.node_mut(*grandchild).parent = Some(id);
        }

        let node = self.node_mut(id);
        node.segment.extend_from_slice(&child_segment);
        node.value = child_value;
        node.children = grandchildren;

        self.release(child);
    }

    /// Node at which every key starting with `prefix` lives
    fn prefix_root(&self, prefix: &[u8]) -> Option<(NodeId, Vec<u8>)> {
        let mut current = ROOT;
        let mut path = Vec::with_capacity(prefix.len());
        let mut rest = prefix;

        while !rest.is_empty() {
            let child = self.child_starting_with(current, rest[0])?;
            let segment = &self.node(child).segment;
            let matched = common_prefix_len(segment, rest);
            if matched == rest.len() {
                // Prefix ends inside (or exactly at the end of) this segment
                path.extend_from_slice(segment);
                return Some((child, path));
            }
            if matched < segment.len() {
                return None;
            }
            path.extend_from_slice(segment);
            rest = &rest[matched..];
            current = child;
        }
        Some((current, path))
    }

    /// Every `(key, value)` whose key starts with `prefix`, in byte order
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, &V)> {
        let mut results = Vec::new();
        let Some((start, start_path)) = self.prefix_root(prefix) else {
            return results;
        };

        let base = start_path.len() - self.node(start).segment.len();
        let mut path = start_path[..base].to_vec();
        let mut stack = vec![(start, base)];

        while let Some((id, depth)) = stack.pop() {
            let node = self.node(id);
            path.truncate(depth);
            path.extend_from_slice(&node.segment);
            if let Some(value) = &node.value {
                results.push((path.clone(), value));
            }
            // Reverse so the smallest child is popped first
            for child in node.children.iter().rev() {
                stack.push((*child, path.len()));
            }
        }
        results
    }

    /// Every value whose key starts with `prefix`, in key order
    pub fn values_with_prefix(&self, prefix: &[u8]) -> Vec<&V> {
        let mut results = Vec::new();
        let Some((start, _)) = self.prefix_root(prefix) else {
            return results;
        };

        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            if let Some(value) = &node.value {
                results.push(value);
            }
            stack.extend(node.children.iter().rev().copied());
        }
        results
    }

    /// Panics if a structural invariant does not hold.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let mut values = 0;
        let mut reachable = 0;
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            if node.value.is_some() {
                values += 1;
            }
            if id != ROOT {
                reachable += 1;
                assert!(!node.segment.is_empty(), "empty segment below root");
                assert!(
                    node.value.is_some() || node.children.len() > 1,
                    "pass-through node {:?} with {} children",
                    id,
                    node.children.len()
                );
            }
            let firsts: Vec<u8> = node.children.iter().map(|c| self.node(*c).segment[0]).collect();
            assert!(firsts.windows(2).all(|w| w[0] < w[1]), "children not sorted/unique");
            for child in &node.children {
                assert_eq!(self.node(*child).parent, Some(id), "broken parent link");
                stack.push(*child);
            }
        }
        assert_eq!(values, self.len, "value count drifted");
        assert_eq!(reachable, self.node_count(), "leaked nodes");
    }
}
