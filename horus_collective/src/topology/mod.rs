//! Rooted communication trees over node ids `0..N-1`.
//!
//! A [`Topology`] is an arena of [`TopologyNode`] records indexed by node id.
//! Parent and child links are ids into that arena. Topologies are immutable
//! once built; contexts share them through `Arc`.
//!
//! Two kinds of downward edges exist: message-passing children, each linked
//! by its own queue pair, and shared-memory children, which all hang off one
//! cluster channel owned by their coordinator.

pub mod model;

use std::collections::VecDeque;
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;

use crate::error::{CollectiveError, CollectiveResult};
use crate::node::NodeId;

pub use model::{Cell, Model};

/// One participant's position in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNode {
    id: NodeId,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    shm_coordinator: Option<NodeId>,
    shm_children: Vec<NodeId>,
    child_idx: usize,
}

impl TopologyNode {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            parent: None,
            children: Vec::new(),
            shm_coordinator: None,
            shm_children: Vec::new(),
            child_idx: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Message-passing parent.
    #[inline]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Message-passing children in fan-out order.
    #[inline]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Coordinator of the shared-memory cluster this node belongs to.
    #[inline]
    pub fn shm_coordinator(&self) -> Option<NodeId> {
        self.shm_coordinator
    }

    /// Shared-memory children in position order.
    #[inline]
    pub fn shm_children(&self) -> &[NodeId] {
        &self.shm_children
    }

    /// Position among the parent's children (or the coordinator's members).
    #[inline]
    pub fn child_idx(&self) -> usize {
        self.child_idx
    }

    /// Upstream neighbour of either kind.
    #[inline]
    pub fn upstream(&self) -> Option<NodeId> {
        self.parent.or(self.shm_coordinator)
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.upstream().is_none()
    }

    /// No downstream neighbours of either kind.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty() && self.shm_children.is_empty()
    }

    #[inline]
    pub fn does_shared_memory(&self) -> bool {
        !self.shm_children.is_empty()
    }
}

/// Immutable rooted tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    name: String,
    root: NodeId,
    nodes: Vec<TopologyNode>,
    designated_leaves: Vec<NodeId>,
}

impl Topology {
    /// Build from `model`, or a balanced binary tree over `len` nodes when no
    /// model is given.
    pub fn create(model: Option<&Model>, len: usize, name: &str) -> CollectiveResult<Self> {
        match model {
            Some(m) => Self::from_model(m, name),
            None => Self::binary_tree(len, name),
        }
    }

    /// Node 0 is root; node `i` has children `2i+1` and `2i+2` when in range.
    pub fn binary_tree(len: usize, name: &str) -> CollectiveResult<Self> {
        if len == 0 {
            return Err(CollectiveError::invalid("topology needs at least one node"));
        }
        let mut nodes: Vec<TopologyNode> = (0..len).map(|i| TopologyNode::new(i as NodeId)).collect();
        for i in 1..len {
            let parent = (i - 1) / 2;
            nodes[i].parent = Some(parent as NodeId);
            nodes[i].child_idx = nodes[parent].children.len();
            nodes[parent].children.push(i as NodeId);
        }
        let topo = Self {
            name: name.to_string(),
            root: 0,
            nodes,
            designated_leaves: vec![(len - 1) as NodeId],
        };
        info!(
            "topology '{}': binary tree, {} nodes, depth {}",
            topo.name,
            topo.len(),
            topo.depth()
        );
        Ok(topo)
    }

    /// Parse a model matrix.
    ///
    /// Dimension and range problems are returned as `InvalidArgument`.
    ///
    /// # Panics
    ///
    /// Panics when the matrix does not describe a tree: unknown cell values,
    /// asymmetric parent/child cells, a node with two parents, a parent on the
    /// root, duplicate child positions, unreachable nodes (cycles), or a
    /// designated leaf with children.
    pub fn from_model(model: &Model, name: &str) -> CollectiveResult<Self> {
        model.validate_shape()?;
        let n = model.len();
        let root = model.root as usize;
        let mut nodes: Vec<TopologyNode> = (0..n).map(|i| TopologyNode::new(i as NodeId)).collect();

        for (i, node) in nodes.iter_mut().enumerate() {
            let mut children: Vec<(u8, NodeId)> = Vec::new();
            let mut shm_children: Vec<(u8, NodeId)> = Vec::new();

            for j in 0..n {
                let cell = model.cell(i, j);
                if i == j {
                    assert_eq!(cell, Cell::Empty, "model: node {} links to itself", i);
                    continue;
                }
                match cell {
                    Cell::Empty => {}
                    Cell::Parent => {
                        assert!(
                            matches!(model.cell(j, i), Cell::Child(_)),
                            "model: node {} names {} as parent, but {} does not list it as child",
                            i,
                            j,
                            j
                        );
                        assert!(
                            node.upstream().is_none(),
                            "model: node {} has more than one parent",
                            i
                        );
                        node.parent = Some(j as NodeId);
                    }
                    Cell::ShmCoordinator => {
                        assert!(
                            matches!(model.cell(j, i), Cell::ShmChild(_)),
                            "model: node {} names {} as coordinator, but {} does not list it",
                            i,
                            j,
                            j
                        );
                        assert!(
                            node.upstream().is_none(),
                            "model: node {} has more than one parent",
                            i
                        );
                        node.shm_coordinator = Some(j as NodeId);
                    }
                    Cell::Child(order) => {
                        assert_eq!(
                            model.cell(j, i),
                            Cell::Parent,
                            "model: node {} lists child {}, which does not name it as parent",
                            i,
                            j
                        );
                        children.push((order, j as NodeId));
                    }
                    Cell::ShmChild(pos) => {
                        assert_eq!(
                            model.cell(j, i),
                            Cell::ShmCoordinator,
                            "model: node {} lists shm child {}, which does not name it",
                            i,
                            j
                        );
                        shm_children.push((pos, j as NodeId));
                    }
                    Cell::Invalid(v) => panic!("model: invalid cell value {} at ({}, {})", v, i, j),
                }
            }

            node.children = ordered(children, i, "child");
            node.shm_children = ordered(shm_children, i, "shm child");
        }

        assert!(
            nodes[root].is_root(),
            "model: root {} has a parent",
            root
        );
        for node in &nodes {
            assert!(
                node.id as usize == root || !node.is_root(),
                "model: node {} has no parent",
                node.id
            );
        }

        // child_idx from each parent's ordered lists
        for i in 0..n {
            let links: Vec<NodeId> = nodes[i]
                .children
                .iter()
                .chain(nodes[i].shm_children.iter())
                .copied()
                .collect();
            let mp = nodes[i].children.len();
            for (k, child) in links.into_iter().enumerate() {
                nodes[child as usize].child_idx = if k < mp { k } else { k - mp };
            }
        }

        let topo = Self {
            name: name.to_string(),
            root: model.root,
            nodes,
            designated_leaves: model.leaves.clone(),
        };

        let reached = topo.bfs().len();
        assert_eq!(
            reached, n,
            "model: only {} of {} nodes reachable from root {}",
            reached, n, root
        );
        for &leaf in &topo.designated_leaves {
            assert!(
                topo.nodes[leaf as usize].is_leaf(),
                "model: designated leaf {} has children",
                leaf
            );
        }

        info!(
            "topology '{}': model with {} nodes, root {}, depth {}",
            topo.name,
            topo.len(),
            topo.root,
            topo.depth()
        );
        Ok(topo)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Largest node id present.
    pub fn max_id(&self) -> NodeId {
        self.nodes.len().saturating_sub(1) as NodeId
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> Option<&TopologyNode> {
        self.nodes.get(id as usize)
    }

    /// First record in array order.
    pub fn first_node(&self) -> Option<&TopologyNode> {
        self.nodes.first()
    }

    /// Record after `node` in array order.
    pub fn next(&self, node: &TopologyNode) -> Option<&TopologyNode> {
        self.nodes.get(node.id as usize + 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.iter()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children()).unwrap_or(&[])
    }

    pub fn shm_children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.shm_children()).unwrap_or(&[])
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        self.node(id).is_some_and(|n| n.is_root())
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.node(id).is_some_and(|n| n.is_leaf())
    }

    /// Leaves named by the model (the last node for generated trees).
    pub fn designated_leaves(&self) -> &[NodeId] {
        &self.designated_leaves
    }

    /// Structural leaves in id order.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.nodes.iter().filter(|n| n.is_leaf()).map(|n| n.id).collect()
    }

    /// Longest root-to-leaf path, in edges.
    pub fn depth(&self) -> usize {
        let mut depth = vec![0usize; self.len()];
        let mut max = 0;
        for id in self.bfs() {
            let node = &self.nodes[id as usize];
            if let Some(up) = node.upstream() {
                depth[id as usize] = depth[up as usize] + 1;
                max = max.max(depth[id as usize]);
            }
        }
        max
    }

    /// Ids in breadth-first order from the root, following both edge kinds.
    pub fn bfs(&self) -> Vec<NodeId> {
        let mut seen = vec![false; self.len()];
        let mut order = Vec::with_capacity(self.len());
        let mut queue = VecDeque::from([self.root]);
        seen[self.root as usize] = true;
        while let Some(id) = queue.pop_front() {
            order.push(id);
            let node = &self.nodes[id as usize];
            for &child in node.children.iter().chain(&node.shm_children) {
                if !std::mem::replace(&mut seen[child as usize], true) {
                    queue.push_back(child);
                }
            }
        }
        order
    }
}

fn ordered(mut links: Vec<(u8, NodeId)>, owner: usize, what: &str) -> Vec<NodeId> {
    links.sort_unstable();
    for pair in links.windows(2) {
        assert_ne!(
            pair[0].0, pair[1].0,
            "model: node {} has two {} entries at position {}",
            owner, what, pair[0].0
        );
    }
    links.into_iter().map(|(_, id)| id).collect()
}

/// Named topologies with one active at a time.
#[derive(Debug)]
pub struct TopologySet {
    topologies: Vec<Arc<Topology>>,
    active: RwLock<usize>,
}

impl TopologySet {
    pub fn new(topologies: Vec<Topology>) -> CollectiveResult<Self> {
        if topologies.is_empty() {
            return Err(CollectiveError::invalid("topology set is empty"));
        }
        Ok(Self {
            topologies: topologies.into_iter().map(Arc::new).collect(),
            active: RwLock::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.topologies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topologies.is_empty()
    }

    pub fn active_index(&self) -> usize {
        *self.active.read()
    }

    /// The active topology; contexts built from it keep it pinned.
    pub fn active(&self) -> Arc<Topology> {
        Arc::clone(&self.topologies[*self.active.read()])
    }

    /// Index of the topology called `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.topologies.iter().position(|t| t.name() == name)
    }

    /// Make topology `idx` active.
    ///
    /// Fails while any handle to the current topology (for instance a live
    /// `Context`) is still held.
    pub fn switch_to(&self, idx: usize) -> CollectiveResult<()> {
        if idx >= self.topologies.len() {
            return Err(CollectiveError::invalid(format!(
                "topology index {} outside 0..{}",
                idx,
                self.topologies.len()
            )));
        }
        let mut active = self.active.write();
        let current = &self.topologies[*active];
        if Arc::strong_count(current) > 1 {
            return Err(CollectiveError::invalid(format!(
                "topology '{}' is still referenced by a live context",
                current.name()
            )));
        }
        *active = idx;
        info!("switched to topology '{}'", self.topologies[idx].name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_node_model() -> Model {
        // 0 -> {1, 2}, 1 -> {3}
        Model {
            root: 0,
            leaves: vec![2, 3],
            matrix: vec![
                vec![0, 1, 2, 0],
                vec![99, 0, 0, 1],
                vec![99, 0, 0, 0],
                vec![0, 99, 0, 0],
            ],
        }
    }

    #[test]
    fn test_binary_child_index_roundtrip() {
        for n in [1usize, 2, 3, 7, 16, 33] {
            let topo = Topology::binary_tree(n, "binary").unwrap();
            assert_eq!(topo.len(), n);
            assert!(topo.is_root(0));
            for node in topo.iter().skip(1) {
                let parent = node.parent().unwrap();
                let siblings = topo.children(parent);
                let hits: Vec<usize> = siblings
                    .iter()
                    .enumerate()
                    .filter(|(_, &c)| c == node.id())
                    .map(|(i, _)| i)
                    .collect();
                assert_eq!(hits, vec![node.child_idx()]);
            }
        }
    }

    #[test]
    fn test_binary_tree_shape() {
        let topo = Topology::binary_tree(7, "b7").unwrap();
        assert_eq!(topo.children(0), &[1, 2]);
        assert_eq!(topo.children(2), &[5, 6]);
        assert_eq!(topo.parent(6), Some(2));
        assert_eq!(topo.leaves(), vec![3, 4, 5, 6]);
        assert_eq!(topo.depth(), 2);
        assert!(!topo.is_leaf(99));
        assert!(Topology::binary_tree(0, "none").is_err());
    }

    #[test]
    fn test_model_and_generator_agree() {
        for n in [1usize, 2, 5, 16] {
            let model = Model::binary(n).unwrap();
            let from_model = Topology::create(Some(&model), n, "t").unwrap();
            let generated = Topology::create(None, n, "t").unwrap();
            assert_eq!(from_model, generated);
        }
    }

    #[test]
    fn test_four_node_model() {
        let topo = Topology::from_model(&four_node_model(), "four").unwrap();
        assert_eq!(topo.children(0), &[1, 2]);
        assert_eq!(topo.children(1), &[3]);
        assert_eq!(topo.designated_leaves(), &[2, 3]);
        assert_eq!(topo.leaves(), vec![2, 3]);
        assert_eq!(topo.node(3).unwrap().child_idx(), 0);
        assert_eq!(topo.node(2).unwrap().child_idx(), 1);
    }

    #[test]
    fn test_child_order_follows_cell_values() {
        let mut model = four_node_model();
        model.matrix[0] = vec![0, 2, 1, 0];
        let topo = Topology::from_model(&model, "swapped").unwrap();
        assert_eq!(topo.children(0), &[2, 1]);
        assert_eq!(topo.node(2).unwrap().child_idx(), 0);
    }

    #[test]
    fn test_shared_memory_cluster() {
        // 0 -> {1} by message passing; 1 coordinates {2, 3}
        let model = Model {
            root: 0,
            leaves: vec![],
            matrix: vec![
                vec![0, 1, 0, 0],
                vec![99, 0, 70, 71],
                vec![0, 50, 0, 0],
                vec![0, 50, 0, 0],
            ],
        };
        let topo = Topology::from_model(&model, "shm").unwrap();
        let coord = topo.node(1).unwrap();
        assert!(coord.does_shared_memory());
        assert_eq!(coord.shm_children(), &[2, 3]);
        assert!(!coord.is_leaf());
        let member = topo.node(3).unwrap();
        assert_eq!(member.shm_coordinator(), Some(1));
        assert_eq!(member.parent(), None);
        assert_eq!(member.child_idx(), 1);
        assert!(!member.is_root());
        assert_eq!(topo.depth(), 2);
    }

    #[test]
    fn test_iteration_in_array_order() {
        let topo = Topology::binary_tree(3, "b3").unwrap();
        let mut ids = Vec::new();
        let mut cur = topo.first_node();
        while let Some(node) = cur {
            ids.push(node.id());
            cur = topo.next(node);
        }
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    #[should_panic(expected = "does not name it as parent")]
    fn test_asymmetric_model_panics() {
        let mut model = four_node_model();
        model.matrix[3][1] = 0;
        let _ = Topology::from_model(&model, "broken");
    }

    #[test]
    #[should_panic(expected = "more than one parent")]
    fn test_double_parent_panics() {
        let mut model = four_node_model();
        model.matrix[2][1] = 2;
        model.matrix[1][2] = 99;
        model.matrix[2][0] = 99;
        let _ = Topology::from_model(&model, "broken");
    }

    #[test]
    #[should_panic(expected = "reachable")]
    fn test_cycle_panics() {
        // 0 alone; 1 <-> 2 in a cycle through 3
        let model = Model {
            root: 0,
            leaves: vec![],
            matrix: vec![
                vec![0, 0, 0, 0],
                vec![0, 0, 1, 99],
                vec![0, 99, 0, 1],
                vec![0, 1, 99, 0],
            ],
        };
        let _ = Topology::from_model(&model, "cycle");
    }

    #[test]
    fn test_bad_root_is_error() {
        let mut model = four_node_model();
        model.root = 9;
        assert!(matches!(
            Topology::from_model(&model, "bad"),
            Err(CollectiveError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_topology_set_switching() {
        let set = TopologySet::new(vec![
            Topology::binary_tree(4, "a").unwrap(),
            Topology::from_model(&four_node_model(), "b").unwrap(),
        ])
        .unwrap();
        assert_eq!(set.position("b"), Some(1));

        let held = set.active();
        assert!(set.switch_to(1).is_err());
        drop(held);

        set.switch_to(1).unwrap();
        assert_eq!(set.active().name(), "b");
        assert!(matches!(
            set.switch_to(5),
            Err(CollectiveError::InvalidArgument(_))
        ));
    }
}
