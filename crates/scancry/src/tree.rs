//! The layered tree of pointer candidates built by a pointer scan.
//!
//! Level 0 holds a single root node standing in for the target address.
//! Every node at level `d` is a location in memory holding a pointer into
//! the neighbourhood of its parent at level `d - 1`.
//!
//! Nodes are stored in one arena per level and linked with [NodeRef]
//! indices rather than references, so a level can be extended while the
//! previous ones are being read.

use crate::{error::Error, Address, RegionId};
use log::trace;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{fmt, mem};

/// Points at a node in a [PointerTree].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeRef {
    pub depth: usize,
    pub index: usize,
}

impl fmt::Display for NodeRef {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}:{}", self.depth, self.index)
    }
}

/// A single candidate in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Unique id, assigned in insertion order.
    pub id: u64,
    /// Region containing `own_addr`.
    pub region: RegionId,
    /// Where this node lives. For the root, the target address.
    pub own_addr: Address,
    /// The pointer value stored at `own_addr`. Null for the root.
    pub ptr_addr: Address,
    pub parent: Option<NodeRef>,
    pub children: Vec<NodeRef>,
}

#[derive(Debug)]
pub struct PointerTree {
    levels: Vec<Vec<Node>>,
    next_id: u64,
}

impl PointerTree {
    /// Construct an empty tree with room for `max_depth` levels.
    pub fn new(max_depth: usize) -> Self {
        Self {
            levels: (0..max_depth).map(|_| Vec::new()).collect(),
            next_id: 0,
        }
    }

    /// The number of levels, including the root level.
    pub fn max_depth(&self) -> usize {
        self.levels.len()
    }

    /// Add a node at the given depth.
    ///
    /// Only the root, at depth 0, is without a parent. Every other node must
    /// point at an existing node exactly one level up.
    pub fn add_node(
        &mut self,
        parent: Option<NodeRef>,
        region: RegionId,
        own_addr: Address,
        ptr_addr: Address,
        depth: usize,
    ) -> Result<NodeRef, Error> {
        if depth >= self.levels.len() {
            return Err(Error::InvalidNode(format!(
                "depth {} is outside of a tree with {} levels",
                depth,
                self.levels.len()
            )));
        }

        match parent {
            None if depth == 0 => {
                if !self.levels[0].is_empty() {
                    return Err(Error::InvalidNode(String::from("tree already has a root")));
                }
            }
            Some(parent) if parent.depth + 1 == depth => {
                if self.node(parent).is_none() {
                    return Err(Error::InvalidNode(format!("missing parent {}", parent)));
                }
            }
            parent => {
                return Err(Error::InvalidNode(format!(
                    "parent {:?} cannot have a child at depth {}",
                    parent, depth
                )));
            }
        }

        let level = &mut self.levels[depth];
        level.try_reserve(1)?;

        let node = NodeRef {
            depth,
            index: level.len(),
        };

        level.push(Node {
            id: self.next_id,
            region,
            own_addr,
            ptr_addr,
            parent,
            children: Vec::new(),
        });

        self.next_id += 1;

        if let Some(parent) = parent {
            let children = &mut self.levels[parent.depth][parent.index].children;
            children.try_reserve(1)?;
            children.push(node);
        }

        Ok(node)
    }

    /// All nodes at the given depth, in insertion order.
    pub fn depth_level(&self, depth: usize) -> &[Node] {
        self.levels.get(depth).map(Vec::as_slice).unwrap_or_default()
    }

    /// Access a node.
    pub fn node(&self, node: NodeRef) -> Option<&Node> {
        self.levels.get(node.depth)?.get(node.index)
    }

    pub fn root(&self) -> Option<&Node> {
        self.levels.first()?.first()
    }

    /// The total number of nodes.
    pub fn len(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(Vec::is_empty)
    }

    /// Remove every node.
    pub fn reset(&mut self) {
        // deepest first, nothing ever refers to a removed level.
        for level in self.levels.iter_mut().rev() {
            level.clear();
        }

        self.next_id = 0;
    }

    /// Prepare to collect the nodes of level `depth` concurrently.
    pub fn level_builder(&self, depth: usize) -> Result<LevelBuilder, Error> {
        if depth == 0 || depth >= self.levels.len() {
            return Err(Error::InvalidNode(format!(
                "cannot build level {} of a tree with {} levels",
                depth,
                self.levels.len()
            )));
        }

        let mut previous = Vec::new();
        previous.try_reserve_exact(self.levels[depth - 1].len())?;

        previous.extend(
            self.levels[depth - 1]
                .iter()
                .enumerate()
                .map(|(index, node)| {
                    let node_ref = NodeRef {
                        depth: depth - 1,
                        index,
                    };

                    (node.own_addr, node_ref)
                }),
        );

        previous.sort();

        Ok(LevelBuilder {
            depth,
            previous,
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Insert everything collected by `builder`.
    ///
    /// Candidates are inserted ordered by address and parent, so the
    /// resulting level does not depend on worker scheduling.
    pub fn commit(&mut self, builder: &LevelBuilder) -> Result<usize, Error> {
        let mut pending = builder.take();
        pending.sort_by_key(|c| (c.own_addr, c.parent));

        let count = pending.len();
        if let Some(level) = self.levels.get_mut(builder.depth) {
            level.try_reserve(count)?;
        }

        for c in pending {
            self.add_node(Some(c.parent), c.region, c.own_addr, c.ptr_addr, builder.depth)?;
        }

        trace!("committed {} nodes at depth {}", count, builder.depth);
        Ok(count)
    }
}

/// A node waiting to be committed to the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub parent: NodeRef,
    pub region: RegionId,
    pub own_addr: Address,
    pub ptr_addr: Address,
}

/// Collects the nodes of one level from many threads.
///
/// Holds a snapshot of the previous level sorted by address, so that
/// workers can look up parents without touching the tree.
#[derive(Debug)]
pub struct LevelBuilder {
    depth: usize,
    previous: Vec<(Address, NodeRef)>,
    pending: Mutex<Vec<Candidate>>,
}

impl LevelBuilder {
    /// The depth being built.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Nodes of the previous level, sorted by address.
    pub fn previous(&self) -> &[(Address, NodeRef)] {
        &self.previous
    }

    /// Nodes of the previous level within `max_obj_size` bytes at or after
    /// `value`, nearest first.
    pub fn candidates_for(&self, value: Address, max_obj_size: u64) -> &[(Address, NodeRef)] {
        let last = value.saturating_add(max_obj_size);
        let start = self.previous.partition_point(|(a, _)| *a < value);
        let end = self.previous.partition_point(|(a, _)| *a <= last);
        &self.previous[start..end.max(start)]
    }

    /// Move a batch of candidates into the level under a single lock.
    pub fn flush<A>(&self, batch: &mut SmallVec<A>)
    where
        A: smallvec::Array<Item = Candidate>,
    {
        if batch.is_empty() {
            return;
        }

        self.pending.lock().extend(batch.drain(..));
    }

    /// Number of candidates collected so far.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self) -> Vec<Candidate> {
        mem::take(&mut *self.pending.lock())
    }
}
