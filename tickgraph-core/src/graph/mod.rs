//! Node Graph
//!
//! This module implements the arena holding every sink, signal and value,
//! together with the relations between them.
//!
//! # Overview
//!
//! Nodes are addressed by [`NodeId`] and live in slots of the [`Graph`].
//! Two relations connect them:
//!
//! - Dependents: the values currently referencing a node. This is the
//!   reverse edge of a value's reference, kept so that removing a node can
//!   reset everything that still reads from it.
//! - Ownership: a node has at most one owner and any number of children.
//!   Children are removed together with their owner; an operator owns its
//!   input values and a value owns its internal signal.
//!
//! # Removal
//!
//! Removing a node runs in a fixed order:
//!
//! 1. Every dependent is reset to a default constant, dropping its edge.
//! 2. A value releases its own payload (edge or owned signal).
//! 3. The slot is removed and deregistered from its clock's persistent set.
//! 4. The children are removed, depth first.
//!
//! A node that still has dependents after step 1, or a value that still has
//! listeners, indicates a broken graph and aborts with a panic.

mod node;

pub use node::{NodeId, NodeKind, SignalId, ValueId};
pub(crate) use node::{NodeBody, Slot};

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Error, Result};

/// The arena of nodes.
///
/// All structural mutation (inserting, rewiring and removing nodes) goes
/// through `&mut Graph`. Update hooks only get a [`Context`](crate::Context),
/// which can pull but not restructure.
pub struct Graph {
    pub(crate) nodes: HashMap<NodeId, Slot>,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Does the graph hold no nodes at all?
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Is the node part of this graph?
    pub fn contains(&self, node: impl Into<NodeId>) -> bool {
        self.nodes.contains_key(&node.into())
    }

    /// What kind of node this is.
    pub fn kind(&self, node: impl Into<NodeId>) -> Result<NodeKind> {
        Ok(self.slot(node.into())?.kind)
    }

    /// The node owning this one, if any.
    pub fn owner(&self, node: impl Into<NodeId>) -> Result<Option<NodeId>> {
        Ok(self.slot(node.into())?.owner)
    }

    /// The nodes owned by this one.
    pub fn children(&self, node: impl Into<NodeId>) -> Result<Vec<NodeId>> {
        Ok(self.slot(node.into())?.children.to_vec())
    }

    /// The values currently referencing this node, in the order they started to.
    pub fn dependents(&self, node: impl Into<NodeId>) -> Result<Vec<NodeId>> {
        Ok(self.slot(node.into())?.dependents.iter().copied().collect())
    }

    /// Remove a node along with everything it owns.
    ///
    /// Values still referencing the node are reset to a default constant
    /// first. Nodes owned by another node can only go away with their owner
    /// (or when their owner lets go of them) and are refused with
    /// [`Error::Owned`].
    ///
    /// # Panics
    ///
    /// Panics if a value removed here still has listeners attached.
    pub fn remove(&mut self, node: impl Into<NodeId>) -> Result<()> {
        let id = node.into();
        if let Some(owner) = self.slot(id)?.owner {
            return Err(Error::Owned { node: id, owner });
        }
        self.destroy(id);
        Ok(())
    }

    pub(crate) fn destroy(&mut self, id: NodeId) {
        let Some(slot) = self.nodes.get(&id) else {
            return;
        };
        let dependents: Vec<NodeId> = slot.dependents.iter().copied().collect();
        for dependent in dependents {
            self.disconnect(dependent, id);
        }

        let Some(slot) = self.nodes.get(&id) else {
            return;
        };
        assert!(
            slot.dependents.is_empty(),
            "node {id} removed while {} dependents still reference it",
            slot.dependents.len()
        );
        if let Some(value) = slot.body.as_ref().and_then(|body| body.as_value()) {
            let listeners = value.listener_count();
            assert!(listeners == 0, "value {id} removed with {listeners} listeners attached");
        }

        self.release(id);

        let Some(slot) = self.nodes.remove(&id) else {
            return;
        };
        if let Some(clock) = &slot.sink.clock {
            clock.remove_persistent_sink(id);
        }
        debug!(node = %id, kind = ?slot.kind, children = slot.children.len(), "node removed");

        for child in slot.children {
            self.destroy(child);
        }
    }

    pub(crate) fn insert_slot(&mut self, slot: Slot) -> NodeId {
        let id = NodeId::new();
        debug!(node = %id, kind = ?slot.kind, output = ?slot.output, "node inserted");
        self.nodes.insert(id, slot);
        id
    }

    pub(crate) fn slot(&self, id: NodeId) -> Result<&Slot> {
        self.nodes.get(&id).ok_or(Error::NodeNotFound(id))
    }

    pub(crate) fn slot_mut(&mut self, id: NodeId) -> Result<&mut Slot> {
        self.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))
    }

    /// Downcast the body of a node. `name` is reported on mismatch.
    pub(crate) fn body_ref<B: 'static>(&self, id: NodeId, name: &'static str) -> Result<&B> {
        let slot = self.slot(id)?;
        slot.body
            .as_ref()
            .and_then(|body| body.as_any().downcast_ref::<B>())
            .ok_or(Error::TypeMismatch {
                node: id,
                expected: name,
                actual: slot.output.map_or("()", |output| output.name()),
            })
    }

    pub(crate) fn body_mut<B: 'static>(&mut self, id: NodeId, name: &'static str) -> Result<&mut B> {
        let slot = self.slot_mut(id)?;
        let actual = slot.output.map_or("()", |output| output.name());
        slot.body
            .as_mut()
            .and_then(|body| body.as_any_mut().downcast_mut::<B>())
            .ok_or(Error::TypeMismatch {
                node: id,
                expected: name,
                actual,
            })
    }

    /// Make `parent` the owner of `child`.
    pub(crate) fn adopt(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.slot_mut(child)?.owner = Some(parent);
        self.slot_mut(parent)?.children.push(child);
        Ok(())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        // Clocks outlive graphs; don't leave our ids in their persistent sets.
        for (id, slot) in &self.nodes {
            if let Some(clock) = &slot.sink.clock {
                clock.remove_persistent_sink(*id);
            }
        }
    }
}
