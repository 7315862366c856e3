//! Update Context
//!
//! The context is what an update hook sees of the graph while it runs. It
//! can pull other nodes and ask about the node's clock, but it cannot
//! rewire, insert or remove nodes, and it cannot move time forward. That
//! keeps generation steps pure functions of their inputs' current samples.

use std::any::Any;
use std::sync::Arc;

use crate::clock::{Clock, Timestamp};
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId, SignalId};

/// Access to the graph from inside an update hook.
pub struct Context<'a> {
    graph: &'a mut Graph,
    node: NodeId,
}

impl<'a> Context<'a> {
    pub(crate) fn new(graph: &'a mut Graph, node: NodeId) -> Self {
        Self { graph, node }
    }

    /// The node being updated.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Pull the current sample of another signal.
    pub fn pull<T: Clone + 'static>(&mut self, signal: impl Into<SignalId<T>>) -> Result<T> {
        self.graph.pull(signal)
    }

    /// Pull another signal without knowing its output type.
    pub fn pull_erased(&mut self, node: NodeId) -> Result<&(dyn Any + Send)> {
        self.graph.pull_erased(node)
    }

    /// The clock the node runs at, if any.
    pub fn clock(&self) -> Option<&Arc<Clock>> {
        self.graph
            .nodes
            .get(&self.node)
            .and_then(|slot| slot.sink.clock.as_ref())
    }

    /// The time index this update belongs to.
    pub fn now(&self) -> Timestamp {
        self.graph
            .nodes
            .get(&self.node)
            .map_or(0, |slot| slot.sink.timestamp)
    }

    /// The rate of the node's clock, or 0 when unattached.
    pub fn rate(&self) -> f32 {
        self.clock().map_or(0.0, |clock| clock.rate())
    }

    /// The delta of the node's clock in seconds, or 0 when unattached.
    pub fn delta(&self) -> f32 {
        self.clock().map_or(0.0, |clock| clock.delta())
    }

    /// A copy of the node's own cached sample.
    pub(crate) fn cached<T: Clone + 'static>(&self) -> Result<T> {
        self.graph
            .slot(self.node)?
            .cache_ref::<T>(self.node)
            .cloned()
    }

    /// Replace the node's cached sample.
    pub(crate) fn store<T: 'static>(&mut self, sample: T) -> Result<()> {
        let slot = self.graph.slot_mut(self.node)?;
        let cache = slot
            .cache
            .as_mut()
            .and_then(|cache| cache.downcast_mut::<T>())
            .ok_or(Error::NotASignal(self.node))?;
        *cache = sample;
        Ok(())
    }
}
