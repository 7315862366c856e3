//! Graph Nodes
//!
//! This module defines the handles that address nodes in the graph arena and
//! the slot each node occupies there.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use smallvec::SmallVec;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::reactive::{Context, ErasedValue, OutputType, SinkState};

/// Unique identifier for a node in the graph.
///
/// Identifiers are never reused, so a stale id can only ever miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node living in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A plain sink. It updates with its clock but has no output.
    Sink,

    /// A signal with a user-supplied generation step and a cached sample.
    Signal,

    /// A value: constant, reference to another signal, or owner of one.
    Value,
}

/// Typed handle to a node producing samples of type `T`.
pub struct SignalId<T> {
    id: NodeId,
    marker: PhantomData<fn() -> T>,
}

impl<T> SignalId<T> {
    pub(crate) fn from_node(id: NodeId) -> Self {
        Self {
            id,
            marker: PhantomData,
        }
    }

    /// The untyped node identifier.
    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl<T> Clone for SignalId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SignalId<T> {}

impl<T> PartialEq for SignalId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for SignalId<T> {}

impl<T> Hash for SignalId<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for SignalId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SignalId").field(&self.id.0).finish()
    }
}

impl<T> From<SignalId<T>> for NodeId {
    fn from(signal: SignalId<T>) -> Self {
        signal.id
    }
}

/// Typed handle to a value node.
///
/// A value is a signal too, so it converts into a [`SignalId`] and can be
/// referenced by other values.
pub struct ValueId<T>(SignalId<T>);

impl<T> ValueId<T> {
    pub(crate) fn from_node(id: NodeId) -> Self {
        Self(SignalId::from_node(id))
    }

    /// The untyped node identifier.
    pub fn id(&self) -> NodeId {
        self.0.id
    }

    /// This value seen as a signal.
    pub fn signal(&self) -> SignalId<T> {
        self.0
    }
}

impl<T> Clone for ValueId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ValueId<T> {}

impl<T> PartialEq for ValueId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for ValueId<T> {}

impl<T> Hash for ValueId<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> fmt::Debug for ValueId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValueId").field(&self.0.id.0).finish()
    }
}

impl<T> From<ValueId<T>> for SignalId<T> {
    fn from(value: ValueId<T>) -> Self {
        value.0
    }
}

impl<T> From<ValueId<T>> for NodeId {
    fn from(value: ValueId<T>) -> Self {
        value.0.id
    }
}

/// The behaviour stored in a slot, erased over its concrete type.
pub(crate) trait NodeBody: Send {
    /// Run the update hook (the generation step for signals).
    fn run(&mut self, cx: &mut Context<'_>) -> Result<()>;

    /// The node was attached to another clock.
    fn clock_changed(&mut self, _clock: Option<&Arc<Clock>>) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn as_value(&self) -> Option<&dyn ErasedValue> {
        None
    }

    fn as_value_mut(&mut self) -> Option<&mut dyn ErasedValue> {
        None
    }
}

/// A node as stored in the arena.
pub(crate) struct Slot {
    pub(crate) kind: NodeKind,

    /// Clock attachment, update timestamp and listeners.
    pub(crate) sink: SinkState,

    /// `None` while the body runs, which is how reentrant updates are caught.
    pub(crate) body: Option<Box<dyn NodeBody>>,

    /// Latest generated sample. `None` for plain sinks.
    pub(crate) cache: Option<Box<dyn Any + Send>>,

    pub(crate) output: Option<OutputType>,

    /// Values that currently reference this node.
    pub(crate) dependents: IndexSet<NodeId>,

    /// The node whose removal removes this one.
    pub(crate) owner: Option<NodeId>,

    /// Nodes removed together with this one.
    pub(crate) children: SmallVec<[NodeId; 2]>,
}

impl Slot {
    pub(crate) fn new(
        kind: NodeKind,
        clock: Option<&Arc<Clock>>,
        body: Box<dyn NodeBody>,
    ) -> Self {
        Self {
            kind,
            sink: SinkState::new(clock),
            body: Some(body),
            cache: None,
            output: None,
            dependents: IndexSet::new(),
            owner: None,
            children: SmallVec::new(),
        }
    }

    /// Give the slot a typed cache, starting at `initial`.
    pub(crate) fn with_cache<T: Send + 'static>(mut self, initial: T) -> Self {
        self.cache = Some(Box::new(initial));
        self.output = Some(OutputType::of::<T>());
        self
    }

    /// Check that this slot produces samples of type `T`.
    pub(crate) fn expect_output<T: 'static>(&self, id: NodeId) -> Result<()> {
        match self.output {
            None => Err(Error::NotASignal(id)),
            Some(output) if output.is::<T>() => Ok(()),
            Some(output) => Err(Error::TypeMismatch {
                node: id,
                expected: std::any::type_name::<T>(),
                actual: output.name(),
            }),
        }
    }

    /// The cached sample, typed.
    pub(crate) fn cache_ref<T: 'static>(&self, id: NodeId) -> Result<&T> {
        self.expect_output::<T>(id)?;
        self.cache
            .as_ref()
            .and_then(|cache| cache.downcast_ref::<T>())
            .ok_or(Error::NotASignal(id))
    }

    /// Add a dependent (a value that references this node).
    pub(crate) fn add_dependent(&mut self, node_id: NodeId) {
        self.dependents.insert(node_id);
    }

    /// Remove a dependent.
    pub(crate) fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.shift_remove(&node_id);
    }
}
