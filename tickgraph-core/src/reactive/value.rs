//! Value Implementation
//!
//! Values are the pluggable inputs of the graph. A value is a signal that
//! does not generate anything of its own: it either outputs a constant,
//! passes through another signal it references, or passes through a signal
//! it owns.
//!
//! # States
//!
//! - `Constant`: outputs a fixed payload and needs no clock.
//! - `Reference`: borrows a signal owned elsewhere. The value is recorded as
//!   a dependent of that signal, and runs at its clock.
//! - `Internal`: owns a signal. The signal is removed with the value, or
//!   when the value is assigned something else.
//!
//! # Transitions
//!
//! Every assignment first releases the old payload (dropping the
//! dependency edge, or removing the owned signal) and only then sets up the
//! new one. The value's cache is invalidated as well, so a rewired value
//! reads from its new source within the same tick.
//!
//! # Teardown
//!
//! A signal can be removed while values still reference it. Before its
//! slot goes away, every such value is reset to a constant holding
//! `T::default()`, so no value ever reads through a dead reference.

use std::any::Any;
use std::mem;
use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeBody, NodeId, NodeKind, SignalId, Slot, ValueId};

use super::context::Context;
use super::sink::{ClockPlan, ListenerId};

/// Which payload a value currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueMode {
    /// Outputs a fixed payload.
    Constant,
    /// Passes through a signal owned elsewhere.
    Reference,
    /// Passes through a signal the value owns.
    Internal,
}

/// What a value outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum Source<T> {
    /// A fixed payload.
    Constant(T),

    /// A signal owned by someone else.
    Reference(SignalId<T>),

    /// A signal the value takes ownership of.
    Internal(SignalId<T>),
}

impl<T> Source<T> {
    /// The mode a value assigned this source ends up in.
    pub fn mode(&self) -> ValueMode {
        match self {
            Source::Constant(_) => ValueMode::Constant,
            Source::Reference(_) => ValueMode::Reference,
            Source::Internal(_) => ValueMode::Internal,
        }
    }

    fn target(&self) -> Option<NodeId> {
        match self {
            Source::Constant(_) => None,
            Source::Reference(signal) | Source::Internal(signal) => Some(signal.id()),
        }
    }
}

impl<T> From<SignalId<T>> for Source<T> {
    fn from(signal: SignalId<T>) -> Self {
        Source::Reference(signal)
    }
}

impl<T> From<ValueId<T>> for Source<T> {
    fn from(value: ValueId<T>) -> Self {
        Source::Reference(value.signal())
    }
}

/// Observer of a value's assignments.
pub trait ValueListener<T>: Send + Sync {
    /// The value now outputs a constant.
    fn set_to_constant(&self, value: ValueId<T>, constant: &T);

    /// The value now references or owns a signal.
    fn set_to_signal(&self, value: ValueId<T>, signal: SignalId<T>);
}

/// Payload handed back when a value is reset.
pub(crate) enum Released {
    Nothing,
    Reference(NodeId),
    Internal(NodeId),
}

/// The part of a value that does not depend on its sample type.
pub(crate) trait ErasedValue: Send {
    fn mode(&self) -> ValueMode;

    /// The referenced or owned node.
    fn target(&self) -> Option<NodeId>;

    /// Switch to `Constant(T::default())`, handing back the old payload.
    fn reset(&mut self) -> Released;

    fn listener_count(&self) -> usize;

    /// Tell the listeners about the current state.
    fn notify(&self, value: NodeId);
}

pub(crate) struct ValueBody<T> {
    state: Source<T>,
    listeners: Vec<(ListenerId, Arc<dyn ValueListener<T>>)>,
}

impl<T: Default> ValueBody<T> {
    fn new() -> Self {
        Self {
            state: Source::Constant(T::default()),
            listeners: Vec::new(),
        }
    }
}

impl<T: Clone + Default + Send + 'static> ErasedValue for ValueBody<T> {
    fn mode(&self) -> ValueMode {
        self.state.mode()
    }

    fn target(&self) -> Option<NodeId> {
        self.state.target()
    }

    fn reset(&mut self) -> Released {
        match mem::replace(&mut self.state, Source::Constant(T::default())) {
            Source::Constant(_) => Released::Nothing,
            Source::Reference(signal) => Released::Reference(signal.id()),
            Source::Internal(signal) => Released::Internal(signal.id()),
        }
    }

    fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn notify(&self, value: NodeId) {
        let snapshot: Vec<Arc<dyn ValueListener<T>>> = self
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        let value = ValueId::from_node(value);
        match &self.state {
            Source::Constant(constant) => {
                for listener in snapshot {
                    listener.set_to_constant(value, constant);
                }
            }
            Source::Reference(signal) | Source::Internal(signal) => {
                for listener in snapshot {
                    listener.set_to_signal(value, *signal);
                }
            }
        }
    }
}

impl<T: Clone + Default + Send + 'static> NodeBody for ValueBody<T> {
    fn run(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let sample = match &self.state {
            Source::Constant(constant) => constant.clone(),
            Source::Reference(signal) | Source::Internal(signal) => cx.pull(*signal)?,
        };
        cx.store(sample)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn as_value(&self) -> Option<&dyn ErasedValue> {
        Some(self)
    }

    fn as_value_mut(&mut self) -> Option<&mut dyn ErasedValue> {
        Some(self)
    }
}

impl Graph {
    /// Add a value outputting `source`.
    ///
    /// ```rust
    /// use tickgraph_core::{Graph, Source};
    ///
    /// let mut graph = Graph::new();
    /// let gain = graph.insert_value(Source::Constant(0.5_f32))?;
    /// assert!(graph.is_constant(gain));
    /// assert_eq!(graph.pull(gain)?, 0.5);
    /// # Ok::<(), tickgraph_core::Error>(())
    /// ```
    pub fn insert_value<T>(&mut self, source: Source<T>) -> Result<ValueId<T>>
    where
        T: Clone + Default + Send + 'static,
    {
        let slot = Slot::new(NodeKind::Value, None, Box::new(ValueBody::<T>::new()))
            .with_cache(T::default());
        let value = ValueId::from_node(self.insert_slot(slot));
        if let Err(error) = self.assign(value, source) {
            self.destroy(value.id());
            return Err(error);
        }
        Ok(value)
    }

    /// Assign a new source to a value.
    ///
    /// Assigning a reference to the signal the value already references does
    /// nothing. Fails without touching the value when the source is
    /// unusable: a missing or differently typed signal, an internal signal
    /// that already has an owner (or would make the value own itself), or a
    /// signal on another clock than the operator the value feeds.
    pub fn assign<T>(&mut self, value: ValueId<T>, source: Source<T>) -> Result<()>
    where
        T: Clone + Default + Send + 'static,
    {
        let id = value.id();
        let current = &self.value_body::<T>(id)?.state;
        if let (Source::Reference(old), Source::Reference(new)) = (current, &source) {
            if old == new {
                return Ok(());
            }
        }

        let clock = self.validate_source(&source, Some(id))?;
        let plan = self.plan_clock(id, clock)?;

        self.release(id);

        let established = self.establish(id, &source);
        let plan = match &established {
            Ok(()) => {
                if let Some(body) = self.value_body_mut::<T>(id) {
                    body.state = source;
                }
                plan
            }
            Err(_) => self.detach_plan(id),
        };
        debug!(value = %id, mode = ?self.value_mode(value).ok(), "value assigned");

        self.finish_transition(id, plan);
        established
    }

    /// Have the value output a constant.
    pub fn set_constant<T>(&mut self, value: ValueId<T>, constant: T) -> Result<()>
    where
        T: Clone + Default + Send + 'static,
    {
        self.assign(value, Source::Constant(constant))
    }

    /// Have the value reference a signal owned elsewhere.
    pub fn set_reference<T>(&mut self, value: ValueId<T>, signal: impl Into<SignalId<T>>) -> Result<()>
    where
        T: Clone + Default + Send + 'static,
    {
        self.assign(value, Source::Reference(signal.into()))
    }

    /// Have the value take ownership of a signal.
    pub fn set_internal<T>(&mut self, value: ValueId<T>, signal: SignalId<T>) -> Result<()>
    where
        T: Clone + Default + Send + 'static,
    {
        self.assign(value, Source::Internal(signal))
    }

    /// Reset the value to a constant holding `T::default()`.
    pub fn reset_value<T>(&mut self, value: ValueId<T>) -> Result<()>
    where
        T: Clone + Default + Send + 'static,
    {
        self.assign(value, Source::Constant(T::default()))
    }

    /// The payload the value currently holds.
    pub fn value_mode<T: 'static>(&self, value: ValueId<T>) -> Result<ValueMode> {
        Ok(self.value_body::<T>(value.id())?.state.mode())
    }

    /// Is the value a constant? `false` for missing nodes.
    pub fn is_constant<T: 'static>(&self, value: ValueId<T>) -> bool {
        self.value_mode(value).is_ok_and(|mode| mode == ValueMode::Constant)
    }

    /// Does the value reference a signal? `false` for missing nodes.
    pub fn is_reference<T: 'static>(&self, value: ValueId<T>) -> bool {
        self.value_mode(value).is_ok_and(|mode| mode == ValueMode::Reference)
    }

    /// Does the value own a signal? `false` for missing nodes.
    pub fn is_internal<T: 'static>(&self, value: ValueId<T>) -> bool {
        self.value_mode(value).is_ok_and(|mode| mode == ValueMode::Internal)
    }

    /// The constant payload. Fails unless the value is a constant.
    pub fn constant<T: 'static>(&self, value: ValueId<T>) -> Result<&T> {
        match &self.value_body::<T>(value.id())?.state {
            Source::Constant(constant) => Ok(constant),
            _ => Err(Error::NotConstant(value.id())),
        }
    }

    /// The referenced or owned signal. Fails if the value is a constant.
    pub fn referenced<T: 'static>(&self, value: ValueId<T>) -> Result<SignalId<T>> {
        match &self.value_body::<T>(value.id())?.state {
            Source::Constant(_) => Err(Error::IsConstant(value.id())),
            Source::Reference(signal) | Source::Internal(signal) => Ok(*signal),
        }
    }

    /// Compare two values.
    ///
    /// Constants compare by payload. Anything else compares by the identity
    /// of the signal it resolves to, never by the samples it outputs.
    pub fn values_equal<T: PartialEq + 'static>(&self, a: ValueId<T>, b: ValueId<T>) -> Result<bool> {
        let a = &self.value_body::<T>(a.id())?.state;
        let b = &self.value_body::<T>(b.id())?.state;
        Ok(match (a, b) {
            (Source::Constant(a), Source::Constant(b)) => a == b,
            (Source::Constant(_), _) | (_, Source::Constant(_)) => false,
            _ => a.target() == b.target(),
        })
    }

    /// Register a listener for the value's assignments.
    pub fn add_value_listener<T: 'static>(
        &mut self,
        value: ValueId<T>,
        listener: Arc<dyn ValueListener<T>>,
    ) -> Result<ListenerId> {
        let id = value.id();
        self.value_body::<T>(id)?;
        let listener_id = ListenerId::new();
        if let Some(body) = self.value_body_mut::<T>(id) {
            body.listeners.push((listener_id, listener));
        }
        Ok(listener_id)
    }

    /// Remove a value listener. Returns `false` if it was not registered.
    pub fn remove_value_listener<T: 'static>(&mut self, value: ValueId<T>, listener: ListenerId) -> Result<bool> {
        let id = value.id();
        self.value_body::<T>(id)?;
        Ok(self.value_body_mut::<T>(id).is_some_and(|body| {
            let before = body.listeners.len();
            body.listeners.retain(|(id, _)| *id != listener);
            body.listeners.len() != before
        }))
    }

    /// Number of listeners registered on the value.
    pub fn value_listener_count<T: 'static>(&self, value: ValueId<T>) -> Result<usize> {
        Ok(self.value_body::<T>(value.id())?.listeners.len())
    }

    fn value_body<T: 'static>(&self, id: NodeId) -> Result<&ValueBody<T>> {
        let slot = self.slot(id)?;
        if slot.kind != NodeKind::Value {
            return Err(Error::NotAValue(id));
        }
        slot.body
            .as_ref()
            .and_then(|body| body.as_any().downcast_ref::<ValueBody<T>>())
            .ok_or(Error::TypeMismatch {
                node: id,
                expected: std::any::type_name::<T>(),
                actual: slot.output.map_or("()", |output| output.name()),
            })
    }

    fn value_body_mut<T: 'static>(&mut self, id: NodeId) -> Option<&mut ValueBody<T>> {
        self.nodes
            .get_mut(&id)?
            .body
            .as_mut()?
            .as_any_mut()
            .downcast_mut::<ValueBody<T>>()
    }

    /// Check a source before assigning it, and return the clock it runs at.
    pub(crate) fn validate_source<T: 'static>(
        &self,
        source: &Source<T>,
        value: Option<NodeId>,
    ) -> Result<Option<Arc<Clock>>> {
        let (signal, internal) = match source {
            Source::Constant(_) => return Ok(None),
            Source::Reference(signal) => (signal.id(), false),
            Source::Internal(signal) => (signal.id(), true),
        };

        let slot = self.slot(signal)?;
        slot.expect_output::<T>(signal)?;

        if internal {
            if slot.owner.is_some() {
                return Err(Error::AlreadyOwned(signal));
            }
            if let Some(value) = value {
                let mut ancestor = Some(value);
                while let Some(current) = ancestor {
                    if current == signal {
                        return Err(Error::OwnershipCycle { value, node: signal });
                    }
                    ancestor = self.nodes.get(&current).and_then(|slot| slot.owner);
                }
            }
        }
        Ok(slot.sink.clock.clone())
    }

    /// Release the payload of a value, leaving it a default constant.
    pub(crate) fn release(&mut self, value: NodeId) {
        let released = match self
            .nodes
            .get_mut(&value)
            .and_then(|slot| slot.body.as_mut())
            .and_then(|body| body.as_value_mut())
        {
            Some(body) => body.reset(),
            None => return,
        };

        match released {
            Released::Nothing => {}
            Released::Reference(target) => {
                if let Some(slot) = self.nodes.get_mut(&target) {
                    slot.remove_dependent(value);
                }
            }
            Released::Internal(child) => {
                if let Some(slot) = self.nodes.get_mut(&value) {
                    slot.children.retain(|id| *id != child);
                }
                if let Some(slot) = self.nodes.get_mut(&child) {
                    slot.owner = None;
                }
                self.destroy(child);
            }
        }
    }

    /// Record the edge or ownership a new payload implies.
    fn establish<T>(&mut self, value: NodeId, source: &Source<T>) -> Result<()> {
        match source {
            Source::Constant(_) => {}
            Source::Reference(signal) => {
                self.slot_mut(signal.id())?.add_dependent(value);
            }
            Source::Internal(signal) => {
                self.slot_mut(signal.id())?.owner = Some(value);
                self.slot_mut(value)?.children.push(signal.id());
            }
        }
        Ok(())
    }

    /// Move a value holding a constant, and the nodes following it, off
    /// their clock.
    fn detach_plan(&self, value: NodeId) -> ClockPlan {
        // Unattached inputs agree with any clock, so this cannot conflict.
        self.plan_clock(value, None).unwrap_or_default()
    }

    /// Move a freshly assigned value (and the nodes following it) to their
    /// clocks, drop its cache and those of its owners, and notify its
    /// listeners.
    fn finish_transition(&mut self, value: NodeId, plan: ClockPlan) {
        self.apply_clock_plan(plan);

        let mut next = Some(value);
        while let Some(id) = next {
            next = self.nodes.get_mut(&id).and_then(|slot| {
                slot.sink.invalidate();
                slot.owner
            });
        }

        if let Some(body) = self
            .nodes
            .get(&value)
            .and_then(|slot| slot.body.as_ref())
            .and_then(|body| body.as_value())
        {
            body.notify(value);
        }
    }

    /// Force a value referencing `target` to let go of it.
    pub(crate) fn disconnect(&mut self, value: NodeId, target: NodeId) {
        let references_target = self
            .nodes
            .get(&value)
            .and_then(|slot| slot.body.as_ref())
            .and_then(|body| body.as_value())
            .is_some_and(|body| body.mode() == ValueMode::Reference && body.target() == Some(target));
        if !references_target {
            return;
        }

        debug!(%value, %target, "disconnecting value from removed signal");
        self.release(value);
        let plan = self.detach_plan(value);
        self.finish_transition(value, plan);
    }
}
