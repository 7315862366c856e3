//! Signal Implementation
//!
//! A Signal is a sink with an output. It caches the sample produced by its
//! generation step and hands out that cache until its clock ticks.
//!
//! # How Signals Work
//!
//! 1. A caller pulls the signal.
//!
//! 2. The signal asks its clock whether time advanced since it last ran.
//!
//! 3. If so, its generation step runs, pulling its own inputs in turn, and
//!    the result replaces the cache.
//!
//! 4. The cache is returned. Pulling again within the same tick returns the
//!    same sample without running the generation step.
//!
//! # Type Erasure
//!
//! Containers holding signals of different types can still pull them:
//! [`Graph::output_type`] reports what a node produces and
//! [`Graph::pull_erased`] hands out the fresh sample as `&dyn Any`.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeBody, NodeId, NodeKind, SignalId, Slot};

use super::context::Context;

/// A node generating one sample of `Output` per tick.
///
/// # Example
///
/// ```rust
/// use tickgraph_core::{Clock, Context, Graph, Result, Signal};
///
/// struct Ramp;
///
/// impl Signal for Ramp {
///     type Output = u32;
///
///     fn generate_sample(&mut self, _cx: &mut Context<'_>, out: &mut u32) -> Result<()> {
///         *out += 1;
///         Ok(())
///     }
/// }
///
/// let clock = Clock::invariable(1.0);
/// let mut graph = Graph::new();
/// let ramp = graph.insert_signal(Some(&clock), Ramp);
///
/// assert_eq!(graph.pull(ramp)?, 1);
/// assert_eq!(graph.pull(ramp)?, 1);
/// clock.tick(&mut graph)?;
/// assert_eq!(graph.pull(ramp)?, 2);
/// # Ok::<(), tickgraph_core::Error>(())
/// ```
pub trait Signal: Send + 'static {
    /// The sample type. The cache starts out as `Output::default()`.
    type Output: Clone + Default + Send + 'static;

    /// Generate the next sample.
    ///
    /// `out` holds the previous sample when this is called. Implementations
    /// must not depend on anything but their inputs' current samples.
    fn generate_sample(&mut self, cx: &mut Context<'_>, out: &mut Self::Output) -> Result<()>;

    /// The signal was attached to another clock (or detached).
    fn clock_changed(&mut self, _clock: Option<&Arc<Clock>>) {}
}

/// Runtime description of a signal's output type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputType {
    id: TypeId,
    name: &'static str,
}

impl OutputType {
    /// The output type for `T`.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Is this the output type for `T`?
    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }

    /// The [`TypeId`] of the sample type.
    pub fn type_id(&self) -> TypeId {
        self.id
    }

    /// The name of the sample type, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub(crate) struct SignalBody<S>(pub(crate) S);

impl<S: Signal> NodeBody for SignalBody<S> {
    fn run(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let mut out = cx.cached::<S::Output>()?;
        self.0.generate_sample(cx, &mut out)?;
        cx.store(out)
    }

    fn clock_changed(&mut self, clock: Option<&Arc<Clock>>) {
        self.0.clock_changed(clock);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Graph {
    /// Add a signal, optionally attached to a clock.
    pub fn insert_signal<S: Signal>(&mut self, clock: Option<&Arc<Clock>>, signal: S) -> SignalId<S::Output> {
        let slot = Slot::new(NodeKind::Signal, clock, Box::new(SignalBody(signal)))
            .with_cache(S::Output::default());
        SignalId::from_node(self.insert_slot(slot))
    }

    /// Borrow the state of a signal inserted with [`Graph::insert_signal`].
    pub fn signal_ref<S: Signal>(&self, signal: SignalId<S::Output>) -> Result<&S> {
        self.body_ref::<SignalBody<S>>(signal.id(), std::any::type_name::<S>())
            .map(|body| &body.0)
    }

    /// Mutably borrow the state of a signal inserted with [`Graph::insert_signal`].
    pub fn signal_mut<S: Signal>(&mut self, signal: SignalId<S::Output>) -> Result<&mut S> {
        self.body_mut::<SignalBody<S>>(signal.id(), std::any::type_name::<S>())
            .map(|body| &mut body.0)
    }

    /// Bring the signal up to date and return a copy of its sample.
    pub fn pull<T: Clone + 'static>(&mut self, signal: impl Into<SignalId<T>>) -> Result<T> {
        let id = signal.into().id();
        self.slot(id)?.expect_output::<T>(id)?;
        self.update(id)?;
        self.current(SignalId::<T>::from_node(id)).cloned()
    }

    /// The cached sample, without updating the signal.
    pub fn current<T: 'static>(&self, signal: impl Into<SignalId<T>>) -> Result<&T> {
        let id = signal.into().id();
        self.slot(id)?.cache_ref::<T>(id)
    }

    /// Bring any signal up to date and return its sample type-erased.
    ///
    /// Use [`Graph::output_type`] to find out what to downcast to.
    pub fn pull_erased(&mut self, node: NodeId) -> Result<&(dyn Any + Send)> {
        if self.slot(node)?.output.is_none() {
            return Err(Error::NotASignal(node));
        }
        self.update(node)?;
        self.slot(node)?
            .cache
            .as_deref()
            .ok_or(Error::NotASignal(node))
    }

    /// What the node produces, or `None` for a plain sink.
    pub fn output_type(&self, node: impl Into<NodeId>) -> Result<Option<OutputType>> {
        Ok(self.slot(node.into())?.output)
    }
}
