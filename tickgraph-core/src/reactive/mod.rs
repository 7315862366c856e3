//! Reactive Primitives
//!
//! This module implements the node types of the graph: sinks, signals and
//! values, plus the operator shapes built on top of them.
//!
//! # Concepts
//!
//! ## Sinks
//!
//! A Sink is a node that can be brought up to date with a clock. It runs its
//! update hook at most once per tick, and only when asked to: either because
//! something pulled it, or because it is persistent and its clock ticked.
//!
//! ## Signals
//!
//! A Signal is a sink that produces a sample. The sample is cached, so any
//! number of consumers can pull a signal within one tick while it generates
//! only once.
//!
//! ## Values
//!
//! A Value is the pluggable input of an operator. It outputs a constant, a
//! signal it references or a signal it owns, and can be switched between
//! these at runtime.
//!
//! # Implementation Notes
//!
//! Evaluation is pull-based and runs on the caller's stack. A node's body is
//! taken out of its slot while it runs; a pull reaching the same node again
//! (a feedback loop) finds the slot empty and reads the previous sample
//! instead of recursing.

mod context;
mod operation;
mod signal;
mod sink;
mod value;

pub use context::Context;
pub use operation::{BinaryHandle, Combine, Convert, Fold, FoldHandle, UnaryHandle};
pub use signal::{OutputType, Signal};
pub use sink::{ListenerId, Sink, SinkListener};
pub use value::{Source, ValueListener, ValueMode};

pub(crate) use sink::SinkState;
pub(crate) use value::ErasedValue;
