//! Tickgraph Core
//!
//! This crate provides the runtime for tickgraph, a graph of signals that
//! are evaluated on demand and memoized per clock tick. It implements:
//!
//! - Clocks, fixed-rate or following wall-clock time
//! - Sinks and signals with per-tick caching
//! - Values: constant, referencing or owning inputs that can be rewired
//! - Unary, binary and fold operator shapes
//!
//! Several clocks can drive one graph, e.g. an audio clock and a frame
//! clock, with each node attached to at most one of them.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `clock`: Time sources and their persistent-sink sets
//! - `graph`: The node arena, ownership and dependency bookkeeping
//! - `reactive`: Sinks, signals, values and operators
//! - `error`: The error type shared by all of the above
//!
//! # Example
//!
//! ```rust
//! use tickgraph_core::{Clock, Context, Graph, Result, Signal, Source};
//!
//! struct Counter;
//!
//! impl Signal for Counter {
//!     type Output = i32;
//!
//!     fn generate_sample(&mut self, _cx: &mut Context<'_>, out: &mut i32) -> Result<()> {
//!         *out += 1;
//!         Ok(())
//!     }
//! }
//!
//! let clock = Clock::invariable(100.0);
//! let mut graph = Graph::new();
//!
//! // A counter, and its sum with a constant.
//! let counter = graph.insert_signal(Some(&clock), Counter);
//! let sum = graph.insert_binary(|a: &i32, b: &i32| a + b, counter, Source::Constant(10))?;
//!
//! assert_eq!(graph.pull(sum.output)?, 11);
//! // Nothing regenerates until the clock ticks.
//! assert_eq!(graph.pull(sum.output)?, 11);
//!
//! clock.tick(&mut graph)?;
//! assert_eq!(graph.pull(sum.output)?, 12);
//! # Ok::<(), tickgraph_core::Error>(())
//! ```

pub mod clock;
pub mod error;
pub mod graph;
pub mod reactive;

pub use clock::{Clock, ClockId, Timestamp};
pub use error::{Error, Result};
pub use graph::{Graph, NodeId, NodeKind, SignalId, ValueId};
pub use reactive::{
    BinaryHandle, Combine, Context, Convert, Fold, FoldHandle, ListenerId, OutputType, Signal,
    Sink, SinkListener, Source, UnaryHandle, ValueListener, ValueMode,
};
