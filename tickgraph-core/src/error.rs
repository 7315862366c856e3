//! Error Types
//!
//! Every recoverable misuse of the graph is reported synchronously through
//! [`Error`]. Lifetime bugs in the embedding code (a node destroyed while
//! dependents stay attached, a value destroyed with listeners left) are not
//! errors: they panic, because continuing would read through a dead edge.

use thiserror::Error;

use crate::clock::ClockId;
use crate::graph::NodeId;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported by the graph, its clocks and its values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The node does not live in this graph (never inserted, or removed).
    #[error("node {0} does not exist")]
    NodeNotFound(NodeId),

    /// The node outputs a different type than the handle claims.
    #[error("node {node} outputs {actual}, expected {expected}")]
    TypeMismatch {
        /// The node that was accessed.
        node: NodeId,
        /// The type the caller asked for.
        expected: &'static str,
        /// The type the node actually produces.
        actual: &'static str,
    },

    /// The node is a plain sink and has no output.
    #[error("node {0} is not a signal")]
    NotASignal(NodeId),

    /// A value operation was applied to a node that is not a value.
    #[error("node {0} is not a value")]
    NotAValue(NodeId),

    /// The constant payload was requested from a non-constant value.
    #[error("value {0} is not a constant")]
    NotConstant(NodeId),

    /// The referenced signal was requested from a constant value.
    #[error("value {0} is a constant")]
    IsConstant(NodeId),

    /// Two nodes that must share a clock are attached to different ones.
    #[error("clocks don't match: {left} vs {right}")]
    ClockMismatch {
        /// Clock of the first input (or of the owning operator).
        left: ClockId,
        /// Clock of the second input (or of the new payload).
        right: ClockId,
    },

    /// A value or operator was detached while its inputs run at a clock.
    #[error("node {node} follows {clock}, the clock of its inputs")]
    ClockFollowsInputs {
        /// The node that was detached.
        node: NodeId,
        /// The clock its inputs run at.
        clock: ClockId,
    },

    /// Persistency was requested for a sink without a clock.
    #[error("sink {0} is not attached to a clock")]
    Unattached(NodeId),

    /// The node belongs to another node and can only go away with it.
    #[error("node {node} is owned by {owner}")]
    Owned {
        /// The node that was targeted.
        node: NodeId,
        /// The node owning it.
        owner: NodeId,
    },

    /// The node was offered as an internal payload but already has an owner.
    #[error("node {0} already has an owner")]
    AlreadyOwned(NodeId),

    /// Taking ownership of the node would make a value own itself.
    #[error("value {value} cannot own {node}, one of its ancestors")]
    OwnershipCycle {
        /// The value that was assigned.
        value: NodeId,
        /// The node that was offered as its internal payload.
        node: NodeId,
    },

    /// An operator input was addressed past the end of its inputs.
    #[error("operator {node} has {len} inputs, no input {index}")]
    InputOutOfRange {
        /// The operator.
        node: NodeId,
        /// The requested index.
        index: usize,
        /// Number of inputs the operator has.
        len: usize,
    },

    /// The clock has a fixed rate and no maximal rate to configure.
    #[error("clock {0} has a fixed rate")]
    FixedRate(ClockId),

    /// The clock derives its rate from wall-clock time and cannot be set.
    #[error("clock {0} has a variable rate")]
    VariableRate(ClockId),

    /// The maximal rate is so low its period cannot be waited for.
    #[error("clock {0} cannot be capped at that low a rate")]
    RateOutOfRange(ClockId),
}
