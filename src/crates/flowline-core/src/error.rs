//! Error types for graph construction and pipeline execution.
//!
//! Two families:
//!
//! - [`GraphBuildError`]: structural problems caught by
//!   [`GraphBuilder::build`](crate::graph::GraphBuilder::build). Execution
//!   never starts on an invalid plan.
//! - [`FlowError`]: run-time failures. Every run-time error carries an
//!   [`ErrorKind`] classification that the retry layer consults to decide
//!   between retrying, dropping, and failing the node.
//!
//! Classification is the contract between nodes and the fault-tolerance
//! substrate: nodes raise errors with the most specific kind they can
//! determine, and the per-node [`RetryOptions`](crate::retry::RetryOptions)
//! decide what happens next.

use thiserror::Error;

/// Classification of a run-time error, used by the retry predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input data. Never retried; eligible for drop-on-error.
    InputValidation,
    /// Transient I/O failure. Retried with backoff.
    TransientIo,
    /// A downstream timeout while blocked on produce. Retried with a
    /// longer backoff than plain transient failures.
    BackpressureTimeout,
    /// A remote system reported a permanent failure. Surfaced immediately.
    PermanentRemote,
    /// A bug: invariant violation, misuse of the API. Surfaced immediately.
    Programmer,
    /// Cooperative cancellation. Not retried; flows like an error but is
    /// not reported as one.
    Cancelled,
}

impl ErrorKind {
    /// Whether the retry layer may re-attempt an error of this kind.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::TransientIo | ErrorKind::BackpressureTimeout)
    }
}

/// Run-time pipeline error.
#[derive(Error, Debug, Clone)]
pub enum FlowError {
    /// A per-item error raised by user node code (or on its behalf).
    #[error("{kind:?} in node '{node}': {message}")]
    Item {
        kind: ErrorKind,
        node: String,
        message: String,
    },

    /// A node terminated with an unrecovered error.
    #[error("node '{node}' failed: {source}")]
    NodeFailed {
        node: String,
        #[source]
        source: Box<FlowError>,
    },

    /// The circuit breaker for a node is open; the call fast-failed
    /// without invoking user code.
    #[error("circuit breaker open for node '{node}'")]
    BreakerOpen { node: String },

    /// Produced into a stream whose consumer has gone away.
    #[error("stream '{stream}' is closed")]
    StreamClosed { stream: String },

    /// The run was cancelled via the execution context's token.
    #[error("pipeline cancelled")]
    Cancelled,

    /// Engine-level failure: misconfiguration, disposal error.
    #[error("engine error: {0}")]
    Engine(String),
}

impl FlowError {
    pub fn validation(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::item(ErrorKind::InputValidation, node, message)
    }

    pub fn transient(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::item(ErrorKind::TransientIo, node, message)
    }

    pub fn backpressure(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::item(ErrorKind::BackpressureTimeout, node, message)
    }

    pub fn permanent(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::item(ErrorKind::PermanentRemote, node, message)
    }

    pub fn programmer(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::item(ErrorKind::Programmer, node, message)
    }

    pub fn item(kind: ErrorKind, node: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::Item {
            kind,
            node: node.into(),
            message: message.into(),
        }
    }

    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Item { kind, .. } => *kind,
            FlowError::NodeFailed { source, .. } => source.kind(),
            FlowError::BreakerOpen { .. } => ErrorKind::PermanentRemote,
            // The consumer going away only happens during shutdown; the
            // producer should wind down quietly rather than retry.
            FlowError::StreamClosed { .. } => ErrorKind::Cancelled,
            FlowError::Cancelled => ErrorKind::Cancelled,
            FlowError::Engine(_) => ErrorKind::Programmer,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

/// Convenience result alias for run-time operations.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Structural error reported by [`GraphBuilder::build`](crate::graph::GraphBuilder::build).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphBuildError {
    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),

    #[error("input port {port} of node '{node}' is not connected")]
    UnconnectedInput { node: String, port: usize },

    #[error("output port {port} of node '{node}' is not connected")]
    UnconnectedOutput { node: String, port: usize },

    #[error("output port {port} of node '{node}' already has a consumer")]
    OutputAlreadyConnected { node: String, port: usize },

    #[error("input port {port} of node '{node}' already has a producer")]
    InputAlreadyConnected { node: String, port: usize },

    #[error("join node '{0}' has fewer than two connected inputs")]
    JoinUnderConnected(String),

    #[error("edge {producer} -> {consumer} carries '{found}' but the port expects '{expected}'")]
    TypeMismatch {
        producer: String,
        consumer: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("graph contains a cycle through node '{0}'")]
    Cycle(String),

    #[error("edge {producer} -> {consumer} has zero buffer capacity")]
    ZeroCapacity { producer: String, consumer: String },

    #[error("port {port} of unknown node {node}")]
    UnknownPort { node: usize, port: usize },
}
