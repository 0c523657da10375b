//! Unified error handling for HORUS collectives
//!
//! Every fallible operation in this crate returns [`CollectiveResult`]. The
//! variants mirror the failure kinds of the communication stack: allocation,
//! argument validation, transient queue states, setup failures and the
//! bounded-retry outcomes of the blocking wrappers.

use thiserror::Error;

use crate::node::NodeId;

/// Main error type for collective operations
#[derive(Debug, Error)]
pub enum CollectiveError {
    /// Backing memory for a channel or context could not be allocated
    #[error("Allocation of {bytes} bytes failed")]
    MallocFail { bytes: usize },

    /// Buffer pointer or length does not satisfy the cache-line contract
    #[error("Bad alignment: {0}")]
    BadAlignment(String),

    /// Invalid input/argument errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The next slot is still owned by the consumer (transient)
    #[error("Queue full")]
    QueueFull,

    /// No message is ready in the next slot (transient)
    #[error("Queue empty")]
    QueueEmpty,

    /// Payload does not fit in a single channel slot
    #[error("Payload of {words} words exceeds the slot payload of {max} words")]
    PayloadTooLarge { words: usize, max: usize },

    /// Channel construction failed
    #[error("Channel creation failed: {0}")]
    ChanCreate(#[source] Box<CollectiveError>),

    /// Context construction failed while wiring a tree edge
    #[error("Context setup failed on edge {parent} -> {child}: {source}")]
    ContextCreate {
        parent: NodeId,
        child: NodeId,
        #[source]
        source: Box<CollectiveError>,
    },

    /// Node id is not part of the context/topology
    #[error("Node {0} is not part of this context")]
    NodeInvalid(NodeId),

    /// Spawning a node thread failed
    #[error("Failed to start node {node}: {message}")]
    NodeStart { node: NodeId, message: String },

    /// A node thread panicked or could not be joined
    #[error("Failed to join node {node}: {message}")]
    NodeJoin { node: NodeId, message: String },

    /// Blocking operation exceeded its retry budget or deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Blocking operation was cancelled through its token
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Configuration parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors with source location for debugging.
    /// Use the `collective_internal!()` macro to create these.
    #[error("Internal error: {message} (at {file}:{line})")]
    Internal {
        message: String,
        file: &'static str,
        line: u32,
    },
}

/// Create an internal error with automatic file/line capture.
///
/// ```rust,ignore
/// return Err(collective_internal!("slot {} out of range", idx));
/// ```
#[macro_export]
macro_rules! collective_internal {
    ($($arg:tt)*) => {
        $crate::error::CollectiveError::Internal {
            message: format!($($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// Convenience type alias for Results using CollectiveError
pub type CollectiveResult<T> = std::result::Result<T, CollectiveError>;

/// Short alias: `Result<T>` is equivalent to `CollectiveResult<T>`
pub type Result<T> = CollectiveResult<T>;

impl From<toml::de::Error> for CollectiveError {
    fn from(err: toml::de::Error) -> Self {
        CollectiveError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<serde_yaml::Error> for CollectiveError {
    fn from(err: serde_yaml::Error) -> Self {
        CollectiveError::Config(format!("YAML error: {}", err))
    }
}

// Helper methods
impl CollectiveError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(msg: S) -> Self {
        CollectiveError::Config(msg.into())
    }

    /// Create an invalid-argument error with a custom message
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        CollectiveError::InvalidArgument(msg.into())
    }

    /// Create a bad-alignment error with a custom message
    pub fn alignment<S: Into<String>>(msg: S) -> Self {
        CollectiveError::BadAlignment(msg.into())
    }

    /// Wrap an error raised while building a channel
    pub fn chan_create(source: CollectiveError) -> Self {
        CollectiveError::ChanCreate(Box::new(source))
    }

    /// `QueueFull`/`QueueEmpty` are expected states, retried by the blocking wrappers.
    pub fn is_transient(&self) -> bool {
        matches!(self, CollectiveError::QueueFull | CollectiveError::QueueEmpty)
    }

    /// Walk wrapped setup errors down to the innermost cause.
    pub fn root_cause(&self) -> &CollectiveError {
        match self {
            CollectiveError::ChanCreate(inner) => inner.root_cause(),
            CollectiveError::ContextCreate { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
