//! Partial-knowledge mirror of the remote tree.

pub mod events;
pub mod lock;
pub mod metadata;
pub mod node;
pub mod paths;
mod recursive;
mod tree;
mod tree_ops;

use std::path::PathBuf;

use thiserror::Error;

use crate::transport::TransportError;

pub use events::{CacheEvent, ChangeKind, OpOutcome};
pub use metadata::{FileMetaData, FileNodeRef, FileType};
pub use node::NodeState;
pub use recursive::{RecursiveError, RecursiveTask};
pub use tree::TreeCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("another operation is already pending")]
    OperationPending,
    #[error("the root folder cannot be {0}")]
    RootNode(&'static str),
    #[error("a recursive transfer is already running")]
    RecursiveActive,
    #[error("a request for {0} is already in flight")]
    RequestInFlight(String),
    #[error("reference to {0} is no longer live")]
    StaleReference(String),
    #[error("{path} is not a {expected}")]
    WrongNodeType {
        path: String,
        expected: &'static str,
    },
    #[error("{0} has not been confirmed by the remote store")]
    NotConfirmed(String),
    #[error("{0} already exists in the destination")]
    NameCollision(String),
    #[error("invalid path: {0}")]
    InvalidPath(#[from] paths::PathError),
    #[error("{}: {reason}", path.display())]
    LocalResource { path: PathBuf, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
