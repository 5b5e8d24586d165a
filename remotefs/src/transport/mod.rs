//! Request/reply seam between the tree cache and whatever talks to the remote store.
//!
//! The cache never waits on a reply: it submits a [`RemoteRequest`], remembers the returned
//! [`RequestId`] and later receives the matching [`ReplyEnvelope`].

pub mod backoff;
pub mod http;
pub mod transfer;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use thiserror::Error;

use crate::cache::metadata::FileMetaData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRequest {
    List {
        path: String,
    },
    Delete {
        path: String,
    },
    Move {
        path: String,
        destination: String,
    },
    Copy {
        path: String,
        destination: String,
    },
    Rename {
        path: String,
        new_name: String,
    },
    Mkdir {
        path: String,
        new_name: String,
    },
    UploadFile {
        path: String,
        local_file: PathBuf,
    },
    UploadBuffer {
        path: String,
        buffer: Bytes,
        new_name: String,
    },
    DownloadFile {
        local_dest: PathBuf,
        path: String,
    },
    DownloadBuffer {
        path: String,
    },
    RunJob {
        job_name: String,
        params: BTreeMap<String, String>,
        working_dir: String,
    },
}

impl RemoteRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteRequest::List { .. } => "list",
            RemoteRequest::Delete { .. } => "delete",
            RemoteRequest::Move { .. } => "move",
            RemoteRequest::Copy { .. } => "copy",
            RemoteRequest::Rename { .. } => "rename",
            RemoteRequest::Mkdir { .. } => "mkdir",
            RemoteRequest::UploadFile { .. } => "upload",
            RemoteRequest::UploadBuffer { .. } => "upload-buffer",
            RemoteRequest::DownloadFile { .. } => "download",
            RemoteRequest::DownloadBuffer { .. } => "download-buffer",
            RemoteRequest::RunJob { .. } => "job",
        }
    }

    /// The remote path the request acts on (the working directory for jobs).
    pub fn path(&self) -> &str {
        match self {
            RemoteRequest::List { path }
            | RemoteRequest::Delete { path }
            | RemoteRequest::Move { path, .. }
            | RemoteRequest::Copy { path, .. }
            | RemoteRequest::Rename { path, .. }
            | RemoteRequest::Mkdir { path, .. }
            | RemoteRequest::UploadFile { path, .. }
            | RemoteRequest::UploadBuffer { path, .. }
            | RemoteRequest::DownloadFile { path, .. }
            | RemoteRequest::DownloadBuffer { path } => path,
            RemoteRequest::RunJob { working_dir, .. } => working_dir,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// The remote side performed the operation.
    Good,
    /// The remote side definitively rejected the operation.
    Fail,
    /// The remote side could not be reached; nothing can be concluded.
    NoConnect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyPayload {
    None,
    /// Directory enumeration, including the self-identifying `"."` entry.
    Listing(Vec<FileMetaData>),
    /// Metadata of the entry created or relocated by the request.
    Entry(FileMetaData),
    Buffer(Bytes),
    Job(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteReply {
    pub status: ReplyStatus,
    pub payload: ReplyPayload,
}

impl RemoteReply {
    pub fn good(payload: ReplyPayload) -> Self {
        Self {
            status: ReplyStatus::Good,
            payload,
        }
    }

    pub fn fail() -> Self {
        Self {
            status: ReplyStatus::Fail,
            payload: ReplyPayload::None,
        }
    }

    pub fn no_connect() -> Self {
        Self {
            status: ReplyStatus::NoConnect,
            payload: ReplyPayload::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplyEnvelope {
    pub id: RequestId,
    pub reply: RemoteReply,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("remote transport is unavailable")]
    Unavailable,
    #[error("remote transport rejected {kind} request: {reason}")]
    Rejected { kind: &'static str, reason: String },
}

/// Request factory. `submit` must return without waiting for the remote side; the reply is
/// delivered later, tagged with the returned id.
pub trait RemoteTransport {
    fn submit(&mut self, request: RemoteRequest) -> Result<RequestId, TransportError>;
}
