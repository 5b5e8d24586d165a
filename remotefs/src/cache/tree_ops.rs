use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{info, warn};

use super::CacheError;
use super::events::{CacheEvent, OpOutcome};
use super::metadata::FileNodeRef;
use super::node::NodeId;
use super::paths::{self, PathError};
use super::tree::{PendingTask, TreeCache};
use crate::transport::{RemoteReply, RemoteRequest, ReplyPayload, ReplyStatus};

const COMPRESS_JOB: &str = "compress";
const EXTRACT_JOB: &str = "extract";

/// Context a simple operation needs once its reply arrives.
#[derive(Debug)]
pub(super) enum SimpleOp {
    Delete {
        target: FileNodeRef,
    },
    Move {
        source: FileNodeRef,
        destination: String,
    },
    Copy {
        source: FileNodeRef,
        destination: String,
    },
    Rename {
        target: FileNodeRef,
        new_path: String,
    },
    Mkdir {
        parent: FileNodeRef,
        new_path: String,
    },
    Upload {
        folder: FileNodeRef,
        new_path: String,
    },
    Download {
        target: FileNodeRef,
        local_dest: PathBuf,
    },
    Job {
        target: FileNodeRef,
        job_name: &'static str,
    },
}

impl SimpleOp {
    fn target(&self) -> &FileNodeRef {
        match self {
            SimpleOp::Delete { target }
            | SimpleOp::Rename { target, .. }
            | SimpleOp::Download { target, .. }
            | SimpleOp::Job { target, .. } => target,
            SimpleOp::Move { source, .. } | SimpleOp::Copy { source, .. } => source,
            SimpleOp::Mkdir { parent, .. } => parent,
            SimpleOp::Upload { folder, .. } => folder,
        }
    }

    fn describe(&self) -> String {
        match self {
            SimpleOp::Delete { target } => format!("delete {}", target.path()),
            SimpleOp::Move {
                source,
                destination,
            } => format!("move {} to {destination}", source.path()),
            SimpleOp::Copy {
                source,
                destination,
            } => format!("copy {} to {destination}", source.path()),
            SimpleOp::Rename { target, new_path } => {
                format!("rename {} to {new_path}", target.path())
            }
            SimpleOp::Mkdir { new_path, .. } => format!("create folder {new_path}"),
            SimpleOp::Upload { new_path, .. } => format!("upload {new_path}"),
            SimpleOp::Download { target, .. } => format!("download {}", target.path()),
            SimpleOp::Job { target, job_name } => format!("{job_name} {}", target.path()),
        }
    }
}

impl TreeCache {
    pub fn delete(&mut self, target: &FileNodeRef) -> Result<(), CacheError> {
        self.start_simple(|cache| {
            cache.live_non_root(target, "deleted")?;
            Ok((
                RemoteRequest::Delete {
                    path: target.path().to_string(),
                },
                SimpleOp::Delete {
                    target: target.clone(),
                },
            ))
        })
    }

    /// Moves `source` into `destination_folder`, keeping its name.
    pub fn move_node(
        &mut self,
        source: &FileNodeRef,
        destination_folder: &FileNodeRef,
    ) -> Result<(), CacheError> {
        self.start_simple(|cache| {
            let destination = cache.relocation_target(source, destination_folder, "moved")?;
            Ok((
                RemoteRequest::Move {
                    path: source.path().to_string(),
                    destination: destination.clone(),
                },
                SimpleOp::Move {
                    source: source.clone(),
                    destination,
                },
            ))
        })
    }

    pub fn copy_node(
        &mut self,
        source: &FileNodeRef,
        destination_folder: &FileNodeRef,
    ) -> Result<(), CacheError> {
        self.start_simple(|cache| {
            let destination = cache.relocation_target(source, destination_folder, "copied")?;
            Ok((
                RemoteRequest::Copy {
                    path: source.path().to_string(),
                    destination: destination.clone(),
                },
                SimpleOp::Copy {
                    source: source.clone(),
                    destination,
                },
            ))
        })
    }

    pub fn rename(&mut self, target: &FileNodeRef, new_name: &str) -> Result<(), CacheError> {
        self.start_simple(|cache| {
            cache.live_non_root(target, "renamed")?;
            paths::validate_name(new_name)?;
            let new_path = paths::join(&paths::containing_path(target.path()), new_name);
            Ok((
                RemoteRequest::Rename {
                    path: target.path().to_string(),
                    new_name: new_name.to_string(),
                },
                SimpleOp::Rename {
                    target: target.clone(),
                    new_path,
                },
            ))
        })
    }

    pub fn mkdir(&mut self, parent: &FileNodeRef, new_name: &str) -> Result<(), CacheError> {
        self.start_simple(|cache| {
            cache.live_folder(parent)?;
            paths::validate_name(new_name)?;
            Ok((
                RemoteRequest::Mkdir {
                    path: parent.path().to_string(),
                    new_name: new_name.to_string(),
                },
                SimpleOp::Mkdir {
                    parent: parent.clone(),
                    new_path: paths::join(parent.path(), new_name),
                },
            ))
        })
    }

    /// Uploads a local file into `folder` under the file's own name.
    pub fn upload_file(&mut self, folder: &FileNodeRef, local_file: &Path) -> Result<(), CacheError> {
        self.start_simple(|cache| {
            cache.live_folder(folder)?;
            let metadata = std::fs::metadata(local_file).map_err(|err| local_error(local_file, &err))?;
            if !metadata.is_file() {
                return Err(CacheError::LocalResource {
                    path: local_file.to_path_buf(),
                    reason: "not a regular file".into(),
                });
            }
            let name = local_name(local_file)?;
            let new_path = paths::join(folder.path(), name);
            Ok((
                RemoteRequest::UploadFile {
                    path: new_path.clone(),
                    local_file: local_file.to_path_buf(),
                },
                SimpleOp::Upload {
                    folder: folder.clone(),
                    new_path,
                },
            ))
        })
    }

    pub fn upload_buffer(
        &mut self,
        folder: &FileNodeRef,
        buffer: Bytes,
        new_name: &str,
    ) -> Result<(), CacheError> {
        self.start_simple(|cache| {
            cache.live_folder(folder)?;
            paths::validate_name(new_name)?;
            Ok((
                RemoteRequest::UploadBuffer {
                    path: folder.path().to_string(),
                    buffer,
                    new_name: new_name.to_string(),
                },
                SimpleOp::Upload {
                    folder: folder.clone(),
                    new_path: paths::join(folder.path(), new_name),
                },
            ))
        })
    }

    /// Downloads a remote file straight to `local_dest` without touching the cached buffer.
    pub fn download_file(
        &mut self,
        target: &FileNodeRef,
        local_dest: &Path,
    ) -> Result<(), CacheError> {
        self.start_simple(|cache| {
            cache.live_file(target)?;
            let parent = local_dest
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            if !parent.is_dir() {
                return Err(CacheError::LocalResource {
                    path: parent.to_path_buf(),
                    reason: "destination folder does not exist".into(),
                });
            }
            if local_dest.is_dir() {
                return Err(CacheError::LocalResource {
                    path: local_dest.to_path_buf(),
                    reason: "destination is a folder".into(),
                });
            }
            Ok((
                RemoteRequest::DownloadFile {
                    local_dest: local_dest.to_path_buf(),
                    path: target.path().to_string(),
                },
                SimpleOp::Download {
                    target: target.clone(),
                    local_dest: local_dest.to_path_buf(),
                },
            ))
        })
    }

    /// Fetches a file's content into the cache.
    pub fn download_buffer(&mut self, target: &FileNodeRef) -> Result<(), CacheError> {
        if !self.simple_lock.check_and_claim() {
            return Err(CacheError::OperationPending);
        }
        let result = self.live_file(target).and_then(|id| {
            if self.nodes[&id].outstanding_content_fetch.is_some() {
                return Err(CacheError::RequestInFlight(target.path().to_string()));
            }
            self.request_content(id, true)?;
            Ok(())
        });
        if let Err(err) = result {
            self.simple_lock.release();
            return Err(err);
        }
        info!(path = target.path(), "download-buffer started");
        self.emit(CacheEvent::OpStarted);
        self.drain_events();
        Ok(())
    }

    /// Packs a folder into an archive next to it on the remote side.
    pub fn compress(&mut self, folder: &FileNodeRef) -> Result<(), CacheError> {
        self.start_simple(|cache| {
            cache.live_folder(folder)?;
            let mut params = BTreeMap::new();
            params.insert("compression_type".to_string(), "tgz".to_string());
            Ok((
                RemoteRequest::RunJob {
                    job_name: COMPRESS_JOB.to_string(),
                    params,
                    working_dir: folder.path().to_string(),
                },
                SimpleOp::Job {
                    target: folder.clone(),
                    job_name: COMPRESS_JOB,
                },
            ))
        })
    }

    pub fn decompress(&mut self, archive: &FileNodeRef) -> Result<(), CacheError> {
        self.start_simple(|cache| {
            let id = cache.live(archive)?;
            if cache.nodes[&id].is_folder() {
                return Err(CacheError::WrongNodeType {
                    path: archive.path().to_string(),
                    expected: "file",
                });
            }
            let mut params = BTreeMap::new();
            params.insert("inputFile".to_string(), archive.path().to_string());
            Ok((
                RemoteRequest::RunJob {
                    job_name: EXTRACT_JOB.to_string(),
                    params,
                    working_dir: String::new(),
                },
                SimpleOp::Job {
                    target: archive.clone(),
                    job_name: EXTRACT_JOB,
                },
            ))
        })
    }

    /// Claims the simple-operation lock, validates and submits. Any failure before the request is
    /// out releases the lock again and emits nothing.
    fn start_simple<F>(&mut self, prepare: F) -> Result<(), CacheError>
    where
        F: FnOnce(&Self) -> Result<(RemoteRequest, SimpleOp), CacheError>,
    {
        if !self.simple_lock.check_and_claim() {
            return Err(CacheError::OperationPending);
        }
        let submitted = prepare(self).and_then(|(request, op)| {
            let kind = request.kind();
            let id = self.transport.submit(request)?;
            Ok((id, kind, op))
        });
        match submitted {
            Ok((id, kind, op)) => {
                info!(request = %id, kind, target = op.target().path(), "operation started");
                self.pending.insert(id, PendingTask::Simple(op));
                self.emit(CacheEvent::OpStarted);
                self.drain_events();
                Ok(())
            }
            Err(err) => {
                self.simple_lock.release();
                warn!(error = %err, "operation refused");
                Err(err)
            }
        }
    }

    pub(super) fn complete_simple(&mut self, op: SimpleOp, reply: RemoteReply) {
        self.simple_lock.release();
        let outcome = OpOutcome::from(reply.status);
        let message = match reply.status {
            ReplyStatus::Good => self.refresh_after(&op, reply.payload),
            ReplyStatus::Fail => {
                warn!(operation = %op.describe(), "operation rejected");
                if let Some(id) = self.lookup(op.target()) {
                    self.purge_speculative_chain(id);
                }
                format!("Could not {}", op.describe())
            }
            ReplyStatus::NoConnect => {
                self.notice_disconnected(op.target().path());
                format!("Could not reach the store to {}", op.describe())
            }
        };
        self.emit(CacheEvent::OpDone { outcome, message });
    }

    fn refresh_after(&mut self, op: &SimpleOp, payload: ReplyPayload) -> String {
        let refreshed = match op {
            SimpleOp::Delete { target } => {
                self.remove_ref(target);
                self.relist_closest(&paths::containing_path(target.path()))
            }
            SimpleOp::Move {
                source,
                destination,
            } => {
                self.remove_ref(source);
                self.relist_closest(&paths::containing_path(source.path()))
                    .and_then(|_| self.relist_closest(destination))
            }
            SimpleOp::Copy {
                source,
                destination,
            } => self
                .relist_closest(&paths::containing_path(source.path()))
                .and_then(|_| self.relist_closest(destination)),
            SimpleOp::Rename { target, new_path } => {
                self.remove_ref(target);
                self.relist_closest(&paths::containing_path(target.path()))
                    .and_then(|_| self.relist_closest(new_path))
            }
            SimpleOp::Mkdir { new_path, .. } | SimpleOp::Upload { new_path, .. } => {
                self.relist_closest(new_path)
            }
            SimpleOp::Download { local_dest, .. } => {
                return format!("Download complete to: {}", local_dest.display());
            }
            SimpleOp::Job { target, job_name } => {
                let id = match payload {
                    ReplyPayload::Job(job) => job
                        .get("id")
                        .and_then(|id| id.as_str())
                        .map(str::to_string),
                    _ => None,
                };
                return match id {
                    Some(id) => format!("Started {job_name} job {id} for {}", target.path()),
                    None => format!("Started {job_name} job for {}", target.path()),
                };
            }
        };
        if let Err(err) = refreshed {
            warn!(error = %err, "could not refresh after operation");
        }
        let mut message = op.describe();
        if let Some(first) = message.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        format!("{message}: done")
    }

    fn remove_ref(&mut self, node: &FileNodeRef) {
        if let Some(id) = self.lookup(node) {
            self.remove_subtree(id);
        }
    }

    fn live_non_root(&self, node: &FileNodeRef, verb: &'static str) -> Result<NodeId, CacheError> {
        let id = self.live(node)?;
        if id == self.root {
            return Err(CacheError::RootNode(verb));
        }
        Ok(id)
    }

    pub(super) fn live_folder(&self, node: &FileNodeRef) -> Result<NodeId, CacheError> {
        let id = self.live(node)?;
        if !self.nodes[&id].is_folder() {
            return Err(CacheError::WrongNodeType {
                path: node.path().to_string(),
                expected: "folder",
            });
        }
        Ok(id)
    }

    fn live_file(&self, node: &FileNodeRef) -> Result<NodeId, CacheError> {
        let id = self.live(node)?;
        if !self.nodes[&id].is_file() {
            return Err(CacheError::WrongNodeType {
                path: node.path().to_string(),
                expected: "file",
            });
        }
        Ok(id)
    }

    fn relocation_target(
        &self,
        source: &FileNodeRef,
        destination_folder: &FileNodeRef,
        verb: &'static str,
    ) -> Result<String, CacheError> {
        self.live_non_root(source, verb)?;
        self.live_folder(destination_folder)?;
        if paths::is_within(destination_folder.path(), source.path()) {
            return Err(PathError::IntoItself(source.path().to_string()).into());
        }
        Ok(paths::join(destination_folder.path(), source.name()))
    }
}

pub(super) fn local_error(path: &Path, err: &std::io::Error) -> CacheError {
    CacheError::LocalResource {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

pub(super) fn local_name(path: &Path) -> Result<&str, CacheError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| CacheError::LocalResource {
            path: path.to_path_buf(),
            reason: "has no usable name".into(),
        })
}
