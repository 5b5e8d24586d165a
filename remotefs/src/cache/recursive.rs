//! Whole-folder upload and download composed from single-entry requests.
//!
//! Neither workflow has a scheduler of its own. The walk is re-run after every batch of tree
//! changes and either issues the next request it needs or reports that the subtree is complete.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::CacheError;
use super::events::{CacheEvent, OpOutcome};
use super::metadata::FileNodeRef;
use super::node::NodeId;
use super::paths::{self, PathError};
use super::tree::{PendingTask, TreeCache};
use super::tree_ops::{local_error, local_name};
use crate::transport::{RemoteReply, RemoteRequest, ReplyStatus, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecursiveTask {
    #[default]
    None,
    Upload,
    Download,
}

#[derive(Debug, Error)]
pub enum RecursiveError {
    #[error("{0} exists remotely with a different type")]
    TypeMismatch(String),
    #[error("{0} disappeared from the remote store")]
    LostFile(String),
    #[error("could not create remote folder {0}")]
    MkdirFailed(String),
    #[error("could not upload {0}")]
    UploadFailed(String),
    #[error("lost connection to the remote store")]
    Disconnected,
    #[error("listing for {0} described another folder")]
    Inconsistent(String),
    #[error("{}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unsupported local name {}", .0.display())]
    UnsupportedName(PathBuf),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn local_io(path: &Path) -> impl FnOnce(io::Error) -> RecursiveError + '_ {
    move |source| RecursiveError::LocalIo {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub(super) struct RecursiveJob {
    pub(super) task: RecursiveTask,
    /// Remote folder being downloaded, or the remote counterpart of the uploaded folder.
    pub(super) remote_head: String,
    /// Local folder being uploaded, or the folder the download is written to.
    pub(super) local_head: PathBuf,
    pub(super) generation: u64,
}

/// A mkdir or upload the engine issued under its own lock.
#[derive(Debug, Clone)]
pub(super) enum SubRequest {
    Mkdir(String),
    Upload(String),
}

impl SubRequest {
    fn remote_path(&self) -> &str {
        match self {
            SubRequest::Mkdir(path) | SubRequest::Upload(path) => path,
        }
    }
}

impl TreeCache {
    pub fn recursive_task(&self) -> RecursiveTask {
        self.recursive
            .as_ref()
            .map_or(RecursiveTask::None, |job| job.task)
    }

    pub fn performing_recursive_upload(&self) -> bool {
        self.recursive_task() == RecursiveTask::Upload
    }

    pub fn performing_recursive_download(&self) -> bool {
        self.recursive_task() == RecursiveTask::Download
    }

    /// Copies the remote folder `target` into `local_dest/<target name>`.
    pub fn enact_recursive_download(
        &mut self,
        target: &FileNodeRef,
        local_dest: &Path,
    ) -> Result<(), CacheError> {
        if self.recursive.is_some() {
            return Err(CacheError::RecursiveActive);
        }
        let id = self.live_folder(target)?;
        if !self.nodes[&id].visible {
            return Err(CacheError::NotConfirmed(target.path().to_string()));
        }

        let metadata = fs::metadata(local_dest).map_err(|err| local_error(local_dest, &err))?;
        if !metadata.is_dir() {
            return Err(CacheError::LocalResource {
                path: local_dest.to_path_buf(),
                reason: "not a directory".into(),
            });
        }
        if metadata.permissions().readonly() {
            return Err(CacheError::LocalResource {
                path: local_dest.to_path_buf(),
                reason: "not writable".into(),
            });
        }
        let local_head = local_dest.join(target.name());
        if fs::symlink_metadata(&local_head).is_ok() {
            return Err(CacheError::NameCollision(local_head.display().to_string()));
        }

        if !self.simple_lock.check_and_claim() {
            return Err(CacheError::OperationPending);
        }
        self.begin_recursive(RecursiveJob {
            task: RecursiveTask::Download,
            remote_head: target.path().to_string(),
            local_head,
            generation: 0,
        });
        Ok(())
    }

    /// Recreates the local folder `local_source` inside the remote folder `destination`.
    pub fn enact_recursive_upload(
        &mut self,
        destination: &FileNodeRef,
        local_source: &Path,
    ) -> Result<(), CacheError> {
        if self.recursive.is_some() {
            return Err(CacheError::RecursiveActive);
        }
        let metadata = fs::metadata(local_source).map_err(|err| local_error(local_source, &err))?;
        if !metadata.is_dir() {
            return Err(CacheError::LocalResource {
                path: local_source.to_path_buf(),
                reason: "not a directory".into(),
            });
        }
        fs::read_dir(local_source).map_err(|err| local_error(local_source, &err))?;
        let name = local_name(local_source)?;
        paths::validate_name(name)?;

        let id = self.live_folder(destination)?;
        let node = &self.nodes[&id];
        if !node.visible || !node.listing_known || node.outstanding_listing.is_some() {
            return Err(CacheError::NotConfirmed(destination.path().to_string()));
        }
        if self.child_named(id, name).is_some() {
            return Err(CacheError::NameCollision(paths::join(destination.path(), name)));
        }

        if !self.simple_lock.check_and_claim() {
            return Err(CacheError::OperationPending);
        }
        self.begin_recursive(RecursiveJob {
            task: RecursiveTask::Upload,
            remote_head: paths::join(destination.path(), name),
            local_head: local_source.to_path_buf(),
            generation: 0,
        });
        Ok(())
    }

    /// Cancels the running transfer. Sub-requests already in flight are ignored on arrival.
    pub fn abort_recursive_process(&mut self) -> bool {
        let Some(job) = self.recursive.as_ref() else {
            return false;
        };
        info!(remote = %job.remote_head, "recursive transfer aborted");
        let message = match job.task {
            RecursiveTask::Upload => "Recursive upload cancelled",
            _ => "Recursive download cancelled",
        };
        self.finish_recursive(OpOutcome::Cancelled, message.to_string());
        self.drain_events();
        true
    }

    fn begin_recursive(&mut self, mut job: RecursiveJob) {
        self.generation += 1;
        job.generation = self.generation;
        info!(
            task = ?job.task,
            remote = %job.remote_head,
            local = %job.local_head.display(),
            "recursive transfer started"
        );
        self.recursive = Some(job);
        self.emit(CacheEvent::OpStarted);
        self.continue_recursive();
        self.drain_events();
    }

    /// Re-checks the running transfer and issues whatever it needs next.
    pub(super) fn continue_recursive(&mut self) {
        let Some(job) = self.recursive.clone() else {
            return;
        };
        let step = match job.task {
            RecursiveTask::Download => self.download_walk(&job).and_then(|done| {
                if done {
                    self.materialize(&job).map(Some)
                } else {
                    Ok(None)
                }
            }),
            RecursiveTask::Upload => self.upload_walk(&job).map(|done| done.then_some(0)),
            RecursiveTask::None => Ok(None),
        };
        match step {
            Ok(Some(files)) => {
                let message = match job.task {
                    RecursiveTask::Upload => {
                        format!("Uploaded {} to {}", job.local_head.display(), job.remote_head)
                    }
                    _ => format!(
                        "Downloaded {} files to {}",
                        files,
                        job.local_head.display()
                    ),
                };
                info!(remote = %job.remote_head, "recursive transfer finished");
                self.finish_recursive(OpOutcome::Good, message);
            }
            Ok(None) => {}
            Err(err) => self.fail_recursive(err),
        }
    }

    pub(super) fn finish_recursive(&mut self, outcome: OpOutcome, message: String) {
        self.recursive = None;
        self.recursive_lock.release();
        self.simple_lock.release();
        self.emit(CacheEvent::OpDone { outcome, message });
    }

    fn fail_recursive(&mut self, err: RecursiveError) {
        error!(error = %err, "recursive transfer failed");
        self.finish_recursive(OpOutcome::Fail, err.to_string());
        if let RecursiveError::TypeMismatch(path) = &err {
            let folder = self.closest(&paths::containing_path(path));
            self.clear_folder(folder);
            if let Err(err) = self.request_listing(folder) {
                warn!(error = %err, "could not relist after type mismatch");
            }
        }
    }

    /// Aborts the running transfer when a request on `path` failed inside its subtree.
    pub(super) fn abort_recursive_covering(&mut self, path: &str, err: RecursiveError) {
        let covered = self.recursive.as_ref().is_some_and(|job| {
            paths::is_within(path, &job.remote_head)
                || (job.task == RecursiveTask::Upload
                    && path == paths::containing_path(&job.remote_head))
        });
        if covered {
            self.fail_recursive(err);
        }
    }

    pub(super) fn complete_recursive_step(
        &mut self,
        generation: u64,
        request: SubRequest,
        reply: RemoteReply,
    ) {
        if self.recursive.as_ref().map(|job| job.generation) != Some(generation) {
            debug!(path = request.remote_path(), "ignoring reply for a finished transfer");
            return;
        }
        self.recursive_lock.release();
        let path = request.remote_path().to_string();
        match reply.status {
            ReplyStatus::Good => {
                debug!(path = %path, "recursive step done");
                if let Err(err) = self.relist_closest(&paths::containing_path(&path)) {
                    self.fail_recursive(err.into());
                }
            }
            ReplyStatus::Fail => self.fail_recursive(match request {
                SubRequest::Mkdir(path) => RecursiveError::MkdirFailed(path),
                SubRequest::Upload(path) => RecursiveError::UploadFailed(path),
            }),
            ReplyStatus::NoConnect => {
                self.notice_disconnected(&path);
                self.fail_recursive(RecursiveError::Disconnected);
            }
        }
    }

    /// Demands every listing and file content of the subtree. Returns true once all of it is
    /// known.
    fn download_walk(&mut self, job: &RecursiveJob) -> Result<bool, RecursiveError> {
        let head = self
            .find(&job.remote_head)
            .ok_or_else(|| RecursiveError::LostFile(job.remote_head.clone()))?;
        let mut complete = true;
        let mut stack = vec![head];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if !node.visible {
                continue;
            }
            if node.is_folder() {
                if !node.listing_known || node.outstanding_listing.is_some() {
                    complete = false;
                    self.request_listing(id)?;
                    continue;
                }
                stack.extend(node.children.iter().copied());
            } else if node.is_file()
                && (node.content_buffer.is_none() || node.outstanding_content_fetch.is_some())
            {
                complete = false;
                self.request_content(id, false)?;
            }
        }
        Ok(complete)
    }

    /// Writes the fully cached subtree below `job.local_head`. Returns the number of files.
    fn materialize(&self, job: &RecursiveJob) -> Result<usize, RecursiveError> {
        let head = self
            .find(&job.remote_head)
            .ok_or_else(|| RecursiveError::LostFile(job.remote_head.clone()))?;
        fs::create_dir(&job.local_head).map_err(local_io(&job.local_head))?;

        let mut files = 0;
        let mut stack: Vec<NodeId> = self.nodes[&head].children.clone();
        while let Some(id) = stack.pop() {
            let node = &self.nodes[&id];
            if !node.visible {
                continue;
            }
            let target = paths::local_path_for(&job.local_head, &job.remote_head, node.path())?;
            if node.is_folder() {
                fs::create_dir(&target).map_err(local_io(&target))?;
                stack.extend(node.children.iter().copied());
            } else if let Some(buffer) = &node.content_buffer {
                fs::write(&target, buffer).map_err(local_io(&target))?;
                files += 1;
            }
        }
        Ok(files)
    }

    fn upload_walk(&mut self, job: &RecursiveJob) -> Result<bool, RecursiveError> {
        let destination_path = paths::containing_path(&job.remote_head);
        let destination = self
            .find(&destination_path)
            .ok_or(RecursiveError::LostFile(destination_path))?;
        self.upload_into(destination, &job.local_head, job.generation)
    }

    /// Makes sure `local_dir` has a counterpart below the remote folder `parent` and walks into
    /// it. Returns false as soon as one request had to be issued or awaited.
    fn upload_into(
        &mut self,
        parent: NodeId,
        local_dir: &Path,
        generation: u64,
    ) -> Result<bool, RecursiveError> {
        if !self.listing_settled(parent)? {
            return Ok(false);
        }
        let name = local_dir
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| RecursiveError::UnsupportedName(local_dir.to_path_buf()))?;
        let parent_path = self.nodes[&parent].path().to_string();
        let remote_path = paths::join(&parent_path, name);

        let folder = match self.child_named(parent, name) {
            None => {
                self.issue_step(
                    RemoteRequest::Mkdir {
                        path: parent_path,
                        new_name: name.to_string(),
                    },
                    SubRequest::Mkdir(remote_path),
                    generation,
                )?;
                return Ok(false);
            }
            Some(id) if !self.nodes[&id].is_folder() => {
                return Err(RecursiveError::TypeMismatch(remote_path));
            }
            Some(id) => id,
        };
        if !self.listing_settled(folder)? {
            return Ok(false);
        }

        let mut entries = fs::read_dir(local_dir)
            .map_err(local_io(local_dir))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(local_io(local_dir))?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let file_type = entry.file_type().map_err(local_io(&path))?;
            if file_type.is_dir() {
                if !self.upload_into(folder, &path, generation)? {
                    return Ok(false);
                }
            } else if file_type.is_file() {
                let file_name = entry
                    .file_name()
                    .into_string()
                    .map_err(|_| RecursiveError::UnsupportedName(path.clone()))?;
                let remote_file = paths::join(&remote_path, &file_name);
                match self.child_named(folder, &file_name) {
                    None => {
                        self.issue_step(
                            RemoteRequest::UploadFile {
                                path: remote_file.clone(),
                                local_file: path,
                            },
                            SubRequest::Upload(remote_file),
                            generation,
                        )?;
                        return Ok(false);
                    }
                    Some(id) if !self.nodes[&id].is_file() => {
                        return Err(RecursiveError::TypeMismatch(remote_file));
                    }
                    Some(_) => {}
                }
            } else {
                debug!(path = %path.display(), "skipping special file");
            }
        }
        Ok(true)
    }

    /// True when the folder's children reflect a finished listing; requests one otherwise.
    fn listing_settled(&mut self, id: NodeId) -> Result<bool, RecursiveError> {
        let node = &self.nodes[&id];
        if node.listing_known && node.outstanding_listing.is_none() {
            return Ok(true);
        }
        self.request_listing(id)?;
        Ok(false)
    }

    /// Submits one sub-request unless the previous one has not come back yet.
    fn issue_step(
        &mut self,
        request: RemoteRequest,
        step: SubRequest,
        generation: u64,
    ) -> Result<(), RecursiveError> {
        if !self.recursive_lock.check_and_claim() {
            return Ok(());
        }
        let kind = request.kind();
        match self.transport.submit(request) {
            Ok(id) => {
                debug!(request = %id, kind, path = step.remote_path(), "recursive step issued");
                self.pending.insert(
                    id,
                    PendingTask::Recursive {
                        generation,
                        request: step,
                    },
                );
                Ok(())
            }
            Err(err) => {
                self.recursive_lock.release();
                Err(err.into())
            }
        }
    }
}
