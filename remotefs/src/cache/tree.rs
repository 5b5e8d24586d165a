use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::CacheError;
use super::events::{CacheEvent, ChangeKind, OpOutcome, Subscribers};
use super::lock::SingleFlight;
use super::metadata::{FileMetaData, FileNodeRef, FileType};
use super::node::{FileNode, NodeId, NodeState};
use super::paths;
use super::recursive::{RecursiveError, RecursiveJob, SubRequest};
use super::tree_ops::SimpleOp;
use crate::transport::{
    RemoteReply, RemoteRequest, RemoteTransport, ReplyEnvelope, ReplyPayload, ReplyStatus,
    RequestId, TransportError,
};

/// What an outstanding request was issued for.
#[derive(Debug)]
pub(super) enum PendingTask {
    Listing(NodeId),
    ContentFetch {
        node: NodeId,
        holds_simple_lock: bool,
    },
    Simple(SimpleOp),
    Recursive {
        generation: u64,
        request: SubRequest,
    },
}

/// In-memory mirror of the parts of the remote tree seen so far.
///
/// Every public call returns as soon as its request has been submitted. Replies are fed back
/// through [`TreeCache::deliver_reply`]; change events are published to subscribers before any
/// public call returns.
pub struct TreeCache {
    pub(super) transport: Box<dyn RemoteTransport>,
    pub(super) nodes: HashMap<NodeId, FileNode>,
    pub(super) root: NodeId,
    root_name: String,
    next_node: u64,
    clock: u64,
    pub(super) pending: HashMap<RequestId, PendingTask>,
    pub(super) simple_lock: SingleFlight,
    pub(super) recursive_lock: SingleFlight,
    pub(super) recursive: Option<RecursiveJob>,
    pub(super) generation: u64,
    subscribers: Subscribers,
    queue: VecDeque<CacheEvent>,
    draining: bool,
}

impl TreeCache {
    pub fn new(transport: Box<dyn RemoteTransport>, root_name: &str) -> Result<Self, CacheError> {
        let root_name = root_name.trim_matches('/');
        paths::validate_name(root_name)?;

        let root = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            FileNode::new(
                FileMetaData::new(&format!("/{root_name}"), FileType::Directory),
                1,
                None,
                true,
            ),
        );

        Ok(Self {
            transport,
            nodes,
            root,
            root_name: root_name.to_string(),
            next_node: 1,
            clock: 1,
            pending: HashMap::new(),
            simple_lock: SingleFlight::new(),
            recursive_lock: SingleFlight::new(),
            recursive: None,
            generation: 0,
            subscribers: Subscribers::default(),
            queue: VecDeque::new(),
            draining: false,
        })
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<CacheEvent> {
        self.subscribers.subscribe()
    }

    pub fn root(&self) -> FileNodeRef {
        self.snapshot(self.root)
    }

    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    pub fn is_root(&self, node: &FileNodeRef) -> bool {
        self.lookup(node) == Some(self.root)
    }

    /// True while `node` still names the same live entry it was captured from.
    pub fn is_live(&self, node: &FileNodeRef) -> bool {
        self.lookup(node).is_some()
    }

    pub fn operation_is_pending(&self) -> bool {
        self.simple_lock.is_claimed()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.pending.len()
    }

    /// Exact walk from the root; `None` as soon as a segment is unknown.
    pub fn resolve(&self, path: &str) -> Option<FileNodeRef> {
        self.find(path).map(|id| self.snapshot(id))
    }

    /// Deepest known node on the way to `path`.
    pub fn resolve_closest(&self, path: &str) -> FileNodeRef {
        self.snapshot(self.closest(path))
    }

    pub fn state(&self, node: &FileNodeRef) -> Option<NodeState> {
        self.lookup(node).map(|id| self.nodes[&id].state())
    }

    pub fn children(&self, node: &FileNodeRef) -> Vec<FileNodeRef> {
        let Some(id) = self.lookup(node) else {
            return Vec::new();
        };
        let mut children: Vec<FileNodeRef> = self.nodes[&id]
            .children
            .iter()
            .map(|child| self.snapshot(*child))
            .collect();
        children.sort_by(|a, b| a.name().cmp(b.name()));
        children
    }

    pub fn parent(&self, node: &FileNodeRef) -> Option<FileNodeRef> {
        let id = self.lookup(node)?;
        self.nodes[&id].parent.map(|parent| self.snapshot(parent))
    }

    pub fn child_with_name(&self, folder: &FileNodeRef, name: &str) -> Option<FileNodeRef> {
        let id = self.lookup(folder)?;
        self.child_named(id, name).map(|child| self.snapshot(child))
    }

    pub fn content_buffer(&self, node: &FileNodeRef) -> Option<Bytes> {
        let id = self.lookup(node)?;
        self.nodes[&id].content_buffer.clone()
    }

    pub fn is_listing_known(&self, node: &FileNodeRef) -> bool {
        self.lookup(node)
            .is_some_and(|id| self.nodes[&id].listing_known)
    }

    /// True when `ancestor` is a strict ancestor of `node` in the live tree.
    pub fn is_ancestor_of(&self, ancestor: &FileNodeRef, node: &FileNodeRef) -> bool {
        let (Some(ancestor), Some(node)) = (self.lookup(ancestor), self.lookup(node)) else {
            return false;
        };
        let mut cursor = self.nodes[&node].parent;
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    /// Resolves `path`, synthesizing unconfirmed placeholders for the unknown suffix and asking
    /// the remote store to confirm the last one. Intermediate placeholders are folders; the last
    /// one is a folder only when `assume_directory` is set.
    pub fn speculate(&mut self, path: &str, assume_directory: bool) -> Option<FileNodeRef> {
        let segments: Vec<String> = paths::segments(path)
            .into_iter()
            .map(str::to_string)
            .collect();
        let (first, rest) = segments.split_first()?;
        if *first != self.root_name {
            debug!(path, "speculation outside of the cache root");
            return None;
        }

        let mut current = self.root;
        for (index, segment) in rest.iter().enumerate() {
            if !self.nodes[&current].is_folder() {
                debug!(path, "speculation walks through a file");
                self.drain_events();
                return None;
            }
            current = match self.child_named(current, segment) {
                Some(child) => child,
                None => {
                    let is_last = index + 1 == rest.len();
                    let file_type = if is_last && !assume_directory {
                        FileType::File
                    } else {
                        FileType::Directory
                    };
                    let child_path = paths::join(self.nodes[&current].path(), segment);
                    self.insert_child(current, FileMetaData::new(&child_path, file_type), false)
                }
            };
        }

        let terminal = &self.nodes[&current];
        if !terminal.visible
            && terminal.outstanding_listing.is_none()
            && terminal.outstanding_content_fetch.is_none()
        {
            let confirm = if terminal.is_folder() {
                self.request_listing(current)
            } else {
                self.request_content(current, false)
            };
            if let Err(err) = confirm {
                warn!(path, error = %err, "could not confirm speculative node");
                self.purge_speculative_chain(current);
                self.drain_events();
                return None;
            }
        }

        let snapshot = self.snapshot(current);
        self.drain_events();
        Some(snapshot)
    }

    pub fn enact_root_refresh(&mut self) -> Result<(), CacheError> {
        let result = self.request_listing(self.root);
        self.drain_events();
        Ok(result?)
    }

    /// Re-lists a folder. With `clear_data` the known children are dropped first.
    pub fn enact_folder_refresh(
        &mut self,
        folder: &FileNodeRef,
        clear_data: bool,
    ) -> Result<(), CacheError> {
        let id = self.live(folder)?;
        if !self.nodes[&id].is_folder() {
            return Err(CacheError::WrongNodeType {
                path: folder.path().to_string(),
                expected: "folder",
            });
        }
        if clear_data {
            self.clear_folder(id);
        }
        let result = self.request_listing(id);
        self.drain_events();
        Ok(result?)
    }

    /// Re-lists the deepest known folder on the way to `path`.
    pub fn ls_closest_node(&mut self, path: &str) -> Result<(), CacheError> {
        let result = self.relist_closest(path);
        self.drain_events();
        Ok(result?)
    }

    pub fn ls_closest_node_to_parent(&mut self, path: &str) -> Result<(), CacheError> {
        self.ls_closest_node(&paths::containing_path(path))
    }

    /// Replaces a file's cached content locally. Returns whether the content changed.
    pub fn set_file_buffer(&mut self, file: &FileNodeRef, buffer: Bytes) -> Result<bool, CacheError> {
        let id = self.live(file)?;
        let node = self.node_mut(id)?;
        if !node.is_file() {
            return Err(CacheError::WrongNodeType {
                path: file.path().to_string(),
                expected: "file",
            });
        }
        if node.content_buffer.as_ref() == Some(&buffer) {
            return Ok(false);
        }
        node.content_buffer = Some(buffer);
        self.touch(id);
        self.emit_tree(id, ChangeKind::BufferUpdate);
        self.drain_events();
        Ok(true)
    }

    /// Throws away everything known and starts over from an unlisted root. Replies to requests
    /// issued before the reset are ignored.
    pub fn reset_file_data(&mut self) -> Result<(), CacheError> {
        info!("resetting cached tree");
        if self.recursive.is_some() {
            self.finish_recursive(OpOutcome::Cancelled, "transfer cancelled by cache reset".into());
        } else if self.simple_lock.is_claimed() {
            self.simple_lock.release();
            self.queue.push_back(CacheEvent::OpDone {
                outcome: OpOutcome::Cancelled,
                message: "operation cancelled by cache reset".into(),
            });
        }
        self.recursive_lock.release();
        self.pending.clear();

        let children = self.nodes[&self.root].children.clone();
        for child in children {
            self.remove_subtree(child);
        }
        let stamp = self.next_stamp();
        let root_path = format!("/{}", self.root_name);
        self.nodes.insert(
            self.root,
            FileNode::new(
                FileMetaData::new(&root_path, FileType::Directory),
                stamp,
                None,
                true,
            ),
        );
        self.emit_tree(self.root, ChangeKind::Modify);

        let result = self.request_listing(self.root);
        self.drain_events();
        Ok(result?)
    }

    /// Routes a reply to whatever issued the request. Unknown ids are ignored.
    pub fn deliver_reply(&mut self, envelope: ReplyEnvelope) {
        let ReplyEnvelope { id, reply } = envelope;
        let Some(task) = self.pending.remove(&id) else {
            debug!(request = %id, "ignoring reply without a pending request");
            return;
        };
        debug!(request = %id, status = ?reply.status, "reply received");
        match task {
            PendingTask::Listing(node) => self.complete_listing(id, node, reply),
            PendingTask::ContentFetch {
                node,
                holds_simple_lock,
            } => self.complete_content_fetch(id, node, holds_simple_lock, reply),
            PendingTask::Simple(op) => self.complete_simple(op, reply),
            PendingTask::Recursive {
                generation,
                request,
            } => self.complete_recursive_step(generation, request, reply),
        }
        self.drain_events();
    }

    pub(super) fn snapshot(&self, id: NodeId) -> FileNodeRef {
        self.nodes
            .get(&id)
            .map(FileNode::to_ref)
            .unwrap_or_else(FileNodeRef::nil)
    }

    pub(super) fn lookup(&self, node: &FileNodeRef) -> Option<NodeId> {
        let id = self.find(node.path())?;
        let live = &self.nodes[&id];
        (live.metadata == *node.metadata() && live.timestamp == node.timestamp()).then_some(id)
    }

    pub(super) fn live(&self, node: &FileNodeRef) -> Result<NodeId, CacheError> {
        self.lookup(node)
            .ok_or_else(|| CacheError::StaleReference(node.path().to_string()))
    }

    pub(super) fn node_mut(&mut self, id: NodeId) -> Result<&mut FileNode, CacheError> {
        let path = format!("node {}", id.0);
        self.nodes
            .get_mut(&id)
            .ok_or(CacheError::StaleReference(path))
    }

    pub(super) fn find(&self, path: &str) -> Option<NodeId> {
        let segments = paths::segments(path);
        let (first, rest) = segments.split_first()?;
        if *first != self.root_name {
            return None;
        }
        rest.iter()
            .try_fold(self.root, |current, segment| self.child_named(current, segment))
    }

    pub(super) fn closest(&self, path: &str) -> NodeId {
        let segments = paths::segments(path);
        let mut current = self.root;
        match segments.split_first() {
            Some((first, rest)) if *first == self.root_name => {
                for segment in rest {
                    match self.child_named(current, segment) {
                        Some(child) => current = child,
                        None => break,
                    }
                }
            }
            _ => {}
        }
        current
    }

    pub(super) fn child_named(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes.get(&parent)?.children.iter().copied().find(|child| {
            self.nodes
                .get(child)
                .is_some_and(|node| node.name() == name)
        })
    }

    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert_child(&mut self, parent: NodeId, metadata: FileMetaData, visible: bool) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        let stamp = self.next_stamp();
        debug!(path = metadata.path(), visible, "adding node");
        self.nodes
            .insert(id, FileNode::new(metadata, stamp, Some(parent), visible));
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.push(id);
        }
        self.emit_tree(id, ChangeKind::Add);
        self.touch(parent);
        id
    }

    pub(super) fn emit_tree(&mut self, id: NodeId, change: ChangeKind) {
        if let Some(node) = self.nodes.get(&id) {
            self.queue.push_back(CacheEvent::Tree {
                node: node.to_ref(),
                state: node.state(),
                change,
            });
        }
    }

    pub(super) fn emit(&mut self, event: CacheEvent) {
        self.queue.push_back(event);
    }

    /// Recomputes the node state and announces a change. Returns whether the state moved.
    pub(super) fn touch(&mut self, id: NodeId) -> bool {
        let changed = self
            .nodes
            .get_mut(&id)
            .is_some_and(FileNode::recompute_state);
        if changed {
            self.emit_tree(id, ChangeKind::Modify);
        }
        changed
    }

    /// Issues a listing unless one is already outstanding.
    pub(super) fn request_listing(&mut self, id: NodeId) -> Result<(), TransportError> {
        let Some(node) = self.nodes.get(&id) else {
            return Ok(());
        };
        if !node.is_folder() || node.deleting || node.outstanding_listing.is_some() {
            return Ok(());
        }
        let path = node.path().to_string();
        let request = self
            .transport
            .submit(RemoteRequest::List { path: path.clone() })?;
        debug!(request = %request, path = %path, "listing requested");
        self.pending.insert(request, PendingTask::Listing(id));
        if let Some(node) = self.nodes.get_mut(&id) {
            node.outstanding_listing = Some(request);
        }
        self.touch(id);
        Ok(())
    }

    /// Issues a content fetch unless one is already outstanding.
    pub(super) fn request_content(
        &mut self,
        id: NodeId,
        holds_simple_lock: bool,
    ) -> Result<(), TransportError> {
        let Some(node) = self.nodes.get(&id) else {
            return Ok(());
        };
        if !node.is_file() || node.deleting || node.outstanding_content_fetch.is_some() {
            return Ok(());
        }
        let path = node.path().to_string();
        let request = self
            .transport
            .submit(RemoteRequest::DownloadBuffer { path: path.clone() })?;
        debug!(request = %request, path = %path, "content requested");
        self.pending.insert(
            request,
            PendingTask::ContentFetch {
                node: id,
                holds_simple_lock,
            },
        );
        if let Some(node) = self.nodes.get_mut(&id) {
            node.outstanding_content_fetch = Some(request);
        }
        self.touch(id);
        Ok(())
    }

    /// Refreshes the closest known folder of `path`. A listing already in flight may predate
    /// the change, so the folder is listed again once it lands.
    pub(super) fn relist_closest(&mut self, path: &str) -> Result<(), TransportError> {
        let mut id = self.closest(path);
        if !self.nodes[&id].is_folder() {
            id = self.nodes[&id].parent.unwrap_or(self.root);
        }
        match self.nodes.get_mut(&id) {
            Some(node) if node.outstanding_listing.is_some() => {
                debug!(path = node.path(), "listing in flight, relist deferred");
                node.relist_requested = true;
                Ok(())
            }
            _ => self.request_listing(id),
        }
    }

    /// Drops every known child and marks the listing unknown.
    pub(super) fn clear_folder(&mut self, id: NodeId) {
        let children = self
            .nodes
            .get(&id)
            .map(|node| node.children.clone())
            .unwrap_or_default();
        for child in children {
            self.remove_subtree(child);
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.listing_known = false;
        }
        self.touch(id);
    }

    /// Removes `id` and everything below it. Outstanding requests of removed nodes are orphaned.
    pub(super) fn remove_subtree(&mut self, id: NodeId) {
        if id == self.root {
            return;
        }
        let Some(children) = self.nodes.get(&id).map(|node| node.children.clone()) else {
            return;
        };
        for child in children {
            self.remove_subtree(child);
        }

        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.deleting = true;
        node.content_buffer = None;
        let requests = [
            node.outstanding_listing.take(),
            node.outstanding_content_fetch.take(),
        ];
        node.recompute_state();
        let snapshot = node.to_ref();
        let state = node.state();
        let parent = node.parent;

        for request in requests.into_iter().flatten() {
            if let Some(PendingTask::ContentFetch {
                holds_simple_lock: true,
                ..
            }) = self.pending.remove(&request)
            {
                self.simple_lock.release();
                self.emit(CacheEvent::OpDone {
                    outcome: OpOutcome::Fail,
                    message: format!("{} was removed before its content arrived", snapshot.path()),
                });
            }
        }

        debug!(path = snapshot.path(), "removing node");
        self.queue.push_back(CacheEvent::Tree {
            node: snapshot,
            state,
            change: ChangeKind::Delete,
        });
        self.nodes.remove(&id);
        if let Some(parent) = parent {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.children.retain(|child| *child != id);
            }
            self.touch(parent);
        }
    }

    /// Deletes the unconfirmed chain that ends at `id`, up to the last confirmed ancestor.
    pub(super) fn purge_speculative_chain(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if node.visible {
            return;
        }
        let mut top = id;
        while let Some(parent) = self.nodes[&top].parent {
            if parent == self.root || self.nodes[&parent].visible {
                break;
            }
            top = parent;
        }
        info!(path = self.nodes[&top].path(), "purging unconfirmed nodes");
        self.remove_subtree(top);
    }

    /// Marks `id` and its unconfirmed ancestors as confirmed.
    fn set_visible_chain(&mut self, id: NodeId) {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get_mut(&current) else {
                break;
            };
            if node.visible {
                break;
            }
            node.visible = true;
            cursor = node.parent;
            self.touch(current);
        }
    }

    fn complete_listing(&mut self, request: RequestId, id: NodeId, reply: RemoteReply) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if node.outstanding_listing != Some(request) {
            debug!(request = %request, "ignoring superseded listing");
            return;
        }
        node.outstanding_listing = None;
        let relist = std::mem::take(&mut node.relist_requested);
        let path = node.path().to_string();
        let visible = node.visible;
        let connected = reply.status != ReplyStatus::NoConnect;

        match reply.status {
            ReplyStatus::Good => match reply.payload {
                ReplyPayload::Listing(entries) => self.apply_listing(id, &path, entries),
                other => {
                    error!(path = %path, payload = ?other, "listing reply carries no entries");
                    self.touch(id);
                }
            },
            ReplyStatus::Fail => {
                warn!(path = %path, "listing rejected");
                if visible {
                    self.touch(id);
                    self.emit(CacheEvent::Notice {
                        message: format!("Could not list {path}"),
                    });
                } else {
                    self.purge_speculative_chain(id);
                }
                self.abort_recursive_covering(&path, RecursiveError::LostFile(path.clone()));
            }
            ReplyStatus::NoConnect => {
                self.touch(id);
                self.notice_disconnected(&path);
                self.abort_recursive_covering(&path, RecursiveError::Disconnected);
            }
        }

        if relist && connected && self.nodes.contains_key(&id) {
            if let Err(err) = self.request_listing(id) {
                warn!(path = %path, error = %err, "deferred relist failed");
            }
        }
    }

    fn apply_listing(&mut self, id: NodeId, path: &str, entries: Vec<FileMetaData>) {
        let Some(control) = entries.iter().find(|entry| entry.is_self_entry()) else {
            error!(path, "listing reply has no self entry");
            self.touch(id);
            self.abort_recursive_covering(path, RecursiveError::Inconsistent(path.to_string()));
            return;
        };
        if control.containing_path() != path {
            error!(
                path,
                reply_path = %control.containing_path(),
                "listing reply belongs to another folder"
            );
            self.touch(id);
            self.abort_recursive_covering(path, RecursiveError::Inconsistent(path.to_string()));
            return;
        }

        let listed: Vec<FileMetaData> = entries
            .into_iter()
            .filter(|entry| !entry.is_self_entry() && entry.containing_path() == path)
            .filter(|entry| matches!(entry.file_type(), FileType::Directory | FileType::File))
            .collect();

        let known = self.nodes[&id].children.clone();
        for child in known {
            let keep = self
                .nodes
                .get(&child)
                .is_some_and(|node| listed.contains(&node.metadata));
            if !keep {
                self.remove_subtree(child);
            }
        }

        for entry in listed {
            let existing = self.nodes[&id].children.iter().copied().find(|child| {
                self.nodes
                    .get(child)
                    .is_some_and(|node| node.metadata == entry)
            });
            match existing {
                Some(child) => self.refresh_child(child, entry),
                None => {
                    self.insert_child(id, entry, true);
                }
            }
        }

        if let Some(node) = self.nodes.get_mut(&id) {
            node.listing_known = true;
        }
        self.set_visible_chain(id);
        self.touch(id);
        debug!(path, children = self.nodes[&id].children.len(), "listing applied");
        self.emit_tree(id, ChangeKind::FolderLoad);
    }

    fn refresh_child(&mut self, id: NodeId, entry: FileMetaData) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let mut changed = false;
        if node.metadata.size() != entry.size() || node.metadata.modified() != entry.modified() {
            node.metadata = entry;
            changed = true;
        }
        let stale_buffer = node
            .content_buffer
            .as_ref()
            .is_some_and(|buffer| buffer.len() as u64 != node.metadata.size());
        if stale_buffer {
            debug!(path = node.path(), "dropping buffer that no longer matches listed size");
            node.content_buffer = None;
            changed = true;
        }
        if !node.visible {
            node.visible = true;
            changed = true;
        }
        let state_changed = node.recompute_state();
        if changed || state_changed {
            self.emit_tree(id, ChangeKind::Modify);
        }
    }

    fn complete_content_fetch(
        &mut self,
        request: RequestId,
        id: NodeId,
        holds_simple_lock: bool,
        reply: RemoteReply,
    ) {
        if holds_simple_lock {
            self.simple_lock.release();
        }
        let Some(node) = self
            .nodes
            .get_mut(&id)
            .filter(|node| node.outstanding_content_fetch == Some(request))
        else {
            debug!(request = %request, "ignoring superseded content fetch");
            return;
        };
        node.outstanding_content_fetch = None;
        let path = node.path().to_string();
        let visible = node.visible;

        let (outcome, message) = match reply.status {
            ReplyStatus::Good => {
                let buffer = match reply.payload {
                    ReplyPayload::Buffer(buffer) => buffer,
                    _ => Bytes::new(),
                };
                let size = buffer.len() as u64;
                node.metadata = std::mem::take(&mut node.metadata).with_size(size);
                node.content_buffer = Some(buffer);
                self.set_visible_chain(id);
                self.touch(id);
                self.emit_tree(id, ChangeKind::BufferUpdate);
                (OpOutcome::Good, format!("Fetched {size} bytes of {path}"))
            }
            ReplyStatus::Fail => {
                warn!(path = %path, "content fetch rejected");
                if visible {
                    self.touch(id);
                } else {
                    self.purge_speculative_chain(id);
                }
                self.abort_recursive_covering(&path, RecursiveError::LostFile(path.clone()));
                (OpOutcome::Fail, format!("Could not read {path}"))
            }
            ReplyStatus::NoConnect => {
                self.touch(id);
                self.notice_disconnected(&path);
                self.abort_recursive_covering(&path, RecursiveError::Disconnected);
                (OpOutcome::NoConnect, format!("Could not reach the store to read {path}"))
            }
        };

        if holds_simple_lock {
            self.emit(CacheEvent::OpDone { outcome, message });
        }
    }

    pub(super) fn notice_disconnected(&mut self, path: &str) {
        warn!(path, "remote store unreachable");
        self.emit(CacheEvent::Notice {
            message: format!("No connection to the remote store while handling {path}"),
        });
    }

    /// Publishes queued events. While a recursive transfer runs, every batch containing a tree
    /// change wakes it up once; whatever it queues is published in the next round.
    pub(super) fn drain_events(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        loop {
            let mut tree_changed = false;
            while let Some(event) = self.queue.pop_front() {
                tree_changed |= event.is_tree_change();
                self.subscribers.publish(&event);
            }
            if !tree_changed || self.recursive.is_none() {
                break;
            }
            self.continue_recursive();
            if self.queue.is_empty() {
                break;
            }
        }
        self.draining = false;
    }
}

#[cfg(test)]
#[path = "tree_tests.rs"]
mod tests;
