use bytes::Bytes;

use super::metadata::{FileMetaData, FileNodeRef, FileType};
use crate::transport::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(pub(crate) u64);

/// Externally visible lifecycle state of a cached node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    FolderContentsLoaded,
    FolderContentsLoading,
    /// Stale children are shown while a fresh listing is in flight.
    FolderContentsReloading,
    /// The folder exists but has never been listed.
    FolderKnownContentsNot,
    FolderSpeculateIdle,
    FolderSpeculateLoading,
    FileBuffLoaded,
    FileBuffLoading,
    FileBuffReloading,
    /// The file exists but its content has never been fetched.
    FileKnown,
    FileSpeculateIdle,
    FileSpeculateLoading,
    Deleting,
    Error,
}

impl NodeState {
    pub fn is_speculative(&self) -> bool {
        matches!(
            self,
            NodeState::FolderSpeculateIdle
                | NodeState::FolderSpeculateLoading
                | NodeState::FileSpeculateIdle
                | NodeState::FileSpeculateLoading
        )
    }
}

#[derive(Debug)]
pub(crate) struct FileNode {
    pub(crate) metadata: FileMetaData,
    pub(crate) timestamp: u64,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) content_buffer: Option<Bytes>,
    pub(crate) outstanding_listing: Option<RequestId>,
    pub(crate) outstanding_content_fetch: Option<RequestId>,
    /// A refresh arrived while `outstanding_listing` was in flight; list again once it lands.
    pub(crate) relist_requested: bool,
    pub(crate) visible: bool,
    pub(crate) listing_known: bool,
    pub(crate) deleting: bool,
    state: NodeState,
}

impl FileNode {
    pub(crate) fn new(
        metadata: FileMetaData,
        timestamp: u64,
        parent: Option<NodeId>,
        visible: bool,
    ) -> Self {
        let mut node = Self {
            metadata,
            timestamp,
            parent,
            children: Vec::new(),
            content_buffer: None,
            outstanding_listing: None,
            outstanding_content_fetch: None,
            relist_requested: false,
            visible,
            listing_known: false,
            deleting: false,
            state: NodeState::Error,
        };
        node.state = node.derive_state();
        node
    }

    pub(crate) fn state(&self) -> NodeState {
        self.state
    }

    /// Recomputes the cached state; returns true when it changed.
    pub(crate) fn recompute_state(&mut self) -> bool {
        let next = self.derive_state();
        let changed = next != self.state;
        self.state = next;
        changed
    }

    pub(crate) fn derive_state(&self) -> NodeState {
        if self.deleting {
            return NodeState::Deleting;
        }
        match self.metadata.file_type() {
            FileType::Directory => {
                let loading = self.outstanding_listing.is_some();
                if !self.visible {
                    return if loading {
                        NodeState::FolderSpeculateLoading
                    } else {
                        NodeState::FolderSpeculateIdle
                    };
                }
                match (loading, self.listing_known) {
                    (true, _) if !self.children.is_empty() => NodeState::FolderContentsReloading,
                    (true, _) => NodeState::FolderContentsLoading,
                    (false, true) => NodeState::FolderContentsLoaded,
                    (false, false) => NodeState::FolderKnownContentsNot,
                }
            }
            FileType::File => {
                let loading = self.outstanding_content_fetch.is_some();
                if !self.visible {
                    return if loading {
                        NodeState::FileSpeculateLoading
                    } else {
                        NodeState::FileSpeculateIdle
                    };
                }
                match (loading, self.content_buffer.is_some()) {
                    (true, true) => NodeState::FileBuffReloading,
                    (true, false) => NodeState::FileBuffLoading,
                    (false, true) => NodeState::FileBuffLoaded,
                    (false, false) => NodeState::FileKnown,
                }
            }
            FileType::EmptyFolder | FileType::Invalid | FileType::Nil => NodeState::Error,
        }
    }

    pub(crate) fn is_folder(&self) -> bool {
        self.metadata.is_folder()
    }

    pub(crate) fn is_file(&self) -> bool {
        self.metadata.is_file()
    }

    pub(crate) fn name(&self) -> &str {
        self.metadata.name()
    }

    pub(crate) fn path(&self) -> &str {
        self.metadata.path()
    }

    pub(crate) fn to_ref(&self) -> FileNodeRef {
        FileNodeRef::new(self.metadata.clone(), self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(visible: bool) -> FileNode {
        FileNode::new(
            FileMetaData::new("/disk/Docs", FileType::Directory),
            1,
            None,
            visible,
        )
    }

    fn file(visible: bool) -> FileNode {
        FileNode::new(
            FileMetaData::new("/disk/A.txt", FileType::File),
            1,
            None,
            visible,
        )
    }

    #[test]
    fn speculative_folder_tracks_listing() {
        let mut node = folder(false);
        assert_eq!(node.state(), NodeState::FolderSpeculateIdle);
        node.outstanding_listing = Some(RequestId(1));
        assert!(node.recompute_state());
        assert_eq!(node.state(), NodeState::FolderSpeculateLoading);
        node.listing_known = true;
        assert!(!node.recompute_state());
    }

    #[test]
    fn visible_folder_states() {
        let mut node = folder(true);
        assert_eq!(node.derive_state(), NodeState::FolderKnownContentsNot);
        node.outstanding_listing = Some(RequestId(1));
        assert_eq!(node.derive_state(), NodeState::FolderContentsLoading);
        node.children.push(NodeId(9));
        assert_eq!(node.derive_state(), NodeState::FolderContentsReloading);
        node.outstanding_listing = None;
        node.listing_known = true;
        assert_eq!(node.derive_state(), NodeState::FolderContentsLoaded);
    }

    #[test]
    fn visible_file_states() {
        let mut node = file(true);
        assert_eq!(node.derive_state(), NodeState::FileKnown);
        node.outstanding_content_fetch = Some(RequestId(4));
        assert_eq!(node.derive_state(), NodeState::FileBuffLoading);
        node.content_buffer = Some(Bytes::from_static(b"old"));
        assert_eq!(node.derive_state(), NodeState::FileBuffReloading);
        node.outstanding_content_fetch = None;
        assert_eq!(node.derive_state(), NodeState::FileBuffLoaded);
    }

    #[test]
    fn speculative_file_ignores_buffer() {
        let mut node = file(false);
        node.content_buffer = Some(Bytes::from_static(b"x"));
        assert_eq!(node.derive_state(), NodeState::FileSpeculateIdle);
        node.outstanding_content_fetch = Some(RequestId(2));
        assert_eq!(node.derive_state(), NodeState::FileSpeculateLoading);
    }

    #[test]
    fn deleting_overrides_everything() {
        let mut node = folder(true);
        node.outstanding_listing = Some(RequestId(3));
        node.deleting = true;
        assert_eq!(node.derive_state(), NodeState::Deleting);
    }

    #[test]
    fn untyped_entries_are_errors() {
        let node = FileNode::new(
            FileMetaData::new("/disk/x", FileType::Invalid),
            1,
            None,
            true,
        );
        assert_eq!(node.state(), NodeState::Error);
    }
}
