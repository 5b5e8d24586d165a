use tokio::sync::mpsc;

use super::metadata::FileNodeRef;
use super::node::NodeState;
use crate::transport::ReplyStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
    FolderLoad,
    BufferUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    Good,
    Fail,
    NoConnect,
    Cancelled,
}

impl From<ReplyStatus> for OpOutcome {
    fn from(status: ReplyStatus) -> Self {
        match status {
            ReplyStatus::Good => OpOutcome::Good,
            ReplyStatus::Fail => OpOutcome::Fail,
            ReplyStatus::NoConnect => OpOutcome::NoConnect,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// A node changed; `node` is a snapshot taken at the moment of the change.
    Tree {
        node: FileNodeRef,
        state: NodeState,
        change: ChangeKind,
    },
    OpStarted,
    OpDone {
        outcome: OpOutcome,
        message: String,
    },
    /// Transient condition worth showing to a user, e.g. lost connectivity.
    Notice {
        message: String,
    },
}

impl CacheEvent {
    pub fn is_tree_change(&self) -> bool {
        matches!(self, CacheEvent::Tree { .. })
    }
}

/// Fan-out to every live subscriber. Closed receivers are dropped on the next publish.
#[derive(Debug, Default)]
pub(crate) struct Subscribers {
    senders: Vec<mpsc::UnboundedSender<CacheEvent>>,
}

impl Subscribers {
    pub(crate) fn subscribe(&mut self) -> mpsc::UnboundedReceiver<CacheEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push(tx);
        rx
    }

    pub(crate) fn publish(&mut self, event: &CacheEvent) {
        self.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }
}
