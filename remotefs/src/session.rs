//! Owns one [`TreeCache`] together with the channel its transport answers on.

use std::path::Path;

use anyhow::{Context, bail};
use remotefs_api::RemoteClient;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cache::paths;
use crate::cache::{CacheError, CacheEvent, FileNodeRef, NodeState, OpOutcome, TreeCache};
use crate::config::SessionConfig;
use crate::transport::http::HttpTransport;
use crate::transport::transfer::TransferClient;
use crate::transport::{RemoteTransport, ReplyEnvelope};

pub struct Session {
    cache: TreeCache,
    replies: mpsc::UnboundedReceiver<ReplyEnvelope>,
    events: mpsc::UnboundedReceiver<CacheEvent>,
}

impl Session {
    pub async fn bootstrap(config: &SessionConfig) -> anyhow::Result<Self> {
        let client = RemoteClient::with_base_url(&config.base_url, config.token.clone())
            .with_context(|| format!("invalid base url {}", config.base_url))?;
        let disk = client
            .get_disk_info()
            .await
            .context("failed to reach the remote store")?;
        info!(
            total = disk.total_space,
            used = disk.used_space,
            root = %config.root_name,
            "connected"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = HttpTransport::new(
            Handle::current(),
            client,
            TransferClient::new(config.transfer_config()),
            &config.root_name,
            config.transport_options(),
            tx,
        );
        let mut session = Self::with_transport(Box::new(transport), rx, &config.root_name)
            .context("failed to create tree cache")?;
        session
            .cache
            .enact_root_refresh()
            .context("failed to request the root listing")?;
        Ok(session)
    }

    pub fn with_transport(
        transport: Box<dyn RemoteTransport>,
        replies: mpsc::UnboundedReceiver<ReplyEnvelope>,
        root_name: &str,
    ) -> Result<Self, CacheError> {
        let mut cache = TreeCache::new(transport, root_name)?;
        let events = cache.subscribe();
        Ok(Self {
            cache,
            replies,
            events,
        })
    }

    pub fn cache(&self) -> &TreeCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut TreeCache {
        &mut self.cache
    }

    /// Waits for one reply and hands it to the cache. Returns false once the transport is gone.
    pub async fn pump(&mut self) -> bool {
        match self.replies.recv().await {
            Some(envelope) => {
                self.cache.deliver_reply(envelope);
                true
            }
            None => false,
        }
    }

    /// Pumps replies until `done` holds or nothing is left in flight.
    pub async fn settle<F>(&mut self, mut done: F) -> bool
    where
        F: FnMut(&TreeCache) -> bool,
    {
        loop {
            if done(&self.cache) {
                return true;
            }
            if self.cache.outstanding_requests() == 0 || !self.pump().await {
                return done(&self.cache);
            }
        }
    }

    /// Pumps replies until the running operation reports how it ended.
    pub async fn wait_for_outcome(&mut self) -> Option<(OpOutcome, String)> {
        loop {
            while let Ok(event) = self.events.try_recv() {
                match event {
                    CacheEvent::OpDone { outcome, message } => return Some((outcome, message)),
                    CacheEvent::Notice { message } => warn!(%message, "remote store notice"),
                    _ => {}
                }
            }
            if self.cache.outstanding_requests() == 0 || !self.pump().await {
                return None;
            }
        }
    }

    /// Lists `path`, confirming it first when it is unknown. `None` means the path does not exist.
    /// A file path lists as itself.
    pub async fn list(&mut self, path: &str) -> anyhow::Result<Option<Vec<FileNodeRef>>> {
        let path = paths::normalize(path);
        let Some(node) = self.cache.speculate(&path, true) else {
            return Ok(None);
        };
        if self.cache.state(&node) == Some(NodeState::FolderKnownContentsNot) {
            self.cache
                .enact_folder_refresh(&node, false)
                .with_context(|| format!("failed to list {path}"))?;
        }

        self.settle(|cache| match cache.resolve(&path) {
            None => true,
            Some(node) => !matches!(
                cache.state(&node),
                Some(
                    NodeState::FolderContentsLoading
                        | NodeState::FolderContentsReloading
                        | NodeState::FolderSpeculateLoading
                        | NodeState::FileSpeculateLoading
                )
            ),
        })
        .await;

        let Some(node) = self.cache.resolve(&path) else {
            return Ok(None);
        };
        match self.cache.state(&node) {
            Some(state) if state.is_speculative() => {
                bail!("could not confirm {path}: remote store unreachable")
            }
            Some(NodeState::FolderContentsLoaded) => Ok(Some(self.cache.children(&node))),
            Some(NodeState::FolderKnownContentsNot) => {
                bail!("listing of {path} did not complete")
            }
            _ => Ok(Some(vec![node])),
        }
    }

    /// Copies the remote folder `remote` into `local_dir`.
    pub async fn download_folder(
        &mut self,
        remote: &str,
        local_dir: &Path,
    ) -> anyhow::Result<(OpOutcome, String)> {
        let folder = self.confirmed_folder(remote).await?;
        self.discard_events();
        self.cache
            .enact_recursive_download(&folder, local_dir)
            .with_context(|| format!("cannot download {remote}"))?;
        self.wait_for_outcome()
            .await
            .context("download ended without an outcome")
    }

    /// Recreates the local folder `local_dir` inside the remote folder `remote`.
    pub async fn upload_folder(
        &mut self,
        local_dir: &Path,
        remote: &str,
    ) -> anyhow::Result<(OpOutcome, String)> {
        let folder = self.confirmed_folder(remote).await?;
        self.discard_events();
        self.cache
            .enact_recursive_upload(&folder, local_dir)
            .with_context(|| format!("cannot upload into {remote}"))?;
        self.wait_for_outcome()
            .await
            .context("upload ended without an outcome")
    }

    async fn confirmed_folder(&mut self, remote: &str) -> anyhow::Result<FileNodeRef> {
        if self.list(remote).await?.is_none() {
            bail!("{remote} does not exist");
        }
        let folder = self
            .cache
            .resolve(remote)
            .with_context(|| format!("{remote} disappeared"))?;
        if !folder.metadata().is_folder() {
            bail!("{remote} is not a folder");
        }
        Ok(folder)
    }

    fn discard_events(&mut self) {
        while self.events.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::cache::metadata::{FileMetaData, FileType};
    use crate::transport::{
        RemoteReply, RemoteRequest, ReplyPayload, RequestId, TransportError,
    };

    /// Answers straight away from an in-memory tree that mkdir and uploads extend.
    struct CannedTransport {
        tree: HashMap<String, Vec<FileMetaData>>,
        replies: mpsc::UnboundedSender<ReplyEnvelope>,
        next_id: u64,
    }

    impl CannedTransport {
        fn add(&mut self, folder: &str, entry: FileMetaData) {
            self.tree.entry(folder.to_string()).or_default().push(entry);
        }
    }

    impl RemoteTransport for CannedTransport {
        fn submit(&mut self, request: RemoteRequest) -> Result<RequestId, TransportError> {
            self.next_id += 1;
            let id = RequestId(self.next_id);
            let reply = match &request {
                RemoteRequest::List { path } => match self.tree.get(path) {
                    Some(children) => {
                        let mut entries = vec![FileMetaData::self_entry(path)];
                        entries.extend(children.iter().cloned());
                        RemoteReply::good(ReplyPayload::Listing(entries))
                    }
                    None => RemoteReply::fail(),
                },
                RemoteRequest::Mkdir { path, new_name } => {
                    let created = FileMetaData::new(&paths::join(path, new_name), FileType::Directory);
                    self.tree.insert(created.path().to_string(), Vec::new());
                    self.add(path, created.clone());
                    RemoteReply::good(ReplyPayload::Entry(created))
                }
                RemoteRequest::UploadFile { path, .. } => {
                    self.add(&paths::containing_path(path), FileMetaData::new(path, FileType::File));
                    RemoteReply::good(ReplyPayload::None)
                }
                _ => RemoteReply::fail(),
            };
            self.replies
                .send(ReplyEnvelope { id, reply })
                .map_err(|_| TransportError::Unavailable)?;
            Ok(id)
        }
    }

    fn session(tree: &[(&str, Vec<FileMetaData>)]) -> Session {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = CannedTransport {
            tree: tree
                .iter()
                .map(|(path, children)| (path.to_string(), children.clone()))
                .collect(),
            replies: tx,
            next_id: 0,
        };
        Session::with_transport(Box::new(transport), rx, "disk").unwrap()
    }

    fn names(nodes: &[FileNodeRef]) -> Vec<&str> {
        nodes.iter().map(FileNodeRef::name).collect()
    }

    #[tokio::test]
    async fn lists_root_and_nested_folder() {
        let mut session = session(&[
            (
                "/disk",
                vec![FileMetaData::new("/disk/Docs", FileType::Directory)],
            ),
            (
                "/disk/Docs",
                vec![
                    FileMetaData::new("/disk/Docs/b.txt", FileType::File),
                    FileMetaData::new("/disk/Docs/a.txt", FileType::File),
                ],
            ),
        ]);

        let root = session.list("/disk").await.unwrap().unwrap();
        assert_eq!(names(&root), vec!["Docs"]);

        let docs = session.list("/disk/Docs").await.unwrap().unwrap();
        assert_eq!(names(&docs), vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn unknown_path_lists_as_none() {
        let mut session = session(&[("/disk", vec![])]);
        assert!(session.list("/disk/missing").await.unwrap().is_none());
        assert!(session.list("/elsewhere").await.unwrap().is_none());
        assert!(session.cache().resolve("/disk/missing").is_none());
    }

    #[tokio::test]
    async fn file_path_lists_as_itself() {
        let mut session = session(&[(
            "/disk",
            vec![FileMetaData::new("/disk/a.txt", FileType::File).with_size(4)],
        )]);
        session.list("/disk").await.unwrap();
        let listed = session.list("/disk/a.txt").await.unwrap().unwrap();
        assert_eq!(names(&listed), vec!["a.txt"]);
        assert_eq!(listed[0].size(), 4);
    }

    #[tokio::test]
    async fn upload_folder_reports_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("photos");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("one.jpg"), b"1").unwrap();

        let mut session = session(&[("/disk", vec![])]);
        let (outcome, _message) = session.upload_folder(&source, "/disk").await.unwrap();
        assert_eq!(outcome, OpOutcome::Good);
        assert!(!session.cache().operation_is_pending());

        let uploaded = session.list("/disk/photos").await.unwrap().unwrap();
        assert_eq!(names(&uploaded), vec!["one.jpg"]);
    }
}
