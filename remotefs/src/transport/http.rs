//! [`RemoteTransport`] backed by the REST client. Every request runs as its own tokio task and
//! reports back through an unbounded channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use remotefs_api::{OperationStatus, RemoteClient, RemoteError, Resource, ResourceType};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::backoff::Backoff;
use super::transfer::{TransferClient, TransferError};
use super::{
    RemoteReply, RemoteRequest, RemoteTransport, ReplyEnvelope, ReplyPayload, RequestId,
    TransportError,
};
use crate::cache::metadata::{FileMetaData, FileType};
use crate::cache::paths;

const API_SCHEME: &str = "disk:";

#[derive(Debug, Error)]
enum CallError {
    #[error(transparent)]
    Api(#[from] RemoteError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("{0} is not a file")]
    NotAFile(String),
    #[error("remote operation did not succeed")]
    OperationFailed,
}

impl CallError {
    fn is_connectivity(&self) -> bool {
        match self {
            CallError::Api(err) => err.is_connectivity(),
            CallError::Transfer(err) => err.is_connectivity(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub page_size: u32,
    /// Retry policy for idempotent lookups.
    pub retry: Backoff,
    /// Polling policy for long-running remote operations.
    pub poll: Backoff,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            retry: Backoff::default(),
            poll: Backoff::new(Duration::from_millis(250), Duration::from_secs(5), 10),
        }
    }
}

struct Shared {
    client: RemoteClient,
    transfer: TransferClient,
    root: String,
    options: TransportOptions,
}

pub struct HttpTransport {
    runtime: Handle,
    shared: Arc<Shared>,
    replies: mpsc::UnboundedSender<ReplyEnvelope>,
    next_id: u64,
}

impl HttpTransport {
    pub fn new(
        runtime: Handle,
        client: RemoteClient,
        transfer: TransferClient,
        root_name: &str,
        options: TransportOptions,
        replies: mpsc::UnboundedSender<ReplyEnvelope>,
    ) -> Self {
        Self {
            runtime,
            shared: Arc::new(Shared {
                client,
                transfer,
                root: root_name.trim_matches('/').to_string(),
                options,
            }),
            replies,
            next_id: 0,
        }
    }
}

impl RemoteTransport for HttpTransport {
    fn submit(&mut self, request: RemoteRequest) -> Result<RequestId, TransportError> {
        if self.replies.is_closed() {
            return Err(TransportError::Unavailable);
        }
        let in_root = match &request {
            RemoteRequest::RunJob { working_dir, .. } if working_dir.is_empty() => true,
            other => self.shared.api_path(other.path()).is_some(),
        };
        if !in_root {
            return Err(TransportError::Rejected {
                kind: request.kind(),
                reason: format!("{} is outside of /{}", request.path(), self.shared.root),
            });
        }

        self.next_id += 1;
        let id = RequestId(self.next_id);
        debug!(request = %id, kind = request.kind(), path = request.path(), "submitting");
        let shared = Arc::clone(&self.shared);
        let replies = self.replies.clone();
        self.runtime.spawn(async move {
            let reply = shared.execute(request).await;
            if replies.send(ReplyEnvelope { id, reply }).is_err() {
                debug!(request = %id, "reply dropped, session is gone");
            }
        });
        Ok(id)
    }
}

impl Shared {
    async fn execute(&self, request: RemoteRequest) -> RemoteReply {
        let kind = request.kind();
        let path = request.path().to_string();
        match self.run(request).await {
            Ok(payload) => RemoteReply::good(payload),
            Err(err) if err.is_connectivity() => {
                warn!(kind, path = %path, error = %err, "remote store unreachable");
                RemoteReply::no_connect()
            }
            Err(err) => {
                warn!(kind, path = %path, error = %err, "request failed");
                RemoteReply::fail()
            }
        }
    }

    async fn run(&self, request: RemoteRequest) -> Result<ReplyPayload, CallError> {
        match request {
            RemoteRequest::List { path } => {
                let api = self.api(&path);
                let page_size = self.options.page_size;
                let items = self
                    .retrying(|| self.client.list_directory_all(&api, page_size))
                    .await?;
                let mut entries = Vec::with_capacity(items.len() + 1);
                entries.push(FileMetaData::self_entry(&path));
                entries.extend(items.iter().map(|item| self.metadata_for(item)));
                Ok(ReplyPayload::Listing(entries))
            }
            RemoteRequest::Delete { path } => {
                if let Some(link) = self.client.delete_resource(&self.api(&path), false).await? {
                    self.wait_for_operation(link.href.as_str()).await?;
                }
                Ok(ReplyPayload::None)
            }
            RemoteRequest::Move { path, destination } => {
                self.relocate(&path, &destination, false).await
            }
            RemoteRequest::Copy { path, destination } => {
                self.relocate(&path, &destination, true).await
            }
            RemoteRequest::Rename { path, new_name } => {
                let destination = paths::join(&paths::containing_path(&path), &new_name);
                self.relocate(&path, &destination, false).await
            }
            RemoteRequest::Mkdir { path, new_name } => {
                let target = paths::join(&path, &new_name);
                self.client.create_folder(&self.api(&target)).await?;
                Ok(ReplyPayload::Entry(FileMetaData::new(
                    &target,
                    FileType::Directory,
                )))
            }
            RemoteRequest::UploadFile { path, local_file } => {
                let api = self.api(&path);
                let link = self
                    .retrying(|| self.client.get_upload_link(&api, false))
                    .await?;
                self.transfer
                    .upload_from_path(link.href.as_str(), &local_file)
                    .await?;
                Ok(ReplyPayload::None)
            }
            RemoteRequest::UploadBuffer {
                path,
                buffer,
                new_name,
            } => {
                let api = self.api(&paths::join(&path, &new_name));
                let link = self
                    .retrying(|| self.client.get_upload_link(&api, false))
                    .await?;
                self.transfer.upload_bytes(link.href.as_str(), buffer).await?;
                Ok(ReplyPayload::None)
            }
            RemoteRequest::DownloadFile { local_dest, path } => {
                let (href, md5) = self.download_source(&path).await?;
                let written = self
                    .transfer
                    .download_to_path_checked(&href, &local_dest, md5.as_deref())
                    .await?;
                debug!(path = %path, written, "downloaded to file");
                Ok(ReplyPayload::None)
            }
            RemoteRequest::DownloadBuffer { path } => {
                let (href, md5) = self.download_source(&path).await?;
                let buffer = self
                    .transfer
                    .download_bytes_checked(&href, md5.as_deref())
                    .await?;
                Ok(ReplyPayload::Buffer(buffer))
            }
            RemoteRequest::RunJob {
                job_name,
                params,
                working_dir,
            } => {
                let working_dir = if working_dir.is_empty() {
                    String::new()
                } else {
                    self.api(&working_dir)
                };
                let job = self.client.run_job(&job_name, &params, &working_dir).await?;
                Ok(ReplyPayload::Job(job))
            }
        }
    }

    async fn relocate(
        &self,
        path: &str,
        destination: &str,
        copy: bool,
    ) -> Result<ReplyPayload, CallError> {
        let (from, to) = (self.api(path), self.api(destination));
        let link = if copy {
            self.client.copy_resource(&from, &to, false).await?
        } else {
            self.client.move_resource(&from, &to, false).await?
        };
        if let Some(link) = link {
            self.wait_for_operation(link.href.as_str()).await?;
        }
        let file_type = match self.retrying(|| self.client.get_resource(&to)).await {
            Ok(resource) => self.metadata_for(&resource).file_type(),
            Err(err) => {
                debug!(path = destination, error = %err, "could not stat relocated entry");
                FileType::Nil
            }
        };
        Ok(ReplyPayload::Entry(FileMetaData::new(destination, file_type)))
    }

    async fn download_source(&self, path: &str) -> Result<(String, Option<String>), CallError> {
        let api = self.api(path);
        let resource = self.retrying(|| self.client.get_resource(&api)).await?;
        if resource.resource_type != ResourceType::File {
            return Err(CallError::NotAFile(path.to_string()));
        }
        let link = self
            .retrying(|| self.client.get_download_link(&api))
            .await?;
        Ok((link.href.to_string(), resource.md5))
    }

    async fn wait_for_operation(&self, operation_url: &str) -> Result<(), CallError> {
        let mut attempt = 0;
        loop {
            match self
                .retrying(|| self.client.get_operation_status(operation_url))
                .await?
            {
                OperationStatus::Success => return Ok(()),
                OperationStatus::Failure => return Err(CallError::OperationFailed),
                OperationStatus::InProgress => match self.options.poll.next_delay(attempt) {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(CallError::OperationFailed),
                },
            }
            attempt += 1;
        }
    }

    /// Re-runs an idempotent call while it fails transiently.
    async fn retrying<T, F, Fut>(&self, mut call: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() || err.is_connectivity() => {
                    let Some(delay) = self.options.retry.next_delay(attempt) else {
                        return Err(err);
                    };
                    debug!(attempt, error = %err, "retrying after {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn metadata_for(&self, resource: &Resource) -> FileMetaData {
        let file_type = match resource.resource_type {
            ResourceType::Dir => FileType::Directory,
            ResourceType::File => FileType::File,
        };
        FileMetaData::new(&self.cache_path(&resource.path), file_type)
            .with_size(resource.size.unwrap_or(0))
            .with_modified(parse_modified(resource.modified.as_deref()))
    }

    /// Cache path (`/<root>/a/b`) to the store's own path (`/a/b`).
    fn api_path(&self, cache_path: &str) -> Option<String> {
        let segments = paths::segments(cache_path);
        let (first, rest) = segments.split_first()?;
        (*first == self.root).then(|| format!("/{}", rest.join("/")))
    }

    fn api(&self, cache_path: &str) -> String {
        self.api_path(cache_path)
            .unwrap_or_else(|| paths::normalize(cache_path))
    }

    fn cache_path(&self, api_path: &str) -> String {
        let relative = api_path.strip_prefix(API_SCHEME).unwrap_or(api_path);
        paths::join(&format!("/{}", self.root), relative)
    }
}

fn parse_modified(value: Option<&str>) -> Option<i64> {
    let value = value?;
    match OffsetDateTime::parse(value, &Rfc3339) {
        Ok(parsed) => Some(parsed.unix_timestamp()),
        Err(err) => {
            debug!(value, error = %err, "unparseable modification time");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick_options() -> TransportOptions {
        TransportOptions {
            page_size: 100,
            retry: Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 1),
            poll: Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 3),
        }
    }

    fn transport(
        base_url: &str,
    ) -> (HttpTransport, mpsc::UnboundedReceiver<ReplyEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = RemoteClient::with_base_url(base_url, "token").unwrap();
        let transport = HttpTransport::new(
            Handle::current(),
            client,
            TransferClient::default(),
            "disk",
            quick_options(),
            tx,
        );
        (transport, rx)
    }

    #[test]
    fn maps_between_cache_and_api_paths() {
        let shared = Shared {
            client: RemoteClient::new("token").unwrap(),
            transfer: TransferClient::default(),
            root: "disk".into(),
            options: TransportOptions::default(),
        };
        assert_eq!(shared.api_path("/disk").as_deref(), Some("/"));
        assert_eq!(shared.api_path("/disk/Docs/a.txt").as_deref(), Some("/Docs/a.txt"));
        assert_eq!(shared.api_path("/other/a.txt"), None);
        assert_eq!(shared.cache_path("disk:/Docs/a.txt"), "/disk/Docs/a.txt");
        assert_eq!(shared.cache_path("/Docs"), "/disk/Docs");
    }

    #[test]
    fn parses_rfc3339_modification_times() {
        assert_eq!(parse_modified(Some("1970-01-01T00:01:00+00:00")), Some(60));
        assert_eq!(parse_modified(Some("yesterday")), None);
        assert_eq!(parse_modified(None), None);
    }

    #[tokio::test]
    async fn listing_reply_carries_self_entry_and_children() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/disk/resources"))
            .and(query_param("path", "/Docs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_embedded": {
                    "limit": 100,
                    "offset": 0,
                    "total": 2,
                    "items": [
                        { "path": "disk:/Docs/a.txt", "name": "a.txt", "type": "file", "size": 3 },
                        { "path": "disk:/Docs/Sub", "name": "Sub", "type": "dir" }
                    ]
                }
            })))
            .mount(&server)
            .await;

        let (mut transport, mut replies) = transport(&server.uri());
        let id = transport
            .submit(RemoteRequest::List {
                path: "/disk/Docs".into(),
            })
            .unwrap();
        let envelope = replies.recv().await.unwrap();

        assert_eq!(envelope.id, id);
        let ReplyPayload::Listing(entries) = envelope.reply.payload else {
            panic!("expected a listing");
        };
        assert!(entries[0].is_self_entry());
        assert_eq!(entries[0].containing_path(), "/disk/Docs");
        assert_eq!(entries[1], FileMetaData::new("/disk/Docs/a.txt", FileType::File));
        assert_eq!(entries[1].size(), 3);
        assert_eq!(entries[2], FileMetaData::new("/disk/Docs/Sub", FileType::Directory));
    }

    #[tokio::test]
    async fn api_rejection_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/disk/resources"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
            .mount(&server)
            .await;

        let (mut transport, mut replies) = transport(&server.uri());
        transport
            .submit(RemoteRequest::Delete {
                path: "/disk/gone.txt".into(),
            })
            .unwrap();

        let envelope = replies.recv().await.unwrap();
        assert_eq!(envelope.reply, RemoteReply::fail());
    }

    #[tokio::test]
    async fn refused_connection_is_no_connect() {
        let (mut transport, mut replies) = transport("http://127.0.0.1:9");
        transport
            .submit(RemoteRequest::List {
                path: "/disk".into(),
            })
            .unwrap();

        let envelope = replies.recv().await.unwrap();
        assert_eq!(envelope.reply, RemoteReply::no_connect());
    }

    #[tokio::test]
    async fn paths_outside_the_root_are_rejected_up_front() {
        let (mut transport, _replies) = transport("http://127.0.0.1:9");
        let err = transport
            .submit(RemoteRequest::List {
                path: "/elsewhere".into(),
            })
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected { kind: "list", .. }));
    }

    #[tokio::test]
    async fn closed_channel_makes_transport_unavailable() {
        let (mut transport, replies) = transport("http://127.0.0.1:9");
        drop(replies);
        assert!(matches!(
            transport.submit(RemoteRequest::List {
                path: "/disk".into()
            }),
            Err(TransportError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn move_waits_for_accepted_operation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/disk/resources/move"))
            .and(query_param("from", "/a.txt"))
            .and(query_param("path", "/Docs/a.txt"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "href": format!("{}/v1/disk/operations/9", server.uri()),
                "method": "GET",
                "templated": false
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/disk/operations/9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "success" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/disk/resources"))
            .and(query_param("path", "/Docs/a.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "path": "disk:/Docs/a.txt",
                "name": "a.txt",
                "type": "file"
            })))
            .mount(&server)
            .await;

        let (mut transport, mut replies) = transport(&server.uri());
        transport
            .submit(RemoteRequest::Move {
                path: "/disk/a.txt".into(),
                destination: "/disk/Docs/a.txt".into(),
            })
            .unwrap();

        let envelope = replies.recv().await.unwrap();
        assert_eq!(
            envelope.reply,
            RemoteReply::good(ReplyPayload::Entry(FileMetaData::new(
                "/disk/Docs/a.txt",
                FileType::File
            )))
        );
    }
}
