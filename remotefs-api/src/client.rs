use std::collections::BTreeMap;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://cloud-api.yandex.net";
const RESOURCES: &str = "/v1/disk/resources";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("api response missing embedded items")]
    MissingEmbedded,
}

impl RemoteError {
    /// Rate limiting, server errors, request timeouts and conflicts may clear up on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Api { status, .. } => {
                status.is_server_error()
                    || matches!(
                        *status,
                        StatusCode::TOO_MANY_REQUESTS
                            | StatusCode::REQUEST_TIMEOUT
                            | StatusCode::CONFLICT
                            | StatusCode::TOO_EARLY
                    )
            }
            _ => false,
        }
    }

    /// True when the failure says nothing about the remote side (no connection, timeout).
    pub fn is_connectivity(&self) -> bool {
        match self {
            RemoteError::Request(err) => err.is_connect() || err.is_timeout(),
            _ => false,
        }
    }

    async fn from_response(response: Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        RemoteError::Api { status, body }
    }
}

#[derive(Debug, Deserialize)]
pub struct DiskInfo {
    pub total_space: u64,
    pub used_space: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Resource {
    pub path: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    File,
    Dir,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    Success,
    Failure,
    InProgress,
}

/// One page of a folder listing.
#[derive(Debug, Deserialize)]
pub struct ListingPage {
    pub items: Vec<Resource>,
    pub total: u32,
}

/// Pre-signed transfer target or long-running operation handle.
#[derive(Debug, Deserialize)]
pub struct TransferLink {
    pub href: Url,
}

#[derive(Deserialize)]
struct Embedded {
    #[serde(rename = "_embedded")]
    page: Option<ListingPage>,
}

#[derive(Deserialize)]
struct OperationInfo {
    status: OperationStatus,
}

#[derive(Serialize)]
struct JobRequest<'a> {
    name: &'a str,
    parameters: &'a BTreeMap<String, String>,
    working_dir: &'a str,
}

#[derive(Clone)]
pub struct RemoteClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl RemoteClient {
    pub fn new(token: impl Into<String>) -> Result<Self, RemoteError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, RemoteError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn get_disk_info(&self) -> Result<DiskInfo, RemoteError> {
        json(self.call(Method::GET, "/v1/disk", &[])?.send().await?).await
    }

    pub async fn get_resource(&self, path: &str) -> Result<Resource, RemoteError> {
        json(self.call(Method::GET, RESOURCES, &[("path", path)])?.send().await?).await
    }

    pub async fn create_folder(&self, path: &str) -> Result<(), RemoteError> {
        let response = self
            .call(Method::PUT, RESOURCES, &[("path", path)])?
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RemoteError::from_response(response).await);
        }
        Ok(())
    }

    /// Returns `Some(link)` when the store accepted the move as a long-running operation.
    pub async fn move_resource(
        &self,
        from: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<Option<TransferLink>, RemoteError> {
        self.relocate("/v1/disk/resources/move", from, path, overwrite)
            .await
    }

    pub async fn copy_resource(
        &self,
        from: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<Option<TransferLink>, RemoteError> {
        self.relocate("/v1/disk/resources/copy", from, path, overwrite)
            .await
    }

    pub async fn delete_resource(
        &self,
        path: &str,
        permanently: bool,
    ) -> Result<Option<TransferLink>, RemoteError> {
        let mut query = vec![("path", path)];
        if permanently {
            query.push(("permanently", "true"));
        }
        let response = self.call(Method::DELETE, RESOURCES, &query)?.send().await?;
        operation_link(response).await
    }

    pub async fn get_operation_status(
        &self,
        operation_url: &str,
    ) -> Result<OperationStatus, RemoteError> {
        let request = self.authorized(Method::GET, Url::parse(operation_url)?);
        let info: OperationInfo = json(request.send().await?).await?;
        Ok(info.status)
    }

    pub async fn list_directory(
        &self,
        path: &str,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<ListingPage, RemoteError> {
        let limit = limit.map(|value| value.to_string());
        let offset = offset.map(|value| value.to_string());
        let mut query = vec![("path", path)];
        query.extend(limit.as_deref().map(|value| ("limit", value)));
        query.extend(offset.as_deref().map(|value| ("offset", value)));
        let payload: Embedded = json(self.call(Method::GET, RESOURCES, &query)?.send().await?).await?;
        payload.page.ok_or(RemoteError::MissingEmbedded)
    }

    /// Walks every page of a listing.
    pub async fn list_directory_all(
        &self,
        path: &str,
        page_size: u32,
    ) -> Result<Vec<Resource>, RemoteError> {
        let page_size = page_size.max(1);
        let mut items = Vec::new();
        loop {
            let offset = u32::try_from(items.len()).unwrap_or(u32::MAX);
            let page = self
                .list_directory(path, Some(page_size), Some(offset))
                .await?;
            let received = page.items.len();
            items.extend(page.items);
            if received == 0 || items.len() >= page.total as usize {
                return Ok(items);
            }
        }
    }

    pub async fn get_download_link(&self, path: &str) -> Result<TransferLink, RemoteError> {
        let request = self.call(Method::GET, "/v1/disk/resources/download", &[("path", path)])?;
        json(request.send().await?).await
    }

    pub async fn get_upload_link(
        &self,
        path: &str,
        overwrite: bool,
    ) -> Result<TransferLink, RemoteError> {
        let request = self.call(
            Method::GET,
            "/v1/disk/resources/upload",
            &[("path", path), ("overwrite", flag(overwrite))],
        )?;
        json(request.send().await?).await
    }

    /// Submits a named server-side job (compress, extract, ...) and returns its raw descriptor.
    pub async fn run_job(
        &self,
        name: &str,
        parameters: &BTreeMap<String, String>,
        working_dir: &str,
    ) -> Result<serde_json::Value, RemoteError> {
        let request = self.call(Method::POST, "/v1/disk/jobs", &[])?.json(&JobRequest {
            name,
            parameters,
            working_dir,
        });
        json(request.send().await?).await
    }

    async fn relocate(
        &self,
        endpoint: &str,
        from: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<Option<TransferLink>, RemoteError> {
        let query = [("from", from), ("path", path), ("overwrite", flag(overwrite))];
        let response = self.call(Method::POST, endpoint, &query)?.send().await?;
        operation_link(response).await
    }

    fn call(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<RequestBuilder, RemoteError> {
        let mut url = self.base_url.join(endpoint)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(self.authorized(method, url))
    }

    fn authorized(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("OAuth {}", self.token))
    }
}

fn flag(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

async fn json<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    if !response.status().is_success() {
        return Err(RemoteError::from_response(response).await);
    }
    Ok(response.json::<T>().await?)
}

/// 202 carries a link to poll; any other success means the change is already done.
async fn operation_link(response: Response) -> Result<Option<TransferLink>, RemoteError> {
    match response.status() {
        StatusCode::ACCEPTED => Ok(Some(response.json().await?)),
        status if status.is_success() => Ok(None),
        _ => Err(RemoteError::from_response(response).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(status: StatusCode) -> RemoteError {
        RemoteError::Api {
            status,
            body: String::new(),
        }
    }

    #[test]
    fn transient_statuses_are_retryable() {
        assert!(api_error(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(api_error(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(api_error(StatusCode::CONFLICT).is_retryable());
        assert!(!api_error(StatusCode::UNAUTHORIZED).is_retryable());
    }

    #[test]
    fn not_found_is_not_retryable() {
        let err = api_error(StatusCode::NOT_FOUND);
        assert!(!err.is_retryable());
        assert!(!err.is_connectivity());
        assert!(!RemoteError::MissingEmbedded.is_retryable());
    }

    #[test]
    fn flags_render_as_query_values() {
        assert_eq!(flag(true), "true");
        assert_eq!(flag(false), "false");
    }
}
