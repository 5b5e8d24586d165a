use std::collections::BTreeMap;

use remotefs_api::{OperationStatus, RemoteClient, RemoteError, ResourceType};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn get_disk_info_includes_oauth_header() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/disk"))
        .and(header("authorization", "OAuth test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total_space": 1024,
            "used_space": 256,
            "trash_size": 0
        })))
        .mount(&server)
        .await;

    let client = RemoteClient::with_base_url(&server.uri(), "test-token").unwrap();
    let info = client.get_disk_info().await.unwrap();

    assert_eq!(info.total_space, 1024);
    assert_eq!(info.used_space, 256);
}

#[tokio::test]
async fn get_resource_encodes_path() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/disk/resources"))
        .and(query_param("path", "/Docs/Hello World.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "path": "/Docs/Hello World.txt",
            "name": "Hello World.txt",
            "type": "file",
            "size": 12,
            "md5": "abc"
        })))
        .mount(&server)
        .await;

    let client = RemoteClient::with_base_url(&server.uri(), "test-token").unwrap();
    let resource = client.get_resource("/Docs/Hello World.txt").await.unwrap();

    assert_eq!(resource.resource_type, ResourceType::File);
    assert_eq!(resource.size, Some(12));
    assert_eq!(resource.md5.as_deref(), Some("abc"));
}

#[tokio::test]
async fn list_directory_all_follows_pages() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/disk/resources"))
        .and(query_param("path", "/Docs"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_embedded": {
                "limit": 1,
                "offset": 0,
                "total": 2,
                "items": [
                    { "path": "/Docs/A.txt", "name": "A.txt", "type": "file", "size": 1 }
                ]
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/disk/resources"))
        .and(query_param("path", "/Docs"))
        .and(query_param("offset", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_embedded": {
                "limit": 1,
                "offset": 1,
                "total": 2,
                "items": [
                    { "path": "/Docs/B", "name": "B", "type": "dir" }
                ]
            }
        })))
        .mount(&server)
        .await;

    let client = RemoteClient::with_base_url(&server.uri(), "test-token").unwrap();
    let items = client.list_directory_all("/Docs", 1).await.unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].path, "/Docs/A.txt");
    assert_eq!(items[0].size, Some(1));
    assert_eq!(items[1].resource_type, ResourceType::Dir);
}

#[tokio::test]
async fn list_directory_on_file_reports_missing_embedded() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/disk/resources"))
        .and(query_param("path", "/Docs/A.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "path": "/Docs/A.txt",
            "name": "A.txt",
            "type": "file"
        })))
        .mount(&server)
        .await;

    let client = RemoteClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client
        .list_directory("/Docs/A.txt", None, None)
        .await
        .unwrap_err();

    assert!(matches!(err, RemoteError::MissingEmbedded));
}

#[tokio::test]
async fn create_folder_uses_put() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/disk/resources"))
        .and(query_param("path", "/Docs/NewFolder"))
        .and(header("authorization", "OAuth test-token"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "href": "https://cloud-api.yandex.net/v1/disk/resources?path=%2FDocs%2FNewFolder",
            "method": "GET",
            "templated": false
        })))
        .mount(&server)
        .await;

    let client = RemoteClient::with_base_url(&server.uri(), "test-token").unwrap();
    client.create_folder("/Docs/NewFolder").await.unwrap();
}

#[tokio::test]
async fn create_folder_reports_conflict() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/disk/resources"))
        .respond_with(ResponseTemplate::new(409).set_body_string("exists"))
        .mount(&server)
        .await;

    let client = RemoteClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.create_folder("/Docs/NewFolder").await.unwrap_err();

    assert!(matches!(err, RemoteError::Api { status, .. } if status.as_u16() == 409));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn move_resource_returns_operation_link_when_accepted() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/disk/resources/move"))
        .and(query_param("from", "/Docs/A.txt"))
        .and(query_param("path", "/Docs/B.txt"))
        .and(query_param("overwrite", "false"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "href": "https://cloud-api.yandex.net/v1/disk/operations/1",
            "method": "GET",
            "templated": false
        })))
        .mount(&server)
        .await;

    let client = RemoteClient::with_base_url(&server.uri(), "test-token").unwrap();
    let link = client
        .move_resource("/Docs/A.txt", "/Docs/B.txt", false)
        .await
        .unwrap()
        .expect("expected operation link");

    assert_eq!(
        link.href.as_str(),
        "https://cloud-api.yandex.net/v1/disk/operations/1"
    );
}

#[tokio::test]
async fn copy_resource_completed_returns_none() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/disk/resources/copy"))
        .and(query_param("from", "/Docs/A.txt"))
        .and(query_param("path", "/Docs/C.txt"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "href": "https://cloud-api.yandex.net/v1/disk/resources?path=%2FDocs%2FC.txt",
            "method": "GET",
            "templated": false
        })))
        .mount(&server)
        .await;

    let client = RemoteClient::with_base_url(&server.uri(), "test-token").unwrap();
    let response = client
        .copy_resource("/Docs/A.txt", "/Docs/C.txt", false)
        .await
        .unwrap();

    assert!(response.is_none());
}

#[tokio::test]
async fn move_conflict_surfaces_api_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/disk/resources/move"))
        .respond_with(ResponseTemplate::new(409).set_body_string("exists"))
        .mount(&server)
        .await;

    let client = RemoteClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client
        .move_resource("/Docs/A.txt", "/Docs/B.txt", false)
        .await
        .unwrap_err();

    assert!(matches!(err, RemoteError::Api { status, .. } if status.as_u16() == 409));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn delete_resource_returns_none_on_no_content() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/disk/resources"))
        .and(query_param("path", "/Docs/Delete.txt"))
        .and(header("authorization", "OAuth test-token"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = RemoteClient::with_base_url(&server.uri(), "test-token").unwrap();
    let response = client
        .delete_resource("/Docs/Delete.txt", false)
        .await
        .unwrap();

    assert!(response.is_none());
}

#[tokio::test]
async fn get_operation_status_parses_response() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/disk/operations/123"))
        .and(header("authorization", "OAuth test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "in-progress"
        })))
        .mount(&server)
        .await;

    let client = RemoteClient::with_base_url(&server.uri(), "test-token").unwrap();
    let status = client
        .get_operation_status(&format!("{}/v1/disk/operations/123", server.uri()))
        .await
        .unwrap();

    assert_eq!(status, OperationStatus::InProgress);
}

#[tokio::test]
async fn get_upload_link_sends_overwrite_flag() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/disk/resources/upload"))
        .and(query_param("path", "/Docs/Hello.txt"))
        .and(query_param("overwrite", "false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "href": "https://upload.example/hello.txt",
            "method": "PUT",
            "templated": false
        })))
        .mount(&server)
        .await;

    let client = RemoteClient::with_base_url(&server.uri(), "test-token").unwrap();
    let link = client
        .get_upload_link("/Docs/Hello.txt", false)
        .await
        .unwrap();

    assert_eq!(link.href.as_str(), "https://upload.example/hello.txt");
}

#[tokio::test]
async fn run_job_posts_parameters() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/disk/jobs"))
        .and(body_json(json!({
            "name": "compress",
            "parameters": { "compression_type": "tgz" },
            "working_dir": "/Docs"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "job-1",
            "status": "PENDING"
        })))
        .mount(&server)
        .await;

    let client = RemoteClient::with_base_url(&server.uri(), "test-token").unwrap();
    let mut parameters = BTreeMap::new();
    parameters.insert("compression_type".to_string(), "tgz".to_string());
    let job = client
        .run_job("compress", &parameters, "/Docs")
        .await
        .unwrap();

    assert_eq!(job["id"], "job-1");
}
