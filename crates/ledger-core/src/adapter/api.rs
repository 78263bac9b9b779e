//! HTTP API adapter
//!
//! Maps each adapter call to exactly one JSON request against a REST-style
//! backend:
//!
//! | Call          | Request                      |
//! |---------------|------------------------------|
//! | `insert`      | `POST /{collection}`         |
//! | `update`      | `PATCH /{collection}/{id}`   |
//! | `replace`     | `PUT /{collection}/{id}`     |
//! | `remove`      | `DELETE /{collection}/{id}`  |
//! | `get`         | `GET /{collection}/{id}`     |
//! | `query`       | `POST /{collection}/query`   |
//! | `bulk_insert` | `POST /{collection}/bulk-insert` |
//! | `bulk_update` | `POST /{collection}/bulk-update` |
//! | `aggregate`   | `POST /{collection}/aggregate`   |
//!
//! Collection names and ids are percent-encoded as single path segments.
//!
//! Non-2xx responses become typed `StoreError`s; transport failures become
//! `StoreError::Network` so the sync queue retries them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{prepare_insert, BulkItemResult, BulkOptions, BulkUpdate, DataAdapter};
use crate::error::{StoreError, StoreResult};
use crate::query::{AggregateOptions, AggregateResult, QueryOptions};
use crate::record::Record;

/// Default request timeout in seconds
const DEFAULT_TIMEOUT: u64 = 15;

#[derive(Serialize)]
struct BulkInsertBody<'a> {
    records: &'a [Record],
    options: BulkOptions,
}

#[derive(Serialize)]
struct BulkUpdateBody<'a> {
    updates: &'a [BulkUpdate],
    options: BulkOptions,
}

/// Network-backed adapter
pub struct ApiAdapter {
    client: Client,
    base_url: Url,
}

impl ApiAdapter {
    /// Create an adapter for `base_url` with the default timeout
    pub fn new(base_url: impl Into<String>) -> StoreResult<Self> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> StoreResult<Self> {
        let raw = base_url.into();
        let base_url = Url::parse(&raw)
            .map_err(|e| StoreError::Network(format!("invalid remote URL '{}': {}", raw, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::Network(format!(
                "invalid remote URL '{}': not a base URL",
                raw
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ledger/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StoreError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    /// Base URL of the backend
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Append `segments` to the base path, each percent-encoded
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in the constructor: a base URL always has path segments
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(&self, request: RequestBuilder) -> StoreResult<Response> {
        request.send().await.map_err(|e| {
            StoreError::Network(if e.is_timeout() {
                format!("request timed out: {}", e)
            } else {
                e.to_string()
            })
        })
    }

    async fn call<B, T>(
        &self,
        method: Method,
        segments: &[&str],
        collection: &str,
        id: Option<&str>,
        body: Option<&B>,
    ) -> StoreResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(segments);
        debug!("{} {}", method, url);

        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = self.send(request).await?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(map_status(collection, id, status, &text));
        }
        Ok(serde_json::from_str(&text)?)
    }
}

/// Translate a non-2xx response into a typed error
fn map_status(collection: &str, id: Option<&str>, status: StatusCode, body: &str) -> StoreError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message").or_else(|| v.get("error")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("no response body").to_string()
            } else {
                body.trim().to_string()
            }
        });

    match status.as_u16() {
        404 => StoreError::not_found(collection, id.unwrap_or_default()),
        400 | 422 => {
            let errors = parsed
                .as_ref()
                .and_then(|v| v.get("errors"))
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|e| e.as_str().map(str::to_string))
                        .collect::<Vec<_>>()
                })
                .filter(|errors| !errors.is_empty())
                .unwrap_or_else(|| vec![message]);
            StoreError::validation(collection, errors)
        }
        409 => StoreError::Conflict {
            collection: collection.to_string(),
            id: id.unwrap_or_default().to_string(),
            details: message,
        },
        413 | 507 => StoreError::StorageFull {
            key: format!("{}/{}", collection, id.unwrap_or_default()),
            details: message,
        },
        408 | 429 | 500..=599 => {
            StoreError::Network(format!("remote returned {}: {}", status.as_u16(), message))
        }
        code => StoreError::Remote {
            status: code,
            message,
        },
    }
}

#[async_trait]
impl DataAdapter for ApiAdapter {
    fn name(&self) -> &str {
        "api"
    }

    async fn insert(&self, collection: &str, record: Record) -> StoreResult<Record> {
        let record = prepare_insert(record);
        let id = record.id().map(str::to_string);
        self.call(Method::POST, &[collection], collection, id.as_deref(), Some(&record))
            .await
    }

    async fn update(&self, collection: &str, id: &str, changes: Record) -> StoreResult<Record> {
        self.call(Method::PATCH, &[collection, id], collection, Some(id), Some(&changes))
            .await
    }

    async fn replace(&self, collection: &str, id: &str, record: Record) -> StoreResult<Record> {
        self.call(Method::PUT, &[collection, id], collection, Some(id), Some(&record))
            .await
    }

    async fn remove(&self, collection: &str, id: &str) -> StoreResult<()> {
        let result: StoreResult<Value> = self
            .call::<(), _>(Method::DELETE, &[collection, id], collection, Some(id), None)
            .await;
        match result {
            Ok(_) | Err(StoreError::NotFound { .. }) => Ok(()),
            // Empty 2xx bodies are not JSON
            Err(StoreError::Serialization(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>> {
        match self
            .call::<(), Record>(Method::GET, &[collection, id], collection, Some(id), None)
            .await
        {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn query(&self, collection: &str, options: &QueryOptions) -> StoreResult<Vec<Record>> {
        self.call(Method::POST, &[collection, "query"], collection, None, Some(options))
            .await
    }

    async fn bulk_insert(
        &self,
        collection: &str,
        records: Vec<Record>,
        options: BulkOptions,
    ) -> StoreResult<Vec<BulkItemResult>> {
        let records: Vec<Record> = records.into_iter().map(prepare_insert).collect();
        let body = BulkInsertBody {
            records: &records,
            options,
        };
        self.call(Method::POST, &[collection, "bulk-insert"], collection, None, Some(&body))
            .await
    }

    async fn bulk_update(
        &self,
        collection: &str,
        updates: Vec<BulkUpdate>,
        options: BulkOptions,
    ) -> StoreResult<Vec<BulkItemResult>> {
        let body = BulkUpdateBody {
            updates: &updates,
            options,
        };
        self.call(Method::POST, &[collection, "bulk-update"], collection, None, Some(&body))
            .await
    }

    async fn aggregate(
        &self,
        collection: &str,
        options: &AggregateOptions,
    ) -> StoreResult<AggregateResult> {
        self.call(Method::POST, &[collection, "aggregate"], collection, None, Some(options))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Filter;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    async fn respond(verb: &str, route: &str, status: u16, body: Value) -> (MockServer, ApiAdapter) {
        let server = MockServer::start().await;
        Mock::given(method(verb))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&server)
            .await;
        let adapter = ApiAdapter::new(server.uri()).unwrap();
        (server, adapter)
    }

    #[tokio::test]
    async fn test_insert_posts_record_with_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/entity"))
            .and(body_partial_json(json!({"id": "e1", "name": "Acme"})))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"id": "e1", "name": "Acme"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let adapter = ApiAdapter::new(format!("{}/", server.uri())).unwrap();
        let inserted = adapter
            .insert("entity", record(json!({"id": "e1", "name": "Acme"})))
            .await
            .unwrap();
        assert_eq!(inserted.id(), Some("e1"));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (_server, adapter) = respond("GET", "/entity/nope", 404, json!({})).await;
        assert!(adapter.get("entity", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let (_server, adapter) = respond("DELETE", "/entity/nope", 404, json!({})).await;
        adapter.remove("entity", "nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_with_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/entity/e1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        let adapter = ApiAdapter::new(server.uri()).unwrap();
        adapter.remove("entity", "e1").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let (_server, adapter) = respond("PATCH", "/job/j1", 404, json!({})).await;
        let err = adapter.update("job", "j1", Record::new()).await.unwrap_err();
        match err {
            StoreError::NotFound { collection, id } => {
                assert_eq!(collection, "job");
                assert_eq!(id, "j1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_validation_errors_are_listed() {
        let (_server, adapter) = respond(
            "PATCH",
            "/job/j1",
            422,
            json!({"errors": ["name is required", "status must be one of: bid"]}),
        )
        .await;
        let err = adapter.update("job", "j1", Record::new()).await.unwrap_err();
        match err {
            StoreError::Validation { errors, .. } => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_status_mapping() {
        for status in [400u16, 409, 413, 507, 408, 429, 503, 418] {
            let (_server, adapter) =
                respond("PATCH", "/job/j1", status, json!({"message": "nope"})).await;
            let err = adapter.update("job", "j1", Record::new()).await.unwrap_err();

            let mapped = match status {
                400 => matches!(err, StoreError::Validation { .. }),
                409 => matches!(err, StoreError::Conflict { .. }),
                413 | 507 => matches!(err, StoreError::StorageFull { .. }),
                408 | 429 | 503 => matches!(err, StoreError::Network(_)),
                _ => matches!(err, StoreError::Remote { status: 418, .. }),
            };
            assert!(mapped, "status {status} mapped to {err:?}");
        }
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_network_error() {
        // Reserve a free port, then release it so nothing listens there
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let adapter =
            ApiAdapter::with_timeout(format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        let err = adapter.get("job", "j1").await.unwrap_err();
        assert!(matches!(err, StoreError::Network(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_ids_are_encoded_as_one_segment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/entity/a%2Fb%3F%23%20c"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "a/b?# c"})))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = ApiAdapter::new(format!("{}/api/", server.uri())).unwrap();
        let fetched = adapter.get("entity", "a/b?# c").await.unwrap().unwrap();
        assert_eq!(fetched.id(), Some("a/b?# c"));
    }

    #[tokio::test]
    async fn test_replace_puts_whole_record() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/job/j1"))
            .and(body_partial_json(json!({"id": "j1", "name": "Roof v2"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "j1", "name": "Roof v2"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let adapter = ApiAdapter::new(server.uri()).unwrap();
        let replaced = adapter
            .replace("job", "j1", record(json!({"id": "j1", "name": "Roof v2"})))
            .await
            .unwrap();
        assert_eq!(replaced.get("name"), Some(&json!("Roof v2")));
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        assert!(ApiAdapter::new("not a url").is_err());
        assert!(ApiAdapter::new("mailto:ops@example.com").is_err());
    }

    #[tokio::test]
    async fn test_query_sends_options() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/job/query"))
            .and(body_partial_json(json!({
                "filters": [{"field": "status", "op": "=", "value": "active"}],
                "limit": 5
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "j1"}])))
            .mount(&server)
            .await;

        let adapter = ApiAdapter::new(server.uri()).unwrap();
        let options = QueryOptions::new()
            .filter(Filter::eq("status", "active"))
            .limit(5);
        let results = adapter.query("job", &options).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_insert_returns_item_results() {
        let (_server, adapter) = respond(
            "POST",
            "/job/bulk-insert",
            200,
            json!([
                {"index": 0, "id": "j1", "record": {"id": "j1"}},
                {"index": 1, "id": "j2", "error": "duplicate"}
            ]),
        )
        .await;

        let results = adapter
            .bulk_insert(
                "job",
                vec![record(json!({"id": "j1"})), record(json!({"id": "j2"}))],
                BulkOptions::best_effort(),
            )
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert_eq!(results[1].error.as_deref(), Some("duplicate"));
    }
}
