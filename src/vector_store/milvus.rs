//! Milvus backend over the RESTful v2 API (`/v2/vectordb/...`).
//!
//! Every call is a JSON `POST`. Milvus answers HTTP 200 with a `code` field;
//! anything other than `0` is reported as [`StoreError::Backend`] carrying the
//! server's message. Transport failures (refused, DNS, timeout) become
//! [`StoreError::Connection`].
//!
//! Milvus validates vector dimensions itself, but its messages are free text.
//! The client remembers each collection's dimension (from `create`, or from
//! `describe` on `load`) and rejects mismatched vectors locally with
//! [`StoreError::DimensionMismatch`].

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{IndexParams, NewRecord, SearchHit, VectorStore};
use crate::error::StoreError;

const VECTOR_FIELD: &str = "embedding";

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HasData {
    has: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertData {
    #[serde(default)]
    insert_ids: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStateData {
    load_state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsData {
    row_count: Value,
}

/// Vector store client for a Milvus server.
pub struct MilvusStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    dimensions: RwLock<HashMap<String, usize>>,
}

impl MilvusStore {
    /// Client for `http://host:port`. `timeout` bounds each request.
    pub fn new(
        host: &str,
        port: u16,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Connection {
                endpoint: format!("{host}:{port}"),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: format!("http://{host}:{port}"),
            token,
            dimensions: RwLock::new(HashMap::new()),
        })
    }

    async fn call(&self, path: &str, body: Value) -> Result<Value, StoreError> {
        let url = format!("{}/v2/vectordb/{path}", self.base_url);
        debug!(%url, "Milvus request");

        let mut request = self.client.post(&url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Backend {
                message: format!("{path}: HTTP {}: {body}", status.as_u16()),
            });
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| StoreError::Codec(format!("{path}: {e}")))?;
        if envelope.code != 0 {
            return Err(StoreError::Backend {
                message: format!(
                    "{path}: code {}: {}",
                    envelope.code,
                    envelope.message.unwrap_or_default()
                ),
            });
        }
        Ok(envelope.data)
    }

    async fn call_as<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, StoreError> {
        let data = self.call(path, body).await?;
        serde_json::from_value(data).map_err(|e| StoreError::Codec(format!("{path}: {e}")))
    }

    fn transport_error(&self, err: reqwest::Error) -> StoreError {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            StoreError::Connection {
                endpoint: self.base_url.clone(),
                message: err.to_string(),
            }
        } else {
            StoreError::Backend {
                message: err.to_string(),
            }
        }
    }

    fn known_dimension(&self, name: &str) -> Option<usize> {
        self.dimensions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .copied()
    }

    fn remember_dimension(&self, name: &str, dimension: Option<usize>) {
        let mut dimensions = self
            .dimensions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match dimension {
            Some(dim) => {
                dimensions.insert(name.to_string(), dim);
            }
            None => {
                dimensions.remove(name);
            }
        }
    }

    fn check_dimension(&self, name: &str, actual: usize) -> Result<(), StoreError> {
        match self.known_dimension(name) {
            Some(expected) if expected != actual => {
                Err(StoreError::DimensionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }

    async fn describe_dimension(&self, name: &str) -> Result<Option<usize>, StoreError> {
        let data = self
            .call("collections/describe", json!({ "collectionName": name }))
            .await?;
        Ok(vector_dimension(&data))
    }
}

/// Pull the vector field's `dim` out of a `collections/describe` payload.
fn vector_dimension(data: &Value) -> Option<usize> {
    let field = data["fields"]
        .as_array()?
        .iter()
        .find(|f| f["name"] == VECTOR_FIELD)?;
    field["params"]
        .as_array()?
        .iter()
        .find(|p| p["key"] == "dim")
        .and_then(|p| value_as_i64(&p["value"]))
        .and_then(|d| usize::try_from(d).ok())
}

/// Milvus returns int64 values either as JSON numbers or as strings.
fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn collection_schema(dimension: usize) -> Value {
    json!({
        "autoId": true,
        "enableDynamicField": false,
        "fields": [
            { "fieldName": "id", "dataType": "Int64", "isPrimary": true },
            {
                "fieldName": "source",
                "dataType": "VarChar",
                "elementTypeParams": { "max_length": super::MAX_SOURCE_LEN }
            },
            {
                "fieldName": "chunk",
                "dataType": "VarChar",
                "elementTypeParams": { "max_length": super::MAX_CHUNK_LEN }
            },
            {
                "fieldName": VECTOR_FIELD,
                "dataType": "FloatVector",
                "elementTypeParams": { "dim": dimension.to_string() }
            }
        ]
    })
}

#[async_trait]
impl VectorStore for MilvusStore {
    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    async fn connect(&self) -> Result<(), StoreError> {
        match self.call("collections/list", json!({})).await {
            Ok(_) => {
                info!(endpoint = %self.base_url, "Connected to Milvus");
                Ok(())
            }
            Err(StoreError::Backend { message }) | Err(StoreError::Codec(message)) => {
                Err(StoreError::Connection {
                    endpoint: self.base_url.clone(),
                    message,
                })
            }
            Err(other) => Err(other),
        }
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        self.dimensions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        Ok(())
    }

    async fn has_collection(&self, name: &str) -> Result<bool, StoreError> {
        let data: HasData = self
            .call_as("collections/has", json!({ "collectionName": name }))
            .await?;
        Ok(data.has)
    }

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        self.call("collections/drop", json!({ "collectionName": name }))
            .await?;
        self.remember_dimension(name, None);
        Ok(())
    }

    async fn create_collection(&self, name: &str, dimension: usize) -> Result<(), StoreError> {
        self.call(
            "collections/create",
            json!({
                "collectionName": name,
                "description": name,
                "schema": collection_schema(dimension),
            }),
        )
        .await?;
        self.remember_dimension(name, Some(dimension));
        Ok(())
    }

    async fn insert(&self, name: &str, records: &[NewRecord]) -> Result<Vec<i64>, StoreError> {
        for record in records {
            self.check_dimension(name, record.embedding.len())?;
        }
        let rows: Vec<Value> = records
            .iter()
            .map(|r| {
                json!({
                    "source": r.source,
                    "chunk": r.chunk,
                    VECTOR_FIELD: r.embedding,
                })
            })
            .collect();

        let data: InsertData = self
            .call_as(
                "entities/insert",
                json!({ "collectionName": name, "data": rows }),
            )
            .await?;
        data.insert_ids
            .iter()
            .map(|id| {
                value_as_i64(id).ok_or_else(|| StoreError::Codec(format!("non-integer id {id}")))
            })
            .collect()
    }

    async fn create_index(&self, name: &str, params: &IndexParams) -> Result<(), StoreError> {
        self.call(
            "indexes/create",
            json!({
                "collectionName": name,
                "indexParams": [{
                    "fieldName": VECTOR_FIELD,
                    "indexName": VECTOR_FIELD,
                    "metricType": params.metric.as_str(),
                    "indexType": params.index_type,
                    "params": { "nlist": params.nlist },
                }],
            }),
        )
        .await?;
        Ok(())
    }

    async fn load_collection(&self, name: &str) -> Result<(), StoreError> {
        self.call("collections/load", json!({ "collectionName": name }))
            .await?;
        if self.known_dimension(name).is_none() {
            let dimension = self.describe_dimension(name).await?;
            self.remember_dimension(name, dimension);
        }
        Ok(())
    }

    async fn release_collection(&self, name: &str) -> Result<(), StoreError> {
        self.call("collections/release", json!({ "collectionName": name }))
            .await?;
        Ok(())
    }

    /// A collection still loading counts as loaded: someone else owns it.
    async fn is_loaded(&self, name: &str) -> Result<bool, StoreError> {
        let data: LoadStateData = self
            .call_as("collections/get_load_state", json!({ "collectionName": name }))
            .await?;
        Ok(matches!(
            data.load_state.as_str(),
            "LoadStateLoaded" | "LoadStateLoading"
        ))
    }

    async fn count(&self, name: &str) -> Result<usize, StoreError> {
        let data: StatsData = self
            .call_as("collections/get_stats", json!({ "collectionName": name }))
            .await?;
        value_as_i64(&data.row_count)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| StoreError::Codec(format!("invalid rowCount {}", data.row_count)))
    }

    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        k: usize,
        nprobe: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        self.check_dimension(name, vector.len())?;
        let data = self
            .call(
                "entities/search",
                json!({
                    "collectionName": name,
                    "data": [vector],
                    "annsField": VECTOR_FIELD,
                    "limit": k,
                    "outputFields": ["source", "chunk"],
                    "searchParams": {
                        "metricType": "IP",
                        "params": { "nprobe": nprobe },
                    },
                }),
            )
            .await?;

        let rows = data.as_array().cloned().unwrap_or_default();
        rows.iter()
            .map(|row| {
                Ok(SearchHit {
                    id: value_as_i64(&row["id"]).unwrap_or_default(),
                    source: row["source"].as_str().unwrap_or_default().to_string(),
                    chunk: row["chunk"]
                        .as_str()
                        .ok_or_else(|| StoreError::Codec(format!("hit without chunk: {row}")))?
                        .to_string(),
                    score: row["distance"].as_f64().unwrap_or_default() as f32,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn store_for(server: &MockServer) -> MilvusStore {
        MilvusStore::new(&server.host(), server.port(), None, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_has_collection() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/vectordb/collections/has");
                then.status(200)
                    .json_body(json!({ "code": 0, "data": { "has": true } }));
            })
            .await;

        let store = store_for(&server);
        assert!(store.has_collection("ravecraft").await.unwrap());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_code_maps_to_backend_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/vectordb/collections/load");
                then.status(200).json_body(
                    json!({ "code": 100, "message": "collection not found[collection=x]" }),
                );
            })
            .await;

        let store = store_for(&server);
        let err = store.load_collection("x").await.unwrap_err();
        match err {
            StoreError::Backend { message } => assert!(message.contains("collection not found")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        // Port 9 (discard) is not served in test environments.
        let store = MilvusStore::new("127.0.0.1", 9, None, Duration::from_secs(2)).unwrap();
        let err = store.connect().await.unwrap_err();
        assert!(matches!(err, StoreError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_insert_returns_ids_in_order() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/vectordb/collections/create");
                then.status(200).json_body(json!({ "code": 0, "data": {} }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/vectordb/entities/insert");
                then.status(200).json_body(json!({
                    "code": 0,
                    "data": { "insertCount": 2, "insertIds": [451, "452"] }
                }));
            })
            .await;

        let store = store_for(&server);
        store.create_collection("c", 2).await.unwrap();
        let records = vec![
            NewRecord {
                source: "a.txt".into(),
                chunk: "Price: $10".into(),
                embedding: vec![1.0, 0.0],
            },
            NewRecord {
                source: "b.txt".into(),
                chunk: "Ships in 2 days".into(),
                embedding: vec![0.0, 1.0],
            },
        ];
        assert_eq!(store.insert("c", &records).await.unwrap(), vec![451, 452]);

        let wrong = vec![NewRecord {
            source: "c.txt".into(),
            chunk: "oops".into(),
            embedding: vec![1.0, 0.0, 0.0],
        }];
        assert!(matches!(
            store.insert("c", &wrong).await,
            Err(StoreError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_search_parses_hits() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/vectordb/entities/search");
                then.status(200).json_body(json!({
                    "code": 0,
                    "data": [
                        { "id": 7, "distance": 0.91, "chunk": "Price: $10", "source": "a.txt" },
                        { "id": 9, "distance": 0.42, "chunk": "Ships in 2 days", "source": "b.txt" }
                    ]
                }));
            })
            .await;

        let store = store_for(&server);
        let hits = store.search("c", &[0.6, 0.8], 2, 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, 7);
        assert_eq!(hits[0].chunk, "Price: $10");
        assert!((hits[0].score - 0.91).abs() < 1e-6);
        assert_eq!(hits[1].source, "b.txt");
    }

    #[tokio::test]
    async fn test_load_learns_dimension_from_describe() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/vectordb/collections/load");
                then.status(200).json_body(json!({ "code": 0, "data": {} }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/vectordb/collections/describe");
                then.status(200).json_body(json!({
                    "code": 0,
                    "data": {
                        "collectionName": "c",
                        "fields": [
                            { "name": "id", "type": "Int64", "primaryKey": true },
                            { "name": "embedding", "type": "FloatVector",
                              "params": [{ "key": "dim", "value": "384" }] }
                        ]
                    }
                }));
            })
            .await;

        let store = store_for(&server);
        store.load_collection("c").await.unwrap();
        assert_eq!(store.known_dimension("c"), Some(384));
        assert!(matches!(
            store.search("c", &[1.0; 3], 1, 1).await,
            Err(StoreError::DimensionMismatch {
                expected: 384,
                actual: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_count_reads_row_count() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/vectordb/collections/get_stats");
                then.status(200)
                    .json_body(json!({ "code": 0, "data": { "rowCount": 6 } }));
            })
            .await;

        let store = store_for(&server);
        assert_eq!(store.count("c").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_load_state() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v2/vectordb/collections/get_load_state")
                    .json_body_includes(r#"{ "collectionName": "served" }"#);
                then.status(200)
                    .json_body(json!({ "code": 0, "data": { "loadState": "LoadStateLoaded" } }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v2/vectordb/collections/get_load_state")
                    .json_body_includes(r#"{ "collectionName": "idle" }"#);
                then.status(200)
                    .json_body(json!({ "code": 0, "data": { "loadState": "LoadStateNotLoad" } }));
            })
            .await;

        let store = store_for(&server);
        assert!(store.is_loaded("served").await.unwrap());
        assert!(!store.is_loaded("idle").await.unwrap());
    }

    #[test]
    fn test_schema_carries_limits_and_dimension() {
        let schema = collection_schema(384);
        let fields = schema["fields"].as_array().unwrap();
        assert_eq!(fields[1]["elementTypeParams"]["max_length"], 512);
        assert_eq!(fields[2]["elementTypeParams"]["max_length"], 4096);
        assert_eq!(fields[3]["elementTypeParams"]["dim"], "384");
    }
}
