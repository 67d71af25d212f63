//! 📡 The Elasticsearch store: `_bulk` in, `_doc` and `_search` out.
//!
//! Auth priority: API key wins over basic auth. This is not a democracy.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use super::{Store, StoreError};
use crate::common::{DATA_FILE_TYPE, DataFileRecord};

/// Markers fetched per `_search` page during discovery.
const KNOWN_RECORDS_PAGE: usize = 5_000;
/// `search_after` cursor for marker pages: each marker's own `id`, through the keyword
/// subfield dynamic mapping gives it.
const KNOWN_RECORDS_SORT_FIELD: &str = "id.keyword";

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ElasticsearchStoreConfig {
    /// 📡 Cluster root, e.g. `http://localhost:9200`.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// 📦 Every document, marker and load-job record lands in this one index.
    pub index: String,
    /// ⏱️ Per-request timeout. A bulk call that outlives it is logged as a possible loss.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug)]
pub(crate) struct ElasticsearchStore {
    client: reqwest::Client,
    config: ElasticsearchStoreConfig,
    page_size: usize,
}

impl ElasticsearchStore {
    /// 🚀 Build the client and ping the cluster root. If the cluster isn't there we find
    /// out now, not 10,000 documents deep.
    pub(crate) async fn connect(config: ElasticsearchStoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let store = Self {
            client,
            config,
            page_size: KNOWN_RECORDS_PAGE,
        };

        let response = store.authorize(store.client.get(&store.config.url)).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::Failure(format!(
                "cluster at '{}' answered the ping with {}",
                store.config.url,
                response.status()
            )));
        }
        debug!("✅ Elasticsearch at '{}' is home and answering", store.config.url);
        Ok(store)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {api_key}"))
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    /// `<url>/<segments...>`, with every segment percent-encoded. Document ids are full
    /// of colons and the occasional slash.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let base = &self.config.url;
        let mut url = Url::parse(base)
            .map_err(|err| StoreError::Failure(format!("bad store url '{base}': {err}")))?;
        url.path_segments_mut()
            .map_err(|()| StoreError::Failure(format!("store url '{base}' cannot be a base")))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// 📝 Renders the `_bulk` NDJSON body: an action line, then the document, per document.
    fn bulk_body(&self, documents: &[Value]) -> Result<String, StoreError> {
        let mut body = String::new();
        for document in documents {
            let id = document
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| StoreError::Failure("document has no string 'id' field".into()))?;
            let action = json!({"index": {"_index": self.config.index, "_id": id}});
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&document.to_string());
            body.push('\n');
        }
        Ok(body)
    }
}

#[async_trait]
impl Store for ElasticsearchStore {
    async fn bulk_upsert(&mut self, documents: Vec<Value>) -> Result<usize, StoreError> {
        if documents.is_empty() {
            return Ok(0);
        }
        let body = self.bulk_body(&documents)?;
        debug!("📡 sending {} documents ({} bytes) to /_bulk", documents.len(), body.len());
        let response = self
            .authorize(self.client.post(self.endpoint(&["_bulk"])?))
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Failure(format!("_bulk answered {status}: {body}")));
        }
        let reply: Value = response.json().await?;
        if reply.get("errors").and_then(Value::as_bool) == Some(true) {
            let rejected = reply
                .get("items")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter(|item| {
                            item.pointer("/index/status")
                                .and_then(Value::as_u64)
                                .is_some_and(|code| code >= 300)
                        })
                        .count()
                })
                .unwrap_or(documents.len());
            return Err(StoreError::Failure(format!(
                "_bulk rejected {rejected} of {} documents",
                documents.len()
            )));
        }
        trace!("🚀 bulk request landed");
        Ok(documents.len())
    }

    async fn get(&mut self, id: &str) -> Result<Value, StoreError> {
        let url = self.endpoint(&[self.config.index.as_str(), "_doc", id])?;
        let response = self.authorize(self.client.get(url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(id.to_string())),
            status if !status.is_success() => Err(StoreError::Failure(format!(
                "lookup of '{id}' answered {status}"
            ))),
            _ => {
                let mut reply: Value = response.json().await?;
                reply
                    .get_mut("_source")
                    .map(Value::take)
                    .ok_or_else(|| StoreError::Failure(format!("'{id}' came back without _source")))
            }
        }
    }

    /// 🔍 Every marker for one ingest document, a page at a time. Paging goes on until
    /// a page comes back short, so ten thousand markers are not a ceiling.
    async fn data_file_records(
        &mut self,
        ingest_document_id: &str,
    ) -> Result<Vec<DataFileRecord>, StoreError> {
        let url = self.endpoint(&[self.config.index.as_str(), "_search"])?;
        let mut records = Vec::new();
        let mut cursor: Option<Value> = None;
        loop {
            let mut query = json!({
                "size": self.page_size,
                "query": {"bool": {"filter": [
                    {"match_phrase": {"type": DATA_FILE_TYPE}},
                    {"match_phrase": {"ingest_document": ingest_document_id}}
                ]}},
                "sort": [{KNOWN_RECORDS_SORT_FIELD: "asc"}]
            });
            if let Some(after) = cursor.take() {
                query["search_after"] = after;
            }
            let response = self
                .authorize(self.client.post(url.clone()))
                .json(&query)
                .send()
                .await?;
            match response.status() {
                // -- first run against a fresh cluster: no index yet, so nothing is known
                StatusCode::NOT_FOUND => return Ok(records),
                status if !status.is_success() => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(StoreError::Failure(format!("_search answered {status}: {body}")));
                }
                _ => {}
            }
            let reply: Value = response.json().await?;
            let hits = reply
                .pointer("/hits/hits")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let page_len = hits.len();
            cursor = hits.last().and_then(|hit| hit.get("sort")).cloned();
            records.extend(hits.into_iter().filter_map(|mut hit| {
                let source = hit.get_mut("_source").map(Value::take)?;
                match serde_json::from_value::<DataFileRecord>(source) {
                    Ok(record) => Some(record),
                    Err(err) => {
                        warn!("⚠️ skipping a malformed data-file marker: {err}");
                        None
                    }
                }
            }));
            if page_len < self.page_size {
                break;
            }
            if cursor.is_none() {
                warn!(
                    "⚠️ a full page of markers for '{ingest_document_id}' came back without sort \
                     values, stopping at {} record(s)",
                    records.len()
                );
                break;
            }
            trace!("📄 {} marker(s) so far for '{ingest_document_id}', next page", records.len());
        }
        debug!("🧾 {} known marker(s) for '{ingest_document_id}'", records.len());
        Ok(records)
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        debug!("🗑️ Elasticsearch store closing, nothing buffered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> ElasticsearchStoreConfig {
        ElasticsearchStoreConfig {
            url: server.uri(),
            username: None,
            password: None,
            api_key: Some("c2VjcmV0".into()),
            index: "ingest".into(),
            timeout_secs: 1,
        }
    }

    async fn mounted_ping(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"tagline": "You Know, for Search"})),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn the_one_where_bulk_speaks_ndjson_with_an_api_key() {
        let server = MockServer::start().await;
        mounted_ping(&server).await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(header("Authorization", "ApiKey c2VjcmV0"))
            .and(header("Content-Type", "application/x-ndjson"))
            .and(body_string_contains(r#""_id":"DD:KDEN""#))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"errors": false, "items": []})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut store = ElasticsearchStore::connect(config(&server)).await.unwrap();
        let written = store
            .bulk_upsert(vec![json!({"id": "DD:KDEN", "temp": 280.1})])
            .await
            .unwrap();
        assert_eq!(written, 1);
    }

    #[tokio::test]
    async fn the_one_where_item_level_rejections_are_failures() {
        let server = MockServer::start().await;
        mounted_ping(&server).await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": true,
                "items": [{"index": {"status": 201}}, {"index": {"status": 400}}]
            })))
            .mount(&server)
            .await;

        let mut store = ElasticsearchStore::connect(config(&server)).await.unwrap();
        let err = store
            .bulk_upsert(vec![json!({"id": "a"}), json!({"id": "b"})])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rejected 1 of 2"));
    }

    #[tokio::test]
    async fn the_one_where_a_slow_cluster_is_a_timeout() {
        let server = MockServer::start().await;
        mounted_ping(&server).await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let mut store = ElasticsearchStore::connect(config(&server)).await.unwrap();
        let err = store.bulk_upsert(vec![json!({"id": "a"})]).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
    }

    #[tokio::test]
    async fn the_one_where_point_lookups_unwrap_the_source() {
        let server = MockServer::start().await;
        mounted_ping(&server).await;
        Mock::given(method("GET"))
            .and(path("/ingest/_doc/JOB:METAR"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_id": "JOB:METAR", "found": true, "_source": {"ingest_document_ids": ["MD:1"]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ingest/_doc/JOB:GONE"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"found": false})))
            .mount(&server)
            .await;

        let mut store = ElasticsearchStore::connect(config(&server)).await.unwrap();
        assert_eq!(
            store.get("JOB:METAR").await.unwrap(),
            json!({"ingest_document_ids": ["MD:1"]})
        );
        assert!(matches!(store.get("JOB:GONE").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn the_one_where_discovery_markers_come_back_from_search() {
        let server = MockServer::start().await;
        mounted_ping(&server).await;
        Mock::given(method("POST"))
            .and(path("/ingest/_search"))
            .and(body_string_contains("MD:V01:METAR:obs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"hits": [
                    {"_source": {"id": "DF:METAR:nested_rows:MD:V01:METAR:obs:a.json", "type": "DF", "subset": "METAR",
                                 "builder_type": "nested_rows", "url": "/d/a.json", "mtime": 10,
                                 "ingest_document": "MD:V01:METAR:obs"}},
                    {"_source": {"id": "garbage"}}
                ]}
            })))
            .mount(&server)
            .await;

        let mut store = ElasticsearchStore::connect(config(&server)).await.unwrap();
        let records = store.data_file_records("MD:V01:METAR:obs").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mtime, 10);
    }

    fn marker_hit(name: &str) -> Value {
        let id = format!("DF:METAR:nested_rows:MD:1:{name}");
        json!({
            "_source": {"id": id.clone(), "type": "DF", "subset": "METAR", "builder_type": "nested_rows",
                        "url": format!("/d/{name}"), "mtime": 10, "ingest_document": "MD:1"},
            "sort": [id]
        })
    }

    #[tokio::test]
    async fn the_one_where_markers_arrive_a_page_at_a_time() {
        let server = MockServer::start().await;
        mounted_ping(&server).await;
        // -- the first page answers the first request only
        Mock::given(method("POST"))
            .and(path("/ingest/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"hits": [marker_hit("a.json"), marker_hit("b.json")]}
            })))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ingest/_search"))
            .and(body_string_contains(r#""search_after":["DF:METAR:nested_rows:MD:1:b.json"]"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"hits": [marker_hit("c.json")]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut store = ElasticsearchStore::connect(config(&server)).await.unwrap();
        store.page_size = 2;
        let records = store.data_file_records("MD:1").await.unwrap();
        let urls: Vec<_> = records.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["/d/a.json", "/d/b.json", "/d/c.json"]);
    }

    #[tokio::test]
    async fn the_one_where_a_fresh_cluster_knows_nothing() {
        let server = MockServer::start().await;
        mounted_ping(&server).await;
        Mock::given(method("POST"))
            .and(path("/ingest/_search"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let mut store = ElasticsearchStore::connect(config(&server)).await.unwrap();
        assert!(store.data_file_records("MD:1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn the_one_where_nobody_is_home() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = ElasticsearchStore::connect(config(&server)).await.unwrap_err();
        assert!(matches!(err, StoreError::Failure(_)));
    }
}
