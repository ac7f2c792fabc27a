//! Document indexing: time-sharded routing, single and bulk writes.
//!
//! Documents are routed to `{prefix}-YYYY.MM.DD` derived from `@timestamp` in
//! UTC and written with `_id = event_id`, so redelivered events overwrite
//! themselves instead of duplicating. Writes never request an immediate
//! refresh.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use opensearch::http::request::JsonBody;
use opensearch::indices::IndicesRefreshParts;
use opensearch::{BulkParts, CountParts, IndexParts};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::client::{SearchClient, SearchError};
use crate::transform::IndexedDocument;

/// Bounded parallelism for indexing calls.
const WORKER_POOL_SIZE: usize = 10;

/// Documents per bulk request.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

const MAX_RECORDED_ERRORS: usize = 10;

#[derive(Debug, Clone)]
pub struct IndexOutcome {
    pub id: String,
    pub index: String,
    pub result: String,
}

/// Aggregate result of a bulk write. Per-chunk failures do not abort later
/// chunks; recorded errors are truncated.
#[derive(Debug, Clone, Default)]
pub struct BulkSummary {
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl BulkSummary {
    fn record_error(&mut self, error: String) {
        if self.errors.len() < MAX_RECORDED_ERRORS {
            self.errors.push(error);
        }
    }
}

pub struct Indexer {
    client: Arc<SearchClient>,
    index_prefix: String,
    permits: Arc<Semaphore>,
}

impl Indexer {
    pub fn new(client: Arc<SearchClient>, index_prefix: &str) -> Self {
        Self {
            client,
            index_prefix: index_prefix.to_string(),
            permits: Arc::new(Semaphore::new(WORKER_POOL_SIZE)),
        }
    }

    /// `{prefix}-YYYY.MM.DD` in UTC.
    pub fn index_name(&self, timestamp: &DateTime<Utc>) -> String {
        format!("{}-{}", self.index_prefix, timestamp.format("%Y.%m.%d"))
    }

    /// Write one document. Retries once on transient (transport or 5xx)
    /// failures; the caller decides what to do beyond that.
    pub async fn index_one(&self, document: &IndexedDocument) -> Result<IndexOutcome, SearchError> {
        let _permit = self.permits.acquire().await.ok();

        match self.index_once(document).await {
            Ok(outcome) => Ok(outcome),
            Err((e, true)) => {
                warn!(event_id = %document.event_id, error = %e, "transient index failure, retrying");
                self.index_once(document).await.map_err(|(e, _)| e)
            }
            Err((e, false)) => Err(e),
        }
    }

    async fn index_once(
        &self,
        document: &IndexedDocument,
    ) -> Result<IndexOutcome, (SearchError, bool)> {
        let index_name = self.index_name(&document.timestamp);
        let response = self
            .client
            .raw()
            .index(IndexParts::IndexId(&index_name, &document.event_id))
            .body(document)
            .send()
            .await
            .map_err(|e| (SearchError::Transport(e), true))?;

        let status = response.status_code();
        if status.is_success() {
            let body = response
                .json::<Value>()
                .await
                .map_err(|e| (SearchError::Transport(e), false))?;
            return Ok(IndexOutcome {
                id: body["_id"]
                    .as_str()
                    .unwrap_or(&document.event_id)
                    .to_string(),
                index: body["_index"].as_str().unwrap_or(&index_name).to_string(),
                result: body["result"].as_str().unwrap_or_default().to_string(),
            });
        }

        let transient = status.is_server_error();
        let body = response.text().await.unwrap_or_default();
        Err((
            SearchError::Rejected(format!(
                "index of {} into {index_name} returned {status}: {body}",
                document.event_id
            )),
            transient,
        ))
    }

    /// Bulk-write documents in chunks. A failing chunk is recorded as one
    /// aggregate error and the remaining chunks still run.
    pub async fn index_bulk(
        &self,
        documents: &[IndexedDocument],
        chunk_size: usize,
    ) -> BulkSummary {
        let mut summary = BulkSummary::default();
        if documents.is_empty() {
            return summary;
        }

        for chunk in documents.chunks(chunk_size.max(1)) {
            let mut body: Vec<JsonBody<Value>> = Vec::with_capacity(chunk.len() * 2);
            for document in chunk {
                body.push(
                    json!({
                        "index": {
                            "_index": self.index_name(&document.timestamp),
                            "_id": document.event_id,
                        }
                    })
                    .into(),
                );
                match serde_json::to_value(document) {
                    Ok(source) => body.push(source.into()),
                    Err(e) => {
                        // Keep action/source pairs aligned.
                        body.pop();
                        summary.failed += 1;
                        summary.record_error(format!(
                            "failed to serialize {}: {e}",
                            document.event_id
                        ));
                    }
                }
            }
            if body.is_empty() {
                continue;
            }
            let sent = body.len() / 2;

            let _permit = self.permits.acquire().await.ok();
            let response = match self.client.raw().bulk(BulkParts::None).body(body).send().await {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "bulk chunk failed");
                    summary.failed += sent;
                    summary.record_error(format!("bulk chunk failed: {e}"));
                    continue;
                }
            };

            if !response.status_code().is_success() {
                let status = response.status_code();
                let text = response.text().await.unwrap_or_default();
                error!(status = %status, "bulk chunk rejected");
                summary.failed += sent;
                summary.record_error(format!("bulk chunk returned {status}: {text}"));
                continue;
            }

            match response.json::<Value>().await {
                Ok(result) => {
                    let items = result["items"].as_array().cloned().unwrap_or_default();
                    for item in &items {
                        let action = item
                            .get("index")
                            .or_else(|| item.get("create"))
                            .cloned()
                            .unwrap_or_default();
                        if let Some(error) = action.get("error") {
                            summary.failed += 1;
                            summary.record_error(error.to_string());
                        } else {
                            summary.success += 1;
                        }
                    }
                    // A response without items still acknowledged the chunk.
                    if items.is_empty() {
                        summary.success += sent;
                    }
                }
                Err(e) => {
                    summary.failed += sent;
                    summary.record_error(format!("bulk response unreadable: {e}"));
                }
            }
        }

        info!(
            success = summary.success,
            failed = summary.failed,
            "bulk indexed events"
        );
        summary
    }

    /// Make recently written documents visible to search.
    pub async fn refresh(&self, pattern: Option<&str>) -> Result<(), SearchError> {
        let default_pattern = format!("{}-*", self.index_prefix);
        let pattern = pattern.unwrap_or(&default_pattern);
        let response = self
            .client
            .raw()
            .indices()
            .refresh(IndicesRefreshParts::Index(&[pattern]))
            .send()
            .await?;
        if response.status_code().is_success() {
            Ok(())
        } else {
            let status = response.status_code();
            Err(SearchError::Rejected(format!("refresh returned {status}")))
        }
    }

    /// Total documents across matching indices. Errors degrade to zero.
    pub async fn document_count(&self, pattern: Option<&str>) -> u64 {
        let default_pattern = format!("{}-*", self.index_prefix);
        let pattern = pattern.unwrap_or(&default_pattern);
        let response = match self
            .client
            .raw()
            .count(CountParts::Index(&[pattern]))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "failed to count documents");
                return 0;
            }
        };
        match response.json::<Value>().await {
            Ok(body) => body["count"].as_u64().unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Drop indices older than the retention window.
    pub async fn delete_old(&self, days_to_keep: i64) -> Vec<String> {
        match self.client.delete_old_indices(days_to_keep).await {
            Ok(deleted) => deleted,
            Err(e) => {
                error!(error = %e, "failed to delete old indices");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn indexer() -> Indexer {
        let client = SearchClient::with_url("http://localhost:9200", "sentry-events").unwrap();
        Indexer::new(Arc::new(client), "sentry-events")
    }

    #[test]
    fn index_name_uses_utc_date() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        assert_eq!(indexer().index_name(&ts), "sentry-events-2024.01.15");

        let end_of_day = Utc.with_ymd_and_hms(2024, 1, 15, 23, 59, 59).unwrap();
        assert_eq!(indexer().index_name(&end_of_day), "sentry-events-2024.01.15");
    }

    #[test]
    fn bulk_summary_truncates_errors() {
        let mut summary = BulkSummary::default();
        for i in 0..20 {
            summary.record_error(format!("error {i}"));
        }
        assert_eq!(summary.errors.len(), MAX_RECORDED_ERRORS);
    }
}
