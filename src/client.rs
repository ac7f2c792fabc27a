//! OpenSearch connection and index administration.
//!
//! Owns the process-scoped client, the index template and lifecycle policy
//! upserts, and index maintenance (create on demand, stats, old-index
//! cleanup). Template/policy upserts are safe to run on every startup.

use std::time::Duration;

use chrono::{NaiveDate, Utc};
use opensearch::{
    auth::Credentials,
    cert::{Certificate, CertificateValidation},
    cluster::ClusterHealthParts,
    http::{
        headers::HeaderMap,
        request::JsonBody,
        transport::{SingleNodeConnectionPool, TransportBuilder},
        Method,
    },
    indices::{
        IndicesCreateParts, IndicesDeleteParts, IndicesExistsParts, IndicesGetParts,
        IndicesPutIndexTemplateParts, IndicesStatsParts,
    },
    OpenSearch,
};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::config::Settings;
use crate::mappings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DATE_FORMAT: &str = "%Y.%m.%d";

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Transport(#[from] opensearch::Error),
    #[error(transparent)]
    Build(#[from] opensearch::http::transport::BuildError),
    #[error("invalid host url: {0}")]
    InvalidHost(#[from] url::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Rejected(String),
}

/// Process-scoped OpenSearch client plus index administration helpers.
pub struct SearchClient {
    client: OpenSearch,
    index_prefix: String,
}

impl SearchClient {
    /// Build the client from settings. Only connects lazily; a down cluster
    /// does not fail construction.
    pub fn connect(settings: &Settings) -> Result<Self, SearchError> {
        let host = settings
            .opensearch_hosts
            .first()
            .cloned()
            .unwrap_or_else(|| "http://localhost:9200".to_string());
        if settings.opensearch_hosts.len() > 1 {
            info!(
                host = %host,
                ignored = settings.opensearch_hosts.len() - 1,
                "multiple opensearch hosts configured, using the first"
            );
        }

        let mut url = Url::parse(&host)?;
        if settings.opensearch_use_ssl && url.scheme() == "http" {
            let _ = url.set_scheme("https");
        }
        let pool = SingleNodeConnectionPool::new(url);
        let mut builder = TransportBuilder::new(pool)
            .disable_proxy()
            .timeout(REQUEST_TIMEOUT);

        if let Some(username) = &settings.opensearch_username {
            builder = builder.auth(Credentials::Basic(
                username.clone(),
                settings.opensearch_password.clone().unwrap_or_default(),
            ));
        }

        if !settings.opensearch_verify_certs {
            builder = builder.cert_validation(CertificateValidation::None);
        } else if let Some(ca_path) = &settings.opensearch_ca_certs {
            let pem = std::fs::read(ca_path)?;
            let cert = Certificate::from_pem(&pem)?;
            builder = builder.cert_validation(CertificateValidation::Full(cert));
        }

        let transport = builder.build()?;
        info!(host = %host, "opensearch client initialized");

        Ok(Self {
            client: OpenSearch::new(transport),
            index_prefix: settings.opensearch_index_prefix.clone(),
        })
    }

    /// Client against a single explicit URL with default settings elsewhere.
    pub fn with_url(url: &str, index_prefix: &str) -> Result<Self, SearchError> {
        let pool = SingleNodeConnectionPool::new(Url::parse(url)?);
        let transport = TransportBuilder::new(pool)
            .disable_proxy()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client: OpenSearch::new(transport),
            index_prefix: index_prefix.to_string(),
        })
    }

    pub fn raw(&self) -> &OpenSearch {
        &self.client
    }

    pub fn index_prefix(&self) -> &str {
        &self.index_prefix
    }

    fn index_pattern(&self) -> String {
        format!("{}-*", self.index_prefix)
    }

    /// Cluster health document, e.g. `{"status": "green", ...}`.
    pub async fn cluster_health(&self) -> Result<Value, SearchError> {
        let response = self
            .client
            .cluster()
            .health(ClusterHealthParts::None)
            .send()
            .await?;
        if !response.status_code().is_success() {
            let status = response.status_code();
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Rejected(format!(
                "cluster health returned {status}: {body}"
            )));
        }
        Ok(response.json::<Value>().await?)
    }

    /// Create or update the composable index template.
    pub async fn ensure_index_template(&self) -> Result<(), SearchError> {
        let template_name = format!("{}-template", self.index_prefix);
        let response = self
            .client
            .indices()
            .put_index_template(IndicesPutIndexTemplateParts::Name(&template_name))
            .body(mappings::index_template(&self.index_prefix))
            .send()
            .await?;

        if response.status_code().is_success() {
            info!(template = %template_name, "index template created/updated");
            Ok(())
        } else {
            let status = response.status_code();
            let body = response.text().await.unwrap_or_default();
            Err(SearchError::Rejected(format!(
                "failed to put index template: {status}: {body}"
            )))
        }
    }

    /// Create the lifecycle policy when it does not exist yet. Advisory: the
    /// caller is expected to log failures and keep going.
    pub async fn ensure_ism_policy(&self) -> Result<(), SearchError> {
        let policy_name = format!("{}-policy", self.index_prefix);
        let path = format!("/_plugins/_ism/policies/{policy_name}");

        // Updating an existing policy needs sequence numbers; an existing
        // policy is simply left in place.
        let existing = self
            .client
            .transport()
            .send(
                Method::Get,
                &path,
                HeaderMap::new(),
                None::<&()>,
                None::<JsonBody<Value>>,
                None,
            )
            .await?;
        if existing.status_code().is_success() {
            info!(policy = %policy_name, "ism policy already present");
            return Ok(());
        }

        let response = self
            .client
            .transport()
            .send(
                Method::Put,
                &path,
                HeaderMap::new(),
                None::<&()>,
                Some(JsonBody::new(mappings::ism_policy(&self.index_prefix))),
                None,
            )
            .await?;

        if response.status_code().is_success() {
            info!(policy = %policy_name, "ism policy created");
            Ok(())
        } else {
            let status = response.status_code();
            let body = response.text().await.unwrap_or_default();
            Err(SearchError::Rejected(format!(
                "failed to put ism policy: {status}: {body}"
            )))
        }
    }

    /// Create an index with the event mapping unless it already exists.
    pub async fn create_index_if_missing(&self, index_name: &str) -> Result<(), SearchError> {
        let exists = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[index_name]))
            .send()
            .await?;
        if exists.status_code().is_success() {
            return Ok(());
        }

        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(index_name))
            .body(mappings::events_mapping())
            .send()
            .await?;

        if response.status_code().is_success() {
            info!(index = %index_name, "index created");
            return Ok(());
        }

        let status = response.status_code();
        let body = response.text().await.unwrap_or_default();
        // Another writer may have created it in between.
        if body.contains("resource_already_exists_exception") {
            return Ok(());
        }
        Err(SearchError::Rejected(format!(
            "failed to create index {index_name}: {status}: {body}"
        )))
    }

    /// `_stats` snapshot for all event indices.
    pub async fn index_stats(&self) -> Result<Value, SearchError> {
        let pattern = self.index_pattern();
        let response = self
            .client
            .indices()
            .stats(IndicesStatsParts::Index(&[pattern.as_str()]))
            .send()
            .await?;
        if !response.status_code().is_success() {
            let status = response.status_code();
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Rejected(format!(
                "failed to fetch index stats: {status}: {body}"
            )));
        }
        Ok(response.json::<Value>().await?)
    }

    /// Delete event indices whose date suffix is older than `days_to_keep`
    /// days. Indices with a malformed suffix are skipped. Returns the deleted
    /// index names.
    pub async fn delete_old_indices(&self, days_to_keep: i64) -> Result<Vec<String>, SearchError> {
        let pattern = self.index_pattern();
        let response = self
            .client
            .indices()
            .get(IndicesGetParts::Index(&[pattern.as_str()]))
            .send()
            .await?;
        if !response.status_code().is_success() {
            let status = response.status_code();
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Rejected(format!(
                "failed to list indices: {status}: {body}"
            )));
        }

        let indices = response.json::<Value>().await?;
        let cutoff = (Utc::now() - chrono::Duration::days(days_to_keep)).date_naive();
        let prefix = format!("{}-", self.index_prefix);
        let mut deleted = Vec::new();

        if let Some(map) = indices.as_object() {
            for index_name in map.keys() {
                let suffix = match index_name.strip_prefix(&prefix) {
                    Some(s) => s,
                    None => continue,
                };
                let index_date = match NaiveDate::parse_from_str(suffix, DATE_FORMAT) {
                    Ok(d) => d,
                    Err(_) => continue,
                };
                if index_date >= cutoff {
                    continue;
                }

                let response = self
                    .client
                    .indices()
                    .delete(IndicesDeleteParts::Index(&[index_name.as_str()]))
                    .send()
                    .await?;
                if response.status_code().is_success() {
                    info!(index = %index_name, "deleted old index");
                    deleted.push(index_name.clone());
                } else {
                    error!(index = %index_name, status = %response.status_code(), "failed to delete old index");
                }
            }
        }

        Ok(deleted)
    }

    /// Run the startup upserts: template (required to route documents
    /// consistently) and lifecycle policy (advisory).
    pub async fn ensure_startup_resources(&self) {
        if let Err(e) = self.ensure_index_template().await {
            error!(error = %e, "failed to ensure index template");
        }
        if let Err(e) = self.ensure_ism_policy().await {
            warn!(error = %e, "failed to ensure ism policy (plugin may be unavailable)");
        }
    }
}
