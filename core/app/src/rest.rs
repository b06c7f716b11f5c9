//! HTTP client for a PostgREST-style remote backend.

use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use plotsync_common::{EntityTable, Error, Record, RecordId, Result, Secret};
use plotsync_sync::{Filter, RemoteBackend};

/// Path prefix of the table endpoints.
const REST_PREFIX: &str = "rest/v1/";

/// Default per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Remote backend speaking the PostgREST table protocol.
///
/// Row-level permissions are enforced by the server; rejections surface as
/// `Error::Rejected`, server-side trouble as retryable `Error::Backend`.
pub struct RestBackend {
    http: Client,
    base: Url,
    api_key: Secret,
}

impl RestBackend {
    /// Create a client for `base_url`.
    ///
    /// # Errors
    /// - Invalid URL
    /// - HTTP client construction failure
    pub fn new(base_url: &str, api_key: Secret) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid backend URL {}: {}", base_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = Client::builder()
            .user_agent("PlotSync/0.1")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base, api_key })
    }

    /// Endpoint URL of a table.
    pub fn table_url(&self, table: &EntityTable) -> Result<Url> {
        self.base
            .join(REST_PREFIX)
            .and_then(|rest| rest.join(table.as_str()))
            .map_err(|e| Error::InvalidInput(format!("Invalid table URL for {}: {}", table, e)))
    }

    fn request(&self, method: Method, table: &EntityTable) -> Result<RequestBuilder> {
        let url = self.table_url(table)?;
        Ok(self
            .http
            .request(method, url)
            .header("apikey", self.api_key.expose())
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.api_key.expose()),
            ))
    }

    async fn send(&self, request: RequestBuilder, action: &str) -> Result<Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("Failed to {}: {}", action, e))
            } else {
                Error::Network(format!("Failed to {}: {}", action, e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::from_status(status.as_u16(), error_message(&body, status.as_str())))
    }

    async fn records(response: Response) -> Result<Vec<Record>> {
        let rows: Vec<Value> = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))?;
        rows.into_iter().map(Record::from_value).collect()
    }

    async fn single(response: Response, table: &EntityTable, id: Option<&RecordId>) -> Result<Record> {
        Self::records(response).await?.into_iter().next().ok_or_else(|| match id {
            Some(id) => Error::NotFound(format!("{} row {} not found", table, id)),
            None => Error::Serialization(format!("Empty representation from {}", table)),
        })
    }
}

/// Query parameters for a filter, in PostgREST syntax.
pub fn filter_query(filter: &Filter) -> Vec<(String, String)> {
    let mut query = vec![("select".to_string(), "*".to_string())];
    for (column, value) in &filter.eq {
        let condition = match value {
            Value::Null => "is.null".to_string(),
            Value::String(s) => format!("eq.{}", s),
            other => format!("eq.{}", other),
        };
        query.push((column.clone(), condition));
    }
    if let Some(order) = &filter.order {
        let direction = if order.descending { "desc" } else { "asc" };
        query.push(("order".to_string(), format!("{}.{}", order.column, direction)));
    }
    query
}

fn id_query(id: &RecordId) -> [(&'static str, String); 1] {
    [("id", format!("eq.{}", id))]
}

/// Best human-readable message of an error body.
fn error_message(body: &str, status: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| {
            if body.is_empty() {
                format!("HTTP {}", status)
            } else {
                body.to_string()
            }
        })
}

#[async_trait]
impl RemoteBackend for RestBackend {
    fn name(&self) -> &str {
        "rest"
    }

    async fn select(&self, table: &EntityTable, filter: &Filter) -> Result<Vec<Record>> {
        debug!(table = %table, "GET rows");
        let request = self.request(Method::GET, table)?.query(&filter_query(filter));
        let response = self.send(request, "select rows").await?;
        Self::records(response).await
    }

    async fn insert(&self, table: &EntityTable, record: Record) -> Result<Record> {
        debug!(table = %table, "POST row");
        let request = self
            .request(Method::POST, table)?
            .header("Prefer", "return=representation")
            .json(record.as_map());
        let response = self.send(request, "insert row").await?;
        Self::single(response, table, None).await
    }

    async fn update(&self, table: &EntityTable, id: &RecordId, changes: Record) -> Result<Record> {
        debug!(table = %table, id = %id, "PATCH row");
        let request = self
            .request(Method::PATCH, table)?
            .query(&id_query(id))
            .header("Prefer", "return=representation")
            .json(changes.without_id().as_map());
        let response = self.send(request, "update row").await?;
        Self::single(response, table, Some(id)).await
    }

    async fn delete(&self, table: &EntityTable, id: &RecordId) -> Result<()> {
        debug!(table = %table, id = %id, "DELETE row");
        let request = self
            .request(Method::DELETE, table)?
            .query(&id_query(id))
            .header("Prefer", "return=representation");
        let response = self.send(request, "delete row").await?;
        Self::single(response, table, Some(id)).await.map(|_| ())
    }
}
