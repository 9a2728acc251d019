//! REST [`Bucket`] implementation.
//!
//! Talks to the cluster over its HTTP interfaces with `reqwest`:
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | list design documents | `GET  <mgmt>/pools/default/buckets/<b>/ddocs` |
//! | upsert / remove design document | `PUT` / `DELETE <views>/<b>/_design/<name>` |
//! | query view | `GET  <views>/<b>/_design/<ddoc>/_view/<view>` |
//! | document get / write / remove | `GET` / `POST` / `DELETE <mgmt>/pools/default/buckets/<b>/docs/<id>` |
//!
//! `<mgmt>` is the `host:port` connection string, `<views>` is the same host
//! on `view_port`. Credentials, if configured, go out as HTTP basic auth.
//!
//! The document endpoint has no add-if-absent write, so [`Bucket::insert`]
//! checks for the key first and then writes. Two concurrent inserts of the
//! same key can both succeed.
//!
//! # Error mapping
//!
//! | Response | Code |
//! |----------|------|
//! | 404 | `KeyNotFound` |
//! | 409 | `KeyExists` |
//! | 429, 503 | `Busy` |
//! | 408, 504, client timeout | `Timeout` |
//! | undecodable body | `MalformedResponse` |
//! | other status | `Other(status)` |

use std::time::Duration;

use async_trait::async_trait;
use cb_admin_core::models::{DesignDocument, DesignDocumentSet, ViewRow};
use cb_admin_core::store::{Bucket, ErrorCode, StoreError, ViewQuery};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde_json::Value;

use crate::config::ClusterConfig;

/// Transport failures that are neither timeouts nor bad bodies.
const TRANSPORT_ERROR: u16 = 1;
/// A stored value that is not JSON (the body carries `base64`). Permanent.
const NOT_JSON: u16 = 2;

pub struct HttpBucket {
    name: String,
    client: Client,
    management: Url,
    views: Url,
    credentials: Option<(String, Option<String>)>,
}

impl HttpBucket {
    /// Build a client for `cluster.bucket` on the cluster at `conn`
    /// (`host:port`). No request is made until the first operation.
    pub fn connect(conn: &str, cluster: &ClusterConfig) -> anyhow::Result<Self> {
        let (host, _) = conn
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("invalid connection string '{}'", conn))?;
        let management = Url::parse(&format!("http://{}/", conn))?;
        let views = Url::parse(&format!("http://{}:{}/", host, cluster.view_port))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(cluster.timeout_secs))
            .build()?;

        tracing::debug!(
            bucket = %cluster.bucket,
            management = %management,
            views = %views,
            "http bucket ready"
        );

        Ok(Self {
            name: cluster.bucket.clone(),
            client,
            management,
            views,
            credentials: cluster
                .username
                .clone()
                .map(|user| (user, cluster.password.clone())),
        })
    }

    fn ddoc_url(&self, name: &str) -> Result<Url, StoreError> {
        endpoint(&self.views, &[&self.name, "_design", name])
    }

    fn doc_url(&self, key: &str) -> Result<Url, StoreError> {
        endpoint(
            &self.management,
            &["pools", "default", "buckets", &self.name, "docs", key],
        )
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, pass)) => req.basic_auth(user, pass.as_ref()),
            None => req,
        }
    }

    /// Send `req` and return the body of a successful response.
    async fn execute(&self, req: RequestBuilder, what: &str) -> Result<String, StoreError> {
        let response = self
            .authed(req)
            .send()
            .await
            .map_err(|e| transport_error(e, what))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, what))?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(status_error(status, what, &body))
        }
    }

    async fn execute_json(&self, req: RequestBuilder, what: &str) -> Result<Value, StoreError> {
        let body = self.execute(req, what).await?;
        serde_json::from_str(&body).map_err(|e| malformed(what, e))
    }

    async fn write_document(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let url = self.doc_url(key)?;
        let encoded = serde_json::to_string(value).map_err(|e| malformed(key, e))?;
        self.execute(self.client.post(url).form(&[("value", encoded)]), key)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Bucket for HttpBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_design_documents(&self) -> Result<DesignDocumentSet, StoreError> {
        let url = endpoint(
            &self.management,
            &["pools", "default", "buckets", &self.name, "ddocs"],
        )?;
        let body = self.execute_json(self.client.get(url), "ddocs").await?;
        parse_design_documents(&body)
    }

    async fn upsert_design_document(
        &self,
        name: &str,
        doc: &DesignDocument,
    ) -> Result<(), StoreError> {
        let url = self.ddoc_url(name)?;
        self.execute(self.client.put(url).json(doc), name).await?;
        Ok(())
    }

    async fn remove_design_document(&self, name: &str) -> Result<(), StoreError> {
        let url = self.ddoc_url(name)?;
        self.execute(self.client.delete(url), name).await?;
        Ok(())
    }

    async fn query_view(
        &self,
        design_document: &str,
        view: &str,
        query: &ViewQuery,
    ) -> Result<Vec<ViewRow>, StoreError> {
        let url = endpoint(
            &self.views,
            &[&self.name, "_design", design_document, "_view", view],
        )?;
        let what = format!("{}/{}", design_document, view);
        let params = view_params(query).map_err(|e| malformed(&what, e))?;
        let body = self
            .execute_json(self.client.get(url).query(&params), &what)
            .await?;
        parse_rows(&body, &what)
    }

    async fn get(&self, key: &str) -> Result<Value, StoreError> {
        let url = self.doc_url(key)?;
        let body = self.execute_json(self.client.get(url), key).await?;
        parse_document(body, key)
    }

    async fn insert(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        match self.get(key).await {
            Ok(_) => return Err(StoreError::exists(key)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.write_document(key, value).await
    }

    async fn upsert(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.write_document(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let url = self.doc_url(key)?;
        self.execute(self.client.delete(url), key).await?;
        Ok(())
    }

    async fn disconnect(&self) {
        tracing::debug!(bucket = %self.name, "closing http bucket");
    }
}

/// Append percent-encoded path segments to `base`.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, StoreError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| {
            StoreError::new(
                ErrorCode::Other(TRANSPORT_ERROR),
                format!("cannot build request path on {}", base),
            )
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Query-string parameters for a view query. Keys are JSON-encoded.
fn view_params(query: &ViewQuery) -> serde_json::Result<Vec<(&'static str, String)>> {
    let mut params = vec![("stale", query.freshness.as_query_value().to_string())];
    if query.full_set {
        params.push(("full_set", "true".to_string()));
    }
    if let Some(key) = &query.key {
        params.push(("key", serde_json::to_string(key)?));
    }
    if let Some(start) = &query.start_key {
        params.push(("startkey", serde_json::to_string(start)?));
    }
    if let Some(id) = &query.start_key_doc_id {
        params.push(("startkey_docid", id.clone()));
    }
    if let Some(end) = &query.end_key {
        params.push(("endkey", serde_json::to_string(end)?));
    }
    if let Some(limit) = query.limit {
        params.push(("limit", limit.to_string()));
    }
    Ok(params)
}

fn status_error(status: StatusCode, what: &str, body: &str) -> StoreError {
    let code = match status.as_u16() {
        404 => ErrorCode::KeyNotFound,
        409 => ErrorCode::KeyExists,
        429 | 503 => ErrorCode::Busy,
        408 | 504 => ErrorCode::Timeout,
        other => ErrorCode::Other(other),
    };
    let detail = body.trim();
    let message = if detail.is_empty() {
        format!("{}: HTTP {}", what, status)
    } else {
        format!("{}: HTTP {}: {}", what, status, detail)
    };
    StoreError::new(code, message)
}

fn transport_error(err: reqwest::Error, what: &str) -> StoreError {
    let code = if err.is_timeout() {
        ErrorCode::Timeout
    } else if err.is_decode() || err.is_body() {
        ErrorCode::MalformedResponse
    } else {
        ErrorCode::Other(TRANSPORT_ERROR)
    };
    StoreError::new(code, format!("{}: {}", what, err))
}

fn malformed(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::new(
        ErrorCode::MalformedResponse,
        format!("{}: malformed response: {}", what, err),
    )
}

/// `{"rows":[{"doc":{"meta":{"id":"_design/x"},"json":{...}}}]}`
fn parse_design_documents(body: &Value) -> Result<DesignDocumentSet, StoreError> {
    let rows = body
        .get("rows")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("ddocs", "missing rows"))?;

    let mut set = DesignDocumentSet::new();
    for row in rows {
        let doc = row.get("doc").ok_or_else(|| malformed("ddocs", "row without doc"))?;
        let id = doc
            .pointer("/meta/id")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("ddocs", "row without meta.id"))?;
        let name = id.strip_prefix("_design/").unwrap_or(id);
        let json = doc.get("json").cloned().unwrap_or(Value::Null);
        let parsed: DesignDocument =
            serde_json::from_value(json).map_err(|e| malformed(name, e))?;
        set.insert(name.to_string(), parsed);
    }
    Ok(set)
}

/// `{"total_rows":N,"rows":[{"id":..,"key":..,"value":..}]}`
fn parse_rows(body: &Value, what: &str) -> Result<Vec<ViewRow>, StoreError> {
    if let Some(error) = body.get("error").and_then(Value::as_str) {
        let reason = body.get("reason").and_then(Value::as_str).unwrap_or("");
        let code = if error == "not_found" {
            ErrorCode::KeyNotFound
        } else {
            ErrorCode::Other(TRANSPORT_ERROR)
        };
        return Err(StoreError::new(code, format!("{}: {}: {}", what, error, reason)));
    }
    let rows = body
        .get("rows")
        .cloned()
        .ok_or_else(|| malformed(what, "missing rows"))?;
    serde_json::from_value(rows).map_err(|e| malformed(what, e))
}

/// `{"meta":{..},"json":<value>}`
fn parse_document(mut body: Value, key: &str) -> Result<Value, StoreError> {
    match body.get_mut("json") {
        Some(json) => Ok(json.take()),
        None => Err(StoreError::new(
            ErrorCode::Other(NOT_JSON),
            format!("{}: document is not JSON", key),
        )),
    }
}
