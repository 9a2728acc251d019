//! A bucket handle plus its retry state.
//!
//! [`Connection`] wraps any [`Bucket`] and routes key-value and view calls
//! through [`with_retry`]. Design-document management lives in
//! [`crate::ddocs`] and is not retried.

use std::sync::Arc;

use anyhow::{bail, Result};
use cb_admin_core::models::ViewRow;
use cb_admin_core::store::{Bucket, ViewQuery};
use serde_json::Value;

use crate::config::{is_connection_string, ClusterConfig, RetryConfig};
use crate::http::HttpBucket;
use crate::retry::{with_retry, CallClass, RemoteError, RetryPolicy, RetryState};

pub struct Connection {
    bucket: Arc<dyn Bucket>,
    retry: RetryState,
    policy: RetryPolicy,
}

impl Connection {
    pub fn new(bucket: Arc<dyn Bucket>, policy: RetryPolicy) -> Self {
        Self {
            bucket,
            retry: RetryState::new(),
            policy,
        }
    }

    /// Open a REST connection to `cluster.bucket` on `conn` (`host:port`).
    pub fn open(conn: &str, cluster: &ClusterConfig, retry: &RetryConfig) -> Result<Self> {
        if !is_connection_string(conn) {
            bail!("invalid connection string '{}', expected host:port", conn);
        }
        let bucket = HttpBucket::connect(conn, cluster)?;
        tracing::info!(conn, bucket = %cluster.bucket, "connected");
        Ok(Self::new(Arc::new(bucket), RetryPolicy::from(retry)))
    }

    pub fn bucket(&self) -> &dyn Bucket {
        self.bucket.as_ref()
    }

    pub fn name(&self) -> &str {
        self.bucket.name()
    }

    pub async fn get(&self, key: &str) -> Result<Value, RemoteError> {
        let label = format!("get {}", key);
        with_retry(&self.retry, &self.policy, CallClass::Document, &label, || {
            self.bucket.get(key)
        })
        .await
    }

    pub async fn insert(&self, key: &str, value: &Value) -> Result<(), RemoteError> {
        let label = format!("insert {}", key);
        with_retry(&self.retry, &self.policy, CallClass::Document, &label, || {
            self.bucket.insert(key, value)
        })
        .await
    }

    pub async fn upsert(&self, key: &str, value: &Value) -> Result<(), RemoteError> {
        let label = format!("upsert {}", key);
        with_retry(&self.retry, &self.policy, CallClass::Document, &label, || {
            self.bucket.upsert(key, value)
        })
        .await
    }

    pub async fn remove(&self, key: &str) -> Result<(), RemoteError> {
        let label = format!("remove {}", key);
        with_retry(&self.retry, &self.policy, CallClass::Document, &label, || {
            self.bucket.remove(key)
        })
        .await
    }

    pub async fn query_view(
        &self,
        design_document: &str,
        view: &str,
        query: &ViewQuery,
    ) -> Result<Vec<ViewRow>, RemoteError> {
        let label = format!("query {}/{}", design_document, view);
        with_retry(&self.retry, &self.policy, CallClass::View, &label, || {
            self.bucket.query_view(design_document, view, query)
        })
        .await
    }

    pub async fn disconnect(&self) {
        tracing::debug!(bucket = self.name(), "disconnecting");
        self.bucket.disconnect().await;
    }
}

/// Disconnect every connection, then hand back `result` unchanged.
pub async fn release<T>(result: Result<T>, connections: &[&Connection]) -> Result<T> {
    for conn in connections {
        conn.disconnect().await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_admin_core::store::memory::InMemoryBucket;

    #[test]
    fn open_rejects_bad_connection_string() {
        let err = Connection::open(
            "not a host",
            &ClusterConfig::default(),
            &RetryConfig::default(),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("invalid connection string"));
    }

    #[tokio::test]
    async fn release_disconnects_on_error_too() {
        let a = Arc::new(InMemoryBucket::new("a"));
        let b = Arc::new(InMemoryBucket::new("b"));
        let ca = Connection::new(a.clone(), RetryPolicy::default());
        let cb = Connection::new(b.clone(), RetryPolicy::default());

        let result: Result<()> = release(Err(anyhow::anyhow!("boom")), &[&ca, &cb]).await;
        assert!(result.is_err());
        assert!(a.is_disconnected() && b.is_disconnected());
    }
}
