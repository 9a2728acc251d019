//! Bucket abstraction for cb-admin.
//!
//! The [`Bucket`] trait is the only thing the admin engine needs from a
//! cluster connection: design-document management, view queries, and
//! key-value document operations on one bucket. Implementations must be
//! `Send + Sync` to work with async runtimes.
//!
//! Errors carry a numeric [`ErrorCode`] so callers can tell transient
//! failures (retry) from permanent ones (propagate or tolerate).

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::{DesignDocument, DesignDocumentSet, ViewRow};

/// Error codes distinguished by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Temporary failure, the server is busy.
    Busy,
    /// Insert of a key that already exists.
    KeyExists,
    /// Key, design document, or view does not exist.
    KeyNotFound,
    /// The response could not be decoded. Usually a timeout in disguise.
    MalformedResponse,
    /// Client-side timeout.
    Timeout,
    Other(u16),
}

impl ErrorCode {
    pub fn code(&self) -> u16 {
        match self {
            ErrorCode::Busy => 11,
            ErrorCode::KeyExists => 12,
            ErrorCode::KeyNotFound => 13,
            ErrorCode::MalformedResponse => 20,
            ErrorCode::Timeout => 23,
            ErrorCode::Other(code) => *code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            11 => ErrorCode::Busy,
            12 => ErrorCode::KeyExists,
            13 => ErrorCode::KeyNotFound,
            20 => ErrorCode::MalformedResponse,
            23 => ErrorCode::Timeout,
            other => ErrorCode::Other(other),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::Busy | ErrorCode::Timeout | ErrorCode::MalformedResponse
        )
    }
}

/// An error returned by a [`Bucket`] operation.
#[derive(Debug, Clone, Error)]
#[error("{message} (code {})", code.code())]
pub struct StoreError {
    pub code: ErrorCode,
    pub message: String,
}

impl StoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::KeyNotFound, format!("not found: {}", what))
    }

    pub fn exists(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::KeyExists, format!("already exists: {}", what))
    }

    pub fn is_transient(&self) -> bool {
        self.code.is_transient()
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::KeyNotFound
    }
}

/// Index freshness requested by a view query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Serve whatever the index holds (`stale=ok`).
    #[default]
    Ok,
    /// Bring the index up to date before answering (`stale=false`).
    UpdateBefore,
    /// Answer from the index, then update it (`stale=update_after`).
    UpdateAfter,
}

impl Freshness {
    pub fn as_query_value(&self) -> &'static str {
        match self {
            Freshness::Ok => "ok",
            Freshness::UpdateBefore => "false",
            Freshness::UpdateAfter => "update_after",
        }
    }
}

/// Parameters of a single view query. Rows are always returned in
/// ascending key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewQuery {
    /// Exact key match.
    pub key: Option<Value>,
    /// Inclusive lower bound.
    pub start_key: Option<Value>,
    /// Among rows whose key equals `start_key`, skip ids below this one.
    pub start_key_doc_id: Option<String>,
    /// Inclusive upper bound.
    pub end_key: Option<Value>,
    pub limit: Option<usize>,
    pub freshness: Freshness,
    /// Query every node's index rather than the local partition set.
    pub full_set: bool,
}

impl ViewQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<Value>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn range(mut self, start: Option<Value>, end: Option<Value>) -> Self {
        self.start_key = start;
        self.end_key = end;
        self
    }

    pub fn start_key_doc_id(mut self, id: impl Into<String>) -> Self {
        self.start_key_doc_id = Some(id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn full_set(mut self, full_set: bool) -> Self {
        self.full_set = full_set;
        self
    }
}

/// A connection to one bucket.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_design_documents`](Bucket::get_design_documents) | Snapshot every design document |
/// | [`upsert_design_document`](Bucket::upsert_design_document) | Create or replace one design document |
/// | [`remove_design_document`](Bucket::remove_design_document) | Delete one design document |
/// | [`query_view`](Bucket::query_view) | Run a view query |
/// | [`get`](Bucket::get) / [`insert`](Bucket::insert) / [`upsert`](Bucket::upsert) / [`remove`](Bucket::remove) | Key-value document operations |
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Bucket name, for logs.
    fn name(&self) -> &str;

    async fn get_design_documents(&self) -> Result<DesignDocumentSet, StoreError>;

    async fn upsert_design_document(
        &self,
        name: &str,
        doc: &DesignDocument,
    ) -> Result<(), StoreError>;

    async fn remove_design_document(&self, name: &str) -> Result<(), StoreError>;

    async fn query_view(
        &self,
        design_document: &str,
        view: &str,
        query: &ViewQuery,
    ) -> Result<Vec<ViewRow>, StoreError>;

    async fn get(&self, key: &str) -> Result<Value, StoreError>;

    /// Store `value` under `key`, failing with [`ErrorCode::KeyExists`] if
    /// the key is already present.
    async fn insert(&self, key: &str, value: &Value) -> Result<(), StoreError>;

    async fn upsert(&self, key: &str, value: &Value) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Release the connection. Further calls may fail.
    async fn disconnect(&self);
}
