//! In-memory [`Bucket`] implementation for tests and dry runs.
//!
//! Uses `BTreeMap`s behind `std::sync::RwLock`. Views are evaluated in
//! Rust: a view whose map source was registered through
//! [`InMemoryBucket::register_filter`] applies that prefix predicate,
//! any other view emits every document id. Rows are keyed by document id
//! with a `null` value.
//!
//! Failures can be injected per operation, either for the next N calls or
//! permanently for one key.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::admin_view::FilterSpec;
use crate::models::{DesignDocument, DesignDocumentSet, ViewRow};

use super::{Bucket, ErrorCode, StoreError, ViewQuery};

/// Operation selector for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetDesignDocuments,
    UpsertDesignDocument,
    RemoveDesignDocument,
    QueryView,
    Get,
    Insert,
    Upsert,
    Remove,
}

/// In-memory bucket for tests.
pub struct InMemoryBucket {
    name: String,
    design_documents: RwLock<DesignDocumentSet>,
    documents: RwLock<BTreeMap<String, Value>>,
    filters: RwLock<HashMap<String, FilterSpec>>,
    queued_faults: Mutex<HashMap<Op, VecDeque<ErrorCode>>>,
    key_faults: RwLock<HashMap<(Op, String), ErrorCode>>,
    calls: Mutex<HashMap<Op, u64>>,
    disconnected: AtomicBool,
}

impl InMemoryBucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            design_documents: RwLock::new(BTreeMap::new()),
            documents: RwLock::new(BTreeMap::new()),
            filters: RwLock::new(HashMap::new()),
            queued_faults: Mutex::new(HashMap::new()),
            key_faults: RwLock::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Seed documents directly, bypassing call counting and faults.
    pub fn with_documents<I, K>(self, docs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        {
            let mut stored = self.documents.write().unwrap();
            for (key, value) in docs {
                stored.insert(key.into(), value);
            }
        }
        self
    }

    /// Seed design documents directly.
    pub fn with_design_documents(self, set: DesignDocumentSet) -> Self {
        self.design_documents.write().unwrap().extend(set);
        self
    }

    /// Make views whose map source equals `spec.map_source()` apply `spec`.
    pub fn register_filter(&self, spec: FilterSpec) {
        self.filters.write().unwrap().insert(spec.map_source(), spec);
    }

    /// Fail the next `times` calls of `op` with `code`.
    pub fn fail_next(&self, op: Op, code: ErrorCode, times: usize) {
        let mut faults = self.queued_faults.lock().unwrap();
        let queue = faults.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(code);
        }
    }

    /// Fail every call of `op` on `key` with `code`.
    pub fn fail_key(&self, op: Op, key: impl Into<String>, code: ErrorCode) {
        self.key_faults
            .write()
            .unwrap()
            .insert((op, key.into()), code);
    }

    /// Number of calls made for `op`, failed ones included.
    pub fn calls(&self, op: Op) -> u64 {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    pub fn document(&self, key: &str) -> Option<Value> {
        self.documents.read().unwrap().get(key).cloned()
    }

    pub fn document_keys(&self) -> Vec<String> {
        self.documents.read().unwrap().keys().cloned().collect()
    }

    pub fn design_document(&self, name: &str) -> Option<DesignDocument> {
        self.design_documents.read().unwrap().get(name).cloned()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn enter(&self, op: Op, key: Option<&str>) -> Result<(), StoreError> {
        *self.calls.lock().unwrap().entry(op).or_insert(0) += 1;

        if let Some(key) = key {
            if let Some(code) = self
                .key_faults
                .read()
                .unwrap()
                .get(&(op, key.to_string()))
            {
                return Err(StoreError::new(
                    *code,
                    format!("injected {:?} failure on {}", op, key),
                ));
            }
        }

        let queued = self
            .queued_faults
            .lock()
            .unwrap()
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        match queued {
            Some(code) => Err(StoreError::new(code, format!("injected {:?} failure", op))),
            None => Ok(()),
        }
    }
}

fn in_range(key: &str, query: &ViewQuery) -> bool {
    fn as_str(v: &Option<Value>) -> Option<&str> {
        v.as_ref().and_then(Value::as_str)
    }
    if let Some(exact) = as_str(&query.key) {
        if key != exact {
            return false;
        }
    }
    if let Some(start) = as_str(&query.start_key) {
        if key < start {
            return false;
        }
        // Rows are keyed by id, so the id tie-break applies to the same string.
        if let Some(doc_id) = &query.start_key_doc_id {
            if key == start && key < doc_id.as_str() {
                return false;
            }
        }
    }
    if let Some(end) = as_str(&query.end_key) {
        if key > end {
            return false;
        }
    }
    true
}

#[async_trait]
impl Bucket for InMemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_design_documents(&self) -> Result<DesignDocumentSet, StoreError> {
        self.enter(Op::GetDesignDocuments, None)?;
        Ok(self.design_documents.read().unwrap().clone())
    }

    async fn upsert_design_document(
        &self,
        name: &str,
        doc: &DesignDocument,
    ) -> Result<(), StoreError> {
        self.enter(Op::UpsertDesignDocument, Some(name))?;
        self.design_documents
            .write()
            .unwrap()
            .insert(name.to_string(), doc.clone());
        Ok(())
    }

    async fn remove_design_document(&self, name: &str) -> Result<(), StoreError> {
        self.enter(Op::RemoveDesignDocument, Some(name))?;
        match self.design_documents.write().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(StoreError::not_found(format!("_design/{}", name))),
        }
    }

    async fn query_view(
        &self,
        design_document: &str,
        view: &str,
        query: &ViewQuery,
    ) -> Result<Vec<ViewRow>, StoreError> {
        self.enter(Op::QueryView, Some(design_document))?;

        let map_source = {
            let ddocs = self.design_documents.read().unwrap();
            let ddoc = ddocs
                .get(design_document)
                .ok_or_else(|| StoreError::not_found(format!("_design/{}", design_document)))?;
            let definition = ddoc.views.get(view).ok_or_else(|| {
                StoreError::not_found(format!("_design/{}/_view/{}", design_document, view))
            })?;
            definition.map.clone()
        };

        let filters = self.filters.read().unwrap();
        let filter = filters.get(&map_source);
        let docs = self.documents.read().unwrap();

        let rows = docs
            .keys()
            .filter(|id| filter.map_or(true, |f| f.matches(id)))
            .filter(|id| in_range(id, query))
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|id| ViewRow {
                id: id.clone(),
                key: Value::String(id.clone()),
                value: Value::Null,
            })
            .collect();
        Ok(rows)
    }

    async fn get(&self, key: &str) -> Result<Value, StoreError> {
        self.enter(Op::Get, Some(key))?;
        self.documents
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(key))
    }

    async fn insert(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.enter(Op::Insert, Some(key))?;
        let mut docs = self.documents.write().unwrap();
        if docs.contains_key(key) {
            return Err(StoreError::exists(key));
        }
        docs.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn upsert(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.enter(Op::Upsert, Some(key))?;
        self.documents
            .write()
            .unwrap()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.enter(Op::Remove, Some(key))?;
        match self.documents.write().unwrap().remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::not_found(key)),
        }
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}
