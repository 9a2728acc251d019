//! Design-document data model.
//!
//! A bucket holds a set of named design documents, each of which bundles
//! a map of named views. The same logical document may exist in two
//! flavors: a staging copy (name prefixed with [`STAGING_PREFIX`]) and the
//! published copy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Prefix that marks a design document as a staging (development) copy.
pub const STAGING_PREFIX: &str = "dev_";

/// A single map/reduce view.
///
/// Two definitions are compared by exact text of `map` and, when present,
/// `reduce`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub map: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
}

impl ViewDefinition {
    pub fn new(map: impl Into<String>) -> Self {
        Self {
            map: map.into(),
            reduce: None,
        }
    }

    pub fn with_reduce(mut self, reduce: impl Into<String>) -> Self {
        self.reduce = Some(reduce.into());
        self
    }

    /// Returns `true` when every field set on `self` is present in `other`
    /// with identical text.
    ///
    /// A `reduce` that only exists on `other` does not count as a mismatch.
    pub fn is_satisfied_by(&self, other: &ViewDefinition) -> bool {
        if self.map != other.map {
            return false;
        }
        match (&self.reduce, &other.reduce) {
            (Some(ours), Some(theirs)) => ours == theirs,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

/// A named bundle of views, plus any other top-level fields the store
/// attached to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesignDocument {
    #[serde(default)]
    pub views: BTreeMap<String, ViewDefinition>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl DesignDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_view(mut self, name: impl Into<String>, view: ViewDefinition) -> Self {
        self.views.insert(name.into(), view);
        self
    }

    /// The view queried to build the index when the document is staged.
    ///
    /// Views are kept sorted by name, so this is the alphabetically first
    /// view, not the first one written in the source JSON. All views of a
    /// design document share one index build.
    pub fn first_view_name(&self) -> Option<&str> {
        self.views.keys().next().map(String::as_str)
    }
}

/// All design documents of one bucket (or export file), keyed by name.
pub type DesignDocumentSet = BTreeMap<String, DesignDocument>;

/// Returns the staging-form name of `name`. Already-staged names are
/// returned unchanged.
pub fn staging_name(name: &str) -> String {
    if is_staging(name) {
        name.to_string()
    } else {
        format!("{}{}", STAGING_PREFIX, name)
    }
}

pub fn is_staging(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX)
}

/// A row of a view result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    pub id: String,
    #[serde(default)]
    pub key: serde_json::Value,
    #[serde(default)]
    pub value: serde_json::Value,
}
