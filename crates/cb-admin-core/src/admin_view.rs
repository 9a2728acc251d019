//! Content-addressed admin filter views.
//!
//! An admin view enumerates document ids by key-prefix membership. Its name
//! is derived from the SHA-1 of the generated map function, so generating
//! the same predicate twice always yields the same view id:
//!
//! ```text
//! view_<hex(sha1(map source))>
//! ```
//!
//! Prefixes are sorted and de-duplicated before the source is built; their
//! order on the command line never changes the id.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::models::ViewDefinition;

/// Prefix of every generated admin view name.
pub const VIEW_ID_PREFIX: &str = "view_";

/// How the prefix set selects documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterMode {
    /// Id starts with any of the prefixes.
    Matching,
    /// Id starts with none of the prefixes.
    NotMatching,
}

/// A prefix predicate over document ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    prefixes: BTreeSet<String>,
    mode: FilterMode,
}

impl FilterSpec {
    pub fn new<I, S>(prefixes: I, mode: FilterMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
            mode,
        }
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.prefixes.iter().map(String::as_str)
    }

    /// Evaluate the predicate in Rust, with the same semantics as the
    /// generated map function.
    pub fn matches(&self, id: &str) -> bool {
        if self.prefixes.is_empty() {
            return true;
        }
        let any = self.prefixes.iter().any(|p| id.starts_with(p.as_str()));
        match self.mode {
            FilterMode::Matching => any,
            FilterMode::NotMatching => !any,
        }
    }

    /// JavaScript map function emitting `meta.id` for every selected document.
    pub fn map_source(&self) -> String {
        if self.prefixes.is_empty() {
            return "function (doc, meta) { emit(meta.id, null); }".to_string();
        }

        let condition = match self.mode {
            FilterMode::Matching => self
                .prefixes
                .iter()
                .map(|p| format!("meta.id.indexOf({}) === 0", js_string(p)))
                .collect::<Vec<_>>()
                .join(" || "),
            FilterMode::NotMatching => self
                .prefixes
                .iter()
                .map(|p| format!("meta.id.indexOf({}) !== 0", js_string(p)))
                .collect::<Vec<_>>()
                .join(" && "),
        };

        format!(
            "function (doc, meta) {{ if ({}) {{ emit(meta.id, null); }} }}",
            condition
        )
    }

    pub fn view_id(&self) -> String {
        view_id_for_source(&self.map_source())
    }

    pub fn view_definition(&self) -> ViewDefinition {
        ViewDefinition::new(self.map_source())
    }
}

/// `"view_" + hex(sha1(source))`.
pub fn view_id_for_source(source: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(source.as_bytes());
    format!("{}{}", VIEW_ID_PREFIX, hex::encode(hasher.finalize()))
}

/// Shorthand for `FilterSpec::new(prefixes, mode).view_id()`.
pub fn filter_view_id<I, S>(prefixes: I, mode: FilterMode) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    FilterSpec::new(prefixes, mode).view_id()
}

fn js_string(s: &str) -> String {
    // A JSON string literal is a valid JavaScript string literal.
    serde_json::Value::String(s.to_string()).to_string()
}
