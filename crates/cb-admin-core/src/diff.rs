//! Reconciliation engine: compare two design-document sets.
//!
//! [`compare`] walks a source and a destination [`DesignDocumentSet`] and
//! produces a [`DiffReport`] made of two parts:
//!
//! - `diff`: the apply-set: every source design document that does not
//!   match the destination, copied whole and ready to be installed.
//! - `checked`: a per-document report of everything that was inspected.
//!
//! # Status codes
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `ok` | full match |
//! | `new` | exists only on the source |
//! | `update` | source and destination differ |
//! | `dst-only` | exists only on the destination, never part of the diff |
//! | `delete` | (views only) exists only on the destination document |
//!
//! A `delete` view marker is informational. Installing the apply-set writes
//! the whole source document; the engine never issues a separate view
//! removal.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::models::{DesignDocument, DesignDocumentSet, ViewDefinition};

/// Aggregate status of one design document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocStatus {
    Ok,
    New,
    Update,
    DstOnly,
}

impl DocStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocStatus::Ok => "ok",
            DocStatus::New => "new",
            DocStatus::Update => "update",
            DocStatus::DstOnly => "dst-only",
        }
    }
}

/// Status of one view within a design document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViewStatus {
    Ok,
    New,
    Update,
    Delete,
}

impl ViewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewStatus::Ok => "ok",
            ViewStatus::New => "new",
            ViewStatus::Update => "update",
            ViewStatus::Delete => "delete",
        }
    }
}

/// Report entry for a top-level design document field other than `views`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamCheck {
    pub status: ViewStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewCheck {
    pub status: ViewStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<ViewDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst: Option<ViewDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckEntry {
    pub status: DocStatus,
    pub params: BTreeMap<String, ParamCheck>,
    pub views: BTreeMap<String, ViewCheck>,
}

impl CheckEntry {
    fn with_status(status: DocStatus) -> Self {
        Self {
            status,
            params: BTreeMap::new(),
            views: BTreeMap::new(),
        }
    }
}

/// Result of [`compare`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffReport {
    pub diff: DesignDocumentSet,
    pub checked: BTreeMap<String, CheckEntry>,
}

impl DiffReport {
    /// `true` when nothing needs to be installed on the destination.
    pub fn is_empty(&self) -> bool {
        self.diff.is_empty()
    }

    /// Names of the design documents in the apply-set, in install order.
    pub fn names_to_apply(&self) -> Vec<&str> {
        self.diff.keys().map(String::as_str).collect()
    }
}

/// Name filters applied to both sides before comparing.
///
/// An empty set means "no filter".
#[derive(Debug, Clone, Default)]
pub struct CompareOptions {
    pub include: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
}

impl CompareOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, name: impl Into<String>) -> Self {
        self.include.insert(name.into());
        self
    }

    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.exclude.insert(name.into());
        self
    }

    /// Whether a design document named `name` takes part in the comparison.
    pub fn accepts(&self, name: &str) -> bool {
        if !self.include.is_empty() && !self.include.contains(name) {
            return false;
        }
        if !self.exclude.is_empty() && self.exclude.contains(name) {
            return false;
        }
        true
    }
}

/// Compare `src` against `dst` and build the report and apply-set.
///
/// Pure: neither input is modified, and the result does not depend on the
/// iteration order of either side.
pub fn compare(
    src: &DesignDocumentSet,
    dst: &DesignDocumentSet,
    opts: &CompareOptions,
) -> DiffReport {
    let mut report = DiffReport::default();

    for name in dst.keys() {
        if opts.accepts(name) && !src.contains_key(name) {
            report
                .checked
                .insert(name.clone(), CheckEntry::with_status(DocStatus::DstOnly));
        }
    }

    for (name, src_doc) in src {
        if !opts.accepts(name) {
            continue;
        }

        let entry = match dst.get(name) {
            None => CheckEntry::with_status(DocStatus::New),
            Some(dst_doc) => compare_documents(src_doc, dst_doc),
        };

        if matches!(entry.status, DocStatus::New | DocStatus::Update) {
            report.diff.insert(name.clone(), src_doc.clone());
        }
        report.checked.insert(name.clone(), entry);
    }

    report
}

fn compare_documents(src: &DesignDocument, dst: &DesignDocument) -> CheckEntry {
    let mut entry = CheckEntry::with_status(DocStatus::Ok);

    for field in src.extra.keys() {
        if !dst.extra.contains_key(field) {
            entry.status = DocStatus::Update;
            entry.params.insert(
                field.clone(),
                ParamCheck {
                    status: ViewStatus::New,
                },
            );
        }
    }

    for (view_name, src_view) in &src.views {
        let check = match dst.views.get(view_name) {
            None => ViewCheck {
                status: ViewStatus::New,
                src: Some(src_view.clone()),
                dst: None,
            },
            Some(dst_view) => {
                let status = if src_view.is_satisfied_by(dst_view) {
                    ViewStatus::Ok
                } else {
                    ViewStatus::Update
                };
                ViewCheck {
                    status,
                    src: Some(src_view.clone()),
                    dst: Some(dst_view.clone()),
                }
            }
        };
        if check.status != ViewStatus::Ok {
            entry.status = DocStatus::Update;
        }
        entry.views.insert(view_name.clone(), check);
    }

    for (view_name, dst_view) in &dst.views {
        if !src.views.contains_key(view_name) {
            entry.status = DocStatus::Update;
            entry.views.insert(
                view_name.clone(),
                ViewCheck {
                    status: ViewStatus::Delete,
                    src: None,
                    dst: Some(dst_view.clone()),
                },
            );
        }
    }

    entry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(views: &[(&str, &str)]) -> DesignDocument {
        views.iter().fold(DesignDocument::new(), |d, (name, map)| {
            d.with_view(*name, ViewDefinition::new(*map))
        })
    }

    fn set(docs: &[(&str, DesignDocument)]) -> DesignDocumentSet {
        docs.iter()
            .map(|(name, d)| (name.to_string(), d.clone()))
            .collect()
    }

    fn assert_totality(report: &DiffReport) {
        for name in report.diff.keys() {
            let status = report.checked[name].status;
            assert!(
                matches!(status, DocStatus::New | DocStatus::Update),
                "{} is in diff with status {:?}",
                name,
                status
            );
        }
        for (name, entry) in &report.checked {
            if matches!(entry.status, DocStatus::Ok | DocStatus::DstOnly) {
                assert!(!report.diff.contains_key(name));
            }
        }
    }

    #[test]
    fn new_document_goes_to_diff() {
        let src = set(&[("A", doc(&[("v1", "map1")]))]);
        let dst = DesignDocumentSet::new();

        let report = compare(&src, &dst, &CompareOptions::new());

        assert_eq!(report.checked["A"].status, DocStatus::New);
        assert_eq!(report.diff["A"].views["v1"].map, "map1");
        assert_totality(&report);
    }

    #[test]
    fn identical_document_is_ok() {
        let src = set(&[("A", doc(&[("v1", "map1")]))]);
        let report = compare(&src, &src.clone(), &CompareOptions::new());

        assert_eq!(report.checked["A"].status, DocStatus::Ok);
        assert_eq!(report.checked["A"].views["v1"].status, ViewStatus::Ok);
        assert!(report.diff.get("A").is_none());
        assert!(report.is_empty());
    }

    #[test]
    fn compare_with_itself_is_all_ok() {
        let x = set(&[
            ("A", doc(&[("v1", "m1"), ("v2", "m2")])),
            ("B", doc(&[("v1", "m3")])),
            ("C", DesignDocument::new()),
        ]);
        let report = compare(&x, &x, &CompareOptions::new());
        assert!(report.diff.is_empty());
        assert!(report
            .checked
            .values()
            .all(|entry| entry.status == DocStatus::Ok));
    }

    #[test]
    fn changed_map_text_is_update() {
        let src = set(&[("A", doc(&[("v1", "map1"), ("v2", "same")]))]);
        let dst = set(&[("A", doc(&[("v1", "map-old"), ("v2", "same")]))]);

        let report = compare(&src, &dst, &CompareOptions::new());

        assert_eq!(report.checked["A"].status, DocStatus::Update);
        assert_eq!(report.checked["A"].views["v1"].status, ViewStatus::Update);
        assert_eq!(report.checked["A"].views["v2"].status, ViewStatus::Ok);
        assert_eq!(report.diff["A"], src["A"]);
        assert_totality(&report);
    }

    #[test]
    fn reduce_missing_on_destination_is_update() {
        let src = set(&[(
            "A",
            DesignDocument::new().with_view("v1", ViewDefinition::new("m").with_reduce("_count")),
        )]);
        let dst = set(&[("A", doc(&[("v1", "m")]))]);

        let report = compare(&src, &dst, &CompareOptions::new());
        assert_eq!(report.checked["A"].views["v1"].status, ViewStatus::Update);
    }

    #[test]
    fn new_view_flips_document_to_update() {
        let src = set(&[("A", doc(&[("v1", "m1"), ("v2", "m2")]))]);
        let dst = set(&[("A", doc(&[("v1", "m1")]))]);

        let report = compare(&src, &dst, &CompareOptions::new());
        assert_eq!(report.checked["A"].status, DocStatus::Update);
        assert_eq!(report.checked["A"].views["v2"].status, ViewStatus::New);
        assert!(report.diff.contains_key("A"));
    }

    #[test]
    fn destination_only_view_is_marked_delete() {
        let src = set(&[("A", doc(&[("v1", "m1")]))]);
        let dst = set(&[("A", doc(&[("v1", "m1"), ("old", "m0")]))]);

        let report = compare(&src, &dst, &CompareOptions::new());
        let entry = &report.checked["A"];
        assert_eq!(entry.status, DocStatus::Update);
        assert_eq!(entry.views["old"].status, ViewStatus::Delete);
        assert!(entry.views["old"].src.is_none());
        // The apply-set carries the source document as-is.
        assert_eq!(report.diff["A"], src["A"]);
        assert!(!report.diff["A"].views.contains_key("old"));
    }

    #[test]
    fn missing_top_level_field_is_reported_as_param() {
        let mut src_doc = doc(&[("v1", "m1")]);
        src_doc
            .extra
            .insert("spatial".to_string(), serde_json::json!({}));
        let src = set(&[("A", src_doc)]);
        let dst = set(&[("A", doc(&[("v1", "m1")]))]);

        let report = compare(&src, &dst, &CompareOptions::new());
        assert_eq!(report.checked["A"].status, DocStatus::Update);
        assert_eq!(report.checked["A"].params["spatial"].status, ViewStatus::New);
    }

    #[test]
    fn destination_only_document_never_in_diff() {
        let src = DesignDocumentSet::new();
        let dst = set(&[("Z", doc(&[("v1", "m1")]))]);

        let report = compare(&src, &dst, &CompareOptions::new());
        assert_eq!(report.checked["Z"].status, DocStatus::DstOnly);
        assert!(report.diff.is_empty());
    }

    #[test]
    fn include_filter_limits_entries() {
        let src = set(&[
            ("A", doc(&[("v1", "m1")])),
            ("B", doc(&[("v1", "m1")])),
        ]);
        let dst = set(&[("C", doc(&[("v1", "m1")]))]);

        let report = compare(&src, &dst, &CompareOptions::new().include("A"));
        assert_eq!(report.checked.keys().collect::<Vec<_>>(), vec!["A"]);
        assert_eq!(report.diff.keys().collect::<Vec<_>>(), vec!["A"]);
    }

    #[test]
    fn exclude_filter_drops_entries_on_both_sides() {
        let src = set(&[("A", doc(&[("v1", "m1")])), ("B", doc(&[("v1", "m1")]))]);
        let dst = set(&[("B", doc(&[("v1", "changed")])), ("C", DesignDocument::new())]);

        let opts = CompareOptions::new().exclude("B").exclude("C");
        let report = compare(&src, &dst, &opts);
        assert_eq!(report.checked.keys().collect::<Vec<_>>(), vec!["A"]);
    }

    #[test]
    fn status_serializes_kebab_case() {
        let json = serde_json::to_string(&DocStatus::DstOnly).unwrap();
        assert_eq!(json, "\"dst-only\"");
        assert_eq!(DocStatus::DstOnly.as_str(), "dst-only");
    }
}
