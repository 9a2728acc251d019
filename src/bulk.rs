//! Bulk document operations over an admin filter view.
//!
//! A bulk run selects documents by key prefix, ensures the matching admin
//! filter view exists on the source bucket, then walks it with
//! [`iterator::walk`](crate::iterator::walk), applying one action per id:
//!
//! | Mode | Action |
//! |------|--------|
//! | `copy` | fetch from source, insert (or upsert with overwrite) into destination |
//! | `move` | `copy`, then remove from source once the destination write succeeded |
//! | `delete` | remove from source |
//! | `dump` | fetch from source and write one JSON line per document |
//!
//! A key that vanished between the view read and the fetch (or delete) is
//! logged and counted as skipped. Any other error is logged and aborts the
//! walk.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use cb_admin_core::admin_view::FilterSpec;
use cb_admin_core::models::ViewRow;
use serde_json::Value;

use crate::admin_views::{create_filter_view, remove_filter_view};
use crate::connection::Connection;
use crate::iterator::{walk, walk_all, WalkOptions};
use crate::progress::{BulkProgressEvent, BulkProgressReporter};
use crate::retry::RemoteError;

/// What to do with each selected document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkMode {
    Copy { overwrite: bool },
    Move { overwrite: bool },
    Delete,
}

impl BulkMode {
    pub fn label(&self) -> &'static str {
        match self {
            BulkMode::Copy { .. } => "copy",
            BulkMode::Move { .. } => "move",
            BulkMode::Delete => "delete",
        }
    }

    fn needs_destination(&self) -> bool {
        !matches!(self, BulkMode::Delete)
    }
}

#[derive(Debug, Clone)]
pub struct BulkOptions {
    pub filter: FilterSpec,
    pub admin_design_document: String,
    pub page_size: usize,
    pub concurrency: usize,
    pub progress_every: u64,
    /// Remove the filter view once the run succeeded.
    pub cleanup_view: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkSummary {
    pub view_id: String,
    pub processed: u64,
    pub skipped: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    Skipped,
}

/// Counts processed items and reports at a fixed cadence.
struct ProgressTracker<'a> {
    operation: &'static str,
    every: u64,
    processed: AtomicU64,
    skipped: AtomicU64,
    started: Instant,
    last_report: Mutex<Instant>,
    reporter: &'a dyn BulkProgressReporter,
}

impl<'a> ProgressTracker<'a> {
    fn new(operation: &'static str, every: u64, reporter: &'a dyn BulkProgressReporter) -> Self {
        let now = Instant::now();
        Self {
            operation,
            every: every.max(1),
            processed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            started: now,
            last_report: Mutex::new(now),
            reporter,
        }
    }

    fn record(&self, outcome: Outcome) {
        if outcome == Outcome::Skipped {
            self.skipped.fetch_add(1, Ordering::SeqCst);
        }
        let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        if processed % self.every != 0 {
            return;
        }

        let elapsed = {
            let mut last = self.last_report.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            let elapsed = now.duration_since(*last);
            *last = now;
            elapsed
        };
        let skipped = self.skipped.load(Ordering::SeqCst);
        tracing::info!(
            operation = self.operation,
            processed,
            skipped,
            elapsed_ms = elapsed.as_millis() as u64,
            "progress"
        );
        self.reporter.report(BulkProgressEvent::Processed {
            operation: self.operation.to_string(),
            processed,
            skipped,
            elapsed,
        });
    }

    fn finish(&self) -> (u64, u64, Duration) {
        let processed = self.processed.load(Ordering::SeqCst);
        let skipped = self.skipped.load(Ordering::SeqCst);
        let total = self.started.elapsed();
        self.reporter.report(BulkProgressEvent::Finished {
            operation: self.operation.to_string(),
            processed,
            skipped,
            total,
        });
        (processed, skipped, total)
    }
}

/// Run a copy, move, or delete over every document selected by
/// `opts.filter`.
pub async fn run_bulk(
    src: &Connection,
    dst: Option<&Connection>,
    mode: BulkMode,
    opts: &BulkOptions,
    reporter: &dyn BulkProgressReporter,
) -> Result<BulkSummary> {
    if mode.needs_destination() && dst.is_none() {
        bail!("{} requires a destination bucket", mode.label());
    }

    let view_id = create_filter_view(src, &opts.admin_design_document, &opts.filter)
        .await
        .context("failed to prepare filter view")?;

    let tracker = ProgressTracker::new(mode.label(), opts.progress_every, reporter);
    let walk_opts = WalkOptions {
        design_document: opts.admin_design_document.clone(),
        view: view_id.clone(),
        page_size: opts.page_size,
        concurrency: opts.concurrency,
    };

    tracing::info!(
        operation = mode.label(),
        source = src.name(),
        destination = dst.map(|d| d.name()),
        view = %view_id,
        "bulk run started"
    );

    walk(src, &walk_opts, |row| {
        let tracker = &tracker;
        async move {
            let outcome = process_item(src, dst, mode, &row.id).await?;
            tracker.record(outcome);
            Ok(())
        }
    })
    .await?;

    let (processed, skipped, elapsed) = tracker.finish();

    if opts.cleanup_view {
        remove_filter_view(src, &opts.admin_design_document, &opts.filter)
            .await
            .context("failed to remove filter view")?;
    }

    Ok(BulkSummary {
        view_id,
        processed,
        skipped,
        elapsed,
    })
}

async fn process_item(
    src: &Connection,
    dst: Option<&Connection>,
    mode: BulkMode,
    id: &str,
) -> Result<Outcome> {
    let (overwrite, remove_source) = match mode {
        BulkMode::Delete => return delete_item(src, id).await,
        BulkMode::Copy { overwrite } => (overwrite, false),
        BulkMode::Move { overwrite } => (overwrite, true),
    };
    let Some(dst) = dst else {
        bail!("{} requires a destination bucket", mode.label());
    };

    let value = match src.get(id).await {
        Ok(value) => value,
        Err(e) if e.is_not_found() => {
            tracing::warn!(id, "key not found on source, skipping");
            return Ok(Outcome::Skipped);
        }
        Err(e) => return Err(fail(mode, id, "fetch", e)),
    };

    let written = if overwrite {
        dst.upsert(id, &value).await
    } else {
        dst.insert(id, &value).await
    };
    written.map_err(|e| fail(mode, id, "write", e))?;

    if remove_source {
        src.remove(id)
            .await
            .map_err(|e| fail(mode, id, "remove", e))?;
    }

    tracing::debug!(operation = mode.label(), id, "done");
    Ok(Outcome::Done)
}

async fn delete_item(src: &Connection, id: &str) -> Result<Outcome> {
    match src.remove(id).await {
        Ok(()) => Ok(Outcome::Done),
        Err(e) if e.is_not_found() => {
            tracing::warn!(id, "key not found on source, skipping");
            Ok(Outcome::Skipped)
        }
        Err(e) => Err(fail(BulkMode::Delete, id, "remove", e)),
    }
}

fn fail(mode: BulkMode, id: &str, step: &str, err: RemoteError) -> anyhow::Error {
    tracing::error!(operation = mode.label(), id, step, error = %err, "item failed");
    anyhow::Error::new(err).context(format!("{} [{}]: {} failed", mode.label(), id, step))
}

/// Write every selected document to `out` as one `{"id":..,"value":..}`
/// JSON line. Fetches run with up to `opts.concurrency` in flight, so line
/// order within a page is unspecified.
///
/// With `single_query` the filter view is read in one request
/// ([`walk_all`]) instead of page by page.
pub async fn run_dump<W: Write>(
    src: &Connection,
    opts: &BulkOptions,
    single_query: bool,
    out: W,
    reporter: &dyn BulkProgressReporter,
) -> Result<BulkSummary> {
    let view_id = create_filter_view(src, &opts.admin_design_document, &opts.filter)
        .await
        .context("failed to prepare filter view")?;

    let tracker = ProgressTracker::new("dump", opts.progress_every, reporter);
    let out = Mutex::new(out);
    let walk_opts = WalkOptions {
        design_document: opts.admin_design_document.clone(),
        view: view_id.clone(),
        page_size: opts.page_size,
        concurrency: opts.concurrency,
    };

    let per_item = |row: ViewRow| {
        let tracker = &tracker;
        let out = &out;
        async move {
            let value = match src.get(&row.id).await {
                Ok(value) => value,
                Err(e) if e.is_not_found() => {
                    tracing::warn!(id = %row.id, "key not found on source, skipping");
                    tracker.record(Outcome::Skipped);
                    return Ok(());
                }
                Err(e) => return Err(fail_dump(&row.id, e)),
            };
            let line = serde_json::to_string(&serde_json::json!({ "id": row.id, "value": value }))?;
            {
                let mut out = out.lock().unwrap_or_else(|e| e.into_inner());
                writeln!(out, "{}", line)?;
            }
            tracker.record(Outcome::Done);
            Ok::<(), anyhow::Error>(())
        }
    };
    if single_query {
        walk_all(
            src,
            &opts.admin_design_document,
            &view_id,
            opts.concurrency,
            per_item,
        )
        .await?;
    } else {
        walk(src, &walk_opts, per_item).await?;
    }

    out.into_inner()
        .unwrap_or_else(|e| e.into_inner())
        .flush()?;
    let (processed, skipped, elapsed) = tracker.finish();

    if opts.cleanup_view {
        remove_filter_view(src, &opts.admin_design_document, &opts.filter)
            .await
            .context("failed to remove filter view")?;
    }

    Ok(BulkSummary {
        view_id,
        processed,
        skipped,
        elapsed,
    })
}

fn fail_dump(id: &str, err: RemoteError) -> anyhow::Error {
    tracing::error!(operation = "dump", id, error = %err, "item failed");
    anyhow::Error::new(err).context(format!("dump [{}]: fetch failed", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::retry::RetryPolicy;
    use cb_admin_core::admin_view::FilterMode;
    use cb_admin_core::store::memory::{InMemoryBucket, Op};
    use cb_admin_core::store::ErrorCode;
    use serde_json::json;
    use std::sync::Arc;

    fn parse_dump_line(line: &str) -> (String, Value) {
        let mut obj: serde_json::Map<String, Value> = serde_json::from_str(line).unwrap();
        let id = obj["id"].as_str().unwrap().to_string();
        (id, obj.remove("value").unwrap_or(Value::Null))
    }

    struct Recorder(Mutex<Vec<BulkProgressEvent>>);

    impl BulkProgressReporter for Recorder {
        fn report(&self, event: BulkProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn opts(prefixes: &[&str], mode: FilterMode) -> BulkOptions {
        BulkOptions {
            filter: FilterSpec::new(prefixes.iter().copied(), mode),
            admin_design_document: "cb_admin".to_string(),
            page_size: 2,
            concurrency: 1,
            progress_every: 2,
            cleanup_view: false,
        }
    }

    fn source(docs: &[(&str, Value)], filter: &FilterSpec) -> Arc<InMemoryBucket> {
        let bucket = InMemoryBucket::new("src")
            .with_documents(docs.iter().map(|(k, v)| (k.to_string(), v.clone())));
        bucket.register_filter(filter.clone());
        Arc::new(bucket)
    }

    fn conn(bucket: &Arc<InMemoryBucket>) -> Connection {
        Connection::new(bucket.clone(), RetryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn move_skips_missing_item_and_moves_the_rest() {
        let o = opts(&["item::"], FilterMode::Matching);
        let src_bucket = source(
            &[
                ("item::1", json!({ "n": 1 })),
                ("item::2", json!({ "n": 2 })),
                ("item::3", json!({ "n": 3 })),
            ],
            &o.filter,
        );
        src_bucket.fail_key(Op::Get, "item::2", ErrorCode::KeyNotFound);
        let dst_bucket = Arc::new(InMemoryBucket::new("dst"));

        let summary = run_bulk(
            &conn(&src_bucket),
            Some(&conn(&dst_bucket)),
            BulkMode::Move { overwrite: false },
            &o,
            &NoProgress,
        )
        .await
        .unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.skipped, 1);
        assert_eq!(dst_bucket.document("item::1"), Some(json!({ "n": 1 })));
        assert_eq!(dst_bucket.document("item::3"), Some(json!({ "n": 3 })));
        assert!(dst_bucket.document("item::2").is_none());
        assert_eq!(src_bucket.document_keys(), vec!["item::2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn copy_respects_filter_and_keeps_source() {
        let o = opts(&["user::"], FilterMode::Matching);
        let src_bucket = source(
            &[
                ("order::1", json!(1)),
                ("user::1", json!(2)),
                ("user::2", json!(3)),
            ],
            &o.filter,
        );
        let dst_bucket = Arc::new(InMemoryBucket::new("dst"));

        let summary = run_bulk(
            &conn(&src_bucket),
            Some(&conn(&dst_bucket)),
            BulkMode::Copy { overwrite: false },
            &o,
            &NoProgress,
        )
        .await
        .unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(dst_bucket.document_keys(), vec!["user::1", "user::2"]);
        assert_eq!(src_bucket.document_keys().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn copy_without_overwrite_aborts_on_existing_key() {
        let o = opts(&[], FilterMode::Matching);
        let src_bucket = source(&[("a", json!(1)), ("b", json!(2)), ("c", json!(3))], &o.filter);
        let dst_bucket = Arc::new(InMemoryBucket::new("dst").with_documents([("b", json!("old"))]));

        let err = run_bulk(
            &conn(&src_bucket),
            Some(&conn(&dst_bucket)),
            BulkMode::Copy { overwrite: false },
            &o,
            &NoProgress,
        )
        .await
        .unwrap_err();

        assert!(format!("{:#}", err).contains("copy [b]: write failed"));
        assert_eq!(dst_bucket.document("b"), Some(json!("old")));
        assert!(dst_bucket.document("c").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn copy_with_overwrite_replaces() {
        let o = opts(&[], FilterMode::Matching);
        let src_bucket = source(&[("a", json!(1)), ("b", json!(2))], &o.filter);
        let dst_bucket = Arc::new(InMemoryBucket::new("dst").with_documents([("b", json!("old"))]));

        run_bulk(
            &conn(&src_bucket),
            Some(&conn(&dst_bucket)),
            BulkMode::Copy { overwrite: true },
            &o,
            &NoProgress,
        )
        .await
        .unwrap();

        assert_eq!(dst_bucket.document("b"), Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_not_matching_and_cleanup_view() {
        let mut o = opts(&["keep::"], FilterMode::NotMatching);
        o.cleanup_view = true;
        let src_bucket = source(
            &[
                ("keep::1", json!(1)),
                ("tmp::1", json!(2)),
                ("tmp::2", json!(3)),
                ("zzz", json!(4)),
            ],
            &o.filter,
        );

        let summary = run_bulk(&conn(&src_bucket), None, BulkMode::Delete, &o, &NoProgress)
            .await
            .unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(src_bucket.document_keys(), vec!["keep::1"]);
        assert!(src_bucket.design_document("cb_admin").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_per_item() {
        let o = opts(&[], FilterMode::Matching);
        let src_bucket = source(&[("a", json!(1)), ("b", json!(2))], &o.filter);
        src_bucket.fail_next(Op::Remove, ErrorCode::Busy, 3);

        let summary = run_bulk(&conn(&src_bucket), None, BulkMode::Delete, &o, &NoProgress)
            .await
            .unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(src_bucket.calls(Op::Remove), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn copy_requires_destination() {
        let o = opts(&[], FilterMode::Matching);
        let src_bucket = source(&[("a", json!(1))], &o.filter);
        let err = run_bulk(
            &conn(&src_bucket),
            None,
            BulkMode::Copy { overwrite: false },
            &o,
            &NoProgress,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("requires a destination"));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_reported_at_cadence() {
        let o = opts(&[], FilterMode::Matching);
        let docs: Vec<(String, Value)> = (0..5).map(|i| (format!("k{}", i), json!(i))).collect();
        let refs: Vec<(&str, Value)> = docs.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
        let src_bucket = source(&refs, &o.filter);
        let recorder = Recorder(Mutex::new(Vec::new()));

        run_bulk(&conn(&src_bucket), None, BulkMode::Delete, &o, &recorder)
            .await
            .unwrap();

        let events = recorder.0.into_inner().unwrap();
        let processed: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                BulkProgressEvent::Processed { processed, .. } => Some(*processed),
                _ => None,
            })
            .collect();
        assert_eq!(processed, vec![2, 4]);
        assert!(matches!(
            events.last(),
            Some(BulkProgressEvent::Finished { processed: 5, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dump_writes_json_lines() {
        let mut o = opts(&["user::"], FilterMode::Matching);
        o.concurrency = 10;
        let src_bucket = source(
            &[
                ("user::1", json!({ "name": "ann" })),
                ("user::2", json!({ "name": "bob" })),
                ("other", json!(0)),
            ],
            &o.filter,
        );

        let mut buf = Vec::new();
        let summary = run_dump(&conn(&src_bucket), &o, false, &mut buf, &NoProgress)
            .await
            .unwrap();
        assert_eq!(summary.processed, 2);

        let text = String::from_utf8(buf).unwrap();
        let mut parsed: Vec<(String, Value)> =
            text.lines().map(parse_dump_line).collect();
        parsed.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            parsed,
            vec![
                ("user::1".to_string(), json!({ "name": "ann" })),
                ("user::2".to_string(), json!({ "name": "bob" })),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn single_query_dump_skips_paging() {
        let o = opts(&["user::"], FilterMode::Matching);
        let docs = [
            ("user::1", json!(1)),
            ("user::2", json!(2)),
            ("user::3", json!(3)),
        ];
        let paged = source(&docs, &o.filter);
        let single = source(&docs, &o.filter);

        let mut buf = Vec::new();
        run_dump(&conn(&paged), &o, false, &mut buf, &NoProgress)
            .await
            .unwrap();
        let mut single_buf = Vec::new();
        let summary = run_dump(&conn(&single), &o, true, &mut single_buf, &NoProgress)
            .await
            .unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(String::from_utf8(single_buf).unwrap().lines().count(), 3);
        assert_eq!(
            paged.calls(Op::QueryView) - single.calls(Op::QueryView),
            1,
            "two pages against one query"
        );
    }
}
