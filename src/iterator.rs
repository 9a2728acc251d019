//! Cursor-based view iteration with bounded per-item concurrency.
//!
//! [`walk`] pages through a view in ascending key order. Each request asks
//! for `page_size + 1` rows starting at the cursor; when the extra row
//! comes back it is held back and its key and id become the next cursor,
//! so it is the first row of the following page. The id goes out as
//! `startkey_docid`, which keeps views with repeated keys moving forward.
//! A short page ends the walk.
//!
//! ```text
//! page 1: [r1 .. rp] + r(p+1)   → cursor = (key, id) of r(p+1)
//! page 2: [r(p+1) .. r2p] + ... → ...
//! page n: [.. ≤ p rows]         → cursor = None, done
//! ```
//!
//! Holding back the lookahead row (instead of resuming after the last
//! processed key) keeps the walk correct when the handler deletes the rows
//! it visits.
//!
//! Rows of one page are handed to `per_item` with at most `concurrency`
//! handlers in flight. Pages are strictly sequential. The first handler
//! error stops the walk and is returned once; handlers still in flight at
//! that moment are dropped and their outcomes discarded.

use std::future::Future;

use anyhow::{bail, Context, Result};
use cb_admin_core::models::ViewRow;
use cb_admin_core::store::{Freshness, ViewQuery};
use futures::stream::{self, TryStreamExt};
use serde_json::Value;

use crate::connection::Connection;

/// Upper bound for string keys; sorts after any id in practice.
pub const END_KEY_SENTINEL: &str = "\u{efff}";

/// First row of the next page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageStart {
    pub key: Value,
    pub doc_id: String,
}

/// Where the next page starts. `None` once the view is exhausted.
pub type Cursor = Option<PageStart>;

/// Which view to walk and how.
#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub design_document: String,
    pub view: String,
    pub page_size: usize,
    pub concurrency: usize,
}

/// Totals of a finished walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub pages: u64,
    pub rows: u64,
}

/// Split a fetched page into the rows to process and the next cursor.
pub fn split_page(mut rows: Vec<ViewRow>, page_size: usize) -> (Vec<ViewRow>, Cursor) {
    if rows.len() > page_size {
        let lookahead = rows.swap_remove(page_size);
        rows.truncate(page_size);
        let start = PageStart {
            key: lookahead.key,
            doc_id: lookahead.id,
        };
        (rows, Some(start))
    } else {
        (rows, None)
    }
}

/// Walk every row of `opts.view`, page by page.
pub async fn walk<F, Fut>(conn: &Connection, opts: &WalkOptions, per_item: F) -> Result<WalkStats>
where
    F: Fn(ViewRow) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    validate(opts.page_size, opts.concurrency)?;

    let mut stats = WalkStats::default();
    let mut cursor: Cursor = None;

    loop {
        let first = cursor.is_none();
        let mut query = ViewQuery::new()
            .range(
                cursor.as_ref().map(|start| start.key.clone()),
                Some(Value::String(END_KEY_SENTINEL.to_string())),
            )
            .limit(opts.page_size + 1)
            .freshness(if first {
                Freshness::UpdateBefore
            } else {
                Freshness::Ok
            });
        if let Some(start) = &cursor {
            query = query.start_key_doc_id(start.doc_id.clone());
        }

        let rows = conn
            .query_view(&opts.design_document, &opts.view, &query)
            .await
            .with_context(|| {
                format!(
                    "failed to query [{}/{}]",
                    opts.design_document, opts.view
                )
            })?;

        let (page, next) = split_page(rows, opts.page_size);
        stats.pages += 1;
        stats.rows += page.len() as u64;
        tracing::debug!(
            view = %opts.view,
            page = stats.pages,
            rows = page.len(),
            more = next.is_some(),
            "page fetched"
        );

        dispatch(page, opts.concurrency, &per_item).await?;

        match next {
            Some(start) if cursor.as_ref() == Some(&start) => bail!(
                "view [{}/{}] did not advance past key {} (id {})",
                opts.design_document,
                opts.view,
                start.key,
                start.doc_id
            ),
            Some(start) => cursor = Some(start),
            None => break,
        }
    }

    Ok(stats)
}

/// Fetch the whole view in one query and fan its rows out.
///
/// Only suitable when the result set comfortably fits in memory.
pub async fn walk_all<F, Fut>(
    conn: &Connection,
    design_document: &str,
    view: &str,
    concurrency: usize,
    per_item: F,
) -> Result<WalkStats>
where
    F: Fn(ViewRow) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    validate(1, concurrency)?;

    let query = ViewQuery::new().freshness(Freshness::UpdateBefore);
    let rows = conn
        .query_view(design_document, view, &query)
        .await
        .with_context(|| format!("failed to query [{}/{}]", design_document, view))?;

    let stats = WalkStats {
        pages: 1,
        rows: rows.len() as u64,
    };
    dispatch(rows, concurrency, &per_item).await?;
    Ok(stats)
}

async fn dispatch<F, Fut>(rows: Vec<ViewRow>, concurrency: usize, per_item: &F) -> Result<()>
where
    F: Fn(ViewRow) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    stream::iter(rows.into_iter().map(Ok::<_, anyhow::Error>))
        .try_for_each_concurrent(concurrency, per_item)
        .await
}

fn validate(page_size: usize, concurrency: usize) -> Result<()> {
    if page_size == 0 {
        bail!("page size must be >= 1");
    }
    if concurrency == 0 {
        bail!("concurrency must be >= 1");
    }
    Ok(())
}
