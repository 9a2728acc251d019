//! `cb-admin dd` workflows: export, diff, and upgrade of design documents.
//!
//! The source side of a diff is either a live bucket or a file written by
//! `dd export`; the destination is always a live bucket. An upgrade
//! installs every document of the apply-set one after the other through
//! the staging protocol.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cb_admin_core::diff::{compare, CompareOptions, DiffReport};
use cb_admin_core::models::DesignDocumentSet;
use chrono::{DateTime, Utc};

use crate::connection::Connection;
use crate::ddocs::{export_design_documents, import_design_documents};
use crate::report::{write_report, write_upgrade_summary};

/// Where the source design documents come from.
pub enum DesignSource<'a> {
    File(&'a Path),
    Bucket(&'a Connection),
}

impl DesignSource<'_> {
    pub async fn load(&self) -> Result<DesignDocumentSet> {
        match self {
            DesignSource::File(path) => import_design_documents(path),
            DesignSource::Bucket(conn) => conn
                .get_design_documents()
                .await
                .with_context(|| format!("failed to read design documents of [{}]", conn.name())),
        }
    }
}

/// `ddocs-<bucket>-<UTC timestamp>.json`
pub fn default_export_path(bucket: &str, now: DateTime<Utc>) -> PathBuf {
    PathBuf::from(format!(
        "ddocs-{}-{}.json",
        bucket,
        now.format("%Y%m%dT%H%M%SZ")
    ))
}

/// Snapshot every design document of `conn` into `file` (or the default
/// file name). Returns the path written and the number of documents.
pub async fn run_export(conn: &Connection, file: Option<&Path>) -> Result<(PathBuf, usize)> {
    let set = conn
        .get_design_documents()
        .await
        .with_context(|| format!("failed to read design documents of [{}]", conn.name()))?;

    let path = match file {
        Some(p) => p.to_path_buf(),
        None => default_export_path(conn.name(), Utc::now()),
    };
    export_design_documents(&path, &set)?;
    tracing::info!(path = %path.display(), count = set.len(), "design documents exported");
    Ok((path, set.len()))
}

/// Load both sides and compare them.
pub async fn run_diff(
    src: &DesignSource<'_>,
    dst: &Connection,
    opts: &CompareOptions,
) -> Result<DiffReport> {
    let src_set = src.load().await?;
    let dst_set = dst
        .get_design_documents()
        .await
        .with_context(|| format!("failed to read design documents of [{}]", dst.name()))?;

    let report = compare(&src_set, &dst_set, opts);
    tracing::info!(
        checked = report.checked.len(),
        to_apply = report.diff.len(),
        "comparison done"
    );
    Ok(report)
}

/// Install the apply-set of `report` on `dst`, one document at a time.
///
/// Stops at the first failure. A failure to remove a staging copy after
/// publishing still counts as a failure.
pub async fn apply(dst: &Connection, report: &DiffReport) -> Result<usize> {
    let mut installed = 0;
    for (name, doc) in &report.diff {
        dst.install_design_document(name, doc)
            .await
            .with_context(|| format!("upgrade of [{}] failed", name))?;
        tracing::info!(design_document = %name, "installed");
        installed += 1;
    }
    Ok(installed)
}

/// Accepts `y`, `yes`, or `1`, case-insensitively.
pub fn is_confirmation(answer: &str) -> bool {
    matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes" | "1"
    )
}

/// Ask `question` on `out` and read one line of answer from `input`.
pub fn confirm<R: BufRead, W: Write>(input: &mut R, out: &mut W, question: &str) -> Result<bool> {
    write!(out, "{} (y/N) ", question)?;
    out.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(is_confirmation(&answer))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    NothingToUpgrade,
    Declined,
    Installed(usize),
}

/// Diff, print the report and summary, ask for confirmation unless
/// `assume_yes`, then install.
pub async fn run_upgrade<R: BufRead, W: Write>(
    src: &DesignSource<'_>,
    dst: &Connection,
    opts: &CompareOptions,
    verbose: bool,
    assume_yes: bool,
    input: &mut R,
    out: &mut W,
) -> Result<UpgradeOutcome> {
    let report = run_diff(src, dst, opts).await?;
    write_report(out, &report, verbose)?;
    writeln!(out)?;
    write_upgrade_summary(out, &report)?;

    if report.is_empty() {
        return Ok(UpgradeOutcome::NothingToUpgrade);
    }

    if !assume_yes
        && !confirm(input, out, "continue with design document update/creation?")?
    {
        tracing::info!("upgrade declined");
        return Ok(UpgradeOutcome::Declined);
    }

    writeln!(out, "Upgrade started")?;
    let installed = apply(dst, &report).await?;
    writeln!(out, "Upgrade complete: {} design document(s) installed", installed)?;
    Ok(UpgradeOutcome::Installed(installed))
}
