//! Rendering of reconciliation reports.
//!
//! Text output is meant for terminals; `--json` prints the whole
//! [`DiffReport`] (apply-set and per-document checks) for scripts.

use std::io::Write;

use anyhow::Result;
use cb_admin_core::diff::{DiffReport, DocStatus, ViewStatus};
use cb_admin_core::models::ViewDefinition;

/// Print the per-document report.
///
/// With `verbose`, differing views also show both map functions.
pub fn write_report<W: Write>(out: &mut W, report: &DiffReport, verbose: bool) -> Result<()> {
    if report.checked.is_empty() {
        writeln!(out, "No design documents to compare.")?;
        return Ok(());
    }

    writeln!(out, "{:<10} DESIGN DOCUMENT", "STATUS")?;
    writeln!(out, "{}", "-".repeat(48))?;

    for (name, entry) in &report.checked {
        writeln!(out, "{:<10} {}", entry.status.as_str(), name)?;

        for (param, check) in &entry.params {
            writeln!(out, "  {:<8} param {}", check.status.as_str(), param)?;
        }

        for (view, check) in &entry.views {
            if check.status == ViewStatus::Ok && !verbose {
                continue;
            }
            writeln!(out, "  {:<8} view {}", check.status.as_str(), view)?;
            if verbose && check.status != ViewStatus::Ok {
                write_definition(out, "src", check.src.as_ref())?;
                write_definition(out, "dst", check.dst.as_ref())?;
            }
        }
    }

    let pending = report.diff.len();
    let dst_only = report
        .checked
        .values()
        .filter(|e| e.status == DocStatus::DstOnly)
        .count();
    writeln!(out)?;
    writeln!(
        out,
        "{} checked, {} to apply, {} destination-only",
        report.checked.len(),
        pending,
        dst_only
    )?;
    Ok(())
}

fn write_definition<W: Write>(
    out: &mut W,
    side: &str,
    definition: Option<&ViewDefinition>,
) -> Result<()> {
    match definition {
        Some(def) => {
            writeln!(out, "      {} map:    {}", side, def.map)?;
            if let Some(reduce) = &def.reduce {
                writeln!(out, "      {} reduce: {}", side, reduce)?;
            }
        }
        None => writeln!(out, "      {}: -", side)?,
    }
    Ok(())
}

/// Print what an upgrade would install.
pub fn write_upgrade_summary<W: Write>(out: &mut W, report: &DiffReport) -> Result<()> {
    if report.is_empty() {
        writeln!(out, "Nothing to upgrade")?;
        return Ok(());
    }

    writeln!(out, "Design documents to install:")?;
    for name in report.names_to_apply() {
        let status = report
            .checked
            .get(name)
            .map(|e| e.status.as_str())
            .unwrap_or("new");
        let views = report.diff.get(name).map(|d| d.views.len()).unwrap_or(0);
        writeln!(
            out,
            "  {:<8} {} ({} view{})",
            status,
            name,
            views,
            if views == 1 { "" } else { "s" }
        )?;
    }
    Ok(())
}

/// Print the full report as pretty JSON.
pub fn write_report_json<W: Write>(out: &mut W, report: &DiffReport) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, report)?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_admin_core::diff::{compare, CompareOptions};
    use cb_admin_core::models::{DesignDocument, DesignDocumentSet};

    fn sets() -> (DesignDocumentSet, DesignDocumentSet) {
        let mut src = DesignDocumentSet::new();
        src.insert(
            "users".to_string(),
            DesignDocument::new()
                .with_view("by_name", ViewDefinition::new("m2"))
                .with_view("by_email", ViewDefinition::new("e")),
        );
        src.insert(
            "orders".to_string(),
            DesignDocument::new().with_view("all", ViewDefinition::new("o")),
        );
        let mut dst = DesignDocumentSet::new();
        dst.insert(
            "users".to_string(),
            DesignDocument::new()
                .with_view("by_name", ViewDefinition::new("m1"))
                .with_view("by_email", ViewDefinition::new("e")),
        );
        dst.insert("legacy".to_string(), DesignDocument::new());
        (src, dst)
    }

    fn render(report: &DiffReport, verbose: bool) -> String {
        let mut buf = Vec::new();
        write_report(&mut buf, report, verbose).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn text_report_lists_every_checked_document() {
        let (src, dst) = sets();
        let report = compare(&src, &dst, &CompareOptions::new());
        let text = render(&report, false);

        assert!(text.contains("dst-only   legacy"));
        assert!(text.contains("new        orders"));
        assert!(text.contains("update     users"));
        assert!(text.contains("  update   view by_name"));
        assert!(!text.contains("view by_email"));
        assert!(text.contains("3 checked, 2 to apply, 1 destination-only"));
    }

    #[test]
    fn verbose_report_shows_both_definitions() {
        let (src, dst) = sets();
        let report = compare(&src, &dst, &CompareOptions::new());
        let text = render(&report, true);

        assert!(text.contains("  ok       view by_email"));
        assert!(text.contains("src map:    m2"));
        assert!(text.contains("dst map:    m1"));
    }

    #[test]
    fn upgrade_summary() {
        let (src, dst) = sets();
        let report = compare(&src, &dst, &CompareOptions::new());
        let mut buf = Vec::new();
        write_upgrade_summary(&mut buf, &report).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("new      orders (1 view)"));
        assert!(text.contains("update   users (2 views)"));

        let empty = compare(&src, &src, &CompareOptions::new());
        let mut buf = Vec::new();
        write_upgrade_summary(&mut buf, &empty).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "Nothing to upgrade\n");
    }

    #[test]
    fn json_report_is_parseable() {
        let (src, dst) = sets();
        let report = compare(&src, &dst, &CompareOptions::new());
        let mut buf = Vec::new();
        write_report_json(&mut buf, &report).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["checked"]["legacy"]["status"], "dst-only");
        assert_eq!(value["checked"]["users"]["views"]["by_name"]["status"], "update");
        assert!(value["diff"]["orders"].is_object());
    }
}
