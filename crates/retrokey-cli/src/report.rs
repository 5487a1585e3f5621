use std::fmt::{self, Write as _};

use retrokey_core::{RunReport, RunState};
use serde_json::Value;

pub const CLI_CONTRACT_VERSION: &str = "rk.v1";

pub fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

/// Human-readable summary of a run.
///
/// # Errors
/// Propagates formatter errors.
pub fn render_text(report: &RunReport) -> Result<String, fmt::Error> {
    let mut out = String::new();
    let mode = if report.dry_run { " (dry run)" } else { "" };
    let path = report.transitions.iter().map(|state| state.as_str()).collect::<Vec<_>>();

    writeln!(out, "table:        {}{mode}", report.table)?;
    writeln!(out, "result:       {}", outcome(report))?;
    writeln!(out, "run date:     {}", report.run_date)?;
    writeln!(out, "transitions:  {}", path.join(" -> "))?;
    writeln!(
        out,
        "rows:         {} total, {} assigned, {} failed",
        report.rows_total, report.assigned, report.failed
    )?;
    if report.dropped_existing_column {
        writeln!(out, "replaced:     existing identifier column was dropped")?;
    }
    if let Some(sample) = &report.sample_identifier {
        writeln!(out, "sample:       {sample}")?;
    }
    if let Some(digest) = &report.assignment_digest {
        writeln!(out, "digest:       {digest}")?;
    }
    if let Some(summary) = &report.verification {
        writeln!(out, "verified:     {} rows, {} distinct", summary.rows, summary.distinct)?;
    }
    if let Some(schema) = &report.final_schema {
        writeln!(
            out,
            "schema:       {} (primary key: {})",
            schema.columns.join(", "),
            schema.primary_key.join(", ")
        )?;
    }

    if !report.warnings.is_empty() {
        writeln!(out, "warnings:")?;
        for warning in &report.warnings {
            writeln!(out, "  - {warning}")?;
        }
    }
    if !report.row_errors.is_empty() {
        writeln!(out, "row errors:")?;
        for error in &report.row_errors {
            writeln!(out, "  - {error}")?;
        }
    }
    if let Some(failure) = &report.failure {
        writeln!(
            out,
            "failure:      {} error while reaching {}: {}",
            failure.kind,
            failure.phase.as_str(),
            failure.message
        )?;
        if failure.phase == RunState::PrimaryKeyPromoted {
            writeln!(
                out,
                "note:         the identifier column was committed; rerun to retry promotion"
            )?;
        }
    }
    Ok(out)
}

fn outcome(report: &RunReport) -> &'static str {
    match (report.final_state, report.dry_run) {
        (RunState::PrimaryKeyPromoted, _) => "promoted",
        (RunState::Verified, true) => "verified, no changes made",
        (RunState::Aborted, _) => "aborted",
        _ => "incomplete",
    }
}
