//! Text summary builder for CLI output.
//!
//! Formats a run, its stage reports and the failure registries as
//! human-readable lines for text mode.

use crate::model::{MigrationRun, StageReport};
use crate::registry::FailedEntry;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

pub(crate) fn build_text_summary(
    run: &MigrationRun,
    reports: &[StageReport],
    failed_validation: &[FailedEntry],
    failed_verification: &[FailedEntry],
) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!(
        "Run: {} ({}) {} -> {}",
        run.name, run.id, run.source_product_id, run.target_product_id
    ));
    lines.push(format!(
        "Status: {}  policies {}  migrated {}  failed {}  in progress {}",
        run.status.label(),
        run.total_policies,
        run.migrated_count,
        run.failed_count,
        run.in_progress_count
    ));

    if reports.is_empty() {
        lines.push("No stages ran".into());
    }
    for report in reports {
        lines.push(format!("  {}", report.to_message()));
    }

    push_failures(&mut lines, "Failed validation", failed_validation);
    push_failures(&mut lines, "Failed verification", failed_verification);

    TextSummary { lines }
}

fn push_failures(lines: &mut Vec<String>, title: &str, entries: &[FailedEntry]) {
    if entries.is_empty() {
        return;
    }
    lines.push(format!("{title}: {}", entries.len()));
    for e in entries {
        let reason = if e.errors.is_empty() {
            "-".to_string()
        } else {
            e.errors.join("; ")
        };
        lines.push(format!(
            "  {} {} ({}): {}",
            e.record.id, e.record.policy_number, e.run.name, reason
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Record, RunState, Stage};

    fn run() -> MigrationRun {
        MigrationRun {
            id: "run-1".into(),
            name: "Run 1".into(),
            created_at: "2025-01-01T00:00:00Z".into(),
            source_product_id: "auto-legacy".into(),
            target_product_id: "auto-2025".into(),
            status: RunState::Failed,
            total_policies: 3,
            migrated_count: 2,
            failed_count: 1,
            in_progress_count: 0,
        }
    }

    #[test]
    fn lists_reports_and_failures() {
        let mut report = StageReport::new("run-1", Stage::Validate);
        report.attempted = 3;
        report.passed = 2;
        report.failed = 1;
        let failed = vec![FailedEntry {
            run: run(),
            record: Record {
                id: "AUTO-0002".into(),
                policy_number: "P-2".into(),
                effective_date: String::new(),
                customer_name: String::new(),
                product_name: "auto".into(),
                raw_status: String::new(),
            },
            errors: vec!["missing VIN".into(), "bad date".into()],
        }];
        let summary = build_text_summary(&run(), &[report], &failed, &[]);
        assert_eq!(
            summary.lines[1],
            "Status: failed  policies 3  migrated 2  failed 1  in progress 0"
        );
        assert!(summary.lines[2].contains("validate: 3 attempted, 2 passed, 1 failed"));
        assert_eq!(summary.lines[3], "Failed validation: 1");
        assert_eq!(summary.lines[4], "  AUTO-0002 P-2 (Run 1): missing VIN; bad date");
        assert!(!summary.lines.iter().any(|l| l.starts_with("Failed verification")));
    }

    #[test]
    fn empty_run_says_nothing_ran() {
        let summary = build_text_summary(&run(), &[], &[], &[]);
        assert_eq!(summary.lines[2], "No stages ran");
    }
}
