use serde::{Deserialize, Serialize};

pub type RunId = String;
pub type RecordId = String;

/// One policy to migrate, as fetched for a run's source product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    pub policy_number: String,
    pub effective_date: String,
    pub customer_name: String,
    pub product_name: String,
    pub raw_status: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    #[default]
    Pending,
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    #[default]
    Pending,
    Migrating,
    Success,
    Failed,
}

/// Tri-stage status of one record within one run.
///
/// The `Default` value is the all-pending triple, which is also what the
/// registry reports for records it has never seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub validation: CheckState,
    pub migration: MigrationState,
    pub verification: CheckState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_errors: Option<Vec<String>>,
}

impl PipelineStatus {
    /// Merge a patch into this status: present fields replace, absent fields are kept.
    pub fn merge(&mut self, patch: &StatusPatch) {
        if let Some(v) = patch.validation {
            self.validation = v;
        }
        if let Some(m) = patch.migration {
            self.migration = m;
        }
        if let Some(v) = patch.verification {
            self.verification = v;
        }
        if let Some(errs) = &patch.validation_errors {
            self.validation_errors = Some(errs.clone());
        }
        if let Some(errs) = &patch.verification_errors {
            self.verification_errors = Some(errs.clone());
        }
    }

    pub fn can_migrate(&self) -> bool {
        self.validation == CheckState::Pass && self.migration == MigrationState::Pending
    }

    pub fn can_verify(&self) -> bool {
        self.migration == MigrationState::Success
    }

    pub fn is_untouched(&self) -> bool {
        *self == PipelineStatus::default()
    }
}

/// Merge-patch for a [`PipelineStatus`]. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<CheckState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<CheckState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_errors: Option<Vec<String>>,
}

impl StatusPatch {
    pub fn validation(state: CheckState, errors: Option<Vec<String>>) -> Self {
        Self {
            validation: Some(state),
            validation_errors: errors,
            ..Default::default()
        }
    }

    pub fn migration(state: MigrationState) -> Self {
        Self {
            migration: Some(state),
            ..Default::default()
        }
    }

    pub fn verification(state: CheckState, errors: Option<Vec<String>>) -> Self {
        Self {
            verification: Some(state),
            verification_errors: errors,
            ..Default::default()
        }
    }
}

/// One entry of a batched registry write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub record_id: RecordId,
    pub patch: StatusPatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Draft,
    Validating,
    Ready,
    InProgress,
    Completed,
    Failed,
}

impl RunState {
    pub fn label(self) -> &'static str {
        match self {
            RunState::Draft => "draft",
            RunState::Validating => "validating",
            RunState::Ready => "ready",
            RunState::InProgress => "in progress",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }
}

/// A migration run as presented to callers. Status and counters are derived
/// from the registry's per-record statuses every time a run is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRun {
    pub id: RunId,
    pub name: String,
    pub created_at: String,
    pub source_product_id: String,
    pub target_product_id: String,
    pub status: RunState,
    pub total_policies: usize,
    pub migrated_count: usize,
    pub failed_count: usize,
    pub in_progress_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Migrate,
    Verify,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Validate => "validate",
            Stage::Migrate => "migrate",
            Stage::Verify => "verify",
        })
    }
}

/// Latest `status-update` payload from the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineStatus {
    pub state: String,
    pub progress: f64,
    pub elapsed: String,
    pub estimated: String,
    pub next_task: String,
    pub latest_status: String,
}

/// Latest `stats-update` payload from the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineStats {
    pub total_records: u64,
    pub processed_records: u64,
    pub success_count: u64,
    pub error_count: u64,
}

/// Opaque `log-entry` payload; only a few well-known keys are read for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogEntry(pub serde_json::Value);

impl LogEntry {
    /// Render a single display line, falling back to the raw JSON.
    pub fn to_line(&self) -> String {
        let field = |k: &str| self.0.get(k).and_then(|v| v.as_str());
        match field("message").or_else(|| field("msg")) {
            Some(msg) => {
                let mut line = String::new();
                if let Some(ts) = field("timestamp").or_else(|| field("time")) {
                    line.push_str(ts);
                    line.push(' ');
                }
                if let Some(level) = field("level") {
                    line.push_str(&format!("[{}] ", level.to_uppercase()));
                }
                line.push_str(msg);
                line
            }
            None => match &self.0 {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        }
    }
}

/// Events emitted by stage runners and the controller for presentation layers.
#[derive(Debug, Clone)]
pub enum ConsoleEvent {
    StageStarted {
        run_id: RunId,
        stage: Stage,
        records: usize,
    },
    RecordMigrating {
        run_id: RunId,
        record_id: RecordId,
    },
    RecordMigrated {
        run_id: RunId,
        record_id: RecordId,
        state: MigrationState,
    },
    StageFinished(StageReport),
    /// The migration task is gone, whether it finished, was refused or panicked.
    MigrationEnded {
        run_id: RunId,
    },
    CommandFinished {
        command: crate::engine::EngineCommand,
        result: Result<String, String>,
    },
    Info(String),
}

/// Outcome counts of one stage invocation over a selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub run_id: RunId,
    pub stage: Stage,
    pub attempted: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

impl StageReport {
    pub fn new(run_id: &str, stage: Stage) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage,
            attempted: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            cancelled: false,
        }
    }

    pub fn to_message(&self) -> String {
        let mut msg = format!(
            "{}: {} attempted, {} passed, {} failed",
            self.stage, self.attempted, self.passed, self.failed
        );
        if self.skipped > 0 {
            msg.push_str(&format!(", {} skipped", self.skipped));
        }
        if self.cancelled {
            msg.push_str(" (cancelled)");
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_absent_fields() {
        let mut st = PipelineStatus {
            validation: CheckState::Pass,
            migration: MigrationState::Success,
            verification: CheckState::Fail,
            validation_errors: None,
            verification_errors: Some(vec!["premium mismatch".into()]),
        };
        st.merge(&StatusPatch::validation(CheckState::Pass, None));
        assert_eq!(st.migration, MigrationState::Success);
        assert_eq!(st.verification, CheckState::Fail);
        assert_eq!(
            st.verification_errors.as_deref(),
            Some(&["premium mismatch".to_string()][..])
        );
    }

    #[test]
    fn engine_payloads_use_camel_case_and_tolerate_missing_fields() {
        let status: EngineStatus = serde_json::from_str(
            r#"{"state":"running","progress":42.5,"nextTask":"batch 7","latestStatus":"ok"}"#,
        )
        .unwrap();
        assert_eq!(status.state, "running");
        assert_eq!(status.next_task, "batch 7");
        assert_eq!(status.elapsed, "");

        let stats: EngineStats = serde_json::from_str(
            r#"{"totalRecords":10,"processedRecords":4,"successCount":3,"errorCount":1}"#,
        )
        .unwrap();
        assert_eq!(stats.processed_records, 4);
        assert_eq!(stats.error_count, 1);
    }

    #[test]
    fn log_entry_line_prefers_message_fields() {
        let e = LogEntry(serde_json::json!({
            "timestamp": "12:00:01",
            "level": "warn",
            "message": "slow batch"
        }));
        assert_eq!(e.to_line(), "12:00:01 [WARN] slow batch");
        let raw = LogEntry(serde_json::json!("plain text"));
        assert_eq!(raw.to_line(), "plain text");
    }
}
