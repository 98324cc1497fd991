//! In-memory store of migration runs and their per-record pipeline statuses.
//!
//! The registry is the only owner of [`PipelineStatus`] values. All status
//! mutation goes through [`RunRegistry::apply_patches`], which merges a whole
//! batch under a single write lock so readers never observe half a batch.
//! Handles are cheap to clone and share one underlying store.

use crate::model::{
    CheckState, MigrationRun, MigrationState, PipelineStatus, Record, RecordId, RunId, RunState,
    Stage, StatusUpdate,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Identity fields of a run; everything else on [`MigrationRun`] is derived.
#[derive(Debug, Clone)]
struct RunEntry {
    id: RunId,
    name: String,
    created_at: String,
    source_product_id: String,
    target_product_id: String,
    records: Vec<Record>,
    statuses: HashMap<RecordId, PipelineStatus>,
}

impl RunEntry {
    fn status_of(&self, record_id: &str) -> PipelineStatus {
        self.statuses.get(record_id).cloned().unwrap_or_default()
    }

    fn contains(&self, record_id: &str) -> bool {
        self.records.iter().any(|r| r.id == record_id)
    }

    fn summarize(&self) -> MigrationRun {
        let mut migrated = 0;
        let mut failed = 0;
        let mut in_progress = 0;
        let mut validated = 0;
        let mut awaiting_migration = 0;
        let mut any_migration_failed = false;
        let mut touched = false;

        for record in &self.records {
            let st = self.status_of(&record.id);
            touched |= !st.is_untouched();
            if st.validation != CheckState::Pending {
                validated += 1;
            }
            match st.migration {
                MigrationState::Success => migrated += 1,
                MigrationState::Migrating => in_progress += 1,
                MigrationState::Failed => any_migration_failed = true,
                MigrationState::Pending => {
                    if st.validation == CheckState::Pass {
                        awaiting_migration += 1;
                    }
                }
            }
            if st.validation == CheckState::Fail
                || st.migration == MigrationState::Failed
                || st.verification == CheckState::Fail
            {
                failed += 1;
            }
        }

        let total = self.records.len();
        let any_migration_started = migrated > 0 || in_progress > 0 || any_migration_failed;

        let status = if total == 0 || !touched {
            RunState::Draft
        } else if in_progress > 0 {
            RunState::InProgress
        } else if validated < total && !any_migration_started {
            RunState::Validating
        } else if awaiting_migration > 0 {
            if any_migration_started {
                RunState::InProgress
            } else {
                RunState::Ready
            }
        } else if any_migration_failed {
            RunState::Failed
        } else if migrated > 0 {
            RunState::Completed
        } else {
            // Everything validated, nothing passed: there is nothing left to migrate.
            RunState::Failed
        };

        MigrationRun {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at.clone(),
            source_product_id: self.source_product_id.clone(),
            target_product_id: self.target_product_id.clone(),
            status,
            total_policies: total,
            migrated_count: migrated,
            failed_count: failed,
            in_progress_count: in_progress,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    // Insertion order is display order.
    runs: Vec<RunEntry>,
}

impl Inner {
    fn run(&self, run_id: &str) -> Option<&RunEntry> {
        self.runs.iter().find(|r| r.id == run_id)
    }

    fn run_mut(&mut self, run_id: &str) -> Option<&mut RunEntry> {
        self.runs.iter_mut().find(|r| r.id == run_id)
    }
}

/// Parameters for registering a new run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: RunId,
    pub name: String,
    pub source_product_id: String,
    pub target_product_id: String,
    pub records: Vec<Record>,
}

/// A failed record found by a cross-run scan, with the run it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEntry {
    pub run: MigrationRun,
    pub record: Record,
    pub errors: Vec<String>,
}

fn failed_at(stage: Stage, st: &PipelineStatus) -> Option<Vec<String>> {
    match stage {
        Stage::Validate if st.validation == CheckState::Fail => {
            Some(st.validation_errors.clone().unwrap_or_default())
        }
        Stage::Migrate if st.migration == MigrationState::Failed => Some(Vec::new()),
        Stage::Verify if st.verification == CheckState::Fail => {
            Some(st.verification_errors.clone().unwrap_or_default())
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run with its fetched record set. Re-registering an existing
    /// id replaces the run and drops its statuses. Record ids are unique within
    /// a run; later duplicates are dropped.
    pub fn create_run(&self, new: NewRun) -> MigrationRun {
        let created_at = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into());
        let mut seen = HashSet::new();
        let records: Vec<Record> = new
            .records
            .into_iter()
            .filter(|r| {
                let fresh = seen.insert(r.id.clone());
                if !fresh {
                    tracing::warn!(run = %new.id, record = %r.id, "dropping duplicate record id");
                }
                fresh
            })
            .collect();
        let entry = RunEntry {
            id: new.id,
            name: new.name,
            created_at,
            source_product_id: new.source_product_id,
            target_product_id: new.target_product_id,
            records,
            statuses: HashMap::new(),
        };
        let summary = entry.summarize();
        let mut inner = self.inner.write();
        inner.runs.retain(|r| r.id != entry.id);
        tracing::info!(run = %entry.id, records = entry.records.len(), "run registered");
        inner.runs.push(entry);
        summary
    }

    /// Drop a run together with its records and statuses.
    pub fn discard_run(&self, run_id: &str) -> bool {
        let mut inner = self.inner.write();
        let before = inner.runs.len();
        inner.runs.retain(|r| r.id != run_id);
        before != inner.runs.len()
    }

    pub fn runs(&self) -> Vec<MigrationRun> {
        self.inner.read().runs.iter().map(RunEntry::summarize).collect()
    }

    pub fn run(&self, run_id: &str) -> Option<MigrationRun> {
        self.inner.read().run(run_id).map(RunEntry::summarize)
    }

    pub fn records(&self, run_id: &str) -> Vec<Record> {
        self.inner
            .read()
            .run(run_id)
            .map(|r| r.records.clone())
            .unwrap_or_default()
    }

    /// Records of a run paired with their current statuses, in record order.
    pub fn records_with_status(&self, run_id: &str) -> Vec<(Record, PipelineStatus)> {
        let inner = self.inner.read();
        match inner.run(run_id) {
            Some(run) => run
                .records
                .iter()
                .map(|r| (r.clone(), run.status_of(&r.id)))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Never fails: unknown runs and records report the all-pending default.
    pub fn get_status(&self, run_id: &str, record_id: &str) -> PipelineStatus {
        self.inner
            .read()
            .run(run_id)
            .map(|r| r.status_of(record_id))
            .unwrap_or_default()
    }

    /// Merge a batch of patches atomically. Updates for an unknown run, or for
    /// records the run does not hold, are dropped.
    pub fn apply_patches(&self, run_id: &str, updates: &[StatusUpdate]) {
        if updates.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        let Some(run) = inner.run_mut(run_id) else {
            tracing::debug!(run = %run_id, "dropping patches for unknown run");
            return;
        };
        for update in updates {
            if !run.contains(&update.record_id) {
                tracing::debug!(
                    run = %run_id,
                    record = %update.record_id,
                    "dropping patch for unknown record"
                );
                continue;
            }
            run.statuses
                .entry(update.record_id.clone())
                .or_default()
                .merge(&update.patch);
        }
    }

    // Ids the run does not hold are ignored, so they never satisfy a gate.
    fn statuses_for(&self, run_id: &str, selection: &[RecordId]) -> Vec<PipelineStatus> {
        let inner = self.inner.read();
        let Some(run) = inner.run(run_id) else {
            return Vec::new();
        };
        selection
            .iter()
            .filter(|id| run.contains(id))
            .map(|id| run.status_of(id))
            .collect()
    }

    pub fn can_validate(&self, run_id: &str, selection: &[RecordId]) -> bool {
        self.statuses_for(run_id, selection)
            .iter()
            .any(|s| s.validation == CheckState::Pending)
    }

    pub fn can_migrate(&self, run_id: &str, selection: &[RecordId]) -> bool {
        let statuses = self.statuses_for(run_id, selection);
        !statuses.is_empty()
            && statuses.iter().all(PipelineStatus::can_migrate)
            && statuses.iter().any(PipelineStatus::can_migrate)
    }

    pub fn can_verify(&self, run_id: &str, selection: &[RecordId]) -> bool {
        let statuses = self.statuses_for(run_id, selection);
        !statuses.is_empty() && statuses.iter().all(PipelineStatus::can_verify)
    }

    /// Records failed at `stage` across every run, in run then record order.
    pub fn failed_entries(&self, stage: Stage) -> Vec<FailedEntry> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for run in &inner.runs {
            let mut summary = None;
            for record in &run.records {
                let failed = run.statuses.get(&record.id).and_then(|st| failed_at(stage, st));
                let Some(errors) = failed else {
                    continue;
                };
                let summary = summary.get_or_insert_with(|| run.summarize());
                out.push(FailedEntry {
                    run: summary.clone(),
                    record: record.clone(),
                    errors,
                });
            }
        }
        out
    }

    pub fn all_validation_failed(&self) -> Vec<FailedEntry> {
        self.failed_entries(Stage::Validate)
    }

    pub fn all_verification_failed(&self) -> Vec<FailedEntry> {
        self.failed_entries(Stage::Verify)
    }
}
