//! Stage runners: gate a selection on the registry, ask the pipeline engine
//! for patches, and write them back.
//!
//! Validation and verification are a single batched write each. Migration is
//! sequential per record, two writes per record, so the `migrating` state is
//! visible before the terminal one.

use crate::model::{
    CheckState, ConsoleEvent, MigrationRun, MigrationState, PipelineStatus, Record, RecordId,
    Stage, StageReport,
};
use crate::pipeline::PipelineEngine;
use crate::registry::{NewRun, RunRegistry};
use crate::source::RecordSource;
use anyhow::{Context, Result};
use rand::RngCore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// A stage was requested for a selection its gating predicate does not allow.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("no selected record is pending validation")]
    NothingToValidate,
    #[error("every selected record must have passed validation and not yet be migrated")]
    NotMigratable,
    #[error("every selected record must be migrated successfully before verification")]
    NotVerifiable,
}

/// Generate a short random run id.
fn gen_run_id() -> String {
    let mut b = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut b);
    format!("run-{:08x}", u32::from_le_bytes(b))
}

/// Shared handles the stage runners operate on.
#[derive(Clone)]
pub struct Pipeline {
    pub registry: RunRegistry,
    pub engine: Arc<PipelineEngine>,
    pub step_delay: Duration,
}

impl Pipeline {
    pub fn new(registry: RunRegistry, engine: PipelineEngine, step_delay: Duration) -> Self {
        Self {
            registry,
            engine: Arc::new(engine),
            step_delay,
        }
    }

    /// Fetch the source product's records and register them as a new run.
    pub fn open_run(
        &self,
        source: &dyn RecordSource,
        name: &str,
        source_product_id: &str,
        target_product_id: &str,
    ) -> Result<MigrationRun> {
        let records = source
            .fetch(source_product_id)
            .with_context(|| format!("fetch records for {source_product_id}"))?;
        Ok(self.registry.create_run(NewRun {
            id: gen_run_id(),
            name: name.to_string(),
            source_product_id: source_product_id.to_string(),
            target_product_id: target_product_id.to_string(),
            records,
        }))
    }

    /// Selected records of a run with their statuses, in run order.
    fn selected(&self, run_id: &str, selection: &[RecordId]) -> Vec<(Record, PipelineStatus)> {
        let wanted: HashSet<&str> = selection.iter().map(String::as_str).collect();
        self.registry
            .records_with_status(run_id)
            .into_iter()
            .filter(|(r, _)| wanted.contains(r.id.as_str()))
            .collect()
    }

    pub fn validate_selection(
        &self,
        run_id: &str,
        selection: &[RecordId],
    ) -> Result<StageReport, GateError> {
        if !self.registry.can_validate(run_id, selection) {
            return Err(GateError::NothingToValidate);
        }
        let pairs = self.selected(run_id, selection);
        let updates = self
            .engine
            .validate(pairs.iter().map(|(r, s)| (r, s.clone())));
        self.registry.apply_patches(run_id, &updates);

        let mut report = StageReport::new(run_id, Stage::Validate);
        report.attempted = updates.len();
        report.failed = updates
            .iter()
            .filter(|u| u.patch.validation == Some(CheckState::Fail))
            .count();
        report.passed = report.attempted - report.failed;
        report.skipped = selection.len().saturating_sub(report.attempted);
        tracing::info!(
            run = %run_id,
            passed = report.passed,
            failed = report.failed,
            "validation applied"
        );
        Ok(report)
    }

    pub fn verify_selection(
        &self,
        run_id: &str,
        selection: &[RecordId],
    ) -> Result<StageReport, GateError> {
        if !self.registry.can_verify(run_id, selection) {
            return Err(GateError::NotVerifiable);
        }
        let pairs = self.selected(run_id, selection);
        let updates = self.engine.verify(pairs.iter().map(|(r, s)| (r, s.clone())));
        self.registry.apply_patches(run_id, &updates);

        let mut report = StageReport::new(run_id, Stage::Verify);
        report.attempted = updates.len();
        report.failed = updates
            .iter()
            .filter(|u| u.patch.verification == Some(CheckState::Fail))
            .count();
        report.passed = report.attempted - report.failed;
        report.skipped = selection.len().saturating_sub(report.attempted);
        tracing::info!(
            run = %run_id,
            passed = report.passed,
            failed = report.failed,
            "verification applied"
        );
        Ok(report)
    }

    /// Check the migration gate without touching the registry.
    pub fn gate_migration(&self, run_id: &str, selection: &[RecordId]) -> Result<(), GateError> {
        if self.registry.can_migrate(run_id, selection) {
            Ok(())
        } else {
            Err(GateError::NotMigratable)
        }
    }

    /// Migrate the selection one record at a time.
    ///
    /// Once `cancel` fires no new record is started. A record already marked
    /// `migrating` is still resolved so it never stays in the transitional state.
    pub async fn migrate_selection(
        &self,
        run_id: &str,
        selection: &[RecordId],
        cancel: &CancellationToken,
        events: &UnboundedSender<ConsoleEvent>,
    ) -> Result<StageReport, GateError> {
        self.gate_migration(run_id, selection)?;
        let pairs = self.selected(run_id, selection);
        let mut report = StageReport::new(run_id, Stage::Migrate);
        report.skipped = selection.len().saturating_sub(pairs.len());

        for (record, _) in pairs {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let current = self.registry.get_status(run_id, &record.id);
            let Some(begin) = self.engine.begin_migration(&record, &current) else {
                report.skipped += 1;
                continue;
            };
            self.registry.apply_patches(run_id, &[begin]);
            report.attempted += 1;
            let _ = events.send(ConsoleEvent::RecordMigrating {
                run_id: run_id.to_string(),
                record_id: record.id.clone(),
            });

            if !self.step_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.step_delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }

            let current = self.registry.get_status(run_id, &record.id);
            if let Some(end) = self.engine.finish_migration(&record, &current) {
                let state = end.patch.migration.unwrap_or(MigrationState::Failed);
                self.registry.apply_patches(run_id, &[end]);
                if state == MigrationState::Success {
                    report.passed += 1;
                } else {
                    report.failed += 1;
                }
                let _ = events.send(ConsoleEvent::RecordMigrated {
                    run_id: run_id.to_string(),
                    record_id: record.id.clone(),
                    state,
                });
            }
        }
        if cancel.is_cancelled() {
            report.cancelled = true;
        }
        tracing::info!(
            run = %run_id,
            passed = report.passed,
            failed = report.failed,
            cancelled = report.cancelled,
            "migration batch finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::policy::FixturePolicy;
    use crate::source::FixtureSource;
    use tokio::sync::mpsc;

    fn pipeline(step: Duration) -> Pipeline {
        Pipeline::new(
            RunRegistry::new(),
            PipelineEngine::new(Box::new(FixturePolicy::default())),
            step,
        )
    }

    fn ids(p: &Pipeline, run_id: &str) -> Vec<RecordId> {
        p.registry.records(run_id).into_iter().map(|r| r.id).collect()
    }

    #[test]
    fn gating_rejects_before_any_write() {
        let p = pipeline(Duration::ZERO);
        let run = p
            .open_run(&FixtureSource { count: 3 }, "gate", "auto", "auto-next")
            .unwrap();
        let all = ids(&p, &run.id);
        assert_eq!(p.verify_selection(&run.id, &all), Err(GateError::NotVerifiable));
        assert!(p.registry.records_with_status(&run.id).iter().all(|(_, s)| s.is_untouched()));

        p.validate_selection(&run.id, &all).unwrap();
        assert_eq!(
            p.validate_selection(&run.id, &all),
            Err(GateError::NothingToValidate)
        );
    }

    #[tokio::test]
    async fn migrating_mixed_selection_is_refused() {
        let p = pipeline(Duration::ZERO);
        let run = p
            .open_run(&FixtureSource { count: 4 }, "mixed", "auto", "auto-next")
            .unwrap();
        let all = ids(&p, &run.id);
        p.validate_selection(&run.id, &all).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let res = p
            .migrate_selection(&run.id, &all, &CancellationToken::new(), &tx)
            .await;
        assert_eq!(res, Err(GateError::NotMigratable));
        for id in &all {
            assert_ne!(p.registry.get_status(&run.id, id).migration, MigrationState::Migrating);
        }
    }

    #[tokio::test]
    async fn end_to_end_ten_records() {
        let p = pipeline(Duration::ZERO);
        let run = p
            .open_run(&FixtureSource { count: 10 }, "e2e", "auto", "auto-next")
            .unwrap();
        let all = ids(&p, &run.id);

        let report = p.validate_selection(&run.id, &all).unwrap();
        assert_eq!((report.passed, report.failed), (9, 1));
        let failed: Vec<RecordId> = p
            .registry
            .all_validation_failed()
            .into_iter()
            .map(|e| e.record.id)
            .collect();
        assert_eq!(failed, vec![all[2].clone()]);

        let passing: Vec<RecordId> = all
            .iter()
            .filter(|id| p.registry.get_status(&run.id, id).validation == CheckState::Pass)
            .cloned()
            .collect();
        assert!(p.registry.can_migrate(&run.id, &passing));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = p
            .migrate_selection(&run.id, &passing, &CancellationToken::new(), &tx)
            .await
            .unwrap();
        assert_eq!((report.passed, report.failed), (8, 1));
        drop(tx);

        // Strictly sequential: each record is announced migrating, then resolved, before the next.
        let mut order = Vec::new();
        while let Some(ev) = rx.recv().await {
            match ev {
                ConsoleEvent::RecordMigrating { record_id, .. } => {
                    order.push((record_id, MigrationState::Migrating))
                }
                ConsoleEvent::RecordMigrated { record_id, state, .. } => {
                    order.push((record_id, state))
                }
                _ => {}
            }
        }
        assert_eq!(order.len(), 18);
        for (i, pair) in order.chunks(2).enumerate() {
            assert_eq!(pair[0].0, passing[i]);
            assert_eq!(pair[1].0, passing[i]);
            assert_eq!(pair[0].1, MigrationState::Migrating);
            let expected = if passing[i] == all[7] {
                MigrationState::Failed
            } else {
                MigrationState::Success
            };
            assert_eq!(pair[1].1, expected);
        }

        let migrated: Vec<RecordId> = passing
            .iter()
            .filter(|id| p.registry.get_status(&run.id, id).migration == MigrationState::Success)
            .cloned()
            .collect();
        assert_eq!(migrated.len(), 8);
        let report = p.verify_selection(&run.id, &migrated).unwrap();
        assert_eq!((report.passed, report.failed), (7, 1));
        let verify_failed: Vec<RecordId> = p
            .registry
            .all_verification_failed()
            .into_iter()
            .map(|e| e.record.id)
            .collect();
        assert_eq!(verify_failed, vec![all[5].clone()]);

        let summary = p.registry.run(&run.id).unwrap();
        assert_eq!(summary.migrated_count, 8);
        assert_eq!(summary.failed_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_batch_without_stranding_records() {
        let p = pipeline(Duration::from_secs(1));
        let run = p
            .open_run(&FixtureSource { count: 5 }, "cancel", "home", "home-next")
            .unwrap();
        let all = ids(&p, &run.id);
        p.validate_selection(&run.id, &all).unwrap();
        let passing: Vec<RecordId> = all
            .iter()
            .filter(|id| p.registry.get_status(&run.id, id).validation == CheckState::Pass)
            .cloned()
            .collect();

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = {
            let p = p.clone();
            let run_id = run.id.clone();
            let passing = passing.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { p.migrate_selection(&run_id, &passing, &cancel, &tx).await })
        };

        // Wait until the second record starts, then cancel.
        let mut started = 0;
        while let Some(ev) = rx.recv().await {
            if matches!(ev, ConsoleEvent::RecordMigrating { .. }) {
                started += 1;
                if started == 2 {
                    cancel.cancel();
                    break;
                }
            }
        }
        let report = task.await.unwrap().unwrap();
        assert!(report.cancelled);
        assert_eq!(report.attempted, 2);

        let statuses: Vec<MigrationState> = passing
            .iter()
            .map(|id| p.registry.get_status(&run.id, id).migration)
            .collect();
        assert!(statuses[..2]
            .iter()
            .all(|s| matches!(s, MigrationState::Success | MigrationState::Failed)));
        assert!(statuses[2..].iter().all(|s| *s == MigrationState::Pending));
    }

    #[tokio::test]
    async fn duplicate_ids_in_a_source_do_not_break_stage_counts() {
        let p = pipeline(Duration::ZERO);
        let doc = serde_json::json!([
            {"id": "X1", "policyNumber": "A"},
            {"id": "X1", "policyNumber": "B"}
        ]);
        let mut records = crate::source::records_from_json(&doc, "auto").unwrap();
        // Bypass the source's own dedupe so the registry sees both.
        records.push(Record {
            policy_number: "B".into(),
            ..records[0].clone()
        });
        let run = p.registry.create_run(NewRun {
            id: "dup".into(),
            name: "dup".into(),
            source_product_id: "auto".into(),
            target_product_id: "auto-next".into(),
            records,
        });
        assert_eq!(run.total_policies, 1);

        let x1 = vec!["X1".to_string()];
        let report = p.validate_selection(&run.id, &x1).unwrap();
        assert_eq!((report.attempted, report.skipped), (1, 0));

        let (tx, _rx) = mpsc::unbounded_channel();
        let report = p
            .migrate_selection(&run.id, &x1, &CancellationToken::new(), &tx)
            .await
            .unwrap();
        assert_eq!((report.attempted, report.skipped), (1, 0));

        // A selection that repeats an id is not a larger batch.
        let twice = vec!["X1".to_string(), "X1".to_string()];
        let report = p.verify_selection(&run.id, &twice).unwrap();
        assert_eq!((report.attempted, report.skipped), (1, 1));
    }

    #[test]
    fn migration_gate_is_checked_without_writes() {
        let p = pipeline(Duration::ZERO);
        let run = p
            .open_run(&FixtureSource { count: 2 }, "gate", "auto", "auto-next")
            .unwrap();
        let all = ids(&p, &run.id);
        assert_eq!(p.gate_migration(&run.id, &all), Err(GateError::NotMigratable));
        p.validate_selection(&run.id, &all).unwrap();
        assert_eq!(p.gate_migration(&run.id, &all), Ok(()));
        assert!(p
            .registry
            .records_with_status(&run.id)
            .iter()
            .all(|(_, s)| s.migration == MigrationState::Pending));
    }
}
