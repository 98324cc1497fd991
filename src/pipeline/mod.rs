//! Pure status transitions for the validate → migrate → verify pipeline.
//!
//! The engine computes proposed patches from a record and its current status.
//! It never touches the registry; callers gate with the registry's predicates
//! and apply whatever the engine returns.

pub mod policy;

use crate::model::{
    CheckState, MigrationState, PipelineStatus, Record, StatusPatch, StatusUpdate,
};
use policy::{CheckPolicy, Outcome};

pub struct PipelineEngine {
    policy: Box<dyn CheckPolicy>,
}

impl PipelineEngine {
    pub fn new(policy: Box<dyn CheckPolicy>) -> Self {
        Self { policy }
    }

    /// Validation patches for every record whose validation is still pending.
    pub fn validate<'a, I>(&self, records: I) -> Vec<StatusUpdate>
    where
        I: IntoIterator<Item = (&'a Record, PipelineStatus)>,
    {
        records
            .into_iter()
            .filter_map(|(record, current)| {
                if current.validation != CheckState::Pending {
                    return None;
                }
                let patch = match self.policy.validate(record) {
                    Outcome::Pass => StatusPatch::validation(CheckState::Pass, None),
                    Outcome::Fail(errs) => StatusPatch::validation(CheckState::Fail, Some(errs)),
                };
                Some(StatusUpdate {
                    record_id: record.id.clone(),
                    patch,
                })
            })
            .collect()
    }

    /// First half of a migration: the observable `migrating` transition.
    /// Returns `None` for a record that is not eligible.
    pub fn begin_migration(
        &self,
        record: &Record,
        current: &PipelineStatus,
    ) -> Option<StatusUpdate> {
        if !current.can_migrate() {
            tracing::warn!(record = %record.id, ?current, "refusing to migrate ineligible record");
            return None;
        }
        Some(StatusUpdate {
            record_id: record.id.clone(),
            patch: StatusPatch::migration(MigrationState::Migrating),
        })
    }

    /// Second half of a migration: resolve a `migrating` record to its terminal state.
    pub fn finish_migration(
        &self,
        record: &Record,
        current: &PipelineStatus,
    ) -> Option<StatusUpdate> {
        if current.migration != MigrationState::Migrating {
            tracing::warn!(record = %record.id, ?current, "record is not migrating");
            return None;
        }
        let state = match self.policy.migrate(record) {
            Outcome::Pass => MigrationState::Success,
            Outcome::Fail(errs) => {
                tracing::info!(record = %record.id, errors = ?errs, "migration failed");
                MigrationState::Failed
            }
        };
        Some(StatusUpdate {
            record_id: record.id.clone(),
            patch: StatusPatch::migration(state),
        })
    }

    /// Verification patches for every successfully migrated record.
    pub fn verify<'a, I>(&self, records: I) -> Vec<StatusUpdate>
    where
        I: IntoIterator<Item = (&'a Record, PipelineStatus)>,
    {
        records
            .into_iter()
            .filter_map(|(record, current)| {
                if !current.can_verify() {
                    tracing::warn!(record = %record.id, "refusing to verify unmigrated record");
                    return None;
                }
                let patch = match self.policy.verify(record) {
                    Outcome::Pass => StatusPatch::verification(CheckState::Pass, None),
                    Outcome::Fail(errs) => {
                        StatusPatch::verification(CheckState::Fail, Some(errs))
                    }
                };
                Some(StatusUpdate {
                    record_id: record.id.clone(),
                    patch,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::policy::FixturePolicy;
    use super::*;

    fn record(i: usize) -> Record {
        Record {
            id: format!("AUTO-{i:04}"),
            policy_number: format!("PN-{i}"),
            effective_date: "2024-01-01".into(),
            customer_name: "Customer".into(),
            product_name: "Auto".into(),
            raw_status: "active".into(),
        }
    }

    fn engine() -> PipelineEngine {
        PipelineEngine::new(Box::new(FixturePolicy::default()))
    }

    #[test]
    fn validate_skips_already_validated_records() {
        let recs: Vec<Record> = (0..3).map(record).collect();
        let done = PipelineStatus {
            validation: CheckState::Pass,
            ..Default::default()
        };
        let updates = engine().validate(vec![
            (&recs[0], PipelineStatus::default()),
            (&recs[1], done),
            (&recs[2], PipelineStatus::default()),
        ]);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].patch.validation, Some(CheckState::Pass));
        assert_eq!(updates[1].record_id, "AUTO-0002");
        assert_eq!(updates[1].patch.validation, Some(CheckState::Fail));
        assert!(updates[1].patch.validation_errors.is_some());
    }

    #[test]
    fn migration_is_a_no_op_for_ineligible_records() {
        let e = engine();
        let r = record(1);
        assert!(e.begin_migration(&r, &PipelineStatus::default()).is_none());
        let migrated = PipelineStatus {
            validation: CheckState::Pass,
            migration: MigrationState::Success,
            ..Default::default()
        };
        assert!(e.begin_migration(&r, &migrated).is_none());
        assert!(e.finish_migration(&r, &migrated).is_none());
    }

    #[test]
    fn migration_runs_through_migrating_to_terminal_state() {
        let e = engine();
        let mut st = PipelineStatus {
            validation: CheckState::Pass,
            ..Default::default()
        };
        let r = record(7);
        let begin = e.begin_migration(&r, &st).unwrap();
        st.merge(&begin.patch);
        assert_eq!(st.migration, MigrationState::Migrating);
        let end = e.finish_migration(&r, &st).unwrap();
        assert_eq!(end.patch.migration, Some(MigrationState::Failed));
    }

    #[test]
    fn verify_only_touches_migrated_records() {
        let recs: Vec<Record> = (4..6).map(record).collect();
        let ok = PipelineStatus {
            validation: CheckState::Pass,
            migration: MigrationState::Success,
            ..Default::default()
        };
        let failed = PipelineStatus {
            migration: MigrationState::Failed,
            ..ok.clone()
        };
        let updates = engine().verify(vec![(&recs[0], failed), (&recs[1], ok)]);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].record_id, "AUTO-0005");
        assert_eq!(updates[0].patch.verification, Some(CheckState::Fail));
    }
}
