//! Pass/fail policies consulted by the pipeline engine.
//!
//! The engine never decides outcomes itself; it asks a [`CheckPolicy`]. The
//! fixture and random policies stand in for a real rules engine, the rules
//! policy performs field-level checks on the fetched record.

use crate::model::Record;
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::macros::format_description;

/// Result of checking one record at one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail(Vec<String>),
}

impl Outcome {
    pub fn fail(msg: impl Into<String>) -> Self {
        Outcome::Fail(vec![msg.into()])
    }
}

pub trait CheckPolicy: Send + Sync {
    fn validate(&self, record: &Record) -> Outcome;

    fn migrate(&self, _record: &Record) -> Outcome {
        Outcome::Pass
    }

    fn verify(&self, record: &Record) -> Outcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Fixture,
    Rules,
    Random,
}

/// Build the policy selected on the command line or in the config file.
pub fn build_policy(kind: PolicyKind, failure_rate: f64) -> Box<dyn CheckPolicy> {
    match kind {
        PolicyKind::Fixture => Box::new(FixturePolicy::default()),
        PolicyKind::Rules => Box::new(RulesPolicy),
        PolicyKind::Random => Box::new(RandomPolicy::new(failure_rate)),
    }
}

/// Fails a record when its ordinal satisfies `ordinal % modulus == remainder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRule {
    pub modulus: usize,
    pub remainder: usize,
}

impl FailureRule {
    pub const fn every(modulus: usize, remainder: usize) -> Self {
        Self { modulus, remainder }
    }

    fn matches(&self, ordinal: usize) -> bool {
        self.modulus > 0 && ordinal % self.modulus == self.remainder
    }
}

/// Trailing decimal digits of a record id, e.g. `AUTO-0012` -> 12.
pub fn record_ordinal(record: &Record) -> Option<usize> {
    let digits: String = record
        .id
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

/// Deterministic fixture rules keyed on the record ordinal.
#[derive(Debug, Clone)]
pub struct FixturePolicy {
    pub validation: Option<FailureRule>,
    pub migration: Option<FailureRule>,
    pub verification: Option<FailureRule>,
}

impl Default for FixturePolicy {
    fn default() -> Self {
        Self {
            validation: Some(FailureRule::every(10, 2)),
            migration: Some(FailureRule::every(10, 7)),
            verification: Some(FailureRule::every(10, 5)),
        }
    }
}

impl FixturePolicy {
    fn hit(rule: Option<FailureRule>, record: &Record) -> bool {
        match (rule, record_ordinal(record)) {
            (Some(rule), Some(ordinal)) => rule.matches(ordinal),
            _ => false,
        }
    }
}

impl CheckPolicy for FixturePolicy {
    fn validate(&self, record: &Record) -> Outcome {
        if Self::hit(self.validation, record) {
            Outcome::Fail(vec![
                format!("Policy {} has no billing account", record.policy_number),
                "Coverage limits missing for target product".into(),
            ])
        } else {
            Outcome::Pass
        }
    }

    fn migrate(&self, record: &Record) -> Outcome {
        if Self::hit(self.migration, record) {
            Outcome::fail(format!("Target API rejected policy {}", record.policy_number))
        } else {
            Outcome::Pass
        }
    }

    fn verify(&self, record: &Record) -> Outcome {
        if Self::hit(self.verification, record) {
            Outcome::fail(format!(
                "Premium mismatch between source and target for {}",
                record.policy_number
            ))
        } else {
            Outcome::Pass
        }
    }
}

/// Field-level checks on the fetched record.
#[derive(Debug, Clone, Copy, Default)]
pub struct RulesPolicy;

const CLOSED_STATUSES: [&str; 3] = ["cancelled", "canceled", "lapsed"];

impl CheckPolicy for RulesPolicy {
    fn validate(&self, record: &Record) -> Outcome {
        let mut errors = Vec::new();
        if record.policy_number.trim().is_empty() {
            errors.push("Policy number is missing".to_string());
        }
        if record.customer_name.trim().is_empty() {
            errors.push("Customer name is missing".to_string());
        }
        let date_fmt = format_description!("[year]-[month]-[day]");
        if time::Date::parse(record.effective_date.trim(), &date_fmt).is_err() {
            errors.push(format!(
                "Effective date '{}' is not a valid YYYY-MM-DD date",
                record.effective_date
            ));
        }
        let status = record.raw_status.trim().to_ascii_lowercase();
        if CLOSED_STATUSES.contains(&status.as_str()) {
            errors.push(format!("Policy is {status} and cannot be migrated"));
        }
        if errors.is_empty() {
            Outcome::Pass
        } else {
            Outcome::Fail(errors)
        }
    }

    fn verify(&self, _record: &Record) -> Outcome {
        Outcome::Pass
    }
}

/// Fails each stage independently with a fixed probability.
#[derive(Debug, Clone, Copy)]
pub struct RandomPolicy {
    failure_rate: f64,
}

impl RandomPolicy {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    fn roll(&self) -> bool {
        rand::thread_rng().gen_bool(self.failure_rate)
    }
}

impl CheckPolicy for RandomPolicy {
    fn validate(&self, _record: &Record) -> Outcome {
        if self.roll() {
            Outcome::fail("Random validation failure")
        } else {
            Outcome::Pass
        }
    }

    fn migrate(&self, _record: &Record) -> Outcome {
        if self.roll() {
            Outcome::fail("Random migration failure")
        } else {
            Outcome::Pass
        }
    }

    fn verify(&self, _record: &Record) -> Outcome {
        if self.roll() {
            Outcome::fail("Random verification failure")
        } else {
            Outcome::Pass
        }
    }
}
