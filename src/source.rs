//! Policy records for a run's source product.
//!
//! The back-office API is reached elsewhere; here a run only needs a list of
//! [`Record`]s, either generated deterministically or read from a JSON dump of
//! policy search results.

use crate::model::Record;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;

pub trait RecordSource: Send + Sync {
    fn fetch(&self, product_id: &str) -> Result<Vec<Record>>;
}

const FIRST_NAMES: [&str; 8] = [
    "Avery", "Jordan", "Morgan", "Riley", "Casey", "Quinn", "Rowan", "Sasha",
];
const LAST_NAMES: [&str; 6] = ["Okafor", "Lindqvist", "Tanaka", "Moreau", "Silva", "Novak"];

/// Generates `count` stable records per product, ids `<PRODUCT>-0000` upward.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    pub count: usize,
}

impl RecordSource for FixtureSource {
    fn fetch(&self, product_id: &str) -> Result<Vec<Record>> {
        let prefix: String = product_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        let prefix = if prefix.is_empty() { "POL".into() } else { prefix };
        Ok((0..self.count)
            .map(|i| Record {
                id: format!("{prefix}-{i:04}"),
                policy_number: format!("{prefix}{:07}", 1_000_000 + i * 37),
                effective_date: format!("2024-{:02}-{:02}", i % 12 + 1, i % 28 + 1),
                customer_name: format!(
                    "{} {}",
                    FIRST_NAMES[i % FIRST_NAMES.len()],
                    LAST_NAMES[i % LAST_NAMES.len()]
                ),
                product_name: product_id.to_string(),
                raw_status: if i % 9 == 8 { "pending" } else { "active" }.into(),
            })
            .collect())
    }
}

/// Reads a JSON array (or `{ "items": [...] }` / `{ "policies": [...] }`) of policy objects.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    pub path: PathBuf,
}

impl RecordSource for JsonFileSource {
    fn fetch(&self, product_id: &str) -> Result<Vec<Record>> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read records file {}", self.path.display()))?;
        let doc: Value = serde_json::from_str(&raw)
            .with_context(|| format!("parse records file {}", self.path.display()))?;
        records_from_json(&doc, product_id)
    }
}

/// Map back-office policy objects onto records. Objects without any usable id
/// are skipped, and so are repeats of an id already seen.
pub fn records_from_json(doc: &Value, product_id: &str) -> Result<Vec<Record>> {
    let items = doc
        .as_array()
        .or_else(|| doc.get("items").and_then(Value::as_array))
        .or_else(|| doc.get("policies").and_then(Value::as_array))
        .context("expected an array of policy objects")?;

    let text = |item: &Value, keys: &[&str]| -> Option<String> {
        keys.iter().find_map(|k| match item.get(*k)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };

    let mut out = Vec::with_capacity(items.len());
    let mut seen = HashSet::new();
    for item in items {
        let Some(policy_number) = text(item, &["policyNumber", "policy_number", "number"]) else {
            tracing::debug!(?item, "skipping policy without a number");
            continue;
        };
        let id = text(item, &["id", "policyId", "policy_id"])
            .unwrap_or_else(|| policy_number.clone());
        if !seen.insert(id.clone()) {
            tracing::warn!(%id, "skipping duplicate policy id");
            continue;
        }
        out.push(Record {
            id,
            policy_number,
            effective_date: text(item, &["effectiveDate", "effective_date", "inceptionDate"])
                .unwrap_or_default(),
            customer_name: text(item, &["customerName", "insuredName", "customer_name"])
                .unwrap_or_default(),
            product_name: text(item, &["productName", "product", "product_name"])
                .unwrap_or_else(|| product_id.to_string()),
            raw_status: text(item, &["status", "policyStatus"]).unwrap_or_default(),
        });
    }
    Ok(out)
}
