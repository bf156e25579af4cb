//! Left join of a secondary table onto an accumulating integrated table.
//!
//! Responsibilities:
//! - Validate that the secondary side is many-to-one on its key
//! - Reject or deduplicate (first wins) a secondary with repeated keys
//! - Drop secondary columns whose name already exists (earlier data wins)
//! - Keep every left row exactly once, in order

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::JoinError;
use crate::table::{Key, Table, Value};

/// What to do when the secondary key is not unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupPolicy {
    #[default]
    Reject,
    /// Keep the first row of each key in the secondary's natural order.
    FirstWins,
}

#[derive(Debug, Clone)]
pub struct JoinSpec<'a> {
    /// Name of the secondary dataset, for reports and errors.
    pub dataset: &'a str,
    pub key: &'a str,
    /// Key column on the secondary side when it is spelled differently.
    pub right_key: &'a str,
    pub dedup: DedupPolicy,
}

impl<'a> JoinSpec<'a> {
    pub fn on(dataset: &'a str, key: &'a str) -> Self {
        Self {
            dataset,
            key,
            right_key: key,
            dedup: DedupPolicy::Reject,
        }
    }

    pub fn right_key(mut self, right_key: &'a str) -> Self {
        self.right_key = right_key;
        self
    }

    pub fn dedup(mut self, dedup: DedupPolicy) -> Self {
        self.dedup = dedup;
        self
    }
}

/// One executed join, as written in the diagnostic report.
#[derive(Debug, Clone, Serialize)]
pub struct JoinSummary {
    pub dataset: String,
    pub key: String,
    pub added_columns: Vec<String>,
    /// Secondary columns hidden by an existing column of the same name.
    pub dropped_columns: Vec<String>,
    pub matched_rows: usize,
    pub unmatched_rows: usize,
    /// Secondary keys that appeared more than once and were reduced to one row.
    pub deduplicated_keys: usize,
}

/// Index of the row to use for each secondary key.
fn unique_index(
    right: &Table,
    key_idx: usize,
    spec: &JoinSpec<'_>,
) -> Result<(BTreeMap<Key, usize>, usize), JoinError> {
    let mut index = BTreeMap::new();
    let mut duplicated: BTreeSet<Key> = BTreeSet::new();
    for (i, row) in right.rows().iter().enumerate() {
        let Some(key) = Key::from_value(&row[key_idx]) else {
            continue;
        };
        if index.contains_key(&key) {
            duplicated.insert(key);
        } else {
            index.insert(key, i);
        }
    }

    if let Some(first) = duplicated.iter().next() {
        if spec.dedup == DedupPolicy::Reject {
            return Err(JoinError::Ambiguous {
                dataset: spec.dataset.to_string(),
                key: spec.right_key.to_string(),
                duplicate_keys: duplicated.len(),
                example: first.to_string(),
            });
        }
        warn!(
            dataset = spec.dataset,
            key = spec.right_key,
            duplicate_keys = duplicated.len(),
            "secondary key not unique, keeping first row per key"
        );
    }
    Ok((index, duplicated.len()))
}

/// Left-join `right` onto `left`. The result has exactly `left.len()` rows.
pub fn left_join(
    left: &Table,
    right: &Table,
    spec: &JoinSpec<'_>,
) -> Result<(Table, JoinSummary), JoinError> {
    let missing = |side| JoinError::MissingKey {
        dataset: spec.dataset.to_string(),
        key: spec.key.to_string(),
        side,
    };
    let left_key = left.column_index(spec.key).ok_or_else(|| missing("left"))?;
    let right_key = right
        .column_index(spec.right_key)
        .ok_or_else(|| missing("right"))?;

    let (index, deduplicated_keys) = unique_index(right, right_key, spec)?;

    let mut added = Vec::new();
    let mut dropped_columns = Vec::new();
    for (i, column) in right.columns().iter().enumerate() {
        if i == right_key {
            continue;
        }
        if left.has_column(column) {
            dropped_columns.push(column.clone());
        } else {
            added.push((i, column.clone()));
        }
    }

    let mut columns = left.columns().to_vec();
    columns.extend(added.iter().map(|(_, c)| c.clone()));
    let mut out = Table::new(columns);

    let mut matched_rows = 0;
    for row in left.rows() {
        let hit = Key::from_value(&row[left_key]).and_then(|k| index.get(&k));
        let mut joined = row.clone();
        match hit {
            Some(&r) => {
                matched_rows += 1;
                let source = &right.rows()[r];
                joined.extend(added.iter().map(|(i, _)| source[*i].clone()));
            }
            None => joined.extend(added.iter().map(|_| Value::Null)),
        }
        out.push_row(joined);
    }

    let summary = JoinSummary {
        dataset: spec.dataset.to_string(),
        key: spec.key.to_string(),
        added_columns: added.into_iter().map(|(_, c)| c).collect(),
        dropped_columns,
        matched_rows,
        unmatched_rows: out.len() - matched_rows,
        deduplicated_keys,
    };
    debug!(
        dataset = spec.dataset,
        key = spec.key,
        added = summary.added_columns.len(),
        dropped = summary.dropped_columns.len(),
        matched = matched_rows,
        "joined"
    );
    Ok((out, summary))
}

// =============================================================================
// TESTS
// =============================================================================
