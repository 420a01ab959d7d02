pub mod history;
pub mod timeline;

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::model::{Record, RecordKey};
use crate::schema::SchemaDescriptor;

/// The row-level change a planned record asks the storage layer to make.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationType {
    None,
    Insert,
    Update,
    Delete,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlannedRecord {
    pub mutation: MutationType,
    pub record: Record,
}

impl PlannedRecord {
    pub fn new(record: Record, mutation: MutationType) -> Self {
        Self { mutation, record }
    }

    pub fn unchanged(record: Record) -> Self {
        Self::new(record, MutationType::None)
    }

    /// Promotes an untouched row to an update. Pending inserts stay inserts.
    pub fn mark_updated(&mut self) {
        if self.mutation == MutationType::None {
            self.mutation = MutationType::Update;
        }
    }
}

/// Arriving and existing records sharing one business key.
#[derive(Debug, Clone, Default)]
pub struct KeyGroup {
    pub key: RecordKey,
    pub arriving: Vec<Record>,
    pub existing: Vec<Record>,
}

/// Result of planning a batch. Keys that failed validation land in `rejected`
/// and contribute nothing to `planned`.
#[derive(Debug, Default)]
pub struct BatchPlan {
    pub planned: Vec<PlannedRecord>,
    pub rejected: Vec<PlanError>,
}

impl BatchPlan {
    pub fn merge(&mut self, other: BatchPlan) {
        self.planned.extend(other.planned);
        self.rejected.extend(other.rejected);
    }

    pub fn count(&self, mutation: MutationType) -> usize {
        self.planned.iter().filter(|p| p.mutation == mutation).count()
    }

    /// Fails with the first rejection, if any.
    pub fn into_result(mut self) -> Result<Vec<PlannedRecord>, PlanError> {
        if self.rejected.is_empty() {
            Ok(self.planned)
        } else {
            Err(self.rejected.swap_remove(0))
        }
    }
}

/// Interface shared by SCD planning strategies.
pub trait Planner {
    fn plan_mutations(
        &self,
        arriving: Vec<Record>,
        existing: Vec<Record>,
        schema: &SchemaDescriptor,
    ) -> Result<BatchPlan, PlanError>;

    /// Whether the caller must fetch stored rows for the arriving keys.
    fn requires_existing_records(&self) -> bool;

    /// Whether every arriving record of a key must reach the same planner call.
    fn requires_key_colocation(&self) -> bool;

    fn emitted_mutation_types(&self) -> HashSet<MutationType>;
}

/// Partitions records by business key, keeping first-seen key order and the
/// relative order of records within a key.
pub fn records_by_key(records: Vec<Record>, key_fields: &[String]) -> IndexMap<RecordKey, Vec<Record>> {
    let mut grouped: IndexMap<RecordKey, Vec<Record>> = IndexMap::new();
    for record in records {
        grouped.entry(record.key(key_fields)).or_default().push(record);
    }
    grouped
}

/// Pairs every arriving key with its existing rows. Keys that only exist in
/// storage produce no group.
pub fn key_groups(arriving: Vec<Record>, existing: Vec<Record>, key_fields: &[String]) -> Vec<KeyGroup> {
    let mut existing_by_key = records_by_key(existing, key_fields);
    records_by_key(arriving, key_fields)
        .into_iter()
        .map(|(key, arriving)| {
            let existing = existing_by_key.swap_remove(&key).unwrap_or_default();
            KeyGroup { key, arriving, existing }
        })
        .collect()
}
