use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::config::PlannerConfig;
use crate::error::StoreError;
use crate::model::{Record, RecordKey};
use crate::plan::{MutationType, PlannedRecord};
use crate::schema::SchemaDescriptor;

/// In-memory SCD table: one row per (key, event timestamp).
///
/// Stands in for the storage layer planned mutations are written to. Rows are
/// addressed by business key and event timestamp, so an UPDATE replaces the row
/// it was planned from.
#[derive(Debug)]
pub struct HistoryStore {
    schema: SchemaDescriptor,
    far_future: i64,
    /// Expected current and non-current flag values, when the schema has a flag.
    flags: Option<(String, String)>,
    rows: HashMap<RecordKey, BTreeMap<i64, Record>>,
}

impl HistoryStore {
    pub fn new(schema: SchemaDescriptor, config: &PlannerConfig) -> Self {
        let flags = schema
            .has_current_flag_field()
            .then(|| (config.current_flag_yes.clone(), config.current_flag_no.clone()));
        Self {
            schema,
            far_future: config.far_future(),
            flags,
            rows: HashMap::new(),
        }
    }

    /// Seeds stored history.
    pub fn load(&mut self, records: impl IntoIterator<Item = Record>) -> Result<(), StoreError> {
        for record in records {
            let (key, ts) = self.address(&record)?;
            let rows = self.rows.entry(key.clone()).or_default();
            if rows.insert(ts, record).is_some() {
                return Err(StoreError::DuplicateRow { key, timestamp: ts });
            }
        }
        Ok(())
    }

    /// Writes planned mutations. Returns how many rows changed.
    pub fn apply(&mut self, planned: &[PlannedRecord]) -> Result<usize, StoreError> {
        let mut changed = 0;
        for plan in planned.iter().filter(|p| p.mutation != MutationType::None) {
            let (key, ts) = self.address(&plan.record)?;
            let rows = self.rows.entry(key.clone()).or_default();
            match plan.mutation {
                MutationType::None => {}
                MutationType::Insert => {
                    if rows.insert(ts, plan.record.clone()).is_some() {
                        return Err(StoreError::DuplicateRow { key, timestamp: ts });
                    }
                }
                MutationType::Update => match rows.get_mut(&ts) {
                    Some(row) => *row = plan.record.clone(),
                    None => return Err(StoreError::MissingRow { key, timestamp: ts }),
                },
                MutationType::Delete => {
                    if rows.remove(&ts).is_none() {
                        return Err(StoreError::MissingRow { key, timestamp: ts });
                    }
                }
            }
            changed += 1;
        }
        Ok(changed)
    }

    fn address(&self, record: &Record) -> Result<(RecordKey, i64), StoreError> {
        let key = record.key(&self.schema.key_fields);
        match record.timestamp(&self.schema.timestamp_field) {
            Some(ts) if !key.has_null() => Ok((key, ts)),
            _ => Err(StoreError::Unkeyed { key }),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.rows.keys()
    }

    /// Every stored row whose key appears in `keys`: what a caller hands the
    /// planner as existing records.
    pub fn existing_for<'a>(&self, keys: impl IntoIterator<Item = &'a RecordKey>) -> Vec<Record> {
        keys.into_iter()
            .filter_map(|k| self.rows.get(k))
            .flat_map(|rows| rows.values().cloned())
            .collect()
    }

    /// All versions of a key, oldest first.
    pub fn history(&self, key: &RecordKey) -> Vec<&Record> {
        self.rows.get(key).map(|rows| rows.values().collect()).unwrap_or_default()
    }

    pub fn current(&self, key: &RecordKey) -> Option<&Record> {
        self.rows.get(key)?.values().next_back()
    }

    /// The version whose effective interval contains `at`.
    pub fn as_of(&self, key: &RecordKey, at: i64) -> Option<&Record> {
        let from = &self.schema.effective_from_field;
        let to = &self.schema.effective_to_field;
        self.rows.get(key)?.values().rev().find(|r| {
            matches!((r.timestamp(from), r.timestamp(to)), (Some(f), Some(t)) if f <= at && at <= t)
        })
    }

    /// Checks every key's timeline is gap-free, overlap-free and ends in exactly
    /// one current row.
    pub fn verify(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        for (key, rows) in &self.rows {
            self.verify_key(key, rows, &mut violations);
        }
        violations.sort_by(|a, b| a.key.cmp(&b.key));
        violations
    }

    fn verify_key(&self, key: &RecordKey, rows: &BTreeMap<i64, Record>, out: &mut Vec<InvariantViolation>) {
        let mut report = |ts: i64, kind: ViolationKind| {
            out.push(InvariantViolation {
                key: key.clone(),
                timestamp: ts,
                kind,
            })
        };
        let from_field = &self.schema.effective_from_field;
        let to_field = &self.schema.effective_to_field;
        let last = rows.len().saturating_sub(1);
        let mut previous_to: Option<i64> = None;

        for (i, (&ts, row)) in rows.iter().enumerate() {
            let (from, to) = match (row.timestamp(from_field), row.timestamp(to_field)) {
                (Some(f), Some(t)) => (f, t),
                _ => {
                    report(ts, ViolationKind::MissingBoundary);
                    previous_to = None;
                    continue;
                }
            };
            if from > to {
                report(ts, ViolationKind::Inverted { from, to });
            }
            if let Some(prev) = previous_to {
                if prev.checked_add(1) != Some(from) {
                    report(ts, ViolationKind::Discontinuous { previous_to: prev, from });
                }
            }
            previous_to = Some(to);

            let is_last = i == last;
            if is_last && to != self.far_future {
                report(ts, ViolationKind::NotOpenEnded { to });
            }
            if let (Some(flag_field), Some((yes, no))) = (&self.schema.current_flag_field, &self.flags) {
                let expected = if is_last { yes } else { no };
                if row.get(flag_field).as_str() != Some(expected.as_str()) {
                    report(ts, ViolationKind::CurrentFlag { expected: expected.clone() });
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    MissingBoundary,
    Inverted { from: i64, to: i64 },
    Discontinuous { previous_to: i64, from: i64 },
    NotOpenEnded { to: i64 },
    CurrentFlag { expected: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub key: RecordKey,
    pub timestamp: i64,
    pub kind: ViolationKind,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key {} row {}: ", self.key, self.timestamp)?;
        match &self.kind {
            ViolationKind::MissingBoundary => write!(f, "missing effective boundary"),
            ViolationKind::Inverted { from, to } => write!(f, "interval {}..{} is inverted", from, to),
            ViolationKind::Discontinuous { previous_to, from } => {
                write!(f, "previous row ends at {} but this one starts at {}", previous_to, from)
            }
            ViolationKind::NotOpenEnded { to } => write!(f, "latest row ends at {} instead of far future", to),
            ViolationKind::CurrentFlag { expected } => write!(f, "current flag should be {:?}", expected),
        }
    }
}
