//! Type II slowly-changing-dimension planner.
//!
//! Every version of a key's attributes is kept as its own row, bounded by an
//! effective-from / effective-to interval. Intervals for a key are contiguous,
//! never overlap, and the latest one runs to the far-future sentinel as the
//! current row.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{ConflictPolicy, PlannerConfig};
use crate::error::PlanError;
use crate::model::{Record, RecordKey, Value};
use crate::plan::timeline::{Placement, Timeline};
use crate::plan::{key_groups, BatchPlan, KeyGroup, MutationType, PlannedRecord, Planner};
use crate::schema::SchemaDescriptor;

pub struct HistoryPlanner<C: Clock = SystemClock> {
    config: PlannerConfig,
    clock: C,
}

impl HistoryPlanner<SystemClock> {
    pub fn new(config: PlannerConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> HistoryPlanner<C> {
    pub fn with_clock(config: PlannerConfig, clock: C) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plans already-grouped keys. The schema must have been validated.
    pub fn plan_groups(&self, groups: Vec<KeyGroup>, schema: &SchemaDescriptor) -> BatchPlan {
        let stamp = schema.has_last_updated_field().then(|| self.last_updated_stamp());
        let mut batch = BatchPlan::default();

        for group in groups {
            match self.plan_key(group, schema, stamp.as_ref()) {
                Ok(planned) => batch.planned.extend(planned),
                Err(e) => {
                    match e.key() {
                        Some(key) => warn!("Rejected key {}: {}", key, e),
                        None => warn!("Rejected key group: {}", e),
                    }
                    batch.rejected.push(e);
                }
            }
        }
        batch
    }

    fn last_updated_stamp(&self) -> Value {
        Value::Str(self.clock.now().format(&self.config.last_updated_format).to_string())
    }

    /// Folds one key's arrivals into its existing history.
    pub fn plan_key(
        &self,
        group: KeyGroup,
        schema: &SchemaDescriptor,
        stamp: Option<&Value>,
    ) -> Result<Vec<PlannedRecord>, PlanError> {
        let KeyGroup { key, arriving, existing } = group;
        let mut arrivals = timestamped(&key, arriving, schema)?;
        let existing = timestamped(&key, existing, schema)?;
        if self.config.sort_arriving {
            arrivals.sort_by_key(|(ts, _)| *ts);
        }

        let stamper = Stamper {
            schema,
            config: &self.config,
            stamp,
        };
        let far_future = self.config.far_future();
        let mut timeline = Timeline::from_existing(existing);
        // Timestamps already taken by an arrival of this batch.
        let mut arrived_at = HashSet::new();

        for (ts, mut arrived) in arrivals {
            let repeated = !arrived_at.insert(ts);
            if timeline.is_empty() {
                stamper.open(&mut arrived, ts, far_future, true);
                timeline.push(ts, arrived, MutationType::Insert);
                continue;
            }

            match timeline.locate(ts, &arrived, &schema.value_fields) {
                Placement::Correct(p) => {
                    if repeated && self.config.conflict_policy == ConflictPolicy::Reject {
                        return Err(PlanError::AmbiguousOrder { key, timestamp: ts });
                    }
                    let pending = timeline.entry(p).mutation == MutationType::Insert;
                    let superseded = timeline.remove(p);
                    if self.config.retain_interval_on_correction {
                        stamper.inherit_interval(&mut arrived, &superseded.record);
                    }
                    stamper.touch(&mut arrived);
                    let mutation = if pending { MutationType::Insert } else { MutationType::Update };
                    timeline.push(ts, arrived, mutation);
                }
                Placement::Before(p) => {
                    let to = self.config.preceding(timeline.timestamp(p));
                    stamper.open(&mut arrived, ts, to, false);
                    timeline.push(ts, arrived, MutationType::Insert);
                }
                Placement::Between(p) => {
                    let to = self.config.preceding(timeline.timestamp(p + 1));
                    stamper.open(&mut arrived, ts, to, false);
                    self.carry_forward_when_null(&mut arrived, &timeline.entry(p).record, schema);
                    timeline.push(ts, arrived, MutationType::Insert);
                    stamper.close(timeline.entry_mut(p), self.config.preceding(ts));
                }
                Placement::After(p) => {
                    stamper.open(&mut arrived, ts, far_future, true);
                    self.carry_forward_when_null(&mut arrived, &timeline.entry(p).record, schema);
                    timeline.push(ts, arrived, MutationType::Insert);
                    stamper.close(timeline.entry_mut(p), self.config.preceding(ts));
                }
                Placement::Unchanged => {}
            }

            timeline.sort();
        }

        let changes = timeline.into_changes();
        debug!("Planned {} mutation(s) for key {}", changes.len(), key);
        Ok(changes)
    }

    /// Fills fields that are null on the arriving record from the row it
    /// supersedes. Off unless `carry_forward_when_null` is set.
    fn carry_forward_when_null(&self, arrived: &mut Record, previous: &Record, schema: &SchemaDescriptor) {
        if !self.config.carry_forward_when_null {
            return;
        }
        for field in schema.shape_of(arrived, previous) {
            if arrived.get(&field).is_null() && !previous.get(&field).is_null() {
                let value = previous.get(&field).clone();
                arrived.put(field, value);
            }
        }
    }
}

impl<C: Clock> Planner for HistoryPlanner<C> {
    fn plan_mutations(
        &self,
        arriving: Vec<Record>,
        existing: Vec<Record>,
        schema: &SchemaDescriptor,
    ) -> Result<BatchPlan, PlanError> {
        schema.validate()?;
        let groups = key_groups(arriving, existing, &schema.key_fields);
        Ok(self.plan_groups(groups, schema))
    }

    fn requires_existing_records(&self) -> bool {
        true
    }

    fn requires_key_colocation(&self) -> bool {
        true
    }

    fn emitted_mutation_types(&self) -> HashSet<MutationType> {
        HashSet::from([MutationType::Insert, MutationType::Update])
    }
}

/// Writes interval, flag and last-updated fields according to the schema.
struct Stamper<'a> {
    schema: &'a SchemaDescriptor,
    config: &'a PlannerConfig,
    stamp: Option<&'a Value>,
}

impl Stamper<'_> {
    fn open(&self, record: &mut Record, from: i64, to: i64, current: bool) {
        record.put(self.schema.effective_from_field.as_str(), Value::Timestamp(from));
        record.put(self.schema.effective_to_field.as_str(), Value::Timestamp(to));
        self.flag(record, current);
        self.touch(record);
    }

    /// Ends `planned` at `to` and demotes it from current.
    fn close(&self, planned: &mut PlannedRecord, to: i64) {
        planned.record.put(self.schema.effective_to_field.as_str(), Value::Timestamp(to));
        self.flag(&mut planned.record, false);
        self.touch(&mut planned.record);
        planned.mark_updated();
    }

    fn inherit_interval(&self, record: &mut Record, superseded: &Record) {
        let mut fields = vec![&self.schema.effective_from_field, &self.schema.effective_to_field];
        fields.extend(self.schema.current_flag_field.as_ref());
        for field in fields {
            record.put(field.as_str(), superseded.get(field).clone());
        }
    }

    fn flag(&self, record: &mut Record, current: bool) {
        if let Some(field) = &self.schema.current_flag_field {
            let flag = if current { &self.config.current_flag_yes } else { &self.config.current_flag_no };
            record.put(field.as_str(), flag.as_str());
        }
    }

    fn touch(&self, record: &mut Record) {
        if let (Some(field), Some(stamp)) = (&self.schema.last_updated_field, self.stamp) {
            record.put(field.as_str(), stamp.clone());
        }
    }
}

/// Checks key and timestamp presence and pairs each record with its timestamp.
fn timestamped(key: &RecordKey, records: Vec<Record>, schema: &SchemaDescriptor) -> Result<Vec<(i64, Record)>, PlanError> {
    records
        .into_iter()
        .map(|record| {
            if let Some(field) = schema.key_fields.iter().find(|f| record.get(f).is_null()) {
                return Err(PlanError::invalid(key, format!("key field '{}' is null", field)));
            }
            let field = &schema.timestamp_field;
            match record.timestamp(field) {
                Some(ts) => Ok((ts, record)),
                None if record.get(field).is_null() => {
                    Err(PlanError::invalid(key, format!("timestamp field '{}' is null", field)))
                }
                None => Err(PlanError::invalid(
                    key,
                    format!("timestamp field '{}' holds non-integer {}", field, record.get(field)),
                )),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    const FAR: i64 = 253_402_214_400_000;

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::builder()
            .key(["id"])
            .timestamp("ts")
            .values(["name"])
            .effective("from", "to")
            .current_flag("current")
            .last_updated("updated")
            .build()
    }

    fn planner(config: PlannerConfig) -> HistoryPlanner<FixedClock> {
        HistoryPlanner::with_clock(config, FixedClock::from_millis(0))
    }

    fn obs(ts: i64, name: &str) -> Record {
        Record::new().with("id", "k").with("ts", ts).with("name", name)
    }

    fn stored(ts: i64, name: &str, from: i64, to: i64, current: &str) -> Record {
        obs(ts, name)
            .with("from", Value::Timestamp(from))
            .with("to", Value::Timestamp(to))
            .with("current", current)
    }

    fn plan(config: PlannerConfig, arriving: Vec<Record>, existing: Vec<Record>) -> Vec<PlannedRecord> {
        planner(config)
            .plan_mutations(arriving, existing, &schema())
            .unwrap()
            .into_result()
            .unwrap()
    }

    fn interval(p: &PlannedRecord) -> (i64, i64, &str) {
        (
            p.record.timestamp("from").unwrap(),
            p.record.timestamp("to").unwrap(),
            p.record.get("current").as_str().unwrap(),
        )
    }

    #[test]
    fn first_arrival_opens_current_row() {
        let out = plan(PlannerConfig::default(), vec![obs(100, "a")], vec![]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].mutation, MutationType::Insert);
        assert_eq!(interval(&out[0]), (100, FAR, "Y"));
        assert_eq!(out[0].record.get("updated"), &Value::from("1970-01-01 00:00:00.000"));
    }

    #[test]
    fn repeated_arrival_in_empty_history_is_deduplicated() {
        let out = plan(PlannerConfig::default(), vec![obs(100, "a"), obs(100, "a")], vec![]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn between_shrinks_predecessor_end() {
        let existing = vec![stored(100, "a", 100, 199, "N"), stored(200, "b", 200, FAR, "Y")];
        let out = plan(PlannerConfig::default(), vec![obs(150, "c")], existing);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].mutation, MutationType::Update);
        assert_eq!(interval(&out[0]), (100, 149, "N"));
        assert_eq!(out[1].mutation, MutationType::Insert);
        assert_eq!(interval(&out[1]), (150, 199, "N"));
    }

    #[test]
    fn closing_a_pending_insert_keeps_it_an_insert() {
        let out = plan(PlannerConfig::default(), vec![obs(100, "a"), obs(200, "b")], vec![]);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|p| p.mutation == MutationType::Insert));
        assert_eq!(interval(&out[0]), (100, 199, "N"));
        assert_eq!(interval(&out[1]), (200, FAR, "Y"));
    }

    #[test]
    fn correction_of_pending_insert_replaces_it() {
        let out = plan(PlannerConfig::default(), vec![obs(100, "a"), obs(100, "b")], vec![]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].mutation, MutationType::Insert);
        assert_eq!(out[0].record.get("name"), &Value::from("b"));
        assert_eq!(interval(&out[0]), (100, FAR, "Y"));
    }

    #[test]
    fn correction_conflict_can_be_rejected() {
        let config = PlannerConfig {
            conflict_policy: ConflictPolicy::Reject,
            ..Default::default()
        };
        let batch = planner(config)
            .plan_mutations(vec![obs(100, "a"), obs(100, "b")], vec![], &schema())
            .unwrap();
        assert!(batch.planned.is_empty());
        assert!(matches!(batch.rejected[0], PlanError::AmbiguousOrder { timestamp: 100, .. }));
    }

    #[test]
    fn conflicting_corrections_of_a_stored_row_can_be_rejected() {
        let config = PlannerConfig {
            conflict_policy: ConflictPolicy::Reject,
            ..Default::default()
        };
        let existing = vec![stored(100, "a", 100, FAR, "Y")];
        let batch = planner(config.clone())
            .plan_mutations(vec![obs(100, "b"), obs(100, "c")], existing.clone(), &schema())
            .unwrap();
        assert!(batch.planned.is_empty());
        assert_eq!(batch.rejected.len(), 1);
        assert!(matches!(batch.rejected[0], PlanError::AmbiguousOrder { timestamp: 100, .. }));

        // A single correction of the stored row is not a conflict.
        let out = plan(config, vec![obs(100, "b")], existing);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].mutation, MutationType::Update);
    }

    #[test]
    fn correction_after_close_keeps_the_closed_interval() {
        let existing = vec![stored(100, "a", 100, FAR, "Y")];
        let out = plan(PlannerConfig::default(), vec![obs(200, "b"), obs(100, "a2")], existing);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].mutation, MutationType::Update);
        assert_eq!(out[0].record.get("name"), &Value::from("a2"));
        assert_eq!(interval(&out[0]), (100, 199, "N"));
    }

    #[test]
    fn literal_correction_drops_interval_fields() {
        let config = PlannerConfig {
            retain_interval_on_correction: false,
            ..Default::default()
        };
        let existing = vec![stored(100, "a", 100, FAR, "Y")];
        let out = plan(config, vec![obs(100, "b")], existing);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].mutation, MutationType::Update);
        assert!(out[0].record.get("from").is_null());
        assert!(out[0].record.get("to").is_null());
    }

    #[test]
    fn arrival_order_is_honoured_unless_sorting_is_enabled() {
        let config = PlannerConfig {
            carry_forward_when_null: true,
            ..Default::default()
        };
        let sparse = Record::new().with("id", "k").with("ts", 200).with("name", Value::Null);
        let arriving = vec![sparse, obs(150, "a")];

        // 200 is folded first, so 150 goes in front of it and nothing carries.
        let unsorted = plan(config.clone(), arriving.clone(), vec![]);
        assert_eq!(interval(&unsorted[0]), (150, 199, "N"));
        assert!(unsorted[1].record.get("name").is_null());

        let sorted = plan(
            PlannerConfig {
                sort_arriving: true,
                ..config
            },
            arriving,
            vec![],
        );
        assert_eq!(interval(&sorted[0]), (150, 199, "N"));
        assert_eq!(interval(&sorted[1]), (200, FAR, "Y"));
        assert_eq!(sorted[1].record.get("name"), &Value::from("a"));
    }

    #[test]
    fn optional_fields_are_not_stamped_when_unconfigured() {
        let schema = SchemaDescriptor::builder()
            .key(["id"])
            .timestamp("ts")
            .values(["name"])
            .effective("from", "to")
            .build();
        let batch = planner(PlannerConfig::default())
            .plan_mutations(vec![obs(100, "a")], vec![], &schema)
            .unwrap();
        let record = &batch.planned[0].record;
        assert!(!record.contains("current"));
        assert!(!record.contains("updated"));
    }

    #[test]
    fn null_key_and_bad_timestamp_fail_only_their_key() {
        let arriving = vec![
            Record::new().with("id", Value::Null).with("ts", 1),
            Record::new().with("id", "bad_ts").with("ts", "yesterday"),
            obs(100, "a"),
        ];
        let batch = planner(PlannerConfig::default())
            .plan_mutations(arriving, vec![], &schema())
            .unwrap();
        assert_eq!(batch.planned.len(), 1);
        assert_eq!(batch.rejected.len(), 2);
        assert!(batch.rejected.iter().all(|e| matches!(e, PlanError::InvalidRecord { .. })));
    }

    #[test]
    fn invalid_schema_fails_the_batch() {
        let mut schema = schema();
        schema.key_fields.clear();
        let result = planner(PlannerConfig::default()).plan_mutations(vec![obs(1, "a")], vec![], &schema);
        assert!(matches!(result, Err(PlanError::Configuration(_))));
    }

    #[test]
    fn capability_declarations() {
        let p = planner(PlannerConfig::default());
        assert!(p.requires_existing_records());
        assert!(p.requires_key_colocation());
        assert_eq!(
            p.emitted_mutation_types(),
            HashSet::from([MutationType::Insert, MutationType::Update])
        );
    }
}
