//! Working timeline for a single business key.
//!
//! Entries are kept sorted by event timestamp. Deciding where an arriving record
//! goes ([`Timeline::locate`]) only reads the timeline; the caller then applies
//! the splice through `push`, `remove` and `entry_mut` and re-sorts.

use crate::model::Record;
use crate::plan::{MutationType, PlannedRecord};

#[derive(Debug, Clone)]
struct Entry {
    ts: i64,
    planned: PlannedRecord,
}

/// Where an arriving record lands relative to the current entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Same timestamp as the entry at this position, different values.
    Correct(usize),
    /// Earlier than the first entry.
    Before(usize),
    /// Strictly between this entry and the next one.
    Between(usize),
    /// Later than the last entry, which sits at this position.
    After(usize),
    /// Already represented; nothing to do.
    Unchanged,
}

#[derive(Debug, Default)]
pub struct Timeline {
    entries: Vec<Entry>,
}

impl Timeline {
    /// `existing` pairs each stored row with its event timestamp.
    pub fn from_existing(existing: impl IntoIterator<Item = (i64, Record)>) -> Self {
        let mut timeline = Self {
            entries: existing
                .into_iter()
                .map(|(ts, record)| Entry {
                    ts,
                    planned: PlannedRecord::unchanged(record),
                })
                .collect(),
        };
        timeline.sort();
        timeline
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn timestamp(&self, position: usize) -> i64 {
        self.entries[position].ts
    }

    pub fn entry(&self, position: usize) -> &PlannedRecord {
        &self.entries[position].planned
    }

    pub fn entry_mut(&mut self, position: usize) -> &mut PlannedRecord {
        &mut self.entries[position].planned
    }

    pub fn push(&mut self, ts: i64, record: Record, mutation: MutationType) {
        self.entries.push(Entry {
            ts,
            planned: PlannedRecord::new(record, mutation),
        });
    }

    pub fn remove(&mut self, position: usize) -> PlannedRecord {
        self.entries.remove(position).planned
    }

    /// Stable, so entries sharing a timestamp keep their relative order.
    pub fn sort(&mut self) {
        self.entries.sort_by_key(|e| e.ts);
    }

    /// Scans left to right and returns the first rule that matches.
    pub fn locate(&self, ts: i64, arrived: &Record, value_fields: &[String]) -> Placement {
        for (position, entry) in self.entries.iter().enumerate() {
            let next_ts = self.entries.get(position + 1).map(|n| n.ts);

            if ts == entry.ts && different(arrived, &entry.planned.record, value_fields) {
                return Placement::Correct(position);
            }
            if position == 0 && ts < entry.ts {
                return Placement::Before(position);
            }
            match next_ts {
                Some(next) if entry.ts < ts && ts < next => return Placement::Between(position),
                None if entry.ts < ts => return Placement::After(position),
                _ => {}
            }
        }
        Placement::Unchanged
    }

    /// Entries whose mutation is not `None`, in timestamp order.
    pub fn into_changes(self) -> Vec<PlannedRecord> {
        self.entries
            .into_iter()
            .map(|e| e.planned)
            .filter(|p| p.mutation != MutationType::None)
            .collect()
    }
}

/// True when any value field differs between the two records.
pub fn different(a: &Record, b: &Record, value_fields: &[String]) -> bool {
    value_fields.iter().any(|f| a.get(f) != b.get(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> Vec<String> {
        vec!["v".to_string()]
    }

    fn row(ts: i64, v: &str) -> (i64, Record) {
        (ts, Record::new().with("ts", ts).with("v", v))
    }

    fn timeline(ts: &[i64]) -> Timeline {
        Timeline::from_existing(ts.iter().map(|&t| row(t, "x")))
    }

    #[test]
    fn existing_rows_are_sorted_and_unchanged() {
        let t = timeline(&[300, 100, 200]);
        assert_eq!((0..t.len()).map(|p| t.timestamp(p)).collect::<Vec<_>>(), vec![100, 200, 300]);
        assert!(t.into_changes().is_empty());
    }

    #[test]
    fn locate_covers_every_rule() {
        let t = timeline(&[100, 200]);
        let probe = |ts: i64, v: &str| t.locate(ts, &row(ts, v).1, &values());

        assert_eq!(probe(50, "x"), Placement::Before(0));
        assert_eq!(probe(150, "x"), Placement::Between(0));
        assert_eq!(probe(250, "x"), Placement::After(1));
        assert_eq!(probe(200, "y"), Placement::Correct(1));
        assert_eq!(probe(100, "x"), Placement::Unchanged);
    }

    #[test]
    fn single_entry_timeline_has_no_between() {
        let t = timeline(&[100]);
        assert_eq!(t.locate(100, &row(100, "x").1, &values()), Placement::Unchanged);
        assert_eq!(t.locate(101, &row(101, "x").1, &values()), Placement::After(0));
    }

    #[test]
    fn no_value_fields_means_never_different() {
        let t = timeline(&[100]);
        assert_eq!(t.locate(100, &row(100, "changed").1, &[]), Placement::Unchanged);
    }

    #[test]
    fn changes_exclude_untouched_rows() {
        let mut t = timeline(&[100, 200]);
        t.entry_mut(1).mark_updated();
        t.push(50, Record::new().with("ts", 50), MutationType::Insert);
        t.sort();
        let changes = t.into_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].mutation, MutationType::Insert);
        assert_eq!(changes[1].mutation, MutationType::Update);
    }
}
