use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread;

use seahash::SeaHasher;
use tokio::task::JoinSet;
use tracing::info;

use crate::clock::Clock;
use crate::error::PlanError;
use crate::model::{Record, RecordKey};
use crate::plan::history::HistoryPlanner;
use crate::plan::{key_groups, BatchPlan, KeyGroup, MutationType};
use crate::schema::SchemaDescriptor;

#[derive(Debug, Clone)]
pub struct SystemProfile {
    pub logical_cores: usize,
    pub worker_threads: usize,
}

impl SystemProfile {
    pub fn detect() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        // Single core still gets a second thread so the runtime can drive I/O
        // while one bucket is planning.
        let worker_threads = if cores <= 1 { 2 } else { cores };

        Self {
            logical_cores: cores,
            worker_threads,
        }
    }
}

/// Runs a batch across worker buckets.
///
/// Keys are hashed into buckets so every record of a key lands in the same
/// bucket; each bucket is folded sequentially on Tokio's blocking pool.
pub struct PlanManager<C: Clock + 'static> {
    planner: Arc<HistoryPlanner<C>>,
    workers: usize,
}

impl<C: Clock + 'static> PlanManager<C> {
    pub fn new(planner: HistoryPlanner<C>, profile: &SystemProfile) -> Self {
        Self::with_workers(planner, profile.worker_threads)
    }

    pub fn with_workers(planner: HistoryPlanner<C>, workers: usize) -> Self {
        Self {
            planner: Arc::new(planner),
            workers: workers.max(1),
        }
    }

    pub fn planner(&self) -> &HistoryPlanner<C> {
        &self.planner
    }

    pub async fn plan(
        &self,
        arriving: Vec<Record>,
        existing: Vec<Record>,
        schema: &SchemaDescriptor,
    ) -> Result<BatchPlan, PlanError> {
        schema.validate()?;

        let groups = key_groups(arriving, existing, &schema.key_fields);
        let key_count = groups.len();
        let buckets = partition(groups, self.workers);
        let schema = Arc::new(schema.clone());

        let mut tasks = JoinSet::new();
        for (index, bucket) in buckets.into_iter().enumerate().filter(|(_, b)| !b.is_empty()) {
            let planner = Arc::clone(&self.planner);
            let schema = Arc::clone(&schema);
            tasks.spawn_blocking(move || (index, planner.plan_groups(bucket, &schema)));
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.map_err(|e| PlanError::Worker(e.to_string()))?);
        }
        results.sort_by_key(|(index, _)| *index);

        let mut batch = BatchPlan::default();
        for (_, part) in results {
            batch.merge(part);
        }

        info!(
            "Planned {} key(s) on {} worker(s): {} insert(s), {} update(s), {} rejected",
            key_count,
            self.workers,
            batch.count(MutationType::Insert),
            batch.count(MutationType::Update),
            batch.rejected.len()
        );
        Ok(batch)
    }
}

pub fn bucket_of(key: &RecordKey, buckets: usize) -> usize {
    let mut hasher = SeaHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % buckets.max(1) as u64) as usize
}

fn partition(groups: Vec<KeyGroup>, buckets: usize) -> Vec<Vec<KeyGroup>> {
    let mut out: Vec<Vec<KeyGroup>> = (0..buckets).map(|_| Vec::new()).collect();
    for group in groups {
        out[bucket_of(&group.key, buckets)].push(group);
    }
    out
}
