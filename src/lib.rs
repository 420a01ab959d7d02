//! Type II slowly-changing-dimension history planning.
//!
//! Given arriving observations and the stored history for their keys, the
//! [`HistoryPlanner`] works out which rows to insert and which to update so each
//! key keeps a contiguous, non-overlapping timeline with one current row.

pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod plan;
pub mod schema;
pub mod storage;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConflictPolicy, PlannerConfig, TimestampUnit};
pub use error::{ConfigError, PlanError, StoreError};
pub use manager::{PlanManager, SystemProfile};
pub use model::{Record, RecordKey, Value};
pub use plan::history::HistoryPlanner;
pub use plan::{BatchPlan, KeyGroup, MutationType, PlannedRecord, Planner};
pub use schema::SchemaDescriptor;
pub use storage::{HistoryStore, InvariantViolation};
