use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 9999-12-31T00:00:00Z in seconds since the epoch.
const FAR_FUTURE_SECS: i64 = 253_402_214_400;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimestampUnit {
    Seconds,
    #[default]
    Millis,
    Micros,
    Nanos,
}

impl TimestampUnit {
    /// 9999-12-31 in this unit. Nanoseconds cannot reach that date in an i64,
    /// so the nanosecond sentinel is clamped to `i64::MAX` (2262-04-11).
    pub fn far_future(self) -> i64 {
        let per_sec: i64 = match self {
            TimestampUnit::Seconds => 1,
            TimestampUnit::Millis => 1_000,
            TimestampUnit::Micros => 1_000_000,
            TimestampUnit::Nanos => 1_000_000_000,
        };
        FAR_FUTURE_SECS.saturating_mul(per_sec)
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "s" | "sec" | "seconds" => Some(TimestampUnit::Seconds),
            "ms" | "millis" | "milliseconds" => Some(TimestampUnit::Millis),
            "us" | "micros" | "microseconds" => Some(TimestampUnit::Micros),
            "ns" | "nanos" | "nanoseconds" => Some(TimestampUnit::Nanos),
            _ => None,
        }
    }
}

/// What to do when two arrivals in one batch hit the same key and timestamp with
/// different values.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The later arrival replaces the earlier one.
    #[default]
    LastWins,
    /// Fail the key group with `PlanError::AmbiguousOrder`.
    Reject,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PlannerConfig {
    pub carry_forward_when_null: bool,
    pub timestamp_unit: TimestampUnit,
    /// Overrides the unit's 9999-12-31 sentinel.
    pub far_future: Option<i64>,
    pub current_flag_yes: String,
    pub current_flag_no: String,
    pub last_updated_format: String,
    pub sort_arriving: bool,
    pub retain_interval_on_correction: bool,
    pub conflict_policy: ConflictPolicy,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            carry_forward_when_null: false,
            timestamp_unit: TimestampUnit::Millis,
            far_future: None,
            current_flag_yes: "Y".into(),
            current_flag_no: "N".into(),
            last_updated_format: "%Y-%m-%d %H:%M:%S%.3f".into(),
            sort_arriving: false,
            retain_interval_on_correction: true,
            conflict_policy: ConflictPolicy::LastWins,
        }
    }
}

impl PlannerConfig {
    pub fn far_future(&self) -> i64 {
        self.far_future.unwrap_or_else(|| self.timestamp_unit.far_future())
    }

    /// The boundary one unit before `ts`.
    pub fn preceding(&self, ts: i64) -> i64 {
        ts.saturating_sub(1)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Builds a config from dotted planner properties, e.g.
    /// `carry.forward.when.null=true`. Unknown keys are ignored.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (property, value) in props {
            let bad = || ConfigError::Property {
                property: property.clone(),
                value: value.clone(),
            };
            match property.as_str() {
                "carry.forward.when.null" => config.carry_forward_when_null = parse_bool(value).ok_or_else(bad)?,
                "timestamp.unit" => config.timestamp_unit = TimestampUnit::parse(value).ok_or_else(bad)?,
                "far.future" => config.far_future = Some(value.trim().parse().map_err(|_| bad())?),
                "current.flag.yes" => config.current_flag_yes = value.clone(),
                "current.flag.no" => config.current_flag_no = value.clone(),
                "last.updated.format" => config.last_updated_format = value.clone(),
                "sort.arriving" => config.sort_arriving = parse_bool(value).ok_or_else(bad)?,
                "retain.interval.on.correction" => {
                    config.retain_interval_on_correction = parse_bool(value).ok_or_else(bad)?
                }
                "conflict.policy" => {
                    config.conflict_policy = match value.trim().to_ascii_lowercase().as_str() {
                        "last_wins" | "last-wins" => ConflictPolicy::LastWins,
                        "reject" => ConflictPolicy::Reject,
                        _ => return Err(bad()),
                    }
                }
                _ => {}
            }
        }
        Ok(config)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults_match_millisecond_history() {
        let config = PlannerConfig::default();
        assert!(!config.carry_forward_when_null);
        assert_eq!(config.far_future(), 253_402_214_400_000);
        assert_eq!(config.preceding(100), 99);
        assert_eq!(config.current_flag_yes, "Y");
    }

    #[test]
    fn sentinel_follows_unit_unless_overridden() {
        let mut config = PlannerConfig {
            timestamp_unit: TimestampUnit::Seconds,
            ..Default::default()
        };
        assert_eq!(config.far_future(), 253_402_214_400);
        config.far_future = Some(i64::MAX);
        assert_eq!(config.far_future(), i64::MAX);
    }

    #[test]
    fn sentinel_for_every_unit() {
        assert_eq!(TimestampUnit::Seconds.far_future(), 253_402_214_400);
        assert_eq!(TimestampUnit::Millis.far_future(), 253_402_214_400_000);
        assert_eq!(TimestampUnit::Micros.far_future(), 253_402_214_400_000_000);
        assert_eq!(TimestampUnit::Nanos.far_future(), i64::MAX);

        let config = PlannerConfig {
            timestamp_unit: TimestampUnit::Nanos,
            ..Default::default()
        };
        assert_eq!(config.far_future(), i64::MAX);
        assert!(config.preceding(config.far_future()) < config.far_future());
    }

    #[test]
    fn properties_enable_carry_forward() {
        let config = PlannerConfig::from_properties(&props(&[
            ("carry.forward.when.null", "true"),
            ("timestamp.unit", "us"),
            ("conflict.policy", "reject"),
            ("unrelated.key", "whatever"),
        ]))
        .unwrap();
        assert!(config.carry_forward_when_null);
        assert_eq!(config.timestamp_unit, TimestampUnit::Micros);
        assert_eq!(config.conflict_policy, ConflictPolicy::Reject);
    }

    #[test]
    fn bad_property_value_is_reported() {
        let err = PlannerConfig::from_properties(&props(&[("carry.forward.when.null", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::Property { .. }));
    }

    #[test]
    fn json_config_fills_missing_fields_with_defaults() {
        let config: PlannerConfig = serde_json::from_str(r#"{"carry_forward_when_null": true, "timestamp_unit": "seconds"}"#).unwrap();
        assert!(config.carry_forward_when_null);
        assert_eq!(config.current_flag_no, "N");
        assert!(config.retain_interval_on_correction);
    }
}
