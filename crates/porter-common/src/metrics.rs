use serde::{Deserialize, Serialize};

/// Category holding run-level totals.
pub const RUN_CATEGORY: &str = "run";

/// Category holding one unit's figures.
pub fn unit_category(unit_id: &str) -> String {
    format!("unit:{}", unit_id)
}

/// A single measured value with its unit of measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub value: f64,
    pub unit_of_measure: String,
}

impl MetricValue {
    pub fn new(value: f64, unit_of_measure: &str) -> Self {
        Self {
            value,
            unit_of_measure: unit_of_measure.to_string(),
        }
    }

    pub fn count(value: u64) -> Self {
        Self::new(value as f64, "count")
    }

    pub fn millis(value: u64) -> Self {
        Self::new(value as f64, "ms")
    }

    pub fn usd(value: f64) -> Self {
        Self::new(value, "usd")
    }

    pub fn tokens(value: u64) -> Self {
        Self::new(value as f64, "tokens")
    }

    pub fn flag(value: bool) -> Self {
        Self::new(if value { 1.0 } else { 0.0 }, "bool")
    }
}

/// One row of the metrics table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub run_id: String,
    pub category: String,
    pub key: String,
    pub value: f64,
    pub unit_of_measure: String,
}
