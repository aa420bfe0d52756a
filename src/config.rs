//! Downsample run configuration
//!
//! Everything the engine needs to know about one shard run: the bucket
//! interval and time zone, the timestamp field, the metric and label field
//! lists, and the shard-level task parameters. All configuration is
//! validated up front; the engine itself never re-checks it.

use crate::types::ShardId;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Default timestamp field name
pub const DEFAULT_TIMESTAMP_FIELD: &str = "@timestamp";

/// Calendar units supported for calendar-aligned intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarUnit {
    /// Civil minute boundary
    Minute,
    /// Civil hour boundary
    Hour,
    /// Civil day boundary (local midnight)
    Day,
    /// ISO week boundary (Monday midnight)
    Week,
    /// First of the month, local midnight
    Month,
    /// First month of the quarter, local midnight
    Quarter,
    /// January 1st, local midnight
    Year,
}

/// The downsample bucket interval
///
/// Fixed intervals are an exact number of milliseconds aligned to the epoch
/// (translated by the zone offset); calendar intervals align to civil
/// calendar boundaries in the configured zone, respecting DST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownsampleInterval {
    /// Fixed-duration interval in milliseconds
    Fixed {
        /// Interval length in milliseconds, must be > 0
        millis: i64,
    },
    /// Calendar-aligned interval
    Calendar {
        /// The calendar unit to align buckets to
        unit: CalendarUnit,
    },
}

impl DownsampleInterval {
    /// Fixed interval of `n` minutes
    pub fn minutes(n: i64) -> Self {
        DownsampleInterval::Fixed {
            millis: n * 60_000,
        }
    }

    /// Fixed interval of `n` hours
    pub fn hours(n: i64) -> Self {
        DownsampleInterval::Fixed {
            millis: n * 3_600_000,
        }
    }

    /// Calendar interval of one unit
    pub fn calendar(unit: CalendarUnit) -> Self {
        DownsampleInterval::Calendar { unit }
    }
}

/// Configuration for the downsample operation itself
#[derive(Debug, Clone)]
pub struct DownsampleConfig {
    /// The bucket interval
    pub interval: DownsampleInterval,
    /// Time zone used to interpret the interval
    pub time_zone: Tz,
    /// Name of the timestamp field in source and target documents
    pub timestamp_field: String,
}

impl DownsampleConfig {
    /// Create a config with UTC and the default timestamp field
    pub fn new(interval: DownsampleInterval) -> Self {
        Self {
            interval,
            time_zone: chrono_tz::UTC,
            timestamp_field: DEFAULT_TIMESTAMP_FIELD.to_string(),
        }
    }

    /// Override the time zone
    pub fn with_time_zone(mut self, tz: Tz) -> Self {
        self.time_zone = tz;
        self
    }

    /// Override the timestamp field name
    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = field.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if let DownsampleInterval::Fixed { millis } = self.interval {
            if millis <= 0 {
                return Err(format!("fixed interval must be > 0, got {millis}"));
            }
        }
        if self.timestamp_field.is_empty() {
            return Err("timestamp_field must not be empty".to_string());
        }
        Ok(())
    }
}

/// Metric kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Sampled measurement; buckets keep min/max/sum/value_count
    Gauge,
    /// Cumulative measurement; buckets keep the last observed value
    Counter,
}

/// Sub-aggregations a gauge producer can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaugeAggregation {
    /// Smallest value in the bucket
    Min,
    /// Largest value in the bucket
    Max,
    /// Compensated sum of all values in the bucket
    Sum,
    /// Number of values in the bucket
    ValueCount,
}

impl GaugeAggregation {
    /// All four sub-aggregations, in output order
    pub const ALL: [GaugeAggregation; 4] = [
        GaugeAggregation::Min,
        GaugeAggregation::Max,
        GaugeAggregation::Sum,
        GaugeAggregation::ValueCount,
    ];

    /// Output sub-field key
    pub fn key(&self) -> &'static str {
        match self {
            GaugeAggregation::Min => "min",
            GaugeAggregation::Max => "max",
            GaugeAggregation::Sum => "sum",
            GaugeAggregation::ValueCount => "value_count",
        }
    }
}

/// Configuration for one metric field
#[derive(Debug, Clone)]
pub struct MetricFieldConfig {
    /// Doc-values field to read from the source
    pub field: String,
    /// Output field name in the rollup document
    ///
    /// Equal to `field` for plain metrics. Sub-fields of an
    /// aggregate-metric source share the parent's name here, which makes
    /// the bucket builder compose them into one object field.
    pub name: String,
    /// Gauge or counter semantics
    pub metric_type: MetricType,
    /// Sub-aggregations this producer contributes (gauges only)
    pub aggregations: Vec<GaugeAggregation>,
}

impl MetricFieldConfig {
    /// A plain gauge carrying all four sub-aggregations
    pub fn gauge(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            name: field.clone(),
            field,
            metric_type: MetricType::Gauge,
            aggregations: GaugeAggregation::ALL.to_vec(),
        }
    }

    /// A counter metric
    pub fn counter(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            name: field.clone(),
            field,
            metric_type: MetricType::Counter,
            aggregations: Vec::new(),
        }
    }

    /// One sub-field of an aggregate-metric source
    ///
    /// `field` is the concrete doc-values sub-field (for example
    /// `load.max`), `name` the shared output field (`load`), and
    /// `aggregations` the statistics this sub-field feeds.
    pub fn gauge_component(
        field: impl Into<String>,
        name: impl Into<String>,
        aggregations: Vec<GaugeAggregation>,
    ) -> Self {
        Self {
            field: field.into(),
            name: name.into(),
            metric_type: MetricType::Gauge,
            aggregations,
        }
    }
}

/// Configuration for one label field
#[derive(Debug, Clone)]
pub struct LabelFieldConfig {
    /// Doc-values field to read and pass through
    pub field: String,
}

impl LabelFieldConfig {
    /// Create a label config
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

/// Shard-level task parameters
#[derive(Debug, Clone)]
pub struct ShardTaskParams {
    /// Target index the rollup documents are written to
    pub target_index: String,
    /// The source shard being downsampled
    pub shard_id: ShardId,
    /// Start of the index's time-series window; bucket starts are clamped
    /// to this value
    pub series_start_ms: i64,
    /// End of the index's time-series window
    pub series_end_ms: i64,
}

impl ShardTaskParams {
    /// Validate the parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.target_index.is_empty() {
            return Err("target_index must not be empty".to_string());
        }
        if self.series_start_ms > self.series_end_ms {
            return Err(format!(
                "series window start {} is after end {}",
                self.series_start_ms, self.series_end_ms
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_config_validation() {
        let config = DownsampleConfig::new(DownsampleInterval::hours(1));
        assert!(config.validate().is_ok());

        let config = DownsampleConfig::new(DownsampleInterval::Fixed { millis: 0 });
        assert!(config.validate().is_err());

        let config =
            DownsampleConfig::new(DownsampleInterval::hours(1)).with_timestamp_field("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_interval_helpers() {
        assert_eq!(
            DownsampleInterval::minutes(15),
            DownsampleInterval::Fixed { millis: 900_000 }
        );
        assert_eq!(
            DownsampleInterval::hours(2),
            DownsampleInterval::Fixed { millis: 7_200_000 }
        );
    }

    #[test]
    fn test_metric_field_constructors() {
        let gauge = MetricFieldConfig::gauge("cpu");
        assert_eq!(gauge.name, "cpu");
        assert_eq!(gauge.aggregations.len(), 4);

        let counter = MetricFieldConfig::counter("requests");
        assert_eq!(counter.metric_type, MetricType::Counter);
        assert!(counter.aggregations.is_empty());

        let component =
            MetricFieldConfig::gauge_component("load.max", "load", vec![GaugeAggregation::Max]);
        assert_eq!(component.field, "load.max");
        assert_eq!(component.name, "load");
    }

    #[test]
    fn test_shard_task_params_validation() {
        let params = ShardTaskParams {
            target_index: "downsample-1h".to_string(),
            shard_id: ShardId::new("metrics", 0),
            series_start_ms: 0,
            series_end_ms: 1000,
        };
        assert!(params.validate().is_ok());

        let inverted = ShardTaskParams {
            series_start_ms: 2000,
            ..params.clone()
        };
        assert!(inverted.validate().is_err());

        let no_target = ShardTaskParams {
            target_index: String::new(),
            ..params
        };
        assert!(no_target.validate().is_err());
    }
}
