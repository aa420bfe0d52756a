//! Per-field bucket accumulators
//!
//! One [`FieldProducer`] exists per configured metric or label field. The
//! collector feeds every producer the doc-values of each document landing
//! in the open bucket; at bucket boundaries the bucket builder asks each
//! producer (or group of producers sharing an output name) to write its
//! field fragment into the rollup document and then resets it.
//!
//! Because the stream is timestamp-descending within a series, the first
//! value a counter or label producer sees in a bucket is the latest one,
//! so "last observed" selection is simply first-write-wins.

use crate::config::{GaugeAggregation, LabelFieldConfig, MetricFieldConfig, MetricType};
use crate::error::FieldSetupError;
use crate::numeric::KahanSum;
use crate::types::FieldValue;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Accumulated gauge statistics for one bucket
#[derive(Debug, Clone, Copy, Default)]
pub struct GaugeState {
    min: f64,
    max: f64,
    sum: KahanSum,
    value_count: u64,
}

impl GaugeState {
    fn collect(&mut self, value: f64) {
        if self.value_count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum.add(value);
        self.value_count += 1;
    }

    fn reset(&mut self) {
        *self = GaugeState::default();
    }

    fn is_empty(&self) -> bool {
        self.value_count == 0
    }

    /// The statistic for one sub-aggregation
    fn stat(&self, aggregation: GaugeAggregation) -> Value {
        match aggregation {
            GaugeAggregation::Min => json_f64(self.min),
            GaugeAggregation::Max => json_f64(self.max),
            GaugeAggregation::Sum => json_f64(self.sum.value()),
            GaugeAggregation::ValueCount => Value::from(self.value_count),
        }
    }
}

fn json_f64(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// A per-field accumulator
///
/// Variants cover the three field kinds the engine rolls up. Doc-count
/// accumulation lives on the bucket builder itself since it is not tied to
/// a doc-values field.
#[derive(Debug, Clone)]
pub enum FieldProducer {
    /// Numeric gauge: min/max/compensated-sum/value_count per bucket
    Gauge {
        /// Doc-values field to read
        field: String,
        /// Output field name (shared across aggregate-metric sub-fields)
        name: String,
        /// Sub-aggregations this producer contributes
        aggregations: Vec<GaugeAggregation>,
        /// Running statistics for the open bucket
        state: GaugeState,
    },
    /// Counter: the last observed value in the bucket
    Counter {
        /// Doc-values field to read; also the output name
        field: String,
        /// First-seen (latest) value in the open bucket
        last: Option<FieldValue>,
    },
    /// Label: typed passthrough of the last observed value(s)
    Label {
        /// Doc-values field to read; also the output name
        field: String,
        /// First-seen (latest) values in the open bucket
        last: Option<Vec<FieldValue>>,
    },
}

impl FieldProducer {
    /// Output field name in the rollup document
    pub fn name(&self) -> &str {
        match self {
            FieldProducer::Gauge { name, .. } => name,
            FieldProducer::Counter { field, .. } | FieldProducer::Label { field, .. } => field,
        }
    }

    /// Doc-values field this producer reads
    pub fn source_field(&self) -> &str {
        match self {
            FieldProducer::Gauge { field, .. }
            | FieldProducer::Counter { field, .. }
            | FieldProducer::Label { field, .. } => field,
        }
    }

    /// Fold one document's values for this field into the open bucket
    ///
    /// Non-numeric values on metric fields are skipped and do not advance
    /// `value_count`.
    pub fn collect(&mut self, values: &[FieldValue]) {
        match self {
            FieldProducer::Gauge { state, .. } => {
                for value in values {
                    if let Some(v) = value.as_f64() {
                        state.collect(v);
                    }
                }
            }
            FieldProducer::Counter { last, .. } => {
                if last.is_none() {
                    *last = values.first().cloned();
                }
            }
            FieldProducer::Label { last, .. } => {
                if last.is_none() && !values.is_empty() {
                    *last = Some(values.to_vec());
                }
            }
        }
    }

    /// Discard accumulated state at a bucket boundary
    pub fn reset(&mut self) {
        match self {
            FieldProducer::Gauge { state, .. } => state.reset(),
            FieldProducer::Counter { last, .. } => *last = None,
            FieldProducer::Label { last, .. } => *last = None,
        }
    }

    /// Whether the open bucket saw no values for this field
    pub fn is_empty(&self) -> bool {
        match self {
            FieldProducer::Gauge { state, .. } => state.is_empty(),
            FieldProducer::Counter { last, .. } => last.is_none(),
            FieldProducer::Label { last, .. } => last.is_none(),
        }
    }

    /// Append this producer's field fragment to a rollup document
    ///
    /// Empty producers write nothing: a field with no values in the bucket
    /// is absent from the output, same as in the source.
    pub fn write(&self, out: &mut Map<String, Value>) {
        match self {
            FieldProducer::Gauge {
                name,
                aggregations,
                state,
                ..
            } => {
                if state.is_empty() {
                    return;
                }
                let mut sub = Map::with_capacity(aggregations.len());
                for aggregation in GaugeAggregation::ALL {
                    if aggregations.contains(&aggregation) {
                        sub.insert(aggregation.key().to_string(), state.stat(aggregation));
                    }
                }
                out.insert(name.clone(), Value::Object(sub));
            }
            FieldProducer::Counter { field, last } => {
                if let Some(value) = last {
                    out.insert(field.clone(), value.to_json());
                }
            }
            FieldProducer::Label { field, last } => {
                if let Some(values) = last {
                    let json = match values.as_slice() {
                        [single] => single.to_json(),
                        many => Value::Array(many.iter().map(FieldValue::to_json).collect()),
                    };
                    out.insert(field.clone(), json);
                }
            }
        }
    }

    fn gauge_parts(&self) -> Option<(&[GaugeAggregation], &GaugeState)> {
        match self {
            FieldProducer::Gauge {
                aggregations,
                state,
                ..
            } => Some((aggregations, state)),
            _ => None,
        }
    }
}

/// Write a group of gauge producers sharing one output name
///
/// Used when the source field is itself an aggregate-metric: each
/// sub-producer feeds one or more statistics, and the combined object field
/// takes `min(mins)`, `max(maxes)`, `sum(sums)` and `sum(value_counts)`.
pub fn write_composite(name: &str, members: &[&FieldProducer], out: &mut Map<String, Value>) {
    let mut min: Option<f64> = None;
    let mut max: Option<f64> = None;
    let mut sum: Option<f64> = None;
    let mut value_count: Option<u64> = None;

    for member in members {
        let Some((aggregations, state)) = member.gauge_parts() else {
            continue;
        };
        if state.is_empty() {
            continue;
        }
        for aggregation in aggregations {
            match aggregation {
                GaugeAggregation::Min => {
                    min = Some(min.map_or(state.min, |m| m.min(state.min)));
                }
                GaugeAggregation::Max => {
                    max = Some(max.map_or(state.max, |m| m.max(state.max)));
                }
                GaugeAggregation::Sum => {
                    sum = Some(sum.unwrap_or(0.0) + state.sum.value());
                }
                GaugeAggregation::ValueCount => {
                    value_count = Some(value_count.unwrap_or(0) + state.value_count);
                }
            }
        }
    }

    let mut sub = Map::new();
    if let Some(v) = min {
        sub.insert("min".to_string(), json_f64(v));
    }
    if let Some(v) = max {
        sub.insert("max".to_string(), json_f64(v));
    }
    if let Some(v) = sum {
        sub.insert("sum".to_string(), json_f64(v));
    }
    if let Some(v) = value_count {
        sub.insert("value_count".to_string(), Value::from(v));
    }
    if !sub.is_empty() {
        out.insert(name.to_string(), Value::Object(sub));
    }
}

/// Build the producer array for one shard run
///
/// Metric producers come first, then labels, matching the field order the
/// iterator exposes. All validation that depends on field configuration
/// happens here, before the task leaves the `Initializing` state.
pub fn build_producers(
    metrics: &[MetricFieldConfig],
    labels: &[LabelFieldConfig],
) -> Result<Vec<FieldProducer>, FieldSetupError> {
    let mut producers = Vec::with_capacity(metrics.len() + labels.len());
    let mut kinds: HashMap<String, MetricType> = HashMap::new();

    for metric in metrics {
        if metric.field.is_empty() {
            return Err(FieldSetupError::MissingField("<metric>".to_string()));
        }
        if metric.name.is_empty() {
            return Err(FieldSetupError::MissingField(metric.field.clone()));
        }
        match kinds.insert(metric.name.clone(), metric.metric_type) {
            Some(previous) if previous != metric.metric_type => {
                return Err(FieldSetupError::MappingMismatch {
                    field: metric.name.clone(),
                    message: "cannot mix gauge and counter producers under one name".to_string(),
                });
            }
            Some(_) if metric.metric_type == MetricType::Counter => {
                return Err(FieldSetupError::MappingMismatch {
                    field: metric.name.clone(),
                    message: "only gauge producers may share an output name".to_string(),
                });
            }
            _ => {}
        }

        match metric.metric_type {
            MetricType::Gauge => {
                if metric.aggregations.is_empty() {
                    return Err(FieldSetupError::MappingMismatch {
                        field: metric.field.clone(),
                        message: "gauge metric has no aggregations".to_string(),
                    });
                }
                producers.push(FieldProducer::Gauge {
                    field: metric.field.clone(),
                    name: metric.name.clone(),
                    aggregations: metric.aggregations.clone(),
                    state: GaugeState::default(),
                });
            }
            MetricType::Counter => {
                if !metric.aggregations.is_empty() {
                    return Err(FieldSetupError::MappingMismatch {
                        field: metric.field.clone(),
                        message: "counter metric does not take aggregations".to_string(),
                    });
                }
                producers.push(FieldProducer::Counter {
                    field: metric.field.clone(),
                    last: None,
                });
            }
        }
    }

    for label in labels {
        if label.field.is_empty() {
            return Err(FieldSetupError::MissingField("<label>".to_string()));
        }
        if kinds.contains_key(&label.field) {
            return Err(FieldSetupError::MappingMismatch {
                field: label.field.clone(),
                message: "label field collides with a metric output name".to_string(),
            });
        }
        producers.push(FieldProducer::Label {
            field: label.field.clone(),
            last: None,
        });
    }

    Ok(producers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(vals: &[f64]) -> Vec<FieldValue> {
        vals.iter().map(|v| FieldValue::from(*v)).collect()
    }

    fn write_to_map(producer: &FieldProducer) -> Map<String, Value> {
        let mut out = Map::new();
        producer.write(&mut out);
        out
    }

    #[test]
    fn test_gauge_accumulates_min_max_sum_count() {
        let mut producer = FieldProducer::Gauge {
            field: "cpu".to_string(),
            name: "cpu".to_string(),
            aggregations: GaugeAggregation::ALL.to_vec(),
            state: GaugeState::default(),
        };

        producer.collect(&values(&[3.0]));
        producer.collect(&values(&[1.0, 2.0]));

        let out = write_to_map(&producer);
        let cpu = out.get("cpu").unwrap().as_object().unwrap();
        assert_eq!(cpu.get("min").unwrap().as_f64(), Some(1.0));
        assert_eq!(cpu.get("max").unwrap().as_f64(), Some(3.0));
        assert_eq!(cpu.get("sum").unwrap().as_f64(), Some(6.0));
        assert_eq!(cpu.get("value_count").unwrap().as_u64(), Some(3));
    }

    #[test]
    fn test_gauge_skips_non_numeric_values() {
        let mut producer = FieldProducer::Gauge {
            field: "cpu".to_string(),
            name: "cpu".to_string(),
            aggregations: GaugeAggregation::ALL.to_vec(),
            state: GaugeState::default(),
        };

        producer.collect(&[FieldValue::from("oops"), FieldValue::from(5.0)]);

        let out = write_to_map(&producer);
        let cpu = out.get("cpu").unwrap().as_object().unwrap();
        assert_eq!(cpu.get("value_count").unwrap().as_u64(), Some(1));
    }

    #[test]
    fn test_empty_gauge_writes_nothing() {
        let producer = FieldProducer::Gauge {
            field: "cpu".to_string(),
            name: "cpu".to_string(),
            aggregations: GaugeAggregation::ALL.to_vec(),
            state: GaugeState::default(),
        };
        assert!(producer.is_empty());
        assert!(write_to_map(&producer).is_empty());
    }

    #[test]
    fn test_counter_first_collect_wins() {
        let mut producer = FieldProducer::Counter {
            field: "requests".to_string(),
            last: None,
        };

        producer.collect(&values(&[180.0]));
        producer.collect(&values(&[150.0]));

        let out = write_to_map(&producer);
        assert_eq!(out.get("requests").unwrap().as_f64(), Some(180.0));
    }

    #[test]
    fn test_label_preserves_type_and_arrays() {
        let mut producer = FieldProducer::Label {
            field: "pod".to_string(),
            last: None,
        };
        producer.collect(&[FieldValue::from("a"), FieldValue::from("b")]);
        producer.collect(&[FieldValue::from("stale")]);

        let out = write_to_map(&producer);
        let pod = out.get("pod").unwrap().as_array().unwrap();
        assert_eq!(pod.len(), 2);
        assert_eq!(pod[0].as_str(), Some("a"));

        let mut boolean = FieldProducer::Label {
            field: "up".to_string(),
            last: None,
        };
        boolean.collect(&[FieldValue::from(true)]);
        let out = write_to_map(&boolean);
        assert_eq!(out.get("up").unwrap().as_bool(), Some(true));
    }

    #[test]
    fn test_reset_clears_state() {
        let mut producer = FieldProducer::Counter {
            field: "requests".to_string(),
            last: None,
        };
        producer.collect(&values(&[10.0]));
        producer.reset();
        assert!(producer.is_empty());

        producer.collect(&values(&[20.0]));
        let out = write_to_map(&producer);
        assert_eq!(out.get("requests").unwrap().as_f64(), Some(20.0));
    }

    #[test]
    fn test_composite_combines_sub_producers() {
        let mut min_part = FieldProducer::Gauge {
            field: "load.min".to_string(),
            name: "load".to_string(),
            aggregations: vec![GaugeAggregation::Min],
            state: GaugeState::default(),
        };
        let mut max_part = FieldProducer::Gauge {
            field: "load.max".to_string(),
            name: "load".to_string(),
            aggregations: vec![GaugeAggregation::Max],
            state: GaugeState::default(),
        };

        min_part.collect(&values(&[0.5, 0.7]));
        max_part.collect(&values(&[2.5, 1.9]));

        let mut out = Map::new();
        write_composite("load", &[&min_part, &max_part], &mut out);
        let load = out.get("load").unwrap().as_object().unwrap();
        assert_eq!(load.get("min").unwrap().as_f64(), Some(0.5));
        assert_eq!(load.get("max").unwrap().as_f64(), Some(2.5));
        assert!(load.get("sum").is_none());
    }

    #[test]
    fn test_build_producers_validation() {
        let metrics = vec![MetricFieldConfig::gauge("cpu")];
        let labels = vec![LabelFieldConfig::new("host")];
        assert_eq!(build_producers(&metrics, &labels).unwrap().len(), 2);

        let mut bad = MetricFieldConfig::gauge("cpu");
        bad.aggregations.clear();
        assert!(build_producers(&[bad], &[]).is_err());

        let clash = vec![
            MetricFieldConfig::counter("x"),
            MetricFieldConfig::counter("x"),
        ];
        assert!(build_producers(&clash, &[]).is_err());

        let label_clash = vec![LabelFieldConfig::new("cpu")];
        assert!(build_producers(&metrics, &label_clash).is_err());
    }
}
