//! The snapshot data model assembled by a collection cycle.
//!
//! Readers fill a [`ResourceMetrics`] in place; exporters consume it. The
//! shapes mirror the OTLP metrics model closely enough that mapping to a
//! wire format is a mechanical transform.

use std::borrow::Cow;
use std::time::SystemTime;

use crate::attribute::AttributeSet;
use crate::instrumentation::Scope;
use crate::resource::Resource;

/// Whether a data point covers only the last collection cycle or the whole
/// instrument lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Temporality {
    /// Point values cover the interval since the previous collection.
    Delta,
    /// Point values accumulate from the first measurement.
    Cumulative,
}

/// A complete collection snapshot: the resource plus every scope's metrics.
#[derive(Clone, Debug, Default)]
pub struct ResourceMetrics {
    /// The entity the metrics describe.
    pub resource: Resource,
    /// Metrics grouped by instrumentation scope, ordered by scope name.
    pub scope_metrics: Vec<ScopeMetrics>,
}

/// The metrics produced by a single instrumentation scope.
#[derive(Clone, Debug, Default)]
pub struct ScopeMetrics {
    /// The scope that produced the metrics.
    pub scope: Scope,
    /// The metrics, in instrument creation order.
    pub metrics: Vec<Metric>,
}

/// One named stream of aggregated data.
#[derive(Clone, Debug)]
pub struct Metric {
    /// The stream name.
    pub name: Cow<'static, str>,
    /// A human readable description of the stream.
    pub description: Cow<'static, str>,
    /// The unit of the recorded values.
    pub unit: Cow<'static, str>,
    /// The aggregated data.
    pub data: MetricData,
}

/// The aggregated data carried by a [`Metric`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum MetricData {
    /// An integer arithmetic sum.
    I64Sum(Sum<i64>),
    /// A floating point arithmetic sum.
    F64Sum(Sum<f64>),
    /// An integer last-value gauge.
    I64Gauge(Gauge<i64>),
    /// A floating point last-value gauge.
    F64Gauge(Gauge<f64>),
    /// An explicit-bucket histogram.
    Histogram(Histogram),
}

/// An arithmetic sum of measurements, one data point per attribute set.
#[derive(Clone, Debug, PartialEq)]
pub struct Sum<N> {
    /// The per-attribute-set points.
    pub data_points: Vec<DataPoint<N>>,
    /// The interval the point values cover.
    pub temporality: Temporality,
    /// Whether the sum only ever increases.
    pub is_monotonic: bool,
}

/// The most recent measurement, one data point per attribute set.
#[derive(Clone, Debug, PartialEq)]
pub struct Gauge<N> {
    /// The per-attribute-set points.
    pub data_points: Vec<DataPoint<N>>,
}

/// A single numeric point in a time series.
#[derive(Clone, Debug, PartialEq)]
pub struct DataPoint<N> {
    /// The attribute set identifying the time series.
    pub attributes: AttributeSet,
    /// The start of the interval the value covers. Gauges carry no
    /// interval and leave this unset.
    pub start_time: Option<SystemTime>,
    /// When the value was observed or the interval ended.
    pub time: SystemTime,
    /// The point value.
    pub value: N,
}

/// The distribution of recorded measurements over explicit buckets.
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    /// The per-attribute-set points.
    pub data_points: Vec<HistogramDataPoint>,
    /// The interval the point values cover.
    pub temporality: Temporality,
}

/// A single histogram point in a time series.
#[derive(Clone, Debug, PartialEq)]
pub struct HistogramDataPoint {
    /// The attribute set identifying the time series.
    pub attributes: AttributeSet,
    /// The start of the interval the distribution covers.
    pub start_time: SystemTime,
    /// When the interval ended.
    pub time: SystemTime,
    /// The number of recorded measurements.
    pub count: u64,
    /// The bucket upper bounds. A measurement lands in the first bucket
    /// whose bound is greater than or equal to it; `bucket_counts` has one
    /// extra trailing slot for measurements beyond the last bound.
    pub bounds: Vec<f64>,
    /// The number of measurements per bucket, `bounds.len() + 1` entries.
    pub bucket_counts: Vec<u64>,
    /// The smallest recorded measurement, when min/max tracking is on.
    pub min: Option<f64>,
    /// The largest recorded measurement, when min/max tracking is on.
    pub max: Option<f64>,
    /// The arithmetic sum of recorded measurements.
    pub sum: f64,
}
