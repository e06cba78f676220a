//! The push interface implemented by metric exporters.

use async_trait::async_trait;
use std::fmt;

use crate::data::ResourceMetrics;
use crate::error::MetricResult;
use crate::reader::{AggregationSelector, TemporalitySelector};

/// Exports batches of [`ResourceMetrics`] produced by a
/// [`PeriodicReader`](crate::PeriodicReader).
///
/// The exporter also decides, through its selector supertraits, the
/// temporality and default aggregation of the instruments collected for
/// it.
#[async_trait]
pub trait PushMetricExporter:
    TemporalitySelector + AggregationSelector + fmt::Debug + 'static
{
    /// Serializes and transmits a snapshot.
    ///
    /// The snapshot is borrowed mutably so exporters can reshape it in
    /// place; it is not reused after the call.
    async fn export(&self, metrics: &mut ResourceMetrics) -> MetricResult<()>;

    /// Flushes any buffered exports.
    async fn force_flush(&self) -> MetricResult<()>;

    /// Releases exporter resources. Called at most once, after the final
    /// export.
    fn shutdown(&self) -> MetricResult<()>;
}
