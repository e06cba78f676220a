//! The pull interface between the SDK and metric consumers.

use std::fmt;
use std::sync::Weak;

use crate::aggregation::{Aggregation, DEFAULT_HISTOGRAM_BOUNDARIES};
use crate::data::{ResourceMetrics, ScopeMetrics, Temporality};
use crate::error::MetricResult;
use crate::instrument::InstrumentKind;
use crate::pipeline::Pipeline;

/// Selects the temporality used for an instrument kind.
///
/// Implemented for plain functions, so a closure can be passed wherever a
/// selector is expected.
pub trait TemporalitySelector: Send + Sync {
    /// The temporality for the given kind.
    fn temporality(&self, kind: InstrumentKind) -> Temporality;
}

impl<F> TemporalitySelector for F
where
    F: Fn(InstrumentKind) -> Temporality + Send + Sync,
{
    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self(kind)
    }
}

/// The default temporality: cumulative for every instrument kind.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultTemporalitySelector;

impl TemporalitySelector for DefaultTemporalitySelector {
    fn temporality(&self, _kind: InstrumentKind) -> Temporality {
        Temporality::Cumulative
    }
}

/// Selects the aggregation used for an instrument kind when no view
/// overrides it.
///
/// Implemented for plain functions, so a closure can be passed wherever a
/// selector is expected.
pub trait AggregationSelector: Send + Sync {
    /// The aggregation for the given kind.
    fn aggregation(&self, kind: InstrumentKind) -> Aggregation;
}

impl<F> AggregationSelector for F
where
    F: Fn(InstrumentKind) -> Aggregation + Send + Sync,
{
    fn aggregation(&self, kind: InstrumentKind) -> Aggregation {
        self(kind)
    }
}

/// The default aggregation per instrument kind: sums for counters,
/// last-value for observable gauges and an explicit-bucket histogram with
/// the default bounds for histograms.
pub(crate) fn default_aggregation(kind: InstrumentKind) -> Aggregation {
    match kind {
        InstrumentKind::Counter
        | InstrumentKind::UpDownCounter
        | InstrumentKind::ObservableCounter
        | InstrumentKind::ObservableUpDownCounter => Aggregation::Sum,
        InstrumentKind::ObservableGauge => Aggregation::LastValue,
        InstrumentKind::Histogram => Aggregation::ExplicitBucketHistogram {
            boundaries: DEFAULT_HISTOGRAM_BOUNDARIES.to_vec(),
            record_min_max: true,
        },
    }
}

/// The default aggregation selector, see [`default_aggregation`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultAggregationSelector;

impl AggregationSelector for DefaultAggregationSelector {
    fn aggregation(&self, kind: InstrumentKind) -> Aggregation {
        default_aggregation(kind)
    }
}

/// A pull-mode consumer of SDK metrics.
///
/// A reader is registered with exactly one [`MeterProvider`] pipeline and
/// decides, through its selector supertraits, the temporality and default
/// aggregation of every instrument resolved for it. Aggregator variants
/// are fixed at instrument creation time for the aggregator's lifetime.
///
/// [`MeterProvider`]: crate::MeterProvider
pub trait MetricReader: TemporalitySelector + AggregationSelector + fmt::Debug + 'static {
    /// Ties the reader to the pipeline it drains. Called once by
    /// [`MeterProvider::builder`](crate::MeterProvider::builder) during
    /// provider construction.
    fn register_pipeline(&self, pipeline: Weak<Pipeline>);

    /// Runs a collection cycle, filling `metrics` in place.
    ///
    /// On error the snapshot still holds whatever was gathered; callback
    /// and producer failures are joined into the returned error.
    fn collect(&self, metrics: &mut ResourceMetrics) -> MetricResult<()>;

    /// Flushes any buffered data through to the consumer.
    fn force_flush(&self) -> MetricResult<()>;

    /// Releases the reader's resources. Further operations fail with
    /// [`MetricError::AlreadyShutdown`](crate::MetricError::AlreadyShutdown).
    fn shutdown(&self) -> MetricResult<()>;
}

/// An external source of pre-shaped metrics merged into a reader's
/// snapshots.
///
/// Producers are injected into readers explicitly; there is no process
/// global registry. A producer may append partial data and still return
/// an error; the reader joins the error with the rest of the collection
/// cycle's failures.
pub trait MetricProducer: fmt::Debug + Send + Sync + 'static {
    /// Appends externally gathered scope metrics to the snapshot under
    /// assembly.
    fn produce(&self, scope_metrics: &mut Vec<ScopeMetrics>) -> MetricResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_selectors() {
        let temporality = DefaultTemporalitySelector;
        let aggregation = DefaultAggregationSelector;
        for kind in [
            InstrumentKind::Counter,
            InstrumentKind::UpDownCounter,
            InstrumentKind::Histogram,
            InstrumentKind::ObservableCounter,
            InstrumentKind::ObservableUpDownCounter,
            InstrumentKind::ObservableGauge,
        ] {
            assert_eq!(temporality.temporality(kind), Temporality::Cumulative);
            let agg = aggregation.aggregation(kind);
            match kind {
                InstrumentKind::ObservableGauge => assert_eq!(agg, Aggregation::LastValue),
                InstrumentKind::Histogram => {
                    assert!(matches!(agg, Aggregation::ExplicitBucketHistogram { .. }))
                }
                _ => assert_eq!(agg, Aggregation::Sum),
            }
        }
    }

    #[test]
    fn closures_are_selectors() {
        let temporality = |_: InstrumentKind| Temporality::Delta;
        assert_eq!(
            temporality.temporality(InstrumentKind::Counter),
            Temporality::Delta
        );

        let aggregation = |_: InstrumentKind| Aggregation::Drop;
        assert_eq!(aggregation.aggregation(InstrumentKind::Counter), Aggregation::Drop);
    }
}
