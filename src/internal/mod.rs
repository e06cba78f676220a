//! Aggregator implementations backing instrument streams.

mod filter;
mod histogram;
mod last_value;
mod sum;

pub(crate) use filter::{Filter, PrecomputedFilter};
pub(crate) use histogram::{CumulativeHistogram, DeltaHistogram};
pub(crate) use last_value::LastValue;
pub(crate) use sum::{CumulativeSum, DeltaSum, PrecomputedCumulativeSum, PrecomputedDeltaSum};

use std::fmt;
use std::sync::Arc;

use crate::aggregation::Aggregation;
use crate::attribute::AttributeSet;
use crate::data::{Gauge, MetricData, Sum, Temporality};
use crate::instrument::{AttributeFilter, InstrumentKind};
use crate::reader::default_aggregation;

mod sealed {
    pub trait Sealed {}
    impl Sealed for i64 {}
    impl Sealed for f64 {}
}

/// The numeric representations measurements may take.
///
/// Implemented for `i64` and `f64` only; the trait is sealed and its
/// methods are implementation detail of the aggregators.
pub trait Number:
    sealed::Sealed + fmt::Debug + Copy + Default + PartialEq + PartialOrd + Send + Sync + 'static
{
    #[doc(hidden)]
    fn add_wrapping(self, rhs: Self) -> Self;
    #[doc(hidden)]
    fn sub_wrapping(self, rhs: Self) -> Self;
    #[doc(hidden)]
    fn into_f64(self) -> f64;
    #[doc(hidden)]
    fn make_sum(sum: Sum<Self>) -> MetricData;
    #[doc(hidden)]
    fn make_gauge(gauge: Gauge<Self>) -> MetricData;
}

impl Number for i64 {
    fn add_wrapping(self, rhs: Self) -> Self {
        self.wrapping_add(rhs)
    }

    fn sub_wrapping(self, rhs: Self) -> Self {
        self.wrapping_sub(rhs)
    }

    fn into_f64(self) -> f64 {
        self as f64
    }

    fn make_sum(sum: Sum<Self>) -> MetricData {
        MetricData::I64Sum(sum)
    }

    fn make_gauge(gauge: Gauge<Self>) -> MetricData {
        MetricData::I64Gauge(gauge)
    }
}

impl Number for f64 {
    fn add_wrapping(self, rhs: Self) -> Self {
        self + rhs
    }

    fn sub_wrapping(self, rhs: Self) -> Self {
        self - rhs
    }

    fn into_f64(self) -> f64 {
        self
    }

    fn make_sum(sum: Sum<Self>) -> MetricData {
        MetricData::F64Sum(sum)
    }

    fn make_gauge(gauge: Gauge<Self>) -> MetricData {
        MetricData::F64Gauge(gauge)
    }
}

/// Per-(stream, attribute-set) aggregation state.
///
/// `aggregate` is called from the measurement hot path and must be safe
/// under concurrent callers; `aggregation` is called by a reader during a
/// collection cycle and returns the points accumulated per the variant's
/// temporality, or `None` when there is nothing to report.
pub(crate) trait Aggregator<N>: Send + Sync {
    fn aggregate(&self, measurement: N, attrs: AttributeSet);

    fn aggregation(&self) -> Option<MetricData>;
}

/// An [`Aggregator`] whose measurements arrive as pre-computed absolute
/// values, with a second entry point for attribute-filtered contributions
/// that must fold by addition instead of overwrite.
pub(crate) trait PrecomputeAggregator<N>: Aggregator<N> {
    fn aggregate_filtered(&self, measurement: N, attrs: AttributeSet);
}

/// Builds the aggregator for one resolved stream, wrapping it with the
/// matching attribute-filter flavour when a filter is configured.
///
/// Returns `None` for [`Aggregation::Drop`]: the stream discards its
/// measurements and produces no metric.
pub(crate) fn resolve_aggregator<N: Number>(
    kind: InstrumentKind,
    aggregation: &Aggregation,
    temporality: Temporality,
    filter: Option<AttributeFilter>,
) -> Option<Arc<dyn Aggregator<N>>> {
    match aggregation {
        Aggregation::Drop => None,
        Aggregation::Default => {
            resolve_aggregator(kind, &default_aggregation(kind), temporality, filter)
        }
        Aggregation::Sum => {
            let monotonic = kind.monotonic();
            if kind.precomputed() {
                match temporality {
                    Temporality::Delta => {
                        precomputed(Arc::new(PrecomputedDeltaSum::new(monotonic)), filter)
                    }
                    Temporality::Cumulative => {
                        precomputed(Arc::new(PrecomputedCumulativeSum::new(monotonic)), filter)
                    }
                }
            } else {
                match temporality {
                    Temporality::Delta => incremental(Arc::new(DeltaSum::new(monotonic)), filter),
                    Temporality::Cumulative => {
                        incremental(Arc::new(CumulativeSum::new(monotonic)), filter)
                    }
                }
            }
        }
        Aggregation::LastValue => incremental(Arc::new(LastValue::new()), filter),
        Aggregation::ExplicitBucketHistogram {
            boundaries,
            record_min_max,
        } => match temporality {
            Temporality::Delta => incremental(
                Arc::new(DeltaHistogram::new(boundaries.clone(), *record_min_max)),
                filter,
            ),
            Temporality::Cumulative => incremental(
                Arc::new(CumulativeHistogram::new(boundaries.clone(), *record_min_max)),
                filter,
            ),
        },
    }
}

/// Wraps an incremental aggregator: filtered attribute sets that collapse
/// to the same set sum, because every delegated call adds.
fn incremental<N: Number, A: Aggregator<N> + 'static>(
    aggregator: Arc<A>,
    filter: Option<AttributeFilter>,
) -> Option<Arc<dyn Aggregator<N>>> {
    let resolved: Arc<dyn Aggregator<N>> = match filter {
        Some(predicate) => Arc::new(Filter::new(aggregator, predicate)),
        None => aggregator,
    };
    Some(resolved)
}

/// Wraps a pre-computed aggregator: filtered contributions are folded by
/// addition so multiple sources collapsing onto one filtered set combine
/// instead of overwriting each other.
fn precomputed<N: Number, A: PrecomputeAggregator<N> + 'static>(
    aggregator: Arc<A>,
    filter: Option<AttributeFilter>,
) -> Option<Arc<dyn Aggregator<N>>> {
    let resolved: Arc<dyn Aggregator<N>> = match filter {
        Some(predicate) => Arc::new(PrecomputedFilter::new(aggregator, predicate)),
        None => aggregator,
    };
    Some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_aggregation_resolves_to_no_aggregator() {
        let agg = resolve_aggregator::<i64>(
            InstrumentKind::Counter,
            &Aggregation::Drop,
            Temporality::Cumulative,
            None,
        );
        assert!(agg.is_none());
    }

    #[test]
    fn default_aggregation_resolves_per_kind() {
        for kind in [
            InstrumentKind::Counter,
            InstrumentKind::UpDownCounter,
            InstrumentKind::Histogram,
            InstrumentKind::ObservableCounter,
            InstrumentKind::ObservableUpDownCounter,
            InstrumentKind::ObservableGauge,
        ] {
            let agg = resolve_aggregator::<f64>(
                kind,
                &Aggregation::Default,
                Temporality::Cumulative,
                None,
            );
            assert!(agg.is_some(), "{kind:?} must resolve to an aggregator");
        }
    }

    #[test]
    fn integer_arithmetic_wraps_instead_of_panicking() {
        assert_eq!(i64::MAX.add_wrapping(1), i64::MIN);
        assert_eq!(i64::MIN.sub_wrapping(1), i64::MAX);
    }
}
