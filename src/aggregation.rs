//! Aggregation strategies selectable per stream through views and readers.

use crate::error::{MetricError, MetricResult};

/// The default explicit-bucket histogram bounds.
pub(crate) const DEFAULT_HISTOGRAM_BOUNDARIES: [f64; 15] = [
    0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0,
    10000.0,
];

/// How measurements of a stream are folded into data points.
///
/// A view or an [`AggregationSelector`](crate::AggregationSelector) picks
/// one of these per stream; the choice is fixed for the lifetime of the
/// resulting aggregator.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Aggregation {
    /// Discard all measurements of the stream.
    Drop,

    /// Use the default aggregation for the instrument kind.
    Default,

    /// Arithmetic sum of measurements per attribute set.
    Sum,

    /// The most recently recorded value per attribute set.
    LastValue,

    /// A bucketed distribution of measurements per attribute set.
    ExplicitBucketHistogram {
        /// Strictly increasing bucket upper bounds.
        boundaries: Vec<f64>,
        /// Whether to track the smallest and largest measurement.
        record_min_max: bool,
    },
}

impl Aggregation {
    /// A short stable tag used in stream identity and diagnostics.
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Aggregation::Drop => "drop",
            Aggregation::Default => "default",
            Aggregation::Sum => "sum",
            Aggregation::LastValue => "last_value",
            Aggregation::ExplicitBucketHistogram { .. } => "explicit_bucket_histogram",
        }
    }

    /// Checks the configuration is usable.
    ///
    /// Histogram boundaries must be finite and strictly increasing.
    pub fn validate(&self) -> MetricResult<()> {
        if let Aggregation::ExplicitBucketHistogram { boundaries, .. } = self {
            if boundaries.iter().any(|b| !b.is_finite()) {
                return Err(MetricError::Config(format!(
                    "histogram boundaries must be finite: {boundaries:?}"
                )));
            }
            if boundaries.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(MetricError::Config(format!(
                    "histogram boundaries must be strictly increasing: {boundaries:?}"
                )));
            }
        }
        Ok(())
    }
}
