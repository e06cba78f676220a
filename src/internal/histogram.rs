//! Explicit-bucket histogram aggregators.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::attribute::AttributeSet;
use crate::data::{Histogram, HistogramDataPoint, MetricData, Temporality};

use super::{Aggregator, Number};

struct Buckets<N> {
    counts: Vec<u64>,
    count: u64,
    total: N,
    min: N,
    max: N,
}

impl<N: Number> Buckets<N> {
    fn new(len: usize) -> Self {
        Buckets {
            counts: vec![0; len],
            count: 0,
            total: N::default(),
            min: N::default(),
            max: N::default(),
        }
    }

    fn bin(&mut self, idx: usize, value: N) {
        self.counts[idx] += 1;
        self.count += 1;
        self.total = self.total.add_wrapping(value);
    }

    fn track_min_max(&mut self, value: N) {
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else if value < self.min {
            self.min = value;
        } else if value > self.max {
            self.max = value;
        }
    }
}

struct HistogramState<N> {
    values: HashMap<AttributeSet, Buckets<N>>,
    start: SystemTime,
}

struct HistogramValues<N> {
    /// Sorted upper bounds; a measurement lands in the first bucket whose
    /// bound is >= the value, or the trailing overflow bucket.
    bounds: Vec<f64>,
    record_min_max: bool,
    inner: Mutex<HistogramState<N>>,
}

impl<N: Number> HistogramValues<N> {
    fn new(bounds: Vec<f64>, record_min_max: bool) -> Self {
        HistogramValues {
            bounds,
            record_min_max,
            inner: Mutex::new(HistogramState {
                values: HashMap::new(),
                start: SystemTime::now(),
            }),
        }
    }

    fn record(&self, measurement: N, attrs: AttributeSet) {
        let idx = self
            .bounds
            .partition_point(|bound| *bound < measurement.into_f64());
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        let cell = state
            .values
            .entry(attrs)
            .or_insert_with(|| Buckets::new(self.bounds.len() + 1));
        cell.bin(idx, measurement);
        if self.record_min_max {
            cell.track_min_max(measurement);
        }
    }

    fn data_point(&self, attrs: &AttributeSet, cell: &Buckets<N>, start: SystemTime, t: SystemTime) -> HistogramDataPoint {
        let (min, max) = if self.record_min_max {
            (Some(cell.min.into_f64()), Some(cell.max.into_f64()))
        } else {
            (None, None)
        };
        HistogramDataPoint {
            attributes: attrs.clone(),
            start_time: start,
            time: t,
            count: cell.count,
            bounds: self.bounds.clone(),
            bucket_counts: cell.counts.clone(),
            min,
            max,
            sum: cell.total.into_f64(),
        }
    }
}

/// A histogram covering a single aggregation cycle per read.
///
/// Reading the aggregation removes the cells and starts a new cycle.
pub(crate) struct DeltaHistogram<N> {
    values: HistogramValues<N>,
}

impl<N: Number> DeltaHistogram<N> {
    pub(crate) fn new(bounds: Vec<f64>, record_min_max: bool) -> Self {
        DeltaHistogram {
            values: HistogramValues::new(bounds, record_min_max),
        }
    }
}

impl<N: Number> Aggregator<N> for DeltaHistogram<N> {
    fn aggregate(&self, measurement: N, attrs: AttributeSet) {
        self.values.record(measurement, attrs);
    }

    fn aggregation(&self) -> Option<MetricData> {
        let Ok(mut state) = self.values.inner.lock() else {
            return None;
        };
        if state.values.is_empty() {
            return None;
        }

        let t = SystemTime::now();
        let start = state.start;
        state.start = t;

        let data_points = state
            .values
            .drain()
            .map(|(attrs, cell)| self.values.data_point(&attrs, &cell, start, t))
            .collect();
        Some(MetricData::Histogram(Histogram {
            data_points,
            temporality: Temporality::Delta,
        }))
    }
}

/// A histogram accumulating over the instrument lifetime.
pub(crate) struct CumulativeHistogram<N> {
    values: HistogramValues<N>,
}

impl<N: Number> CumulativeHistogram<N> {
    pub(crate) fn new(bounds: Vec<f64>, record_min_max: bool) -> Self {
        CumulativeHistogram {
            values: HistogramValues::new(bounds, record_min_max),
        }
    }
}

impl<N: Number> Aggregator<N> for CumulativeHistogram<N> {
    fn aggregate(&self, measurement: N, attrs: AttributeSet) {
        self.values.record(measurement, attrs);
    }

    fn aggregation(&self) -> Option<MetricData> {
        let Ok(state) = self.values.inner.lock() else {
            return None;
        };
        if state.values.is_empty() {
            return None;
        }

        let t = SystemTime::now();
        let data_points = state
            .values
            .iter()
            .map(|(attrs, cell)| self.values.data_point(attrs, cell, state.start, t))
            .collect();
        Some(MetricData::Histogram(Histogram {
            data_points,
            temporality: Temporality::Cumulative,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::DEFAULT_HISTOGRAM_BOUNDARIES;

    fn histogram_points(data: MetricData) -> Vec<HistogramDataPoint> {
        match data {
            MetricData::Histogram(histogram) => histogram.data_points,
            other => panic!("expected histogram, got {other:?}"),
        }
    }

    #[test]
    fn measurement_lands_in_first_bucket_with_larger_bound() {
        let agg = CumulativeHistogram::<i64>::new(DEFAULT_HISTOGRAM_BOUNDARIES.to_vec(), true);
        agg.aggregate(7, AttributeSet::default());

        let points = histogram_points(agg.aggregation().unwrap());
        assert_eq!(points.len(), 1);
        let point = &points[0];
        assert_eq!(point.count, 1);
        assert_eq!(point.sum, 7.0);
        assert_eq!(point.min, Some(7.0));
        assert_eq!(point.max, Some(7.0));
        assert_eq!(point.bucket_counts.len(), 16);
        // 7 falls in the (5, 10] bucket, index 2.
        let mut expected = vec![0u64; 16];
        expected[2] = 1;
        assert_eq!(point.bucket_counts, expected);
    }

    #[test]
    fn boundary_values_are_inclusive() {
        let agg = CumulativeHistogram::<f64>::new(vec![0.0, 5.0, 10.0], false);
        agg.aggregate(5.0, AttributeSet::default());

        let points = histogram_points(agg.aggregation().unwrap());
        assert_eq!(points[0].bucket_counts, vec![0, 1, 0, 0]);
        assert!(points[0].min.is_none());
        assert!(points[0].max.is_none());
    }

    #[test]
    fn values_beyond_last_bound_overflow() {
        let agg = CumulativeHistogram::<f64>::new(vec![0.0, 5.0, 10.0], false);
        agg.aggregate(11.5, AttributeSet::default());

        let points = histogram_points(agg.aggregation().unwrap());
        assert_eq!(points[0].bucket_counts, vec![0, 0, 0, 1]);
    }

    #[test]
    fn min_max_track_extremes() {
        let agg = CumulativeHistogram::<f64>::new(vec![0.0, 5.0, 10.0], true);
        let set = AttributeSet::default();
        agg.aggregate(2.0, set.clone());
        agg.aggregate(9.0, set.clone());
        agg.aggregate(4.0, set.clone());

        let points = histogram_points(agg.aggregation().unwrap());
        assert_eq!(points[0].count, 3);
        assert_eq!(points[0].min, Some(2.0));
        assert_eq!(points[0].max, Some(9.0));
        assert_eq!(points[0].sum, 15.0);
    }

    #[test]
    fn delta_histogram_forgets_cells_after_read() {
        let agg = DeltaHistogram::<i64>::new(vec![0.0, 5.0, 10.0], true);
        let set = AttributeSet::default();
        agg.aggregate(3, set.clone());

        assert!(agg.aggregation().is_some());
        assert!(agg.aggregation().is_none());

        agg.aggregate(4, set);
        let points = histogram_points(agg.aggregation().unwrap());
        assert_eq!(points[0].count, 1);
        assert_eq!(points[0].sum, 4.0);
    }

    #[test]
    fn cumulative_histogram_retains_cells() {
        let agg = CumulativeHistogram::<i64>::new(vec![0.0, 5.0, 10.0], true);
        let set = AttributeSet::default();
        agg.aggregate(3, set.clone());
        assert_eq!(histogram_points(agg.aggregation().unwrap())[0].count, 1);

        agg.aggregate(4, set);
        let points = histogram_points(agg.aggregation().unwrap());
        assert_eq!(points[0].count, 2);
        assert_eq!(points[0].sum, 7.0);
    }
}
