//! Sum aggregators: incremental and pre-computed, delta and cumulative.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::attribute::AttributeSet;
use crate::data::{DataPoint, MetricData, Sum, Temporality};

use super::{Aggregator, Number, PrecomputeAggregator};

struct SumState<N> {
    values: HashMap<AttributeSet, N>,
    start: SystemTime,
}

impl<N> SumState<N> {
    fn new() -> Self {
        SumState {
            values: HashMap::new(),
            start: SystemTime::now(),
        }
    }
}

/// Sums measurements made within a single aggregation cycle.
///
/// Reading the aggregation drains the cells and starts a new cycle, so
/// each emitted point covers exactly the measurements between two reads.
pub(crate) struct DeltaSum<N> {
    monotonic: bool,
    inner: Mutex<SumState<N>>,
}

impl<N: Number> DeltaSum<N> {
    pub(crate) fn new(monotonic: bool) -> Self {
        DeltaSum {
            monotonic,
            inner: Mutex::new(SumState::new()),
        }
    }
}

impl<N: Number> Aggregator<N> for DeltaSum<N> {
    fn aggregate(&self, measurement: N, attrs: AttributeSet) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        let cell = state.values.entry(attrs).or_default();
        *cell = cell.add_wrapping(measurement);
    }

    fn aggregation(&self) -> Option<MetricData> {
        let Ok(mut state) = self.inner.lock() else {
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
            .map(|(attributes, value)| DataPoint {
                attributes,
                start_time: Some(start),
                time: t,
                value,
            })
            .collect();
        Some(N::make_sum(Sum {
            data_points,
            temporality: Temporality::Delta,
            is_monotonic: self.monotonic,
        }))
    }
}

/// Sums measurements made over all aggregation cycles.
///
/// Cells are retained across reads, which grows without bound under
/// unbounded attribute cardinality.
pub(crate) struct CumulativeSum<N> {
    monotonic: bool,
    inner: Mutex<SumState<N>>,
}

impl<N: Number> CumulativeSum<N> {
    pub(crate) fn new(monotonic: bool) -> Self {
        CumulativeSum {
            monotonic,
            inner: Mutex::new(SumState::new()),
        }
    }
}

impl<N: Number> Aggregator<N> for CumulativeSum<N> {
    fn aggregate(&self, measurement: N, attrs: AttributeSet) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        let cell = state.values.entry(attrs).or_default();
        *cell = cell.add_wrapping(measurement);
    }

    fn aggregation(&self) -> Option<MetricData> {
        let Ok(state) = self.inner.lock() else {
            return None;
        };
        if state.values.is_empty() {
            return None;
        }

        let t = SystemTime::now();
        let data_points = state
            .values
            .iter()
            .map(|(attributes, value)| DataPoint {
                attributes: attributes.clone(),
                start_time: Some(state.start),
                time: t,
                value: *value,
            })
            .collect();
        Some(N::make_sum(Sum {
            data_points,
            temporality: Temporality::Cumulative,
            is_monotonic: self.monotonic,
        }))
    }
}

/// One cell of a pre-computed sum.
#[derive(Default)]
struct PrecomputedCell<N> {
    /// The value reported directly by the instrument.
    measured: N,
    /// The running total of attribute-filtered contributions.
    filtered: N,
}

struct PrecomputedState<N> {
    values: HashMap<AttributeSet, PrecomputedCell<N>>,
    reported: HashMap<AttributeSet, N>,
    start: SystemTime,
}

impl<N> PrecomputedState<N> {
    fn new() -> Self {
        PrecomputedState {
            values: HashMap::new(),
            reported: HashMap::new(),
            start: SystemTime::now(),
        }
    }
}

/// A pre-computed sum reported with delta temporality.
///
/// The instrument reports absolute values; emitted points are the change
/// of `measured + filtered` since the value last reported for the same
/// attribute set. `filtered` resets every cycle so the next round of
/// absolute observations folds in cleanly.
pub(crate) struct PrecomputedDeltaSum<N> {
    monotonic: bool,
    inner: Mutex<PrecomputedState<N>>,
}

impl<N: Number> PrecomputedDeltaSum<N> {
    pub(crate) fn new(monotonic: bool) -> Self {
        PrecomputedDeltaSum {
            monotonic,
            inner: Mutex::new(PrecomputedState::new()),
        }
    }
}

impl<N: Number> Aggregator<N> for PrecomputedDeltaSum<N> {
    fn aggregate(&self, measurement: N, attrs: AttributeSet) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        state.values.entry(attrs).or_default().measured = measurement;
    }

    fn aggregation(&self) -> Option<MetricData> {
        let Ok(mut guard) = self.inner.lock() else {
            return None;
        };
        let state = &mut *guard;
        if state.values.is_empty() {
            return None;
        }

        let t = SystemTime::now();
        let start = state.start;
        state.start = t;

        let mut data_points = Vec::with_capacity(state.values.len());
        for (attrs, cell) in state.values.iter_mut() {
            let current = cell.measured.add_wrapping(cell.filtered);
            let last = state.reported.get(attrs).copied().unwrap_or_default();
            let delta = current.sub_wrapping(last);
            if delta != N::default() {
                state.reported.insert(attrs.clone(), current);
            }
            cell.filtered = N::default();
            data_points.push(DataPoint {
                attributes: attrs.clone(),
                start_time: Some(start),
                time: t,
                value: delta,
            });
        }
        Some(N::make_sum(Sum {
            data_points,
            temporality: Temporality::Delta,
            is_monotonic: self.monotonic,
        }))
    }
}

impl<N: Number> PrecomputeAggregator<N> for PrecomputedDeltaSum<N> {
    fn aggregate_filtered(&self, measurement: N, attrs: AttributeSet) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        let cell = state.values.entry(attrs).or_default();
        cell.filtered = cell.filtered.add_wrapping(measurement);
    }
}

/// A pre-computed sum reported with cumulative temporality.
///
/// Emitted points are `measured + filtered`; `filtered` resets every
/// cycle, `measured` is retained, so a series that stops being observed
/// keeps reporting its last absolute value.
pub(crate) struct PrecomputedCumulativeSum<N> {
    monotonic: bool,
    inner: Mutex<PrecomputedState<N>>,
}

impl<N: Number> PrecomputedCumulativeSum<N> {
    pub(crate) fn new(monotonic: bool) -> Self {
        PrecomputedCumulativeSum {
            monotonic,
            inner: Mutex::new(PrecomputedState::new()),
        }
    }
}

impl<N: Number> Aggregator<N> for PrecomputedCumulativeSum<N> {
    fn aggregate(&self, measurement: N, attrs: AttributeSet) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        state.values.entry(attrs).or_default().measured = measurement;
    }

    fn aggregation(&self) -> Option<MetricData> {
        let Ok(mut guard) = self.inner.lock() else {
            return None;
        };
        let state = &mut *guard;
        if state.values.is_empty() {
            return None;
        }

        let t = SystemTime::now();
        let mut data_points = Vec::with_capacity(state.values.len());
        for (attrs, cell) in state.values.iter_mut() {
            let value = cell.measured.add_wrapping(cell.filtered);
            cell.filtered = N::default();
            data_points.push(DataPoint {
                attributes: attrs.clone(),
                start_time: Some(state.start),
                time: t,
                value,
            });
        }
        Some(N::make_sum(Sum {
            data_points,
            temporality: Temporality::Cumulative,
            is_monotonic: self.monotonic,
        }))
    }
}

impl<N: Number> PrecomputeAggregator<N> for PrecomputedCumulativeSum<N> {
    fn aggregate_filtered(&self, measurement: N, attrs: AttributeSet) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        let cell = state.values.entry(attrs).or_default();
        cell.filtered = cell.filtered.add_wrapping(measurement);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::KeyValue;

    fn attrs(pairs: &[(&'static str, i64)]) -> AttributeSet {
        AttributeSet::new(pairs.iter().map(|(k, v)| KeyValue::new(*k, *v)))
    }

    fn sum_points(data: MetricData) -> Vec<DataPoint<i64>> {
        match data {
            MetricData::I64Sum(sum) => sum.data_points,
            other => panic!("expected i64 sum, got {other:?}"),
        }
    }

    fn value_for(points: &[DataPoint<i64>], set: &AttributeSet) -> i64 {
        points
            .iter()
            .find(|p| &p.attributes == set)
            .unwrap_or_else(|| panic!("no point for {set:?}"))
            .value
    }

    #[test]
    fn delta_sum_covers_only_one_cycle() {
        let agg = DeltaSum::<i64>::new(true);
        let a = attrs(&[("tid", 1)]);

        agg.aggregate(3, a.clone());
        agg.aggregate(4, a.clone());
        let points = sum_points(agg.aggregation().unwrap());
        assert_eq!(value_for(&points, &a), 7);

        // A fresh cycle reports only what came in after the last read.
        agg.aggregate(10, a.clone());
        let points = sum_points(agg.aggregation().unwrap());
        assert_eq!(value_for(&points, &a), 10);

        // No measurements, nothing to report.
        assert!(agg.aggregation().is_none());
    }

    #[test]
    fn delta_sum_start_time_advances_per_cycle() {
        let agg = DeltaSum::<i64>::new(true);
        let a = attrs(&[]);

        agg.aggregate(1, a.clone());
        let first = sum_points(agg.aggregation().unwrap());
        agg.aggregate(1, a.clone());
        let second = sum_points(agg.aggregation().unwrap());

        assert_eq!(first[0].time, second[0].start_time.unwrap());
    }

    #[test]
    fn cumulative_sum_accumulates_across_cycles() {
        let agg = CumulativeSum::<i64>::new(false);
        let a = attrs(&[("tid", 1)]);
        let b = attrs(&[("tid", 2)]);

        agg.aggregate(3, a.clone());
        agg.aggregate(-1, b.clone());
        let points = sum_points(agg.aggregation().unwrap());
        assert_eq!(value_for(&points, &a), 3);
        assert_eq!(value_for(&points, &b), -1);

        agg.aggregate(4, a.clone());
        let points = sum_points(agg.aggregation().unwrap());
        assert_eq!(value_for(&points, &a), 7);
        // Untouched cells are still reported.
        assert_eq!(value_for(&points, &b), -1);
    }

    #[test]
    fn precomputed_cumulative_combines_measured_and_filtered() {
        let agg = PrecomputedCumulativeSum::<i64>::new(true);
        let a = attrs(&[("pid", 1001)]);

        agg.aggregate(50, a.clone());
        agg.aggregate_filtered(30, a.clone());
        let points = sum_points(agg.aggregation().unwrap());
        assert_eq!(value_for(&points, &a), 80);

        // `filtered` resets each cycle, `measured` is retained.
        let points = sum_points(agg.aggregation().unwrap());
        assert_eq!(value_for(&points, &a), 50);
    }

    #[test]
    fn precomputed_delta_reports_changes_since_last_report() {
        let agg = PrecomputedDeltaSum::<i64>::new(true);
        let a = attrs(&[("pid", 1001)]);

        agg.aggregate_filtered(80, a.clone());
        let points = sum_points(agg.aggregation().unwrap());
        assert_eq!(value_for(&points, &a), 80);

        agg.aggregate_filtered(91, a.clone());
        let points = sum_points(agg.aggregation().unwrap());
        assert_eq!(value_for(&points, &a), 11);

        // The absolute total fell; the delta goes negative.
        agg.aggregate_filtered(58, a.clone());
        let points = sum_points(agg.aggregation().unwrap());
        assert_eq!(value_for(&points, &a), -33);
    }

    #[test]
    fn precomputed_delta_zero_change_does_not_update_reported() {
        let agg = PrecomputedDeltaSum::<i64>::new(true);
        let a = attrs(&[("tid", 1)]);

        agg.aggregate(60, a.clone());
        let points = sum_points(agg.aggregation().unwrap());
        assert_eq!(value_for(&points, &a), 60);

        // Not re-observed: measured stays 60, delta is zero.
        let points = sum_points(agg.aggregation().unwrap());
        assert_eq!(value_for(&points, &a), 0);

        // Observed again with the same value, still zero.
        agg.aggregate(60, a.clone());
        let points = sum_points(agg.aggregation().unwrap());
        assert_eq!(value_for(&points, &a), 0);
    }
}
