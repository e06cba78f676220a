//! Attribute-filter wrappers around aggregators.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::attribute::AttributeSet;
use crate::data::MetricData;
use crate::instrument::AttributeFilter;

use super::{Aggregator, Number, PrecomputeAggregator};

/// Memo of input set to filtered set. Filtering is deterministic per
/// input, so each distinct set is filtered once.
///
/// The memo grows with the number of distinct input sets and is never
/// pruned.
struct Seen {
    predicate: AttributeFilter,
    memo: Mutex<HashMap<AttributeSet, AttributeSet>>,
}

impl Seen {
    fn new(predicate: AttributeFilter) -> Self {
        Seen {
            predicate,
            memo: Mutex::new(HashMap::new()),
        }
    }

    fn filtered(&self, attrs: AttributeSet) -> AttributeSet {
        let Ok(mut memo) = self.memo.lock() else {
            return attrs.filter(|kv| (self.predicate)(kv));
        };
        if let Some(filtered) = memo.get(&attrs) {
            return filtered.clone();
        }
        let filtered = attrs.filter(|kv| (self.predicate)(kv));
        memo.insert(attrs, filtered.clone());
        filtered
    }
}

/// Filters attributes before delegating to an incremental aggregator.
///
/// Distinct input sets collapsing onto the same filtered set sum, because
/// every delegated `aggregate` call adds to the cell.
pub(crate) struct Filter<N> {
    seen: Seen,
    aggregator: Arc<dyn Aggregator<N>>,
}

impl<N: Number> Filter<N> {
    pub(crate) fn new(aggregator: Arc<dyn Aggregator<N>>, predicate: AttributeFilter) -> Self {
        Filter {
            seen: Seen::new(predicate),
            aggregator,
        }
    }
}

impl<N: Number> Aggregator<N> for Filter<N> {
    fn aggregate(&self, measurement: N, attrs: AttributeSet) {
        self.aggregator
            .aggregate(measurement, self.seen.filtered(attrs));
    }

    fn aggregation(&self) -> Option<MetricData> {
        self.aggregator.aggregation()
    }
}

/// Filters attributes before delegating to a pre-computed aggregator.
///
/// Delegation goes through `aggregate_filtered` rather than `aggregate`:
/// pre-computed cells treat directly measured values as overwrites, and
/// several sources collapsing onto one filtered set must combine by
/// addition instead.
pub(crate) struct PrecomputedFilter<N> {
    seen: Seen,
    aggregator: Arc<dyn PrecomputeAggregator<N>>,
}

impl<N: Number> PrecomputedFilter<N> {
    pub(crate) fn new(
        aggregator: Arc<dyn PrecomputeAggregator<N>>,
        predicate: AttributeFilter,
    ) -> Self {
        PrecomputedFilter {
            seen: Seen::new(predicate),
            aggregator,
        }
    }
}

impl<N: Number> Aggregator<N> for PrecomputedFilter<N> {
    fn aggregate(&self, measurement: N, attrs: AttributeSet) {
        self.aggregator
            .aggregate_filtered(measurement, self.seen.filtered(attrs));
    }

    fn aggregation(&self) -> Option<MetricData> {
        self.aggregator.aggregation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::KeyValue;
    use crate::data::DataPoint;
    use crate::internal::{CumulativeSum, PrecomputedCumulativeSum};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn keep_foo() -> AttributeFilter {
        Arc::new(|kv: &KeyValue| kv.key.as_str() == "foo")
    }

    fn sum_points(data: MetricData) -> Vec<DataPoint<i64>> {
        match data {
            MetricData::I64Sum(sum) => sum.data_points,
            other => panic!("expected i64 sum, got {other:?}"),
        }
    }

    #[test]
    fn incremental_filter_sums_collapsing_sets() {
        let filter = Filter::new(Arc::new(CumulativeSum::<i64>::new(true)), keep_foo());

        filter.aggregate(
            1,
            AttributeSet::new([KeyValue::new("foo", "bar"), KeyValue::new("version", 1)]),
        );
        filter.aggregate(2, AttributeSet::new([KeyValue::new("foo", "bar")]));
        filter.aggregate(
            1,
            AttributeSet::new([KeyValue::new("foo", "bar"), KeyValue::new("version", 2)]),
        );

        let points = sum_points(filter.aggregation().unwrap());
        assert_eq!(points.len(), 1);
        assert_eq!(
            points[0].attributes,
            AttributeSet::new([KeyValue::new("foo", "bar")])
        );
        assert_eq!(points[0].value, 4);
    }

    #[test]
    fn precomputed_filter_folds_by_addition() {
        let filter = PrecomputedFilter::new(
            Arc::new(PrecomputedCumulativeSum::<i64>::new(true)),
            keep_foo(),
        );

        // Three absolute observations collapsing onto {foo=bar} must add,
        // not overwrite each other.
        filter.aggregate(
            1,
            AttributeSet::new([KeyValue::new("foo", "bar"), KeyValue::new("version", 1)]),
        );
        filter.aggregate(2, AttributeSet::new([KeyValue::new("foo", "bar")]));
        filter.aggregate(
            1,
            AttributeSet::new([KeyValue::new("foo", "bar"), KeyValue::new("version", 2)]),
        );

        let points = sum_points(filter.aggregation().unwrap());
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 4);
    }

    #[test]
    fn filtering_is_memoised_per_input_set() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = {
            let calls = calls.clone();
            Arc::new(move |kv: &KeyValue| {
                calls.fetch_add(1, Ordering::Relaxed);
                kv.key.as_str() == "foo"
            }) as AttributeFilter
        };
        let filter = Filter::new(Arc::new(CumulativeSum::<i64>::new(true)), counted);

        let set = AttributeSet::new([KeyValue::new("foo", "bar"), KeyValue::new("version", 1)]);
        filter.aggregate(1, set.clone());
        let after_first = calls.load(Ordering::Relaxed);
        filter.aggregate(1, set.clone());
        filter.aggregate(1, set);

        assert_eq!(
            calls.load(Ordering::Relaxed),
            after_first,
            "repeated sets must hit the memo"
        );
    }
}
