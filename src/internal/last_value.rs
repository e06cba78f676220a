//! The gauge aggregator: most recent value per attribute set.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::attribute::AttributeSet;
use crate::data::{DataPoint, Gauge, MetricData};

use super::{Aggregator, Number};

struct Recorded<N> {
    value: N,
    timestamp: SystemTime,
}

/// Keeps the most recently recorded value per attribute set.
///
/// Gauges have no temporality: reading the aggregation does not clear the
/// cells, and each point carries the timestamp of its measurement.
pub(crate) struct LastValue<N> {
    values: Mutex<HashMap<AttributeSet, Recorded<N>>>,
}

impl<N: Number> LastValue<N> {
    pub(crate) fn new() -> Self {
        LastValue {
            values: Mutex::new(HashMap::new()),
        }
    }
}

impl<N: Number> Aggregator<N> for LastValue<N> {
    fn aggregate(&self, measurement: N, attrs: AttributeSet) {
        let Ok(mut values) = self.values.lock() else {
            return;
        };
        values.insert(
            attrs,
            Recorded {
                value: measurement,
                timestamp: SystemTime::now(),
            },
        );
    }

    fn aggregation(&self) -> Option<MetricData> {
        let Ok(values) = self.values.lock() else {
            return None;
        };
        if values.is_empty() {
            return None;
        }

        let data_points = values
            .iter()
            .map(|(attributes, recorded)| DataPoint {
                attributes: attributes.clone(),
                start_time: None,
                time: recorded.timestamp,
                value: recorded.value,
            })
            .collect();
        Some(N::make_gauge(Gauge { data_points }))
    }
}
