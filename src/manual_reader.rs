//! A reader that collects only when explicitly asked to.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::aggregation::Aggregation;
use crate::data::{ResourceMetrics, Temporality};
use crate::error::{MetricError, MetricResult};
use crate::instrument::InstrumentKind;
use crate::pipeline::Pipeline;
use crate::reader::{
    AggregationSelector, DefaultAggregationSelector, DefaultTemporalitySelector, MetricProducer,
    MetricReader, TemporalitySelector,
};

/// A [`MetricReader`] driven entirely by explicit [`collect`] calls,
/// typically by an exporter bridging to a pull-based consumer.
///
/// Cloning is cheap and clones share the same state, so a clone can be
/// handed to the provider while the caller keeps collecting through its
/// own handle.
///
/// [`collect`]: ManualReader::collect
#[derive(Clone)]
pub struct ManualReader {
    inner: Arc<ManualReaderInner>,
}

struct ManualReaderInner {
    pipeline: Mutex<Option<Weak<Pipeline>>>,
    is_shutdown: AtomicBool,
    temporality: Box<dyn TemporalitySelector>,
    aggregation: Box<dyn AggregationSelector>,
    producers: Vec<Box<dyn MetricProducer>>,
}

impl ManualReader {
    /// Starts building a manual reader.
    pub fn builder() -> ManualReaderBuilder {
        ManualReaderBuilder::default()
    }

    /// Runs a collection cycle, filling `metrics` in place.
    ///
    /// Callback and producer errors are joined into the returned error;
    /// the snapshot still holds everything that was gathered.
    pub fn collect(&self, metrics: &mut ResourceMetrics) -> MetricResult<()> {
        if self.inner.is_shutdown.load(Ordering::Acquire) {
            return Err(MetricError::AlreadyShutdown);
        }
        let pipeline = {
            let Ok(guard) = self.inner.pipeline.lock() else {
                return Err(MetricError::Other("reader lock poisoned".into()));
            };
            match &*guard {
                Some(weak) => weak.clone(),
                None => {
                    return Err(MetricError::Other(
                        "reader is not registered with a meter provider".into(),
                    ))
                }
            }
        };
        let Some(pipeline) = pipeline.upgrade() else {
            return Err(MetricError::Other(
                "meter provider of this reader is gone".into(),
            ));
        };

        let mut errs = Vec::new();
        if let Err(err) = pipeline.produce(metrics) {
            errs.push(err);
        }
        for producer in &self.inner.producers {
            if let Err(err) = producer.produce(&mut metrics.scope_metrics) {
                errs.push(err);
            }
        }
        MetricError::join(errs)
    }
}

impl Default for ManualReader {
    fn default() -> Self {
        ManualReader::builder().build()
    }
}

impl fmt::Debug for ManualReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualReader")
            .field(
                "registered",
                &self
                    .inner
                    .pipeline
                    .lock()
                    .map(|p| p.is_some())
                    .unwrap_or(false),
            )
            .field("shutdown", &self.inner.is_shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl TemporalitySelector for ManualReader {
    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.inner.temporality.temporality(kind)
    }
}

impl AggregationSelector for ManualReader {
    fn aggregation(&self, kind: InstrumentKind) -> Aggregation {
        self.inner.aggregation.aggregation(kind)
    }
}

impl MetricReader for ManualReader {
    fn register_pipeline(&self, pipeline: Weak<Pipeline>) {
        if let Ok(mut guard) = self.inner.pipeline.lock() {
            *guard = Some(pipeline);
        }
    }

    fn collect(&self, metrics: &mut ResourceMetrics) -> MetricResult<()> {
        ManualReader::collect(self, metrics)
    }

    fn force_flush(&self) -> MetricResult<()> {
        if self.inner.is_shutdown.load(Ordering::Acquire) {
            return Err(MetricError::AlreadyShutdown);
        }
        Ok(())
    }

    fn shutdown(&self) -> MetricResult<()> {
        if self.inner.is_shutdown.swap(true, Ordering::AcqRel) {
            return Err(MetricError::AlreadyShutdown);
        }
        Ok(())
    }
}

/// Builder for [`ManualReader`].
pub struct ManualReaderBuilder {
    temporality: Box<dyn TemporalitySelector>,
    aggregation: Box<dyn AggregationSelector>,
    producers: Vec<Box<dyn MetricProducer>>,
}

impl Default for ManualReaderBuilder {
    fn default() -> Self {
        ManualReaderBuilder {
            temporality: Box::new(DefaultTemporalitySelector),
            aggregation: Box::new(DefaultAggregationSelector),
            producers: Vec::new(),
        }
    }
}

impl fmt::Debug for ManualReaderBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ManualReaderBuilder")
    }
}

impl ManualReaderBuilder {
    /// Overrides the per-kind temporality selection.
    pub fn with_temporality_selector(
        mut self,
        selector: impl TemporalitySelector + 'static,
    ) -> Self {
        self.temporality = Box::new(selector);
        self
    }

    /// Overrides the per-kind default aggregation selection.
    pub fn with_aggregation_selector(
        mut self,
        selector: impl AggregationSelector + 'static,
    ) -> Self {
        self.aggregation = Box::new(selector);
        self
    }

    /// Adds an external producer whose metrics are merged into every
    /// collection.
    pub fn with_producer(mut self, producer: impl MetricProducer) -> Self {
        self.producers.push(Box::new(producer));
        self
    }

    /// Finishes the reader.
    pub fn build(self) -> ManualReader {
        ManualReader {
            inner: Arc::new(ManualReaderInner {
                pipeline: Mutex::new(None),
                is_shutdown: AtomicBool::new(false),
                temporality: self.temporality,
                aggregation: self.aggregation,
                producers: self.producers,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Metric, MetricData, ScopeMetrics, Sum};
    use crate::instrumentation::Scope;
    use crate::provider::MeterProvider;

    #[derive(Debug)]
    struct FixedProducer;

    impl MetricProducer for FixedProducer {
        fn produce(&self, scope_metrics: &mut Vec<ScopeMetrics>) -> MetricResult<()> {
            scope_metrics.push(ScopeMetrics {
                scope: Scope::new("external"),
                metrics: vec![Metric {
                    name: "bridged".into(),
                    description: "".into(),
                    unit: "".into(),
                    data: MetricData::I64Sum(Sum {
                        data_points: Vec::new(),
                        temporality: Temporality::Cumulative,
                        is_monotonic: true,
                    }),
                }],
            });
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FailingProducer;

    impl MetricProducer for FailingProducer {
        fn produce(&self, scope_metrics: &mut Vec<ScopeMetrics>) -> MetricResult<()> {
            // Partial data arrives even though the producer errors.
            scope_metrics.push(ScopeMetrics {
                scope: Scope::new("partial"),
                metrics: Vec::new(),
            });
            Err(MetricError::Other("bridge broke".into()))
        }
    }

    #[test]
    fn unregistered_reader_fails_to_collect() {
        let reader = ManualReader::default();
        let mut rm = ResourceMetrics::default();
        assert!(reader.collect(&mut rm).is_err());
    }

    #[test]
    fn producer_output_is_appended_to_snapshots() {
        let reader = ManualReader::builder().with_producer(FixedProducer).build();
        let provider = MeterProvider::builder()
            .with_reader(reader.clone())
            .build();
        let meter = provider.meter("app");
        meter.i64_counter("local").build().add(1, &[]);

        let mut rm = ResourceMetrics::default();
        reader.collect(&mut rm).unwrap();

        let scopes: Vec<_> = rm
            .scope_metrics
            .iter()
            .map(|sm| sm.scope.name())
            .collect();
        assert!(scopes.contains(&"app"));
        assert!(scopes.contains(&"external"));
    }

    #[test]
    fn producer_errors_join_but_data_is_kept() {
        let reader = ManualReader::builder()
            .with_producer(FailingProducer)
            .build();
        let provider = MeterProvider::builder()
            .with_reader(reader.clone())
            .build();
        let meter = provider.meter("app");
        meter.i64_counter("local").build().add(1, &[]);

        let mut rm = ResourceMetrics::default();
        let err = reader.collect(&mut rm).unwrap_err();
        assert!(matches!(err, MetricError::Other(_)));
        assert_eq!(rm.scope_metrics.len(), 2);
    }

    #[test]
    fn collect_after_shutdown_fails() {
        let reader = ManualReader::default();
        let provider = MeterProvider::builder()
            .with_reader(reader.clone())
            .build();
        drop(provider);

        let mut rm = ResourceMetrics::default();
        assert!(matches!(
            reader.collect(&mut rm),
            Err(MetricError::AlreadyShutdown)
        ));
    }

    #[test]
    fn shutdown_is_terminal() {
        let reader = ManualReader::default();
        assert!(MetricReader::shutdown(&reader).is_ok());
        assert!(matches!(
            MetricReader::shutdown(&reader),
            Err(MetricError::AlreadyShutdown)
        ));
    }
}
