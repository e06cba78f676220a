//! A reader that drives a push exporter on a fixed interval.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::aggregation::Aggregation;
use crate::data::{ResourceMetrics, Temporality};
use crate::error::{MetricError, MetricResult};
use crate::exporter::PushMetricExporter;
use crate::instrument::InstrumentKind;
use crate::pipeline::Pipeline;
use crate::reader::{AggregationSelector, MetricProducer, MetricReader, TemporalitySelector};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

enum Message {
    Flush(mpsc::Sender<MetricResult<()>>),
    Shutdown(mpsc::Sender<MetricResult<()>>),
}

/// A [`MetricReader`] that collects on a fixed interval and pushes every
/// snapshot to a [`PushMetricExporter`].
///
/// Collection and export run on a dedicated background thread; the
/// exporter's async `export` is driven to completion there. Temporality
/// and aggregation selection delegate to the exporter.
#[derive(Clone)]
pub struct PeriodicReader {
    inner: Arc<PeriodicReaderInner>,
}

struct PeriodicReaderInner {
    exporter: Box<dyn PushMetricExporter>,
    message_sender: Mutex<mpsc::Sender<Message>>,
    pipeline: Mutex<Option<Weak<Pipeline>>>,
    producers: Vec<Box<dyn MetricProducer>>,
    is_shutdown: AtomicBool,
}

impl PeriodicReader {
    /// Starts building a periodic reader around `exporter`.
    pub fn builder<E: PushMetricExporter>(exporter: E) -> PeriodicReaderBuilder {
        PeriodicReaderBuilder {
            exporter: Box::new(exporter),
            interval: DEFAULT_INTERVAL,
            producers: Vec::new(),
        }
    }

    fn run(&self, receiver: mpsc::Receiver<Message>, interval: Duration) {
        loop {
            match receiver.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(err) = self.collect_and_export() {
                        tracing::warn!(error = %err, "periodic metric export failed");
                    }
                }
                Ok(Message::Flush(ack)) => {
                    let _ = ack.send(self.collect_and_export());
                }
                Ok(Message::Shutdown(ack)) => {
                    let mut errs = Vec::new();
                    if let Err(err) = self.collect_and_export() {
                        errs.push(err);
                    }
                    if let Err(err) = self.inner.exporter.shutdown() {
                        errs.push(err);
                    }
                    let _ = ack.send(MetricError::join(errs));
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn collect_and_export(&self) -> MetricResult<()> {
        let mut metrics = ResourceMetrics::default();
        let mut errs = Vec::new();
        match self.produce(&mut metrics) {
            // Partial snapshots are still worth exporting.
            Ok(()) | Err(MetricError::AlreadyShutdown) => {}
            Err(err) => errs.push(err),
        }
        if !metrics.scope_metrics.is_empty() {
            if let Err(err) = futures_executor::block_on(self.inner.exporter.export(&mut metrics))
            {
                errs.push(err);
            }
        }
        MetricError::join(errs)
    }

    /// Collects from the registered pipeline and the external producers.
    fn produce(&self, metrics: &mut ResourceMetrics) -> MetricResult<()> {
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

    fn send_and_wait(
        &self,
        make_message: impl FnOnce(mpsc::Sender<MetricResult<()>>) -> Message,
    ) -> MetricResult<()> {
        let (ack_sender, ack_receiver) = mpsc::channel();
        {
            let Ok(sender) = self.inner.message_sender.lock() else {
                return Err(MetricError::Other("reader lock poisoned".into()));
            };
            sender
                .send(make_message(ack_sender))
                .map_err(|_| MetricError::Other("periodic reader worker is gone".into()))?;
        }
        ack_receiver
            .recv()
            .map_err(|_| MetricError::Other("periodic reader worker is gone".into()))?
    }
}

impl fmt::Debug for PeriodicReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicReader")
            .field("exporter", &self.inner.exporter)
            .finish()
    }
}

impl TemporalitySelector for PeriodicReader {
    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.inner.exporter.temporality(kind)
    }
}

impl AggregationSelector for PeriodicReader {
    fn aggregation(&self, kind: InstrumentKind) -> Aggregation {
        self.inner.exporter.aggregation(kind)
    }
}

impl MetricReader for PeriodicReader {
    fn register_pipeline(&self, pipeline: Weak<Pipeline>) {
        if let Ok(mut guard) = self.inner.pipeline.lock() {
            *guard = Some(pipeline);
        }
    }

    fn collect(&self, metrics: &mut ResourceMetrics) -> MetricResult<()> {
        if self.inner.is_shutdown.load(Ordering::Acquire) {
            return Err(MetricError::AlreadyShutdown);
        }
        self.produce(metrics)
    }

    fn force_flush(&self) -> MetricResult<()> {
        if self.inner.is_shutdown.load(Ordering::Acquire) {
            return Err(MetricError::AlreadyShutdown);
        }
        self.send_and_wait(Message::Flush)
    }

    fn shutdown(&self) -> MetricResult<()> {
        if self.inner.is_shutdown.swap(true, Ordering::AcqRel) {
            return Err(MetricError::AlreadyShutdown);
        }
        self.send_and_wait(Message::Shutdown)
    }
}

/// Builder for [`PeriodicReader`].
pub struct PeriodicReaderBuilder {
    exporter: Box<dyn PushMetricExporter>,
    interval: Duration,
    producers: Vec<Box<dyn MetricProducer>>,
}

impl fmt::Debug for PeriodicReaderBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PeriodicReaderBuilder")
    }
}

impl PeriodicReaderBuilder {
    /// Sets the collection interval, 60 seconds by default.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Adds an external producer whose metrics are merged into every
    /// collection.
    pub fn with_producer(mut self, producer: impl MetricProducer) -> Self {
        self.producers.push(Box::new(producer));
        self
    }

    /// Finishes the reader and spawns its worker thread.
    pub fn build(self) -> PeriodicReader {
        let (sender, receiver) = mpsc::channel();
        let reader = PeriodicReader {
            inner: Arc::new(PeriodicReaderInner {
                exporter: self.exporter,
                message_sender: Mutex::new(sender),
                pipeline: Mutex::new(None),
                producers: self.producers,
                is_shutdown: AtomicBool::new(false),
            }),
        };

        let worker = reader.clone();
        let interval = self.interval;
        let spawned = thread::Builder::new()
            .name("MetricsCore.PeriodicReader".to_string())
            .spawn(move || worker.run(receiver, interval));
        if let Err(err) = spawned {
            tracing::error!(error = %err, "failed to spawn the periodic reader worker thread");
        }
        reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    use crate::provider::MeterProvider;
    use crate::reader::default_aggregation;

    #[derive(Clone, Debug, Default)]
    struct InMemoryExporter {
        exports: Arc<Mutex<Vec<ResourceMetrics>>>,
        shutdown: Arc<AtomicBool>,
    }

    impl TemporalitySelector for InMemoryExporter {
        fn temporality(&self, _kind: InstrumentKind) -> Temporality {
            Temporality::Cumulative
        }
    }

    impl AggregationSelector for InMemoryExporter {
        fn aggregation(&self, kind: InstrumentKind) -> Aggregation {
            default_aggregation(kind)
        }
    }

    #[async_trait]
    impl PushMetricExporter for InMemoryExporter {
        async fn export(&self, metrics: &mut ResourceMetrics) -> MetricResult<()> {
            self.exports.lock().unwrap().push(metrics.clone());
            Ok(())
        }

        async fn force_flush(&self) -> MetricResult<()> {
            Ok(())
        }

        fn shutdown(&self) -> MetricResult<()> {
            self.shutdown.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn exported_metric_names(exporter: &InMemoryExporter) -> Vec<String> {
        exporter
            .exports
            .lock()
            .unwrap()
            .iter()
            .flat_map(|rm| rm.scope_metrics.iter())
            .flat_map(|sm| sm.metrics.iter())
            .map(|m| m.name.to_string())
            .collect()
    }

    #[test]
    fn force_flush_exports_current_state() {
        let exporter = InMemoryExporter::default();
        let reader = PeriodicReader::builder(exporter.clone())
            .with_interval(Duration::from_secs(3600))
            .build();
        let provider = MeterProvider::builder()
            .with_reader(reader.clone())
            .build();

        let meter = provider.meter("flush");
        meter.i64_counter("requests").build().add(5, &[]);

        MetricReader::force_flush(&reader).unwrap();
        assert!(exported_metric_names(&exporter).contains(&"requests".to_string()));
    }

    #[test]
    fn shutdown_runs_a_final_export_and_is_terminal() {
        let exporter = InMemoryExporter::default();
        let reader = PeriodicReader::builder(exporter.clone())
            .with_interval(Duration::from_secs(3600))
            .build();
        let provider = MeterProvider::builder()
            .with_reader(reader.clone())
            .build();

        let meter = provider.meter("shutdown");
        meter.i64_counter("final").build().add(1, &[]);

        MetricReader::shutdown(&reader).unwrap();
        assert!(exporter.shutdown.load(Ordering::SeqCst));
        assert!(exported_metric_names(&exporter).contains(&"final".to_string()));

        assert!(matches!(
            MetricReader::shutdown(&reader),
            Err(MetricError::AlreadyShutdown)
        ));
    }

    #[test]
    fn interval_collection_exports_without_prompting() {
        let exporter = InMemoryExporter::default();
        let reader = PeriodicReader::builder(exporter.clone())
            .with_interval(Duration::from_millis(10))
            .build();
        let provider = MeterProvider::builder()
            .with_reader(reader.clone())
            .build();

        let meter = provider.meter("ticker");
        meter.i64_counter("ticks").build().add(1, &[]);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while exported_metric_names(&exporter).is_empty() {
            assert!(
                std::time::Instant::now() < deadline,
                "no periodic export within five seconds"
            );
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exporter_can_be_driven_from_an_async_runtime() {
        let exporter = InMemoryExporter::default();
        let mut metrics = ResourceMetrics::default();
        exporter.export(&mut metrics).await.unwrap();
        exporter.force_flush().await.unwrap();
        assert_eq!(exporter.exports.lock().unwrap().len(), 1);
    }
}
