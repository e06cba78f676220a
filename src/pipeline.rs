//! The per-reader pipeline connecting instruments to collection.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::aggregation::Aggregation;
use crate::data::{Metric, MetricData, ResourceMetrics, ScopeMetrics, Temporality};
use crate::error::{MetricError, MetricResult};
use crate::instrument::{Instrument, InstrumentKind, Stream};
use crate::instrumentation::Scope;
use crate::internal::{self, Aggregator, Number};
use crate::reader::MetricReader;
use crate::resource::Resource;
use crate::view::View;

/// One output stream of an instrument registered with a pipeline: its
/// descriptor plus the closure producing its aggregation snapshot.
struct InstrumentSync {
    name: Cow<'static, str>,
    description: Cow<'static, str>,
    unit: Cow<'static, str>,
    comp_agg: Box<dyn Fn() -> Option<MetricData> + Send + Sync>,
}

/// A callback registered through `Meter::register_callback`, shared by
/// every pipeline and removable through its registration handle.
pub(crate) struct CallbackEntry {
    callback: Box<dyn Fn() -> MetricResult<()> + Send + Sync>,
    unregistered: AtomicBool,
    /// Threads currently executing the callback. Distinct readers may
    /// collect in parallel, so several invocations can be in flight.
    running_on: Mutex<Vec<ThreadId>>,
    finished: Condvar,
}

impl CallbackEntry {
    pub(crate) fn new(callback: Box<dyn Fn() -> MetricResult<()> + Send + Sync>) -> Self {
        CallbackEntry {
            callback,
            unregistered: AtomicBool::new(false),
            running_on: Mutex::new(Vec::new()),
            finished: Condvar::new(),
        }
    }

    /// Runs the callback with its in-flight state published, so
    /// [`unregister`](CallbackEntry::unregister) can await completion
    /// from other threads.
    fn invoke(&self) -> MetricResult<()> {
        if let Ok(mut running_on) = self.running_on.lock() {
            running_on.push(thread::current().id());
        }
        let _finished = FinishedGuard(self);
        // Re-checked after publishing the running state: an unregister
        // that won the race must not see one more invocation.
        if self.is_unregistered() {
            return Ok(());
        }
        (self.callback)()
    }

    /// Marks the callback dead and waits for invocations in flight on
    /// other threads to finish before returning. A callback
    /// unregistering itself from inside its own invocation returns
    /// immediately instead of deadlocking on its own completion.
    /// Idempotent and terminal; pipelines drop the entry during their
    /// next collection cycle.
    pub(crate) fn unregister(&self) {
        self.unregistered.store(true, Ordering::Release);
        let current = thread::current().id();
        let Ok(mut running_on) = self.running_on.lock() else {
            return;
        };
        loop {
            if running_on.is_empty() || running_on.contains(&current) {
                return;
            }
            match self.finished.wait(running_on) {
                Ok(guard) => running_on = guard,
                Err(_) => return,
            }
        }
    }

    fn is_unregistered(&self) -> bool {
        self.unregistered.load(Ordering::Acquire)
    }
}

/// Clears the in-flight marker and wakes unregister waiters, also when
/// the callback panics.
struct FinishedGuard<'a>(&'a CallbackEntry);

impl Drop for FinishedGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running_on) = self.0.running_on.lock() {
            let current = thread::current().id();
            if let Some(idx) = running_on.iter().position(|id| *id == current) {
                running_on.swap_remove(idx);
            }
        }
        self.0.finished.notify_all();
    }
}

#[derive(Default)]
struct PipelineInner {
    aggregations: HashMap<Scope, Vec<InstrumentSync>>,
    callbacks: Vec<Arc<dyn Fn() -> MetricResult<()> + Send + Sync>>,
    multi_callbacks: Vec<Arc<CallbackEntry>>,
}

/// Connects all the instruments created by a meter provider to one
/// [`MetricReader`].
///
/// The struct is opaque; readers only hold a `Weak` handle to the
/// pipeline they drain.
pub struct Pipeline {
    pub(crate) resource: Resource,
    pub(crate) views: Arc<[View]>,
    pub(crate) reader: Box<dyn MetricReader>,
    inner: Mutex<PipelineInner>,
}

impl Pipeline {
    fn new(resource: Resource, views: Arc<[View]>, reader: Box<dyn MetricReader>) -> Self {
        Pipeline {
            resource,
            views,
            reader,
            inner: Mutex::new(PipelineInner::default()),
        }
    }

    fn add_instrument_sync(&self, scope: Scope, sync: InstrumentSync) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.aggregations.entry(scope).or_default().push(sync);
        }
    }

    fn register_callback(&self, callback: Arc<dyn Fn() -> MetricResult<()> + Send + Sync>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.callbacks.push(callback);
        }
    }

    fn register_multi_callback(&self, entry: Arc<CallbackEntry>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.multi_callbacks.push(entry);
        }
    }

    /// Runs one collection cycle: invokes the live callbacks, snapshots
    /// every aggregator and assembles the scope-grouped result into
    /// `metrics`.
    ///
    /// The pipeline mutex is held for the whole cycle, serialising
    /// concurrent collections on the same reader. Callback errors are
    /// gathered and joined; the snapshot is still assembled.
    pub fn produce(&self, metrics: &mut ResourceMetrics) -> MetricResult<()> {
        let Ok(mut inner) = self.inner.lock() else {
            return Err(MetricError::Other("pipeline lock poisoned".into()));
        };

        inner.multi_callbacks.retain(|entry| !entry.is_unregistered());

        let mut errs = Vec::new();
        for callback in &inner.callbacks {
            if let Err(err) = (**callback)() {
                errs.push(err);
            }
        }
        for entry in &inner.multi_callbacks {
            if entry.is_unregistered() {
                continue;
            }
            if let Err(err) = entry.invoke() {
                errs.push(err);
            }
        }

        metrics.resource = self.resource.clone();
        metrics.scope_metrics.clear();
        for (scope, instruments) in &inner.aggregations {
            let scoped: Vec<Metric> = instruments
                .iter()
                .filter_map(|sync| {
                    (sync.comp_agg)().map(|data| Metric {
                        name: sync.name.clone(),
                        description: sync.description.clone(),
                        unit: sync.unit.clone(),
                        data,
                    })
                })
                .collect();
            if !scoped.is_empty() {
                metrics.scope_metrics.push(ScopeMetrics {
                    scope: scope.clone(),
                    metrics: scoped,
                });
            }
        }
        metrics
            .scope_metrics
            .sort_by(|a, b| a.scope.name().cmp(b.scope.name()));

        MetricError::join(errs)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("resource", &self.resource)
            .field("reader", &self.reader)
            .finish()
    }
}

/// The pipelines of a provider, one per configured reader.
pub(crate) struct Pipelines(Vec<Arc<Pipeline>>);

impl Pipelines {
    pub(crate) fn new(
        resource: Resource,
        views: Vec<View>,
        readers: Vec<Box<dyn MetricReader>>,
    ) -> Self {
        let views: Arc<[View]> = views.into();
        let mut pipelines = Vec::with_capacity(readers.len());
        for reader in readers {
            let pipeline = Arc::new(Pipeline::new(resource.clone(), Arc::clone(&views), reader));
            pipeline.reader.register_pipeline(Arc::downgrade(&pipeline));
            pipelines.push(pipeline);
        }
        Pipelines(pipelines)
    }

    pub(crate) fn register_callback(
        &self,
        callback: Arc<dyn Fn() -> MetricResult<()> + Send + Sync>,
    ) {
        for pipeline in &self.0 {
            pipeline.register_callback(Arc::clone(&callback));
        }
    }

    pub(crate) fn register_multi_callback(&self, entry: Arc<CallbackEntry>) {
        for pipeline in &self.0 {
            pipeline.register_multi_callback(Arc::clone(&entry));
        }
    }

    pub(crate) fn force_flush(&self) -> MetricResult<()> {
        let errs = self
            .0
            .iter()
            .filter_map(|pipeline| pipeline.reader.force_flush().err())
            .collect();
        MetricError::join(errs)
    }

    pub(crate) fn shutdown(&self) -> MetricResult<()> {
        let errs = self
            .0
            .iter()
            .filter_map(|pipeline| pipeline.reader.shutdown().err())
            .collect();
        MetricError::join(errs)
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<Pipeline>> {
        self.0.iter()
    }
}

impl fmt::Debug for Pipelines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pipelines({})", self.0.len())
    }
}

/// The full identity of one output stream, used to collapse identical
/// streams onto one aggregator and to detect conflicting ones.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct StreamId {
    name: Cow<'static, str>,
    description: Cow<'static, str>,
    unit: Cow<'static, str>,
    aggregation: &'static str,
    temporality: Temporality,
    monotonic: bool,
    number: &'static str,
}

/// Streams conflict per meter when they share a case-insensitive name and
/// unit but differ elsewhere.
type StreamKey = (String, Cow<'static, str>);

pub(crate) type StreamIds = Arc<Mutex<HashMap<StreamKey, StreamId>>>;

pub(crate) fn new_stream_ids() -> StreamIds {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Resolves the aggregators an instrument fans out to, one inserter per
/// pipeline.
pub(crate) struct Resolver<N: Number> {
    inserters: Vec<Inserter<N>>,
}

impl<N: Number> Resolver<N> {
    pub(crate) fn new(pipelines: &Arc<Pipelines>, stream_ids: StreamIds) -> Self {
        Resolver {
            inserters: pipelines
                .iter()
                .map(|pipeline| Inserter::new(Arc::clone(pipeline), Arc::clone(&stream_ids)))
                .collect(),
        }
    }

    /// Resolves `instrument` against every pipeline, returning the
    /// aggregators its measurements must reach plus any per-stream
    /// configuration errors. Partial failure still yields the aggregators
    /// that resolved cleanly.
    pub(crate) fn measures(
        &self,
        instrument: &Instrument,
        kind: InstrumentKind,
    ) -> (Vec<Arc<dyn Aggregator<N>>>, Vec<MetricError>) {
        let mut measures = Vec::new();
        let mut errs = Vec::new();
        for inserter in &self.inserters {
            let (resolved, mut inserter_errs) = inserter.instrument(instrument, kind);
            measures.extend(resolved);
            errs.append(&mut inserter_errs);
        }
        (measures, errs)
    }
}

/// Inserts the streams of newly created instruments into one pipeline.
struct Inserter<N: Number> {
    pipeline: Arc<Pipeline>,
    /// Aggregators created for this (meter, pipeline), keyed by full
    /// stream identity. `None` records a dropped or rejected stream.
    cache: Mutex<HashMap<StreamId, Option<Arc<dyn Aggregator<N>>>>>,
    /// Stream identities across the whole meter, for duplicate detection.
    stream_ids: StreamIds,
}

impl<N: Number> Inserter<N> {
    fn new(pipeline: Arc<Pipeline>, stream_ids: StreamIds) -> Self {
        Inserter {
            pipeline,
            cache: Mutex::new(HashMap::new()),
            stream_ids,
        }
    }

    /// Resolves every stream the pipeline's views produce for
    /// `instrument`, or the default stream when no view matches, so the
    /// instrument always owns at least one stream candidate.
    fn instrument(
        &self,
        instrument: &Instrument,
        kind: InstrumentKind,
    ) -> (Vec<Arc<dyn Aggregator<N>>>, Vec<MetricError>) {
        let mut measures = Vec::new();
        let mut errs = Vec::new();
        let mut seen = HashSet::new();
        let mut matched = false;

        for view in self.pipeline.views.iter() {
            if !view.matches(instrument) {
                continue;
            }
            matched = true;
            let stream = view.stream(instrument);
            match self.cached_aggregator(&instrument.scope, kind, stream, &mut seen) {
                Ok(Some(aggregator)) => measures.push(aggregator),
                Ok(None) => {}
                Err(err) => errs.push(err),
            }
        }

        if matched {
            return (measures, errs);
        }

        let stream = Stream {
            name: instrument.name.clone(),
            description: instrument.description.clone(),
            unit: instrument.unit.clone(),
            aggregation: None,
            attribute_filter: None,
        };
        match self.cached_aggregator(&instrument.scope, kind, stream, &mut seen) {
            Ok(Some(aggregator)) => measures.push(aggregator),
            Ok(None) => {}
            Err(err) => errs.push(err),
        }
        (measures, errs)
    }

    /// Returns the aggregator backing `stream`, creating and registering
    /// it on first use.
    ///
    /// An identical stream seen before collapses onto the cached
    /// aggregator; a stream sharing (name, unit) with a different
    /// identity is a duplicate, reported as a diagnostic and rejected.
    fn cached_aggregator(
        &self,
        scope: &Scope,
        kind: InstrumentKind,
        stream: Stream,
        seen: &mut HashSet<StreamId>,
    ) -> MetricResult<Option<Arc<dyn Aggregator<N>>>> {
        let mut aggregation = stream
            .aggregation
            .clone()
            .unwrap_or_else(|| self.pipeline.reader.aggregation(kind));
        if aggregation == Aggregation::Default {
            aggregation = crate::reader::default_aggregation(kind);
        }
        aggregation.validate()?;
        if !is_aggregation_compatible(&aggregation, kind) {
            return Err(MetricError::Config(format!(
                "incompatible aggregation {} for {kind:?} stream {:?}",
                aggregation.kind_name(),
                stream.name,
            )));
        }

        let temporality = self.pipeline.reader.temporality(kind);
        let id = StreamId {
            name: stream.name.clone(),
            description: stream.description.clone(),
            unit: stream.unit.clone(),
            aggregation: aggregation.kind_name(),
            temporality,
            monotonic: kind.monotonic(),
            number: std::any::type_name::<N>(),
        };

        // The same view set may produce one stream twice for a single
        // instrument; fan out to its aggregator only once.
        if !seen.insert(id.clone()) {
            return Ok(None);
        }

        {
            let Ok(mut ids) = self.stream_ids.lock() else {
                return Err(MetricError::Other("stream registry lock poisoned".into()));
            };
            let key = (id.name.to_lowercase(), id.unit.clone());
            match ids.get(&key) {
                Some(existing) if *existing != id => {
                    tracing::warn!(
                        name = %id.name,
                        unit = %id.unit,
                        "duplicate metric stream definitions; the conflicting stream is dropped"
                    );
                    return Ok(None);
                }
                Some(_) => {}
                None => {
                    ids.insert(key, id.clone());
                }
            }
        }

        let Ok(mut cache) = self.cache.lock() else {
            return Err(MetricError::Other("aggregator cache lock poisoned".into()));
        };
        if let Some(cached) = cache.get(&id) {
            return Ok(cached.clone());
        }

        let aggregator = internal::resolve_aggregator::<N>(
            kind,
            &aggregation,
            temporality,
            stream.attribute_filter.clone(),
        );
        if let Some(aggregator) = &aggregator {
            let snapshot = Arc::clone(aggregator);
            self.pipeline.add_instrument_sync(
                scope.clone(),
                InstrumentSync {
                    name: stream.name,
                    description: stream.description,
                    unit: stream.unit,
                    comp_agg: Box::new(move || snapshot.aggregation()),
                },
            );
        }
        cache.insert(id, aggregator.clone());
        Ok(aggregator)
    }
}

/// Whether an aggregation can meaningfully fold measurements of the given
/// instrument kind.
fn is_aggregation_compatible(aggregation: &Aggregation, kind: InstrumentKind) -> bool {
    match aggregation {
        Aggregation::Drop | Aggregation::Default => true,
        Aggregation::Sum => matches!(
            kind,
            InstrumentKind::Counter
                | InstrumentKind::UpDownCounter
                | InstrumentKind::Histogram
                | InstrumentKind::ObservableCounter
                | InstrumentKind::ObservableUpDownCounter
        ),
        Aggregation::LastValue => matches!(kind, InstrumentKind::ObservableGauge),
        Aggregation::ExplicitBucketHistogram { .. } => matches!(
            kind,
            InstrumentKind::Counter | InstrumentKind::UpDownCounter | InstrumentKind::Histogram
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_is_incompatible_with_gauges() {
        assert!(!is_aggregation_compatible(
            &Aggregation::Sum,
            InstrumentKind::ObservableGauge
        ));
        assert!(is_aggregation_compatible(
            &Aggregation::Sum,
            InstrumentKind::Counter
        ));
    }

    #[test]
    fn last_value_requires_an_observable_gauge() {
        assert!(is_aggregation_compatible(
            &Aggregation::LastValue,
            InstrumentKind::ObservableGauge
        ));
        assert!(!is_aggregation_compatible(
            &Aggregation::LastValue,
            InstrumentKind::Counter
        ));
    }

    #[test]
    fn histograms_are_synchronous_only() {
        assert!(!is_aggregation_compatible(
            &Aggregation::ExplicitBucketHistogram {
                boundaries: Vec::new(),
                record_min_max: false
            },
            InstrumentKind::ObservableCounter
        ));
    }
}
