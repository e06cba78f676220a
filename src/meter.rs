//! The scoped factory for instruments and callbacks.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{MetricError, MetricResult};
use crate::instrument::{
    with_observations, AsyncInstrumentBuilder, Counter, Histogram, Instrument, InstrumentBuilder,
    InstrumentKind, Observable, ObservableCounter, ObservableGauge, ObservableInner,
    ObservableUpDownCounter, SyncInstrument, UpDownCounter,
};
use crate::instrumentation::Scope;
use crate::internal::Number;
use crate::pipeline::{new_stream_ids, CallbackEntry, Pipelines, Resolver};

static NEXT_METER_ID: AtomicU64 = AtomicU64::new(0);

const INSTRUMENT_NAME_MAX_LEN: usize = 255;

/// The scoped factory for instruments.
///
/// Meters are created through
/// [`MeterProvider::meter`](crate::MeterProvider::meter) and are cheap to
/// clone; clones share the same instrument registry. Requesting an
/// instrument with a descriptor identical to an existing one returns the
/// existing instrument.
#[derive(Clone)]
pub struct Meter {
    pub(crate) inner: Arc<SdkMeter>,
}

impl fmt::Debug for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meter").field("scope", self.scope()).finish()
    }
}

/// Identity of an instrument within a meter. Two requests with equal ids
/// are the same instrument.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct InstrumentId {
    name: Cow<'static, str>,
    kind: InstrumentKind,
    unit: Cow<'static, str>,
    description: Cow<'static, str>,
}

struct InstrumentCache<N> {
    sync: HashMap<InstrumentId, Arc<SyncInstrument<N>>>,
    observable: HashMap<InstrumentId, Arc<ObservableInner<N>>>,
    /// The first descriptor seen per name, for conflict diagnostics.
    first_descriptor: HashMap<Cow<'static, str>, InstrumentId>,
}

impl<N> Default for InstrumentCache<N> {
    fn default() -> Self {
        InstrumentCache {
            sync: HashMap::new(),
            observable: HashMap::new(),
            first_descriptor: HashMap::new(),
        }
    }
}

impl<N> InstrumentCache<N> {
    fn note_descriptor(&mut self, id: &InstrumentId) {
        match self.first_descriptor.get(&id.name) {
            Some(first) if first != id => {
                tracing::warn!(
                    instrument = %id.name,
                    "instrument registered again with a conflicting kind, unit or description; creating a best-effort instrument"
                );
            }
            Some(_) => {}
            None => {
                self.first_descriptor.insert(id.name.clone(), id.clone());
            }
        }
    }
}

pub(crate) struct SdkMeter {
    pub(crate) id: u64,
    scope: Scope,
    pipes: Arc<Pipelines>,
    i64_resolver: Resolver<i64>,
    f64_resolver: Resolver<f64>,
    i64_instruments: Mutex<InstrumentCache<i64>>,
    f64_instruments: Mutex<InstrumentCache<f64>>,
}

impl Meter {
    pub(crate) fn new(scope: Scope, pipes: Arc<Pipelines>) -> Self {
        let stream_ids = new_stream_ids();
        Meter {
            inner: Arc::new(SdkMeter {
                id: NEXT_METER_ID.fetch_add(1, Ordering::Relaxed),
                i64_resolver: Resolver::new(&pipes, Arc::clone(&stream_ids)),
                f64_resolver: Resolver::new(&pipes, stream_ids),
                i64_instruments: Mutex::new(InstrumentCache::default()),
                f64_instruments: Mutex::new(InstrumentCache::default()),
                scope,
                pipes,
            }),
        }
    }

    /// The scope identifying this meter.
    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// Creates a builder for a synchronous `i64` counter.
    pub fn i64_counter(
        &self,
        name: impl Into<Cow<'static, str>>,
    ) -> InstrumentBuilder<'_, Counter<i64>> {
        InstrumentBuilder::new(self, InstrumentKind::Counter, name.into())
    }

    /// Creates a builder for a synchronous `f64` counter.
    pub fn f64_counter(
        &self,
        name: impl Into<Cow<'static, str>>,
    ) -> InstrumentBuilder<'_, Counter<f64>> {
        InstrumentBuilder::new(self, InstrumentKind::Counter, name.into())
    }

    /// Creates a builder for a synchronous `i64` up-down counter.
    pub fn i64_up_down_counter(
        &self,
        name: impl Into<Cow<'static, str>>,
    ) -> InstrumentBuilder<'_, UpDownCounter<i64>> {
        InstrumentBuilder::new(self, InstrumentKind::UpDownCounter, name.into())
    }

    /// Creates a builder for a synchronous `f64` up-down counter.
    pub fn f64_up_down_counter(
        &self,
        name: impl Into<Cow<'static, str>>,
    ) -> InstrumentBuilder<'_, UpDownCounter<f64>> {
        InstrumentBuilder::new(self, InstrumentKind::UpDownCounter, name.into())
    }

    /// Creates a builder for a synchronous `i64` histogram.
    pub fn i64_histogram(
        &self,
        name: impl Into<Cow<'static, str>>,
    ) -> InstrumentBuilder<'_, Histogram<i64>> {
        InstrumentBuilder::new(self, InstrumentKind::Histogram, name.into())
    }

    /// Creates a builder for a synchronous `f64` histogram.
    pub fn f64_histogram(
        &self,
        name: impl Into<Cow<'static, str>>,
    ) -> InstrumentBuilder<'_, Histogram<f64>> {
        InstrumentBuilder::new(self, InstrumentKind::Histogram, name.into())
    }

    /// Creates a builder for an asynchronous `i64` counter.
    pub fn i64_observable_counter(
        &self,
        name: impl Into<Cow<'static, str>>,
    ) -> AsyncInstrumentBuilder<'_, ObservableCounter<i64>, i64> {
        AsyncInstrumentBuilder::new(self, InstrumentKind::ObservableCounter, name.into())
    }

    /// Creates a builder for an asynchronous `f64` counter.
    pub fn f64_observable_counter(
        &self,
        name: impl Into<Cow<'static, str>>,
    ) -> AsyncInstrumentBuilder<'_, ObservableCounter<f64>, f64> {
        AsyncInstrumentBuilder::new(self, InstrumentKind::ObservableCounter, name.into())
    }

    /// Creates a builder for an asynchronous `i64` up-down counter.
    pub fn i64_observable_up_down_counter(
        &self,
        name: impl Into<Cow<'static, str>>,
    ) -> AsyncInstrumentBuilder<'_, ObservableUpDownCounter<i64>, i64> {
        AsyncInstrumentBuilder::new(self, InstrumentKind::ObservableUpDownCounter, name.into())
    }

    /// Creates a builder for an asynchronous `f64` up-down counter.
    pub fn f64_observable_up_down_counter(
        &self,
        name: impl Into<Cow<'static, str>>,
    ) -> AsyncInstrumentBuilder<'_, ObservableUpDownCounter<f64>, f64> {
        AsyncInstrumentBuilder::new(self, InstrumentKind::ObservableUpDownCounter, name.into())
    }

    /// Creates a builder for an asynchronous `i64` gauge.
    pub fn i64_observable_gauge(
        &self,
        name: impl Into<Cow<'static, str>>,
    ) -> AsyncInstrumentBuilder<'_, ObservableGauge<i64>, i64> {
        AsyncInstrumentBuilder::new(self, InstrumentKind::ObservableGauge, name.into())
    }

    /// Creates a builder for an asynchronous `f64` gauge.
    pub fn f64_observable_gauge(
        &self,
        name: impl Into<Cow<'static, str>>,
    ) -> AsyncInstrumentBuilder<'_, ObservableGauge<f64>, f64> {
        AsyncInstrumentBuilder::new(self, InstrumentKind::ObservableGauge, name.into())
    }

    /// Registers `callback` to be invoked during every collection cycle,
    /// with the listed instruments admitted for observation while it
    /// runs.
    ///
    /// Fails when an instrument was created by a different meter. When
    /// every listed instrument drops all of its measurements, the
    /// returned registration is inert and the callback is never invoked.
    pub fn register_callback<F>(
        &self,
        instruments: &[&dyn Observable],
        callback: F,
    ) -> MetricResult<Registration>
    where
        F: Fn() -> MetricResult<()> + Send + Sync + 'static,
    {
        if instruments.is_empty() {
            tracing::warn!("callback registered without instruments; it will never be invoked");
            return Ok(Registration::noop());
        }

        let mut ids = HashSet::with_capacity(instruments.len());
        let mut any_observed = false;
        for observable in instruments {
            let id = observable.observable_id();
            if id.meter_id != self.inner.id {
                return Err(MetricError::Config(
                    "callback instrument was created by a different meter".into(),
                ));
            }
            any_observed |= id.observed;
            ids.insert(id.instrument_id);
        }
        if !any_observed {
            // Every stream of every listed instrument drops its
            // measurements; invoking the callback would be wasted work.
            return Ok(Registration::noop());
        }

        let ids = Arc::new(ids);
        let entry = Arc::new(CallbackEntry::new(Box::new(move || {
            with_observations(&ids, &callback)
        })));
        self.inner.pipes.register_multi_callback(Arc::clone(&entry));
        Ok(Registration::new(entry))
    }
}

impl SdkMeter {
    pub(crate) fn sync_i64(
        &self,
        kind: InstrumentKind,
        name: Cow<'static, str>,
        description: Cow<'static, str>,
        unit: Cow<'static, str>,
    ) -> MetricResult<Arc<SyncInstrument<i64>>> {
        self.create_sync(
            &self.i64_resolver,
            &self.i64_instruments,
            kind,
            name,
            description,
            unit,
        )
    }

    pub(crate) fn sync_f64(
        &self,
        kind: InstrumentKind,
        name: Cow<'static, str>,
        description: Cow<'static, str>,
        unit: Cow<'static, str>,
    ) -> MetricResult<Arc<SyncInstrument<f64>>> {
        self.create_sync(
            &self.f64_resolver,
            &self.f64_instruments,
            kind,
            name,
            description,
            unit,
        )
    }

    pub(crate) fn observable_i64(
        &self,
        kind: InstrumentKind,
        name: Cow<'static, str>,
        description: Cow<'static, str>,
        unit: Cow<'static, str>,
    ) -> MetricResult<Arc<ObservableInner<i64>>> {
        self.create_observable(
            &self.i64_resolver,
            &self.i64_instruments,
            kind,
            name,
            description,
            unit,
        )
    }

    pub(crate) fn observable_f64(
        &self,
        kind: InstrumentKind,
        name: Cow<'static, str>,
        description: Cow<'static, str>,
        unit: Cow<'static, str>,
    ) -> MetricResult<Arc<ObservableInner<f64>>> {
        self.create_observable(
            &self.f64_resolver,
            &self.f64_instruments,
            kind,
            name,
            description,
            unit,
        )
    }

    pub(crate) fn register_observable_callback(
        &self,
        callback: Arc<dyn Fn() -> MetricResult<()> + Send + Sync>,
    ) {
        self.pipes.register_callback(callback);
    }

    fn create_sync<N: Number>(
        &self,
        resolver: &Resolver<N>,
        instruments: &Mutex<InstrumentCache<N>>,
        kind: InstrumentKind,
        name: Cow<'static, str>,
        description: Cow<'static, str>,
        unit: Cow<'static, str>,
    ) -> MetricResult<Arc<SyncInstrument<N>>> {
        validate_instrument_name(&name)?;
        let id = InstrumentId {
            name,
            kind,
            unit,
            description,
        };

        let Ok(mut cache) = instruments.lock() else {
            return Err(MetricError::Other("instrument cache lock poisoned".into()));
        };
        if let Some(existing) = cache.sync.get(&id) {
            return Ok(Arc::clone(existing));
        }
        cache.note_descriptor(&id);

        let measures = self.resolve_measures(resolver, &id, kind);
        let instrument = Arc::new(SyncInstrument::new(measures));
        cache.sync.insert(id, Arc::clone(&instrument));
        Ok(instrument)
    }

    fn create_observable<N: Number>(
        &self,
        resolver: &Resolver<N>,
        instruments: &Mutex<InstrumentCache<N>>,
        kind: InstrumentKind,
        name: Cow<'static, str>,
        description: Cow<'static, str>,
        unit: Cow<'static, str>,
    ) -> MetricResult<Arc<ObservableInner<N>>> {
        validate_instrument_name(&name)?;
        let id = InstrumentId {
            name,
            kind,
            unit,
            description,
        };

        let Ok(mut cache) = instruments.lock() else {
            return Err(MetricError::Other("instrument cache lock poisoned".into()));
        };
        if let Some(existing) = cache.observable.get(&id) {
            return Ok(Arc::clone(existing));
        }
        cache.note_descriptor(&id);

        let measures = self.resolve_measures(resolver, &id, kind);
        let instrument = Arc::new(ObservableInner::new(self.id, id.name.clone(), measures));
        cache.observable.insert(id, Arc::clone(&instrument));
        Ok(instrument)
    }

    fn resolve_measures<N: Number>(
        &self,
        resolver: &Resolver<N>,
        id: &InstrumentId,
        kind: InstrumentKind,
    ) -> Vec<Arc<dyn crate::internal::Aggregator<N>>> {
        let descriptor = Instrument {
            name: id.name.clone(),
            description: id.description.clone(),
            kind: Some(kind),
            unit: id.unit.clone(),
            scope: self.scope.clone(),
        };
        let (measures, errs) = resolver.measures(&descriptor, kind);
        for err in errs {
            tracing::warn!(
                instrument = %id.name,
                error = %err,
                "stream configuration error; the affected stream is dropped"
            );
        }
        measures
    }
}

/// The handle returned by [`Meter::register_callback`].
///
/// Dropping the handle does not unregister the callback; call
/// [`unregister`](Registration::unregister) to stop invocations.
pub struct Registration {
    entry: Option<Arc<CallbackEntry>>,
}

impl Registration {
    fn noop() -> Self {
        Registration { entry: None }
    }

    fn new(entry: Arc<CallbackEntry>) -> Self {
        Registration { entry: Some(entry) }
    }

    /// Stops future invocations of the callback, waiting for an
    /// invocation in flight on another thread to complete first. A
    /// callback unregistering itself returns immediately. Idempotent
    /// and terminal; calling it after the provider shut down is a no-op
    /// that still reports success.
    pub fn unregister(&self) -> MetricResult<()> {
        if let Some(entry) = &self.entry {
            entry.unregister();
        }
        Ok(())
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("active", &self.entry.is_some())
            .finish()
    }
}

fn validate_instrument_name(name: &str) -> MetricResult<()> {
    if name.is_empty() {
        return Err(MetricError::InvalidInstrumentName("name is empty"));
    }
    if name.len() > INSTRUMENT_NAME_MAX_LEN {
        return Err(MetricError::InvalidInstrumentName(
            "name is longer than 255 characters",
        ));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(MetricError::InvalidInstrumentName(
            "name must start with an alphabetic character",
        ));
    }
    if name.contains(|c: char| {
        !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/'))
    }) {
        return Err(MetricError::InvalidInstrumentName(
            "name must only contain [A-Za-z0-9_.-/]",
        ));
    }
    Ok(())
}
