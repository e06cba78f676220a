//! Instrument descriptors, streams, and the typed measurement handles.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::aggregation::Aggregation;
use crate::attribute::{AttributeSet, KeyValue};
use crate::error::MetricResult;
use crate::instrumentation::Scope;
use crate::internal::{Aggregator, Number};
use crate::meter::Meter;

/// The kinds of instrument a [`Meter`] can create.
///
/// The observable kinds are asynchronous: their callbacks report the
/// current absolute value per attribute set each collection cycle. The
/// remaining kinds are synchronous and incremental.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum InstrumentKind {
    /// A synchronous, monotonically increasing sum.
    Counter,
    /// A synchronous sum that may decrease.
    UpDownCounter,
    /// A synchronous distribution of measurements.
    Histogram,
    /// An asynchronous, monotonically increasing sum.
    ObservableCounter,
    /// An asynchronous sum that may decrease.
    ObservableUpDownCounter,
    /// An asynchronous current-value measurement.
    ObservableGauge,
}

impl InstrumentKind {
    /// Whether measurements of this kind arrive as pre-computed absolute
    /// values.
    pub(crate) fn precomputed(self) -> bool {
        matches!(
            self,
            InstrumentKind::ObservableCounter
                | InstrumentKind::ObservableUpDownCounter
                | InstrumentKind::ObservableGauge
        )
    }

    /// Whether sums of this kind only ever increase. Histogram
    /// measurements are non-negative by convention, so their sum is
    /// monotonic as well.
    pub(crate) fn monotonic(self) -> bool {
        matches!(
            self,
            InstrumentKind::Counter | InstrumentKind::ObservableCounter | InstrumentKind::Histogram
        )
    }
}

/// Describes an instrument, and doubles as the match half of a
/// [`View`](crate::View).
///
/// When used as view criteria, empty fields match anything and `name`
/// supports the `*` and `?` wildcards.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Instrument {
    /// The instrument name.
    pub name: Cow<'static, str>,
    /// The instrument description.
    pub description: Cow<'static, str>,
    /// The instrument kind.
    pub kind: Option<InstrumentKind>,
    /// The unit of recorded values.
    pub unit: Cow<'static, str>,
    /// The scope of the meter that created the instrument.
    pub scope: Scope,
}

impl Instrument {
    pub(crate) fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.description.is_empty()
            && self.kind.is_none()
            && self.unit.is_empty()
            && self.scope == Scope::default()
    }
}

/// A predicate deciding which attributes of a stream are kept.
pub type AttributeFilter = Arc<dyn Fn(&KeyValue) -> bool + Send + Sync>;

/// The output shape of one time-series stream produced by a view.
///
/// Empty fields inherit from the matched instrument.
#[derive(Clone, Default)]
pub struct Stream {
    /// The stream name, defaults to the instrument name.
    pub name: Cow<'static, str>,
    /// The stream description.
    pub description: Cow<'static, str>,
    /// The unit of the stream values.
    pub unit: Cow<'static, str>,
    /// The aggregation applied to the stream, defaults to the reader's
    /// selection for the instrument kind.
    pub aggregation: Option<Aggregation>,
    /// Keeps only the attributes the predicate accepts before
    /// aggregation.
    pub attribute_filter: Option<AttributeFilter>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("unit", &self.unit)
            .field("aggregation", &self.aggregation)
            .field("attribute_filter", &self.attribute_filter.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Observation admission.
//
// Callbacks run synchronously on the collecting thread. While one is being
// invoked, the instruments it is registered for are admitted through a
// thread-local stack, which keeps admission both thread-safe and
// re-entrancy-safe without threading a context value through user code.

thread_local! {
    static ADMITTED: RefCell<Vec<Arc<HashSet<u64>>>> = const { RefCell::new(Vec::new()) };
}

struct AdmissionGuard;

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        ADMITTED.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Runs `f` with the given instruments admitted for observation on the
/// current thread.
pub(crate) fn with_observations<R>(ids: &Arc<HashSet<u64>>, f: impl FnOnce() -> R) -> R {
    ADMITTED.with(|stack| stack.borrow_mut().push(Arc::clone(ids)));
    let _guard = AdmissionGuard;
    f()
}

fn observation_admitted(id: u64) -> bool {
    ADMITTED.with(|stack| stack.borrow().iter().any(|ids| ids.contains(&id)))
}

static NEXT_INSTRUMENT_ID: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Synchronous instruments.

/// The shared state of a synchronous instrument: the aggregators of every
/// stream it resolved to. The list is immutable after creation, keeping
/// the measurement fan-out lock-free at the instrument level.
pub(crate) struct SyncInstrument<N> {
    measures: Vec<Arc<dyn Aggregator<N>>>,
}

impl<N: Number> SyncInstrument<N> {
    pub(crate) fn new(measures: Vec<Arc<dyn Aggregator<N>>>) -> Self {
        SyncInstrument { measures }
    }

    fn measure(&self, value: N, attributes: &[KeyValue]) {
        if self.measures.is_empty() {
            return;
        }
        let attrs = AttributeSet::from(attributes);
        for measure in &self.measures {
            measure.aggregate(value, attrs.clone());
        }
    }
}

/// A synchronous, monotonically increasing sum instrument.
#[derive(Clone)]
pub struct Counter<N>(pub(crate) Arc<SyncInstrument<N>>);

impl<N: Number> Counter<N> {
    /// Adds `value` to the counter for the given attributes.
    pub fn add(&self, value: N, attributes: &[KeyValue]) {
        self.0.measure(value, attributes);
    }
}

impl<N> fmt::Debug for Counter<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Counter")
    }
}

/// A synchronous sum instrument that may decrease.
#[derive(Clone)]
pub struct UpDownCounter<N>(pub(crate) Arc<SyncInstrument<N>>);

impl<N: Number> UpDownCounter<N> {
    /// Adds `value`, which may be negative, for the given attributes.
    pub fn add(&self, value: N, attributes: &[KeyValue]) {
        self.0.measure(value, attributes);
    }
}

impl<N> fmt::Debug for UpDownCounter<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UpDownCounter")
    }
}

/// A synchronous distribution instrument.
#[derive(Clone)]
pub struct Histogram<N>(pub(crate) Arc<SyncInstrument<N>>);

impl<N: Number> Histogram<N> {
    /// Records a measurement for the given attributes.
    pub fn record(&self, value: N, attributes: &[KeyValue]) {
        self.0.measure(value, attributes);
    }
}

impl<N> fmt::Debug for Histogram<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Histogram")
    }
}

// ---------------------------------------------------------------------------
// Asynchronous instruments.

/// An instrument whose values are observed from inside callbacks.
pub trait AsyncInstrument<N>: Send + Sync {
    /// Records the current absolute value for the given attributes.
    ///
    /// Admitted only while the calling thread executes a callback
    /// registered for this instrument; otherwise the observation is
    /// silently dropped.
    fn observe(&self, measurement: N, attributes: &[KeyValue]);
}

/// The shared state of an asynchronous instrument.
pub(crate) struct ObservableInner<N> {
    meter_id: u64,
    id: u64,
    name: Cow<'static, str>,
    measures: Vec<Arc<dyn Aggregator<N>>>,
}

impl<N: Number> ObservableInner<N> {
    pub(crate) fn new(
        meter_id: u64,
        name: Cow<'static, str>,
        measures: Vec<Arc<dyn Aggregator<N>>>,
    ) -> Self {
        ObservableInner {
            meter_id,
            id: NEXT_INSTRUMENT_ID.fetch_add(1, Ordering::Relaxed),
            name,
            measures,
        }
    }

    pub(crate) fn noop(meter_id: u64, name: Cow<'static, str>) -> Self {
        ObservableInner::new(meter_id, name, Vec::new())
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn meter_id(&self) -> u64 {
        self.meter_id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Whether any stream of the instrument keeps its measurements.
    pub(crate) fn observed(&self) -> bool {
        !self.measures.is_empty()
    }

    fn observe(&self, value: N, attributes: &[KeyValue]) {
        if self.measures.is_empty() {
            return;
        }
        if !observation_admitted(self.id) {
            tracing::debug!(
                instrument = %self.name,
                "observation dropped: made outside a registered callback"
            );
            return;
        }
        let attrs = AttributeSet::from(attributes);
        for measure in &self.measures {
            measure.aggregate(value, attrs.clone());
        }
    }
}

/// An opaque identifier tying an asynchronous instrument to its meter,
/// used when registering callbacks.
#[derive(Clone, Copy, Debug)]
pub struct ObservableId {
    pub(crate) meter_id: u64,
    pub(crate) instrument_id: u64,
    pub(crate) observed: bool,
}

/// An asynchronous instrument that can be listed in
/// [`Meter::register_callback`].
pub trait Observable {
    /// Identifies the instrument for callback registration.
    #[doc(hidden)]
    fn observable_id(&self) -> ObservableId;
}

macro_rules! observable_instrument {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(Clone)]
        pub struct $name<N>(pub(crate) Arc<ObservableInner<N>>);

        impl<N: Number> AsyncInstrument<N> for $name<N> {
            fn observe(&self, measurement: N, attributes: &[KeyValue]) {
                self.0.observe(measurement, attributes);
            }
        }

        impl<N: Number> Observable for $name<N> {
            fn observable_id(&self) -> ObservableId {
                ObservableId {
                    meter_id: self.0.meter_id(),
                    instrument_id: self.0.id(),
                    observed: self.0.observed(),
                }
            }
        }

        impl<N> fmt::Debug for $name<N> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(stringify!($name))
            }
        }
    };
}

observable_instrument!(
    /// An asynchronous, monotonically increasing sum instrument.
    ObservableCounter
);
observable_instrument!(
    /// An asynchronous sum instrument that may decrease.
    ObservableUpDownCounter
);
observable_instrument!(
    /// An asynchronous current-value instrument.
    ObservableGauge
);

// ---------------------------------------------------------------------------
// Builders.

/// Configures and creates a synchronous instrument.
pub struct InstrumentBuilder<'a, T> {
    meter: &'a Meter,
    kind: InstrumentKind,
    name: Cow<'static, str>,
    description: Cow<'static, str>,
    unit: Cow<'static, str>,
    _instrument: PhantomData<T>,
}

impl<'a, T> InstrumentBuilder<'a, T> {
    pub(crate) fn new(meter: &'a Meter, kind: InstrumentKind, name: Cow<'static, str>) -> Self {
        InstrumentBuilder {
            meter,
            kind,
            name,
            description: Cow::Borrowed(""),
            unit: Cow::Borrowed(""),
            _instrument: PhantomData,
        }
    }

    /// Sets the human readable description of the instrument.
    pub fn with_description(mut self, description: impl Into<Cow<'static, str>>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the unit of the recorded values.
    pub fn with_unit(mut self, unit: impl Into<Cow<'static, str>>) -> Self {
        self.unit = unit.into();
        self
    }
}

macro_rules! sync_instrument_builder {
    ($handle:ident, $number:ty, $create:ident) => {
        impl InstrumentBuilder<'_, $handle<$number>> {
            /// Creates the instrument, failing on an invalid name.
            pub fn try_build(self) -> MetricResult<$handle<$number>> {
                let inner =
                    self.meter
                        .inner
                        .$create(self.kind, self.name, self.description, self.unit)?;
                Ok($handle(inner))
            }

            /// Creates the instrument, reporting failures as diagnostics
            /// and returning a no-op handle instead.
            pub fn build(self) -> $handle<$number> {
                let name = self.name.clone();
                match self.try_build() {
                    Ok(instrument) => instrument,
                    Err(err) => {
                        tracing::error!(
                            instrument = %name,
                            error = %err,
                            "instrument creation failed; returning a no-op instrument"
                        );
                        $handle(Arc::new(SyncInstrument::new(Vec::new())))
                    }
                }
            }
        }
    };
}

sync_instrument_builder!(Counter, i64, sync_i64);
sync_instrument_builder!(Counter, f64, sync_f64);
sync_instrument_builder!(UpDownCounter, i64, sync_i64);
sync_instrument_builder!(UpDownCounter, f64, sync_f64);
sync_instrument_builder!(Histogram, i64, sync_i64);
sync_instrument_builder!(Histogram, f64, sync_f64);

pub(crate) type ObservableCallback<N> = Box<dyn Fn(&dyn AsyncInstrument<N>) + Send + Sync>;

/// Configures and creates an asynchronous instrument.
pub struct AsyncInstrumentBuilder<'a, T, N> {
    meter: &'a Meter,
    kind: InstrumentKind,
    name: Cow<'static, str>,
    description: Cow<'static, str>,
    unit: Cow<'static, str>,
    callbacks: Vec<ObservableCallback<N>>,
    _instrument: PhantomData<T>,
}

impl<'a, T, N> AsyncInstrumentBuilder<'a, T, N> {
    pub(crate) fn new(meter: &'a Meter, kind: InstrumentKind, name: Cow<'static, str>) -> Self {
        AsyncInstrumentBuilder {
            meter,
            kind,
            name,
            description: Cow::Borrowed(""),
            unit: Cow::Borrowed(""),
            callbacks: Vec::new(),
            _instrument: PhantomData,
        }
    }

    /// Sets the human readable description of the instrument.
    pub fn with_description(mut self, description: impl Into<Cow<'static, str>>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the unit of the recorded values.
    pub fn with_unit(mut self, unit: impl Into<Cow<'static, str>>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Registers a callback invoked on every collection cycle with this
    /// instrument admitted for observation, exactly as if it had been
    /// supplied to [`Meter::register_callback`].
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&dyn AsyncInstrument<N>) + Send + Sync + 'static,
    {
        self.callbacks.push(Box::new(callback));
        self
    }
}

/// Wires the embedded callbacks of a freshly created observable into
/// every pipeline. Skipped entirely when the instrument resolved to no
/// aggregators: invoking a callback whose observations all drop is wasted
/// work.
fn register_embedded_callbacks<N, T>(
    meter: &Meter,
    inner: &Arc<ObservableInner<N>>,
    handle: &T,
    callbacks: Vec<ObservableCallback<N>>,
) where
    N: Number,
    T: AsyncInstrument<N> + Clone + 'static,
{
    if callbacks.is_empty() {
        return;
    }
    if !inner.observed() {
        tracing::debug!(
            instrument = %inner.name(),
            "callbacks dropped: every stream of the instrument drops its measurements"
        );
        return;
    }
    let ids = Arc::new(HashSet::from([inner.id()]));
    for callback in callbacks {
        let handle = handle.clone();
        let ids = Arc::clone(&ids);
        meter.inner.register_observable_callback(Arc::new(move || {
            with_observations(&ids, || callback(&handle));
            Ok(())
        }));
    }
}

macro_rules! async_instrument_builder {
    ($handle:ident, $number:ty, $create:ident) => {
        impl AsyncInstrumentBuilder<'_, $handle<$number>, $number> {
            /// Creates the instrument, failing on an invalid name.
            pub fn try_build(self) -> MetricResult<$handle<$number>> {
                let inner =
                    self.meter
                        .inner
                        .$create(self.kind, self.name, self.description, self.unit)?;
                let handle = $handle(Arc::clone(&inner));
                register_embedded_callbacks(self.meter, &inner, &handle, self.callbacks);
                Ok(handle)
            }

            /// Creates the instrument, reporting failures as diagnostics
            /// and returning a no-op handle instead.
            pub fn build(self) -> $handle<$number> {
                let meter_id = self.meter.inner.id;
                let name = self.name.clone();
                match self.try_build() {
                    Ok(instrument) => instrument,
                    Err(err) => {
                        tracing::error!(
                            instrument = %name,
                            error = %err,
                            "instrument creation failed; returning a no-op instrument"
                        );
                        $handle(Arc::new(ObservableInner::noop(meter_id, name)))
                    }
                }
            }
        }
    };
}

async_instrument_builder!(ObservableCounter, i64, observable_i64);
async_instrument_builder!(ObservableCounter, f64, observable_f64);
async_instrument_builder!(ObservableUpDownCounter, i64, observable_i64);
async_instrument_builder!(ObservableUpDownCounter, f64, observable_f64);
async_instrument_builder!(ObservableGauge, i64, observable_i64);
async_instrument_builder!(ObservableGauge, f64, observable_f64);
