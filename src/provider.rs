//! The entry point owning resource, views, readers and meters.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{MetricError, MetricResult};
use crate::instrumentation::Scope;
use crate::meter::Meter;
use crate::pipeline::Pipelines;
use crate::reader::MetricReader;
use crate::resource::Resource;
use crate::view::View;

/// The factory for [`Meter`]s, wiring every configured reader into the
/// measurement pipeline.
///
/// Cloning is cheap; clones share the same pipelines and meter registry.
/// Dropping the last handle shuts the configured readers down.
#[derive(Clone)]
pub struct MeterProvider {
    inner: Arc<MeterProviderInner>,
}

struct MeterProviderInner {
    pipes: Arc<Pipelines>,
    meters: Mutex<HashMap<Scope, Meter>>,
    is_shutdown: AtomicBool,
}

impl MeterProvider {
    /// Starts building a provider.
    pub fn builder() -> MeterProviderBuilder {
        MeterProviderBuilder::default()
    }

    /// Returns the meter for the given instrumentation library name.
    pub fn meter(&self, name: impl Into<Cow<'static, str>>) -> Meter {
        self.meter_with_scope(Scope::new(name))
    }

    /// Returns the meter identified by `scope`, creating it on first
    /// use. Repeated calls with an equal scope return the same meter.
    pub fn meter_with_scope(&self, scope: Scope) -> Meter {
        if self.inner.is_shutdown.load(Ordering::Acquire) {
            tracing::warn!(
                scope = scope.name(),
                "meter requested from a shut down provider; measurements will be lost"
            );
        }
        let Ok(mut meters) = self.inner.meters.lock() else {
            return Meter::new(scope, Arc::clone(&self.inner.pipes));
        };
        meters
            .entry(scope.clone())
            .or_insert_with(|| Meter::new(scope, Arc::clone(&self.inner.pipes)))
            .clone()
    }

    /// Flushes every configured reader.
    pub fn force_flush(&self) -> MetricResult<()> {
        self.inner.pipes.force_flush()
    }

    /// Shuts every configured reader down. A second call fails with
    /// [`MetricError::AlreadyShutdown`].
    pub fn shutdown(&self) -> MetricResult<()> {
        if self.inner.is_shutdown.swap(true, Ordering::AcqRel) {
            return Err(MetricError::AlreadyShutdown);
        }
        self.inner.pipes.shutdown()
    }
}

impl fmt::Debug for MeterProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeterProvider")
            .field("pipelines", &self.inner.pipes)
            .field("shutdown", &self.inner.is_shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for MeterProviderInner {
    fn drop(&mut self) {
        if !self.is_shutdown.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.pipes.shutdown() {
                tracing::warn!(error = %err, "reader shutdown failed while dropping the provider");
            }
        }
    }
}

/// Builder for [`MeterProvider`].
pub struct MeterProviderBuilder {
    resource: Resource,
    readers: Vec<Box<dyn MetricReader>>,
    views: Vec<View>,
}

impl Default for MeterProviderBuilder {
    fn default() -> Self {
        MeterProviderBuilder {
            resource: Resource::empty(),
            readers: Vec::new(),
            views: Vec::new(),
        }
    }
}

impl MeterProviderBuilder {
    /// Sets the resource attached to every snapshot.
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = resource;
        self
    }

    /// Registers a reader. May be called repeatedly; every reader drains
    /// its own pipeline and distinct readers may collect in parallel.
    pub fn with_reader(mut self, reader: impl MetricReader) -> Self {
        self.readers.push(Box::new(reader));
        self
    }

    /// Registers a view. Views apply to all instruments in declaration
    /// order.
    pub fn with_view(mut self, view: View) -> Self {
        self.views.push(view);
        self
    }

    /// Finishes the provider, wiring every reader to its pipeline.
    pub fn build(self) -> MeterProvider {
        MeterProvider {
            inner: Arc::new(MeterProviderInner {
                pipes: Arc::new(Pipelines::new(self.resource, self.views, self.readers)),
                meters: Mutex::new(HashMap::new()),
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }
}

impl fmt::Debug for MeterProviderBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeterProviderBuilder")
            .field("readers", &self.readers.len())
            .field("views", &self.views.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::KeyValue;
    use crate::data::ResourceMetrics;
    use crate::manual_reader::ManualReader;

    #[test]
    fn meters_are_idempotent_by_scope() {
        let provider = MeterProvider::builder().build();
        let a = provider.meter("app");
        let b = provider.meter("app");
        assert!(Arc::ptr_eq(&a.inner, &b.inner));

        let versioned = provider.meter_with_scope(Scope::new("app").with_version("1"));
        assert!(!Arc::ptr_eq(&a.inner, &versioned.inner));
    }

    #[test]
    fn snapshots_carry_the_configured_resource() {
        let reader = ManualReader::default();
        let resource = Resource::new([KeyValue::new("service.name", "checkout")]);
        let provider = MeterProvider::builder()
            .with_resource(resource.clone())
            .with_reader(reader.clone())
            .build();

        provider.meter("app").i64_counter("c").build().add(1, &[]);

        let mut rm = ResourceMetrics::default();
        reader.collect(&mut rm).unwrap();
        assert_eq!(rm.resource, resource);
    }

    #[test]
    fn shutdown_twice_fails() {
        let provider = MeterProvider::builder()
            .with_reader(ManualReader::default())
            .build();
        assert!(provider.shutdown().is_ok());
        assert!(matches!(
            provider.shutdown(),
            Err(MetricError::AlreadyShutdown)
        ));
    }

    #[test]
    fn two_readers_collect_independently() {
        let delta = ManualReader::builder()
            .with_temporality_selector(|_: crate::InstrumentKind| {
                crate::data::Temporality::Delta
            })
            .build();
        let cumulative = ManualReader::default();
        let provider = MeterProvider::builder()
            .with_reader(delta.clone())
            .with_reader(cumulative.clone())
            .build();

        let counter = provider.meter("app").i64_counter("c").build();
        counter.add(3, &[]);

        let mut rm = ResourceMetrics::default();
        delta.collect(&mut rm).unwrap();
        let mut rm2 = ResourceMetrics::default();
        cumulative.collect(&mut rm2).unwrap();

        // The cumulative reader's cell is untouched by the delta
        // reader's drain.
        counter.add(4, &[]);
        let mut rm3 = ResourceMetrics::default();
        cumulative.collect(&mut rm3).unwrap();
        let sum = match &rm3.scope_metrics[0].metrics[0].data {
            crate::data::MetricData::I64Sum(sum) => sum,
            other => panic!("expected i64 sum, got {other:?}"),
        };
        assert_eq!(sum.data_points[0].value, 7);
    }

    #[test]
    fn force_flush_reaches_every_reader() {
        let provider = MeterProvider::builder()
            .with_reader(ManualReader::default())
            .build();
        assert!(provider.force_flush().is_ok());
    }
}
