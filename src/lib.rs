//! A self-contained metrics SDK core.
//!
//! This crate implements the in-process half of a metrics pipeline:
//! typed instruments record measurements, measurements are aggregated per
//! attribute set under a configurable temporality, views filter and
//! reshape instrument streams, asynchronous callbacks are coordinated
//! during collection, and pull-based readers assemble consistent
//! [`data::ResourceMetrics`] snapshots on demand.
//!
//! Exporter wire formats, resource discovery and bridges to other
//! telemetry ecosystems are deliberately out of scope; they plug in
//! through [`PushMetricExporter`], [`Resource`] and [`MetricProducer`].
//!
//! # Getting started
//!
//! ```
//! use opentelemetry_metrics_core::{data::ResourceMetrics, KeyValue, ManualReader, MeterProvider};
//!
//! let reader = ManualReader::default();
//! let provider = MeterProvider::builder().with_reader(reader.clone()).build();
//!
//! let meter = provider.meter("app");
//! let requests = meter
//!     .i64_counter("http.server.requests")
//!     .with_unit("{request}")
//!     .build();
//! requests.add(1, &[KeyValue::new("route", "/healthz")]);
//!
//! let mut snapshot = ResourceMetrics::default();
//! reader.collect(&mut snapshot).unwrap();
//! assert_eq!(snapshot.scope_metrics.len(), 1);
//! ```
//!
//! Asynchronous instruments are observed from callbacks invoked during
//! each collection cycle; observations made outside a registered
//! callback are dropped. See [`Meter::register_callback`] and the
//! `with_callback` builder option.
//!
//! # Known limitations
//!
//! Aggregator state grows with attribute cardinality: cumulative and
//! pre-computed cells, and the attribute-filter memo, are never pruned.
//! Unbounded-cardinality instrumentation will grow memory without bound.

#![warn(missing_docs)]

mod aggregation;
mod attribute;
pub mod data;
mod error;
mod exporter;
mod instrument;
mod instrumentation;
mod internal;
mod manual_reader;
mod meter;
mod periodic_reader;
mod pipeline;
mod provider;
mod reader;
mod resource;
mod view;

pub use aggregation::Aggregation;
pub use attribute::{AttributeSet, Key, KeyValue, Value};
pub use data::Temporality;
pub use error::{MetricError, MetricResult};
pub use exporter::PushMetricExporter;
pub use instrument::{
    AsyncInstrument, AsyncInstrumentBuilder, AttributeFilter, Counter, Histogram, Instrument,
    InstrumentBuilder, InstrumentKind, Observable, ObservableCounter, ObservableGauge,
    ObservableId, ObservableUpDownCounter, Stream, UpDownCounter,
};
pub use instrumentation::Scope;
pub use internal::Number;
pub use manual_reader::{ManualReader, ManualReaderBuilder};
pub use meter::{Meter, Registration};
pub use periodic_reader::{PeriodicReader, PeriodicReaderBuilder};
pub use pipeline::Pipeline;
pub use provider::{MeterProvider, MeterProviderBuilder};
pub use reader::{
    AggregationSelector, DefaultAggregationSelector, DefaultTemporalitySelector, MetricProducer,
    MetricReader, TemporalitySelector,
};
pub use resource::{Resource, ResourceBuilder};
pub use view::View;
