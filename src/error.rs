use thiserror::Error;

/// A specialized `Result` for metrics pipeline operations.
pub type MetricResult<T> = Result<T, MetricError>;

/// Errors produced by the metrics pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricError {
    /// An operation failed for a reason not covered by a dedicated variant.
    #[error("metrics error: {0}")]
    Other(String),

    /// Invalid configuration: duplicate streams, incompatible aggregations,
    /// foreign instruments in a callback registration.
    #[error("invalid metrics configuration: {0}")]
    Config(String),

    /// The requested instrument name violates the naming rules, no
    /// instrument was created.
    #[error("invalid instrument name: {0}")]
    InvalidInstrumentName(&'static str),

    /// The provider or reader was already shut down.
    #[error("metrics provider or reader already shut down")]
    AlreadyShutdown,

    /// Several independent failures occurred during one operation, e.g.
    /// multiple callbacks failing inside a single collection cycle.
    #[error("multiple metrics errors: {0:?}")]
    Multiple(Vec<MetricError>),
}

impl MetricError {
    /// Collapses independently gathered errors into a single result.
    ///
    /// An empty list is success, a single error is returned as-is and
    /// anything more is joined into [`MetricError::Multiple`].
    pub(crate) fn join(mut errs: Vec<MetricError>) -> MetricResult<()> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(MetricError::Multiple(errs)),
        }
    }
}
