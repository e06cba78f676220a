//! Identity of the instrumentation library producing measurements.

use std::borrow::Cow;

/// The identity of a [`Meter`](crate::Meter): library name plus optional
/// version and schema URL.
///
/// Scopes key the meter registry and the `ScopeMetrics` buckets of a
/// collection snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Scope {
    name: Cow<'static, str>,
    version: Option<Cow<'static, str>>,
    schema_url: Option<Cow<'static, str>>,
}

impl Scope {
    /// Creates a scope with the given instrumentation library name.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Scope {
            name: name.into(),
            version: None,
            schema_url: None,
        }
    }

    /// Sets the instrumentation library version.
    pub fn with_version(mut self, version: impl Into<Cow<'static, str>>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets the schema URL the emitted telemetry conforms to.
    pub fn with_schema_url(mut self, schema_url: impl Into<Cow<'static, str>>) -> Self {
        self.schema_url = Some(schema_url.into());
        self
    }

    /// The instrumentation library name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The instrumentation library version, if set.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// The schema URL, if set.
    pub fn schema_url(&self) -> Option<&str> {
        self.schema_url.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_differing_only_in_version_are_distinct() {
        let plain = Scope::new("lib");
        let versioned = Scope::new("lib").with_version("1.2.0");
        assert_ne!(plain, versioned);
        assert_eq!(versioned.version(), Some("1.2.0"));
    }
}
