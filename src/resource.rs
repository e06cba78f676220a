//! The entity producing telemetry, attached to every collection snapshot.

use std::borrow::Cow;

use crate::attribute::{AttributeSet, KeyValue};

/// An immutable description of the entity producing telemetry.
///
/// The resource is configured once on the
/// [`MeterProvider`](crate::MeterProvider) and attached verbatim to every
/// [`ResourceMetrics`](crate::data::ResourceMetrics) snapshot. Discovery of
/// resource attributes from the environment is deliberately left to
/// external detectors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resource {
    attributes: AttributeSet,
    schema_url: Option<Cow<'static, str>>,
}

impl Resource {
    /// A resource with no attributes.
    pub fn empty() -> Self {
        Resource::default()
    }

    /// Creates a resource from the given attributes.
    pub fn new(attributes: impl IntoIterator<Item = KeyValue>) -> Self {
        Resource {
            attributes: AttributeSet::new(attributes),
            schema_url: None,
        }
    }

    /// Starts building a resource.
    pub fn builder() -> ResourceBuilder {
        ResourceBuilder::default()
    }

    /// Iterates the resource attributes.
    pub fn iter(&self) -> impl Iterator<Item = &KeyValue> {
        self.attributes.iter()
    }

    /// The number of resource attributes.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Whether the resource carries no attributes.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// The schema URL of the resource, if set.
    pub fn schema_url(&self) -> Option<&str> {
        self.schema_url.as_deref()
    }
}

/// Builder for [`Resource`].
#[derive(Debug, Default)]
pub struct ResourceBuilder {
    attributes: Vec<KeyValue>,
    schema_url: Option<Cow<'static, str>>,
}

impl ResourceBuilder {
    /// Adds a single attribute.
    pub fn with_attribute(mut self, attribute: KeyValue) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Adds several attributes.
    pub fn with_attributes(mut self, attributes: impl IntoIterator<Item = KeyValue>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    /// Sets the schema URL.
    pub fn with_schema_url(mut self, schema_url: impl Into<Cow<'static, str>>) -> Self {
        self.schema_url = Some(schema_url.into());
        self
    }

    /// Finishes the resource.
    pub fn build(self) -> Resource {
        Resource {
            attributes: AttributeSet::new(self.attributes),
            schema_url: self.schema_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_attributes_and_schema() {
        let resource = Resource::builder()
            .with_attribute(KeyValue::new("service.name", "checkout"))
            .with_attributes([KeyValue::new("deployment.environment", "prod")])
            .with_schema_url("https://example.com/schema/1.0")
            .build();
        assert_eq!(resource.len(), 2);
        assert_eq!(resource.schema_url(), Some("https://example.com/schema/1.0"));
    }

    #[test]
    fn resources_with_same_attributes_are_equal() {
        let a = Resource::new([KeyValue::new("a", 1), KeyValue::new("b", 2)]);
        let b = Resource::new([KeyValue::new("b", 2), KeyValue::new("a", 1)]);
        assert_eq!(a, b);
    }
}
