//! Declarative transforms from instruments to output streams.

use std::fmt;

use crate::error::{MetricError, MetricResult};
use crate::instrument::{Instrument, Stream};

/// Matches instruments and reshapes them into output streams.
///
/// Views are evaluated in the order they were registered with the
/// [`MeterProvider`](crate::MeterProvider); every matching view emits one
/// stream for the instrument. When no view matches, a default stream
/// identical to the instrument's own descriptor is produced.
pub struct View {
    criteria: Instrument,
    mask: Stream,
}

impl View {
    /// Creates a view that rewrites instruments matching `criteria` into
    /// the shape of `mask`.
    ///
    /// Empty criteria fields match anything; the criteria name supports
    /// the `*` and `?` wildcards. Mask fields left empty inherit from the
    /// matched instrument. Renaming is rejected when the criteria name
    /// contains a wildcard, since several instruments would collapse onto
    /// one stream name.
    pub fn new(criteria: Instrument, mask: Stream) -> MetricResult<View> {
        if criteria.is_empty() {
            return Err(MetricError::Config(
                "view criteria must match something".into(),
            ));
        }
        if criteria.name.contains(['*', '?']) && !mask.name.is_empty() {
            return Err(MetricError::Config(format!(
                "cannot rename instruments matched by the wildcard pattern {:?}",
                criteria.name
            )));
        }
        if let Some(aggregation) = &mask.aggregation {
            aggregation.validate()?;
        }
        Ok(View { criteria, mask })
    }

    /// Whether this view applies to the given instrument.
    pub(crate) fn matches(&self, instrument: &Instrument) -> bool {
        self.matches_name(instrument)
            && self.matches_description(instrument)
            && self.matches_kind(instrument)
            && self.matches_unit(instrument)
            && self.matches_scope(instrument)
    }

    fn matches_name(&self, instrument: &Instrument) -> bool {
        self.criteria.name.is_empty() || wildcard_match(&self.criteria.name, &instrument.name)
    }

    fn matches_description(&self, instrument: &Instrument) -> bool {
        self.criteria.description.is_empty() || self.criteria.description == instrument.description
    }

    fn matches_kind(&self, instrument: &Instrument) -> bool {
        match self.criteria.kind {
            None => true,
            kind => kind == instrument.kind,
        }
    }

    fn matches_unit(&self, instrument: &Instrument) -> bool {
        self.criteria.unit.is_empty() || self.criteria.unit == instrument.unit
    }

    fn matches_scope(&self, instrument: &Instrument) -> bool {
        let criteria = &self.criteria.scope;
        let scope = &instrument.scope;
        (criteria.name().is_empty() || criteria.name() == scope.name())
            && (criteria.version().is_none() || criteria.version() == scope.version())
            && (criteria.schema_url().is_none() || criteria.schema_url() == scope.schema_url())
    }

    /// The stream this view produces for a matched instrument.
    pub(crate) fn stream(&self, instrument: &Instrument) -> Stream {
        Stream {
            name: if self.mask.name.is_empty() {
                instrument.name.clone()
            } else {
                self.mask.name.clone()
            },
            description: if self.mask.description.is_empty() {
                instrument.description.clone()
            } else {
                self.mask.description.clone()
            },
            unit: if self.mask.unit.is_empty() {
                instrument.unit.clone()
            } else {
                self.mask.unit.clone()
            },
            aggregation: self.mask.aggregation.clone(),
            attribute_filter: self.mask.attribute_filter.clone(),
        }
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("criteria", &self.criteria)
            .field("mask", &self.mask)
            .finish()
    }
}

/// Glob matching with `*` (any sequence) and `?` (any single byte).
fn wildcard_match(pattern: &str, input: &str) -> bool {
    let pattern = pattern.as_bytes();
    let input = input.as_bytes();
    let (mut p, mut i) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while i < input.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == input[i]) {
            p += 1;
            i += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            mark = i;
            p += 1;
        } else if let Some(star_at) = star {
            p = star_at + 1;
            mark += 1;
            i = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::Aggregation;
    use crate::instrument::InstrumentKind;
    use crate::instrumentation::Scope;

    fn named(name: &'static str) -> Instrument {
        Instrument {
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn wildcard_match_table() {
        let cases = [
            ("*", "anything", true),
            ("", "", true),
            ("latency", "latency", true),
            ("latency", "latency.http", false),
            ("latency*", "latency.http", true),
            ("*.http", "latency.http", true),
            ("lat*http", "latency.http", true),
            ("lat*http", "latency.grpc", false),
            ("l?tency", "latency", true),
            ("l?tency", "ltency", false),
            ("a*b*c", "axxbxxc", true),
            ("a*b*c", "axxcxxb", false),
        ];
        for (pattern, input, want) in cases {
            assert_eq!(
                wildcard_match(pattern, input),
                want,
                "pattern {pattern:?} against {input:?}"
            );
        }
    }

    #[test]
    fn empty_criteria_is_rejected() {
        assert!(View::new(Instrument::default(), Stream::default()).is_err());
    }

    #[test]
    fn wildcard_rename_is_rejected() {
        let result = View::new(
            named("latency*"),
            Stream {
                name: "renamed".into(),
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn invalid_mask_aggregation_is_rejected() {
        let result = View::new(
            named("latency"),
            Stream {
                aggregation: Some(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![1.0, 1.0],
                    record_min_max: false,
                }),
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn stream_inherits_unset_fields() {
        let view = View::new(
            named("requests"),
            Stream {
                name: "renamed.requests".into(),
                ..Default::default()
            },
        )
        .unwrap();
        let instrument = Instrument {
            name: "requests".into(),
            description: "incoming requests".into(),
            unit: "{request}".into(),
            kind: Some(InstrumentKind::Counter),
            scope: Scope::new("app"),
        };
        assert!(view.matches(&instrument));
        let stream = view.stream(&instrument);
        assert_eq!(stream.name, "renamed.requests");
        assert_eq!(stream.description, "incoming requests");
        assert_eq!(stream.unit, "{request}");
    }

    #[test]
    fn kind_and_scope_criteria_are_exact() {
        let view = View::new(
            Instrument {
                kind: Some(InstrumentKind::Histogram),
                scope: Scope::new("app"),
                ..Default::default()
            },
            Stream::default(),
        )
        .unwrap();

        let matching = Instrument {
            name: "latency".into(),
            kind: Some(InstrumentKind::Histogram),
            scope: Scope::new("app"),
            ..Default::default()
        };
        assert!(view.matches(&matching));

        let wrong_kind = Instrument {
            kind: Some(InstrumentKind::Counter),
            ..matching.clone()
        };
        assert!(!view.matches(&wrong_kind));

        let wrong_scope = Instrument {
            scope: Scope::new("other"),
            ..matching
        };
        assert!(!view.matches(&wrong_scope));
    }
}
