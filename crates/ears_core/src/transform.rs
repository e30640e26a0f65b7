//! Structural transformation and splitting of matched events
//!
//! Transformations and routing data are JSON templates. A string of the form
//! `"{.path.to.field}"` is replaced by the value found at that path in the
//! event payload; any other value is inserted literally. Payload fields that
//! the template does not mention are dropped, and an object member whose
//! placeholder does not resolve is omitted.
//!
//! Paths are dot separated. A leading dot is optional, `.` alone is the whole
//! payload, and numeric segments index into arrays.

use crate::error::TransformError;
use crate::event::Event;
use serde_json::{Map, Value};

/// Parses a dot separated payload path into its segments
pub fn parse_path(path: &str) -> Result<Vec<String>, TransformError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(invalid_path(path, "path is empty"));
    }
    if trimmed == "." {
        return Ok(Vec::new());
    }

    let body = trimmed.strip_prefix('.').unwrap_or(trimmed);
    body.split('.')
        .map(|segment| {
            if segment.is_empty() {
                Err(invalid_path(path, "empty path segment"))
            } else {
                Ok(segment.to_string())
            }
        })
        .collect()
}

/// Resolves parsed path segments against a value
pub fn resolve<'a>(value: &'a Value, segments: &[String]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|idx| items.get(idx)),
        _ => None,
    })
}

/// Checks every placeholder in a template for a well formed path
pub fn validate_template(template: &Value) -> Result<(), TransformError> {
    match template {
        Value::String(s) => match placeholder(s) {
            Some(path) => parse_path(path).map(|_| ()),
            None => Ok(()),
        },
        Value::Array(items) => items.iter().try_for_each(validate_template),
        Value::Object(map) => map.values().try_for_each(validate_template),
        _ => Ok(()),
    }
}

/// Renders a template against a payload
pub fn render(template: &Value, payload: &Value) -> Result<Value, TransformError> {
    Ok(render_value(template, payload)?.unwrap_or(Value::Null))
}

// `None` marks a placeholder that did not resolve.
fn render_value(template: &Value, payload: &Value) -> Result<Option<Value>, TransformError> {
    match template {
        Value::String(s) => match placeholder(s) {
            Some(path) => {
                let segments = parse_path(path)?;
                Ok(resolve(payload, &segments).cloned())
            }
            None => Ok(Some(template.clone())),
        },
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(render_value(item, payload)?.unwrap_or(Value::Null));
            }
            Ok(Some(Value::Array(out)))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                if let Some(rendered) = render_value(value, payload)? {
                    out.insert(key.clone(), rendered);
                }
            }
            Ok(Some(Value::Object(out)))
        }
        other => Ok(Some(other.clone())),
    }
}

fn placeholder(s: &str) -> Option<&str> {
    s.strip_prefix('{')?.strip_suffix('}')
}

fn invalid_path(path: &str, reason: &str) -> TransformError {
    TransformError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Applies transformations and splits to events that fired a route
#[derive(Debug, Clone, Copy, Default)]
pub struct Transformer;

impl Transformer {
    pub fn new() -> Self {
        Self
    }

    /// Rewrites the payload with the given template; no template leaves the event unchanged
    pub fn transform(&self, event: Event, template: Option<&Value>) -> Result<Event, TransformError> {
        match template {
            None => Ok(event),
            Some(template) => {
                let payload = render(template, &event.payload)?;
                Ok(Event { payload, ..event })
            }
        }
    }

    /// Splits an event along an array path into one event per element.
    ///
    /// Each produced event's payload is the array element, in array order, and
    /// carries the original metadata plus its `split_index`. An empty path or
    /// one that does not resolve to an array yields the original event.
    pub fn split(&self, event: Event, path: &str) -> Result<Vec<Event>, TransformError> {
        if path.trim().is_empty() {
            return Ok(vec![event]);
        }
        let segments = parse_path(path)?;
        let items = match resolve(&event.payload, &segments) {
            Some(Value::Array(items)) => items.clone(),
            _ => return Ok(vec![event]),
        };

        Ok(items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let mut split = event.with_payload(item);
                split.metadata.split_index = Some(index);
                split
            })
            .collect())
    }

    /// Reads an event timestamp in milliseconds from the payload.
    ///
    /// Accepts integer numbers and numeric strings; anything else falls back
    /// to the receipt timestamp.
    pub fn event_ts(&self, event: &Event, path: &str) -> u64 {
        if path.trim().is_empty() {
            return event.metadata.ts;
        }
        let extracted = parse_path(path)
            .ok()
            .and_then(|segments| resolve(&event.payload, &segments).cloned())
            .and_then(|value| match value {
                Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
                Value::String(s) => s.trim().parse::<u64>().ok(),
                _ => None,
            });
        extracted.unwrap_or(event.metadata.ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(payload: Value) -> Event {
        Event::new(payload, "src").with_ts(1_000)
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("items").unwrap(), vec!["items"]);
        assert_eq!(parse_path(".a.b.0").unwrap(), vec!["a", "b", "0"]);
        assert!(parse_path(".").unwrap().is_empty());
        assert!(parse_path("a..b").is_err());
        assert!(parse_path("a.").is_err());
        assert!(parse_path("").is_err());
    }

    #[test]
    fn test_transform_remap_drop_and_literal() {
        let template = json!({
            "kind": "{.type}",
            "user": {"id": "{.user.id}"},
            "first_tag": "{.user.tags.0}",
            "source": "web",
            "missing": "{.nope}"
        });
        let input = event(json!({"type": "click", "user": {"id": 9, "tags": ["x", "y"]}, "junk": 1}));

        let out = Transformer.transform(input.clone(), Some(&template)).unwrap();

        assert_eq!(
            out.payload,
            json!({"kind": "click", "user": {"id": 9}, "first_tag": "x", "source": "web"})
        );
        assert_eq!(out.metadata, input.metadata);
    }

    #[test]
    fn test_transform_without_spec_is_identity() {
        let input = event(json!({"a": 1}));
        assert_eq!(Transformer.transform(input.clone(), None).unwrap(), input);
    }

    #[test]
    fn test_transform_whole_payload_placeholder() {
        let out = Transformer
            .transform(event(json!({"a": 1})), Some(&json!({"wrapped": "{.}"})))
            .unwrap();
        assert_eq!(out.payload, json!({"wrapped": {"a": 1}}));
    }

    #[test]
    fn test_transform_rejects_bad_placeholder() {
        let result = Transformer.transform(event(json!({})), Some(&json!({"x": "{a..b}"})));
        assert!(matches!(result, Err(TransformError::InvalidPath { .. })));
    }

    #[test]
    fn test_split_items_in_order() {
        let input = event(json!({"items": [1, 2, 3]}));
        let out = Transformer.split(input.clone(), "items").unwrap();

        let payloads: Vec<Value> = out.iter().map(|e| e.payload.clone()).collect();
        assert_eq!(payloads, vec![json!(1), json!(2), json!(3)]);
        for (idx, e) in out.iter().enumerate() {
            assert_eq!(e.metadata.split_index, Some(idx));
            assert_eq!(e.metadata.id, input.metadata.id);
            assert_eq!(e.metadata.ts, input.metadata.ts);
        }
    }

    #[test]
    fn test_split_non_array_returns_original() {
        let input = event(json!({"items": {"a": 1}}));
        assert_eq!(Transformer.split(input.clone(), "items").unwrap(), vec![input.clone()]);
        assert_eq!(Transformer.split(input.clone(), "").unwrap(), vec![input.clone()]);
        assert_eq!(Transformer.split(input.clone(), "nope.x").unwrap(), vec![input]);
    }

    #[test]
    fn test_split_empty_array() {
        let out = Transformer.split(event(json!({"items": []})), "items").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_render_routing_data() {
        let data = render(&json!({"topic": "t-{x}", "key": "{.user}"}), &json!({"user": "u1"})).unwrap();
        assert_eq!(data, json!({"topic": "t-{x}", "key": "u1"}));
    }

    #[test]
    fn test_event_ts() {
        let e = event(json!({"ts": 5_000, "s": "6000", "bad": "x"}));
        assert_eq!(Transformer.event_ts(&e, "ts"), 5_000);
        assert_eq!(Transformer.event_ts(&e, ".s"), 6_000);
        assert_eq!(Transformer.event_ts(&e, "bad"), 1_000);
        assert_eq!(Transformer.event_ts(&e, ""), 1_000);
    }
}
