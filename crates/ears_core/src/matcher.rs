//! Structural pattern matching
//!
//! A pattern is contained in a payload when every key of a pattern object is
//! present in the payload object with a contained value, every element of a
//! pattern array is contained in some element of the payload array, and
//! scalars are equal. Fields of the payload that the pattern does not mention
//! are ignored. A `null` pattern at the top level matches everything.

use crate::error::PatternError;
use crate::model::RoutingTableEntry;
use serde_json::{Number, Value};

/// Deepest pattern nesting accepted
pub const MAX_PATTERN_DEPTH: usize = 32;

/// Tests whether a pattern is contained in a payload
pub trait Matcher: Send + Sync {
    /// Returns `true` if `pattern` is contained in `payload`
    fn matches(&self, payload: &Value, pattern: &Value) -> Result<bool, PatternError>;
}

/// Stateless containment matcher
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternMatcher;

impl PatternMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Applies the route firing rule: the match pattern must be contained and
    /// the filter pattern, when present, must not be.
    pub fn fires(&self, payload: &Value, entry: &RoutingTableEntry) -> Result<bool, PatternError> {
        if !self.matches(payload, &entry.match_pattern)? {
            return Ok(false);
        }
        match &entry.filter_pattern {
            None => Ok(true),
            Some(filter) => Ok(!self.matches(payload, filter)?),
        }
    }
}

impl Matcher for PatternMatcher {
    fn matches(&self, payload: &Value, pattern: &Value) -> Result<bool, PatternError> {
        validate_pattern(pattern)?;
        if pattern.is_null() {
            return Ok(true);
        }
        Ok(contains(payload, pattern))
    }
}

/// Checks that a pattern is well formed
pub fn validate_pattern(pattern: &Value) -> Result<(), PatternError> {
    check_depth(pattern, 0)
}

fn check_depth(pattern: &Value, depth: usize) -> Result<(), PatternError> {
    if depth > MAX_PATTERN_DEPTH {
        return Err(PatternError::TooDeep(MAX_PATTERN_DEPTH));
    }
    match pattern {
        Value::Object(map) => {
            for (key, value) in map {
                if key.is_empty() {
                    return Err(PatternError::EmptyKey);
                }
                check_depth(value, depth + 1)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(|item| check_depth(item, depth + 1)),
        _ => Ok(()),
    }
}

fn contains(payload: &Value, pattern: &Value) -> bool {
    match (payload, pattern) {
        (Value::Object(have), Value::Object(want)) => want
            .iter()
            .all(|(key, wanted)| have.get(key).is_some_and(|value| contains(value, wanted))),
        (Value::Array(have), Value::Array(want)) => want
            .iter()
            .all(|wanted| have.iter().any(|value| contains(value, wanted))),
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Null, Value::Null) => true,
        _ => false,
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}
