use serde_json::{Map, Value};

use crate::models::{CoreError, CoreErrorKind, CoreResult, Record};

/// How one field of an [`Example`] is compared against a stored record.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldMatch {
    /// Strict equality on a scalar (string, number, bool, null).
    Equals(Value),
    /// Record field is an array holding a deep-equal element for every listed value.
    ContainsAll(Vec<Value>),
    /// Record field is deep-equal to the whole object.
    Object(Map<String, Value>),
}

impl FieldMatch {
    /// Picks the comparison rule from the shape of the query value.
    pub fn for_value(value: Value) -> Self {
        match value {
            Value::Array(values) => FieldMatch::ContainsAll(values),
            Value::Object(object) => FieldMatch::Object(object),
            scalar => FieldMatch::Equals(scalar),
        }
    }

    fn matches(&self, actual: Option<&Value>) -> bool {
        let Some(actual) = actual else {
            return false;
        };
        match self {
            FieldMatch::Equals(expected) => scalar_equals(expected, actual),
            FieldMatch::ContainsAll(expected) => match actual {
                Value::Array(elements) => expected.iter().all(|wanted| {
                    elements
                        .iter()
                        .any(|element| deep_equals(wanted, element))
                }),
                _ => false,
            },
            FieldMatch::Object(expected) => match actual {
                Value::Object(object) => objects_equal(expected, object),
                _ => false,
            },
        }
    }
}

/// Partial record used as a query: every listed field must match, unlisted
/// fields are unconstrained.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Example {
    fields: Vec<(String, FieldMatch)>,
}

impl Example {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a constraint whose rule follows the value's shape (see [`FieldMatch::for_value`]).
    pub fn with(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_match(field, FieldMatch::for_value(value.into()))
    }

    pub fn contains_all(
        self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = Value>,
    ) -> Self {
        self.with_match(field, FieldMatch::ContainsAll(values.into_iter().collect()))
    }

    pub fn with_match(mut self, field: impl Into<String>, rule: FieldMatch) -> Self {
        let field = field.into();
        self.fields.retain(|(existing, _)| *existing != field);
        self.fields.push((field, rule));
        self
    }

    /// Builds an example from a JSON object, one constraint per key.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        match value {
            Value::Object(object) => Ok(object
                .into_iter()
                .fold(Self::new(), |example, (field, value)| {
                    example.with(field, value)
                })),
            _ => Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "query examples must be JSON objects",
            )),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.fields
            .iter()
            .all(|(field, rule)| rule.matches(record.field(field).as_deref()))
    }
}

fn scalar_equals(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(left), Value::Number(right)) => {
            if left == right {
                return true;
            }
            // Integers compare exactly; only a float on either side widens to f64.
            if !(left.is_f64() || right.is_f64()) {
                return false;
            }
            match (left.as_f64(), right.as_f64()) {
                (Some(left), Some(right)) => left == right,
                _ => false,
            }
        }
        (Value::Array(_), _) | (Value::Object(_), _) => false,
        _ => expected == actual,
    }
}

fn deep_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Array(left), Value::Array(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .zip(right.iter())
                    .all(|(left, right)| deep_equals(left, right))
        }
        (Value::Object(left), Value::Object(right)) => objects_equal(left, right),
        _ => scalar_equals(left, right),
    }
}

fn objects_equal(left: &Map<String, Value>, right: &Map<String, Value>) -> bool {
    left.len() == right.len()
        && left.iter().all(|(key, value)| {
            right
                .get(key)
                .is_some_and(|other| deep_equals(value, other))
        })
}
