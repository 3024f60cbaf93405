use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{CoreError, CoreErrorKind, CoreResult};

pub const ID_FIELD: &str = "id";
pub const CREATED_DATE_FIELD: &str = "createdDate";

/// A row of a [`KeyedStore`](crate::persistence::KeyedStore) table.
///
/// `id` is empty until the record is first persisted; the store assigns it
/// together with `created_date`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<i64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match name.as_str() {
            ID_FIELD => {
                if let Value::String(id) = value {
                    self.id = id;
                }
            }
            CREATED_DATE_FIELD => self.created_date = value.as_i64(),
            _ => {
                self.fields.insert(name, value);
            }
        }
    }

    /// Value stored under `name`, including the `id` and `createdDate` columns.
    pub fn field(&self, name: &str) -> Option<Cow<'_, Value>> {
        match name {
            ID_FIELD if !self.id.is_empty() => Some(Cow::Owned(Value::String(self.id.clone()))),
            ID_FIELD => None,
            CREATED_DATE_FIELD => self.created_date.map(|date| Cow::Owned(Value::from(date))),
            _ => self.fields.get(name).map(Cow::Borrowed),
        }
    }

    pub fn from_value(value: Value) -> CoreResult<Self> {
        if !value.is_object() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "records must be JSON objects",
            ));
        }
        serde_json::from_value(value).map_err(|error| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("record is not decodable: {error}"),
            )
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
