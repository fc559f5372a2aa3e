//! Named schema definitions for the records moved through the pipeline.
//!
//! A [`SchemaNode`] validates in two directions: `decode` turns a wire payload into its
//! validated form and `encode` turns an application value into the wire payload. The two are
//! round-trip partners within the declared decimal quantization.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Fields reported by every `cpu_times` record, in wire order.
pub const CPU_TIME_FIELDS: [&str; 10] = [
    "user",
    "nice",
    "system",
    "idle",
    "iowait",
    "irq",
    "softirq",
    "steal",
    "guest",
    "guest_nice",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationReason {
    #[error("expected {expected}")]
    WrongType { expected: &'static str },
    #[error("cannot parse {value:?} as {expected}")]
    Unparseable {
        value: String,
        expected: &'static str,
    },
    #[error("{value} is outside of {bounds}")]
    OutOfRange { value: String, bounds: String },
    #[error("{value} has more than {places} decimal places")]
    TooPrecise { value: String, places: u32 },
    #[error("required field is missing")]
    MissingField,
}

/// A payload that does not conform to a schema, and where in the payload it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub reason: ValidationReason,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() {
            "<root>"
        } else {
            &self.path
        };
        write!(f, "{}: {}", path, self.reason)
    }
}

impl std::error::Error for ValidationError {}

impl ValidationError {
    fn new(path: &str, reason: ValidationReason) -> Self {
        Self {
            path: path.to_owned(),
            reason,
        }
    }
}

/// Errors returned by [`SchemaRegistry`]. An unknown key is not a validation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("schema {0} not found")]
    NotFound(String),
    #[error("{key} payload is invalid at {error}")]
    Invalid {
        key: String,
        #[source]
        error: ValidationError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Decode,
    Encode,
}

/// A composable validation and conversion rule.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    Integer {
        min: Option<i64>,
        max: Option<i64>,
    },
    /// A decimal quantized to `places` fractional digits. Travels as a string with exactly
    /// `places` digits, decodes to a JSON number.
    Decimal {
        places: u32,
        min: Option<Decimal>,
        max: Option<Decimal>,
    },
    /// An RFC 3339 timestamp, normalized to UTC.
    DateTime,
    Sequence(Box<SchemaNode>),
    /// Named, required fields. Fields not declared here are dropped.
    Mapping(Vec<(String, SchemaNode)>),
}

impl SchemaNode {
    pub fn integer(min: Option<i64>, max: Option<i64>) -> Self {
        SchemaNode::Integer { min, max }
    }

    pub fn decimal(places: u32) -> Self {
        SchemaNode::Decimal {
            places,
            min: None,
            max: None,
        }
    }

    pub fn bounded_decimal(places: u32, min: Decimal, max: Decimal) -> Self {
        SchemaNode::Decimal {
            places,
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn sequence(element: SchemaNode) -> Self {
        SchemaNode::Sequence(Box::new(element))
    }

    pub fn mapping<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, SchemaNode)>,
        S: Into<String>,
    {
        SchemaNode::Mapping(
            fields
                .into_iter()
                .map(|(name, node)| (name.into(), node))
                .collect(),
        )
    }

    /// Validate a wire payload and return its decoded form.
    pub fn decode(&self, payload: &Value) -> Result<Value, ValidationError> {
        self.convert(payload, Direction::Decode, "")
    }

    /// Validate an application value and return its wire form.
    pub fn encode(&self, value: &Value) -> Result<Value, ValidationError> {
        self.convert(value, Direction::Encode, "")
    }

    fn convert(
        &self,
        value: &Value,
        direction: Direction,
        path: &str,
    ) -> Result<Value, ValidationError> {
        match self {
            SchemaNode::Integer { min, max } => convert_integer(value, *min, *max, path),
            SchemaNode::Decimal { places, min, max } => {
                convert_decimal(value, *places, *min, *max, direction, path)
            }
            SchemaNode::DateTime => convert_datetime(value, path),
            SchemaNode::Sequence(element) => {
                let Value::Array(items) = value else {
                    return Err(ValidationError::new(
                        path,
                        ValidationReason::WrongType { expected: "a sequence" },
                    ));
                };

                items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| {
                        element.convert(item, direction, &format!("{}[{}]", path, index))
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            SchemaNode::Mapping(fields) => {
                let Value::Object(object) = value else {
                    return Err(ValidationError::new(
                        path,
                        ValidationReason::WrongType { expected: "a mapping" },
                    ));
                };

                let mut converted = Map::with_capacity(fields.len());
                for (name, node) in fields {
                    let field_path = if path.is_empty() {
                        name.clone()
                    } else {
                        format!("{}.{}", path, name)
                    };
                    let field = object.get(name).ok_or_else(|| {
                        ValidationError::new(&field_path, ValidationReason::MissingField)
                    })?;
                    converted.insert(name.clone(), node.convert(field, direction, &field_path)?);
                }
                Ok(Value::Object(converted))
            }
        }
    }
}

fn convert_integer(
    value: &Value,
    min: Option<i64>,
    max: Option<i64>,
    path: &str,
) -> Result<Value, ValidationError> {
    let integer = match value {
        Value::Number(number) => number.as_i64().ok_or_else(|| {
            ValidationError::new(
                path,
                ValidationReason::Unparseable {
                    value: number.to_string(),
                    expected: "an integer",
                },
            )
        })?,
        Value::String(s) => i64::from_str(s.trim()).map_err(|_| {
            ValidationError::new(
                path,
                ValidationReason::Unparseable {
                    value: s.clone(),
                    expected: "an integer",
                },
            )
        })?,
        _ => {
            return Err(ValidationError::new(
                path,
                ValidationReason::WrongType {
                    expected: "an integer",
                },
            ))
        }
    };

    if min.is_some_and(|min| integer < min) || max.is_some_and(|max| integer > max) {
        return Err(ValidationError::new(
            path,
            ValidationReason::OutOfRange {
                value: integer.to_string(),
                bounds: format_bounds(min, max),
            },
        ));
    }

    Ok(Value::from(integer))
}

fn convert_decimal(
    value: &Value,
    places: u32,
    min: Option<Decimal>,
    max: Option<Decimal>,
    direction: Direction,
    path: &str,
) -> Result<Value, ValidationError> {
    let text = match value {
        Value::Number(number) => number.to_string(),
        Value::String(s) => s.trim().to_owned(),
        _ => {
            return Err(ValidationError::new(
                path,
                ValidationReason::WrongType {
                    expected: "a decimal",
                },
            ))
        }
    };
    let parsed = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| {
            ValidationError::new(
                path,
                ValidationReason::Unparseable {
                    value: text.clone(),
                    expected: "a decimal",
                },
            )
        })?;

    let quantized = match direction {
        Direction::Encode => {
            parsed.round_dp_with_strategy(places, RoundingStrategy::MidpointNearestEven)
        }
        Direction::Decode if parsed.normalize().scale() > places => {
            return Err(ValidationError::new(
                path,
                ValidationReason::TooPrecise {
                    value: text,
                    places,
                },
            ))
        }
        Direction::Decode => parsed,
    };

    if min.is_some_and(|min| quantized < min) || max.is_some_and(|max| quantized > max) {
        return Err(ValidationError::new(
            path,
            ValidationReason::OutOfRange {
                value: quantized.to_string(),
                bounds: format_bounds(min, max),
            },
        ));
    }

    match direction {
        Direction::Encode => {
            let mut wire = quantized;
            wire.rescale(places);
            Ok(Value::String(wire.to_string()))
        }
        Direction::Decode => quantized
            .normalize()
            .to_string()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| {
                ValidationError::new(
                    path,
                    ValidationReason::Unparseable {
                        value: text,
                        expected: "a finite decimal",
                    },
                )
            }),
    }
}

fn convert_datetime(value: &Value, path: &str) -> Result<Value, ValidationError> {
    let Value::String(s) = value else {
        return Err(ValidationError::new(
            path,
            ValidationReason::WrongType {
                expected: "a timestamp string",
            },
        ));
    };

    let timestamp = DateTime::parse_from_rfc3339(s)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| naive.and_utc())
        })
        .map_err(|_| {
            ValidationError::new(
                path,
                ValidationReason::Unparseable {
                    value: s.clone(),
                    expected: "an RFC 3339 timestamp",
                },
            )
        })?;

    Ok(Value::String(
        timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
    ))
}

fn format_bounds<T: fmt::Display>(min: Option<T>, max: Option<T>) -> String {
    let min = min.map_or_else(|| "-inf".to_owned(), |min| min.to_string());
    let max = max.map_or_else(|| "inf".to_owned(), |max| max.to_string());
    format!("[{}, {}]", min, max)
}

/// Schema definitions keyed by the discriminator carried in each envelope.
/// Built once at startup and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, SchemaNode>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, key: &str, schema: SchemaNode) -> Self {
        self.schemas.insert(key.to_owned(), schema);
        self
    }

    /// The full set of heartbeat schemas: `cpu_load`, `cpu_times`, `cpus` and `heartbeat`.
    pub fn heartbeat() -> Self {
        Self::new()
            .register("cpu_load", cpu_load())
            .register("cpu_times", cpu_times())
            .register("cpus", cpus())
            .register("heartbeat", heartbeat())
    }

    pub fn has(&self, key: &str) -> bool {
        self.schemas.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn decode(&self, key: &str, payload: &Value) -> Result<Value, RegistryError> {
        self.lookup(key)?
            .decode(payload)
            .map_err(|error| RegistryError::Invalid {
                key: key.to_owned(),
                error,
            })
    }

    pub fn encode(&self, key: &str, value: &Value) -> Result<Value, RegistryError> {
        self.lookup(key)?
            .encode(value)
            .map_err(|error| RegistryError::Invalid {
                key: key.to_owned(),
                error,
            })
    }

    fn lookup(&self, key: &str) -> Result<&SchemaNode, RegistryError> {
        self.schemas
            .get(key)
            .ok_or_else(|| RegistryError::NotFound(key.to_owned()))
    }
}

/// Load per CPU, as a percentage with one decimal place.
pub fn cpu_load() -> SchemaNode {
    SchemaNode::sequence(SchemaNode::bounded_decimal(
        1,
        Decimal::ZERO,
        Decimal::ONE_HUNDRED,
    ))
}

/// Cumulative CPU time per state, with two decimal places.
pub fn cpu_times() -> SchemaNode {
    SchemaNode::mapping(
        CPU_TIME_FIELDS
            .iter()
            .map(|field| (*field, SchemaNode::decimal(2))),
    )
}

pub fn cpus() -> SchemaNode {
    SchemaNode::mapping([("load", cpu_load()), ("times", cpu_times())])
}

pub fn heartbeat() -> SchemaNode {
    SchemaNode::mapping([("timestamp", SchemaNode::DateTime), ("cpus", cpus())])
}
