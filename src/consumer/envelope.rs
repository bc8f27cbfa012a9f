//! Broker envelope normalization.
//!
//! The broker hands over a job either as the job object itself (payload
//! under `data`) or wrapped in an index-keyed list of jobs, serialized as a
//! JSON array or as an object with `"0"`, `"1"`, ... keys. Only the first job
//! of an indexed wrapper is meaningful.

use serde_json::{Map, Value};

use super::payload::ThreadMessagePayload;
use crate::error::ConsumerError;

/// The two shapes a job can arrive in.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// The job's `data` field.
    Direct(Value),
    /// Jobs in index order.
    Indexed(Vec<Value>),
}

impl Envelope {
    /// Classify a raw delivery by shape.
    pub fn parse(raw: Value) -> Result<Self, ConsumerError> {
        match raw {
            Value::Array(items) => Ok(Self::Indexed(items)),
            Value::Object(mut map) => {
                if let Some(data) = map.remove("data") {
                    return Ok(Self::Direct(data));
                }
                if map.contains_key("0") {
                    return Ok(Self::Indexed(indexed_values(map)));
                }
                Err(ConsumerError::malformed(
                    "envelope has neither a data field nor indexed jobs",
                ))
            }
            other => Err(ConsumerError::malformed(format!(
                "expected an object or array, got {}",
                kind(&other)
            ))),
        }
    }
}

/// Pull the typed payload out of an envelope.
pub fn extract(envelope: Envelope) -> Result<ThreadMessagePayload, ConsumerError> {
    let data = match envelope {
        Envelope::Direct(data) => data,
        Envelope::Indexed(jobs) => {
            let first = jobs
                .into_iter()
                .next()
                .ok_or_else(|| ConsumerError::malformed("indexed wrapper contains no jobs"))?;
            match first {
                Value::Object(mut job) => job
                    .remove("data")
                    .ok_or_else(|| ConsumerError::malformed("first indexed job has no data field"))?,
                other => {
                    return Err(ConsumerError::malformed(format!(
                        "first indexed job is {}, not an object",
                        kind(&other)
                    )));
                }
            }
        }
    };

    if !data.is_object() {
        return Err(ConsumerError::malformed(format!(
            "job data is {}, not an object",
            kind(&data)
        )));
    }
    serde_json::from_value(data)
        .map_err(|e| ConsumerError::malformed(format!("invalid message payload: {e}")))
}

/// `Envelope::parse` followed by `extract`.
pub fn extract_job(raw: Value) -> Result<ThreadMessagePayload, ConsumerError> {
    extract(Envelope::parse(raw)?)
}

fn indexed_values(map: Map<String, Value>) -> Vec<Value> {
    let mut entries: Vec<(usize, Value)> = map
        .into_iter()
        .filter_map(|(key, value)| key.parse::<usize>().ok().map(|i| (i, value)))
        .collect();
    entries.sort_by_key(|(i, _)| *i);
    entries.into_iter().map(|(_, value)| value).collect()
}

const fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
