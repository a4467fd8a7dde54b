//! HTTP batch transport envelopes.
//!
//! A batch call is `GET|POST <base>/<path0,path1,...>?batch=1` with an input
//! map keyed by position (`{"0": ..., "1": ...}`) in the `input` query
//! parameter (GET) or the body (POST). The response body is a JSON array with
//! one item per position.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorShape, RpcError};

/// Separator between procedure paths in the batch URL.
pub const PATH_SEPARATOR: char = ',';

/// Builds the index-keyed input map for a batch.
#[must_use]
pub fn input_map<'a>(inputs: impl IntoIterator<Item = &'a Value>) -> Value {
    let mut map = Map::new();
    for (i, input) in inputs.into_iter().enumerate() {
        map.insert(i.to_string(), input.clone());
    }
    Value::Object(map)
}

/// Reads the input at `index` back out of an input map. Missing entries are `null`.
#[must_use]
pub fn input_at(map: &Value, index: usize) -> Value {
    map.get(index.to_string()).cloned().unwrap_or(Value::Null)
}

/// Orders an input map by numeric index.
#[must_use]
pub fn indexed_inputs(map: &Map<String, Value>) -> BTreeMap<usize, Value> {
    map.iter()
        .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v.clone())))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    #[serde(default)]
    pub data: Value,
}

/// One element of a batch response array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchResponseItem {
    Result { result: BatchResult },
    Error { error: ErrorShape },
}

impl BatchResponseItem {
    #[must_use]
    pub fn data(data: Value) -> Self {
        Self::Result {
            result: BatchResult { data },
        }
    }

    #[must_use]
    pub fn error(error: &RpcError) -> Self {
        Self::Error {
            error: error.to_shape(),
        }
    }

    /// HTTP status this item contributes to the batch status.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Result { .. } => 200,
            Self::Error { error } => error.data.http_status,
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self {
            Self::Result { result } => Ok(result.data),
            Self::Error { error } => Err(RpcError::from_shape(error)),
        }
    }
}

/// Status of a whole batch: the most severe member status, 200 if all succeeded.
#[must_use]
pub fn batch_status(items: &[BatchResponseItem]) -> u16 {
    items
        .iter()
        .map(BatchResponseItem::http_status)
        .max()
        .unwrap_or(200)
}
