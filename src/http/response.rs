use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A response as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON for JSON content types, otherwise the raw text as a JSON string.
    pub body: Value,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub status: u16,
    pub response_time: u64,
    #[serde(default)]
    pub expected_status: Option<u16>,
}

/// One side of a test as persisted in the response store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub meta: ResponseMeta,
}

impl StoredResponse {
    pub fn from_fetched(response: FetchedResponse, expected_status: Option<u16>) -> Self {
        Self {
            status: response.status,
            meta: ResponseMeta {
                status: response.status,
                response_time: response.response_time_ms,
                expected_status,
            },
            headers: response.headers,
            body: response.body,
        }
    }

    /// `true` when no status is expected or the actual status matches it.
    pub fn status_matches(&self) -> bool {
        self.meta
            .expected_status
            .map_or(true, |expected| expected == self.status)
    }

    pub fn headers_value(&self) -> Value {
        Value::Object(
            self.headers
                .iter()
                .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                .collect(),
        )
    }
}
