use std::collections::BTreeMap;

use serde_json::Value;

use super::method::HttpMethod;

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Everything a [`Fetcher`](super::client::Fetcher) needs to issue one request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout_ms: u64,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Request body as sent on the wire. Strings go out verbatim, any other
    /// JSON value is serialized.
    pub fn body_text(&self) -> Option<String> {
        match &self.body {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text.clone()),
            Some(other) => Some(other.to_string()),
        }
    }

    pub fn has_json_body(&self) -> bool {
        matches!(&self.body, Some(Value::Object(_)) | Some(Value::Array(_)))
    }
}
