use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::TransportError;

use super::request::FetchRequest;
use super::response::FetchedResponse;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const USER_AGENT_VALUE: &str = concat!("routediff/", env!("CARGO_PKG_VERSION"));

/// Transport seam: turns a request description into a response.
///
/// A response with any status code is a successful fetch. Only a fetch that
/// never produced a response is a [`TransportError`].
pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        request: FetchRequest,
    ) -> BoxFuture<'_, Result<FetchedResponse, TransportError>>;
}

/// Default transport backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|err| {
                TransportError::InvalidRequest(format!("Failed to build HTTP client: {err}"))
            })?;
        Ok(Self { client })
    }

    async fn send(&self, request: FetchRequest) -> Result<FetchedResponse, TransportError> {
        let method: reqwest::Method = request.method.into();
        let mut headers = build_headers(&request.headers)?;
        if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        }

        let mut builder = self
            .client
            .request(method, &request.url)
            .headers(headers)
            .timeout(Duration::from_millis(request.timeout_ms));

        if !request.query.is_empty() {
            let pairs: Vec<(&String, &String)> = request.query.iter().collect();
            builder = builder.query(&pairs);
        }

        if request.method.allows_body() {
            if let Some(body) = request.body_text() {
                if request.has_json_body() && !request.headers.keys().any(is_content_type) {
                    builder = builder.header(CONTENT_TYPE, "application/json");
                }
                builder = builder.body(body);
            }
        }

        debug!(method = %request.method, url = %request.url, "fetching route");
        let started = Instant::now();
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout {
                    timeout_ms: request.timeout_ms,
                }
            } else {
                TransportError::Request(err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let is_json = headers
            .get(CONTENT_TYPE.as_str())
            .map_or(false, |value| is_json_content_type(value));

        let bytes = response
            .bytes()
            .await
            .map_err(|err| TransportError::Body(err.to_string()))?;
        let response_time_ms = started.elapsed().as_millis() as u64;
        debug!(url = %request.url, status, response_time_ms, "got response");

        Ok(FetchedResponse {
            status,
            headers,
            body: decode_body(&bytes, is_json),
            response_time_ms,
        })
    }
}

impl Fetcher for ReqwestFetcher {
    fn fetch(
        &self,
        request: FetchRequest,
    ) -> BoxFuture<'_, Result<FetchedResponse, TransportError>> {
        Box::pin(self.send(request))
    }
}

pub fn build_headers(input: &BTreeMap<String, String>) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();

    for (key, value) in input {
        if key.is_empty() {
            continue;
        }

        let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|err| {
            TransportError::InvalidRequest(format!("Invalid header name `{key}`: {err}"))
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|err| {
            TransportError::InvalidRequest(format!("Invalid header value for `{key}`: {err}"))
        })?;
        headers.insert(header_name, header_value);
    }

    Ok(headers)
}

/// Repeated headers are joined with `, `, binary values become empty strings.
fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut collected: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = value.to_str().unwrap_or_default();
        collected
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    collected
}

fn is_content_type(name: &String) -> bool {
    name.eq_ignore_ascii_case(CONTENT_TYPE.as_str())
}

fn is_json_content_type(value: &str) -> bool {
    let mime = value.split(';').next().unwrap_or_default().trim();
    mime.starts_with("application/") && mime.ends_with("json")
}

/// Malformed JSON falls back to text so the comparison still sees the payload.
fn decode_body(bytes: &[u8], is_json: bool) -> Value {
    if is_json && !bytes.is_empty() {
        if let Ok(parsed) = serde_json::from_slice(bytes) {
            return parsed;
        }
    }
    Value::String(String::from_utf8_lossy(bytes).into_owned())
}
