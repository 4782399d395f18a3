//! Suite configuration as read from a JSON file.
//!
//! Raw input is validated and normalized first (see [`validation`]) so that
//! every rejected key is reported with its location, then deserialized into
//! the typed structs below. Hooks are never part of the file; they are wired
//! in through [`SessionBuilder`](crate::testing::SessionBuilder).

mod validation;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::http::HttpMethod;
use crate::route::{self, SuitePlan};

pub const DEFAULT_CONFIG_FILE: &str = "routediff.json";
pub const DEFAULT_RATE_LIMIT: usize = 2;

/// Defaults for one side, applied before anything a route sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SideDefaults {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub method: Option<HttpMethod>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Defaults {
    #[serde(default)]
    pub left: SideDefaults,
    #[serde(default)]
    pub right: SideDefaults,
    #[serde(default)]
    pub rate_limit: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub ignore_body: Vec<String>,
    #[serde(default)]
    pub ignore_header: Vec<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

/// Per-side overrides inside a single route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SideRouteConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub method: Option<HttpMethod>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RouteConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub method: Option<HttpMethod>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub ignore_body: Vec<String>,
    #[serde(default)]
    pub ignore_header: Vec<String>,
    #[serde(default)]
    pub left: Option<SideRouteConfig>,
    #[serde(default)]
    pub right: Option<SideRouteConfig>,
}

impl RouteConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SuiteConfig {
    #[serde(default)]
    pub defaults: Defaults,
    pub routes: Vec<RouteConfig>,
}

impl SuiteConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_value(value)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let normalized = validation::normalize_config(value)?;
        serde_json::from_value(normalized)
            .map_err(|err| ConfigError::malformed("config", format!("is invalid: {err}")))
    }

    /// Validates everything that typed construction could not see and
    /// resolves every route into its left/right specs.
    pub fn into_plan(self) -> Result<SuitePlan, ConfigError> {
        validation::validate_typed(&self)?;
        let plan = route::resolve_plan(&self);
        validation::check_unique_ids(&plan)?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "defaults": {
                "left": { "hostname": "http://localhost:3100" },
                "right": { "hostname": "http://localhost:3200" },
                "status": 200,
                "ignoreBody": ["properties.price", "properties.age"],
                "ignoreHeader": ["etag", "date"]
            },
            "routes": [
                "/v1/test.json",
                { "url": "/v2/test.json", "tag": "test", "status": 204 },
                {
                    "tag": "banana",
                    "left": { "url": "/v1/banana.json" },
                    "right": { "url": "/v2/banana.json" }
                }
            ]
        })
    }

    #[test]
    fn parses_string_and_object_routes() {
        let config = SuiteConfig::from_value(sample()).expect("config");
        assert_eq!(config.routes.len(), 3);
        assert_eq!(config.routes[0].url.as_deref(), Some("/v1/test.json"));
        assert_eq!(config.routes[1].status, Some(204));
        assert_eq!(
            config.routes[2].left.as_ref().and_then(|side| side.url.as_deref()),
            Some("/v1/banana.json")
        );
        assert_eq!(config.defaults.ignore_header, vec!["etag", "date"]);
    }

    #[test]
    fn header_alias_is_accepted() {
        let config = SuiteConfig::from_value(json!({
            "defaults": { "left": { "header": { "accept": "application/json" } } },
            "routes": [{ "url": "/a", "header": { "x-num": 5 } }]
        }))
        .expect("config");
        assert_eq!(
            config.defaults.left.headers.get("accept").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(config.routes[0].headers.get("x-num").map(String::as_str), Some("5"));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, sample().to_string()).expect("write config");

        let config = SuiteConfig::load(&path).expect("load");
        assert_eq!(config.routes.len(), 3);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = SuiteConfig::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = SuiteConfig::from_json("{ routes: ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
