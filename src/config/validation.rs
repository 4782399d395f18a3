use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::http::HttpMethod;
use crate::route::{Side, SuitePlan};

use super::{SideDefaults, SideRouteConfig, SuiteConfig};

const ROOT_KEYS: &[&str] = &["defaults", "routes"];
const DEFAULTS_KEYS: &[&str] = &[
    "left",
    "right",
    "rateLimit",
    "timeoutMs",
    "status",
    "ignoreBody",
    "ignoreHeader",
    "headers",
    "header",
    "query",
];
const SIDE_KEYS: &[&str] = &["method", "hostname", "headers", "header", "query", "body"];
const ROUTE_KEYS: &[&str] = &[
    "url",
    "name",
    "tag",
    "method",
    "headers",
    "header",
    "query",
    "body",
    "status",
    "ignoreBody",
    "ignoreHeader",
    "left",
    "right",
];
const ROUTE_SIDE_KEYS: &[&str] = &[
    "url", "method", "hostname", "headers", "header", "query", "body", "status",
];

/// Checks every key against the allow-list for its level and rewrites the
/// tolerated shorthands (string routes, `header`, numeric names and header
/// values) into the canonical shape the typed structs expect.
pub(super) fn normalize_config(value: Value) -> Result<Value, ConfigError> {
    let mut root = into_object(value, "config")?;
    reject_unknown_keys(&root, ROOT_KEYS, "config")?;

    if let Some(defaults) = root.remove("defaults") {
        root.insert("defaults".into(), normalize_defaults(defaults)?);
    }

    let routes = match root.remove("routes") {
        Some(Value::Array(routes)) => routes,
        _ => return Err(ConfigError::malformed("routes", "must be an array!")),
    };
    let routes = routes
        .into_iter()
        .enumerate()
        .map(|(index, route)| normalize_route(route, index))
        .collect::<Result<Vec<_>, _>>()?;
    root.insert("routes".into(), Value::Array(routes));

    Ok(Value::Object(root))
}

fn normalize_defaults(value: Value) -> Result<Value, ConfigError> {
    let location = "defaults";
    let mut defaults = into_object(value, location)?;
    reject_unknown_keys(&defaults, DEFAULTS_KEYS, location)?;
    merge_header_alias(&mut defaults, location)?;
    normalize_string_map(&mut defaults, "headers", location)?;
    normalize_string_map(&mut defaults, "query", location)?;
    check_method(&defaults, location)?;
    check_string_list(&defaults, "ignoreBody", location)?;
    check_string_list(&defaults, "ignoreHeader", location)?;

    for side in Side::ALL {
        if let Some(raw) = defaults.remove(side.as_str()) {
            let location = format!("defaults.{side}");
            let normalized = normalize_side(raw, SIDE_KEYS, &location)?;
            defaults.insert(side.as_str().into(), normalized);
        }
    }

    Ok(Value::Object(defaults))
}

fn normalize_route(value: Value, index: usize) -> Result<Value, ConfigError> {
    let location = format!("routes[{index}]");
    let mut route = match value {
        Value::String(url) => {
            let mut route = Map::new();
            route.insert("url".into(), Value::String(url));
            route
        }
        Value::Object(route) => route,
        other => {
            return Err(ConfigError::malformed(
                location,
                format!("({other}) must be a string or an object!"),
            ))
        }
    };

    reject_unknown_keys(&route, ROUTE_KEYS, &location)?;
    merge_header_alias(&mut route, &location)?;
    normalize_string_map(&mut route, "headers", &location)?;
    normalize_string_map(&mut route, "query", &location)?;
    check_method(&route, &location)?;
    check_string_list(&route, "ignoreBody", &location)?;
    check_string_list(&route, "ignoreHeader", &location)?;
    stringify_label(&mut route, "name", &location)?;
    stringify_label(&mut route, "tag", &location)?;

    if let Some(url) = route.get("url") {
        if !url.is_string() {
            return Err(ConfigError::malformed(location, "must contain a \"url\" (string)!"));
        }
    }

    for side in Side::ALL {
        if let Some(raw) = route.remove(side.as_str()) {
            let side_location = format!("{location}.{side}");
            let normalized = normalize_side(raw, ROUTE_SIDE_KEYS, &side_location)?;
            route.insert(side.as_str().into(), normalized);
        }
    }

    Ok(Value::Object(route))
}

fn normalize_side(value: Value, allowed: &[&str], location: &str) -> Result<Value, ConfigError> {
    let mut side = into_object(value, location)?;
    reject_unknown_keys(&side, allowed, location)?;
    merge_header_alias(&mut side, location)?;
    normalize_string_map(&mut side, "headers", location)?;
    normalize_string_map(&mut side, "query", location)?;
    check_method(&side, location)?;
    Ok(Value::Object(side))
}

fn into_object(value: Value, location: &str) -> Result<Map<String, Value>, ConfigError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ConfigError::malformed(location, "must be an object!")),
    }
}

fn reject_unknown_keys(
    map: &Map<String, Value>,
    allowed: &[&str],
    location: &str,
) -> Result<(), ConfigError> {
    match map.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => Err(ConfigError::UnknownKey {
            key: key.clone(),
            location: location.to_string(),
        }),
        None => Ok(()),
    }
}

fn merge_header_alias(map: &mut Map<String, Value>, location: &str) -> Result<(), ConfigError> {
    if let Some(header) = map.remove("header") {
        if map.contains_key("headers") {
            return Err(ConfigError::malformed(
                location,
                "must not set both \"header\" and \"headers\"!",
            ));
        }
        map.insert("headers".into(), header);
    }
    Ok(())
}

/// Header and query values may be given as numbers or booleans.
fn normalize_string_map(
    map: &mut Map<String, Value>,
    key: &str,
    location: &str,
) -> Result<(), ConfigError> {
    let Some(value) = map.get_mut(key) else {
        return Ok(());
    };
    let Value::Object(entries) = value else {
        return Err(ConfigError::malformed(format!("{location}.{key}"), "is invalid!"));
    };

    for (name, entry) in entries.iter_mut() {
        match entry {
            Value::String(_) => {}
            Value::Number(number) => *entry = Value::String(number.to_string()),
            Value::Bool(flag) => *entry = Value::String(flag.to_string()),
            _ => {
                return Err(ConfigError::malformed(
                    format!("{location}.{key}.{name}"),
                    "must be a string!",
                ))
            }
        }
    }
    Ok(())
}

fn check_method(map: &Map<String, Value>, location: &str) -> Result<(), ConfigError> {
    match map.get("method") {
        None => Ok(()),
        Some(Value::String(method)) if method.parse::<HttpMethod>().is_ok() => Ok(()),
        Some(other) => Err(ConfigError::InvalidMethod {
            method: other.as_str().map_or_else(|| other.to_string(), str::to_string),
            location: format!("{location}.method"),
        }),
    }
}

fn check_string_list(map: &Map<String, Value>, key: &str, location: &str) -> Result<(), ConfigError> {
    match map.get(key) {
        None => Ok(()),
        Some(Value::Array(items)) if items.iter().all(Value::is_string) => Ok(()),
        Some(_) => Err(ConfigError::malformed(
            format!("{location}.{key}"),
            "must be a list of strings!",
        )),
    }
}

fn stringify_label(
    map: &mut Map<String, Value>,
    key: &str,
    location: &str,
) -> Result<(), ConfigError> {
    match map.get(key) {
        None | Some(Value::String(_)) => Ok(()),
        Some(Value::Number(number)) => {
            let label = number.to_string();
            map.insert(key.into(), Value::String(label));
            Ok(())
        }
        Some(_) => Err(ConfigError::malformed(
            format!("{location}.{key}"),
            "must be a string or a number!",
        )),
    }
}

/// Semantic checks that also apply to configs built in code.
pub(super) fn validate_typed(config: &SuiteConfig) -> Result<(), ConfigError> {
    if config.defaults.rate_limit == Some(0) {
        return Err(ConfigError::malformed(
            "defaults.rateLimit",
            "must be greater than 0!",
        ));
    }
    if config.defaults.timeout_ms == Some(0) {
        return Err(ConfigError::malformed(
            "defaults.timeoutMs",
            "must be greater than 0!",
        ));
    }

    check_side_defaults(&config.defaults.left, "defaults.left")?;
    check_side_defaults(&config.defaults.right, "defaults.right")?;

    for (index, route) in config.routes.iter().enumerate() {
        for side in Side::ALL {
            let side_route = match side {
                Side::Left => route.left.as_ref(),
                Side::Right => route.right.as_ref(),
            };
            let location = format!("routes[{index}].{side}");
            if let Some(side_route) = side_route {
                check_side_route(side_route, &location)?;
            }
            let has_url = route.url.is_some() || side_route.map_or(false, |s| s.url.is_some());
            if !has_url {
                return Err(ConfigError::malformed(
                    format!("routes[{index}]"),
                    format!("must contain a \"url\" (string) for the {side} side!"),
                ));
            }
        }
    }

    Ok(())
}

/// Two routes with the same id would overwrite each other's stored
/// responses, so a resolved plan must not contain any.
pub(super) fn check_unique_ids(plan: &SuitePlan) -> Result<(), ConfigError> {
    let mut seen: HashMap<&str, usize> = HashMap::with_capacity(plan.routes.len());
    for route in &plan.routes {
        if let Some(&first) = seen.get(route.id.as_str()) {
            return Err(ConfigError::DuplicateRoute {
                first,
                second: route.index,
                id: route.id.clone(),
            });
        }
        seen.insert(&route.id, route.index);
    }
    Ok(())
}

fn check_side_defaults(side: &SideDefaults, location: &str) -> Result<(), ConfigError> {
    check_hostname(side.hostname.as_deref(), location)
}

fn check_side_route(side: &SideRouteConfig, location: &str) -> Result<(), ConfigError> {
    check_hostname(side.hostname.as_deref(), location)
}

fn check_hostname(hostname: Option<&str>, location: &str) -> Result<(), ConfigError> {
    let Some(hostname) = hostname else {
        return Ok(());
    };
    let rest = hostname
        .strip_prefix("http://")
        .or_else(|| hostname.strip_prefix("https://"));
    match rest {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(ConfigError::InvalidHostname {
            hostname: hostname.to_string(),
            location: format!("{location}.hostname"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan_error(value: Value) -> ConfigError {
        match SuiteConfig::from_value(value) {
            Err(err) => err,
            Ok(config) => config.into_plan().expect_err("config should be rejected"),
        }
    }

    #[test]
    fn rejects_unknown_side_keys_with_location() {
        let err = plan_error(json!({
            "defaults": { "left": { "hostname": "http://a", "banana": 1 } },
            "routes": ["/a"]
        }));
        assert_eq!(
            err.to_string(),
            "Config invalid: Key \"banana\" in \"defaults.left\" is not allowed!"
        );
    }

    #[test]
    fn rejects_unknown_route_keys_with_index() {
        let err = plan_error(json!({ "routes": ["/a", { "url": "/b", "colour": "red" }] }));
        assert!(matches!(
            err,
            ConfigError::UnknownKey { ref key, ref location } if key == "colour" && location == "routes[1]"
        ));
    }

    #[test]
    fn rejects_side_only_keys_at_route_side_level() {
        let err = plan_error(json!({
            "routes": [{ "url": "/a", "right": { "ignoreBody": ["x"] } }]
        }));
        assert!(matches!(
            err,
            ConfigError::UnknownKey { ref location, .. } if location == "routes[0].right"
        ));
    }

    #[test]
    fn rejects_invalid_methods() {
        let err = plan_error(json!({ "routes": [{ "url": "/a", "method": "FETCH" }] }));
        assert_eq!(
            err.to_string(),
            "Config invalid: Method \"FETCH\" in \"routes[0].method\" is invalid!"
        );

        let err = plan_error(json!({
            "defaults": { "right": { "method": "get" } },
            "routes": ["/a"]
        }));
        assert!(matches!(err, ConfigError::InvalidMethod { .. }));
    }

    #[test]
    fn rejects_invalid_hostnames() {
        let err = plan_error(json!({
            "defaults": { "left": { "hostname": "localhost:3000" } },
            "routes": ["/a"]
        }));
        assert!(matches!(
            err,
            ConfigError::InvalidHostname { ref location, .. } if location == "defaults.left.hostname"
        ));

        let err = plan_error(json!({
            "routes": [{ "url": "/a", "right": { "hostname": "ftp://x" } }]
        }));
        assert!(matches!(err, ConfigError::InvalidHostname { .. }));
    }

    #[test]
    fn rejects_malformed_routes() {
        assert!(matches!(
            plan_error(json!({ "routes": {} })),
            ConfigError::Malformed { .. }
        ));
        assert!(matches!(
            plan_error(json!({ "routes": [42] })),
            ConfigError::Malformed { .. }
        ));
        assert!(matches!(
            plan_error(json!({ "routes": [{ "name": "no url" }] })),
            ConfigError::Malformed { .. }
        ));
        assert!(matches!(
            plan_error(json!({ "routes": [{ "url": 7 }] })),
            ConfigError::Malformed { .. }
        ));
    }

    #[test]
    fn rejects_non_object_headers_and_queries() {
        assert!(matches!(
            plan_error(json!({ "routes": [{ "url": "/a", "headers": "accept: */*" }] })),
            ConfigError::Malformed { .. }
        ));
        assert!(matches!(
            plan_error(json!({ "defaults": { "query": { "a": [1] } }, "routes": ["/a"] })),
            ConfigError::Malformed { .. }
        ));
    }

    #[test]
    fn rejects_zero_rate_limit() {
        let err = plan_error(json!({ "defaults": { "rateLimit": 0 }, "routes": ["/a"] }));
        assert!(matches!(err, ConfigError::Malformed { ref location, .. } if location == "defaults.rateLimit"));
    }

    #[test]
    fn accepts_side_urls_without_route_url() {
        let config = SuiteConfig::from_value(json!({
            "routes": [{ "left": { "url": "/v1/a" }, "right": { "url": "/v2/a" } }]
        }))
        .expect("config");
        assert!(validate_typed(&config).is_ok());
    }

    #[test]
    fn numeric_names_and_tags_become_strings() {
        let config = SuiteConfig::from_value(json!({
            "routes": [{ "url": "/a", "name": 12, "tag": 3 }]
        }))
        .expect("config");
        assert_eq!(config.routes[0].name.as_deref(), Some("12"));
        assert_eq!(config.routes[0].tag.as_deref(), Some("3"));
    }

    #[test]
    fn rejects_routes_that_resolve_to_the_same_id() {
        let err = plan_error(json!({
            "defaults": { "left": { "hostname": "http://l" }, "right": { "hostname": "http://r" } },
            "routes": ["/a", "/b", { "url": "/a" }]
        }));
        assert!(matches!(err, ConfigError::DuplicateRoute { first: 0, second: 2, .. }));
        assert!(err.to_string().contains("routes[2]"));

        let named = SuiteConfig::from_value(json!({
            "routes": [{ "url": "/a", "name": "x" }, { "url": "/a", "name": "y" }]
        }))
        .and_then(SuiteConfig::into_plan)
        .expect("names keep identical routes apart");
        assert_eq!(named.routes.len(), 2);
        assert_eq!(named.routes[1].side(Side::Left).url, "/a");
    }
}
