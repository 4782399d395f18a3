//! Fully resolved route descriptors and the suite plan built from a config.

mod identity;

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{
    Defaults, RouteConfig, SideDefaults, SideRouteConfig, SuiteConfig, DEFAULT_RATE_LIMIT,
};
use crate::http::{FetchRequest, HttpMethod, DEFAULT_TIMEOUT_MS};
use crate::testing::Hooks;

pub use identity::{labelled_route_id, route_id, short_id, SHORT_ID_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Left, Side::Right];

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a comparison after defaults and overrides were merged.
/// Immutable once built.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub expected_status: Option<u16>,
    pub ignore_body: Vec<String>,
    pub ignore_header: Vec<String>,
    pub timeout_ms: u64,
    /// Invoked immediately around this side's fetch.
    pub hooks: Hooks,
}

impl RouteSpec {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            expected_status: None,
            ignore_body: Vec::new(),
            ignore_header: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            hooks: Hooks::default(),
        }
    }

    pub fn fetch_request(&self) -> FetchRequest {
        FetchRequest {
            method: self.method,
            url: self.url.clone(),
            headers: self.headers.clone(),
            query: self.query.clone(),
            body: self.body.clone(),
            timeout_ms: self.timeout_ms,
        }
    }

    /// Every comparable field. Hooks and the timeout are excluded.
    pub fn identity(&self) -> Value {
        json!({
            "method": self.method,
            "url": self.url,
            "headers": self.headers,
            "query": self.query,
            "body": self.body,
            "expectedStatus": self.expected_status,
            "ignoreBody": self.ignore_body,
            "ignoreHeader": self.ignore_header,
        })
    }

    /// URL path without scheme and host.
    pub fn path(&self) -> &str {
        strip_origin(&self.url)
    }
}

/// A configured route, resolved and ready to become a test.
#[derive(Debug, Clone)]
pub struct PlannedRoute {
    /// Position in the original config, kept through tag filtering.
    pub index: usize,
    pub id: String,
    pub name: String,
    pub tag: Option<String>,
    pub left: RouteSpec,
    pub right: RouteSpec,
    /// Invoked around the whole test run.
    pub hooks: Hooks,
}

impl PlannedRoute {
    pub fn new(index: usize, left: RouteSpec, right: RouteSpec) -> Self {
        let id = route_id(&left, &right);
        let name = route_name(None, &left, &right);
        Self {
            index,
            id,
            name,
            tag: None,
            left,
            right,
            hooks: Hooks::default(),
        }
    }

    pub fn side(&self, side: Side) -> &RouteSpec {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn side_mut(&mut self, side: Side) -> &mut RouteSpec {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SuitePlan {
    pub routes: Vec<PlannedRoute>,
    pub rate_limit: usize,
}

impl SuitePlan {
    pub fn new(routes: Vec<PlannedRoute>) -> Self {
        Self {
            routes,
            rate_limit: DEFAULT_RATE_LIMIT,
        }
    }

    /// Keeps only routes carrying `tag`.
    pub fn filter_tag(mut self, tag: &str) -> Self {
        self.routes.retain(|route| route.tag.as_deref() == Some(tag));
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: usize) -> Self {
        self.rate_limit = rate_limit.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        for route in &mut self.routes {
            route.left.timeout_ms = timeout_ms;
            route.right.timeout_ms = timeout_ms;
        }
        self
    }
}

pub(crate) fn resolve_plan(config: &SuiteConfig) -> SuitePlan {
    let routes = config
        .routes
        .iter()
        .enumerate()
        .map(|(index, route)| resolve_route(&config.defaults, route, index))
        .collect();

    SuitePlan {
        routes,
        rate_limit: config.defaults.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT).max(1),
    }
}

fn resolve_route(defaults: &Defaults, route: &RouteConfig, index: usize) -> PlannedRoute {
    let left = resolve_side(defaults, &defaults.left, route, route.left.as_ref());
    let right = resolve_side(defaults, &defaults.right, route, route.right.as_ref());
    let id = labelled_route_id(&left, &right, route.name.as_deref(), route.tag.as_deref());
    let name = route_name(route.name.as_deref(), &left, &right);

    PlannedRoute {
        index,
        id,
        name,
        tag: route.tag.clone(),
        left,
        right,
        hooks: Hooks::default(),
    }
}

/// Side defaults first, then shared route fields, then side overrides.
fn resolve_side(
    defaults: &Defaults,
    side_defaults: &SideDefaults,
    route: &RouteConfig,
    side_route: Option<&SideRouteConfig>,
) -> RouteSpec {
    let hostname = side_route
        .and_then(|side| side.hostname.as_deref())
        .or(side_defaults.hostname.as_deref());
    let path = side_route
        .and_then(|side| side.url.as_deref())
        .or(route.url.as_deref())
        .unwrap_or_default();
    let url = match hostname {
        Some(hostname) => format!("{hostname}{path}"),
        None => path.to_string(),
    };

    let method = side_route
        .and_then(|side| side.method)
        .or(route.method)
        .or(side_defaults.method)
        .unwrap_or_default();

    let mut headers = defaults.headers.clone();
    headers.extend(side_defaults.headers.clone());
    headers.extend(route.headers.clone());
    let mut query = defaults.query.clone();
    query.extend(side_defaults.query.clone());
    query.extend(route.query.clone());
    if let Some(side) = side_route {
        headers.extend(side.headers.clone());
        query.extend(side.query.clone());
    }

    let body = side_route
        .and_then(|side| side.body.clone())
        .or_else(|| route.body.clone())
        .or_else(|| side_defaults.body.clone());
    let expected_status = side_route
        .and_then(|side| side.status)
        .or(route.status)
        .or(defaults.status);

    RouteSpec {
        method,
        url,
        headers,
        query,
        body,
        expected_status,
        ignore_body: merge_paths(&defaults.ignore_body, &route.ignore_body),
        ignore_header: merge_paths(&defaults.ignore_header, &route.ignore_header),
        timeout_ms: defaults.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
        hooks: Hooks::default(),
    }
}

/// Route-level ignore paths extend the global ones.
fn merge_paths(global: &[String], local: &[String]) -> Vec<String> {
    let mut merged = global.to_vec();
    for path in local {
        if !merged.contains(path) {
            merged.push(path.clone());
        }
    }
    merged
}

fn route_name(explicit: Option<&str>, left: &RouteSpec, right: &RouteSpec) -> String {
    let label = match explicit {
        Some(name) => name.to_string(),
        None if left.path() == right.path() => left.path().to_string(),
        None => format!("{} ↔ {}", left.path(), right.path()),
    };
    format!("{} {label}", left.method)
}

fn strip_origin(url: &str) -> &str {
    let Some(rest) = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
    else {
        return url;
    };
    match rest.find('/') {
        Some(slash) => &rest[slash..],
        None => "/",
    }
}
