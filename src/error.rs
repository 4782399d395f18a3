use thiserror::Error;

/// Raised while loading or resolving a suite configuration. Always fatal and
/// always raised before any network activity.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config invalid: Key \"{key}\" in \"{location}\" is not allowed!")]
    UnknownKey { key: String, location: String },

    #[error("Config invalid: Method \"{method}\" in \"{location}\" is invalid!")]
    InvalidMethod { method: String, location: String },

    #[error("Config invalid: Hostname \"{hostname}\" in \"{location}\" is invalid!")]
    InvalidHostname { hostname: String, location: String },

    #[error("Config invalid: \"{location}\" {reason}")]
    Malformed { location: String, reason: String },

    #[error("Config invalid: \"routes[{second}]\" duplicates \"routes[{first}]\" (id {id})!")]
    DuplicateRoute {
        first: usize,
        second: usize,
        id: String,
    },

    #[error("Failed to read config file `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file `{path}`: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub(crate) fn malformed(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

/// A fetch that never produced a response.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Failed to read response: {0}")]
    Body(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to create store directory `{path}`: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open SQLite: {0}")]
    Open(#[source] rusqlite::Error),

    #[error("Failed to {action} in SQLite: {source}")]
    Query {
        action: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to serialize stored {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to parse stored {what}: {source}")]
    Deserialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Response store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub(crate) fn query(action: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Query { action, source }
    }
}

/// Returned by id-prefix lookups so callers can render a friendly message.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("No tests found. Check the id `{prefix}`.")]
    NotFound { prefix: String },

    #[error("Multiple tests found for `{prefix}`, ambiguous id, be more specific: {}", candidates.join(", "))]
    Ambiguous {
        prefix: String,
        candidates: Vec<String>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompareError {
    #[error("Cannot compare two different source types ({left} vs {right})!")]
    KindMismatch {
        left: &'static str,
        right: &'static str,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors that abort a whole session. Per-test failures never surface here.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Suite `{hook}` hook failed: {source}")]
    SuiteHook {
        hook: &'static str,
        #[source]
        source: HookError,
    },

    #[error("Session worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("Session cancelled")]
    Cancelled,
}

/// Failures while producing a human-readable diff of a stored test.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Compare(#[from] CompareError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Test {test_id} has no {side} response")]
    MissingResponse {
        test_id: String,
        side: crate::route::Side,
    },
}
