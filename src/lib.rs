//! Differential HTTP testing.
//!
//! A suite pairs a left and a right endpoint per route. Every pair is fetched,
//! both responses are stored, and the two are compared with configurable
//! ignore paths. The suite passes when every pair matched.

pub mod cli;
pub mod compare;
pub mod config;
pub mod error;
pub mod http;
pub mod route;
pub mod storage;
pub mod testing;

pub use config::SuiteConfig;
pub use error::{
    CompareError, ConfigError, DiffError, HookError, LookupError, SessionError, StoreError,
    TransportError,
};
pub use http::{Fetcher, ReqwestFetcher};
pub use route::{PlannedRoute, RouteSpec, Side, SuitePlan};
pub use storage::ResponseStore;
pub use testing::{Session, SessionBuilder, SessionEvent, TestCase, TestState};
