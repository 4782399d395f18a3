pub mod client;
pub mod method;
pub mod request;
pub mod response;

pub use client::{BoxFuture, Fetcher, ReqwestFetcher};
pub use method::HttpMethod;
pub use request::{FetchRequest, DEFAULT_TIMEOUT_MS};
pub use response::{FetchedResponse, ResponseMeta, StoredResponse};
