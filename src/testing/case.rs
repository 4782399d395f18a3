use std::fmt::{self, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compare::{self, DiffChunk};
use crate::error::{CompareError, DiffError};
use crate::http::{Fetcher, ResponseMeta, StoredResponse};
use crate::route::{short_id, PlannedRoute, RouteSpec, Side};
use crate::storage::{ResponseStore, TestRecord};

use super::hooks::{run_hooks, HookTarget, Hooks, SharedHook};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestState {
    Pending,
    Downloading,
    Downloaded,
    DownloadFailed,
    Passed,
    Failed,
}

impl TestState {
    pub fn as_str(self) -> &'static str {
        match self {
            TestState::Pending => "pending",
            TestState::Downloading => "downloading",
            TestState::Downloaded => "downloaded",
            TestState::DownloadFailed => "download-failed",
            TestState::Passed => "passed",
            TestState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TestState::Passed | TestState::Failed)
    }
}

impl Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Why a test ended up `failed`. Only the first failing check is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum FailureReason {
    Status {
        side: Side,
        expected: u16,
        actual: u16,
    },
    Headers,
    Body,
    Download {
        side: Side,
        message: String,
    },
    Hook {
        message: String,
    },
    Store {
        side: Side,
        message: String,
    },
    Cancelled,
    Panicked {
        message: String,
    },
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Status {
                side,
                expected,
                actual,
            } => write!(f, "Status mismatch on {side} side: expected {expected}, got {actual}"),
            FailureReason::Headers => f.write_str("Headers don't match"),
            FailureReason::Body => f.write_str("Bodies don't match"),
            FailureReason::Download { side, message } => {
                write!(f, "Download of {side} side failed: {message}")
            }
            FailureReason::Hook { message } => write!(f, "Hook failed: {message}"),
            FailureReason::Store { side, message } => {
                write!(f, "Failed to store {side} response: {message}")
            }
            FailureReason::Cancelled => f.write_str("Cancelled"),
            FailureReason::Panicked { message } => write!(f, "Test panicked: {message}"),
        }
    }
}

/// Shared collaborators every test run needs.
#[derive(Clone)]
pub struct RunContext {
    pub fetcher: Arc<dyn Fetcher>,
    pub store: Arc<ResponseStore>,
    pub before_each: Option<SharedHook>,
    pub after_each: Option<SharedHook>,
}

/// Snapshot of a test handed to reporters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub tag: Option<String>,
    pub state: TestState,
    pub failure_reason: Option<String>,
}

impl TestSummary {
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffMeta {
    pub left: ResponseMeta,
    pub right: ResponseMeta,
}

/// Human-readable comparison of a finished test.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDiff {
    pub header_diff: Vec<DiffChunk>,
    pub body_diff: Vec<DiffChunk>,
    pub meta: DiffMeta,
}

impl TestDiff {
    pub fn between(
        left: &StoredResponse,
        right: &StoredResponse,
        ignore_body: &[String],
        ignore_header: &[String],
    ) -> Result<Self, CompareError> {
        Ok(Self {
            header_diff: compare::diff(
                &left.headers_value(),
                &right.headers_value(),
                ignore_header,
                true,
            )?,
            body_diff: compare::diff(&left.body, &right.body, ignore_body, false)?,
            meta: DiffMeta {
                left: left.meta.clone(),
                right: right.meta.clone(),
            },
        })
    }

    pub fn has_changes(&self) -> bool {
        self.header_diff
            .iter()
            .chain(self.body_diff.iter())
            .any(DiffChunk::is_change)
    }
}

/// A pair of routes expected to answer alike, plus its run state.
#[derive(Debug)]
pub struct TestCase {
    index: usize,
    id: String,
    name: String,
    tag: Option<String>,
    left: RouteSpec,
    right: RouteSpec,
    hooks: Hooks,
    state: TestState,
    failure_reason: Option<FailureReason>,
    left_response: Option<StoredResponse>,
    right_response: Option<StoredResponse>,
}

impl TestCase {
    pub fn new(route: PlannedRoute) -> Self {
        Self {
            index: route.index,
            id: route.id,
            name: route.name,
            tag: route.tag,
            left: route.left,
            right: route.right,
            hooks: route.hooks,
            state: TestState::Pending,
            failure_reason: None,
            left_response: None,
            right_response: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TestState {
        self.state
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        self.failure_reason.as_ref()
    }

    pub fn spec(&self, side: Side) -> &RouteSpec {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn response(&self, side: Side) -> Option<&StoredResponse> {
        match side {
            Side::Left => self.left_response.as_ref(),
            Side::Right => self.right_response.as_ref(),
        }
    }

    pub fn passed(&self) -> bool {
        self.state == TestState::Passed
    }

    pub fn summary(&self) -> TestSummary {
        TestSummary {
            index: self.index,
            id: self.id.clone(),
            name: self.name.clone(),
            tag: self.tag.clone(),
            state: self.state,
            failure_reason: self.failure_reason.as_ref().map(ToString::to_string),
        }
    }

    pub fn ignore_body(&self) -> Vec<String> {
        union(&self.left.ignore_body, &self.right.ignore_body)
    }

    pub fn ignore_header(&self) -> Vec<String> {
        union(&self.left.ignore_header, &self.right.ignore_header)
    }

    /// Diff of the responses captured by the last run.
    pub fn diff(&self) -> Result<TestDiff, DiffError> {
        let left = self.captured(Side::Left)?;
        let right = self.captured(Side::Right)?;
        Ok(TestDiff::between(
            left,
            right,
            &self.ignore_body(),
            &self.ignore_header(),
        )?)
    }

    fn captured(&self, side: Side) -> Result<&StoredResponse, DiffError> {
        self.response(side).ok_or_else(|| DiffError::MissingResponse {
            test_id: self.id.clone(),
            side,
        })
    }

    /// Runs the test once: hooks, both fetches, persistence and comparison.
    /// A test already in a terminal state is not run again.
    pub async fn run(&mut self, ctx: &RunContext) -> bool {
        if self.state.is_terminal() {
            return self.passed();
        }

        let target = HookTarget::Test {
            id: self.id.clone(),
            name: self.name.clone(),
        };

        let before = [ctx.before_each.as_ref(), self.hooks.before.as_ref()];
        match run_hooks("before", &before, &target).await {
            Ok(()) => self.download_and_judge(ctx).await,
            Err(err) => self.fail(FailureReason::Hook {
                message: err.to_string(),
            }),
        }

        let after = [self.hooks.after.as_ref(), ctx.after_each.as_ref()];
        if let Err(err) = run_hooks("after", &after, &target).await {
            if self.passed() {
                self.state = TestState::Failed;
                self.failure_reason = Some(FailureReason::Hook {
                    message: err.to_string(),
                });
            } else {
                warn!(test = %self.name, error = %err, "after hook failed on a failed test");
            }
        }

        if let Err(err) = ctx.store.put_record(&self.record()) {
            warn!(test = %self.name, error = %err, "failed to store test record");
        }

        match &self.failure_reason {
            None => info!(id = short_id(&self.id), test = %self.name, "test passed"),
            Some(reason) => {
                info!(id = short_id(&self.id), test = %self.name, %reason, "test failed")
            }
        }
        self.passed()
    }

    /// Marks a test that was interrupted or never started.
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.fail(FailureReason::Cancelled);
        }
    }

    /// Fails a test whose run unwound, whatever state it reached. The record
    /// is stored so the failure survives the session.
    pub(crate) fn panicked(&mut self, ctx: &RunContext, message: String) {
        self.fail(FailureReason::Panicked { message });
        if let Err(err) = ctx.store.put_record(&self.record()) {
            warn!(test = %self.name, error = %err, "failed to store test record");
        }
    }

    async fn download_and_judge(&mut self, ctx: &RunContext) {
        self.state = TestState::Downloading;

        let (left, right) = tokio::join!(
            fetch_side(&self.id, &self.name, Side::Left, &self.left, ctx),
            fetch_side(&self.id, &self.name, Side::Right, &self.right, ctx),
        );

        let mut first_error = None;
        match left {
            Ok(response) => self.left_response = Some(response),
            Err(reason) => first_error = Some(reason),
        }
        match right {
            Ok(response) => self.right_response = Some(response),
            Err(reason) => {
                first_error.get_or_insert(reason);
            }
        }

        if let Some(reason) = first_error {
            self.state = TestState::DownloadFailed;
            debug!(test = %self.name, %reason, "download failed");
            self.fail(reason);
            return;
        }

        self.state = TestState::Downloaded;
        match self.judge() {
            None => self.state = TestState::Passed,
            Some(reason) => self.fail(reason),
        }
    }

    /// Status first, then headers, then bodies. Stops at the first mismatch.
    fn judge(&self) -> Option<FailureReason> {
        let (Some(left), Some(right)) = (&self.left_response, &self.right_response) else {
            return Some(FailureReason::Body);
        };

        for (side, response) in [(Side::Left, left), (Side::Right, right)] {
            if !response.status_matches() {
                return Some(FailureReason::Status {
                    side,
                    expected: response.meta.expected_status.unwrap_or_default(),
                    actual: response.status,
                });
            }
        }

        if !compare::compare(
            &left.headers_value(),
            &right.headers_value(),
            &self.ignore_header(),
            true,
        ) {
            return Some(FailureReason::Headers);
        }

        if !compare::compare(&left.body, &right.body, &self.ignore_body(), false) {
            return Some(FailureReason::Body);
        }

        None
    }

    fn fail(&mut self, reason: FailureReason) {
        self.state = TestState::Failed;
        self.failure_reason = Some(reason);
    }

    fn record(&self) -> TestRecord {
        TestRecord {
            test_id: self.id.clone(),
            name: self.name.clone(),
            ignore_body: self.ignore_body(),
            ignore_header: self.ignore_header(),
            state: self.state,
            failure_reason: self.failure_reason.as_ref().map(ToString::to_string),
        }
    }
}

/// Fetches and persists one side. Side hooks bracket the fetch; a failing
/// side hook counts as a failed download of that side. A fetched response is
/// stored before the after hook runs, so it stays inspectable either way.
async fn fetch_side(
    id: &str,
    name: &str,
    side: Side,
    spec: &RouteSpec,
    ctx: &RunContext,
) -> Result<StoredResponse, FailureReason> {
    let target = HookTarget::Side {
        id: id.to_string(),
        name: name.to_string(),
        side,
    };
    let download_failed = |message: String| FailureReason::Download { side, message };

    run_hooks("before", &[spec.hooks.before.as_ref()], &target)
        .await
        .map_err(|err| download_failed(format!("before hook: {err}")))?;

    let persisted = ctx
        .fetcher
        .fetch(spec.fetch_request())
        .await
        .map_err(|err| {
            warn!(test = name, %side, url = %spec.url, error = %err, "fetch failed");
            download_failed(err.to_string())
        })
        .and_then(|fetched| {
            let response = StoredResponse::from_fetched(fetched, spec.expected_status);
            ctx.store
                .put(id, side, &response)
                .map(|()| response)
                .map_err(|err| FailureReason::Store {
                    side,
                    message: err.to_string(),
                })
        });

    run_hooks("after", &[spec.hooks.after.as_ref()], &target)
        .await
        .map_err(|err| download_failed(format!("after hook: {err}")))?;

    persisted
}

fn union(first: &[String], second: &[String]) -> Vec<String> {
    let mut merged = first.to_vec();
    for item in second {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HookError, TransportError};
    use crate::http::{BoxFuture, FetchRequest, FetchedResponse, HttpMethod};
    use crate::testing::hook_fn;
    use serde_json::{json, Value};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    /// Serves canned responses keyed by URL; unknown URLs fail to connect.
    #[derive(Default)]
    struct StaticFetcher {
        responses: HashMap<String, (u16, Value)>,
        log: Mutex<Vec<String>>,
    }

    impl StaticFetcher {
        fn with(mut self, url: &str, status: u16, body: Value) -> Self {
            self.responses.insert(url.to_string(), (status, body));
            self
        }
    }

    impl Fetcher for StaticFetcher {
        fn fetch(
            &self,
            request: FetchRequest,
        ) -> BoxFuture<'_, Result<FetchedResponse, TransportError>> {
            self.log.lock().unwrap().push(request.url.clone());
            let result = match self.responses.get(&request.url) {
                Some((status, body)) => Ok(FetchedResponse {
                    status: *status,
                    headers: BTreeMap::from([(
                        "Content-Type".to_string(),
                        "application/json".to_string(),
                    )]),
                    body: body.clone(),
                    response_time_ms: 3,
                }),
                None => Err(TransportError::Request("connection refused".into())),
            };
            Box::pin(async move { result })
        }
    }

    fn context(fetcher: StaticFetcher) -> (RunContext, Arc<ResponseStore>) {
        let store = Arc::new(ResponseStore::open_in_memory().expect("store"));
        let ctx = RunContext {
            fetcher: Arc::new(fetcher),
            store: store.clone(),
            before_each: None,
            after_each: None,
        };
        (ctx, store)
    }

    fn test_case(status: Option<u16>, ignore_body: &[&str]) -> TestCase {
        let mut left = RouteSpec::new(HttpMethod::Get, "http://left/v1/test.json");
        let mut right = RouteSpec::new(HttpMethod::Get, "http://right/v1/test.json");
        for spec in [&mut left, &mut right] {
            spec.expected_status = status;
            spec.ignore_body = ignore_body.iter().map(|path| path.to_string()).collect();
        }
        TestCase::new(PlannedRoute::new(0, left, right))
    }

    #[tokio::test]
    async fn identical_responses_pass() {
        let body = json!({ "name": "banana" });
        let (ctx, store) = context(
            StaticFetcher::default()
                .with("http://left/v1/test.json", 200, body.clone())
                .with("http://right/v1/test.json", 200, body),
        );
        let mut test = test_case(Some(200), &[]);

        assert!(test.run(&ctx).await);
        assert_eq!(test.state(), TestState::Passed);
        assert!(test.failure_reason().is_none());
        assert!(store.get(test.id(), Side::Left).expect("get").is_some());
        assert!(store.get(test.id(), Side::Right).expect("get").is_some());
        let record = store.get_record(test.id()).expect("record").expect("present");
        assert_eq!(record.state, TestState::Passed);
    }

    #[tokio::test]
    async fn status_mismatch_fails_before_comparing_bodies() {
        let (ctx, _store) = context(
            StaticFetcher::default()
                .with("http://left/v1/test.json", 200, json!({ "a": 1 }))
                .with("http://right/v1/test.json", 204, json!({ "a": 2 })),
        );
        let mut test = test_case(Some(200), &[]);

        assert!(!test.run(&ctx).await);
        assert_eq!(test.state(), TestState::Failed);
        assert_eq!(
            test.failure_reason(),
            Some(&FailureReason::Status {
                side: Side::Right,
                expected: 200,
                actual: 204
            })
        );
        assert!(test.summary().failure_reason.unwrap().contains("Status mismatch"));
    }

    #[tokio::test]
    async fn ignored_body_paths_do_not_fail_the_test() {
        let (ctx, _store) = context(
            StaticFetcher::default()
                .with("http://left/v1/test.json", 200, json!({ "properties": { "price": 1 } }))
                .with("http://right/v1/test.json", 200, json!({ "properties": { "price": 2 } })),
        );

        let mut strict = test_case(None, &[]);
        assert!(!strict.run(&ctx).await);
        assert_eq!(strict.failure_reason(), Some(&FailureReason::Body));

        let mut lenient = test_case(None, &["properties.price"]);
        assert!(lenient.run(&ctx).await);
    }

    #[tokio::test]
    async fn one_failed_side_still_persists_the_other() {
        let (ctx, store) = context(
            StaticFetcher::default().with("http://left/v1/test.json", 200, json!({ "a": 1 })),
        );
        let mut test = test_case(None, &[]);

        assert!(!test.run(&ctx).await);
        assert_eq!(test.state(), TestState::Failed);
        assert!(matches!(
            test.failure_reason(),
            Some(FailureReason::Download { side: Side::Right, .. })
        ));
        assert!(test.response(Side::Left).is_some());
        assert!(store.get(test.id(), Side::Left).expect("get").is_some());
        assert!(store.get(test.id(), Side::Right).expect("get").is_none());
    }

    #[tokio::test]
    async fn failing_side_after_hook_keeps_the_fetched_response() {
        let body = json!({ "a": 1 });
        let (ctx, store) = context(
            StaticFetcher::default()
                .with("http://left/v1/test.json", 200, body.clone())
                .with("http://right/v1/test.json", 200, body),
        );
        let mut test = test_case(None, &[]);
        test.left.hooks.after = Some(Arc::new(hook_fn(|_| async {
            Err(HookError::new("teardown"))
        })));

        assert!(!test.run(&ctx).await);
        assert_eq!(
            test.failure_reason(),
            Some(&FailureReason::Download {
                side: Side::Left,
                message: "after hook: teardown".into()
            })
        );
        let stored = store.get(test.id(), Side::Left).expect("get").expect("stored");
        assert_eq!(stored.body, json!({ "a": 1 }));
        assert_eq!(test.spec(Side::Left).url, "http://left/v1/test.json");
    }

    #[tokio::test]
    async fn before_hook_failure_skips_fetching_but_runs_after_hooks() {
        let fetcher = StaticFetcher::default();
        let (mut ctx, _store) = context(fetcher);
        let after_calls = Arc::new(Mutex::new(0));
        let after_clone = after_calls.clone();
        ctx.after_each = Some(Arc::new(hook_fn(move |_| {
            *after_clone.lock().unwrap() += 1;
            async { Ok(()) }
        })));
        ctx.before_each = Some(Arc::new(hook_fn(|_| async {
            Err(HookError::new("no fixtures"))
        })));

        let mut test = test_case(None, &[]);
        assert!(!test.run(&ctx).await);
        assert_eq!(
            test.failure_reason(),
            Some(&FailureReason::Hook {
                message: "no fixtures".into()
            })
        );
        assert_eq!(*after_calls.lock().unwrap(), 1);
        assert!(test.response(Side::Left).is_none());
    }

    #[tokio::test]
    async fn failing_after_hook_fails_a_passing_test() {
        let body = json!("same");
        let (mut ctx, _store) = context(
            StaticFetcher::default()
                .with("http://left/v1/test.json", 200, body.clone())
                .with("http://right/v1/test.json", 200, body),
        );
        ctx.after_each = Some(Arc::new(hook_fn(|_| async {
            Err(HookError::new("cleanup failed"))
        })));

        let mut test = test_case(None, &[]);
        assert!(!test.run(&ctx).await);
        assert!(matches!(test.failure_reason(), Some(FailureReason::Hook { .. })));
    }

    #[tokio::test]
    async fn terminal_tests_are_not_run_again() {
        let fetcher = StaticFetcher::default()
            .with("http://left/v1/test.json", 200, json!(1))
            .with("http://right/v1/test.json", 200, json!(1));
        let store = Arc::new(ResponseStore::open_in_memory().expect("store"));
        let fetcher = Arc::new(fetcher);
        let ctx = RunContext {
            fetcher: fetcher.clone(),
            store,
            before_each: None,
            after_each: None,
        };
        let mut test = test_case(None, &[]);

        assert!(test.run(&ctx).await);
        assert!(test.run(&ctx).await);
        assert_eq!(fetcher.log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn diff_uses_captured_responses_and_ignore_lists() {
        let (ctx, _store) = context(
            StaticFetcher::default()
                .with("http://left/v1/test.json", 200, json!({ "price": 1, "name": "a" }))
                .with("http://right/v1/test.json", 200, json!({ "price": 2, "name": "a" })),
        );
        let mut test = test_case(None, &["price"]);
        assert!(test.run(&ctx).await);

        let diff = test.diff().expect("diff");
        assert!(!diff.has_changes());
        assert_eq!(diff.meta.left.status, 200);
    }

    #[test]
    fn diff_before_run_reports_missing_response() {
        let test = test_case(None, &[]);
        assert!(matches!(
            test.diff(),
            Err(DiffError::MissingResponse { side: Side::Left, .. })
        ));
    }

    #[test]
    fn cancel_only_touches_unfinished_tests() {
        let mut test = test_case(None, &[]);
        test.cancel();
        assert_eq!(test.state(), TestState::Failed);
        assert_eq!(test.failure_reason(), Some(&FailureReason::Cancelled));
    }
}
