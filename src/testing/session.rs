use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info};

use crate::error::SessionError;
use crate::http::Fetcher;
use crate::route::{Side, SuitePlan};
use crate::storage::ResponseStore;

use super::cancel::CancelHandle;
use super::case::{RunContext, TestCase, TestSummary};
use super::hooks::{run_hooks, Hook, HookTarget, Hooks, SuiteHooks};
use super::notify::{Notifier, SessionEvent};

/// Collects the plan, collaborators and hooks for a [`Session`].
pub struct SessionBuilder {
    plan: SuitePlan,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<ResponseStore>,
    hooks: SuiteHooks,
    concurrency: Option<usize>,
}

impl SessionBuilder {
    pub fn new(plan: SuitePlan, fetcher: Arc<dyn Fetcher>, store: Arc<ResponseStore>) -> Self {
        Self {
            plan,
            fetcher,
            store,
            hooks: SuiteHooks::default(),
            concurrency: None,
        }
    }

    /// Runs once before any test. An error aborts the session.
    pub fn before(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.before = Some(Arc::new(hook));
        self
    }

    /// Runs once after every worker exited. An error aborts the session.
    pub fn after(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.after = Some(Arc::new(hook));
        self
    }

    pub fn before_each(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.before_each = Some(Arc::new(hook));
        self
    }

    pub fn after_each(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.after_each = Some(Arc::new(hook));
        self
    }

    /// Hooks around the whole test planned at config position `index`.
    pub fn route_hooks(mut self, index: usize, hooks: Hooks) -> Self {
        if let Some(route) = self.plan.routes.iter_mut().find(|route| route.index == index) {
            route.hooks = hooks;
        }
        self
    }

    /// Hooks around one side's fetch of the test at config position `index`.
    pub fn side_hooks(mut self, index: usize, side: Side, hooks: Hooks) -> Self {
        if let Some(route) = self.plan.routes.iter_mut().find(|route| route.index == index) {
            route.side_mut(side).hooks = hooks;
        }
        self
    }

    /// Overrides the plan's rate limit. Values below 1 are raised to 1.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }

    pub fn build(self) -> Session {
        let concurrency = self.concurrency.unwrap_or(self.plan.rate_limit).max(1);
        let ctx = RunContext {
            fetcher: self.fetcher,
            store: self.store,
            before_each: self.hooks.before_each.clone(),
            after_each: self.hooks.after_each.clone(),
        };
        Session {
            tests: self.plan.routes.into_iter().map(TestCase::new).collect(),
            concurrency,
            hooks: self.hooks,
            ctx,
            notifier: Notifier::new(),
            cancel: CancelHandle::new(),
            verdict: None,
        }
    }
}

/// Owns every test of one suite run and executes them on a bounded pool of
/// workers.
pub struct Session {
    tests: Vec<TestCase>,
    concurrency: usize,
    hooks: SuiteHooks,
    ctx: RunContext,
    notifier: Notifier,
    cancel: CancelHandle,
    verdict: Option<bool>,
}

impl Session {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.notifier.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn tests(&self) -> &[TestCase] {
        &self.tests
    }

    pub fn test(&self, id: &str) -> Option<&TestCase> {
        self.tests.iter().find(|test| test.id() == id)
    }

    /// Summaries ordered by config position, whatever the completion order was.
    pub fn report(&self) -> Vec<TestSummary> {
        let mut summaries: Vec<_> = self.tests.iter().map(TestCase::summary).collect();
        summaries.sort_by_key(|summary| summary.index);
        summaries
    }

    /// `None` until a run completed.
    pub fn verdict(&self) -> Option<bool> {
        self.verdict
    }

    /// Runs the suite: `before`, every test on the worker pool, `after`.
    /// Returns `true` iff every test passed. Per-test failures never surface
    /// as errors; only suite hooks, worker crashes and cancellation do.
    pub async fn run(&mut self) -> Result<bool, SessionError> {
        for test in &self.tests {
            self.notifier.emit(SessionEvent::TestAdded(test.summary()));
        }

        info!(
            tests = self.tests.len(),
            concurrency = self.concurrency,
            "starting session"
        );

        if let Err(source) =
            run_hooks("suite before", &[self.hooks.before.as_ref()], &HookTarget::Suite).await
        {
            return Err(self.fatal(SessionError::SuiteHook {
                hook: "before",
                source,
            }));
        }

        let tests = std::mem::take(&mut self.tests);
        let (tests, crashed) = run_pool(
            tests,
            self.concurrency,
            &self.ctx,
            &self.notifier,
            &self.cancel,
        )
        .await
        .map_err(|err| self.fatal(err))?;
        self.tests = tests;

        for test in self.tests.iter_mut().filter(|test| !test.state().is_terminal()) {
            test.cancel();
            let summary = test.summary();
            self.notifier.emit(SessionEvent::TestFailed(summary.clone()));
            self.notifier.emit(SessionEvent::TestFinished(summary));
        }

        if let Err(source) =
            run_hooks("suite after", &[self.hooks.after.as_ref()], &HookTarget::Suite).await
        {
            return Err(self.fatal(SessionError::SuiteHook {
                hook: "after",
                source,
            }));
        }

        if let Some(message) = crashed {
            return Err(self.fatal(SessionError::WorkerCrashed(message)));
        }
        if self.cancel.is_cancelled() {
            return Err(self.fatal(SessionError::Cancelled));
        }

        let verdict = self.tests.iter().all(TestCase::passed);
        self.verdict = Some(verdict);
        let failed = self.tests.iter().filter(|test| !test.passed()).count();
        info!(verdict, failed, total = self.tests.len(), "session finished");
        self.notifier.emit(SessionEvent::Finished(verdict));
        Ok(verdict)
    }

    fn fatal(&self, err: SessionError) -> SessionError {
        error!(error = %err, "session aborted");
        self.notifier.emit(SessionEvent::Error(err.to_string()));
        err
    }
}

/// Drains `tests` with at most `concurrency` workers. Each worker claims the
/// next index from a shared counter, so every test runs exactly once. A test
/// that panics fails on its own and its worker moves on. Returns the tests in
/// their original order plus the first worker crash, if any.
async fn run_pool(
    tests: Vec<TestCase>,
    concurrency: usize,
    ctx: &RunContext,
    notifier: &Notifier,
    cancel: &CancelHandle,
) -> Result<(Vec<TestCase>, Option<String>), SessionError> {
    let worker_count = concurrency.max(1).min(tests.len());
    let slots: Arc<Vec<AsyncMutex<TestCase>>> =
        Arc::new(tests.into_iter().map(AsyncMutex::new).collect());
    let next = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::with_capacity(worker_count);
    for worker in 0..worker_count {
        let slots = slots.clone();
        let next = next.clone();
        let ctx = ctx.clone();
        let notifier = notifier.clone();
        let cancel = cancel.clone();
        let mut cancel_rx = cancel.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                let index = next.fetch_add(1, Ordering::Relaxed);
                let Some(slot) = slots.get(index) else {
                    break;
                };

                let mut test = slot.lock().await;
                debug!(worker, test = test.name(), "claimed test");

                let outcome = tokio::select! {
                    result = AssertUnwindSafe(test.run(&ctx)).catch_unwind() => Some(result),
                    _ = cancel_rx.recv() => None,
                };
                let passed = match outcome {
                    Some(Ok(passed)) => passed,
                    Some(Err(payload)) => {
                        let message = panic_message(&*payload);
                        error!(worker, test = test.name(), %message, "test panicked");
                        test.panicked(&ctx, message);
                        false
                    }
                    None => {
                        test.cancel();
                        false
                    }
                };

                let summary = test.summary();
                drop(test);
                if passed {
                    notifier.emit(SessionEvent::TestPassed(summary.clone()));
                } else {
                    notifier.emit(SessionEvent::TestFailed(summary.clone()));
                }
                notifier.emit(SessionEvent::TestFinished(summary));
            }
        });
        handles.push(handle);
    }

    let mut crashed = None;
    for handle in handles {
        if let Err(err) = handle.await {
            error!(error = %err, "session worker crashed");
            crashed.get_or_insert_with(|| err.to_string());
        }
    }

    let slots = Arc::try_unwrap(slots).map_err(|_| {
        SessionError::WorkerCrashed("test queue still shared after workers exited".to_string())
    })?;
    let tests = slots.into_iter().map(AsyncMutex::into_inner).collect();
    Ok((tests, crashed))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
