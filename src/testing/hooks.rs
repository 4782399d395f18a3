use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::error::HookError;
use crate::http::BoxFuture;
use crate::route::Side;

/// What a hook is being invoked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookTarget {
    Suite,
    Test { id: String, name: String },
    Side { id: String, name: String, side: Side },
}

/// A user callback run around a suite, a test or one side's fetch.
///
/// Any closure `Fn(HookTarget) -> impl Future<Output = Result<(), HookError>>`
/// is a hook; see [`hook_fn`].
pub trait Hook: Send + Sync {
    fn call(&self, target: HookTarget) -> BoxFuture<'_, Result<(), HookError>>;
}

pub type SharedHook = Arc<dyn Hook>;

/// Adapter turning an async closure into a [`Hook`].
pub struct FnHook<F>(F);

pub fn hook_fn<F, Fut>(f: F) -> FnHook<F>
where
    F: Fn(HookTarget) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HookError>> + Send + 'static,
{
    FnHook(f)
}

impl<F, Fut> Hook for FnHook<F>
where
    F: Fn(HookTarget) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HookError>> + Send + 'static,
{
    fn call(&self, target: HookTarget) -> BoxFuture<'_, Result<(), HookError>> {
        Box::pin((self.0)(target))
    }
}

/// A before/after pair. Absent hooks are no-ops.
#[derive(Clone, Default)]
pub struct Hooks {
    pub before: Option<SharedHook>,
    pub after: Option<SharedHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .finish()
    }
}

/// Suite-wide hooks. `before`/`after` run once per session and are fatal on
/// error; `before_each`/`after_each` run inside every test.
#[derive(Clone, Default)]
pub struct SuiteHooks {
    pub before: Option<SharedHook>,
    pub after: Option<SharedHook>,
    pub before_each: Option<SharedHook>,
    pub after_each: Option<SharedHook>,
}

impl fmt::Debug for SuiteHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteHooks")
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .field("before_each", &self.before_each.is_some())
            .field("after_each", &self.after_each.is_some())
            .finish()
    }
}

/// Runs the hooks in order, stopping at the first error.
pub(crate) async fn run_hooks(
    label: &str,
    hooks: &[Option<&SharedHook>],
    target: &HookTarget,
) -> Result<(), HookError> {
    for hook in hooks.iter().flatten() {
        debug!(hook = label, ?target, "calling hook");
        hook.call(target.clone()).await?;
    }
    Ok(())
}
