//! Test execution: the per-route state machine, hooks, the bounded
//! concurrency session and its event channel.

mod cancel;
mod case;
mod hooks;
mod notify;
mod session;

pub use cancel::CancelHandle;
pub use case::{
    DiffMeta, FailureReason, RunContext, TestCase, TestDiff, TestState, TestSummary,
};
pub use hooks::{hook_fn, FnHook, Hook, HookTarget, Hooks, SharedHook, SuiteHooks};
pub use notify::{Notifier, SessionEvent};
pub use session::{Session, SessionBuilder};
