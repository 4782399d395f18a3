use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

use super::case::TestSummary;

/// Lifecycle events of a session, in the order a subscriber sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    TestAdded(TestSummary),
    TestPassed(TestSummary),
    TestFailed(TestSummary),
    TestFinished(TestSummary),
    /// Overall verdict.
    Finished(bool),
    Error(String),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::TestAdded(_) => "test.add",
            SessionEvent::TestPassed(_) => "test.pass",
            SessionEvent::TestFailed(_) => "test.fail",
            SessionEvent::TestFinished(_) => "test.finish",
            SessionEvent::Finished(_) => "finish",
            SessionEvent::Error(_) => "error",
        }
    }

    pub fn test(&self) -> Option<&TestSummary> {
        match self {
            SessionEvent::TestAdded(test)
            | SessionEvent::TestPassed(test)
            | SessionEvent::TestFailed(test)
            | SessionEvent::TestFinished(test) => Some(test),
            SessionEvent::Finished(_) | SessionEvent::Error(_) => None,
        }
    }
}

/// Fans events out to every live subscriber. Dropped receivers are pruned on
/// the next emit.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.push(tx);
        rx
    }

    pub fn emit(&self, event: SessionEvent) {
        trace!(event = event.name(), "emit");
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestState;

    fn summary() -> TestSummary {
        TestSummary {
            index: 0,
            id: "0123456789abcdef".into(),
            name: "GET /".into(),
            tag: None,
            state: TestState::Passed,
            failure_reason: None,
        }
    }

    #[test]
    fn every_subscriber_gets_every_event_in_order() {
        let notifier = Notifier::new();
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.emit(SessionEvent::TestAdded(summary()));
        notifier.emit(SessionEvent::Finished(true));

        for rx in [&mut first, &mut second] {
            assert_eq!(rx.try_recv().map(|e| e.name()), Ok("test.add"));
            assert_eq!(rx.try_recv().map(|e| e.name()), Ok("finish"));
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn dropped_subscribers_do_not_block_emits() {
        let notifier = Notifier::new();
        drop(notifier.subscribe());
        let mut live = notifier.subscribe();

        notifier.emit(SessionEvent::Error("boom".into()));
        assert_eq!(live.try_recv(), Ok(SessionEvent::Error("boom".into())));
        assert_eq!(notifier.subscribers.lock().unwrap().len(), 1);
    }

    #[test]
    fn names_match_the_event_vocabulary() {
        let test = summary();
        let names: Vec<_> = [
            SessionEvent::TestAdded(test.clone()),
            SessionEvent::TestPassed(test.clone()),
            SessionEvent::TestFailed(test.clone()),
            SessionEvent::TestFinished(test),
            SessionEvent::Finished(false),
            SessionEvent::Error(String::new()),
        ]
        .iter()
        .map(SessionEvent::name)
        .collect();
        assert_eq!(
            names,
            ["test.add", "test.pass", "test.fail", "test.finish", "finish", "error"]
        );
    }
}
