//! Re-entry token and its receiver

use std::any::Any;
use std::fmt;
use std::time::Instant;

use super::{EventKind, EventReceiver, HostEvent};

/// Work carried by a token, run once when the host delivers it
pub type Continuation = Box<dyn FnOnce()>;

/// Host event carrying the continuation that starts the next guest burst
pub struct ReentryToken {
    continuation: Option<Continuation>,
    not_before: Option<Instant>,
}

impl ReentryToken {
    pub fn new(continuation: Continuation) -> Self {
        Self {
            continuation: Some(continuation),
            not_before: None,
        }
    }

    /// Hint that nothing can happen in the guest before `at`
    pub fn deliver_after(mut self, at: Option<Instant>) -> Self {
        self.not_before = at;
        self
    }

    pub fn is_consumed(&self) -> bool {
        self.continuation.is_none()
    }

    pub fn take(&mut self) -> Option<Continuation> {
        self.continuation.take()
    }
}

impl fmt::Debug for ReentryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentryToken")
            .field("consumed", &self.is_consumed())
            .field("not_before", &self.not_before)
            .finish()
    }
}

impl HostEvent for ReentryToken {
    fn kind(&self) -> EventKind {
        EventKind::REENTRY
    }

    fn not_before(&self) -> Option<Instant> {
        self.not_before
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Receives re-entry tokens and runs their continuation synchronously
#[derive(Debug, Default)]
pub struct ReentryReceiver;

impl ReentryReceiver {
    pub fn new() -> Self {
        Self
    }
}

impl EventReceiver for ReentryReceiver {
    fn event(&self, event: &mut dyn HostEvent) -> bool {
        let kind = event.kind();
        if kind != EventKind::REENTRY {
            return false;
        }
        let Some(token) = event.as_any_mut().downcast_mut::<ReentryToken>() else {
            log::warn!("event of kind {kind} is not a re-entry token");
            return false;
        };
        match token.take() {
            Some(continuation) => continuation(),
            None => log::warn!("re-entry token delivered twice; ignoring"),
        }
        true
    }
}
