//! Host side - the foreign event loop the guest scheduler is embedded in
//!
//! The host owns the thread. It only has to offer three things:
//! - registering a receiver for application-defined events
//! - posting such an event, delivered later on the host's own turn
//! - a blocking `run()` that returns when the host decides to exit

mod queue;
mod token;

use std::any::Any;
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

pub use queue::QueueHost;
pub use token::{Continuation, ReentryReceiver, ReentryToken};

/// Identifies an event type on the host loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKind(pub u32);

impl EventKind {
    /// First kind available to application-defined events
    pub const USER: EventKind = EventKind(1000);
    /// Kind carried by re-entry tokens
    pub const REENTRY: EventKind = EventKind(Self::USER.0 + 1);
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= Self::USER.0 {
            write!(f, "user+{}", self.0 - Self::USER.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Handle returned by [`HostLoop::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(usize);

impl ReceiverId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// An application-defined event posted to the host loop
pub trait HostEvent: Any {
    fn kind(&self) -> EventKind;

    /// Earliest instant the host should bother delivering this event.
    /// Hosts are free to ignore it.
    fn not_before(&self) -> Option<Instant> {
        None
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Object registered with the host to receive posted events
pub trait EventReceiver {
    /// Returns whether the event was handled
    fn event(&self, event: &mut dyn HostEvent) -> bool;
}

/// Why a host loop returned from `run()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostExit {
    /// `quit` was called with this status
    Quit(i32),
    /// Nothing left to deliver
    Drained,
}

impl HostExit {
    pub fn code(&self) -> i32 {
        match self {
            HostExit::Quit(code) => *code,
            HostExit::Drained => 0,
        }
    }
}

/// The foreign, non-reentrant event loop a guest scheduler is embedded in
pub trait HostLoop {
    fn register(&self, receiver: Rc<dyn EventReceiver>) -> ReceiverId;

    /// Enqueue an event; it is delivered on a later host turn, never inline
    fn post(&self, target: ReceiverId, event: Box<dyn HostEvent>);

    /// Block until the host decides to exit
    fn run(&self) -> HostExit;
}
