//! Guest scheduler interface
//!
//! Any cooperative scheduler that can be driven in bounded bursts can be plugged
//! into the bridge by implementing [`GuestScheduler`].

use std::any::Any;
use std::time::Instant;

use futures::future::LocalBoxFuture;

/// One-shot callback fired at the end of the iteration it was queued for
pub type BoundaryCallback = Box<dyn FnOnce(&mut dyn BurstControl)>;

/// What a boundary callback can see and do while a burst is in progress
pub trait BurstControl {
    /// Make `run_until_idle` return once the current iteration finishes
    fn stop(&mut self);

    /// Tasks spawned and not yet finished
    fn live_tasks(&self) -> usize;

    /// Whether some task is ready to be polled right now
    fn has_ready(&self) -> bool;

    /// Earliest timer deadline, if the scheduler tracks timers
    fn next_wakeup(&self) -> Option<Instant>;
}

/// Summary of one `run_until_idle` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BurstReport {
    /// A boundary callback asked the scheduler to stop
    pub stopped: bool,
    /// Loop iterations executed
    pub iterations: usize,
    /// Task polls performed
    pub polled: usize,
}

/// A cooperative task scheduler that can be run as a guest
pub trait GuestScheduler {
    /// Schedule a new top-level task
    fn spawn(&mut self, task: LocalBoxFuture<'static, ()>);

    /// Queue a one-shot callback for the next iteration boundary
    fn call_at_boundary(&mut self, callback: BoundaryCallback);

    /// Run iterations until stopped or nothing is immediately runnable
    fn run_until_idle(&mut self) -> BurstReport;

    fn live_tasks(&self) -> usize;

    /// Drop every pending task, returning how many were dropped
    fn cancel_all(&mut self) -> usize;

    fn next_wakeup(&self) -> Option<Instant> {
        None
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
