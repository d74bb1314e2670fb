//! In-process FIFO host loop
//!
//! Used headless, as the posted-event queue behind the terminal host, and as the
//! fake host in tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::thread;
use std::time::Instant;

use super::{EventReceiver, HostEvent, HostExit, HostLoop, ReceiverId};

struct Posted {
    target: ReceiverId,
    event: Box<dyn HostEvent>,
}

#[derive(Default)]
struct Inner {
    receivers: RefCell<Vec<Rc<dyn EventReceiver>>>,
    queue: RefCell<VecDeque<Posted>>,
    exit: Cell<Option<i32>>,
    quit_hooks: RefCell<Vec<Box<dyn FnOnce()>>>,
    delivered: Cell<u64>,
}

/// FIFO host event loop; clones share the same queue
#[derive(Clone, Default)]
pub struct QueueHost {
    inner: Rc<Inner>,
}

impl QueueHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events waiting for delivery
    pub fn pending(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// Total events delivered so far
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.get()
    }

    /// Deliver the front event regardless of its delivery hint.
    /// Returns false if the queue was empty.
    pub fn turn(&self) -> bool {
        let next = self.inner.queue.borrow_mut().pop_front();
        match next {
            Some(posted) => {
                self.dispatch(posted);
                true
            }
            None => false,
        }
    }

    /// Deliver every event queued before this call whose hint is due at `now`.
    /// Events posted while dispatching wait for the next call.
    pub fn process_due(&self, now: Instant) -> usize {
        let batch: Vec<Posted> = {
            let mut queue = self.inner.queue.borrow_mut();
            let mut due = Vec::new();
            let mut deferred = VecDeque::new();
            while let Some(posted) = queue.pop_front() {
                if is_due(&posted, now) {
                    due.push(posted);
                } else {
                    deferred.push_back(posted);
                }
            }
            *queue = deferred;
            due
        };

        let count = batch.len();
        for posted in batch {
            self.dispatch(posted);
        }
        count
    }

    /// Whether some queued event can be delivered at `now`
    pub fn has_due(&self, now: Instant) -> bool {
        self.inner.queue.borrow().iter().any(|p| is_due(p, now))
    }

    /// Earliest delivery hint among queued events
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .queue
            .borrow()
            .iter()
            .filter_map(|p| p.event.not_before())
            .min()
    }

    /// Register a hook fired once when the host is asked to quit
    pub fn on_about_to_quit(&self, hook: impl FnOnce() + 'static) {
        self.inner.quit_hooks.borrow_mut().push(Box::new(hook));
    }

    /// Ask the host to exit with `code`. Hooks run on the first call only.
    pub fn quit(&self, code: i32) {
        if self.inner.exit.get().is_some() {
            return;
        }
        log::info!("host quitting with status {code}");
        self.inner.exit.set(Some(code));
        let hooks = std::mem::take(&mut *self.inner.quit_hooks.borrow_mut());
        for hook in hooks {
            hook();
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.inner.exit.get()
    }

    pub fn should_quit(&self) -> bool {
        self.inner.exit.get().is_some()
    }

    fn dispatch(&self, mut posted: Posted) {
        let receiver = self.inner.receivers.borrow().get(posted.target.index()).cloned();
        let Some(receiver) = receiver else {
            log::warn!(
                "dropping event {} for unknown receiver {:?}",
                posted.event.kind(),
                posted.target
            );
            return;
        };
        self.inner.delivered.set(self.inner.delivered.get() + 1);
        if !receiver.event(posted.event.as_mut()) {
            log::debug!("event {} not handled by {:?}", posted.event.kind(), posted.target);
        }
    }
}

impl HostLoop for QueueHost {
    fn register(&self, receiver: Rc<dyn EventReceiver>) -> ReceiverId {
        let mut receivers = self.inner.receivers.borrow_mut();
        receivers.push(receiver);
        ReceiverId::new(receivers.len() - 1)
    }

    fn post(&self, target: ReceiverId, event: Box<dyn HostEvent>) {
        self.inner
            .queue
            .borrow_mut()
            .push_back(Posted { target, event });
    }

    fn run(&self) -> HostExit {
        loop {
            if let Some(code) = self.exit_code() {
                return HostExit::Quit(code);
            }
            let now = Instant::now();
            if self.process_due(now) > 0 {
                continue;
            }
            match self.next_deadline() {
                Some(deadline) => thread::sleep(deadline.saturating_duration_since(now)),
                None if self.pending() == 0 => return HostExit::Drained,
                None => {}
            }
        }
    }
}

fn is_due(posted: &Posted, now: Instant) -> bool {
    posted.event.not_before().map_or(true, |at| at <= now)
}
