//! Local scheduler - single-threaded cooperative executor driven in bursts
//!
//! One iteration fires due timers, polls every task that was ready when the
//! iteration began, then runs the boundary callbacks queued before it. Tasks
//! woken during an iteration are polled in the next one.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use futures::future::LocalBoxFuture;
use futures::task::{waker, ArcWake};
use futures::FutureExt;

use super::scheduler::{
    panic_message, BoundaryCallback, BurstControl, BurstReport, GuestScheduler,
};

/// Identifier of a task spawned on a [`LocalScheduler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

type ReadyQueue = Arc<Mutex<VecDeque<TaskId>>>;
type TimerKey = (Instant, u64);

fn lock(queue: &ReadyQueue) -> MutexGuard<'_, VecDeque<TaskId>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pushes its task back on the ready queue; may be fired from any thread
struct TaskWaker {
    id: TaskId,
    ready: ReadyQueue,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let mut queue = lock(&arc_self.ready);
        if !queue.contains(&arc_self.id) {
            queue.push_back(arc_self.id);
        }
    }
}

#[derive(Default)]
struct Core {
    tasks: RefCell<HashMap<TaskId, LocalBoxFuture<'static, ()>>>,
    ready: ReadyQueue,
    timers: RefCell<BTreeMap<TimerKey, Waker>>,
    boundary: RefCell<VecDeque<BoundaryCallback>>,
    next_task: Cell<u64>,
    next_timer: Cell<u64>,
}

impl Core {
    /// A panicking task is logged and dropped; the rest of the loop keeps going
    fn spawn(&self, task: LocalBoxFuture<'static, ()>) -> TaskId {
        let id = TaskId(self.next_task.get());
        self.next_task.set(id.0 + 1);
        let task = async move {
            if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                log::error!("guest task {} panicked: {}", id.0, panic_message(&*panic));
            }
        }
        .boxed_local();
        self.tasks.borrow_mut().insert(id, task);
        lock(&self.ready).push_back(id);
        id
    }

    fn has_ready(&self) -> bool {
        !lock(&self.ready).is_empty()
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.timers.borrow().keys().next().map(|(at, _)| *at)
    }

    fn has_due_timer(&self, now: Instant) -> bool {
        self.next_wakeup().map_or(false, |at| at <= now)
    }

    fn fire_due_timers(&self, now: Instant) {
        let due = {
            let mut timers = self.timers.borrow_mut();
            let later = timers.split_off(&(now, u64::MAX));
            std::mem::replace(&mut *timers, later)
        };
        for (_, waker) in due {
            waker.wake();
        }
    }

    fn register_timer(&self, key: Option<TimerKey>, deadline: Instant, waker: &Waker) -> TimerKey {
        let key = key.unwrap_or_else(|| {
            let seq = self.next_timer.get();
            self.next_timer.set(seq + 1);
            (deadline, seq)
        });
        self.timers.borrow_mut().insert(key, waker.clone());
        key
    }

    fn cancel_timer(&self, key: TimerKey) {
        self.timers.borrow_mut().remove(&key);
    }

    fn poll_task(&self, id: TaskId) -> bool {
        let task = self.tasks.borrow_mut().remove(&id);
        let Some(mut task) = task else {
            // Finished or cancelled since it was woken
            return false;
        };
        let task_waker = waker(Arc::new(TaskWaker {
            id,
            ready: self.ready.clone(),
        }));
        let mut cx = Context::from_waker(&task_waker);
        if task.as_mut().poll(&mut cx).is_pending() {
            self.tasks.borrow_mut().insert(id, task);
        }
        true
    }

    /// Runs one iteration and returns (stopped, tasks polled)
    fn run_once(&self) -> (bool, usize) {
        let callbacks = std::mem::take(&mut *self.boundary.borrow_mut());
        self.fire_due_timers(Instant::now());

        let batch: Vec<TaskId> = lock(&self.ready).drain(..).collect();
        let mut polled = 0;
        for id in batch {
            if self.poll_task(id) {
                polled += 1;
            }
        }

        let mut control = Control { core: self, stop: false };
        for callback in callbacks {
            callback(&mut control);
        }
        (control.stop, polled)
    }

    fn would_block(&self) -> bool {
        !self.has_ready()
            && self.boundary.borrow().is_empty()
            && !self.has_due_timer(Instant::now())
    }
}

struct Control<'a> {
    core: &'a Core,
    stop: bool,
}

impl BurstControl for Control<'_> {
    fn stop(&mut self) {
        self.stop = true;
    }

    fn live_tasks(&self) -> usize {
        self.core.tasks.borrow().len()
    }

    fn has_ready(&self) -> bool {
        self.core.has_ready()
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.core.next_wakeup()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Core>>> = const { RefCell::new(None) };
}

/// Restores the previously installed scheduler on drop, including on unwind
struct EnterGuard {
    prev: Option<Rc<Core>>,
}

impl EnterGuard {
    fn enter(core: &Rc<Core>) -> Self {
        let prev = CURRENT.with(|cell| cell.borrow_mut().replace(core.clone()));
        Self { prev }
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|cell| *cell.borrow_mut() = prev);
    }
}

fn current() -> Option<Rc<Core>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Single-threaded cooperative scheduler with timers
#[derive(Default)]
pub struct LocalScheduler {
    core: Rc<Core>,
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task and return its id
    pub fn spawn_local<F>(&mut self, future: F) -> TaskId
    where
        F: Future<Output = ()> + 'static,
    {
        self.core.spawn(Box::pin(future))
    }

    pub fn pending_timers(&self) -> usize {
        self.core.timers.borrow().len()
    }
}

impl fmt::Debug for LocalScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalScheduler")
            .field("tasks", &self.core.tasks.borrow().len())
            .field("timers", &self.core.timers.borrow().len())
            .field("boundary_callbacks", &self.core.boundary.borrow().len())
            .finish()
    }
}

impl GuestScheduler for LocalScheduler {
    fn spawn(&mut self, task: LocalBoxFuture<'static, ()>) {
        self.core.spawn(task);
    }

    fn call_at_boundary(&mut self, callback: BoundaryCallback) {
        self.core.boundary.borrow_mut().push_back(callback);
    }

    fn run_until_idle(&mut self) -> BurstReport {
        let _guard = EnterGuard::enter(&self.core);
        let mut report = BurstReport::default();
        loop {
            let (stopped, polled) = self.core.run_once();
            report.iterations += 1;
            report.polled += polled;
            if stopped {
                report.stopped = true;
                return report;
            }
            if self.core.would_block() {
                return report;
            }
        }
    }

    fn live_tasks(&self) -> usize {
        self.core.tasks.borrow().len()
    }

    fn cancel_all(&mut self) -> usize {
        let tasks = std::mem::take(&mut *self.core.tasks.borrow_mut());
        lock(&self.core.ready).clear();
        let count = tasks.len();
        // Dropping a task may touch the timer table, so no borrow is held here
        drop(tasks);
        count
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.core.next_wakeup()
    }
}

/// Spawn a task on the guest scheduler running on this thread.
///
/// # Panics
///
/// Panics when called outside a [`LocalScheduler`] burst.
pub fn spawn<F>(future: F) -> TaskId
where
    F: Future<Output = ()> + 'static,
{
    match current() {
        Some(core) => core.spawn(Box::pin(future)),
        None => panic!("spawn() called outside of a guest burst"),
    }
}

/// Future completing once `duration` has elapsed, driven by the guest's timers
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        deadline: Instant::now() + duration,
        timer: None,
    }
}

/// Future yielding once to the guest scheduler before completing
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// See [`sleep`]
#[derive(Debug)]
pub struct Sleep {
    deadline: Instant,
    timer: Option<(Weak<Core>, TimerKey)>,
}

impl Sleep {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn deregister(&mut self) {
        if let Some((core, key)) = self.timer.take() {
            if let Some(core) = core.upgrade() {
                core.cancel_timer(key);
            }
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if Instant::now() >= this.deadline {
            this.deregister();
            return Poll::Ready(());
        }

        let (core, key) = match this.timer.take() {
            Some((weak, key)) => match weak.upgrade() {
                Some(core) => (core, Some(key)),
                None => return Poll::Pending,
            },
            None => match current() {
                Some(core) => (core, None),
                None => panic!("sleep() polled outside of a guest burst"),
            },
        };
        let key = core.register_timer(key, this.deadline, cx.waker());
        this.timer = Some((Rc::downgrade(&core), key));
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.deregister();
    }
}

/// See [`yield_now`]
#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
