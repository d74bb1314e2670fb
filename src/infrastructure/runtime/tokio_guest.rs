//! Tokio guest - a current-thread runtime and `LocalSet` driven in bursts
//!
//! Each iteration drives the `LocalSet` for one tick, which also polls the
//! runtime's timer and IO drivers once, then runs the queued boundary callbacks.
//!
//! Tokio keeps its run queue and timer wheel private, so every spawned task is
//! wrapped to record wake-ups. A burst after which no task was woken reports
//! nothing ready and asks to be resumed after [`IDLE_POLL`].

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::LocalBoxFuture;
use futures::task::{waker, ArcWake};
use tokio::runtime::{Builder, Runtime};
use tokio::task::{JoinHandle, LocalSet};

use super::scheduler::{BoundaryCallback, BurstControl, BurstReport, GuestScheduler};

/// How long an idle guest lets the host wait before polling tokio's drivers again
pub const IDLE_POLL: Duration = Duration::from_millis(10);

/// Forwards to tokio's waker and notes that some guest task became ready
struct FlagWaker {
    woken: Arc<AtomicBool>,
    inner: Waker,
}

impl ArcWake for FlagWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, Ordering::Release);
        arc_self.inner.wake_by_ref();
    }
}

struct Tracked {
    task: LocalBoxFuture<'static, ()>,
    woken: Arc<AtomicBool>,
}

impl Future for Tracked {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let flag_waker = waker(Arc::new(FlagWaker {
            woken: self.woken.clone(),
            inner: cx.waker().clone(),
        }));
        let mut cx = Context::from_waker(&flag_waker);
        self.task.as_mut().poll(&mut cx)
    }
}

pub struct TokioGuest {
    runtime: Runtime,
    local: LocalSet,
    handles: Vec<JoinHandle<()>>,
    boundary: VecDeque<BoundaryCallback>,
    woken: Arc<AtomicBool>,
}

impl TokioGuest {
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            runtime,
            local: LocalSet::new(),
            handles: Vec::new(),
            boundary: VecDeque::new(),
            woken: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Drive the `LocalSet` once; returns whether a task was woken meanwhile
    fn tick(&mut self) -> bool {
        self.woken.store(false, Ordering::Release);
        self.local.block_on(&self.runtime, tokio::task::yield_now());
        self.handles.retain(|handle| !handle.is_finished());
        self.woken.load(Ordering::Acquire)
    }

    fn wakeup_hint(&self, woken: bool) -> Option<Instant> {
        if woken || self.handles.is_empty() {
            None
        } else {
            Some(Instant::now() + IDLE_POLL)
        }
    }
}

impl fmt::Debug for TokioGuest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioGuest")
            .field("tasks", &self.handles.len())
            .field("boundary_callbacks", &self.boundary.len())
            .finish()
    }
}

struct Control<'a> {
    handles: &'a [JoinHandle<()>],
    woken: bool,
    wakeup: Option<Instant>,
    stop: bool,
}

impl BurstControl for Control<'_> {
    fn stop(&mut self) {
        self.stop = true;
    }

    fn live_tasks(&self) -> usize {
        self.handles.len()
    }

    fn has_ready(&self) -> bool {
        self.woken && !self.handles.is_empty()
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.wakeup
    }
}

impl GuestScheduler for TokioGuest {
    fn spawn(&mut self, task: LocalBoxFuture<'static, ()>) {
        let task = Tracked {
            task,
            woken: self.woken.clone(),
        };
        self.handles.push(self.local.spawn_local(task));
    }

    fn call_at_boundary(&mut self, callback: BoundaryCallback) {
        self.boundary.push_back(callback);
    }

    fn run_until_idle(&mut self) -> BurstReport {
        let mut report = BurstReport::default();
        loop {
            let callbacks = std::mem::take(&mut self.boundary);
            let woken = self.tick();
            report.iterations += 1;

            let wakeup = self.wakeup_hint(woken);
            let mut control = Control {
                handles: &self.handles,
                woken,
                wakeup,
                stop: false,
            };
            for callback in callbacks {
                callback(&mut control);
            }
            if control.stop {
                report.stopped = true;
                return report;
            }
            if self.boundary.is_empty() {
                return report;
            }
        }
    }

    fn live_tasks(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    fn cancel_all(&mut self) -> usize {
        let handles = std::mem::take(&mut self.handles);
        let count = handles.iter().filter(|h| !h.is_finished()).count();
        for handle in &handles {
            handle.abort();
        }
        // Let the LocalSet drop the aborted futures
        self.local.block_on(&self.runtime, tokio::task::yield_now());
        count
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.wakeup_hint(self.woken.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn test_runs_local_tasks() {
        let mut guest = TokioGuest::new().expect("runtime");
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        guest.spawn(Box::pin(async move { counter.set(counter.get() + 1) }));

        guest.run_until_idle();
        assert_eq!(hits.get(), 1);
        assert_eq!(guest.live_tasks(), 0);
    }

    #[test]
    fn test_boundary_stop() {
        let mut guest = TokioGuest::new().expect("runtime");
        guest.spawn(Box::pin(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }));
        let live = Rc::new(Cell::new(0));
        let slot = live.clone();
        guest.call_at_boundary(Box::new(move |ctl: &mut dyn BurstControl| {
            slot.set(ctl.live_tasks());
            ctl.stop();
        }));

        let report = guest.run_until_idle();
        assert!(report.stopped);
        assert_eq!(live.get(), 1);
        assert_eq!(guest.cancel_all(), 1);
        assert_eq!(guest.live_tasks(), 0);
    }

    #[test]
    fn test_timer_wait_reports_nothing_ready() {
        let mut guest = TokioGuest::new().expect("runtime");
        guest.spawn(Box::pin(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }));
        let seen = Rc::new(Cell::new(None));
        let slot = seen.clone();
        guest.call_at_boundary(Box::new(move |ctl: &mut dyn BurstControl| {
            slot.set(Some((ctl.has_ready(), ctl.next_wakeup().is_some())));
            ctl.stop();
        }));

        guest.run_until_idle();
        assert_eq!(seen.get(), Some((false, true)));
        assert!(guest.next_wakeup().is_some());
    }

    #[test]
    fn test_yielding_task_reports_ready() {
        let mut guest = TokioGuest::new().expect("runtime");
        guest.spawn(Box::pin(async {
            for _ in 0..1000 {
                tokio::task::yield_now().await;
            }
        }));
        let seen = Rc::new(Cell::new(None));
        let slot = seen.clone();
        guest.call_at_boundary(Box::new(move |ctl: &mut dyn BurstControl| {
            slot.set(Some((ctl.has_ready(), ctl.next_wakeup())));
            ctl.stop();
        }));

        guest.run_until_idle();
        assert_eq!(seen.get(), Some((true, None)));
        assert_eq!(guest.cancel_all(), 1);
    }
}
