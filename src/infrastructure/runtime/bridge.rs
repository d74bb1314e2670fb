//! Runtime bridge - runs a guest scheduler in bursts inside a host event loop
//!
//! The bridge starts a run by spawning the configured entry point on the guest
//! scheduler and running one burst. At the end of every burst a boundary callback
//! stops the scheduler and posts a single [`ReentryToken`] to the host; when the
//! host delivers it, the next burst runs. Host turns and guest bursts therefore
//! strictly alternate, and at most one token is ever outstanding.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::{Rc, Weak};
use std::time::Instant;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use thiserror::Error;

use crate::infrastructure::host::{HostLoop, ReceiverId, ReentryReceiver, ReentryToken};
use crate::infrastructure::runtime::scheduler::{panic_message, BurstControl, GuestScheduler};

/// Lifecycle of the current guest run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// No run has been started yet
    Idle,
    /// A burst is executing
    Running,
    /// A re-entry token is waiting in the host queue
    AwaitingReentry,
    /// The last run finished; `start` begins a new one
    Done,
}

impl BridgeState {
    pub fn label(&self) -> &'static str {
        match self {
            BridgeState::Idle => "idle",
            BridgeState::Running => "running",
            BridgeState::AwaitingReentry => "awaiting re-entry",
            BridgeState::Done => "done",
        }
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a run reached `Done`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// No guest tasks were left
    Drained,
    /// The completion signal was delivered
    Signalled,
    /// The burst limit was hit
    BurstLimit,
    /// The bridge was shut down
    Shutdown,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("no entry point configured for the guest run")]
    MissingEntryPoint,
    #[error("a guest run is already active ({state})")]
    AlreadyRunning { state: BridgeState },
    #[error("bridge has been shut down")]
    ShutDown,
}

/// Tunables for the bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeSettings {
    /// End a run after this many bursts; `None` never gives up
    pub max_bursts: Option<u64>,
}

/// Counters exposed for status displays and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    pub state: BridgeState,
    pub run: u64,
    pub bursts: u64,
    pub total_bursts: u64,
    pub tokens_posted: u64,
    pub token_outstanding: bool,
    pub last_end: Option<RunEnd>,
}

#[derive(Debug, Default)]
struct RunFlag {
    run: Cell<u64>,
    done: Cell<bool>,
}

/// Completion signal bound to one run; signals for older runs are ignored
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    flag: Rc<RunFlag>,
    run: u64,
}

impl CompletionHandle {
    /// Report the run as finished. Idempotent.
    pub fn complete(&self) {
        if self.flag.run.get() == self.run && !self.flag.done.get() {
            log::debug!("guest run {} signalled complete", self.run);
            self.flag.done.set(true);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.flag.run.get() != self.run || self.flag.done.get()
    }

    pub fn run(&self) -> u64 {
        self.run
    }
}

/// Everything the entry point receives for one run
#[derive(Clone)]
pub struct RunContext<A> {
    pub app: A,
    pub completion: CompletionHandle,
    pub run: u64,
}

/// Root task factory for a guest run
pub type EntryPoint<A> = Rc<dyn Fn(RunContext<A>) -> LocalBoxFuture<'static, anyhow::Result<()>>>;

struct Shared<S, A> {
    scheduler: RefCell<S>,
    host: Rc<dyn HostLoop>,
    receiver: ReceiverId,
    app: A,
    entry: RefCell<Option<EntryPoint<A>>>,
    settings: BridgeSettings,
    state: Cell<BridgeState>,
    flag: Rc<RunFlag>,
    token_outstanding: Cell<bool>,
    bursts: Cell<u64>,
    total_bursts: Cell<u64>,
    tokens_posted: Cell<u64>,
    last_end: Cell<Option<RunEnd>>,
    cancel_pending: Cell<bool>,
    shut_down: Cell<bool>,
    this: Weak<Shared<S, A>>,
}

/// Drives a guest scheduler in bursts between host turns.
/// Clones share the same bridge.
pub struct Bridge<S, A> {
    shared: Rc<Shared<S, A>>,
}

impl<S, A> Clone for Bridge<S, A> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S, A> Bridge<S, A>
where
    S: GuestScheduler + 'static,
    A: Clone + 'static,
{
    pub fn new(host: Rc<dyn HostLoop>, scheduler: S, app: A) -> Self {
        Self::with_settings(host, scheduler, app, BridgeSettings::default())
    }

    pub fn with_settings(
        host: Rc<dyn HostLoop>,
        scheduler: S,
        app: A,
        settings: BridgeSettings,
    ) -> Self {
        let receiver = host.register(Rc::new(ReentryReceiver::new()));
        let shared = Rc::new_cyclic(|this| Shared {
            scheduler: RefCell::new(scheduler),
            host,
            receiver,
            app,
            entry: RefCell::new(None),
            settings,
            state: Cell::new(BridgeState::Idle),
            flag: Rc::new(RunFlag::default()),
            token_outstanding: Cell::new(false),
            bursts: Cell::new(0),
            total_bursts: Cell::new(0),
            tokens_posted: Cell::new(0),
            last_end: Cell::new(None),
            cancel_pending: Cell::new(false),
            shut_down: Cell::new(false),
            this: this.clone(),
        });
        Self { shared }
    }

    /// Set the procedure spawned as the root task of every run
    pub fn configure<F, Fut>(&self, entry: F)
    where
        F: Fn(RunContext<A>) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        let entry: EntryPoint<A> = Rc::new(move |ctx| entry(ctx).boxed_local());
        *self.shared.entry.borrow_mut() = Some(entry);
    }

    pub fn is_configured(&self) -> bool {
        self.shared.entry.borrow().is_some()
    }

    /// Begin a new guest run and execute its first burst
    pub fn start(&self) -> Result<(), BridgeError> {
        self.shared.start()
    }

    /// Completion signal for the current run
    pub fn complete(&self) {
        self.completion().complete();
    }

    pub fn completion(&self) -> CompletionHandle {
        self.shared.completion()
    }

    /// Cancel all guest work and refuse further runs.
    /// Returns the number of guest tasks dropped.
    pub fn shutdown(&self) -> usize {
        self.shared.shutdown()
    }

    pub fn state(&self) -> BridgeState {
        self.shared.state.get()
    }

    pub fn stats(&self) -> BridgeStats {
        let shared = &self.shared;
        BridgeStats {
            state: shared.state.get(),
            run: shared.flag.run.get(),
            bursts: shared.bursts.get(),
            total_bursts: shared.total_bursts.get(),
            tokens_posted: shared.tokens_posted.get(),
            token_outstanding: shared.token_outstanding.get(),
            last_end: shared.last_end.get(),
        }
    }

    pub fn app(&self) -> &A {
        &self.shared.app
    }
}

impl<S, A> Shared<S, A>
where
    S: GuestScheduler + 'static,
    A: Clone + 'static,
{
    fn completion(&self) -> CompletionHandle {
        CompletionHandle {
            flag: self.flag.clone(),
            run: self.flag.run.get(),
        }
    }

    fn run_complete(&self) -> bool {
        self.flag.done.get()
    }

    fn start(&self) -> Result<(), BridgeError> {
        let entry = self
            .entry
            .borrow()
            .clone()
            .ok_or(BridgeError::MissingEntryPoint)?;
        if self.shut_down.get() {
            return Err(BridgeError::ShutDown);
        }

        let state = self.state.get();
        let active = match state {
            BridgeState::Running => true,
            BridgeState::AwaitingReentry => !self.run_complete(),
            BridgeState::Idle | BridgeState::Done => false,
        };
        if active {
            return Err(BridgeError::AlreadyRunning { state });
        }

        let run = self.flag.run.get() + 1;
        self.flag.run.set(run);
        self.flag.done.set(false);
        self.bursts.set(0);
        self.last_end.set(None);

        let root = self.root_task(&entry, run);
        {
            let mut scheduler = self.scheduler.borrow_mut();
            let leftover = scheduler.cancel_all();
            if leftover > 0 {
                log::debug!("dropped {leftover} guest tasks left from the previous run");
            }
            scheduler.spawn(root);
        }

        if self.token_outstanding.get() {
            // The previous run's token is still queued; its delivery runs our first burst
            log::debug!("guest run {run} armed behind the outstanding re-entry token");
            self.state.set(BridgeState::AwaitingReentry);
            return Ok(());
        }

        log::debug!("guest run {run} starting");
        self.burst();
        Ok(())
    }

    fn root_task(&self, entry: &EntryPoint<A>, run: u64) -> LocalBoxFuture<'static, ()> {
        let completion = self.completion();
        let task = entry(RunContext {
            app: self.app.clone(),
            completion: completion.clone(),
            run,
        });
        async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => log::debug!("guest run {run}: entry point returned"),
                Ok(Err(err)) => {
                    log::error!("guest run {run} failed: {err:?}");
                    completion.complete();
                }
                Err(panic) => {
                    log::error!("guest run {run} panicked: {}", panic_message(&*panic));
                    completion.complete();
                }
            }
        }
        .boxed_local()
    }

    /// Continuation carried by every re-entry token
    fn resume(&self) {
        self.token_outstanding.set(false);
        if self.run_complete() {
            if self.state.get() != BridgeState::Done {
                self.finish(RunEnd::Signalled);
            }
            return;
        }
        self.burst();
    }

    fn burst(&self) {
        self.state.set(BridgeState::Running);
        self.bursts.set(self.bursts.get() + 1);
        self.total_bursts.set(self.total_bursts.get() + 1);

        let this = self.this.clone();
        let report = {
            let mut scheduler = self.scheduler.borrow_mut();
            scheduler.call_at_boundary(Box::new(move |ctl: &mut dyn BurstControl| {
                if let Some(shared) = this.upgrade() {
                    shared.on_burst_boundary(ctl);
                }
            }));
            scheduler.run_until_idle()
        };
        log::trace!(
            "burst {} finished: {} iterations, {} polls",
            self.bursts.get(),
            report.iterations,
            report.polled
        );

        if self.state.get() == BridgeState::Running {
            // The boundary callback did not get to run; judge the burst ourselves
            let live = self.scheduler.borrow().live_tasks();
            if live == 0 {
                self.finish(RunEnd::Drained);
            } else {
                let wakeup = self.scheduler.borrow().next_wakeup();
                self.post_token(wakeup);
            }
        }
        if self.cancel_pending.replace(false) {
            self.cancel_tasks();
        }
    }

    fn on_burst_boundary(&self, ctl: &mut dyn BurstControl) {
        ctl.stop();

        if self.run_complete() {
            if self.state.get() != BridgeState::Done {
                self.finish(RunEnd::Signalled);
            }
            return;
        }
        if ctl.live_tasks() == 0 {
            self.finish(RunEnd::Drained);
            return;
        }
        if let Some(limit) = self.settings.max_bursts {
            if self.bursts.get() >= limit {
                log::warn!(
                    "guest run {} hit the burst limit ({limit}); giving up on {} tasks",
                    self.flag.run.get(),
                    ctl.live_tasks()
                );
                self.finish(RunEnd::BurstLimit);
                return;
            }
        }

        let wakeup = if ctl.has_ready() {
            None
        } else {
            ctl.next_wakeup()
        };
        self.post_token(wakeup);
    }

    fn post_token(&self, not_before: Option<Instant>) {
        if self.token_outstanding.get() {
            log::warn!("re-entry token already outstanding; not posting another");
            self.state.set(BridgeState::AwaitingReentry);
            return;
        }
        let this = self.this.clone();
        let token = ReentryToken::new(Box::new(move || {
            if let Some(shared) = this.upgrade() {
                shared.resume();
            }
        }))
        .deliver_after(not_before);

        self.token_outstanding.set(true);
        self.tokens_posted.set(self.tokens_posted.get() + 1);
        self.state.set(BridgeState::AwaitingReentry);
        log::trace!("posting re-entry token #{}", self.tokens_posted.get());
        self.host.post(self.receiver, Box::new(token));
    }

    fn finish(&self, end: RunEnd) {
        self.flag.done.set(true);
        self.state.set(BridgeState::Done);
        self.last_end.set(Some(end));
        log::debug!(
            "guest run {} done ({end:?}) after {} bursts",
            self.flag.run.get(),
            self.bursts.get()
        );
        if end != RunEnd::Drained {
            self.cancel_tasks();
        }
    }

    /// Drop leftover guest tasks, deferring to the end of the burst when one is running
    fn cancel_tasks(&self) {
        match self.scheduler.try_borrow_mut() {
            Ok(mut scheduler) => {
                let dropped = scheduler.cancel_all();
                if dropped > 0 {
                    log::debug!("cancelled {dropped} guest tasks");
                }
            }
            Err(_) => self.cancel_pending.set(true),
        }
    }

    fn shutdown(&self) -> usize {
        if self.shut_down.replace(true) {
            return 0;
        }
        log::info!("shutting down guest scheduler");
        self.flag.done.set(true);
        if self.state.get() != BridgeState::Idle {
            self.state.set(BridgeState::Done);
            self.last_end.set(Some(RunEnd::Shutdown));
        }
        match self.scheduler.try_borrow_mut() {
            Ok(mut scheduler) => scheduler.cancel_all(),
            Err(_) => {
                self.cancel_pending.set(true);
                0
            }
        }
    }
}
