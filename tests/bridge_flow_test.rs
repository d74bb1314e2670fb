//! End-to-end runs of the bridge against the in-process host loop
//!
//! These drive the host by hand (`turn`) so every guest burst is visible:
//! 1. A run alternates bursts with host turns until the guest drains
//! 2. Misuse fails fast (no entry point, double start, start after shutdown)
//! 3. The completion signal turns the pending re-entry into a no-op
//! 4. A new run starts clean after the previous one finished

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use hostguest::{
    local, Bridge, BridgeError, BridgeSettings, BridgeState, HostExit, HostLoop, LocalScheduler,
    QueueHost, RunContext, RunEnd,
};

type Flag = Rc<Cell<bool>>;

fn bridge_with_flag() -> (QueueHost, Flag, Bridge<LocalScheduler, Flag>) {
    let host = QueueHost::new();
    let flag: Flag = Rc::new(Cell::new(false));
    let bridge = Bridge::new(Rc::new(host.clone()), LocalScheduler::new(), flag.clone());
    (host, flag, bridge)
}

/// Sets its flag when dropped, to observe task cancellation
struct DropFlag(Flag);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

async fn spin_forever(dropped: Flag) -> anyhow::Result<()> {
    let _guard = DropFlag(dropped);
    loop {
        local::yield_now().await;
    }
}

#[test]
fn test_yield_once_then_set_flag() {
    let (host, flag, bridge) = bridge_with_flag();
    bridge.configure(|ctx: RunContext<Flag>| async move {
        local::yield_now().await;
        ctx.app.set(true);
        anyhow::Ok(())
    });

    bridge.start().expect("start");

    // First burst yielded: flag untouched, one token waiting on the host
    assert!(!flag.get());
    assert_eq!(host.pending(), 1);
    assert_eq!(bridge.state(), BridgeState::AwaitingReentry);
    assert!(bridge.stats().token_outstanding);

    // Delivering the token runs the second burst
    assert!(host.turn());
    assert!(flag.get());
    assert_eq!(bridge.state(), BridgeState::Done);
    assert_eq!(host.pending(), 0);

    let stats = bridge.stats();
    assert_eq!(stats.run, 1);
    assert_eq!(stats.bursts, 2);
    assert_eq!(stats.tokens_posted, 1);
    assert!(!stats.token_outstanding);
    assert_eq!(stats.last_end, Some(RunEnd::Drained));
    println!("✓ guest run finished after one re-entry");
}

#[test]
fn test_start_without_entry_point_fails() {
    let (host, _flag, bridge) = bridge_with_flag();

    assert!(!bridge.is_configured());
    assert_eq!(bridge.start(), Err(BridgeError::MissingEntryPoint));
    assert_eq!(bridge.start(), Err(BridgeError::MissingEntryPoint));
    assert_eq!(bridge.state(), BridgeState::Idle);
    assert_eq!(host.pending(), 0);
}

#[test]
fn test_double_start_fails_fast() {
    let (host, _flag, bridge) = bridge_with_flag();
    let dropped: Flag = Rc::new(Cell::new(false));
    let guard = dropped.clone();
    bridge.configure(move |_ctx| spin_forever(guard.clone()));

    bridge.start().expect("first start");
    assert_eq!(
        bridge.start(),
        Err(BridgeError::AlreadyRunning {
            state: BridgeState::AwaitingReentry
        })
    );

    // The rejected start did not touch the running guest
    assert_eq!(host.pending(), 1);
    assert_eq!(bridge.stats().run, 1);
    assert!(!dropped.get());
}

#[test]
fn test_start_from_inside_a_burst_is_rejected() {
    let host = QueueHost::new();
    let slot: Rc<RefCell<Option<Bridge<LocalScheduler, ()>>>> = Rc::new(RefCell::new(None));
    let seen: Rc<RefCell<Option<Result<(), BridgeError>>>> = Rc::new(RefCell::new(None));

    let bridge = Bridge::new(Rc::new(host.clone()), LocalScheduler::new(), ());
    {
        let slot = slot.clone();
        let seen = seen.clone();
        bridge.configure(move |_ctx| {
            let slot = slot.clone();
            let seen = seen.clone();
            async move {
                let result = slot.borrow().as_ref().map(|b| b.start());
                *seen.borrow_mut() = result;
                anyhow::Ok(())
            }
        });
    }
    *slot.borrow_mut() = Some(bridge.clone());

    bridge.start().expect("start");
    assert_eq!(
        *seen.borrow(),
        Some(Err(BridgeError::AlreadyRunning {
            state: BridgeState::Running
        }))
    );
    assert_eq!(bridge.state(), BridgeState::Done);

    // Break the bridge -> entry -> slot -> bridge cycle
    slot.borrow_mut().take();
}

#[test]
fn test_completion_makes_pending_reentry_a_noop() {
    let (host, _flag, bridge) = bridge_with_flag();
    let dropped: Flag = Rc::new(Cell::new(false));
    let guard = dropped.clone();
    bridge.configure(move |_ctx| spin_forever(guard.clone()));

    bridge.start().expect("start");
    assert!(host.turn());
    assert!(host.turn());
    assert_eq!(bridge.stats().bursts, 3);

    bridge.complete();
    assert_eq!(host.pending(), 1);

    // The pending token is delivered but the guest is not restarted
    assert!(host.turn());
    assert_eq!(host.pending(), 0);
    assert_eq!(bridge.state(), BridgeState::Done);
    assert_eq!(bridge.stats().bursts, 3);
    assert_eq!(bridge.stats().last_end, Some(RunEnd::Signalled));
    assert!(dropped.get(), "leftover guest task should be cancelled");
    assert!(!host.turn());
}

#[test]
fn test_completion_signal_is_idempotent() {
    let (host, _flag, bridge) = bridge_with_flag();
    bridge.configure(|ctx: RunContext<Flag>| async move {
        ctx.completion.complete();
        ctx.completion.complete();
        local::yield_now().await;
        ctx.completion.complete();
        anyhow::Ok(())
    });

    bridge.start().expect("start");
    let handle = bridge.completion();
    handle.complete();
    handle.complete();

    assert!(handle.is_complete());
    assert_eq!(bridge.state(), BridgeState::Done);
    assert_eq!(bridge.stats().last_end, Some(RunEnd::Signalled));
    assert_eq!(bridge.stats().tokens_posted, 0);
    assert_eq!(host.pending(), 0);
}

#[test]
fn test_restart_after_done_is_fresh() {
    let (host, flag, bridge) = bridge_with_flag();
    let runs = Rc::new(Cell::new(0u64));
    let seen_runs = runs.clone();
    bridge.configure(move |ctx: RunContext<Flag>| {
        seen_runs.set(ctx.run);
        async move {
            local::yield_now().await;
            ctx.app.set(true);
            ctx.completion.complete();
            anyhow::Ok(())
        }
    });

    bridge.start().expect("first run");
    let first = bridge.completion();
    while host.turn() {}
    assert_eq!(bridge.state(), BridgeState::Done);
    assert!(first.is_complete());

    flag.set(false);
    bridge.start().expect("second run");
    assert_eq!(runs.get(), 2);
    assert_eq!(bridge.stats().run, 2);
    assert_eq!(bridge.stats().bursts, 1);
    assert_eq!(bridge.stats().last_end, None);

    // A signal from the first run does not end the second
    first.complete();
    assert!(!bridge.completion().is_complete());
    assert_eq!(bridge.state(), BridgeState::AwaitingReentry);

    assert!(host.turn());
    assert!(flag.get());
    assert_eq!(bridge.state(), BridgeState::Done);
    assert_eq!(bridge.stats().total_bursts, 4);
}

#[test]
fn test_restart_reuses_outstanding_token() {
    let (host, _flag, bridge) = bridge_with_flag();
    let dropped: Flag = Rc::new(Cell::new(false));
    let guard = dropped.clone();
    bridge.configure(move |_ctx| spin_forever(guard.clone()));

    bridge.start().expect("first run");
    bridge.complete();
    assert_eq!(host.pending(), 1);

    // The old token is still queued: the new run waits behind it
    bridge.start().expect("second run");
    assert_eq!(host.pending(), 1);
    assert_eq!(bridge.state(), BridgeState::AwaitingReentry);
    assert!(dropped.get(), "first run's task is dropped before the second begins");
    assert_eq!(bridge.stats().bursts, 0);

    assert!(host.turn());
    assert_eq!(host.pending(), 1);
    assert_eq!(bridge.stats().run, 2);
    assert_eq!(bridge.stats().bursts, 1);
    assert_eq!(bridge.stats().tokens_posted, 2);
}

#[test]
fn test_burst_limit_ends_run() {
    let host = QueueHost::new();
    let settings = BridgeSettings {
        max_bursts: Some(3),
    };
    let bridge = Bridge::with_settings(Rc::new(host.clone()), LocalScheduler::new(), (), settings);
    let dropped: Flag = Rc::new(Cell::new(false));
    let guard = dropped.clone();
    bridge.configure(move |_ctx| spin_forever(guard.clone()));

    bridge.start().expect("start");
    let mut turns = 0;
    while host.turn() {
        turns += 1;
        assert!(turns < 10, "burst limit not enforced");
    }

    let stats = bridge.stats();
    assert_eq!(turns, 2);
    assert_eq!(stats.bursts, 3);
    assert_eq!(stats.tokens_posted, 2);
    assert_eq!(stats.state, BridgeState::Done);
    assert_eq!(stats.last_end, Some(RunEnd::BurstLimit));
    assert!(dropped.get());
}

#[test]
fn test_task_error_ends_run() {
    let (host, flag, bridge) = bridge_with_flag();
    bridge.configure(|ctx: RunContext<Flag>| async move {
        local::yield_now().await;
        anyhow::ensure!(ctx.app.get(), "flag was never set");
        Ok(())
    });

    bridge.start().expect("start");
    assert!(host.turn());

    assert!(!flag.get());
    assert_eq!(bridge.state(), BridgeState::Done);
    assert_eq!(bridge.stats().last_end, Some(RunEnd::Signalled));
    assert_eq!(host.pending(), 0);
}

async fn explode() -> anyhow::Result<()> {
    local::yield_now().await;
    panic!("guest task exploded");
}

#[test]
fn test_task_panic_is_contained() {
    let (host, _flag, bridge) = bridge_with_flag();
    bridge.configure(|_ctx| explode());

    bridge.start().expect("start");
    assert!(host.turn());

    assert_eq!(bridge.state(), BridgeState::Done);
    assert_eq!(bridge.stats().last_end, Some(RunEnd::Signalled));

    // The bridge is still usable after a failed run
    bridge.start().expect("restart after panic");
    assert_eq!(bridge.stats().run, 2);
}

#[test]
fn test_child_task_panic_is_contained() {
    let (host, flag, bridge) = bridge_with_flag();
    bridge.configure(|ctx: RunContext<Flag>| async move {
        local::spawn(async {
            panic!("child task exploded");
        });
        local::yield_now().await;
        local::yield_now().await;
        ctx.app.set(true);
        anyhow::Ok(())
    });

    bridge.start().expect("start");
    let mut turns = 0;
    while host.turn() {
        turns += 1;
    }

    // The root task outlives its panicking child and the run drains normally
    assert_eq!(turns, 2);
    assert!(flag.get());
    assert_eq!(bridge.state(), BridgeState::Done);
    assert_eq!(bridge.stats().last_end, Some(RunEnd::Drained));

    bridge.start().expect("restart after child panic");
    assert_eq!(bridge.stats().run, 2);
    println!("✓ child panic dropped, host kept turning");
}

#[test]
fn test_shutdown_cancels_guest_work() {
    let (host, _flag, bridge) = bridge_with_flag();
    let dropped: Flag = Rc::new(Cell::new(false));
    let guard = dropped.clone();
    bridge.configure(move |_ctx| spin_forever(guard.clone()));

    bridge.start().expect("start");
    assert_eq!(bridge.shutdown(), 1);
    assert_eq!(bridge.shutdown(), 0);
    assert!(dropped.get());
    assert_eq!(bridge.start(), Err(BridgeError::ShutDown));

    // The stale token is consumed without another burst
    let bursts = bridge.stats().total_bursts;
    assert!(host.turn());
    assert_eq!(bridge.stats().total_bursts, bursts);
    assert_eq!(bridge.state(), BridgeState::Done);
    assert_eq!(bridge.stats().last_end, Some(RunEnd::Shutdown));
}

#[test]
fn test_host_quit_hook_shuts_bridge_down() {
    let (host, _flag, bridge) = bridge_with_flag();
    let dropped: Flag = Rc::new(Cell::new(false));
    let guard = dropped.clone();
    bridge.configure(move |_ctx| spin_forever(guard.clone()));
    {
        let bridge = bridge.clone();
        host.on_about_to_quit(move || {
            bridge.shutdown();
        });
    }

    bridge.start().expect("start");
    host.quit(5);

    assert_eq!(host.run(), HostExit::Quit(5));
    assert!(dropped.get());
    assert_eq!(bridge.state(), BridgeState::Done);
}

#[test]
fn test_sleeping_guest_under_host_run() {
    let (host, flag, bridge) = bridge_with_flag();
    bridge.configure(|ctx: RunContext<Flag>| async move {
        local::sleep(Duration::from_millis(30)).await;
        ctx.app.set(true);
        anyhow::Ok(())
    });

    bridge.start().expect("start");
    assert_eq!(host.run(), HostExit::Drained);

    // The token waited for the timer instead of spinning
    let stats = bridge.stats();
    assert!(flag.get());
    assert_eq!(stats.state, BridgeState::Done);
    assert_eq!(stats.tokens_posted, 1);
    assert_eq!(stats.bursts, 2);
}

#[test]
fn test_entry_point_spawns_children() {
    let (host, flag, bridge) = bridge_with_flag();
    bridge.configure(|ctx: RunContext<Flag>| async move {
        let app = ctx.app.clone();
        local::spawn(async move {
            local::yield_now().await;
            local::yield_now().await;
            app.set(true);
        });
        anyhow::Ok(())
    });

    bridge.start().expect("start");
    // The root returned but its child keeps the run alive
    assert_eq!(bridge.state(), BridgeState::AwaitingReentry);
    while host.turn() {}

    assert!(flag.get());
    assert_eq!(bridge.stats().last_end, Some(RunEnd::Drained));
}
