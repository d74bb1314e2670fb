//! Run a cooperative guest scheduler in bursts inside a foreign host event loop.
//!
//! The [`Bridge`] owns the guest scheduler. Each burst ends with one re-entry
//! token posted to the host; the next burst only runs when the host delivers it.

pub mod app;
pub mod config;
pub mod core;
pub mod infrastructure;
pub mod ui;

pub use infrastructure::host::{
    EventKind, EventReceiver, HostEvent, HostExit, HostLoop, QueueHost, ReceiverId,
    ReentryReceiver, ReentryToken,
};
pub use infrastructure::runtime::{
    local, BoundaryCallback, Bridge, BridgeError, BridgeSettings, BridgeState, BridgeStats,
    BurstControl, BurstReport, CompletionHandle, EntryPoint, GuestScheduler, LocalScheduler,
    RunContext, RunEnd, TokioGuest,
};
