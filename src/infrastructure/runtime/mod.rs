//! Runtime infrastructure - guest schedulers and the bridge that drives them

mod bridge;
pub mod local;
mod scheduler;
mod tokio_guest;

pub use bridge::{
    Bridge, BridgeError, BridgeSettings, BridgeState, BridgeStats, CompletionHandle, EntryPoint,
    RunContext, RunEnd,
};
pub use local::{LocalScheduler, TaskId};
pub use scheduler::{BoundaryCallback, BurstControl, BurstReport, GuestScheduler};
pub use tokio_guest::TokioGuest;
