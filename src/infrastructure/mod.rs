//! Infrastructure layer - the two event loops and the bridge between them
//!
//! This layer contains:
//! - The host side: posted events, re-entry tokens and an in-process host loop
//! - The guest side: the scheduler interface with local and Tokio implementations
//! - The bridge that interleaves guest bursts with host turns

pub mod host;
pub mod runtime;

pub use host::{HostExit, HostLoop, QueueHost};
pub use runtime::{Bridge, BridgeError, BridgeState, GuestScheduler, LocalScheduler, TokioGuest};
