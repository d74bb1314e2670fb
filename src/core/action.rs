//! Actions that modules return to the host loop
//!
//! Input handlers never touch the bridge directly: a guest burst may borrow the
//! application state, so the host loop performs actions after the handler returns.

/// Actions returned by modules to communicate with the host loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// No action needed
    None,

    /// Begin a new guest run
    StartGuest,

    /// Deliver the completion signal to the current guest run
    CompleteRun,

    /// Show notification in status bar
    Notify(String, NotifyLevel),

    /// Request quit
    Quit,
}

/// Notification levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Warn,
    Error,
}
