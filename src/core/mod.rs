pub mod action;
pub mod module;

pub use action::{Action, NotifyLevel};
pub use module::Module;
