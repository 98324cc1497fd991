//! Application-level orchestration.
//!
//! Stage runners gate operator selections on the registry and apply the
//! pipeline engine's patches; the controller owns the command loop the UI
//! talks to. UI/CLI layers call into this module to keep responsibilities
//! separated.

mod controller;
mod stages;

#[cfg(feature = "tui")]
pub(crate) use controller::{run_controller, ConsoleCommand, RunTemplate};
pub use stages::Pipeline;
