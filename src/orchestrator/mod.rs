//! Application-level orchestration.
//!
//! The coordinator owns session state and decides what runs next; the controller owns
//! the coordinator and the running processes. Outcome parsing lives in its own module
//! so it can be tested without either. UI/CLI layers only talk to the controller.

mod controller;
mod coordinator;
mod outcome;

pub(crate) use controller::{run_controller, UiCommand};
pub use coordinator::{CoordinatorSettings, OperationCoordinator};
