//! Local process execution.
//!
//! Knows how to run a command line and observe it; knows nothing about ssh.

mod probe;
mod progress;
mod runner;

pub use probe::probe_capabilities;
pub use runner::{ProcessRunner, RunnerEvent};
