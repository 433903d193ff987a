#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod error;
mod graph;
#[cfg(feature = "logging")]
mod logging;
mod options;
mod plan;
mod runner;
mod work;

pub use crate::error::{CompletionDropped, RunnerError, TaskError};
pub use crate::graph::Dependencies;
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::options::{FailHook, Options, RunnerBuilder, StartHook, TaskHook};
pub use crate::runner::Runner;
pub use crate::work::{Completion, Output, Results, Shape, Work};
