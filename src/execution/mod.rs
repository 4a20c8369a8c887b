//! Execution of dataset jobs against the external dataset tool.
//!
//! The worker pool only sees the [`ExecutionAdapter`] trait; the production
//! implementation shells out to the configured CLI tools.

mod adapter;
mod command_adapter;
mod outcome;

pub use adapter::{ExecutionAdapter, ExecutionError, ExecutionRequest};
pub use command_adapter::{render_command, CliToolAdapter};
pub use outcome::classify_failure;
