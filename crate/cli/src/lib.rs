pub mod actions;
pub mod config;
pub mod error;
pub mod output;

mod commands;
pub use commands::{Cli, CliCommands, ckmgmt_main, normalize_args};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic_in_result_fn)]
mod tests;
