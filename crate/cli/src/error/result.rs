use std::fmt::Display;

use super::CliError;

pub type CliResult<R> = Result<R, CliError>;

/// Attach a configuration context to errors raised while reading the
/// configuration, so they are never mistaken for module failures.
pub trait CliResultHelper<T> {
    /// # Errors
    ///
    /// Returns `CliError::Configuration` with the context prepended.
    fn config_context<D, O>(self, op: O) -> CliResult<T>
    where
        D: Display,
        O: FnOnce() -> D;
}

impl<T, E> CliResultHelper<T> for Result<T, E>
where
    E: std::error::Error,
{
    fn config_context<D, O>(self, op: O) -> CliResult<T>
    where
        D: Display,
        O: FnOnce() -> D,
    {
        self.map_err(|e| CliError::Configuration(format!("{}: {e}", op())))
    }
}

impl<T> CliResultHelper<T> for Option<T> {
    fn config_context<D, O>(self, op: O) -> CliResult<T>
    where
        D: Display,
        O: FnOnce() -> D,
    {
        self.ok_or_else(|| CliError::Configuration(op().to_string()))
    }
}
