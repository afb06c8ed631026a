//! Command-line errors

use thiserror::Error;

/// Problems with the command line itself. Everything past parsing is
/// reported through the library errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    #[error("flag {0} needs a value")]
    MissingValue(String),

    #[error("{0} needs a setting name")]
    MissingSetting(String),
}

pub type Result<T> = std::result::Result<T, Error>;
