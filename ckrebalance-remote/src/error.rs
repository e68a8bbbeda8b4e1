//! Remote operation errors

use thiserror::Error;

/// Errors raised while talking to a shard host
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] clickhouse_rs::errors::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("Invalid connection URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Authentication rejected for {user}@{host}")]
    AuthenticationFailed { user: String, host: String },

    #[error("sudo kept asking for a password on {0}")]
    SudoRejected(String),

    #[error("Timed out connecting to {0}")]
    Timeout(String),

    #[error("No connection pool registered for {0}")]
    UnknownHost(String),

    #[error("Command exited with status {status}: {output}")]
    CommandFailed { status: u32, output: String },

    #[error("Session closed before the command reported an exit status")]
    NoExitStatus,
}

pub type Result<T> = std::result::Result<T, RemoteError>;
