//! ckrebalance Remote Operations
//!
//! Everything that talks to a shard host:
//! - [`ConnectionManager`]: per-host ClickHouse connection pools
//! - [`SshSession`]: password-authenticated SSH sessions with sudo prompt
//!   interception
//! - [`Script`]: command wrapping and output isolation

pub mod error;
pub mod pool;
pub mod script;
pub mod ssh;

pub use error::{RemoteError, Result};
pub use pool::{ConnectionManager, DbCredentials, PoolConfig};
pub use script::Script;
pub use ssh::{remote_execute, PromptScanner, SessionEvent, SshOptions, SshSession};
