/// Error types
/// Structural failures the engine surfaces to its caller. Transient conditions
/// (writes to exited sessions, empty process listings) never reach this type.

use crate::models::TabId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TerminalError {
    /// The pseudo-terminal capability could not be loaded at all
    #[error("terminal unavailable: {0}")]
    PtyUnavailable(String),

    /// Every candidate of the shell fallback chain was missing
    #[error("no usable shell found (tried: {})", tried.join(", "))]
    NoShell { tried: Vec<String> },

    #[error("failed to spawn shell: {0}")]
    Spawn(String),

    /// Creating another tab would exceed the configured cap
    #[error("maximum of {max} terminal tabs reached")]
    TabLimit { max: usize },

    #[error("unknown terminal tab {0}")]
    UnknownTab(TabId),

    /// Reconnect requested for a tab whose session is still alive
    #[error("terminal tab {0} is not closed")]
    NotReconnectable(TabId),

    /// A command was sent while no live tab is active
    #[error("no active terminal session")]
    NoActiveSession,

    #[error("process listing failed: {0}")]
    ProcessList(String),

    /// The coordinator task is gone (host shut down)
    #[error("terminal service stopped")]
    ServiceStopped,
}

impl From<TerminalError> for String {
    fn from(err: TerminalError) -> Self {
        err.to_string()
    }
}

pub type Result<T> = std::result::Result<T, TerminalError>;
