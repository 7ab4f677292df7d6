use std::{io, path::PathBuf};

use x11rb::errors::{ConnectError, ConnectionError, ReplyError, ReplyOrIdError};

pub type Result<T, E = ManagerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("cannot open display: {0}")]
    Connect(#[from] ConnectError),

    /// The display connection itself broke. Always fatal.
    #[error("display connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("display request failed: {0}")]
    Reply(#[from] ReplyError),

    #[error("display request failed: {0}")]
    ReplyOrId(#[from] ReplyOrIdError),

    #[error("another window manager seems to be running")]
    RootClaimed,

    #[error("event loop: {0}")]
    EventLoop(String),

    #[error("config {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("snapshot {path}: {message}")]
    Snapshot { path: PathBuf, message: String },

    #[error("channel fd {fd}: {message}")]
    Channel { fd: i32, message: String },

    #[error("ipc: {0}")]
    Ipc(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ManagerError {
    /// True when the error means the X connection is gone and nothing else
    /// can be done on it.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            ManagerError::Connection(_) => true,
            ManagerError::Reply(ReplyError::ConnectionError(_)) => true,
            ManagerError::ReplyOrId(ReplyOrIdError::ConnectionError(_)) => true,
            _ => false,
        }
    }
}
