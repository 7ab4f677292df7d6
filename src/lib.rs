pub mod capabilities;
pub mod channels;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod ipc;
pub mod lifecycle;
pub mod reactor;
pub mod reconcile;
pub mod restart;
pub mod signals;
pub mod state;
pub mod tree;
pub mod x11;

pub use errors::{ManagerError, Result};
pub use state::Manager;
