use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Default, Parser)]
#[command(
    name = "kestrel",
    about = "A tiling window manager for X11",
    disable_version_flag = true,
    args_override_self = true,
    after_help = "Plain words after the options are sent as one command to a running \
                  kestrel, e.g. `kestrel restart`."
)]
pub struct Cli {
    /// Use the provided config file instead of the default one.
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Disable autostart (`exec` lines in the config).
    #[arg(short = 'a', long = "no-autostart")]
    pub no_autostart: bool,

    /// Restore the layout from FILE and keep the file.
    #[arg(short = 'L', long = "layout", value_name = "FILE")]
    pub layout: Option<PathBuf>,

    /// Restore the layout from FILE and delete it afterwards. Passed by
    /// in-place restarts.
    #[arg(long = "restart", value_name = "FILE")]
    pub restart: Option<PathBuf>,

    /// Enable verbose (debug) logging.
    #[arg(short = 'V', long = "verbose")]
    pub verbose: bool,

    /// Enable trace logging.
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Limit the shared diagnostic log to this many bytes. 0 disables it.
    #[arg(long = "shmlog-size", alias = "shmlog_size", value_name = "BYTES")]
    pub shmlog_size: Option<u64>,

    /// Accepted for compatibility. Crash handlers are always installed.
    #[arg(long = "disable-signalhandler")]
    pub disable_signalhandler: bool,

    /// Print the version and exit.
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    /// Print the version of this binary and of the running instance.
    #[arg(short = 'm', long = "more-version", aliases = ["moreversion", "more_version"])]
    pub more_version: bool,

    /// Print the IPC socket path of the running instance and exit.
    #[arg(long = "get-socketpath", alias = "get_socketpath")]
    pub get_socketpath: bool,

    /// Command to send to a running instance.
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    /// Snapshot to restore and whether it is ours to delete. `--restart`
    /// wins over `-L`.
    pub fn snapshot(&self) -> Option<(PathBuf, bool)> {
        if let Some(path) = &self.restart {
            return Some((path.clone(), true));
        }
        self.layout.clone().map(|path| (path, false))
    }
}

pub fn version_line() -> String {
    format!("kestrel version {}", env!("CARGO_PKG_VERSION"))
}
