//! In-place restart: snapshot the tree, re-exec the binary, pick everything
//! back up in the new image.

use std::{
    ffi::{OsStr, OsString},
    fs::{self, DirBuilder},
    io,
    os::{
        fd::RawFd,
        unix::{fs::DirBuilderExt, process::CommandExt},
    },
    path::{Path, PathBuf},
    process::Command,
};

use crate::{
    ManagerError,
    channels::{CHANNELS_ENV, ChannelManifest},
    cli::Cli,
    tree::LayoutTree,
};

pub const RESTART_FD_ENV: &str = "_KESTREL_RESTART_FD";
pub const SNAPSHOT_FILE: &str = "restart-state.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RestartStage {
    Idle,
    PersistRequested,
    Persisted,
    ReExecuted,
}

/// Everything the previous image (or the user) left for this bootstrap.
/// Consumed once.
#[derive(Debug, Default)]
pub struct RestartState {
    pub snapshot: Option<PathBuf>,
    pub delete_after_use: bool,
    pub continuation_fd: Option<RawFd>,
    pub manifest: Option<ChannelManifest>,
}

impl RestartState {
    pub fn from_parts(cli: &Cli, restart_fd: Option<&str>, manifest: Option<&str>) -> Self {
        let (snapshot, delete_after_use) = match cli.snapshot() {
            Some((path, delete)) => (Some(path), delete),
            None => (None, false),
        };
        let manifest = manifest.and_then(|raw| match ChannelManifest::from_env_value(raw) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                tracing::warn!("ignoring inherited channels: {err}");
                None
            }
        });
        Self {
            snapshot,
            delete_after_use,
            continuation_fd: parse_restart_fd(restart_fd),
            manifest,
        }
    }

    /// Must run before any other thread exists.
    pub fn take_from_env(cli: &Cli) -> Self {
        let restart_fd = std::env::var(RESTART_FD_ENV).ok();
        let manifest = std::env::var(CHANNELS_ENV).ok();
        // Safety: called during bootstrap, before any thread is spawned.
        unsafe {
            std::env::remove_var(RESTART_FD_ENV);
            std::env::remove_var(CHANNELS_ENV);
        }
        Self::from_parts(cli, restart_fd.as_deref(), manifest.as_deref())
    }

    pub fn is_restart(&self) -> bool {
        self.continuation_fd.is_some() || self.manifest.is_some()
    }
}

/// A malformed value is logged and treated as absent.
pub fn parse_restart_fd(raw: Option<&str>) -> Option<RawFd> {
    let raw = raw?;
    match raw.trim().parse::<RawFd>() {
        Ok(fd) if fd >= 0 => Some(fd),
        _ => {
            tracing::warn!(value = raw, "ignoring malformed {RESTART_FD_ENV}");
            None
        }
    }
}

pub fn snapshot_path(runtime_dir: &Path, pid: u32) -> PathBuf {
    runtime_dir
        .join(format!("kestrel-restart.{pid}"))
        .join(SNAPSHOT_FILE)
}

pub fn prepare_snapshot_dir(snapshot: &Path) -> io::Result<()> {
    match snapshot.parent() {
        Some(dir) => DirBuilder::new().recursive(true).mode(0o700).create(dir),
        None => Ok(()),
    }
}

/// Restore `tree` from the snapshot, or start it fresh. A snapshot that is
/// ours to delete is removed afterwards either way, together with its
/// directory if that is now empty. Returns whether the snapshot was used.
pub fn consume_snapshot(
    tree: &mut dyn LayoutTree,
    snapshot: Option<&Path>,
    delete_after_use: bool,
) -> bool {
    let Some(path) = snapshot else {
        tree.init_default();
        return false;
    };

    let restored = match tree.restore(path) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!("starting with a fresh tree: {err}");
            tree.init_default();
            false
        }
    };

    if delete_after_use {
        remove_snapshot(path);
    }
    restored
}

pub fn remove_snapshot(path: &Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), "failed to remove snapshot: {err}");
    }
    if let Some(dir) = path.parent()
        && let Err(err) = fs::remove_dir(dir)
    {
        tracing::debug!(dir = %dir.display(), "snapshot directory kept: {err}");
    }
}

/// Arguments for the next image: the original ones without any earlier
/// snapshot or autostart options, then `-a --restart <snapshot>`.
pub fn build_exec_args(original: &[OsString], snapshot: Option<&Path>) -> Vec<OsString> {
    let mut args = Vec::with_capacity(original.len() + 3);
    let mut rest = original.iter().skip(1);
    while let Some(arg) = rest.next() {
        let Some(text) = arg.to_str() else {
            args.push(arg.clone());
            continue;
        };
        match text {
            "--restart" | "-L" | "--layout" => {
                rest.next();
            }
            "-a" | "--no-autostart" => {}
            _ if text.starts_with("--restart=") || text.starts_with("--layout=") => {}
            _ if text.starts_with("-L") && text.len() > 2 => {}
            _ => args.push(arg.clone()),
        }
    }

    args.push("-a".into());
    if let Some(path) = snapshot {
        args.push("--restart".into());
        args.push(path.as_os_str().to_owned());
    }
    args
}

pub fn next_image(
    start_args: &[OsString],
    snapshot: Option<&Path>,
) -> Result<(OsString, Vec<OsString>), ManagerError> {
    let Some(program) = start_args.first() else {
        return Err(ManagerError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            "no argv[0] to re-execute",
        )));
    };
    Ok((program.clone(), build_exec_args(start_args, snapshot)))
}

/// Replace the process image. Only returns if exec failed.
pub fn exec_image(
    program: &OsStr,
    args: &[OsString],
    manifest: &ChannelManifest,
    continuation_fd: Option<RawFd>,
) -> ManagerError {
    let encoded = match manifest.to_env_value() {
        Ok(encoded) => encoded,
        Err(err) => return err,
    };

    let mut command = Command::new(program);
    command.args(args).env(CHANNELS_ENV, encoded);
    match continuation_fd {
        Some(fd) => command.env(RESTART_FD_ENV, fd.to_string()),
        None => command.env_remove(RESTART_FD_ENV),
    };

    tracing::info!(
        program = %program.to_string_lossy(),
        ?args,
        channels = manifest.channels.len(),
        "re-executing"
    );
    let err = command.exec();
    ManagerError::Io(err)
}
