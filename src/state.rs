use std::{
    ffi::OsString,
    io::{self, Read, Write},
    os::fd::{AsFd, RawFd},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};

use calloop::{
    Interest, LoopHandle, LoopSignal, Mode, PostAction, RegistrationToken, generic::Generic,
};
use x11rb::protocol::Event;

use crate::{
    ManagerError, Result,
    capabilities::Capabilities,
    channels::{self, ChannelOrigin, ChannelSet, ListenerChannel, SOCKET_ENV},
    cli,
    config::RuntimeConfig,
    diagnostics,
    ipc::{IpcCommand, RESTART_CONFIRMATION},
    lifecycle::{Lifecycle, Phase},
    reactor::{self, ProtocolDispatch, ProtocolGate, ProtocolSource},
    reconcile::Reconcile,
    restart::{self, RestartStage},
    signals::Terminate,
    tree::TreeBox,
    x11::X11Connection,
};

const READ_CHUNK: usize = 1024;

pub struct Manager {
    pub conn: X11Connection,
    pub caps: Capabilities,
    pub channels: ChannelSet,
    pub tree: TreeBox,
    pub lifecycle: Lifecycle,
    pub config: RuntimeConfig,
    pub restart_stage: RestartStage,

    pub loop_handle: LoopHandle<'static, Manager>,
    pub loop_signal: LoopSignal,
    pub exit_code: i32,

    pid: u32,
    start_args: Vec<OsString>,
    gate: ProtocolGate,
    ipc_socket_path: Option<PathBuf>,
    children: Vec<Child>,
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: X11Connection,
        caps: Capabilities,
        tree: TreeBox,
        config: RuntimeConfig,
        lifecycle: Lifecycle,
        loop_handle: LoopHandle<'static, Manager>,
        loop_signal: LoopSignal,
        start_args: Vec<OsString>,
    ) -> Self {
        Self {
            conn,
            caps,
            channels: ChannelSet::new(),
            tree,
            lifecycle,
            config,
            restart_stage: RestartStage::Idle,
            loop_handle,
            loop_signal,
            exit_code: 0,
            pid: std::process::id(),
            start_args,
            gate: ProtocolGate::default(),
            ipc_socket_path: None,
            children: Vec::new(),
        }
    }

    pub fn ipc_socket_path(&self) -> Option<&Path> {
        self.ipc_socket_path.as_deref()
    }

    pub fn watch_protocol(&mut self) -> Result<RegistrationToken> {
        let handle = self.loop_handle.clone();
        let fd = self.conn.watch_fd()?;
        reactor::insert_protocol_source(&handle, self, fd)
    }

    pub fn set_protocol_drain(&mut self, enabled: bool) {
        let handle = self.loop_handle.clone();
        reactor::set_protocol_drain(&handle, self, enabled);
    }

    pub fn setup_ipc(&mut self) {
        let path = channels::resolve_socket_path(
            self.config.ipc_socket_path.as_deref(),
            std::env::var_os(SOCKET_ENV),
            &channels::runtime_dir(),
            self.pid,
        );

        if self.channels.serves_path(&path) {
            tracing::info!(path = %path.display(), "reusing inherited ipc listener");
            self.ipc_socket_path = Some(path);
        } else {
            match channels::create_ipc_listener(&path) {
                Ok(listener) => {
                    tracing::info!(path = %path.display(), "ipc listener initialized");
                    self.channels
                        .add_listener(listener, ChannelOrigin::Local, Some(path.clone()));
                    self.ipc_socket_path = Some(path);
                }
                Err(err) => {
                    tracing::warn!("failed to initialize ipc listener: {err}");
                    self.ipc_socket_path = self.channels.primary_socket_path().map(Path::to_path_buf);
                }
            }
        }

        for fd in self.channels.listener_fds() {
            self.watch_listener(fd);
        }
        for fd in self.channels.client_fds() {
            self.watch_client(fd);
        }

        if let Err(err) = self
            .conn
            .publish_root_atoms(self.ipc_socket_path.as_deref(), self.pid)
        {
            tracing::warn!("failed to publish ipc socket path: {err}");
        }
    }

    fn watch_listener(&mut self, fd: RawFd) {
        let Some(channel) = self.channels.listener(fd) else {
            return;
        };
        let watched = match channels::watch_fd(channel.listener.as_fd()) {
            Ok(watched) => watched,
            Err(err) => {
                tracing::warn!(fd, "cannot watch ipc listener: {err}");
                return;
            }
        };
        let inserted = self.loop_handle.insert_source(
            Generic::new(watched, Interest::READ, Mode::Level),
            move |_, _, state: &mut Manager| {
                state.accept_clients(fd);
                Ok(PostAction::Continue)
            },
        );
        match inserted {
            Ok(token) => {
                if let Some(channel) = self.channels.listener_mut(fd) {
                    channel.token = Some(token);
                }
            }
            Err(err) => tracing::warn!(fd, "failed to watch ipc listener: {err}"),
        }
    }

    fn watch_client(&mut self, fd: RawFd) {
        let Some(channel) = self.channels.client_mut(fd) else {
            return;
        };
        let watched = match channels::watch_fd(channel.stream.as_fd()) {
            Ok(watched) => watched,
            Err(err) => {
                tracing::warn!(fd, "cannot watch ipc client: {err}");
                self.channels.remove_client(fd);
                return;
            }
        };
        let inserted = self.loop_handle.insert_source(
            Generic::new(watched, Interest::READ, Mode::Level),
            move |_, _, state: &mut Manager| Ok(state.service_client(fd)),
        );
        match inserted {
            Ok(token) => {
                if let Some(channel) = self.channels.client_mut(fd) {
                    channel.token = Some(token);
                }
            }
            Err(err) => {
                tracing::warn!(fd, "failed to watch ipc client: {err}");
                self.channels.remove_client(fd);
            }
        }
    }

    fn accept_clients(&mut self, listener_fd: RawFd) {
        loop {
            let Some(channel) = self.channels.listener(listener_fd) else {
                return;
            };
            match channel.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        tracing::warn!("dropping ipc client: {err}");
                        continue;
                    }
                    let fd = self.channels.add_client(stream, ChannelOrigin::Local);
                    tracing::debug!(fd, "ipc client connected");
                    self.watch_client(fd);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    tracing::warn!("ipc accept failed: {err}");
                    break;
                }
            }
        }
    }

    fn service_client(&mut self, fd: RawFd) -> PostAction {
        let mut lines = Vec::new();
        let mut closed = false;
        {
            let Some(client) = self.channels.client_mut(fd) else {
                return PostAction::Remove;
            };
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match client.stream.read(&mut chunk) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(read) => match client.lines.push(&chunk[..read]) {
                        Ok(complete) => lines.extend(complete),
                        Err(message) => {
                            tracing::warn!(fd, "{message}");
                            Self::write_ipc_response(&mut client.stream, &format!("error: {message}"));
                            closed = true;
                            break;
                        }
                    },
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::debug!(fd, "ipc read failed: {err}");
                        closed = true;
                        break;
                    }
                }
            }
        }

        for line in lines {
            self.handle_ipc_line(fd, &line);
        }

        if closed {
            tracing::debug!(fd, "ipc client disconnected");
            self.channels.remove_client(fd);
            return PostAction::Remove;
        }
        PostAction::Continue
    }

    fn write_ipc_response(stream: &mut impl Write, message: &str) {
        if let Err(err) = writeln!(stream, "{message}") {
            tracing::warn!("failed to write ipc response: {err}");
        }
    }

    fn reply(&mut self, fd: RawFd, message: &str) {
        if let Some(client) = self.channels.client_mut(fd) {
            Self::write_ipc_response(&mut client.stream, message);
        }
    }

    fn handle_ipc_line(&mut self, fd: RawFd, line: &str) {
        match line.parse::<IpcCommand>() {
            Ok(IpcCommand::Ping) => self.reply(fd, "pong"),
            Ok(IpcCommand::Version) => self.reply(fd, &cli::version_line()),
            Ok(IpcCommand::Exit) => {
                self.reply(fd, "ok: exiting");
                self.terminate(0);
            }
            Ok(IpcCommand::Restart) => self.request_restart(Some(fd)),
            Err(message) => self.reply(fd, &message),
        }
    }

    pub fn confirm_restart(&mut self, continuation_fd: RawFd) {
        if !self.channels.has_client(continuation_fd) {
            if let Err(err) = self.channels.adopt_client_fd(continuation_fd) {
                tracing::warn!("cannot confirm restart: {err}");
                return;
            }
            self.watch_client(continuation_fd);
        }
        self.reply(continuation_fd, RESTART_CONFIRMATION);
        tracing::info!(fd = continuation_fd, "restart confirmed");
    }

    /// Returns only when a restart is already underway.
    pub fn request_restart(&mut self, requester: Option<RawFd>) {
        if self.restart_stage != RestartStage::Idle {
            tracing::warn!(stage = ?self.restart_stage, "restart already in progress");
            return;
        }
        self.lifecycle.advance(Phase::RestartRequested);
        self.restart_stage = RestartStage::PersistRequested;

        let snapshot = restart::snapshot_path(&channels::runtime_dir(), self.pid);
        let persisted = restart::prepare_snapshot_dir(&snapshot)
            .map_err(ManagerError::from)
            .and_then(|()| self.tree.persist(&snapshot));
        let snapshot = match persisted {
            Ok(()) => {
                tracing::info!(path = %snapshot.display(), "tree persisted for restart");
                Some(snapshot)
            }
            Err(err) => {
                tracing::warn!("restarting without a snapshot: {err}");
                None
            }
        };
        self.restart_stage = RestartStage::Persisted;

        let manifest = self.channels.prepare_handoff();
        let continuation = requester.filter(|&fd| manifest.contains(fd));
        if let Err(err) = self.conn.flush() {
            tracing::warn!("final flush before restart failed: {err}");
        }

        let (program, args) = match restart::next_image(&self.start_args, snapshot.as_deref()) {
            Ok(image) => image,
            Err(err) => fatal(&err),
        };
        self.restart_stage = RestartStage::ReExecuted;
        let err = restart::exec_image(&program, &args, &manifest, continuation);
        fatal(&err);
    }

    fn manage_window(&mut self, window: u32) {
        if self.tree.is_managed(window) {
            return;
        }
        if let Err(err) = self.conn.adopt_window(window) {
            tracing::warn!(window = format_args!("{window:#x}"), "failed to manage window: {err}");
            return;
        }
        self.tree.manage(window);
        tracing::debug!(window = format_args!("{window:#x}"), "window managed");
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::MapRequest(request) => self.manage_window(request.window),
            Event::UnmapNotify(notify) if notify.event == self.conn.root() => {
                if self.tree.unmanage(notify.window) {
                    tracing::debug!(window = format_args!("{:#x}", notify.window), "window unmapped");
                }
            }
            Event::DestroyNotify(notify) => {
                if self.tree.unmanage(notify.window) {
                    tracing::debug!(window = format_args!("{:#x}", notify.window), "window destroyed");
                }
            }
            other => tracing::trace!(event = ?other, "unhandled event"),
        }
    }

    pub fn run_autostart(&mut self, no_autostart: bool) {
        let mut commands = if no_autostart {
            Vec::new()
        } else {
            self.config.autostart.clone()
        };
        commands.extend(self.config.autostart_always.iter().cloned());

        for command in &commands {
            tracing::info!(command, "starting autostart command");
            self.spawn_command(command);
        }
    }

    pub fn spawn_command(&mut self, command: &str) {
        if command.trim().is_empty() {
            return;
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).stdin(Stdio::null());
        if let Some(path) = &self.ipc_socket_path {
            cmd.env(SOCKET_ENV, path);
        }

        match cmd.spawn() {
            Ok(child) => self.children.push(child),
            Err(err) => tracing::warn!(command = %command, "failed to spawn command: {err}"),
        }
    }

    pub fn reap_children(&mut self) {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid = child.id(), %status, "child exited");
                false
            }
            Ok(None) => true,
            Err(err) => {
                tracing::warn!(pid = child.id(), "failed to poll child: {err}");
                false
            }
        });
    }

    pub fn shutdown(mut self) -> i32 {
        self.lifecycle.advance(Phase::ShuttingDown);
        if let Some(token) = self.gate.token() {
            self.loop_handle.remove(token);
        }

        let (listeners, clients) = self.channels.take_all();
        for client in clients {
            if let Some(token) = client.token {
                self.loop_handle.remove(token);
            }
        }
        for listener in &listeners {
            if let Some(token) = listener.token {
                self.loop_handle.remove(token);
            }
        }
        let leftover = restart::snapshot_path(&channels::runtime_dir(), self.pid);
        remove_persisted_state(&listeners, &leftover);

        tracing::info!(exit_code = self.exit_code, "shutting down");
        self.conn.disconnect();
        diagnostics::remove_artifact();
        self.exit_code
    }
}

/// Unlink the socket paths we created and a snapshot left behind by a
/// restart that never happened.
pub fn remove_persisted_state(listeners: &[ListenerChannel], leftover_snapshot: &Path) {
    for listener in listeners {
        if listener.owns_path()
            && let Some(path) = &listener.path
            && let Err(err) = std::fs::remove_file(path)
        {
            tracing::debug!(path = %path.display(), "failed to remove ipc socket: {err}");
        }
    }
    if leftover_snapshot.exists() {
        restart::remove_snapshot(leftover_snapshot);
    }
}

fn fatal(err: &ManagerError) -> ! {
    tracing::error!("fatal: {err}");
    eprintln!("kestrel: {err}");
    diagnostics::remove_artifact();
    std::process::exit(1);
}

impl ProtocolDispatch for Manager {
    type Source = X11Connection;

    fn protocol(&self) -> &X11Connection {
        &self.conn
    }

    fn protocol_gate(&mut self) -> &mut ProtocolGate {
        &mut self.gate
    }

    fn dispatch_event(&mut self, event: Event) {
        self.handle_event(event);
    }

    fn protocol_failed(&mut self, err: ManagerError) {
        fatal(&err);
    }
}

impl Reconcile for Manager {
    type Server = X11Connection;

    fn server(&self) -> &X11Connection {
        &self.conn
    }

    fn is_managed(&self, window: u32) -> bool {
        self.tree.is_managed(window)
    }

    fn claim_window(&mut self, window: u32) -> Result<()> {
        self.conn.adopt_window(window)?;
        self.tree.manage(window);
        Ok(())
    }

    fn honor_map_request(&mut self, event: Event) {
        if let Event::MapRequest(request) = event {
            self.manage_window(request.window);
        }
    }
}

impl Terminate for Manager {
    fn terminate(&mut self, exit_code: i32) {
        self.exit_code = exit_code;
        self.loop_signal.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_removes_owned_sockets_and_leftover_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("ipc.sock");
        let supervised = dir.path().join("activation.sock");

        let mut set = ChannelSet::new();
        set.add_listener(
            channels::create_ipc_listener(&local).unwrap(),
            ChannelOrigin::Local,
            Some(local.clone()),
        );
        set.add_listener(
            channels::create_ipc_listener(&supervised).unwrap(),
            ChannelOrigin::Activation,
            Some(supervised.clone()),
        );

        let snapshot = restart::snapshot_path(dir.path(), 9);
        restart::prepare_snapshot_dir(&snapshot).unwrap();
        std::fs::write(&snapshot, r#"{"version":1,"windows":[]}"#).unwrap();

        let (listeners, clients) = set.take_all();
        assert!(clients.is_empty());
        remove_persisted_state(&listeners, &snapshot);

        assert!(!local.exists());
        assert!(supervised.exists());
        assert!(!snapshot.exists());
        assert!(!snapshot.parent().unwrap().exists());
    }

    #[test]
    fn missing_snapshot_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        remove_persisted_state(&[], &restart::snapshot_path(dir.path(), 10));
        assert!(dir.path().exists());
    }
}
