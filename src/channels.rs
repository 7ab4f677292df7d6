//! Every socket the process is responsible for, and how each one survives an
//! exec.
//!
//! A descriptor gets here in one of three ways: bound locally, handed over by
//! a supervisor (socket activation), or inherited from the previous image
//! through the channel manifest. Before an in-place restart every descriptor
//! has close-on-exec cleared and is listed in the manifest; the new image
//! validates each entry before trusting it.

use std::{
    collections::{BTreeMap, HashSet},
    ffi::OsString,
    fs::{self, DirBuilder},
    io,
    mem,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
        unix::{
            fs::DirBuilderExt,
            net::{UnixListener, UnixStream},
        },
    },
    path::{Path, PathBuf},
};

use calloop::RegistrationToken;
use serde::{Deserialize, Serialize};

use crate::{ManagerError, Result, ipc::LineBuffer};

pub const CHANNELS_ENV: &str = "_KESTREL_CHANNELS";
pub const SOCKET_ENV: &str = "KESTRELSOCK";
pub const LISTEN_PID_ENV: &str = "LISTEN_PID";
pub const LISTEN_FDS_ENV: &str = "LISTEN_FDS";

pub const LISTEN_FDS_START: RawFd = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrigin {
    Local,
    Activation,
    Inherited,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    Listener,
    Client,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub fd: RawFd,
    pub role: ChannelRole,
    pub origin: ChannelOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelManifest {
    pub channels: Vec<ChannelEntry>,
}

impl ChannelManifest {
    pub fn to_env_value(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|err| ManagerError::Ipc(format!("failed to encode channel manifest: {err}")))
    }

    pub fn from_env_value(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| ManagerError::Ipc(format!("malformed channel manifest: {err}")))
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.channels.iter().any(|entry| entry.fd == fd)
    }
}

#[derive(Debug)]
pub struct ListenerChannel {
    pub listener: UnixListener,
    pub origin: ChannelOrigin,
    pub path: Option<PathBuf>,
    pub token: Option<RegistrationToken>,
}

impl ListenerChannel {
    /// Supervisor sockets are never unlinked by us.
    pub fn owns_path(&self) -> bool {
        self.origin != ChannelOrigin::Activation && self.path.is_some()
    }
}

#[derive(Debug)]
pub struct ClientChannel {
    pub stream: UnixStream,
    pub origin: ChannelOrigin,
    pub lines: LineBuffer,
    pub token: Option<RegistrationToken>,
}

#[derive(Debug, Default)]
pub struct ChannelSet {
    listeners: BTreeMap<RawFd, ListenerChannel>,
    clients: BTreeMap<RawFd, ClientChannel>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(
        &mut self,
        listener: UnixListener,
        origin: ChannelOrigin,
        path: Option<PathBuf>,
    ) -> RawFd {
        let fd = listener.as_raw_fd();
        self.listeners.insert(
            fd,
            ListenerChannel {
                listener,
                origin,
                path,
                token: None,
            },
        );
        fd
    }

    pub fn add_client(&mut self, stream: UnixStream, origin: ChannelOrigin) -> RawFd {
        let fd = stream.as_raw_fd();
        self.clients.insert(
            fd,
            ClientChannel {
                stream,
                origin,
                lines: LineBuffer::default(),
                token: None,
            },
        );
        fd
    }

    pub fn listener(&self, fd: RawFd) -> Option<&ListenerChannel> {
        self.listeners.get(&fd)
    }

    pub fn listener_mut(&mut self, fd: RawFd) -> Option<&mut ListenerChannel> {
        self.listeners.get_mut(&fd)
    }

    pub fn client_mut(&mut self, fd: RawFd) -> Option<&mut ClientChannel> {
        self.clients.get_mut(&fd)
    }

    pub fn remove_client(&mut self, fd: RawFd) -> Option<ClientChannel> {
        self.clients.remove(&fd)
    }

    pub fn listener_fds(&self) -> Vec<RawFd> {
        self.listeners.keys().copied().collect()
    }

    pub fn client_fds(&self) -> Vec<RawFd> {
        self.clients.keys().copied().collect()
    }

    pub fn has_client(&self, fd: RawFd) -> bool {
        self.clients.contains_key(&fd)
    }

    pub fn serves_path(&self, path: &Path) -> bool {
        self.listeners
            .values()
            .any(|channel| channel.path.as_deref() == Some(path))
    }

    pub fn primary_socket_path(&self) -> Option<&Path> {
        self.listeners
            .values()
            .find_map(|channel| channel.path.as_deref())
    }

    pub fn len(&self) -> usize {
        self.listeners.len() + self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take_all(&mut self) -> (Vec<ListenerChannel>, Vec<ClientChannel>) {
        let listeners = mem::take(&mut self.listeners).into_values().collect();
        let clients = mem::take(&mut self.clients).into_values().collect();
        (listeners, clients)
    }

    /// Clear close-on-exec on every descriptor and describe the ones that
    /// will survive the exec. A descriptor whose flag could not be cleared is
    /// left out, since the kernel closes it anyway.
    pub fn prepare_handoff(&self) -> ChannelManifest {
        let listeners = self.listeners.values().map(|channel| {
            (
                channel.listener.as_fd(),
                ChannelRole::Listener,
                channel.origin,
                channel.path.clone(),
            )
        });
        let clients = self.clients.values().map(|channel| {
            (
                channel.stream.as_fd(),
                ChannelRole::Client,
                channel.origin,
                None,
            )
        });

        let mut manifest = ChannelManifest::default();
        for (fd, role, origin, path) in listeners.chain(clients) {
            if let Err(err) = set_cloexec(fd, false) {
                tracing::warn!(fd = fd.as_raw_fd(), ?role, "channel will not survive restart: {err}");
                continue;
            }
            manifest.channels.push(ChannelEntry {
                fd: fd.as_raw_fd(),
                role,
                origin,
                path,
            });
        }
        tracing::debug!(channels = manifest.channels.len(), "channel manifest prepared");
        manifest
    }

    /// Invalid or duplicate entries are logged and skipped.
    pub fn adopt_manifest(&mut self, manifest: &ChannelManifest) -> usize {
        let mut seen = HashSet::new();
        let mut adopted = 0;
        for entry in &manifest.channels {
            if !seen.insert(entry.fd) || self.owns_fd(entry.fd) {
                tracing::warn!(fd = entry.fd, "duplicate channel manifest entry skipped");
                continue;
            }
            match adopt_entry(entry) {
                Ok(fd) => {
                    self.insert_adopted(entry, fd);
                    adopted += 1;
                }
                Err(err) => tracing::warn!("skipping inherited channel: {err}"),
            }
        }
        tracing::info!(adopted, listed = manifest.channels.len(), "inherited channels adopted");
        adopted
    }

    pub fn adopt_client_fd(&mut self, fd: RawFd) -> Result<()> {
        if self.owns_fd(fd) {
            return Ok(());
        }
        let entry = ChannelEntry {
            fd,
            role: ChannelRole::Client,
            origin: ChannelOrigin::Inherited,
            path: None,
        };
        let owned = adopt_entry(&entry)?;
        self.insert_adopted(&entry, owned);
        Ok(())
    }

    pub fn adopt_activation(&mut self, fds: Vec<OwnedFd>) -> usize {
        let mut adopted = 0;
        for fd in fds {
            let raw = fd.as_raw_fd();
            match check_socket(fd.as_fd(), ChannelRole::Listener) {
                Ok(()) => {
                    let listener = UnixListener::from(fd);
                    if let Err(err) = listener.set_nonblocking(true) {
                        tracing::warn!(fd = raw, "activation socket stays blocking: {err}");
                    }
                    let path = listener
                        .local_addr()
                        .ok()
                        .and_then(|addr| addr.as_pathname().map(Path::to_path_buf));
                    self.add_listener(listener, ChannelOrigin::Activation, path);
                    adopted += 1;
                }
                Err(message) => {
                    tracing::warn!(fd = raw, "ignoring activation descriptor: {message}");
                }
            }
        }
        adopted
    }

    fn owns_fd(&self, fd: RawFd) -> bool {
        self.listeners.contains_key(&fd) || self.clients.contains_key(&fd)
    }

    fn insert_adopted(&mut self, entry: &ChannelEntry, fd: OwnedFd) {
        let origin = match entry.origin {
            ChannelOrigin::Activation => ChannelOrigin::Activation,
            _ => ChannelOrigin::Inherited,
        };
        let nonblocking = match entry.role {
            ChannelRole::Listener => {
                let listener = UnixListener::from(fd);
                let result = listener.set_nonblocking(true);
                self.add_listener(listener, origin, entry.path.clone());
                result
            }
            ChannelRole::Client => {
                let stream = UnixStream::from(fd);
                let result = stream.set_nonblocking(true);
                self.add_client(stream, origin);
                result
            }
        };
        if let Err(err) = nonblocking {
            tracing::warn!(fd = entry.fd, "inherited channel stays blocking: {err}");
        }
    }
}

/// Validate an inherited descriptor and take ownership of it: it must be
/// open, be a socket, and be listening exactly when listed as a listener.
fn adopt_entry(entry: &ChannelEntry) -> Result<OwnedFd> {
    let invalid = |message: String| ManagerError::Channel {
        fd: entry.fd,
        message,
    };

    if entry.fd < 0 {
        return Err(invalid("negative descriptor".to_owned()));
    }
    // Safety: F_GETFD only inspects the descriptor table.
    if unsafe { libc::fcntl(entry.fd, libc::F_GETFD) } < 0 {
        return Err(invalid(format!(
            "not open: {}",
            io::Error::last_os_error()
        )));
    }
    // Safety: the descriptor is open; it is only borrowed for the checks.
    let borrowed = unsafe { BorrowedFd::borrow_raw(entry.fd) };
    check_socket(borrowed, entry.role).map_err(invalid)?;

    // Safety: the descriptor is open, was handed to this image on purpose,
    // and nothing else in this process owns it (duplicates are filtered by
    // the caller).
    let owned = unsafe { OwnedFd::from_raw_fd(entry.fd) };
    if let Err(err) = set_cloexec(owned.as_fd(), true) {
        tracing::warn!(fd = entry.fd, "could not restore close-on-exec: {err}");
    }
    Ok(owned)
}

fn check_socket(fd: BorrowedFd<'_>, role: ChannelRole) -> std::result::Result<(), String> {
    // Safety: an all-zero stat is a valid out-parameter.
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    // Safety: `fd` is open for the lifetime of the borrow.
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
        return Err(format!("fstat failed: {}", io::Error::last_os_error()));
    }
    if stat.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return Err("not a socket".to_owned());
    }

    let listening = accepts_connections(fd).map_err(|err| format!("SO_ACCEPTCONN: {err}"))?;
    match (role, listening) {
        (ChannelRole::Listener, true) | (ChannelRole::Client, false) => Ok(()),
        (ChannelRole::Listener, false) => Err("listed as listener but not listening".to_owned()),
        (ChannelRole::Client, true) => Err("listed as client but listening".to_owned()),
    }
}

fn accepts_connections(fd: BorrowedFd<'_>) -> io::Result<bool> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // Safety: value and len point to valid, correctly sized storage.
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            (&mut value as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value != 0)
}

pub fn is_cloexec(fd: BorrowedFd<'_>) -> io::Result<bool> {
    // Safety: F_GETFD only inspects the descriptor table.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::FD_CLOEXEC != 0)
}

pub fn set_cloexec(fd: BorrowedFd<'_>, enabled: bool) -> io::Result<()> {
    // Safety: F_GETFD/F_SETFD only touch the descriptor flags of `fd`.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let next = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if next != flags && unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, next) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Close-on-exec duplicate for the event loop. Only the original crosses exec.
pub fn watch_fd(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    fd.try_clone_to_owned()
}

/// Nothing unless `LISTEN_PID` names this process.
pub fn listen_fds(listen_pid: Option<&str>, listen_fds: Option<&str>, pid: u32) -> Vec<RawFd> {
    announced_fds(LISTEN_FDS_START, listen_pid, listen_fds, pid)
}

fn announced_fds(
    start: RawFd,
    listen_pid: Option<&str>,
    listen_fds: Option<&str>,
    pid: u32,
) -> Vec<RawFd> {
    let Some(target) = listen_pid.and_then(|raw| raw.trim().parse::<u32>().ok()) else {
        return Vec::new();
    };
    if target != pid {
        tracing::debug!(listen_pid = target, pid, "socket activation meant for another process");
        return Vec::new();
    }
    let count = match listen_fds.map(|raw| raw.trim().parse::<RawFd>()) {
        Some(Ok(count)) if count >= 0 => count,
        Some(_) => {
            tracing::warn!("ignoring malformed {LISTEN_FDS_ENV}");
            return Vec::new();
        }
        None => 0,
    };
    let Some(end) = start.checked_add(count) else {
        tracing::warn!(count, "ignoring out of range {LISTEN_FDS_ENV}");
        return Vec::new();
    };
    (start..end).collect()
}

/// Consume the socket-activation variables and take the descriptors they
/// announce. Must run before any other thread exists.
pub fn take_activation_fds() -> Vec<OwnedFd> {
    let listen_pid = std::env::var(LISTEN_PID_ENV).ok();
    let count = std::env::var(LISTEN_FDS_ENV).ok();
    // Safety: called during bootstrap, before any thread is spawned.
    unsafe {
        std::env::remove_var(LISTEN_PID_ENV);
        std::env::remove_var(LISTEN_FDS_ENV);
    }

    receive_activation_fds(listen_fds(
        listen_pid.as_deref(),
        count.as_deref(),
        std::process::id(),
    ))
}

/// Own the announced descriptors that are open, with close-on-exec cleared.
fn receive_activation_fds(fds: Vec<RawFd>) -> Vec<OwnedFd> {
    fds.into_iter()
        .filter_map(|raw| {
            // Safety: F_GETFD only inspects the descriptor table.
            if unsafe { libc::fcntl(raw, libc::F_GETFD) } < 0 {
                tracing::warn!(fd = raw, "announced activation descriptor is not open");
                return None;
            }
            // Safety: the supervisor handed this descriptor to us and nothing
            // else in the process has claimed it yet.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };
            if let Err(err) = set_cloexec(fd.as_fd(), false) {
                tracing::warn!(fd = raw, "could not clear close-on-exec: {err}");
            }
            Some(fd)
        })
        .collect()
}

/// `$XDG_RUNTIME_DIR`, else `/tmp/kestrel-<user>`.
pub fn runtime_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR").filter(|dir| !dir.is_empty()) {
        return PathBuf::from(dir);
    }
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        // Safety: getuid cannot fail.
        .unwrap_or_else(|_| unsafe { libc::getuid() }.to_string());
    std::env::temp_dir().join(format!("kestrel-{user}"))
}

pub fn resolve_socket_path(
    configured: Option<&Path>,
    from_env: Option<OsString>,
    runtime_dir: &Path,
    pid: u32,
) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    if let Some(path) = from_env.filter(|path| !path.is_empty()) {
        return PathBuf::from(path);
    }
    runtime_dir
        .join("kestrel")
        .join(format!("ipc-socket.{pid}"))
}

/// Bind a fresh nonblocking listener at `path`, replacing a stale socket.
pub fn create_ipc_listener(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)?;
    }
    if path.exists()
        && let Err(err) = fs::remove_file(path)
    {
        return Err(ManagerError::Ipc(format!(
            "failed to remove stale ipc socket {}: {err}",
            path.display()
        )));
    }

    let listener = UnixListener::bind(path).map_err(|err| {
        ManagerError::Ipc(format!("failed to bind ipc socket {}: {err}", path.display()))
    })?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{Read, Write},
        os::fd::IntoRawFd,
    };

    fn fixture_listener(dir: &Path) -> (UnixListener, PathBuf) {
        let path = dir.join("ipc.sock");
        (create_ipc_listener(&path).unwrap(), path)
    }

    #[test]
    fn socket_path_precedence() {
        let runtime = Path::new("/run/user/1000");
        assert_eq!(
            resolve_socket_path(
                Some(Path::new("/etc/kestrel.sock")),
                Some("/env.sock".into()),
                runtime,
                7
            ),
            PathBuf::from("/etc/kestrel.sock")
        );
        assert_eq!(
            resolve_socket_path(None, Some("/env.sock".into()), runtime, 7),
            PathBuf::from("/env.sock")
        );
        assert_eq!(
            resolve_socket_path(None, Some("".into()), runtime, 7),
            PathBuf::from("/run/user/1000/kestrel/ipc-socket.7")
        );
    }

    #[test]
    fn activation_requires_matching_pid() {
        assert_eq!(listen_fds(Some("42"), Some("2"), 42), vec![3, 4]);
        assert!(listen_fds(Some("41"), Some("2"), 42).is_empty());
        assert!(listen_fds(None, Some("2"), 42).is_empty());
        assert!(listen_fds(Some("42"), Some("0"), 42).is_empty());
        assert!(listen_fds(Some("42"), Some("two"), 42).is_empty());
        assert!(listen_fds(Some("42"), Some(RawFd::MAX.to_string().as_str()), 42).is_empty());
    }

    #[test]
    fn received_activation_descriptors_lose_close_on_exec() {
        let dir = tempfile::tempdir().unwrap();
        let (listener, path) = fixture_listener(dir.path());
        assert!(is_cloexec(listener.as_fd()).unwrap());
        let raw = listener.into_raw_fd();

        let pid = std::process::id();
        let listen_pid = pid.to_string();
        let announced = announced_fds(raw, Some(listen_pid.as_str()), Some("1"), pid);
        assert_eq!(announced, vec![raw]);

        let received = receive_activation_fds(announced);
        assert_eq!(received.len(), 1);
        assert!(!is_cloexec(received[0].as_fd()).unwrap());

        let mut set = ChannelSet::new();
        assert_eq!(set.adopt_activation(received), 1);
        assert!(set.serves_path(&path));
        assert!(UnixStream::connect(&path).is_ok());
    }

    #[test]
    fn closed_activation_descriptors_are_ignored() {
        assert!(receive_activation_fds(vec![1_000_000]).is_empty());
    }

    #[test]
    fn cloexec_toggles() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        assert!(is_cloexec(ours.as_fd()).unwrap());
        set_cloexec(ours.as_fd(), false).unwrap();
        assert!(!is_cloexec(ours.as_fd()).unwrap());
        set_cloexec(ours.as_fd(), true).unwrap();
        assert!(is_cloexec(ours.as_fd()).unwrap());
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ipc.sock");
        drop(create_ipc_listener(&path).unwrap());
        assert!(path.exists());

        let listener = create_ipc_listener(&path).unwrap();
        assert!(UnixStream::connect(&path).is_ok());
        drop(listener);
    }

    #[test]
    fn handoff_keeps_clients_usable_on_the_same_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let (listener, path) = fixture_listener(dir.path());
        let (ours, mut peer) = UnixStream::pair().unwrap();

        let mut old = ChannelSet::new();
        let listener_fd = old.add_listener(listener, ChannelOrigin::Local, Some(path.clone()));
        let client_fd = old.add_client(ours, ChannelOrigin::Local);

        let manifest = old.prepare_handoff();
        assert_eq!(manifest.channels.len(), 2);
        for entry in &manifest.channels {
            let fd = unsafe { BorrowedFd::borrow_raw(entry.fd) };
            assert!(!is_cloexec(fd).unwrap());
        }

        let encoded = manifest.to_env_value().unwrap();
        // What exec does to the old image: descriptors stay open, owners vanish.
        mem::forget(old);

        let mut new = ChannelSet::new();
        let decoded = ChannelManifest::from_env_value(&encoded).unwrap();
        assert_eq!(new.adopt_manifest(&decoded), 2);
        assert_eq!(new.listener_fds(), vec![listener_fd]);
        assert_eq!(new.client_fds(), vec![client_fd]);
        assert!(new.serves_path(&path));
        assert!(new.listener(listener_fd).unwrap().owns_path());

        let client = new.client_mut(client_fd).unwrap();
        assert_eq!(client.origin, ChannelOrigin::Inherited);
        assert!(is_cloexec(client.stream.as_fd()).unwrap());

        peer.write_all(b"ping\n").unwrap();
        let mut buf = [0u8; 5];
        client.stream.set_nonblocking(false).unwrap();
        client.stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping\n");
        client.stream.write_all(b"pong\n").unwrap();
        let mut reply = [0u8; 5];
        peer.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong\n");
    }

    #[test]
    fn invalid_manifest_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (listener, path) = fixture_listener(dir.path());
        let file = fs::File::create(dir.path().join("plain")).unwrap();

        let manifest = ChannelManifest {
            channels: vec![
                ChannelEntry {
                    fd: file.as_raw_fd(),
                    role: ChannelRole::Client,
                    origin: ChannelOrigin::Local,
                    path: None,
                },
                ChannelEntry {
                    fd: listener.as_raw_fd(),
                    role: ChannelRole::Client,
                    origin: ChannelOrigin::Local,
                    path: Some(path),
                },
                ChannelEntry {
                    fd: 1_000_000,
                    role: ChannelRole::Client,
                    origin: ChannelOrigin::Local,
                    path: None,
                },
                ChannelEntry {
                    fd: -1,
                    role: ChannelRole::Listener,
                    origin: ChannelOrigin::Local,
                    path: None,
                },
            ],
        };

        let mut set = ChannelSet::new();
        assert_eq!(set.adopt_manifest(&manifest), 0);
        assert!(set.is_empty());
    }

    #[test]
    fn activation_listeners_survive_a_restart_without_owning_their_path() {
        let dir = tempfile::tempdir().unwrap();
        let (listener, path) = fixture_listener(dir.path());
        let received = receive_activation_fds(vec![listener.into_raw_fd()]);

        let mut old = ChannelSet::new();
        assert_eq!(old.adopt_activation(received), 1);
        let raw = old.listener_fds()[0];
        assert!(!old.listener(raw).unwrap().owns_path());

        let manifest = old.prepare_handoff();
        assert_eq!(manifest.channels[0].origin, ChannelOrigin::Activation);
        mem::forget(old);

        let mut new = ChannelSet::new();
        assert_eq!(new.adopt_manifest(&manifest), 1);
        let adopted = new.listener(raw).unwrap();
        assert_eq!(adopted.origin, ChannelOrigin::Activation);
        assert!(!adopted.owns_path());
        assert!(UnixStream::connect(&path).is_ok());
    }

    #[test]
    fn duplicate_entries_are_adopted_once() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        let entry = ChannelEntry {
            fd: ours.as_raw_fd(),
            role: ChannelRole::Client,
            origin: ChannelOrigin::Local,
            path: None,
        };
        let manifest = ChannelManifest {
            channels: vec![entry.clone(), entry],
        };
        let raw = ours.into_raw_fd();

        let mut set = ChannelSet::new();
        assert_eq!(set.adopt_manifest(&manifest), 1);
        assert_eq!(set.client_fds(), vec![raw]);
    }
}
