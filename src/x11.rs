//! The display connection and the few requests the core issues directly.

use std::{
    io,
    os::fd::{AsFd, OwnedFd},
    path::Path,
};

use x11rb::{
    connection::Connection,
    errors::ReplyError,
    protocol::{
        Event,
        xproto::{
            AtomEnum, ChangeWindowAttributesAux, ConnectionExt as _, EventMask, MapState,
            PropMode, Screen, Window,
        },
    },
    rust_connection::RustConnection,
    wrapper::ConnectionExt as _,
};

use crate::{
    ManagerError, Result,
    reactor::{EventClass, ProtocolEvent, ProtocolSource},
    reconcile::{DisplayServer, ExistingWindow},
};

pub const SOCKET_PATH_ATOM: &str = "KESTREL_SOCKET_PATH";
pub const PID_ATOM: &str = "KESTREL_PID";

fn root_event_mask() -> EventMask {
    EventMask::SUBSTRUCTURE_REDIRECT
        | EventMask::SUBSTRUCTURE_NOTIFY
        | EventMask::STRUCTURE_NOTIFY
        | EventMask::PROPERTY_CHANGE
}

fn client_event_mask() -> EventMask {
    EventMask::STRUCTURE_NOTIFY | EventMask::PROPERTY_CHANGE
}

pub struct X11Connection {
    conn: RustConnection,
    screen_num: usize,
    root: Window,
}

impl X11Connection {
    pub fn connect(display: Option<&str>) -> Result<Self> {
        let (conn, screen_num) = x11rb::connect(display)?;
        let root = conn.setup().roots[screen_num].root;
        tracing::info!(screen = screen_num, root = format_args!("{root:#x}"), "connected to X11");
        Ok(Self {
            conn,
            screen_num,
            root,
        })
    }

    pub fn conn(&self) -> &RustConnection {
        &self.conn
    }

    pub fn screen(&self) -> &Screen {
        &self.conn.setup().roots[self.screen_num]
    }

    pub fn root(&self) -> Window {
        self.root
    }

    /// A close-on-exec duplicate of the socket for the reactor to watch. The
    /// connection itself never survives an exec: the new image reconnects.
    pub fn watch_fd(&self) -> io::Result<OwnedFd> {
        self.conn.stream().as_fd().try_clone_to_owned()
    }

    /// Become the window manager: only one client may select
    /// SubstructureRedirect on the root.
    pub fn claim_root(&self) -> Result<()> {
        let aux = ChangeWindowAttributesAux::new().event_mask(root_event_mask());
        match self.conn.change_window_attributes(self.root, &aux)?.check() {
            Ok(()) => Ok(()),
            Err(ReplyError::X11Error(err)) => {
                tracing::error!(error_kind = ?err.error_kind, "could not select events on the root window");
                Err(ManagerError::RootClaimed)
            }
            Err(ReplyError::ConnectionError(err)) => Err(err.into()),
        }
    }

    fn intern(&self, name: &str) -> Result<u32> {
        Ok(self.conn.intern_atom(false, name.as_bytes())?.reply()?.atom)
    }

    /// Publish the IPC socket path and our pid on the root window for
    /// `--get-socketpath` and other tools.
    pub fn publish_root_atoms(&self, socket_path: Option<&Path>, pid: u32) -> Result<()> {
        let pid_atom = self.intern(PID_ATOM)?;
        self.conn.change_property32(
            PropMode::REPLACE,
            self.root,
            pid_atom,
            AtomEnum::CARDINAL,
            &[pid],
        )?;

        let path_atom = self.intern(SOCKET_PATH_ATOM)?;
        match socket_path {
            Some(path) => {
                self.conn.change_property8(
                    PropMode::REPLACE,
                    self.root,
                    path_atom,
                    AtomEnum::STRING,
                    path.as_os_str().as_encoded_bytes(),
                )?;
            }
            None => {
                self.conn.delete_property(self.root, path_atom)?;
            }
        }
        Ok(())
    }

    /// Contents of a string property on the root window.
    pub fn root_string_property(&self, name: &str) -> Result<Option<String>> {
        let atom = self.intern(name)?;
        let reply = self
            .conn
            .get_property(false, self.root, atom, AtomEnum::ANY, 0, u32::MAX)?
            .reply()?;
        if reply.value.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&reply.value).into_owned()))
    }

    /// Start watching a client window and make it visible.
    pub fn adopt_window(&self, window: Window) -> Result<()> {
        let aux = ChangeWindowAttributesAux::new().event_mask(client_event_mask());
        self.conn.change_window_attributes(window, &aux)?;
        self.conn.map_window(window)?;
        Ok(())
    }

    /// Flush and drop the connection.
    pub fn disconnect(self) {
        if let Err(err) = self.conn.flush() {
            tracing::debug!("final flush failed: {err}");
        }
    }
}

impl ProtocolEvent for Event {
    fn class(&self) -> EventClass {
        match self {
            Event::Error(err) => EventClass::Error {
                code: err.error_code,
                sequence: err.sequence,
            },
            Event::MapRequest(request) => EventClass::MapRequest(request.window),
            _ => EventClass::Other,
        }
    }
}

impl ProtocolSource for X11Connection {
    type Event = Event;

    fn poll_event(&self) -> Result<Option<Event>> {
        Ok(self.conn.poll_for_event()?)
    }

    fn flush(&self) -> Result<()> {
        Ok(self.conn.flush()?)
    }
}

impl DisplayServer for X11Connection {
    fn grab_server(&self) -> Result<()> {
        self.conn.grab_server()?;
        Ok(())
    }

    fn ungrab_server(&self) -> Result<()> {
        self.conn.ungrab_server()?;
        self.conn.flush()?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.conn.sync()?;
        Ok(())
    }

    fn existing_windows(&self) -> Result<Vec<ExistingWindow>> {
        let tree = self.conn.query_tree(self.root)?.reply()?;

        // Pipeline all attribute requests before waiting on any reply.
        let cookies = tree
            .children
            .iter()
            .map(|&window| -> Result<_> {
                Ok((window, self.conn.get_window_attributes(window)?))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut windows = Vec::with_capacity(cookies.len());
        for (window, cookie) in cookies {
            match cookie.reply() {
                Ok(attributes) => windows.push(ExistingWindow {
                    window,
                    override_redirect: attributes.override_redirect,
                    viewable: attributes.map_state == MapState::VIEWABLE,
                }),
                // Destroyed between QueryTree and GetWindowAttributes.
                Err(ReplyError::X11Error(err)) => {
                    tracing::debug!(window = format_args!("{window:#x}"), error_kind = ?err.error_kind, "skipping vanished window");
                }
                Err(ReplyError::ConnectionError(err)) => return Err(err.into()),
            }
        }
        Ok(windows)
    }
}
