//! Line-oriented commands on the IPC channels.
//!
//! Every request is one line, every reply is one line. Only the commands
//! needed to drive the process lifecycle exist.

use std::{
    io::{BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::Path,
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, bail};

/// Sent to the client that asked for a restart, by the new image.
pub const RESTART_CONFIRMATION: &str = "ok: restarted";

/// Longest request line accepted before the client is dropped.
pub const MAX_LINE: usize = 4096;

const SUPPORTED: &str = "restart, exit, version, ping";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcCommand {
    Restart,
    Exit,
    Version,
    Ping,
}

impl FromStr for IpcCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        match line.trim() {
            "restart" => Ok(IpcCommand::Restart),
            "exit" => Ok(IpcCommand::Exit),
            "version" => Ok(IpcCommand::Version),
            "ping" => Ok(IpcCommand::Ping),
            "" => Err(format!("error: empty command (supported: {SUPPORTED})")),
            other => Err(format!(
                "error: unsupported command `{other}` (supported: {SUPPORTED})"
            )),
        }
    }
}

/// Accumulates bytes read from a nonblocking client until whole lines are
/// available.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append `bytes` and take every complete line out. Fails once a single
    /// line grows past [`MAX_LINE`].
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|&byte| byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            lines.push(String::from_utf8_lossy(&line[..end]).into_owned());
        }

        if self.pending.len() > MAX_LINE {
            self.pending.clear();
            return Err(format!("request line longer than {MAX_LINE} bytes"));
        }
        Ok(lines)
    }
}

/// Send one command to a running instance and wait for its one-line reply.
pub fn send_command(socket_path: &Path, command: &str) -> anyhow::Result<String> {
    let mut stream = UnixStream::connect(socket_path).with_context(|| {
        format!(
            "failed to connect to kestrel ipc socket {}",
            socket_path.display()
        )
    })?;
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .context("failed to set ipc read timeout")?;

    writeln!(stream, "{}", command.trim()).context("failed to send ipc command")?;

    let mut reply = String::new();
    BufReader::new(&stream)
        .read_line(&mut reply)
        .context("failed to read ipc reply")?;
    if reply.is_empty() {
        bail!("connection closed without a reply");
    }
    Ok(reply.trim_end().to_owned())
}
