//! Shared diagnostic log.
//!
//! The log lives in shared memory so it can be inspected after a crash or
//! from another process while the manager is still running. Its path is
//! registered once, up front, so the core-signal handler can unlink it without
//! allocating.

use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    sync::OnceLock,
};

pub const DEFAULT_SHMLOG_SIZE: u64 = 25 * 1024 * 1024;
pub const SHMLOG_PATH_ENV: &str = "KESTREL_SHMLOG_PATH";

static ARTIFACT_PATH: OnceLock<CString> = OnceLock::new();

/// Where the diagnostic log of process `pid` lives.
pub fn shmlog_path(pid: u32) -> PathBuf {
    let shm = Path::new("/dev/shm");
    let dir = if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    };
    dir.join(format!("kestrel-log-{pid}"))
}

/// Fixed-size log file that wraps back to the start once `limit` bytes have
/// been written, so the newest records overwrite the oldest.
#[derive(Debug)]
pub struct DiagnosticLog {
    file: File,
    written: u64,
    limit: u64,
}

impl DiagnosticLog {
    /// Create (truncating) the log at `path` and register it as the artifact
    /// removed on crash and shutdown.
    pub fn create(path: &Path, limit: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        register_artifact(path);
        Ok(Self {
            file,
            written: 0,
            limit,
        })
    }
}

impl Write for DiagnosticLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.limit {
            self.file.seek(SeekFrom::Start(0))?;
            self.written = 0;
        }
        // A single record larger than the whole log is cut down to fit.
        let take = buf.len().min(self.limit as usize);
        self.file.write_all(&buf[..take])?;
        self.written += take as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn register_artifact(path: &Path) {
    match CString::new(path.as_os_str().as_bytes()) {
        Ok(c_path) => {
            if ARTIFACT_PATH.set(c_path).is_err() {
                tracing::warn!(path = %path.display(), "diagnostic log artifact already registered");
            }
        }
        Err(err) => tracing::warn!(path = %path.display(), "unusable diagnostic log path: {err}"),
    }
}

/// Path of the registered artifact, if any.
pub fn artifact_path() -> Option<PathBuf> {
    ARTIFACT_PATH
        .get()
        .map(|path| PathBuf::from(std::ffi::OsStr::from_bytes(path.as_bytes())))
}

/// Unlink the diagnostic log. Async-signal-safe: a lock-free read of an
/// already initialized path followed by `unlink(2)`.
pub fn remove_artifact() {
    if let Some(path) = ARTIFACT_PATH.get() {
        // Safety: `path` is a valid NUL-terminated string that lives for the
        // rest of the process.
        unsafe {
            libc::unlink(path.as_ptr());
        }
    }
}
