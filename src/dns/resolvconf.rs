//! Resolver file rewrite
//!
//! The interceptor becomes the system resolver by prepending
//! `nameserver 127.0.0.1` to the resolver file at startup and restoring the
//! original contents on shutdown. The file may be missing (minimal
//! containers); everything here degrades to a logged warning, never a
//! startup failure.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

/// Well-known resolver file location
pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

/// First `nameserver` entry of resolver-file contents, as a `host:53` address
#[must_use]
pub fn first_nameserver(contents: &str) -> Option<SocketAddr> {
    for line in contents.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("nameserver") {
            let candidate = rest.trim();
            if let Ok(ip) = candidate.parse::<IpAddr>() {
                return Some(SocketAddr::new(ip, 53));
            }
        }
    }
    None
}

/// Rewritten resolver file, restored on drop
#[derive(Debug)]
pub struct ResolvConfGuard {
    path: PathBuf,
    /// Contents before modification; `None` when the file did not exist
    original: Option<String>,
    restored: bool,
}

impl ResolvConfGuard {
    /// Snapshot the resolver file and prepend the interceptor as the first
    /// nameserver.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be written. A missing file is
    /// not an error: the guard creates one and removes it on restore.
    pub fn install(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let original = match std::fs::read_to_string(&path) {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "resolver file missing; creating one");
                None
            }
            Err(e) => return Err(e),
        };

        let mut rewritten = String::from("nameserver 127.0.0.1\n");
        if let Some(contents) = &original {
            rewritten.push_str(contents);
        }
        std::fs::write(&path, rewritten)?;

        info!(path = %path.display(), "resolver file rewritten");
        Ok(Self {
            path,
            original,
            restored: false,
        })
    }

    /// Upstream nameserver from the pre-modification contents
    #[must_use]
    pub fn upstream_nameserver(&self) -> Option<SocketAddr> {
        self.original.as_deref().and_then(first_nameserver)
    }

    /// Put the original contents back. Idempotent.
    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;

        let result = match &self.original {
            Some(contents) => std::fs::write(&self.path, contents),
            None => match std::fs::remove_file(&self.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
        };

        match result {
            Ok(()) => debug!(path = %self.path.display(), "resolver file restored"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to restore resolver file"),
        }
    }
}

impl Drop for ResolvConfGuard {
    fn drop(&mut self) {
        self.restore();
    }
}
