//! Server-side descriptor cache and the path policy guarding it.
//!
//! The cache maps validated absolute paths to already-open read-only
//! descriptors so repeated opens of the same resource are served without
//! a syscall. It is append-only for the life of the server; every cached
//! descriptor is closed in one sweep when the server drops the cache.
//! Holders share the underlying file offset, so callers must never seek.

use std::{
    collections::HashMap,
    os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd},
    path::{Component, Path, PathBuf},
};

use rustix::{
    fs::{FileType, Mode, OFlags, fstat, open},
    io::Errno,
};
use tracing::{debug, warn};

/// What an Open request is allowed to name. A value, not a static: the
/// embedding process decides which root is blessed.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    /// Required file suffix, extension included.
    pub required_suffix: String,
    /// Prefixes that are never served no matter the suffix.
    pub denied_prefixes: Vec<PathBuf>,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self {
            required_suffix: ".pak".to_string(),
            denied_prefixes: ["/tmp", "/dev", "/proc", "/sys", "/var", "/etc"]
                .iter()
                .map(PathBuf::from)
                .collect(),
        }
    }
}

impl PathPolicy {
    /// Reject before the filesystem is touched. Everything disallowed
    /// maps to `EPERM` so clients can tell "not allowed" from "not
    /// found".
    pub fn check(&self, path: &str) -> Result<(), Errno> {
        let p = Path::new(path);
        if !p.is_absolute() {
            return Err(Errno::PERM);
        }
        if !path.ends_with(&self.required_suffix) {
            return Err(Errno::PERM);
        }
        if p.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(Errno::PERM);
        }
        if self.denied_prefixes.iter().any(|deny| p.starts_with(deny)) {
            return Err(Errno::PERM);
        }
        Ok(())
    }
}

pub struct FdCache {
    policy: PathPolicy,
    entries: HashMap<String, OwnedFd>,
}

impl FdCache {
    #[must_use]
    pub fn new(policy: PathPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    /// Cache hit returns the stored descriptor with no syscall. Miss
    /// validates the path, opens read-only, verifies a regular file and
    /// stores the result forever.
    pub fn lookup_or_open(
        &mut self,
        path: &str,
    ) -> Result<BorrowedFd<'_>, Errno> {
        self.policy.check(path)?;

        if !self.entries.contains_key(path) {
            let fd = open(
                path,
                OFlags::RDONLY | OFlags::CLOEXEC | OFlags::NOCTTY,
                Mode::empty(),
            )?;
            let st = fstat(&fd)?;
            if FileType::from_raw_mode(st.st_mode) != FileType::RegularFile {
                // directories and other special files get a distinct
                // error; the fd drops here, closing it
                warn!(path, "open request for non-regular file");
                return Err(Errno::ISDIR);
            }
            debug!(path, "caching resource descriptor");
            self.entries.insert(path.to_string(), fd);
        }

        Ok(self.entries[path].as_fd())
    }

    /// Raw descriptor numbers of every cached entry, for the fork
    /// child's preserve set.
    #[must_use]
    pub fn raw_fds(&self) -> Vec<RawFd> {
        use std::os::fd::AsRawFd;
        self.entries.values().map(AsRawFd::as_raw_fd).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
