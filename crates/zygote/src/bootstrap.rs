//! One-time fork-server setup: sockets, lock file, the bootstrap fork.
//!
//! The parent keeps the client ends and gets a [`ZygoteHost`]; the child
//! becomes the manager and serves until its peer dies or a Fork request
//! makes it the template for a new process image.

use std::{
    backtrace::Backtrace,
    os::fd::RawFd,
    path::{Path, PathBuf},
};

use nix::{
    sys::socket::{AddressFamily, SockFlag, SockType, socketpair},
    unistd::{ForkResult, fork},
};
use rustix::fs::{Mode, OFlags, open};
use snafu::{ResultExt, Snafu};
use tracing::info;

use crate::{
    client::ZygoteHost,
    server::{RunOutcome, ServerError, ServerExit, ServerOptions, ZygoteServer},
};

/// Descriptor number the control channel occupies in an exec'd
/// fork-request child.
pub const CONTROL_FD: RawFd = 3;

/// Descriptor number of the re-opened lock file in an exec'd child.
pub const LOCK_FD: RawFd = 4;

/// First descriptor number the fork child setup is allowed to close.
pub const RESERVED_FDS: RawFd = 5;

// environment-backed process-wide marker; refuses nested servers
const ENV_MARKER: &str = "ZYGOTE_FORK_SERVER";

#[derive(Snafu, Debug)]
pub enum BootstrapError {
    #[snafu(display("a fork server is already running in this process tree"))]
    AlreadyStarted,

    #[snafu(display("could not create the control sockets: {source}"))]
    Sockets {
        source: nix::errno::Errno,
        backtrace: Backtrace,
    },

    #[snafu(display("could not create lock file: {source}"))]
    LockFile {
        source: rustix::io::Errno,
        backtrace: Backtrace,
    },

    #[snafu(display("bootstrap fork failed: {source}"))]
    Fork {
        source: nix::errno::Errno,
        backtrace: Backtrace,
    },

    #[snafu(display("server loop failed: {source}"))]
    Server { source: ServerError },
}

/// Which half of the bootstrap fork this process turned out to be.
pub enum Spawned {
    /// The original parent: the client half.
    Host(ZygoteHost),
    /// The manager forked a child for a Fork request and we are it:
    /// replace the process image with this argv.
    ServerExec { argv: Vec<String> },
    /// The manager ran to completion (peer died or channel closed).
    ServerExited(ServerExit),
}

#[must_use]
pub fn fork_server_started() -> bool {
    std::env::var_os(ENV_MARKER).is_some()
}

pub(crate) fn clear_fork_server_marker() {
    // single-threaded server process; no concurrent env readers
    unsafe { std::env::remove_var(ENV_MARKER) };
}

/// Create the channel, canary and lock file, then fork the manager.
/// Refuses to nest.
pub fn start(
    lock_path: &Path,
    opts: ServerOptions,
) -> Result<Spawned, BootstrapError> {
    if fork_server_started() {
        return Err(BootstrapError::AlreadyStarted);
    }

    // datagram semantics: each request plus its ancillary descriptors
    // is one atomic unit
    let (request_host, request_server) = socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .context(SocketsSnafu)?;

    // stream socket used only for peer-death detection
    let (canary_host, canary_server) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .context(SocketsSnafu)?;

    let lock = open(
        lock_path,
        OFlags::CREATE | OFlags::RDWR | OFlags::CLOEXEC,
        Mode::from_bits_retain(0o600),
    )
    .context(LockFileSnafu)?;

    // set before the fork so both halves agree, cleared by the server
    // at teardown
    unsafe { std::env::set_var(ENV_MARKER, "1") };

    match unsafe { fork() }.context(ForkSnafu)? {
        ForkResult::Parent { child } => {
            drop(request_server);
            drop(canary_server);
            info!(manager_pid = child.as_raw(), "zygote manager forked");
            Ok(Spawned::Host(ZygoteHost::new(
                request_host,
                lock,
                Some(canary_host),
                child.as_raw(),
                opts.policy.required_suffix.clone(),
            )))
        }
        ForkResult::Child => {
            drop(request_host);
            drop(canary_host);
            // the server never takes the advisory lock itself; it keeps
            // only the path, for the fork-child re-open and for cleanup
            drop(lock);
            let server = ZygoteServer::new(
                request_server,
                canary_server,
                PathBuf::from(lock_path),
                opts,
            );
            match server.run().context(ServerSnafu)? {
                RunOutcome::Exec(argv) => Ok(Spawned::ServerExec { argv }),
                RunOutcome::Exited(exit) => Ok(Spawned::ServerExited(exit)),
            }
        }
    }
}
