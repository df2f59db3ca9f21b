//! The zygote manager's event loop.
//!
//! Strictly single-threaded: one bounded `poll()` over the canary stream
//! socket and the datagram request channel. The only asynchrony is
//! SIGCHLD, handled with a no-op handler purely so a blocking `poll`
//! returns `EINTR` early; all real reaping happens synchronously in the
//! loop, never inside the handler.

use std::{
    backtrace::Backtrace,
    collections::HashMap,
    io::IoSliceMut,
    os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::PathBuf,
    time::{Duration, Instant},
};

use nix::sys::{
    signal::{
        SaFlags, SigAction, SigHandler, SigSet, Signal, kill, sigaction,
    },
    socket::{ControlMessageOwned, MsgFlags, recvmsg},
    wait::{WaitPidFlag, WaitStatus, waitpid},
};
use rustix::event::{PollFd, PollFlags, Timespec, poll};
use snafu::{ResultExt, Snafu};
use tracing::{debug, error, info, warn};
use zygote_common::protocol::{MAX_ATTACHED_FDS, MAX_MESSAGE_LEN};

use crate::{
    bootstrap,
    dispatch::{Dispatch, dispatch},
    fd_cache::{FdCache, PathPolicy},
};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum ServerError {
    #[snafu(display("poll failed: {source}"))]
    Poll {
        source: rustix::io::Errno,
        backtrace: Backtrace,
    },

    #[snafu(display("request channel read failed: {source}"))]
    Recv {
        source: nix::errno::Errno,
        backtrace: Backtrace,
    },

    #[snafu(display("reply send failed: {source}"))]
    SendReply {
        source: nix::errno::Errno,
        backtrace: Backtrace,
    },

    #[snafu(display("reply send was short: {sent} of {len} bytes"))]
    ShortReply { sent: usize, len: usize },

    #[snafu(display("installing SIGCHLD handler failed: {source}"))]
    SigHandler {
        source: nix::errno::Errno,
        backtrace: Backtrace,
    },
}

/// What to do about a child named in a Reap request that will not exit
/// on its own. A policy parameter, not a constant.
#[derive(Debug, Clone, Copy)]
pub struct ReapPolicy {
    /// How long a reap-requested child may linger before escalation.
    pub grace: Duration,
    pub escalate: Signal,
}

impl Default for ReapPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            escalate: Signal::SIGKILL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub policy: PathPolicy,
    pub reap: ReapPolicy,
    /// Upper bound on one blocking wait, so terminated children are
    /// reaped even absent a delivered signal.
    pub poll_timeout: Duration,
    /// Active log descriptor, preserved across fork-request children.
    pub log_fd: Option<RawFd>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            policy: PathPolicy::default(),
            reap: ReapPolicy::default(),
            poll_timeout: Duration::from_secs(60),
            log_fd: None,
        }
    }
}

/// Why the loop stopped serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// Peer process tree is gone.
    CanaryClosed,
    /// Request channel reached end-of-file.
    RequestClosed,
}

/// Result of one full run of the server.
#[derive(Debug)]
pub enum RunOutcome {
    Exited(ServerExit),
    /// A Fork request landed and we are its child: the caller must
    /// replace the process image with this argv. The loop is done.
    Exec(Vec<String>),
}

enum Served {
    Handled,
    Exec(Vec<String>),
    Eof,
}

pub struct ZygoteServer {
    pub(crate) request: OwnedFd,
    canary: OwnedFd,
    pub(crate) lock_path: PathBuf,
    pub(crate) cache: FdCache,
    /// Every child we forked, plus any pid a Reap request named. The
    /// deadline is set only by a Reap request.
    pub(crate) children: HashMap<i32, Option<Instant>>,
    pub(crate) reap: ReapPolicy,
    pub(crate) log_fd: Option<RawFd>,
    poll_timeout: Duration,
}

impl ZygoteServer {
    #[must_use]
    pub fn new(
        request: OwnedFd,
        canary: OwnedFd,
        lock_path: PathBuf,
        opts: ServerOptions,
    ) -> Self {
        Self {
            request,
            canary,
            lock_path,
            cache: FdCache::new(opts.policy),
            children: HashMap::new(),
            reap: opts.reap,
            log_fd: opts.log_fd,
            poll_timeout: opts.poll_timeout,
        }
    }

    /// Serve until the peer goes away or a Fork request makes us the
    /// child. Consumes the server: on exit every cached descriptor is
    /// closed and the lock file removed.
    pub fn run(mut self) -> Result<RunOutcome, ServerError> {
        install_sigchld_handler()?;
        info!(pid = std::process::id(), "zygote manager serving");

        loop {
            let timeout = Timespec {
                tv_sec: self.poll_timeout.as_secs() as i64,
                tv_nsec: i64::from(self.poll_timeout.subsec_nanos()),
            };

            let (canary_ev, request_ev) = {
                let mut fds = [
                    PollFd::new(&self.canary, PollFlags::IN),
                    PollFd::new(&self.request, PollFlags::IN),
                ];
                match poll(&mut fds, Some(&timeout)) {
                    // interrupted wait (SIGCHLD) or timeout: reap sweep
                    Err(rustix::io::Errno::INTR) | Ok(0) => {
                        self.reap_sweep();
                        continue;
                    }
                    Err(e) => {
                        self.teardown();
                        return Err(e).context(PollSnafu);
                    }
                    Ok(_) => {}
                }
                (fds[0].revents(), fds[1].revents())
            };

            if canary_ev
                .intersects(PollFlags::IN | PollFlags::HUP | PollFlags::ERR)
            {
                info!("canary closed, peer process tree is gone");
                self.teardown();
                return Ok(RunOutcome::Exited(ServerExit::CanaryClosed));
            }

            if request_ev.intersects(PollFlags::IN) {
                match self.serve_one() {
                    Ok(Served::Handled) => {}
                    Ok(Served::Exec(argv)) => {
                        // fork child branch: the loop must not continue
                        return Ok(RunOutcome::Exec(argv));
                    }
                    Ok(Served::Eof) => {
                        info!("request channel reached end-of-file");
                        self.teardown();
                        return Ok(RunOutcome::Exited(
                            ServerExit::RequestClosed,
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "fatal request channel error");
                        self.teardown();
                        return Err(e);
                    }
                }
            } else if request_ev.intersects(PollFlags::HUP | PollFlags::ERR)
            {
                info!("request channel hung up");
                self.teardown();
                return Ok(RunOutcome::Exited(ServerExit::RequestClosed));
            }

            self.reap_sweep();
        }
    }

    /// Read exactly one datagram with its ancillary descriptors and run
    /// the dispatcher on it.
    fn serve_one(&mut self) -> Result<Served, ServerError> {
        let mut buf = vec![0u8; MAX_MESSAGE_LEN];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_ATTACHED_FDS]);

        let (n, fds) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = match recvmsg::<()>(
                self.request.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => msg,
                Err(nix::errno::Errno::EINTR) => {
                    return Ok(Served::Handled);
                }
                Err(e) => return Err(e).context(RecvSnafu),
            };

            // take ownership of every attached descriptor immediately,
            // so they are closed on all exit paths including decode
            // errors
            let mut fds: Vec<OwnedFd> = Vec::new();
            match msg.cmsgs() {
                Ok(cmsgs) => {
                    for cmsg in cmsgs {
                        if let ControlMessageOwned::ScmRights(received) =
                            cmsg
                        {
                            for raw in received {
                                fds.push(unsafe {
                                    OwnedFd::from_raw_fd(raw)
                                });
                            }
                        }
                    }
                }
                Err(e) => {
                    // truncated control message; strays already owned
                    warn!(error = %e, "dropping request with bad cmsgs");
                    return Ok(Served::Handled);
                }
            }
            (msg.bytes, fds)
        };

        if n == 0 {
            return Ok(Served::Eof);
        }

        match dispatch(self, &buf[..n], fds)? {
            Dispatch::Handled => Ok(Served::Handled),
            Dispatch::Exec(argv) => Ok(Served::Exec(argv)),
        }
    }

    /// Non-blocking sweep of terminated children; applies the reap
    /// policy to any past-deadline pid.
    pub(crate) fn reap_sweep(&mut self) {
        let now = Instant::now();
        let pids: Vec<i32> = self.children.keys().copied().collect();
        for pid in pids {
            match waitpid(
                nix::unistd::Pid::from_raw(pid),
                Some(WaitPidFlag::WNOHANG),
            ) {
                Ok(WaitStatus::StillAlive) => {
                    if let Some(Some(deadline)) = self.children.get(&pid) {
                        if now >= *deadline {
                            warn!(pid, signal = %self.reap.escalate,
                                "child missed its termination deadline");
                            let _ = kill(
                                nix::unistd::Pid::from_raw(pid),
                                self.reap.escalate,
                            );
                            // next sweep collects the corpse
                            self.children.insert(pid, None);
                        }
                    }
                }
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {
                    debug!(pid, "reaped child");
                    self.children.remove(&pid);
                }
                Ok(_) => {}
                Err(_) => {
                    // ECHILD: not ours or already gone
                    self.children.remove(&pid);
                }
            }
        }
    }

    fn teardown(&mut self) {
        info!(
            cached = self.cache.len(),
            children = self.children.len(),
            "zygote manager shutting down"
        );
        // cached descriptors close when the cache drops with us; the
        // lock file is removed so a fresh bootstrap can recreate it
        let _ = std::fs::remove_file(&self.lock_path);
        bootstrap::clear_fork_server_marker();
    }
}

extern "C" fn noop_sigchld(_: libc::c_int) {
    // intentionally empty: exists only so blocking syscalls return EINTR
}

fn install_sigchld_handler() -> Result<(), ServerError> {
    // SA_RESTART deliberately not set, poll must see EINTR
    let action = SigAction::new(
        SigHandler::Handler(noop_sigchld),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &action) }
        .map(|_| ())
        .context(SigHandlerSnafu)
}
