//! Client stub for the zygote manager (the "zygote host").
//!
//! Every operation is synchronous: encode, take the turn (an in-process
//! mutex, then the advisory file lock), send one datagram, read exactly
//! one paired reply, decode, release. Both levels are required: `flock`
//! state belongs to the open file description, so threads sharing one
//! host share one lock and would sail straight through it, while sibling
//! processes (exec'd fork children, which re-open the lock file) are
//! excluded by the flock alone. Every failure is a `Result`, never a
//! panic: callers degrade to the non-accelerated path.

use std::{
    backtrace::Backtrace,
    collections::HashMap,
    io::{IoSlice, IoSliceMut},
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
    sync::{Mutex, PoisonError},
};

use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg,
};
use rustix::fs::{FlockOperation, flock};
use snafu::{ResultExt, Snafu};
use tracing::warn;
use zygote_common::protocol::{
    Kind, MAX_ATTACHED_FDS, MAX_MESSAGE_LEN, ProtocolError, Reply, Request,
};

use crate::bootstrap::{CONTROL_FD, LOCK_FD};

#[derive(Snafu, Debug)]
pub enum ClientError {
    #[snafu(display("could not take the channel lock: {source}"))]
    Lock {
        source: rustix::io::Errno,
        backtrace: Backtrace,
    },

    #[snafu(display("control channel I/O failed: {source}"))]
    Channel {
        source: nix::errno::Errno,
        backtrace: Backtrace,
    },

    #[snafu(display("short send: {sent} of {len} bytes"))]
    ShortSend { sent: usize, len: usize },

    #[snafu(display("zygote manager closed the channel"))]
    ClosedByPeer,

    #[snafu(display("bad reply: {source}"))]
    Protocol { source: ProtocolError },

    #[snafu(display("unexpected reply kind {kind:?}"))]
    UnexpectedReply { kind: Kind },

    #[snafu(display("manager could not fork (errno {errno})"))]
    ForkFailed { errno: i32 },

    #[snafu(display("manager refused to open the file (errno {errno})"))]
    OpenRefused { errno: i32 },

    #[snafu(display("path {path:?} is not an openable resource"))]
    PathRejected { path: String },

    #[snafu(display("reply claimed a descriptor but none was attached"))]
    NoDescriptorAttached,

    #[snafu(display("could not duplicate a cached descriptor: {source}"))]
    Dup { source: std::io::Error },
}

/// The privileged parent's handle to the fork server. Share freely
/// between threads; an in-process mutex plus the advisory file lock
/// serialize the exchanges.
pub struct ZygoteHost {
    control: OwnedFd,
    lock: OwnedFd,
    // threads in this process share `lock`'s open file description, so
    // the flock alone cannot order them
    exchange: Mutex<()>,
    // dropping the host closes this end, which the server's poll sees
    // as peer death
    _canary: Option<OwnedFd>,
    pid: i32,
    manager_pid: i32,
    suffix: String,
    fetched: Mutex<HashMap<String, OwnedFd>>,
}

struct LockGuard<'a> {
    fd: BorrowedFd<'a>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let _ = flock(self.fd, FlockOperation::Unlock);
    }
}

impl ZygoteHost {
    pub(crate) fn new(
        control: OwnedFd,
        lock: OwnedFd,
        canary: Option<OwnedFd>,
        manager_pid: i32,
        suffix: String,
    ) -> Self {
        Self {
            control,
            lock,
            exchange: Mutex::new(()),
            _canary: canary,
            pid: std::process::id() as i32,
            manager_pid,
            suffix,
            fetched: Mutex::new(HashMap::new()),
        }
    }

    /// Override the client-side suffix precheck to match a server whose
    /// policy blesses something other than `.pak`.
    #[must_use]
    pub fn with_required_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Pid of the manager process behind the channel.
    #[must_use]
    pub fn manager_pid(&self) -> i32 {
        self.manager_pid
    }

    /// Rebuild a client half inside an exec'd fork-request child, where
    /// the child setup installed the control channel and a re-opened
    /// lock file on the reserved descriptor numbers.
    ///
    /// # Safety
    ///
    /// The caller asserts that descriptors [`CONTROL_FD`] and
    /// [`LOCK_FD`] are exactly those installed by the zygote child
    /// setup and are not owned elsewhere in this process.
    #[must_use]
    pub unsafe fn from_reserved_fds() -> Self {
        Self::new(
            unsafe { OwnedFd::from_raw_fd(CONTROL_FD) },
            unsafe { OwnedFd::from_raw_fd(LOCK_FD) },
            None,
            // a fork-request child is a direct child of the manager
            nix::unistd::getppid().as_raw(),
            ".pak".to_string(),
        )
    }

    /// Liveness check.
    pub fn ping(&self) -> Result<(), ClientError> {
        let (buf, _fds) = self.transact(&Request::Ping, &[])?;
        match Reply::decode(&buf, self.pid).context(ProtocolSnafu)? {
            Reply::Ponged => Ok(()),
            other => Err(ClientError::UnexpectedReply { kind: other.kind() }),
        }
    }

    /// Ask the manager to fork a child that will exec `argv`, with each
    /// `remaps[i].0` appearing in the child as descriptor
    /// `remaps[i].1`. Returns the child pid; the child is the
    /// *manager's* child, so use [`ensure_process_terminated`] rather
    /// than waiting on it directly.
    ///
    /// [`ensure_process_terminated`]: Self::ensure_process_terminated
    pub fn long_fork(
        &self,
        argv: &[String],
        remaps: &[(BorrowedFd<'_>, RawFd)],
    ) -> Result<i32, ClientError> {
        let request = Request::Fork {
            argv: argv.to_vec(),
            remap_targets: remaps.iter().map(|(_, t)| *t).collect(),
        };
        let send_fds: Vec<RawFd> =
            remaps.iter().map(|(fd, _)| fd.as_raw_fd()).collect();
        let (buf, _fds) = self.transact(&request, &send_fds)?;
        match Reply::decode(&buf, self.pid).context(ProtocolSnafu)? {
            Reply::Forked { child_pid, errno: 0 } if child_pid > 0 => {
                Ok(child_pid)
            }
            Reply::Forked { errno, .. } => {
                Err(ClientError::ForkFailed { errno })
            }
            other => Err(ClientError::UnexpectedReply { kind: other.kind() }),
        }
    }

    /// Fire-and-forget termination bookkeeping; there is no reply, so
    /// the turn covers only the send.
    pub fn ensure_process_terminated(
        &self,
        target_pid: i32,
    ) -> Result<(), ClientError> {
        let bytes =
            Request::Reap { target_pid }.encode(self.pid);
        let _turn = self
            .exchange
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _guard = self.lock_exclusive()?;
        self.send(&bytes, &[])
    }

    /// Privileged open of a read-only resource file. Serves repeats from
    /// a local cache without contacting the manager; every return is a
    /// fresh duplicate sharing one underlying file offset, so never seek
    /// it.
    pub fn open_file(&self, path: &str) -> Result<OwnedFd, ClientError> {
        if !path.starts_with('/') || !path.ends_with(&self.suffix) {
            return Err(ClientError::PathRejected {
                path: path.to_string(),
            });
        }

        let mut fetched = self
            .fetched
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(fd) = fetched.get(path) {
            return fd.try_clone().context(DupSnafu);
        }

        let request = Request::Open {
            path: path.to_string(),
        };
        let (buf, mut fds) = self.transact(&request, &[])?;
        match Reply::decode(&buf, self.pid).context(ProtocolSnafu)? {
            Reply::Opened { errno: 0 } => {
                let fd = fds
                    .pop()
                    .ok_or(ClientError::NoDescriptorAttached)?;
                if !fds.is_empty() {
                    warn!(
                        path,
                        extra = fds.len(),
                        "manager attached surplus descriptors"
                    );
                }
                let out = fd.try_clone().context(DupSnafu)?;
                fetched.insert(path.to_string(), fd);
                Ok(out)
            }
            Reply::Opened { errno } => {
                Err(ClientError::OpenRefused { errno })
            }
            other => Err(ClientError::UnexpectedReply { kind: other.kind() }),
        }
    }

    // excludes sibling processes only; threads of this process share
    // this open file description and are ordered by `exchange`
    fn lock_exclusive(&self) -> Result<LockGuard<'_>, ClientError> {
        flock(self.lock.as_fd(), FlockOperation::LockExclusive)
            .context(LockSnafu)?;
        Ok(LockGuard {
            fd: self.lock.as_fd(),
        })
    }

    /// One serialized write-request/read-reply exchange.
    fn transact(
        &self,
        request: &Request,
        send_fds: &[RawFd],
    ) -> Result<(Vec<u8>, Vec<OwnedFd>), ClientError> {
        let bytes = request.encode(self.pid);
        let _turn = self
            .exchange
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _guard = self.lock_exclusive()?;
        self.send(&bytes, send_fds)?;
        self.recv()
    }

    fn send(&self, bytes: &[u8], fds: &[RawFd]) -> Result<(), ClientError> {
        let iov = [IoSlice::new(bytes)];
        let cmsgs: Vec<ControlMessage<'_>> = if fds.is_empty() {
            vec![]
        } else {
            vec![ControlMessage::ScmRights(fds)]
        };
        let sent = sendmsg::<()>(
            self.control.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            None,
        )
        .context(ChannelSnafu)?;
        snafu::ensure!(
            sent == bytes.len(),
            ShortSendSnafu {
                sent,
                len: bytes.len()
            }
        );
        Ok(())
    }

    fn recv(&self) -> Result<(Vec<u8>, Vec<OwnedFd>), ClientError> {
        let mut buf = vec![0u8; MAX_MESSAGE_LEN];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_ATTACHED_FDS]);

        let (n, fds) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = loop {
                match recvmsg::<()>(
                    self.control.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buf),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                ) {
                    Ok(msg) => break msg,
                    Err(nix::errno::Errno::EINTR) => {}
                    Err(e) => return Err(e).context(ChannelSnafu),
                }
            };

            let mut fds: Vec<OwnedFd> = Vec::new();
            if let Ok(cmsgs) = msg.cmsgs() {
                for cmsg in cmsgs {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        for raw in received {
                            fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                        }
                    }
                }
            }
            (msg.bytes, fds)
        };

        if n == 0 {
            return Err(ClientError::ClosedByPeer);
        }
        buf.truncate(n);
        Ok((buf, fds))
    }
}
