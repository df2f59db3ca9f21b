//! Per-request dispatcher for the zygote manager.
//!
//! Each request plus its ancillary descriptors is one atomic unit: the
//! dispatcher decodes the envelope, runs exactly one handler and writes
//! exactly one reply (Reap has none). Malformed input is dropped and
//! logged; only a failed reply send is fatal to the server.

use std::{
    ffi::c_int,
    io::IoSlice,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    time::Instant,
};

use nix::{
    sys::socket::{ControlMessage, MsgFlags, sendmsg},
    unistd::{ForkResult, fork},
};
use snafu::ResultExt;
use tracing::{debug, info, warn};
use zygote_common::protocol::{Reply, Request};

use crate::{
    bootstrap::{CONTROL_FD, LOCK_FD, RESERVED_FDS},
    server::{SendReplySnafu, ServerError, ShortReplySnafu, ZygoteServer},
};

/// Outcome of handling one request.
pub(crate) enum Dispatch {
    /// Keep serving.
    Handled,
    /// We are the child of a Fork request: stop serving and hand this
    /// argv back for exec.
    Exec(Vec<String>),
}

pub(crate) fn dispatch(
    server: &mut ZygoteServer,
    data: &[u8],
    fds: Vec<OwnedFd>,
) -> Result<Dispatch, ServerError> {
    let decoded = match Request::decode(data) {
        Ok(d) => d,
        Err(e) => {
            // non-fatal: drop the message (and close any strays), keep
            // serving
            warn!(error = %e, "dropping malformed request");
            return Ok(Dispatch::Handled);
        }
    };
    let sender = decoded.sender_pid;
    debug!(sender, kind = ?decoded.request.kind(), "request");

    match decoded.request {
        Request::Ping => {
            if !fds.is_empty() {
                // protocol violation, but an answerable one
                warn!(sender, count = fds.len(), "ping carried descriptors");
                drop(fds);
            }
            send_reply(server.request.as_fd(), sender, &Reply::Ponged, &[])?;
            Ok(Dispatch::Handled)
        }
        Request::Fork {
            argv,
            remap_targets,
        } => handle_fork(server, sender, argv, &remap_targets, fds),
        Request::Reap { target_pid } => {
            // bookkeeping only; the sweep applies the policy. No reply.
            let deadline = Instant::now() + server.reap.grace;
            info!(sender, target_pid, "termination requested");
            server.children.insert(target_pid, Some(deadline));
            Ok(Dispatch::Handled)
        }
        Request::Open { path } => handle_open(server, sender, &path),
    }
}

fn handle_fork(
    server: &mut ZygoteServer,
    sender: i32,
    argv: Vec<String>,
    targets: &[RawFd],
    fds: Vec<OwnedFd>,
) -> Result<Dispatch, ServerError> {
    // a target may not land on a descriptor the child still needs after
    // the dup2 pass: the reserved numbers, the control channel itself,
    // the log and every cached resource descriptor
    let mut held: Vec<RawFd> = vec![CONTROL_FD, LOCK_FD];
    held.push(server.request.as_raw_fd());
    held.extend(server.cache.raw_fds());
    if let Some(log_fd) = server.log_fd {
        held.push(log_fd);
    }
    let collision = targets.iter().any(|t| held.contains(t));
    if targets.len() != fds.len() || collision {
        warn!(
            sender,
            targets = targets.len(),
            received = fds.len(),
            "fork request with bad descriptor remap list"
        );
        drop(fds); // close the strays
        let reply = Reply::Forked {
            child_pid: -1,
            errno: -1,
        };
        send_reply(server.request.as_fd(), sender, &reply, &[])?;
        return Ok(Dispatch::Handled);
    }

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            remap_child_fds(server, fds, targets);
            Ok(Dispatch::Exec(argv))
        }
        Ok(ForkResult::Parent { child }) => {
            // close our copies of everything just handed to the child,
            // exactly once each
            drop(fds);
            server.children.insert(child.as_raw(), None);
            info!(sender, child_pid = child.as_raw(), "forked");
            let reply = Reply::Forked {
                child_pid: child.as_raw(),
                errno: 0,
            };
            send_reply(server.request.as_fd(), sender, &reply, &[])?;
            Ok(Dispatch::Handled)
        }
        Err(errno) => {
            drop(fds);
            warn!(sender, error = %errno, "fork failed");
            let reply = Reply::Forked {
                child_pid: -1,
                errno: errno as i32,
            };
            send_reply(server.request.as_fd(), sender, &reply, &[])?;
            Ok(Dispatch::Handled)
        }
    }
}

fn handle_open(
    server: &mut ZygoteServer,
    sender: i32,
    path: &str,
) -> Result<Dispatch, ServerError> {
    match server.cache.lookup_or_open(path) {
        Ok(fd) => {
            let raw = fd.as_raw_fd();
            debug!(sender, path, fd = raw, "open served");
            send_reply(
                server.request.as_fd(),
                sender,
                &Reply::Opened { errno: 0 },
                &[raw],
            )?;
        }
        Err(errno) => {
            info!(sender, path, errno = errno.raw_os_error(), "open refused");
            let reply = Reply::Opened {
                errno: errno.raw_os_error(),
            };
            send_reply(server.request.as_fd(), sender, &reply, &[])?;
        }
    }
    Ok(Dispatch::Handled)
}

/// Send one reply datagram, attaching `fds` out of band. A failed or
/// short send is fatal: the caller is now desynchronized and there is no
/// way to tell it.
fn send_reply(
    channel: BorrowedFd<'_>,
    requester: i32,
    reply: &Reply,
    fds: &[RawFd],
) -> Result<(), ServerError> {
    let bytes = reply.encode(requester);
    let iov = [IoSlice::new(&bytes)];
    let cmsgs: Vec<ControlMessage<'_>> = if fds.is_empty() {
        vec![]
    } else {
        vec![ControlMessage::ScmRights(fds)]
    };
    let sent = sendmsg::<()>(
        channel.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None,
    )
    .context(SendReplySnafu)?;
    snafu::ensure!(
        sent == bytes.len(),
        ShortReplySnafu {
            sent,
            len: bytes.len()
        }
    );
    Ok(())
}

/// Post-fork child branch: wire the received descriptors onto their
/// requested numbers and drop everything else. Runs in the child only;
/// the caller execs right after, so this is best-effort plumbing with a
/// hard exit on anything that would leave the child misconfigured.
fn remap_child_fds(
    server: &ZygoteServer,
    fds: Vec<OwnedFd>,
    targets: &[RawFd],
) {
    // first move every source above the collision range so a dup2 onto
    // a low target cannot clobber a not-yet-moved source
    let base = targets
        .iter()
        .copied()
        .max()
        .unwrap_or(RESERVED_FDS)
        .max(RESERVED_FDS)
        + 1;
    let mut moved: Vec<c_int> = Vec::with_capacity(fds.len());
    for fd in &fds {
        let m = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD, base) };
        if m < 0 {
            unsafe { libc::_exit(127) };
        }
        moved.push(m);
    }
    drop(fds); // originals closed

    for (&m, &target) in moved.iter().zip(targets) {
        if unsafe { libc::dup2(m, target) } < 0 {
            unsafe { libc::_exit(127) };
        }
    }

    // control channel lands on its reserved number; dup2 clears
    // close-on-exec so it survives into the new image
    if unsafe { libc::dup2(server.request.as_raw_fd(), CONTROL_FD) } < 0 {
        unsafe { libc::_exit(127) };
    }

    // the lock file must be re-opened, not inherited: flock state rides
    // on the open file description, which a fork would share
    let lock_path = match std::ffi::CString::new(
        server.lock_path.as_os_str().as_encoded_bytes(),
    ) {
        Ok(p) => p,
        Err(_) => unsafe { libc::_exit(127) },
    };
    let lock = unsafe { libc::open(lock_path.as_ptr(), libc::O_RDWR) };
    if lock < 0 || unsafe { libc::dup2(lock, LOCK_FD) } < 0 {
        unsafe { libc::_exit(127) };
    }

    let mut keep: Vec<RawFd> = vec![0, 1, 2, CONTROL_FD, LOCK_FD];
    keep.extend_from_slice(targets);
    keep.extend(moved.iter().copied());
    keep.extend(server.cache.raw_fds());
    if let Some(log_fd) = server.log_fd {
        keep.push(log_fd);
    }
    close_extraneous_fds(&keep);

    for m in moved {
        unsafe { libc::close(m) };
    }
}

/// Close every open descriptor at or above the reserved range that is
/// not in `keep`.
#[cfg(target_os = "linux")]
fn close_extraneous_fds(keep: &[RawFd]) {
    let Ok(entries) = std::fs::read_dir("/proc/self/fd") else {
        return;
    };
    let mut to_close: Vec<RawFd> = Vec::new();
    for entry in entries.flatten() {
        if let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>()
        {
            // the read_dir fd itself shows up here; closing it after
            // the scan is harmless, closing keepers is not
            if fd >= RESERVED_FDS && !keep.contains(&fd) {
                to_close.push(fd);
            }
        }
    }
    for fd in to_close {
        unsafe { libc::close(fd) };
    }
}

#[cfg(not(target_os = "linux"))]
fn close_extraneous_fds(keep: &[RawFd]) {
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } as RawFd;
    for fd in RESERVED_FDS..max.max(RESERVED_FDS) {
        if !keep.contains(&fd) {
            unsafe { libc::close(fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{IoSliceMut, Read, Write},
        os::fd::FromRawFd,
        path::PathBuf,
        time::Instant,
    };

    use nix::sys::socket::{
        AddressFamily, ControlMessageOwned, SockFlag, SockType, recvmsg,
        socketpair,
    };
    use zygote_common::protocol::{
        MAX_ATTACHED_FDS, MAX_MESSAGE_LEN, Reply, Request,
    };

    use super::*;
    use crate::{
        fd_cache::PathPolicy,
        server::{ServerOptions, ZygoteServer},
    };

    const CLIENT_PID: i32 = 12345;

    struct Rig {
        server: ZygoteServer,
        client_end: OwnedFd,
        _canary_client: OwnedFd,
    }

    fn rig() -> Rig {
        let (client_end, server_end) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        let (canary_client, canary_server) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        let opts = ServerOptions {
            // tempdirs live under /tmp, blocked by the default deny list
            policy: PathPolicy {
                required_suffix: ".pak".to_string(),
                denied_prefixes: vec![PathBuf::from("/etc")],
            },
            ..ServerOptions::default()
        };
        Rig {
            server: ZygoteServer::new(
                server_end,
                canary_server,
                PathBuf::from("/tmp/zygote-dispatch-test.lock"),
                opts,
            ),
            client_end,
            _canary_client: canary_client,
        }
    }

    fn recv_reply(fd: &OwnedFd) -> (Vec<u8>, Vec<OwnedFd>) {
        let mut buf = vec![0u8; MAX_MESSAGE_LEN];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_ATTACHED_FDS]);
        let (n, fds) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = recvmsg::<()>(
                fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC | MsgFlags::MSG_DONTWAIT,
            )
            .expect("a reply datagram should be waiting");
            let mut fds = Vec::new();
            for cmsg in msg.cmsgs().unwrap() {
                if let ControlMessageOwned::ScmRights(received) = cmsg {
                    for raw in received {
                        fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                    }
                }
            }
            (msg.bytes, fds)
        };
        buf.truncate(n);
        (buf, fds)
    }

    fn assert_no_reply(fd: &OwnedFd) {
        let mut buf = [0u8; 16];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let res = recvmsg::<()>(
            fd.as_raw_fd(),
            &mut iov,
            None,
            MsgFlags::MSG_DONTWAIT,
        );
        assert!(
            matches!(res, Err(nix::errno::Errno::EAGAIN)),
            "expected no reply, got {res:?}"
        );
    }

    #[test]
    fn ping_is_ponged() {
        let mut r = rig();
        let bytes = Request::Ping.encode(CLIENT_PID);
        let out = dispatch(&mut r.server, &bytes, vec![]).unwrap();
        assert!(matches!(out, Dispatch::Handled));

        let (buf, fds) = recv_reply(&r.client_end);
        assert_eq!(
            Reply::decode(&buf, CLIENT_PID).unwrap(),
            Reply::Ponged
        );
        assert!(fds.is_empty());
    }

    #[test]
    fn repeated_pings_never_touch_the_cache_or_attach_fds() {
        let mut r = rig();
        let bytes = Request::Ping.encode(CLIENT_PID);
        for _ in 0..100 {
            dispatch(&mut r.server, &bytes, vec![]).unwrap();
            let (buf, fds) = recv_reply(&r.client_end);
            assert_eq!(
                Reply::decode(&buf, CLIENT_PID).unwrap(),
                Reply::Ponged
            );
            assert!(fds.is_empty());
        }
        assert!(r.server.cache.is_empty());
    }

    #[test]
    fn ping_with_stray_descriptors_closes_them_and_still_answers() {
        let mut r = rig();
        let (stray, _peer) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        let bytes = Request::Ping.encode(CLIENT_PID);
        dispatch(&mut r.server, &bytes, vec![stray]).unwrap();

        // the stray is owned by the dispatcher and closed there; the
        // violation is logged, not fatal, and the reply still comes
        let (buf, fds) = recv_reply(&r.client_end);
        assert_eq!(Reply::decode(&buf, CLIENT_PID).unwrap(), Reply::Ponged);
        assert!(fds.is_empty());
    }

    #[test]
    fn malformed_request_is_dropped_without_reply() {
        let mut r = rig();
        let out =
            dispatch(&mut r.server, b"not a zygote message", vec![])
                .unwrap();
        assert!(matches!(out, Dispatch::Handled));
        assert_no_reply(&r.client_end);
    }

    #[test]
    fn open_serves_a_blessed_file_with_one_descriptor() {
        let mut r = rig();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strings.pak");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"resource bytes")
            .unwrap();
        let path = path.to_str().unwrap().to_string();

        let bytes = Request::Open { path: path.clone() }.encode(CLIENT_PID);
        dispatch(&mut r.server, &bytes, vec![]).unwrap();
        let (buf, mut fds) = recv_reply(&r.client_end);
        assert_eq!(
            Reply::decode(&buf, CLIENT_PID).unwrap(),
            Reply::Opened { errno: 0 }
        );
        assert_eq!(fds.len(), 1);

        let mut contents = String::new();
        std::fs::File::from(fds.pop().unwrap())
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "resource bytes");

        // second identical request is a cache hit, still one reply fd
        let before = r.server.cache.len();
        dispatch(&mut r.server, &bytes, vec![]).unwrap();
        let (_, fds) = recv_reply(&r.client_end);
        assert_eq!(fds.len(), 1);
        assert_eq!(r.server.cache.len(), before);
    }

    #[test]
    fn open_refuses_denied_path_with_eperm_and_no_descriptor() {
        let mut r = rig();
        let bytes = Request::Open {
            path: "/etc/passwd".to_string(),
        }
        .encode(CLIENT_PID);
        dispatch(&mut r.server, &bytes, vec![]).unwrap();
        let (buf, fds) = recv_reply(&r.client_end);
        assert_eq!(
            Reply::decode(&buf, CLIENT_PID).unwrap(),
            Reply::Opened {
                errno: libc::EPERM
            }
        );
        assert!(fds.is_empty());
        assert!(r.server.cache.is_empty());
    }

    #[test]
    fn fork_with_mismatched_remap_list_fails_and_closes_strays() {
        let mut r = rig();
        let bytes = Request::Fork {
            argv: vec!["/bin/true".to_string()],
            remap_targets: vec![9],
        }
        .encode(CLIENT_PID);

        // no descriptors attached although one remap entry was sent
        dispatch(&mut r.server, &bytes, vec![]).unwrap();
        let (buf, fds) = recv_reply(&r.client_end);
        assert_eq!(
            Reply::decode(&buf, CLIENT_PID).unwrap(),
            Reply::Forked {
                child_pid: -1,
                errno: -1
            }
        );
        assert!(fds.is_empty());
    }

    #[test]
    fn fork_refuses_reserved_target_numbers() {
        let mut r = rig();
        let bytes = Request::Fork {
            argv: vec!["/bin/true".to_string()],
            remap_targets: vec![CONTROL_FD],
        }
        .encode(CLIENT_PID);
        let (stray_a, _stray_b) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        dispatch(&mut r.server, &bytes, vec![stray_a]).unwrap();
        let (buf, _) = recv_reply(&r.client_end);
        assert_eq!(
            Reply::decode(&buf, CLIENT_PID).unwrap(),
            Reply::Forked {
                child_pid: -1,
                errno: -1
            }
        );
    }

    #[test]
    fn fork_refuses_targets_on_server_held_descriptors() {
        let mut r = rig();

        // put a live descriptor in the cache so it is at stake
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strings.pak");
        std::fs::File::create(&path).unwrap();
        let path = path.to_str().unwrap().to_string();
        let cached =
            r.server.cache.lookup_or_open(&path).unwrap().as_raw_fd();

        // a dup2 onto any of these would clobber the child's plumbing
        for held in [r.server.request.as_raw_fd(), cached] {
            let bytes = Request::Fork {
                argv: vec!["/bin/true".to_string()],
                remap_targets: vec![held],
            }
            .encode(CLIENT_PID);
            let (stray, _peer) = socketpair(
                AddressFamily::Unix,
                SockType::Datagram,
                None,
                SockFlag::SOCK_CLOEXEC,
            )
            .unwrap();
            dispatch(&mut r.server, &bytes, vec![stray]).unwrap();
            let (buf, fds) = recv_reply(&r.client_end);
            assert_eq!(
                Reply::decode(&buf, CLIENT_PID).unwrap(),
                Reply::Forked {
                    child_pid: -1,
                    errno: -1
                },
                "target {held} must be refused"
            );
            assert!(fds.is_empty());
        }
        assert_eq!(r.server.cache.len(), 1, "cache entry must survive");
    }

    #[test]
    fn reap_records_a_deadline_and_sends_no_reply() {
        let mut r = rig();
        let bytes = Request::Reap { target_pid: 4242 }.encode(CLIENT_PID);
        let before = Instant::now();
        dispatch(&mut r.server, &bytes, vec![]).unwrap();
        assert_no_reply(&r.client_end);

        let deadline = r.server.children[&4242].expect("deadline set");
        assert!(deadline >= before + r.server.reap.grace);
    }
}
