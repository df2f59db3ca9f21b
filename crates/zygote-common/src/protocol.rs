//! Request/reply protocol for the zygote control channel.
//!
//! Requests and replies share one tag space: a reply's [`Kind`] is its
//! request's tag with [`DONE_BIT`] folded in. Decoding produces a fully
//! typed variant or an error, never partially-initialized state. File
//! descriptors never appear in the payload itself; they ride alongside
//! the message as ancillary data, paired positionally with the
//! `remap_targets` of a Fork request (the Opened reply always carries
//! exactly one, so no count is encoded for it).

use std::os::fd::RawFd;

use num_enum::TryFromPrimitive;
use snafu::{ResultExt, Snafu};

use crate::codec::{CodecError, MessageReader, MessageWriter};

/// Magic marker at the front of every control-channel message.
pub const MAGIC: [u8; 4] = *b"zygo";

/// Hard cap on a single encoded message, request or reply.
pub const MAX_MESSAGE_LEN: usize = 8192;

/// Hard cap on descriptors attached to one message.
pub const MAX_ATTACHED_FDS: usize = 16;

/// Reply tags are their request tag with this bit set.
pub const DONE_BIT: i32 = 1 << 8;

// keeps a hostile argc from pre-allocating unbounded vectors; the
// message length cap bounds the real payload anyway
const MAX_FORK_ARGS: i32 = 1024;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive,
)]
#[repr(i32)]
pub enum Kind {
    Invalid = 0,
    Ping = 1,
    Fork = 2,
    Reap = 3,
    Open = 4,
    Ponged = DONE_BIT | 1,
    Forked = DONE_BIT | 2,
    Opened = DONE_BIT | 4,
}

impl From<Kind> for i32 {
    fn from(value: Kind) -> Self {
        value as i32
    }
}

#[derive(Snafu, Debug)]
pub enum ProtocolError {
    #[snafu(display("malformed message: {source}"))]
    Malformed { source: CodecError },

    #[snafu(display("unknown kind tag {raw}"))]
    UnknownKind { raw: i32 },

    #[snafu(display("kind {kind:?} is not valid here"))]
    WrongKind { kind: Kind },

    #[snafu(display("reply addressed to pid {got}, expected {want}"))]
    PidMismatch { got: i32, want: i32 },

    #[snafu(display("fork argc {argc} out of range"))]
    BadArgc { argc: i32 },

    #[snafu(display("fd count {count} exceeds limit of {MAX_ATTACHED_FDS}"))]
    TooManyFds { count: i32 },
}

/// Client requests to the zygote manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    /// Fork a new child. `remap_targets[i]` is the descriptor number the
    /// child should see the i-th attached descriptor as.
    Fork {
        argv: Vec<String>,
        remap_targets: Vec<RawFd>,
    },
    /// Bounded-time termination bookkeeping for `target_pid`. Never
    /// answered.
    Reap { target_pid: i32 },
    /// Privileged open of a blessed resource file.
    Open { path: String },
}

/// Manager replies. `Reap` has no reply by design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ponged,
    Forked { child_pid: i32, errno: i32 },
    /// `errno == 0` means exactly one descriptor rode along.
    Opened { errno: i32 },
}

/// A decoded request together with the sender it claims to be from.
#[derive(Debug)]
pub struct DecodedRequest {
    pub sender_pid: i32,
    pub request: Request,
}

fn envelope(sender_pid: i32, kind: Kind) -> MessageWriter {
    let mut w = MessageWriter::new();
    w.write_magic(&MAGIC);
    w.write_int(sender_pid);
    w.write_int(kind.into());
    w
}

fn decode_envelope(r: &mut MessageReader<'_>) -> Result<(i32, Kind), ProtocolError> {
    r.expect_magic(&MAGIC).context(MalformedSnafu)?;
    let sender_pid = r.read_int().context(MalformedSnafu)?;
    let raw = r.read_int().context(MalformedSnafu)?;
    let kind = Kind::try_from(raw)
        .map_err(|_| ProtocolError::UnknownKind { raw })?;
    Ok((sender_pid, kind))
}

impl Request {
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Request::Ping => Kind::Ping,
            Request::Fork { .. } => Kind::Fork,
            Request::Reap { .. } => Kind::Reap,
            Request::Open { .. } => Kind::Open,
        }
    }

    #[must_use]
    pub fn encode(&self, sender_pid: i32) -> Vec<u8> {
        let mut w = envelope(sender_pid, self.kind());
        match self {
            Request::Ping => {}
            Request::Fork {
                argv,
                remap_targets,
            } => {
                w.write_int(argv.len() as i32);
                for arg in argv {
                    w.write_str(arg);
                }
                w.write_int(remap_targets.len() as i32);
                for target in remap_targets {
                    w.write_int(*target);
                }
            }
            Request::Reap { target_pid } => w.write_int(*target_pid),
            Request::Open { path } => w.write_str(path),
        }
        w.into_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<DecodedRequest, ProtocolError> {
        let mut r = MessageReader::new(buf);
        let (sender_pid, kind) = decode_envelope(&mut r)?;

        let request = match kind {
            Kind::Ping => Request::Ping,
            Kind::Fork => {
                let argc = r.read_int().context(MalformedSnafu)?;
                if !(0..=MAX_FORK_ARGS).contains(&argc) {
                    return Err(ProtocolError::BadArgc { argc });
                }
                let mut argv = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    argv.push(
                        r.read_str().context(MalformedSnafu)?.to_owned(),
                    );
                }
                let fd_count = r.read_int().context(MalformedSnafu)?;
                if !(0..=MAX_ATTACHED_FDS as i32).contains(&fd_count) {
                    return Err(ProtocolError::TooManyFds {
                        count: fd_count,
                    });
                }
                let mut remap_targets = Vec::with_capacity(fd_count as usize);
                for _ in 0..fd_count {
                    remap_targets.push(r.read_int().context(MalformedSnafu)?);
                }
                Request::Fork {
                    argv,
                    remap_targets,
                }
            }
            Kind::Reap => Request::Reap {
                target_pid: r.read_int().context(MalformedSnafu)?,
            },
            Kind::Open => Request::Open {
                path: r.read_str().context(MalformedSnafu)?.to_owned(),
            },
            other => return Err(ProtocolError::WrongKind { kind: other }),
        };

        Ok(DecodedRequest {
            sender_pid,
            request,
        })
    }
}

impl Reply {
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Reply::Ponged => Kind::Ponged,
            Reply::Forked { .. } => Kind::Forked,
            Reply::Opened { .. } => Kind::Opened,
        }
    }

    /// Replies echo the pid of the client they answer, not the server's.
    #[must_use]
    pub fn encode(&self, requester_pid: i32) -> Vec<u8> {
        let mut w = envelope(requester_pid, self.kind());
        match self {
            Reply::Ponged => {}
            Reply::Forked { child_pid, errno } => {
                w.write_int(*child_pid);
                w.write_int(*errno);
            }
            Reply::Opened { errno } => w.write_int(*errno),
        }
        w.into_bytes()
    }

    /// Decode a reply and reject one addressed to anyone but `own_pid`.
    pub fn decode(buf: &[u8], own_pid: i32) -> Result<Reply, ProtocolError> {
        let mut r = MessageReader::new(buf);
        let (echoed_pid, kind) = decode_envelope(&mut r)?;
        if echoed_pid != own_pid {
            return Err(ProtocolError::PidMismatch {
                got: echoed_pid,
                want: own_pid,
            });
        }

        match kind {
            Kind::Ponged => Ok(Reply::Ponged),
            Kind::Forked => Ok(Reply::Forked {
                child_pid: r.read_int().context(MalformedSnafu)?,
                errno: r.read_int().context(MalformedSnafu)?,
            }),
            Kind::Opened => Ok(Reply::Opened {
                errno: r.read_int().context(MalformedSnafu)?,
            }),
            other => Err(ProtocolError::WrongKind { kind: other }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_request(req: Request) {
        let bytes = req.encode(4321);
        assert!(bytes.len() <= MAX_MESSAGE_LEN);
        let decoded = Request::decode(&bytes).expect("decode");
        assert_eq!(decoded.sender_pid, 4321);
        assert_eq!(decoded.request, req);
    }

    #[test]
    fn request_round_trips_every_kind() {
        round_trip_request(Request::Ping);
        round_trip_request(Request::Fork {
            argv: vec!["/bin/true".into(), "--flag".into()],
            remap_targets: vec![0, 1, 7],
        });
        round_trip_request(Request::Fork {
            argv: vec![],
            remap_targets: vec![],
        });
        round_trip_request(Request::Reap { target_pid: 999 });
        round_trip_request(Request::Open {
            path: "/opt/app/resources/strings.pak".into(),
        });
    }

    #[test]
    fn reply_round_trips_every_kind() {
        for reply in [
            Reply::Ponged,
            Reply::Forked {
                child_pid: 17,
                errno: 0,
            },
            Reply::Forked {
                child_pid: -1,
                errno: 11,
            },
            Reply::Opened { errno: 0 },
            Reply::Opened { errno: 13 },
        ] {
            let bytes = reply.encode(77);
            assert_eq!(Reply::decode(&bytes, 77).expect("decode"), reply);
        }
    }

    #[test]
    fn reply_for_someone_else_is_rejected() {
        let bytes = Reply::Ponged.encode(77);
        let err = Reply::decode(&bytes, 78).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::PidMismatch { got: 77, want: 78 }
        ));
    }

    #[test]
    fn request_tag_in_reply_position_is_rejected() {
        let bytes = Request::Ping.encode(1);
        assert!(matches!(
            Reply::decode(&bytes, 1),
            Err(ProtocolError::WrongKind { kind: Kind::Ping })
        ));
    }

    #[test]
    fn reply_tag_in_request_position_is_rejected() {
        let bytes = Reply::Ponged.encode(1);
        assert!(matches!(
            Request::decode(&bytes),
            Err(ProtocolError::WrongKind { kind: Kind::Ponged })
        ));
    }

    #[test]
    fn foreign_protocol_is_rejected_deterministically() {
        let mut bytes = Request::Ping.encode(1);
        bytes[0] ^= 0xff;
        assert!(matches!(
            Request::decode(&bytes),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn unknown_kind_tag_is_rejected() {
        let mut w = MessageWriter::new();
        w.write_magic(&MAGIC);
        w.write_int(1);
        w.write_int(0x7777);
        assert!(matches!(
            Request::decode(&w.into_bytes()),
            Err(ProtocolError::UnknownKind { raw: 0x7777 })
        ));
    }

    #[test]
    fn truncated_fork_payload_is_malformed_not_partial() {
        let req = Request::Fork {
            argv: vec!["/bin/true".into()],
            remap_targets: vec![3],
        };
        let bytes = req.encode(1);
        for cut in 0..bytes.len() {
            // every prefix either fails cleanly or (never) succeeds
            assert!(Request::decode(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn hostile_fd_count_is_capped() {
        let mut w = MessageWriter::new();
        w.write_magic(&MAGIC);
        w.write_int(1);
        w.write_int(Kind::Fork.into());
        w.write_int(0); // argc
        w.write_int(1_000_000); // fd count
        assert!(matches!(
            Request::decode(&w.into_bytes()),
            Err(ProtocolError::TooManyFds { count: 1_000_000 })
        ));
    }
}
