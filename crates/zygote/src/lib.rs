//! A privileged zygote fork server.
//!
//! The manager process accepts requests over a local datagram channel
//! from client processes (including exec'd descendants of itself) and
//! performs process-lifecycle work on their behalf: liveness checks,
//! fork-with-argv-and-descriptor-remapping, termination bookkeeping and
//! privileged file opening with descriptor caching.

pub mod bootstrap;
pub mod client;
mod dispatch;
pub mod fd_cache;
pub mod server;

pub use bootstrap::{BootstrapError, CONTROL_FD, LOCK_FD, Spawned, start};
pub use client::{ClientError, ZygoteHost};
pub use fd_cache::PathPolicy;
pub use server::{ReapPolicy, ServerExit, ServerOptions};
