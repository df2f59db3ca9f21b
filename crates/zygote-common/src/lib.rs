//! Wire-level half of the zygote fork server: the tagged-value message
//! codec and the request/reply protocol types shared by the server and
//! client crates.

pub mod codec;
pub mod protocol;
