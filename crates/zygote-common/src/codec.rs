//! Tagged-value message buffer.
//!
//! Every control-channel message is a flat byte sequence of fixed-width
//! little-endian `i32`s and length-prefixed UTF-8 strings, preceded by a
//! 4-byte magic marker. Reads are cursor-based and bounds-checked: a
//! truncated buffer yields a [`CodecError`], never a read past the
//! supplied length.

use snafu::Snafu;

#[derive(Snafu, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[snafu(display("buffer truncated: wanted {wanted} more bytes, have {have}"))]
    Truncated { wanted: usize, have: usize },

    #[snafu(display("bad magic marker"))]
    BadMagic,

    #[snafu(display("negative length prefix: {len}"))]
    NegativeLength { len: i32 },

    #[snafu(display("string field is not valid UTF-8"))]
    BadUtf8,
}

/// Append-only writer half of the codec.
#[derive(Default)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_magic(&mut self, magic: &[u8; 4]) {
        self.buf.extend_from_slice(magic);
    }

    pub fn write_int(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_str(&mut self, s: &str) {
        self.write_int(s.len() as i32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Cursor-based reader over a received message of known length.
pub struct MessageReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> MessageReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let have = self.buf.len() - self.cursor;
        if have < n {
            return Err(CodecError::Truncated { wanted: n, have });
        }
        let out = &self.buf[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(out)
    }

    pub fn expect_magic(&mut self, magic: &[u8; 4]) -> Result<(), CodecError> {
        let got = self.take(4)?;
        if got == magic {
            Ok(())
        } else {
            Err(CodecError::BadMagic)
        }
    }

    pub fn read_int(&mut self) -> Result<i32, CodecError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }

    pub fn read_str(&mut self) -> Result<&'a str, CodecError> {
        let len = self.read_int()?;
        if len < 0 {
            return Err(CodecError::NegativeLength { len });
        }
        let bytes = self.take(len as usize)?;
        std::str::from_utf8(bytes).map_err(|_| CodecError::BadUtf8)
    }

    /// Bytes not yet consumed by the cursor.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }
}
