//! Bounds-checked payload reader
//!
//! MSP payload fields are little-endian. Decoders check the minimum length
//! of a message up front with [`require`]; the reader still refuses to run
//! past the end so a layout mistake turns into an error instead of a panic.

use super::dispatch::DispatchError;
use bytes::Buf;

/// Fail with `TooShort` unless `payload` holds at least `expected` bytes
#[inline]
pub fn require(payload: &[u8], expected: usize) -> Result<(), DispatchError> {
    if payload.len() < expected {
        Err(DispatchError::TooShort {
            expected,
            actual: payload.len(),
        })
    } else {
        Ok(())
    }
}

/// Sequential little-endian reader over a payload
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    len: usize,
}

macro_rules! read_le {
    ($name:ident, $ty:ty, $get:ident) => {
        pub fn $name(&mut self) -> Result<$ty, DispatchError> {
            self.ensure(std::mem::size_of::<$ty>())?;
            Ok(self.buf.$get())
        }
    };
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, len: buf.len() }
    }

    /// Bytes not consumed yet
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Offset of the next byte
    pub fn position(&self) -> usize {
        self.len - self.buf.len()
    }

    fn ensure(&self, n: usize) -> Result<(), DispatchError> {
        if self.buf.len() < n {
            Err(DispatchError::TooShort {
                expected: self.position() + n,
                actual: self.len,
            })
        } else {
            Ok(())
        }
    }

    read_le!(u8, u8, get_u8);
    read_le!(i8, i8, get_i8);
    read_le!(u16, u16, get_u16_le);
    read_le!(i16, i16, get_i16_le);
    read_le!(u32, u32, get_u32_le);
    read_le!(i32, i32, get_i32_le);

    pub fn bool(&mut self) -> Result<bool, DispatchError> {
        Ok(self.u8()? != 0)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DispatchError> {
        self.ensure(n)?;
        self.buf.advance(n);
        Ok(())
    }

    /// Next `n` bytes as text (lossy, trailing NULs trimmed)
    pub fn text(&mut self, n: usize) -> Result<String, DispatchError> {
        self.ensure(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(String::from_utf8_lossy(head)
            .trim_end_matches('\0')
            .to_string())
    }

    /// Everything left
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }
}

/// Split a `;`-separated name list
///
/// Entries are terminated by `;`; bytes after the last delimiter are kept as
/// a final entry when present.
pub fn name_list(payload: &[u8]) -> Vec<String> {
    let mut names: Vec<String> = payload
        .split(|&b| b == b';')
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    if names.last().is_some_and(|s| s.is_empty()) {
        names.pop();
    }
    names
}
