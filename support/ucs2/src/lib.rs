// UNSAFETY: reinterpreting validated `[u8]` buffers as the `Ucs2LeSlice`
// wrapper type.
#![expect(unsafe_code)]

//! Wrappers around possibly misaligned `[u8]` buffers containing UCS-2 LE data.
//!
//! UEFI variable names are sequences of 16-bit code units, and they reach this
//! process embedded in byte buffers with no alignment guarantees. These types
//! carry such names around without ever producing a `&[u16]`.

use std::fmt;
use thiserror::Error;

/// Errors which may occur while parsing UCS-2
#[derive(Debug, Error)]
pub enum Ucs2ParseError {
    /// buffer's length was not a multiple of 2
    #[error("buffer's length was not a multiple of 2")]
    NotMultiple2,
    /// buffer did not contain a null terminator
    #[error("buffer did not contain a null terminator")]
    MissingNullTerm,
}

/// Wrapper around `[u8]` containing a valid null-terminated UCS-2 LE string.
///
/// **This type is not FFI compatible with `*const u16`!** The backing storage
/// is a `[u8]`, so the data is _not_ guaranteed to be `u16` aligned.
///
/// # Example
///
/// ```
/// # use ucs2::Ucs2LeSlice;
/// let raw = [b'O', 0, b'K', 0, 0, 0];
/// let s = Ucs2LeSlice::from_slice_with_nul(&raw).unwrap();
/// assert_eq!(s.as_bytes().len(), raw.len());
/// assert_eq!(s.to_string(), "OK");
/// ```
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Ucs2LeSlice([u8]);

impl Ucs2LeSlice {
    /// Validate that the provided `&[u8]` is a valid null-terminated UCS-2 LE
    /// string, truncating the slice to the position of the first null u16.
    pub fn from_slice_with_nul(buf: &[u8]) -> Result<&Ucs2LeSlice, Ucs2ParseError> {
        if buf.len() % 2 != 0 {
            return Err(Ucs2ParseError::NotMultiple2);
        }

        // UCS-2 needs no semantic validation beyond framing: every value in
        // 0..=0xFFFF is a valid code unit.
        let mut end = None;
        for (i, pair) in buf.chunks_exact(2).enumerate() {
            if pair == [0, 0] {
                end = Some((i + 1) * 2);
                break;
            }
        }

        match end {
            None => Err(Ucs2ParseError::MissingNullTerm),
            // SAFETY: validated + truncated to the first null terminator
            Some(end) => Ok(unsafe { Self::from_slice_unchecked(&buf[..end]) }),
        }
    }

    /// Reinterpret a raw `&[u8]` without performing any validation.
    ///
    /// # Safety
    ///
    /// Callers must ensure the buf has a length that is a multiple of 2 and
    /// terminates with exactly one null u16.
    unsafe fn from_slice_unchecked(buf: &[u8]) -> &Ucs2LeSlice {
        // SAFETY: `Ucs2LeSlice` is a repr(transparent) wrapper around [u8]
        unsafe { &*(buf as *const [u8] as *const Ucs2LeSlice) }
    }

    /// View the underlying data as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// View the underlying data as raw bytes, without the trailing null `u16`.
    pub fn as_bytes_without_nul(&self) -> &[u8] {
        &self.0[..self.0.len() - 2]
    }

    /// Copies `self` into a new [`Ucs2LeVec`].
    pub fn to_ucs2_le_vec(&self) -> Ucs2LeVec {
        Ucs2LeVec(self.0.to_vec())
    }

    fn code_units(&self) -> impl Iterator<Item = u16> + '_ {
        self.0
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&c| c != 0)
    }

    fn to_string_inner(&self) -> String {
        // Code units in the surrogate range are not strictly UTF-16, but this
        // conversion is only used for human-readable output.
        String::from_utf16_lossy(&self.code_units().collect::<Vec<u16>>())
    }
}

impl<'a> Default for &'a Ucs2LeSlice {
    fn default() -> &'a Ucs2LeSlice {
        // SAFETY: [0, 0] is a valid null-terminated UCS-2 LE string
        unsafe { Ucs2LeSlice::from_slice_unchecked(&[0, 0]) }
    }
}

impl ToOwned for Ucs2LeSlice {
    type Owned = Ucs2LeVec;

    fn to_owned(&self) -> Ucs2LeVec {
        self.to_ucs2_le_vec()
    }
}

impl fmt::Debug for Ucs2LeSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.to_string_inner(), f)
    }
}

impl fmt::Display for Ucs2LeSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_string_inner(), f)
    }
}

/// Wrapper around `Vec<u8>` containing a valid null-terminated UCS-2 LE string.
///
/// Like [`Ucs2LeSlice`], the backing data is a byte buffer with no `u16`
/// alignment guarantee.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ucs2LeVec(Vec<u8>);

impl Ucs2LeVec {
    /// Validate that the provided `Vec<u8>` is a valid null-terminated UCS-2 LE
    /// string, truncating the vec to the position of the first null u16.
    pub fn from_vec_with_nul(mut buf: Vec<u8>) -> Result<Ucs2LeVec, Ucs2ParseError> {
        let valid_len = Ucs2LeSlice::from_slice_with_nul(&buf)?.as_bytes().len();
        buf.truncate(valid_len);
        Ok(Ucs2LeVec(buf))
    }

    /// Consume self, returning the underlying raw `Vec<u8>`
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl Default for Ucs2LeVec {
    fn default() -> Ucs2LeVec {
        <&Ucs2LeSlice>::default().to_ucs2_le_vec()
    }
}

impl AsRef<Ucs2LeSlice> for Ucs2LeVec {
    fn as_ref(&self) -> &Ucs2LeSlice {
        // SAFETY: Ucs2LeVec can only contain valid UCS-2 data
        unsafe { Ucs2LeSlice::from_slice_unchecked(&self.0) }
    }
}

impl std::ops::Deref for Ucs2LeVec {
    type Target = Ucs2LeSlice;

    fn deref(&self) -> &Ucs2LeSlice {
        self.as_ref()
    }
}

impl std::borrow::Borrow<Ucs2LeSlice> for Ucs2LeVec {
    fn borrow(&self) -> &Ucs2LeSlice {
        self.as_ref()
    }
}

impl<'a> From<&'a Ucs2LeSlice> for std::borrow::Cow<'a, Ucs2LeSlice> {
    fn from(val: &'a Ucs2LeSlice) -> Self {
        std::borrow::Cow::Borrowed(val)
    }
}

impl From<Ucs2LeVec> for std::borrow::Cow<'_, Ucs2LeSlice> {
    fn from(val: Ucs2LeVec) -> Self {
        std::borrow::Cow::Owned(val)
    }
}

impl<'a> From<&'a str> for Ucs2LeVec {
    fn from(s: &'a str) -> Ucs2LeVec {
        let buf = s
            .encode_utf16()
            .chain(Some(0))
            .flat_map(u16::to_le_bytes)
            .collect::<Vec<u8>>();
        Ucs2LeVec(buf)
    }
}

impl From<String> for Ucs2LeVec {
    fn from(s: String) -> Ucs2LeVec {
        Ucs2LeVec::from(s.as_str())
    }
}

impl fmt::Debug for Ucs2LeVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.as_ref(), f)
    }
}

impl fmt::Display for Ucs2LeVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.as_ref(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16_bytes(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    #[test]
    fn smoke() {
        let raw = utf16_bytes("hello!\0");
        let s = Ucs2LeSlice::from_slice_with_nul(&raw).unwrap();
        assert_eq!(s.as_bytes().len(), raw.len());
        assert_eq!(s.as_bytes_without_nul().len(), raw.len() - 2);
        assert_eq!(s.to_string(), "hello!");
    }

    #[test]
    fn truncates_at_interior_null() {
        let raw = utf16_bytes("hello!\0extra");
        let expected = utf16_bytes("hello!\0");

        let s = Ucs2LeSlice::from_slice_with_nul(&raw).unwrap();
        assert_eq!(s.as_bytes(), expected);
    }

    #[test]
    fn empty_string() {
        let s = Ucs2LeSlice::from_slice_with_nul(&[0, 0]).unwrap();
        assert_eq!(s.as_bytes(), [0, 0]);
        assert_eq!(s.as_bytes_without_nul(), []);
        assert_eq!(s, <&Ucs2LeSlice>::default());
    }

    #[test]
    fn odd_length() {
        let mut raw = utf16_bytes("oops\0");
        raw.push(0);
        let res = Ucs2LeSlice::from_slice_with_nul(&raw);
        assert!(matches!(res, Err(Ucs2ParseError::NotMultiple2)));
    }

    #[test]
    fn missing_null_term() {
        let raw = utf16_bytes("oops");
        let res = Ucs2LeSlice::from_slice_with_nul(&raw);
        assert!(matches!(res, Err(Ucs2ParseError::MissingNullTerm)));
    }

    #[test]
    fn from_str_round_trip() {
        let v = Ucs2LeVec::from("PK");
        assert_eq!(v.as_bytes(), [b'P', 0, b'K', 0, 0, 0]);
        assert_eq!(v.to_string(), "PK");

        let v2 = Ucs2LeVec::from_vec_with_nul(v.clone().into_inner()).unwrap();
        assert_eq!(v, v2);
    }
}
