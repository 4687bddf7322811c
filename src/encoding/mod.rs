//! Deterministic binary encoding for changelog records and state files.
//!
//! Every byte written by this crate (log file headers, CSNs, update
//! messages, change-number index records) goes through the [`Encode`]
//! and [`Decode`] traits defined here, so the on-disk representation is
//! owned by the crate and stays stable across dependency upgrades.
//!
//! # Wire format
//!
//! | Rust type          | Encoding                                     |
//! |--------------------|----------------------------------------------|
//! | `u8`               | 1 byte                                       |
//! | `u16`              | 2 bytes, little-endian                       |
//! | `u32`              | 4 bytes, little-endian                       |
//! | `u64`              | 8 bytes, little-endian                       |
//! | `bool`             | 1 byte (`0x00` = false, `0x01` = true)       |
//! | `[u8; N]`          | `N` raw bytes (fixed-size, no length prefix) |
//! | `Vec<u8>` / bytes  | `[u32 len][bytes]`                           |
//! | `String`           | `[u32 len][utf-8 bytes]`                     |
//! | `Option<T>`        | `[u8 tag: 0=None, 1=Some][T if Some]`        |
//!
//! Lengths are encoded as `u32` and capped at [`MAX_BYTE_LEN`] on decode.
//!
//! No function in this module panics; all failures are reported as
//! [`EncodingError`].


use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Safety limits
// ------------------------------------------------------------------------------------------------

/// Maximum byte length accepted for a single `Vec<u8>` or `String`
/// during decoding (256 MiB).
pub const MAX_BYTE_LEN: u32 = 256 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// An enum discriminant or format tag was not recognised.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag {
        /// The tag value that was read.
        tag: u32,
        /// The type being decoded.
        type_name: &'static str,
    },

    /// A bool field contained a byte other than `0x00` or `0x01`.
    #[error("invalid bool byte: 0x{0:02X} (expected 0x00 or 0x01)")]
    InvalidBool(u8),

    /// A byte-sequence decoded as a string was not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A length exceeded its safety limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),

    /// Application-level decode error.
    #[error("{0}")]
    Custom(String),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` into a byte buffer.
///
/// Implementations must be deterministic: the same value always yields
/// the same bytes.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from a byte slice.
///
/// Returns `(value, bytes_consumed)` so callers can walk a buffer that
/// holds several encoded items back to back.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

// ------------------------------------------------------------------------------------------------
// Convenience functions
// ------------------------------------------------------------------------------------------------

/// Encode a value into a freshly-allocated `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the beginning of `buf`.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

/// Decode a value that must occupy the whole of `buf`.
///
/// Trailing bytes are reported as [`EncodingError::Custom`]; a record
/// payload carrying leftovers is treated as corrupt rather than silently
/// truncated.
pub fn decode_exact<T: Decode>(buf: &[u8]) -> Result<T, EncodingError> {
    let (value, consumed) = T::decode_from(buf)?;
    if consumed != buf.len() {
        return Err(EncodingError::Custom(format!(
            "{} trailing bytes after decoded value",
            buf.len() - consumed
        )));
    }
    Ok(value)
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

#[inline]
fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("length {len} exceeds u32::MAX")))
}

/// Copies the first `N` bytes of `buf` into an array.
#[inline]
fn take_array<const N: usize>(buf: &[u8]) -> Result<[u8; N], EncodingError> {
    require(buf, N)?;
    let mut arr = [0u8; N];
    arr.copy_from_slice(&buf[..N]);
    Ok(arr)
}

// ------------------------------------------------------------------------------------------------
// Unsigned integers
// ------------------------------------------------------------------------------------------------

macro_rules! impl_le_integer {
    ($($ty:ty),*) => {
        $(
            impl Encode for $ty {
                #[inline]
                fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
                    buf.extend_from_slice(&self.to_le_bytes());
                    Ok(())
                }
            }

            impl Decode for $ty {
                #[inline]
                fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
                    const WIDTH: usize = std::mem::size_of::<$ty>();
                    let bytes = take_array::<WIDTH>(buf)?;
                    Ok((<$ty>::from_le_bytes(bytes), WIDTH))
                }
            }
        )*
    };
}

impl_le_integer!(u8, u16, u32, u64);

// ------------------------------------------------------------------------------------------------
// bool
// ------------------------------------------------------------------------------------------------

impl Encode for bool {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        match buf[0] {
            0 => Ok((false, 1)),
            1 => Ok((true, 1)),
            other => Err(EncodingError::InvalidBool(other)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Fixed-size byte arrays
// ------------------------------------------------------------------------------------------------

impl<const N: usize> Encode for [u8; N] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        Ok((take_array::<N>(buf)?, N))
    }
}

// ------------------------------------------------------------------------------------------------
// Byte vectors and strings: [u32 len][bytes]
// ------------------------------------------------------------------------------------------------

/// Encode a byte slice as `[u32 len][bytes]`.
pub fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    len_to_u32(bytes.len())?.encode_to(buf)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Decode `[u32 len][bytes]`, borrowing the bytes from `buf`.
pub fn decode_bytes(buf: &[u8]) -> Result<(&[u8], usize), EncodingError> {
    let (len, offset) = u32::decode_from(buf)?;
    if len > MAX_BYTE_LEN {
        return Err(EncodingError::LengthOverflow(format!(
            "byte length {len} exceeds MAX_BYTE_LEN ({MAX_BYTE_LEN})"
        )));
    }
    let len = len as usize;
    require(&buf[offset..], len)?;
    Ok((&buf[offset..offset + len], offset + len))
}

impl Encode for Vec<u8> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encode_bytes(self, buf)
    }
}

impl Decode for Vec<u8> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (bytes, consumed) = decode_bytes(buf)?;
        Ok((bytes.to_vec(), consumed))
    }
}

impl Encode for String {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encode_bytes(self.as_bytes(), buf)
    }
}

impl Encode for &str {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encode_bytes(self.as_bytes(), buf)
    }
}

impl Decode for String {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (raw, consumed) = Vec::<u8>::decode_from(buf)?;
        Ok((String::from_utf8(raw)?, consumed))
    }
}

// ------------------------------------------------------------------------------------------------
// Option<T>: [u8 tag][T if Some]
// ------------------------------------------------------------------------------------------------

impl<T: Encode> Encode for Option<T> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            None => buf.push(0),
            Some(val) => {
                buf.push(1);
                val.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Option<T> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        match buf[0] {
            0 => Ok((None, 1)),
            1 => {
                let (val, consumed) = T::decode_from(&buf[1..])?;
                Ok((Some(val), 1 + consumed))
            }
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "Option<T>",
            }),
        }
    }
}
