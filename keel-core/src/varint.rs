//! The CompactSize encoding used for counts and lengths on the wire.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("input truncated: needed {needed} more byte(s)")]
    Truncated { needed: usize },
    #[error("non-canonical varint encoding")]
    NonCanonical,
}

/// Number of bytes the encoding of `n` occupies.
pub fn size(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Appends the encoding of `n` to `buf`.
pub fn write(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// Decodes a varint from the front of `buf`, returning the value and the
/// number of bytes consumed.
pub fn read(buf: &[u8]) -> Result<(u64, usize), DecodeError> {
    let first = *buf.first().ok_or(DecodeError::Truncated { needed: 1 })?;

    let take = |len: usize| -> Result<&[u8], DecodeError> {
        buf.get(1..1 + len).ok_or(DecodeError::Truncated {
            needed: 1 + len - buf.len(),
        })
    };

    match first {
        0xfd => {
            let n = u16::from_le_bytes(take(2)?.try_into().unwrap()) as u64;
            if n < 0xfd {
                return Err(DecodeError::NonCanonical);
            }
            Ok((n, 3))
        }
        0xfe => {
            let n = u32::from_le_bytes(take(4)?.try_into().unwrap()) as u64;
            if n <= 0xffff {
                return Err(DecodeError::NonCanonical);
            }
            Ok((n, 5))
        }
        0xff => {
            let n = u64::from_le_bytes(take(8)?.try_into().unwrap());
            if n <= 0xffff_ffff {
                return Err(DecodeError::NonCanonical);
            }
            Ok((n, 9))
        }
        n => Ok((n as u64, 1)),
    }
}
