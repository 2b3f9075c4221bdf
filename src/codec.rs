//! Binary codec for kernel inotify records.
//!
//! Format (host-native byte order, matching `struct inotify_event`):
//! ```text
//! [wd: i32][mask: u32][cookie: u32][len: u32][name: len bytes, NUL padded]
//! ```
//! `len` counts the padding; the kernel pads names to a multiple of the
//! header size and always includes at least one terminating NUL.

use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::mask::EventMask;

/// Size of the fixed record header.
pub const HEADER_LEN: usize = std::mem::size_of::<libc::inotify_event>();

/// Largest name field accepted before the buffer is considered corrupt.
pub const MAX_NAME_LEN: usize = libc::PATH_MAX as usize;

/// Kernel watch descriptor.
///
/// Unique among live watches on one handle; the kernel may hand the same
/// value out again after the watch is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchId(pub i32);

impl WatchId {
    /// The descriptor the kernel uses for queue-overflow records.
    pub const OVERFLOW: Self = Self(-1);

    /// The raw descriptor value.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wd#{}", self.0)
    }
}

/// One decoded kernel record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Descriptor of the watch the record belongs to.
    pub watch_id: WatchId,
    /// Reported condition bits.
    pub mask: EventMask,
    /// Non-zero only for the two halves of a rename.
    pub cookie: u32,
    /// Entry name relative to the watched directory.
    pub name: Option<PathBuf>,
}

impl RawEvent {
    /// Total encoded size of this record with kernel-style padding.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + padded_name_len(self.name.as_deref())
    }
}

fn padded_name_len(name: Option<&Path>) -> usize {
    match name {
        None => 0,
        Some(name) => {
            let raw = name.as_os_str().as_bytes().len();
            if raw == 0 {
                0
            } else {
                (raw + 1).div_ceil(HEADER_LEN) * HEADER_LEN
            }
        }
    }
}

/// Returns the full length of the record at the start of `buf`.
///
/// # Errors
/// - `ShortRead` if the header itself is not fully buffered
/// - `NameTooLong` if the declared name length is implausible
pub fn record_len(buf: &[u8]) -> Result<usize, DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::ShortRead {
            needed: HEADER_LEN,
            available: buf.len(),
        });
    }
    let name_len = read_u32(buf, 12) as usize;
    if name_len > MAX_NAME_LEN {
        return Err(DecodeError::NameTooLong {
            len: name_len,
            max: MAX_NAME_LEN,
        });
    }
    Ok(HEADER_LEN + name_len)
}

/// Decodes one record from the start of `buf`.
///
/// Returns the event and the number of bytes consumed. Pure: nothing is
/// retained between calls.
///
/// # Errors
/// - `ShortRead` if fewer bytes are buffered than the record declares
/// - `NameTooLong` if the declared name length is implausible
pub fn decode(buf: &[u8]) -> Result<(RawEvent, usize), DecodeError> {
    let total = record_len(buf)?;
    if buf.len() < total {
        return Err(DecodeError::ShortRead {
            needed: total,
            available: buf.len(),
        });
    }

    let watch_id = WatchId(read_i32(buf, 0));
    let mask = EventMask::from_bits_retain(read_u32(buf, 4));
    let cookie = read_u32(buf, 8);

    let raw_name = &buf[HEADER_LEN..total];
    let end = raw_name.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let name = (end > 0).then(|| PathBuf::from(OsStr::from_bytes(&raw_name[..end])));

    Ok((
        RawEvent {
            watch_id,
            mask,
            cookie,
            name,
        },
        total,
    ))
}

/// Encodes a record the way the kernel lays it out.
#[must_use]
pub fn encode(event: &RawEvent) -> Vec<u8> {
    let name_len = padded_name_len(event.name.as_deref());

    let mut out = Vec::with_capacity(HEADER_LEN + name_len);
    out.extend_from_slice(&event.watch_id.0.to_ne_bytes());
    out.extend_from_slice(&event.mask.bits().to_ne_bytes());
    out.extend_from_slice(&event.cookie.to_ne_bytes());
    out.extend_from_slice(&(name_len as u32).to_ne_bytes());
    if let Some(name) = event.name.as_deref() {
        let bytes = name.as_os_str().as_bytes();
        out.extend_from_slice(bytes);
        out.resize(HEADER_LEN + name_len, 0);
    }
    out
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_ne_bytes(word)
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    i32::from_ne_bytes(word)
}
