//! Typed inotify event masks.
//!
//! `EventMask` covers both halves of the kernel's mask word: the bits a caller
//! may request for a watch, and the report-only bits the kernel sets on its
//! own (invalidation, overflow, unmount, is-directory).

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{NotifyError, NotifyResult};

bitflags! {
    /// A set of inotify condition bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct EventMask: u32 {
        /// File was read.
        const ACCESS = libc::IN_ACCESS;
        /// File was written.
        const MODIFY = libc::IN_MODIFY;
        /// Metadata (permissions, timestamps, xattrs, link count, owner) changed.
        const ATTRIB = libc::IN_ATTRIB;
        /// File opened for writing was closed.
        const CLOSE_WRITE = libc::IN_CLOSE_WRITE;
        /// File not opened for writing was closed.
        const CLOSE_NOWRITE = libc::IN_CLOSE_NOWRITE;
        /// File or directory was opened.
        const OPEN = libc::IN_OPEN;
        /// Entry was moved out of the watched directory.
        const MOVED_FROM = libc::IN_MOVED_FROM;
        /// Entry was moved into the watched directory.
        const MOVED_TO = libc::IN_MOVED_TO;
        /// Entry was created in the watched directory.
        const CREATE = libc::IN_CREATE;
        /// Entry was deleted from the watched directory.
        const DELETE = libc::IN_DELETE;
        /// The watched path itself was deleted.
        const DELETE_SELF = libc::IN_DELETE_SELF;
        /// The watched path itself was moved.
        const MOVE_SELF = libc::IN_MOVE_SELF;

        /// Report-only: the filesystem backing the watch was unmounted.
        const UNMOUNT = libc::IN_UNMOUNT;
        /// Report-only: the kernel event queue overflowed.
        const Q_OVERFLOW = libc::IN_Q_OVERFLOW;
        /// Report-only: the watch was removed by the kernel; nothing more will arrive for it.
        const IGNORED = libc::IN_IGNORED;
        /// Report-only: the subject of the event is a directory.
        const ISDIR = libc::IN_ISDIR;
    }
}

macro_rules! mask_predicates {
    ($($(#[$doc:meta])* $name:ident => $flag:ident;)*) => {
        $(
            $(#[$doc])*
            #[must_use]
            pub const fn $name(self) -> bool {
                self.contains(Self::$flag)
            }
        )*
    };
}

impl EventMask {
    /// Every bit a caller may request.
    pub const ALL_EVENTS: Self = Self::from_bits_retain(libc::IN_ALL_EVENTS);

    /// Bits the kernel reports but never accepts in a request.
    pub const REPORT_ONLY: Self = Self::from_bits_retain(
        libc::IN_UNMOUNT | libc::IN_Q_OVERFLOW | libc::IN_IGNORED | libc::IN_ISDIR,
    );

    /// Report-only bits that are delivered regardless of what was requested.
    pub const ALWAYS_DELIVERED: Self =
        Self::from_bits_retain(libc::IN_UNMOUNT | libc::IN_Q_OVERFLOW | libc::IN_IGNORED);

    /// Either half of a rename.
    pub const MOVE: Self = Self::from_bits_retain(libc::IN_MOVED_FROM | libc::IN_MOVED_TO);

    /// Either flavor of close.
    pub const CLOSE: Self = Self::from_bits_retain(libc::IN_CLOSE_WRITE | libc::IN_CLOSE_NOWRITE);

    mask_predicates! {
        /// File was read.
        is_access => ACCESS;
        /// File was written.
        is_modify => MODIFY;
        /// Metadata changed.
        is_attrib => ATTRIB;
        /// Writable file was closed.
        is_close_write => CLOSE_WRITE;
        /// Read-only file was closed.
        is_close_nowrite => CLOSE_NOWRITE;
        /// Opened.
        is_open => OPEN;
        /// First half of a rename.
        is_moved_from => MOVED_FROM;
        /// Second half of a rename.
        is_moved_to => MOVED_TO;
        /// Entry created.
        is_create => CREATE;
        /// Entry deleted.
        is_delete => DELETE;
        /// Watched path deleted.
        is_delete_self => DELETE_SELF;
        /// Watched path moved.
        is_move_self => MOVE_SELF;
        /// Backing filesystem unmounted.
        is_unmount => UNMOUNT;
        /// Kernel queue overflowed.
        is_overflow => Q_OVERFLOW;
        /// Watch invalidated by the kernel.
        is_ignored => IGNORED;
        /// Subject is a directory.
        is_dir => ISDIR;
    }

    /// Validates this mask as a watch request and returns the raw bits to pass
    /// to the kernel.
    ///
    /// # Errors
    /// - `EmptyMask` if no bit is set
    /// - `InvalidArgument` if a report-only or unknown bit is set
    pub fn interest(self) -> NotifyResult<u32> {
        if self.is_empty() {
            return Err(NotifyError::EmptyMask);
        }
        if self.intersects(Self::REPORT_ONLY) {
            return Err(NotifyError::invalid_argument(format!(
                "report-only bits cannot be requested: {}",
                self & Self::REPORT_ONLY
            )));
        }
        if !Self::ALL_EVENTS.contains(self) {
            return Err(NotifyError::invalid_argument(format!(
                "unknown mask bits: {:#x}",
                self.bits() & !Self::ALL_EVENTS.bits()
            )));
        }
        Ok(self.bits())
    }

    /// Lower-case names of the set bits, in bit order.
    pub fn names(self) -> impl Iterator<Item = String> {
        self.iter_names().map(|(name, _)| name.to_ascii_lowercase())
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in self.names().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(&name)?;
        }
        Ok(())
    }
}

/// Parses a comma-separated list of bit names, e.g. `"create,delete"`.
///
/// `all` expands to [`EventMask::ALL_EVENTS`]. Names are case-insensitive.
impl FromStr for EventMask {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mask = Self::empty();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part.eq_ignore_ascii_case("all") {
                mask |= Self::ALL_EVENTS;
                continue;
            }
            let flag = Self::from_name(&part.to_ascii_uppercase())
                .ok_or_else(|| NotifyError::invalid_argument(format!("unknown event name: {part}")))?;
            mask |= flag;
        }
        Ok(mask)
    }
}

impl Serialize for EventMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let names: Vec<String> = self.names().collect();
        let mut seq = serializer.serialize_seq(Some(names.len()))?;
        for name in &names {
            seq.serialize_element(&name)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for EventMask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        names
            .join(",")
            .parse()
            .map_err(serde::de::Error::custom)
    }
}
