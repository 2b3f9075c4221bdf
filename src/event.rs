//! Consumer-facing filesystem events.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::codec::RawEvent;
use crate::mask::EventMask;

/// A path-qualified event, produced fresh for every dispatched kernel record.
///
/// `path` is the watched path, joined with the entry name when the record is
/// about something inside a watched directory. Kernel queue overflow is
/// reported with an empty `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    /// Watched path, joined with the entry name when there is one.
    pub path: PathBuf,
    /// Links the `moved_from` and `moved_to` halves of one rename; 0 otherwise.
    pub cookie: u32,
    /// Reported condition bits.
    #[serde(rename = "bits")]
    pub mask: EventMask,
}

impl Event {
    /// Qualifies a raw record with the path it was watched under.
    #[must_use]
    pub fn from_raw(watched: &Path, raw: &RawEvent) -> Self {
        let path = match raw.name.as_deref() {
            Some(name) => watched.join(name),
            None => watched.to_path_buf(),
        };
        Self {
            path,
            cookie: raw.cookie,
            mask: raw.mask,
        }
    }

    /// An event that belongs to no watch (kernel queue overflow).
    #[must_use]
    pub fn unbound(raw: &RawEvent) -> Self {
        Self {
            path: PathBuf::new(),
            cookie: raw.cookie,
            mask: raw.mask,
        }
    }

    /// The watch that produced this event was invalidated by the kernel.
    #[must_use]
    pub const fn is_ignored(&self) -> bool {
        self.mask.is_ignored()
    }

    /// The kernel dropped events because its queue overflowed.
    #[must_use]
    pub const fn is_overflow(&self) -> bool {
        self.mask.is_overflow()
    }

    /// The subject of the event is a directory.
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.mask.is_dir()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path={}: {}", self.path.display(), self.mask)
    }
}
