//! # kyronotify - Typed inotify event streams
//!
//! kyronotify turns the Linux inotify byte stream into typed, path-qualified
//! events. One kernel handle is shared by any number of per-path
//! subscriptions, and all of them feed one bounded queue.
//!
//! ## Core Concepts
//!
//! - **Notifier**: owns the kernel handle, the reader task and the event queue
//! - **Watch**: one caller's interest in one path; closing or dropping it removes the kernel watch
//! - **Event**: the watched path (joined with the entry name), the rename cookie and the mask bits
//! - **EventMask**: requestable condition bits plus the report-only ones the kernel adds
//!
//! A watch whose path is deleted, moved away or unmounted receives one last
//! event carrying [`EventMask::IGNORED`] and then closes itself. Events that
//! arrive while the queue is full are dropped and counted, never blocking the
//! reader.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kyronotify::{EventMask, Notifier, NotifierConfig};
//!
//! # async fn run() -> kyronotify::NotifyResult<()> {
//! let notifier = Notifier::open(NotifierConfig::default())?;
//! let _watch = notifier.add_watch("/tmp", EventMask::CREATE | EventMask::DELETE)?;
//!
//! while let Some(event) = notifier.next().await {
//!     println!("{event}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

#[cfg(not(target_os = "linux"))]
compile_error!("kyronotify only supports Linux (inotify)");

pub mod codec;
pub mod error;
pub mod event;
pub mod mask;
pub mod notifier;
pub mod queue;
pub mod reader;
pub mod registry;
pub mod sys;
pub mod watch;

// Re-export primary types at crate root for convenience
pub use codec::{RawEvent, WatchId};
pub use error::{DecodeError, NotifyError, NotifyResult, RegistryError};
pub use event::Event;
pub use mask::EventMask;
pub use notifier::{Notifier, NotifierConfig};
pub use queue::{EventQueue, PushOutcome};
pub use reader::{EventReader, ReaderExit, ReaderStats};
pub use registry::{DispatchTarget, WatchRegistry};
pub use sys::{HandleReader, InotifyHandle, WatchBackend};
pub use watch::{Watch, WatchState};
