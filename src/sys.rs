//! Kernel handle adapter for inotify.
//!
//! `InotifyHandle` owns the notification descriptor and issues the add/remove
//! watch syscalls. `HandleReader` registers the descriptor with the tokio
//! reactor and exposes it as an `AsyncRead` byte source for the reader loop.
//!
//! # Safety
//! - The descriptor is owned by an `OwnedFd` and closed exactly once
//! - Syscalls only run while the descriptor is known to be open (read lock)
//! - `close` takes the write lock, so it waits for in-flight syscalls

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use parking_lot::RwLock;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, Interest, ReadBuf};

use crate::codec::WatchId;
use crate::error::{NotifyError, NotifyResult};
use crate::mask::EventMask;

/// Watch registration operations a subscription needs from the kernel side.
///
/// `InotifyHandle` is the production implementation; tests substitute an
/// in-memory one.
pub trait WatchBackend: Send + Sync + std::fmt::Debug {
    /// Registers `path` for the events in `mask`.
    ///
    /// Bits are added to any watch the handle already holds for `path`, so a
    /// second request never narrows an existing one.
    fn add_watch(&self, path: &Path, mask: EventMask) -> NotifyResult<WatchId>;

    /// Removes a watch. Fails with `NotifyError::Watch` if the kernel no
    /// longer knows `id`.
    fn remove_watch(&self, id: WatchId) -> NotifyResult<()>;
}

/// An inotify instance.
#[derive(Debug)]
pub struct InotifyHandle {
    fd: RwLock<Option<OwnedFd>>,
    nonblocking: bool,
}

impl InotifyHandle {
    /// Creates a new inotify instance (close-on-exec).
    ///
    /// # Errors
    /// `NotifyError::Init` carrying the errno if `inotify_init1` fails.
    pub fn open(nonblocking: bool) -> NotifyResult<Self> {
        let mut flags = libc::IN_CLOEXEC;
        if nonblocking {
            flags |= libc::IN_NONBLOCK;
        }

        // SAFETY: inotify_init1 takes only flags and touches no caller memory.
        let fd = unsafe { libc::inotify_init1(flags) };
        if fd < 0 {
            return Err(NotifyError::Init {
                source: io::Error::last_os_error(),
            });
        }

        // SAFETY: inotify_init1 returned a fresh descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            fd: RwLock::new(Some(fd)),
            nonblocking,
        })
    }

    /// Whether reads return `WouldBlock` instead of waiting.
    #[must_use]
    pub const fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.fd.read().is_none()
    }

    /// The raw descriptor, while open.
    #[must_use]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.read().as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Reads raw record bytes into `buf`.
    ///
    /// A closed handle reads as end-of-stream (`Ok(0)`).
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let guard = self.fd.read();
        let Some(fd) = guard.as_ref() else {
            return Ok(0);
        };

        // SAFETY: `buf` is valid for writes of `buf.len()` bytes and the read
        // guard keeps the descriptor open for the duration of the call.
        let res = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(res as usize)
    }

    /// Releases the descriptor. Returns true if this call closed it.
    ///
    /// Every watch on the handle is discarded by the kernel.
    pub fn close(&self) -> bool {
        self.fd.write().take().is_some()
    }
}

impl WatchBackend for InotifyHandle {
    fn add_watch(&self, path: &Path, mask: EventMask) -> NotifyResult<WatchId> {
        if mask.is_empty() {
            return Err(NotifyError::invalid_argument(
                "add_watch requires at least one event bit",
            ));
        }
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| NotifyError::invalid_argument(format!("path contains NUL byte: {e}")))?;

        let guard = self.fd.read();
        let fd = guard.as_ref().ok_or(NotifyError::HandleClosed)?;

        // SAFETY: `c_path` is a NUL-terminated string that outlives the call,
        // and the read guard keeps the descriptor open.
        let wd = unsafe {
            libc::inotify_add_watch(fd.as_raw_fd(), c_path.as_ptr(), mask.bits() | libc::IN_MASK_ADD)
        };
        if wd < 0 {
            return Err(NotifyError::Path {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(WatchId(wd))
    }

    fn remove_watch(&self, id: WatchId) -> NotifyResult<()> {
        let guard = self.fd.read();
        let fd = guard.as_ref().ok_or(NotifyError::HandleClosed)?;

        // SAFETY: plain integer arguments; the read guard keeps the descriptor open.
        let res = unsafe { libc::inotify_rm_watch(fd.as_raw_fd(), id.as_raw()) };
        if res != 0 {
            return Err(NotifyError::Watch {
                id,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ReactorFd {
    handle: Arc<InotifyHandle>,
    fd: RawFd,
}

impl AsRawFd for ReactorFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// Read-readiness integration of an `InotifyHandle` with the tokio reactor.
///
/// Must be created inside a tokio runtime. Drop it before closing the handle
/// so the descriptor is deregistered while still open.
#[derive(Debug)]
pub struct HandleReader {
    io: AsyncFd<ReactorFd>,
}

impl HandleReader {
    /// Registers `handle` for read readiness.
    ///
    /// # Errors
    /// - `InvalidArgument` if the handle was opened in blocking mode
    /// - `HandleClosed` if the handle is already closed
    /// - `Init` if the reactor refuses the registration
    pub fn new(handle: Arc<InotifyHandle>) -> NotifyResult<Self> {
        if !handle.is_nonblocking() {
            return Err(NotifyError::invalid_argument(
                "reactor integration requires a non-blocking handle",
            ));
        }
        let fd = handle.raw_fd().ok_or(NotifyError::HandleClosed)?;
        let io = AsyncFd::try_with_interest(ReactorFd { handle, fd }, Interest::READABLE)
            .map_err(|e| {
                let (_, source) = e.into_parts();
                NotifyError::Init { source }
            })?;
        Ok(Self { io })
    }

    /// The handle being read.
    #[must_use]
    pub fn handle(&self) -> &Arc<InotifyHandle> {
        &self.io.get_ref().handle
    }
}

impl AsyncRead for HandleReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.io.poll_read_ready(cx))?;

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().handle.read(unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}
