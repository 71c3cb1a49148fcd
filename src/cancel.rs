//! cooperative cancellation for byte streams
//!
//! a [`StopSignal`] is raised once (usually from a signal watcher thread) and
//! every [`CancelReader`]/[`CancelWriter`] sharing it refuses further I/O.
//! the check happens before each call, so a read or write already in progress
//! completes; at most one more chunk moves after the signal fires.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// one-shot, idempotent stop signal shared between threads
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    raised: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// raise the signal. returns true only for the call that raised it.
    pub fn raise(&self) -> bool {
        !self.raised.swap(true, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// `Err(Interrupted)` once the signal has been raised
    pub fn check(&self) -> crate::Result<()> {
        if self.is_raised() {
            Err(crate::Error::Interrupted)
        } else {
            Ok(())
        }
    }

    fn check_io(&self) -> io::Result<()> {
        if self.is_raised() {
            Err(cancelled_error())
        } else {
            Ok(())
        }
    }

    /// wrap a reader so it fails once this signal is raised
    pub fn reader<R>(&self, inner: R) -> CancelReader<R> {
        CancelReader {
            inner,
            stop: self.clone(),
        }
    }

    /// wrap a writer so it fails once this signal is raised
    pub fn writer<W>(&self, inner: W) -> CancelWriter<W> {
        CancelWriter {
            inner,
            stop: self.clone(),
        }
    }
}

// io::ErrorKind::Interrupted is retried by io::copy and read_exact, so
// cancellation travels as a custom error that callers detect by type.
#[derive(Debug)]
struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

pub(crate) fn cancelled_error() -> io::Error {
    io::Error::other(Cancelled)
}

/// true if the error (or anything in its source chain) is a cancellation
pub fn is_cancelled(err: &io::Error) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = match err.get_ref() {
        Some(inner) => Some(inner as &(dyn std::error::Error + 'static)),
        None => return false,
    };
    while let Some(e) = current {
        if e.is::<Cancelled>() {
            return true;
        }
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if is_cancelled(io_err) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// reader that stops working after the stop signal is raised
pub struct CancelReader<R> {
    inner: R,
    stop: StopSignal,
}

impl<R> CancelReader<R> {
    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}

impl<R: Read> Read for CancelReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stop.check_io()?;
        self.inner.read(buf)
    }
}

impl<R: Seek> Seek for CancelReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.stop.check_io()?;
        self.inner.seek(pos)
    }
}

/// writer that stops working after the stop signal is raised
pub struct CancelWriter<W> {
    inner: W,
    stop: StopSignal,
}

impl<W> CancelWriter<W> {
    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

impl<W: Write> Write for CancelWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stop.check_io()?;
        self.inner.write(buf)
    }

    // flush is allowed after cancellation so buffered wrappers can unwind
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
