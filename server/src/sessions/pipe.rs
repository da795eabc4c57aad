//! Rendezvous byte pipe with backpressure.
//!
//! [`StreamPipe`] connects one side of a session (transport or process) to the
//! other. Bytes are appended to an internal buffer, but a `write` does not
//! return until a reader has picked up the "data available" signal it posted.
//! A slow reader therefore throttles the writer directly instead of letting
//! the buffer grow without bound.
//!
//! ## Signal slot
//!
//! The pipe has exactly one signal slot. A writer waits for the slot to be
//! empty, posts a numbered signal, then waits until a reader has taken that
//! number. A reader waits for the slot to be occupied, takes the signal, and
//! drains up to `max_len` bytes. When more bytes remain than it asked for, the
//! reader re-posts a drain signal so the next read keeps going from where this
//! one stopped.
//!
//! The buffer lock is never held across an await; all wakeups go through two
//! [`Notify`]s (one for readers, one for writers).

use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::error::PipeError;

/// What is sitting in the slot.
#[derive(Debug, Clone, Copy)]
enum Signal {
    /// Posted by a writer; the number lets that writer see when it was taken.
    Write(u64),
    /// Posted by a reader that left bytes behind.
    Drain,
}

struct PipeState {
    buf: Vec<u8>,
    open: bool,
    slot: Option<Signal>,
    /// Number handed to the last writer that posted into the slot.
    posted: u64,
    /// Number of the last writer signal a reader took.
    taken: u64,
}

/// Backpressured single-slot byte pipe. Share it behind an `Arc`.
pub struct StreamPipe {
    state: Mutex<PipeState>,
    readers: Notify,
    writers: Notify,
}

impl StreamPipe {
    /// Create an empty, open pipe.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PipeState {
                buf: Vec::new(),
                open: true,
                slot: None,
                posted: 0,
                taken: 0,
            }),
            readers: Notify::new(),
            writers: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `data` and wait until a reader begins consuming it.
    ///
    /// An empty write still posts a signal; the matching read returns an empty
    /// chunk. Fails with [`PipeError::Closed`] if the pipe is closed before the
    /// signal is taken.
    pub async fn write(&self, data: &[u8]) -> Result<(), PipeError> {
        {
            let mut st = self.lock();
            if !st.open {
                return Err(PipeError::Closed);
            }
            st.buf.extend_from_slice(data);
        }

        let ticket = loop {
            let mut slot_freed = pin!(self.writers.notified());
            slot_freed.as_mut().enable();
            {
                let mut st = self.lock();
                if !st.open {
                    return Err(PipeError::Closed);
                }
                if st.slot.is_none() {
                    st.posted += 1;
                    let ticket = st.posted;
                    st.slot = Some(Signal::Write(ticket));
                    drop(st);
                    self.readers.notify_waiters();
                    break ticket;
                }
            }
            slot_freed.await;
        };

        loop {
            let mut taken = pin!(self.writers.notified());
            taken.as_mut().enable();
            {
                let st = self.lock();
                if st.taken >= ticket {
                    return Ok(());
                }
                if !st.open {
                    return Err(PipeError::Closed);
                }
            }
            taken.await;
        }
    }

    /// Wait for a signal and drain at most `max_len` bytes.
    ///
    /// A zero-length result means the buffer was empty at wake time (or the
    /// matching write was empty); it is not end-of-stream. End-of-stream is
    /// [`PipeError::Closed`].
    ///
    /// Cancel-safe: a read dropped before it returns never consumes a signal.
    pub async fn read(&self, max_len: usize) -> Result<Vec<u8>, PipeError> {
        if max_len == 0 {
            return if self.is_closed() {
                Err(PipeError::Closed)
            } else {
                Ok(Vec::new())
            };
        }

        loop {
            let mut signalled = pin!(self.readers.notified());
            signalled.as_mut().enable();
            {
                let mut st = self.lock();
                if !st.open {
                    return Err(PipeError::Closed);
                }
                if let Some(signal) = st.slot.take() {
                    if let Signal::Write(ticket) = signal {
                        st.taken = ticket;
                    }
                    let chunk = if st.buf.len() <= max_len {
                        std::mem::take(&mut st.buf)
                    } else {
                        let rest = st.buf.split_off(max_len);
                        st.slot = Some(Signal::Drain);
                        std::mem::replace(&mut st.buf, rest)
                    };
                    let resignalled = st.slot.is_some();
                    drop(st);
                    self.writers.notify_waiters();
                    if resignalled {
                        self.readers.notify_waiters();
                    }
                    return Ok(chunk);
                }
            }
            signalled.await;
        }
    }

    /// Resolves once every buffered byte has been read, or the pipe closes.
    ///
    /// A write returns as soon as its signal is taken, which can be before a
    /// short read has drained all of its bytes; this waits for the rest.
    pub async fn drained(&self) {
        loop {
            let mut progress = pin!(self.writers.notified());
            progress.as_mut().enable();
            {
                let st = self.lock();
                if !st.open || st.buf.is_empty() {
                    return;
                }
            }
            progress.await;
        }
    }

    /// Close the pipe. Pending and future operations fail with
    /// [`PipeError::Closed`]; buffered bytes are discarded. Idempotent.
    pub fn close(&self) {
        {
            let mut st = self.lock();
            if !st.open {
                return;
            }
            st.open = false;
            st.slot = None;
            st.buf.clear();
        }
        self.readers.notify_waiters();
        self.writers.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        !self.lock().open
    }
}

impl Default for StreamPipe {
    fn default() -> Self {
        Self::new()
    }
}
