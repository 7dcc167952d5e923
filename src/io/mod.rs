//! Operation/completion object model over a kernel submission ring.
//!
//! The API is split into:
//! - [`Transport`]: the kernel-facing ring (stage entries, submit, wait, drain)
//! - [`Entry`]: the raw description of one operation handed to a transport
//! - [`Ring`]: owns a transport, the pending list, and every in-flight descriptor
//! - [`Operation`]: caller handle for one unit of work and its buffer
//! - [`Completion`]: caller handle for one reaped completion event
//!
//! # Safety / Ownership
//!
//! An [`Entry`] carries raw pointers into the buffer owned by its
//! [`Operation`]. The [`Ring`] keeps a strong reference to every operation it
//! has staged into the transport until the matching completion is
//! acknowledged, so those pointers stay valid for as long as the kernel can
//! dereference them. Completion events are routed back through a
//! generation-checked tag ([`crate::stdx::SlotKey`]) rather than a pointer.
//!
//! A ring is single-threaded: none of these handles are `Send`.

pub mod backend_blocking;
#[cfg(target_os = "linux")]
pub mod backend_linux;
pub mod buffer;
pub mod completion;
pub mod operation;
pub mod ring;
pub mod sockaddr;

use core::ptr::NonNull;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub use backend_blocking::{BlockingTransport, CompletionOrder};
#[cfg(target_os = "linux")]
pub use backend_linux::UringTransport;
pub use buffer::BufferSlot;
pub use completion::{Completion, Output};
pub use operation::{Opcode, Operation, OperationState};
pub use ring::{Ring, RingStats};

/// Ring backed by the kernel's `io_uring`.
#[cfg(target_os = "linux")]
pub type KernelRing = Ring<UringTransport>;

/// Kernel-facing half of a ring: the external collaborator [`Ring`] drives.
///
/// Callers stage entries, submit them in one batch, then drain completions.
#[allow(clippy::result_unit_err)] // Only failure is "no free slot"; no detail to carry.
pub trait Transport {
    /// Initializes the ring with `entries` submission slots and `IORING_SETUP_*` flags.
    ///
    /// Errors carry the kernel's errno.
    fn setup(entries: u32, flags: u32) -> io::Result<Self>
    where
        Self: Sized;

    /// Submission slots neither staged nor consumed by the kernel yet.
    fn sq_space_left(&self) -> u32;

    /// Entries staged but not yet consumed by the kernel.
    ///
    /// Consumption is FIFO and may happen outside [`submit`](Self::submit)
    /// (a waiting `io_uring_enter(2)` also submits), so callers account for
    /// accepted entries through this count rather than `submit`'s return.
    fn sq_staged(&self) -> u32;

    /// Stages one entry in the submission queue without entering the kernel.
    ///
    /// # Safety
    ///
    /// - every pointer in `entry` must stay valid until the completion for
    ///   `user_data` has been drained
    /// - `user_data` must be non-zero and unique among staged and in-flight entries
    ///
    /// Returns `Err(())` if the submission queue is full.
    unsafe fn try_push(&mut self, entry: &Entry, user_data: u64) -> Result<(), ()>;

    /// Hands all staged entries to the kernel; returns how many it consumed.
    fn submit(&mut self) -> io::Result<u32>;

    /// Blocks until at least `min_complete` completions are ready to drain, or
    /// `timeout` elapses (`ETIME`). `None` waits indefinitely.
    fn wait(&mut self, min_complete: u32, timeout: Option<Duration>) -> io::Result<()>;

    /// Pops every ready completion without blocking.
    ///
    /// Invokes `f(user_data, result, flags)` per completion, where `result` is
    /// the non-negative return value or a negated errno.
    fn drain<F: FnMut(u64, i32, u32)>(&mut self, f: F);

    /// Completions ready to drain.
    fn cq_ready(&self) -> u32;

    /// Whether completions currently signal a registered eventfd.
    fn eventfd_enabled(&self) -> bool;
}

/// Raw description of one operation, as staged into a [`Transport`].
///
/// # Buffer Ownership
///
/// Pointers reference the [`BufferSlot`] of the operation that produced the
/// entry. They are valid only while that operation is held by its [`Ring`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Nop,
    /// `send(2)` of `buf[0..len]`.
    Send {
        fd: RawFd,
        buf: NonNull<u8>,
        len: u32,
        flags: i32,
    },
    /// `recv(2)` into `buf[0..len]`.
    Recv {
        fd: RawFd,
        buf: NonNull<u8>,
        len: u32,
        flags: i32,
    },
    /// `connect(2)` to the IPv4 address at `addr`.
    Connect {
        fd: RawFd,
        addr: NonNull<libc::sockaddr_in>,
    },
    /// `accept4(2)`; the kernel writes the peer into `addr` / `addrlen`.
    Accept {
        fd: RawFd,
        addr: NonNull<libc::sockaddr_in>,
        addrlen: NonNull<libc::socklen_t>,
        flags: i32,
    },
    /// `pread(2)` into `buf[0..len]`.
    Read {
        fd: RawFd,
        buf: NonNull<u8>,
        len: u32,
        offset: u64,
    },
    /// `pwrite(2)` of `buf[0..len]`.
    Write {
        fd: RawFd,
        buf: NonNull<u8>,
        len: u32,
        offset: u64,
    },
    /// Fires after `ts` elapses or `count` other completions arrive.
    /// `after` mirrors `ts` for transports that never hand it to the kernel.
    Timeout {
        ts: NonNull<io_uring::types::Timespec>,
        after: Duration,
        count: u32,
        flags: u32,
    },
    /// Removes the pending timeout tagged `target`.
    TimeoutRemove { target: u64 },
    /// Cancels the in-flight operation tagged `target`.
    Cancel { target: u64 },
    /// `close(2)`.
    Close { fd: RawFd },
}

impl Entry {
    /// Kernel opcode this entry will be staged as.
    pub fn opcode(&self) -> Opcode {
        match self {
            Entry::Nop => Opcode::Nop,
            Entry::Send { .. } => Opcode::Send,
            Entry::Recv { .. } => Opcode::Recv,
            Entry::Connect { .. } => Opcode::Connect,
            Entry::Accept { .. } => Opcode::Accept,
            Entry::Read { .. } => Opcode::Read,
            Entry::Write { .. } => Opcode::Write,
            Entry::Timeout { .. } => Opcode::Timeout,
            Entry::TimeoutRemove { .. } => Opcode::TimeoutRemove,
            Entry::Cancel { .. } => Opcode::Cancel,
            Entry::Close { .. } => Opcode::Close,
        }
    }
}
