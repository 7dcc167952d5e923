//! Buffer storage backing one operation's data transfer.
//!
//! Two ownership modes:
//!
//! - **Borrowed**: the caller's bytes, shared by reference count. The operation
//!   holds its own handle on them, so the memory cannot be freed out from under
//!   the kernel even if the caller drops theirs.
//! - **Owned**: memory the engine allocates for the kernel to fill or read:
//!   receive buffers, socket addresses, timespecs. Heap allocations never move,
//!   so a pointer taken at prepare time stays valid while the slot is alive.
//!
//! A slot is released by replacing it with [`BufferSlot::Empty`], which the
//! owning operation only does when it is re-prepared or destroyed.

use core::fmt;
use core::ptr::NonNull;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Storage for one operation. See module docs for the ownership modes.
#[derive(Default)]
pub enum BufferSlot {
    /// Nothing bound (no-op, close, cancel, or not yet prepared).
    #[default]
    Empty,
    /// Caller-supplied bytes for send/write.
    Borrowed(Bytes),
    /// Engine-allocated receive/read buffer, full requested length.
    Owned(Box<[u8]>),
    /// An owned buffer after projection, trimmed to the transferred length.
    Filled(Bytes),
    /// IPv4 address handed to connect.
    SockAddr(Box<libc::sockaddr_in>),
    /// Address storage the kernel fills in for accept.
    AcceptAddr(Box<AcceptAddr>),
    /// Timespec read by a timeout operation.
    Timespec(Box<io_uring::types::Timespec>),
}

/// Peer address slot plus its in/out length, written by `accept4`.
#[repr(C)]
pub struct AcceptAddr {
    pub addr: libc::sockaddr_in,
    pub len: libc::socklen_t,
}

impl AcceptAddr {
    pub fn new() -> Self {
        Self {
            // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
            addr: unsafe { core::mem::zeroed() },
            len: size_of::<libc::sockaddr_in>() as libc::socklen_t,
        }
    }
}

impl Default for AcceptAddr {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferSlot::Empty => f.write_str("Empty"),
            BufferSlot::Borrowed(bytes) => f.debug_tuple("Borrowed").field(&bytes.len()).finish(),
            BufferSlot::Owned(buf) => f.debug_tuple("Owned").field(&buf.len()).finish(),
            BufferSlot::Filled(bytes) => f.debug_tuple("Filled").field(&bytes.len()).finish(),
            BufferSlot::SockAddr(_) => f.write_str("SockAddr"),
            BufferSlot::AcceptAddr(_) => f.write_str("AcceptAddr"),
            BufferSlot::Timespec(_) => f.write_str("Timespec"),
        }
    }
}

impl BufferSlot {
    /// Allocates a zeroed owned buffer of `len` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len` does not fit the kernel's `u32` length field.
    pub fn owned(len: u32) -> Self {
        BufferSlot::Owned(vec![0u8; len as usize].into_boxed_slice())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, BufferSlot::Empty)
    }

    /// Byte length the kernel may touch, `0` for non-byte slots.
    pub fn len(&self) -> usize {
        match self {
            BufferSlot::Borrowed(bytes) | BufferSlot::Filled(bytes) => bytes.len(),
            BufferSlot::Owned(buf) => buf.len(),
            BufferSlot::Empty
            | BufferSlot::SockAddr(_)
            | BufferSlot::AcceptAddr(_)
            | BufferSlot::Timespec(_) => 0,
        }
    }

    /// Drops whatever is bound and leaves the slot empty.
    #[inline]
    pub fn release(&mut self) {
        *self = BufferSlot::Empty;
    }

    /// Read-only pointer to borrowed bytes, for send/write.
    ///
    /// An empty borrowed view yields a dangling (but non-null) pointer with `len == 0`.
    pub fn read_ptr(&self) -> Option<(NonNull<u8>, u32)> {
        match self {
            BufferSlot::Borrowed(bytes) => {
                let len = u32::try_from(bytes.len()).ok()?;
                let ptr = NonNull::new(bytes.as_ptr() as *mut u8).unwrap_or(NonNull::dangling());
                Some((ptr, len))
            }
            _ => None,
        }
    }

    /// Writable pointer into the owned buffer, for recv/read.
    pub fn write_ptr(&mut self) -> Option<(NonNull<u8>, u32)> {
        match self {
            BufferSlot::Owned(buf) => {
                let len = u32::try_from(buf.len()).ok()?;
                let ptr = NonNull::new(buf.as_mut_ptr()).unwrap_or(NonNull::dangling());
                Some((ptr, len))
            }
            _ => None,
        }
    }

    /// Projects the owned buffer down to exactly `transferred` bytes.
    ///
    /// The first call converts [`Owned`](Self::Owned) into [`Filled`](Self::Filled);
    /// later calls return the same bytes without copying again, so projection is
    /// idempotent.
    ///
    /// # Errors
    ///
    /// [`Error::ResultProjection`] if `transferred` exceeds the requested length,
    /// disagrees with an earlier projection, or the slot holds no receive buffer.
    pub fn fill(&mut self, transferred: usize) -> Result<Bytes> {
        match self {
            BufferSlot::Owned(buf) => {
                if transferred > buf.len() {
                    return Err(Error::ResultProjection(
                        "transferred length exceeds the requested buffer",
                    ));
                }
                let mut data = core::mem::take(buf).into_vec();
                data.truncate(transferred);
                let bytes = Bytes::from(data);
                *self = BufferSlot::Filled(bytes.clone());
                Ok(bytes)
            }
            BufferSlot::Filled(bytes) => {
                if bytes.len() != transferred {
                    return Err(Error::ResultProjection(
                        "buffer already projected to a different length",
                    ));
                }
                Ok(bytes.clone())
            }
            _ => Err(Error::ResultProjection("operation has no receive buffer")),
        }
    }
}
