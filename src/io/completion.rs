//! Completion records: caller handles for reaped completion events.
//!
//! At most one live record exists per operation. The operation stores a weak
//! back-reference to its record, so asking the ring for the same event again
//! hands out the same record while the caller still holds it. Once every
//! handle is dropped, the back-reference is cleared and a later observation of
//! an unacknowledged event builds a fresh record.

use core::fmt;
use std::any::Any;
use std::cell::Cell;
use std::net::SocketAddrV4;
use std::rc::Rc;

use bytes::Bytes;

use super::operation::{Opcode, Operation};
use crate::error::Result;
use crate::stdx::SlotKey;

/// Opcode-aware projection of a completion's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// No-op: success with no payload.
    Empty,
    /// Read/recv: exactly the bytes transferred.
    Data(Bytes),
    /// Everything else: the non-negative result (bytes written, new fd, `0`, ...).
    Value(u32),
}

pub(crate) struct CompletionInner {
    ring_id: u64,
    tag: SlotKey,
    result: i32,
    flags: u32,
    operation: Operation,
    acknowledged: Cell<bool>,
}

impl Drop for CompletionInner {
    fn drop(&mut self) {
        self.operation.unbind_completion(self as *const CompletionInner);
    }
}

/// Caller handle for one completion event.
///
/// Cloning adds a reference to the same record. Every materialized record must
/// eventually be passed to [`Ring::acknowledge`](super::Ring::acknowledge), or
/// its operation stays pinned in the ring.
#[derive(Clone)]
pub struct Completion {
    inner: Rc<CompletionInner>,
}

impl Completion {
    /// Returns the live record for `operation`, or binds a new one.
    pub(crate) fn materialize(
        ring_id: u64,
        tag: SlotKey,
        result: i32,
        flags: u32,
        operation: &Operation,
    ) -> Self {
        if let Some(inner) = operation.live_completion() {
            assert!(inner.tag == tag, "live completion bound to another event");
            return Self { inner };
        }

        let inner = Rc::new(CompletionInner {
            ring_id,
            tag,
            result,
            flags,
            operation: operation.clone(),
            acknowledged: Cell::new(false),
        });
        operation.bind_completion(&inner);
        Self { inner }
    }

    /// Raw kernel result: non-negative on success, negated errno on failure.
    #[inline]
    pub fn result_code(&self) -> i32 {
        self.inner.result
    }

    /// Raw `IORING_CQE_F_*` flags.
    #[inline]
    pub fn flags(&self) -> u32 {
        self.inner.flags
    }

    /// The user tag set on the originating operation.
    pub fn user_tag(&self) -> Option<Rc<dyn Any>> {
        self.inner.operation.user_tag()
    }

    pub fn user_tag_as<T: Any + Clone>(&self) -> Option<T> {
        self.inner.operation.user_tag_as()
    }

    /// The operation this completion belongs to.
    #[inline]
    pub fn operation(&self) -> &Operation {
        &self.inner.operation
    }

    #[inline]
    pub fn opcode(&self) -> Option<Opcode> {
        self.inner.operation.opcode()
    }

    #[inline]
    pub fn is_acknowledged(&self) -> bool {
        self.inner.acknowledged.get()
    }

    /// `true` if both handles name the same record.
    #[inline]
    pub fn ptr_eq(&self, other: &Completion) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Projects the result according to the operation's opcode.
    ///
    /// - no-op: [`Output::Empty`]
    /// - read/recv: [`Output::Data`] holding exactly `result_code()` bytes
    /// - anything else: [`Output::Value`]
    ///
    /// Read-only and repeatable; does not acknowledge.
    ///
    /// # Errors
    ///
    /// - [`Error::SystemCall`](crate::Error::SystemCall) for a negative result
    /// - [`Error::ResultProjection`](crate::Error::ResultProjection) if the
    ///   buffer cannot be trimmed to the reported length
    pub fn extract_result(&self) -> Result<Output> {
        self.inner.operation.project(self.inner.result)
    }

    /// IPv4 peer filled in by a successful accept.
    pub fn accepted_peer(&self) -> Result<SocketAddrV4> {
        if self.inner.result < 0 {
            return Err(crate::Error::from_result(self.inner.result));
        }
        self.inner.operation.accepted_peer()
    }

    #[inline]
    pub(crate) fn ring_id(&self) -> u64 {
        self.inner.ring_id
    }

    #[inline]
    pub(crate) fn tag(&self) -> SlotKey {
        self.inner.tag
    }

    /// Flips the acknowledged flag. Returns `false` if it was already set.
    #[inline]
    pub(crate) fn set_acknowledged(&self) -> bool {
        !self.inner.acknowledged.replace(true)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("tag", &self.inner.tag)
            .field("result", &self.inner.result)
            .field("acknowledged", &self.inner.acknowledged.get())
            .finish()
    }
}
