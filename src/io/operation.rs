//! Operation descriptors: one caller handle per unit of submitted work.
//!
//! A descriptor is acquired from a [`Ring`](super::Ring), configured by exactly
//! one `prepare_*` call (re-preparing before submission re-targets it), then
//! submitted with the rest of the ring's pending batch.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──prepare──▶ Prepared ──submit──▶ Staged ──kernel accepts──▶ Submitted
//!   ▲                  │ ▲                                            │
//!   └──failed prepare──┘ └─prepare (re-target)          completion reaped
//!                                                                     ▼
//!                                      Acknowledged ◀──acknowledge── Completed
//! ```
//!
//! Handles are reference counted. Once staged, the ring holds its own
//! reference until the completion is acknowledged, so dropping the caller's
//! handle never frees a buffer the kernel may still touch.

use core::fmt;
use std::any::Any;
use std::cell::RefCell;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use io_uring::opcode;

use super::buffer::{AcceptAddr, BufferSlot};
use super::completion::{CompletionInner, Output};
use super::{Entry, sockaddr};
use crate::error::{Error, Result};
use crate::stdx::SlotKey;

/// Kind of work a descriptor was prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    Send,
    Recv,
    Connect,
    Accept,
    Read,
    Write,
    Timeout,
    TimeoutRemove,
    Cancel,
    Close,
}

impl Opcode {
    /// The kernel's `IORING_OP_*` value.
    pub fn code(self) -> u8 {
        match self {
            Opcode::Nop => opcode::Nop::CODE,
            Opcode::Send => opcode::Send::CODE,
            Opcode::Recv => opcode::Recv::CODE,
            Opcode::Connect => opcode::Connect::CODE,
            Opcode::Accept => opcode::Accept::CODE,
            Opcode::Read => opcode::Read::CODE,
            Opcode::Write => opcode::Write::CODE,
            Opcode::Timeout => opcode::Timeout::CODE,
            Opcode::TimeoutRemove => opcode::TimeoutRemove::CODE,
            Opcode::Cancel => opcode::AsyncCancel::CODE,
            Opcode::Close => opcode::Close::CODE,
        }
    }

    /// `true` for opcodes whose result is delivered as an owned byte buffer.
    #[inline]
    pub fn returns_data(self) -> bool {
        matches!(self, Opcode::Read | Opcode::Recv)
    }
}

/// Lifecycle state of an [`Operation`]. See the module diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Acquired, no opcode bound.
    Idle,
    /// Opcode and buffer bound; waiting in the ring's pending list.
    Prepared,
    /// Pushed into the transport with a tag; submission not yet confirmed.
    Staged,
    /// Accepted by the kernel.
    Submitted,
    /// Completion reaped; not yet acknowledged.
    Completed,
    /// Completion acknowledged; the ring no longer holds this descriptor.
    Acknowledged,
}

pub(crate) struct OpState {
    ring_id: u64,
    state: OperationState,
    opcode: Option<Opcode>,
    buffer: BufferSlot,
    entry: Option<Entry>,
    user_tag: Option<Rc<dyn Any>>,
    /// Live completion record, if any. Never a strong reference.
    completion: Weak<CompletionInner>,
    /// Kernel-visible tag, bound at staging.
    tag: Option<SlotKey>,
    result: Option<i32>,
    /// Most recent failure of a `prepare_*` call; submit refuses to stage while set.
    error: Option<Error>,
}

/// Caller handle for one queued or in-flight operation.
///
/// Cloning adds a reference to the same descriptor.
#[derive(Clone)]
pub struct Operation {
    inner: Rc<RefCell<OpState>>,
}

impl Operation {
    pub(crate) fn new(ring_id: u64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(OpState {
                ring_id,
                state: OperationState::Idle,
                opcode: None,
                buffer: BufferSlot::Empty,
                entry: None,
                user_tag: None,
                completion: Weak::new(),
                tag: None,
                result: None,
                error: None,
            })),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observers
    // ─────────────────────────────────────────────────────────────────────────

    #[inline]
    pub fn state(&self) -> OperationState {
        self.inner.borrow().state
    }

    /// Opcode bound by the last successful `prepare_*`, `None` before that.
    #[inline]
    pub fn opcode(&self) -> Option<Opcode> {
        self.inner.borrow().opcode
    }

    /// Failure recorded by the last `prepare_*`, cleared by the next success.
    #[inline]
    pub fn error(&self) -> Option<Error> {
        self.inner.borrow().error
    }

    /// Kernel-visible tag, once staged.
    #[inline]
    pub fn tag(&self) -> Option<u64> {
        self.inner.borrow().tag.map(SlotKey::to_u64)
    }

    /// Bytes bound to the buffer slot (requested length for receive buffers).
    #[inline]
    pub fn buffer_len(&self) -> usize {
        self.inner.borrow().buffer.len()
    }

    /// `true` if both handles name the same descriptor.
    #[inline]
    pub fn ptr_eq(&self, other: &Operation) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // User tag
    // ─────────────────────────────────────────────────────────────────────────

    /// Replaces the opaque value reported back by this descriptor's completion.
    pub fn set_user_tag<T: Any>(&self, value: T) {
        self.inner.borrow_mut().user_tag = Some(Rc::new(value));
    }

    pub fn user_tag(&self) -> Option<Rc<dyn Any>> {
        self.inner.borrow().user_tag.clone()
    }

    /// The user tag, if set and of type `T`.
    pub fn user_tag_as<T: Any + Clone>(&self) -> Option<T> {
        let st = self.inner.borrow();
        st.user_tag.as_ref()?.downcast_ref::<T>().cloned()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Preparation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn prepare_nop(&self) -> Result<()> {
        self.prepare(Opcode::Nop, BufferSlot::Empty, |_| Ok(Entry::Nop))
    }

    /// `send(2)` of `data` on a connected socket. The descriptor keeps its own
    /// reference to `data` until it is released.
    pub fn prepare_send(&self, fd: RawFd, data: impl Into<Bytes>, flags: i32) -> Result<()> {
        let slot = BufferSlot::Borrowed(data.into());
        self.prepare(Opcode::Send, slot, |buffer| {
            check_fd(fd)?;
            let (buf, len) = buffer.read_ptr().ok_or(TOO_LONG)?;
            Ok(Entry::Send {
                fd,
                buf,
                len,
                flags,
            })
        })
    }

    /// `recv(2)` of up to `len` bytes into an engine-owned buffer.
    pub fn prepare_recv(&self, fd: RawFd, len: u32, flags: i32) -> Result<()> {
        self.prepare(Opcode::Recv, BufferSlot::owned(len), |buffer| {
            check_fd(fd)?;
            let (buf, len) = buffer.write_ptr().ok_or(TOO_LONG)?;
            Ok(Entry::Recv {
                fd,
                buf,
                len,
                flags,
            })
        })
    }

    /// `connect(2)` to an IPv4 address.
    pub fn prepare_connect(&self, fd: RawFd, addr: SocketAddr) -> Result<()> {
        self.prepare(Opcode::Connect, BufferSlot::Empty, |buffer| {
            check_fd(fd)?;
            let mut raw = Box::new(sockaddr::encode(addr)?);
            let addr = core::ptr::NonNull::from(raw.as_mut());
            *buffer = BufferSlot::SockAddr(raw);
            Ok(Entry::Connect { fd, addr })
        })
    }

    /// `accept4(2)`. The peer address is available from
    /// [`Completion::accepted_peer`](super::Completion::accepted_peer).
    pub fn prepare_accept(&self, fd: RawFd, flags: i32) -> Result<()> {
        self.prepare(Opcode::Accept, BufferSlot::Empty, |buffer| {
            check_fd(fd)?;
            let mut raw = Box::new(AcceptAddr::new());
            let addr = core::ptr::NonNull::from(&mut raw.addr);
            let addrlen = core::ptr::NonNull::from(&mut raw.len);
            *buffer = BufferSlot::AcceptAddr(raw);
            Ok(Entry::Accept {
                fd,
                addr,
                addrlen,
                flags,
            })
        })
    }

    /// Positional read of up to `len` bytes into an engine-owned buffer.
    pub fn prepare_read(&self, fd: RawFd, len: u32, offset: u64) -> Result<()> {
        self.prepare(Opcode::Read, BufferSlot::owned(len), |buffer| {
            check_fd(fd)?;
            let (buf, len) = buffer.write_ptr().ok_or(TOO_LONG)?;
            Ok(Entry::Read {
                fd,
                buf,
                len,
                offset,
            })
        })
    }

    /// Positional write of `data`.
    pub fn prepare_write(&self, fd: RawFd, data: impl Into<Bytes>, offset: u64) -> Result<()> {
        let slot = BufferSlot::Borrowed(data.into());
        self.prepare(Opcode::Write, slot, |buffer| {
            check_fd(fd)?;
            let (buf, len) = buffer.read_ptr().ok_or(TOO_LONG)?;
            Ok(Entry::Write {
                fd,
                buf,
                len,
                offset,
            })
        })
    }

    /// Timer that completes after `timeout`, or once `count` other completions
    /// have arrived if `count > 0`. Expiry reports `-ETIME`.
    pub fn prepare_timeout(&self, timeout: Duration, count: u32, flags: u32) -> Result<()> {
        self.prepare(Opcode::Timeout, BufferSlot::Empty, |buffer| {
            let mut ts = Box::new(io_uring::types::Timespec::from(timeout));
            let ptr = core::ptr::NonNull::from(ts.as_mut());
            *buffer = BufferSlot::Timespec(ts);
            Ok(Entry::Timeout {
                ts: ptr,
                after: timeout,
                count,
                flags,
            })
        })
    }

    /// Removes the submitted timeout `target`. The completion reports whether
    /// the removal happened, not the timeout's own outcome.
    pub fn prepare_timeout_remove(&self, target: &Operation) -> Result<()> {
        // Checked before `prepare` borrows us; a bad target fails like any other prepare.
        let target_tag = self.submitted_target(target, Some(Opcode::Timeout));
        self.prepare(Opcode::TimeoutRemove, BufferSlot::Empty, move |_| {
            Ok(Entry::TimeoutRemove {
                target: target_tag?,
            })
        })
    }

    /// Cancels the in-flight operation `target`. The completion reports whether
    /// the cancellation happened, not the target's outcome.
    pub fn prepare_cancel(&self, target: &Operation) -> Result<()> {
        let target_tag = self.submitted_target(target, None);
        self.prepare(Opcode::Cancel, BufferSlot::Empty, move |_| {
            Ok(Entry::Cancel {
                target: target_tag?,
            })
        })
    }

    pub fn prepare_close(&self, fd: RawFd) -> Result<()> {
        self.prepare(Opcode::Close, BufferSlot::Empty, |_| {
            check_fd(fd)?;
            Ok(Entry::Close { fd })
        })
    }

    /// `openat(2)` is not implemented; always fails and records the failure.
    pub fn prepare_openat(&self) -> Result<()> {
        self.prepare(Opcode::Nop, BufferSlot::Empty, |_| {
            Err(Error::InvalidState("openat preparation is not supported"))
        })
    }

    /// Shared body of every `prepare_*`: release the old slot, bind the new
    /// one, build the raw entry from its (now stable) address.
    fn prepare(
        &self,
        opcode: Opcode,
        buffer: BufferSlot,
        build: impl FnOnce(&mut BufferSlot) -> Result<Entry>,
    ) -> Result<()> {
        let mut st = self.inner.borrow_mut();
        match st.state {
            OperationState::Idle | OperationState::Prepared => {}
            _ => return Err(Error::InvalidState("operation already submitted")),
        }

        st.buffer.release();
        st.entry = None;
        st.opcode = None;
        st.state = OperationState::Idle;
        st.buffer = buffer;

        match build(&mut st.buffer) {
            Ok(entry) => {
                assert!(entry.opcode() == opcode);
                st.entry = Some(entry);
                st.opcode = Some(opcode);
                st.state = OperationState::Prepared;
                st.error = None;
                Ok(())
            }
            Err(err) => {
                st.buffer.release();
                st.error = Some(err);
                Err(err)
            }
        }
    }

    fn submitted_target(&self, target: &Operation, want: Option<Opcode>) -> Result<u64> {
        if self.ptr_eq(target) {
            return Err(Error::InvalidState("operation cannot target itself"));
        }
        let t = target.inner.borrow();
        if t.ring_id != self.inner.borrow().ring_id {
            return Err(Error::InvalidState("target belongs to a different ring"));
        }
        if want.is_some() && t.opcode != want {
            return Err(Error::InvalidState("target has the wrong opcode"));
        }
        match (t.state, t.tag) {
            (OperationState::Staged | OperationState::Submitted, Some(tag)) => Ok(tag.to_u64()),
            _ => Err(Error::InvalidState("target is not in flight")),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Ring-side transitions
    // ─────────────────────────────────────────────────────────────────────────

    #[inline]
    pub(crate) fn ring_id(&self) -> u64 {
        self.inner.borrow().ring_id
    }

    /// Why this descriptor cannot be staged, if it cannot.
    pub(crate) fn stage_blocker(&self) -> Option<Error> {
        let st = self.inner.borrow();
        match st.state {
            OperationState::Prepared | OperationState::Staged => None,
            OperationState::Idle => Some(
                st.error
                    .unwrap_or(Error::InvalidState("pending operation was never prepared")),
            ),
            _ => Some(Error::InvalidState("pending operation is no longer pending")),
        }
    }

    /// Binds `tag` and returns the entry to push.
    pub(crate) fn stage(&self, tag: SlotKey) -> Entry {
        let mut st = self.inner.borrow_mut();
        assert!(st.state == OperationState::Prepared);
        assert!(st.tag.is_none());
        st.tag = Some(tag);
        st.state = OperationState::Staged;
        st.entry.expect("prepared operation has an entry")
    }

    /// Reverts [`stage`](Self::stage) after the transport refused the entry.
    pub(crate) fn unstage(&self) {
        let mut st = self.inner.borrow_mut();
        assert!(st.state == OperationState::Staged);
        st.tag = None;
        st.state = OperationState::Prepared;
    }

    pub(crate) fn mark_submitted(&self) {
        let mut st = self.inner.borrow_mut();
        assert!(st.state == OperationState::Staged);
        st.state = OperationState::Submitted;
    }

    pub(crate) fn mark_completed(&self, result: i32) {
        let mut st = self.inner.borrow_mut();
        // A completion can be reaped before a partial submit confirms the entry.
        assert!(matches!(
            st.state,
            OperationState::Staged | OperationState::Submitted
        ));
        st.state = OperationState::Completed;
        st.result = Some(result);
    }

    pub(crate) fn mark_acknowledged(&self) {
        let mut st = self.inner.borrow_mut();
        assert!(st.state == OperationState::Completed);
        st.state = OperationState::Acknowledged;
    }

    #[inline]
    pub(crate) fn is_reaped(&self) -> bool {
        self.inner.borrow().result.is_some()
    }

    /// The live completion record, if one still exists.
    pub(crate) fn live_completion(&self) -> Option<Rc<CompletionInner>> {
        self.inner.borrow().completion.upgrade()
    }

    pub(crate) fn bind_completion(&self, completion: &Rc<CompletionInner>) {
        let mut st = self.inner.borrow_mut();
        assert!(st.completion.upgrade().is_none(), "completion already bound");
        st.completion = Rc::downgrade(completion);
    }

    /// Clears the back-reference if it still names `completion`.
    pub(crate) fn unbind_completion(&self, completion: *const CompletionInner) {
        // Drop can run while a caller holds a borrow; the stale Weak is harmless then.
        if let Ok(mut st) = self.inner.try_borrow_mut() {
            if core::ptr::eq(st.completion.as_ptr(), completion) {
                st.completion = Weak::new();
            }
        }
    }

    /// Opcode-aware view of `result`. See [`Completion::extract_result`](super::Completion::extract_result).
    pub(crate) fn project(&self, result: i32) -> Result<Output> {
        if result < 0 {
            return Err(Error::from_result(result));
        }
        let mut st = self.inner.borrow_mut();
        match st.opcode {
            None => Err(Error::ResultProjection("operation was never prepared")),
            Some(Opcode::Nop) => Ok(Output::Empty),
            Some(op) if op.returns_data() => st.buffer.fill(result as usize).map(Output::Data),
            Some(_) => Ok(Output::Value(result as u32)),
        }
    }

    pub(crate) fn accepted_peer(&self) -> Result<SocketAddrV4> {
        let st = self.inner.borrow();
        match &st.buffer {
            BufferSlot::AcceptAddr(raw) => sockaddr::decode(&raw.addr, raw.len),
            _ => Err(Error::ResultProjection("operation is not an accept")),
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(st) => f
                .debug_struct("Operation")
                .field("state", &st.state)
                .field("opcode", &st.opcode)
                .field("tag", &st.tag)
                .field("buffer", &st.buffer)
                .field("error", &st.error)
                .finish(),
            Err(_) => f.write_str("Operation { <borrowed> }"),
        }
    }
}

const TOO_LONG: Error = Error::InvalidState("buffer length exceeds u32::MAX");

#[inline]
fn check_fd(fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Err(Error::InvalidState("file descriptor must be non-negative"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const RING: u64 = 1;

    #[test]
    fn new_operation_is_idle() {
        let op = Operation::new(RING);
        assert_eq!(op.state(), OperationState::Idle);
        assert_eq!(op.opcode(), None);
        assert_eq!(op.error(), None);
        assert_eq!(op.tag(), None);
        assert!(op.user_tag().is_none());
    }

    #[test]
    fn prepare_binds_opcode_and_buffer() {
        let op = Operation::new(RING);
        op.prepare_recv(3, 64, 0).unwrap();
        assert_eq!(op.state(), OperationState::Prepared);
        assert_eq!(op.opcode(), Some(Opcode::Recv));
        assert_eq!(op.buffer_len(), 64);
    }

    #[test]
    fn reprepare_releases_previous_buffer() {
        let data = Bytes::from(vec![7u8; 32]);
        let op = Operation::new(RING);
        op.prepare_send(3, data.clone(), 0).unwrap();
        assert_eq!(op.buffer_len(), 32);

        op.prepare_nop().unwrap();
        assert_eq!(op.opcode(), Some(Opcode::Nop));
        assert_eq!(op.buffer_len(), 0);
        // The descriptor's view of `data` is gone; only ours remains.
        assert!(data.is_unique());
    }

    #[test]
    fn send_entry_points_at_caller_bytes() {
        let data = Bytes::from_static(b"ping");
        let op = Operation::new(RING);
        op.prepare_send(5, data.clone(), 0).unwrap();
        let entry = op.inner.borrow().entry.unwrap();
        match entry {
            Entry::Send { fd, buf, len, .. } => {
                assert_eq!(fd, 5);
                assert_eq!(len, 4);
                assert_eq!(buf.as_ptr() as *const u8, data.as_ptr());
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn negative_fd_is_rejected_and_recorded() {
        let op = Operation::new(RING);
        let err = op.prepare_read(-1, 16, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(op.error(), Some(err));
        assert_eq!(op.state(), OperationState::Idle);
        assert_eq!(op.opcode(), None);
        assert_eq!(op.buffer_len(), 0);
        assert_eq!(op.stage_blocker(), Some(err));
    }

    #[test]
    fn successful_prepare_clears_error() {
        let op = Operation::new(RING);
        op.prepare_close(-5).unwrap_err();
        op.prepare_close(5).unwrap();
        assert_eq!(op.error(), None);
        assert_eq!(op.stage_blocker(), None);
    }

    #[test]
    fn failed_reprepare_drops_old_target() {
        let op = Operation::new(RING);
        op.prepare_nop().unwrap();
        op.prepare_openat().unwrap_err();
        assert_eq!(op.state(), OperationState::Idle);
        assert_eq!(op.opcode(), None);
    }

    #[test]
    fn openat_is_unsupported() {
        let op = Operation::new(RING);
        assert!(matches!(op.prepare_openat(), Err(Error::InvalidState(_))));
        assert!(op.error().is_some());
    }

    #[test]
    fn connect_rejects_ipv6() {
        let op = Operation::new(RING);
        let addr = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 80);
        assert!(matches!(op.prepare_connect(3, addr), Err(Error::InvalidState(_))));
        assert_eq!(op.opcode(), None);
    }

    #[test]
    fn connect_encodes_ipv4() {
        let op = Operation::new(RING);
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 9000);
        op.prepare_connect(3, addr).unwrap();
        assert_eq!(op.opcode(), Some(Opcode::Connect));
        assert!(matches!(op.inner.borrow().buffer, BufferSlot::SockAddr(_)));
    }

    #[test]
    fn cannot_reprepare_after_staging() {
        let op = Operation::new(RING);
        op.prepare_nop().unwrap();
        let mut slots = crate::stdx::Slots::new();
        let key = slots.insert(());
        op.stage(key);

        assert!(matches!(op.prepare_nop(), Err(Error::InvalidState(_))));
        assert_eq!(op.state(), OperationState::Staged);
        assert_eq!(op.tag(), Some(key.to_u64()));

        op.unstage();
        assert_eq!(op.state(), OperationState::Prepared);
        assert_eq!(op.tag(), None);
    }

    #[test]
    fn cancel_requires_submitted_target() {
        let target = Operation::new(RING);
        target.prepare_nop().unwrap();
        let cancel = Operation::new(RING);
        assert!(matches!(
            cancel.prepare_cancel(&target),
            Err(Error::InvalidState("target is not in flight"))
        ));
        assert!(matches!(
            cancel.prepare_cancel(&cancel),
            Err(Error::InvalidState(_))
        ));

        let mut slots = crate::stdx::Slots::new();
        let key = slots.insert(());
        target.stage(key);
        cancel.prepare_cancel(&target).unwrap();
        assert_eq!(
            cancel.inner.borrow().entry,
            Some(Entry::Cancel {
                target: key.to_u64()
            })
        );
    }

    #[test]
    fn timeout_remove_requires_timeout_target() {
        let mut slots = crate::stdx::Slots::new();
        let target = Operation::new(RING);
        target.prepare_nop().unwrap();
        target.stage(slots.insert(()));

        let remove = Operation::new(RING);
        assert!(matches!(
            remove.prepare_timeout_remove(&target),
            Err(Error::InvalidState("target has the wrong opcode"))
        ));
    }

    #[test]
    fn failed_cancel_prepare_drops_old_target() {
        let target = Operation::new(RING);
        target.prepare_nop().unwrap();
        let cancel = Operation::new(RING);
        cancel.prepare_send(3, Bytes::from_static(b"old"), 0).unwrap();

        let err = cancel.prepare_cancel(&target).unwrap_err();
        assert_eq!(err, Error::InvalidState("target is not in flight"));
        assert_eq!(cancel.state(), OperationState::Idle);
        assert_eq!(cancel.opcode(), None);
        assert_eq!(cancel.buffer_len(), 0);
        assert_eq!(cancel.error(), Some(err));
        assert_eq!(cancel.stage_blocker(), Some(err));

        let remove = Operation::new(RING);
        remove.prepare_nop().unwrap();
        remove.prepare_timeout_remove(&target).unwrap_err();
        assert_eq!(remove.state(), OperationState::Idle);
        assert_eq!(
            remove.error(),
            Some(Error::InvalidState("target has the wrong opcode"))
        );
    }

    #[test]
    fn cross_ring_target_is_rejected() {
        let mut slots = crate::stdx::Slots::new();
        let target = Operation::new(RING);
        target.prepare_nop().unwrap();
        target.stage(slots.insert(()));

        let cancel = Operation::new(RING + 1);
        assert!(matches!(
            cancel.prepare_cancel(&target),
            Err(Error::InvalidState("target belongs to a different ring"))
        ));
    }

    #[test]
    fn user_tag_replaces_and_downcasts() {
        let op = Operation::new(RING);
        op.set_user_tag("first");
        op.set_user_tag(42u64);
        assert_eq!(op.user_tag_as::<u64>(), Some(42));
        assert_eq!(op.user_tag_as::<&str>(), None);
    }

    #[test]
    fn user_tag_old_value_is_released() {
        let op = Operation::new(RING);
        let payload = Rc::new(());
        op.set_user_tag(payload.clone());
        assert_eq!(Rc::strong_count(&payload), 2);
        op.set_user_tag(());
        assert_eq!(Rc::strong_count(&payload), 1);
    }

    #[test]
    fn projection_by_opcode() {
        let nop = Operation::new(RING);
        nop.prepare_nop().unwrap();
        assert_eq!(nop.project(0).unwrap(), Output::Empty);

        let close = Operation::new(RING);
        close.prepare_close(9).unwrap();
        assert_eq!(close.project(0).unwrap(), Output::Value(0));
        assert_eq!(
            close.project(-libc::EBADF).unwrap_err(),
            Error::SystemCall { code: libc::EBADF }
        );

        let recv = Operation::new(RING);
        recv.prepare_recv(3, 16, 0).unwrap();
        assert_eq!(recv.project(4).unwrap(), Output::Data(Bytes::from(vec![0u8; 4])));
    }

    #[test]
    fn opcode_codes_are_distinct() {
        let all = [
            Opcode::Nop,
            Opcode::Send,
            Opcode::Recv,
            Opcode::Connect,
            Opcode::Accept,
            Opcode::Read,
            Opcode::Write,
            Opcode::Timeout,
            Opcode::TimeoutRemove,
            Opcode::Cancel,
            Opcode::Close,
        ];
        let mut codes: Vec<u8> = all.iter().map(|op| op.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert_eq!(Opcode::Nop.code(), 0);
    }
}
