//! Ring manager: owns the transport, the pending batch, and every in-flight descriptor.
//!
//! # Ownership
//!
//! ```text
//!   caller ──Operation──▶ OpState ◀──strong── pending (until the kernel accepts it)
//!                           ▲  ▲
//!                           │  └──strong── inflight[tag] (staged .. acknowledged)
//!                           │
//!   caller ──Completion──▶ CompletionInner ──strong──┘
//!                           ▲
//!                           └──weak── OpState.completion
//! ```
//!
//! Completion events are copied out of the transport into `reaped` as soon as
//! they are drained. An event stays there, and can be observed any number of
//! times, until its record is acknowledged.
//!
//! # Threading
//!
//! A ring is single-threaded. Handles are `!Send`, so the compiler enforces it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::completion::Completion;
use super::operation::{Operation, OperationState};
use super::Transport;
use crate::config::RingConfig;
use crate::error::{Error, Result};
use crate::stdx::{SlotKey, Slots};

static NEXT_RING_ID: AtomicU64 = AtomicU64::new(1);

const NOT_SET_UP: Error = Error::InvalidState("ring is not set up");

/// Running totals for one ring setup.
///
/// # Invariants
///
/// - `acknowledged` ≤ `completed` ≤ number of staged descriptors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Descriptors the kernel confirmed consuming.
    pub submitted: u64,
    /// Completion events reaped from the transport.
    pub completed: u64,
    /// Completion records acknowledged.
    pub acknowledged: u64,
    /// Descriptors currently held by the ring (staged through acknowledged).
    pub inflight: u32,
}

#[derive(Debug, Clone, Copy)]
struct Event {
    tag: SlotKey,
    result: i32,
    flags: u32,
}

/// Submission/completion manager over a [`Transport`].
///
/// Construct with [`new`](Self::new), then [`setup`](Self::setup). Every other
/// call fails with [`Error::InvalidState`] until then, and again after
/// [`teardown`](Self::teardown).
pub struct Ring<B: Transport> {
    /// Identity of the current setup; `0` while not set up.
    id: u64,
    transport: Option<B>,
    /// Descriptors acquired but not yet accepted by the kernel, in acquisition order.
    pending: Vec<Operation>,
    /// Strong references to staged and in-flight descriptors, keyed by their tag.
    inflight: Slots<Operation>,
    /// Drained but unacknowledged events, in delivery order.
    reaped: VecDeque<Event>,
    stats: RingStats,
}

impl<B: Transport> Default for Ring<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Transport> Ring<B> {
    pub fn new() -> Self {
        Self {
            id: 0,
            transport: None,
            pending: Vec::new(),
            inflight: Slots::new(),
            reaped: VecDeque::new(),
            stats: RingStats::default(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Setup / teardown
    // ─────────────────────────────────────────────────────────────────────────

    /// Initializes the transport with `queue_depth` submission slots and
    /// `IORING_SETUP_*` `flags`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if already set up
    /// - [`Error::SystemCall`] with the kernel's errno if setup is refused
    pub fn setup(&mut self, queue_depth: u32, flags: u32) -> Result<()> {
        if self.transport.is_some() {
            return Err(Error::InvalidState("ring is already set up"));
        }
        assert!(self.pending.is_empty());
        assert!(self.inflight.is_empty());
        assert!(self.reaped.is_empty());

        let transport = B::setup(queue_depth, flags)?;

        self.id = NEXT_RING_ID.fetch_add(1, Ordering::Relaxed);
        self.transport = Some(transport);
        self.stats = RingStats::default();
        debug!(ring = self.id, queue_depth, flags, "ring set up");
        Ok(())
    }

    pub fn setup_with(&mut self, config: &RingConfig) -> Result<()> {
        self.setup(config.queue_depth, config.flags)
    }

    #[inline]
    pub fn is_setup(&self) -> bool {
        self.transport.is_some()
    }

    /// Releases the transport.
    ///
    /// Pending descriptors are dropped. Descriptors whose completion was
    /// already reaped are released, acknowledged or not. Descriptors the
    /// kernel may still be working on are leaked along with their buffers.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if the ring is not set up.
    pub fn teardown(&mut self) -> Result<()> {
        if self.transport.is_none() {
            return Err(NOT_SET_UP);
        }
        self.reap();
        let transport = self.transport.take();
        drop(transport);

        let mut leaked: u32 = 0;
        for (_, op) in self.inflight.drain() {
            if op.is_reaped() {
                continue;
            }
            leaked += 1;
            core::mem::forget(op);
        }
        if leaked > 0 {
            warn!(
                ring = self.id,
                leaked, "teardown with operations still in flight; leaking their buffers"
            );
        }

        let unacknowledged = self.reaped.len();
        self.reaped.clear();
        self.pending.clear();
        debug!(ring = self.id, unacknowledged, "ring torn down");
        self.id = 0;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Submission
    // ─────────────────────────────────────────────────────────────────────────

    /// Adds a fresh descriptor to the pending batch.
    ///
    /// One submission slot is reserved per pending descriptor, so a batch never
    /// overflows the submission queue at [`submit`](Self::submit) time.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueFull`] if every submission slot is reserved
    /// - [`Error::InvalidState`] if the ring is not set up
    pub fn acquire_operation(&mut self) -> Result<Operation> {
        if self.submission_capacity_remaining() == 0 {
            if self.transport.is_none() {
                return Err(NOT_SET_UP);
            }
            return Err(Error::QueueFull);
        }

        let op = Operation::new(self.id);
        self.pending.push(op.clone());
        Ok(op)
    }

    /// Drops a pending descriptor that has not been staged yet, freeing its slot.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if `op` is not pending on this ring or is
    /// already staged.
    pub fn release_operation(&mut self, op: &Operation) -> Result<()> {
        let Some(index) = self.pending.iter().position(|p| p.ptr_eq(op)) else {
            return Err(Error::InvalidState("operation is not pending on this ring"));
        };
        match op.state() {
            OperationState::Idle | OperationState::Prepared => {}
            _ => return Err(Error::InvalidState("operation is already staged")),
        }
        self.pending.remove(index);
        Ok(())
    }

    /// Stages every pending descriptor and hands the batch to the kernel.
    ///
    /// Returns the count the kernel reported for this call. Descriptors leave
    /// the pending list in order once the transport has consumed their entries;
    /// any remainder stays pending, already staged, and goes out with the next
    /// call (or the next wait, which also enters the kernel).
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] (or the recorded `prepare_*` failure) if any
    ///   pending descriptor is not prepared; nothing is staged
    /// - [`Error::SystemCall`] if the kernel refuses the batch; only entries
    ///   it had already consumed leave the pending list
    pub fn submit(&mut self) -> Result<u32> {
        if self.transport.is_none() {
            return Err(NOT_SET_UP);
        }
        self.retire_consumed();

        if let Some(err) = self.pending.iter().find_map(Operation::stage_blocker) {
            return Err(err);
        }

        let transport = self.transport.as_mut().ok_or(NOT_SET_UP)?;
        let mut staged: u32 = 0;
        for op in &self.pending {
            if op.state() == OperationState::Staged {
                continue;
            }
            let tag = self.inflight.insert(op.clone());
            let entry = op.stage(tag);
            // SAFETY: `inflight` holds a strong reference to `op` until its
            // completion is acknowledged (or leaks it at teardown), the
            // buffer slot's heap storage never moves, and a staged descriptor
            // refuses re-preparation. The tag is unique among live slots.
            if unsafe { transport.try_push(&entry, tag.to_u64()) }.is_err() {
                self.inflight.remove(tag);
                op.unstage();
                return Err(Error::QueueFull);
            }
            staged += 1;
        }

        let result = transport.submit();
        let accepted = self.retire_consumed();
        let submitted = match result {
            Ok(submitted) => submitted,
            Err(err) => {
                debug!(ring = self.id, staged, accepted, error = %err, "submit refused");
                return Err(err.into());
            }
        };

        debug!(
            ring = self.id,
            staged,
            submitted,
            accepted,
            remaining = self.pending.len(),
            "submitted batch"
        );
        Ok(submitted)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Completion
    // ─────────────────────────────────────────────────────────────────────────

    /// Blocks until `min_count` completions are outstanding and returns the
    /// first `min_count` of them in delivery order.
    ///
    /// `timeout` of `None` or zero blocks indefinitely. Records for events
    /// already observed are the same instances handed out before, if the
    /// caller still holds them.
    ///
    /// # Errors
    ///
    /// [`Error::SystemCall`] from the kernel wait; expiry of `timeout` is
    /// `ETIME` ([`Error::is_timeout`]).
    pub fn wait_completions(
        &mut self,
        min_count: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<Completion>> {
        if self.transport.is_none() {
            return Err(NOT_SET_UP);
        }
        // An unrepresentable deadline is as good as none.
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .and_then(|t| Instant::now().checked_add(t));

        self.reap();
        while (self.reaped.len() as u64) < min_count as u64 {
            let need = min_count - self.reaped.len() as u32;
            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(Error::SystemCall { code: libc::ETIME });
                    }
                    Some(left)
                }
            };
            let transport = self.transport.as_mut().ok_or(NOT_SET_UP)?;
            transport.wait(need, remaining)?;
            self.reap();
        }

        Ok(self
            .reaped
            .iter()
            .take(min_count as usize)
            .map(|event| self.materialize(event))
            .collect())
    }

    /// Blocks for exactly one completion.
    pub fn wait_one(&mut self) -> Result<Completion> {
        let mut completions = self.wait_completions(1, None)?;
        assert!(completions.len() == 1);
        Ok(completions.swap_remove(0))
    }

    /// The oldest outstanding completion, or `None` without blocking.
    pub fn peek_one(&mut self) -> Result<Option<Completion>> {
        if self.transport.is_none() {
            return Err(NOT_SET_UP);
        }
        self.reap();
        Ok(self.reaped.front().map(|event| self.materialize(event)))
    }

    /// Every outstanding completion, without blocking.
    pub fn peek_batch(&mut self) -> Result<Vec<Completion>> {
        if self.transport.is_none() {
            return Err(NOT_SET_UP);
        }
        self.reap();
        Ok(self
            .reaped
            .iter()
            .map(|event| self.materialize(event))
            .collect())
    }

    /// Consumes the completion's event and releases the ring's reference on
    /// its descriptor. Acknowledging the same record again is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if `completion` came from another ring (or an
    /// earlier setup of this one).
    pub fn acknowledge(&mut self, completion: &Completion) -> Result<()> {
        if self.transport.is_none() {
            return Err(NOT_SET_UP);
        }
        if completion.ring_id() != self.id {
            return Err(Error::InvalidState("completion belongs to a different ring"));
        }
        if completion.is_acknowledged() {
            return Ok(());
        }

        let tag = completion.tag();
        let Some(position) = self.reaped.iter().position(|event| event.tag == tag) else {
            return Err(Error::InvalidState("completion is not outstanding"));
        };
        let old_outstanding = self.reaped.len();

        self.reaped.remove(position);
        let op = self
            .inflight
            .remove(tag)
            .expect("outstanding completion has an in-flight operation");
        assert!(op.ptr_eq(completion.operation()));

        op.mark_acknowledged();
        let first = completion.set_acknowledged();
        assert!(first);
        self.stats.acknowledged += 1;

        assert!(self.reaped.len() == old_outstanding - 1);
        trace!(ring = self.id, tag = tag.to_u64(), "acknowledged");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observers
    // ─────────────────────────────────────────────────────────────────────────

    /// Descriptors not yet accepted by the kernel.
    #[inline]
    pub fn pending_count(&self) -> u32 {
        self.pending.len() as u32
    }

    /// Descriptors that can still be acquired before [`Error::QueueFull`].
    pub fn submission_capacity_remaining(&self) -> u32 {
        let Some(transport) = self.transport.as_ref() else {
            return 0;
        };
        let unstaged = self
            .pending
            .iter()
            .filter(|op| op.state() != OperationState::Staged)
            .count() as u32;
        transport.sq_space_left().saturating_sub(unstaged)
    }

    /// Completions not yet acknowledged: drained but outstanding, plus those
    /// still in the kernel's completion queue.
    pub fn completion_ready_count(&self) -> u32 {
        let queued = self.transport.as_ref().map_or(0, Transport::cq_ready);
        queued + self.reaped.len() as u32
    }

    pub fn eventfd_enabled(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::eventfd_enabled)
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            inflight: self.inflight.len(),
            ..self.stats
        }
    }

    #[inline]
    pub fn transport(&self) -> Option<&B> {
        self.transport.as_ref()
    }

    /// Direct access to the transport, for transport-specific knobs.
    #[inline]
    pub fn transport_mut(&mut self) -> Option<&mut B> {
        self.transport.as_mut()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    /// Moves every ready completion from the transport into `reaped`.
    fn reap(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let ring = self.id;
        let inflight = &self.inflight;
        let reaped = &mut self.reaped;
        let mut completed: u64 = 0;

        transport.drain(|user_data, result, flags| {
            let found = SlotKey::from_u64(user_data)
                .and_then(|tag| inflight.get(tag).map(|op| (tag, op)));
            let Some((tag, op)) = found else {
                warn!(ring, user_data, result, "completion with unknown tag dropped");
                return;
            };
            op.mark_completed(result);
            reaped.push_back(Event { tag, result, flags });
            completed += 1;
            trace!(ring, tag = user_data, result, flags, "reaped");
        });

        self.stats.completed += completed;
        assert!(self.stats.acknowledged <= self.stats.completed);
        self.retire_consumed();
    }

    /// Moves the staged prefix of `pending` the transport has consumed out of
    /// the pending list, whichever kernel entry consumed it. Returns how many.
    fn retire_consumed(&mut self) -> usize {
        let Some(transport) = self.transport.as_ref() else {
            return 0;
        };
        // Staging binds tags in pending order and entries are consumed FIFO,
        // so tagged descriptors always form a prefix of `pending`.
        let tagged = self
            .pending
            .iter()
            .take_while(|op| op.tag().is_some())
            .count();
        assert!(self.pending[tagged..].iter().all(|op| op.tag().is_none()));
        let queued = transport.sq_staged() as usize;
        assert!(queued <= tagged, "transport holds entries the ring never staged");

        let consumed = tagged - queued;
        for op in self.pending.drain(..consumed) {
            // Already reaped if a wait consumed and completed it first.
            if op.state() == OperationState::Staged {
                op.mark_submitted();
            }
        }
        self.stats.submitted += consumed as u64;
        consumed
    }

    fn materialize(&self, event: &Event) -> Completion {
        let op = self
            .inflight
            .get(event.tag)
            .expect("outstanding event has an in-flight operation");
        Completion::materialize(self.id, event.tag, event.result, event.flags, op)
    }
}

impl<B: Transport> Drop for Ring<B> {
    fn drop(&mut self) {
        if self.transport.is_some() {
            // Only fails when not set up, which was just checked.
            let _ = self.teardown();
        }
    }
}
