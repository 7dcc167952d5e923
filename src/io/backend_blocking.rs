//! Synchronous transport: every staged entry runs as a plain system call at submit time.
//!
//! Used for deterministic tests and on kernels where `io_uring_setup(2)` is
//! unavailable. Socket and file operations block the submitting thread exactly
//! as the underlying call would, so callers must arrange for them to be
//! satisfiable (data already queued, peer already connecting, ...).
//!
//! Timeouts are the one kind of entry that stays pending after submit. They
//! expire inside [`wait`](Transport::wait), fire early once `count` other
//! completions have been posted, or are removed by a cancel / timeout-remove
//! entry naming their tag.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use tracing::trace;

use super::{Entry, Transport};
use crate::constants::{SETUP_CLAMP, SETUP_FLAGS_SUPPORTED, effective_depth};

/// Order in which one submit batch's completions are posted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompletionOrder {
    /// Submission order.
    #[default]
    Fifo,
    /// Last submitted completes first.
    Reverse,
}

#[derive(Debug, Clone, Copy)]
struct Cqe {
    user_data: u64,
    result: i32,
    flags: u32,
}

#[derive(Debug)]
struct Timer {
    user_data: u64,
    deadline: Instant,
    /// Completions still needed before firing early; `0` means time only.
    remaining: u32,
}

/// In-process stand-in for the kernel ring. See module docs.
#[derive(Debug)]
pub struct BlockingTransport {
    depth: u32,
    staged: VecDeque<(u64, Entry)>,
    ready: VecDeque<Cqe>,
    timers: Vec<Timer>,
    order: CompletionOrder,
    submit_limit: Option<u32>,
    submit_error: Option<i32>,
    eventfd_enabled: bool,
}

impl BlockingTransport {
    /// Submission-queue depth after rounding.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn set_order(&mut self, order: CompletionOrder) {
        self.order = order;
    }

    /// Caps how many staged entries one submit consumes; `None` consumes all.
    pub fn set_submit_limit(&mut self, limit: Option<u32>) {
        self.submit_limit = limit;
    }

    /// Makes the next submit fail with `errno` without consuming anything.
    pub fn fail_next_submit(&mut self, errno: i32) {
        assert!(errno > 0);
        self.submit_error = Some(errno);
    }

    pub fn set_eventfd_enabled(&mut self, enabled: bool) {
        self.eventfd_enabled = enabled;
    }

    /// Timeouts submitted but not yet fired or removed.
    #[inline]
    pub fn pending_timeouts(&self) -> usize {
        self.timers.len()
    }

    /// Posts one completion and counts it against every count-armed timeout.
    fn post(&mut self, cqe: Cqe) {
        self.ready.push_back(cqe);

        let mut fired = Vec::new();
        self.timers.retain_mut(|timer| {
            if timer.remaining == 0 {
                return true;
            }
            timer.remaining -= 1;
            if timer.remaining == 0 {
                fired.push(timer.user_data);
                return false;
            }
            true
        });
        // Count-satisfied timeouts report success and are not counted themselves.
        for user_data in fired {
            self.ready.push_back(Cqe {
                user_data,
                result: 0,
                flags: 0,
            });
        }
    }

    /// Removes the timer tagged `target`; the removed timer completes with `-ECANCELED`.
    fn remove_timer(&mut self, target: u64, batch: &mut Vec<Cqe>) -> i32 {
        match self.timers.iter().position(|t| t.user_data == target) {
            Some(index) => {
                let timer = self.timers.swap_remove(index);
                batch.push(Cqe {
                    user_data: timer.user_data,
                    result: -libc::ECANCELED,
                    flags: 0,
                });
                0
            }
            None => -libc::ENOENT,
        }
    }

    /// Runs one entry. Returns `None` if the entry stays pending (armed timeout).
    ///
    /// # Safety
    ///
    /// Pointers in `entry` must be valid, per [`Transport::try_push`].
    unsafe fn execute(&mut self, user_data: u64, entry: &Entry, batch: &mut Vec<Cqe>) -> Option<i32> {
        // SAFETY (all arms): the caller of `try_push` guaranteed every pointer
        // and length in the entry addresses live memory.
        let result = unsafe {
            match *entry {
                Entry::Nop => 0,
                Entry::Send { fd, buf, len, flags } => {
                    syscall(libc::send(fd, buf.as_ptr().cast(), len as usize, flags))
                }
                Entry::Recv { fd, buf, len, flags } => {
                    syscall(libc::recv(fd, buf.as_ptr().cast(), len as usize, flags))
                }
                Entry::Connect { fd, addr } => syscall(libc::connect(
                    fd,
                    addr.as_ptr().cast::<libc::sockaddr>(),
                    size_of::<libc::sockaddr_in>() as libc::socklen_t,
                ) as isize),
                Entry::Accept {
                    fd,
                    addr,
                    addrlen,
                    flags,
                } => syscall(libc::accept4(
                    fd,
                    addr.as_ptr().cast::<libc::sockaddr>(),
                    addrlen.as_ptr(),
                    flags,
                ) as isize),
                Entry::Read {
                    fd,
                    buf,
                    len,
                    offset,
                } => match offset_of(offset) {
                    Some(offset) => {
                        syscall(libc::pread(fd, buf.as_ptr().cast(), len as usize, offset))
                    }
                    None => -libc::EINVAL,
                },
                Entry::Write {
                    fd,
                    buf,
                    len,
                    offset,
                } => match offset_of(offset) {
                    Some(offset) => {
                        syscall(libc::pwrite(fd, buf.as_ptr().cast(), len as usize, offset))
                    }
                    None => -libc::EINVAL,
                },
                Entry::Close { fd } => close(fd),
                Entry::Timeout { after, count, .. } => {
                    let deadline = Instant::now()
                        .checked_add(after)
                        .unwrap_or_else(|| Instant::now() + Duration::from_secs(u32::MAX as u64));
                    self.timers.push(Timer {
                        user_data,
                        deadline,
                        remaining: count,
                    });
                    return None;
                }
                Entry::TimeoutRemove { target } | Entry::Cancel { target } => {
                    self.remove_timer(target, batch)
                }
            }
        };
        Some(result)
    }

    fn expire(&mut self, index: usize) {
        let timer = self.timers.swap_remove(index);
        self.ready.push_back(Cqe {
            user_data: timer.user_data,
            result: -libc::ETIME,
            flags: 0,
        });
    }
}

impl Transport for BlockingTransport {
    fn setup(entries: u32, flags: u32) -> io::Result<Self> {
        if flags & !SETUP_FLAGS_SUPPORTED != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let depth = effective_depth(entries, flags & SETUP_CLAMP != 0)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;

        Ok(Self {
            depth,
            staged: VecDeque::with_capacity(depth as usize),
            ready: VecDeque::new(),
            timers: Vec::new(),
            order: CompletionOrder::Fifo,
            submit_limit: None,
            submit_error: None,
            eventfd_enabled: true,
        })
    }

    #[inline]
    fn sq_space_left(&self) -> u32 {
        self.depth - self.staged.len() as u32
    }

    #[inline]
    fn sq_staged(&self) -> u32 {
        self.staged.len() as u32
    }

    unsafe fn try_push(&mut self, entry: &Entry, user_data: u64) -> Result<(), ()> {
        assert!(user_data != 0);
        if self.staged.len() as u32 >= self.depth {
            return Err(());
        }
        self.staged.push_back((user_data, *entry));
        Ok(())
    }

    fn submit(&mut self) -> io::Result<u32> {
        if let Some(errno) = self.submit_error.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }

        let limit = self.submit_limit.unwrap_or(u32::MAX) as usize;
        let count = self.staged.len().min(limit);

        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            let Some((user_data, entry)) = self.staged.pop_front() else {
                break;
            };
            // SAFETY: entry was staged through `try_push`, whose caller keeps
            // its pointers valid until the completion is drained.
            if let Some(result) = unsafe { self.execute(user_data, &entry, &mut batch) } {
                batch.push(Cqe {
                    user_data,
                    result,
                    flags: 0,
                });
            }
        }

        if self.order == CompletionOrder::Reverse {
            batch.reverse();
        }
        for cqe in batch {
            self.post(cqe);
        }

        trace!(consumed = count, ready = self.ready.len(), "blocking submit");
        Ok(count as u32)
    }

    fn wait(&mut self, min_complete: u32, timeout: Option<Duration>) -> io::Result<()> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        loop {
            if self.ready.len() >= min_complete as usize {
                return Ok(());
            }

            let next = self
                .timers
                .iter()
                .enumerate()
                .min_by_key(|(_, timer)| timer.deadline)
                .map(|(index, timer)| (index, timer.deadline));

            match (next, deadline) {
                (Some((index, at)), Some(limit)) if at <= limit => {
                    sleep_until(at);
                    self.expire(index);
                }
                (Some((index, at)), None) => {
                    sleep_until(at);
                    self.expire(index);
                }
                (_, Some(limit)) => {
                    sleep_until(limit);
                    return Err(io::Error::from_raw_os_error(libc::ETIME));
                }
                // Nothing armed can ever complete; blocking would never return.
                (None, None) => return Err(io::Error::from_raw_os_error(libc::EAGAIN)),
            }
        }
    }

    fn drain<F: FnMut(u64, i32, u32)>(&mut self, mut f: F) {
        while let Some(cqe) = self.ready.pop_front() {
            f(cqe.user_data, cqe.result, cqe.flags);
        }
    }

    #[inline]
    fn cq_ready(&self) -> u32 {
        self.ready.len() as u32
    }

    #[inline]
    fn eventfd_enabled(&self) -> bool {
        self.eventfd_enabled
    }
}

/// Non-negative return value, or the negated errno of the failed call.
fn syscall(ret: isize) -> i32 {
    if ret < 0 {
        return -io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
    }
    i32::try_from(ret).unwrap_or(i32::MAX)
}

fn close(fd: RawFd) -> i32 {
    // SAFETY: closing an fd has no memory-safety preconditions.
    syscall(unsafe { libc::close(fd) } as isize)
}

fn offset_of(offset: u64) -> Option<libc::off_t> {
    libc::off_t::try_from(offset).ok()
}

fn sleep_until(at: Instant) {
    let now = Instant::now();
    if at > now {
        std::thread::sleep(at - now);
    }
}
