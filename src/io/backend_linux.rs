//! Production transport over the kernel's `io_uring`.

use std::io;
use std::time::Duration;

use io_uring::{IoUring, opcode, squeue, types};
use tracing::debug;

use super::{Entry, Transport};
use crate::constants::{
    SETUP_CLAMP, SETUP_FLAGS_SUPPORTED, SETUP_IOPOLL, SETUP_SQPOLL, SQPOLL_IDLE_MS,
};

pub struct UringTransport {
    ring: IoUring,
}

impl UringTransport {
    /// Translates an [`Entry`] into a submission-queue entry tagged `user_data`.
    fn build(entry: &Entry, user_data: u64) -> squeue::Entry {
        let sqe = match *entry {
            Entry::Nop => opcode::Nop::new().build(),
            Entry::Send { fd, buf, len, flags } => {
                opcode::Send::new(types::Fd(fd), buf.as_ptr() as *const u8, len)
                    .flags(flags)
                    .build()
            }
            Entry::Recv { fd, buf, len, flags } => {
                opcode::Recv::new(types::Fd(fd), buf.as_ptr(), len)
                    .flags(flags)
                    .build()
            }
            Entry::Connect { fd, addr } => opcode::Connect::new(
                types::Fd(fd),
                addr.as_ptr() as *const libc::sockaddr,
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
            .build(),
            Entry::Accept {
                fd,
                addr,
                addrlen,
                flags,
            } => opcode::Accept::new(
                types::Fd(fd),
                addr.as_ptr().cast::<libc::sockaddr>(),
                addrlen.as_ptr(),
            )
            .flags(flags)
            .build(),
            Entry::Read {
                fd,
                buf,
                len,
                offset,
            } => opcode::Read::new(types::Fd(fd), buf.as_ptr(), len)
                .offset(offset)
                .build(),
            Entry::Write {
                fd,
                buf,
                len,
                offset,
            } => opcode::Write::new(types::Fd(fd), buf.as_ptr() as *const u8, len)
                .offset(offset)
                .build(),
            Entry::Timeout {
                ts, count, flags, ..
            } => opcode::Timeout::new(ts.as_ptr() as *const types::Timespec)
                .count(count)
                .flags(types::TimeoutFlags::from_bits_truncate(flags))
                .build(),
            Entry::TimeoutRemove { target } => opcode::TimeoutRemove::new(target).build(),
            Entry::Cancel { target } => opcode::AsyncCancel::new(target).build(),
            Entry::Close { fd } => opcode::Close::new(types::Fd(fd)).build(),
        };
        sqe.user_data(user_data)
    }
}

impl Transport for UringTransport {
    fn setup(entries: u32, flags: u32) -> io::Result<Self> {
        if flags & !SETUP_FLAGS_SUPPORTED != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let mut builder = IoUring::builder();
        if flags & SETUP_IOPOLL != 0 {
            builder.setup_iopoll();
        }
        if flags & SETUP_SQPOLL != 0 {
            builder.setup_sqpoll(SQPOLL_IDLE_MS);
        }
        if flags & SETUP_CLAMP != 0 {
            builder.setup_clamp();
        }
        let ring = builder.build(entries)?;

        debug!(
            entries,
            flags,
            sq = ring.params().sq_entries(),
            cq = ring.params().cq_entries(),
            "io_uring ready"
        );
        Ok(Self { ring })
    }

    fn sq_space_left(&self) -> u32 {
        // SAFETY: every mutable queue handle is taken through `&mut self`, so
        // none can be alive while we hold `&self`.
        let sq = unsafe { self.ring.submission_shared() };
        (sq.capacity() - sq.len()) as u32
    }

    fn sq_staged(&self) -> u32 {
        // SAFETY: see `sq_space_left`. The shared view loads the kernel's head.
        let sq = unsafe { self.ring.submission_shared() };
        sq.len() as u32
    }

    unsafe fn try_push(&mut self, entry: &Entry, user_data: u64) -> Result<(), ()> {
        assert!(user_data != 0);
        let sqe = Self::build(entry, user_data);
        // SAFETY: the caller keeps every pointer in `entry` valid until the
        // completion for `user_data` is drained.
        unsafe { self.ring.submission().push(&sqe) }.map_err(|_| ())
    }

    fn submit(&mut self) -> io::Result<u32> {
        let submitted = self.ring.submit()?;
        Ok(submitted as u32)
    }

    fn wait(&mut self, min_complete: u32, timeout: Option<Duration>) -> io::Result<()> {
        let want = min_complete as usize;
        loop {
            let result = match timeout {
                None => self.ring.submit_and_wait(want),
                Some(timeout) => {
                    let ts = types::Timespec::from(timeout);
                    let args = types::SubmitArgs::new().timespec(&ts);
                    self.ring.submitter().submit_with_args(want, &args)
                }
            };
            match result {
                Ok(_) => return Ok(()),
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn drain<F: FnMut(u64, i32, u32)>(&mut self, mut f: F) {
        for cqe in self.ring.completion() {
            f(cqe.user_data(), cqe.result(), cqe.flags());
        }
    }

    fn cq_ready(&self) -> u32 {
        // SAFETY: see `sq_space_left`.
        let cq = unsafe { self.ring.completion_shared() };
        cq.len() as u32
    }

    fn eventfd_enabled(&self) -> bool {
        // SAFETY: see `sq_space_left`.
        let cq = unsafe { self.ring.completion_shared() };
        !cq.eventfd_disabled()
    }
}
