//! Operation/completion object model over the Linux `io_uring` interface.
//!
//! A [`Ring`] hands out [`Operation`] descriptors, submits them as one batch,
//! and materializes a [`Completion`] for every event the kernel posts. See
//! [`io`] for the ownership rules that keep buffers alive while the kernel
//! can still touch them.

#[cfg(not(target_os = "linux"))]
compile_error!("uring-objects requires Linux");

pub mod config;
pub mod constants;
pub mod error;
pub mod io;
pub mod stdx;
#[cfg(test)]
mod test_utils;

pub use config::RingConfig;
pub use error::{Error, Result};
pub use io::{
    BlockingTransport, Completion, CompletionOrder, KernelRing, Opcode, Operation,
    OperationState, Output, Ring, RingStats, Transport,
};
