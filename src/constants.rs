//! Ring sizing and setup constants.
//!
//! Queue depths are `u32` to match the kernel's `io_uring_setup(2)` interface.
//! All invariants verified at compile time via `const` assertions.

// =============================================================================
// Platform verification
// =============================================================================

// Compile-time proof that u32 -> usize is safe on this platform.
const _: () = assert!(
    size_of::<usize>() >= size_of::<u32>(),
    "Platform must have at least 32-bit addressing"
);

// =============================================================================
// Queue depth
// =============================================================================

/// Smallest submission-queue depth the kernel accepts.
pub const QUEUE_DEPTH_MIN: u32 = 1;

/// Largest submission-queue depth the kernel accepts without `SETUP_CLAMP`
/// (`IORING_MAX_ENTRIES`).
pub const QUEUE_DEPTH_MAX: u32 = 32768;

/// Depth used when no configuration is supplied.
pub const QUEUE_DEPTH_DEFAULT: u32 = 256;

/// The kernel sizes the completion queue at twice the submission queue.
pub const CQ_ENTRIES_MULTIPLIER: u32 = 2;

// =============================================================================
// Setup flags (subset of `IORING_SETUP_*`)
// =============================================================================

/// Busy-poll for completions instead of interrupts (`IORING_SETUP_IOPOLL`).
pub const SETUP_IOPOLL: u32 = 1 << 0;

/// Kernel thread polls the submission queue (`IORING_SETUP_SQPOLL`).
pub const SETUP_SQPOLL: u32 = 1 << 1;

/// Clamp out-of-range depths instead of failing (`IORING_SETUP_CLAMP`).
pub const SETUP_CLAMP: u32 = 1 << 4;

/// Every flag bit a transport is expected to understand.
pub const SETUP_FLAGS_SUPPORTED: u32 = SETUP_IOPOLL | SETUP_SQPOLL | SETUP_CLAMP;

/// Idle time before the SQPOLL kernel thread sleeps.
pub const SQPOLL_IDLE_MS: u32 = 1000;

// =============================================================================
// Compile-time design integrity assertions
// =============================================================================

const _: () = assert!(QUEUE_DEPTH_MIN > 0);
const _: () = assert!(QUEUE_DEPTH_MIN <= QUEUE_DEPTH_DEFAULT);
const _: () = assert!(QUEUE_DEPTH_DEFAULT <= QUEUE_DEPTH_MAX);
const _: () = assert!(
    QUEUE_DEPTH_DEFAULT.is_power_of_two(),
    "Kernel rounds depths up to a power of two"
);
const _: () = assert!(QUEUE_DEPTH_MAX.is_power_of_two());
const _: () = assert!(
    QUEUE_DEPTH_MAX.checked_mul(CQ_ENTRIES_MULTIPLIER).is_some(),
    "Completion queue size must fit in u32"
);
const _: () = assert!(SETUP_IOPOLL & SETUP_SQPOLL == 0);
const _: () = assert!(SETUP_SQPOLL & SETUP_CLAMP == 0);

/// Effective submission-queue size for a requested depth: rounded up to a
/// power of two, and clamped to the valid range if `clamp` is set.
///
/// Returns `None` when the depth is out of range and `clamp` is not set.
pub const fn effective_depth(requested: u32, clamp: bool) -> Option<u32> {
    let depth = if requested < QUEUE_DEPTH_MIN {
        if !clamp {
            return None;
        }
        QUEUE_DEPTH_MIN
    } else if requested > QUEUE_DEPTH_MAX {
        if !clamp {
            return None;
        }
        QUEUE_DEPTH_MAX
    } else {
        requested
    };
    Some(depth.next_power_of_two())
}

// =============================================================================
// Tests
// =============================================================================
