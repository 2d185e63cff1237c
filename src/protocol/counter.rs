//! Modular sequence allocators.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

/// Steps wrap one short of the u32 range.
pub const STEP_MODULUS: u32 = u32::MAX;

/// Monotonic step counter for one direction of a session.
///
/// `claim` returns the current value and advances modulo
/// [`STEP_MODULUS`]. Cloning snapshots the value into an independent
/// sibling: the sender and receiver directions branch from the same
/// post-handshake step and advance separately.
#[derive(Debug)]
pub struct StepCounter {
    next: AtomicU32,
}

impl StepCounter {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(step: u32) -> Self {
        Self {
            next: AtomicU32::new(step % STEP_MODULUS),
        }
    }

    /// Take the next step for this direction.
    pub fn claim(&self) -> u32 {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some((current + 1) % STEP_MODULUS)
            })
            .unwrap_or_else(|current| current)
    }

    /// The step the next `claim` will return.
    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::Acquire)
    }
}

impl Default for StepCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for StepCounter {
    fn clone(&self) -> Self {
        Self::starting_at(self.peek())
    }
}

/// Session nonce allocator owned by an initiator.
///
/// Nonces are u16 and skip 0, which is reserved for session control not
/// yet assigned a nonce.
#[derive(Debug)]
pub struct NonceCounter {
    next: AtomicU16,
}

impl NonceCounter {
    pub fn new() -> Self {
        Self {
            next: AtomicU16::new(1),
        }
    }

    /// Take the next nonce, wrapping past u16::MAX back to 1.
    pub fn claim(&self) -> u16 {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(match current.wrapping_add(1) {
                    0 => 1,
                    next => next,
                })
            })
            .unwrap_or_else(|current| current)
    }
}

impl Default for NonceCounter {
    fn default() -> Self {
        Self::new()
    }
}
