//! Shared decode gate.
//!
//! A counting semaphore over the final-stage decode. Callers never wait on it
//! without a bound: [`DecodeGate::acquire`] gives up after its timeout and the
//! caller is expected to carry on without the gate. A worker that is truly
//! wedged behind the decode is then caught by the stall detector.
//!
//! A [`DecodePermit`] releases its slot exactly once, either through
//! [`DecodePermit::release`] or when dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Reasons an acquisition did not produce a permit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    /// The bounded wait elapsed.
    #[error("Decode gate not acquired within {0:?}")]
    Timeout(Duration),

    /// The gate was closed during shutdown.
    #[error("Decode gate is closed")]
    Closed,
}

/// Bounded-concurrency gate. Cloning shares the same slots.
#[derive(Debug, Clone)]
pub struct DecodeGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl DecodeGate {
    /// Creates a gate admitting at most `capacity` simultaneous holders.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Waits up to `timeout` for a slot.
    ///
    /// # Errors
    ///
    /// Returns `GateError::Timeout` when no slot freed up in time and
    /// `GateError::Closed` after [`close`](Self::close).
    pub async fn acquire(&self, timeout: Duration) -> Result<DecodePermit, GateError> {
        let semaphore = Arc::clone(&self.semaphore);
        match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(DecodePermit {
                permit,
                acquired_at: Instant::now(),
            }),
            Ok(Err(_)) => Err(GateError::Closed),
            Err(_) => Err(GateError::Timeout(timeout)),
        }
    }

    /// Takes a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<DecodePermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| DecodePermit {
                permit,
                acquired_at: Instant::now(),
            })
    }

    /// Free slots at this instant.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fails all current and future waiters. Held permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// Proof of holding one gate slot.
#[derive(Debug)]
pub struct DecodePermit {
    permit: OwnedSemaphorePermit,
    acquired_at: Instant,
}

impl DecodePermit {
    /// How long the slot has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Returns the slot to the gate. Consuming `self` makes a second release
    /// impossible.
    pub fn release(self) {
        drop(self.permit);
    }
}
