//! In-flight command limiting.
//!
//! The bridge reserves a slot for every command it puts on the wire and
//! releases it when the command resolves (result, timeout, failure or
//! shutdown). This bounds the correlation table when the worker stalls.
//!
//! Slots are handed out as [`BackpressureGuard`]s, so a slot can never leak
//! on an early return.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{RenderwireError, Result};

/// Default maximum in-flight commands.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1024;

/// Shared counter of in-flight commands with a hard limit.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
}

impl BackpressureController {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: max_in_flight.max(1),
        }
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Reserve a slot without waiting.
    ///
    /// Returns `Err(BackpressureTimeout)` if at capacity.
    pub fn try_acquire(&self) -> Result<BackpressureGuard> {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.max_in_flight {
                return Err(RenderwireError::BackpressureTimeout);
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(BackpressureGuard {
                        in_flight: self.in_flight.clone(),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// One reserved slot; released on drop.
#[derive(Debug)]
pub struct BackpressureGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for BackpressureGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Release);
    }
}
