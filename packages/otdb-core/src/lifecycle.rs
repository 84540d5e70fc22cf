use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Open,
    Closing,
    Closed,
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Open/closed state owned by a backend instance.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(OPEN),
        }
    }

    pub fn state(&self) -> LifecycleState {
        match self.state.load(Ordering::Acquire) {
            OPEN => LifecycleState::Open,
            CLOSING => LifecycleState::Closing,
            _ => LifecycleState::Closed,
        }
    }

    pub fn ensure_open(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Open => Ok(()),
            _ => Err(Error::AlreadyClosed),
        }
    }

    /// Move Open -> Closing. Returns `false` if another caller already started closing, in which
    /// case the caller must not release resources again.
    pub fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_close(&self) {
        self.state.store(CLOSED, Ordering::Release);
    }
}
