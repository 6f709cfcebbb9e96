//! Pause / resume / abort handle for a running DFU session.
//!
//! The executor runs on its own thread; the caller keeps a cloned
//! [`DfuController`] and may steer the session from any thread.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::protocol::DfuState;

#[derive(Debug, Default)]
struct ControlState {
    state: Option<DfuState>,
    paused: bool,
    aborted: bool,
}

/// Cloneable handle controlling one DFU session.
#[derive(Debug, Clone, Default)]
pub struct DfuController {
    inner: Arc<(Mutex<ControlState>, Condvar)>,
}

impl DfuController {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stop sending firmware after the in-flight PRN window drains.
    ///
    /// Returns false unless the session is uploading and not yet paused.
    pub fn pause(&self) -> bool {
        let mut control = self.lock();
        if control.state != Some(DfuState::Uploading) || control.paused || control.aborted {
            return false;
        }
        control.paused = true;
        true
    }

    /// Continue a paused upload from the next unsent byte.
    pub fn resume(&self) -> bool {
        let mut control = self.lock();
        if !control.paused {
            return false;
        }
        control.paused = false;
        self.inner.1.notify_all();
        true
    }

    /// Request the session to stop at its next suspension point.
    ///
    /// Returns false once the session reached a terminal state.
    pub fn abort(&self) -> bool {
        let mut control = self.lock();
        if control.state.map_or(false, DfuState::is_terminal) {
            return false;
        }
        control.aborted = true;
        control.paused = false;
        self.inner.1.notify_all();
        true
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    pub(crate) fn set_state(&self, state: DfuState) {
        let mut control = self.lock();
        control.state = Some(state);
        if state != DfuState::Uploading {
            control.paused = false;
        }
    }

    /// Block while paused. Returns true if the session was aborted.
    pub(crate) fn wait_while_paused(&self) -> bool {
        let mut control = self.lock();
        while control.paused && !control.aborted {
            control = self
                .inner
                .1
                .wait(control)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        control.aborted
    }
}
