//! Connection lifecycle shared by every backend session.
//!
//! A session walks `Uninitialized -> Connecting -> Ready` while it acquires its
//! platform resources and waits for the server or driver to accept it. From
//! `Ready` it either keeps serving pulls until it is dropped, or it observes a
//! failure (`Failed`) or an external shutdown (`Terminated`). Both of those are
//! final: a session never reconnects.

use crate::models::audio::AudioError;
use crate::models::capture::CaptureError;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Ready,
    Failed,
    Terminated,
}

impl ConnectionState {
    pub fn is_final(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Terminated)
    }

    fn can_move_to(&self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Uninitialized, Connecting)
                | (Uninitialized, Failed)
                | (Connecting, Ready)
                | (Connecting, Failed)
                | (Ready, Failed)
                | (Ready, Terminated)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{backend} session cannot move from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub backend: &'static str,
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{backend} session is {state:?}")]
pub struct NotConnected {
    pub backend: &'static str,
    pub state: ConnectionState,
}

impl From<NotConnected> for CaptureError {
    fn from(e: NotConnected) -> Self {
        CaptureError::NotConnected(e.to_string())
    }
}

impl From<NotConnected> for AudioError {
    fn from(e: NotConnected) -> Self {
        AudioError::NotConnected(e.to_string())
    }
}

impl From<InvalidTransition> for CaptureError {
    fn from(e: InvalidTransition) -> Self {
        CaptureError::ResourceAcquisition(e.to_string())
    }
}

impl From<InvalidTransition> for AudioError {
    fn from(e: InvalidTransition) -> Self {
        AudioError::ResourceAcquisition(e.to_string())
    }
}

/// Connection state of one backend session
#[derive(Debug)]
pub struct Lifecycle {
    backend: &'static str,
    state: ConnectionState,
}

impl Lifecycle {
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            state: ConnectionState::Uninitialized,
        }
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Start acquiring resources
    pub fn begin(&mut self) -> Result<(), InvalidTransition> {
        self.move_to(ConnectionState::Connecting)
    }

    /// The backend reported readiness
    pub fn ready(&mut self) -> Result<(), InvalidTransition> {
        self.move_to(ConnectionState::Ready)
    }

    /// Record a failure. Failing a session that already ended is a no-op.
    pub fn fail(&mut self, reason: &str) {
        if self.state.is_final() {
            return;
        }
        warn!(backend = self.backend, from = ?self.state, reason, "Capture session failed");
        self.state = ConnectionState::Failed;
    }

    /// The server or driver shut the session down. Not an error, not retried.
    pub fn terminate(&mut self) {
        if self.state != ConnectionState::Ready {
            return;
        }
        info!(backend = self.backend, "Capture session terminated");
        self.state = ConnectionState::Terminated;
    }

    /// Gate for pull operations
    pub fn ensure_ready(&self) -> Result<(), NotConnected> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(NotConnected {
                backend: self.backend,
                state: self.state,
            })
        }
    }

    fn move_to(&mut self, to: ConnectionState) -> Result<(), InvalidTransition> {
        if !self.state.can_move_to(to) {
            return Err(InvalidTransition {
                backend: self.backend,
                from: self.state,
                to,
            });
        }
        debug!(backend = self.backend, from = ?self.state, to = ?to, "Session state change");
        self.state = to;
        Ok(())
    }
}
