// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Device session state machine.
//!
//! Makes the connection lifecycle of one module explicit so that a session
//! task can only move through valid states:
//!
//! ```text
//! Idle -> Connecting -> Streaming | Polling -> Idle
//!         Connecting -> WaitingRetry -> Connecting
//! Idle -> Writing -> Idle
//! any  -> Cancelled
//! ```

use std::fmt;

use serde::Serialize;

use crate::device::{DeviceRole, DeviceStatus};

/// Events that can trigger state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Start a connect round (initial start or after backoff).
    ConnectRequested,
    /// One connect attempt failed; more attempts remain in the round.
    ConnectFailed,
    /// The connect round is exhausted.
    RetriesExhausted,
    /// Link established; the role selects the acquisition discipline.
    Connected(DeviceRole),
    /// The link dropped or the acquisition failed while connected.
    LinkLost,
    /// Acquisition finished cleanly.
    Completed,
    WriteStarted,
    WriteFinished,
    Cancelled,
}

/// Current state of a device session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    /// `attempt` counts failed attempts in the current round.
    Connecting { attempt: u32 },
    Streaming,
    Polling,
    WaitingRetry,
    Writing,
    Cancelled,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting { attempt } => write!(f, "Connecting({attempt})"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Polling => write!(f, "Polling"),
            Self::WaitingRetry => write!(f, "WaitingRetry"),
            Self::Writing => write!(f, "Writing"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl SessionState {
    /// Externally visible status. `Cancelled` reports as `Idle`.
    pub fn status(&self) -> DeviceStatus {
        match self {
            Self::Idle | Self::Cancelled => DeviceStatus::Idle,
            Self::Connecting { .. } => DeviceStatus::Connecting,
            Self::Streaming => DeviceStatus::Streaming,
            Self::Polling => DeviceStatus::Polling,
            Self::WaitingRetry => DeviceStatus::WaitingRetry,
            Self::Writing => DeviceStatus::Writing,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// The session state machine.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionState,
    transition_count: u64,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            transition_count: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> DeviceStatus {
        self.state.status()
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Process an event and potentially transition to a new state.
    /// Returns true if a transition occurred.
    pub fn process_event(&mut self, event: SessionEvent) -> bool {
        match self.next_state(event) {
            Some(state) => {
                self.state = state;
                self.transition_count += 1;
                true
            }
            None => false,
        }
    }

    fn next_state(&self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (self.state, event) {
            // Cancelled is absorbing
            (S::Cancelled, _) => None,
            (_, E::Cancelled) => Some(S::Cancelled),

            (S::Idle | S::WaitingRetry, E::ConnectRequested) => {
                Some(S::Connecting { attempt: 0 })
            }

            (S::Connecting { attempt }, E::ConnectFailed) => Some(S::Connecting {
                attempt: attempt.saturating_add(1),
            }),
            (S::Connecting { .. }, E::RetriesExhausted) => Some(S::WaitingRetry),
            (S::Connecting { .. }, E::Connected(DeviceRole::Tag)) => Some(S::Streaming),
            (S::Connecting { .. }, E::Connected(DeviceRole::Anchor)) => Some(S::Polling),

            // A lost stream starts a fresh connect round right away.
            (S::Streaming, E::LinkLost) => Some(S::Connecting { attempt: 0 }),
            // A failed poll waits out the backoff.
            (S::Polling, E::LinkLost) => Some(S::WaitingRetry),
            (S::Streaming | S::Polling, E::Completed) => Some(S::Idle),

            (S::Idle, E::WriteStarted) => Some(S::Writing),
            (S::Writing, E::WriteFinished) => Some(S::Idle),

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let sm = SessionStateMachine::new();
        assert_eq!(sm.state(), SessionState::Idle);
        assert_eq!(sm.status(), DeviceStatus::Idle);
        assert_eq!(sm.transition_count(), 0);
    }

    #[test]
    fn test_tag_lifecycle_with_retry() {
        let mut sm = SessionStateMachine::new();
        assert!(sm.process_event(SessionEvent::ConnectRequested));
        assert!(sm.process_event(SessionEvent::ConnectFailed));
        assert!(sm.process_event(SessionEvent::ConnectFailed));
        assert_eq!(sm.state(), SessionState::Connecting { attempt: 2 });
        assert!(sm.process_event(SessionEvent::RetriesExhausted));
        assert_eq!(sm.status(), DeviceStatus::WaitingRetry);

        assert!(sm.process_event(SessionEvent::ConnectRequested));
        assert!(sm.process_event(SessionEvent::Connected(DeviceRole::Tag)));
        assert_eq!(sm.status(), DeviceStatus::Streaming);

        assert!(sm.process_event(SessionEvent::LinkLost));
        assert_eq!(sm.state(), SessionState::Connecting { attempt: 0 });
    }

    #[test]
    fn test_anchor_polls_then_completes() {
        let mut sm = SessionStateMachine::new();
        sm.process_event(SessionEvent::ConnectRequested);
        sm.process_event(SessionEvent::Connected(DeviceRole::Anchor));
        assert_eq!(sm.status(), DeviceStatus::Polling);
        assert!(sm.process_event(SessionEvent::Completed));
        assert_eq!(sm.state(), SessionState::Idle);
    }

    #[test]
    fn test_failed_poll_waits_for_backoff() {
        let mut sm = SessionStateMachine::new();
        sm.process_event(SessionEvent::ConnectRequested);
        sm.process_event(SessionEvent::Connected(DeviceRole::Anchor));
        assert!(sm.process_event(SessionEvent::LinkLost));
        assert_eq!(sm.state(), SessionState::WaitingRetry);
    }

    #[test]
    fn test_cancel_is_absorbing() {
        let mut sm = SessionStateMachine::new();
        sm.process_event(SessionEvent::ConnectRequested);
        sm.process_event(SessionEvent::Connected(DeviceRole::Tag));
        assert!(sm.process_event(SessionEvent::Cancelled));
        assert!(sm.state().is_terminal());
        assert_eq!(sm.status(), DeviceStatus::Idle);
        assert!(!sm.process_event(SessionEvent::ConnectRequested));
        assert!(!sm.process_event(SessionEvent::Cancelled));
    }

    #[test]
    fn test_invalid_transitions_ignored() {
        let mut sm = SessionStateMachine::new();
        assert!(!sm.process_event(SessionEvent::Connected(DeviceRole::Tag)));
        assert!(!sm.process_event(SessionEvent::WriteFinished));
        assert!(sm.process_event(SessionEvent::WriteStarted));
        assert!(!sm.process_event(SessionEvent::ConnectRequested));
        assert!(sm.process_event(SessionEvent::WriteFinished));
        assert_eq!(sm.transition_count(), 2);
    }
}
