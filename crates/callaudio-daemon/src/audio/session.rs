// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Audio server session lifecycle.
//!
//! Turns connection state changes into what the event loop should do next:
//! initialize the registry once ready, or schedule a reconnect with a doubling
//! delay after a failure.

use crate::config::SessionConfig;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info};

/// Connection state reported by the server client library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Authorizing,
    SettingName,
    Ready,
    Failed,
    Terminated,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unconnected => "unconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authorizing => "authorizing",
            ConnectionState::SettingName => "setting name",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed => "failed",
            ConnectionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// What to do after a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Not ready yet, keep iterating.
    Wait,
    /// Subscribe and rebuild the registry.
    Initialize,
    /// Drop the context and connect again after the delay.
    Reconnect(Duration),
    /// The session ended on purpose; stop serving requests.
    Quiesce,
}

#[derive(Debug)]
pub struct Session {
    state: ConnectionState,
    attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Session {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            state: ConnectionState::Unconnected,
            attempts: 0,
            base_delay: config.reconnect_delay(),
            max_delay: config.max_reconnect_delay(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn on_state(&mut self, state: ConnectionState) -> SessionAction {
        if state == self.state {
            return SessionAction::Wait;
        }
        self.state = state;

        match state {
            ConnectionState::Unconnected
            | ConnectionState::Connecting
            | ConnectionState::Authorizing
            | ConnectionState::SettingName => {
                debug!("Audio server not ready ({})", state);
                SessionAction::Wait
            }
            ConnectionState::Ready => {
                info!("Audio server connection ready");
                self.attempts = 0;
                SessionAction::Initialize
            }
            ConnectionState::Failed => {
                let delay = self.next_delay();
                error!(
                    "Audio server connection failed, reconnecting in {:?}",
                    delay
                );
                self.attempts = self.attempts.saturating_add(1);
                // A fresh context starts over from the unconnected state.
                self.state = ConnectionState::Unconnected;
                SessionAction::Reconnect(delay)
            }
            ConnectionState::Terminated => {
                info!("Audio server connection terminated");
                SessionAction::Quiesce
            }
        }
    }

    fn next_delay(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempts.min(16)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}
