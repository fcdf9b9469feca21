// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared IPC types and D-Bus interface definitions for callaudio.
//!
//! This crate defines the communication protocol between the call audio
//! daemon and its clients via D-Bus. Enumerations travel as `u32` on the bus,
//! matching the historical CallAudio interface.

use serde::{Deserialize, Serialize};
use std::fmt;
use zbus::zvariant::Type;

/// D-Bus service name for the call audio daemon.
pub const DBUS_NAME: &str = "org.mobian_project.CallAudio";

/// D-Bus object path for the main daemon interface.
pub const DBUS_PATH: &str = "/org/mobian_project/CallAudio";

/// D-Bus interface name.
pub const DBUS_INTERFACE: &str = "org.mobian_project.CallAudio";

/// Audio mode of the phone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Type)]
pub enum CallMode {
    /// Regular media playback and capture.
    #[default]
    Normal,
    /// Voice call routing (earpiece, call profile).
    Call,
}

impl CallMode {
    /// Wire value used on D-Bus.
    pub fn as_u32(self) -> u32 {
        match self {
            CallMode::Normal => 0,
            CallMode::Call => 1,
        }
    }

    /// Parse a wire value; anything other than 0 or 1 is rejected.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(CallMode::Normal),
            1 => Some(CallMode::Call),
            _ => None,
        }
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallMode::Normal => write!(f, "normal"),
            CallMode::Call => write!(f, "call"),
        }
    }
}

/// Tri-state used for the speaker and microphone properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Type)]
pub enum SwitchState {
    Off,
    On,
    /// The daemon has not applied or observed the state yet.
    #[default]
    Unknown,
}

impl SwitchState {
    pub fn as_u32(self) -> u32 {
        match self {
            SwitchState::Off => 0,
            SwitchState::On => 1,
            SwitchState::Unknown => 2,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => SwitchState::Off,
            1 => SwitchState::On,
            _ => SwitchState::Unknown,
        }
    }
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on {
            SwitchState::On
        } else {
            SwitchState::Off
        }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchState::Off => write!(f, "off"),
            SwitchState::On => write!(f, "on"),
            SwitchState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Speaker routing state (`SpeakerState` property).
pub type SpeakerState = SwitchState;

/// Microphone state (`MicState` property). `On` means the mic is live.
pub type MicState = SwitchState;

/// Port direction, used to qualify port-related failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Output,
    Input,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Output => write!(f, "output"),
            Direction::Input => write!(f, "input"),
        }
    }
}

/// Error types for call audio operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallAudioError {
    #[error("No usable card")]
    NoCard,
    #[error("No usable sink")]
    NoSink,
    #[error("No usable source")]
    NoSource,
    #[error("Sink has no speaker port")]
    NoSpeakerPort,
    #[error("No available {0} port")]
    NoAvailablePort(Direction),
    #[error("Not connected to the audio server")]
    NotConnected,
    #[error("Connection to the audio server was lost")]
    ConnectionLost,
    #[error("Audio server rejected {0}")]
    ServerRejected(String),
    #[error("Audio server returned no {0} info")]
    MalformedReply(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallAudioError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallAudioError::NotConnected
                | CallAudioError::ConnectionLost
                | CallAudioError::MalformedReply(_)
        )
    }
}

impl From<CallAudioError> for zbus::fdo::Error {
    fn from(e: CallAudioError) -> Self {
        match e {
            CallAudioError::InvalidArgument(msg) => zbus::fdo::Error::InvalidArgs(msg),
            other => zbus::fdo::Error::Failed(other.to_string()),
        }
    }
}
