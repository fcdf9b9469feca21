// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! D-Bus client for communicating with callaudiod.

use callaudio_ipc::{CallMode, MicState, SpeakerState};
use tracing::{debug, info};
use zbus::{proxy, Connection, Result as ZbusResult};

/// D-Bus proxy for the daemon interface.
#[proxy(
    interface = "org.mobian_project.CallAudio",
    default_service = "org.mobian_project.CallAudio",
    default_path = "/org/mobian_project/CallAudio"
)]
trait CallAudio {
    // Methods
    fn select_mode(&self, mode: u32) -> ZbusResult<bool>;
    fn enable_speaker(&self, enable: bool) -> ZbusResult<bool>;
    fn mute_mic(&self, mute: bool) -> ZbusResult<bool>;

    // Properties
    #[zbus(property)]
    fn audio_mode(&self) -> ZbusResult<u32>;
    #[zbus(property)]
    fn speaker_state(&self) -> ZbusResult<u32>;
    #[zbus(property)]
    fn mic_state(&self) -> ZbusResult<u32>;
}

/// Snapshot of the daemon's published properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// `None` when the daemon reports a mode it has not applied yet.
    pub mode: Option<CallMode>,
    pub speaker: SpeakerState,
    pub mic: MicState,
}

/// Client for communicating with callaudiod.
pub struct DaemonClient {
    proxy: CallAudioProxy<'static>,
}

impl DaemonClient {
    /// Connect to the daemon on the session bus.
    pub async fn connect() -> Result<Self, DaemonClientError> {
        debug!("Connecting to callaudiod...");

        let connection = Connection::session()
            .await
            .map_err(|e| DaemonClientError::ConnectionFailed(e.to_string()))?;

        let proxy = CallAudioProxy::new(&connection)
            .await
            .map_err(|e| DaemonClientError::ProxyCreationFailed(e.to_string()))?;

        Ok(Self { proxy })
    }

    pub async fn select_mode(&self, mode: CallMode) -> Result<(), DaemonClientError> {
        info!("Selecting {} mode", mode);
        let ok = self
            .proxy
            .select_mode(mode.as_u32())
            .await
            .map_err(method_error)?;
        check(ok, "SelectMode")
    }

    pub async fn enable_speaker(&self, enable: bool) -> Result<(), DaemonClientError> {
        info!("{} speaker", if enable { "Enabling" } else { "Disabling" });
        let ok = self
            .proxy
            .enable_speaker(enable)
            .await
            .map_err(method_error)?;
        check(ok, "EnableSpeaker")
    }

    pub async fn mute_mic(&self, mute: bool) -> Result<(), DaemonClientError> {
        info!("{} microphone", if mute { "Muting" } else { "Unmuting" });
        let ok = self.proxy.mute_mic(mute).await.map_err(method_error)?;
        check(ok, "MuteMic")
    }

    /// Read the three state properties.
    pub async fn status(&self) -> Result<Status, DaemonClientError> {
        let mode = self.proxy.audio_mode().await.map_err(method_error)?;
        let speaker = self.proxy.speaker_state().await.map_err(method_error)?;
        let mic = self.proxy.mic_state().await.map_err(method_error)?;

        Ok(Status {
            mode: CallMode::from_u32(mode),
            speaker: SpeakerState::from_u32(speaker),
            mic: MicState::from_u32(mic),
        })
    }
}

fn method_error(e: zbus::Error) -> DaemonClientError {
    match e {
        zbus::Error::MethodError(name, message, _) => {
            let message = message.unwrap_or_else(|| name.to_string());
            match name.as_str() {
                "org.freedesktop.DBus.Error.ServiceUnknown"
                | "org.freedesktop.DBus.Error.NameHasNoOwner" => {
                    DaemonClientError::DaemonNotRunning(message)
                }
                _ => DaemonClientError::Rejected(message),
            }
        }
        other => DaemonClientError::MethodCallFailed(other.to_string()),
    }
}

fn check(ok: bool, method: &'static str) -> Result<(), DaemonClientError> {
    if ok {
        Ok(())
    } else {
        Err(DaemonClientError::Rejected(format!("{} returned false", method)))
    }
}

/// Errors that can occur when communicating with the daemon.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DaemonClientError {
    #[error("Failed to connect to D-Bus: {0}")]
    ConnectionFailed(String),
    #[error("Failed to create D-Bus proxy: {0}")]
    ProxyCreationFailed(String),
    #[error("Daemon is not running: {0}")]
    DaemonNotRunning(String),
    #[error("Method call failed: {0}")]
    MethodCallFailed(String),
    #[error("Daemon refused the request: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_false_is_rejection() {
        assert!(check(true, "MuteMic").is_ok());
        assert!(matches!(
            check(false, "MuteMic"),
            Err(DaemonClientError::Rejected(msg)) if msg.contains("MuteMic")
        ));
    }

    #[test]
    fn test_generic_error_maps_to_call_failure() {
        let err = method_error(zbus::Error::InvalidReply);
        assert!(matches!(err, DaemonClientError::MethodCallFailed(_)));
    }
}
