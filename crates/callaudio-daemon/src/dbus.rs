// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! D-Bus interface implementation for the daemon.

use crate::audio::operation::Request;
use crate::service::{CallAudioService, SignalEvent};
use callaudio_ipc::{CallAudioError, CallMode, MicState, SpeakerState};
use std::sync::{Arc, Mutex};
use tracing::debug;
use zbus::interface;
use zbus::object_server::InterfaceRef;

/// The D-Bus interface implementation.
pub struct CallAudioDbusService {
    service: Arc<Mutex<CallAudioService>>,
    mode: CallMode,
    speaker: SpeakerState,
    mic: MicState,
}

impl CallAudioDbusService {
    pub fn new(service: Arc<Mutex<CallAudioService>>) -> Self {
        Self {
            service,
            mode: CallMode::default(),
            speaker: SpeakerState::default(),
            mic: MicState::default(),
        }
    }

    /// Submit a request and wait until the router resolves it.
    async fn run(&self, request: Request) -> zbus::fdo::Result<bool> {
        let outcome = {
            let service = self
                .service
                .lock()
                .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
            service
                .submit(request)
                .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
        };

        // A dropped sender means the audio thread went away with the request.
        outcome
            .await
            .unwrap_or(Err(CallAudioError::ConnectionLost))
            .map_err(zbus::fdo::Error::from)?;
        Ok(true)
    }
}

#[interface(name = "org.mobian_project.CallAudio")]
impl CallAudioDbusService {
    /// Switch between normal (0) and call (1) audio mode.
    async fn select_mode(&self, mode: u32) -> zbus::fdo::Result<bool> {
        debug!("D-Bus: select_mode({})", mode);
        let mode = CallMode::from_u32(mode).ok_or_else(|| {
            CallAudioError::InvalidArgument(format!("audio mode {}", mode))
        })?;
        self.run(Request::SelectMode(mode)).await
    }

    /// Route output to the speaker, or away from it.
    async fn enable_speaker(&self, enable: bool) -> zbus::fdo::Result<bool> {
        debug!("D-Bus: enable_speaker({})", enable);
        self.run(Request::EnableSpeaker(enable)).await
    }

    async fn mute_mic(&self, mute: bool) -> zbus::fdo::Result<bool> {
        debug!("D-Bus: mute_mic({})", mute);
        self.run(Request::MuteMic(mute)).await
    }

    // ==================== Properties ====================

    #[zbus(property)]
    async fn audio_mode(&self) -> u32 {
        self.mode.as_u32()
    }

    #[zbus(property)]
    async fn speaker_state(&self) -> u32 {
        self.speaker.as_u32()
    }

    #[zbus(property)]
    async fn mic_state(&self) -> u32 {
        self.mic.as_u32()
    }
}

/// Store a state change and emit `PropertiesChanged` for it.
pub async fn publish(
    iface_ref: &InterfaceRef<CallAudioDbusService>,
    event: SignalEvent,
) -> zbus::Result<()> {
    let ctx = iface_ref.signal_context();
    let mut iface = iface_ref.get_mut().await;

    match event {
        SignalEvent::ModeChanged(mode) => {
            iface.mode = mode;
            iface.audio_mode_changed(ctx).await
        }
        SignalEvent::SpeakerChanged(state) => {
            iface.speaker = state;
            iface.speaker_state_changed(ctx).await
        }
        SignalEvent::MicChanged(state) => {
            iface.mic = state;
            iface.mic_state_changed(ctx).await
        }
    }
}
