// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Core daemon service: owns the PulseAudio thread and hands it requests.

use crate::audio::operation::Request;
use crate::audio::pulse_thread::{PulseError, PulseThread, RouterCommand};
use crate::config::DaemonConfig;
use callaudio_ipc::{CallAudioError, CallMode, MicState, SpeakerState};
use thiserror::Error;
use tokio::sync::mpsc as tokio_mpsc;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// D-Bus property changes that need to be published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    ModeChanged(CallMode),
    SpeakerChanged(SpeakerState),
    MicChanged(MicState),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("PulseAudio error: {0}")]
    Pulse(#[from] PulseError),
    #[error("PulseAudio thread not running")]
    NotRunning,
}

/// Outcome of a request, delivered once the router resolves it.
pub type Outcome = oneshot::Receiver<Result<(), CallAudioError>>;

/// The main daemon service.
pub struct CallAudioService {
    config: DaemonConfig,
    pulse_thread: Option<PulseThread>,
    /// Sender for D-Bus signal events.
    signal_tx: Option<tokio_mpsc::UnboundedSender<SignalEvent>>,
}

impl CallAudioService {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            pulse_thread: None,
            signal_tx: None,
        }
    }

    /// Set the signal sender for D-Bus signal events.
    pub fn set_signal_sender(&mut self, tx: tokio_mpsc::UnboundedSender<SignalEvent>) {
        self.signal_tx = Some(tx);
    }

    /// Start the PulseAudio thread.
    pub fn start_pulseaudio(&mut self) -> Result<(), ServiceError> {
        let signal_tx = match self.signal_tx.clone() {
            Some(tx) => tx,
            None => {
                warn!("No signal sender set, property changes will not be published");
                tokio_mpsc::unbounded_channel().0
            }
        };

        let thread = PulseThread::spawn(self.config.clone(), signal_tx)?;
        self.pulse_thread = Some(thread);

        info!("PulseAudio thread started");
        Ok(())
    }

    /// Hand a request to the router; the receiver yields its outcome.
    pub fn submit(&self, request: Request) -> Result<Outcome, ServiceError> {
        let thread = self.pulse_thread.as_ref().ok_or(ServiceError::NotRunning)?;
        let (tx, rx) = oneshot::channel();

        thread.send(RouterCommand::Submit {
            request,
            completion: Box::new(move |result| {
                // The caller may have gone away; nothing to do then.
                let _ = tx.send(result);
            }),
        })?;
        Ok(rx)
    }

    /// Stop the PulseAudio thread, failing anything still pending.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.pulse_thread.take() {
            thread.shutdown();
            info!("PulseAudio thread stopped");
        }
    }
}
