// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Call audio router.
//!
//! The router owns the device registry and drives caller operations against an
//! [`AudioBackend`]. It runs on the audio server thread and is fed
//! [`ServerEvent`]s one at a time, so no locking is needed.
//!
//! Caller requests are serialized: one operation is in flight at a time and
//! later ones wait in FIFO order. Every request's completion is invoked exactly
//! once, whatever happens to the server connection.

use crate::audio::backend::{AudioBackend, ListReply, OpId, ServerEvent, Tag};
use crate::audio::operation::{Action, Operation, Request, StepInput};
use crate::audio::registry::{DeviceRegistry, IdentifyRules};
use crate::audio::types::{device_noun, ChangeKind, DeviceInfo, Facility, ModuleInfo};
use crate::config::{ConfigError, DaemonConfig};
use crate::service::SignalEvent;
use callaudio_ipc::{CallAudioError, CallMode, Direction, MicState, SpeakerState, SwitchState};
use std::collections::VecDeque;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, info, warn};

/// Invoked once with the outcome of a request.
pub type Completion = Box<dyn FnOnce(Result<(), CallAudioError>) + Send>;

/// Caller-visible routing state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallAudioState {
    pub mode: CallMode,
    pub speaker: SpeakerState,
    pub mic: MicState,
}

struct ActiveOp {
    op: Operation,
    completion: Completion,
}

struct PendingOp {
    id: OpId,
    request: Request,
    completion: Completion,
}

pub struct Router<B: AudioBackend> {
    backend: B,
    registry: DeviceRegistry,
    state: CallAudioState,
    connected: bool,
    active: Option<ActiveOp>,
    queue: VecDeque<PendingOp>,
    next_id: OpId,
    signal_tx: Option<tokio_mpsc::UnboundedSender<SignalEvent>>,
    unload_port_switcher: bool,
    port_switcher_module: String,
}

impl<B: AudioBackend> Router<B> {
    pub fn new(backend: B, config: &DaemonConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            backend,
            registry: DeviceRegistry::new(IdentifyRules::new(config)?),
            state: CallAudioState::default(),
            connected: false,
            active: None,
            queue: VecDeque::new(),
            next_id: 1,
            signal_tx: None,
            unload_port_switcher: config.ports.unload_port_switcher,
            port_switcher_module: config.ports.port_switcher_module.clone(),
        })
    }

    /// Set the sender for D-Bus signal events.
    pub fn set_signal_sender(&mut self, tx: tokio_mpsc::UnboundedSender<SignalEvent>) {
        self.signal_tx = Some(tx);
    }

    fn emit_signal(&self, event: SignalEvent) {
        if let Some(ref tx) = self.signal_tx {
            if let Err(e) = tx.send(event) {
                warn!("Failed to send signal event: {}", e);
            }
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    #[cfg(test)]
    fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    #[cfg(test)]
    fn state(&self) -> CallAudioState {
        self.state
    }

    /// Number of requests in flight or waiting.
    #[cfg(test)]
    fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.active.is_some())
    }

    // ==================== Session ====================

    /// The server session became ready: rebuild the registry from scratch.
    pub fn on_ready(&mut self) {
        info!("Audio server ready, initializing cards list");
        self.connected = true;
        self.registry.clear();

        self.backend.subscribe();
        self.backend.list_cards(Tag::Init);
        self.backend.list_modules(Tag::Init);
        self.backend.list_devices(Direction::Output, Tag::Init);
        self.backend.list_devices(Direction::Input, Tag::Init);
    }

    /// The server session is gone; every waiting request fails.
    pub fn on_connection_lost(&mut self) {
        if self.connected {
            warn!("Audio server connection lost");
        }
        self.connected = false;
        self.registry.clear();
        self.fail_all(CallAudioError::ConnectionLost);
    }

    /// Fail everything still waiting; used on exit.
    pub fn shutdown(&mut self) {
        self.connected = false;
        self.fail_all(CallAudioError::NotConnected);
    }

    fn fail_all(&mut self, error: CallAudioError) {
        if let Some(active) = self.active.take() {
            debug!("Failing operation {}: {}", active.op.id, error);
            (active.completion)(Err(error.clone()));
        }
        for pending in self.queue.drain(..) {
            debug!("Failing queued operation {}: {}", pending.id, error);
            (pending.completion)(Err(error.clone()));
        }
    }

    // ==================== Requests ====================

    /// Queue a caller request. `completion` runs once with the outcome.
    pub fn submit(&mut self, request: Request, completion: Completion) -> OpId {
        let id = self.next_id;
        self.next_id += 1;

        if !self.connected {
            warn!("Request {:?} while not connected to the audio server", request);
            completion(Err(CallAudioError::NotConnected));
            return id;
        }

        debug!("Queueing operation {}: {:?}", id, request);
        self.queue.push_back(PendingOp {
            id,
            request,
            completion,
        });

        if self.active.is_none() {
            if let Some(action) = self.start_next() {
                self.drive(action);
            }
        }
        id
    }

    fn start_next(&mut self) -> Option<Action> {
        let pending = self.queue.pop_front()?;

        if pending.request == Request::SelectMode(CallMode::Normal) {
            self.unmute_after_call();
        }

        let mut op = Operation::new(pending.id, pending.request);
        let action = op.start(&self.registry);
        self.active = Some(ActiveOp {
            op,
            completion: pending.completion,
        });
        Some(action)
    }

    /// Perform actions of the active operation until one waits on the server.
    fn drive(&mut self, mut action: Action) {
        loop {
            let Some(active) = self.active.as_ref() else {
                return;
            };
            let tag = Tag::Operation(active.op.id);

            match action {
                Action::QueryCard(index) => self.backend.card_info(index, tag),
                Action::SetProfile { card, profile } => {
                    self.backend.set_card_profile(card, &profile, tag)
                }
                Action::QueryDevice { direction, index } => {
                    self.backend.device_info(direction, index, tag)
                }
                Action::SetPort {
                    direction,
                    index,
                    port,
                } => self.backend.set_port(direction, index, &port, tag),
                Action::SetMute { index, mute } => self.backend.set_source_mute(index, mute, tag),
                Action::Complete(result) => {
                    self.finish_active(result);
                    match self.start_next() {
                        Some(next) => {
                            action = next;
                            continue;
                        }
                        None => return,
                    }
                }
            }
            return;
        }
    }

    fn finish_active(&mut self, result: Result<(), CallAudioError>) {
        let Some(active) = self.active.take() else {
            return;
        };

        match &result {
            Ok(()) => {
                info!("Operation {} ({:?}) succeeded", active.op.id, active.op.request);
                self.apply_success(&active.op);
            }
            Err(e) => warn!("Operation {} ({:?}) failed: {}", active.op.id, active.op.request, e),
        }
        (active.completion)(result);
    }

    fn apply_success(&mut self, op: &Operation) {
        let previous = self.state;
        match op.request {
            Request::SelectMode(mode) => {
                self.state.mode = mode;
                // Without port routing the server picks the port; assume not the speaker.
                self.state.speaker = match op.routed_output() {
                    Some(port) => SwitchState::from(self.registry.speaker_port() == Some(port)),
                    None => SwitchState::Off,
                };
                if mode == CallMode::Normal {
                    self.state.mic = SwitchState::On;
                }
            }
            Request::EnableSpeaker(enable) => self.state.speaker = SwitchState::from(enable),
            Request::MuteMic(mute) => self.state.mic = SwitchState::from(!mute),
        }

        if self.state.mode != previous.mode {
            self.emit_signal(SignalEvent::ModeChanged(self.state.mode));
        }
        if self.state.speaker != previous.speaker {
            self.emit_signal(SignalEvent::SpeakerChanged(self.state.speaker));
        }
        if self.state.mic != previous.mic {
            self.emit_signal(SignalEvent::MicChanged(self.state.mic));
        }
    }

    /// Make sure the mic doesn't stay muted once a call ends.
    fn unmute_after_call(&mut self) {
        if let Some(source) = self.registry.device(Direction::Input) {
            self.backend
                .device_info(Direction::Input, source.index, Tag::Unmute);
        }
    }

    fn advance_operation(&mut self, id: OpId, input: StepInput<'_>) {
        let action = match self.active.as_mut() {
            Some(active) if active.op.id == id => active.op.advance(input, &mut self.registry),
            _ => {
                debug!("Dropping reply for finished operation {}", id);
                return;
            }
        };
        self.drive(action);
    }

    fn fail_operation(&mut self, id: OpId, error: CallAudioError) {
        if self.active.as_ref().is_some_and(|active| active.op.id == id) {
            self.drive(Action::Complete(Err(error)));
        }
    }

    // ==================== Server events ====================

    pub fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Subscription {
                facility,
                kind,
                index,
            } => self.reconcile(facility, kind, index),
            ServerEvent::Card { tag, reply } => match (tag, reply) {
                (Tag::Operation(id), ListReply::Item(info)) => {
                    self.advance_operation(id, StepInput::Card(&info))
                }
                (Tag::Operation(id), ListReply::Error) => self.fail_operation(
                    id,
                    CallAudioError::MalformedReply("card".to_string()),
                ),
                (Tag::Init | Tag::Hotplug, ListReply::Item(info)) => {
                    if self.registry.identify_card(&info) && tag == Tag::Hotplug {
                        // Devices of a late card were skipped when they appeared.
                        self.backend.list_devices(Direction::Output, Tag::Hotplug);
                        self.backend.list_devices(Direction::Input, Tag::Hotplug);
                    }
                }
                (_, ListReply::Error) => warn!("Server returned no card info ({:?})", tag),
                _ => {}
            },
            ServerEvent::Device {
                tag,
                direction,
                reply,
            } => match reply {
                ListReply::Item(info) => self.device_reply(tag, &info),
                ListReply::Error => match tag {
                    Tag::Operation(id) => self.fail_operation(
                        id,
                        CallAudioError::MalformedReply(device_noun(direction).to_string()),
                    ),
                    _ => warn!("Server returned no {} info ({:?})", device_noun(direction), tag),
                },
                ListReply::End => {}
            },
            ServerEvent::Module { tag, reply } => match reply {
                ListReply::Item(info) => self.module_reply(&info),
                ListReply::Error => warn!("Server returned no module info ({:?})", tag),
                ListReply::End => {}
            },
            ServerEvent::Done { tag, success } => match tag {
                Tag::Operation(id) => self.advance_operation(id, StepInput::Done(success)),
                _ if !success => warn!("Background request failed ({:?})", tag),
                _ => {}
            },
        }
    }

    fn reconcile(&mut self, facility: Facility, kind: ChangeKind, index: u32) {
        match (facility.direction(), kind) {
            (Some(direction), ChangeKind::Removed) => {
                self.registry.remove_device(direction, index);
            }
            (Some(direction), ChangeKind::New) => {
                debug!("new {} {}", device_noun(direction), index);
                self.backend.device_info(direction, index, Tag::Hotplug);
            }
            (Some(_), ChangeKind::Changed) => {}
            (None, ChangeKind::Changed) => {
                if self.registry.card().is_some_and(|card| card.index == index) {
                    debug!("card {} changed", index);
                    self.refresh_ports();
                }
            }
            (None, ChangeKind::New) => {
                if self.registry.card().is_none() {
                    debug!("new card {}", index);
                    self.backend.card_info(index, Tag::Hotplug);
                }
            }
            (None, ChangeKind::Removed) => {
                self.registry.remove_card(index);
            }
        }
    }

    /// Re-read ports of tracked devices that follow jack events.
    fn refresh_ports(&mut self) {
        for direction in [Direction::Output, Direction::Input] {
            if let Some(device) = self.registry.device(direction) {
                if device.policy.follows_jack_events() {
                    let index = device.index;
                    self.backend.device_info(direction, index, Tag::Refresh);
                }
            }
        }
    }

    fn device_reply(&mut self, tag: Tag, info: &DeviceInfo) {
        match tag {
            Tag::Operation(id) => self.advance_operation(id, StepInput::Device(info)),
            Tag::Init | Tag::Hotplug => {
                if self.registry.identify_device(info) {
                    self.route_to_best_port(info);
                }
            }
            Tag::Refresh => {
                if self.registry.observe_ports(info) {
                    debug!("{} {}: port availability changed", device_noun(info.direction), info.index);
                    self.route_to_best_port(info);
                }
            }
            Tag::Unmute => {
                let tracked = self.registry.device(Direction::Input).map(|source| source.index);
                let card = self.registry.card().map(|card| card.index);
                if info.direction == Direction::Input
                    && tracked == Some(info.index)
                    && info.card == card
                    && info.mute
                {
                    debug!("mic is muted, unmuting...");
                    self.backend.set_source_mute(info.index, false, Tag::Detached);
                }
            }
            Tag::Detached => {}
        }
    }

    fn route_to_best_port(&mut self, info: &DeviceInfo) {
        let Some(device) = self.registry.device(info.direction) else {
            return;
        };
        if device.index != info.index {
            return;
        }
        let Some(target) = device.policy.select(&info.ports, None) else {
            return;
        };
        if info.active_port() == Some(target.name.as_str()) {
            return;
        }

        debug!("  Using {} port '{}'", device_noun(info.direction), target.name);
        let port = target.name.clone();
        self.backend
            .set_port(info.direction, info.index, &port, Tag::Detached);
    }

    fn module_reply(&mut self, info: &ModuleInfo) {
        debug!("MODULE: idx={} name='{}'", info.index, info.name);

        if !self.unload_port_switcher || info.name != self.port_switcher_module {
            return;
        }
        if self.registry.card().is_some_and(|card| card.variant) {
            debug!("MODULE: keeping '{}' on droid hardware", info.name);
            return;
        }

        debug!("MODULE: unloading '{}'", info.name);
        self.backend.unload_module(info.index, Tag::Detached);
    }
}

impl<B: AudioBackend> Drop for Router<B> {
    fn drop(&mut self) {
        self.fail_all(CallAudioError::NotConnected);
    }
}
