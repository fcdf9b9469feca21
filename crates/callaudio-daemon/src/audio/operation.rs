// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Step table for caller-visible operations.
//!
//! An [`Operation`] holds the step it is waiting in. Each server reply is fed
//! to [`Operation::advance`], which moves to the next step and returns the one
//! [`Action`] the router must perform: another server request, or completion.
//!
//! Mode switch on the alternate hardware variant runs the longest path:
//!
//! ```text
//! ProfileCheck -> ProfileSwitch -> ParkOutput -> ParkInput
//!     -> OutputQuery -> OutputSwitch -> InputQuery -> InputSwitch -> done
//! ```
//!
//! The HAL there only commits a profile change on the next routing change, so
//! both devices are parked on dummy ports before the real ports are applied.

use crate::audio::backend::OpId;
use crate::audio::registry::DeviceRegistry;
use crate::audio::types::{CardInfo, DeviceInfo};
use callaudio_ipc::{CallAudioError, CallMode, Direction};
use tracing::{debug, error, warn};

/// A caller request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    SelectMode(CallMode),
    EnableSpeaker(bool),
    MuteMic(bool),
}

/// Where an operation currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Idle,
    /// Waiting for card info to compare the active profile.
    ProfileCheck,
    /// Waiting for the profile change; remembers the profile it replaces.
    ProfileSwitch { previous: Option<String> },
    ParkOutput,
    ParkInput,
    /// Waiting for sink info. `then_input` continues with the source afterwards.
    OutputQuery { then_input: bool },
    OutputSwitch { then_input: bool },
    InputQuery,
    InputSwitch,
    MuteQuery,
    MuteSwitch,
    Finished,
}

/// A server reply routed to an operation.
#[derive(Debug, Clone, Copy)]
pub enum StepInput<'a> {
    Card(&'a CardInfo),
    Device(&'a DeviceInfo),
    Done(bool),
}

/// What the router must do next for an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    QueryCard(u32),
    SetProfile { card: u32, profile: String },
    QueryDevice { direction: Direction, index: u32 },
    SetPort { direction: Direction, index: u32, port: String },
    SetMute { index: u32, mute: bool },
    Complete(Result<(), CallAudioError>),
}

/// One caller-visible operation in flight.
#[derive(Debug)]
pub struct Operation {
    pub id: OpId,
    pub request: Request,
    step: Step,
    /// Output port the operation settled on, if it routed the sink.
    routed_output: Option<String>,
}

impl Operation {
    pub fn new(id: OpId, request: Request) -> Self {
        Self {
            id,
            request,
            step: Step::Idle,
            routed_output: None,
        }
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    pub fn routed_output(&self) -> Option<&str> {
        self.routed_output.as_deref()
    }

    /// First action of the operation.
    pub fn start(&mut self, registry: &DeviceRegistry) -> Action {
        debug_assert_eq!(self.step, Step::Idle);

        match self.request {
            Request::SelectMode(mode) => {
                let Some(card) = registry.card() else {
                    warn!("No usable card for mode {}", mode);
                    return self.finish(Err(CallAudioError::NoCard));
                };
                if card.has_voice_profile() {
                    debug!("Card has voice profile, using it");
                    self.step = Step::ProfileCheck;
                    Action::QueryCard(card.index)
                } else {
                    debug!("Card doesn't have voice profile, switching output port");
                    self.query_output(registry, false)
                }
            }
            Request::EnableSpeaker(_) => self.query_output(registry, false),
            Request::MuteMic(_) => match registry.device(Direction::Input) {
                Some(source) => {
                    self.step = Step::MuteQuery;
                    Action::QueryDevice {
                        direction: Direction::Input,
                        index: source.index,
                    }
                }
                None => {
                    warn!("Card has no usable source");
                    self.finish(Err(CallAudioError::NoSource))
                }
            },
        }
    }

    /// Feed a reply and get the next action.
    pub fn advance(&mut self, input: StepInput<'_>, registry: &mut DeviceRegistry) -> Action {
        let step = std::mem::replace(&mut self.step, Step::Finished);
        debug!("Operation {} ({:?}) advancing from {:?}", self.id, self.request, step);

        match (step, input) {
            (Step::ProfileCheck, StepInput::Card(info)) => self.check_profile(info, registry),
            (Step::ProfileSwitch { previous }, StepInput::Done(success)) => {
                if !success {
                    return self.finish(Err(CallAudioError::ServerRejected(
                        "card profile change".to_string(),
                    )));
                }
                if let Request::SelectMode(mode) = self.request {
                    registry.note_profile_switch(mode, previous);
                }
                self.park_output(registry)
            }
            (Step::ParkOutput, StepInput::Done(success)) => {
                if !success {
                    warn!("droid: output parking failed, continuing");
                }
                self.park_input(registry)
            }
            (Step::ParkInput, StepInput::Done(success)) => {
                if !success {
                    warn!("droid: input parking failed, continuing");
                }
                debug!("droid: parking succeeded, setting real output port");
                self.query_output(registry, true)
            }
            (Step::OutputQuery { then_input }, StepInput::Device(info))
                if info.direction == Direction::Output =>
            {
                self.switch_output(info, then_input, registry)
            }
            (Step::OutputSwitch { then_input }, StepInput::Done(success)) => {
                if !success {
                    return self.finish(Err(CallAudioError::ServerRejected(
                        "output port switch".to_string(),
                    )));
                }
                if then_input {
                    debug!("droid: setting real input port");
                    self.query_input(registry)
                } else {
                    self.finish(Ok(()))
                }
            }
            (Step::InputQuery, StepInput::Device(info)) if info.direction == Direction::Input => {
                self.switch_input(info, registry)
            }
            (Step::InputSwitch, StepInput::Done(success)) => {
                if success {
                    self.finish(Ok(()))
                } else {
                    self.finish(Err(CallAudioError::ServerRejected(
                        "input port switch".to_string(),
                    )))
                }
            }
            (Step::MuteQuery, StepInput::Device(info)) if info.direction == Direction::Input => {
                self.switch_mute(info, registry)
            }
            (Step::MuteSwitch, StepInput::Done(success)) => {
                if success {
                    self.finish(Ok(()))
                } else {
                    self.finish(Err(CallAudioError::ServerRejected(
                        "microphone mute change".to_string(),
                    )))
                }
            }
            (step, input) => {
                error!(
                    "Operation {}: unexpected reply {:?} while in {:?}",
                    self.id, input, step
                );
                self.finish(Err(CallAudioError::Internal(format!(
                    "unexpected server reply in step {:?}",
                    step
                ))))
            }
        }
    }

    fn finish(&mut self, result: Result<(), CallAudioError>) -> Action {
        self.step = Step::Finished;
        Action::Complete(result)
    }

    fn mode(&self) -> Option<CallMode> {
        match self.request {
            Request::SelectMode(mode) => Some(mode),
            _ => None,
        }
    }

    fn query_output(&mut self, registry: &DeviceRegistry, then_input: bool) -> Action {
        match registry.device(Direction::Output) {
            Some(sink) => {
                self.step = Step::OutputQuery { then_input };
                Action::QueryDevice {
                    direction: Direction::Output,
                    index: sink.index,
                }
            }
            None => {
                warn!("Card has no usable sink");
                self.finish(Err(CallAudioError::NoSink))
            }
        }
    }

    fn query_input(&mut self, registry: &DeviceRegistry) -> Action {
        match registry.device(Direction::Input) {
            Some(source) => {
                self.step = Step::InputQuery;
                Action::QueryDevice {
                    direction: Direction::Input,
                    index: source.index,
                }
            }
            None => self.finish(Err(CallAudioError::NoSource)),
        }
    }

    fn check_profile(&mut self, info: &CardInfo, registry: &DeviceRegistry) -> Action {
        debug_assert!(self.mode().is_some(), "profile check outside of a mode switch");
        let Some(mode) = self.mode() else {
            return self.finish(Err(CallAudioError::Internal(
                "profile check outside of a mode switch".to_string(),
            )));
        };
        let card_index = match registry.card() {
            Some(card) if card.index == info.index => card.index,
            _ => return self.finish(Err(CallAudioError::NoCard)),
        };
        if mode == CallMode::Normal && !registry.is_call_profile(info.active_profile.as_deref()) {
            debug!(
                "Card not in call profile ({:?}), nothing to be done",
                info.active_profile
            );
            return self.finish(Ok(()));
        }
        let Some(target) = registry.target_profile(mode) else {
            return self.finish(Err(CallAudioError::Internal(format!(
                "no profile for {} mode",
                mode
            ))));
        };

        if info.active_profile.as_deref() == Some(target.as_str()) {
            debug!("Profile '{}' already active, nothing to be done", target);
            return self.finish(Ok(()));
        }

        debug!(
            "Switching card profile from {:?} to '{}'",
            info.active_profile, target
        );
        self.step = Step::ProfileSwitch {
            previous: info.active_profile.clone(),
        };
        Action::SetProfile {
            card: card_index,
            profile: target,
        }
    }

    fn park_output(&mut self, registry: &DeviceRegistry) -> Action {
        let parking = registry
            .device(Direction::Output)
            .and_then(|sink| sink.policy.parking_port().map(|port| (sink.index, port)));

        match parking {
            Some((index, port)) => {
                debug!("droid: parking output to trigger mode change");
                self.step = Step::ParkOutput;
                Action::SetPort {
                    direction: Direction::Output,
                    index,
                    port: port.to_string(),
                }
            }
            None => self.finish(Ok(())),
        }
    }

    fn park_input(&mut self, registry: &DeviceRegistry) -> Action {
        let Some(source) = registry.device(Direction::Input) else {
            warn!("droid: no usable source to park");
            return self.finish(Err(CallAudioError::NoSource));
        };

        match source.policy.parking_port() {
            Some(port) => {
                debug!("droid: parking input to trigger mode change");
                self.step = Step::ParkInput;
                Action::SetPort {
                    direction: Direction::Input,
                    index: source.index,
                    port: port.to_string(),
                }
            }
            None => self.query_output(registry, true),
        }
    }

    fn switch_output(
        &mut self,
        info: &DeviceInfo,
        then_input: bool,
        registry: &DeviceRegistry,
    ) -> Action {
        let card = registry.card().map(|card| card.index);
        let sink = match registry.device(Direction::Output) {
            Some(sink) if sink.index == info.index && info.card == card => sink,
            _ => return self.finish(Err(CallAudioError::NoSink)),
        };
        let speaker = registry.speaker_port();

        // Entering a call or leaving the speaker picks anything but the speaker,
        // so headphones win when plugged and the earpiece otherwise.
        let target = match self.request {
            Request::SelectMode(CallMode::Call) | Request::EnableSpeaker(false) => sink
                .policy
                .select(&info.ports, speaker)
                .map(|port| port.name.clone())
                .ok_or(CallAudioError::NoAvailablePort(Direction::Output)),
            Request::SelectMode(CallMode::Normal) => sink
                .policy
                .select(&info.ports, None)
                .map(|port| port.name.clone())
                .ok_or(CallAudioError::NoAvailablePort(Direction::Output)),
            Request::EnableSpeaker(true) => speaker
                .map(str::to_string)
                .ok_or(CallAudioError::NoSpeakerPort),
            Request::MuteMic(_) => {
                debug_assert!(false, "output switch for a mic request");
                Err(CallAudioError::Internal("output switch for a mic request".to_string()))
            }
        };
        let target = match target {
            Ok(target) => target,
            Err(e) => return self.finish(Err(e)),
        };

        debug!(
            "Active port is {:?}, target port is '{}'",
            info.active_port(),
            target
        );

        self.routed_output = Some(target.clone());

        if info.active_port() == Some(target.as_str()) {
            debug!("Output already on '{}', nothing to be done", target);
            return if then_input {
                self.query_input(registry)
            } else {
                self.finish(Ok(()))
            };
        }

        debug!("Switching to target port '{}'", target);
        self.step = Step::OutputSwitch { then_input };
        Action::SetPort {
            direction: Direction::Output,
            index: sink.index,
            port: target,
        }
    }

    fn switch_input(&mut self, info: &DeviceInfo, registry: &DeviceRegistry) -> Action {
        let card = registry.card().map(|card| card.index);
        let source = match registry.device(Direction::Input) {
            Some(source) if source.index == info.index && info.card == card => source,
            _ => return self.finish(Err(CallAudioError::NoSource)),
        };
        let Some(target) = source.policy.select(&info.ports, None) else {
            return self.finish(Err(CallAudioError::NoAvailablePort(Direction::Input)));
        };

        debug!(
            "Active source port is {:?}, target source port is '{}'",
            info.active_port(),
            target.name
        );

        if info.active_port() == Some(target.name.as_str()) {
            return self.finish(Ok(()));
        }

        self.step = Step::InputSwitch;
        Action::SetPort {
            direction: Direction::Input,
            index: source.index,
            port: target.name.clone(),
        }
    }

    fn switch_mute(&mut self, info: &DeviceInfo, registry: &DeviceRegistry) -> Action {
        let card = registry.card().map(|card| card.index);
        let index = match registry.device(Direction::Input) {
            Some(source) if source.index == info.index && info.card == card => source.index,
            _ => return self.finish(Err(CallAudioError::NoSource)),
        };
        let Request::MuteMic(mute) = self.request else {
            debug_assert!(false, "mute switch for a non-mic request");
            return self.finish(Err(CallAudioError::Internal(
                "mute switch for a non-mic request".to_string(),
            )));
        };

        if info.mute == mute {
            debug!("Mic already {}, nothing to be done", if mute { "muted" } else { "live" });
            return self.finish(Ok(()));
        }

        debug!("Mic is {}, {}...", if info.mute { "muted" } else { "active" }, if mute { "muting" } else { "unmuting" });
        self.step = Step::MuteSwitch;
        Action::SetMute { index, mute }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::registry::IdentifyRules;
    use crate::audio::types::{props, PortAvailability, PortInfo};
    use crate::config::DaemonConfig;

    fn registry(droid: bool) -> DeviceRegistry {
        let mut reg = DeviceRegistry::new(IdentifyRules::new(&DaemonConfig::default()).unwrap());
        let profiles = if droid {
            vec!["default".to_string(), "voicecall".to_string()]
        } else {
            vec!["HiFi".to_string(), "HandsetVoicecall".to_string()]
        };
        reg.identify_card(&CardInfo {
            index: 0,
            name: "card".to_string(),
            active_profile: Some(profiles[0].clone()),
            profiles,
            ..Default::default()
        });
        reg.identify_device(&sink(droid));
        reg.identify_device(&source(droid));
        reg
    }

    fn sink(droid: bool) -> DeviceInfo {
        let mut info = DeviceInfo::new(1, Direction::Output);
        info.card = Some(0);
        if droid {
            info.properties
                .insert(props::DEVICE_API.to_string(), "droid-hal".to_string());
            info.ports = vec![
                PortInfo::new("output-parking", 0, PortAvailability::Unknown),
                PortInfo::new("output-speaker", 0, PortAvailability::Unknown),
                PortInfo::new("output-earpiece", 0, PortAvailability::Unknown),
            ];
            info.active_port = Some("output-speaker".to_string());
        } else {
            info.ports = vec![
                PortInfo::new("[Out] Earpiece", 100, PortAvailability::Unknown),
                PortInfo::new("[Out] Speaker", 200, PortAvailability::Unknown),
            ];
            info.active_port = Some("[Out] Speaker".to_string());
        }
        info
    }

    fn source(droid: bool) -> DeviceInfo {
        let mut info = DeviceInfo::new(2, Direction::Input);
        info.card = Some(0);
        if droid {
            info.properties
                .insert(props::DEVICE_API.to_string(), "droid-hal".to_string());
            info.ports = vec![
                PortInfo::new("input-parking", 0, PortAvailability::Unknown),
                PortInfo::new("input-builtin_mic", 0, PortAvailability::Unknown),
            ];
            info.active_port = Some("input-builtin_mic".to_string());
        } else {
            info.ports = vec![PortInfo::new("[In] Mic", 100, PortAvailability::Unknown)];
            info.active_port = Some("[In] Mic".to_string());
        }
        info
    }

    fn card_with_active(reg: &DeviceRegistry, active: &str) -> CardInfo {
        let card = reg.card().unwrap();
        CardInfo {
            index: card.index,
            name: card.name.clone(),
            active_profile: Some(active.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_droid_mode_switch_table() {
        let mut reg = registry(true);
        let mut op = Operation::new(7, Request::SelectMode(CallMode::Call));

        assert_eq!(op.start(&reg), Action::QueryCard(0));
        let card = card_with_active(&reg, "default");
        assert_eq!(
            op.advance(StepInput::Card(&card), &mut reg),
            Action::SetProfile { card: 0, profile: "voicecall".to_string() }
        );
        assert_eq!(
            op.advance(StepInput::Done(true), &mut reg),
            Action::SetPort {
                direction: Direction::Output,
                index: 1,
                port: "output-parking".to_string()
            }
        );
        assert_eq!(
            op.advance(StepInput::Done(true), &mut reg),
            Action::SetPort {
                direction: Direction::Input,
                index: 2,
                port: "input-parking".to_string()
            }
        );
        assert_eq!(
            op.advance(StepInput::Done(true), &mut reg),
            Action::QueryDevice { direction: Direction::Output, index: 1 }
        );

        let mut parked_sink = sink(true);
        parked_sink.active_port = Some("output-parking".to_string());
        assert_eq!(
            op.advance(StepInput::Device(&parked_sink), &mut reg),
            Action::SetPort {
                direction: Direction::Output,
                index: 1,
                port: "output-earpiece".to_string()
            }
        );
        assert_eq!(
            op.advance(StepInput::Done(true), &mut reg),
            Action::QueryDevice { direction: Direction::Input, index: 2 }
        );

        let mut parked_source = source(true);
        parked_source.active_port = Some("input-parking".to_string());
        assert_eq!(
            op.advance(StepInput::Device(&parked_source), &mut reg),
            Action::SetPort {
                direction: Direction::Input,
                index: 2,
                port: "input-builtin_mic".to_string()
            }
        );
        assert_eq!(op.advance(StepInput::Done(true), &mut reg), Action::Complete(Ok(())));
        assert_eq!(op.step(), &Step::Finished);
    }

    #[test]
    fn test_standard_profile_switch_is_terminal() {
        let mut reg = registry(false);
        let mut op = Operation::new(1, Request::SelectMode(CallMode::Call));
        op.start(&reg);
        let card = card_with_active(&reg, "HiFi");
        assert_eq!(
            op.advance(StepInput::Card(&card), &mut reg),
            Action::SetProfile { card: 0, profile: "HandsetVoicecall".to_string() }
        );
        assert_eq!(op.advance(StepInput::Done(true), &mut reg), Action::Complete(Ok(())));
        assert_eq!(reg.card().unwrap().profile_before_call.as_deref(), Some("HiFi"));
    }

    #[test]
    fn test_profile_already_active() {
        let mut reg = registry(false);
        let mut op = Operation::new(1, Request::SelectMode(CallMode::Normal));
        op.start(&reg);
        let card = card_with_active(&reg, "HiFi");
        assert_eq!(op.advance(StepInput::Card(&card), &mut reg), Action::Complete(Ok(())));
    }

    #[test]
    fn test_normal_mode_leaves_non_call_profile_alone() {
        let mut reg = registry(false);
        let mut op = Operation::new(1, Request::SelectMode(CallMode::Normal));
        op.start(&reg);
        let card = card_with_active(&reg, "Music");
        assert_eq!(op.advance(StepInput::Card(&card), &mut reg), Action::Complete(Ok(())));
    }

    #[test]
    fn test_normal_mode_leaves_call_profile() {
        let mut reg = registry(true);
        let mut op = Operation::new(1, Request::SelectMode(CallMode::Normal));
        op.start(&reg);
        let card = card_with_active(&reg, "voicecall");
        assert_eq!(
            op.advance(StepInput::Card(&card), &mut reg),
            Action::SetProfile { card: 0, profile: "default".to_string() }
        );
    }

    #[test]
    fn test_port_only_mode_switch_reports_routed_port() {
        let mut reg = DeviceRegistry::new(IdentifyRules::new(&DaemonConfig::default()).unwrap());
        reg.identify_card(&CardInfo {
            index: 0,
            name: "card".to_string(),
            profiles: vec!["HiFi".to_string()],
            active_profile: Some("HiFi".to_string()),
            ..Default::default()
        });
        reg.identify_device(&sink(false));

        let mut op = Operation::new(1, Request::SelectMode(CallMode::Normal));
        assert_eq!(
            op.start(&reg),
            Action::QueryDevice { direction: Direction::Output, index: 1 }
        );
        assert_eq!(
            op.advance(StepInput::Device(&sink(false)), &mut reg),
            Action::Complete(Ok(()))
        );
        assert_eq!(op.routed_output(), Some("[Out] Speaker"));
    }

    #[test]
    fn test_profile_rejected() {
        let mut reg = registry(false);
        let mut op = Operation::new(1, Request::SelectMode(CallMode::Call));
        op.start(&reg);
        let card = card_with_active(&reg, "HiFi");
        op.advance(StepInput::Card(&card), &mut reg);
        assert!(matches!(
            op.advance(StepInput::Done(false), &mut reg),
            Action::Complete(Err(CallAudioError::ServerRejected(_)))
        ));
        assert_eq!(reg.card().unwrap().profile_before_call, None);
    }

    #[test]
    fn test_speaker_disable_picks_non_speaker() {
        let mut reg = registry(false);
        let mut op = Operation::new(1, Request::EnableSpeaker(false));
        assert_eq!(
            op.start(&reg),
            Action::QueryDevice { direction: Direction::Output, index: 1 }
        );
        assert_eq!(
            op.advance(StepInput::Device(&sink(false)), &mut reg),
            Action::SetPort {
                direction: Direction::Output,
                index: 1,
                port: "[Out] Earpiece".to_string()
            }
        );
    }

    #[test]
    fn test_speaker_enable_already_active() {
        let mut reg = registry(false);
        let mut op = Operation::new(1, Request::EnableSpeaker(true));
        op.start(&reg);
        assert_eq!(
            op.advance(StepInput::Device(&sink(false)), &mut reg),
            Action::Complete(Ok(()))
        );
    }

    #[test]
    fn test_mute_switch() {
        let mut reg = registry(false);
        let mut op = Operation::new(1, Request::MuteMic(true));
        assert_eq!(
            op.start(&reg),
            Action::QueryDevice { direction: Direction::Input, index: 2 }
        );
        assert_eq!(
            op.advance(StepInput::Device(&source(false)), &mut reg),
            Action::SetMute { index: 2, mute: true }
        );

        let mut op = Operation::new(2, Request::MuteMic(false));
        op.start(&reg);
        assert_eq!(
            op.advance(StepInput::Device(&source(false)), &mut reg),
            Action::Complete(Ok(()))
        );
    }

    #[test]
    fn test_unexpected_reply_fails() {
        let mut reg = registry(false);
        let mut op = Operation::new(1, Request::MuteMic(true));
        op.start(&reg);
        assert!(matches!(
            op.advance(StepInput::Done(true), &mut reg),
            Action::Complete(Err(CallAudioError::Internal(_)))
        ));
    }

    #[test]
    fn test_missing_devices_fail_immediately() {
        let reg = DeviceRegistry::new(IdentifyRules::new(&DaemonConfig::default()).unwrap());
        assert_eq!(
            Operation::new(1, Request::SelectMode(CallMode::Call)).start(&reg),
            Action::Complete(Err(CallAudioError::NoCard))
        );
        assert_eq!(
            Operation::new(2, Request::EnableSpeaker(true)).start(&reg),
            Action::Complete(Err(CallAudioError::NoSink))
        );
        assert_eq!(
            Operation::new(3, Request::MuteMic(true)).start(&reg),
            Action::Complete(Err(CallAudioError::NoSource))
        );
    }
}
