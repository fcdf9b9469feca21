// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Device registry: which card, sink and source carry call audio.
//!
//! The server usually exposes several cards (modem, USB, Bluetooth, HDMI) next
//! to the phone's internal codec. The registry keeps exactly one of each kind,
//! chosen by property filters, and holds the per-device state the router needs
//! (port cache, port policy, speaker port, voice profile).

use crate::audio::port_cache::PortCache;
use crate::audio::port_policy::PortPolicy;
use crate::audio::types::{device_noun, props, CardInfo, DeviceInfo, PortInfo};
use crate::config::{ConfigError, DaemonConfig, IdentificationConfig, ProfilesConfig, VariantPortsConfig};
use callaudio_ipc::{CallMode, Direction};
use regex::Regex;
use tracing::{debug, info};

/// Compiled identification rules.
#[derive(Debug, Clone)]
pub struct IdentifyRules {
    identification: IdentificationConfig,
    profiles: ProfilesConfig,
    variant_ports: VariantPortsConfig,
    voice_call: Regex,
    speaker: Regex,
}

impl IdentifyRules {
    pub fn new(config: &DaemonConfig) -> Result<Self, ConfigError> {
        let voice_call = Regex::new(&config.profiles.voice_call_pattern).map_err(|source| {
            ConfigError::Pattern {
                field: "profiles.voice_call_pattern",
                source,
            }
        })?;
        let speaker = Regex::new(&config.ports.speaker_pattern).map_err(|source| {
            ConfigError::Pattern {
                field: "ports.speaker_pattern",
                source,
            }
        })?;

        Ok(Self {
            identification: config.identification.clone(),
            profiles: config.profiles.clone(),
            variant_ports: config.variant_ports.clone(),
            voice_call,
            speaker,
        })
    }

    /// Whether a card is a candidate for the internal audio card.
    pub fn accepts_card(&self, info: &CardInfo) -> bool {
        let rules = &self.identification;

        if info.property(props::DEVICE_CLASS) == Some(rules.card_modem_class.as_str()) {
            return false;
        }
        if let Some(bus_path) = info.property(props::DEVICE_BUS_PATH) {
            if !bus_path.starts_with(&rules.card_bus_path_prefix) {
                return false;
            }
        }
        if let Some(form_factor) = info.property(props::DEVICE_FORM_FACTOR) {
            if form_factor != rules.card_form_factor {
                return false;
            }
        }
        true
    }

    /// Whether the object belongs to the alternate hardware variant.
    pub fn is_variant(&self, api: Option<&str>) -> bool {
        api == Some(self.identification.variant_api.as_str())
    }

    /// First profile implementing call audio routing, if any.
    pub fn find_voice_profile<'a>(&self, profiles: &'a [String]) -> Option<&'a str> {
        profiles
            .iter()
            .find(|name| {
                self.voice_call.is_match(name) || **name == self.profiles.variant_voice_call
            })
            .map(String::as_str)
    }

    pub fn is_speaker_port(&self, name: &str, variant: bool) -> bool {
        if variant {
            name == self.variant_ports.output_speaker
        } else {
            self.speaker.is_match(name)
        }
    }
}

/// The tracked card.
#[derive(Debug, Clone)]
pub struct TrackedCard {
    pub index: u32,
    pub name: String,
    /// Card itself is driven by the alternate hardware variant.
    pub variant: bool,
    /// Voice call profile found on the card.
    pub voice_profile: Option<String>,
    /// Profile that was active before the last switch into call mode.
    pub profile_before_call: Option<String>,
}

impl TrackedCard {
    pub fn has_voice_profile(&self) -> bool {
        self.voice_profile.is_some()
    }
}

/// The tracked sink or source.
#[derive(Debug, Clone)]
pub struct TrackedDevice {
    pub index: u32,
    pub name: String,
    pub direction: Direction,
    /// Index of the card the device belongs to.
    pub card: u32,
    /// Alternate hardware variant; fixed for the lifetime of this identity.
    pub variant: bool,
    pub policy: PortPolicy,
    pub ports: PortCache,
}

/// Current device identities and their cached state.
#[derive(Debug)]
pub struct DeviceRegistry {
    rules: IdentifyRules,
    card: Option<TrackedCard>,
    sink: Option<TrackedDevice>,
    source: Option<TrackedDevice>,
    /// Speaker port of the sink; survives sink removal until re-identification,
    /// but not the loss of the card or of the session.
    speaker_port: Option<String>,
}

impl DeviceRegistry {
    pub fn new(rules: IdentifyRules) -> Self {
        Self {
            rules,
            card: None,
            sink: None,
            source: None,
            speaker_port: None,
        }
    }

    pub fn card(&self) -> Option<&TrackedCard> {
        self.card.as_ref()
    }

    pub fn device(&self, direction: Direction) -> Option<&TrackedDevice> {
        match direction {
            Direction::Output => self.sink.as_ref(),
            Direction::Input => self.source.as_ref(),
        }
    }

    fn device_slot(&mut self, direction: Direction) -> &mut Option<TrackedDevice> {
        match direction {
            Direction::Output => &mut self.sink,
            Direction::Input => &mut self.source,
        }
    }

    pub fn speaker_port(&self) -> Option<&str> {
        self.speaker_port.as_deref()
    }

    /// Whether the tracked sink is the alternate hardware variant.
    pub fn sink_is_variant(&self) -> bool {
        self.sink.as_ref().is_some_and(|sink| sink.variant)
    }

    /// Consider a card; returns true when it became the tracked card.
    pub fn identify_card(&mut self, info: &CardInfo) -> bool {
        if self.card.is_some() || !self.rules.accepts_card(info) {
            return false;
        }

        let voice_profile = self
            .rules
            .find_voice_profile(&info.profiles)
            .map(str::to_string);
        let card = TrackedCard {
            index: info.index,
            name: info.name.clone(),
            variant: self.rules.is_variant(info.property(props::DEVICE_API)),
            voice_profile,
            profile_before_call: None,
        };

        info!("CARD: idx={} name='{}'", card.index, card.name);
        debug!(
            "CARD:   {} voice profile{}",
            if card.has_voice_profile() { "has" } else { "doesn't have" },
            card.voice_profile
                .as_deref()
                .map(|p| format!(" '{}'", p))
                .unwrap_or_default()
        );

        self.card = Some(card);
        true
    }

    /// Consider a sink or source; returns true when it became the tracked one.
    ///
    /// Only devices of the sound class belonging to the tracked card are
    /// eligible, and an already tracked device is never replaced.
    pub fn identify_device(&mut self, info: &DeviceInfo) -> bool {
        if let Some(class) = info.property(props::DEVICE_CLASS) {
            if class != self.rules.identification.device_class {
                return false;
            }
        }
        let Some(card) = self.card.as_ref() else {
            return false;
        };
        if info.card != Some(card.index) || self.device(info.direction).is_some() {
            return false;
        }

        let variant = self.rules.is_variant(info.property(props::DEVICE_API));
        let device = TrackedDevice {
            index: info.index,
            name: info.name.clone(),
            direction: info.direction,
            card: card.index,
            variant,
            policy: PortPolicy::for_device(variant, info.direction, &self.rules.variant_ports),
            ports: PortCache::from_ports(&info.ports),
        };

        info!(
            "{}: idx={} name='{}'{}",
            device_noun(info.direction).to_uppercase(),
            info.index,
            info.name,
            if variant { " (droid)" } else { "" }
        );

        if info.direction == Direction::Output {
            self.update_speaker_port(&info.ports, variant);
        }

        *self.device_slot(info.direction) = Some(device);
        true
    }

    fn update_speaker_port(&mut self, ports: &[PortInfo], variant: bool) {
        let found = ports
            .iter()
            .filter(|port| self.rules.is_speaker_port(&port.name, variant))
            .last();

        if let Some(port) = found {
            if self.speaker_port.as_deref() != Some(port.name.as_str()) {
                self.speaker_port = Some(port.name.clone());
            }
        }
        debug!("SINK:   speaker_port={:?}", self.speaker_port);
    }

    /// Forget the tracked sink or source if `index` matches it.
    pub fn remove_device(&mut self, direction: Direction, index: u32) -> bool {
        let slot = self.device_slot(direction);
        if slot.as_ref().is_some_and(|device| device.index == index) {
            if let Some(device) = slot.take() {
                info!("{} {} '{}' removed", device_noun(device.direction), index, device.name);
            }
            true
        } else {
            false
        }
    }

    /// Forget the tracked card if `index` matches it.
    pub fn remove_card(&mut self, index: u32) -> bool {
        if self.card.as_ref().is_some_and(|card| card.index == index) {
            self.card = None;
            info!("card {} removed", index);
            // Devices are only eligible while their card is tracked.
            for direction in [Direction::Output, Direction::Input] {
                let slot = self.device_slot(direction);
                if slot.as_ref().is_some_and(|device| device.card == index) {
                    if let Some(device) = slot.take() {
                        info!("{} '{}' dropped with its card", device_noun(direction), device.name);
                    }
                }
            }
            if self.sink.is_none() {
                self.speaker_port = None;
            }
            true
        } else {
            false
        }
    }

    /// Feed fresh port states of the tracked device; true if any known state changed.
    ///
    /// Replies for anything but the tracked device report no change.
    pub fn observe_ports(&mut self, info: &DeviceInfo) -> bool {
        match self.device_slot(info.direction) {
            Some(device) if device.index == info.index => device.ports.observe(&info.ports),
            _ => false,
        }
    }

    /// Profile the card should use in `mode`, on the hardware currently tracked.
    pub fn target_profile(&self, mode: CallMode) -> Option<String> {
        let card = self.card.as_ref()?;
        let profiles = &self.rules.profiles;

        if self.sink_is_variant() {
            return Some(match mode {
                CallMode::Normal => profiles.variant_hifi.clone(),
                CallMode::Call => profiles.variant_voice_call.clone(),
            });
        }

        match mode {
            CallMode::Normal => Some(
                card.profile_before_call
                    .clone()
                    .unwrap_or_else(|| profiles.hifi.clone()),
            ),
            CallMode::Call => card.voice_profile.clone(),
        }
    }

    /// Whether `profile` is the call profile of the tracked hardware.
    ///
    /// Leaving call mode only touches the card when it is in this profile.
    pub fn is_call_profile(&self, profile: Option<&str>) -> bool {
        let (Some(card), Some(profile)) = (self.card.as_ref(), profile) else {
            return false;
        };
        if self.sink_is_variant() {
            return profile == self.rules.profiles.variant_voice_call;
        }
        card.voice_profile.as_deref() == Some(profile)
    }

    /// Remember the outcome of a successful profile switch for the next restore.
    pub fn note_profile_switch(&mut self, mode: CallMode, previous: Option<String>) {
        if let Some(card) = self.card.as_mut() {
            match mode {
                CallMode::Call => card.profile_before_call = previous,
                CallMode::Normal => card.profile_before_call = None,
            }
        }
    }

    /// Drop every identity; used when the server session is lost.
    pub fn clear(&mut self) {
        self.card = None;
        self.sink = None;
        self.source = None;
        self.speaker_port = None;
    }
}
