// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Port selection policies.
//!
//! A policy is picked once, when a sink or source is identified, from its
//! hardware variant. Standard hardware picks the highest priority port. The
//! alternate (droid) variant exposes fixed port names whose priorities are not
//! meaningful, so it picks by name instead and needs a parking port to force
//! the HAL to commit a profile change.

use crate::audio::types::{PortAvailability, PortInfo};
use crate::config::VariantPortsConfig;
use callaudio_ipc::Direction;
use tracing::{debug, warn};

/// Strategy used to choose the port a device should be routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortPolicy {
    /// Highest priority eligible port wins; ties keep the first one.
    Priority,
    /// Named ports on the alternate hardware variant.
    Named {
        /// Selected immediately whenever eligible (wired headset).
        preferred: String,
        /// Built-in ports; the last eligible one in port order wins.
        fallbacks: Vec<String>,
        /// Dummy port used to force a routing change.
        parking: String,
    },
}

impl PortPolicy {
    /// Policy for a device of the given direction and hardware variant.
    pub fn for_device(variant: bool, direction: Direction, names: &VariantPortsConfig) -> Self {
        if !variant {
            return PortPolicy::Priority;
        }

        match direction {
            Direction::Output => PortPolicy::Named {
                preferred: names.output_wired_headset.clone(),
                fallbacks: vec![names.output_speaker.clone(), names.output_earpiece.clone()],
                parking: names.output_parking.clone(),
            },
            Direction::Input => PortPolicy::Named {
                preferred: names.input_wired_headset.clone(),
                fallbacks: vec![names.input_builtin_mic.clone()],
                parking: names.input_parking.clone(),
            },
        }
    }

    /// Choose the best port, skipping `exclude` and ports known to be unplugged.
    pub fn select<'a>(&self, ports: &'a [PortInfo], exclude: Option<&str>) -> Option<&'a PortInfo> {
        debug!("Looking for available port excluding {:?}", exclude);

        let eligible = ports.iter().filter(|port| {
            exclude != Some(port.name.as_str()) && port.available != PortAvailability::Unavailable
        });

        let mut candidate: Option<&PortInfo> = None;
        match self {
            PortPolicy::Priority => {
                for port in eligible {
                    if candidate.map_or(true, |best| port.priority > best.priority) {
                        candidate = Some(port);
                    }
                }
            }
            PortPolicy::Named {
                preferred,
                fallbacks,
                ..
            } => {
                for port in eligible {
                    if port.name == *preferred {
                        candidate = Some(port);
                        break;
                    }
                    if fallbacks.iter().any(|name| *name == port.name) {
                        candidate = Some(port);
                    }
                }
            }
        }

        match candidate {
            Some(port) => debug!("Found available port '{}'", port.name),
            None => warn!("No available port found"),
        }
        candidate
    }

    /// Parking port, only defined for the alternate variant.
    pub fn parking_port(&self) -> Option<&str> {
        match self {
            PortPolicy::Priority => None,
            PortPolicy::Named { parking, .. } => Some(parking),
        }
    }

    /// Whether jack events on the card should re-route this device automatically.
    ///
    /// The alternate variant is only re-routed by the mode switch sequence.
    pub fn follows_jack_events(&self) -> bool {
        matches!(self, PortPolicy::Priority)
    }
}
