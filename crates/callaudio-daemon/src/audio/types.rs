// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Audio server type definitions for cards, devices, ports and modules.
//!
//! These are owned snapshots of what the server reports. The backend converts
//! its native structures into these before handing them to the router, so the
//! routing core never holds server-owned memory.

use callaudio_ipc::Direction;
use std::collections::HashMap;

/// Well-known property keys read from server objects.
pub mod props {
    pub const DEVICE_CLASS: &str = "device.class";
    pub const DEVICE_BUS_PATH: &str = "device.bus_path";
    pub const DEVICE_FORM_FACTOR: &str = "device.form_factor";
    pub const DEVICE_API: &str = "device.api";
}

/// Availability of a port as reported by jack detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PortAvailability {
    /// No jack detection for this port.
    #[default]
    Unknown,
    Available,
    Unavailable,
}

impl PortAvailability {
    pub fn is_known(self) -> bool {
        self != PortAvailability::Unknown
    }
}

/// A port on a sink or source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub priority: u32,
    pub available: PortAvailability,
}

impl PortInfo {
    pub fn new(name: &str, priority: u32, available: PortAvailability) -> Self {
        Self {
            name: name.to_string(),
            priority,
            available,
        }
    }
}

/// Snapshot of a card.
#[derive(Debug, Clone, Default)]
pub struct CardInfo {
    pub index: u32,
    pub name: String,
    pub properties: HashMap<String, String>,
    /// Profile names in server order.
    pub profiles: Vec<String>,
    pub active_profile: Option<String>,
}

impl CardInfo {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Snapshot of a sink (output) or source (input).
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub direction: Direction,
    /// Owning card, if the device belongs to one.
    pub card: Option<u32>,
    pub properties: HashMap<String, String>,
    pub ports: Vec<PortInfo>,
    pub active_port: Option<String>,
    pub mute: bool,
}

impl DeviceInfo {
    pub fn new(index: u32, direction: Direction) -> Self {
        Self {
            index,
            name: String::new(),
            direction,
            card: None,
            properties: HashMap::new(),
            ports: Vec::new(),
            active_port: None,
            mute: false,
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn active_port(&self) -> Option<&str> {
        self.active_port.as_deref()
    }
}

/// Snapshot of a loaded server module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub index: u32,
    pub name: String,
}

/// Object kinds the router subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facility {
    Card,
    Sink,
    Source,
}

impl Facility {
    /// Device direction for sink and source facilities.
    pub fn direction(self) -> Option<Direction> {
        match self {
            Facility::Sink => Some(Direction::Output),
            Facility::Source => Some(Direction::Input),
            Facility::Card => None,
        }
    }
}

/// Kind of change carried by a subscription notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    New,
    Changed,
    Removed,
}

/// Human-readable device noun used in logs and errors.
pub fn device_noun(direction: Direction) -> &'static str {
    match direction {
        Direction::Output => "sink",
        Direction::Input => "source",
    }
}
