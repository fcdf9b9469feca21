// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Last-known port availability for a tracked sink or source.

use crate::audio::types::{PortAvailability, PortInfo};
use std::collections::HashMap;

/// Map from port name to the last availability seen for it.
///
/// Only ports with jack detection (a known availability) are stored.
#[derive(Debug, Clone, Default)]
pub struct PortCache {
    states: HashMap<String, PortAvailability>,
}

impl PortCache {
    /// Build a fresh cache from a device's full port list.
    pub fn from_ports(ports: &[PortInfo]) -> Self {
        let mut cache = Self::default();
        cache.observe(ports);
        cache
    }

    /// Record the given port states and report whether any known state changed.
    ///
    /// A port whose availability is unknown is neither stored nor counted.
    pub fn observe(&mut self, ports: &[PortInfo]) -> bool {
        let mut changed = false;

        for port in ports.iter().filter(|p| p.available.is_known()) {
            if self.states.get(&port.name) != Some(&port.available) {
                self.states.insert(port.name.clone(), port.available);
                changed = true;
            }
        }

        changed
    }

    pub fn get(&self, name: &str) -> Option<PortAvailability> {
        self.states.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
