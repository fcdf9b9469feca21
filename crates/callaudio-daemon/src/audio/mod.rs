// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Audio subsystem for the daemon - PulseAudio integration and call routing.

pub mod backend;
pub mod operation;
pub mod port_cache;
pub mod port_policy;
pub mod pulse_thread;
pub mod registry;
pub mod router;
pub mod session;
pub mod types;

#[cfg(test)]
pub mod testing;
