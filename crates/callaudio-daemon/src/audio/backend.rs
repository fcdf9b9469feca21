// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The audio server capability used by the router.
//!
//! Requests return immediately. Their replies come back later as
//! [`ServerEvent`]s, each carrying the [`Tag`] given with the request, and are
//! fed to the router one at a time from the event loop.

use crate::audio::types::{CardInfo, ChangeKind, DeviceInfo, Facility, ModuleInfo};
use callaudio_ipc::Direction;

/// Identifier of a caller-visible operation.
pub type OpId = u64;

/// Who is waiting for the reply to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Initial registry pass after the session became ready.
    Init,
    /// A device or card announced by a subscription notification.
    Hotplug,
    /// Port refresh after the tracked card changed.
    Refresh,
    /// Source query of the automatic unmute when a call ends.
    Unmute,
    /// A step of a caller-visible operation.
    Operation(OpId),
    /// Fire-and-forget request; the outcome is only logged.
    Detached,
}

/// One reply to an info query.
#[derive(Debug, Clone)]
pub enum ListReply<T> {
    Item(T),
    /// End-of-list marker.
    End,
    /// The server returned no info and no end-of-list marker.
    Error,
}

/// Something the server told us.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Subscription {
        facility: Facility,
        kind: ChangeKind,
        index: u32,
    },
    Card {
        tag: Tag,
        reply: ListReply<CardInfo>,
    },
    Device {
        tag: Tag,
        direction: Direction,
        reply: ListReply<DeviceInfo>,
    },
    Module {
        tag: Tag,
        reply: ListReply<ModuleInfo>,
    },
    /// Completion of a set or unload request.
    Done { tag: Tag, success: bool },
}

/// Asynchronous operations the router needs from the audio server.
pub trait AudioBackend {
    /// Subscribe to card, sink and source notifications.
    fn subscribe(&mut self);

    fn list_cards(&mut self, tag: Tag);
    fn card_info(&mut self, index: u32, tag: Tag);
    fn list_modules(&mut self, tag: Tag);
    fn list_devices(&mut self, direction: Direction, tag: Tag);
    fn device_info(&mut self, direction: Direction, index: u32, tag: Tag);

    fn set_card_profile(&mut self, index: u32, profile: &str, tag: Tag);
    fn set_port(&mut self, direction: Direction, index: u32, port: &str, tag: Tag);
    fn set_source_mute(&mut self, index: u32, mute: bool, tag: Tag);
    fn unload_module(&mut self, index: u32, tag: Tag);
}
