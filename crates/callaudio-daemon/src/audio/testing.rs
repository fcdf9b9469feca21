// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-memory audio server for router tests.
//!
//! Requests are recorded in order and answered through a reply queue, the way
//! a real server answers on its single connection. Set requests are applied to
//! the model so follow-up queries see their effect.

use crate::audio::backend::{AudioBackend, ListReply, ServerEvent, Tag};
use crate::audio::router::Router;
use crate::audio::types::{CardInfo, DeviceInfo, ModuleInfo};
use callaudio_ipc::Direction;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A request the router made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Subscribe,
    ListCards,
    CardInfo(u32),
    ListModules,
    ListDevices(Direction),
    DeviceInfo(Direction, u32),
    SetCardProfile(u32, String),
    SetPort(Direction, u32, String),
    SetSourceMute(u32, bool),
    UnloadModule(u32),
}

#[derive(Default)]
struct Model {
    cards: Vec<CardInfo>,
    sinks: Vec<DeviceInfo>,
    sources: Vec<DeviceInfo>,
    modules: Vec<ModuleInfo>,
    log: Vec<Recorded>,
    replies: VecDeque<ServerEvent>,
    fail_next_query: bool,
    reject_sets: bool,
}

impl Model {
    fn devices(&mut self, direction: Direction) -> &mut Vec<DeviceInfo> {
        match direction {
            Direction::Output => &mut self.sinks,
            Direction::Input => &mut self.sources,
        }
    }

    fn take_query_failure(&mut self) -> bool {
        std::mem::take(&mut self.fail_next_query)
    }

    fn done(&mut self, tag: Tag, success: bool) {
        self.replies.push_back(ServerEvent::Done { tag, success });
    }
}

/// Shared handle; clones see the same server.
#[derive(Clone, Default)]
pub struct FakeServer {
    model: Rc<RefCell<Model>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_card(&self, card: CardInfo) {
        self.model.borrow_mut().cards.push(card);
    }

    pub fn add_device(&self, device: DeviceInfo) {
        let direction = device.direction;
        self.model.borrow_mut().devices(direction).push(device);
    }

    pub fn add_module(&self, module: ModuleInfo) {
        self.model.borrow_mut().modules.push(module);
    }

    pub fn update_card(&self, index: u32, f: impl FnOnce(&mut CardInfo)) {
        if let Some(card) = self
            .model
            .borrow_mut()
            .cards
            .iter_mut()
            .find(|card| card.index == index)
        {
            f(card);
        }
    }

    pub fn update_device(&self, direction: Direction, index: u32, f: impl FnOnce(&mut DeviceInfo)) {
        let mut model = self.model.borrow_mut();
        if let Some(device) = model
            .devices(direction)
            .iter_mut()
            .find(|device| device.index == index)
        {
            f(device);
        }
    }

    pub fn card(&self, index: u32) -> Option<CardInfo> {
        self.model
            .borrow()
            .cards
            .iter()
            .find(|card| card.index == index)
            .cloned()
    }

    pub fn device(&self, direction: Direction, index: u32) -> Option<DeviceInfo> {
        self.model
            .borrow_mut()
            .devices(direction)
            .iter()
            .find(|device| device.index == index)
            .cloned()
    }

    pub fn log(&self) -> Vec<Recorded> {
        self.model.borrow().log.clone()
    }

    pub fn clear_log(&self) {
        self.model.borrow_mut().log.clear();
    }

    /// The next info query gets a reply with neither info nor end-of-list.
    pub fn fail_next_query(&self) {
        self.model.borrow_mut().fail_next_query = true;
    }

    /// Make every set request report failure.
    pub fn reject_sets(&self, reject: bool) {
        self.model.borrow_mut().reject_sets = reject;
    }

    /// Deliver queued replies until the router stops issuing requests.
    pub fn pump(&self, router: &mut Router<FakeServer>) {
        loop {
            let event = self.model.borrow_mut().replies.pop_front();
            match event {
                Some(event) => router.handle_event(event),
                None => break,
            }
        }
    }

    fn record(&self, request: Recorded) {
        self.model.borrow_mut().log.push(request);
    }
}

impl AudioBackend for FakeServer {
    fn subscribe(&mut self) {
        self.record(Recorded::Subscribe);
    }

    fn list_cards(&mut self, tag: Tag) {
        self.record(Recorded::ListCards);
        let mut model = self.model.borrow_mut();
        let cards = model.cards.clone();
        for card in cards {
            model.replies.push_back(ServerEvent::Card {
                tag,
                reply: ListReply::Item(card),
            });
        }
        model.replies.push_back(ServerEvent::Card {
            tag,
            reply: ListReply::End,
        });
    }

    fn card_info(&mut self, index: u32, tag: Tag) {
        self.record(Recorded::CardInfo(index));
        let mut model = self.model.borrow_mut();
        let found = model.cards.iter().find(|card| card.index == index).cloned();
        match found {
            Some(card) if !model.take_query_failure() => {
                model.replies.push_back(ServerEvent::Card {
                    tag,
                    reply: ListReply::Item(card),
                });
                model.replies.push_back(ServerEvent::Card {
                    tag,
                    reply: ListReply::End,
                });
            }
            _ => model.replies.push_back(ServerEvent::Card {
                tag,
                reply: ListReply::Error,
            }),
        }
    }

    fn list_modules(&mut self, tag: Tag) {
        self.record(Recorded::ListModules);
        let mut model = self.model.borrow_mut();
        let modules = model.modules.clone();
        for module in modules {
            model.replies.push_back(ServerEvent::Module {
                tag,
                reply: ListReply::Item(module),
            });
        }
        model.replies.push_back(ServerEvent::Module {
            tag,
            reply: ListReply::End,
        });
    }

    fn list_devices(&mut self, direction: Direction, tag: Tag) {
        self.record(Recorded::ListDevices(direction));
        let mut model = self.model.borrow_mut();
        let devices = model.devices(direction).clone();
        for device in devices {
            model.replies.push_back(ServerEvent::Device {
                tag,
                direction,
                reply: ListReply::Item(device),
            });
        }
        model.replies.push_back(ServerEvent::Device {
            tag,
            direction,
            reply: ListReply::End,
        });
    }

    fn device_info(&mut self, direction: Direction, index: u32, tag: Tag) {
        self.record(Recorded::DeviceInfo(direction, index));
        let mut model = self.model.borrow_mut();
        let found = model
            .devices(direction)
            .iter()
            .find(|device| device.index == index)
            .cloned();
        match found {
            Some(device) if !model.take_query_failure() => {
                model.replies.push_back(ServerEvent::Device {
                    tag,
                    direction,
                    reply: ListReply::Item(device),
                });
                model.replies.push_back(ServerEvent::Device {
                    tag,
                    direction,
                    reply: ListReply::End,
                });
            }
            _ => model.replies.push_back(ServerEvent::Device {
                tag,
                direction,
                reply: ListReply::Error,
            }),
        }
    }

    fn set_card_profile(&mut self, index: u32, profile: &str, tag: Tag) {
        self.record(Recorded::SetCardProfile(index, profile.to_string()));
        let mut model = self.model.borrow_mut();
        let reject = model.reject_sets;
        let applied = !reject
            && model
                .cards
                .iter_mut()
                .find(|card| card.index == index && card.profiles.iter().any(|p| p == profile))
                .map(|card| card.active_profile = Some(profile.to_string()))
                .is_some();
        model.done(tag, applied);
    }

    fn set_port(&mut self, direction: Direction, index: u32, port: &str, tag: Tag) {
        self.record(Recorded::SetPort(direction, index, port.to_string()));
        let mut model = self.model.borrow_mut();
        let reject = model.reject_sets;
        let applied = !reject
            && model
                .devices(direction)
                .iter_mut()
                .find(|device| {
                    device.index == index && device.ports.iter().any(|p| p.name == port)
                })
                .map(|device| device.active_port = Some(port.to_string()))
                .is_some();
        model.done(tag, applied);
    }

    fn set_source_mute(&mut self, index: u32, mute: bool, tag: Tag) {
        self.record(Recorded::SetSourceMute(index, mute));
        let mut model = self.model.borrow_mut();
        let reject = model.reject_sets;
        let applied = !reject
            && model
                .sources
                .iter_mut()
                .find(|source| source.index == index)
                .map(|source| source.mute = mute)
                .is_some();
        model.done(tag, applied);
    }

    fn unload_module(&mut self, index: u32, tag: Tag) {
        self.record(Recorded::UnloadModule(index));
        let mut model = self.model.borrow_mut();
        let before = model.modules.len();
        model.modules.retain(|module| module.index != index);
        let removed = model.modules.len() != before;
        model.done(tag, removed);
    }
}
