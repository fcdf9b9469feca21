// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! PulseAudio thread: owns the server connection and the router.
//!
//! The thread runs a standard libpulse mainloop, iterated without blocking so
//! that router commands from the D-Bus side are picked up between iterations.
//! Server callbacks never touch the router directly. They only queue owned
//! [`ServerEvent`]s, which the loop hands to the router one at a time once the
//! callback has returned.

use crate::audio::backend::{AudioBackend, ListReply, ServerEvent, Tag};
use crate::audio::operation::Request;
use crate::audio::router::{Completion, Router};
use crate::audio::session::{ConnectionState, Session, SessionAction};
use crate::audio::types::{
    CardInfo, ChangeKind, DeviceInfo, Facility, ModuleInfo, PortAvailability, PortInfo,
};
use crate::config::{ConfigError, DaemonConfig};
use crate::service::SignalEvent;
use callaudio_ipc::Direction;
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::introspect::{
    CardInfo as PaCardInfo, ModuleInfo as PaModuleInfo, SinkInfo, SourceInfo,
};
use libpulse_binding::context::subscribe::{
    Facility as PaFacility, InterestMaskSet, Operation as PaOperation,
};
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::PortAvailable;
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::{properties, Proplist};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, error, info, trace, warn};

const APPLICATION_NAME: &str = "CallAudio";
const APPLICATION_ID: &str = "org.mobian-project.CallAudio";

/// Pause between non-blocking mainloop iterations.
const LOOP_INTERVAL: Duration = Duration::from_millis(5);

/// Commands sent from the service to the PulseAudio thread.
pub enum RouterCommand {
    Submit {
        request: Request,
        completion: Completion,
    },
    Shutdown,
}

#[derive(Debug, Error)]
pub enum PulseError {
    #[error("PulseAudio initialization failed: {0}")]
    InitFailed(String),
    #[error("Failed to connect to PulseAudio: {0}")]
    ConnectionFailed(String),
    #[error("PulseAudio mainloop failed: {0}")]
    Mainloop(String),
    #[error("PulseAudio thread error: {0}")]
    ThreadError(String),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

type EventQueue = Rc<RefCell<VecDeque<ServerEvent>>>;

/// [`AudioBackend`] over a libpulse context.
///
/// Without a context every request is answered with a failure reply, so the
/// router never waits on a connection that is gone.
pub struct PulseBackend {
    context: Option<Rc<RefCell<Context>>>,
    events: EventQueue,
}

impl PulseBackend {
    fn new(events: EventQueue) -> Self {
        Self {
            context: None,
            events,
        }
    }

    fn attach(&mut self, context: Rc<RefCell<Context>>) {
        self.context = Some(context);
    }

    /// Disconnect and drop the context, if any.
    fn detach(&mut self) {
        if let Some(context) = self.context.take() {
            let mut context = context.borrow_mut();
            context.set_subscribe_callback(None);
            context.set_state_callback(None);
            context.disconnect();
        }
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        self.context
            .as_ref()
            .map(|context| convert_state(context.borrow().get_state()))
    }

    fn push(&self, event: ServerEvent) {
        self.events.borrow_mut().push_back(event);
    }

    fn done_callback(&self, tag: Tag) -> Box<dyn FnMut(bool) + 'static> {
        let events = self.events.clone();
        Box::new(move |success: bool| {
            events
                .borrow_mut()
                .push_back(ServerEvent::Done { tag, success });
        })
    }
}

impl AudioBackend for PulseBackend {
    fn subscribe(&mut self) {
        let Some(context) = self.context.as_ref() else {
            return;
        };
        let events = self.events.clone();
        let mut context = context.borrow_mut();

        let callback = move |facility: Option<PaFacility>, operation: Option<PaOperation>, index: u32| {
            let facility = match facility {
                Some(PaFacility::Card) => Facility::Card,
                Some(PaFacility::Sink) => Facility::Sink,
                Some(PaFacility::Source) => Facility::Source,
                _ => return,
            };
            let kind = match operation {
                Some(PaOperation::New) => ChangeKind::New,
                Some(PaOperation::Changed) => ChangeKind::Changed,
                Some(PaOperation::Removed) => ChangeKind::Removed,
                None => return,
            };
            trace!("Subscription event {:?} {:?} {}", facility, kind, index);
            events.borrow_mut().push_back(ServerEvent::Subscription {
                facility,
                kind,
                index,
            });
        };
        context.set_subscribe_callback(Some(Box::new(callback)));

        context.subscribe(
            InterestMaskSet::SINK | InterestMaskSet::SOURCE | InterestMaskSet::CARD,
            |success| {
                if !success {
                    warn!("Failed to subscribe to PulseAudio events");
                }
            },
        );
    }

    fn list_cards(&mut self, tag: Tag) {
        let Some(context) = self.context.as_ref() else {
            self.push(ServerEvent::Card { tag, reply: ListReply::Error });
            return;
        };
        let events = self.events.clone();
        context.borrow().introspect().get_card_info_list(move |result| {
            let reply = list_reply(result, convert_card);
            events.borrow_mut().push_back(ServerEvent::Card { tag, reply });
        });
    }

    fn card_info(&mut self, index: u32, tag: Tag) {
        let Some(context) = self.context.as_ref() else {
            self.push(ServerEvent::Card { tag, reply: ListReply::Error });
            return;
        };
        let events = self.events.clone();
        context
            .borrow()
            .introspect()
            .get_card_info_by_index(index, move |result| {
                let reply = list_reply(result, convert_card);
                events.borrow_mut().push_back(ServerEvent::Card { tag, reply });
            });
    }

    fn list_modules(&mut self, tag: Tag) {
        let Some(context) = self.context.as_ref() else {
            self.push(ServerEvent::Module { tag, reply: ListReply::Error });
            return;
        };
        let events = self.events.clone();
        context.borrow().introspect().get_module_info_list(move |result| {
            let reply = list_reply(result, convert_module);
            events.borrow_mut().push_back(ServerEvent::Module { tag, reply });
        });
    }

    fn list_devices(&mut self, direction: Direction, tag: Tag) {
        let Some(context) = self.context.as_ref() else {
            self.push(ServerEvent::Device { tag, direction, reply: ListReply::Error });
            return;
        };
        let events = self.events.clone();
        let introspector = context.borrow().introspect();
        match direction {
            Direction::Output => {
                introspector.get_sink_info_list(move |result| {
                    let reply = list_reply(result, convert_sink);
                    events.borrow_mut().push_back(ServerEvent::Device { tag, direction, reply });
                });
            }
            Direction::Input => {
                introspector.get_source_info_list(move |result| {
                    let reply = list_reply(result, convert_source);
                    events.borrow_mut().push_back(ServerEvent::Device { tag, direction, reply });
                });
            }
        }
    }

    fn device_info(&mut self, direction: Direction, index: u32, tag: Tag) {
        let Some(context) = self.context.as_ref() else {
            self.push(ServerEvent::Device { tag, direction, reply: ListReply::Error });
            return;
        };
        let events = self.events.clone();
        let introspector = context.borrow().introspect();
        match direction {
            Direction::Output => {
                introspector.get_sink_info_by_index(index, move |result| {
                    let reply = list_reply(result, convert_sink);
                    events.borrow_mut().push_back(ServerEvent::Device { tag, direction, reply });
                });
            }
            Direction::Input => {
                introspector.get_source_info_by_index(index, move |result| {
                    let reply = list_reply(result, convert_source);
                    events.borrow_mut().push_back(ServerEvent::Device { tag, direction, reply });
                });
            }
        }
    }

    fn set_card_profile(&mut self, index: u32, profile: &str, tag: Tag) {
        debug!("Setting card {} profile to '{}'", index, profile);
        let Some(context) = self.context.as_ref() else {
            self.push(ServerEvent::Done { tag, success: false });
            return;
        };
        let callback = self.done_callback(tag);
        context
            .borrow()
            .introspect()
            .set_card_profile_by_index(index, profile, Some(callback));
    }

    fn set_port(&mut self, direction: Direction, index: u32, port: &str, tag: Tag) {
        debug!("Setting {} {} port to '{}'", direction, index, port);
        let Some(context) = self.context.as_ref() else {
            self.push(ServerEvent::Done { tag, success: false });
            return;
        };
        let callback = self.done_callback(tag);
        let mut introspector = context.borrow().introspect();
        match direction {
            Direction::Output => {
                introspector.set_sink_port_by_index(index, port, Some(callback));
            }
            Direction::Input => {
                introspector.set_source_port_by_index(index, port, Some(callback));
            }
        }
    }

    fn set_source_mute(&mut self, index: u32, mute: bool, tag: Tag) {
        debug!("Setting source {} mute to {}", index, mute);
        let Some(context) = self.context.as_ref() else {
            self.push(ServerEvent::Done { tag, success: false });
            return;
        };
        let callback = self.done_callback(tag);
        context
            .borrow()
            .introspect()
            .set_source_mute_by_index(index, mute, Some(callback));
    }

    fn unload_module(&mut self, index: u32, tag: Tag) {
        let Some(context) = self.context.as_ref() else {
            self.push(ServerEvent::Done { tag, success: false });
            return;
        };
        let callback = self.done_callback(tag);
        context.borrow().introspect().unload_module(index, callback);
    }
}

// ==================== Conversions ====================

fn list_reply<T, U>(result: ListResult<&T>, convert: impl FnOnce(&T) -> U) -> ListReply<U> {
    match result {
        ListResult::Item(info) => ListReply::Item(convert(info)),
        ListResult::End => ListReply::End,
        ListResult::Error => ListReply::Error,
    }
}

fn convert_state(state: ContextState) -> ConnectionState {
    match state {
        ContextState::Unconnected => ConnectionState::Unconnected,
        ContextState::Connecting => ConnectionState::Connecting,
        ContextState::Authorizing => ConnectionState::Authorizing,
        ContextState::SettingName => ConnectionState::SettingName,
        ContextState::Ready => ConnectionState::Ready,
        ContextState::Failed => ConnectionState::Failed,
        ContextState::Terminated => ConnectionState::Terminated,
    }
}

fn convert_proplist(proplist: &Proplist) -> HashMap<String, String> {
    proplist
        .iter()
        .filter_map(|key| proplist.get_str(&key).map(|value| (key, value)))
        .collect()
}

fn convert_availability(available: PortAvailable) -> PortAvailability {
    match available {
        PortAvailable::Unknown => PortAvailability::Unknown,
        PortAvailable::Yes => PortAvailability::Available,
        PortAvailable::No => PortAvailability::Unavailable,
    }
}

fn owned_name(name: Option<&str>) -> String {
    name.unwrap_or_default().to_string()
}

fn convert_card(info: &PaCardInfo) -> CardInfo {
    CardInfo {
        index: info.index,
        name: owned_name(info.name.as_deref()),
        properties: convert_proplist(&info.proplist),
        profiles: info
            .profiles
            .iter()
            .filter_map(|profile| profile.name.as_deref().map(str::to_string))
            .collect(),
        active_profile: info
            .active_profile
            .as_ref()
            .and_then(|profile| profile.name.as_deref().map(str::to_string)),
    }
}

/// Unnamed ports cannot be selected, so they are dropped.
fn convert_port(name: Option<&str>, priority: u32, available: PortAvailable) -> Option<PortInfo> {
    name.map(|name| PortInfo::new(name, priority, convert_availability(available)))
}

/// Sink and source info share field names but not types, so one body serves both.
macro_rules! convert_device {
    ($info:expr, $direction:expr) => {{
        let info = $info;
        DeviceInfo {
            index: info.index,
            name: owned_name(info.name.as_deref()),
            direction: $direction,
            card: info.card,
            properties: convert_proplist(&info.proplist),
            ports: info
                .ports
                .iter()
                .filter_map(|port| convert_port(port.name.as_deref(), port.priority, port.available))
                .collect(),
            active_port: info
                .active_port
                .as_ref()
                .and_then(|port| port.name.as_deref().map(str::to_string)),
            mute: info.mute,
        }
    }};
}

fn convert_sink(info: &SinkInfo) -> DeviceInfo {
    convert_device!(info, Direction::Output)
}

fn convert_source(info: &SourceInfo) -> DeviceInfo {
    convert_device!(info, Direction::Input)
}

fn convert_module(info: &PaModuleInfo) -> ModuleInfo {
    ModuleInfo {
        index: info.index,
        name: owned_name(info.name.as_deref()),
    }
}

// ==================== Thread ====================

/// Handle to the PulseAudio thread.
pub struct PulseThread {
    cmd_tx: mpsc::Sender<RouterCommand>,
    handle: Option<JoinHandle<()>>,
}

impl PulseThread {
    /// Spawn the PulseAudio thread.
    pub fn spawn(
        config: DaemonConfig,
        signal_tx: tokio_mpsc::UnboundedSender<SignalEvent>,
    ) -> Result<Self, PulseError> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<RouterCommand>();

        let handle = thread::Builder::new()
            .name("pulseaudio".to_string())
            .spawn(move || {
                if let Err(e) = run_pulse_loop(config, cmd_rx, signal_tx) {
                    error!("PulseAudio thread error: {}", e);
                }
            })
            .map_err(|e| PulseError::ThreadError(e.to_string()))?;

        Ok(Self {
            cmd_tx,
            handle: Some(handle),
        })
    }

    /// Send a command to the PulseAudio thread.
    pub fn send(&self, cmd: RouterCommand) -> Result<(), PulseError> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| PulseError::ThreadError("Channel closed".to_string()))
    }

    /// Shutdown the PulseAudio thread.
    pub fn shutdown(mut self) {
        let _ = self.send(RouterCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PulseThread {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(RouterCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Create a context and start connecting it.
///
/// The state callback only raises `state_dirty`; the loop reads the state
/// itself, since the callback may fire while the context is borrowed.
fn connect(mainloop: &Mainloop, state_dirty: &Rc<Cell<bool>>) -> Result<Rc<RefCell<Context>>, PulseError> {
    let mut proplist =
        Proplist::new().ok_or_else(|| PulseError::InitFailed("proplist".to_string()))?;
    proplist
        .set_str(properties::APPLICATION_NAME, APPLICATION_NAME)
        .map_err(|_| PulseError::InitFailed("application name".to_string()))?;
    proplist
        .set_str(properties::APPLICATION_ID, APPLICATION_ID)
        .map_err(|_| PulseError::InitFailed("application id".to_string()))?;

    let context = Context::new_with_proplist(mainloop, APPLICATION_NAME, &proplist)
        .ok_or_else(|| PulseError::InitFailed("context".to_string()))?;
    let context = Rc::new(RefCell::new(context));

    let dirty = state_dirty.clone();
    context
        .borrow_mut()
        .set_state_callback(Some(Box::new(move || dirty.set(true))));

    context
        .borrow_mut()
        .connect(None, ContextFlagSet::NOFAIL, None)
        .map_err(|e| PulseError::ConnectionFailed(ToString::to_string(&e)))?;

    debug!("PA context connecting");
    Ok(context)
}

fn run_pulse_loop(
    config: DaemonConfig,
    cmd_rx: mpsc::Receiver<RouterCommand>,
    signal_tx: tokio_mpsc::UnboundedSender<SignalEvent>,
) -> Result<(), PulseError> {
    let mut mainloop =
        Mainloop::new().ok_or_else(|| PulseError::InitFailed("mainloop".to_string()))?;

    let events: EventQueue = Rc::new(RefCell::new(VecDeque::new()));
    let state_dirty = Rc::new(Cell::new(false));
    let mut session = Session::new(&config.session);

    let mut router = Router::new(PulseBackend::new(events.clone()), &config)?;
    router.set_signal_sender(signal_tx);

    let mut reconnect_at = Some(Instant::now());

    loop {
        if reconnect_at.is_some_and(|at| Instant::now() >= at) {
            reconnect_at = None;
            match connect(&mainloop, &state_dirty) {
                Ok(context) => router.backend_mut().attach(context),
                Err(e) => {
                    error!("{}", e);
                    // Treated like a failed session so the backoff applies.
                    if let SessionAction::Reconnect(delay) = session.on_state(ConnectionState::Failed) {
                        reconnect_at = Some(Instant::now() + delay);
                    }
                }
            }
        }

        match mainloop.iterate(false) {
            IterateResult::Quit(_) => {
                router.shutdown();
                router.backend_mut().detach();
                return Err(PulseError::Mainloop("quit".to_string()));
            }
            IterateResult::Err(e) => {
                router.shutdown();
                router.backend_mut().detach();
                return Err(PulseError::Mainloop(ToString::to_string(&e)));
            }
            IterateResult::Success(_) => {}
        }

        if state_dirty.replace(false) {
            if let Some(state) = router.backend().connection_state() {
                match session.on_state(state) {
                    SessionAction::Wait => {}
                    SessionAction::Initialize => router.on_ready(),
                    SessionAction::Reconnect(delay) => {
                        router.on_connection_lost();
                        router.backend_mut().detach();
                        // Replies of the dead context would only confuse the next session.
                        events.borrow_mut().clear();
                        reconnect_at = Some(Instant::now() + delay);
                    }
                    SessionAction::Quiesce => {
                        router.on_connection_lost();
                        router.backend_mut().detach();
                        events.borrow_mut().clear();
                    }
                }
            }
        }

        loop {
            let event = events.borrow_mut().pop_front();
            match event {
                Some(event) => router.handle_event(event),
                None => break,
            }
        }

        loop {
            match cmd_rx.try_recv() {
                Ok(RouterCommand::Submit {
                    request,
                    completion,
                }) => {
                    router.submit(request, completion);
                }
                Ok(RouterCommand::Shutdown) | Err(mpsc::TryRecvError::Disconnected) => {
                    info!("PulseAudio thread shutting down");
                    router.shutdown();
                    router.backend_mut().detach();
                    return Ok(());
                }
                Err(mpsc::TryRecvError::Empty) => break,
            }
        }

        thread::sleep(LOOP_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_mapping() {
        assert_eq!(convert_availability(PortAvailable::Unknown), PortAvailability::Unknown);
        assert_eq!(convert_availability(PortAvailable::Yes), PortAvailability::Available);
        assert_eq!(convert_availability(PortAvailable::No), PortAvailability::Unavailable);
    }

    #[test]
    fn test_port_conversion() {
        assert_eq!(
            convert_port(Some("[Out] Speaker"), 200, PortAvailable::Yes),
            Some(PortInfo::new("[Out] Speaker", 200, PortAvailability::Available))
        );
        assert_eq!(convert_port(None, 100, PortAvailable::Unknown), None);
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(convert_state(ContextState::Ready), ConnectionState::Ready);
        assert_eq!(convert_state(ContextState::Failed), ConnectionState::Failed);
        assert_eq!(convert_state(ContextState::SettingName), ConnectionState::SettingName);
    }

    #[test]
    fn test_detached_backend_fails_requests() {
        let events: EventQueue = Rc::new(RefCell::new(VecDeque::new()));
        let mut backend = PulseBackend::new(events.clone());

        backend.card_info(0, Tag::Operation(1));
        backend.set_port(Direction::Output, 1, "[Out] Speaker", Tag::Operation(1));
        backend.subscribe();

        let queued: Vec<_> = events.borrow_mut().drain(..).collect();
        assert!(matches!(
            queued.as_slice(),
            [
                ServerEvent::Card { reply: ListReply::Error, .. },
                ServerEvent::Done { success: false, .. },
            ]
        ));
        assert_eq!(backend.connection_state(), None);
    }
}
