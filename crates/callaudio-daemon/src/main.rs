// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! callaudiod - Call audio routing daemon.
//!
//! This daemon switches the phone's card profile and sink/source ports between
//! media playback and voice calls through PulseAudio. It exposes a D-Bus
//! interface that telephony stacks and the CLI client talk to.

mod audio;
mod config;
mod dbus;
mod service;

use audio::registry::IdentifyRules;
use callaudio_ipc::{DBUS_NAME, DBUS_PATH};
use config::DaemonConfig;
use dbus::CallAudioDbusService;
use service::SignalEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, error, info, warn};
use zbus::connection::Builder;

/// Load the config file, falling back to built-in defaults when it is unusable.
fn load_config() -> DaemonConfig {
    let config = match config::ConfigManager::new().and_then(|m| m.load_daemon_config()) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config, using defaults: {}", e);
            return DaemonConfig::default();
        }
    };

    match IdentifyRules::new(&config) {
        Ok(_) => config,
        Err(e) => {
            warn!("{}, using defaults", e);
            DaemonConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("callaudiod=debug".parse()?)
                .add_directive("zbus=warn".parse()?),
        )
        .init();

    info!("callaudiod starting...");

    let config = load_config();
    debug!(
        "Identification: variant api '{}', hifi profile '{}'",
        config.identification.variant_api, config.profiles.hifi
    );

    // Create signal channel for D-Bus signal events
    let (signal_tx, signal_rx) = tokio_mpsc::unbounded_channel::<SignalEvent>();

    let mut call_audio_service = service::CallAudioService::new(config);
    call_audio_service.set_signal_sender(signal_tx);

    if let Err(e) = call_audio_service.start_pulseaudio() {
        error!("Failed to start PulseAudio thread: {}", e);
        return Err(e.into());
    }

    // Wrap in Arc<Mutex> for D-Bus access
    let service = Arc::new(Mutex::new(call_audio_service));

    let dbus_service = CallAudioDbusService::new(service.clone());

    // Build D-Bus connection
    let connection = Builder::session()?
        .name(DBUS_NAME)?
        .serve_at(DBUS_PATH, dbus_service)?
        .build()
        .await?;

    info!("D-Bus service registered at {}", DBUS_NAME);
    info!("callaudiod ready");

    // Shutdown flag for graceful termination
    let shutdown_flag = Arc::new(AtomicBool::new(false));

    // Spawn task to publish property changes from the signal channel
    let shutdown_flag_signals = shutdown_flag.clone();
    let signal_task = tokio::spawn(async move {
        let mut signal_rx = signal_rx;
        loop {
            tokio::select! {
                Some(event) = signal_rx.recv() => {
                    let object_server = connection.object_server();
                    let iface_ref = match object_server.interface::<_, CallAudioDbusService>(DBUS_PATH).await {
                        Ok(iface) => iface,
                        Err(e) => {
                            warn!("Failed to get D-Bus interface for signal: {}", e);
                            continue;
                        }
                    };
                    debug!("Publishing D-Bus property change: {:?}", event);
                    if let Err(e) = dbus::publish(&iface_ref, event).await {
                        warn!("Failed to emit PropertiesChanged: {}", e);
                    }
                }
                _ = tokio::time::sleep(tokio::time::Duration::from_millis(100)) => {
                    if shutdown_flag_signals.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }
    });

    // Handle shutdown signals
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
    }

    shutdown_flag.store(true, Ordering::Relaxed);
    let _ = tokio::time::timeout(tokio::time::Duration::from_secs(1), signal_task).await;

    // Cleanup
    if let Ok(mut svc) = service.lock() {
        svc.shutdown();
    }

    info!("callaudiod stopped");
    Ok(())
}
