// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! callaudiocli - Command-line client for callaudiod.
//!
//! Requests are sent in a fixed order (mode, speaker, microphone) and the
//! status is printed last, so one invocation can both change and inspect the
//! routing.

mod daemon_client;

use callaudio_ipc::CallMode;
use clap::Parser;
use daemon_client::{DaemonClient, DaemonClientError};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "callaudiocli", version, about = "Control call audio routing")]
struct Cli {
    /// Select mode: 0 for normal, 1 for voice call.
    #[arg(short = 'm', long, value_name = "MODE", value_parser = clap::value_parser!(u32).range(0..=1))]
    select_mode: Option<u32>,

    /// Enable (1) or disable (0) the speaker.
    #[arg(short = 's', long, value_name = "0|1", value_parser = clap::value_parser!(u32).range(0..=1))]
    enable_speaker: Option<u32>,

    /// Mute (1) or unmute (0) the microphone.
    #[arg(short = 'u', long, value_name = "0|1", value_parser = clap::value_parser!(u32).range(0..=1))]
    mute_mic: Option<u32>,

    /// Print the current audio mode, speaker and microphone state.
    #[arg(short = 'S', long)]
    status: bool,
}

impl Cli {
    fn is_empty(&self) -> bool {
        self.select_mode.is_none()
            && self.enable_speaker.is_none()
            && self.mute_mic.is_none()
            && !self.status
    }

    async fn execute(&self) -> Result<(), DaemonClientError> {
        let client = DaemonClient::connect().await?;

        if let Some(mode) = self.select_mode.and_then(CallMode::from_u32) {
            client.select_mode(mode).await?;
            println!("Selected {} mode", mode);
        }

        if let Some(enable) = self.enable_speaker {
            client.enable_speaker(enable == 1).await?;
            println!("Speaker {}", if enable == 1 { "enabled" } else { "disabled" });
        }

        if let Some(mute) = self.mute_mic {
            client.mute_mic(mute == 1).await?;
            println!("Microphone {}", if mute == 1 { "muted" } else { "unmuted" });
        }

        if self.status {
            let status = client.status().await?;
            debug!("Status: {:?}", status);
            match status.mode {
                Some(mode) => println!("Audio mode: {}", mode),
                None => println!("Audio mode: unknown"),
            }
            println!("Speaker: {}", status.speaker);
            println!("Microphone: {}", status.mic);
        }

        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.is_empty() {
        eprintln!("Nothing to do; see --help");
        std::process::exit(2);
    }

    if let Err(e) = cli.execute().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
