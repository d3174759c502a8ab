//! Headless softphone wiring example.
//!
//! Connects to a SIP server over WebSocket, registers, and prints every
//! core event as JSON. Dial by typing an extension on stdin; an empty line
//! hangs up.
//!
//! ```bash
//! cargo run --example softphone -- pbx.example.com 1001 secret
//! ```

use softline_client_core::adapters::MemoryPreferences;
use softline_client_core::audio::device::{NullAudioOutput, NullAudioSink};
use softline_client_core::audio::{AudioService, ToneEngine};
use softline_client_core::prelude::*;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let server = args.next().unwrap_or_else(|| "pbx.example.com".to_string());
    let username = args.next().unwrap_or_else(|| "1001".to_string());
    let password = args.next().unwrap_or_default();

    let config = SipConfig::new(&server, &username, &password, &server);
    let client = SoftphoneClient::new(config);
    let bus = client.bus().clone();

    // Tone engine + audio service (no real audio hardware in this example).
    let tones = Arc::new(ToneEngine::new(Arc::new(NullAudioSink)));
    let audio = AudioService::new(
        bus.clone(),
        Arc::new(NullAudioOutput),
        Arc::new(MemoryPreferences::new()),
        tones.clone(),
    );
    audio.start();

    // Three-line coordination.
    let lines = LineManager::new(bus.clone(), Arc::new(client.clone()), tones);
    lines.start();

    // Connectivity classification + automatic recovery.
    let monitor = ConnectivityMonitor::new(bus.clone(), server.clone(), MonitorConfig::default());
    monitor.start();
    let recovery = RecoveryController::new(bus.clone(), Arc::new(client.clone()), &username);
    recovery.start();

    // Print the event stream.
    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                println!("{}", json);
            }
        }
    });

    client.create_user_agent().await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin.next_line().await? {
        let target = line.trim();
        if target.is_empty() {
            if let Err(e) = client.hangup_call(None).await {
                eprintln!("hangup: {}", e);
            }
            continue;
        }
        match client.make_call(target, CallOptions::default()).await {
            Ok(session) => eprintln!("dialing {} as {}", target, session),
            Err(e) => eprintln!("call failed: {}", e),
        }
    }

    client.stop().await;
    Ok(())
}
