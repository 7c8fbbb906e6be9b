//! Standalone session peer.
//!
//! Usage:
//!   cargo run -p netplay_client -- [--addr 127.0.0.1] [--port 27020]
//!       [--transport stream|session_udp|lite_udp] [--name Player] [--token netplay-v1]
//!
//! Console commands:
//!   status        - Show connection state and roster
//!   say <text>    - Send text to the host
//!   name <new>    - Change player name
//!   quit          - Disconnect and exit

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Context;
use netplay_client::SessionPeer;
use netplay_shared::{config::NetConfig, event::PeerEvent, game::LocalGame, transport::TransportKind};
use tokio::sync::mpsc;
use tracing::{info, warn};

fn parse_args() -> NetConfig {
    let mut cfg = NetConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.address = args[i + 1].clone();
                i += 2;
            }
            "--port" if i + 1 < args.len() => {
                cfg.port = args[i + 1].parse().unwrap_or(cfg.port);
                i += 2;
            }
            "--transport" if i + 1 < args.len() => {
                match TransportKind::parse(&args[i + 1]) {
                    Some(kind) => cfg.transport = kind,
                    None => warn!(value = %args[i + 1], "Unknown transport, keeping default"),
                }
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            "--token" if i + 1 < args.len() => {
                cfg.validation_token = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args();
    info!(addr = %cfg.address, port = cfg.port, transport = ?cfg.transport, "Starting peer");

    let game = LocalGame::shared(&cfg.default_level);
    let mut peer = SessionPeer::new(cfg.clone());
    peer.connect(game, &cfg.address, cfg.port)
        .await
        .context("connect")?;

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Connecting. Type 'status' for info, 'quit' to exit.");
    println!();

    let tick_interval = Duration::from_secs_f32(1.0 / cfg.tick_hz.max(1) as f32);
    let mut next_tick = tokio::time::Instant::now();

    'main: loop {
        while let Ok(line) = console_rx.try_recv() {
            if line == "quit" {
                if peer.is_connected() {
                    peer.disconnect()?;
                }
                break 'main;
            }
            for out in peer.exec_console(&line) {
                println!("{out}");
            }
        }

        peer.tick(tick_interval.as_secs_f32());
        for event in peer.drain_events() {
            match event {
                PeerEvent::Validated { you, session } => println!(
                    "Joined '{}' on {} as player {}",
                    session.server_name, session.level_name, you.player_index
                ),
                PeerEvent::PlayerConnected(p) => println!("{} is here", p.player_name),
                PeerEvent::PlayerDisconnected(p) => println!("{} left", p.player_name),
                PeerEvent::StringReceived(text) => println!("{text}"),
                PeerEvent::ConnectFailed(reason) => {
                    println!("Connect failed: {reason}");
                    break 'main;
                }
                PeerEvent::Disconnected { reason } => {
                    println!("Disconnected: {reason}");
                    break 'main;
                }
                _ => {}
            }
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }

    Ok(())
}
