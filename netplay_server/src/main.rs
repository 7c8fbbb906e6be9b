//! Standalone session host.
//!
//! Usage:
//!   cargo run -p netplay_server -- [--port 27020] [--transport stream|session_udp|lite_udp]
//!       [--max-players 16] [--name netplay] [--level Arena] [--tick-hz 64] [--token netplay-v1]
//!       [--config host.json]
//!
//! Console commands:
//!   status            - Show session and roster
//!   kick <index>      - Kick a player
//!   ban <ip>          - Ban an address and kick its connections
//!   unban <ip>        - Lift a ban
//!   say <text>        - Send text to every peer
//!   quit              - Close the session and exit

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use netplay_server::SessionHost;
use netplay_shared::{config::NetConfig, event::HostEvent, game::LocalGame, transport::TransportKind};
use tokio::sync::mpsc;
use tracing::{info, warn};

struct Args {
    cfg: NetConfig,
    level: String,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = NetConfig::default();
    let mut level = "Arena".to_string();

    // A config file is applied first so flags override it.
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        if let Some(path) = args.get(pos + 1) {
            let text = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
            cfg = NetConfig::from_json_str(&text).with_context(|| format!("parse {path}"))?;
        }
    }

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
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
            "--max-players" if i + 1 < args.len() => {
                cfg.max_players = args[i + 1].parse().unwrap_or(cfg.max_players);
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.server_name = args[i + 1].clone();
                i += 2;
            }
            "--level" if i + 1 < args.len() => {
                level = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(64);
                i += 2;
            }
            "--token" if i + 1 < args.len() => {
                cfg.validation_token = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(Args { cfg, level })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args { cfg, level } = parse_args()?;
    info!(
        port = cfg.port,
        transport = ?cfg.transport,
        max_players = cfg.max_players,
        tick_hz = cfg.tick_hz,
        "Starting host"
    );

    let game = LocalGame::shared(&cfg.default_level);
    let mut host = SessionHost::new(cfg.clone());
    let local = host
        .create_session(&cfg.server_name, game, &level, cfg.port, cfg.max_players)
        .await
        .context("create session")?;
    info!(%local, "Host listening");

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

    println!("Host ready. Type 'status' for info, 'quit' to exit.");
    println!();

    let tick_interval = std::time::Duration::from_secs_f32(1.0 / cfg.tick_hz.max(1) as f32);
    let mut next_tick = tokio::time::Instant::now();

    'main: loop {
        while let Ok(line) = console_rx.try_recv() {
            if line == "quit" {
                break 'main;
            }
            for out in host.exec_console(&line) {
                println!("{out}");
            }
        }

        host.tick(tick_interval.as_secs_f32());
        for event in host.drain_events() {
            match event {
                HostEvent::PlayerConnected(p) => {
                    println!("{} joined as player {}", p.player_name, p.player_index)
                }
                HostEvent::PlayerDisconnected { player, reason } => {
                    println!("{} left ({reason:?})", player.player_name)
                }
                HostEvent::StringReceived { from, text } => println!("[{from}] {text}"),
                _ => {}
            }
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }

    host.destroy_session()?;
    info!("Host stopped");
    Ok(())
}
