//! RPC relay, latency probe, renames and kicks across a live session.

use std::sync::{
    atomic::{AtomicI64, AtomicUsize, Ordering},
    Arc,
};

use bytes::Bytes;
use netplay_shared::{
    event::{HostEvent, PeerEvent},
    game::LocalGame,
    rpc::{DispatchKind, ParamKind, RpcEntry, Value},
    transport::TransportKind,
};
use netplay_tests::{init_tracing, join, pump_for, pump_until, start_host};

fn counting_entry(hits: &Arc<AtomicUsize>) -> RpcEntry {
    let hits = hits.clone();
    RpcEntry::new("Wave", DispatchKind::ServerAndClient, vec![ParamKind::Str], move |_, args| {
        assert_eq!(args, &[Value::Str("hello".into())]);
        hits.fetch_add(1, Ordering::SeqCst);
    })
}

/// A `ServerAndClient` call runs on the host and every other peer, never back on the caller.
#[tokio::test(flavor = "multi_thread")]
async fn relay_skips_the_originator() -> anyhow::Result<()> {
    init_tracing();
    for kind in TransportKind::ALL {
        let (mut host, port) = start_host(kind, LocalGame::shared("MainMenu"), 8).await?;
        let mut peers = Vec::new();
        for name in ["a", "b", "c"] {
            join(&mut host, &mut peers, kind, port, name).await?;
        }

        let host_hits = Arc::new(AtomicUsize::new(0));
        host.register_rpc("Player_1", "Pawn", counting_entry(&host_hits))?;
        let peer_hits: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        for (peer, hits) in peers.iter_mut().zip(&peer_hits) {
            peer.register_rpc("Player_1", "Pawn", counting_entry(hits))?;
        }

        assert!(peers[0].call_rpc("Player_1", "Pawn", "Wave", &[Value::Str("hello".into())]));
        let relayed = pump_until(&mut host, &mut peers, |_, _| {
            peer_hits[1].load(Ordering::SeqCst) == 1 && peer_hits[2].load(Ordering::SeqCst) == 1
        })
        .await;
        assert!(relayed, "{kind:?}");
        pump_for(&mut host, &mut peers, 20).await;

        assert_eq!(host_hits.load(Ordering::SeqCst), 1, "{kind:?}");
        assert_eq!(peer_hits[0].load(Ordering::SeqCst), 0, "{kind:?}");
        assert_eq!(peer_hits[1].load(Ordering::SeqCst), 1, "{kind:?}");
        assert_eq!(peer_hits[2].load(Ordering::SeqCst), 1, "{kind:?}");
        host.destroy_session()?;
    }
    Ok(())
}

/// Host-initiated `ClientOnly` calls reach every peer and do not run on the host.
#[tokio::test(flavor = "multi_thread")]
async fn host_broadcasts_client_only_rpc() -> anyhow::Result<()> {
    init_tracing();
    let kind = TransportKind::Stream;
    let (mut host, port) = start_host(kind, LocalGame::shared("MainMenu"), 4).await?;
    let mut peers = Vec::new();
    join(&mut host, &mut peers, kind, port, "a").await?;
    join(&mut host, &mut peers, kind, port, "b").await?;

    let host_ran = Arc::new(AtomicUsize::new(0));
    let h = host_ran.clone();
    host.register_rpc(
        "Hud",
        "Hud",
        RpcEntry::new("Flash", DispatchKind::ClientOnly, vec![ParamKind::Int], move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        }),
    )?;
    let total = Arc::new(AtomicI64::new(0));
    for peer in peers.iter_mut() {
        let t = total.clone();
        peer.register_rpc(
            "Hud",
            "Hud",
            RpcEntry::new("Flash", DispatchKind::ClientOnly, vec![ParamKind::Int], move |ctx, args| {
                assert_eq!(ctx.sender, None);
                t.fetch_add(args[0].as_int().unwrap_or(0), Ordering::SeqCst);
            }),
        )?;
    }

    assert!(host.call_rpc("Hud", "Hud", "Flash", &[Value::Int(7)]));
    assert!(!host.call_rpc("Hud", "Hud", "Flash", &[Value::Str("wrong".into())]));
    assert!(pump_until(&mut host, &mut peers, |_, _| total.load(Ordering::SeqCst) == 14).await);
    assert_eq!(host_ran.load(Ordering::SeqCst), 0);
    host.destroy_session()?;
    Ok(())
}

/// The probe yields a latency on the peer and, one round later, on the host's record.
#[tokio::test(flavor = "multi_thread")]
async fn latency_probe_records_round_trip() -> anyhow::Result<()> {
    init_tracing();
    for kind in TransportKind::ALL {
        let (mut host, port) = start_host(kind, LocalGame::shared("MainMenu"), 4).await?;
        let mut peers = Vec::new();
        join(&mut host, &mut peers, kind, port, "pinger").await?;

        assert!(peers[0].probe_latency());
        assert!(pump_until(&mut host, &mut peers, |_, p| p[0].latency().is_some()).await, "{kind:?}");
        assert!(peers[0]
            .drain_events()
            .iter()
            .any(|e| matches!(e, PeerEvent::LatencyMeasured(_))));

        // The host learns the value from the next probe.
        let measured = peers[0].latency().unwrap_or(0);
        assert!(peers[0].probe_latency());
        let recorded = pump_until(&mut host, &mut peers, |h, _| {
            h.session_info().by_index(1).map(|r| r.ping) == Some(measured)
        })
        .await;
        assert!(recorded, "{kind:?}");
        host.destroy_session()?;
    }
    Ok(())
}

/// Periodic probing runs on the configured interval without any explicit call.
#[tokio::test(flavor = "multi_thread")]
async fn periodic_probe_fires_on_interval() -> anyhow::Result<()> {
    init_tracing();
    let kind = TransportKind::SessionUdp;
    let (mut host, port) = start_host(kind, LocalGame::shared("MainMenu"), 4).await?;
    let mut cfg = netplay_tests::peer_config(kind, "auto");
    cfg.ping_interval_ticks = 3;
    let mut peer = netplay_client::SessionPeer::new(cfg);
    peer.connect(LocalGame::shared("MainMenu"), "127.0.0.1", port).await?;
    let mut peers = vec![peer];
    assert!(pump_until(&mut host, &mut peers, |_, p| p[0].latency().is_some()).await);
    host.destroy_session()?;
    Ok(())
}

/// Renaming updates the host record and every peer's mirror.
#[tokio::test(flavor = "multi_thread")]
async fn rename_propagates_to_all_rosters() -> anyhow::Result<()> {
    init_tracing();
    let kind = TransportKind::LiteUdp;
    let (mut host, port) = start_host(kind, LocalGame::shared("MainMenu"), 4).await?;
    let mut peers = Vec::new();
    join(&mut host, &mut peers, kind, port, "old").await?;
    join(&mut host, &mut peers, kind, port, "watcher").await?;

    assert!(peers[0].set_player_name("new"));
    let renamed = pump_until(&mut host, &mut peers, |h, p| {
        h.session_info().by_index(1).map(|r| r.player_name.as_str()) == Some("new")
            && p[0].local_record().map(|r| r.player_name.as_str()) == Some("new")
            && p[1].session_info().by_index(1).map(|r| r.player_name.as_str()) == Some("new")
    })
    .await;
    assert!(renamed);
    assert!(host
        .drain_events()
        .iter()
        .any(|e| matches!(e, HostEvent::PlayerRenamed(r) if r.player_name == "new")));
    host.destroy_session()?;
    Ok(())
}

/// Direct calls and text reach the host with the sender's index.
#[tokio::test(flavor = "multi_thread")]
async fn direct_calls_and_strings_carry_sender_index() -> anyhow::Result<()> {
    init_tracing();
    let kind = TransportKind::Stream;
    let (mut host, port) = start_host(kind, LocalGame::shared("MainMenu"), 4).await?;
    let seen = Arc::new(AtomicI64::new(-1));
    let s = seen.clone();
    host.register_direct_handler("Emote", move |sender, packet| {
        if &packet.data[..] == b"wave" {
            s.store(i64::from(sender), Ordering::SeqCst);
        }
    });
    let mut peers = Vec::new();
    join(&mut host, &mut peers, kind, port, "a").await?;
    join(&mut host, &mut peers, kind, port, "b").await?;

    assert!(peers[1].direct_call("Emote", Bytes::from_static(b"wave")));
    assert!(peers[1].send_string("gg"));
    assert!(!peers[1].direct_call("__ping", Bytes::new()));
    assert!(pump_until(&mut host, &mut peers, |_, _| seen.load(Ordering::SeqCst) == 2).await);
    pump_for(&mut host, &mut peers, 5).await;
    assert!(host.drain_events().contains(&HostEvent::StringReceived {
        from: 2,
        text: "gg".to_string()
    }));

    assert_eq!(host.send_string("welcome all"), 2);
    pump_for(&mut host, &mut peers, 20).await;
    for peer in peers.iter_mut() {
        assert!(peer
            .drain_events()
            .contains(&PeerEvent::StringReceived("welcome all".to_string())));
    }
    host.destroy_session()?;
    Ok(())
}

/// A kicked peer is told why and the slot is reusable.
#[tokio::test(flavor = "multi_thread")]
async fn kicked_peer_is_torn_down() -> anyhow::Result<()> {
    init_tracing();
    for kind in TransportKind::ALL {
        let (mut host, port) = start_host(kind, LocalGame::shared("MainMenu"), 2).await?;
        let mut peers = Vec::new();
        join(&mut host, &mut peers, kind, port, "victim").await?;

        assert!(host.kick_client(1)?, "{kind:?}");
        assert_eq!(host.session_info().players.len(), 1);
        assert!(pump_until(&mut host, &mut peers, |_, p| !p[0].is_connected()).await, "{kind:?}");

        assert_eq!(join(&mut host, &mut peers, kind, port, "next").await?, 1, "{kind:?}");
        host.destroy_session()?;
    }
    Ok(())
}
