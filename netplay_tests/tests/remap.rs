//! Address remapping when the game renumbers player actors.

use netplay_shared::{
    event::HostEvent,
    game::lock_game,
    rpc::{DispatchKind, RpcEntry},
    transport::TransportKind,
};
use netplay_tests::{init_tracing, join, pump_until, start_host, CompactingGame};

fn declare(host: &mut netplay_server::SessionHost, address: &str) -> anyhow::Result<()> {
    host.register_rpc(address, "Pawn", RpcEntry::declare("Jump", DispatchKind::ServerAndClient, vec![]))?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn routes_follow_players_when_addresses_shift() -> anyhow::Result<()> {
    init_tracing();
    let kind = TransportKind::Stream;
    let game = CompactingGame::shared();
    let (mut host, port) = start_host(kind, game.clone(), 8).await?;
    let mut peers = Vec::new();
    for name in ["one", "two", "three"] {
        join(&mut host, &mut peers, kind, port, name).await?;
    }
    for rank in 1..=3 {
        let address = format!("Pawn_{rank}");
        declare(&mut host, &address)?;
    }
    host.register_rpc("Pawn_3", "Pawn", RpcEntry::declare("Only3", DispatchKind::ServerOnly, vec![]))?;

    // Player 1 leaves: players 2 and 3 shift down one rank.
    peers[0].disconnect()?;
    assert!(pump_until(&mut host, &mut peers, |h, _| h.session_info().players.len() == 3).await);

    let roster = host.session_info();
    assert_eq!(roster.by_index(2).map(|r| r.network_address.as_str()), Some("Pawn_1"));
    assert_eq!(roster.by_index(3).map(|r| r.network_address.as_str()), Some("Pawn_2"));
    assert!(host.registry().lookup("Pawn_2", "Pawn", "Only3").is_some());
    assert!(host.registry().lookup("Pawn_3", "Pawn", "Jump").is_none());
    assert_eq!(host.registry().len(), 3);
    assert_eq!(lock_game(&game).player_address(3).as_deref(), Some("Pawn_2"));

    // A newcomer takes index 1 and pushes them back up.
    assert_eq!(join(&mut host, &mut peers, kind, port, "four").await?, 1);
    let roster = host.session_info();
    assert_eq!(roster.by_index(1).map(|r| r.network_address.as_str()), Some("Pawn_1"));
    assert_eq!(roster.by_index(2).map(|r| r.network_address.as_str()), Some("Pawn_2"));
    assert_eq!(roster.by_index(3).map(|r| r.network_address.as_str()), Some("Pawn_3"));
    assert!(host.registry().lookup("Pawn_3", "Pawn", "Only3").is_some());
    assert!(host.registry().lookup("Pawn_2", "Pawn", "Jump").is_some());
    assert!(host.registry().lookup("Pawn_1", "Pawn", "Jump").is_none());

    assert!(host
        .drain_events()
        .iter()
        .any(|e| matches!(e, HostEvent::PlayerDisconnected { player, .. } if player.player_index == 1)));
    host.destroy_session()?;
    Ok(())
}
