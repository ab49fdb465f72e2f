//! Networked commands: run a swarm node, or fire a single message.

use crate::ui;
use fabric_wire::{
    load_config, EmptyState, LocalIdentity, Message, Peer, PeerConfig, PeerEvent, Swarm,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to start async runtime: {e}"));
            std::process::exit(1);
        }
    }
}

fn identity_for(id: Option<String>) -> LocalIdentity {
    id.map(LocalIdentity::new)
        .unwrap_or_else(LocalIdentity::generate)
}

pub fn cmd_start(
    config: Option<PathBuf>,
    listen: Option<String>,
    peers: Vec<String>,
    id: Option<String>,
) {
    let mut config = load_config(config.as_deref()).network;
    if let Some(listen) = listen {
        config.agent.listen_addr = listen;
    }
    config.peers.extend(peers);
    let identity = identity_for(id.or_else(|| config.agent.id.clone()));

    ui::banner();
    ui::blank();

    let rt = runtime();
    rt.block_on(async {
        let swarm = Swarm::new(config, Arc::new(identity), Arc::new(EmptyState));
        let mut events = swarm.agent().subscribe();
        let local_addr = match swarm.start().await {
            Ok(addr) => addr,
            Err(e) => {
                ui::error_with_fix(
                    &format!("Failed to start node: {e}"),
                    "Check that the listen address is free, or pass --listen",
                );
                std::process::exit(1);
            }
        };

        ui::success("Node started");
        ui::kv("Id", &swarm.agent().id());
        ui::kv("Listening", &local_addr.to_string());
        ui::kv("Seeds", &swarm.config().peers.len().to_string());
        ui::kv("Max peers", &swarm.config().max_peers.to_string());
        ui::blank();
        ui::hint("Press Ctrl+C to stop");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Ok(event) => print_event(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        ui::event_warn(&format!("skipped {n} events"));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        ui::blank();
        let registry = swarm.agent().registry();
        ui::section("Peers");
        for record in registry.connected_peers() {
            ui::kv(&record.id, &record.address);
        }
        ui::kv("Known", &registry.total_count().to_string());
        swarm.stop();
        ui::success("Node stopped");
    });
}

pub fn cmd_send(peer: &str, kind: &str, payload: &str, wait_ms: u64) {
    let message = match Message::from_vector(kind, payload.to_string()) {
        Ok(message) => message,
        Err(e) => {
            ui::error(&format!("Cannot encode message: {e}"));
            std::process::exit(1);
        }
    };

    let rt = runtime();
    rt.block_on(async {
        let node = Peer::new(
            PeerConfig::default(),
            Arc::new(LocalIdentity::generate()),
            Arc::new(EmptyState),
        );
        let mut events = node.subscribe();

        match node.try_connect(peer).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                ui::error(&format!("Could not connect to {peer}"));
                std::process::exit(1);
            }
            Err(e) => {
                ui::error_with_fix(
                    &format!("Could not connect to {peer}: {e}"),
                    "Is a node running there? Start one with `fabric start`",
                );
                std::process::exit(1);
            }
        }

        let deadline = tokio::time::sleep(Duration::from_millis(wait_ms));
        tokio::pin!(deadline);

        let mut handshake = false;
        while !handshake {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        handshake = matches!(event, PeerEvent::Peer(_));
                        print_event(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        if !handshake {
            ui::event_warn(&format!("no handshake from {peer} within {wait_ms} ms, sending anyway"));
        }

        node.broadcast(&message);
        ui::success(&format!("Sent {} {}", message.kind(), message.id()));

        let deadline = tokio::time::sleep(Duration::from_millis(wait_ms));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => match event {
                    Ok(event) => print_event(&event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        node.stop();
    });
}

fn print_event(event: &PeerEvent) {
    match event {
        PeerEvent::Peer(record) => {
            ui::event_ok(&format!("peer {} at {}", record.id, record.address));
        }
        PeerEvent::PeerCandidate { address } => {
            ui::kv("Candidate", address);
        }
        PeerEvent::Message { address, message } => {
            let body = message
                .payload_str()
                .map(str::to_string)
                .unwrap_or_else(|_| hex::encode(message.payload()));
            ui::kv(&message.kind().to_string(), &format!("{body} (from {address})"));
        }
        PeerEvent::CollectionPost { address, body } => {
            ui::kv("Post", &format!("{body} (from {address})"));
        }
        PeerEvent::State { address, kind, body } => {
            let body = serde_json::to_string(body).unwrap_or_default();
            ui::kv(&kind.to_string(), &format!("{body} (from {address})"));
        }
        PeerEvent::ConnectionOpen {
            address, initiator, ..
        } => {
            let side = if *initiator { "outbound" } else { "inbound" };
            ui::event_ok(&format!("connected {address} ({side})"));
        }
        PeerEvent::ConnectionClose { address } => {
            ui::event_warn(&format!("disconnected {address}"));
        }
        PeerEvent::ConnectionError { address, error } => {
            ui::event_fail(&format!("{address}: {error}"));
        }
        PeerEvent::Ready { .. } | PeerEvent::SessionUpdate { .. } | PeerEvent::SocketData { .. } => {}
    }
}
