//! Swarm: keeps a [`Peer`] connected to a bounded pool of remotes.
//!
//! The swarm owns one agent peer, dials the configured seed addresses on
//! start, and whenever a connection closes schedules a delayed redial of
//! candidate addresses until the pool is back at `max_peers`. Addresses
//! advertised by remotes through `PeerCandidate` instructions join the
//! candidate list.

use crate::config::{PeerConfig, SwarmConfig};
use crate::error::WireError;
use crate::events::PeerEvent;
use crate::identity::{Identity, StateSource};
use crate::peer::Peer;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Swarm {
    config: SwarmConfig,
    agent: Arc<Peer>,
    /// Seed addresses followed by learned candidates, without repeats.
    candidates: Mutex<Vec<String>>,
    /// One pending redial per address.
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl Swarm {
    pub fn new(
        config: SwarmConfig,
        identity: Arc<dyn Identity>,
        state: Arc<dyn StateSource>,
    ) -> Arc<Self> {
        let agent_config = PeerConfig {
            max_connections: config.max_peers,
            ..config.agent.clone()
        };
        let agent = Peer::new(agent_config, identity, state);
        let mut candidates = Vec::with_capacity(config.peers.len());
        for address in &config.peers {
            if !candidates.contains(address) {
                candidates.push(address.clone());
            }
        }
        Arc::new(Self {
            config,
            agent,
            candidates: Mutex::new(candidates),
            timers: Mutex::new(HashMap::new()),
            event_task: Mutex::new(None),
        })
    }

    pub fn agent(&self) -> &Arc<Peer> {
        &self.agent
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Start the agent, begin watching its events, and dial every seed.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, WireError> {
        // Subscribe first so the agent's Ready event is not missed.
        let events = self.agent.subscribe();
        let local_addr = self.agent.start().await?;

        let handle = tokio::spawn(event_loop(Arc::downgrade(self), events));
        if let Some(previous) = lock(&self.event_task).replace(handle) {
            previous.abort();
        }

        info!(
            "Swarm: started on {} with {} seeds (max_peers={})",
            local_addr,
            self.config.peers.len(),
            self.config.max_peers
        );

        for address in self.config.peers.clone() {
            let agent = Arc::clone(&self.agent);
            tokio::spawn(async move {
                agent.connect(&address).await;
            });
        }

        Ok(local_addr)
    }

    /// Cancel timers and the event task, then stop the agent.
    pub fn stop(&self) {
        for (_, timer) in lock(&self.timers).drain() {
            timer.abort();
        }
        if let Some(task) = lock(&self.event_task).take() {
            task.abort();
        }
        self.agent.stop();
        info!("Swarm: stopped");
    }

    /// Add an address to the candidate list. Returns `false` if it was
    /// already there.
    pub fn add_candidate(&self, address: &str) -> bool {
        let mut candidates = lock(&self.candidates);
        if candidates.iter().any(|c| c == address) {
            return false;
        }
        candidates.push(address.to_string());
        true
    }

    pub fn candidates(&self) -> Vec<String> {
        lock(&self.candidates).clone()
    }

    /// Addresses with a redial scheduled.
    pub fn pending_reconnects(&self) -> Vec<String> {
        let mut pending: Vec<String> = lock(&self.timers)
            .iter()
            .filter(|(_, timer)| !timer.is_finished())
            .map(|(address, _)| address.clone())
            .collect();
        pending.sort();
        pending
    }

    /// Schedule redials for candidate addresses until open connections plus
    /// pending redials reach `max_peers`. Returns the newly scheduled
    /// addresses.
    pub fn fill_peer_slots(self: &Arc<Self>) -> Vec<String> {
        let pending: HashSet<String> = self.pending_reconnects().into_iter().collect();
        let open = self.agent.connection_count();
        let slots = self
            .config
            .max_peers
            .saturating_sub(open + pending.len());
        if slots == 0 {
            debug!("Swarm: no free peer slots ({} open, {} pending)", open, pending.len());
            return Vec::new();
        }

        let known = self.known_addresses();
        let chosen: Vec<String> = self
            .candidates()
            .into_iter()
            .filter(|address| !known.contains(address) && !pending.contains(address))
            .take(slots)
            .collect();

        chosen
            .into_iter()
            .filter(|address| self.schedule_reconnect(address))
            .collect()
    }

    /// Schedule one redial of `address` after the reconnect delay.
    ///
    /// Returns `false` if a redial for it is already pending.
    pub fn schedule_reconnect(self: &Arc<Self>, address: &str) -> bool {
        let mut timers = lock(&self.timers);
        if timers.get(address).is_some_and(|t| !t.is_finished()) {
            return false;
        }

        let delay = self.config.reconnect_delay();
        let swarm = Arc::downgrade(self);
        let target = address.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(swarm) = swarm.upgrade() else {
                return;
            };
            lock(&swarm.timers).remove(&target);
            debug!("Swarm: redialing {}", target);
            swarm.agent.connect(&target).await;
        });
        timers.insert(address.to_string(), handle);
        debug!("Swarm: redial of {} in {:?}", address, delay);
        true
    }

    /// Drop a pending redial. Returns `true` if one was cancelled.
    pub fn cancel_reconnect(&self, address: &str) -> bool {
        match lock(&self.timers).remove(address) {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    fn refill(self: &Arc<Self>) {
        let scheduled = self.fill_peer_slots();
        if !scheduled.is_empty() {
            info!("Swarm: scheduled {} redials", scheduled.len());
        }
    }

    fn known_addresses(&self) -> HashSet<String> {
        let mut known = self.agent.registry().connected_addresses();
        known.extend(self.agent.connections().into_iter().map(|c| c.address));
        known
    }

    fn handle_event(self: &Arc<Self>, event: PeerEvent) {
        debug!("Swarm: {} event", event.name());
        match event {
            PeerEvent::Ready { id, address } => {
                info!("Swarm: agent {} ready on {}", id, address);
            }
            PeerEvent::Peer(record) => {
                info!("Swarm: new peer {} at {}", record.id, record.address);
                self.cancel_reconnect(&record.address);
            }
            PeerEvent::ConnectionOpen { address, .. } => {
                self.cancel_reconnect(&address);
            }
            PeerEvent::ConnectionClose { address } => {
                debug!(
                    "Swarm: lost connection to {} ({} peers connected)",
                    address,
                    self.agent.registry().connected_count()
                );
                self.refill();
            }
            // A refused or reset dial never opens, so no close follows it.
            PeerEvent::ConnectionError { address, error } => {
                debug!("Swarm: connection to {} failed: {}", address, error);
                self.refill();
            }
            PeerEvent::PeerCandidate { address } => {
                if self.add_candidate(&address) {
                    debug!("Swarm: learned candidate {}", address);
                    self.fill_peer_slots();
                }
            }
            _ => {}
        }
    }
}

async fn event_loop(swarm: Weak<Swarm>, mut events: broadcast::Receiver<PeerEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                let Some(swarm) = swarm.upgrade() else {
                    break;
                };
                warn!("Swarm: event stream lagged, skipped {} events", skipped);
                swarm.fill_peer_slots();
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(swarm) = swarm.upgrade() else {
            break;
        };
        swarm.handle_event(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
