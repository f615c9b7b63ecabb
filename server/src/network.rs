//! Hub network layer: UDP protocol handling and the tick loop driving the
//! admission queue and restart coordinator

use crate::admission::{AdmissionQueue, TransferDecision};
use crate::client_manager::ClientManager;
use crate::config::{HealthSettings, HubConfig};
use crate::error::TransferError;
use crate::ledger::SubjectId;
use crate::notify::{self, NotificationSink};
use crate::registry::BackendRegistry;
use crate::restart::RestartCoordinator;
use bincode::{deserialize, serialize, serialized_size};
use log::{debug, error, info, warn};
use shared::{now_millis, Packet, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    ClientTimeout {
        client_id: SubjectId,
    },
    #[allow(dead_code)]
    Shutdown,
}

/// Messages sent from the main loop to the network sender
#[derive(Debug)]
pub enum Outbound {
    SendPacket { packet: Packet, addr: SocketAddr },
    /// Addressed by player id, resolved when the packet is actually sent
    ToClient { client_id: SubjectId, packet: Packet },
}

/// Fire-and-forget notification delivery through the outbound channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    fn push(&self, client_id: SubjectId, packet: Packet) {
        if self.tx.send(Outbound::ToClient { client_id, packet }).is_err() {
            debug!("Dropping notice for client {}: sender stopped", client_id);
        }
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, subject: SubjectId, message: &str) {
        self.push(
            subject,
            Packet::Notice {
                message: message.to_string(),
            },
        );
    }

    fn show_progress(&self, subject: SubjectId, text: &str) {
        self.push(
            subject,
            Packet::Progress {
                text: text.to_string(),
            },
        );
    }

    fn clear_progress(&self, subject: SubjectId) {
        self.push(subject, Packet::ClearProgress);
    }
}

/// Runtime knobs that come from the command line rather than the hub file
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub tick_duration: Duration,
    pub max_clients: usize,
    pub client_timeout: Duration,
    /// How long a sent transfer can still be reported as failed
    pub transfer_grace: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            tick_duration: Duration::from_millis(50),
            max_clients: 500,
            client_timeout: Duration::from_secs(10),
            transfer_grace: Duration::from_secs(15),
        }
    }
}

struct PendingTransfer {
    decision: TransferDecision,
    sent_at: Instant,
}

/// The hub: one UDP socket serving players and backend agents
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    restarts: Arc<RwLock<RestartCoordinator>>,
    queue: AdmissionQueue<ChannelSink>,
    registry: BackendRegistry,
    pending_transfers: HashMap<SubjectId, PendingTransfer>,
    options: ServerOptions,
    health: HealthSettings,
    sweep_interval: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    out_tx: mpsc::UnboundedSender<Outbound>,
    out_rx: mpsc::UnboundedReceiver<Outbound>,
}

impl Server {
    pub async fn new(
        addr: &str,
        config: &HubConfig,
        options: ServerOptions,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Hub listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let registry = BackendRegistry::from_config(&config.backends, config.health.failure_threshold);
        let mut restarts = RestartCoordinator::new(config.restart.policy());
        if config.restart.restrict_to_backends {
            restarts = restarts.with_roster(config.backends.iter().map(|b| b.id.clone()));
        }
        let queue = AdmissionQueue::new(config.admission, ChannelSink::new(out_tx.clone()));

        info!(
            "Tracking {} backends, {} reserved slots for {} and above",
            registry.len(),
            config.admission.reserved_slots,
            config.admission.admin_threshold
        );

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(
                options.max_clients,
                options.client_timeout,
            ))),
            restarts: Arc::new(RwLock::new(restarts)),
            queue,
            registry,
            pending_transfers: HashMap::new(),
            options,
            health: config.health,
            sweep_interval: config.restart.sweep_interval(),
            server_tx,
            server_rx,
            out_tx,
            out_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Shared handle to the restart coordinator, for monitoring
    pub fn restart_coordinator(&self) -> Arc<RwLock<RestartCoordinator>> {
        Arc::clone(&self.restarts)
    }

    /// Spawns task that continuously listens for incoming packets
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_PACKET_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes the outgoing packet queue
    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut out_rx = std::mem::replace(&mut self.out_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let (packet, addr) = match message {
                    Outbound::SendPacket { packet, addr } => (packet, addr),
                    Outbound::ToClient { client_id, packet } => {
                        let addr = {
                            let clients_guard = clients.read().await;
                            clients_guard.addr_of(client_id)
                        };
                        match addr {
                            Some(addr) => (packet, addr),
                            None => {
                                debug!("Client {} is gone, dropping packet", client_id);
                                continue;
                            }
                        }
                    }
                };

                if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                }
            }
        });
    }

    /// Spawns task that monitors client timeouts
    async fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for client_id in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client_id }) {
                        error!("Failed to send timeout message: {}", e);
                        break;
                    }
                }
            }
        });
    }

    /// Spawns the restart watchdog, independent of request traffic
    async fn spawn_restart_watchdog(&self) {
        let restarts = Arc::clone(&self.restarts);
        let period = self.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                let report = {
                    let mut coordinator = restarts.write().await;
                    coordinator.sweep(now_millis())
                };

                if !report.is_empty() {
                    info!(
                        "Restart sweep: expired {:?}, recovered {:?}, promoted {:?}",
                        report.expired, report.recovered, report.promoted
                    );
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.out_tx.send(Outbound::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    async fn client_id_for(&self, addr: SocketAddr) -> Option<SubjectId> {
        let mut clients = self.clients.write().await;
        let client_id = clients.find_client_by_addr(addr)?;
        clients.touch(client_id);
        Some(client_id)
    }

    /// Processes one incoming packet
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect { client_version } => {
                if client_version != PROTOCOL_VERSION {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: format!(
                                "Protocol version {} is not supported, expected {}",
                                client_version, PROTOCOL_VERSION
                            ),
                        },
                        addr,
                    );
                    return;
                }

                let client_id = {
                    let mut clients = self.clients.write().await;
                    if let Some(existing_id) = clients.find_client_by_addr(addr) {
                        info!("Removing existing client {} from {}", existing_id, addr);
                        clients.remove_client(&existing_id);
                    }
                    clients.add_client(addr)
                };

                match client_id {
                    Some(client_id) => self.send_packet(Packet::Connected { client_id }, addr),
                    None => self.send_packet(
                        Packet::Disconnected {
                            reason: "Hub full".to_string(),
                        },
                        addr,
                    ),
                }
            }

            Packet::JoinQueue { target, rank } => {
                let Some(client_id) = self.client_id_for(addr).await else {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "Connect before joining a queue".to_string(),
                        },
                        addr,
                    );
                    return;
                };

                self.pending_transfers.remove(&client_id);
                self.queue
                    .enqueue(client_id, rank, &target, now_millis(), &self.registry);
            }

            Packet::LeaveQueue => {
                if let Some(client_id) = self.client_id_for(addr).await {
                    self.queue.remove(client_id);
                }
            }

            Packet::QueryPosition => {
                let Some(client_id) = self.client_id_for(addr).await else {
                    return;
                };
                let live = self.clients.read().await.live_ids();
                let position = self.queue.position(client_id, &live);
                self.send_packet(
                    Packet::QueuePosition {
                        position,
                        size: self.queue.size(),
                    },
                    addr,
                );
            }

            Packet::TransferFailed { reason } => {
                let Some(client_id) = self.client_id_for(addr).await else {
                    return;
                };
                match self.pending_transfers.remove(&client_id) {
                    Some(pending) => {
                        let live = self.clients.read().await.live_ids();
                        self.queue.requeue_failed(
                            pending.decision,
                            &TransferError::Rejected { reason },
                            &live,
                        );
                    }
                    None => warn!(
                        "Client {} reported a failed transfer that is not pending",
                        client_id
                    ),
                }
            }

            Packet::Heartbeat => {
                self.client_id_for(addr).await;
            }

            Packet::Disconnect => {
                let client_id = {
                    let mut clients = self.clients.write().await;
                    let client_id = clients.find_client_by_addr(addr);
                    if let Some(client_id) = client_id {
                        clients.remove_client(&client_id);
                    }
                    client_id
                };

                if let Some(client_id) = client_id {
                    self.queue.remove(client_id);
                    self.pending_transfers.remove(&client_id);
                }
            }

            Packet::StatusReport {
                server,
                current_count,
                max_count,
            } => {
                self.registry
                    .record_report(&server, current_count, max_count, now_millis());
            }

            Packet::RestartRequest { server } => {
                let decision = {
                    let mut restarts = self.restarts.write().await;
                    restarts.request_restart(&server, now_millis())
                };
                debug!("Restart request from {} ({}): {:?}", server, addr, decision);
                self.send_packet(Packet::RestartResponse { server, decision }, addr);
            }

            Packet::RestartComplete { server } => {
                let result = {
                    let mut restarts = self.restarts.write().await;
                    restarts.notify_restart_complete(&server, now_millis())
                };
                let (accepted, reason) = match result {
                    Ok(()) => (true, None),
                    Err(e) => (false, Some(e.to_string())),
                };
                self.send_packet(
                    Packet::RestartAck {
                        server,
                        accepted,
                        reason,
                    },
                    addr,
                );
            }

            Packet::UnauthorizedRestart { server } => {
                {
                    let mut restarts = self.restarts.write().await;
                    restarts.notify_unauthorized_restart(&server, now_millis());
                }
                self.send_packet(
                    Packet::RestartAck {
                        server,
                        accepted: true,
                        reason: Some("recorded as unauthorized, cooldown applies".to_string()),
                    },
                    addr,
                );
            }

            Packet::StateQuery => {
                let state = self.restarts.read().await.get_state();
                let reply = Packet::StateSnapshot { state };
                match serialized_size(&reply) {
                    Ok(size) if size <= MAX_PACKET_SIZE as u64 => self.send_packet(reply, addr),
                    Ok(size) => {
                        warn!("Restart state is {} bytes, too large for one datagram", size);
                        self.send_packet(
                            Packet::StateUnavailable {
                                reason: format!(
                                    "state is {} bytes, limit is {}",
                                    size, MAX_PACKET_SIZE
                                ),
                            },
                            addr,
                        );
                    }
                    Err(e) => {
                        error!("Failed to size restart state: {}", e);
                        self.send_packet(
                            Packet::StateUnavailable {
                                reason: e.to_string(),
                            },
                            addr,
                        );
                    }
                }
            }

            _ => {
                warn!("Unexpected packet type from {}", addr);
            }
        }
    }

    /// One reconciliation pass; at most one player is sent per tick
    async fn reconcile_queue(&mut self) {
        if self.queue.size() == 0 {
            return;
        }

        let live = self.clients.read().await.live_ids();
        let snapshot = self.registry.snapshot();
        let decisions = self.queue.reconcile(now_millis(), &snapshot, &live);

        for decision in decisions {
            let subject = decision.subject();
            let addr = self.clients.read().await.addr_of(subject);

            match addr {
                Some(addr) => {
                    self.queue
                        .sink()
                        .notify(subject, &notify::sending_message(&decision.backend_id));
                    self.send_packet(
                        Packet::Transfer {
                            backend: decision.backend_id.clone(),
                            address: decision.address.clone(),
                        },
                        addr,
                    );
                    self.pending_transfers.insert(
                        subject,
                        PendingTransfer {
                            decision,
                            sent_at: Instant::now(),
                        },
                    );
                }
                None => {
                    let live = self.clients.read().await.live_ids();
                    self.queue
                        .requeue_failed(decision, &TransferError::SubjectGone, &live);
                }
            }
        }
    }

    /// Transfers not reported as failed within the grace period are done
    fn expire_pending_transfers(&mut self) {
        let grace = self.options.transfer_grace;
        self.pending_transfers
            .retain(|_, pending| pending.sent_at.elapsed() <= grace);
    }

    fn check_backend_health(&mut self) {
        let offline = self
            .registry
            .sweep_stale(now_millis(), self.health.report_timeout());
        for id in offline {
            warn!("Backend {} stopped reporting, players stay queued", id);
        }
    }

    /// Main hub loop
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;
        self.spawn_restart_watchdog().await;

        let mut tick_interval = interval(self.options.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut health_interval = interval(self.health.check_interval());
        let mut tick: u64 = 0;

        info!("Hub started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { client_id }) => {
                            // The queue entry goes on the next reconciliation
                            self.pending_transfers.remove(&client_id);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Hub shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    tick += 1;
                    self.reconcile_queue().await;
                    self.expire_pending_transfers();

                    if tick % 200 == 0 && self.queue.size() > 0 {
                        debug!(
                            "Tick {}: {} queued, {} transfers pending",
                            tick,
                            self.queue.size(),
                            self.pending_transfers.len()
                        );
                    }
                },

                _ = health_interval.tick() => {
                    self.check_backend_health();
                },
            }
        }

        Ok(())
    }
}
