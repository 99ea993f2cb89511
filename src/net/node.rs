// P2P node: WebSocket listener, per-peer tasks, gossip and recovery loops.
//
// One task per peer reads framed JSON messages; writes are serialised behind
// a bounded per-peer queue drained by a writer task, so a slow peer can never
// stall a handler. All shared state (chain, mempool, reputation, peer map)
// sits behind tokio locks — a panicking handler tears down its own
// connection and nothing else.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use colored::*;
use futures::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::Config;
use crate::consensus::chain::{AddOutcome, Blockchain};
use crate::net::mempool::Mempool;
use crate::net::protocol::{
    HandshakeAcceptedData, HandshakeData, HandshakeRejectedData, HealthStatusData, HeartbeatData,
    MessageValidator, PeerMessage,
};
use crate::net::reputation::{ReputationEvent, ReputationManager};
use crate::node::NodeIdentity;
use crate::now_ms;

pub const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REJECT_LINGER: Duration = Duration::from_secs(1);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SYNC_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const SEED_RECONNECT_INTERVAL: Duration = Duration::from_secs(60);
const REPUTATION_SAVE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const REPUTATION_DECAY_INTERVAL: Duration = Duration::from_secs(60 * 60);
const MEMPOOL_CLEANUP_INTERVAL: Duration = Duration::from_secs(2 * 60);
const MEMPOOL_MANAGEMENT_INTERVAL: Duration = Duration::from_secs(5 * 60);
const REPLAY_SWEEP_INTERVAL: Duration = Duration::from_secs(3 * 60);
const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

const RECOVERY_SPACING_MS: u64 = 120_000;
const MAX_RECOVERY_ATTEMPTS: u32 = 5;
const MEMPOOL_SYNC_SAMPLE: usize = 3;
const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    Handshaking,
    AuthPending,
    Authenticated,
    Rejected,
    Closing,
    Closed,
}

pub struct Peer {
    pub state: PeerState,
    pub outbound: mpsc::Sender<String>,
    pub is_outbound: bool,
    pub node_id: Option<String>,
    /// Advertised listening port — identifies seeds behind ephemeral client
    /// ports.
    pub listening_port: Option<u16>,
    pub connected_at: u64,
    pub last_seen: u64,
    /// host:port key used for reputation accounting.
    pub rep_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct PartitionStats {
    pub partitioned: bool,
    pub since: Option<u64>,
    pub partitions_detected: u64,
    pub recovery_attempts: u32,
    pub last_recovery_at: u64,
}

struct NodeInner {
    config: Config,
    identity: NodeIdentity,
    chain: Arc<RwLock<Blockchain>>,
    mempool: Arc<Mutex<Mempool>>,
    reputation: Arc<Mutex<ReputationManager>>,
    validator: Arc<MessageValidator>,
    peers: Mutex<HashMap<String, Peer>>,
    /// Everyone we know of (canonical host:port), connected or not.
    known_peers: Mutex<HashSet<String>>,
    partition: Mutex<PartitionStats>,
}

#[derive(Clone)]
pub struct P2pNode {
    inner: Arc<NodeInner>,
}

/// Normalise a socket address into a peer id. IPv6 loopback and IPv4-mapped
/// addresses collapse to their IPv4 form.
pub fn normalize_peer_addr(addr: &SocketAddr) -> String {
    let host = match addr.ip() {
        std::net::IpAddr::V4(v4) => v4.to_string(),
        std::net::IpAddr::V6(v6) => {
            if v6.is_loopback() {
                "127.0.0.1".to_string()
            } else if let Some(v4) = v6.to_ipv4_mapped() {
                v4.to_string()
            } else {
                v6.to_string()
            }
        }
    };
    format!("{host}:{}", addr.port())
}

/// Strip a ws:// seed URL down to host:port.
pub fn parse_seed_url(url: &str) -> Option<String> {
    let stripped = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"))
        .unwrap_or(url);
    let stripped = stripped.trim_end_matches('/');
    let (host, port) = stripped.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some(format!("{host}:{port}"))
}

fn host_of(peer_id: &str) -> &str {
    peer_id.rsplit_once(':').map(|(h, _)| h).unwrap_or(peer_id)
}

impl P2pNode {
    pub fn new(
        config: Config,
        identity: NodeIdentity,
        chain: Arc<RwLock<Blockchain>>,
        mempool: Arc<Mutex<Mempool>>,
        reputation: Arc<Mutex<ReputationManager>>,
    ) -> Self {
        let known: HashSet<String> = config
            .network
            .seed_nodes
            .iter()
            .filter_map(|s| parse_seed_url(s))
            .collect();
        P2pNode {
            inner: Arc::new(NodeInner {
                config,
                identity,
                chain,
                mempool,
                reputation,
                validator: Arc::new(MessageValidator::new()),
                peers: Mutex::new(HashMap::new()),
                known_peers: Mutex::new(known),
                partition: Mutex::new(PartitionStats::default()),
            }),
        }
    }

    pub fn validator(&self) -> &MessageValidator {
        &self.inner.validator
    }

    pub fn node_id(&self) -> &str {
        &self.inner.identity.node_id
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.peers.lock().await.len()
    }

    pub async fn authenticated_peer_count(&self) -> usize {
        self.inner
            .peers
            .lock()
            .await
            .values()
            .filter(|p| p.state == PeerState::Authenticated)
            .count()
    }

    pub async fn peer_summaries(&self) -> Vec<(String, String, bool)> {
        self.inner
            .peers
            .lock()
            .await
            .iter()
            .map(|(id, p)| (id.clone(), format!("{:?}", p.state), p.is_outbound))
            .collect()
    }

    pub async fn partition_stats(&self) -> PartitionStats {
        self.inner.partition.lock().await.clone()
    }

    pub async fn reset_partition_stats(&self) {
        *self.inner.partition.lock().await = PartitionStats::default();
    }

    pub async fn known_peer_count(&self) -> usize {
        self.inner.known_peers.lock().await.len()
    }

    /// Bind the IPv4 listener and run the accept loop. Spawns every
    /// background timer; resolves only on listener failure.
    pub async fn start(&self) -> std::io::Result<()> {
        let bind = format!("0.0.0.0:{}", self.inner.config.network.p2p_port);
        let listener = TcpListener::bind(&bind).await?;
        println!("{} listening on {bind}", "[p2p]".bright_green().bold());

        self.spawn_timers();
        self.connect_seeds().await;

        loop {
            let (stream, addr) = listener.accept().await?;
            let peer_id = normalize_peer_addr(&addr);

            let now = now_ms();
            {
                let mut reputation = self.inner.reputation.lock().await;
                if reputation.is_banned(&peer_id, now)
                    || reputation.is_banned_host(host_of(&peer_id), now)
                {
                    eprintln!(
                        "{} refusing banned peer {peer_id}",
                        "[p2p]".bright_red().bold()
                    );
                    continue;
                }
            }
            if self.inner.peers.lock().await.len() >= self.inner.config.network.max_peers {
                eprintln!(
                    "{} peer limit reached, refusing {peer_id}",
                    "[p2p]".yellow().bold()
                );
                continue;
            }

            let node = self.clone();
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => node.run_peer(ws, peer_id, false).await,
                    Err(e) => {
                        eprintln!("{} ws accept from {peer_id}: {e}", "[p2p]".yellow());
                    }
                }
            });
        }
    }

    /// Dial a peer at host:port.
    pub async fn connect_to(&self, peer_id: &str) -> Result<(), String> {
        if self.inner.peers.lock().await.contains_key(peer_id) {
            return Err("already connected".to_string());
        }
        let url = format!("ws://{peer_id}");
        let connect = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&url));
        match connect.await {
            Ok(Ok((ws, _))) => {
                self.inner
                    .known_peers
                    .lock()
                    .await
                    .insert(peer_id.to_string());
                let node = self.clone();
                let peer_id = peer_id.to_string();
                tokio::spawn(async move {
                    node.run_peer(ws, peer_id, true).await;
                });
                Ok(())
            }
            Ok(Err(e)) => Err(format!("connect failed: {e}")),
            Err(_) => Err("connect timed out".to_string()),
        }
    }

    /// Per-peer task: register, handshake, then pump messages until close.
    async fn run_peer<S>(
        &self,
        ws: tokio_tungstenite::WebSocketStream<S>,
        peer_id: String,
        is_outbound: bool,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

        let now = now_ms();
        {
            let mut peers = self.inner.peers.lock().await;
            peers.insert(
                peer_id.clone(),
                Peer {
                    state: PeerState::Handshaking,
                    outbound: out_tx.clone(),
                    is_outbound,
                    node_id: None,
                    listening_port: None,
                    connected_at: now,
                    last_seen: now,
                    rep_key: peer_id.clone(),
                },
            );
        }
        self.apply_reputation(&peer_id, ReputationEvent::Connect).await;

        // Writer half: the only task touching the sink.
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Both sides open with a HANDSHAKE.
        self.send_to_queue(
            &out_tx,
            &PeerMessage::Handshake(HandshakeData {
                network_id: self.inner.config.network.network_id.clone(),
                node_version: NODE_VERSION.to_string(),
                node_id: self.inner.identity.node_id.clone(),
                timestamp: now,
                listening_port: self.inner.config.network.p2p_port,
            }),
        )
        .await;

        let handshake_deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let authenticated = self.peer_state(&peer_id).await == Some(PeerState::Authenticated);

            let frame = if authenticated {
                stream.next().await
            } else {
                match tokio::time::timeout_at(handshake_deadline, stream.next()).await {
                    Ok(frame) => frame,
                    Err(_) => {
                        eprintln!(
                            "{} handshake timeout from {peer_id}",
                            "[p2p]".yellow().bold()
                        );
                        self.apply_reputation(&peer_id, ReputationEvent::BadBehavior).await;
                        break;
                    }
                }
            };

            let Some(Ok(message)) = frame else { break };
            let text = match message {
                WsMessage::Text(t) => t.to_string(),
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                _ => {
                    self.apply_reputation(&peer_id, ReputationEvent::InvalidMessage).await;
                    continue;
                }
            };

            let parsed = match self.inner.validator.validate(&text) {
                Ok(msg) => msg,
                Err(e) => {
                    eprintln!(
                        "{} invalid frame from {peer_id}: {e}",
                        "[p2p]".yellow().bold()
                    );
                    self.apply_reputation(&peer_id, ReputationEvent::InvalidMessage).await;
                    continue;
                }
            };

            if self.handle_message(&peer_id, &out_tx, parsed).await.is_break() {
                break;
            }
        }

        {
            let mut peers = self.inner.peers.lock().await;
            if let Some(peer) = peers.get_mut(&peer_id) {
                peer.state = PeerState::Closed;
            }
            peers.remove(&peer_id);
        }
        writer.abort();
        eprintln!("{} {peer_id} disconnected", "[p2p]".bright_black());
    }

    async fn peer_state(&self, peer_id: &str) -> Option<PeerState> {
        self.inner.peers.lock().await.get(peer_id).map(|p| p.state)
    }

    async fn set_peer_state(&self, peer_id: &str, state: PeerState) {
        if let Some(peer) = self.inner.peers.lock().await.get_mut(peer_id) {
            peer.state = state;
        }
    }

    async fn send_to_queue(&self, queue: &mpsc::Sender<String>, msg: &PeerMessage) {
        let _ = queue.send(msg.encode()).await;
    }

    async fn apply_reputation(&self, peer_id: &str, event: ReputationEvent) {
        let rep_key = self
            .inner
            .peers
            .lock()
            .await
            .get(peer_id)
            .map(|p| p.rep_key.clone())
            .unwrap_or_else(|| peer_id.to_string());
        self.inner
            .reputation
            .lock()
            .await
            .apply(&rep_key, event, now_ms());
    }

    /// Dispatch one validated message. Returns Break to close the peer.
    async fn handle_message(
        &self,
        peer_id: &str,
        reply: &mpsc::Sender<String>,
        message: PeerMessage,
    ) -> std::ops::ControlFlow<()> {
        use std::ops::ControlFlow;

        let authenticated = self.peer_state(peer_id).await == Some(PeerState::Authenticated);
        if message.is_sensitive() && !authenticated {
            eprintln!(
                "{} {} from unauthenticated {peer_id}",
                "[p2p]".yellow().bold(),
                message.type_name()
            );
            self.apply_reputation(peer_id, ReputationEvent::BadBehavior).await;
            return ControlFlow::Continue(());
        }
        self.apply_reputation(peer_id, ReputationEvent::MessageReceived).await;

        match message {
            PeerMessage::Handshake(data) => {
                let ours = &self.inner.config.network.network_id;
                if data.network_id != *ours {
                    eprintln!(
                        "{} network id mismatch from {peer_id}: {}",
                        "[p2p]".bright_red().bold(),
                        data.network_id
                    );
                    self.send_to_queue(
                        reply,
                        &PeerMessage::HandshakeRejected(HandshakeRejectedData {
                            expected: ours.clone(),
                            received: data.network_id,
                        }),
                    )
                    .await;
                    self.set_peer_state(peer_id, PeerState::Rejected).await;
                    self.apply_reputation(peer_id, ReputationEvent::BadBehavior).await;
                    tokio::time::sleep(REJECT_LINGER).await;
                    return ControlFlow::Break(());
                }

                // Canonicalise: a peer dialing from an ephemeral port is
                // reachable (and scored) at its advertised listening port.
                let canonical = format!("{}:{}", host_of(peer_id), data.listening_port);
                {
                    let mut peers = self.inner.peers.lock().await;
                    if let Some(peer) = peers.get_mut(peer_id) {
                        peer.state = PeerState::Authenticated;
                        peer.node_id = Some(data.node_id.clone());
                        peer.listening_port = Some(data.listening_port);
                        peer.rep_key = canonical.clone();
                        peer.last_seen = now_ms();
                    }
                }
                self.inner.known_peers.lock().await.insert(canonical);

                self.send_to_queue(
                    reply,
                    &PeerMessage::HandshakeAccepted(HandshakeAcceptedData {
                        network_id: ours.clone(),
                        node_id: self.inner.identity.node_id.clone(),
                        timestamp: now_ms(),
                    }),
                )
                .await;
                println!(
                    "{} handshake complete with {peer_id}",
                    "[p2p]".bright_green()
                );
                // Kick off sync with the fresh peer.
                self.send_to_queue(reply, &PeerMessage::QueryLatest {}).await;
                ControlFlow::Continue(())
            }
            PeerMessage::HandshakeAccepted(data) => {
                {
                    let mut peers = self.inner.peers.lock().await;
                    if let Some(peer) = peers.get_mut(peer_id) {
                        peer.state = PeerState::Authenticated;
                        if peer.node_id.is_none() {
                            peer.node_id = Some(data.node_id);
                        }
                    }
                }
                ControlFlow::Continue(())
            }
            PeerMessage::HandshakeRejected(data) => {
                eprintln!(
                    "{} rejected by {peer_id}: they expect network {}",
                    "[p2p]".bright_red().bold(),
                    data.expected
                );
                ControlFlow::Break(())
            }
            PeerMessage::HandshakeError { message } => {
                eprintln!("{} handshake error from {peer_id}: {message}", "[p2p]".yellow());
                ControlFlow::Break(())
            }
            PeerMessage::AuthChallenge { challenge } => {
                // Identity pinning is optional; we always answer.
                let signature = self.inner.identity.sign_challenge(&challenge);
                self.send_to_queue(
                    reply,
                    &PeerMessage::AuthResponse {
                        node_id: self.inner.identity.node_id.clone(),
                        signature,
                    },
                )
                .await;
                ControlFlow::Continue(())
            }
            PeerMessage::AuthResponse { .. } => {
                // We never demand the challenge flow; acknowledge and move on.
                self.send_to_queue(reply, &PeerMessage::AuthSuccess {}).await;
                ControlFlow::Continue(())
            }
            PeerMessage::AuthSuccess {} | PeerMessage::AuthFailure { .. } => {
                ControlFlow::Continue(())
            }
            PeerMessage::QueryLatest {} => {
                let tip = self.inner.chain.read().await.tip().clone();
                self.send_to_queue(
                    reply,
                    &PeerMessage::ResponseBlockchain { blocks: vec![tip] },
                )
                .await;
                ControlFlow::Continue(())
            }
            PeerMessage::QueryAll { from_index } => {
                // Bounded response; a longer chain syncs in tranches, the
                // requester advancing from_index as each tranche lands.
                let blocks = {
                    let chain = self.inner.chain.read().await;
                    let all = chain.blocks();
                    let cap = crate::net::protocol::MAX_BLOCKS_PER_MSG;
                    let start =
                        (from_index.unwrap_or(0) as usize).min(all.len().saturating_sub(1));
                    let end = start.saturating_add(cap).min(all.len());
                    all[start..end].to_vec()
                };
                self.send_to_queue(reply, &PeerMessage::ResponseBlockchain { blocks })
                    .await;
                ControlFlow::Continue(())
            }
            PeerMessage::ResponseBlockchain { blocks } => {
                self.handle_chain_response(peer_id, reply, blocks).await;
                ControlFlow::Continue(())
            }
            PeerMessage::QueryTransactionPool {} => {
                let transactions = self.inner.mempool.lock().await.all();
                self.send_to_queue(
                    reply,
                    &PeerMessage::ResponseTransactionPool { transactions },
                )
                .await;
                ControlFlow::Continue(())
            }
            PeerMessage::ResponseTransactionPool { transactions } => {
                for tx in transactions {
                    let _ = self.admit_transaction(tx, None).await;
                }
                ControlFlow::Continue(())
            }
            PeerMessage::NewBlock { block } => {
                self.handle_new_block(peer_id, block).await;
                ControlFlow::Continue(())
            }
            PeerMessage::NewTransaction { transaction } => {
                match self.admit_transaction(transaction.clone(), Some(peer_id)).await {
                    Ok(()) => {}
                    Err(e) => {
                        eprintln!(
                            "{} transaction from {peer_id} rejected: {e}",
                            "[p2p]".yellow().bold()
                        );
                    }
                }
                ControlFlow::Continue(())
            }
            PeerMessage::SeedNodeInfo(info) => {
                self.inner
                    .known_peers
                    .lock()
                    .await
                    .insert(format!("{}:{}", info.host, info.port));
                ControlFlow::Continue(())
            }
            PeerMessage::HealthStatus(_) => {
                self.apply_reputation(peer_id, ReputationEvent::Health).await;
                self.touch_peer(peer_id).await;
                ControlFlow::Continue(())
            }
            PeerMessage::RequestPeerList {} => {
                let peers: Vec<String> = self
                    .inner
                    .known_peers
                    .lock()
                    .await
                    .iter()
                    .take(crate::net::protocol::MAX_PEERS_PER_MSG)
                    .cloned()
                    .collect();
                self.send_to_queue(reply, &PeerMessage::PeerListResponse { peers })
                    .await;
                ControlFlow::Continue(())
            }
            PeerMessage::PeerListResponse { peers } => {
                let own_port = self.inner.config.network.p2p_port;
                let mut known = self.inner.known_peers.lock().await;
                for peer in peers {
                    // Never learn ourselves back.
                    if peer.ends_with(&format!(":{own_port}"))
                        && matches!(host_of(&peer), "127.0.0.1" | "localhost")
                    {
                        continue;
                    }
                    known.insert(peer);
                }
                drop(known);
                self.apply_reputation(peer_id, ReputationEvent::PeerList).await;
                ControlFlow::Continue(())
            }
            PeerMessage::Heartbeat(_) => {
                self.apply_reputation(peer_id, ReputationEvent::Heartbeat).await;
                self.touch_peer(peer_id).await;
                ControlFlow::Continue(())
            }
        }
    }

    async fn touch_peer(&self, peer_id: &str) {
        if let Some(peer) = self.inner.peers.lock().await.get_mut(peer_id) {
            peer.last_seen = now_ms();
        }
    }

    /// Validate and pool a transaction; rebroadcast on success.
    async fn admit_transaction(
        &self,
        tx: crate::primitives::transaction::Transaction,
        from_peer: Option<&str>,
    ) -> Result<(), crate::consensus::validate::TxError> {
        let result = {
            let chain = self.inner.chain.read().await;
            let mut mempool = self.inner.mempool.lock().await;
            if mempool.contains(&tx.id) || chain.find_transaction(&tx.id).is_some() {
                return Ok(()); // already known, nothing to do
            }
            mempool.submit(
                tx.clone(),
                chain.utxos(),
                chain.replay_registry(),
                now_ms(),
            )
        };
        match result {
            Ok(()) => {
                self.broadcast(&PeerMessage::NewTransaction { transaction: tx }, from_peer)
                    .await;
                Ok(())
            }
            Err(e) => {
                if let Some(peer) = from_peer {
                    self.apply_reputation(peer, ReputationEvent::BadBehavior).await;
                }
                Err(e)
            }
        }
    }

    async fn handle_new_block(&self, peer_id: &str, block: crate::primitives::block::Block) {
        let outcome = {
            let mut chain = self.inner.chain.write().await;
            chain.add_block(block.clone(), now_ms())
        };
        match outcome {
            Ok(AddOutcome::Appended) => {
                println!(
                    "{} accepted block {} from {peer_id}",
                    "[chain]".bright_cyan().bold(),
                    block.index
                );
                self.inner.mempool.lock().await.remove_confirmed(&block);
                self.broadcast(&PeerMessage::NewBlock { block }, Some(peer_id)).await;
            }
            Ok(AddOutcome::Reorganized { unwound }) => {
                println!(
                    "{} reorganised onto block {} from {peer_id}",
                    "[chain]".bright_cyan().bold(),
                    block.index
                );
                self.rebuild_mempool(unwound).await;
                self.broadcast(&PeerMessage::NewBlock { block }, Some(peer_id)).await;
            }
            Ok(AddOutcome::Orphaned) => {
                // Parent missing — ask the sender for the gap after our tip.
                let height = self.inner.chain.read().await.height();
                if let Some(peer) = self.inner.peers.lock().await.get(peer_id) {
                    let _ = peer.outbound.try_send(
                        PeerMessage::QueryAll {
                            from_index: Some(height + 1),
                        }
                        .encode(),
                    );
                }
            }
            Ok(AddOutcome::Duplicate) => {}
            Err(e) => {
                eprintln!(
                    "{} block {} from {peer_id} rejected: {e}",
                    "[p2p]".yellow().bold(),
                    block.index
                );
                self.apply_reputation(peer_id, ReputationEvent::BadBehavior).await;
            }
        }
    }

    /// RESPONSE_BLOCKCHAIN rules: extend if it links, replace if a chain
    /// from genesis arrived, otherwise request the tranche that should
    /// attach to our tip. Responses are capped, so catching up to a tall
    /// chain walks forward one tranche at a time.
    async fn handle_chain_response(
        &self,
        peer_id: &str,
        reply: &mpsc::Sender<String>,
        mut blocks: Vec<crate::primitives::block::Block>,
    ) {
        if blocks.is_empty() {
            return;
        }
        blocks.sort_by_key(|b| b.index);
        let their_tip_index = blocks.last().expect("nonempty").index;
        // A payload at the response cap says nothing about the sender's real
        // tip — assume there is more and keep pulling.
        let full_tranche = blocks.len() >= crate::net::protocol::MAX_BLOCKS_PER_MSG;

        let (our_tip_index, our_tip_hash) = {
            let chain = self.inner.chain.read().await;
            (chain.tip().index, chain.tip().hash.clone())
        };

        if their_tip_index <= our_tip_index {
            return; // nothing newer
        }

        // A run that attaches to our tip: apply in order.
        if blocks[0].previous_hash == our_tip_hash {
            if blocks.len() == 1 {
                self.handle_new_block(peer_id, blocks.pop().expect("nonempty")).await;
                self.apply_reputation(peer_id, ReputationEvent::SyncSuccess).await;
                return;
            }

            let applied = {
                let mut chain = self.inner.chain.write().await;
                let mut applied = 0usize;
                for block in &blocks {
                    match chain.add_block(block.clone(), now_ms()) {
                        Ok(AddOutcome::Appended)
                        | Ok(AddOutcome::Duplicate)
                        | Ok(AddOutcome::Reorganized { .. }) => applied += 1,
                        Ok(AddOutcome::Orphaned) | Err(_) => break,
                    }
                }
                applied
            };
            if applied == 0 {
                self.apply_reputation(peer_id, ReputationEvent::SyncFailure).await;
                return;
            }

            self.rebuild_mempool(Vec::new()).await;
            self.apply_reputation(peer_id, ReputationEvent::SyncSuccess).await;
            let new_tip = self.inner.chain.read().await.tip().clone();
            let new_height = new_tip.index;
            println!(
                "{} applied {applied} synced block(s) from {peer_id}, height now {new_height}",
                "[chain]".bright_cyan().bold()
            );
            self.broadcast(&PeerMessage::NewBlock { block: new_tip }, Some(peer_id))
                .await;
            if their_tip_index > new_height || full_tranche {
                // The peer is (or may be) still ahead; pull the next tranche.
                self.send_to_queue(
                    reply,
                    &PeerMessage::QueryAll {
                        from_index: Some(new_height + 1),
                    },
                )
                .await;
            }
            return;
        }

        if blocks[0].index == 0 {
            // A chain from genesis: attempt an atomic replacement. The
            // payload may be a capped prefix of a still-taller chain; the
            // follow-up tranche continues from the new tip.
            let result = {
                let mut chain = self.inner.chain.write().await;
                chain.replace_chain(blocks, now_ms())
            };
            match result {
                Ok(unwound) => {
                    let new_tip = self.inner.chain.read().await.tip().clone();
                    let new_height = new_tip.index;
                    println!(
                        "{} replaced chain from {peer_id}, new height {new_height}",
                        "[chain]".bright_cyan().bold()
                    );
                    self.rebuild_mempool(unwound).await;
                    self.apply_reputation(peer_id, ReputationEvent::SyncSuccess).await;
                    self.broadcast(&PeerMessage::NewBlock { block: new_tip }, Some(peer_id))
                        .await;
                    if their_tip_index > new_height || full_tranche {
                        self.send_to_queue(
                            reply,
                            &PeerMessage::QueryAll {
                                from_index: Some(new_height + 1),
                            },
                        )
                        .await;
                    }
                }
                Err(e) => {
                    eprintln!(
                        "{} chain from {peer_id} rejected: {e}",
                        "[p2p]".yellow().bold()
                    );
                    self.apply_reputation(peer_id, ReputationEvent::SyncFailure).await;
                }
            }
            return;
        }

        // Longer but non-contiguous: ask for the tranche that should attach
        // to our tip. If exactly that tranche just failed to link, the fork
        // is below our height and only a from-genesis pull can settle the
        // work comparison.
        let next_needed = our_tip_index + 1;
        let from_index = if blocks[0].index == next_needed {
            None
        } else {
            Some(next_needed)
        };
        self.send_to_queue(reply, &PeerMessage::QueryAll { from_index }).await;
    }

    /// After a reorg: re-validate displaced and drained transactions against
    /// the new state.
    async fn rebuild_mempool(&self, unwound: Vec<crate::primitives::transaction::Transaction>) {
        let chain = self.inner.chain.read().await;
        let mut mempool = self.inner.mempool.lock().await;
        let mut candidates = mempool.drain();
        candidates.extend(unwound);
        let now = now_ms();
        for tx in candidates {
            if chain.find_transaction(&tx.id).is_none() {
                let _ = mempool.submit(tx, chain.utxos(), chain.replay_registry(), now);
            }
        }
    }

    /// Send to every authenticated peer except `except`.
    pub async fn broadcast(&self, message: &PeerMessage, except: Option<&str>) {
        let frame = message.encode();
        let peers = self.inner.peers.lock().await;
        for (id, peer) in peers.iter() {
            if Some(id.as_str()) == except || peer.state != PeerState::Authenticated {
                continue;
            }
            let _ = peer.outbound.try_send(frame.clone());
        }
    }

    /// Gossip entry points for the miner and the HTTP API.
    pub async fn announce_block(&self, block: crate::primitives::block::Block) {
        self.broadcast(&PeerMessage::NewBlock { block }, None).await;
    }

    pub async fn announce_transaction(&self, tx: crate::primitives::transaction::Transaction) {
        self.broadcast(&PeerMessage::NewTransaction { transaction: tx }, None)
            .await;
    }

    /// Attempt connections to every configured seed that is not ourselves
    /// and not already connected.
    pub async fn connect_seeds(&self) {
        let own_port = self.inner.config.network.p2p_port;
        let seeds: Vec<String> = self
            .inner
            .config
            .network
            .seed_nodes
            .iter()
            .filter_map(|s| parse_seed_url(s))
            .filter(|s| {
                s.rsplit_once(':')
                    .and_then(|(_, p)| p.parse::<u16>().ok())
                    .is_none_or(|p| p != own_port)
            })
            .collect();

        let mut connected = 0usize;
        for seed in seeds {
            if connected >= self.inner.config.network.min_seed_connections.max(1) {
                break;
            }
            if self.inner.peers.lock().await.contains_key(&seed) {
                connected += 1;
                continue;
            }
            match self.connect_to(&seed).await {
                Ok(()) => {
                    println!("{} seed {seed} connected", "[p2p]".bright_green());
                    connected += 1;
                }
                Err(e) => {
                    eprintln!("{} seed {seed}: {e}", "[p2p]".yellow());
                }
            }
        }
    }

    fn spawn_timers(&self) {
        // Chain + mempool sync.
        {
            let node = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SYNC_INTERVAL);
                loop {
                    interval.tick().await;
                    node.sync_round().await;
                }
            });
        }
        // Heartbeats.
        {
            let node = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
                loop {
                    interval.tick().await;
                    let height = node.inner.chain.read().await.height();
                    node.broadcast(
                        &PeerMessage::Heartbeat(HeartbeatData {
                            node_id: node.inner.identity.node_id.clone(),
                            height,
                            timestamp: now_ms(),
                        }),
                        None,
                    )
                    .await;
                }
            });
        }
        // Seed reconnection.
        {
            let node = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SEED_RECONNECT_INTERVAL);
                loop {
                    interval.tick().await;
                    node.connect_seeds().await;
                }
            });
        }
        // Partition health.
        {
            let node = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(HEALTH_INTERVAL);
                loop {
                    interval.tick().await;
                    node.partition_check().await;
                }
            });
        }
        // Reputation decay + persistence.
        {
            let node = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(REPUTATION_DECAY_INTERVAL);
                loop {
                    interval.tick().await;
                    node.inner.reputation.lock().await.decay_all(now_ms());
                }
            });
        }
        {
            let node = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(REPUTATION_SAVE_INTERVAL);
                loop {
                    interval.tick().await;
                    if let Err(e) = node.inner.reputation.lock().await.save() {
                        eprintln!("{} reputation save failed: {e}", "[p2p]".bright_red());
                    }
                }
            });
        }
        // Mempool expiry + replay registry sweeps.
        {
            let node = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(MEMPOOL_CLEANUP_INTERVAL);
                loop {
                    interval.tick().await;
                    let dropped = node.inner.mempool.lock().await.cleanup(now_ms());
                    if dropped > 0 {
                        println!("{} dropped {dropped} expired tx", "[mempool]".bright_black());
                    }
                }
            });
        }
        {
            let node = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(REPLAY_SWEEP_INTERVAL);
                loop {
                    interval.tick().await;
                    node.inner
                        .chain
                        .write()
                        .await
                        .replay_registry_mut()
                        .cleanup(now_ms());
                }
            });
        }
        // Mempool management: re-validate the whole pool against the current
        // UTXO state, dropping anything a confirmed block invalidated.
        {
            let node = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(MEMPOOL_MANAGEMENT_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    node.rebuild_mempool(Vec::new()).await;
                }
            });
        }
        // Orphan candidate sweep.
        {
            let node = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(ORPHAN_SWEEP_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let swept = node.inner.chain.write().await.sweep_orphans();
                    if swept > 0 {
                        println!("{} swept {swept} stale orphan(s)", "[chain]".bright_black());
                    }
                }
            });
        }
    }

    /// Periodic sync: ask everyone for their tip, sample a few peers for
    /// their transaction pools.
    async fn sync_round(&self) {
        if self.authenticated_peer_count().await == 0 {
            return;
        }
        self.broadcast(&PeerMessage::QueryLatest {}, None).await;

        let sample: Vec<mpsc::Sender<String>> = {
            let peers = self.inner.peers.lock().await;
            let authenticated: Vec<&Peer> = peers
                .values()
                .filter(|p| p.state == PeerState::Authenticated)
                .collect();
            authenticated
                .choose_multiple(&mut rand::thread_rng(), MEMPOOL_SYNC_SAMPLE)
                .map(|p| p.outbound.clone())
                .collect()
        };
        for queue in sample {
            let _ = queue.try_send(PeerMessage::QueryTransactionPool {}.encode());
        }
    }

    /// 30 s health loop: detect a partition when fewer than half the known
    /// peers are connected, then walk the recovery ladder.
    async fn partition_check(&self) {
        let connected = self.authenticated_peer_count().await;
        let total_known = self.known_peer_count().await;
        let now = now_ms();

        let mut stats = self.inner.partition.lock().await;
        let healthy = total_known == 0 || connected * 2 >= total_known;

        if healthy {
            if stats.partitioned {
                println!(
                    "{} partition healed ({connected}/{total_known} peers)",
                    "[p2p]".bright_green().bold()
                );
            }
            stats.partitioned = false;
            stats.since = None;
            stats.recovery_attempts = 0;
            return;
        }

        if !stats.partitioned {
            stats.partitioned = true;
            stats.since = Some(now);
            stats.partitions_detected += 1;
            stats.recovery_attempts = 0;
            stats.last_recovery_at = 0;
            eprintln!(
                "{} partition detected: {connected}/{total_known} peers connected",
                "[p2p]".bright_red().bold()
            );
        }

        if stats.recovery_attempts >= MAX_RECOVERY_ATTEMPTS
            || now.saturating_sub(stats.last_recovery_at) < RECOVERY_SPACING_MS
        {
            return;
        }
        stats.recovery_attempts += 1;
        stats.last_recovery_at = now;
        let attempt = stats.recovery_attempts;
        drop(stats);

        self.run_recovery_strategy(attempt).await;
    }

    /// Escalating recovery ladder, one strategy per attempt.
    async fn run_recovery_strategy(&self, attempt: u32) {
        println!(
            "{} partition recovery attempt {attempt}",
            "[p2p]".yellow().bold()
        );
        match attempt {
            1 => self.connect_seeds().await,
            2 => {
                let height = self.inner.chain.read().await.height();
                self.broadcast(
                    &PeerMessage::HealthStatus(HealthStatusData {
                        node_id: self.inner.identity.node_id.clone(),
                        height,
                        peer_count: self.peer_count().await,
                        timestamp: now_ms(),
                    }),
                    None,
                )
                .await;
            }
            3 => self.broadcast(&PeerMessage::RequestPeerList {}, None).await,
            _ => {
                // Force a full resync.
                self.broadcast(&PeerMessage::QueryLatest {}, None).await;
                self.broadcast(&PeerMessage::QueryTransactionPool {}, None).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ipv6_loopback() {
        let addr: SocketAddr = "[::1]:22000".parse().unwrap();
        assert_eq!(normalize_peer_addr(&addr), "127.0.0.1:22000");
    }

    #[test]
    fn test_normalize_ipv4_mapped() {
        let addr: SocketAddr = "[::ffff:10.1.2.3]:9000".parse().unwrap();
        assert_eq!(normalize_peer_addr(&addr), "10.1.2.3:9000");
    }

    #[test]
    fn test_normalize_plain_ipv4() {
        let addr: SocketAddr = "192.168.1.5:1234".parse().unwrap();
        assert_eq!(normalize_peer_addr(&addr), "192.168.1.5:1234");
    }

    #[test]
    fn test_parse_seed_url() {
        assert_eq!(
            parse_seed_url("ws://seed1.pastella.io:22000"),
            Some("seed1.pastella.io:22000".to_string())
        );
        assert_eq!(
            parse_seed_url("127.0.0.1:9000"),
            Some("127.0.0.1:9000".to_string())
        );
        assert_eq!(parse_seed_url("ws://nohost"), None);
        assert_eq!(parse_seed_url("ws://:22000"), None);
        assert_eq!(parse_seed_url("ws://host:notaport"), None);
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("10.0.0.1:22000"), "10.0.0.1");
        assert_eq!(host_of("bare"), "bare");
    }
}
