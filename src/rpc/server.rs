// HTTP JSON admin API — a thin shim over the core.
//
// Hand-routed hyper service: every endpoint reads or mutates node state
// through the same locks the P2P layer uses, and errors surface as their
// taxonomy kind string plus a 4xx/5xx status. Mutating network endpoints
// are API-key protected; when api.host is non-loopback the key is mandatory
// (enforced at config validation).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use colored::*;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::config::Config;
use crate::consensus::chain::{AddOutcome, Blockchain, ChainError};
use crate::miner::Miner;
use crate::net::mempool::Mempool;
use crate::net::node::P2pNode;
use crate::net::reputation::ReputationManager;
use crate::now_ms;
use crate::primitives::block::Block;
use crate::primitives::transaction::Transaction;

pub struct RpcState {
    pub config: Config,
    pub chain: Arc<RwLock<Blockchain>>,
    pub mempool: Arc<Mutex<Mempool>>,
    pub reputation: Arc<Mutex<ReputationManager>>,
    pub node: Option<P2pNode>,
    pub miner: Option<Arc<Miner>>,
    pub started_at: u64,
    pub shutdown: Arc<Notify>,
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response builder")
}

fn error_response(status: StatusCode, kind: &str, detail: impl ToString) -> Response<Full<Bytes>> {
    json_response(
        status,
        json!({ "error": kind, "detail": detail.to_string() }),
    )
}

fn not_found() -> Response<Full<Bytes>> {
    error_response(StatusCode::NOT_FOUND, "NotFound", "no such resource")
}

/// HTTP status for a chain-engine rejection.
fn chain_error_status(err: &ChainError) -> StatusCode {
    match err {
        ChainError::OrphanBlock => StatusCode::ACCEPTED,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
}

impl RpcState {
    fn authorized(&self, req: &Request<Incoming>) -> bool {
        match self.config.api.api_key.as_deref() {
            None | Some("") => true,
            Some(expected) => req
                .headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(|got| got == expected)
                .unwrap_or(false),
        }
    }
}

pub async fn start_api_server(state: Arc<RpcState>, port: u16) -> std::io::Result<()> {
    let host = state.config.api.host.clone();
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    println!("{} API listening on {addr}", "[api]".bright_magenta().bold());

    let shutdown = state.shutdown.clone();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.notified() => return Ok(()),
        };
        let Ok((stream, remote)) = accepted else {
            continue;
        };
        let state = state.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(state.clone(), req, remote));
            let io = TokioIo::new(stream);
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                eprintln!("{} connection error: {e}", "[api]".yellow());
            }
        });
    }
}

async fn handle_request(
    state: Arc<RpcState>,
    req: Request<Incoming>,
    _remote: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());

    let response = route(&state, req, &method, &path, query.as_deref()).await;
    Ok(response)
}

async fn route(
    state: &Arc<RpcState>,
    req: Request<Incoming>,
    method: &Method,
    path: &str,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method.as_str(), segments.as_slice()) {
        ("GET", ["api", "blockchain", "status"]) => blockchain_status(state).await,
        ("GET", ["api", "blockchain", "blocks"]) => list_blocks(state, query).await,
        ("GET", ["api", "blockchain", "blocks", index]) => {
            match index.parse::<u64>() {
                Ok(index) => block_by_index(state, index).await,
                Err(_) => error_response(StatusCode::BAD_REQUEST, "InvalidRequest", "bad index"),
            }
        }
        ("GET", ["api", "blockchain", "latest"]) => {
            let tip = state.chain.read().await.tip().clone();
            json_response(StatusCode::OK, json!({ "block": tip }))
        }
        ("GET", ["api", "blockchain", "transactions"]) => {
            let pending = state.mempool.lock().await.all();
            json_response(
                StatusCode::OK,
                json!({ "count": pending.len(), "transactions": pending }),
            )
        }
        ("GET", ["api", "blockchain", "transactions", id]) => {
            transaction_by_id(state, id).await
        }
        ("POST", ["api", "blockchain", "transactions"]) => {
            submit_transaction(state, req).await
        }
        ("GET", ["api", "blockchain", "address", addr, "balance"]) => {
            let chain = state.chain.read().await;
            let balance = chain.utxos().balance_of(addr);
            json_response(
                StatusCode::OK,
                json!({ "address": addr, "balance": balance }),
            )
        }
        ("GET", ["api", "blockchain", "address", addr, "utxos"]) => {
            let chain = state.chain.read().await;
            let outputs: Vec<Value> = chain
                .utxos()
                .outputs_of(addr)
                .into_iter()
                .map(|(outpoint, utxo)| {
                    json!({
                        "txId": outpoint.tx_id,
                        "outputIndex": outpoint.output_index,
                        "address": utxo.address,
                        "amount": utxo.amount,
                        "heightCreated": utxo.height_created,
                    })
                })
                .collect();
            json_response(StatusCode::OK, json!({ "address": addr, "utxos": outputs }))
        }
        ("POST", ["api", "blocks", "submit"]) => submit_block(state, req).await,
        ("GET", ["api", "blocks", "pending"]) => pending_block(state).await,
        ("POST", ["api", "blocks", "validate"]) => validate_block(state, req).await,
        ("GET", ["api", "network", "status"]) => network_status(state).await,
        ("GET", ["api", "network", "peers"]) => {
            let peers = match &state.node {
                Some(node) => node.peer_summaries().await,
                None => Vec::new(),
            };
            let body: Vec<Value> = peers
                .into_iter()
                .map(|(id, peer_state, outbound)| {
                    json!({ "peer": id, "state": peer_state, "outbound": outbound })
                })
                .collect();
            json_response(StatusCode::OK, json!({ "peers": body }))
        }
        ("GET", ["api", "network", "reputation"]) => {
            let reputation = state.reputation.lock().await;
            json_response(StatusCode::OK, json!({ "peers": reputation.snapshot() }))
        }
        ("GET", ["api", "network", "partition-stats"]) => {
            let stats = match &state.node {
                Some(node) => node.partition_stats().await,
                None => Default::default(),
            };
            json_response(
                StatusCode::OK,
                json!({
                    "partitioned": stats.partitioned,
                    "since": stats.since,
                    "partitionsDetected": stats.partitions_detected,
                    "recoveryAttempts": stats.recovery_attempts,
                }),
            )
        }
        ("GET", ["api", "network", "message-validation"]) => {
            let (accepted, rejections) = match &state.node {
                Some(node) => node.validator().stats(),
                None => (0, Default::default()),
            };
            json_response(
                StatusCode::OK,
                json!({ "accepted": accepted, "rejections": rejections }),
            )
        }
        ("POST", ["api", "network", "connect"]) => {
            if !state.authorized(&req) {
                return error_response(StatusCode::UNAUTHORIZED, "Unauthorized", "bad api key");
            }
            connect_peer(state, req).await
        }
        ("POST", ["api", "network", "partition-reset"]) => {
            if !state.authorized(&req) {
                return error_response(StatusCode::UNAUTHORIZED, "Unauthorized", "bad api key");
            }
            if let Some(node) = &state.node {
                node.reset_partition_stats().await;
            }
            json_response(StatusCode::OK, json!({ "status": "reset" }))
        }
        ("POST", ["api", "network", "message-validation", "reset"]) => {
            if !state.authorized(&req) {
                return error_response(StatusCode::UNAUTHORIZED, "Unauthorized", "bad api key");
            }
            if let Some(node) = &state.node {
                node.validator().reset();
            }
            json_response(StatusCode::OK, json!({ "status": "reset" }))
        }
        ("GET", ["api", "health"]) => {
            let height = state.chain.read().await.height();
            let peers = match &state.node {
                Some(node) => node.peer_count().await,
                None => 0,
            };
            json_response(
                StatusCode::OK,
                json!({ "status": "ok", "height": height, "peers": peers }),
            )
        }
        ("GET", ["api", "info"]) => {
            json_response(
                StatusCode::OK,
                json!({
                    "version": crate::net::node::NODE_VERSION,
                    "networkId": state.config.network.network_id,
                    "decimals": state.config.decimals(),
                    "blockTime": state.config.blockchain.block_time,
                    "difficultyAlgorithm": state.config.blockchain.difficulty_algorithm,
                    "defaultFee": state.config.wallet.default_fee,
                    "minFee": state.config.wallet.min_fee,
                }),
            )
        }
        ("GET", ["api", "daemon", "status"]) => {
            let (hashrate, blocks_found, mining) = match &state.miner {
                Some(miner) => (miner.hashrate(), miner.blocks_found(), true),
                None => (0, 0, false),
            };
            json_response(
                StatusCode::OK,
                json!({
                    "uptimeMs": now_ms().saturating_sub(state.started_at),
                    "mining": mining,
                    "hashrate": hashrate,
                    "blocksFound": blocks_found,
                }),
            )
        }
        ("POST", ["api", "daemon", "stop"]) => {
            if !state.authorized(&req) {
                return error_response(StatusCode::UNAUTHORIZED, "Unauthorized", "bad api key");
            }
            state.shutdown.notify_waiters();
            json_response(StatusCode::OK, json!({ "status": "stopping" }))
        }
        _ => not_found(),
    }
}

async fn blockchain_status(state: &Arc<RpcState>) -> Response<Full<Bytes>> {
    let chain = state.chain.read().await;
    json_response(
        StatusCode::OK,
        json!({
            "height": chain.height(),
            "tipHash": chain.tip().hash,
            "cumulativeWork": chain.cumulative_work().to_string(),
            "nextDifficulty": chain.expected_difficulty(),
            "utxoCount": chain.utxos().len(),
            "orphanCount": chain.orphan_count(),
            "networkId": chain.params().network_id,
        }),
    )
}

async fn list_blocks(state: &Arc<RpcState>, query: Option<&str>) -> Response<Full<Bytes>> {
    let offset: u64 = query_param(query, "offset")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let limit: usize = query_param(query, "limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(50)
        .min(500);

    let chain = state.chain.read().await;
    let blocks: Vec<Block> = chain
        .blocks()
        .iter()
        .skip(offset as usize)
        .take(limit)
        .cloned()
        .collect();
    json_response(
        StatusCode::OK,
        json!({ "height": chain.height(), "blocks": blocks }),
    )
}

async fn block_by_index(state: &Arc<RpcState>, index: u64) -> Response<Full<Bytes>> {
    let chain = state.chain.read().await;
    match chain.block_by_index(index) {
        Some(block) => json_response(StatusCode::OK, json!({ "block": block })),
        None => not_found(),
    }
}

async fn transaction_by_id(state: &Arc<RpcState>, id: &str) -> Response<Full<Bytes>> {
    {
        let chain = state.chain.read().await;
        if let Some((tx, height)) = chain.find_transaction(id) {
            return json_response(
                StatusCode::OK,
                json!({ "transaction": tx, "blockIndex": height, "confirmed": true }),
            );
        }
    }
    let mempool = state.mempool.lock().await;
    match mempool.get(id) {
        Some(tx) => json_response(
            StatusCode::OK,
            json!({ "transaction": tx, "confirmed": false }),
        ),
        None => not_found(),
    }
}

async fn read_json_body(req: Request<Incoming>) -> Result<Value, Response<Full<Bytes>>> {
    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "InvalidRequest",
                "unreadable body",
            ));
        }
    };
    serde_json::from_slice(&bytes).map_err(|e| {
        error_response(StatusCode::BAD_REQUEST, "InvalidRequest", format!("bad json: {e}"))
    })
}

async fn submit_transaction(
    state: &Arc<RpcState>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let body = match read_json_body(req).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    // Accept either a bare transaction object or { "transaction": {...} }.
    let tx_value = body.get("transaction").cloned().unwrap_or(body);
    let tx: Transaction = match serde_json::from_value(tx_value) {
        Ok(tx) => tx,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "InvalidTransaction",
                format!("bad transaction: {e}"),
            );
        }
    };

    let result = {
        let chain = state.chain.read().await;
        let mut mempool = state.mempool.lock().await;
        mempool.submit(tx.clone(), chain.utxos(), chain.replay_registry(), now_ms())
    };
    match result {
        Ok(()) => {
            if let Some(node) = &state.node {
                node.announce_transaction(tx.clone()).await;
            }
            json_response(StatusCode::OK, json!({ "status": "accepted", "id": tx.id }))
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.kind(), e),
    }
}

async fn submit_block(state: &Arc<RpcState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body = match read_json_body(req).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let block_value = body.get("block").cloned().unwrap_or(body);
    let block: Block = match serde_json::from_value(block_value) {
        Ok(block) => block,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "InvalidBlock",
                format!("bad block: {e}"),
            );
        }
    };

    let outcome = {
        let mut chain = state.chain.write().await;
        chain.add_block(block.clone(), now_ms())
    };
    match outcome {
        Ok(AddOutcome::Appended) | Ok(AddOutcome::Reorganized { .. }) => {
            state.mempool.lock().await.remove_confirmed(&block);
            if let Some(node) = &state.node {
                node.announce_block(block.clone()).await;
            }
            json_response(
                StatusCode::OK,
                json!({ "status": "accepted", "index": block.index, "hash": block.hash }),
            )
        }
        Ok(AddOutcome::Duplicate) => {
            json_response(StatusCode::OK, json!({ "status": "duplicate" }))
        }
        Ok(AddOutcome::Orphaned) => {
            json_response(StatusCode::ACCEPTED, json!({ "status": "orphaned" }))
        }
        Err(e) => error_response(chain_error_status(&e), e.kind(), e),
    }
}

async fn pending_block(state: &Arc<RpcState>) -> Response<Full<Bytes>> {
    let chain = state.chain.read().await;
    let mempool = state.mempool.lock().await;
    let miner_address = state
        .config
        .blockchain
        .genesis
        .premine_address
        .clone();
    let template = crate::miner::miner::build_candidate(&chain, &mempool, &miner_address, now_ms());
    json_response(StatusCode::OK, json!({ "template": template }))
}

async fn validate_block(state: &Arc<RpcState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body = match read_json_body(req).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let block_value = body.get("block").cloned().unwrap_or(body);
    let block: Block = match serde_json::from_value(block_value) {
        Ok(block) => block,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "InvalidBlock",
                format!("bad block: {e}"),
            );
        }
    };

    let chain = state.chain.read().await;
    match chain.validate_candidate(&block, now_ms()) {
        Ok(()) => json_response(StatusCode::OK, json!({ "valid": true })),
        Err(e) => json_response(
            StatusCode::OK,
            json!({ "valid": false, "error": e.kind(), "detail": e.to_string() }),
        ),
    }
}

async fn network_status(state: &Arc<RpcState>) -> Response<Full<Bytes>> {
    match &state.node {
        Some(node) => {
            let stats = node.partition_stats().await;
            json_response(
                StatusCode::OK,
                json!({
                    "nodeId": node.node_id(),
                    "peerCount": node.peer_count().await,
                    "authenticatedPeers": node.authenticated_peer_count().await,
                    "knownPeers": node.known_peer_count().await,
                    "partitioned": stats.partitioned,
                    "networkId": state.config.network.network_id,
                }),
            )
        }
        None => json_response(
            StatusCode::OK,
            json!({ "peerCount": 0, "networkId": state.config.network.network_id, "p2p": "disabled" }),
        ),
    }
}

async fn connect_peer(state: &Arc<RpcState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body = match read_json_body(req).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(peer) = body.get("peer").and_then(|p| p.as_str()) else {
        return error_response(StatusCode::BAD_REQUEST, "InvalidRequest", "missing peer");
    };
    let Some(node) = &state.node else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "P2pDisabled", "p2p is off");
    };
    match node.connect_to(peer).await {
        Ok(()) => json_response(StatusCode::OK, json!({ "status": "connecting", "peer": peer })),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, "ConnectFailed", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param(Some("offset=10&limit=5"), "limit"),
            Some("5".to_string())
        );
        assert_eq!(query_param(Some("offset=10"), "limit"), None);
        assert_eq!(query_param(None, "limit"), None);
    }

    #[test]
    fn test_chain_error_status_mapping() {
        assert_eq!(
            chain_error_status(&ChainError::OrphanBlock),
            StatusCode::ACCEPTED
        );
        assert_eq!(
            chain_error_status(&ChainError::ChainLinkBroken),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_error_response_carries_kind() {
        let resp = error_response(StatusCode::BAD_REQUEST, "DoubleSpend", "spent twice");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
