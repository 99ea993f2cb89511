// Wire protocol — every frame is a UTF-8 JSON object `{type, data}`.
//
// The message set is closed: anything outside it is a validation error and
// costs the sender reputation. Decoding runs through the central validator,
// which enforces the frame size cap and per-variant shape limits before a
// message reaches any handler, and counts rejections per error kind.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::primitives::block::Block;
use crate::primitives::transaction::Transaction;

/// Frames above this size are rejected unread.
pub const MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;
/// Hard caps on collection payloads — untrusted input must not drive
/// allocation.
pub const MAX_BLOCKS_PER_MSG: usize = 5_000;
pub const MAX_TXS_PER_MSG: usize = 10_000;
pub const MAX_PEERS_PER_MSG: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeData {
    pub network_id: String,
    pub node_version: String,
    pub node_id: String,
    pub timestamp: u64,
    pub listening_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAcceptedData {
    pub network_id: String,
    pub node_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRejectedData {
    pub expected: String,
    pub received: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatusData {
    pub node_id: String,
    pub height: u64,
    pub peer_count: usize,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub node_id: String,
    pub height: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedNodeInfoData {
    pub host: String,
    pub port: u16,
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PeerMessage {
    #[serde(rename = "HANDSHAKE")]
    Handshake(HandshakeData),
    #[serde(rename = "HANDSHAKE_ACCEPTED")]
    HandshakeAccepted(HandshakeAcceptedData),
    #[serde(rename = "HANDSHAKE_REJECTED")]
    HandshakeRejected(HandshakeRejectedData),
    #[serde(rename = "HANDSHAKE_ERROR")]
    HandshakeError { message: String },
    #[serde(rename = "AUTH_CHALLENGE")]
    AuthChallenge { challenge: String },
    #[serde(rename = "AUTH_RESPONSE")]
    AuthResponse { node_id: String, signature: String },
    #[serde(rename = "AUTH_SUCCESS")]
    AuthSuccess {},
    #[serde(rename = "AUTH_FAILURE")]
    AuthFailure { reason: String },
    #[serde(rename = "QUERY_LATEST")]
    QueryLatest {},
    #[serde(rename = "QUERY_ALL")]
    QueryAll {
        /// First block index wanted. Absent requests from genesis; replies
        /// are capped, so a tall chain is fetched tranche by tranche.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_index: Option<u64>,
    },
    #[serde(rename = "RESPONSE_BLOCKCHAIN")]
    ResponseBlockchain { blocks: Vec<Block> },
    #[serde(rename = "QUERY_TRANSACTION_POOL")]
    QueryTransactionPool {},
    #[serde(rename = "RESPONSE_TRANSACTION_POOL")]
    ResponseTransactionPool { transactions: Vec<Transaction> },
    #[serde(rename = "NEW_BLOCK")]
    NewBlock { block: Block },
    #[serde(rename = "NEW_TRANSACTION")]
    NewTransaction { transaction: Transaction },
    #[serde(rename = "SEED_NODE_INFO")]
    SeedNodeInfo(SeedNodeInfoData),
    #[serde(rename = "HEALTH_STATUS")]
    HealthStatus(HealthStatusData),
    #[serde(rename = "REQUEST_PEER_LIST")]
    RequestPeerList {},
    #[serde(rename = "PEER_LIST_RESPONSE")]
    PeerListResponse { peers: Vec<String> },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat(HeartbeatData),
}

impl PeerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            PeerMessage::Handshake(_) => "HANDSHAKE",
            PeerMessage::HandshakeAccepted(_) => "HANDSHAKE_ACCEPTED",
            PeerMessage::HandshakeRejected(_) => "HANDSHAKE_REJECTED",
            PeerMessage::HandshakeError { .. } => "HANDSHAKE_ERROR",
            PeerMessage::AuthChallenge { .. } => "AUTH_CHALLENGE",
            PeerMessage::AuthResponse { .. } => "AUTH_RESPONSE",
            PeerMessage::AuthSuccess {} => "AUTH_SUCCESS",
            PeerMessage::AuthFailure { .. } => "AUTH_FAILURE",
            PeerMessage::QueryLatest {} => "QUERY_LATEST",
            PeerMessage::QueryAll { .. } => "QUERY_ALL",
            PeerMessage::ResponseBlockchain { .. } => "RESPONSE_BLOCKCHAIN",
            PeerMessage::QueryTransactionPool {} => "QUERY_TRANSACTION_POOL",
            PeerMessage::ResponseTransactionPool { .. } => "RESPONSE_TRANSACTION_POOL",
            PeerMessage::NewBlock { .. } => "NEW_BLOCK",
            PeerMessage::NewTransaction { .. } => "NEW_TRANSACTION",
            PeerMessage::SeedNodeInfo(_) => "SEED_NODE_INFO",
            PeerMessage::HealthStatus(_) => "HEALTH_STATUS",
            PeerMessage::RequestPeerList {} => "REQUEST_PEER_LIST",
            PeerMessage::PeerListResponse { .. } => "PEER_LIST_RESPONSE",
            PeerMessage::Heartbeat(_) => "HEARTBEAT",
        }
    }

    /// Message types only an authenticated peer may send.
    pub fn is_sensitive(&self) -> bool {
        matches!(
            self,
            PeerMessage::NewBlock { .. }
                | PeerMessage::NewTransaction { .. }
                | PeerMessage::ResponseBlockchain { .. }
                | PeerMessage::ResponseTransactionPool { .. }
        )
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("peer messages always serialize")
    }
}

const KNOWN_TYPES: &[&str] = &[
    "HANDSHAKE",
    "HANDSHAKE_ACCEPTED",
    "HANDSHAKE_REJECTED",
    "HANDSHAKE_ERROR",
    "AUTH_CHALLENGE",
    "AUTH_RESPONSE",
    "AUTH_SUCCESS",
    "AUTH_FAILURE",
    "QUERY_LATEST",
    "QUERY_ALL",
    "RESPONSE_BLOCKCHAIN",
    "QUERY_TRANSACTION_POOL",
    "RESPONSE_TRANSACTION_POOL",
    "NEW_BLOCK",
    "NEW_TRANSACTION",
    "SEED_NODE_INFO",
    "HEALTH_STATUS",
    "REQUEST_PEER_LIST",
    "PEER_LIST_RESPONSE",
    "HEARTBEAT",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("frame exceeds {MAX_FRAME_BYTES} bytes")]
    TooLarge,
    #[error("frame is not valid JSON")]
    MalformedJson,
    #[error("frame lacks a string `type` field")]
    MissingType,
    #[error("unknown message type")]
    UnknownType,
    #[error("payload shape invalid for its type")]
    InvalidPayload,
    #[error("collection payload exceeds cap: {0}")]
    OversizedCollection(&'static str),
}

impl MessageError {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageError::TooLarge => "too_large",
            MessageError::MalformedJson => "malformed_json",
            MessageError::MissingType => "missing_type",
            MessageError::UnknownType => "unknown_type",
            MessageError::InvalidPayload => "invalid_payload",
            MessageError::OversizedCollection(_) => "oversized_collection",
        }
    }
}

/// Central inbound-message validator. One per node, shared by all peer
/// tasks; rejection counters feed the observability endpoint.
#[derive(Default)]
pub struct MessageValidator {
    rejections: Mutex<HashMap<&'static str, u64>>,
    accepted: Mutex<u64>,
}

impl MessageValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self, raw: &str) -> Result<PeerMessage, MessageError> {
        let result = self.validate_inner(raw);
        match &result {
            Ok(_) => *self.accepted.lock().unwrap() += 1,
            Err(e) => {
                *self.rejections.lock().unwrap().entry(e.kind()).or_insert(0) += 1;
            }
        }
        result
    }

    fn validate_inner(&self, raw: &str) -> Result<PeerMessage, MessageError> {
        if raw.len() > MAX_FRAME_BYTES {
            return Err(MessageError::TooLarge);
        }
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|_| MessageError::MalformedJson)?;
        let Some(type_name) = value.get("type").and_then(|t| t.as_str()) else {
            return Err(MessageError::MissingType);
        };
        if !KNOWN_TYPES.contains(&type_name) {
            return Err(MessageError::UnknownType);
        }

        let message: PeerMessage =
            serde_json::from_value(value).map_err(|_| MessageError::InvalidPayload)?;

        match &message {
            PeerMessage::ResponseBlockchain { blocks } if blocks.len() > MAX_BLOCKS_PER_MSG => {
                return Err(MessageError::OversizedCollection("blocks"));
            }
            PeerMessage::ResponseTransactionPool { transactions }
                if transactions.len() > MAX_TXS_PER_MSG =>
            {
                return Err(MessageError::OversizedCollection("transactions"));
            }
            PeerMessage::PeerListResponse { peers } if peers.len() > MAX_PEERS_PER_MSG => {
                return Err(MessageError::OversizedCollection("peers"));
            }
            _ => {}
        }
        Ok(message)
    }

    /// (accepted, rejections-per-kind) snapshot.
    pub fn stats(&self) -> (u64, HashMap<&'static str, u64>) {
        (
            *self.accepted.lock().unwrap(),
            self.rejections.lock().unwrap().clone(),
        )
    }

    pub fn reset(&self) {
        *self.accepted.lock().unwrap() = 0;
        self.rejections.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: PeerMessage) -> PeerMessage {
        let validator = MessageValidator::new();
        validator.validate(&msg.encode()).expect("decode failed")
    }

    #[test]
    fn test_handshake_roundtrip() {
        let msg = PeerMessage::Handshake(HandshakeData {
            network_id: "pastella-mainnet".into(),
            node_version: "1.0.0".into(),
            node_id: "ab".repeat(32),
            timestamp: 1_700_000_000_000,
            listening_port: 22000,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_wire_shape_is_type_data() {
        let msg = PeerMessage::QueryLatest {};
        let value: serde_json::Value = serde_json::from_str(&msg.encode()).unwrap();
        assert_eq!(value.get("type").unwrap(), "QUERY_LATEST");
        assert!(value.get("data").is_some());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let validator = MessageValidator::new();
        let err = validator
            .validate(r#"{"type":"TELEPORT","data":{}}"#)
            .unwrap_err();
        assert_eq!(err, MessageError::UnknownType);
    }

    #[test]
    fn test_missing_type_rejected() {
        let validator = MessageValidator::new();
        assert_eq!(
            validator.validate(r#"{"data":{}}"#).unwrap_err(),
            MessageError::MissingType
        );
        assert_eq!(
            validator.validate(r#"{"type":42,"data":{}}"#).unwrap_err(),
            MessageError::MissingType
        );
    }

    #[test]
    fn test_wrong_payload_shape_rejected() {
        let validator = MessageValidator::new();
        let err = validator
            .validate(r#"{"type":"HANDSHAKE","data":{"network_id":7}}"#)
            .unwrap_err();
        assert_eq!(err, MessageError::InvalidPayload);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let validator = MessageValidator::new();
        let huge = format!(
            r#"{{"type":"HANDSHAKE_ERROR","data":{{"message":"{}"}}}}"#,
            "x".repeat(MAX_FRAME_BYTES)
        );
        assert_eq!(validator.validate(&huge).unwrap_err(), MessageError::TooLarge);
    }

    #[test]
    fn test_oversized_peer_list_rejected() {
        let validator = MessageValidator::new();
        let peers: Vec<String> = (0..=MAX_PEERS_PER_MSG)
            .map(|i| format!("10.0.0.{i}:22000"))
            .collect();
        let msg = PeerMessage::PeerListResponse { peers }.encode();
        assert!(matches!(
            validator.validate(&msg).unwrap_err(),
            MessageError::OversizedCollection("peers")
        ));
    }

    #[test]
    fn test_rejection_counters() {
        let validator = MessageValidator::new();
        let _ = validator.validate("not json");
        let _ = validator.validate("not json either");
        let _ = validator.validate(r#"{"type":"NOPE","data":{}}"#);
        let _ = validator.validate(&PeerMessage::QueryAll { from_index: None }.encode());

        let (accepted, rejections) = validator.stats();
        assert_eq!(accepted, 1);
        assert_eq!(rejections.get("malformed_json"), Some(&2));
        assert_eq!(rejections.get("unknown_type"), Some(&1));

        validator.reset();
        let (accepted, rejections) = validator.stats();
        assert_eq!(accepted, 0);
        assert!(rejections.is_empty());
    }

    #[test]
    fn test_query_all_range_roundtrip() {
        let validator = MessageValidator::new();

        // Bare form: no range field on the wire, decodes to from-genesis.
        let bare = validator
            .validate(r#"{"type":"QUERY_ALL","data":{}}"#)
            .unwrap();
        assert_eq!(bare, PeerMessage::QueryAll { from_index: None });

        let ranged = PeerMessage::QueryAll {
            from_index: Some(5_000),
        };
        assert_eq!(validator.validate(&ranged.encode()).unwrap(), ranged);
    }

    #[test]
    fn test_sensitive_classification() {
        assert!(
            PeerMessage::NewTransaction {
                transaction: crate::primitives::transaction::Transaction::coinbase(
                    "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2",
                    1,
                    0,
                    "n".into(),
                    0,
                    crate::primitives::transaction::TxTag::Coinbase,
                )
            }
            .is_sensitive()
        );
        assert!(!PeerMessage::QueryLatest {}.is_sensitive());
        assert!(!PeerMessage::Heartbeat(HeartbeatData {
            node_id: String::new(),
            height: 0,
            timestamp: 0,
        })
        .is_sensitive());
    }

    #[test]
    fn test_every_known_type_is_closed_set() {
        assert_eq!(KNOWN_TYPES.len(), 20);
    }
}
