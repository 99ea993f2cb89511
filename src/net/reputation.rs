// Peer reputation.
//
// Every peer (keyed host:port) carries a score in [-1000, +1000], adjusted
// per behavior event and decayed toward the initial value daily. Dropping
// to -500 earns a 24 h ban; banned addresses are refused at accept time.
// A rolling log of recent deltas feeds manipulation detection: five or more
// rapid or sign-alternating changes within a minute flag the peer.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const INITIAL_SCORE: i64 = 100;
pub const MIN_SCORE: i64 = -1000;
pub const MAX_SCORE: i64 = 1000;
pub const BAN_THRESHOLD: i64 = -500;
pub const BAN_DURATION_MS: u64 = 24 * 60 * 60 * 1000;
/// Daily decay rate toward the initial score, percent.
pub const DECAY_PCT_PER_DAY: i64 = 5;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;
const MANIPULATION_WINDOW_MS: u64 = 60_000;
const MANIPULATION_MIN_EVENTS: usize = 5;
const RECENT_LOG_CAP: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationEvent {
    Connect,
    GoodBehavior,
    Heartbeat,
    Health,
    PeerList,
    MessageReceived,
    SyncSuccess,
    SyncFailure,
    InvalidMessage,
    BadBehavior,
}

impl ReputationEvent {
    pub fn delta(self) -> i64 {
        match self {
            ReputationEvent::Connect => 5,
            ReputationEvent::GoodBehavior
            | ReputationEvent::Heartbeat
            | ReputationEvent::Health
            | ReputationEvent::PeerList => 10,
            ReputationEvent::MessageReceived => 1,
            ReputationEvent::SyncSuccess => 15,
            ReputationEvent::SyncFailure => -5,
            ReputationEvent::InvalidMessage => -10,
            ReputationEvent::BadBehavior => -20,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ReputationEvent::Connect => "connect",
            ReputationEvent::GoodBehavior => "good_behavior",
            ReputationEvent::Heartbeat => "heartbeat",
            ReputationEvent::Health => "health",
            ReputationEvent::PeerList => "peer_list",
            ReputationEvent::MessageReceived => "message_received",
            ReputationEvent::SyncSuccess => "sync_success",
            ReputationEvent::SyncFailure => "sync_failure",
            ReputationEvent::InvalidMessage => "invalid_message",
            ReputationEvent::BadBehavior => "bad_behavior",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub score: i64,
    pub banned_until: Option<u64>,
    pub counters: HashMap<String, u64>,
    /// Rolling (timestamp, delta) log, newest last.
    #[serde(default)]
    pub recent: VecDeque<(u64, i64)>,
    #[serde(default)]
    pub manipulation_flagged: bool,
    #[serde(default)]
    pub last_decay: u64,
}

impl PeerRecord {
    fn new(now_ms: u64) -> Self {
        PeerRecord {
            score: INITIAL_SCORE,
            banned_until: None,
            counters: HashMap::new(),
            recent: VecDeque::new(),
            manipulation_flagged: false,
            last_decay: now_ms,
        }
    }
}

pub struct ReputationManager {
    records: HashMap<String, PeerRecord>,
    path: PathBuf,
}

impl ReputationManager {
    /// Load the persisted map, or start empty when the file is absent or
    /// unreadable (a corrupt reputation file is not worth dying for).
    pub fn open(path: &Path) -> Self {
        let records = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        ReputationManager {
            records,
            path: path.to_path_buf(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn score_of(&self, peer: &str) -> i64 {
        self.records
            .get(peer)
            .map(|r| r.score)
            .unwrap_or(INITIAL_SCORE)
    }

    pub fn record(&self, peer: &str) -> Option<&PeerRecord> {
        self.records.get(peer)
    }

    pub fn snapshot(&self) -> &HashMap<String, PeerRecord> {
        &self.records
    }

    /// Apply one behavior event and return the resulting score.
    pub fn apply(&mut self, peer: &str, event: ReputationEvent, now_ms: u64) -> i64 {
        let record = self
            .records
            .entry(peer.to_string())
            .or_insert_with(|| PeerRecord::new(now_ms));

        let delta = event.delta();
        record.score = (record.score + delta).clamp(MIN_SCORE, MAX_SCORE);
        *record.counters.entry(event.name().to_string()).or_insert(0) += 1;

        record.recent.push_back((now_ms, delta));
        while record.recent.len() > RECENT_LOG_CAP {
            record.recent.pop_front();
        }
        Self::detect_manipulation(record, now_ms);

        if record.score <= BAN_THRESHOLD && record.banned_until.is_none() {
            record.banned_until = Some(now_ms + BAN_DURATION_MS);
        }
        record.score
    }

    fn detect_manipulation(record: &mut PeerRecord, now_ms: u64) {
        let window: Vec<i64> = record
            .recent
            .iter()
            .filter(|(ts, _)| now_ms.saturating_sub(*ts) <= MANIPULATION_WINDOW_MS)
            .map(|(_, delta)| *delta)
            .collect();
        if window.len() < MANIPULATION_MIN_EVENTS {
            return;
        }

        // Five-plus deltas inside one minute is rapid on its own; strict
        // sign alternation is the other tell, noted for the API counters.
        let alternating = window
            .windows(2)
            .all(|pair| (pair[0] >= 0) != (pair[1] >= 0));
        if !record.manipulation_flagged {
            record.manipulation_flagged = true;
            let key = if alternating {
                "reputation_manipulation_alternating"
            } else {
                "reputation_manipulation_detected"
            };
            *record.counters.entry(key.to_string()).or_insert(0) += 1;
        }
    }

    /// Is the peer currently banned? Expired bans are cleared in passing.
    pub fn is_banned(&mut self, peer: &str, now_ms: u64) -> bool {
        let Some(record) = self.records.get_mut(peer) else {
            return false;
        };
        match record.banned_until {
            Some(until) if until > now_ms => true,
            Some(_) => {
                record.banned_until = None;
                // A returning peer restarts above the ban threshold.
                record.score = record.score.max(BAN_THRESHOLD + 1);
                false
            }
            None => false,
        }
    }

    /// Ban check across every port a host has connected from — inbound
    /// client ports are ephemeral, the ban is on the address.
    pub fn is_banned_host(&mut self, host: &str, now_ms: u64) -> bool {
        let keys: Vec<String> = self
            .records
            .keys()
            .filter(|k| k.rsplit_once(':').map(|(h, _)| h) == Some(host))
            .cloned()
            .collect();
        keys.iter().any(|k| self.is_banned(k, now_ms))
    }

    /// Daily decay: each full elapsed day moves the score 5% of its distance
    /// to the initial value, at least one point, strictly toward it.
    pub fn decay_all(&mut self, now_ms: u64) {
        for record in self.records.values_mut() {
            let mut days = now_ms.saturating_sub(record.last_decay) / DAY_MS;
            if days == 0 {
                continue;
            }
            record.last_decay = now_ms;
            while days > 0 && record.score != INITIAL_SCORE {
                let diff = record.score - INITIAL_SCORE;
                let step = (diff.abs() * DECAY_PCT_PER_DAY / 100).max(1);
                record.score -= step * diff.signum();
                // Never overshoot past the initial value.
                if (diff > 0) != (record.score > INITIAL_SCORE) {
                    record.score = INITIAL_SCORE;
                }
                days -= 1;
            }
        }
    }

    /// Persist the whole map (atomic tmp + rename).
    pub fn save(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(&self.records)?;
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)
    }
}
