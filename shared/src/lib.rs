use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PROTOCOL_VERSION: u32 = 1;
/// Largest payload a single UDP datagram can carry
pub const MAX_PACKET_SIZE: usize = 65_507;

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    duration_millis(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0)),
    )
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
pub fn duration_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

/// Queue precedence of a waiting player. Later variants are served first.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PriorityRank {
    Player,
    Supporter,
    Trainer,
    Moderator,
    Admin,
}

impl PriorityRank {
    pub const ALL: [PriorityRank; 5] = [
        PriorityRank::Player,
        PriorityRank::Supporter,
        PriorityRank::Trainer,
        PriorityRank::Moderator,
        PriorityRank::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityRank::Player => "player",
            PriorityRank::Supporter => "supporter",
            PriorityRank::Trainer => "trainer",
            PriorityRank::Moderator => "moderator",
            PriorityRank::Admin => "admin",
        }
    }
}

impl fmt::Display for PriorityRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityRank {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        PriorityRank::ALL
            .iter()
            .copied()
            .find(|rank| rank.as_str() == wanted)
            .ok_or_else(|| format!("unknown priority rank '{}'", s))
    }
}

/// Last observed status of a backend, always replaced as a whole
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendStatus {
    pub online: bool,
    pub current_count: u32,
    pub max_count: u32,
}

impl BackendStatus {
    pub fn online(current_count: u32, max_count: u32) -> Self {
        Self {
            online: true,
            current_count,
            max_count,
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }

    pub fn is_full(&self) -> bool {
        self.current_count >= self.max_count
    }

    pub fn free_slots(&self) -> u32 {
        self.max_count.saturating_sub(self.current_count)
    }
}

/// Answer to a backend asking for permission to restart
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    Allow,
    Wait {
        /// Earliest time (ms since epoch) at which asking again is useful
        retry_after: u64,
        /// 1-indexed place in the restart backlog, `None` while cooling down
        queue_position: Option<usize>,
        reason: String,
    },
    Deny {
        reason: String,
    },
}

impl RestartDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, RestartDecision::Allow)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum RestartEntryStatus {
    Wait,
    Allow,
    Deny,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RestartQueueEntry {
    pub server_name: String,
    pub request_time: u64,
    pub last_retry_time: u64,
    pub retry_count: u32,
    pub status: RestartEntryStatus,
}

impl RestartQueueEntry {
    pub fn new(server_name: &str, now: u64) -> Self {
        Self {
            server_name: server_name.to_string(),
            request_time: now,
            last_retry_time: now,
            retry_count: 0,
            status: RestartEntryStatus::Wait,
        }
    }
}

/// Snapshot of the restart coordinator, detached from the live state
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct RestartState {
    pub currently_restarting: Option<String>,
    pub queue: Vec<RestartQueueEntry>,
    pub restart_history: BTreeMap<String, u64>,
    pub unauthorized_restarts: BTreeMap<String, Vec<u64>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    // Player -> hub
    Connect {
        client_version: u32,
    },
    JoinQueue {
        target: String,
        rank: PriorityRank,
    },
    LeaveQueue,
    QueryPosition,
    TransferFailed {
        reason: String,
    },
    Heartbeat,
    Disconnect,

    // Hub -> player
    Connected {
        client_id: u32,
    },
    QueuePosition {
        position: Option<usize>,
        size: usize,
    },
    Notice {
        message: String,
    },
    Progress {
        text: String,
    },
    ClearProgress,
    Transfer {
        backend: String,
        address: String,
    },
    Disconnected {
        reason: String,
    },

    // Backend -> hub
    StatusReport {
        server: String,
        current_count: u32,
        max_count: u32,
    },
    RestartRequest {
        server: String,
    },
    RestartComplete {
        server: String,
    },
    UnauthorizedRestart {
        server: String,
    },
    StateQuery,

    // Hub -> backend
    RestartResponse {
        server: String,
        decision: RestartDecision,
    },
    RestartAck {
        server: String,
        accepted: bool,
        reason: Option<String>,
    },
    StateSnapshot {
        state: RestartState,
    },
    /// The snapshot could not be sent in one datagram
    StateUnavailable {
        reason: String,
    },
}
