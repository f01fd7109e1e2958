//! Message types and data model for the meshbench control channel.
//!
//! Every frame on a control socket is a [`Frame`]: a conversation id plus a
//! [`FrameBody`]. Requests carry a [`Message`], serialized as adjacently
//! tagged JSON whose `type` is the peer-facing message name (`"BW handshake"`,
//! `"amok_sat_start"`, `"pm_join"`, ...). Replies carry either a [`Reply`] or
//! the [`RemoteFault`] raised by the remote handler.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, RemoteFault};

// ---------------------------------------------------------------------------
// PeerAddress
// ---------------------------------------------------------------------------

/// Identity of a process's control listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form suitable for `TcpStream::connect`.
    pub fn to_connect_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_connect_string())
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        PeerAddress::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(sock) = s.parse::<SocketAddr>() {
            return Ok(sock.into());
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::protocol(format!("address '{s}' is not host:port")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::protocol(format!("address '{s}' has an invalid port")))?;
        if host.is_empty() {
            return Err(Error::protocol(format!("address '{s}' has an empty host")));
        }
        Ok(PeerAddress::new(host, port))
    }
}

// ---------------------------------------------------------------------------
// Bandwidth
// ---------------------------------------------------------------------------

/// Shape of one bandwidth experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthSpec {
    /// Socket buffer size for the measurement channels; 0 keeps the OS default.
    pub buffer_size: u32,
    /// Size of each write on the measurement channel, in bytes.
    pub message_size: u64,
    /// Number of messages per round.
    pub message_count: u32,
    /// Rounds shorter than this are re-run with a larger message size.
    pub min_duration_ms: u64,
}

impl BandwidthSpec {
    /// Bytes moved by one round of this experiment.
    pub fn total_bytes(&self) -> Result<u64, Error> {
        self.message_size
            .checked_mul(u64::from(self.message_count))
            .ok_or_else(|| {
                Error::protocol(format!(
                    "{} messages of {} bytes overflow the byte count",
                    self.message_count, self.message_size
                ))
            })
    }

    /// Byte count of one round, or Protocol if this peer will not run it.
    pub fn validate(&self, max_message_size: u64) -> Result<u64, Error> {
        if self.message_size > max_message_size {
            return Err(Error::protocol(format!(
                "message size {} exceeds the {max_message_size} byte limit",
                self.message_size
            )));
        }
        self.total_bytes()
    }
}

impl Default for BandwidthSpec {
    fn default() -> Self {
        Self {
            buffer_size: 0,
            message_size: 512 * 1024,
            message_count: 1,
            min_duration_ms: 1000,
        }
    }
}

/// Outcome of a bandwidth experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthResult {
    pub elapsed_seconds: f64,
    pub bytes_per_second: f64,
    pub measured_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Saturation
// ---------------------------------------------------------------------------

/// Request to flood the path towards `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaturationSpec {
    pub target: PeerAddress,
    /// Chunk size in bytes; 0 means auto-tune from a probe.
    pub message_size: u64,
    /// Flood duration in seconds; 0 means until stopped.
    pub duration_sec: u64,
}

/// What a saturator achieved over the whole flood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaturationReport {
    pub elapsed_seconds: f64,
    pub bytes_per_second: f64,
    pub bytes_sent: u64,
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// One occupied rank of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub rank: u32,
    pub address: PeerAddress,
}

/// Read-only view of a group, ordered by rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub members: Vec<GroupMember>,
}

impl GroupSnapshot {
    pub fn addresses(&self) -> Vec<PeerAddress> {
        self.members.iter().map(|m| m.address.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Every request or one-way message a peer can receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Message {
    #[serde(rename = "BW handshake")]
    BwHandshake { port: u16, spec: BandwidthSpec },
    /// Sent after each transfer round: `Some` asks for another round.
    #[serde(rename = "BW reask")]
    BwReask { spec: Option<BandwidthSpec> },
    #[serde(rename = "BW request")]
    BwRequest {
        target: PeerAddress,
        spec: BandwidthSpec,
    },

    #[serde(rename = "amok_sat_start")]
    SatStart(SaturationSpec),
    #[serde(rename = "amok_sat_begin")]
    SatBegin { message_size: u64, duration_sec: u64 },
    #[serde(rename = "amok_sat_stop")]
    SatStop,

    #[serde(rename = "pm_join")]
    PmJoin { group: String, rank: Option<u32> },
    #[serde(rename = "pm_leave")]
    PmLeave { group: String },
    #[serde(rename = "pm_get")]
    PmGet { group: String },
    #[serde(rename = "pm_shutdown")]
    PmShutdown { group: String },
    #[serde(rename = "pm_kill")]
    PmKill,
    #[serde(rename = "pm_killrpc")]
    PmKillRpc,
}

/// Fieldless mirror of [`Message`], used as the registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    BwHandshake,
    BwReask,
    BwRequest,
    SatStart,
    SatBegin,
    SatStop,
    PmJoin,
    PmLeave,
    PmGet,
    PmShutdown,
    PmKill,
    PmKillRpc,
}

impl MessageKind {
    /// Peer-facing name; identical on every participant.
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::BwHandshake => "BW handshake",
            MessageKind::BwReask => "BW reask",
            MessageKind::BwRequest => "BW request",
            MessageKind::SatStart => "amok_sat_start",
            MessageKind::SatBegin => "amok_sat_begin",
            MessageKind::SatStop => "amok_sat_stop",
            MessageKind::PmJoin => "pm_join",
            MessageKind::PmLeave => "pm_leave",
            MessageKind::PmGet => "pm_get",
            MessageKind::PmShutdown => "pm_shutdown",
            MessageKind::PmKill => "pm_kill",
            MessageKind::PmKillRpc => "pm_killrpc",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::BwHandshake { .. } => MessageKind::BwHandshake,
            Message::BwReask { .. } => MessageKind::BwReask,
            Message::BwRequest { .. } => MessageKind::BwRequest,
            Message::SatStart(_) => MessageKind::SatStart,
            Message::SatBegin { .. } => MessageKind::SatBegin,
            Message::SatStop => MessageKind::SatStop,
            Message::PmJoin { .. } => MessageKind::PmJoin,
            Message::PmLeave { .. } => MessageKind::PmLeave,
            Message::PmGet { .. } => MessageKind::PmGet,
            Message::PmShutdown { .. } => MessageKind::PmShutdown,
            Message::PmKill => MessageKind::PmKill,
            Message::PmKillRpc => MessageKind::PmKillRpc,
        }
    }
}

/// Successful answer to an RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Handshake { port: u16, spec: BandwidthSpec },
    Bandwidth(BandwidthResult),
    SatBegun { port: u16 },
    Saturation(SaturationReport),
    Joined { rank: u32 },
    Group(GroupSnapshot),
}

impl Reply {
    fn name(&self) -> &'static str {
        match self {
            Reply::Ack => "ack",
            Reply::Handshake { .. } => "handshake",
            Reply::Bandwidth(_) => "bandwidth",
            Reply::SatBegun { .. } => "sat_begun",
            Reply::Saturation(_) => "saturation",
            Reply::Joined { .. } => "joined",
            Reply::Group(_) => "group",
        }
    }

    /// Error for a reply of the wrong variant.
    pub fn unexpected(self, wanted: &str) -> Error {
        Error::protocol(format!("expected {wanted} reply, got {}", self.name()))
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Top-level envelope for every frame on a control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Conversation id chosen by the caller; 0 for hello and one-way frames.
    pub id: u64,
    pub body: FrameBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum FrameBody {
    /// First frame in each direction: the sender's control-listener address.
    Hello { address: PeerAddress },
    OneWay { message: Message },
    Call { message: Message },
    Return { result: Result<Reply, RemoteFault> },
}
