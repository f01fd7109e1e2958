//! PeerGroup directory.
//!
//! Groups live on the controller that created them and change only through
//! `pm_join` / `pm_leave` / `pm_shutdown` calls handled by its dispatch loop,
//! so the directory itself needs no locking. Every peer also answers
//! `pm_kill` and `pm_killrpc`, which end its mainloop.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::peer::{Handler, MessageType, Outcome, Peer, Request};
use crate::proto::{GroupMember, GroupSnapshot, Message, MessageKind, PeerAddress, Reply};
use crate::transport::ControlSocket;

/// A named, ranked set of peer addresses.
#[derive(Debug, Clone, Default)]
pub struct PeerGroup {
    name: String,
    members: BTreeMap<u32, PeerAddress>,
}

impl PeerGroup {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: BTreeMap::new(),
        }
    }

    fn rank_of(&self, address: &PeerAddress) -> Option<u32> {
        self.members
            .iter()
            .find(|(_, held)| *held == address)
            .map(|(rank, _)| *rank)
    }

    /// Lowest rank nobody holds.
    fn first_free_rank(&self) -> Result<u32> {
        let mut free = 0u32;
        for &rank in self.members.keys() {
            if rank != free {
                break;
            }
            free = free
                .checked_add(1)
                .ok_or_else(|| Error::Conflict(format!("group '{}' is full", self.name)))?;
        }
        Ok(free)
    }

    /// Place `address` in the group, returning its rank.
    pub fn join(&mut self, address: PeerAddress, rank: Option<u32>) -> Result<u32> {
        let current = self.rank_of(&address);
        match rank {
            None => {
                if let Some(r) = current {
                    return Ok(r);
                }
                let r = self.first_free_rank()?;
                self.members.insert(r, address);
                Ok(r)
            }
            Some(r) => {
                match self.members.get(&r) {
                    Some(holder) if *holder == address => return Ok(r),
                    Some(holder) => {
                        return Err(Error::Conflict(format!(
                            "rank {r} of group '{}' is held by {holder}",
                            self.name
                        )))
                    }
                    None => {}
                }
                if let Some(other) = current {
                    return Err(Error::Conflict(format!(
                        "{address} already holds rank {other} of group '{}'",
                        self.name
                    )));
                }
                self.members.insert(r, address);
                Ok(r)
            }
        }
    }

    /// Drop `address` from the group. Returns whether it was a member.
    pub fn leave(&mut self, address: &PeerAddress) -> bool {
        match self.rank_of(address) {
            Some(r) => self.members.remove(&r).is_some(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            name: self.name.clone(),
            members: self
                .members
                .iter()
                .map(|(rank, address)| GroupMember {
                    rank: *rank,
                    address: address.clone(),
                })
                .collect(),
        }
    }
}

/// All groups owned by one peer.
#[derive(Debug, Default)]
pub struct GroupDirectory {
    groups: HashMap<String, PeerGroup>,
}

impl GroupDirectory {
    pub fn create(&mut self, name: &str) -> Result<()> {
        if self.groups.contains_key(name) {
            return Err(Error::Conflict(format!("group '{name}' already exists")));
        }
        self.groups.insert(name.to_string(), PeerGroup::new(name));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&PeerGroup> {
        self.groups
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("group '{name}'")))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut PeerGroup> {
        self.groups
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("group '{name}'")))
    }

    pub fn remove(&mut self, name: &str) -> Result<PeerGroup> {
        self.groups
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("group '{name}'")))
    }
}

// ---------------------------------------------------------------------------
// Directory host
// ---------------------------------------------------------------------------

/// Create an empty group hosted by `peer`.
pub fn create_group(peer: &mut Peer, name: &str) -> Result<()> {
    peer.groups.create(name)?;
    info!(group = name, host = %peer.address(), "group created");
    Ok(())
}

/// Local snapshot of a group hosted by `peer`.
pub fn local_snapshot(peer: &Peer, name: &str) -> Result<GroupSnapshot> {
    Ok(peer.groups.get(name)?.snapshot())
}

/// Dispatch inbound messages until group `name` has at least `count`
/// members.
pub async fn await_members(
    peer: &mut Peer,
    name: &str,
    count: usize,
    timeout: Duration,
) -> Result<GroupSnapshot> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let group = peer.groups.get(name)?;
        if group.len() >= count {
            return Ok(group.snapshot());
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() || !peer.dispatch_one(remaining).await? {
            return Err(Error::timeout(format!(
                "group '{name}' has {} of {count} members after {timeout:?}",
                peer.groups.get(name)?.len()
            )));
        }
    }
}

/// Kill every member of `name` (best effort, no waiting) and delete it.
pub async fn shutdown_local(peer: &mut Peer, name: &str) -> Result<()> {
    let members = peer.groups.get(name)?.snapshot().addresses();
    for member in &members {
        if let Err(e) = kill(peer, member).await {
            warn!(group = name, member = %member, error = %e, "could not kill group member");
        }
    }
    peer.groups.remove(name)?;
    info!(group = name, members = members.len(), "group shut down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Join `group` on the directory reached through `socket`.
pub async fn join(
    peer: &Peer,
    socket: &ControlSocket,
    group: &str,
    rank: Option<u32>,
) -> Result<u32> {
    let msg = Message::PmJoin {
        group: group.to_string(),
        rank,
    };
    match peer.rpc_call(socket, peer.config().timeouts.rpc(), msg).await {
        Ok(Reply::Joined { rank }) => {
            debug!(group, rank, directory = %socket.peer(), "joined group");
            Ok(rank)
        }
        Ok(other) => Err(other.unexpected("joined")),
        Err(e) => Err(e.context(format!("joining group '{group}' on {}", socket.peer()))),
    }
}

pub async fn leave(peer: &Peer, socket: &ControlSocket, group: &str) -> Result<()> {
    let msg = Message::PmLeave {
        group: group.to_string(),
    };
    match peer.rpc_call(socket, peer.config().timeouts.rpc(), msg).await {
        Ok(Reply::Ack) => Ok(()),
        Ok(other) => Err(other.unexpected("ack")),
        Err(e) => Err(e.context(format!("leaving group '{group}' on {}", socket.peer()))),
    }
}

pub async fn get(peer: &Peer, socket: &ControlSocket, group: &str) -> Result<GroupSnapshot> {
    let msg = Message::PmGet {
        group: group.to_string(),
    };
    match peer.rpc_call(socket, peer.config().timeouts.rpc(), msg).await {
        Ok(Reply::Group(snapshot)) => Ok(snapshot),
        Ok(other) => Err(other.unexpected("group")),
        Err(e) => Err(e.context(format!("reading group '{group}' on {}", socket.peer()))),
    }
}

pub async fn shutdown(peer: &Peer, socket: &ControlSocket, group: &str) -> Result<()> {
    let msg = Message::PmShutdown {
        group: group.to_string(),
    };
    match peer.rpc_call(socket, peer.config().timeouts.rpc(), msg).await {
        Ok(Reply::Ack) => Ok(()),
        Ok(other) => Err(other.unexpected("ack")),
        Err(e) => Err(e.context(format!("shutting down group '{group}' on {}", socket.peer()))),
    }
}

/// Tell `target` to leave its mainloop. Does not wait.
pub async fn kill(peer: &Peer, target: &PeerAddress) -> Result<()> {
    let socket = peer.connect(target).await?;
    let sent = peer.send(&socket, Message::PmKill).await;
    socket.close().await;
    sent.map_err(|e| e.context(format!("killing {target}")))
}

/// Kill `target` and wait until its mainloop has marked itself done.
pub async fn kill_sync(peer: &Peer, target: &PeerAddress) -> Result<()> {
    let socket = peer.connect(target).await?;
    let reply = peer
        .rpc_call(&socket, peer.config().timeouts.rpc(), Message::PmKillRpc)
        .await;
    socket.close().await;
    match reply {
        Ok(Reply::Ack) => Ok(()),
        Ok(other) => Err(other.unexpected("ack")),
        Err(e) => Err(e.context(format!("killing {target}"))),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

struct JoinHandler;

#[async_trait]
impl Handler for JoinHandler {
    async fn handle(&self, peer: &mut Peer, request: Request) -> Result<Outcome> {
        let Message::PmJoin { group, rank } = request.message else {
            return Err(Error::protocol("pm_join handler got another message"));
        };
        let address = request.sender.peer().clone();
        let rank = peer.groups.get_mut(&group)?.join(address.clone(), rank)?;
        info!(group = %group, member = %address, rank, "member joined");
        Ok(Outcome::Reply(Reply::Joined { rank }))
    }
}

struct LeaveHandler;

#[async_trait]
impl Handler for LeaveHandler {
    async fn handle(&self, peer: &mut Peer, request: Request) -> Result<Outcome> {
        let Message::PmLeave { group } = request.message else {
            return Err(Error::protocol("pm_leave handler got another message"));
        };
        let address = request.sender.peer();
        if peer.groups.get_mut(&group)?.leave(address) {
            info!(group = %group, member = %address, "member left");
        } else {
            debug!(group = %group, peer = %address, "leave from non-member ignored");
        }
        Ok(Outcome::Reply(Reply::Ack))
    }
}

struct GetHandler;

#[async_trait]
impl Handler for GetHandler {
    async fn handle(&self, peer: &mut Peer, request: Request) -> Result<Outcome> {
        let Message::PmGet { group } = request.message else {
            return Err(Error::protocol("pm_get handler got another message"));
        };
        Ok(Outcome::Reply(Reply::Group(local_snapshot(peer, &group)?)))
    }
}

struct ShutdownHandler;

#[async_trait]
impl Handler for ShutdownHandler {
    async fn handle(&self, peer: &mut Peer, request: Request) -> Result<Outcome> {
        let Message::PmShutdown { group } = request.message else {
            return Err(Error::protocol("pm_shutdown handler got another message"));
        };
        shutdown_local(peer, &group).await?;
        Ok(Outcome::Reply(Reply::Ack))
    }
}

struct KillHandler;

#[async_trait]
impl Handler for KillHandler {
    async fn handle(&self, peer: &mut Peer, request: Request) -> Result<Outcome> {
        info!(from = %request.sender.peer(), "kill received");
        peer.mark_done();
        Ok(if request.conversation.is_some() {
            Outcome::Reply(Reply::Ack)
        } else {
            Outcome::Handled
        })
    }
}

/// Register the group message types and handlers on `peer`.
pub fn init(peer: &mut Peer) -> Result<()> {
    for kind in [
        MessageKind::PmJoin,
        MessageKind::PmLeave,
        MessageKind::PmGet,
        MessageKind::PmShutdown,
        MessageKind::PmKillRpc,
    ] {
        peer.register_message_type(MessageType::rpc(kind))?;
    }
    peer.register_message_type(MessageType::oneway(MessageKind::PmKill))?;

    peer.register_handler(MessageKind::PmJoin, JoinHandler);
    peer.register_handler(MessageKind::PmLeave, LeaveHandler);
    peer.register_handler(MessageKind::PmGet, GetHandler);
    peer.register_handler(MessageKind::PmShutdown, ShutdownHandler);
    peer.register_handler(MessageKind::PmKill, KillHandler);
    peer.register_handler(MessageKind::PmKillRpc, KillHandler);
    Ok(())
}
