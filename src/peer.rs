//! Process-scoped peer context and its single dispatch loop.
//!
//! A [`Peer`] owns one control listener, the registry of message types and
//! handlers, the mailbox fed by every control socket, and the per-process
//! protocol state (group directory, flood bookkeeping). Exactly one inbound
//! message is handled at a time: a handler that issues an RPC and waits
//! suspends all dispatching of its process until the reply or the timeout.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::error::{Error, RemoteFault, Result};
use crate::group::GroupDirectory;
use crate::proto::{Frame, FrameBody, Message, MessageKind, PeerAddress, Reply};
use crate::saturate::SaturationState;
use crate::transport::control::ReplyReceiver;
use crate::transport::{
    connect_control, open_control_listener, serve_control, ControlSocket, Incoming,
    MeasurementListener, Router,
};

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Declaration of a message type. Must be registered under the same name on
/// every participant before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageType {
    pub kind: MessageKind,
    pub is_rpc: bool,
}

impl MessageType {
    pub const fn rpc(kind: MessageKind) -> Self {
        Self { kind, is_rpc: true }
    }

    pub const fn oneway(kind: MessageKind) -> Self {
        Self {
            kind,
            is_rpc: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

// ---------------------------------------------------------------------------
// Conversations and requests
// ---------------------------------------------------------------------------

/// Pending-response token for an inbound call.
///
/// It can be held past the handler that received it and answered at any later
/// time. Only the first answer is sent.
#[derive(Debug, Clone)]
pub struct Conversation {
    id: u64,
    socket: ControlSocket,
    answered: Arc<AtomicBool>,
}

impl Conversation {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address of the caller.
    pub fn caller(&self) -> &PeerAddress {
        self.socket.peer()
    }

    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::Acquire)
    }
}

/// An inbound message handed to a handler or returned by [`Peer::wait`].
#[derive(Debug)]
pub struct Request {
    pub sender: ControlSocket,
    pub message: Message,
    /// Present for calls; `None` for one-way messages.
    pub conversation: Option<Conversation>,
}

impl From<Incoming> for Request {
    fn from(incoming: Incoming) -> Self {
        let conversation = incoming.call.then(|| Conversation {
            id: incoming.id,
            socket: incoming.socket.clone(),
            answered: Arc::new(AtomicBool::new(false)),
        });
        Request {
            sender: incoming.socket,
            message: incoming.message,
            conversation,
        }
    }
}

/// An outgoing call whose reply has not been collected yet.
pub struct PendingCall {
    id: u64,
    kind: MessageKind,
    peer: PeerAddress,
    reply: ReplyReceiver,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// What a handler did with its request.
#[derive(Debug)]
pub enum Outcome {
    /// Answer the call with this reply.
    Reply(Reply),
    /// Nothing left to send: one-way message, or the handler answered (or
    /// kept) the conversation itself.
    Handled,
}

/// Handler bound to one message kind.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, peer: &mut Peer, request: Request) -> Result<Outcome>;
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

/// Inbound queue plus the messages set aside while waiting for a given kind.
struct Mailbox {
    rx: mpsc::UnboundedReceiver<Incoming>,
    deferred: VecDeque<Incoming>,
}

impl Mailbox {
    fn new(rx: mpsc::UnboundedReceiver<Incoming>) -> Self {
        Self {
            rx,
            deferred: VecDeque::new(),
        }
    }

    async fn next(&mut self, timeout: Duration) -> Option<Incoming> {
        if let Some(incoming) = self.deferred.pop_front() {
            return Some(incoming);
        }
        tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
    }

    fn take_deferred(&mut self, kind: MessageKind) -> Option<Incoming> {
        let pos = self.deferred.iter().position(|m| m.message.kind() == kind)?;
        self.deferred.remove(pos)
    }

    async fn wait_for(&mut self, kind: MessageKind, timeout: Duration) -> Option<Incoming> {
        if let Some(found) = self.take_deferred(kind) {
            return Some(found);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(incoming)) if incoming.message.kind() == kind => return Some(incoming),
                Ok(Some(other)) => self.deferred.push_back(other),
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Non-blocking: look only at what has already arrived.
    fn poll_for(&mut self, kind: MessageKind) -> Option<Incoming> {
        if let Some(found) = self.take_deferred(kind) {
            return Some(found);
        }
        while let Ok(incoming) = self.rx.try_recv() {
            if incoming.message.kind() == kind {
                return Some(incoming);
            }
            self.deferred.push_back(incoming);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// One participating process.
pub struct Peer {
    address: PeerAddress,
    bind_ip: IpAddr,
    config: PeerConfig,
    router: Router,
    mailbox: Mailbox,
    types: HashMap<&'static str, MessageType>,
    handlers: HashMap<MessageKind, Arc<dyn Handler>>,
    listener: JoinHandle<()>,
    done: bool,
    pub(crate) groups: GroupDirectory,
    pub(crate) saturation: SaturationState,
}

impl Peer {
    /// Open the control listener and start accepting connections.
    ///
    /// No message types are registered yet; call the protocol `init`
    /// functions (or [`crate::init_all`]) before dispatching.
    pub async fn bind(config: PeerConfig) -> Result<Self> {
        let listener = open_control_listener(&config.network.listen_address).await?;
        let local = listener.local_addr()?;
        let host = config
            .network
            .advertise_host
            .clone()
            .unwrap_or_else(|| local.ip().to_string());
        let address = PeerAddress::new(host, local.port());

        let (router, rx) = Router::new();
        let handle = serve_control(
            listener,
            address.clone(),
            router.clone(),
            config.timeouts.connect(),
        );
        info!(address = %address, "peer listening");

        Ok(Self {
            address,
            bind_ip: local.ip(),
            config,
            router,
            mailbox: Mailbox::new(rx),
            types: HashMap::new(),
            handlers: HashMap::new(),
            listener: handle,
            done: false,
            groups: GroupDirectory::default(),
            saturation: SaturationState::default(),
        })
    }

    /// Address other peers use to reach this process.
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Whether a kill has been processed.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn mark_done(&mut self) {
        self.done = true;
    }

    // -- registry --------------------------------------------------------

    /// Declare a message type. Registering the same declaration again is a
    /// no-op; re-registering a name with a different shape is an error.
    pub fn register_message_type(&mut self, ty: MessageType) -> Result<()> {
        match self.types.get(ty.name()) {
            Some(existing) if *existing == ty => Ok(()),
            Some(existing) => Err(Error::protocol(format!(
                "message type '{}' already registered with is_rpc={}",
                ty.name(),
                existing.is_rpc
            ))),
            None => {
                self.types.insert(ty.name(), ty);
                Ok(())
            }
        }
    }

    /// Bind `handler` to `kind`, replacing any previous binding.
    pub fn register_handler(&mut self, kind: MessageKind, handler: impl Handler + 'static) {
        if self.handlers.insert(kind, Arc::new(handler)).is_some() {
            debug!(message = %kind, "handler replaced");
        }
    }

    pub fn is_registered(&self, kind: MessageKind) -> bool {
        self.types.contains_key(kind.name())
    }

    fn check_type(&self, kind: MessageKind, as_rpc: bool) -> Result<()> {
        match self.types.get(kind.name()) {
            None => Err(Error::protocol(format!("message type '{kind}' is not registered"))),
            Some(ty) if ty.is_rpc != as_rpc => Err(Error::protocol(format!(
                "message type '{kind}' is {}",
                if ty.is_rpc { "an RPC" } else { "one-way" }
            ))),
            Some(_) => Ok(()),
        }
    }

    // -- sockets -------------------------------------------------------------

    /// Open a control socket to `target`. The caller closes it.
    pub async fn connect(&self, target: &PeerAddress) -> Result<ControlSocket> {
        connect_control(&self.router, &self.address, target, self.config.timeouts.connect()).await
    }

    /// Open a single-use measurement listener on this peer's interface.
    pub fn measurement_listener(&self, buffer_size: u32) -> Result<MeasurementListener> {
        MeasurementListener::open(self.bind_ip, buffer_size)
    }

    // -- messaging -----------------------------------------------------------

    /// Send a one-way message.
    pub async fn send(&self, socket: &ControlSocket, message: Message) -> Result<()> {
        let kind = message.kind();
        self.check_type(kind, false)?;
        socket
            .send_frame(Frame {
                id: 0,
                body: FrameBody::OneWay { message },
            })
            .await
            .map_err(|e| e.context(format!("sending '{kind}' to {}", socket.peer())))
    }

    /// Call and block until the reply or `timeout`.
    pub async fn rpc_call(
        &self,
        socket: &ControlSocket,
        timeout: Duration,
        message: Message,
    ) -> Result<Reply> {
        let call = self.rpc_async_call(socket, message).await?;
        self.rpc_async_wait(call, timeout).await
    }

    /// Start a call without waiting for its reply.
    pub async fn rpc_async_call(
        &self,
        socket: &ControlSocket,
        message: Message,
    ) -> Result<PendingCall> {
        let kind = message.kind();
        self.check_type(kind, true)?;
        let id = self.router.next_id();
        let reply = self.router.expect_reply(socket, id).await;
        if let Err(e) = socket
            .send_frame(Frame {
                id,
                body: FrameBody::Call { message },
            })
            .await
        {
            self.router.forget(id).await;
            return Err(e.context(format!("sending '{kind}' to {}", socket.peer())));
        }
        debug!(conversation = id, message = %kind, peer = %socket.peer(), "call sent");
        Ok(PendingCall {
            id,
            kind,
            peer: socket.peer().clone(),
            reply,
        })
    }

    /// Collect the reply of a call started with [`Peer::rpc_async_call`].
    ///
    /// A remote handler error comes back as [`Error::RemoteFault`].
    pub async fn rpc_async_wait(&self, call: PendingCall, timeout: Duration) -> Result<Reply> {
        let PendingCall { id, kind, peer, reply } = call;
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(fault))) => Err(Error::RemoteFault(fault)),
            Ok(Err(_)) => Err(Error::protocol(format!(
                "connection to {peer} closed before '{kind}' was answered"
            ))),
            Err(_) => {
                self.router.forget(id).await;
                Err(Error::timeout(format!(
                    "no answer to '{kind}' from {peer} within {timeout:?}"
                )))
            }
        }
    }

    /// Answer a call, possibly long after it arrived.
    pub async fn rpc_return(&self, conversation: Conversation, reply: Reply) -> Result<()> {
        self.answer(conversation, Ok(reply)).await
    }

    /// Answer a call with an error; the caller re-raises it as a remote fault.
    pub async fn rpc_fail(&self, conversation: Conversation, error: Error) -> Result<()> {
        let fault = error.into_remote(&self.address);
        self.answer(conversation, Err(fault)).await
    }

    async fn answer(
        &self,
        conversation: Conversation,
        result: std::result::Result<Reply, RemoteFault>,
    ) -> Result<()> {
        if conversation.answered.swap(true, Ordering::AcqRel) {
            return Err(Error::protocol(format!(
                "conversation {} with {} already answered",
                conversation.id,
                conversation.caller()
            )));
        }
        conversation
            .socket
            .send_frame(Frame {
                id: conversation.id,
                body: FrameBody::Return { result },
            })
            .await
    }

    /// Block until a message of `kind` arrives. Other messages stay queued
    /// for later dispatch.
    pub async fn wait(&mut self, timeout: Duration, kind: MessageKind) -> Result<Request> {
        self.mailbox
            .wait_for(kind, timeout)
            .await
            .map(Request::from)
            .ok_or_else(|| Error::timeout(format!("no '{kind}' within {timeout:?}")))
    }

    /// Zero-timeout check for an already-arrived message of `kind`.
    pub fn poll(&mut self, kind: MessageKind) -> Option<Request> {
        self.mailbox.poll_for(kind).map(Request::from)
    }

    // -- dispatch ------------------------------------------------------------

    /// Run the handler of at most one inbound message to completion.
    ///
    /// Returns `false` when nothing arrived within `timeout`. Handler errors
    /// are answered to the caller (or logged for one-way messages); they do
    /// not fail the dispatch itself.
    pub async fn dispatch_one(&mut self, timeout: Duration) -> Result<bool> {
        let Some(incoming) = self.mailbox.next(timeout).await else {
            return Ok(false);
        };
        let request = Request::from(incoming);
        let kind = request.message.kind();
        let sender = request.sender.peer().clone();
        let conversation = request.conversation.clone();
        debug!(message = %kind, sender = %sender, "dispatching");

        let outcome = if !self.is_registered(kind) {
            Err(Error::protocol(format!(
                "message type '{kind}' is not registered on {}",
                self.address
            )))
        } else {
            match self.handlers.get(&kind).cloned() {
                Some(handler) => handler.handle(self, request).await,
                None => Err(Error::protocol(format!(
                    "no handler for '{kind}' on {}",
                    self.address
                ))),
            }
        };

        let delivery = match (outcome, conversation) {
            (Ok(Outcome::Reply(reply)), Some(conv)) if !conv.is_answered() => {
                self.rpc_return(conv, reply).await
            }
            (Ok(Outcome::Reply(_)), Some(_)) => {
                warn!(message = %kind, "handler answered twice, dropping second reply");
                Ok(())
            }
            (Ok(Outcome::Reply(_)), None) => {
                debug!(message = %kind, "reply to one-way message dropped");
                Ok(())
            }
            (Ok(Outcome::Handled), _) => Ok(()),
            (Err(e), Some(conv)) if !conv.is_answered() => {
                debug!(
                    message = %kind,
                    sender = %sender,
                    error = %e,
                    "handler failed, answering with fault"
                );
                self.rpc_fail(conv, e).await
            }
            (Err(e), _) => {
                warn!(message = %kind, sender = %sender, error = %e, "handler failed");
                Ok(())
            }
        };
        if let Err(e) = delivery {
            warn!(message = %kind, sender = %sender, error = %e, "could not deliver reply");
        }
        Ok(true)
    }

    /// Dispatch messages one by one until `timeout` passes with nothing
    /// pending or a kill has been processed.
    pub async fn mainloop(&mut self, timeout: Duration) -> Result<()> {
        debug!(address = %self.address, ?timeout, "entering mainloop");
        while !self.done {
            if !self.dispatch_one(timeout).await? {
                debug!(address = %self.address, "mainloop idle, leaving");
                break;
            }
        }
        if self.done {
            info!(address = %self.address, "peer killed, mainloop finished");
        }
        Ok(())
    }

    /// Conversations this process is still waiting on.
    pub async fn outstanding_calls(&self) -> usize {
        self.router.pending_count().await
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address)
            .field("done", &self.done)
            .field("flooding", &self.saturation.is_flooding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::proto::GroupSnapshot;

    struct EchoGroup;

    #[async_trait]
    impl Handler for EchoGroup {
        async fn handle(&self, _peer: &mut Peer, request: Request) -> Result<Outcome> {
            match request.message {
                Message::PmGet { group } if group == "missing" => {
                    Err(Error::NotFound(format!("group '{group}'")))
                }
                Message::PmGet { group } => Ok(Outcome::Reply(Reply::Group(GroupSnapshot {
                    name: group,
                    members: Vec::new(),
                }))),
                other => Err(Error::protocol(format!("unexpected {:?}", other.kind()))),
            }
        }
    }

    async fn peer() -> Peer {
        let mut p = Peer::bind(PeerConfig::loopback()).await.unwrap();
        p.register_message_type(MessageType::rpc(MessageKind::PmGet)).unwrap();
        p.register_message_type(MessageType::oneway(MessageKind::PmKill)).unwrap();
        p
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let mut p = peer().await;
        p.register_message_type(MessageType::rpc(MessageKind::PmGet)).unwrap();
        let err = p
            .register_message_type(MessageType::oneway(MessageKind::PmGet))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_rpc_round_trip_and_remote_fault() {
        let mut server = peer().await;
        server.register_handler(MessageKind::PmGet, EchoGroup);
        let server_addr = server.address().clone();
        let serving = tokio::spawn(async move {
            server.mainloop(Duration::from_millis(500)).await.unwrap();
        });

        let client = peer().await;
        let sock = client.connect(&server_addr).await.unwrap();
        let reply = client
            .rpc_call(&sock, Duration::from_secs(2), Message::PmGet { group: "bw".into() })
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Group(ref g) if g.name == "bw"));

        let err = client
            .rpc_call(&sock, Duration::from_secs(2), Message::PmGet { group: "missing".into() })
            .await
            .unwrap_err();
        assert!(err.is_remote());
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(client.outstanding_calls().await, 0);

        sock.close().await;
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_times_out_when_nobody_dispatches() {
        let server = peer().await;
        let client = peer().await;
        let sock = client.connect(server.address()).await.unwrap();
        let err = client
            .rpc_call(&sock, Duration::from_millis(200), Message::PmGet { group: "bw".into() })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(client.outstanding_calls().await, 0);
        sock.close().await;
    }

    #[tokio::test]
    async fn test_send_rejects_wrong_shape() {
        let server = peer().await;
        let client = peer().await;
        let sock = client.connect(server.address()).await.unwrap();
        let err = client.send(&sock, Message::PmGet { group: "bw".into() }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        let err = client
            .rpc_call(&sock, Duration::from_millis(100), Message::SatStop)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        sock.close().await;
    }

    #[tokio::test]
    async fn test_wait_defers_other_messages() {
        let mut server = peer().await;
        server.register_handler(MessageKind::PmGet, EchoGroup);
        let client = peer().await;
        let sock = client.connect(server.address()).await.unwrap();

        let pending = client
            .rpc_async_call(&sock, Message::PmGet { group: "bw".into() })
            .await
            .unwrap();
        client.send(&sock, Message::PmKill).await.unwrap();

        // The kill is picked out first; the earlier call stays queued.
        let kill = server.wait(Duration::from_secs(2), MessageKind::PmKill).await.unwrap();
        assert!(kill.conversation.is_none());
        assert!(server.poll(MessageKind::PmKill).is_none());

        assert!(server.dispatch_one(Duration::from_secs(2)).await.unwrap());
        let reply = client.rpc_async_wait(pending, Duration::from_secs(2)).await.unwrap();
        assert!(matches!(reply, Reply::Group(_)));
        sock.close().await;
    }

    #[tokio::test]
    async fn test_conversation_answered_once() {
        let mut server = peer().await;
        let client = peer().await;
        let sock = client.connect(server.address()).await.unwrap();
        let pending = client
            .rpc_async_call(&sock, Message::PmGet { group: "bw".into() })
            .await
            .unwrap();

        let request = server.wait(Duration::from_secs(2), MessageKind::PmGet).await.unwrap();
        let conv = request.conversation.expect("call carries a conversation");
        let copy = conv.clone();
        server.rpc_return(conv, Reply::Ack).await.unwrap();
        assert!(server.rpc_return(copy, Reply::Ack).await.is_err());

        let reply = client.rpc_async_wait(pending, Duration::from_secs(2)).await.unwrap();
        assert!(matches!(reply, Reply::Ack));
        sock.close().await;
    }
}
