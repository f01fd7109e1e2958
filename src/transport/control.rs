//! Control sockets: reliable, message-framed connections used for dispatch
//! and RPC.
//!
//! Both sides of a new connection first exchange a `Hello` frame naming their
//! control-listener address. After that a reader task per socket routes
//! inbound frames: calls and one-way messages go to the owning process's
//! inbox, replies complete the matching pending conversation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

use crate::error::{Error, RemoteFault, Result};
use crate::proto::{Frame, FrameBody, Message, PeerAddress, Reply};
use crate::transport::wire::FrameCodec;

type FrameSink = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;
type ReplySlot = oneshot::Sender<std::result::Result<Reply, RemoteFault>>;

/// Receiving end of a pending conversation.
pub type ReplyReceiver = oneshot::Receiver<std::result::Result<Reply, RemoteFault>>;

// ---------------------------------------------------------------------------
// Incoming
// ---------------------------------------------------------------------------

/// A call or one-way message read from a control socket.
#[derive(Debug)]
pub struct Incoming {
    /// Socket the message arrived on; replies go back through it.
    pub socket: ControlSocket,
    /// Caller-chosen conversation id (meaningful for calls only).
    pub id: u64,
    pub message: Message,
    /// Whether the sender expects a reply.
    pub call: bool,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Per-process routing state shared by every control socket of that process.
#[derive(Clone)]
pub struct Router {
    inbox: mpsc::UnboundedSender<Incoming>,
    pending: Arc<Mutex<HashMap<u64, (u64, ReplySlot)>>>,
    next_conversation: Arc<AtomicU64>,
    next_socket: Arc<AtomicU64>,
}

impl Router {
    /// Create a router and the inbox its sockets feed.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Incoming>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let router = Self {
            inbox,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_conversation: Arc::new(AtomicU64::new(1)),
            next_socket: Arc::new(AtomicU64::new(1)),
        };
        (router, rx)
    }

    /// Fresh conversation id, unique within this process.
    pub fn next_id(&self) -> u64 {
        self.next_conversation.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserve the reply slot for conversation `id` opened on `socket`.
    pub async fn expect_reply(&self, socket: &ControlSocket, id: u64) -> ReplyReceiver {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, (socket.inner.socket_id, tx));
        rx
    }

    /// Drop the reply slot of a conversation that timed out.
    pub async fn forget(&self, id: u64) {
        self.pending.lock().await.remove(&id);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn complete(&self, id: u64, result: std::result::Result<Reply, RemoteFault>) {
        match self.pending.lock().await.remove(&id) {
            Some((_, slot)) => {
                // The caller may have given up between lookup and send.
                let _ = slot.send(result);
            }
            None => debug!(conversation = id, "reply for unknown or expired conversation"),
        }
    }

    /// Fail every conversation still waiting on a socket that went away.
    async fn abandon_socket(&self, socket_id: u64) {
        self.pending
            .lock()
            .await
            .retain(|_, (owner, _)| *owner != socket_id);
    }
}

// ---------------------------------------------------------------------------
// ControlSocket
// ---------------------------------------------------------------------------

struct SocketInner {
    socket_id: u64,
    peer: PeerAddress,
    sink: Mutex<FrameSink>,
    closed: AtomicBool,
    reader: OnceLock<AbortHandle>,
}

/// Handle on one control connection. Cheap to clone; the creator closes it.
#[derive(Clone)]
pub struct ControlSocket {
    inner: Arc<SocketInner>,
}

impl std::fmt::Debug for ControlSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSocket")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ControlSocket {
    /// Control-listener address of the remote process.
    pub fn peer(&self) -> &PeerAddress {
        &self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Write one frame.
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::protocol(format!("control socket to {} is closed", self.peer())));
        }
        let mut sink = self.inner.sink.lock().await;
        sink.send(frame).await
    }

    /// Flush and shut down the connection and stop its reader task.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut sink = self.inner.sink.lock().await;
            if let Err(e) = sink.close().await {
                debug!(peer = %self.peer(), error = %e, "error while closing control socket");
            }
        }
        if let Some(reader) = self.inner.reader.get() {
            reader.abort();
        }
        debug!(peer = %self.peer(), "control socket closed");
    }

    /// Split `framed`, start its reader task and return the handle.
    fn spawn(framed: Framed<TcpStream, FrameCodec>, peer: PeerAddress, router: Router) -> Self {
        let (sink, mut stream) = framed.split();
        let socket = ControlSocket {
            inner: Arc::new(SocketInner {
                socket_id: router.next_socket.fetch_add(1, Ordering::Relaxed),
                peer,
                sink: Mutex::new(sink),
                closed: AtomicBool::new(false),
                reader: OnceLock::new(),
            }),
        };

        let reader_socket = socket.clone();
        let handle = tokio::spawn(async move {
            let socket_id = reader_socket.inner.socket_id;
            while let Some(frame) = stream.next().await {
                let frame = match frame {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(
                            peer = %reader_socket.peer(),
                            error = %e,
                            "dropping control connection"
                        );
                        break;
                    }
                };
                let incoming = match frame.body {
                    FrameBody::Call { message } => Incoming {
                        socket: reader_socket.clone(),
                        id: frame.id,
                        message,
                        call: true,
                    },
                    FrameBody::OneWay { message } => Incoming {
                        socket: reader_socket.clone(),
                        id: frame.id,
                        message,
                        call: false,
                    },
                    FrameBody::Return { result } => {
                        router.complete(frame.id, result).await;
                        continue;
                    }
                    FrameBody::Hello { address } => {
                        debug!(peer = %reader_socket.peer(), %address, "ignoring repeated hello");
                        continue;
                    }
                };
                if router.inbox.send(incoming).is_err() {
                    debug!(peer = %reader_socket.peer(), "process inbox gone, stopping reader");
                    break;
                }
            }
            reader_socket.inner.closed.store(true, Ordering::Release);
            router.abandon_socket(socket_id).await;
            debug!(peer = %reader_socket.peer(), "control reader finished");
        });
        let _ = socket.inner.reader.set(handle.abort_handle());
        socket
    }
}

// ---------------------------------------------------------------------------
// Connect / listen
// ---------------------------------------------------------------------------

/// Open a control connection to `target` and exchange hellos.
///
/// Any failure, including a missing or malformed hello, is a
/// `ConnectFailure`. Never retried.
pub async fn connect_control(
    router: &Router,
    local: &PeerAddress,
    target: &PeerAddress,
    timeout: Duration,
) -> Result<ControlSocket> {
    let fail = |reason: String| Error::ConnectFailure {
        addr: target.clone(),
        reason,
    };

    let connect = TcpStream::connect(target.to_connect_string());
    let stream = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(fail(e.to_string())),
        Err(_) => return Err(fail(format!("no answer within {:?}", timeout))),
    };
    stream.set_nodelay(true).map_err(|e| fail(e.to_string()))?;

    let mut framed = Framed::new(stream, FrameCodec::new());
    framed
        .send(Frame {
            id: 0,
            body: FrameBody::Hello {
                address: local.clone(),
            },
        })
        .await
        .map_err(|e| fail(format!("sending hello: {e}")))?;

    match tokio::time::timeout(timeout, framed.next()).await {
        Ok(Some(Ok(Frame {
            body: FrameBody::Hello { address },
            ..
        }))) => {
            debug!(target = %target, announced = %address, "control connection established");
        }
        Ok(Some(Ok(other))) => return Err(fail(format!("expected hello, got {:?}", other.body))),
        Ok(Some(Err(e))) => return Err(fail(format!("reading hello: {e}"))),
        Ok(None) => return Err(fail("connection closed before hello".into())),
        Err(_) => return Err(fail(format!("no hello within {:?}", timeout))),
    }

    Ok(ControlSocket::spawn(framed, target.clone(), router.clone()))
}

/// Bind the control listener.
pub async fn open_control_listener(bind: &str) -> Result<TcpListener> {
    TcpListener::bind(bind)
        .await
        .map_err(|e| Error::Io(format!("failed to bind control listener on {bind}: {e}")))
}

/// Accept control connections forever, handing each to the router.
pub fn serve_control(
    listener: TcpListener,
    local: PeerAddress,
    router: Router,
    hello_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "failed to accept control connection");
                    continue;
                }
            };
            let local = local.clone();
            let router = router.clone();
            tokio::spawn(async move {
                if let Err(e) = accept_one(stream, remote, local, router, hello_timeout).await {
                    warn!(remote = %remote, error = %e, "control handshake failed");
                }
            });
        }
    })
}

async fn accept_one(
    stream: TcpStream,
    remote: SocketAddr,
    local: PeerAddress,
    router: Router,
    hello_timeout: Duration,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, FrameCodec::new());

    let announced = match tokio::time::timeout(hello_timeout, framed.next()).await {
        Ok(Some(Ok(Frame {
            body: FrameBody::Hello { address },
            ..
        }))) => address,
        Ok(Some(Ok(other))) => {
            return Err(Error::protocol(format!("expected hello, got {:?}", other.body)))
        }
        Ok(Some(Err(e))) => return Err(e),
        Ok(None) => return Err(Error::protocol("connection closed before hello")),
        Err(_) => return Err(Error::timeout("waiting for hello")),
    };

    framed
        .send(Frame {
            id: 0,
            body: FrameBody::Hello { address: local },
        })
        .await?;

    let peer = resolve_announced(announced, remote);
    debug!(remote = %remote, peer = %peer, "accepted control connection");
    ControlSocket::spawn(framed, peer, router);
    Ok(())
}

/// Replace an unspecified announced host with the address we saw.
fn resolve_announced(announced: PeerAddress, remote: SocketAddr) -> PeerAddress {
    let unspecified = announced.host.is_empty()
        || announced
            .host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_unspecified())
            .unwrap_or(false);
    if unspecified {
        PeerAddress::new(remote.ip().to_string(), announced.port)
    } else {
        announced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_announced_unspecified() {
        let remote: SocketAddr = "10.1.2.3:55000".parse().unwrap();
        let peer = resolve_announced(PeerAddress::new("0.0.0.0", 4000), remote);
        assert_eq!(peer, PeerAddress::new("10.1.2.3", 4000));

        let named = resolve_announced(PeerAddress::new("node-2.lab", 4000), remote);
        assert_eq!(named, PeerAddress::new("node-2.lab", 4000));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_connect_failure() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let (router, _rx) = Router::new();
        let local = PeerAddress::new("127.0.0.1", 1);
        let target = PeerAddress::new("127.0.0.1", port);
        let err = connect_control(&router, &local, &target, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConnectFailure);
    }

    #[tokio::test]
    async fn test_hello_exchange_and_routing() {
        let listener = open_control_listener("127.0.0.1:0").await.unwrap();
        let server_addr = PeerAddress::from(listener.local_addr().unwrap());
        let (server_router, mut server_inbox) = Router::new();
        let _accept = serve_control(
            listener,
            server_addr.clone(),
            server_router,
            Duration::from_secs(2),
        );

        let (client_router, _client_inbox) = Router::new();
        let client_addr = PeerAddress::new("127.0.0.1", 4999);
        let socket =
            connect_control(&client_router, &client_addr, &server_addr, Duration::from_secs(2))
                .await
                .unwrap();
        assert_eq!(socket.peer(), &server_addr);

        socket
            .send_frame(Frame {
                id: 0,
                body: FrameBody::OneWay {
                    message: Message::PmKill,
                },
            })
            .await
            .unwrap();

        let incoming = tokio::time::timeout(Duration::from_secs(2), server_inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!incoming.call);
        assert!(matches!(incoming.message, Message::PmKill));
        // The server learned our announced listener address, not the ephemeral port.
        assert_eq!(incoming.socket.peer(), &client_addr);

        socket.close().await;
        assert!(socket.is_closed());
        assert!(socket
            .send_frame(Frame {
                id: 0,
                body: FrameBody::OneWay {
                    message: Message::PmKill
                }
            })
            .await
            .is_err());
    }
}
