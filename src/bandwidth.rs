//! Point-to-point bandwidth test.
//!
//! The initiator and the responder each open a measurement listener and
//! connect to the other's, so every test uses two fresh channels: payload
//! flows initiator -> responder, the one-byte ack flows back. The handshake
//! runs on the control socket; nothing but payload and ack is timed.
//!
//! A round that finishes faster than `min_duration_ms` is re-run over the
//! same channels with a larger `message_size`. The initiator announces each
//! decision with a one-way `BW reask`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Error, Result, ResultExt};
use crate::peer::{Handler, MessageType, Outcome, Peer, Request};
use crate::proto::{BandwidthResult, BandwidthSpec, Message, MessageKind, PeerAddress, Reply};
use crate::transport::{ControlSocket, MeasurementChannel};

/// Turn a byte count and a duration into a result stamped now.
pub fn result_of(bytes: u64, elapsed: Duration) -> BandwidthResult {
    let secs = elapsed.as_secs_f64().max(f64::MIN_POSITIVE);
    BandwidthResult {
        elapsed_seconds: secs,
        bytes_per_second: bytes as f64 / secs,
        measured_at: Utc::now(),
    }
}

/// Spec for the next round, or `None` when the last one was long enough.
fn next_round(
    spec: &BandwidthSpec,
    elapsed: Duration,
    max_message_size: u64,
) -> Option<BandwidthSpec> {
    let min = Duration::from_millis(spec.min_duration_ms);
    if elapsed >= min
        || spec.message_size == 0
        || spec.message_count == 0
        || spec.message_size >= max_message_size
    {
        return None;
    }
    let factor = if elapsed.is_zero() {
        4.0
    } else {
        min.as_secs_f64() / elapsed.as_secs_f64()
    };
    let grown = (spec.message_size as f64 * factor).ceil() as u64;
    Some(BandwidthSpec {
        message_size: grown.clamp(spec.message_size + 1, max_message_size),
        ..*spec
    })
}

// ---------------------------------------------------------------------------
// Initiator
// ---------------------------------------------------------------------------

/// Measure the bandwidth from `peer` to `target`.
pub async fn test(
    peer: &Peer,
    target: &PeerAddress,
    spec: BandwidthSpec,
) -> Result<BandwidthResult> {
    spec.validate(peer.config().saturation.max_message_size)?;
    let socket = peer
        .connect(target)
        .await
        .map_err(|e| e.context(format!("bandwidth test to {target}")))?;
    let result = initiate(peer, &socket, spec).await;
    socket.close().await;
    match &result {
        Ok(r) => info!(
            from = %peer.address(),
            to = %target,
            elapsed_s = r.elapsed_seconds,
            bytes_per_second = r.bytes_per_second,
            "bandwidth test finished"
        ),
        Err(e) => debug!(to = %target, error = %e, "bandwidth test failed"),
    }
    result
}

async fn initiate(
    peer: &Peer,
    socket: &ControlSocket,
    spec: BandwidthSpec,
) -> Result<BandwidthResult> {
    let timeouts = &peer.config().timeouts;
    let listener = peer
        .measurement_listener(spec.buffer_size)
        .step("opening measurement listener")?;

    let handshake = Message::BwHandshake {
        port: listener.port(),
        spec,
    };
    let port = match peer.rpc_call(socket, timeouts.handshake(), handshake).await {
        Ok(Reply::Handshake { port, .. }) => port,
        Ok(other) => return Err(other.unexpected("handshake")),
        Err(e) => return Err(e.context(format!("BW handshake with {}", socket.peer()))),
    };

    let mut out =
        MeasurementChannel::connect(&socket.peer().host, port, spec.buffer_size, timeouts.connect())
            .await
            .step("connecting measurement channel")?;
    let mut ack = match listener.accept(timeouts.transfer()).await {
        Ok(channel) => channel,
        Err(e) => {
            out.close().await;
            return Err(e.context("accepting measurement channel"));
        }
    };

    let result = send_rounds(peer, socket, &mut out, &mut ack, spec).await;
    out.close().await;
    ack.close().await;
    result
}

async fn send_rounds(
    peer: &Peer,
    socket: &ControlSocket,
    out: &mut MeasurementChannel,
    ack: &mut MeasurementChannel,
    mut spec: BandwidthSpec,
) -> Result<BandwidthResult> {
    let transfer = peer.config().timeouts.transfer();
    let max = peer.config().saturation.max_message_size;
    loop {
        let bytes = spec.total_bytes()?;
        let start = Instant::now();
        out.send(bytes, spec.message_size, transfer)
            .await
            .step("sending experiment payload")?;
        ack.recv(1, 1, transfer).await.step("waiting for ack")?;
        let elapsed = start.elapsed();

        let next = next_round(&spec, elapsed, max);
        peer.send(socket, Message::BwReask { spec: next }).await?;
        match next {
            Some(grown) => {
                debug!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    min_ms = spec.min_duration_ms,
                    message_size = grown.message_size,
                    "round too short, re-asking"
                );
                spec = grown;
            }
            None => return Ok(result_of(bytes, elapsed)),
        }
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

struct HandshakeHandler;

#[async_trait]
impl Handler for HandshakeHandler {
    async fn handle(&self, peer: &mut Peer, request: Request) -> Result<Outcome> {
        let Message::BwHandshake { port, spec } = request.message else {
            return Err(Error::protocol("BW handshake handler got another message"));
        };
        let conversation = request
            .conversation
            .ok_or_else(|| Error::protocol("BW handshake sent one-way"))?;
        let initiator = request.sender.peer().clone();
        let timeouts = peer.config().timeouts.clone();
        spec.validate(peer.config().saturation.max_message_size)?;

        let listener = peer
            .measurement_listener(spec.buffer_size)
            .step("opening measurement listener")?;
        peer.rpc_return(
            conversation,
            Reply::Handshake {
                port: listener.port(),
                spec,
            },
        )
        .await?;
        debug!(initiator = %initiator, port = listener.port(), "BW handshake answered");

        let mut ack =
            MeasurementChannel::connect(&initiator.host, port, spec.buffer_size, timeouts.connect())
                .await
                .step("connecting measurement channel")?;
        let mut payload = match listener.accept(timeouts.transfer()).await {
            Ok(channel) => channel,
            Err(e) => {
                ack.close().await;
                return Err(e.context("accepting measurement channel"));
            }
        };

        let result = receive_rounds(peer, &mut payload, &mut ack, spec).await;
        payload.close().await;
        ack.close().await;
        result?;
        Ok(Outcome::Handled)
    }
}

async fn receive_rounds(
    peer: &mut Peer,
    payload: &mut MeasurementChannel,
    ack: &mut MeasurementChannel,
    mut spec: BandwidthSpec,
) -> Result<()> {
    let transfer = peer.config().timeouts.transfer();
    let max = peer.config().saturation.max_message_size;
    loop {
        payload
            .recv(spec.validate(max)?, spec.message_size, transfer)
            .await
            .step("receiving experiment payload")?;
        ack.send(1, 1, transfer).await.step("sending ack")?;

        let reask = peer.wait(transfer, MessageKind::BwReask).await?;
        match reask.message {
            Message::BwReask { spec: Some(next) } => spec = next,
            Message::BwReask { spec: None } => return Ok(()),
            other => {
                return Err(Error::protocol(format!(
                    "expected BW reask, got {}",
                    other.kind()
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrated variant
// ---------------------------------------------------------------------------

/// Ask `from` to run a bandwidth test towards `to` and report back.
///
/// The caller stays off the data path.
pub async fn request(
    peer: &Peer,
    from: &PeerAddress,
    to: &PeerAddress,
    spec: BandwidthSpec,
) -> Result<BandwidthResult> {
    let socket = peer.connect(from).await?;
    let msg = Message::BwRequest {
        target: to.clone(),
        spec,
    };
    let reply = peer
        .rpc_call(&socket, peer.config().timeouts.bw_request(), msg)
        .await;
    socket.close().await;
    match reply {
        Ok(Reply::Bandwidth(result)) => Ok(result),
        Ok(other) => Err(other.unexpected("bandwidth")),
        Err(e) => Err(e.context(format!("BW request {from} -> {to}"))),
    }
}

struct RequestHandler;

#[async_trait]
impl Handler for RequestHandler {
    async fn handle(&self, peer: &mut Peer, request: Request) -> Result<Outcome> {
        let Message::BwRequest { target, spec } = request.message else {
            return Err(Error::protocol("BW request handler got another message"));
        };
        debug!(controller = %request.sender.peer(), target = %target, "BW request");
        spec.validate(peer.config().saturation.max_message_size)?;
        let result = test(peer, &target, spec).await?;
        Ok(Outcome::Reply(Reply::Bandwidth(result)))
    }
}

/// Register the bandwidth message types and handlers on `peer`.
pub fn init(peer: &mut Peer) -> Result<()> {
    peer.register_message_type(MessageType::rpc(MessageKind::BwHandshake))?;
    peer.register_message_type(MessageType::oneway(MessageKind::BwReask))?;
    peer.register_message_type(MessageType::rpc(MessageKind::BwRequest))?;
    peer.register_handler(MessageKind::BwHandshake, HandshakeHandler);
    peer.register_handler(MessageKind::BwRequest, RequestHandler);
    Ok(())
}
