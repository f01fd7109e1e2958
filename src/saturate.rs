//! Link saturation with remote start and deferred stop.
//!
//! `amok_sat_start` is acknowledged at once; the saturator then negotiates a
//! measurement channel with the target (`amok_sat_begin`) and floods it one
//! chunk at a time. Between chunks it polls, without blocking, for an
//! `amok_sat_stop` call. A stop found there is answered with the report of
//! the whole flood, possibly long after it arrived. A flood that runs out its
//! duration first only logs its report, and a later stop gets `NotFound`.
//!
//! The dispatch loop of both endpoints is held for the whole flood.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bandwidth;
use crate::error::{Error, Result, ResultExt};
use crate::peer::{Handler, MessageType, Outcome, Peer, Request};
use crate::proto::{
    BandwidthSpec, Message, MessageKind, PeerAddress, Reply, SaturationReport, SaturationSpec,
};
use crate::transport::MeasurementChannel;

/// Flood bookkeeping kept on the saturating peer.
#[derive(Debug, Default)]
pub struct SaturationState {
    active: Option<ActiveFlood>,
    last: Option<SaturationReport>,
}

#[derive(Debug)]
struct ActiveFlood {
    target: PeerAddress,
    started: Instant,
}

impl SaturationState {
    pub fn is_flooding(&self) -> bool {
        self.active.is_some()
    }
}

/// Report of the most recent flood this peer finished, however it ended.
pub fn last_report(peer: &Peer) -> Option<&SaturationReport> {
    peer.saturation.last.as_ref()
}

fn report_of(bytes_sent: u64, elapsed: Duration) -> SaturationReport {
    let result = bandwidth::result_of(bytes_sent, elapsed);
    SaturationReport {
        elapsed_seconds: result.elapsed_seconds,
        bytes_per_second: result.bytes_per_second,
        bytes_sent,
    }
}

// ---------------------------------------------------------------------------
// Controller side
// ---------------------------------------------------------------------------

/// Tell `saturator` to flood the path towards `target`.
///
/// Returns once the saturator has acknowledged; the flood itself runs in the
/// saturator's dispatch loop. `message_size` 0 auto-tunes the chunk size,
/// `duration_sec` 0 floods until [`saturate_stop`].
pub async fn saturate_start(
    peer: &Peer,
    saturator: &PeerAddress,
    target: &PeerAddress,
    message_size: u64,
    duration_sec: u64,
) -> Result<()> {
    let socket = peer.connect(saturator).await?;
    let spec = SaturationSpec {
        target: target.clone(),
        message_size,
        duration_sec,
    };
    let reply = peer
        .rpc_call(&socket, peer.config().timeouts.rpc(), Message::SatStart(spec))
        .await;
    socket.close().await;
    match reply {
        Ok(Reply::Ack) => {
            info!(
                saturator = %saturator,
                target = %target,
                message_size,
                duration_sec,
                "saturation started"
            );
            Ok(())
        }
        Ok(other) => Err(other.unexpected("ack")),
        Err(e) => Err(e.context(format!("starting saturation {saturator} -> {target}"))),
    }
}

/// Stop the flood running on `saturator` and collect its report.
///
/// Fails `NotFound` when nothing is flooding, including a flood that already
/// ran out its duration. `Timeout` means the saturator never reached a poll
/// point within `timeout`.
pub async fn saturate_stop(
    peer: &Peer,
    saturator: &PeerAddress,
    timeout: Duration,
) -> Result<SaturationReport> {
    let socket = peer.connect(saturator).await?;
    let reply = peer.rpc_call(&socket, timeout, Message::SatStop).await;
    socket.close().await;
    match reply {
        Ok(Reply::Saturation(report)) => {
            info!(
                saturator = %saturator,
                elapsed_s = report.elapsed_seconds,
                bytes_per_second = report.bytes_per_second,
                "saturation stopped"
            );
            Ok(report)
        }
        Ok(other) => Err(other.unexpected("saturation")),
        Err(e) => Err(e.context(format!("stopping saturation on {saturator}"))),
    }
}

// ---------------------------------------------------------------------------
// Saturator
// ---------------------------------------------------------------------------

/// Chunk size from a quick bandwidth probe: about one second of the path.
async fn autotune(peer: &Peer, target: &PeerAddress) -> Result<u64> {
    let cfg = &peer.config().saturation;
    let probe = BandwidthSpec {
        buffer_size: 0,
        message_size: cfg.probe_message_size,
        message_count: 1,
        min_duration_ms: cfg.probe_min_duration_ms,
    };
    let result = bandwidth::test(peer, target, probe)
        .await
        .map_err(|e| e.context("probing path for message size"))?;
    let size = (result.bytes_per_second as u64).clamp(1, cfg.max_message_size);
    debug!(
        target = %target,
        bytes_per_second = result.bytes_per_second,
        message_size = size,
        "flood chunk auto-tuned"
    );
    Ok(size)
}

/// Flood chunks are held in memory on both ends.
fn check_chunk(peer: &Peer, message_size: u64) -> Result<()> {
    let max = peer.config().saturation.max_message_size;
    if message_size > max {
        return Err(Error::protocol(format!(
            "flood message size {message_size} exceeds the {max} byte limit"
        )));
    }
    Ok(())
}

enum FloodEnd {
    Stopped(Request),
    Expired,
}

struct StartHandler;

#[async_trait]
impl Handler for StartHandler {
    async fn handle(&self, peer: &mut Peer, request: Request) -> Result<Outcome> {
        let Message::SatStart(spec) = request.message else {
            return Err(Error::protocol("amok_sat_start handler got another message"));
        };
        let conversation = request
            .conversation
            .ok_or_else(|| Error::protocol("amok_sat_start sent one-way"))?;
        if let Some(active) = &peer.saturation.active {
            return Err(Error::Conflict(format!(
                "already flooding {} for {:?}",
                active.target,
                active.started.elapsed()
            )));
        }
        check_chunk(peer, spec.message_size)?;
        peer.rpc_return(conversation, Reply::Ack).await?;
        flood(peer, spec).await?;
        Ok(Outcome::Handled)
    }
}

async fn flood(peer: &mut Peer, spec: SaturationSpec) -> Result<()> {
    let timeouts = peer.config().timeouts.clone();
    let target = spec.target;
    let message_size = match spec.message_size {
        0 => autotune(peer, &target).await?,
        n => n,
    };

    let socket = peer
        .connect(&target)
        .await
        .map_err(|e| e.context("starting flood"))?;
    let begin = Message::SatBegin {
        message_size,
        duration_sec: spec.duration_sec,
    };
    let begun = peer.rpc_call(&socket, timeouts.handshake(), begin).await;
    let channel = match begun {
        Ok(Reply::SatBegun { port }) => {
            MeasurementChannel::connect(&socket.peer().host, port, 0, timeouts.connect())
                .await
                .step("connecting flood channel")
        }
        Ok(other) => Err(other.unexpected("sat_begun")),
        Err(e) => Err(e.context(format!("amok_sat_begin with {target}"))),
    };
    socket.close().await;
    let mut channel = channel?;

    peer.saturation.active = Some(ActiveFlood {
        target: target.clone(),
        started: Instant::now(),
    });
    info!(target = %target, message_size, duration_sec = spec.duration_sec, "flooding");

    let duration = Duration::from_secs(spec.duration_sec);
    let transfer = timeouts.transfer();
    let start = Instant::now();
    let mut sent = 0u64;
    let end = loop {
        if let Err(e) = channel.send(message_size, message_size, transfer).await {
            break Err(e);
        }
        sent += message_size;
        if let Some(stop) = peer.poll(MessageKind::SatStop) {
            break Ok(FloodEnd::Stopped(stop));
        }
        if spec.duration_sec > 0 && start.elapsed() >= duration {
            break Ok(FloodEnd::Expired);
        }
    };
    let report = report_of(sent, start.elapsed());
    channel.close().await;
    peer.saturation.active = None;
    peer.saturation.last = Some(report.clone());

    match end {
        Ok(FloodEnd::Stopped(stop)) => {
            info!(
                target = %target,
                stopped_by = %stop.sender.peer(),
                elapsed_s = report.elapsed_seconds,
                bytes_per_second = report.bytes_per_second,
                bytes = report.bytes_sent,
                "flood stopped"
            );
            match stop.conversation {
                Some(conversation) => {
                    peer.rpc_return(conversation, Reply::Saturation(report)).await
                }
                None => Ok(()),
            }
        }
        Ok(FloodEnd::Expired) => {
            info!(
                target = %target,
                elapsed_s = report.elapsed_seconds,
                bytes_per_second = report.bytes_per_second,
                bytes = report.bytes_sent,
                "flood duration expired"
            );
            Ok(())
        }
        Err(e) => {
            let e = e.context(format!("flooding {target} after {sent} bytes"));
            warn!(target = %target, error = %e, "flood aborted");
            let queued = peer.poll(MessageKind::SatStop).and_then(|r| r.conversation);
            if let Some(conversation) = queued {
                let caller = conversation.caller().clone();
                if let Err(delivery) = peer.rpc_fail(conversation, e.clone()).await {
                    warn!(caller = %caller, error = %delivery, "could not deliver flood failure");
                }
            }
            Err(e)
        }
    }
}

struct StopHandler;

#[async_trait]
impl Handler for StopHandler {
    async fn handle(&self, peer: &mut Peer, _request: Request) -> Result<Outcome> {
        Err(Error::NotFound(format!("no saturation running on {}", peer.address())))
    }
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

struct BeginHandler;

#[async_trait]
impl Handler for BeginHandler {
    async fn handle(&self, peer: &mut Peer, request: Request) -> Result<Outcome> {
        let Message::SatBegin { message_size, .. } = request.message else {
            return Err(Error::protocol("amok_sat_begin handler got another message"));
        };
        let conversation = request
            .conversation
            .ok_or_else(|| Error::protocol("amok_sat_begin sent one-way"))?;
        let saturator = request.sender.peer().clone();
        let timeouts = peer.config().timeouts.clone();
        check_chunk(peer, message_size)?;

        let listener = peer.measurement_listener(0).step("opening flood listener")?;
        peer.rpc_return(conversation, Reply::SatBegun { port: listener.port() })
            .await?;
        let mut channel = listener
            .accept(timeouts.transfer())
            .await
            .step("accepting flood channel")?;

        // A quiet channel means the saturator stopped.
        let drained = channel
            .drain_until_idle(message_size, timeouts.saturation_idle())
            .await;
        channel.close().await;
        let (bytes, active) = drained.step("receiving flood")?;
        let rate = bandwidth::result_of(bytes, active);
        info!(
            saturator = %saturator,
            bytes,
            elapsed_s = rate.elapsed_seconds,
            bytes_per_second = rate.bytes_per_second,
            "saturation received"
        );
        Ok(Outcome::Handled)
    }
}

/// Register the saturation message types and handlers on `peer`.
///
/// Also installs the bandwidth protocol, which the auto-tune probe uses.
pub fn init(peer: &mut Peer) -> Result<()> {
    bandwidth::init(peer)?;
    peer.register_message_type(MessageType::rpc(MessageKind::SatStart))?;
    peer.register_message_type(MessageType::rpc(MessageKind::SatBegin))?;
    peer.register_message_type(MessageType::rpc(MessageKind::SatStop))?;
    peer.register_handler(MessageKind::SatStart, StartHandler);
    peer.register_handler(MessageKind::SatBegin, BeginHandler);
    peer.register_handler(MessageKind::SatStop, StopHandler);
    Ok(())
}
