//! Controller-side compositions of the bandwidth and saturation protocols.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bandwidth;
use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::proto::{BandwidthResult, BandwidthSpec, PeerAddress, SaturationReport};
use crate::saturate;

/// Bandwidth from `from` to `to`, measured between the two of them.
pub async fn pairwise(
    peer: &Peer,
    from: &PeerAddress,
    to: &PeerAddress,
    spec: BandwidthSpec,
) -> Result<BandwidthResult> {
    bandwidth::request(peer, from, to, spec).await
}

/// `matrix[i][j]` is the bandwidth from `hosts[i]` to `hosts[j]`; the
/// diagonal stays `None`.
pub type BandwidthMatrix = Vec<Vec<Option<BandwidthResult>>>;

/// Test every ordered pair of `hosts`, one at a time.
///
/// The first failure aborts the whole run.
pub async fn matrix(
    peer: &Peer,
    hosts: &[PeerAddress],
    spec: BandwidthSpec,
) -> Result<BandwidthMatrix> {
    let n = hosts.len();
    let mut out: BandwidthMatrix = vec![vec![None; n]; n];
    for (i, from) in hosts.iter().enumerate() {
        for (j, to) in hosts.iter().enumerate() {
            if i == j {
                continue;
            }
            let result = bandwidth::request(peer, from, to, spec)
                .await
                .map_err(|e| e.context(format!("matrix cell {from} -> {to}")))?;
            out[i][j] = Some(result);
        }
    }
    info!(hosts = n, tests = n * n.saturating_sub(1), "bandwidth matrix complete");
    Ok(out)
}

/// Bandwidth of one path measured alone and again while another path is
/// flooded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaturationComparison {
    pub baseline: BandwidthResult,
    pub saturated: BandwidthResult,
    pub flood: SaturationReport,
}

impl SaturationComparison {
    /// Saturated over baseline throughput.
    pub fn ratio(&self) -> f64 {
        if self.baseline.bytes_per_second > 0.0 {
            self.saturated.bytes_per_second / self.baseline.bytes_per_second
        } else {
            0.0
        }
    }
}

/// Measure `tested` alone, then under an unbounded flood along `flooded`.
///
/// Both flood endpoints are busy for the whole flood, so the two pairs must
/// not share a peer.
pub async fn compare_under_saturation(
    peer: &Peer,
    tested: (&PeerAddress, &PeerAddress),
    flooded: (&PeerAddress, &PeerAddress),
    spec: BandwidthSpec,
    flood_message_size: u64,
) -> Result<SaturationComparison> {
    let (from, to) = tested;
    let (saturator, target) = flooded;
    if [from, to].iter().any(|p| *p == saturator || *p == target) {
        return Err(Error::Conflict(format!(
            "tested pair {from} -> {to} overlaps flooded pair {saturator} -> {target}"
        )));
    }

    let baseline = bandwidth::request(peer, from, to, spec)
        .await
        .map_err(|e| e.context("baseline measurement"))?;

    saturate::saturate_start(peer, saturator, target, flood_message_size, 0).await?;
    let saturated = bandwidth::request(peer, from, to, spec).await;
    let stop_timeout = peer.config().timeouts.stop();
    let flood = saturate::saturate_stop(peer, saturator, stop_timeout).await;

    let saturated = saturated.map_err(|e| e.context("measurement under saturation"))?;
    let flood = flood?;
    let comparison = SaturationComparison {
        baseline,
        saturated,
        flood,
    };
    if comparison.ratio() >= 1.0 {
        warn!(from = %from, to = %to, ratio = comparison.ratio(), "no slowdown under saturation");
    }
    info!(
        from = %from,
        to = %to,
        baseline_bps = comparison.baseline.bytes_per_second,
        saturated_bps = comparison.saturated.bytes_per_second,
        "saturation comparison complete"
    );
    Ok(comparison)
}
