//! Measurement channels: raw, unframed TCP streams that carry only timed
//! experiment payload.
//!
//! A listener accepts exactly one channel and is consumed by doing so. A
//! channel is used for one experiment and then closed; nothing else is ever
//! multiplexed on it.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tracing::debug;

use crate::error::{Error, Result};

/// Listener for a single inbound measurement channel.
pub struct MeasurementListener {
    listener: TcpListener,
    port: u16,
}

impl MeasurementListener {
    /// Bind an ephemeral-port listener on `ip`.
    ///
    /// `buffer_size` sets the receive buffer inherited by the accepted
    /// channel; 0 keeps the OS default.
    pub fn open(ip: IpAddr, buffer_size: u32) -> Result<Self> {
        let socket = new_socket(ip)?;
        if buffer_size > 0 {
            socket.set_recv_buffer_size(buffer_size)?;
        }
        socket.bind(SocketAddr::new(ip, 0))?;
        let listener = socket.listen(1)?;
        let port = listener.local_addr()?.port();
        debug!(port, buffer_size, "measurement listener open");
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept the one channel this listener exists for.
    pub async fn accept(self, timeout: Duration) -> Result<MeasurementChannel> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(Ok((stream, remote))) => {
                stream.set_nodelay(true)?;
                debug!(port = self.port, remote = %remote, "measurement channel accepted");
                Ok(MeasurementChannel::new(stream))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::timeout(format!(
                "no measurement connection on port {} within {:?}",
                self.port, timeout
            ))),
        }
    }
}

/// One raw measurement stream.
#[derive(Debug)]
pub struct MeasurementChannel {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl MeasurementChannel {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Connect to a peer's measurement listener.
    pub async fn connect(
        host: &str,
        port: u16,
        buffer_size: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let target = resolve(host, port).await?;
        let socket = new_socket(target.ip())?;
        if buffer_size > 0 {
            socket.set_send_buffer_size(buffer_size)?;
        }
        let stream = match tokio::time::timeout(timeout, socket.connect(target)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(Error::ConnectFailure {
                    addr: crate::proto::PeerAddress::new(host, port),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::timeout(format!("measurement connect to {target}"))),
        };
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    fn ensure_buf(&mut self, size: usize) {
        if self.buf.len() < size {
            self.buf.resize(size, 0);
        }
    }

    /// Write `bytes` bytes in writes of at most `chunk_size`, each bounded by
    /// `timeout`.
    pub async fn send(&mut self, bytes: u64, chunk_size: u64, timeout: Duration) -> Result<()> {
        let chunk_size = chunk_size.max(1);
        self.ensure_buf(bytes.min(chunk_size) as usize);
        let mut remaining = bytes;
        while remaining > 0 {
            let n = remaining.min(chunk_size) as usize;
            match tokio::time::timeout(timeout, self.stream.write_all(&self.buf[..n])).await {
                Ok(Ok(())) => remaining -= n as u64,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(Error::timeout(format!(
                        "measurement send stalled with {remaining} of {bytes} bytes left"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Read exactly `bytes` bytes; each read is bounded by `timeout`.
    pub async fn recv(&mut self, bytes: u64, chunk_size: u64, timeout: Duration) -> Result<()> {
        let chunk_size = chunk_size.max(1);
        self.ensure_buf(bytes.min(chunk_size) as usize);
        let mut got = 0u64;
        while got < bytes {
            let want = (bytes - got).min(chunk_size) as usize;
            match tokio::time::timeout(timeout, self.stream.read(&mut self.buf[..want])).await {
                Ok(Ok(0)) => {
                    return Err(Error::protocol(format!(
                        "measurement channel closed after {got} of {bytes} bytes"
                    )))
                }
                Ok(Ok(n)) => got += n as u64,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(Error::timeout(format!(
                        "measurement receive stalled after {got} of {bytes} bytes"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Read until the sender goes quiet for `idle` or closes the stream.
    ///
    /// Returns the bytes received and the time from the first byte to the
    /// last one. Idle expiry is the normal end, not an error.
    pub async fn drain_until_idle(
        &mut self,
        chunk_size: u64,
        idle: Duration,
    ) -> Result<(u64, Duration)> {
        let size = chunk_size.clamp(1, 1 << 20) as usize;
        self.ensure_buf(size);
        let mut total = 0u64;
        let mut first: Option<Instant> = None;
        let mut last = Instant::now();
        loop {
            match tokio::time::timeout(idle, self.stream.read(&mut self.buf[..size])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    total += n as u64;
                    let now = Instant::now();
                    first.get_or_insert(now);
                    last = now;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }
        let active = first.map(|f| last.duration_since(f)).unwrap_or_default();
        Ok((total, active))
    }

    /// Shut the write side down and drop the stream.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!(error = %e, "measurement channel shutdown");
        }
    }
}

fn new_socket(ip: IpAddr) -> Result<TcpSocket> {
    let socket = match ip {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    Ok(socket)
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = lookup_host((host, port))
        .await
        .map_err(|e| Error::ConnectFailure {
            addr: crate::proto::PeerAddress::new(host, port),
            reason: format!("cannot resolve: {e}"),
        })?;
    addrs.next().ok_or_else(|| Error::ConnectFailure {
        addr: crate::proto::PeerAddress::new(host, port),
        reason: "host resolved to no address".into(),
    })
}
