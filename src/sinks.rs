use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use crossbeam_channel::{Receiver, Sender};

/// A destination for encoded StatsD payloads.
///
/// Payloads arrive verbatim: a single line for direct sends, or several
/// newline-joined lines for a batch flush. Implementations must not
/// block beyond what a datagram write requires and must not retry; the
/// client swallows whatever error `emit` returns.
pub trait MetricSink {
    /// Emit a payload, returning the number of bytes written.
    fn emit(&self, payload: &str) -> io::Result<usize>;
}

/// Sends each payload as one UDP datagram to a fixed address.
///
/// The socket stays unconnected; delivery is fire-and-forget and a send
/// failure carries no information beyond the underlying `io::Error`.
pub struct UdpMetricSink {
    socket: UdpSocket,
    addr: SocketAddr,
}

impl UdpMetricSink {
    /// Creates a sink sending to the first address `addr` resolves to,
    /// using the given local socket.
    pub fn from<A>(addr: A, socket: UdpSocket) -> io::Result<Self>
    where
        A: ToSocketAddrs,
    {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"))?;
        Ok(UdpMetricSink { socket, addr })
    }
}

impl MetricSink for UdpMetricSink {
    fn emit(&self, payload: &str) -> io::Result<usize> {
        self.socket.send_to(payload.as_bytes(), self.addr)
    }
}

/// Discards every payload.
///
/// Useful for disabling metrics collection entirely, or in tests that
/// don't care about the wire.
#[derive(Debug, Clone)]
pub struct NopMetricSink;

impl MetricSink for NopMetricSink {
    fn emit(&self, _payload: &str) -> io::Result<usize> {
        Ok(0)
    }
}

/// Captures every payload on a channel instead of the network.
///
/// Intended for tests: keep the receiver half and assert on exactly what
/// the client would have put on the wire.
pub struct SpyMetricSink {
    tx: Sender<String>,
}

impl SpyMetricSink {
    /// Creates a spy sink along with the receiver its payloads arrive on.
    pub fn new() -> (Receiver<String>, Self) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (rx, SpyMetricSink { tx })
    }
}

impl MetricSink for SpyMetricSink {
    fn emit(&self, payload: &str) -> io::Result<usize> {
        let written = payload.len();
        self.tx
            .send(payload.to_owned())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "spy receiver dropped"))?;
        Ok(written)
    }
}
