use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use quanta::Clock;

use crate::client::StatsdClient;
use crate::common::BuildError;
use crate::sinks::{MetricSink, UdpMetricSink};
use crate::{DEFAULT_HOST, DEFAULT_MAX_PACKET_SIZE, DEFAULT_NAMESPACE, DEFAULT_PORT};

/// Builder for creating and configuring a [`StatsdClient`].
pub struct StatsdBuilder {
    host: String,
    port: u16,
    namespace: String,
    app_name: String,
    max_packet_size: usize,
}

impl StatsdBuilder {
    /// Creates a new [`StatsdBuilder`] targeting the default aggregator
    /// endpoint (`127.0.0.1:8125`) with the default namespace and
    /// application name.
    pub fn new() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            namespace: DEFAULT_NAMESPACE.to_owned(),
            app_name: DEFAULT_NAMESPACE.to_owned(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Sets the host the aggregator listens on.
    #[must_use]
    pub fn with_host<H>(mut self, host: H) -> Self
    where
        H: Into<String>,
    {
        self.host = host.into();
        self
    }

    /// Sets the port the aggregator listens on.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the namespace prefixed to every metric key.
    ///
    /// Trailing dots are trimmed; an empty namespace means metrics go
    /// out under their bare keys. The namespace can later be changed at
    /// runtime through [`StatsdClient::set_namespace`].
    #[must_use]
    pub fn with_namespace<N>(mut self, namespace: N) -> Self
    where
        N: Into<String>,
    {
        self.namespace = namespace.into();
        self
    }

    /// Sets the application name used by the HTTP logging helpers when
    /// the caller doesn't pass one explicitly.
    #[must_use]
    pub fn with_app_name<N>(mut self, app_name: N) -> Self
    where
        N: Into<String>,
    {
        self.app_name = app_name.into();
        self
    }

    /// Sets the maximum size of datagrams flushed out of a batch.
    ///
    /// Defaults to 512 bytes, the conventional safe UDP payload size.
    #[must_use]
    pub fn set_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Resolves the endpoint, opens a local UDP socket, and builds the
    /// client.
    ///
    /// ## Errors
    ///
    /// Returns an error variant when the host/port pair cannot be
    /// resolved to a socket address, or when the local socket cannot be
    /// opened.
    pub fn build(self) -> Result<StatsdClient, BuildError> {
        let endpoint = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| BuildError::InvalidEndpoint(e.to_string()))?
            .next() // just use the first address we resolve to
            .ok_or_else(|| {
                BuildError::InvalidEndpoint(
                    "to_socket_addrs returned an empty iterator".to_string(),
                )
            })?;

        let socket = UdpSocket::bind(local_bind_addr(&endpoint))?;
        let sink = UdpMetricSink::from(endpoint, socket)?;
        Ok(self.build_parts(Box::new(sink), Clock::new()))
    }

    /// Builds a client that emits through the given sink instead of a
    /// freshly opened UDP socket.
    ///
    /// This is the seam tests use to capture payloads without touching
    /// the network, and it also allows custom transports.
    pub fn build_with_sink<S>(self, sink: S) -> StatsdClient
    where
        S: MetricSink + Send + Sync + 'static,
    {
        self.build_parts(Box::new(sink), Clock::new())
    }

    pub(crate) fn build_with_clock<S>(self, sink: S, clock: Clock) -> StatsdClient
    where
        S: MetricSink + Send + Sync + 'static,
    {
        self.build_parts(Box::new(sink), clock)
    }

    fn build_parts(self, sink: Box<dyn MetricSink + Send + Sync>, clock: Clock) -> StatsdClient {
        StatsdClient::new(
            self.namespace,
            self.app_name,
            self.max_packet_size,
            sink,
            clock,
        )
    }
}

impl Default for StatsdBuilder {
    fn default() -> Self {
        StatsdBuilder::new()
    }
}

fn local_bind_addr(endpoint: &SocketAddr) -> &'static str {
    if endpoint.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    }
}

#[cfg(test)]
mod tests {
    use super::StatsdBuilder;
    use crate::common::BuildError;
    use crate::sinks::NopMetricSink;

    #[test]
    fn test_default_configuration() {
        let client = StatsdBuilder::new().build_with_sink(NopMetricSink);
        assert_eq!(client.namespace(), "messagebird");
    }

    #[test]
    fn test_namespace_trailing_dots_trimmed() {
        let client = StatsdBuilder::new()
            .with_namespace("app.metrics.")
            .build_with_sink(NopMetricSink);
        assert_eq!(client.namespace(), "app.metrics");
    }

    #[test]
    fn test_unresolvable_host_is_rejected() {
        let err = StatsdBuilder::new()
            .with_host("nonexistent.invalid")
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidEndpoint(_)));
    }

    #[test]
    fn test_build_opens_socket_for_loopback() {
        let client = StatsdBuilder::new().build().unwrap();
        // Best-effort send with nothing listening; must not fail or panic.
        client.increment("boot");
    }
}
