use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use quanta::{Clock, Instant};
use tracing::{error, warn};

use crate::formatting::{split_into_datagrams, write_metric_line, MetricKind};
use crate::memory;
use crate::sampler;
use crate::sinks::MetricSink;

/// Mutable client state behind one lock: everything the emitting
/// operations read or write besides the sink itself.
struct ClientState {
    namespace: String,
    timers: HashMap<String, Instant>,
    memory_profiles: HashMap<String, i64>,
    /// `Some` iff a batch is open; holds the already-encoded lines.
    batch: Option<Vec<String>>,
}

/// Client for emitting StatsD metrics through a [`MetricSink`].
///
/// Every emitting operation is fire-and-forget: it encodes the event,
/// applies the sampling gate, and either sends a datagram right away or
/// appends the line to an open batch. Nothing on the emitting path
/// returns an error; transport failures are logged and swallowed so
/// instrumentation can never destabilize the instrumented application.
///
/// Instances are created through [`StatsdBuilder`](crate::StatsdBuilder).
///
/// # Threading
///
/// The client is `Send + Sync` and may be shared across threads behind
/// an `Arc`. Namespace, timers, memory profiles, and the batch buffer
/// live behind a single mutex; within one instance, non-batched metrics
/// go out in call order.
pub struct StatsdClient {
    state: Mutex<ClientState>,
    app_name: String,
    max_packet_size: usize,
    clock: Clock,
    sink: Box<dyn MetricSink + Send + Sync>,
}

impl StatsdClient {
    pub(crate) fn new(
        namespace: String,
        app_name: String,
        max_packet_size: usize,
        sink: Box<dyn MetricSink + Send + Sync>,
        clock: Clock,
    ) -> Self {
        StatsdClient {
            state: Mutex::new(ClientState {
                namespace: formatted_namespace(&namespace),
                timers: HashMap::new(),
                memory_profiles: HashMap::new(),
                batch: None,
            }),
            app_name,
            max_packet_size,
            clock,
            sink,
        }
    }

    /// Increments the counter under `key` by one.
    pub fn increment(&self, key: &str) {
        self.count(key, 1);
    }

    /// Increments the counter under `key` by one, at the given sample
    /// rate.
    pub fn increment_sampled(&self, key: &str, sample_rate: f64) {
        self.count_sampled(key, 1, sample_rate);
    }

    /// Decrements the counter under `key` by one.
    pub fn decrement(&self, key: &str) {
        self.count(key, -1);
    }

    /// Decrements the counter under `key` by one, at the given sample
    /// rate.
    pub fn decrement_sampled(&self, key: &str, sample_rate: f64) {
        self.count_sampled(key, -1, sample_rate);
    }

    /// Adds an arbitrary signed delta to the counter under `key`.
    pub fn count(&self, key: &str, value: i64) {
        self.count_sampled(key, value, 1.0);
    }

    /// Adds an arbitrary signed delta to the counter under `key`, at the
    /// given sample rate.
    pub fn count_sampled(&self, key: &str, value: i64, sample_rate: f64) {
        self.emit(key, value, MetricKind::Counter, sample_rate);
    }

    /// Records a timing of `value_ms` milliseconds under `key`.
    pub fn timing(&self, key: &str, value_ms: u64) {
        self.timing_sampled(key, value_ms, 1.0);
    }

    /// Records a timing of `value_ms` milliseconds under `key`, at the
    /// given sample rate.
    pub fn timing_sampled(&self, key: &str, value_ms: u64, sample_rate: f64) {
        self.emit(key, value_ms, MetricKind::Timing, sample_rate);
    }

    /// Records the current monotonic time under `key`. No network
    /// effect.
    ///
    /// Starting a key that is already started overwrites the earlier
    /// start: the last start wins.
    pub fn start_timing(&self, key: &str) {
        let now = self.clock.now();
        self.state.lock().timers.insert(key.to_owned(), now);
    }

    /// Ends the timing started for `key`, emitting and returning the
    /// elapsed milliseconds.
    ///
    /// Returns `None` without emitting anything when no start exists for
    /// `key`; callers must treat that as "no measurement" rather than a
    /// zero duration.
    pub fn end_timing(&self, key: &str) -> Option<u64> {
        self.end_timing_sampled(key, 1.0)
    }

    /// Ends the timing started for `key` at the given sample rate; see
    /// [`end_timing`](Self::end_timing).
    pub fn end_timing_sampled(&self, key: &str, sample_rate: f64) -> Option<u64> {
        let now = self.clock.now();
        let started = self.state.lock().timers.remove(key)?;
        let elapsed = now.duration_since(started).as_millis() as u64;
        self.timing_sampled(key, elapsed, sample_rate);
        Some(elapsed)
    }

    /// Snapshots the process's current resident memory under `key`. No
    /// network effect.
    ///
    /// Tracked separately from timings, so a timing and a memory profile
    /// may share a key. Last start wins, as with
    /// [`start_timing`](Self::start_timing). When the platform offers no
    /// memory reading the snapshot is skipped and the matching end
    /// returns `None`.
    pub fn start_memory_profile(&self, key: &str) {
        let Some(bytes) = self.read_memory() else {
            return;
        };
        self.state.lock().memory_profiles.insert(key.to_owned(), bytes);
    }

    /// Ends the memory profile started for `key`, emitting and returning
    /// the byte delta since the start.
    ///
    /// Returns `None` without emitting anything when no profile was
    /// started for `key`.
    pub fn end_memory_profile(&self, key: &str) -> Option<i64> {
        self.end_memory_profile_sampled(key, 1.0)
    }

    /// Ends the memory profile started for `key` at the given sample
    /// rate; see [`end_memory_profile`](Self::end_memory_profile).
    pub fn end_memory_profile_sampled(&self, key: &str, sample_rate: f64) -> Option<i64> {
        let started = self.state.lock().memory_profiles.remove(key)?;
        let current = self.read_memory()?;
        let delta = current - started;
        self.memory_sampled(key, Some(delta), sample_rate);
        Some(delta)
    }

    /// Emits a memory-usage event for `key`.
    ///
    /// With `None`, the process's current resident memory is sampled; if
    /// that reading is unavailable the event is skipped.
    pub fn memory(&self, key: &str, value: Option<i64>) {
        self.memory_sampled(key, value, 1.0);
    }

    /// Emits a memory-usage event for `key` at the given sample rate;
    /// see [`memory`](Self::memory).
    pub fn memory_sampled(&self, key: &str, value: Option<i64>, sample_rate: f64) {
        let Some(bytes) = value.or_else(|| self.read_memory()) else {
            return;
        };
        self.emit(key, bytes, MetricKind::MemoryUsage, sample_rate);
    }

    /// Records an absolute gauge value under `key`.
    ///
    /// Gauges always go out at rate 1; there is no sampled variant
    /// because dropping point-in-time observations loses data rather
    /// than traffic.
    pub fn gauge(&self, key: &str, value: f64) {
        self.emit(key, value, MetricKind::Gauge, 1.0);
    }

    /// Counts `value` as a member of the set under `key`.
    ///
    /// Sets always go out at rate 1, like gauges.
    pub fn set(&self, key: &str, value: i64) {
        self.emit(key, value, MetricKind::Set, 1.0);
    }

    /// Runs `block`, emits its wall-clock duration as a timing under
    /// `key`, and returns the block's value.
    ///
    /// The timing is emitted even when the block panics; the panic then
    /// propagates to the caller unchanged.
    pub fn time<F, T>(&self, key: &str, block: F) -> T
    where
        F: FnOnce() -> T,
    {
        self.time_sampled(key, 1.0, block)
    }

    /// Runs `block` and emits its duration at the given sample rate; see
    /// [`time`](Self::time).
    pub fn time_sampled<F, T>(&self, key: &str, sample_rate: f64, block: F) -> T
    where
        F: FnOnce() -> T,
    {
        let _guard = TimeGuard {
            client: self,
            key,
            sample_rate,
            started: self.clock.now(),
        };
        block()
    }

    /// Replaces the namespace prefix for all metrics encoded after this
    /// call.
    ///
    /// Lines already sitting in an open batch keep the prefix they were
    /// encoded with.
    pub fn set_namespace<N>(&self, namespace: N)
    where
        N: Into<String>,
    {
        self.state.lock().namespace = formatted_namespace(&namespace.into());
    }

    /// Returns the current namespace prefix.
    pub fn namespace(&self) -> String {
        self.state.lock().namespace.clone()
    }

    /// Returns whether the client is currently accumulating a batch.
    pub fn is_batch(&self) -> bool {
        self.state.lock().batch.is_some()
    }

    /// Switches to batching: emitting operations append their encoded
    /// lines to an in-memory buffer instead of sending them.
    ///
    /// Nested batches are not supported; starting while a batch is
    /// already open is a no-op that keeps the open buffer and its
    /// contents.
    pub fn start_batch(&self) {
        let mut state = self.state.lock();
        if state.batch.is_none() {
            state.batch = Some(Vec::new());
        }
    }

    /// Ends the batch, flushing buffered lines as newline-joined
    /// datagrams no larger than the configured max packet size.
    ///
    /// Lines are never split across datagrams. An empty batch sends
    /// nothing. A no-op when no batch is open.
    pub fn end_batch(&self) {
        let lines = match self.state.lock().batch.take() {
            Some(lines) => lines,
            None => return,
        };
        for datagram in split_into_datagrams(&lines, self.max_packet_size) {
            self.transmit(&datagram);
        }
    }

    /// Ends the batch, discarding buffered lines without transmitting
    /// anything.
    pub fn cancel_batch(&self) {
        self.state.lock().batch = None;
    }

    /// Increments `<app>.http_response.<status>`.
    ///
    /// The application name defaults to the one configured at build
    /// time.
    pub fn log_http_response(&self, status: u16, app_name: Option<&str>) {
        let app = app_name.unwrap_or(&self.app_name);
        self.increment(&format!("{app}.http_response.{status}"));
    }

    /// Records a response time under `<app>.response_time_ms`.
    pub fn log_response_time(&self, value_ms: u64, app_name: Option<&str>) {
        let app = app_name.unwrap_or(&self.app_name);
        self.timing(&format!("{app}.response_time_ms"), value_ms);
    }

    /// Records both the status bucket and the response time of a failed
    /// request.
    ///
    /// Callers pass the HTTP status explicitly; without one the status
    /// bucket is `0`.
    pub fn log_error(&self, value_ms: u64, status: Option<u16>, app_name: Option<&str>) {
        self.log_http_response(status.unwrap_or(0), app_name);
        self.log_response_time(value_ms, app_name);
    }

    /// Gate, encode, and route one metric event.
    ///
    /// The sampling gate runs before any encoding work.
    fn emit<V>(&self, key: &str, value: V, kind: MetricKind, sample_rate: f64)
    where
        V: fmt::Display,
    {
        let rate = if kind.sampled() {
            sampler::clamp_rate(sample_rate)
        } else {
            1.0
        };
        if !sampler::roll(rate) {
            return;
        }

        let mut state = self.state.lock();
        let mut line = String::new();
        let suffix = (rate < 1.0).then_some(rate);
        write_metric_line(
            &mut line,
            Some(state.namespace.as_str()),
            key,
            value,
            kind,
            suffix,
        );

        if let Some(buffer) = state.batch.as_mut() {
            buffer.push(line);
        } else {
            drop(state);
            self.transmit(&line);
        }
    }

    /// Hands a payload to the sink, swallowing transmission failures.
    ///
    /// Metrics are best-effort; a send error must never reach the
    /// instrumented application's control flow.
    fn transmit(&self, payload: &str) {
        if let Err(err) = self.sink.emit(payload) {
            error!("error sending metrics datagram: {err}");
        }
    }

    fn read_memory(&self) -> Option<i64> {
        let bytes = memory::current_rss_bytes();
        if bytes.is_none() {
            warn!("process memory reading unavailable, skipping memory metric");
        }
        bytes
    }
}

impl fmt::Debug for StatsdClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StatsdClient {{ namespace: {:?}, app_name: {:?}, sink: ... }}",
            self.namespace(),
            self.app_name,
        )
    }
}

/// Emits the elapsed timing on drop, so [`StatsdClient::time`] measures
/// the block whether it returns or unwinds.
struct TimeGuard<'a> {
    client: &'a StatsdClient,
    key: &'a str,
    sample_rate: f64,
    started: Instant,
}

impl Drop for TimeGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self.client.clock.now().duration_since(self.started);
        self.client
            .timing_sampled(self.key, elapsed.as_millis() as u64, self.sample_rate);
    }
}

fn formatted_namespace(namespace: &str) -> String {
    namespace.trim_end_matches('.').to_owned()
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::Arc;
    use std::time::Duration;

    use crossbeam_channel::Receiver;
    use quanta::{Clock, Mock};

    use crate::builder::StatsdBuilder;
    use crate::formatting::MetricKind;
    use crate::sinks::SpyMetricSink;

    use super::StatsdClient;

    fn spy_client(namespace: &str) -> (Receiver<String>, StatsdClient) {
        let (rx, sink) = SpyMetricSink::new();
        let client = StatsdBuilder::new()
            .with_namespace(namespace)
            .build_with_sink(sink);
        (rx, client)
    }

    fn mock_client(namespace: &str) -> (Receiver<String>, StatsdClient, Arc<Mock>) {
        let (clock, mock) = Clock::mock();
        let (rx, sink) = SpyMetricSink::new();
        let client = StatsdBuilder::new()
            .with_namespace(namespace)
            .build_with_clock(sink, clock);
        (rx, client, mock)
    }

    #[test]
    fn test_increment_encodes_single_counter_line() {
        let (rx, client) = spy_client("app");
        client.increment("logins");

        assert_eq!(rx.try_recv().unwrap(), "app.logins:1|c");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_decrement_and_count_preserve_call_order() {
        let (rx, client) = spy_client("app");
        client.decrement("logins");
        client.count("requests", 5);

        assert_eq!(rx.try_recv().unwrap(), "app.logins:-1|c");
        assert_eq!(rx.try_recv().unwrap(), "app.requests:5|c");
    }

    #[test]
    fn test_empty_namespace_uses_bare_keys() {
        let (rx, client) = spy_client("");
        client.increment("logins");

        assert_eq!(rx.try_recv().unwrap(), "logins:1|c");
    }

    #[test]
    fn test_gauge_encodes() {
        let (rx, client) = spy_client("app");
        client.gauge("load", 0.85);

        assert_eq!(rx.try_recv().unwrap(), "app.load:0.85|g");
    }

    #[test]
    fn test_set_encodes() {
        let (rx, client) = spy_client("app");
        client.set("visitors", 42);

        assert_eq!(rx.try_recv().unwrap(), "app.visitors:42|s");
    }

    #[test]
    fn test_gauge_and_set_ignore_sample_rates() {
        let (rx, client) = spy_client("app");
        // A rate this low would virtually never pass the gate; gauges
        // and sets must go out regardless and without a suffix.
        client.emit("load", 0.85, MetricKind::Gauge, 0.0001);
        client.emit("visitors", 42, MetricKind::Set, 0.0001);

        assert_eq!(rx.try_recv().unwrap(), "app.load:0.85|g");
        assert_eq!(rx.try_recv().unwrap(), "app.visitors:42|s");
    }

    #[test]
    fn test_sampled_counter_frequency_and_suffix() {
        let (rx, client) = spy_client("app");
        let trials = 10_000;
        for _ in 0..trials {
            client.increment_sampled("sampled", 0.5);
        }

        let sent: Vec<String> = rx.try_iter().collect();
        let observed = sent.len() as f64 / trials as f64;
        assert!(
            (observed - 0.5).abs() < 0.05,
            "observed fraction {observed}"
        );
        assert!(sent.iter().all(|line| line == "app.sampled:1|c|@0.5"));
    }

    #[test]
    fn test_rate_above_one_clamps_to_unsampled() {
        let (rx, client) = spy_client("app");
        client.count_sampled("requests", 2, 7.5);

        assert_eq!(rx.try_recv().unwrap(), "app.requests:2|c");
    }

    #[test]
    fn test_rate_at_or_below_zero_sends_nothing() {
        let (rx, client) = spy_client("app");
        client.count_sampled("requests", 2, 0.0);
        client.count_sampled("requests", 2, -3.0);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_start_end_timing_measures_elapsed() {
        let (rx, client, mock) = mock_client("app");
        client.start_timing("db.query");
        mock.increment(Duration::from_millis(212));

        assert_eq!(client.end_timing("db.query"), Some(212));
        assert_eq!(rx.try_recv().unwrap(), "app.db.query:212|ms");
    }

    #[test]
    fn test_end_timing_without_start_is_no_measurement() {
        let (rx, client, _mock) = mock_client("app");

        assert_eq!(client.end_timing("db.query"), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_start_timing_twice_keeps_latest_start() {
        let (rx, client, mock) = mock_client("app");
        client.start_timing("db.query");
        mock.increment(Duration::from_millis(500));
        client.start_timing("db.query");
        mock.increment(Duration::from_millis(40));

        assert_eq!(client.end_timing("db.query"), Some(40));
        assert_eq!(rx.try_recv().unwrap(), "app.db.query:40|ms");
    }

    #[test]
    fn test_timing_and_memory_profiles_do_not_collide() {
        let (_rx, client, _mock) = mock_client("app");
        client.start_timing("work");

        assert_eq!(client.end_memory_profile("work"), None);
        assert!(client.end_timing("work").is_some());
    }

    #[test]
    fn test_time_returns_block_value_and_emits_timing() {
        let (rx, client, mock) = mock_client("app");
        let value = client.time("render", || {
            mock.increment(Duration::from_millis(33));
            "page"
        });

        assert_eq!(value, "page");
        assert_eq!(rx.try_recv().unwrap(), "app.render:33|ms");
    }

    #[test]
    fn test_time_emits_before_propagating_panic() {
        let (rx, client, mock) = mock_client("app");
        let result = catch_unwind(AssertUnwindSafe(|| {
            client.time("render", || -> u32 {
                mock.increment(Duration::from_millis(7));
                panic!("render failed")
            })
        }));

        assert!(result.is_err());
        assert_eq!(rx.try_recv().unwrap(), "app.render:7|ms");
    }

    #[test]
    fn test_batch_accumulates_and_flushes_lines() {
        let (rx, client) = spy_client("app");
        client.start_batch();
        assert!(client.is_batch());

        client.increment("a");
        client.count("b", 2);
        client.timing("c", 9);
        assert!(rx.try_recv().is_err());

        client.end_batch();
        assert!(!client.is_batch());
        assert_eq!(rx.try_recv().unwrap(), "app.a:1|c\napp.b:2|c\napp.c:9|ms");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_batch_flush_respects_max_packet_size() {
        let (rx, sink) = SpyMetricSink::new();
        let client = StatsdBuilder::new()
            .with_namespace("app")
            .set_max_packet_size(20)
            .build_with_sink(sink);

        client.start_batch();
        client.increment("aaaa");
        client.increment("bbbb");
        client.increment("cccc");
        client.end_batch();

        let datagrams: Vec<String> = rx.try_iter().collect();
        assert_eq!(datagrams, ["app.aaaa:1|c", "app.bbbb:1|c", "app.cccc:1|c"]);
        assert!(datagrams.iter().all(|d| d.len() <= 20));
    }

    #[test]
    fn test_cancel_batch_sends_nothing() {
        let (rx, client) = spy_client("app");
        client.start_batch();
        client.increment("a");
        client.increment("b");
        client.cancel_batch();

        assert!(!client.is_batch());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_empty_batch_sends_nothing() {
        let (rx, client) = spy_client("app");
        client.start_batch();
        client.end_batch();

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_nested_start_batch_keeps_buffer() {
        let (rx, client) = spy_client("app");
        client.start_batch();
        client.increment("a");
        client.start_batch();
        client.increment("b");
        client.end_batch();

        assert_eq!(rx.try_recv().unwrap(), "app.a:1|c\napp.b:1|c");
    }

    #[test]
    fn test_namespace_change_keeps_buffered_prefixes() {
        let (rx, client) = spy_client("app");
        client.start_batch();
        client.increment("bar");
        client.set_namespace("foo");
        client.increment("bar");
        client.end_batch();

        assert_eq!(rx.try_recv().unwrap(), "app.bar:1|c\nfoo.bar:1|c");
    }

    #[test]
    fn test_set_namespace_applies_to_later_metrics() {
        let (rx, client) = spy_client("app");
        client.set_namespace("foo");

        assert_eq!(client.namespace(), "foo");
        client.increment("bar");
        assert_eq!(rx.try_recv().unwrap(), "foo.bar:1|c");
    }

    #[test]
    fn test_memory_with_explicit_value() {
        let (rx, client) = spy_client("app");
        client.memory("heap", Some(1024));

        assert_eq!(rx.try_recv().unwrap(), "app.heap:1024|g");
    }

    #[test]
    fn test_memory_samples_process_when_value_omitted() {
        let (rx, client) = spy_client("app");
        client.memory("rss", None);

        let line = rx.try_recv().unwrap();
        assert!(line.starts_with("app.rss:"), "unexpected line {line}");
        assert!(line.ends_with("|g"), "unexpected line {line}");
    }

    #[test]
    fn test_memory_profile_round_trip() {
        let (rx, client) = spy_client("app");
        client.start_memory_profile("work");

        assert!(client.end_memory_profile("work").is_some());
        let line = rx.try_recv().unwrap();
        assert!(line.starts_with("app.work:"), "unexpected line {line}");
        assert!(line.ends_with("|g"), "unexpected line {line}");
    }

    #[test]
    fn test_end_memory_profile_without_start() {
        let (rx, client) = spy_client("app");

        assert_eq!(client.end_memory_profile("work"), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_log_http_response_uses_app_name() {
        let (rx, sink) = SpyMetricSink::new();
        let client = StatsdBuilder::new()
            .with_namespace("app")
            .with_app_name("frontend")
            .build_with_sink(sink);

        client.log_http_response(503, None);
        client.log_http_response(200, Some("api"));

        assert_eq!(rx.try_recv().unwrap(), "app.frontend.http_response.503:1|c");
        assert_eq!(rx.try_recv().unwrap(), "app.api.http_response.200:1|c");
    }

    #[test]
    fn test_log_error_defaults_status_to_zero() {
        let (rx, sink) = SpyMetricSink::new();
        let client = StatsdBuilder::new()
            .with_namespace("app")
            .with_app_name("frontend")
            .build_with_sink(sink);

        client.log_error(88, None, None);

        assert_eq!(rx.try_recv().unwrap(), "app.frontend.http_response.0:1|c");
        assert_eq!(
            rx.try_recv().unwrap(),
            "app.frontend.response_time_ms:88|ms"
        );
    }

    #[test]
    fn test_count_reaches_udp_aggregator() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = server.local_addr().unwrap();

        let client = StatsdBuilder::new()
            .with_host("127.0.0.1")
            .with_port(addr.port())
            .with_namespace("app")
            .build()
            .unwrap();
        client.count("requests", 5);

        let mut buf = [0u8; 512];
        let (received, _) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..received], b"app.requests:5|c");
    }

    #[test]
    fn test_client_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StatsdClient>();
    }
}
