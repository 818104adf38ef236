//! A StatsD client for emitting application metrics over UDP.
//!
//! ## Basics
//!
//! `statsd-client` renders counter, timing, gauge, set, and memory-usage
//! events into the StatsD text line format and sends them as UDP
//! datagrams to an aggregator running locally or remotely.
//!
//! ## Behavior
//!
//! This client makes some explicit trade-offs to accomplish its task:
//!
//! - Delivery is fire-and-forget: transmission failures are logged and
//!   swallowed, never surfaced to the caller
//! - There is no aggregation; every observation goes out as its own line
//!   (or as part of an explicitly started batch)
//! - Sub-unity sample rates gate counters, timings, and memory samples;
//!   gauges and sets always go out at rate 1
//! - Batches are flushed as newline-joined datagrams capped at a
//!   configurable payload size, split only at line boundaries
//! - All operations run synchronously on the calling thread; there is no
//!   background task and no retry logic
//!
//! ## Usage
//!
//! ```no_run
//! use statsd_client::StatsdBuilder;
//!
//! let client = StatsdBuilder::new()
//!     .with_host("127.0.0.1")
//!     .with_port(8125)
//!     .with_namespace("app")
//!     .build()
//!     .expect("failed to build statsd client");
//!
//! // Direct sends, one datagram each.
//! client.increment("requests");
//! client.timing("db.query", 212);
//!
//! // Paired timing around a section of work.
//! client.start_timing("render");
//! // ... render ...
//! let elapsed = client.end_timing("render");
//! assert!(elapsed.is_some());
//!
//! // Batched sends, flushed as few datagrams.
//! client.start_batch();
//! client.increment("batched.a");
//! client.increment("batched.b");
//! client.end_batch();
//! ```

mod builder;
pub use self::builder::StatsdBuilder;

mod client;
pub use self::client::StatsdClient;

mod common;
pub use self::common::BuildError;

pub mod formatting;

mod memory;
mod sampler;

mod sinks;
pub use self::sinks::{MetricSink, NopMetricSink, SpyMetricSink, UdpMetricSink};

/// Default aggregator host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default StatsD port.
pub const DEFAULT_PORT: u16 = 8125;

/// Default namespace prefix and application name.
pub const DEFAULT_NAMESPACE: &str = "messagebird";

/// Default upper bound for a flushed datagram payload, the conventional
/// safe size for UDP over Ethernet.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 512;
