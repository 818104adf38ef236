use std::fmt::Display;

// <NAMESPACE>.<KEY>:<VALUE>|<TYPE>|@<SAMPLE_RATE>

/// The kind of a metric event, determining its wire type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A signed delta applied to a server-side counter.
    Counter,
    /// A duration in milliseconds.
    Timing,
    /// An absolute point-in-time value.
    Gauge,
    /// A member of a distinct-value set.
    Set,
    /// A memory sample in bytes.
    ///
    /// Rides on the gauge wire type; it is a distinct kind only so the
    /// sampling rules can treat it like counters and timings.
    MemoryUsage,
}

impl MetricKind {
    /// The StatsD type tag for this kind.
    pub fn type_tag(self) -> &'static str {
        match self {
            MetricKind::Counter => "c",
            MetricKind::Timing => "ms",
            MetricKind::Gauge => "g",
            MetricKind::Set => "s",
            MetricKind::MemoryUsage => "g",
        }
    }

    /// Whether a sub-unity sample rate applies to this kind.
    ///
    /// Gauges and sets are absolute observations: dropping a fraction of
    /// them loses data instead of traffic, so requested sample rates are
    /// ignored for both.
    pub fn sampled(self) -> bool {
        !matches!(self, MetricKind::Gauge | MetricKind::Set)
    }
}

/// Appends one encoded metric line to `buffer`, without a trailing
/// newline.
///
/// The namespace, when present and non-empty, is prepended to the key
/// with a `.` separator. A sample rate is rendered as the `|@<rate>`
/// suffix; pass `None` for unsampled metrics so rate-1 lines stay small.
pub fn write_metric_line<V>(
    buffer: &mut String,
    namespace: Option<&str>,
    key: &str,
    value: V,
    kind: MetricKind,
    sample_rate: Option<f64>,
) where
    V: Display,
{
    if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
        buffer.push_str(sanitize_metric_name(ns).as_str());
        buffer.push('.');
    }
    buffer.push_str(sanitize_metric_name(key).as_str());
    buffer.push(':');
    buffer.push_str(value.to_string().as_str());
    buffer.push('|');
    buffer.push_str(kind.type_tag());

    if let Some(rate) = sample_rate {
        buffer.push_str("|@");
        buffer.push_str(rate.to_string().as_str());
    }
}

/// Rewrites characters that would corrupt the line protocol to `_`.
///
/// StatsD names are dot-separated paths, so `.` passes through; only the
/// field separators of the wire format itself (`:`, `|`, `@`) and
/// newlines are replaced.
pub fn sanitize_metric_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if invalid_metric_character(c) {
            out.push('_');
        } else {
            out.push(c);
        }
    }
    out
}

#[inline]
fn invalid_metric_character(c: char) -> bool {
    c == ':' || c == '|' || c == '@' || c == '\n'
}

/// Packs encoded lines into newline-joined datagram payloads, each at
/// most `max_packet_size` bytes.
///
/// Lines are never split across payloads: a line that alone exceeds the
/// limit becomes its own oversized payload and is left for the network
/// layer to accept or reject.
pub fn split_into_datagrams(lines: &[String], max_packet_size: usize) -> Vec<String> {
    let mut datagrams = Vec::new();
    let mut current = String::new();

    for line in lines {
        if current.is_empty() {
            current.push_str(line);
        } else if current.len() + 1 + line.len() <= max_packet_size {
            current.push('\n');
            current.push_str(line);
        } else {
            datagrams.push(std::mem::take(&mut current));
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        datagrams.push(current);
    }

    datagrams
}
