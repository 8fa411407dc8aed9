use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

/// Point-in-time registry sizes, sampled when metrics are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomGauges {
    pub rooms: usize,
    pub connections: usize,
}

/// Relay counters. One instance per process, shared by `Arc`.
#[derive(Default)]
pub struct RelayMetrics {
    connections_opened_total: AtomicU64,
    handshake_rejections_total: Mutex<HashMap<String, u64>>,
    events_published_total: Mutex<HashMap<String, u64>>,
    publish_failures_total: AtomicU64,
    events_delivered_total: AtomicU64,
    events_dropped_total: AtomicU64,
    dispatch_queue_overflow_total: AtomicU64,
    bus_resubscribes_total: AtomicU64,
    decode_failures_total: Mutex<HashMap<String, u64>>,
}

impl RelayMetrics {
    pub fn record_connection_opened(&self) {
        self.connections_opened_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_rejection(&self, code: &str) {
        increment_label_counter(&self.handshake_rejections_total, code, 1);
    }

    pub fn record_published(&self, event_type: &str) {
        increment_label_counter(&self.events_published_total, event_type, 1);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, count: u64) {
        self.events_delivered_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.events_dropped_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dispatch_queue_overflow(&self) {
        self.dispatch_queue_overflow_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bus_resubscribe(&self) {
        self.bus_resubscribes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// `source` is `client` for inbound socket frames, `bus` for bus payloads.
    pub fn record_decode_failure(&self, source: &str) {
        increment_label_counter(&self.decode_failures_total, source, 1);
    }

    pub fn events_published(&self, event_type: &str) -> u64 {
        read_label_counter(&self.events_published_total, event_type)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures_total.load(Ordering::Relaxed)
    }

    pub fn dispatch_queue_overflows(&self) -> u64 {
        self.dispatch_queue_overflow_total.load(Ordering::Relaxed)
    }

    pub fn bus_resubscribes(&self) -> u64 {
        self.bus_resubscribes_total.load(Ordering::Relaxed)
    }

    pub fn events_delivered(&self) -> u64 {
        self.events_delivered_total.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped_total.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self, source: &str) -> u64 {
        read_label_counter(&self.decode_failures_total, source)
    }

    pub fn render_prometheus(&self, gauges: RoomGauges) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_active_rooms Rooms with at least one local connection.\n");
        output.push_str("# TYPE relay_active_rooms gauge\n");
        let _ = writeln!(output, "relay_active_rooms {}", gauges.rooms);

        output.push_str("# HELP relay_active_connections Registered local connections.\n");
        output.push_str("# TYPE relay_active_connections gauge\n");
        let _ = writeln!(output, "relay_active_connections {}", gauges.connections);

        output.push_str("# HELP relay_connections_opened_total Connections admitted to a room.\n");
        output.push_str("# TYPE relay_connections_opened_total counter\n");
        let _ = writeln!(
            output,
            "relay_connections_opened_total {}",
            self.connections_opened_total.load(Ordering::Relaxed)
        );

        output.push_str(
            "# HELP relay_handshake_rejections_total Connections closed at the gate by reason.\n",
        );
        output.push_str("# TYPE relay_handshake_rejections_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_handshake_rejections_total",
            "code",
            &self.handshake_rejections_total,
        );

        output.push_str("# HELP relay_events_published_total Events published to the bus by type.\n");
        output.push_str("# TYPE relay_events_published_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_events_published_total",
            "type",
            &self.events_published_total,
        );

        output.push_str("# HELP relay_publish_failures_total Events lost to bus publish errors.\n");
        output.push_str("# TYPE relay_publish_failures_total counter\n");
        let _ = writeln!(
            output,
            "relay_publish_failures_total {}",
            self.publish_failures_total.load(Ordering::Relaxed)
        );

        output.push_str("# HELP relay_events_delivered_total Events enqueued to local connections.\n");
        output.push_str("# TYPE relay_events_delivered_total counter\n");
        let _ = writeln!(output, "relay_events_delivered_total {}", self.events_delivered());

        output.push_str(
            "# HELP relay_events_dropped_total Events dropped on a full outbound queue.\n",
        );
        output.push_str("# TYPE relay_events_dropped_total counter\n");
        let _ = writeln!(output, "relay_events_dropped_total {}", self.events_dropped());

        output.push_str(
            "# HELP relay_dispatch_queue_overflow_total Bus events dropped before dispatch.\n",
        );
        output.push_str("# TYPE relay_dispatch_queue_overflow_total counter\n");
        let _ = writeln!(output, "relay_dispatch_queue_overflow_total {}", self.dispatch_queue_overflows());

        output.push_str(
            "# HELP relay_bus_resubscribes_total Bus subscriptions restored after a lost connection.\n",
        );
        output.push_str("# TYPE relay_bus_resubscribes_total counter\n");
        let _ = writeln!(output, "relay_bus_resubscribes_total {}", self.bus_resubscribes());

        output.push_str("# HELP relay_decode_failures_total Undecodable frames by source.\n");
        output.push_str("# TYPE relay_decode_failures_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_decode_failures_total",
            "source",
            &self.decode_failures_total,
        );

        output
    }
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn read_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str) -> u64 {
    let guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.get(label).copied().unwrap_or(0)
}

fn append_label_counter_lines(
    output: &mut String,
    metric: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    for (label, value) in entries {
        let _ = writeln!(output, "{metric}{{{label_name}=\"{}\"}} {value}", escape_label_value(label));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
