//! Prometheus metrics for the gateway.
//!
//! Counters are recorded through the `metrics` facade. The Prometheus
//! recorder is installed once per process and rendered by the admin server.

use anyhow::{Context as _, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;

static RECORDER: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Handle onto the installed Prometheus recorder.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global recorder, or reuse the one already installed.
    pub fn install() -> Result<Self> {
        let mut recorder = RECORDER.lock();
        if let Some(handle) = recorder.as_ref() {
            return Ok(Self { handle: handle.clone() });
        }

        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install prometheus recorder")?;
        *recorder = Some(handle.clone());
        counters::describe();

        Ok(Self { handle })
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

/// Metric recording helpers.
///
/// Call sites stay one-liners; names and labels live here.
pub mod counters {
    use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};

    use crate::hooks::HookPoint;

    // ============================================================================
    // DATAGRAM METRICS
    // ============================================================================

    pub fn datagram_sent(bytes: usize) {
        counter!("eventgate_datagram_sent_total").increment(1);
        counter!("eventgate_datagram_sent_bytes_total").increment(bytes as u64);
    }

    pub fn datagram_received(bytes: usize) {
        counter!("eventgate_datagram_received_total").increment(1);
        counter!("eventgate_datagram_received_bytes_total").increment(bytes as u64);
    }

    // ============================================================================
    // BUS METRICS
    // ============================================================================

    pub fn bus_published() {
        counter!("eventgate_bus_published_total").increment(1);
    }

    pub fn bus_sent() {
        counter!("eventgate_bus_sent_total").increment(1);
    }

    // ============================================================================
    // HOOK METRICS
    // ============================================================================

    pub fn hook_rejected(hook: HookPoint) {
        counter!("eventgate_hook_rejected_total", "hook" => hook.to_string()).increment(1);
    }

    pub fn hook_timed_out(hook: HookPoint) {
        counter!("eventgate_hook_timeout_total", "hook" => hook.to_string()).increment(1);
    }

    // ============================================================================
    // SESSION METRICS
    // ============================================================================

    pub fn session_opened(bridge: &str) {
        counter!("eventgate_sessions_opened_total", "bridge" => bridge.to_owned()).increment(1);
        gauge!("eventgate_sessions_active", "bridge" => bridge.to_owned()).increment(1.0);
    }

    pub fn session_closed(bridge: &str) {
        counter!("eventgate_sessions_closed_total", "bridge" => bridge.to_owned()).increment(1);
        gauge!("eventgate_sessions_active", "bridge" => bridge.to_owned()).decrement(1.0);
    }

    pub fn session_rejected(bridge: &str, reason: &'static str) {
        counter!("eventgate_sessions_rejected_total", "bridge" => bridge.to_owned(), "reason" => reason)
            .increment(1);
    }

    pub fn message_inbound(bridge: &str) {
        counter!("eventgate_messages_inbound_total", "bridge" => bridge.to_owned()).increment(1);
    }

    pub fn message_outbound(bridge: &str) {
        counter!("eventgate_messages_outbound_total", "bridge" => bridge.to_owned()).increment(1);
    }

    pub fn frame_dropped(bridge: &str) {
        counter!("eventgate_frames_dropped_total", "bridge" => bridge.to_owned()).increment(1);
    }

    pub fn delivery_dropped(bridge: &str, reason: &'static str) {
        counter!("eventgate_deliveries_dropped_total", "bridge" => bridge.to_owned(), "reason" => reason)
            .increment(1);
    }

    pub(super) fn describe() {
        describe_counter!("eventgate_datagram_sent_total", "Datagrams sent");
        describe_counter!("eventgate_datagram_sent_bytes_total", Unit::Bytes, "Datagram payload bytes sent");
        describe_counter!("eventgate_datagram_received_total", "Datagrams received");
        describe_counter!(
            "eventgate_datagram_received_bytes_total",
            Unit::Bytes,
            "Datagram payload bytes received"
        );
        describe_counter!("eventgate_bus_published_total", "Messages published on the bus");
        describe_counter!("eventgate_bus_sent_total", "Point-to-point bus sends");
        describe_counter!("eventgate_hook_rejected_total", "Hook vetoes by hook point");
        describe_counter!("eventgate_hook_timeout_total", "Hook handler timeouts by hook point");
        describe_counter!("eventgate_sessions_opened_total", "Bridge sessions opened");
        describe_counter!("eventgate_sessions_closed_total", "Bridge sessions closed");
        describe_counter!("eventgate_sessions_rejected_total", "Connections refused before a session existed");
        describe_gauge!("eventgate_sessions_active", "Bridge sessions currently open");
        describe_counter!("eventgate_messages_inbound_total", "Client frames forwarded to the bus");
        describe_counter!("eventgate_messages_outbound_total", "Bus messages delivered to clients");
        describe_counter!("eventgate_frames_dropped_total", "Outbound frames dropped on a full queue");
        describe_counter!(
            "eventgate_deliveries_dropped_total",
            "Bus messages withheld from a subscriber by permits, authorise or send_or_pub"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent() {
        let _first = Metrics::install().unwrap();
        let second = Metrics::install().unwrap();

        counters::bus_published();
        counters::session_opened("ws");

        let rendered = second.render();
        assert!(rendered.contains("eventgate_bus_published_total"));
        assert!(rendered.contains("eventgate_sessions_opened_total{bridge=\"ws\"}"));

        counters::delivery_dropped("ws", "vetoed");
        let rendered = second.render();
        assert!(rendered.contains("eventgate_deliveries_dropped_total{bridge=\"ws\",reason=\"vetoed\"}"));
    }
}
