//! Metrics collection and exposition.
//!
//! # Metrics
//! - `relay_connections_active` (gauge): live WebSocket sessions
//! - `relay_registrations_total` (counter): registrations by outcome
//! - `relay_messages_routed_total` (counter): accepted `send` events
//! - `relay_messages_delivered_total` (counter): successful per-handle emits
//! - `relay_rate_limited_total` (counter): refusals by event type
//! - `relay_admission_rejected_total` (counter): refused upgrades by reason
//! - `relay_lock_contention_total` (counter): refused leases by resource kind
//! - `relay_lock_auto_released_total` (counter): leases force-freed at deadline

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn set_active_connections(count: u64) {
    metrics::gauge!("relay_connections_active").set(count as f64);
}

pub fn record_registration(outcome: &'static str) {
    metrics::counter!("relay_registrations_total", "outcome" => outcome).increment(1);
}

pub fn record_message_routed(delivered: usize) {
    metrics::counter!("relay_messages_routed_total").increment(1);
    metrics::counter!("relay_messages_delivered_total").increment(delivered as u64);
}

pub fn record_rate_limited(event: &str) {
    metrics::counter!("relay_rate_limited_total", "event" => event.to_string()).increment(1);
}

pub fn record_admission_rejected(reason: &'static str) {
    metrics::counter!("relay_admission_rejected_total", "reason" => reason).increment(1);
}

pub fn record_lock_contention(resource: &str) {
    metrics::counter!("relay_lock_contention_total", "resource" => resource.to_string()).increment(1);
}

pub fn record_lock_auto_released() {
    metrics::counter!("relay_lock_auto_released_total").increment(1);
}
