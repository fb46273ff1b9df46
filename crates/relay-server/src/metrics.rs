//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Fails if a global recorder
/// is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Connections registered with the hub (counter).
pub const RELAY_CONNECTIONS_TOTAL: &str = "relay_connections_total";
/// Connections whose cleanup has run (counter).
pub const RELAY_DISCONNECTIONS_TOTAL: &str = "relay_disconnections_total";
/// Live set size (gauge).
pub const RELAY_CONNECTIONS_ACTIVE: &str = "relay_connections_active";
/// Broadcast requests processed by the hub (counter).
pub const RELAY_BROADCASTS_TOTAL: &str = "relay_broadcasts_total";
/// Payloads enqueued into mailboxes (counter).
pub const RELAY_DELIVERIES_TOTAL: &str = "relay_deliveries_total";
/// Members evicted for a full or closed mailbox (counter).
pub const RELAY_EVICTIONS_TOTAL: &str = "relay_evictions_total";
/// Position records applied to the world (counter).
pub const RELAY_POSITION_UPDATES_TOTAL: &str = "relay_position_updates_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        let names = [
            RELAY_CONNECTIONS_TOTAL,
            RELAY_DISCONNECTIONS_TOTAL,
            RELAY_CONNECTIONS_ACTIVE,
            RELAY_BROADCASTS_TOTAL,
            RELAY_DELIVERIES_TOTAL,
            RELAY_EVICTIONS_TOTAL,
            RELAY_POSITION_UPDATES_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("relay_"), "{name}");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
